use anyhow::Result;
use clap::{Parser, Subcommand};

mod cli;
mod config;

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Plan(args) => args.run(),
        Command::Check(args) => args.run(),
    }
}

#[derive(Parser)]
#[command(name = "cadenza", about = "Look-ahead motion planning for stepper machines")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan a job file and print the resulting stepper blocks.
    Plan(cli::plan::PlanArgs),
    /// Validate a machine configuration and print its derived rates.
    Check(cli::check::CheckArgs),
}
