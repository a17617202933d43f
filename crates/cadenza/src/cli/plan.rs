use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result, anyhow, bail};
use cadenza_core::{Block, Coord, Planner, StepperEvent};
use clap::Args;

use crate::config::MachineConfig;

#[derive(Args)]
pub struct PlanArgs {
    /// Path to the machine configuration (TOML or JSON).
    pub config: PathBuf,
    /// Job file: one `x y z e feedrate` record per line; `#` comments.
    pub job: PathBuf,
    /// Print the executed blocks as JSON.
    #[arg(long)]
    pub json: bool,
}

struct JobMove {
    target: Coord,
    feedrate: f64,
}

impl PlanArgs {
    pub fn run(&self) -> Result<()> {
        tracing_subscriber::fmt::init();

        let config = MachineConfig::from_file(&self.config)?;
        config.validate()?;

        let content = fs::read_to_string(&self.job)
            .with_context(|| format!("failed to read job file {}", self.job.display()))?;
        let moves = parse_job(&content)?;
        if moves.is_empty() {
            bail!("job file {} contains no moves", self.job.display());
        }

        tracing::info!("planning {} moves from {}", moves.len(), self.job.display());

        let (mut planner, link) = Planner::new(config.settings, config.kinematics)?;

        // A stand-in step generator on its own thread: it drains the
        // ring exactly the way a stepper interrupt would, so the blocks
        // it collects carry the final look-ahead plan.
        let done = Arc::new(AtomicBool::new(false));
        let consumer_done = done.clone();
        let consumer = thread::spawn(move || {
            let mut link = link;
            let mut blocks = Vec::new();
            loop {
                match link.poll() {
                    StepperEvent::Move(block) => {
                        blocks.push(block);
                        link.complete();
                    }
                    StepperEvent::Holding => thread::yield_now(),
                    StepperEvent::Idle => {
                        if consumer_done.load(Ordering::Acquire) {
                            break;
                        }
                        thread::yield_now();
                    }
                }
            }
            (blocks, link.position())
        });

        for job_move in &moves {
            planner.buffer_line(job_move.target, job_move.feedrate, 0, None);
        }
        planner.synchronize();
        done.store(true, Ordering::Release);

        let (blocks, position) = consumer
            .join()
            .map_err(|_| anyhow!("step generator thread panicked"))?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&blocks)?);
        } else {
            print_blocks(&blocks);
            let total_mm: f64 = blocks.iter().map(|block| block.millimeters).sum();
            let total_s: f64 = blocks.iter().map(Block::duration_s).sum();
            println!();
            println!(
                "{} blocks, {total_mm:.2} mm of travel, estimated {total_s:.2} s",
                blocks.len()
            );
            println!(
                "final stepper position: [{}, {}, {}, {}] steps",
                position[0], position[1], position[2], position[3]
            );
        }
        Ok(())
    }
}

fn parse_job(content: &str) -> Result<Vec<JobMove>> {
    let mut moves = Vec::new();
    for (index, raw_line) in content.lines().enumerate() {
        let line_number = index + 1;
        let line = raw_line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let fields = line
            .split_whitespace()
            .map(|field| {
                field
                    .parse::<f64>()
                    .with_context(|| format!("line {line_number}: bad number {field:?}"))
            })
            .collect::<Result<Vec<f64>>>()?;
        if fields.len() != 5 {
            bail!(
                "line {line_number}: expected `x y z e feedrate`, got {} fields",
                fields.len()
            );
        }
        if fields[4] <= 0.0 {
            bail!("line {line_number}: feedrate must be positive");
        }

        moves.push(JobMove {
            target: Coord::new(fields[0], fields[1], fields[2], fields[3]),
            feedrate: fields[4],
        });
    }
    Ok(moves)
}

fn print_blocks(blocks: &[Block]) {
    println!(
        "{:>4} {:>8} {:>8} {:>8} {:>8} {:>9} {:>8} {:>8} {:>8} {:>8} {:>8}",
        "#", "a", "b", "c", "e", "mm", "entry", "cruise", "exit", "accel@", "decel@"
    );
    for (index, block) in blocks.iter().enumerate() {
        let cruise = block.nominal_speed_sqr.sqrt();
        let entry = block.entry_speed_sqr.sqrt();
        let exit = if block.nominal_rate > 0 {
            block.final_rate as f64 / block.nominal_rate as f64 * cruise
        } else {
            0.0
        };
        let steps = block.signed_steps();
        println!(
            "{index:>4} {:>8} {:>8} {:>8} {:>8} {:>9.3} {entry:>8.2} {cruise:>8.2} {exit:>8.2} {:>8} {:>8}",
            steps[0],
            steps[1],
            steps[2],
            steps[3],
            block.millimeters,
            block.accelerate_until,
            block.decelerate_after,
        );
    }
}
