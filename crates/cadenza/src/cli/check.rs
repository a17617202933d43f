use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use crate::config::MachineConfig;

#[derive(Args)]
pub struct CheckArgs {
    /// Machine configuration files to validate.
    #[arg(required = true)]
    pub configs: Vec<PathBuf>,
}

impl CheckArgs {
    pub fn run(&self) -> Result<()> {
        let mut failed = 0usize;
        for path in &self.configs {
            let loaded = MachineConfig::from_file(path).and_then(|config| {
                config.validate()?;
                Ok(config)
            });
            match loaded {
                Ok(config) => {
                    println!("OK {}", path.display());
                    print_rates(&config);
                }
                Err(err) => {
                    println!("ERR {}: {err:#}", path.display());
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            std::process::exit(1);
        }
        Ok(())
    }
}

fn print_rates(config: &MachineConfig) {
    for (axis, name) in ["x", "y", "z"].iter().enumerate() {
        let steps_per_mm = config.settings.limits.axis_steps_per_mm[axis];
        println!(
            "  {name}: {:.6} mm/step, {:.0} steps/s^2 max",
            1.0 / steps_per_mm,
            config.settings.limits.max_acceleration_mm_per_s2[axis] * steps_per_mm,
        );
    }
    for (index, extruder) in config.settings.extruders.iter().enumerate() {
        println!(
            "  e{index}: {:.6} mm/step, {:.0} steps/s^2 max",
            1.0 / extruder.axis_steps_per_mm,
            extruder.max_acceleration_mm_per_s2 * extruder.axis_steps_per_mm,
        );
    }
}
