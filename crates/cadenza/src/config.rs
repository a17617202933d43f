use anyhow::{Context, Result};
use cadenza_core::{ExtruderLimits, Kinematics, MachineSettings};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// A machine file: the planner settings plus the geometry selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    #[serde(flatten)]
    pub settings: MachineSettings,

    /// Machine geometry; cartesian when omitted.
    pub kinematics: Kinematics,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            settings: MachineSettings::single_extruder(),
            kinematics: Kinematics::Cartesian,
        }
    }
}

impl MachineConfig {
    /// Load a machine file, auto-detecting TOML or JSON format.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read machine file {}", path.display()))?;

        let extension = path.extension().and_then(|s| s.to_str());
        match extension {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            _ => {
                // Try TOML first (preferred), fall back to JSON.
                Self::from_toml(&content).or_else(|_| Self::from_json(&content))
            }
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("failed to parse machine file as TOML")?;
        Ok(config.normalized())
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(content).context("failed to parse machine file as JSON")?;
        Ok(config.normalized())
    }

    /// A file without an `[[extruders]]` table gets one default extruder.
    fn normalized(mut self) -> Self {
        if self.settings.extruders.is_empty() {
            self.settings.extruders.push(ExtruderLimits::default());
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.settings
            .validate()
            .context("invalid machine configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_core::JunctionPolicy;

    #[test]
    fn parses_a_toml_machine_file() {
        let toml = r#"
[planner]
queue_size = 32
junction_policy = "classic_jerk"

[limits]
axis_steps_per_mm = [100.0, 100.0, 400.0]
max_feedrate_mm_s = [500.0, 500.0, 10.0]

[[extruders]]
axis_steps_per_mm = 409.0

[kinematics]
type = "core"
pair = "xy"
"#;

        let config = MachineConfig::from_toml(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.settings.planner.queue_size, 32);
        assert_eq!(
            config.settings.planner.junction_policy,
            JunctionPolicy::ClassicJerk
        );
        assert_eq!(config.settings.limits.axis_steps_per_mm[0], 100.0);
        assert_eq!(config.settings.extruders[0].axis_steps_per_mm, 409.0);
        assert!(matches!(config.kinematics, Kinematics::Core(_)));
    }

    #[test]
    fn parses_a_json_machine_file() {
        let json = r#"{
            "planner": { "queue_size": 16 },
            "limits": { "junction_deviation_mm": 0.05 },
            "extruders": [ { "axis_steps_per_mm": 93.0 } ],
            "kinematics": { "type": "delta", "diagonal_rod": 270.0, "radius": 130.0 }
        }"#;

        let config = MachineConfig::from_json(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.settings.limits.junction_deviation_mm, 0.05);
        assert!(matches!(config.kinematics, Kinematics::Delta(_)));
    }

    #[test]
    fn empty_file_defaults_to_a_cartesian_single_extruder() {
        let config = MachineConfig::from_toml("").unwrap();
        config.validate().unwrap();
        assert!(matches!(config.kinematics, Kinematics::Cartesian));
        assert_eq!(config.settings.extruders.len(), 1);
        assert_eq!(config.settings.planner.queue_size, 16);
    }

    #[test]
    fn invalid_queue_size_fails_validation() {
        let config = MachineConfig::from_toml("[planner]\nqueue_size = 13\n").unwrap();
        assert!(config.validate().is_err());
    }
}
