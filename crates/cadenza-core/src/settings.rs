//! Configuration surface of the planner.
//!
//! Everything here is plain serde-able data so a host can load it from a
//! machine file and hand it to [`Planner::new`](crate::planner::Planner::new)
//! unchanged. Derived quantities (steps-to-mm inverses, per-axis step
//! acceleration rates) are not stored here; the planner recomputes them
//! whenever the settings change.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of logical axes the planner schedules (a, b, c, e).
pub const NUM_AXES: usize = 4;

/// Indices into per-axis arrays.
pub const A_AXIS: usize = 0;
pub const B_AXIS: usize = 1;
pub const C_AXIS: usize = 2;
pub const E_AXIS: usize = 3;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("queue size {0} must be a power of two in 4..=256")]
    QueueSize(usize),

    #[error("axis {axis} steps-per-mm must be positive, got {value}")]
    StepsPerMm { axis: usize, value: f64 },

    #[error("axis {axis} max acceleration must be positive, got {value}")]
    MaxAcceleration { axis: usize, value: f64 },

    #[error("extruder {extruder} steps-per-mm must be positive, got {value}")]
    ExtruderStepsPerMm { extruder: usize, value: f64 },

    #[error("at least one extruder must be configured")]
    NoExtruders,

    #[error("minimum planner speed must be positive, got {0}")]
    MinimumPlannerSpeed(f64),

    #[error("junction deviation must be positive, got {0}")]
    JunctionDeviation(f64),
}

/// How the maximum junction entry speed between two segments is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JunctionPolicy {
    /// Centripetal bound from a configured maximum corner deviation.
    #[default]
    Deviation,
    /// Per-axis instantaneous velocity-change ("jerk") limits.
    ClassicJerk,
}

/// Kinematic limits of the geometric axes, in x/y/z order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionLimits {
    pub axis_steps_per_mm: [f64; 3],
    /// mm/s
    pub max_feedrate_mm_s: [f64; 3],
    /// mm/s^2
    pub max_acceleration_mm_per_s2: [f64; 3],
    /// Classic-jerk policy: largest instantaneous per-axis speed change, mm/s.
    pub max_jerk_mm_s: [f64; 3],
    /// Acceleration for moves that extrude, mm/s^2.
    pub print_acceleration: f64,
    /// Acceleration for travel-only moves, mm/s^2.
    pub travel_acceleration: f64,
    pub min_feedrate_mm_s: f64,
    pub min_travel_feedrate_mm_s: f64,
    /// Segments shorter than this are stretched when the queue drains.
    pub min_segment_time_us: u32,
    /// Deviation policy: allowed departure from the ideal corner, mm.
    pub junction_deviation_mm: f64,
}

impl Default for MotionLimits {
    fn default() -> Self {
        Self {
            axis_steps_per_mm: [80.0, 80.0, 400.0],
            max_feedrate_mm_s: [300.0, 300.0, 5.0],
            max_acceleration_mm_per_s2: [3000.0, 3000.0, 100.0],
            max_jerk_mm_s: [10.0, 10.0, 0.4],
            print_acceleration: 3000.0,
            travel_acceleration: 3000.0,
            min_feedrate_mm_s: 0.0,
            min_travel_feedrate_mm_s: 0.0,
            min_segment_time_us: 20_000,
            junction_deviation_mm: 0.02,
        }
    }
}

/// Per-extruder limits. The extruder axis carries material, not geometry,
/// so it has its own steps-per-mm and caps independent of the machine's.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtruderLimits {
    pub axis_steps_per_mm: f64,
    pub max_feedrate_mm_s: f64,
    pub max_acceleration_mm_per_s2: f64,
    pub max_jerk_mm_s: f64,
    /// Acceleration for extruder-only (retract/recover) moves, mm/s^2.
    pub retract_acceleration: f64,
    /// Unit-conversion scalar for multi-extruder compensation.
    pub e_factor: f64,
    /// A single move extruding more filament than this is absorbed.
    pub max_extrude_length_mm: f64,
}

impl Default for ExtruderLimits {
    fn default() -> Self {
        Self {
            axis_steps_per_mm: 93.0,
            max_feedrate_mm_s: 50.0,
            max_acceleration_mm_per_s2: 10_000.0,
            max_jerk_mm_s: 5.0,
            retract_acceleration: 3000.0,
            e_factor: 1.0,
            max_extrude_length_mm: 400.0,
        }
    }
}

/// Planner tuning knobs that are independent of any particular machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerSettings {
    /// Ring buffer capacity. Must be a power of two.
    pub queue_size: usize,
    /// Floor for every planned junction and segment-end speed, mm/s.
    pub minimum_planner_speed: f64,
    /// Moves whose largest axis delta is below this are dropped.
    pub min_steps_per_segment: u32,
    /// Hold the first block back this long so look-ahead can chain, ms.
    pub first_block_delay_ms: u64,
    /// Refuse new moves this long after a quick stop, ms.
    pub clean_buffer_hold_ms: u64,
    pub junction_policy: JunctionPolicy,
    /// Stretch short segments while the queue is draining.
    pub slowdown: bool,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            queue_size: 16,
            minimum_planner_speed: 0.05,
            min_steps_per_segment: 6,
            first_block_delay_ms: 100,
            clean_buffer_hold_ms: 1000,
            junction_policy: JunctionPolicy::Deviation,
            slowdown: true,
        }
    }
}

/// The full configuration a planner is built from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineSettings {
    pub planner: PlannerSettings,
    pub limits: MotionLimits,
    pub extruders: Vec<ExtruderLimits>,
}

impl MachineSettings {
    /// A single-extruder machine with default limits.
    pub fn single_extruder() -> Self {
        Self {
            extruders: vec![ExtruderLimits::default()],
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let n = self.planner.queue_size;
        if !(4..=256).contains(&n) || !n.is_power_of_two() {
            return Err(SettingsError::QueueSize(n));
        }
        if self.planner.minimum_planner_speed <= 0.0 {
            return Err(SettingsError::MinimumPlannerSpeed(
                self.planner.minimum_planner_speed,
            ));
        }
        for axis in 0..3 {
            let steps = self.limits.axis_steps_per_mm[axis];
            if steps <= 0.0 {
                return Err(SettingsError::StepsPerMm { axis, value: steps });
            }
            let accel = self.limits.max_acceleration_mm_per_s2[axis];
            if accel <= 0.0 {
                return Err(SettingsError::MaxAcceleration { axis, value: accel });
            }
        }
        if self.extruders.is_empty() {
            return Err(SettingsError::NoExtruders);
        }
        for (extruder, e) in self.extruders.iter().enumerate() {
            if e.axis_steps_per_mm <= 0.0 {
                return Err(SettingsError::ExtruderStepsPerMm {
                    extruder,
                    value: e.axis_steps_per_mm,
                });
            }
        }
        if self.planner.junction_policy == JunctionPolicy::Deviation
            && self.limits.junction_deviation_mm <= 0.0
        {
            return Err(SettingsError::JunctionDeviation(
                self.limits.junction_deviation_mm,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_single_extruder_validates() {
        MachineSettings::single_extruder().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_queue() {
        let mut settings = MachineSettings::single_extruder();
        settings.planner.queue_size = 24;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::QueueSize(24))
        ));
    }

    #[test]
    fn rejects_zero_steps_per_mm() {
        let mut settings = MachineSettings::single_extruder();
        settings.limits.axis_steps_per_mm[B_AXIS] = 0.0;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::StepsPerMm { axis: B_AXIS, .. })
        ));
    }

    #[test]
    fn rejects_missing_extruders() {
        let settings = MachineSettings::default();
        assert!(matches!(settings.validate(), Err(SettingsError::NoExtruders)));
    }

    #[test]
    fn classic_jerk_does_not_require_junction_deviation() {
        let mut settings = MachineSettings::single_extruder();
        settings.planner.junction_policy = JunctionPolicy::ClassicJerk;
        settings.limits.junction_deviation_mm = 0.0;
        settings.validate().unwrap();
    }
}
