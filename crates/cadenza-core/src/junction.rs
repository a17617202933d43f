//! Junction entry-speed limiting.
//!
//! Two mutually exclusive policies bound how fast the toolhead may pass
//! the corner between the previous segment and a new one:
//!
//! - **Deviation**: treat the corner as a tiny arc whose radius follows
//!   from a configured maximum deviation, and take the centripetal speed
//!   limit on that arc. Computed from the half-angle identity, without
//!   trig calls.
//! - **Classic jerk**: allow each axis an instantaneous velocity change
//!   up to its configured jerk, distinguishing coasting from reversal.
//!
//! The limiter carries the previous segment's direction and speeds; the
//! planner feeds it every admitted block in order.

use crate::settings::{E_AXIS, ExtruderLimits, JunctionPolicy, MotionLimits, NUM_AXES};

/// Dot products this close to straight-through count as colinear.
const COS_EPSILON: f64 = 0.999999;

/// Everything the limiter needs to know about the segment being admitted.
pub(crate) struct JunctionInput<'a> {
    /// Unit direction of the new segment (motor space, e included).
    pub unit_vec: [f64; NUM_AXES],
    /// Per-axis speeds at the nominal feedrate, mm/s.
    pub current_speed: [f64; NUM_AXES],
    pub nominal_speed_sqr: f64,
    /// Effective block acceleration, mm/s^2.
    pub acceleration: f64,
    pub millimeters: f64,
    /// False once the queue has drained; the machine is at rest then.
    pub queue_nonempty: bool,
    pub minimum_speed_sqr: f64,
    pub limits: &'a MotionLimits,
    pub extruder: &'a ExtruderLimits,
}

pub(crate) struct JunctionLimiter {
    policy: JunctionPolicy,
    prev_unit_vec: [f64; NUM_AXES],
    prev_speed: [f64; NUM_AXES],
    prev_nominal_speed_sqr: f64,
    prev_safe_speed: f64,
}

impl JunctionLimiter {
    pub fn new(policy: JunctionPolicy) -> Self {
        Self {
            policy,
            prev_unit_vec: [0.0; NUM_AXES],
            prev_speed: [0.0; NUM_AXES],
            prev_nominal_speed_sqr: 0.0,
            prev_safe_speed: 0.0,
        }
    }

    pub fn reset(&mut self) {
        self.prev_unit_vec = [0.0; NUM_AXES];
        self.prev_speed = [0.0; NUM_AXES];
        self.prev_nominal_speed_sqr = 0.0;
        self.prev_safe_speed = 0.0;
    }

    /// Upper bound on the squared entry speed of the new segment.
    pub fn max_entry_speed_sqr(&mut self, input: &JunctionInput<'_>) -> f64 {
        match self.policy {
            JunctionPolicy::Deviation => self.deviation(input),
            JunctionPolicy::ClassicJerk => self.classic_jerk(input),
        }
    }

    /// Commit the admitted segment as the new "previous" one.
    pub fn record(&mut self, current_speed: [f64; NUM_AXES], nominal_speed_sqr: f64) {
        self.prev_speed = current_speed;
        self.prev_nominal_speed_sqr = nominal_speed_sqr;
    }

    fn deviation(&mut self, input: &JunctionInput<'_>) -> f64 {
        let unit_vec = input.unit_vec;

        let vmax_sqr = if input.queue_nonempty && self.prev_nominal_speed_sqr > 1e-12 {
            // Angle between the reversed previous direction and the new
            // one: +1 at a full reversal, -1 when straight-through.
            let mut cos_theta = 0.0;
            for axis in 0..NUM_AXES {
                cos_theta -= self.prev_unit_vec[axis] * unit_vec[axis];
            }

            let vmax_sqr = if cos_theta > COS_EPSILON {
                // Full reversal: force the minimum junction speed.
                input.minimum_speed_sqr
            } else {
                let cos_theta = cos_theta.max(-COS_EPSILON);

                let mut junction_unit_vec = [0.0; NUM_AXES];
                for axis in 0..NUM_AXES {
                    junction_unit_vec[axis] = unit_vec[axis] - self.prev_unit_vec[axis];
                }
                normalize(&mut junction_unit_vec);

                let junction_acceleration = limit_by_axis_acceleration(
                    input.acceleration,
                    &junction_unit_vec,
                    input.limits,
                    input.extruder,
                );

                // Half-angle identity; always positive.
                let sin_theta_d2 = (0.5 * (1.0 - cos_theta)).sqrt();
                let mut vmax_sqr = (input.limits.junction_deviation_mm
                    * junction_acceleration
                    * sin_theta_d2)
                    / (1.0 - sin_theta_d2);

                // Short segments chained at shallow angles approximate an
                // arc (the octagon case); bound by its centripetal limit.
                if input.millimeters < 1.0 && cos_theta < -0.707_106_781_2 {
                    let neg = if cos_theta < 0.0 { -1.0 } else { 1.0 };
                    let t = neg * cos_theta;

                    // MinMax polynomial asin; the derived angle tops out
                    // at pi - 0.033, keeping the divisor below finite.
                    let asinx = 0.032_843_707
                        + t * (-1.451_838_349
                            + t * (29.661_539_56
                                + t * (-131.112_347_7
                                    + t * (262.813_056_2
                                        + t * (-242.719_962_7 + t * 84.314_662_02)))));
                    let junction_theta = std::f64::consts::FRAC_PI_2 + neg * asinx;

                    let limit_sqr = input.millimeters
                        / (std::f64::consts::PI - junction_theta)
                        * junction_acceleration;
                    vmax_sqr = vmax_sqr.min(limit_sqr);
                }

                vmax_sqr
            };

            vmax_sqr
                .min(input.nominal_speed_sqr)
                .min(self.prev_nominal_speed_sqr)
        } else {
            // First move after a reset or a drained queue: plan from rest.
            input.minimum_speed_sqr
        };

        self.prev_unit_vec = unit_vec;
        vmax_sqr
    }

    fn classic_jerk(&mut self, input: &JunctionInput<'_>) -> f64 {
        let nominal_speed = input.nominal_speed_sqr.sqrt();

        // The speed from which every axis can halt within its own jerk.
        let mut safe_speed = nominal_speed;
        let mut limited = false;
        for axis in 0..NUM_AXES {
            let jerk = input.current_speed[axis].abs();
            let max_jerk = axis_max_jerk(axis, input.limits, input.extruder);
            if jerk > max_jerk {
                if limited {
                    let mjerk = max_jerk * nominal_speed;
                    if jerk * safe_speed > mjerk {
                        safe_speed = mjerk / jerk;
                    }
                } else {
                    safe_speed *= max_jerk / jerk;
                    limited = true;
                }
            }
        }

        let vmax_junction = if input.queue_nonempty && self.prev_nominal_speed_sqr > 1e-12 {
            // The junction speed is shared by both segments, so it can
            // never exceed the smaller nominal speed.
            let previous_nominal_speed = self.prev_nominal_speed_sqr.sqrt();
            let mut vmax_junction = nominal_speed.min(previous_nominal_speed);
            let smaller_speed_factor = vmax_junction / previous_nominal_speed;

            let mut v_factor = 1.0;
            let mut limited = false;
            for axis in 0..NUM_AXES {
                let mut v_exit = self.prev_speed[axis] * smaller_speed_factor;
                let mut v_entry = input.current_speed[axis];
                if limited {
                    v_exit *= v_factor;
                    v_entry *= v_factor;
                }

                // Coasting keeps the sign; a reversal crosses zero and
                // the whole swing counts against the jerk budget.
                let jerk = if v_exit > v_entry {
                    if v_entry > 0.0 || v_exit < 0.0 {
                        v_exit - v_entry
                    } else {
                        v_exit.max(-v_entry)
                    }
                } else if v_entry < 0.0 || v_exit > 0.0 {
                    v_entry - v_exit
                } else {
                    (-v_exit).max(v_entry)
                };

                let max_jerk = axis_max_jerk(axis, input.limits, input.extruder);
                if jerk > max_jerk {
                    v_factor *= max_jerk / jerk;
                    limited = true;
                }
            }
            if limited {
                vmax_junction *= v_factor;
            }

            // If both segments could already halt safely, separate
            // entry/exit speeds beat a throttled shared junction.
            let threshold = vmax_junction * 0.99;
            if self.prev_safe_speed > threshold && safe_speed > threshold {
                vmax_junction = safe_speed;
            }
            vmax_junction
        } else {
            safe_speed
        };

        self.prev_safe_speed = safe_speed;
        vmax_junction * vmax_junction
    }
}

/// Scale `v` to unit length. Zero vectors are left alone.
pub(crate) fn normalize(v: &mut [f64; NUM_AXES]) {
    let magnitude_sqr: f64 = v.iter().map(|c| c * c).sum();
    if magnitude_sqr > 0.0 {
        let inverse = 1.0 / magnitude_sqr.sqrt();
        for component in v.iter_mut() {
            *component *= inverse;
        }
    }
}

/// Largest acceleration along `unit_vec` that keeps every axis within
/// its configured maximum.
pub(crate) fn limit_by_axis_acceleration(
    max_value: f64,
    unit_vec: &[f64; NUM_AXES],
    limits: &MotionLimits,
    extruder: &ExtruderLimits,
) -> f64 {
    let mut limit = max_value;
    for axis in 0..NUM_AXES {
        let component = unit_vec[axis].abs();
        if component > 0.0 {
            let max_accel = if axis == E_AXIS {
                extruder.max_acceleration_mm_per_s2
            } else {
                limits.max_acceleration_mm_per_s2[axis]
            };
            if limit * component > max_accel {
                limit = max_accel / component;
            }
        }
    }
    limit
}

fn axis_max_jerk(axis: usize, limits: &MotionLimits, extruder: &ExtruderLimits) -> f64 {
    if axis == E_AXIS {
        extruder.max_jerk_mm_s
    } else {
        limits.max_jerk_mm_s[axis]
    }
}
