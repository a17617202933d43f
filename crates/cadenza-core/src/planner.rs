//! The look-ahead planner: move admission, junction optimization and the
//! control surface the host drives.
//!
//! Admission turns a cartesian target into integer motor steps, applies
//! the kinematic caps, and stages a block in the ring buffer. Every
//! accepted block triggers a recalculation sweep: a reverse pass that
//! maximizes junction speeds under the braking constraint, a forward
//! pass that dials them back to what acceleration can actually reach,
//! and a trapezoid refit for every block whose speeds moved. The sweeps
//! never touch blocks the step generator has latched.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::block::{Block, BlockFlags, DirectionBits};
use crate::junction::{self, JunctionInput, JunctionLimiter};
use crate::kinematics::{AxisPos, Coord, Kinematics};
use crate::profile;
use crate::queue::{BlockQueue, StepperLink};
use crate::settings::{A_AXIS, B_AXIS, C_AXIS, E_AXIS, MachineSettings, NUM_AXES, SettingsError};

/// Position adjustments applied to every cartesian target ahead of
/// kinematics: bed-levelling warp, firmware retract offsets, and the
/// like. `unapply` must invert `apply`.
pub trait PositionModifier: Send {
    fn apply(&self, pos: &mut Coord);
    fn unapply(&self, pos: &mut Coord);
}

/// Rates derived from the settings; recomputed by [`Planner::refresh`].
struct DerivedRates {
    steps_to_mm: [f64; 3],
    e_steps_to_mm: Vec<f64>,
    max_acceleration_steps_per_s2: [f64; 3],
    e_max_acceleration_steps_per_s2: Vec<f64>,
}

impl DerivedRates {
    fn from_settings(settings: &MachineSettings) -> Self {
        let limits = &settings.limits;
        let mut steps_to_mm = [0.0; 3];
        let mut max_acceleration_steps_per_s2 = [0.0; 3];
        for axis in 0..3 {
            steps_to_mm[axis] = 1.0 / limits.axis_steps_per_mm[axis];
            max_acceleration_steps_per_s2[axis] =
                limits.max_acceleration_mm_per_s2[axis] * limits.axis_steps_per_mm[axis];
        }
        Self {
            steps_to_mm,
            e_steps_to_mm: settings
                .extruders
                .iter()
                .map(|e| 1.0 / e.axis_steps_per_mm)
                .collect(),
            max_acceleration_steps_per_s2,
            e_max_acceleration_steps_per_s2: settings
                .extruders
                .iter()
                .map(|e| e.max_acceleration_mm_per_s2 * e.axis_steps_per_mm)
                .collect(),
        }
    }
}

fn position_to_steps(mm: f64, steps_per_mm: f64) -> i32 {
    (mm * steps_per_mm + 0.5).floor() as i32
}

pub struct Planner {
    settings: MachineSettings,
    kinematics: Kinematics,
    queue: Arc<BlockQueue>,
    rates: DerivedRates,
    /// Canonical position: the running sum of every published block's
    /// step deltas, i.e. the generator's target at queue drain.
    position_steps: [i32; NUM_AXES],
    /// Float shadow of `position_steps`, kept to regenerate direction
    /// vectors without accumulating rounding drift.
    position_mm: AxisPos,
    /// Cartesian shadow, used by segmented (delta/SCARA) kinematics.
    position_cart: Coord,
    junction: JunctionLimiter,
    modifiers: Vec<Box<dyn PositionModifier>>,
    cold_extruders: Vec<bool>,
    active_extruder: usize,
    idle: Box<dyn FnMut() + Send>,
}

impl Planner {
    /// Build a planner and the consumer handle for its step generator.
    pub fn new(
        settings: MachineSettings,
        kinematics: Kinematics,
    ) -> Result<(Self, StepperLink), SettingsError> {
        settings.validate()?;
        let queue = BlockQueue::new(settings.planner.queue_size);
        let link = StepperLink::new(queue.clone());
        let rates = DerivedRates::from_settings(&settings);
        let cold_extruders = vec![false; settings.extruders.len()];
        let junction = JunctionLimiter::new(settings.planner.junction_policy);
        let planner = Self {
            settings,
            kinematics,
            queue,
            rates,
            position_steps: [0; NUM_AXES],
            position_mm: AxisPos::default(),
            position_cart: Coord::default(),
            junction,
            modifiers: Vec::new(),
            cold_extruders,
            active_extruder: 0,
            idle: Box::new(std::thread::yield_now),
        };
        Ok((planner, link))
    }

    /// Called while waiting for queue room or during `synchronize`.
    pub fn set_idle_hook(&mut self, idle: impl FnMut() + Send + 'static) {
        self.idle = Box::new(idle);
    }

    pub fn add_modifier(&mut self, modifier: Box<dyn PositionModifier>) {
        self.modifiers.push(modifier);
    }

    /// Gate extrusion for an extruder that is below temperature.
    pub fn set_extruder_cold(&mut self, extruder: usize, cold: bool) {
        if let Some(flag) = self.cold_extruders.get_mut(extruder) {
            *flag = cold;
        }
    }

    pub fn settings(&self) -> &MachineSettings {
        &self.settings
    }

    /// Mutate the settings, then recompute the derived rates. The queue
    /// capacity is fixed at construction and ignores later changes.
    pub fn update_settings(&mut self, update: impl FnOnce(&mut MachineSettings)) {
        update(&mut self.settings);
        self.refresh();
    }

    /// Recompute steps-to-mm inverses and step acceleration caps.
    pub fn refresh(&mut self) {
        self.rates = DerivedRates::from_settings(&self.settings);
        self.cold_extruders.resize(self.settings.extruders.len(), false);
    }

    pub fn kinematics(&self) -> &Kinematics {
        &self.kinematics
    }

    pub fn has_moves_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn position_steps(&self) -> [i32; NUM_AXES] {
        self.position_steps
    }

    pub fn machine_position_mm(&self) -> AxisPos {
        self.position_mm
    }

    /// The planner's logical cartesian position: kinematics undone and
    /// the position modifiers unapplied in reverse order.
    pub fn cartesian_position_mm(&self) -> Coord {
        if self.kinematics.is_segmented() {
            return self.position_cart;
        }
        let mut position = self.kinematics.to_cartesian(self.position_mm);
        for modifier in self.modifiers.iter().rev() {
            modifier.unapply(&mut position);
        }
        position
    }

    /// Diagnostic snapshot of the queued blocks, oldest first.
    pub fn queued_blocks(&self) -> Vec<Block> {
        let mut blocks = Vec::new();
        let head = self.queue.head_index();
        let mut index = self.queue.tail_index();
        while index != head {
            // SAFETY: single-producer context; field reads of published
            // blocks race at worst with a consumer latch, which never
            // writes them.
            blocks.push(unsafe { self.queue.with_block(index, |block| *block) });
            index = self.queue.next_index(index);
        }
        blocks
    }

    /// Queue a move to a cartesian target. Returns `false` only while
    /// the clean-buffer window after a quick stop is active; dropped
    /// too-short moves still count as queued.
    pub fn buffer_line(
        &mut self,
        target: Coord,
        fr_mm_s: f64,
        extruder: usize,
        millimeters: Option<f64>,
    ) -> bool {
        let mut raw = target;
        for modifier in &self.modifiers {
            modifier.apply(&mut raw);
        }

        if self.kinematics.is_segmented() {
            let dx = target.x - self.position_cart.x;
            let dy = target.y - self.position_cart.y;
            let dz = target.z - self.position_cart.z;
            let de = target.e - self.position_cart.e;
            let millimeters = millimeters.unwrap_or_else(|| {
                if dx != 0.0 || dy != 0.0 {
                    (dx * dx + dy * dy + dz * dz).sqrt()
                } else {
                    dz.abs()
                }
            });
            let axes = self.kinematics.to_axes(raw);
            let queued = self.buffer_segment(
                AxisPos::new(axes.a, axes.b, axes.c, raw.e),
                Some([dx, dy, dz, de]),
                fr_mm_s,
                extruder,
                Some(millimeters),
            );
            if queued {
                self.position_cart = target;
            }
            queued
        } else {
            self.buffer_segment(
                AxisPos::new(raw.x, raw.y, raw.z, raw.e),
                None,
                fr_mm_s,
                extruder,
                millimeters,
            )
        }
    }

    /// Queue a move given machine-axis targets in mm (or degrees).
    /// Leveling and kinematics must already be applied.
    pub fn buffer_segment(
        &mut self,
        target: AxisPos,
        cart_dist_mm: Option<[f64; NUM_AXES]>,
        fr_mm_s: f64,
        extruder: usize,
        millimeters: Option<f64>,
    ) -> bool {
        if self.queue.clean_active() {
            return false;
        }

        let extruder = self.clamp_extruder(extruder);
        let target_steps = [
            position_to_steps(target.a, self.settings.limits.axis_steps_per_mm[A_AXIS]),
            position_to_steps(target.b, self.settings.limits.axis_steps_per_mm[B_AXIS]),
            position_to_steps(target.c, self.settings.limits.axis_steps_per_mm[C_AXIS]),
            position_to_steps(target.e, self.settings.extruders[extruder].axis_steps_per_mm),
        ];
        self.buffer_steps(target_steps, target, cart_dist_mm, fr_mm_s, extruder, millimeters)
    }

    /// Queue a move given absolute machine-axis step targets.
    pub fn buffer_steps(
        &mut self,
        target: [i32; NUM_AXES],
        target_mm: AxisPos,
        cart_dist_mm: Option<[f64; NUM_AXES]>,
        fr_mm_s: f64,
        extruder: usize,
        millimeters: Option<f64>,
    ) -> bool {
        if self.queue.clean_active() {
            return false;
        }
        let extruder = self.clamp_extruder(extruder);

        // Back-pressure: wait for a free slot rather than failing.
        while self.queue.is_full() {
            (self.idle)();
        }
        if self.queue.clean_active() {
            // A quick stop emptied the queue while we waited.
            return false;
        }

        let head = self.queue.head_index();
        let was_empty = self.queue.is_empty();
        let Some(flags) = self.fill_block(
            head,
            false,
            target,
            target_mm,
            cart_dist_mm,
            fr_mm_s,
            extruder,
            millimeters,
        ) else {
            // Too short to schedule; accept it as already done.
            return true;
        };

        if was_empty {
            // Give look-ahead a chance to chain before delivery starts.
            self.queue
                .arm_first_block_hold(self.settings.planner.first_block_delay_ms * 1000);
        }
        self.queue.publish(flags);
        self.recalculate();
        true
    }

    /// Insert a pseudo-block that updates the step generator's position
    /// registers without motion.
    pub fn buffer_sync_block(&mut self) {
        while self.queue.is_full() {
            (self.idle)();
        }
        let head = self.queue.head_index();
        // The generator's registers count motor steps.
        let position = self.to_motor_steps(self.position_steps);
        // SAFETY: the staging slot at head belongs to the producer.
        unsafe {
            self.queue.with_block_mut(head, |block| {
                *block = Block::default();
                block.position = position;
            });
        }
        if self.queue.is_empty() {
            self.queue
                .arm_first_block_hold(self.settings.planner.first_block_delay_ms * 1000);
        }
        self.queue
            .publish(BlockFlags::new().with(BlockFlags::SYNC_POSITION));
    }

    /// Wait until every queued block has been consumed and the
    /// clean-buffer window has lapsed, yielding to the idle hook.
    pub fn synchronize(&mut self) {
        while !self.queue.is_empty() || self.queue.clean_active() {
            (self.idle)();
        }
    }

    /// Discard the whole queue and refuse admission for the configured
    /// hold window. The step generator drops any latched block.
    pub fn quick_stop(&mut self) {
        self.queue
            .quick_stop(self.settings.planner.clean_buffer_hold_ms * 1000);
    }

    /// Record an endstop hit: capture the trigger position and have the
    /// generator discard its current block.
    pub fn endstop_triggered(&mut self, axis: usize) {
        self.queue.endstop_triggered(axis);
    }

    /// Machine position captured when `axis` last triggered, mm.
    pub fn triggered_position_mm(&self, axis: usize) -> f64 {
        let steps = self.queue.triggered_position(axis);
        steps as f64 * self.axis_steps_to_mm(axis)
    }

    /// Current step-generator position of a head axis, mm. Core pairs
    /// are translated from motor space.
    pub fn axis_position_mm(&self, axis: usize) -> f64 {
        let stepper = self.queue.stepper_position();
        if axis == E_AXIS {
            return stepper[E_AXIS] as f64 * self.rates.e_steps_to_mm[self.active_extruder];
        }
        let motors = [stepper[0] as f64, stepper[1] as f64, stepper[2] as f64];
        let head = match self.kinematics.core() {
            Some(core) => core.head_positions(motors),
            None => motors,
        };
        head[axis] * self.rates.steps_to_mm[axis]
    }

    /// Set the planner position from a cartesian target, applying the
    /// position modifiers and kinematics like a move would.
    pub fn set_position_mm(&mut self, target: Coord) {
        let mut raw = target;
        for modifier in &self.modifiers {
            modifier.apply(&mut raw);
        }
        if self.kinematics.is_segmented() {
            self.position_cart = target;
            let axes = self.kinematics.to_axes(raw);
            self.set_machine_position_mm(AxisPos::new(axes.a, axes.b, axes.c, raw.e));
        } else {
            self.position_cart = target;
            self.set_machine_position_mm(AxisPos::new(raw.x, raw.y, raw.z, raw.e));
        }
    }

    /// Directly set the machine-axis position. Publishes a sync block if
    /// moves are in flight, otherwise writes the generator's registers.
    pub fn set_machine_position_mm(&mut self, position: AxisPos) {
        let target = [
            position_to_steps(position.a, self.settings.limits.axis_steps_per_mm[A_AXIS]),
            position_to_steps(position.b, self.settings.limits.axis_steps_per_mm[B_AXIS]),
            position_to_steps(position.c, self.settings.limits.axis_steps_per_mm[C_AXIS]),
            position_to_steps(
                position.e,
                self.settings.extruders[self.active_extruder].axis_steps_per_mm,
            ),
        ];
        self.position_steps = target;
        self.position_mm = position;

        let motor_target = self.to_motor_steps(target);
        if !self.queue.is_empty() {
            // A repeated set to the same position needs no second sync.
            if self.queue.newest_sync_position() != Some(motor_target) {
                self.buffer_sync_block();
            }
        } else {
            self.queue.set_stepper_position(motor_target);
        }
    }

    /// Set only the extruder position, leaving geometry untouched.
    pub fn set_e_position_mm(&mut self, e: f64) {
        let steps_per_mm = self.settings.extruders[self.active_extruder].axis_steps_per_mm;
        self.position_steps[E_AXIS] = position_to_steps(e, steps_per_mm);
        self.position_mm.e = e;
        self.position_cart.e = e;

        if !self.queue.is_empty() {
            if self.queue.newest_sync_position() != Some(self.to_motor_steps(self.position_steps))
            {
                self.buffer_sync_block();
            }
        } else {
            let mut registers = self.queue.stepper_position();
            registers[E_AXIS] = self.position_steps[E_AXIS];
            self.queue.set_stepper_position(registers);
        }
    }

    fn to_motor_steps(&self, steps: [i32; NUM_AXES]) -> [i32; NUM_AXES] {
        match self.kinematics.core() {
            Some(core) => {
                let motors = core.motor_deltas([
                    i64::from(steps[A_AXIS]),
                    i64::from(steps[B_AXIS]),
                    i64::from(steps[C_AXIS]),
                ]);
                [
                    motors[0] as i32,
                    motors[1] as i32,
                    motors[2] as i32,
                    steps[E_AXIS],
                ]
            }
            None => steps,
        }
    }

    fn axis_steps_to_mm(&self, axis: usize) -> f64 {
        if axis == E_AXIS {
            self.rates.e_steps_to_mm[self.active_extruder]
        } else {
            self.rates.steps_to_mm[axis]
        }
    }

    fn clamp_extruder(&self, extruder: usize) -> usize {
        if extruder >= self.settings.extruders.len() {
            tracing::warn!(extruder, "extruder index out of range, using extruder 0");
            0
        } else {
            extruder
        }
    }

    /// Convert the move into a staged block at `index`. Returns the flag
    /// byte to publish with, or `None` when the move is too short and
    /// was absorbed.
    #[allow(clippy::too_many_arguments)]
    fn fill_block(
        &mut self,
        index: usize,
        split_move: bool,
        target: [i32; NUM_AXES],
        target_mm: AxisPos,
        cart_dist_mm: Option<[f64; NUM_AXES]>,
        mut fr_mm_s: f64,
        extruder: usize,
        millimeters_hint: Option<f64>,
    ) -> Option<BlockFlags> {
        let dx = i64::from(target[A_AXIS] - self.position_steps[A_AXIS]);
        let dy = i64::from(target[B_AXIS] - self.position_steps[B_AXIS]);
        let dz = i64::from(target[C_AXIS] - self.position_steps[C_AXIS]);
        let mut de = i64::from(target[E_AXIS] - self.position_steps[E_AXIS]);

        // Absorb invalid extrusion: pretend the E move happened.
        if de != 0 {
            if self.cold_extruders.get(extruder).copied().unwrap_or(false) {
                self.position_steps[E_AXIS] = target[E_AXIS];
                self.position_mm.e = target_mm.e;
                de = 0;
                tracing::warn!(extruder, "cold extrusion prevented");
            }
            let e_limits = &self.settings.extruders[extruder];
            if (de as f64 * e_limits.e_factor).abs()
                > e_limits.axis_steps_per_mm * e_limits.max_extrude_length_mm
            {
                self.position_steps[E_AXIS] = target[E_AXIS];
                self.position_mm.e = target_mm.e;
                de = 0;
                tracing::warn!(extruder, "over-long extrusion prevented");
            }
        }

        // Motor-axis deltas and direction bits. Core machines derive the
        // motor deltas from the head deltas and keep both directions.
        let mut direction_bits = DirectionBits::new();
        let head_deltas = [dx, dy, dz];
        let motor_deltas = match self.kinematics.core() {
            Some(core) => {
                let (first, second) = core.coupled_axes();
                for axis in [first, second] {
                    if head_deltas[axis] < 0 {
                        direction_bits.set_head_reverse(axis);
                    }
                }
                core.motor_deltas(head_deltas)
            }
            None => head_deltas,
        };
        for axis in 0..3 {
            if motor_deltas[axis] < 0 {
                direction_bits.set_motor_reverse(axis);
            }
        }
        if de < 0 {
            direction_bits.set_motor_reverse(E_AXIS);
        }

        let e_limits = &self.settings.extruders[extruder];
        let e_steps_float = de as f64 * e_limits.e_factor;
        let esteps = (e_steps_float.abs() + 0.5) as u32;

        let steps = [
            motor_deltas[0].unsigned_abs() as u32,
            motor_deltas[1].unsigned_abs() as u32,
            motor_deltas[2].unsigned_abs() as u32,
            esteps,
        ];

        // Per-axis travel in mm: motor space for the speed caps, head
        // space for the segment length.
        let mut steps_dist_mm = [0.0; NUM_AXES];
        let mut head_dist_mm = [0.0; 3];
        for axis in 0..3 {
            steps_dist_mm[axis] = motor_deltas[axis] as f64 * self.rates.steps_to_mm[axis];
            head_dist_mm[axis] = head_deltas[axis] as f64 * self.rates.steps_to_mm[axis];
        }
        steps_dist_mm[E_AXIS] = e_steps_float * self.rates.e_steps_to_mm[extruder];

        let min_steps = self.settings.planner.min_steps_per_segment;
        let millimeters = if steps[A_AXIS] < min_steps
            && steps[B_AXIS] < min_steps
            && steps[C_AXIS] < min_steps
        {
            // Extruder-only move: the filament length is the distance.
            steps_dist_mm[E_AXIS].abs()
        } else {
            millimeters_hint.unwrap_or_else(|| {
                (head_dist_mm[0] * head_dist_mm[0]
                    + head_dist_mm[1] * head_dist_mm[1]
                    + head_dist_mm[2] * head_dist_mm[2])
                    .sqrt()
            })
        };

        let step_event_count = steps.into_iter().max().unwrap_or(0);
        if step_event_count < min_steps {
            // Not worth a block; the next move's deltas pick it up.
            return None;
        }

        let limits = &self.settings.limits;
        fr_mm_s = fr_mm_s.max(if esteps > 0 {
            limits.min_feedrate_mm_s
        } else {
            limits.min_travel_feedrate_mm_s
        });

        let inverse_millimeters = 1.0 / millimeters;
        let mut inverse_secs = fr_mm_s * inverse_millimeters;

        let moves_queued = self.queue.nonbusy_moves_queued();

        // Slow down while the buffer drains instead of stalling at a
        // corner waiting for a refill.
        let planner_cfg = &self.settings.planner;
        if planner_cfg.slowdown
            && moves_queued >= 2
            && moves_queued <= self.queue.capacity() / 2 - 1
        {
            let segment_time_us = (1_000_000.0 / inverse_secs).round() as i64;
            let floor_us = i64::from(limits.min_segment_time_us);
            if segment_time_us < floor_us {
                let stretched =
                    segment_time_us + 2 * (floor_us - segment_time_us) / moves_queued as i64;
                inverse_secs = 1_000_000.0 / stretched as f64;
            }
        }

        let mut nominal_speed_sqr = (millimeters * inverse_secs).powi(2);
        let mut nominal_rate = (step_event_count as f64 * inverse_secs).ceil() as u32;

        // Cap the whole move so no axis exceeds its feedrate.
        let mut current_speed = [0.0; NUM_AXES];
        let mut speed_factor = 1.0f64;
        for axis in 0..NUM_AXES {
            current_speed[axis] = steps_dist_mm[axis] * inverse_secs;
            let axis_speed = current_speed[axis].abs();
            let max_feedrate = if axis == E_AXIS {
                e_limits.max_feedrate_mm_s
            } else {
                limits.max_feedrate_mm_s[axis]
            };
            if axis_speed > max_feedrate {
                speed_factor = speed_factor.min(max_feedrate / axis_speed);
            }
        }
        if speed_factor < 1.0 {
            for speed in &mut current_speed {
                *speed *= speed_factor;
            }
            nominal_rate = (nominal_rate as f64 * speed_factor) as u32;
            nominal_speed_sqr *= speed_factor * speed_factor;
        }

        // Effective acceleration, limited per axis in step space.
        let steps_per_mm = step_event_count as f64 * inverse_millimeters;
        let accel_steps_per_s2 = if steps[A_AXIS] == 0 && steps[B_AXIS] == 0 && steps[C_AXIS] == 0
        {
            (e_limits.retract_acceleration * steps_per_mm).ceil()
        } else {
            let mut accel = (if esteps != 0 {
                limits.print_acceleration
            } else {
                limits.travel_acceleration
            } * steps_per_mm)
                .ceil();
            for axis in 0..3 {
                let cap = self.rates.max_acceleration_steps_per_s2[axis];
                if steps[axis] != 0 && cap < accel {
                    accel = accel.min(cap * step_event_count as f64 / steps[axis] as f64);
                }
            }
            let e_cap = self.rates.e_max_acceleration_steps_per_s2[extruder];
            if esteps != 0 && e_cap < accel {
                accel = accel.min(e_cap * step_event_count as f64 / esteps as f64);
            }
            accel
        };
        let acceleration_steps_per_s2_u32 = accel_steps_per_s2 as u32;
        let acceleration = accel_steps_per_s2 / steps_per_mm;

        // Junction entry-speed bound. Core machines and extruding moves
        // normalize the full four-axis vector; pure travel reuses the
        // precomputed length inverse.
        let mut unit_vec = cart_dist_mm.unwrap_or([
            steps_dist_mm[A_AXIS],
            steps_dist_mm[B_AXIS],
            steps_dist_mm[C_AXIS],
            steps_dist_mm[E_AXIS],
        ]);
        if self.kinematics.core().is_some() || esteps > 0 {
            junction::normalize(&mut unit_vec);
        } else {
            for component in &mut unit_vec {
                *component *= inverse_millimeters;
            }
        }

        let minimum_speed_sqr = planner_cfg.minimum_planner_speed.powi(2);
        let junction_input = JunctionInput {
            unit_vec,
            current_speed,
            nominal_speed_sqr,
            acceleration,
            millimeters,
            queue_nonempty: moves_queued > 0,
            minimum_speed_sqr,
            limits,
            extruder: e_limits,
        };
        let max_entry_speed_sqr = self.junction.max_entry_speed_sqr(&junction_input);

        // Entry speed starts at the floor; a split continuation instead
        // starts as fast as braking-to-minimum allows.
        let v_allowable_sqr =
            profile::max_allowable_speed_sqr(-acceleration, minimum_speed_sqr, millimeters);
        let entry_speed_sqr = if split_move {
            max_entry_speed_sqr.min(v_allowable_sqr)
        } else {
            minimum_speed_sqr
        };

        let mut flags = BlockFlags::new().with(BlockFlags::RECALCULATE);
        if nominal_speed_sqr <= v_allowable_sqr {
            flags = flags.with(BlockFlags::NOMINAL_LENGTH);
        }
        if split_move {
            flags = flags.with(BlockFlags::CONTINUED);
        }

        self.junction.record(current_speed, nominal_speed_sqr);

        let block = Block {
            steps,
            direction_bits,
            step_event_count,
            millimeters,
            nominal_rate,
            nominal_speed_sqr,
            acceleration,
            acceleration_steps_per_s2: acceleration_steps_per_s2_u32,
            entry_speed_sqr,
            max_entry_speed_sqr,
            initial_rate: 0,
            final_rate: 0,
            accelerate_until: 0,
            decelerate_after: 0,
            position: [0; NUM_AXES],
        };
        // SAFETY: the staging slot at head belongs to the producer.
        unsafe {
            self.queue.with_block_mut(index, |slot| *slot = block);
        }

        self.position_steps = target;
        self.position_mm = target_mm;
        self.active_extruder = extruder;
        Some(flags)
    }

    /// Re-optimize junction speeds and refit trapezoids after a new
    /// block was published.
    fn recalculate(&self) {
        let newest = self.queue.prev_index(self.queue.head_index());
        // A single unplanned block cannot be improved.
        if newest != self.queue.planned_index() {
            self.reverse_pass();
            self.forward_pass();
        }
        self.recalculate_trapezoids();
    }

    /// Walk newest-to-oldest maximizing entry speeds under the braking
    /// constraint. Stops at the planned pointer and follows it if the
    /// consumer advances it mid-scan.
    fn reverse_pass(&self) {
        let queue = &self.queue;
        let mut block_index = queue.prev_index(queue.head_index());
        let mut planned_index = queue.planned_index();
        if planned_index == queue.head_index() {
            return;
        }

        let minimum_speed_sqr = self.settings.planner.minimum_planner_speed.powi(2);
        let mut next_index: Option<usize> = None;
        while block_index != planned_index {
            let flags = queue.flags_at(block_index).load(Ordering::Acquire);
            if flags & BlockFlags::SYNC_POSITION == 0 {
                self.reverse_pass_kernel(block_index, next_index, minimum_speed_sqr);
                next_index = Some(block_index);
            }
            block_index = queue.prev_index(block_index);

            // The consumer may have consumed into our scan range; track
            // the planned pointer and truncate if it caught up.
            while planned_index != queue.planned_index() {
                if block_index == planned_index {
                    return;
                }
                planned_index = queue.next_index(planned_index);
            }
        }
    }

    fn reverse_pass_kernel(
        &self,
        current: usize,
        next: Option<usize>,
        minimum_speed_sqr: f64,
    ) {
        let queue = &self.queue;
        // SAFETY: producer-side reads; the consumer never writes these
        // fields.
        let (entry_speed_sqr, max_entry_speed_sqr, acceleration, millimeters) = unsafe {
            queue.with_block(current, |block| {
                (
                    block.entry_speed_sqr,
                    block.max_entry_speed_sqr,
                    block.acceleration,
                    block.millimeters,
                )
            })
        };

        let next_recalculating = next.is_some_and(|index| {
            queue.flags_at(index).load(Ordering::Acquire) & BlockFlags::RECALCULATE != 0
        });
        if entry_speed_sqr == max_entry_speed_sqr && !next_recalculating {
            // Already junction-limited and the downstream block did not
            // change; nothing to improve.
            return;
        }

        let next_entry_speed_sqr = match next {
            // SAFETY: as above.
            Some(index) => unsafe { queue.with_block(index, |block| block.entry_speed_sqr) },
            // The newest block always plans against the fixed floor.
            None => minimum_speed_sqr,
        };

        let flags = queue.flags_at(current).load(Ordering::Acquire);
        let new_entry_speed_sqr = if flags & BlockFlags::NOMINAL_LENGTH != 0 {
            max_entry_speed_sqr
        } else {
            max_entry_speed_sqr.min(profile::max_allowable_speed_sqr(
                -acceleration,
                next_entry_speed_sqr,
                millimeters,
            ))
        };
        if entry_speed_sqr == new_entry_speed_sqr {
            return;
        }

        // Claim the block before writing; if the consumer latched it in
        // the meantime the update is abandoned.
        let observed = queue
            .flags_at(current)
            .fetch_or(BlockFlags::RECALCULATE, Ordering::AcqRel);
        if observed & BlockFlags::BUSY != 0 {
            queue
                .flags_at(current)
                .fetch_and(!BlockFlags::RECALCULATE, Ordering::Release);
        } else {
            // SAFETY: we won the handshake; the consumer defers to the
            // recalculate bit.
            unsafe {
                queue.with_block_mut(current, |block| {
                    block.entry_speed_sqr = new_entry_speed_sqr;
                });
            }
        }
    }

    /// Walk oldest-to-newest dialing entry speeds down to what the
    /// previous block's acceleration can deliver, pinning the planned
    /// pointer forward over blocks that cannot improve further.
    fn forward_pass(&self) {
        let queue = &self.queue;
        let head = queue.head_index();
        let mut block_index = queue.planned_index();
        let mut previous_index: Option<usize> = None;

        while block_index != head {
            let flags = queue.flags_at(block_index).load(Ordering::Acquire);
            if flags & BlockFlags::SYNC_POSITION == 0 {
                let previous_busy = previous_index.is_some_and(|index| {
                    queue.flags_at(index).load(Ordering::Acquire) & BlockFlags::BUSY != 0
                });
                // A busy predecessor's exit speed is frozen, so this
                // block's entry speed cannot be altered either.
                if !previous_busy {
                    self.forward_pass_kernel(previous_index, block_index);
                }
                previous_index = Some(block_index);
            }
            block_index = queue.next_index(block_index);
        }
    }

    fn forward_pass_kernel(&self, previous: Option<usize>, current: usize) {
        let Some(previous) = previous else { return };
        let queue = &self.queue;

        // SAFETY: producer-side reads, as in the reverse pass.
        let (prev_entry_speed_sqr, prev_acceleration, prev_millimeters) = unsafe {
            queue.with_block(previous, |block| {
                (block.entry_speed_sqr, block.acceleration, block.millimeters)
            })
        };
        let current_entry_speed_sqr =
            unsafe { queue.with_block(current, |block| block.entry_speed_sqr) };
        let prev_flags = queue.flags_at(previous).load(Ordering::Acquire);

        if prev_flags & BlockFlags::NOMINAL_LENGTH == 0
            && prev_entry_speed_sqr < current_entry_speed_sqr
        {
            let new_entry_speed_sqr = profile::max_allowable_speed_sqr(
                -prev_acceleration,
                prev_entry_speed_sqr,
                prev_millimeters,
            );
            if new_entry_speed_sqr < current_entry_speed_sqr {
                let observed = queue
                    .flags_at(current)
                    .fetch_or(BlockFlags::RECALCULATE, Ordering::AcqRel);
                if observed & BlockFlags::BUSY != 0 {
                    queue
                        .flags_at(current)
                        .fetch_and(!BlockFlags::RECALCULATE, Ordering::Release);
                } else {
                    // SAFETY: handshake won, as in the reverse pass.
                    unsafe {
                        queue.with_block_mut(current, |block| {
                            block.entry_speed_sqr = new_entry_speed_sqr;
                        });
                    }
                    // Full-acceleration blocks can never improve again.
                    queue.store_planned(current);
                }
            }
        }

        // A block at its junction ceiling also bounds the optimal plan.
        let current_max =
            unsafe { queue.with_block(current, |block| block.max_entry_speed_sqr) };
        let current_entry = unsafe { queue.with_block(current, |block| block.entry_speed_sqr) };
        if current_entry == current_max {
            queue.store_planned(current);
        }
    }

    /// Refit the trapezoid of every block whose junction speeds moved,
    /// and always refit the newest block against the speed floor.
    fn recalculate_trapezoids(&self) {
        let queue = &self.queue;
        let mut block_index = queue.tail_index();
        let mut head_index = queue.head_index();

        // Trailing sync blocks carry no trapezoid; step back over them.
        while head_index != block_index {
            let previous = queue.prev_index(head_index);
            let flags = queue.flags_at(previous).load(Ordering::Acquire);
            if flags & BlockFlags::SYNC_POSITION == 0 {
                break;
            }
            head_index = previous;
        }

        let minimum_planner_speed = self.settings.planner.minimum_planner_speed;
        let mut current: Option<usize> = None;
        let mut current_entry_speed = 0.0;

        while block_index != head_index {
            let flags = queue.flags_at(block_index).load(Ordering::Acquire);
            if flags & BlockFlags::SYNC_POSITION == 0 {
                let next_entry_speed = unsafe {
                    queue.with_block(block_index, |block| block.entry_speed_sqr.sqrt())
                };

                if let Some(current_index) = current {
                    let current_flags = queue.flags_at(current_index).load(Ordering::Acquire);
                    if (current_flags | flags) & BlockFlags::RECALCULATE != 0 {
                        // Either end of this block's trapezoid moved.
                        let observed = queue
                            .flags_at(current_index)
                            .fetch_or(BlockFlags::RECALCULATE, Ordering::AcqRel);
                        if observed & BlockFlags::BUSY == 0 {
                            self.refit_block(current_index, current_entry_speed, next_entry_speed);
                        }
                        queue
                            .flags_at(current_index)
                            .fetch_and(!BlockFlags::RECALCULATE, Ordering::Release);
                    }
                }

                current = Some(block_index);
                current_entry_speed = next_entry_speed;
            }
            block_index = queue.next_index(block_index);
        }

        // The newest block always exits at the planner speed floor.
        if let Some(current_index) = current {
            let observed = queue
                .flags_at(current_index)
                .fetch_or(BlockFlags::RECALCULATE, Ordering::AcqRel);
            if observed & BlockFlags::BUSY == 0 {
                self.refit_block(current_index, current_entry_speed, minimum_planner_speed);
            }
            queue
                .flags_at(current_index)
                .fetch_and(!BlockFlags::RECALCULATE, Ordering::Release);
        }
    }

    fn refit_block(&self, index: usize, entry_speed: f64, exit_speed: f64) {
        // SAFETY: callers hold the recalculate/busy handshake.
        unsafe {
            self.queue.with_block_mut(index, |block| {
                let nominal_speed = block.nominal_speed_sqr.sqrt();
                if nominal_speed <= 0.0 {
                    return;
                }
                let inverse_nominal = 1.0 / nominal_speed;
                let trapezoid = profile::fit_trapezoid(
                    entry_speed * inverse_nominal,
                    exit_speed * inverse_nominal,
                    block.nominal_rate,
                    block.step_event_count,
                    block.acceleration_steps_per_s2,
                );
                block.initial_rate = trapezoid.initial_rate;
                block.final_rate = trapezoid.final_rate;
                block.accelerate_until = trapezoid.accelerate_until;
                block.decelerate_after = trapezoid.decelerate_after;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::JunctionPolicy;

    fn planner() -> (Planner, StepperLink) {
        let mut settings = MachineSettings::single_extruder();
        settings.limits.junction_deviation_mm = 0.05;
        settings.planner.slowdown = false;
        Planner::new(settings, Kinematics::Cartesian).unwrap()
    }

    #[test]
    fn single_move_matches_step_arithmetic() {
        let (mut planner, _link) = planner();
        assert!(planner.buffer_line(Coord::new(10.0, 0.0, 0.0, 0.0), 100.0, 0, None));

        let blocks = planner.queued_blocks();
        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block.steps, [800, 0, 0, 0]);
        assert_eq!(block.step_event_count, 800);
        assert!((block.millimeters - 10.0).abs() < 1e-9);
        assert_eq!(block.nominal_rate, 8000);
        assert!((block.nominal_speed_sqr - 10_000.0).abs() < 1e-6);
    }

    #[test]
    fn tiny_moves_are_absorbed_until_they_accumulate() {
        let (mut planner, _link) = planner();
        // 0.025 mm is 2 steps at 80 steps/mm: below the 6 step floor.
        assert!(planner.buffer_line(Coord::new(0.025, 0.0, 0.0, 0.0), 50.0, 0, None));
        assert!(planner.queued_blocks().is_empty());
        assert_eq!(planner.position_steps(), [0, 0, 0, 0]);

        // The next move measures from the unchanged position, so the
        // dropped steps are not lost.
        assert!(planner.buffer_line(Coord::new(0.1, 0.0, 0.0, 0.0), 50.0, 0, None));
        let blocks = planner.queued_blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].steps[A_AXIS], 8);
    }

    #[test]
    fn per_axis_feedrate_cap_scales_the_whole_move() {
        let (mut planner, _link) = planner();
        // Z alone at 100 mm/s against a 5 mm/s cap.
        assert!(planner.buffer_line(Coord::new(0.0, 0.0, 10.0, 0.0), 100.0, 0, None));
        let block = planner.queued_blocks()[0];
        // nominal speed capped to 5 mm/s on a 10 mm move.
        assert!((block.nominal_speed_sqr - 25.0).abs() < 1e-6);
    }

    #[test]
    fn cold_extrusion_is_absorbed_with_position_kept() {
        let (mut planner, _link) = planner();
        planner.set_extruder_cold(0, true);
        assert!(planner.buffer_line(Coord::new(10.0, 0.0, 0.0, 5.0), 50.0, 0, None));

        let blocks = planner.queued_blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].steps[E_AXIS], 0);
        // The E position advanced as if the extrusion had happened.
        assert_eq!(planner.position_steps()[E_AXIS], 465);
    }

    #[test]
    fn extruder_only_move_uses_filament_length() {
        let (mut planner, _link) = planner();
        assert!(planner.buffer_line(Coord::new(0.0, 0.0, 0.0, 1.0), 30.0, 0, None));
        let block = planner.queued_blocks()[0];
        assert_eq!(block.steps[A_AXIS], 0);
        assert_eq!(block.steps[E_AXIS], 93);
        assert!((block.millimeters - 1.0).abs() < 1e-6);
        // Extruder-only moves take the retract acceleration.
        assert!((block.acceleration - 3000.0).abs() / 3000.0 < 0.01);
    }

    #[test]
    fn colinear_chain_raises_junction_speeds() {
        let (mut planner, _link) = planner();
        for x in [10.0, 20.0, 30.0] {
            assert!(planner.buffer_line(Coord::new(x, 0.0, 0.0, 0.0), 100.0, 0, None));
        }
        let blocks = planner.queued_blocks();
        assert_eq!(blocks.len(), 3);

        let minimum_sqr = 0.05 * 0.05;
        assert!((blocks[0].entry_speed_sqr - minimum_sqr).abs() < 1e-9);
        // Interior junctions run at full nominal speed.
        assert!((blocks[1].entry_speed_sqr - 10_000.0).abs() < 1e-6);
        assert!((blocks[2].entry_speed_sqr - 10_000.0).abs() < 1e-6);
        for block in &blocks {
            assert!(block.decelerate_after > block.accelerate_until);
            assert!(block.accelerate_until > 0 || block.initial_rate == block.nominal_rate);
        }
    }

    #[test]
    fn sync_block_emitted_once_for_repeated_set_position() {
        let (mut planner, _link) = planner();
        assert!(planner.buffer_line(Coord::new(10.0, 0.0, 0.0, 0.0), 100.0, 0, None));

        planner.set_position_mm(Coord::new(50.0, 0.0, 0.0, 0.0));
        let count = planner.queued_blocks().len();
        planner.set_position_mm(Coord::new(50.0, 0.0, 0.0, 0.0));
        assert_eq!(planner.queued_blocks().len(), count);
        assert_eq!(planner.position_steps(), [4000, 0, 0, 0]);
    }

    #[test]
    fn set_position_with_empty_queue_writes_the_registers() {
        let (mut planner, link) = planner();
        planner.set_position_mm(Coord::new(10.0, -5.0, 2.0, 1.0));
        assert_eq!(link.position(), [800, -400, 800, 93]);
        assert!(planner.queued_blocks().is_empty());
    }

    #[test]
    fn classic_jerk_policy_plans_junctions() {
        let mut settings = MachineSettings::single_extruder();
        settings.planner.junction_policy = JunctionPolicy::ClassicJerk;
        settings.planner.slowdown = false;
        let (mut planner, _link) = Planner::new(settings, Kinematics::Cartesian).unwrap();

        assert!(planner.buffer_line(Coord::new(10.0, 0.0, 0.0, 0.0), 100.0, 0, None));
        assert!(planner.buffer_line(Coord::new(20.0, 0.0, 0.0, 0.0), 100.0, 0, None));
        let blocks = planner.queued_blocks();
        // Straight continuation coasts through the junction.
        assert!((blocks[1].entry_speed_sqr - 10_000.0).abs() < 1e-6);
    }

    #[test]
    fn corexy_derives_motor_steps_and_head_bits() {
        let mut settings = MachineSettings::single_extruder();
        settings.planner.slowdown = false;
        let kinematics = Kinematics::Core(crate::kinematics::CoreGeometry::default());
        let (mut planner, _link) = Planner::new(settings, kinematics).unwrap();

        // A pure +Y head move drives the motors in opposite directions.
        assert!(planner.buffer_line(Coord::new(0.0, 10.0, 0.0, 0.0), 100.0, 0, None));
        let block = planner.queued_blocks()[0];
        assert_eq!(block.steps[A_AXIS], 800);
        assert_eq!(block.steps[B_AXIS], 800);
        assert!(!block.direction_bits.motor_reversed(A_AXIS));
        assert!(block.direction_bits.motor_reversed(B_AXIS));
        assert!(!block.direction_bits.head_reversed(B_AXIS));
        // Length is measured at the head, not the motors.
        assert!((block.millimeters - 10.0).abs() < 1e-9);
        assert_eq!(block.step_event_count, 800);
    }

    #[test]
    fn modifiers_warp_targets_and_positions_consistently() {
        struct ZLift;
        impl PositionModifier for ZLift {
            fn apply(&self, pos: &mut Coord) {
                pos.z += 0.5;
            }
            fn unapply(&self, pos: &mut Coord) {
                pos.z -= 0.5;
            }
        }

        let (mut planner, _link) = planner();
        planner.add_modifier(Box::new(ZLift));

        assert!(planner.buffer_line(Coord::new(10.0, 0.0, 0.0, 0.0), 100.0, 0, None));
        let block = planner.queued_blocks()[0];
        // The warp moved Z by 0.5 mm (200 steps at 400 steps/mm).
        assert_eq!(block.steps[C_AXIS], 200);
        assert_eq!(planner.position_steps()[C_AXIS], 200);

        // Setting the same cartesian position afterwards is a no-op in
        // machine space, and unapplying the warp recovers the logical
        // position.
        planner.set_position_mm(Coord::new(10.0, 0.0, 0.0, 0.0));
        assert_eq!(planner.position_steps(), [800, 0, 200, 0]);
        let logical = planner.cartesian_position_mm();
        assert!((logical.x - 10.0).abs() < 1e-9);
        assert!(logical.z.abs() < 1e-9);
    }
}
