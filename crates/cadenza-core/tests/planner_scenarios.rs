//! End-to-end planner scenarios: admission through look-ahead to a
//! draining step generator.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use cadenza_core::{
    Block, Coord, Kinematics, MachineSettings, Planner, StepperEvent, StepperLink,
};

const MIN_SPEED_SQR: f64 = 0.05 * 0.05;

fn machine() -> MachineSettings {
    let mut settings = MachineSettings::single_extruder();
    settings.limits.junction_deviation_mm = 0.05;
    settings.planner.slowdown = false;
    settings.planner.first_block_delay_ms = 0;
    settings.planner.clean_buffer_hold_ms = 200;
    settings
}

fn cartesian_planner() -> (Planner, StepperLink) {
    Planner::new(machine(), Kinematics::Cartesian).unwrap()
}

/// Pull every queued block through the consumer side.
fn drain(link: &mut StepperLink) -> Vec<Block> {
    let mut blocks = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        match link.poll() {
            StepperEvent::Move(block) => {
                blocks.push(block);
                link.complete();
            }
            StepperEvent::Holding => {
                assert!(Instant::now() < deadline, "first-block hold never released");
                std::thread::yield_now();
            }
            StepperEvent::Idle => break,
        }
    }
    blocks
}

#[test]
fn single_straight_move_produces_a_symmetric_trapezoid() {
    let (mut planner, mut link) = cartesian_planner();
    assert!(planner.buffer_line(Coord::new(10.0, 0.0, 0.0, 0.0), 100.0, 0, None));

    let blocks = drain(&mut link);
    assert_eq!(blocks.len(), 1);
    let block = &blocks[0];

    assert_eq!(block.steps[0], 800);
    assert_eq!(block.step_event_count, 800);
    assert!((block.millimeters - 10.0).abs() < 1e-9);
    assert_eq!(block.nominal_rate, 8000);
    assert!((block.entry_speed_sqr - MIN_SPEED_SQR).abs() < 1e-12);

    // Entry and exit both sit at the planner floor, so the ramps match
    // within a step.
    let accel_len = block.accelerate_until;
    let decel_len = block.step_event_count - block.decelerate_after;
    assert!(accel_len.abs_diff(decel_len) <= 1, "{accel_len} vs {decel_len}");
}

#[test]
fn colinear_chain_runs_the_interior_junctions_at_nominal() {
    let (mut planner, mut link) = cartesian_planner();
    for x in [10.0, 20.0, 30.0] {
        assert!(planner.buffer_line(Coord::new(x, 0.0, 0.0, 0.0), 100.0, 0, None));
    }

    let blocks = drain(&mut link);
    assert_eq!(blocks.len(), 3);
    assert!((blocks[0].entry_speed_sqr - MIN_SPEED_SQR).abs() < 1e-12);
    assert!((blocks[1].entry_speed_sqr - 10_000.0).abs() < 1e-6);
    assert!((blocks[2].entry_speed_sqr - 10_000.0).abs() < 1e-6);

    // All plateaus are non-empty.
    for block in &blocks {
        assert!(block.decelerate_after > block.accelerate_until, "{block:?}");
    }
}

#[test]
fn right_angle_corner_slows_to_the_junction_deviation_bound() {
    let (mut planner, mut link) = cartesian_planner();
    assert!(planner.buffer_line(Coord::new(10.0, 0.0, 0.0, 0.0), 100.0, 0, None));
    assert!(planner.buffer_line(Coord::new(10.0, 10.0, 0.0, 0.0), 100.0, 0, None));

    let blocks = drain(&mut link);
    assert_eq!(blocks.len(), 2);

    // v^2 = d * a * sin(theta/2) / (1 - sin(theta/2)) with theta = 90deg.
    let sin_half = (0.5f64).sqrt();
    let expected = 0.05 * 3000.0 * sin_half / (1.0 - sin_half);
    let entry = blocks[1].entry_speed_sqr;
    assert!((entry - expected).abs() < 1.0, "entry = {entry}, expected = {expected}");

    // Both blocks are refit to meet at roughly 19 mm/s: ~1523 steps/s at
    // 8000 steps/s nominal.
    let junction_rate = (expected.sqrt() / 100.0 * 8000.0).ceil() as u32;
    assert!(blocks[0].final_rate.abs_diff(junction_rate) <= 2);
    assert!(blocks[1].initial_rate.abs_diff(junction_rate) <= 2);
}

#[test]
fn sharp_reverse_brakes_both_segments_fully() {
    let mut settings = machine();
    settings.limits.max_acceleration_mm_per_s2 = [1000.0, 1000.0, 100.0];
    settings.limits.print_acceleration = 1000.0;
    settings.limits.travel_acceleration = 1000.0;
    let (mut planner, mut link) = Planner::new(settings, Kinematics::Cartesian).unwrap();

    assert!(planner.buffer_line(Coord::new(0.5, 0.0, 0.0, 0.0), 60.0, 0, None));
    assert!(planner.buffer_line(Coord::new(0.0, 0.0, 0.0, 0.0), 60.0, 0, None));

    let blocks = drain(&mut link);
    assert_eq!(blocks.len(), 2);

    // The junction is clamped to the planner floor; both segments brake
    // down to the minimal step rate around it.
    assert!((blocks[1].max_entry_speed_sqr - MIN_SPEED_SQR).abs() < 1e-12);
    assert!(blocks[1].entry_speed_sqr <= MIN_SPEED_SQR + 1e-12);
    assert_eq!(blocks[0].final_rate, 120);
    assert_eq!(blocks[1].initial_rate, 120);
}

#[test]
fn speed_caps_hold_for_every_block() {
    let (mut planner, mut link) = cartesian_planner();
    let targets = [
        (20.0, 0.0, 0.0, 1.0, 120.0),
        (20.0, 15.0, 0.0, 2.0, 90.0),
        (5.0, 15.0, 0.0, 2.5, 200.0),
        (5.0, 5.0, 1.0, 3.0, 60.0),
        (0.0, 0.0, 0.0, 3.5, 150.0),
    ];
    for (x, y, z, e, feedrate) in targets {
        assert!(planner.buffer_line(Coord::new(x, y, z, e), feedrate, 0, None));
    }

    let blocks = drain(&mut link);
    assert_eq!(blocks.len(), 5);
    for block in &blocks {
        assert!(
            block.entry_speed_sqr <= block.max_entry_speed_sqr + 1e-9,
            "entry above junction bound: {block:?}"
        );
        assert!(
            block.max_entry_speed_sqr <= block.nominal_speed_sqr + 1e-9,
            "junction bound above nominal: {block:?}"
        );
        assert!(block.initial_rate <= block.nominal_rate);
        assert!(block.final_rate <= block.nominal_rate);
        assert!(block.accelerate_until <= block.decelerate_after);
        assert!(block.decelerate_after <= block.step_event_count);
    }

    // Deceleration feasibility between neighbours: each entry speed is
    // reachable by braking over the previous block.
    for pair in blocks.windows(2) {
        let budget =
            pair[1].entry_speed_sqr + 2.0 * pair[0].acceleration * pair[0].millimeters;
        assert!(pair[0].entry_speed_sqr <= budget + 1e-6, "{pair:?}");
    }
}

#[test]
fn step_integrity_over_a_drained_sequence() {
    let (mut planner, mut link) = cartesian_planner();
    let targets = [
        Coord::new(10.2, 0.0, 0.0, 0.5),
        Coord::new(3.7, -2.2, 1.05, 0.9),
        Coord::new(3.7, -2.2, 1.05, 1.2),
        Coord::new(-5.5, 8.8, 0.3, 1.4),
    ];
    for target in targets {
        assert!(planner.buffer_line(target, 80.0, 0, None));
    }

    let blocks = drain(&mut link);
    let mut summed = [0i64; 4];
    for block in &blocks {
        let deltas = block.signed_steps();
        for axis in 0..4 {
            summed[axis] += deltas[axis];
        }
    }

    let last = targets[3];
    let expected = [
        (last.x * 80.0 + 0.5).floor() as i64,
        (last.y * 80.0 + 0.5).floor() as i64,
        (last.z * 400.0 + 0.5).floor() as i64,
        (last.e * 93.0 + 0.5).floor() as i64,
    ];
    assert_eq!(summed, expected);

    // The generator's registers landed on the same position.
    let position = link.position();
    for axis in 0..4 {
        assert_eq!(i64::from(position[axis]), expected[axis]);
    }
    assert_eq!(planner.position_steps(), position);
}

#[test]
fn full_queue_applies_back_pressure_through_the_idle_hook() {
    let (mut planner, link) = cartesian_planner();

    // A 16-slot ring holds 15 blocks; fill it without draining.
    for i in 1..=15 {
        assert!(planner.buffer_line(Coord::new(i as f64, 0.0, 0.0, 0.0), 100.0, 0, None));
    }

    // The 16th admission must wait until the consumer frees a slot; the
    // idle hook stands in for the stepper interrupt doing exactly that.
    let drained = Arc::new(AtomicUsize::new(0));
    let counter = drained.clone();
    let mut link = link;
    planner.set_idle_hook(move || {
        if let StepperEvent::Move(_) = link.poll() {
            link.complete();
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    assert!(planner.buffer_line(Coord::new(16.0, 0.0, 0.0, 0.0), 100.0, 0, None));
    assert!(drained.load(Ordering::SeqCst) >= 1);
}

#[test]
fn quick_stop_discards_the_queue_and_rate_limits_admission() {
    let (mut planner, _link) = cartesian_planner();
    for i in 1..=10 {
        assert!(planner.buffer_line(Coord::new(i as f64, 0.0, 0.0, 0.0), 100.0, 0, None));
    }
    assert!(planner.has_moves_queued());

    planner.quick_stop();
    assert!(!planner.has_moves_queued());

    // Admission is refused while the clean-buffer window runs...
    assert!(!planner.buffer_line(Coord::new(11.0, 0.0, 0.0, 0.0), 100.0, 0, None));

    // ...and accepted again once it lapses.
    std::thread::sleep(Duration::from_millis(250));
    assert!(planner.buffer_line(Coord::new(11.0, 0.0, 0.0, 0.0), 100.0, 0, None));
}

#[test]
fn first_block_delay_holds_delivery_briefly() {
    let mut settings = machine();
    settings.planner.first_block_delay_ms = 50;
    let (mut planner, mut link) = Planner::new(settings, Kinematics::Cartesian).unwrap();

    assert!(planner.buffer_line(Coord::new(10.0, 0.0, 0.0, 0.0), 100.0, 0, None));
    assert!(matches!(link.poll(), StepperEvent::Holding));

    std::thread::sleep(Duration::from_millis(60));
    assert!(matches!(link.poll(), StepperEvent::Move(_)));
}

#[test]
fn synchronize_waits_for_a_threaded_consumer() {
    let (mut planner, mut link) = cartesian_planner();

    let consumer = std::thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut consumed = 0usize;
        while consumed < 30 && Instant::now() < deadline {
            match link.poll() {
                StepperEvent::Move(_) => {
                    link.complete();
                    consumed += 1;
                }
                _ => std::thread::yield_now(),
            }
        }
        (consumed, link.position())
    });

    for i in 1..=30 {
        assert!(planner.buffer_line(Coord::new(i as f64, 0.0, 0.0, 0.0), 200.0, 0, None));
    }
    planner.synchronize();
    assert!(!planner.has_moves_queued());

    let (consumed, position) = consumer.join().unwrap();
    assert_eq!(consumed, 30);
    assert_eq!(position, [2400, 0, 0, 0]);
    assert_eq!(planner.position_steps(), position);
}

#[test]
fn delta_moves_round_trip_through_the_tower_transform() {
    let mut settings = machine();
    settings.limits.axis_steps_per_mm = [80.0, 80.0, 80.0];
    settings.limits.max_feedrate_mm_s = [200.0, 200.0, 200.0];
    settings.limits.max_acceleration_mm_per_s2 = [3000.0, 3000.0, 3000.0];
    let kinematics = Kinematics::Delta(cadenza_core::kinematics::DeltaGeometry::default());
    let (mut planner, mut link) = Planner::new(settings, kinematics).unwrap();

    planner.set_position_mm(Coord::new(0.0, 0.0, 50.0, 0.0));
    assert!(planner.buffer_line(Coord::new(20.0, -10.0, 50.0, 0.0), 80.0, 0, None));

    let blocks = drain(&mut link);
    assert_eq!(blocks.len(), 1);
    // The segment length is the cartesian distance, not the carriage
    // displacement.
    let expected = (20.0f64 * 20.0 + 10.0 * 10.0).sqrt();
    assert!((blocks[0].millimeters - expected).abs() < 1e-9);

    // Draining the queue leaves the carriages at the transformed target.
    let target_axes = planner
        .kinematics()
        .to_axes(Coord::new(20.0, -10.0, 50.0, 0.0));
    let position = link.position();
    assert_eq!(position[0], (target_axes.a * 80.0 + 0.5).floor() as i32);
    assert_eq!(position[1], (target_axes.b * 80.0 + 0.5).floor() as i32);
    assert_eq!(position[2], (target_axes.c * 80.0 + 0.5).floor() as i32);
}
