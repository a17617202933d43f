//! Bounded single-producer/single-consumer ring buffer of planner blocks.
//!
//! The planner owns the producer side; a [`StepperLink`] hands the
//! consumer side to the step generator. Four indices walk the ring:
//!
//! - `tail`: next block the consumer will execute,
//! - `nonbusy`: first block the consumer has not latched,
//! - `planned`: first block look-ahead has not yet proven optimal,
//! - `head`: next free slot; advancing it publishes a block.
//!
//! `head` is written only by the producer (release) and `tail` only by
//! the consumer (release); each acquires the other's index. Block fields
//! are protected by the busy/recalculate handshake on the slot's atomic
//! flag byte: the planner sets `RECALCULATE` and checks `BUSY` in one
//! read-modify-write, the consumer sets `BUSY` and checks `RECALCULATE`
//! the same way, so exactly one side wins every race and the loser backs
//! off without touching the block.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use crate::block::{Block, BlockFlags};
use crate::settings::NUM_AXES;

/// Hold the first block back until the queue carries at least this many
/// moves, so look-ahead has something to chain against.
const HOLD_RELEASE_MOVES: usize = 3;

struct Slot {
    flags: AtomicU8,
    block: UnsafeCell<Block>,
}

pub struct BlockQueue {
    slots: Box<[Slot]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
    planned: AtomicUsize,
    nonbusy: AtomicUsize,
    /// The step generator's position registers, in steps.
    stepper_pos: [AtomicI32; NUM_AXES],
    /// Positions captured when an endstop fired.
    triggered_pos: [AtomicI32; NUM_AXES],
    /// Quick stop: the consumer must drop any latched block.
    stop_requested: AtomicBool,
    /// Endstop: the consumer must discard the latched block unexecuted.
    abort_requested: AtomicBool,
    /// Admission refused until this deadline (us since `epoch`); 0 clear.
    clean_until_us: AtomicU64,
    /// First-block delivery delay deadline (us since `epoch`); 0 clear.
    hold_until_us: AtomicU64,
    epoch: Instant,
}

// SAFETY: slot contents are only touched under the index/flag protocol
// described in the module docs; all shared indices and flags are atomic.
unsafe impl Sync for BlockQueue {}

impl BlockQueue {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity.is_power_of_two(), "queue capacity {capacity} not a power of two");
        let slots = (0..capacity)
            .map(|_| Slot {
                flags: AtomicU8::new(0),
                block: UnsafeCell::new(Block::default()),
            })
            .collect();
        Arc::new(Self {
            slots,
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            planned: AtomicUsize::new(0),
            nonbusy: AtomicUsize::new(0),
            stepper_pos: std::array::from_fn(|_| AtomicI32::new(0)),
            triggered_pos: std::array::from_fn(|_| AtomicI32::new(0)),
            stop_requested: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            clean_until_us: AtomicU64::new(0),
            hold_until_us: AtomicU64::new(0),
            epoch: Instant::now(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    pub(crate) fn next_index(&self, index: usize) -> usize {
        (index + 1) & self.mask
    }

    pub(crate) fn prev_index(&self, index: usize) -> usize {
        (index + self.mask) & self.mask
    }

    pub(crate) fn head_index(&self) -> usize {
        self.head.load(Ordering::Acquire)
    }

    pub(crate) fn tail_index(&self) -> usize {
        self.tail.load(Ordering::Acquire)
    }

    pub(crate) fn planned_index(&self) -> usize {
        self.planned.load(Ordering::Acquire)
    }

    pub(crate) fn store_planned(&self, index: usize) {
        self.planned.store(index, Ordering::Release);
    }

    pub fn is_empty(&self) -> bool {
        self.head_index() == self.tail_index()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.next_index(self.head_index()) == self.tail_index()
    }

    /// Blocks currently queued.
    pub fn moves_queued(&self) -> usize {
        (self.head_index().wrapping_sub(self.tail_index())) & self.mask
    }

    /// Queued blocks the consumer has not latched; only these can still
    /// be replanned.
    pub(crate) fn nonbusy_moves_queued(&self) -> usize {
        (self.head_index().wrapping_sub(self.nonbusy.load(Ordering::Acquire))) & self.mask
    }

    pub(crate) fn flags_at(&self, index: usize) -> &AtomicU8 {
        &self.slots[index].flags
    }

    /// Run `f` against the block in `index`.
    ///
    /// # Safety
    ///
    /// The caller must hold the slot per the ring protocol: the producer
    /// for any unconsumed slot it has not lost to a `BUSY` latch, the
    /// consumer for a slot it has latched.
    pub(crate) unsafe fn with_block<R>(&self, index: usize, f: impl FnOnce(&Block) -> R) -> R {
        f(unsafe { &*self.slots[index].block.get() })
    }

    /// Run `f` against the block in `index`, mutably.
    ///
    /// # Safety
    ///
    /// Producer only, and only for the staging slot at `head` or after
    /// winning the recalculate/busy handshake on a published slot.
    pub(crate) unsafe fn with_block_mut<R>(
        &self,
        index: usize,
        f: impl FnOnce(&mut Block) -> R,
    ) -> R {
        f(unsafe { &mut *self.slots[index].block.get() })
    }

    /// Publish the staged block at `head` with the given flags.
    pub(crate) fn publish(&self, flags: BlockFlags) {
        let head = self.head.load(Ordering::Relaxed);
        self.slots[head].flags.store(flags.bits(), Ordering::Release);
        self.head.store(self.next_index(head), Ordering::Release);
    }

    pub(crate) fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Whether admission is refused following a quick stop.
    pub fn clean_active(&self) -> bool {
        let deadline = self.clean_until_us.load(Ordering::Acquire);
        deadline != 0 && self.now_us() < deadline
    }

    pub(crate) fn arm_first_block_hold(&self, delay_us: u64) {
        self.hold_until_us
            .store(self.now_us() + delay_us, Ordering::Release);
    }

    /// Discard every queued block and refuse admission for `clean_hold_us`.
    pub(crate) fn quick_stop(&self, clean_hold_us: u64) {
        // Raised before the indices move so the consumer abandons any
        // latched block instead of advancing tail through the wreckage.
        self.stop_requested.store(true, Ordering::Release);
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            self.nonbusy.store(tail, Ordering::Release);
            self.planned.store(tail, Ordering::Release);
            self.head.store(tail, Ordering::Release);
            if self.tail.load(Ordering::Acquire) == tail {
                break;
            }
        }
        self.hold_until_us.store(0, Ordering::Release);
        self.clean_until_us
            .store(self.now_us() + clean_hold_us, Ordering::Release);
    }

    /// Record the trigger position for `axis` and ask the consumer to
    /// discard its current block.
    pub(crate) fn endstop_triggered(&self, axis: usize) {
        let position = self.stepper_pos[axis].load(Ordering::Acquire);
        self.triggered_pos[axis].store(position, Ordering::Release);
        self.abort_requested.store(true, Ordering::Release);
    }

    pub fn triggered_position(&self, axis: usize) -> i32 {
        self.triggered_pos[axis].load(Ordering::Acquire)
    }

    pub(crate) fn set_stepper_position(&self, position: [i32; NUM_AXES]) {
        for (register, value) in self.stepper_pos.iter().zip(position) {
            register.store(value, Ordering::Release);
        }
    }

    pub fn stepper_position(&self) -> [i32; NUM_AXES] {
        std::array::from_fn(|axis| self.stepper_pos[axis].load(Ordering::Acquire))
    }

    /// Position recorded in the newest queued block, if it is a sync
    /// block. Used to elide duplicate sync blocks.
    pub(crate) fn newest_sync_position(&self) -> Option<[i32; NUM_AXES]> {
        if self.is_empty() {
            return None;
        }
        let newest = self.prev_index(self.head_index());
        let flags = self.flags_at(newest).load(Ordering::Acquire);
        if flags & BlockFlags::SYNC_POSITION == 0 {
            return None;
        }
        // SAFETY: sync block fields are immutable once published.
        Some(unsafe { self.with_block(newest, |block| block.position) })
    }

    fn advance_tail_from(&self, tail: usize) {
        let next = self.next_index(tail);
        // Keep nonbusy and planned ahead of tail so the producer never
        // scans a recycled slot.
        if self.nonbusy.load(Ordering::Acquire) == tail {
            self.nonbusy.store(next, Ordering::Release);
        }
        if self.planned.load(Ordering::Acquire) == tail {
            self.planned.store(next, Ordering::Release);
        }
        self.tail.store(next, Ordering::Release);
    }
}

/// What the step generator sees when it asks for work.
#[derive(Debug, Clone, Copy)]
pub enum StepperEvent {
    /// Nothing executable queued.
    Idle,
    /// Blocks exist but the first-block delivery delay is still running.
    Holding,
    /// A latched block, ready to execute. Call
    /// [`StepperLink::complete`] when its steps have been issued.
    Move(Block),
}

/// Consumer half of the ring: the step generator's view of the planner.
///
/// The generator latches one block at a time with [`poll`](Self::poll),
/// issues its steps honouring the trapezoid fields, then calls
/// [`complete`](Self::complete) to recycle the slot. Sync blocks are
/// absorbed internally; they only update the position registers.
pub struct StepperLink {
    queue: Arc<BlockQueue>,
    latched: Option<usize>,
}

impl StepperLink {
    pub(crate) fn new(queue: Arc<BlockQueue>) -> Self {
        Self {
            queue,
            latched: None,
        }
    }

    pub fn queue(&self) -> &Arc<BlockQueue> {
        &self.queue
    }

    /// The generator's current position registers, in steps.
    pub fn position(&self) -> [i32; NUM_AXES] {
        self.queue.stepper_position()
    }

    /// Latch the next executable block.
    pub fn poll(&mut self) -> StepperEvent {
        let queue = &self.queue;

        if queue.stop_requested.swap(false, Ordering::AcqRel) {
            self.latched = None;
        }

        // Re-deliver an already latched block until it completes.
        if let Some(index) = self.latched {
            // SAFETY: latched blocks are immutable to the producer.
            return StepperEvent::Move(unsafe { queue.with_block(index, |block| *block) });
        }

        loop {
            let tail = queue.tail_index();
            if tail == queue.head_index() {
                return StepperEvent::Idle;
            }

            let hold = queue.hold_until_us.load(Ordering::Acquire);
            if hold != 0 {
                if queue.moves_queued() >= HOLD_RELEASE_MOVES || queue.now_us() >= hold {
                    queue.hold_until_us.store(0, Ordering::Release);
                } else {
                    return StepperEvent::Holding;
                }
            }

            let flags = queue.flags_at(tail);
            let observed = flags.fetch_or(BlockFlags::BUSY, Ordering::AcqRel);
            if observed & BlockFlags::RECALCULATE != 0 {
                // The planner is mid-update; its trapezoid is not
                // published yet. Back off and retry later.
                flags.fetch_and(!BlockFlags::BUSY, Ordering::Release);
                return StepperEvent::Idle;
            }

            if observed & BlockFlags::SYNC_POSITION != 0 {
                // SAFETY: the latch above succeeded, the block is ours.
                let position = unsafe { queue.with_block(tail, |block| block.position) };
                queue.set_stepper_position(position);
                queue.advance_tail_from(tail);
                continue;
            }

            let next = queue.next_index(tail);
            queue.nonbusy.store(next, Ordering::Release);
            if queue.planned.load(Ordering::Acquire) == tail {
                queue.planned.store(next, Ordering::Release);
            }
            self.latched = Some(tail);
            // SAFETY: the latch above succeeded, the block is ours.
            return StepperEvent::Move(unsafe { queue.with_block(tail, |block| *block) });
        }
    }

    /// Finish the latched block: apply its step deltas to the position
    /// registers and recycle the slot.
    pub fn complete(&mut self) {
        let queue = &self.queue;
        let Some(index) = self.latched.take() else {
            return;
        };
        if queue.stop_requested.swap(false, Ordering::AcqRel) {
            // The queue was wiped under us; the block no longer exists.
            return;
        }
        if !queue.abort_requested.swap(false, Ordering::AcqRel) {
            // SAFETY: latched blocks are immutable to the producer.
            let deltas = unsafe { queue.with_block(index, |block| block.signed_steps()) };
            for (register, delta) in queue.stepper_pos.iter().zip(deltas) {
                register.fetch_add(delta as i32, Ordering::AcqRel);
            }
        }
        queue.advance_tail_from(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_with_blocks(count: usize) -> (Arc<BlockQueue>, StepperLink) {
        let queue = BlockQueue::new(8);
        let link = StepperLink::new(queue.clone());
        for i in 0..count {
            stage_move(&queue, 10 * (i as u32 + 1));
        }
        (queue, link)
    }

    fn stage_move(queue: &Arc<BlockQueue>, steps: u32) {
        let head = queue.head_index();
        // SAFETY: the staging slot belongs to the producer.
        unsafe {
            queue.with_block_mut(head, |block| {
                *block = Block::default();
                block.steps = [steps, 0, 0, 0];
                block.step_event_count = steps;
            });
        }
        queue.publish(BlockFlags::new());
    }

    #[test]
    fn blocks_come_out_in_fifo_order() {
        let (_, mut link) = queue_with_blocks(3);
        for expected in [10, 20, 30] {
            match link.poll() {
                StepperEvent::Move(block) => assert_eq!(block.steps[0], expected),
                other => panic!("expected a move, got {other:?}"),
            }
            link.complete();
        }
        assert!(matches!(link.poll(), StepperEvent::Idle));
    }

    #[test]
    fn completing_applies_signed_steps() {
        let queue = BlockQueue::new(8);
        let mut link = StepperLink::new(queue.clone());
        let head = queue.head_index();
        unsafe {
            queue.with_block_mut(head, |block| {
                *block = Block::default();
                block.steps = [100, 0, 40, 0];
                block.direction_bits.set_motor_reverse(2);
                block.step_event_count = 100;
            });
        }
        queue.publish(BlockFlags::new());

        assert!(matches!(link.poll(), StepperEvent::Move(_)));
        link.complete();
        assert_eq!(link.position(), [100, 0, -40, 0]);
    }

    #[test]
    fn recalculate_flag_defers_the_latch() {
        let (queue, mut link) = queue_with_blocks(1);
        let tail = queue.tail_index();
        queue
            .flags_at(tail)
            .fetch_or(BlockFlags::RECALCULATE, Ordering::AcqRel);
        assert!(matches!(link.poll(), StepperEvent::Idle));
        // The failed latch must not leave the block marked busy.
        let flags = queue.flags_at(tail).load(Ordering::Acquire);
        assert_eq!(flags & BlockFlags::BUSY, 0);

        queue
            .flags_at(tail)
            .fetch_and(!BlockFlags::RECALCULATE, Ordering::Release);
        assert!(matches!(link.poll(), StepperEvent::Move(_)));
    }

    #[test]
    fn sync_blocks_update_position_without_motion() {
        let queue = BlockQueue::new(8);
        let mut link = StepperLink::new(queue.clone());
        let head = queue.head_index();
        unsafe {
            queue.with_block_mut(head, |block| {
                *block = Block::default();
                block.position = [800, -80, 0, 42];
            });
        }
        queue.publish(BlockFlags::new().with(BlockFlags::SYNC_POSITION));

        assert!(matches!(link.poll(), StepperEvent::Idle));
        assert_eq!(link.position(), [800, -80, 0, 42]);
        assert!(queue.is_empty());
    }

    #[test]
    fn latching_advances_nonbusy_and_planned() {
        let (queue, mut link) = queue_with_blocks(2);
        assert_eq!(queue.nonbusy_moves_queued(), 2);
        assert!(matches!(link.poll(), StepperEvent::Move(_)));
        assert_eq!(queue.nonbusy_moves_queued(), 1);
        assert_eq!(queue.planned_index(), queue.next_index(queue.tail_index()));
    }

    #[test]
    fn first_block_hold_releases_on_occupancy() {
        let (queue, mut link) = queue_with_blocks(1);
        queue.arm_first_block_hold(60_000_000);
        assert!(matches!(link.poll(), StepperEvent::Holding));

        stage_move(&queue, 20);
        assert!(matches!(link.poll(), StepperEvent::Holding));

        stage_move(&queue, 30);
        assert!(matches!(link.poll(), StepperEvent::Move(_)));
    }

    #[test]
    fn quick_stop_empties_the_queue_and_raises_clean() {
        let (queue, mut link) = queue_with_blocks(5);
        assert!(matches!(link.poll(), StepperEvent::Move(_)));

        queue.quick_stop(1_000_000);
        assert!(queue.is_empty());
        assert!(queue.clean_active());

        // The latched block is abandoned, not executed.
        link.complete();
        assert_eq!(link.position(), [0, 0, 0, 0]);
        assert!(queue.is_empty());
        assert!(matches!(link.poll(), StepperEvent::Idle));
    }

    #[test]
    fn endstop_abort_discards_without_stepping() {
        let (queue, mut link) = queue_with_blocks(2);
        assert!(matches!(link.poll(), StepperEvent::Move(_)));
        queue.endstop_triggered(0);
        link.complete();
        assert_eq!(link.position(), [0, 0, 0, 0]);
        assert_eq!(queue.triggered_position(0), 0);
        // The next block executes normally.
        assert!(matches!(link.poll(), StepperEvent::Move(_)));
        link.complete();
        assert_eq!(link.position(), [20, 0, 0, 0]);
    }
}
