//! Timer queue backed by a minimum heap.
//!
//! Timepoints are absolute microseconds on a process-wide monotonic clock and are
//!  rounded to the queue's precision (1 ms by default), so timers that expire in the
//!  same precision window share a single heap slot. A side index maps timepoints to
//!  their slot, which keeps `cancel` O(1) amortized without touching the heap.
//!
//! A queue belongs to exactly one event loop and must only be mutated from that
//!  loop's driver. Code running elsewhere schedules an executor job on the owning
//!  loop and manipulates the queue from there.

use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::OnceLock;
use std::time::Instant;

/// 1 ms - the default timer precision
pub const TIMER_MIN_PRECISION_US: u64 = 1_000;

/// sentinel for "no outstanding timer", comparing greater than any real timepoint
pub const TIMEPOINT_NEVER: u64 = u64::MAX;

static CLOCK_BASE: OnceLock<Instant> = OnceLock::new();

/// Microseconds since an arbitrary (but fixed per process) monotonic reference
///  point. All timer timepoints are expressed on this clock.
pub fn current_time_us() -> u64 {
    CLOCK_BASE.get_or_init(Instant::now).elapsed().as_micros() as u64
}

pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// Handle returned by [`TimerQueue::insert`]. A negative id means "no timer" -
///  freshly created endpoints start out with [`TimerHandle::NONE`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerHandle {
    pub id: i64,
    pub timepoint: u64,
}

impl TimerHandle {
    pub const NONE: TimerHandle = TimerHandle {
        id: -1,
        timepoint: 0,
    };

    pub fn is_armed(&self) -> bool {
        self.id >= 0
    }
}

struct TimerEntry {
    id: i64,
    cancelled: bool,
    callback: TimerCallback,
}

struct TimerSlot {
    entries: Vec<TimerEntry>,
}

/// Min-heap timer queue. Not thread safe - owned and driven by a single event
///  loop.
pub struct TimerQueue {
    precision_us: u64,
    /// heap of slot timepoints; the slot itself lives in `slots`
    heap: BinaryHeap<Reverse<u64>>,
    slots: FxHashMap<u64, TimerSlot>,
    next_id: i64,
}

impl TimerQueue {
    pub fn new(precision_us: u64) -> TimerQueue {
        TimerQueue {
            precision_us: precision_us.max(1),
            heap: BinaryHeap::new(),
            slots: FxHashMap::default(),
            next_id: 0,
        }
    }

    /// Schedule `callback` to run `delay_us` from `now_us`. The effective
    ///  timepoint is rounded down to the queue precision; timers rounding to the
    ///  same timepoint coalesce into one heap slot and fire in insertion order.
    pub fn insert(&mut self, now_us: u64, delay_us: u64, callback: TimerCallback) -> TimerHandle {
        let timepoint = (now_us.saturating_add(delay_us) / self.precision_us) * self.precision_us;

        let id = self.next_id;
        self.next_id += 1;

        let entry = TimerEntry {
            id,
            cancelled: false,
            callback,
        };
        if let Some(slot) = self.slots.get_mut(&timepoint) {
            slot.entries.push(entry);
        }
        else {
            self.slots.insert(timepoint, TimerSlot { entries: vec![entry] });
            self.heap.push(Reverse(timepoint));
        }

        TimerHandle { id, timepoint }
    }

    /// Mark the callback registered under `handle` as cancelled. Cancelling a
    ///  handle that never existed or whose slot already fired is a no-op, as is
    ///  cancelling twice.
    pub fn cancel(&mut self, handle: TimerHandle) {
        if !handle.is_armed() {
            return;
        }
        if let Some(slot) = self.slots.get_mut(&handle.timepoint) {
            if let Some(entry) = slot.entries.iter_mut().find(|e| e.id == handle.id) {
                entry.cancelled = true;
            }
        }
    }

    /// Fire all slots whose timepoint is `<= now_us`.
    ///
    /// Expired slots are detached from the queue before any callback runs, so a
    ///  callback scheduling new work never observes - or extends - the set of
    ///  slots fired in this pass: anything it inserts runs at the next `tick` at
    ///  the earliest.
    pub fn tick(&mut self, now_us: u64) {
        let mut expired = Vec::new();
        while let Some(&Reverse(timepoint)) = self.heap.peek() {
            if timepoint > now_us {
                break;
            }
            self.heap.pop();
            if let Some(slot) = self.slots.remove(&timepoint) {
                expired.push(slot);
            }
        }

        for slot in expired {
            for entry in slot.entries {
                if !entry.cancelled {
                    (entry.callback)();
                }
            }
        }
    }

    /// The earliest outstanding timepoint, or [`TIMEPOINT_NEVER`] if the queue is
    ///  empty. Event loops use this to bound their sleep.
    pub fn next_tick_timepoint(&self) -> u64 {
        self.heap
            .peek()
            .map(|&Reverse(timepoint)| timepoint)
            .unwrap_or(TIMEPOINT_NEVER)
    }
}
