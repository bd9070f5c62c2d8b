//! Event loop hosting: each loop couples an [`ExecuteDispatcher`] with a
//!  loop-owned [`TimerQueue`] and drives both from a single tokio task.
//!
//! An [`EventContext`] owns a fixed set of loops. Endpoints are pinned to one
//!  loop at creation ([`EventContext::select_loop`]) and all their protocol work
//!  - recv-queue draining, ARQ updates, timer (re)armament - runs as dispatch
//!  jobs on that loop. The loops themselves are cooperative: a job runs to
//!  completion before the next one starts, so per-endpoint state never sees
//!  concurrent dispatch.

use crate::executor::{ExecuteDispatcher, QueuedResume};
use crate::timer::{current_time_us, TimerQueue, TIMEPOINT_NEVER};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// upper bound for the driver's sleep when no timer is outstanding
const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// The loop-owned mutable state, accessible only to jobs running in a dispatch
///  pass of the owning loop.
pub struct LoopCore {
    pub timers: TimerQueue,
}

impl LoopCore {
    #[cfg(test)]
    pub(crate) fn for_test() -> LoopCore {
        LoopCore {
            timers: TimerQueue::new(crate::timer::TIMER_MIN_PRECISION_US),
        }
    }
}

pub struct EventLoop {
    dispatcher: ExecuteDispatcher,
    wake: Notify,
    precision_us: u64,
}

impl EventLoop {
    pub fn new(precision_us: u64) -> Arc<EventLoop> {
        Arc::new(EventLoop {
            dispatcher: ExecuteDispatcher::default(),
            wake: Notify::new(),
            precision_us,
        })
    }

    pub fn dispatcher(&self) -> &ExecuteDispatcher {
        &self.dispatcher
    }

    /// Nudge the driver out of its sleep. Safe to call from any thread; the
    ///  wakeup permit is retained if the driver is not currently sleeping.
    pub fn wake_up(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn enqueue(&self, entry: QueuedResume) {
        self.dispatcher.add(entry);
        self.wake_up();
    }

    /// Driver: alternate dispatch passes and timer ticks, sleeping until the next
    ///  timer deadline (or a wakeup) in between. Runs until the task is aborted
    ///  by the owning [`EventContext`].
    async fn run(self: Arc<Self>) {
        let mut core = LoopCore {
            timers: TimerQueue::new(self.precision_us),
        };

        loop {
            self.dispatcher.dispatch(&mut core);
            core.timers.tick(current_time_us());

            if self.dispatcher.has_pending() {
                // timer callbacks enqueued work - run it before sleeping
                continue;
            }

            let next = core.timers.next_tick_timepoint();
            let sleep_for = if next == TIMEPOINT_NEVER {
                IDLE_SLEEP
            }
            else {
                Duration::from_micros(next.saturating_sub(current_time_us()))
            };

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }
}

struct ContextInner {
    loops: Vec<Arc<EventLoop>>,
    next_loop: AtomicUsize,
    drivers: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        for driver in self.drivers.lock().unwrap().drain(..) {
            driver.abort();
        }
    }
}

/// A set of event loops sharing the work of all endpoints of one or more
///  multiplexers. Cheap to clone; the loops stop when the last clone is dropped.
#[derive(Clone)]
pub struct EventContext {
    inner: Arc<ContextInner>,
}

impl EventContext {
    /// Create `num_loops` loops (at least one), each with its own driver task.
    ///  Must be called from within a tokio runtime.
    pub fn new(num_loops: usize) -> EventContext {
        Self::with_precision(num_loops, crate::timer::TIMER_MIN_PRECISION_US)
    }

    pub fn with_precision(num_loops: usize, timer_precision_us: u64) -> EventContext {
        let loops: Vec<Arc<EventLoop>> = (0..num_loops.max(1))
            .map(|_| EventLoop::new(timer_precision_us))
            .collect();

        let drivers = loops
            .iter()
            .map(|l| tokio::spawn(l.clone().run()))
            .collect();

        EventContext {
            inner: Arc::new(ContextInner {
                loops,
                next_loop: AtomicUsize::new(0),
                drivers: Mutex::new(drivers),
            }),
        }
    }

    /// Pick the loop for a newly created endpoint (round robin).
    pub fn select_loop(&self) -> Arc<EventLoop> {
        let idx = self.inner.next_loop.fetch_add(1, Ordering::Relaxed);
        self.inner.loops[idx % self.inner.loops.len()].clone()
    }
}
