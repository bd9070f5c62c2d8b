//! Cooperative executor: a FIFO of pending endpoint resumptions, drained on the
//!  owning event loop.
//!
//! Every endpoint owns an [`ExecuteContext`] pinned to one loop. Code anywhere in
//!  the process requests "resume this endpoint's work" via [`ExecuteContext::start`]
//!  (run the context's default resume action) or [`ExecuteContext::start_with`]
//!  (run a one-shot job instead). The requests execute during the loop driver's
//!  next dispatch pass, with mutable access to the loop-owned state
//!  ([`LoopCore`], which holds the timer queue) - this is the only way timers are
//!  manipulated, keeping the timer queue free of cross-thread access.

use crate::event_loop::{EventLoop, LoopCore};
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub type ResumeFn = Arc<dyn Fn(&mut LoopCore) + Send + Sync>;
pub type LoopJob = Box<dyn FnOnce(&mut LoopCore) + Send>;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(0);

/// The cooperative task state of one endpoint: its identity in the cancel set,
///  the loop it is pinned to, and its default resume action.
pub struct ExecuteContext {
    id: u64,
    event_loop: Arc<EventLoop>,
    resume: ResumeFn,
}

impl ExecuteContext {
    pub fn new(event_loop: Arc<EventLoop>, resume: ResumeFn) -> ExecuteContext {
        ExecuteContext {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            event_loop,
            resume,
        }
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// Enqueue the default resume action on the owning loop.
    pub fn start(&self) {
        self.event_loop.enqueue(QueuedResume {
            ctx_id: self.id,
            resume: self.resume.clone(),
            job: None,
        });
    }

    /// Enqueue `job` on the owning loop; it runs *instead of* the default resume
    ///  action, once.
    pub fn start_with(&self, job: LoopJob) {
        self.event_loop.enqueue(QueuedResume {
            ctx_id: self.id,
            resume: self.resume.clone(),
            job: Some(job),
        });
    }

    /// Drop this context's already-enqueued resumptions during the next dispatch
    ///  pass. Entries enqueued after that pass run normally.
    pub fn cancel(&self) {
        self.event_loop.dispatcher().cancel(self.id);
    }
}

pub(crate) struct QueuedResume {
    ctx_id: u64,
    resume: ResumeFn,
    job: Option<LoopJob>,
}

/// Per-loop queue of pending resumptions plus the cancel set for the current
///  dispatch pass.
pub struct ExecuteDispatcher {
    queue: Mutex<VecDeque<QueuedResume>>,
    cancelled: Mutex<FxHashSet<u64>>,
}

impl Default for ExecuteDispatcher {
    fn default() -> Self {
        ExecuteDispatcher {
            queue: Mutex::new(VecDeque::new()),
            cancelled: Mutex::new(FxHashSet::default()),
        }
    }
}

impl ExecuteDispatcher {
    pub(crate) fn add(&self, entry: QueuedResume) {
        self.queue.lock().unwrap().push_back(entry);
    }

    pub fn cancel(&self, ctx_id: u64) {
        self.cancelled.lock().unwrap().insert(ctx_id);
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.lock().unwrap().is_empty()
    }

    /// Drain the entries that are enqueued *now*, in FIFO order. Entries whose
    ///  context is in the cancel set are dropped; the cancel set is cleared when
    ///  the pass ends. Enqueues made by a running resumption land in the queue
    ///  again and are deferred to the next pass.
    pub fn dispatch(&self, core: &mut LoopCore) {
        let pass: Vec<QueuedResume> = self.queue.lock().unwrap().drain(..).collect();

        for entry in pass {
            if self.cancelled.lock().unwrap().contains(&entry.ctx_id) {
                continue;
            }
            match entry.job {
                Some(job) => job(core),
                None => (entry.resume)(core),
            }
        }

        self.cancelled.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::TIMER_MIN_PRECISION_US;
    use std::sync::OnceLock;

    fn test_loop() -> Arc<EventLoop> {
        EventLoop::new(TIMER_MIN_PRECISION_US)
    }

    fn tagging_ctx(event_loop: &Arc<EventLoop>, log: &Arc<Mutex<Vec<u32>>>, tag: u32) -> ExecuteContext {
        let log = log.clone();
        ExecuteContext::new(
            event_loop.clone(),
            Arc::new(move |_core: &mut LoopCore| log.lock().unwrap().push(tag)),
        )
    }

    #[test]
    fn test_dispatch_runs_in_fifo_order() {
        let event_loop = test_loop();
        let log = Arc::new(Mutex::new(Vec::new()));

        let a = tagging_ctx(&event_loop, &log, 1);
        let b = tagging_ctx(&event_loop, &log, 2);

        a.start();
        b.start();
        a.start();
        event_loop.dispatcher().dispatch(&mut LoopCore::for_test());

        assert_eq!(*log.lock().unwrap(), vec![1, 2, 1]);
    }

    #[test]
    fn test_start_with_overrides_default_resume() {
        let event_loop = test_loop();
        let log = Arc::new(Mutex::new(Vec::new()));

        let ctx = tagging_ctx(&event_loop, &log, 1);
        let job_log = log.clone();
        ctx.start_with(Box::new(move |_| job_log.lock().unwrap().push(99)));
        event_loop.dispatcher().dispatch(&mut LoopCore::for_test());

        assert_eq!(*log.lock().unwrap(), vec![99]);
    }

    #[test]
    fn test_cancel_applies_to_the_current_pass_only() {
        let event_loop = test_loop();
        let log = Arc::new(Mutex::new(Vec::new()));

        let ctx = tagging_ctx(&event_loop, &log, 1);
        ctx.start();
        ctx.cancel();
        event_loop.dispatcher().dispatch(&mut LoopCore::for_test());
        assert!(log.lock().unwrap().is_empty());

        // the cancel set was cleared with the pass - a fresh enqueue runs
        ctx.start();
        event_loop.dispatcher().dispatch(&mut LoopCore::for_test());
        assert_eq!(*log.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_reentrant_enqueue_is_deferred_to_the_next_pass() {
        let event_loop = test_loop();
        let counter = Arc::new(Mutex::new(0u32));

        let ctx_cell: Arc<OnceLock<ExecuteContext>> = Arc::new(OnceLock::new());
        let resume = {
            let counter = counter.clone();
            let ctx_cell = ctx_cell.clone();
            Arc::new(move |_: &mut LoopCore| {
                *counter.lock().unwrap() += 1;
                // re-enqueue ourselves - must not run again within this pass
                ctx_cell.get().unwrap().start();
            })
        };
        let _ = ctx_cell.set(ExecuteContext::new(event_loop.clone(), resume));

        ctx_cell.get().unwrap().start();
        event_loop.dispatcher().dispatch(&mut LoopCore::for_test());
        assert_eq!(*counter.lock().unwrap(), 1);

        event_loop.dispatcher().dispatch(&mut LoopCore::for_test());
        assert_eq!(*counter.lock().unwrap(), 2);
    }
}
