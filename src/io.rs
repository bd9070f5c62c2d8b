//! The cooperative I/O surface: result codes and the stop token that external
//!  timeout orchestration uses to abandon a suspended operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Outcome of a cooperative read or write.
///
/// The fourth state of the protocol - *pending* - never surfaces here: inside
///  the engine it is `std::task::Poll::Pending`, and the public `awrite`/`aread`
///  stay suspended until one of these three outcomes is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoResult {
    /// completed; for reads the number of bytes placed in the buffer, for writes
    ///  the number of bytes accepted (always the whole buffer)
    Ok(usize),
    /// abandoned by the stop token; no partial data was consumed or delivered
    Timeout,
    /// the endpoint is unknown or closing; retrying will not help
    Failed,
}

struct ParamInner {
    stop: AtomicBool,
    notify: Notify,
}

/// Stop token threaded through `awrite`/`aread`. An external timeout scheduler
///  (or any other orchestrator) calls [`OpParam::stop`]; suspended operations
///  observe it at their next scheduling opportunity and return
///  [`IoResult::Timeout`].
#[derive(Clone)]
pub struct OpParam {
    inner: Arc<ParamInner>,
}

impl Default for OpParam {
    fn default() -> Self {
        Self::new()
    }
}

impl OpParam {
    pub fn new() -> OpParam {
        OpParam {
            inner: Arc::new(ParamInner {
                stop: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Convenience constructor: a token that stops itself after `delay`. Must be
    ///  called from within a tokio runtime.
    pub fn stop_after(delay: Duration) -> OpParam {
        let param = OpParam::new();
        let timed = param.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            timed.stop();
        });
        param
    }

    pub fn is_stop(&self) -> bool {
        self.inner.stop.load(Ordering::Acquire)
    }

    /// Latch the stop flag and wake every operation suspended on this token.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    /// Resolve once the token is stopped; pends forever on a token that never
    ///  stops.
    pub(crate) async fn stopped(&self) {
        loop {
            let mut notified = std::pin::pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            if self.is_stop() {
                return;
            }
            notified.await;
        }
    }
}
