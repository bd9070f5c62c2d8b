//! Per-connection endpoint state owned by the multiplexer's registry.

use crate::arq::Arq;
use crate::executor::ExecuteContext;
use crate::rudp::RudpConnection;
use crate::timer::TimerHandle;
use bytes::BytesMut;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Mutex;
use tokio::sync::Notify;

/// One endpoint per (remote address, channel) pair.
///
/// Three parties touch an endpoint: the ingress task (pushes raw datagrams and
///  bumps `last_alive_us`), jobs on the endpoint's pinned event loop (drain the
///  recv queue into the ARQ state, flush, re-arm the timer) and application
///  tasks suspended in `awrite`/`aread`. The `arq` mutex doubles as the
///  lifecycle lock: `None` means the ARQ state has been released and the
///  endpoint is on its way out of the registry.
pub(crate) struct RudpEndpoint {
    pub remote: SocketAddr,
    pub channel: i32,

    /// microseconds of inactivity after which the connection times out;
    ///  `u64::MAX` disables the check
    pub inactive_timeout_us: u64,
    /// timestamp (monotonic µs) of the most recent inbound datagram
    pub last_alive_us: AtomicU64,

    pub arq: Mutex<Option<Arq>>,
    /// inbound raw datagrams awaiting ARQ ingestion
    pub recv_queue: Mutex<VecDeque<BytesMut>>,

    /// true while a task is suspended in `awrite`/`aread` for this endpoint
    pub awaiting_io: AtomicBool,
    /// latched by the close protocol; never reverts
    pub closing: AtomicBool,

    /// the endpoint's pending timer; only the owning loop touches this
    pub timer: Mutex<TimerHandle>,

    pub econtext: ExecuteContext,
    /// woken whenever the endpoint makes progress (input drained, flush ran,
    ///  state released) - this is what resumes suspended I/O
    pub io_progress: Notify,
}

impl RudpEndpoint {
    pub fn connection(&self) -> RudpConnection {
        RudpConnection {
            address: self.remote,
            channel: self.channel,
        }
    }
}
