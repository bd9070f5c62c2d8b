//! The RUDP multiplexer: one UDP socket, many reliable connections.
//!
//! Incoming datagrams are demultiplexed by (source address, channel id) to
//!  endpoints; each endpoint is pinned to one event loop where all its protocol
//!  work runs. The multiplexer owns the endpoint registry and the lifecycle
//!  callbacks, and exposes the cooperative `awrite`/`aread` surface.

use crate::arq::{Arq, ArqMode, SendError};
use crate::config::RudpConfig;
use crate::endpoint::RudpEndpoint;
use crate::event_loop::{EventContext, LoopCore};
use crate::executor::{ExecuteContext, ResumeFn};
use crate::io::{IoResult, OpParam};
use crate::socket::{bind_udp, DatagramSocket};
use crate::timer::{current_time_us, TimerHandle};
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::task::Poll;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;

/// a timer this close to the wanted timepoint is left alone instead of being
///  cancelled and re-inserted
const TIMER_SLACK_US: u64 = 5_000;

/// Identity of one reliable connection: remote address plus the channel id
///  embedded in every datagram of the conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RudpConnection {
    pub address: SocketAddr,
    pub channel: i32,
}

type ConnectionFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type NewConnectionHandler = Arc<dyn Fn(Rudp, RudpConnection) -> ConnectionFuture + Send + Sync>;
type ConnectionCoroutine = Box<dyn FnOnce(Rudp, RudpConnection) -> ConnectionFuture + Send>;
type UnknownHandler = Arc<dyn Fn(SocketAddr) -> bool + Send + Sync>;
type TimeoutHandler = Arc<dyn Fn(RudpConnection) + Send + Sync>;

fn duration_to_us(duration: Duration) -> u64 {
    duration.as_micros().min(u64::MAX as u128) as u64
}

pub(crate) struct RudpShared {
    config: Arc<RudpConfig>,
    /// subtracted before handing times to the ARQ core, which works with 32-bit
    ///  millisecond timestamps
    base_time_us: u64,

    registry: RwLock<FxHashMap<SocketAddr, FxHashMap<i32, Arc<RudpEndpoint>>>>,

    socket: RwLock<Option<Arc<dyn DatagramSocket>>>,
    context: RwLock<Option<EventContext>>,
    ingress: Mutex<Option<JoinHandle<()>>>,

    new_connection_handler: RwLock<Option<NewConnectionHandler>>,
    unknown_handler: RwLock<Option<UnknownHandler>>,
    timeout_handler: RwLock<Option<TimeoutHandler>>,

    weak_self: Weak<RudpShared>,
}

/// The multiplexer handle. Cheap to clone; all clones share the same socket and
///  endpoint registry.
#[derive(Clone)]
pub struct Rudp {
    shared: Arc<RudpShared>,
}

impl Rudp {
    pub fn new(config: RudpConfig) -> anyhow::Result<Rudp> {
        config.validate()?;
        let shared = Arc::new_cyclic(|weak| RudpShared {
            config: Arc::new(config),
            base_time_us: current_time_us(),
            registry: RwLock::new(FxHashMap::default()),
            socket: RwLock::new(None),
            context: RwLock::new(None),
            ingress: Mutex::new(None),
            new_connection_handler: RwLock::new(None),
            unknown_handler: RwLock::new(None),
            timeout_handler: RwLock::new(None),
            weak_self: weak.clone(),
        });
        Ok(Rudp { shared })
    }

    /// Bind to an ephemeral port on all interfaces.
    pub fn bind(&self, context: &EventContext) -> anyhow::Result<()> {
        self.bind_addr(context, "0.0.0.0:0".parse().expect("valid literal"), false)
    }

    pub fn bind_addr(&self, context: &EventContext, addr: SocketAddr, reuse_addr: bool) -> anyhow::Result<()> {
        let socket = bind_udp(addr, reuse_addr)?;
        self.bind_socket(context, Arc::new(socket))
    }

    /// Bind on an externally provided socket - this is how tests and simulators
    ///  interpose loss or latency between two multiplexers.
    pub fn bind_socket(&self, context: &EventContext, socket: Arc<dyn DatagramSocket>) -> anyhow::Result<()> {
        {
            let mut slot = self.shared.socket.write().unwrap();
            if slot.is_some() {
                anyhow::bail!("rudp instance is already bound");
            }
            *slot = Some(socket.clone());
        }
        *self.shared.context.write().unwrap() = Some(context.clone());

        info!("bound rudp socket to {:?}", socket.local_addr().ok());

        let ingress = tokio::spawn(RudpShared::ingress_loop(self.shared.clone(), socket));
        *self.shared.ingress.lock().unwrap() = Some(ingress);
        Ok(())
    }

    pub fn is_bind(&self) -> bool {
        self.shared.socket.read().unwrap().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared
            .socket
            .read()
            .unwrap()
            .as_ref()
            .and_then(|s| s.local_addr().ok())
    }

    /// Release every endpoint (without draining send buffers), stop the ingress
    ///  loop and drop the socket. Calling `close` again is a no-op.
    pub async fn close(&self) {
        if !self.is_bind() {
            return;
        }
        self.close_all_remote().await;

        if let Some(ingress) = self.shared.ingress.lock().unwrap().take() {
            ingress.abort();
        }
        *self.shared.socket.write().unwrap() = None;
        *self.shared.context.write().unwrap() = None;
        info!("rudp socket closed");
    }

    /// Release all endpoints but keep the socket bound.
    pub async fn close_all_remote(&self) {
        self.shared.close_all_peer().await;
    }

    /// Register a connection to a remote peer. The multiplexer's
    ///  `on_new_connection` handler (if any) runs as the endpoint's coroutine;
    ///  when it returns, the connection is removed again.
    ///
    /// Adding an already-registered connection is a no-op.
    pub fn add_connection(&self, addr: SocketAddr, channel: i32, inactive_timeout: Duration) {
        self.shared.add_connection(addr, channel, inactive_timeout, None);
    }

    /// Like [`Rudp::add_connection`], but with a dedicated coroutine for this
    ///  connection instead of the shared `on_new_connection` handler.
    pub fn add_connection_with<F, Fut>(&self, addr: SocketAddr, channel: i32, inactive_timeout: Duration, coroutine: F)
    where
        F: FnOnce(Rudp, RudpConnection) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let coroutine: ConnectionCoroutine = Box::new(move |rudp, conn| Box::pin(coroutine(rudp, conn)));
        self.shared.add_connection(addr, channel, inactive_timeout, Some(coroutine));
    }

    /// Gracefully close a connection: retransmission continues until the send
    ///  buffer is drained (or the peer is considered dead), then the endpoint is
    ///  released and removed from the registry.
    pub async fn remove_connection(&self, conn: RudpConnection) {
        self.remove_connection_addr(conn.address, conn.channel).await;
    }

    pub async fn remove_connection_addr(&self, addr: SocketAddr, channel: i32) {
        let Some(endpoint) = self.shared.find(addr, channel) else {
            return;
        };
        self.shared.aclose_connection(endpoint, false).await;
    }

    /// true iff the connection exists and its send buffer is fully acknowledged
    ///  - i.e. `remove_connection` would return without waiting. Unknown
    ///  connections report `false`.
    pub fn removeable(&self, addr: SocketAddr, channel: i32) -> bool {
        match self.shared.find(addr, channel) {
            Some(endpoint) => endpoint
                .arq
                .lock()
                .unwrap()
                .as_ref()
                .map(|arq| arq.waitsnd() == 0)
                .unwrap_or(false),
            None => false,
        }
    }

    /// Apply a tuning preset: 0 fast, 1 balanced, anything else normal.
    pub fn config(&self, conn: RudpConnection, level: u8) {
        let Some(endpoint) = self.shared.find(conn.address, conn.channel) else {
            return;
        };
        let mut guard = endpoint.arq.lock().unwrap();
        if let Some(arq) = guard.as_mut() {
            arq.set_mode(ArqMode::from_level(level));
        }
    }

    pub fn set_wndsize(&self, addr: SocketAddr, channel: i32, snd: u32, rcv: u32) {
        let Some(endpoint) = self.shared.find(addr, channel) else {
            return;
        };
        let mut guard = endpoint.arq.lock().unwrap();
        if let Some(arq) = guard.as_mut() {
            arq.set_wndsize(snd, rcv);
        }
    }

    /// Handler run as the coroutine of connections added without a dedicated
    ///  one (including connections registered from the unknown-packet handler).
    pub fn on_new_connection<F, Fut>(&self, handler: F) -> &Self
    where
        F: Fn(Rudp, RudpConnection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: NewConnectionHandler = Arc::new(move |rudp, conn| Box::pin(handler(rudp, conn)));
        *self.shared.new_connection_handler.write().unwrap() = Some(wrapped);
        self
    }

    /// Handler invoked on the ingress task when a datagram arrives from an
    ///  unregistered (address, channel). Returning `true` makes the multiplexer
    ///  re-check the registry - the handler is allowed to call
    ///  [`Rudp::add_connection`] synchronously; returning `false` discards the
    ///  datagram.
    pub fn on_unknown_packet(&self, handler: impl Fn(SocketAddr) -> bool + Send + Sync + 'static) -> &Self {
        *self.shared.unknown_handler.write().unwrap() = Some(Arc::new(handler));
        self
    }

    /// Handler invoked when a connection exceeded its inactivity timeout or its
    ///  peer stopped acknowledging retransmissions; the endpoint is fast-closed
    ///  before the handler runs.
    pub fn on_connection_timeout(&self, handler: impl Fn(RudpConnection) + Send + Sync + 'static) -> &Self {
        *self.shared.timeout_handler.write().unwrap() = Some(Arc::new(handler));
        self
    }

    /// Schedule `f` on the endpoint's event loop, serialized with its protocol
    ///  work. A no-op for unknown connections.
    pub fn run_at(&self, conn: RudpConnection, f: impl FnOnce() + Send + 'static) {
        let Some(endpoint) = self.shared.find(conn.address, conn.channel) else {
            return;
        };
        endpoint.econtext.start_with(Box::new(move |_core| f()));
    }

    /// Cooperative write: returns `Ok` once the whole buffer is accepted into
    ///  the send queue, suspends while the queue is full, observes `param`.
    pub async fn awrite(&self, param: &OpParam, conn: RudpConnection, buf: &[u8]) -> IoResult {
        debug_assert!(buf.len() <= i32::MAX as usize);
        loop {
            let Some(endpoint) = self.shared.find(conn.address, conn.channel) else {
                return IoResult::Failed;
            };
            let mut progressed = std::pin::pin!(endpoint.io_progress.notified());
            progressed.as_mut().enable();

            match self.shared.poll_awrite(param, &endpoint, buf) {
                Poll::Ready(result) => return result,
                Poll::Pending => {
                    tokio::select! {
                        _ = &mut progressed => {}
                        _ = param.stopped() => {}
                    }
                }
            }
        }
    }

    /// Cooperative read: returns `Ok(n)` as soon as any in-order bytes are
    ///  available, suspends while there are none, observes `param`.
    pub async fn aread(&self, param: &OpParam, conn: RudpConnection, buf: &mut [u8]) -> IoResult {
        loop {
            let Some(endpoint) = self.shared.find(conn.address, conn.channel) else {
                return IoResult::Failed;
            };
            let mut progressed = std::pin::pin!(endpoint.io_progress.notified());
            progressed.as_mut().enable();

            match self.shared.poll_aread(param, &endpoint, buf) {
                Poll::Ready(result) => return result,
                Poll::Pending => {
                    tokio::select! {
                        _ = &mut progressed => {}
                        _ = param.stopped() => {}
                    }
                }
            }
        }
    }
}

impl RudpShared {
    fn arq_now_ms(&self) -> u32 {
        ((current_time_us() - self.base_time_us) / 1_000) as u32
    }

    /// Look up a live endpoint. Endpoints whose ARQ state is already released
    ///  are invisible - this is what makes lookups fail immediately after a
    ///  close, even while the `Arc` is still referenced elsewhere.
    fn find(&self, addr: SocketAddr, channel: i32) -> Option<Arc<RudpEndpoint>> {
        let registry = self.registry.read().unwrap();
        let endpoint = registry.get(&addr)?.get(&channel)?;
        if endpoint.arq.lock().unwrap().is_some() {
            Some(endpoint.clone())
        }
        else {
            None
        }
    }

    fn unregister(&self, endpoint: &Arc<RudpEndpoint>) {
        let mut registry = self.registry.write().unwrap();
        if let Some(channels) = registry.get_mut(&endpoint.remote) {
            if let Some(current) = channels.get(&endpoint.channel) {
                if Arc::ptr_eq(current, endpoint) {
                    channels.remove(&endpoint.channel);
                }
            }
            if channels.is_empty() {
                registry.remove(&endpoint.remote);
            }
        }
    }

    fn add_connection(
        &self,
        addr: SocketAddr,
        channel: i32,
        inactive_timeout: Duration,
        coroutine: Option<ConnectionCoroutine>,
    ) {
        if self.find(addr, channel).is_some() {
            return;
        }
        let Some(strong_self) = self.weak_self.upgrade() else {
            return;
        };
        let Some(context) = self.context.read().unwrap().clone() else {
            warn!("add_connection({:?}, {}) called on an unbound rudp instance - ignoring", addr, channel);
            return;
        };

        let event_loop = context.select_loop();
        let config = self.config.clone();
        let weak_shared = self.weak_self.clone();

        let endpoint = Arc::new_cyclic(|weak_endpoint: &Weak<RudpEndpoint>| {
            let resume_shared = weak_shared.clone();
            let resume_endpoint = weak_endpoint.clone();
            let resume: ResumeFn = Arc::new(move |core: &mut LoopCore| {
                if let (Some(shared), Some(endpoint)) = (resume_shared.upgrade(), resume_endpoint.upgrade()) {
                    shared.resume_endpoint(&endpoint, core);
                }
            });

            let mut arq = Arq::new(channel as u32, config.payload_size_inside_udp, config.send_backlog);
            arq.set_wndsize(config.send_window, config.recv_window);
            arq.set_mode(ArqMode::from_level(config.default_mode_level));

            RudpEndpoint {
                remote: addr,
                channel,
                inactive_timeout_us: duration_to_us(inactive_timeout),
                last_alive_us: AtomicU64::new(current_time_us()),
                arq: Mutex::new(Some(arq)),
                recv_queue: Mutex::new(VecDeque::new()),
                awaiting_io: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                timer: Mutex::new(TimerHandle::NONE),
                econtext: ExecuteContext::new(event_loop, resume),
                io_progress: Notify::new(),
            }
        });

        self.registry
            .write()
            .unwrap()
            .entry(addr)
            .or_default()
            .insert(channel, endpoint.clone());

        debug!("added connection {:?} channel {}", addr, channel);

        // arm the first timer - liveness is checked on endpoint ticks, so an
        //  endpoint the application never touches must still tick
        endpoint.econtext.start();

        let conn = RudpConnection { address: addr, channel };
        let rudp = Rudp { shared: strong_self };

        if let Some(coroutine) = coroutine {
            tokio::spawn(async move {
                coroutine(rudp.clone(), conn).await;
                rudp.remove_connection(conn).await;
            });
        }
        else {
            let handler = self.new_connection_handler.read().unwrap().clone();
            match handler {
                Some(handler) => {
                    let fut = handler(rudp.clone(), conn);
                    tokio::spawn(async move {
                        fut.await;
                        rudp.remove_connection(conn).await;
                    });
                }
                None => {
                    // nothing will ever drive this endpoint - close it again
                    tokio::spawn(async move { rudp.remove_connection(conn).await });
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // ingress
    // ------------------------------------------------------------------------

    async fn ingress_loop(shared: Arc<RudpShared>, socket: Arc<dyn DatagramSocket>) {
        info!("starting rudp ingress loop");

        let mut buf = vec![0u8; shared.config.payload_size_inside_udp];
        loop {
            let (len, from) = match socket.recv_datagram(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let ingress_span = span!(Level::TRACE, "rudp_ingress", ?correlation_id);
            let _entered = ingress_span.enter();

            trace!("received {} bytes from {:?}", len, from);

            let Some(conv) = Arq::conv_of(&buf[..len]) else {
                debug!("datagram from {:?} too short for a segment header - dropping", from);
                continue;
            };

            let Some(endpoint) = shared.admit(from, conv as i32) else {
                continue;
            };

            endpoint.last_alive_us.store(current_time_us(), Ordering::Relaxed);
            endpoint
                .recv_queue
                .lock()
                .unwrap()
                .push_back(BytesMut::from(&buf[..len]));
            endpoint.econtext.start();
        }
    }

    /// Resolve the target endpoint of an incoming datagram, giving the
    ///  unknown-packet handler a chance to register it on the fly.
    fn admit(&self, from: SocketAddr, channel: i32) -> Option<Arc<RudpEndpoint>> {
        if let Some(endpoint) = self.find(from, channel) {
            return Some(endpoint);
        }

        let handler = self.unknown_handler.read().unwrap().clone();
        let Some(handler) = handler else {
            debug!("datagram from unregistered {:?} channel {} and no unknown-packet handler - dropping", from, channel);
            return None;
        };
        if !handler(from) {
            debug!("unknown-packet handler declined {:?} - dropping", from);
            return None;
        }

        // the handler may have registered the endpoint synchronously
        let endpoint = self.find(from, channel);
        if endpoint.is_none() {
            debug!("unknown-packet handler accepted {:?} but did not register channel {} - dropping", from, channel);
        }
        endpoint
    }

    // ------------------------------------------------------------------------
    // endpoint driving (runs as executor jobs on the endpoint's loop)
    // ------------------------------------------------------------------------

    /// Default resume: triggered by ingress or by an application read/write.
    fn resume_endpoint(&self, endpoint: &Arc<RudpEndpoint>, core: &mut LoopCore) {
        if self.check_liveness(endpoint, core) {
            return;
        }
        let ingested = self.update_endpoint(endpoint);
        self.arm_timer(endpoint, core);
        if ingested > 0 {
            self.wake_io(endpoint);
        }
    }

    /// Timer-driven update: like the default resume, plus the periodic ARQ
    ///  update (retransmissions, acks, probes).
    fn tick_endpoint(&self, endpoint: &Arc<RudpEndpoint>, core: &mut LoopCore) {
        if self.check_liveness(endpoint, core) {
            return;
        }
        let backlog_before = match endpoint.arq.lock().unwrap().as_ref() {
            Some(arq) => arq.send_queue_len(),
            None => return,
        };

        let ingested = self.update_endpoint(endpoint);
        let backlog_after = {
            let mut guard = endpoint.arq.lock().unwrap();
            match guard.as_mut() {
                Some(arq) => {
                    arq.update(self.arq_now_ms());
                    arq.send_queue_len()
                }
                None => return,
            }
        };
        self.flush_outbox(endpoint);
        self.arm_timer(endpoint, core);

        // only actual progress wakes suspended I/O - an unconditional wake
        //  would spin a pending reader through fruitless retries
        if ingested > 0 || backlog_after < backlog_before {
            self.wake_io(endpoint);
        }
    }

    /// Drain the raw datagram queue into the ARQ state, returning the number of
    ///  ingested datagrams. A datagram that fails to decode stays at the front
    ///  and stops the drain; the next tick retries.
    ///
    /// The whole drain holds the ARQ lock: both the loop driver and a reader
    ///  suspended in `aread` may drain, and interleaving them datagram-by-
    ///  datagram would break the per-endpoint ingest order.
    fn update_endpoint(&self, endpoint: &Arc<RudpEndpoint>) -> usize {
        let mut ingested = 0;
        {
            let mut guard = endpoint.arq.lock().unwrap();
            let Some(arq) = guard.as_mut() else {
                return 0;
            };
            loop {
                let Some(datagram) = endpoint.recv_queue.lock().unwrap().pop_front() else {
                    break;
                };
                match arq.input(&datagram) {
                    Ok(()) => ingested += 1,
                    Err(e) => {
                        debug!(
                            "undecodable datagram from {:?} channel {}: {:?} - retrying next tick",
                            endpoint.remote, endpoint.channel, e
                        );
                        endpoint.recv_queue.lock().unwrap().push_front(datagram);
                        break;
                    }
                }
            }
        }
        self.flush_outbox(endpoint);
        ingested
    }

    fn flush_outbox(&self, endpoint: &Arc<RudpEndpoint>) {
        let datagrams = {
            let mut guard = endpoint.arq.lock().unwrap();
            match guard.as_mut() {
                Some(arq) => arq.take_outbox(),
                None => return,
            }
        };
        if datagrams.is_empty() {
            return;
        }
        let Some(socket) = self.socket.read().unwrap().clone() else {
            return;
        };
        for datagram in datagrams {
            socket.send_datagram(&datagram, endpoint.remote);
        }
    }

    /// (Re-)arm the endpoint timer from `arq.check`. If the wanted timepoint is
    ///  within the slack of the already-armed timer, the existing one is kept.
    fn arm_timer(&self, endpoint: &Arc<RudpEndpoint>, core: &mut LoopCore) {
        let now_us = current_time_us();
        let now_ms = self.arq_now_ms();
        let next_ms = {
            let guard = endpoint.arq.lock().unwrap();
            match guard.as_ref() {
                Some(arq) => arq.check(now_ms),
                None => return,
            }
        };
        let delta_ms = next_ms.wrapping_sub(now_ms) as i32;
        let delta_us = if delta_ms <= 0 { 0 } else { delta_ms as u64 * 1_000 };
        let target = now_us + delta_us;

        let mut timer = endpoint.timer.lock().unwrap();
        if timer.is_armed() && timer.timepoint.abs_diff(target) <= TIMER_SLACK_US {
            return;
        }
        if timer.is_armed() {
            core.timers.cancel(*timer);
        }

        let weak_shared = self.weak_self.clone();
        let weak_endpoint = Arc::downgrade(endpoint);
        *timer = core.timers.insert(
            now_us,
            delta_us,
            Box::new(move || {
                let (Some(shared), Some(endpoint)) = (weak_shared.upgrade(), weak_endpoint.upgrade()) else {
                    return;
                };
                // this slot just fired - it must not suppress re-arming
                *endpoint.timer.lock().unwrap() = TimerHandle::NONE;

                let job_shared = shared.clone();
                let job_endpoint = endpoint.clone();
                endpoint
                    .econtext
                    .start_with(Box::new(move |core| job_shared.tick_endpoint(&job_endpoint, core)));
            }),
        );
    }

    fn wake_io(&self, endpoint: &Arc<RudpEndpoint>) {
        if endpoint.awaiting_io.load(Ordering::Relaxed) {
            endpoint.io_progress.notify_waiters();
        }
    }

    /// Opportunistic liveness check, run on every endpoint tick: a connection
    ///  that saw no inbound datagram within its inactivity timeout - or whose
    ///  peer stopped acknowledging retransmissions - is fast-closed and reported
    ///  through the timeout handler. Returns true if the endpoint is gone.
    fn check_liveness(&self, endpoint: &Arc<RudpEndpoint>, core: &mut LoopCore) -> bool {
        if endpoint.closing.load(Ordering::SeqCst) {
            // the close protocol owns the endpoint now
            return endpoint.arq.lock().unwrap().is_none();
        }

        let dead_link = match endpoint.arq.lock().unwrap().as_ref() {
            Some(arq) => arq.is_dead_link(),
            None => return true,
        };
        let idle_us = current_time_us().saturating_sub(endpoint.last_alive_us.load(Ordering::Relaxed));

        if !dead_link && idle_us <= endpoint.inactive_timeout_us {
            return false;
        }

        endpoint.closing.store(true, Ordering::SeqCst);
        info!(
            "connection {:?} channel {} timed out (idle {} ms, dead link: {}) - closing",
            endpoint.remote,
            endpoint.channel,
            idle_us / 1_000,
            dead_link
        );
        self.release_endpoint(endpoint, core);

        let handler = self.timeout_handler.read().unwrap().clone();
        if let Some(handler) = handler {
            handler(endpoint.connection());
        }
        true
    }

    /// Release the ARQ state, cancel the timer and remove the endpoint from the
    ///  registry. Must run on the endpoint's loop, which serializes it against
    ///  in-flight timer callbacks.
    fn release_endpoint(&self, endpoint: &Arc<RudpEndpoint>, core: &mut LoopCore) {
        endpoint.closing.store(true, Ordering::SeqCst);

        // acknowledgements may still be waiting for the next flush cadence;
        //  losing them would leave the peer retransmitting into the void
        {
            let mut guard = endpoint.arq.lock().unwrap();
            if let Some(arq) = guard.as_mut() {
                arq.flush_now();
            }
        }
        self.flush_outbox(endpoint);

        let released = endpoint.arq.lock().unwrap().take();

        {
            let mut timer = endpoint.timer.lock().unwrap();
            if timer.is_armed() {
                core.timers.cancel(*timer);
                *timer = TimerHandle::NONE;
            }
        }

        if released.is_some() {
            self.unregister(endpoint);
            debug!("released endpoint {:?} channel {}", endpoint.remote, endpoint.channel);
        }

        endpoint.econtext.cancel();
        endpoint.io_progress.notify_waiters();
    }

    /// The close protocol. Graceful close keeps the endpoint ticking until the
    ///  send buffer is acknowledged; fast close releases immediately. Both
    ///  perform the actual release on the endpoint's own loop and wait for it.
    async fn aclose_connection(&self, endpoint: Arc<RudpEndpoint>, fast_close: bool) {
        if endpoint.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(shared) = self.weak_self.upgrade() else {
            return;
        };

        if !fast_close {
            loop {
                let (waitsnd, dead_link) = {
                    let guard = endpoint.arq.lock().unwrap();
                    match guard.as_ref() {
                        Some(arq) => (arq.waitsnd(), arq.is_dead_link()),
                        None => break,
                    }
                };
                if waitsnd == 0 || dead_link {
                    break;
                }
                if self.socket.read().unwrap().is_none() {
                    // socket gone - nothing can be flushed anymore
                    break;
                }

                // keep flushing while we wait for the peer's acks
                let tick_shared = shared.clone();
                let tick_endpoint = endpoint.clone();
                endpoint
                    .econtext
                    .start_with(Box::new(move |core| tick_shared.tick_endpoint(&tick_endpoint, core)));

                tokio::select! {
                    _ = endpoint.io_progress.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                }
            }
        }

        let (released_tx, released_rx) = oneshot::channel::<()>();
        let release_endpoint = endpoint.clone();
        endpoint.econtext.start_with(Box::new(move |core| {
            shared.release_endpoint(&release_endpoint, core);
            let _ = released_tx.send(());
        }));
        let _ = released_rx.await;
    }

    async fn close_all_peer(&self) {
        let endpoints: Vec<Arc<RudpEndpoint>> = {
            let registry = self.registry.read().unwrap();
            registry
                .values()
                .flat_map(|channels| channels.values().cloned())
                .collect()
        };

        // don't wait for send buffers
        for endpoint in endpoints {
            self.aclose_connection(endpoint, true).await;
        }
    }

    // ------------------------------------------------------------------------
    // cooperative I/O steps
    // ------------------------------------------------------------------------

    fn schedule_tick(&self, endpoint: &Arc<RudpEndpoint>) {
        let Some(shared) = self.weak_self.upgrade() else {
            return;
        };
        let endpoint2 = endpoint.clone();
        endpoint
            .econtext
            .start_with(Box::new(move |core| shared.tick_endpoint(&endpoint2, core)));
    }

    fn poll_awrite(&self, param: &OpParam, endpoint: &Arc<RudpEndpoint>, buf: &[u8]) -> Poll<IoResult> {
        if endpoint.closing.load(Ordering::SeqCst) {
            endpoint.awaiting_io.store(false, Ordering::Relaxed);
            return Poll::Ready(IoResult::Failed);
        }
        if param.is_stop() {
            endpoint.awaiting_io.store(false, Ordering::Relaxed);
            return Poll::Ready(IoResult::Timeout);
        }

        let result = {
            let mut guard = endpoint.arq.lock().unwrap();
            match guard.as_mut() {
                Some(arq) => arq.send(buf),
                None => {
                    endpoint.awaiting_io.store(false, Ordering::Relaxed);
                    return Poll::Ready(IoResult::Failed);
                }
            }
        };

        match result {
            Ok(()) => {
                endpoint.awaiting_io.store(false, Ordering::Relaxed);
                self.schedule_tick(endpoint);
                Poll::Ready(IoResult::Ok(buf.len()))
            }
            Err(SendError::WindowFull) => {
                endpoint.awaiting_io.store(true, Ordering::Relaxed);
                Poll::Pending
            }
            Err(SendError::Oversized) => {
                debug_assert!(false, "oversized write of {} bytes", buf.len());
                endpoint.awaiting_io.store(false, Ordering::Relaxed);
                Poll::Ready(IoResult::Failed)
            }
        }
    }

    fn poll_aread(&self, param: &OpParam, endpoint: &Arc<RudpEndpoint>, buf: &mut [u8]) -> Poll<IoResult> {
        if endpoint.closing.load(Ordering::SeqCst) {
            endpoint.awaiting_io.store(false, Ordering::Relaxed);
            return Poll::Ready(IoResult::Failed);
        }

        endpoint.awaiting_io.store(true, Ordering::Relaxed);
        self.update_endpoint(endpoint);

        if param.is_stop() {
            endpoint.awaiting_io.store(false, Ordering::Relaxed);
            return Poll::Ready(IoResult::Timeout);
        }

        let received = {
            let mut guard = endpoint.arq.lock().unwrap();
            match guard.as_mut() {
                Some(arq) => arq.recv(buf),
                None => {
                    endpoint.awaiting_io.store(false, Ordering::Relaxed);
                    return Poll::Ready(IoResult::Failed);
                }
            }
        };
        self.schedule_tick(endpoint);

        match received {
            Some(n) => {
                endpoint.awaiting_io.store(false, Ordering::Relaxed);
                Poll::Ready(IoResult::Ok(n))
            }
            None => Poll::Pending,
        }
    }
}
