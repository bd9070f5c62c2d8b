//! A multiplexed reliable-datagram transport for peer-to-peer live streaming,
//!  built on top of best-effort UDP.
//!
//! ## Design goals
//!
//! * A single UDP socket carries any number of reliable 'connections'. Peers are
//!   identified by their socket address plus a *channel* id (a logical conversation
//!   number embedded in every datagram), so several independent streams can share
//!   one socket pair.
//! * Reliability is provided per endpoint by an ARQ state machine whose wire format
//!   is compatible with the KCP protocol: sequence numbers, cumulative and selective
//!   ACKs, adaptive RTO with exponential backoff, fast retransmit, and a congestion
//!   window that can be disabled for latency-critical traffic.
//! * Latency is tunable per connection: 'fast' mode retransmits aggressively and
//!   ignores the congestion window, 'normal' mode behaves conservatively. The
//!   default sits in between.
//! * All per-endpoint protocol work (feeding received datagrams into the ARQ state,
//!   flushing retransmissions, timer management) runs on the event loop the endpoint
//!   is pinned to. Application reads and writes are cooperative: they complete
//!   immediately when data or window is available and otherwise suspend until the
//!   endpoint makes progress or an external stop token fires.
//!
//! ## Architecture
//!
//! ```ascii
//! UDP ingress ─ multiplexer demux ─ endpoint recv queue ─ ARQ input ─ aread
//! awrite ─ ARQ send buffer ─ flush (timer driven) ─ UDP egress
//! ```
//!
//! Three pieces cooperate:
//! * [`timer::TimerQueue`] - a min-heap of timepoint-coalesced callback slots,
//!   owned by one event loop, driving periodic ARQ updates.
//! * [`executor::ExecuteDispatcher`] - a FIFO of pending endpoint resumptions,
//!   drained on the owning loop; all timer manipulation is marshalled through it
//!   so the timer queue stays single-threaded.
//! * [`Rudp`] - the multiplexer: owns the socket, the (address, channel) → endpoint
//!   registry, and the lifecycle callbacks (`on_new_connection`,
//!   `on_unknown_packet`, `on_connection_timeout`).
//!
//! The ARQ core ([`arq::Arq`]) is a pure, synchronous state machine: it never
//!  performs I/O itself but accumulates outgoing datagrams in an outbox that the
//!  multiplexer drains to the socket. This keeps it deterministic and directly
//!  testable with a virtual clock.
//!
//! ## What this crate does not do
//!
//! * No encryption or authentication - peers are trusted, or an outer layer wraps
//!   the datagrams.
//! * No NAT traversal or multi-path; one socket, one path.
//! * No path-MTU discovery; the datagram payload size is configuration
//!   ([`RudpConfig::payload_size_inside_udp`], default 1472 for IPv4 Ethernet).

pub mod arq;
pub mod config;
pub mod event_loop;
pub mod executor;
pub mod io;
pub mod rudp;
pub mod socket;
pub mod timer;

mod endpoint;

pub use config::RudpConfig;
pub use event_loop::EventContext;
pub use io::{IoResult, OpParam};
pub use rudp::{Rudp, RudpConnection};
