//! Per-endpoint ARQ state machine.
//!
//! The wire format is compatible with the KCP protocol: every UDP datagram carries
//!  a sequence of segments, each with a fixed little-endian 24-byte header
//!  (conversation id u32, command u8, fragment u8, window u16, timestamp-ms u32,
//!  sequence u32, cumulative-ack u32, length u32) followed by `length` payload
//!  bytes. Commands are PUSH (data), ACK, WASK (window probe request) and WINS
//!  (window advertisement).
//!
//! The state machine is intentionally pure: it performs no I/O and reads no clock.
//!  Callers feed it received datagrams ([`Arq::input`]), drive it with 32-bit
//!  millisecond timestamps ([`Arq::update`] / [`Arq::check`]) and drain finished
//!  egress datagrams from an internal outbox ([`Arq::take_outbox`]). That keeps
//!  the retransmission and congestion logic deterministic and testable against a
//!  virtual clock.
//!
//! Timestamps wrap around a 32-bit millisecond space; all comparisons go through
//!  [`time_diff`], so the multiplexer must rebase its clock (it subtracts a
//!  per-instance base time) rather than pass absolute microsecond values.

use bytes::{Buf, BufMut, BytesMut};
use std::cmp::{max, min};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// serialized segment header size
pub const ARQ_OVERHEAD: usize = 24;

const CMD_PUSH: u8 = 81;
const CMD_ACK: u8 = 82;
const CMD_WASK: u8 = 83;
const CMD_WINS: u8 = 84;

const ASK_SEND: u32 = 1;
const ASK_TELL: u32 = 2;

const RTO_NDL: u32 = 30;
const RTO_MIN: u32 = 100;
const RTO_DEF: u32 = 200;
const RTO_MAX: u32 = 60_000;

const WND_SND_DEF: u32 = 32;
const WND_RCV_DEF: u32 = 128;

const INTERVAL_DEF: u32 = 100;
const THRESH_INIT: u32 = 2;
const THRESH_MIN: u32 = 2;
const DEAD_LINK: u32 = 20;
const FASTACK_LIMIT: u32 = 5;

const PROBE_INIT: u32 = 7_000;
const PROBE_LIMIT: u32 = 120_000;

/// Signed difference between two wrapping 32-bit millisecond timestamps (or
///  sequence numbers): positive if `later` is ahead of `earlier`.
fn time_diff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// the send backlog is full; retry once flush progress opened the window
    WindowFull,
    /// the payload cannot be expressed in the receive window's fragment range -
    ///  a programmer error, not a transient condition
    Oversized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputError {
    /// datagram shorter than one segment header, or truncated payload
    Truncated,
    /// the datagram's conversation id does not belong to this endpoint
    ConvMismatch,
    /// unknown command byte at the head of the datagram
    BadCommand,
}

/// The tuning presets of [`crate::Rudp::config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArqMode {
    /// nodelay, 10 ms interval, fast-retransmit after 2 duplicate acks, no
    ///  congestion window
    Fast,
    /// nodelay, 20 ms interval, fast-retransmit after 3 duplicate acks, no
    ///  congestion window
    Balanced,
    /// 50 ms interval, RTO-driven retransmission only, congestion controlled
    Normal,
}

impl ArqMode {
    pub fn from_level(level: u8) -> ArqMode {
        match level {
            0 => ArqMode::Fast,
            1 => ArqMode::Balanced,
            _ => ArqMode::Normal,
        }
    }
}

struct Segment {
    conv: u32,
    cmd: u8,
    frg: u8,
    wnd: u16,
    ts: u32,
    sn: u32,
    una: u32,
    resend_ts: u32,
    rto: u32,
    fastack: u32,
    xmit: u32,
    data: BytesMut,
}

impl Segment {
    fn new(data: BytesMut) -> Segment {
        Segment {
            conv: 0,
            cmd: CMD_PUSH,
            frg: 0,
            wnd: 0,
            ts: 0,
            sn: 0,
            una: 0,
            resend_ts: 0,
            rto: 0,
            fastack: 0,
            xmit: 0,
            data,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.conv);
        buf.put_u8(self.cmd);
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);
    }
}

/// append `seg` to the staging datagram, completing the datagram first if the
///  segment would not fit within `mtu`
fn stage_segment(staging: &mut BytesMut, finished: &mut Vec<BytesMut>, mtu: usize, seg: &Segment) {
    if !staging.is_empty() && staging.len() + ARQ_OVERHEAD + seg.data.len() > mtu {
        finished.push(staging.split());
    }
    seg.encode(staging);
}

/// The ARQ control block of one endpoint.
pub struct Arq {
    conv: u32,
    mtu: usize,
    mss: usize,
    dead_link: bool,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    ssthresh: u32,
    rx_rttval: u32,
    rx_srtt: u32,
    rx_rto: u32,
    rx_minrto: u32,

    snd_wnd: u32,
    rcv_wnd: u32,
    rmt_wnd: u32,
    cwnd: u32,
    incr: u32,

    probe: u32,
    ts_probe: u32,
    probe_wait: u32,

    current: u32,
    interval: u32,
    ts_flush: u32,
    updated: bool,

    nodelay: u32,
    fastresend: u32,
    fastlimit: u32,
    nocwnd: bool,
    xmit: u32,

    snd_queue: VecDeque<Segment>,
    snd_buf: VecDeque<Segment>,
    rcv_buf: VecDeque<Segment>,
    rcv_queue: VecDeque<Segment>,
    acklist: Vec<(u32, u32)>,

    send_backlog: usize,
    outbox: Vec<BytesMut>,
}

impl Arq {
    pub fn new(conv: u32, mtu: usize, send_backlog: usize) -> Arq {
        debug_assert!(mtu > ARQ_OVERHEAD);
        Arq {
            conv,
            mtu,
            mss: mtu - ARQ_OVERHEAD,
            dead_link: false,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            ssthresh: THRESH_INIT,
            rx_rttval: 0,
            rx_srtt: 0,
            rx_rto: RTO_DEF,
            rx_minrto: RTO_MIN,
            snd_wnd: WND_SND_DEF,
            rcv_wnd: WND_RCV_DEF,
            rmt_wnd: WND_RCV_DEF,
            cwnd: 0,
            incr: 0,
            probe: 0,
            ts_probe: 0,
            probe_wait: 0,
            current: 0,
            interval: INTERVAL_DEF,
            ts_flush: INTERVAL_DEF,
            updated: false,
            nodelay: 0,
            fastresend: 0,
            fastlimit: FASTACK_LIMIT,
            nocwnd: false,
            xmit: 0,
            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            acklist: Vec::new(),
            send_backlog,
            outbox: Vec::new(),
        }
    }

    /// Extract the conversation id from the head of a raw datagram - this is how
    ///  the multiplexer demultiplexes before any endpoint state is touched.
    pub fn conv_of(datagram: &[u8]) -> Option<u32> {
        if datagram.len() < 4 {
            return None;
        }
        Some(u32::from_le_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]))
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    /// Segments in flight plus segments not yet admitted to the send window.
    pub fn waitsnd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    /// Segments waiting for admission to the send window. Callers watch this to
    ///  learn when a backlogged sender may retry.
    pub fn send_queue_len(&self) -> usize {
        self.snd_queue.len()
    }

    /// true once any segment has been retransmitted often enough to consider the
    ///  peer unreachable
    pub fn is_dead_link(&self) -> bool {
        self.dead_link
    }

    /// total number of RTO-driven retransmissions over the endpoint's lifetime
    pub fn total_retransmissions(&self) -> u32 {
        self.xmit
    }

    pub fn set_wndsize(&mut self, snd: u32, rcv: u32) {
        if snd > 0 {
            self.snd_wnd = snd;
        }
        if rcv > 0 {
            self.rcv_wnd = max(rcv, WND_RCV_DEF);
        }
    }

    pub fn set_mode(&mut self, mode: ArqMode) {
        match mode {
            ArqMode::Fast => self.set_nodelay(1, 10, 2, true),
            ArqMode::Balanced => self.set_nodelay(1, 20, 3, true),
            ArqMode::Normal => self.set_nodelay(0, 50, 0, false),
        }
    }

    pub fn set_nodelay(&mut self, nodelay: u32, interval_ms: u32, fastresend: u32, no_cwnd: bool) {
        self.nodelay = nodelay;
        self.rx_minrto = if nodelay > 0 { RTO_NDL } else { RTO_MIN };
        self.interval = interval_ms.clamp(10, 5_000);
        self.fastresend = fastresend;
        self.nocwnd = no_cwnd;
    }

    /// Drain the datagrams produced by previous `input`/`update` calls. The
    ///  caller ships them to the peer; order matters.
    pub fn take_outbox(&mut self) -> Vec<BytesMut> {
        std::mem::take(&mut self.outbox)
    }

    // ------------------------------------------------------------------------
    // sending
    // ------------------------------------------------------------------------

    /// Fragment `data` into MSS-sized segments and append them to the send
    ///  queue. Nothing goes on the wire until the next flush.
    pub fn send(&mut self, mut data: &[u8]) -> Result<(), SendError> {
        if data.is_empty() {
            return Ok(());
        }

        let count = data.len().div_ceil(self.mss);
        if count >= self.rcv_wnd as usize {
            // frg is a u8 counting down per message, and the peer cannot buffer
            //  more fragments than its receive window anyway
            return Err(SendError::Oversized);
        }
        if self.snd_queue.len() + count > self.send_backlog {
            return Err(SendError::WindowFull);
        }

        for i in 0..count {
            let size = min(self.mss, data.len());
            let mut seg = Segment::new(BytesMut::from(&data[..size]));
            seg.frg = (count - i - 1) as u8;
            self.snd_queue.push_back(seg);
            data = &data[size..];
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // receiving
    // ------------------------------------------------------------------------

    /// Copy up to `buf.len()` bytes out of the in-order receive stream,
    ///  consuming segments (possibly partially) as it goes. `None` when no byte
    ///  is available yet.
    pub fn recv(&mut self, buf: &mut [u8]) -> Option<usize> {
        if self.rcv_queue.is_empty() {
            return None;
        }
        let was_full = self.rcv_queue.len() as u32 >= self.rcv_wnd;

        let mut copied = 0;
        while copied < buf.len() {
            let Some(front) = self.rcv_queue.front_mut() else {
                break;
            };
            let n = min(buf.len() - copied, front.data.len());
            buf[copied..copied + n].copy_from_slice(&front.data[..n]);
            copied += n;
            if n == front.data.len() {
                self.rcv_queue.pop_front();
            }
            else {
                front.data.advance(n);
            }
        }
        if copied == 0 {
            return None;
        }

        self.move_ready_segments();

        if was_full && (self.rcv_queue.len() as u32) < self.rcv_wnd {
            // fast recover: the peer saw a zero window from us, tell it we have
            //  room again without waiting for its probe
            self.probe |= ASK_TELL;
        }

        Some(copied)
    }

    /// move contiguous segments from the out-of-order buffer into the in-order
    ///  queue, as far as the receive window allows
    fn move_ready_segments(&mut self) {
        while let Some(seg) = self.rcv_buf.front() {
            if seg.sn == self.rcv_nxt && (self.rcv_queue.len() as u32) < self.rcv_wnd {
                let seg = self.rcv_buf.pop_front().expect("peeked above");
                self.rcv_queue.push_back(seg);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            }
            else {
                break;
            }
        }
    }

    // ------------------------------------------------------------------------
    // ingress
    // ------------------------------------------------------------------------

    /// Parse one received datagram: update the remote window and cumulative ack,
    ///  process ACK/PUSH/probe segments, queue ACKs for the next flush.
    ///
    /// Errors are only reported for a datagram whose *first* segment is invalid;
    ///  a malformed trailing segment ends parsing silently (the already-processed
    ///  prefix stays processed, the peer retransmits the rest).
    pub fn input(&mut self, mut data: &[u8]) -> Result<(), InputError> {
        if data.len() < ARQ_OVERHEAD {
            return Err(InputError::Truncated);
        }

        let prev_una = self.snd_una;
        let mut max_ack: Option<u32> = None;
        let mut first = true;

        while data.len() >= ARQ_OVERHEAD {
            let mut head = &data[..ARQ_OVERHEAD];
            let conv = head.get_u32_le();
            if conv != self.conv {
                if first {
                    return Err(InputError::ConvMismatch);
                }
                break;
            }
            let cmd = head.get_u8();
            let frg = head.get_u8();
            let wnd = head.get_u16_le();
            let ts = head.get_u32_le();
            let sn = head.get_u32_le();
            let una = head.get_u32_le();
            let len = head.get_u32_le() as usize;

            if data.len() < ARQ_OVERHEAD + len {
                if first {
                    return Err(InputError::Truncated);
                }
                break;
            }
            if !matches!(cmd, CMD_PUSH | CMD_ACK | CMD_WASK | CMD_WINS) {
                if first {
                    return Err(InputError::BadCommand);
                }
                break;
            }
            data = &data[ARQ_OVERHEAD..];

            self.rmt_wnd = wnd as u32;
            self.parse_una(una);
            self.shrink_buf();

            match cmd {
                CMD_ACK => {
                    let rtt = time_diff(self.current, ts);
                    if rtt >= 0 {
                        self.update_ack(rtt as u32);
                    }
                    self.parse_ack(sn);
                    self.shrink_buf();
                    match max_ack {
                        Some(prev) if time_diff(sn, prev) <= 0 => {}
                        _ => max_ack = Some(sn),
                    }
                }
                CMD_PUSH => {
                    if time_diff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) < 0 {
                        self.acklist.push((sn, ts));
                        if time_diff(sn, self.rcv_nxt) >= 0 {
                            let mut seg = Segment::new(BytesMut::from(&data[..len]));
                            seg.conv = conv;
                            seg.frg = frg;
                            seg.ts = ts;
                            seg.sn = sn;
                            seg.una = una;
                            self.parse_data(seg);
                        }
                    }
                    else {
                        debug!("segment #{} outside receive window (rcv_nxt {}) - dropping", sn, self.rcv_nxt);
                    }
                }
                CMD_WASK => {
                    self.probe |= ASK_TELL;
                }
                CMD_WINS => {
                    // window advertisement - the header update above was all
                }
                _ => unreachable!(),
            }

            data = &data[len..];
            first = false;
        }

        if let Some(max_sn) = max_ack {
            self.parse_fastack(max_sn);
        }

        // grow the congestion window when the cumulative ack advanced
        if time_diff(self.snd_una, prev_una) > 0 && self.cwnd < self.rmt_wnd {
            let mss = self.mss as u32;
            if self.cwnd < self.ssthresh {
                self.cwnd += 1;
                self.incr += mss;
            }
            else {
                if self.incr < mss {
                    self.incr = mss;
                }
                self.incr += (mss * mss) / self.incr + (mss / 16);
                if (self.cwnd + 1) * mss <= self.incr {
                    self.cwnd = (self.incr + mss - 1) / max(1, mss);
                }
            }
            if self.cwnd > self.rmt_wnd {
                self.cwnd = self.rmt_wnd;
                self.incr = self.rmt_wnd * mss;
            }
        }

        Ok(())
    }

    /// drop all acknowledged segments below the cumulative ack
    fn parse_una(&mut self, una: u32) {
        while let Some(seg) = self.snd_buf.front() {
            if time_diff(una, seg.sn) > 0 {
                self.snd_buf.pop_front();
            }
            else {
                break;
            }
        }
    }

    fn shrink_buf(&mut self) {
        self.snd_una = self
            .snd_buf
            .front()
            .map(|seg| seg.sn)
            .unwrap_or(self.snd_nxt);
    }

    fn parse_ack(&mut self, sn: u32) {
        if time_diff(sn, self.snd_una) < 0 || time_diff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for i in 0..self.snd_buf.len() {
            let seg_sn = self.snd_buf[i].sn;
            if sn == seg_sn {
                self.snd_buf.remove(i);
                break;
            }
            if time_diff(sn, seg_sn) < 0 {
                break;
            }
        }
    }

    /// count how often segments older than `sn` were skipped by acks - feeds
    ///  fast retransmission
    fn parse_fastack(&mut self, sn: u32) {
        if time_diff(sn, self.snd_una) < 0 || time_diff(sn, self.snd_nxt) >= 0 {
            return;
        }
        for seg in &mut self.snd_buf {
            if time_diff(sn, seg.sn) < 0 {
                break;
            }
            if sn != seg.sn {
                seg.fastack += 1;
            }
        }
    }

    fn update_ack(&mut self, rtt: u32) {
        if self.rx_srtt == 0 {
            self.rx_srtt = rtt;
            self.rx_rttval = rtt / 2;
        }
        else {
            let delta = rtt.abs_diff(self.rx_srtt);
            self.rx_rttval = (3 * self.rx_rttval + delta) / 4;
            self.rx_srtt = max(1, (7 * self.rx_srtt + rtt) / 8);
        }
        let rto = self.rx_srtt + max(self.interval, 4 * self.rx_rttval);
        self.rx_rto = rto.clamp(self.rx_minrto, RTO_MAX);
    }

    fn parse_data(&mut self, newseg: Segment) {
        let sn = newseg.sn;
        if time_diff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) >= 0 || time_diff(sn, self.rcv_nxt) < 0 {
            return;
        }

        // scan from the back - in the common case the segment appends
        let mut insert_at = 0;
        let mut repeat = false;
        for i in (0..self.rcv_buf.len()).rev() {
            let seg_sn = self.rcv_buf[i].sn;
            if seg_sn == sn {
                repeat = true;
                break;
            }
            if time_diff(sn, seg_sn) > 0 {
                insert_at = i + 1;
                break;
            }
        }
        if !repeat {
            self.rcv_buf.insert(insert_at, newseg);
        }

        self.move_ready_segments();
    }

    // ------------------------------------------------------------------------
    // egress
    // ------------------------------------------------------------------------

    fn wnd_unused(&self) -> u16 {
        let unused = (self.rcv_wnd as usize).saturating_sub(self.rcv_queue.len());
        min(unused, u16::MAX as usize) as u16
    }

    /// Emit everything that is due at `self.current`: pending ACKs, window
    ///  probes, first transmissions within the effective send window, RTO and
    ///  fast retransmissions. Finished datagrams land in the outbox.
    fn flush(&mut self) {
        if !self.updated {
            return;
        }

        let current = self.current;
        let wnd = self.wnd_unused();
        let mtu = self.mtu;
        let mut staging = BytesMut::with_capacity(mtu);
        let mut finished: Vec<BytesMut> = Vec::new();

        let mut ctl = Segment::new(BytesMut::new());
        ctl.conv = self.conv;
        ctl.cmd = CMD_ACK;
        ctl.wnd = wnd;
        ctl.una = self.rcv_nxt;

        // pending acks
        for &(sn, ts) in &self.acklist {
            ctl.sn = sn;
            ctl.ts = ts;
            stage_segment(&mut staging, &mut finished, mtu, &ctl);
        }
        self.acklist.clear();

        // zero remote window: probe with increasing backoff
        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = PROBE_INIT;
                self.ts_probe = current.wrapping_add(self.probe_wait);
            }
            else if time_diff(current, self.ts_probe) >= 0 {
                if self.probe_wait < PROBE_INIT {
                    self.probe_wait = PROBE_INIT;
                }
                self.probe_wait += self.probe_wait / 2;
                if self.probe_wait > PROBE_LIMIT {
                    self.probe_wait = PROBE_LIMIT;
                }
                self.ts_probe = current.wrapping_add(self.probe_wait);
                self.probe |= ASK_SEND;
            }
        }
        else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }

        if self.probe & ASK_SEND != 0 {
            ctl.cmd = CMD_WASK;
            ctl.sn = 0;
            ctl.ts = 0;
            stage_segment(&mut staging, &mut finished, mtu, &ctl);
        }
        if self.probe & ASK_TELL != 0 {
            ctl.cmd = CMD_WINS;
            ctl.sn = 0;
            ctl.ts = 0;
            stage_segment(&mut staging, &mut finished, mtu, &ctl);
        }
        self.probe = 0;

        // admit queued segments into the effective send window
        let mut cwnd_limit = min(self.snd_wnd, self.rmt_wnd);
        if !self.nocwnd {
            cwnd_limit = min(self.cwnd, cwnd_limit);
        }

        while time_diff(self.snd_nxt, self.snd_una.wrapping_add(cwnd_limit)) < 0 {
            let Some(mut seg) = self.snd_queue.pop_front() else {
                break;
            };
            seg.conv = self.conv;
            seg.cmd = CMD_PUSH;
            seg.sn = self.snd_nxt;
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.snd_buf.push_back(seg);
        }

        let resent = if self.fastresend > 0 { self.fastresend } else { u32::MAX };
        let rtomin = if self.nodelay == 0 { self.rx_rto >> 3 } else { 0 };
        let rx_rto = self.rx_rto;
        let nodelay = self.nodelay;
        let fastlimit = self.fastlimit;
        let rcv_nxt = self.rcv_nxt;

        let mut lost = false;
        let mut change = false;
        let mut extra_xmit = 0;
        let mut dead = false;

        for i in 0..self.snd_buf.len() {
            let seg = &mut self.snd_buf[i];
            let mut needsend = false;

            if seg.xmit == 0 {
                needsend = true;
                seg.xmit = 1;
                seg.rto = rx_rto;
                seg.resend_ts = current.wrapping_add(seg.rto).wrapping_add(rtomin);
            }
            else if time_diff(current, seg.resend_ts) >= 0 {
                needsend = true;
                seg.xmit += 1;
                extra_xmit += 1;
                if nodelay == 0 {
                    seg.rto += max(seg.rto, rx_rto);
                }
                else {
                    let step = if nodelay < 2 { seg.rto } else { rx_rto };
                    seg.rto += step / 2;
                }
                seg.rto = min(seg.rto, RTO_MAX);
                seg.resend_ts = current.wrapping_add(seg.rto);
                lost = true;
            }
            else if seg.fastack >= resent && (seg.xmit <= fastlimit || fastlimit == 0) {
                needsend = true;
                seg.xmit += 1;
                seg.fastack = 0;
                seg.resend_ts = current.wrapping_add(seg.rto);
                change = true;
            }

            if needsend {
                seg.ts = current;
                seg.wnd = wnd;
                seg.una = rcv_nxt;
                stage_segment(&mut staging, &mut finished, mtu, seg);
                if seg.xmit >= DEAD_LINK {
                    dead = true;
                }
            }
        }
        self.xmit += extra_xmit;
        if dead && !self.dead_link {
            warn!("conv {}: segment retransmitted {} times - peer considered dead", self.conv, DEAD_LINK);
            self.dead_link = true;
        }

        if !staging.is_empty() {
            finished.push(staging);
        }
        self.outbox.extend(finished);

        // congestion response
        if change {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.ssthresh = max(inflight / 2, THRESH_MIN);
            self.cwnd = self.ssthresh.saturating_add(resent);
            self.incr = self.cwnd * self.mss as u32;
        }
        if lost {
            self.ssthresh = max(cwnd_limit / 2, THRESH_MIN);
            self.cwnd = 1;
            self.incr = self.mss as u32;
        }
        if self.cwnd < 1 {
            self.cwnd = 1;
            self.incr = self.mss as u32;
        }
    }

    /// Flush immediately, outside the `update` cadence. Used when pending
    ///  state (typically acknowledgements) must reach the peer before the
    ///  session goes away. A no-op before the first `update`.
    pub fn flush_now(&mut self) {
        self.flush();
    }

    /// Drive the periodic flush. `current` is a 32-bit millisecond timestamp on
    ///  the caller's (rebased) clock; it must be called with non-decreasing
    ///  values apart from 32-bit wraparound.
    pub fn update(&mut self, current: u32) {
        self.current = current;

        if !self.updated {
            self.updated = true;
            self.ts_flush = current;
        }

        let mut slap = time_diff(current, self.ts_flush);
        if !(-10_000..10_000).contains(&slap) {
            self.ts_flush = current;
            slap = 0;
        }

        if slap >= 0 {
            self.ts_flush = self.ts_flush.wrapping_add(self.interval);
            if time_diff(current, self.ts_flush) >= 0 {
                self.ts_flush = current.wrapping_add(self.interval);
            }
            self.flush();
        }
    }

    /// When `update` needs to run next: the earlier of the flush cadence and the
    ///  closest retransmission deadline, never more than one interval away.
    pub fn check(&self, current: u32) -> u32 {
        if !self.updated {
            return current;
        }

        let mut ts_flush = self.ts_flush;
        if !(-10_000..10_000).contains(&time_diff(current, ts_flush)) {
            ts_flush = current;
        }
        if time_diff(current, ts_flush) >= 0 {
            return current;
        }

        let tm_flush = time_diff(ts_flush, current);
        let mut tm_packet = i32::MAX;
        for seg in &self.snd_buf {
            let diff = time_diff(seg.resend_ts, current);
            if diff <= 0 {
                return current;
            }
            tm_packet = min(tm_packet, diff);
        }

        let minimal = min(min(tm_packet, tm_flush) as u32, self.interval);
        current.wrapping_add(minimal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rstest::rstest;

    const MTU: usize = 1472;
    const MSS: usize = MTU - ARQ_OVERHEAD;

    /// two endpoints wired back to back through a (possibly lossy) virtual link
    ///  driven by a virtual clock
    struct TestLink {
        a: Arq,
        b: Arq,
        now: u32,
        a_sent_datagrams: usize,
        b_sent_datagrams: usize,
        loss_pct: u32,
        rng: StdRng,
    }

    impl TestLink {
        fn new(conv: u32, mode: ArqMode) -> TestLink {
            let mut a = Arq::new(conv, MTU, 256);
            let mut b = Arq::new(conv, MTU, 256);
            a.set_mode(mode);
            b.set_mode(mode);
            a.set_wndsize(128, 128);
            b.set_wndsize(128, 128);
            TestLink {
                a,
                b,
                now: 0,
                a_sent_datagrams: 0,
                b_sent_datagrams: 0,
                loss_pct: 0,
                rng: StdRng::seed_from_u64(12),
            }
        }

        fn with_loss(mut self, pct: u32, seed: u64) -> TestLink {
            self.loss_pct = pct;
            self.rng = StdRng::seed_from_u64(seed);
            self
        }

        /// advance the virtual clock by 5 ms and exchange whatever both sides
        ///  flushed
        fn step(&mut self) {
            self.now += 5;
            self.a.update(self.now);
            self.b.update(self.now);

            for datagram in self.a.take_outbox() {
                self.a_sent_datagrams += 1;
                if self.rng.gen_range(0..100) >= self.loss_pct {
                    self.b.input(&datagram).unwrap();
                }
            }
            for datagram in self.b.take_outbox() {
                self.b_sent_datagrams += 1;
                if self.rng.gen_range(0..100) >= self.loss_pct {
                    self.a.input(&datagram).unwrap();
                }
            }
        }

        /// read everything currently available on `b` in `chunk`-sized pieces
        fn read_b(&mut self, chunk: usize, into: &mut Vec<u8>) {
            let mut buf = vec![0u8; chunk];
            while let Some(n) = self.b.recv(&mut buf) {
                into.extend_from_slice(&buf[..n]);
            }
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 256) as u8).collect()
    }

    #[test]
    fn test_roundtrip_small_payload() {
        let mut link = TestLink::new(7, ArqMode::Balanced);

        link.a.send(b"hello").unwrap();
        let mut received = Vec::new();
        for _ in 0..50 {
            link.step();
            link.read_b(64, &mut received);
            if !received.is_empty() {
                break;
            }
        }
        assert_eq!(received, b"hello");

        // and the other direction over the same conversation
        link.b.send(b"world").unwrap();
        let mut reply = vec![0u8; 64];
        let mut got = None;
        for _ in 0..50 {
            link.step();
            if let Some(n) = link.a.recv(&mut reply) {
                got = Some(reply[..n].to_vec());
                break;
            }
        }
        assert_eq!(got.as_deref(), Some(&b"world"[..]));
    }

    #[test]
    fn test_large_payload_fragments_and_reassembles() {
        let mut link = TestLink::new(1, ArqMode::Balanced);
        let payload = pattern(100_000);

        link.a.send(&payload).unwrap();
        assert!(link.a.waitsnd() > 1, "payload must fragment into multiple segments");

        let mut received = Vec::new();
        for _ in 0..2_000 {
            link.step();
            // deliberately odd chunk size - reads cross segment boundaries
            link.read_b(1_000, &mut received);
            if received.len() >= payload.len() {
                break;
            }
        }
        assert_eq!(received.len(), payload.len());
        assert_eq!(received, payload);
    }

    #[test]
    fn test_multiple_sends_arrive_in_order_without_duplication() {
        let mut link = TestLink::new(2, ArqMode::Fast);
        let chunks: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; 100]).collect();

        for chunk in &chunks {
            link.a.send(chunk).unwrap();
        }

        let expected: Vec<u8> = chunks.concat();
        let mut received = Vec::new();
        for _ in 0..200 {
            link.step();
            link.read_b(333, &mut received);
            if received.len() >= expected.len() {
                break;
            }
        }
        assert_eq!(received, expected);
    }

    #[test]
    fn test_transfer_completes_under_heavy_loss() {
        let mut link = TestLink::new(3, ArqMode::Fast).with_loss(30, 42);
        let payload = pattern(10_000);

        link.a.send(&payload).unwrap();

        let mut received = Vec::new();
        for _ in 0..10_000 {
            link.step();
            link.read_b(1_472, &mut received);
            if received.len() >= payload.len() {
                break;
            }
        }
        assert_eq!(received, payload);

        // loss forces retransmits, so strictly more datagrams than the minimum
        let min_datagrams = payload.len().div_ceil(MSS);
        assert!(
            link.a_sent_datagrams > min_datagrams,
            "expected retransmissions: {} datagrams for a {}-segment payload",
            link.a_sent_datagrams,
            min_datagrams
        );
        // and the receiver acknowledged throughout
        assert!(link.b_sent_datagrams > 0);
    }

    #[test]
    fn test_fast_retransmit_beats_the_rto() {
        // lose the first delivery of segment #0, then keep sending: every later
        //  ack datagram skips over #0 and bumps its fast-ack count, so it must
        //  be resent long before the 200 ms initial RTO expires
        let mut link = TestLink::new(4, ArqMode::Fast);
        let mut dropped = false;
        let total = 8 * MSS;

        let mut received = Vec::new();
        let mut buf = vec![0u8; 2 * MSS];
        for i in 0..30 {
            if i < 8 {
                link.a.send(&pattern(MSS)).unwrap();
            }
            link.now += 5;
            link.a.update(link.now);
            link.b.update(link.now);
            for datagram in link.a.take_outbox() {
                let is_first_push = datagram[4] == CMD_PUSH && {
                    let sn = u32::from_le_bytes([datagram[12], datagram[13], datagram[14], datagram[15]]);
                    sn == 0
                };
                if is_first_push && !dropped {
                    dropped = true;
                    continue;
                }
                link.b.input(&datagram).unwrap();
            }
            for datagram in link.b.take_outbox() {
                link.a.input(&datagram).unwrap();
            }
            while let Some(n) = link.b.recv(&mut buf) {
                received.extend_from_slice(&buf[..n]);
            }
            if received.len() == total {
                break;
            }
        }

        assert!(dropped);
        assert_eq!(received.len(), total);
        // well below the 200 ms initial RTO - the duplicate acks triggered it
        assert!(link.now < 150, "fast retransmit took {} ms", link.now);
    }

    #[test]
    fn test_rto_backoff_grows_exponentially() {
        let mut link = TestLink::new(5, ArqMode::Balanced);
        link.a.send(b"x").unwrap();

        // drop everything a sends and record when it tries
        let mut attempts = Vec::new();
        while link.now < 2_000 {
            link.now += 5;
            link.a.update(link.now);
            for datagram in link.a.take_outbox() {
                if datagram[4] == CMD_PUSH {
                    attempts.push(link.now);
                }
            }
        }

        // balanced mode grows the per-segment RTO by half on every expiry
        assert!(attempts.len() >= 4, "expected several retransmissions, got {:?}", attempts);
        let gap1 = attempts[1] - attempts[0];
        let gap2 = attempts[2] - attempts[1];
        let gap3 = attempts[3] - attempts[2];
        assert!(gap1 >= 200, "first resend came before the initial RTO: {:?}", attempts);
        assert!(gap2 * 10 >= gap1 * 14, "backoff did not grow: {:?}", attempts);
        assert!(gap3 * 10 >= gap2 * 14, "backoff did not keep growing: {:?}", attempts);
        assert!(link.a.total_retransmissions() >= 3);
    }

    #[test]
    fn test_zero_remote_window_triggers_probe_and_advertisement() {
        let mut link = TestLink::new(6, ArqMode::Balanced);

        // pretend the peer advertised a zero window
        link.a.update(0);
        link.a.rmt_wnd = 0;

        let mut asked = false;
        let mut now = 0;
        while now < 10_000 && !asked {
            now += 50;
            link.a.update(now);
            for datagram in link.a.take_outbox() {
                if datagram[4] == CMD_WASK {
                    asked = true;
                }
                link.b.input(&datagram).unwrap();
            }
        }
        assert!(asked, "no window probe within the initial probe delay");

        // the peer answers with a window advertisement, restoring rmt_wnd
        link.b.update(now);
        let mut told = false;
        for datagram in link.b.take_outbox() {
            if datagram[4] == CMD_WINS {
                told = true;
            }
            link.a.input(&datagram).unwrap();
        }
        assert!(told);
        assert_eq!(link.a.rmt_wnd, 128);
    }

    #[test]
    fn test_congestion_window_collapses_on_rto_loss() {
        let mut link = TestLink::new(8, ArqMode::Normal);

        // establish some cwnd growth first
        link.a.send(&pattern(4 * MSS)).unwrap();
        let mut sink = Vec::new();
        for _ in 0..100 {
            link.step();
            link.read_b(MSS, &mut sink);
            if link.a.waitsnd() == 0 {
                break;
            }
        }
        assert_eq!(link.a.waitsnd(), 0);
        let grown_cwnd = link.a.cwnd;
        assert!(grown_cwnd > 1);

        // now lose everything until the RTO fires
        link.a.send(&pattern(2 * MSS)).unwrap();
        let loss_start = link.now;
        while link.now < loss_start + 1_000 {
            link.now += 5;
            link.a.update(link.now);
            link.a.take_outbox();
            if link.a.cwnd == 1 {
                break;
            }
        }
        assert_eq!(link.a.cwnd, 1, "cwnd must collapse after an RTO-driven resend");
        assert!(link.a.ssthresh >= THRESH_MIN);
    }

    #[rstest]
    #[case(0, 1, 10, 2, true)]
    #[case(1, 1, 20, 3, true)]
    #[case(2, 0, 50, 0, false)]
    #[case(9, 0, 50, 0, false)]
    fn test_mode_levels(
        #[case] level: u8,
        #[case] nodelay: u32,
        #[case] interval: u32,
        #[case] fastresend: u32,
        #[case] nocwnd: bool,
    ) {
        let mut arq = Arq::new(1, MTU, 256);
        arq.set_mode(ArqMode::from_level(level));
        assert_eq!(arq.nodelay, nodelay);
        assert_eq!(arq.interval, interval);
        assert_eq!(arq.fastresend, fastresend);
        assert_eq!(arq.nocwnd, nocwnd);
    }

    #[test]
    fn test_send_rejects_oversized_and_backlog_overflow() {
        let mut arq = Arq::new(1, MTU, 4);

        // more fragments than the receive window can express
        assert_eq!(arq.send(&pattern(129 * MSS)), Err(SendError::Oversized));

        assert_eq!(arq.send(&pattern(3 * MSS)), Ok(()));
        assert_eq!(arq.send(&pattern(3 * MSS)), Err(SendError::WindowFull));

        // empty writes are a no-op
        assert_eq!(arq.send(&[]), Ok(()));
        assert_eq!(arq.waitsnd(), 3);
    }

    #[test]
    fn test_input_rejects_garbage_heads() {
        let mut arq = Arq::new(1, MTU, 16);
        arq.update(0);

        assert_eq!(arq.input(&[1, 2, 3]), Err(InputError::Truncated));

        let mut wrong_conv = BytesMut::new();
        let mut seg = Segment::new(BytesMut::new());
        seg.conv = 99;
        seg.cmd = CMD_ACK;
        seg.encode(&mut wrong_conv);
        assert_eq!(arq.input(&wrong_conv), Err(InputError::ConvMismatch));

        let mut bad_cmd = BytesMut::new();
        seg.conv = 1;
        seg.cmd = 77;
        seg.encode(&mut bad_cmd);
        assert_eq!(arq.input(&bad_cmd), Err(InputError::BadCommand));
    }

    #[test]
    fn test_conv_of() {
        assert_eq!(Arq::conv_of(&[0x39, 0x30, 0, 0, 81]), Some(12345));
        assert_eq!(Arq::conv_of(&[1, 2]), None);
    }

    #[test]
    fn test_acks_clean_the_send_buffer() {
        let mut link = TestLink::new(9, ArqMode::Balanced);
        link.a.send(&pattern(5 * MSS)).unwrap();

        let mut sink = Vec::new();
        for _ in 0..100 {
            link.step();
            link.read_b(MSS, &mut sink);
            if link.a.waitsnd() == 0 {
                break;
            }
        }
        assert_eq!(link.a.waitsnd(), 0);
        assert_eq!(link.a.snd_una, link.a.snd_nxt);
        assert_eq!(sink.len(), 5 * MSS);
    }
}
