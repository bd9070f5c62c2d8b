use crate::arq::ARQ_OVERHEAD;
use anyhow::bail;

pub struct RudpConfig {
    /// This is the payload size inside UDP packets that the engine assumes. The
    ///  ARQ layer never fragments on the IP level, so this payload size (and the
    ///  implied packet size) must be supported by all network paths between peers.
    ///
    /// With full Ethernet frames and no optional IP headers, this payload is
    ///  `1500 - 20 - 8 = 1472` for IPV4 and `1500 - 40 - 8 = 1452` for IPV6.
    ///  Choosing this value too big causes packets to be dropped on the way;
    ///  choosing it too small wastes bandwidth. Path-MTU discovery is out of
    ///  scope, so the responsibility stays with the application.
    pub payload_size_inside_udp: usize,

    /// maximum number of unacknowledged segments in flight per endpoint
    pub send_window: u32,

    /// maximum number of out-of-order segments buffered per endpoint; also the
    ///  window advertised to the peer
    pub recv_window: u32,

    /// This is the maximum number of *segments* (not bytes) that may pile up in
    ///  an endpoint's send queue before `awrite` stops accepting data and
    ///  suspends the caller until flush progress drains the queue.
    pub send_backlog: usize,

    /// the tuning preset applied to fresh connections: 0 fast, 1 balanced,
    ///  2 normal (see [`crate::Rudp::config`])
    pub default_mode_level: u8,
}

impl RudpConfig {
    /// defaults for IPV4 with end-to-end full Ethernet MTU and no optional headers
    pub fn default_ipv4() -> RudpConfig {
        RudpConfig {
            payload_size_inside_udp: 1472,
            send_window: 128,
            recv_window: 128,
            send_backlog: 512,
            default_mode_level: 1,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.payload_size_inside_udp < ARQ_OVERHEAD + 64 {
            bail!("payload size {} is too small to carry segments", self.payload_size_inside_udp);
        }
        if self.recv_window == 0 || self.send_window == 0 {
            bail!("windows must hold at least one segment");
        }
        if self.send_backlog == 0 {
            bail!("send backlog must hold at least one segment");
        }
        Ok(())
    }
}
