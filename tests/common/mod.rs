#![allow(dead_code)]

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rudp::socket::{bind_udp, DatagramSocket};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::{Mutex, Once};
use tokio::net::UdpSocket;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

/// A UDP socket that deterministically drops a percentage of outgoing
///  datagrams - the loss filter the transfer tests interpose between two
///  multiplexers. Every send attempt is counted, dropped or not.
pub struct LossySocket {
    inner: UdpSocket,
    drop_pct: u32,
    rng: Mutex<StdRng>,
    pub sent_datagrams: AtomicUsize,
}

impl LossySocket {
    pub fn bind(addr: SocketAddr, drop_pct: u32, seed: u64) -> anyhow::Result<LossySocket> {
        Ok(LossySocket {
            inner: bind_udp(addr, false)?,
            drop_pct,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            sent_datagrams: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl DatagramSocket for LossySocket {
    fn send_datagram(&self, buf: &[u8], to: SocketAddr) {
        self.sent_datagrams.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if self.rng.lock().unwrap().gen_range(0..100) < self.drop_pct {
            return;
        }
        DatagramSocket::send_datagram(&self.inner, buf, to);
    }

    async fn recv_datagram(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        DatagramSocket::recv_datagram(&self.inner, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        DatagramSocket::local_addr(&self.inner)
    }
}
