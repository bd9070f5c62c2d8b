mod common;

use rudp::{EventContext, IoResult, OpParam, Rudp, RudpConfig, RudpConnection};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::time::timeout;

fn localhost() -> std::net::SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// a bound UDP socket that never answers - the "silent peer"
fn silent_peer() -> (std::net::UdpSocket, std::net::SocketAddr) {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_awrite_observes_the_stop_param_once_the_window_fills() {
    common::init_tracing();

    let context = EventContext::new(1);
    let a = Rudp::new(RudpConfig::default_ipv4()).unwrap();
    a.bind_addr(&context, localhost(), false).unwrap();
    let (_socket, silent) = silent_peer();

    let (done_tx, done_rx) = oneshot::channel();
    a.add_connection_with(silent, 1, Duration::from_secs(60), move |rudp, conn| async move {
        let param = OpParam::stop_after(Duration::from_millis(50));
        let chunk = common::pattern(1_448);
        let started = Instant::now();

        let outcome = loop {
            match rudp.awrite(&param, conn, &chunk).await {
                IoResult::Ok(_) => continue,
                other => break other,
            }
        };
        let _ = done_tx.send((outcome, started.elapsed()));
    });

    let (outcome, elapsed) = timeout(Duration::from_secs(5), done_rx)
        .await
        .expect("awrite never observed the stop")
        .unwrap();
    assert_eq!(outcome, IoResult::Timeout);
    assert!(elapsed >= Duration::from_millis(45), "stopped too early: {:?}", elapsed);

    a.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_aread_observes_the_stop_param_while_the_peer_is_silent() {
    common::init_tracing();

    let context = EventContext::new(1);
    let a = Rudp::new(RudpConfig::default_ipv4()).unwrap();
    a.bind_addr(&context, localhost(), false).unwrap();
    let (_socket, silent) = silent_peer();

    let (done_tx, done_rx) = oneshot::channel();
    a.add_connection_with(silent, 1, Duration::from_secs(60), move |rudp, conn| async move {
        let param = OpParam::stop_after(Duration::from_millis(50));
        let mut buf = [0u8; 64];
        let started = Instant::now();
        let outcome = rudp.aread(&param, conn, &mut buf).await;
        let _ = done_tx.send((outcome, started.elapsed()));
    });

    let (outcome, elapsed) = timeout(Duration::from_secs(5), done_rx)
        .await
        .expect("aread never observed the stop")
        .unwrap();
    assert_eq!(outcome, IoResult::Timeout);
    assert!(elapsed >= Duration::from_millis(45), "stopped too early: {:?}", elapsed);

    a.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_graceful_close_drains_the_send_buffer() {
    common::init_tracing();

    let context = EventContext::new(2);
    let a = Rudp::new(RudpConfig::default_ipv4()).unwrap();
    let b = Rudp::new(RudpConfig::default_ipv4()).unwrap();
    a.bind_addr(&context, localhost(), false).unwrap();
    b.bind_addr(&context, localhost(), false).unwrap();
    let b_addr = b.local_addr().unwrap();

    const TOTAL: usize = 50_000;
    let payload = common::pattern(TOTAL);

    let (received_tx, received_rx) = oneshot::channel::<Vec<u8>>();
    let received_tx = std::sync::Mutex::new(Some(received_tx));
    b.on_new_connection(move |rudp, conn| {
        let received_tx = received_tx.lock().unwrap().take();
        async move {
            let param = OpParam::new();
            let mut collected = Vec::new();
            let mut buf = vec![0u8; 4_096];
            while collected.len() < TOTAL {
                match rudp.aread(&param, conn, &mut buf).await {
                    IoResult::Ok(n) => collected.extend_from_slice(&buf[..n]),
                    _ => break,
                }
            }
            if let Some(tx) = received_tx {
                let _ = tx.send(collected);
            }
        }
    });
    let acceptor = b.clone();
    b.on_unknown_packet(move |addr| {
        acceptor.add_connection(addr, 4, Duration::from_secs(30));
        true
    });

    let (closed_tx, closed_rx) = oneshot::channel();
    let write_payload = payload.clone();
    a.add_connection_with(b_addr, 4, Duration::from_secs(30), move |rudp, conn| async move {
        let param = OpParam::new();
        assert_eq!(
            rudp.awrite(&param, conn, &write_payload).await,
            IoResult::Ok(write_payload.len())
        );
        // the send buffer cannot be fully acknowledged yet
        assert!(!rudp.removeable(conn.address, conn.channel));

        rudp.remove_connection(conn).await;

        // the endpoint is gone: lookups fail, no retry possible
        assert_eq!(rudp.awrite(&param, conn, b"more").await, IoResult::Failed);
        assert!(!rudp.removeable(conn.address, conn.channel));
        let _ = closed_tx.send(());
    });

    timeout(Duration::from_secs(20), closed_rx)
        .await
        .expect("graceful close did not finish")
        .unwrap();

    // everything written before the close arrived at the peer
    let collected = timeout(Duration::from_secs(20), received_rx)
        .await
        .expect("peer did not receive the drained data")
        .unwrap();
    assert_eq!(collected, payload);

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_inactivity_timeout_fast_closes_and_reports() {
    common::init_tracing();

    let context = EventContext::new(1);
    let a = Rudp::new(RudpConfig::default_ipv4()).unwrap();
    a.bind_addr(&context, localhost(), false).unwrap();
    let (_socket, silent) = silent_peer();

    let (timed_out_tx, timed_out_rx) = oneshot::channel::<RudpConnection>();
    let timed_out_tx = std::sync::Mutex::new(Some(timed_out_tx));
    a.on_connection_timeout(move |conn| {
        if let Some(tx) = timed_out_tx.lock().unwrap().take() {
            let _ = tx.send(conn);
        }
    });

    a.add_connection_with(silent, 7, Duration::from_millis(100), |_rudp, _conn| async move {
        // keep the endpoint alive long enough for the liveness check to act
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let conn = timeout(Duration::from_secs(5), timed_out_rx)
        .await
        .expect("timeout handler did not fire")
        .unwrap();
    assert_eq!(conn.address, silent);
    assert_eq!(conn.channel, 7);

    // the endpoint was fast-closed
    assert_eq!(a.awrite(&OpParam::new(), conn, b"x").await, IoResult::Failed);

    a.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_all_remote_keeps_the_socket_bound() {
    common::init_tracing();

    let context = EventContext::new(1);
    let a = Rudp::new(RudpConfig::default_ipv4()).unwrap();
    a.bind_addr(&context, localhost(), false).unwrap();
    let (_socket, silent) = silent_peer();

    a.add_connection_with(silent, 1, Duration::from_secs(60), |_rudp, _conn| async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
    });
    a.add_connection_with(silent, 2, Duration::from_secs(60), |_rudp, _conn| async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    // let the endpoints start ticking
    tokio::time::sleep(Duration::from_millis(50)).await;

    a.close_all_remote().await;

    assert!(a.is_bind());
    for channel in [1, 2] {
        let conn = RudpConnection { address: silent, channel };
        assert_eq!(a.awrite(&OpParam::new(), conn, b"x").await, IoResult::Failed);
        assert!(!a.removeable(silent, channel));
    }

    a.close().await;
    assert!(!a.is_bind());
}
