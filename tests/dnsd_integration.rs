// DNS forwarder integration: blacklist blackholing, upstream forwarding and
// the per-IP rate limit, all over real loopback sockets.

use outpost::dnsd::{DnsDaemon, DnsDaemonConfig, BLACKHOLE_ANSWER, MAX_PACKET_SIZE};
use outpost::ringlog::LogBuffers;
use outpost::supervisor::SharedState;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::time::timeout;

// Standard A query for github.com
fn github_query() -> Vec<u8> {
    hex::decode("97eb010000010000000000000667697468756203636f6d0000010001").expect("fixture")
}

/// A stand-in upstream resolver that echoes every query back with the
/// response bit set and enough padding to look like a real answer.
async fn spawn_fake_upstream() -> String {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = socket.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        loop {
            let Ok((length, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let mut reply = buf[..length].to_vec();
            reply[2] |= 0x80;
            reply.extend_from_slice(&[0u8; 64]);
            let _ = socket.send_to(&reply, peer).await;
        }
    });
    addr.to_string()
}

async fn start_daemon(listen_port: u16, per_ip_limit: u32, upstream: String) -> Arc<DnsDaemon> {
    let daemon = Arc::new(
        DnsDaemon::new(
            DnsDaemonConfig {
                listen_address: "127.0.0.1".to_string(),
                listen_port,
                forward_to: upstream,
                allow_query_ip_prefixes: vec!["127.0".to_string()],
                per_ip_limit,
            },
            SharedState::new(LogBuffers::new()),
        )
        .expect("daemon"),
    );
    let runner = daemon.clone();
    tokio::spawn(async move {
        let _ = runner.start_and_block().await;
    });
    tokio::time::sleep(Duration::from_millis(500)).await;
    daemon
}

/// Sleep past the next rate-limit window boundary so a following burst does
/// not straddle two windows.
async fn align_to_window() {
    let subsec = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_millis() as u64)
        .unwrap_or(0);
    tokio::time::sleep(Duration::from_millis(1050 - subsec.min(1000))).await;
}

#[tokio::test]
async fn test_blacklisted_name_gets_blackhole_answer() {
    let upstream = spawn_fake_upstream().await;
    let daemon = start_daemon(61211, 100, upstream).await;
    daemon.blacklist().insert("github.com".to_string());

    let client = UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
    client.connect("127.0.0.1:61211").await.expect("connect");
    client.send(&github_query()).await.expect("send");
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let length = timeout(Duration::from_secs(2), client.recv(&mut buf))
        .await
        .expect("response before deadline")
        .expect("recv");
    assert!(
        buf[..length]
            .windows(BLACKHOLE_ANSWER.len())
            .any(|window| window == BLACKHOLE_ANSWER),
        "no blackhole answer in {:02x?}",
        &buf[..length]
    );

    // Taking the name off the blacklist restores forwarding
    daemon.blacklist().remove("github.com");
    client.send(&github_query()).await.expect("send");
    let length = timeout(Duration::from_secs(2), client.recv(&mut buf))
        .await
        .expect("response before deadline")
        .expect("recv");
    assert!(length > 50);
    assert!(!buf[..length]
        .windows(BLACKHOLE_ANSWER.len())
        .any(|window| window == BLACKHOLE_ANSWER));
}

#[tokio::test]
async fn test_rate_limit_bounds_burst_of_hundred() {
    let upstream = spawn_fake_upstream().await;
    let _daemon = start_daemon(61212, 10, upstream).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
    client.connect("127.0.0.1:61212").await.expect("connect");
    align_to_window().await;
    for _ in 0..100 {
        client.send(&github_query()).await.expect("send");
    }
    let mut buf = [0u8; MAX_PACKET_SIZE];
    let mut success = 0;
    while let Ok(Ok(length)) = timeout(Duration::from_millis(300), client.recv(&mut buf)).await {
        if length > 50 {
            success += 1;
        }
    }
    assert!(
        (5..=15).contains(&success),
        "expected 5..=15 answers, got {}",
        success
    );
}

#[tokio::test]
async fn test_disallowed_client_prefix_gets_no_answer() {
    let upstream = spawn_fake_upstream().await;
    let daemon = Arc::new(
        DnsDaemon::new(
            DnsDaemonConfig {
                listen_address: "127.0.0.1".to_string(),
                listen_port: 61213,
                forward_to: upstream,
                allow_query_ip_prefixes: vec!["10.".to_string()],
                per_ip_limit: 100,
            },
            SharedState::new(LogBuffers::new()),
        )
        .expect("daemon"),
    );
    let runner = daemon.clone();
    tokio::spawn(async move {
        let _ = runner.start_and_block().await;
    });
    tokio::time::sleep(Duration::from_millis(500)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
    client.connect("127.0.0.1:61213").await.expect("connect");
    client.send(&github_query()).await.expect("send");
    let mut buf = [0u8; MAX_PACKET_SIZE];
    assert!(timeout(Duration::from_millis(500), client.recv(&mut buf))
        .await
        .is_err());
}
