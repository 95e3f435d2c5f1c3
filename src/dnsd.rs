// outpost: DNS forwarder daemon - UDP listener, persistent upstream pool,
// blackhole responder pool, domain blacklist

use crate::error::{OutpostError, OutpostResult};
use crate::ratelimit::RateLimiter;
use crate::ringlog::DaemonLogger;
use crate::supervisor::SharedState;
use dashmap::DashSet;
use rand::Rng;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Maximum DNS message size over UDP
pub const MAX_PACKET_SIZE: usize = 512;
/// Deadline on every upstream and client write/read
pub const IO_TIMEOUT_SEC: u64 = 8;
/// Size of the persistent upstream socket pool
pub const NUM_FORWARDERS: usize = 32;
/// Size of the blackhole responder pool
pub const NUM_BLACKHOLE_RESPONDERS: usize = 4;
/// Per-worker queue bound; senders block when full, which is the intended
/// backpressure under sustained overload
const QUEUE_CAPACITY: usize = 16;

/// The answer section appended to a blackholed query: one A record pointing
/// at 0.0.0.0 with a 600 second TTL, name compressed to the question.
pub const BLACKHOLE_ANSWER: [u8; 16] = [
    0xc0, 0x0c, // name: pointer to the question
    0x00, 0x01, // type A
    0x00, 0x01, // class IN
    0x00, 0x00, 0x02, 0x58, // TTL 600
    0x00, 0x04, // rdata length
    0x00, 0x00, 0x00, 0x00, // 0.0.0.0
];

/// Unit of work on the fan-out path. Owned by the dispatcher until enqueued,
/// then by the consumer worker until the response has been written back.
pub struct UdpQuery {
    pub client_addr: SocketAddr,
    pub query_packet: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DnsDaemonConfig {
    #[serde(rename = "ListenAddress", default)]
    pub listen_address: String,
    #[serde(rename = "ListenPort", default)]
    pub listen_port: u16,
    /// Upstream resolver, `host` (port 53 implied) or `host:port`
    #[serde(rename = "ForwardTo", default)]
    pub forward_to: String,
    #[serde(rename = "AllowQueryIPPrefixes", default)]
    pub allow_query_ip_prefixes: Vec<String>,
    #[serde(rename = "PerIPLimit", default)]
    pub per_ip_limit: u32,
}

/// Recursive DNS daemon. Queries for blacklisted names get a blackhole
/// answer; everything else is forwarded verbatim through a fixed pool of
/// long-lived upstream sockets. Responses correlate inside the worker that
/// sent the query, so no demultiplexing table is needed.
pub struct DnsDaemon {
    config: DnsDaemonConfig,
    blacklist: Arc<DashSet<String>>,
    rate_limit: Arc<RateLimiter>,
    logger: DaemonLogger,
    shared: SharedState,
}

impl DnsDaemon {
    pub fn new(config: DnsDaemonConfig, shared: SharedState) -> OutpostResult<Self> {
        if config.forward_to.is_empty() {
            return Err(OutpostError::ConfigError(
                "DNSDaemon.ForwardTo must name an upstream resolver".to_string(),
            ));
        }
        if config.allow_query_ip_prefixes.is_empty() {
            return Err(OutpostError::ConfigError(
                "DNSDaemon.AllowQueryIPPrefixes must not be empty".to_string(),
            ));
        }
        let logger = DaemonLogger::new(
            "DNSD",
            format!("{}:{}", config.listen_address, config.listen_port),
            shared.logs.clone(),
        );
        let rate_limit = Arc::new(RateLimiter::new(config.per_ip_limit, logger.clone()));
        Ok(Self {
            config,
            blacklist: Arc::new(DashSet::new()),
            rate_limit,
            logger,
            shared,
        })
    }

    /// Shared handle on the blacklist; mutable at runtime.
    pub fn blacklist(&self) -> Arc<DashSet<String>> {
        self.blacklist.clone()
    }

    fn upstream_addr(&self) -> String {
        if self.config.forward_to.contains(':') {
            self.config.forward_to.clone()
        } else {
            format!("{}:53", self.config.forward_to)
        }
    }

    /// Listen for queries and block the caller until shutdown, lockdown or a
    /// listener error.
    pub async fn start_and_block(&self) -> OutpostResult<()> {
        let listen_addr = format!("{}:{}", self.config.listen_address, self.config.listen_port);
        let listener = Arc::new(UdpSocket::bind(&listen_addr).await.map_err(|err| {
            OutpostError::NetworkError(format!("failed to listen on {} - {}", listen_addr, err))
        })?);
        let upstream_addr = self.upstream_addr();

        // One persistent upstream socket, one serial worker, one bounded
        // queue per pool slot.
        let mut forwarder_queues = Vec::with_capacity(NUM_FORWARDERS);
        for i in 0..NUM_FORWARDERS {
            let upstream = UdpSocket::bind("0.0.0.0:0").await?;
            upstream.connect(&upstream_addr).await?;
            let (tx, rx) = mpsc::channel::<UdpQuery>(QUEUE_CAPACITY);
            forwarder_queues.push(tx);
            tokio::spawn(forwarder_worker(
                i,
                rx,
                upstream,
                listener.clone(),
                self.logger.clone(),
            ));
        }
        let mut blackhole_queues = Vec::with_capacity(NUM_BLACKHOLE_RESPONDERS);
        for i in 0..NUM_BLACKHOLE_RESPONDERS {
            let (tx, rx) = mpsc::channel::<UdpQuery>(QUEUE_CAPACITY);
            blackhole_queues.push(tx);
            tokio::spawn(blackhole_worker(i, rx, listener.clone(), self.logger.clone()));
        }

        self.logger.info("start_and_block", &listen_addr, "going to listen for queries");
        let mut shutdown = self.shared.subscribe_shutdown();
        let mut packet_buf = [0u8; MAX_PACKET_SIZE];
        loop {
            if self.shared.is_locked_down() {
                return Err(OutpostError::EmergencyLockDown);
            }
            let (length, client_addr) = tokio::select! {
                _ = shutdown.changed() => return self.shared.exit_status(),
                received = listener.recv_from(&mut packet_buf) => received?,
            };
            let client_ip = client_addr.ip().to_string();
            if !self.rate_limit.add(&client_ip, true) {
                continue;
            }
            if !self
                .config
                .allow_query_ip_prefixes
                .iter()
                .any(|prefix| client_ip.starts_with(prefix))
            {
                self.logger
                    .warning("accept", &client_ip, "client IP is not allowed to query");
                continue;
            }
            // The receive buffer is reused, so the packet moves to its own
            // allocation before crossing a queue.
            let query = UdpQuery {
                client_addr,
                query_packet: packet_buf[..length].to_vec(),
            };
            let names = extract_domain_names(&query.query_packet);
            let blacklisted = names.iter().any(|name| self.blacklist.contains(name));
            if blacklisted {
                let chosen = pick_random(blackhole_queues.len());
                self.logger.info(
                    "accept",
                    &client_ip,
                    &format!("blackholing {:?} via responder {}", names[0], chosen),
                );
                if blackhole_queues[chosen].send(query).await.is_err() {
                    return Err(OutpostError::NetworkError(
                        "blackhole worker is gone".to_string(),
                    ));
                }
            } else {
                let chosen = pick_random(forwarder_queues.len());
                if forwarder_queues[chosen].send(query).await.is_err() {
                    return Err(OutpostError::NetworkError(
                        "forwarder worker is gone".to_string(),
                    ));
                }
            }
        }
    }
}

fn pick_random(upper: usize) -> usize {
    rand::thread_rng().gen_range(0..upper)
}

/// Serially forward queries from one queue over one persistent upstream
/// socket, then relay each response back to the original client. I/O errors
/// are logged and the worker carries on with the next query.
async fn forwarder_worker(
    id: usize,
    mut queue: mpsc::Receiver<UdpQuery>,
    upstream: UdpSocket,
    listener: Arc<UdpSocket>,
    logger: DaemonLogger,
) {
    let worker = format!("forwarder-{}", id);
    let mut packet_buf = [0u8; MAX_PACKET_SIZE];
    let io_deadline = Duration::from_secs(IO_TIMEOUT_SEC);
    while let Some(query) = queue.recv().await {
        let client = query.client_addr.to_string();
        match timeout(io_deadline, upstream.send(&query.query_packet)).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                logger.warning(&worker, &client, &format!("failed to write to upstream - {}", err));
                continue;
            }
            Err(_) => {
                logger.warning(&worker, &client, "timed out writing to upstream");
                continue;
            }
        }
        let length = match timeout(io_deadline, upstream.recv(&mut packet_buf)).await {
            Ok(Ok(length)) => length,
            Ok(Err(err)) => {
                logger.warning(&worker, &client, &format!("failed to read from upstream - {}", err));
                continue;
            }
            Err(_) => {
                logger.warning(&worker, &client, "timed out reading from upstream");
                continue;
            }
        };
        if let Err(err) = timeout(
            io_deadline,
            listener.send_to(&packet_buf[..length], query.client_addr),
        )
        .await
        .unwrap_or_else(|_| Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline")))
        {
            logger.warning(&worker, &client, &format!("failed to answer client - {}", err));
        }
    }
}

/// Answer each query from the queue with the zero-target A record.
async fn blackhole_worker(
    id: usize,
    mut queue: mpsc::Receiver<UdpQuery>,
    listener: Arc<UdpSocket>,
    logger: DaemonLogger,
) {
    let worker = format!("blackhole-{}", id);
    let io_deadline = Duration::from_secs(IO_TIMEOUT_SEC);
    while let Some(query) = queue.recv().await {
        let answer = respond_with_zero(&query.query_packet);
        if answer.is_empty() {
            continue;
        }
        if let Err(err) = timeout(io_deadline, listener.send_to(&answer, query.client_addr))
            .await
            .unwrap_or_else(|_| Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline")))
        {
            logger.warning(&worker, &query.client_addr.to_string(), &format!("IO failure - {}", err));
        }
    }
}

/// Build a response to the query that directs the client to 0.0.0.0: copy
/// the question, flip QR, set RA, RCODE 0, append the blackhole A record.
pub fn respond_with_zero(query: &[u8]) -> Vec<u8> {
    if query.len() < 12 {
        return Vec::new();
    }
    let mut answer = query.to_vec();
    answer[2] = 0x81; // QR=1, opcode QUERY, RD=1
    answer[3] = 0x80; // RA=1, RCODE=0
    answer[6] = 0x00; // ANCOUNT=1
    answer[7] = 0x01;
    answer.extend_from_slice(&BLACKHOLE_ANSWER);
    answer
}

/// Pull the queried names out of the question section, normalised to
/// lower-case labels joined by dots. Returns what has been parsed so far on
/// any malformed input, which may be nothing.
pub fn extract_domain_names(packet: &[u8]) -> Vec<String> {
    let mut names = Vec::new();
    if packet.len() < 12 {
        return names;
    }
    let question_count = u16::from_be_bytes([packet[4], packet[5]]).min(8);
    let mut offset = 12usize;
    for _ in 0..question_count {
        let mut labels: Vec<String> = Vec::new();
        loop {
            let Some(&length_byte) = packet.get(offset) else {
                return names;
            };
            let length = length_byte as usize;
            if length == 0 {
                offset += 1;
                break;
            }
            // Compression pointers do not belong in a question name
            if length & 0xc0 != 0 {
                return names;
            }
            offset += 1;
            let Some(label_bytes) = packet.get(offset..offset + length) else {
                return names;
            };
            labels.push(
                label_bytes
                    .iter()
                    .map(|&b| (b as char).to_ascii_lowercase())
                    .collect(),
            );
            offset += length;
        }
        if !labels.is_empty() {
            names.push(labels.join("."));
        }
        offset += 4; // qtype and qclass
    }
    names
}
