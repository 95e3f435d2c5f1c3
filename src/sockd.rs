// outpost: Sock daemon - password-gated TCP tunnel

use crate::error::{OutpostError, OutpostResult};
use crate::ratelimit::RateLimiter;
use crate::ringlog::DaemonLogger;
use crate::supervisor::SharedState;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Fixed size of the password header at the start of every connection
pub const PASSWORD_HEADER_LEN: usize = 10;
/// Ceiling on the destination address frame
const MAX_DESTINATION_LEN: usize = 512;
const SOCK_IO_TIMEOUT_SEC: u64 = 30;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SockDaemonConfig {
    #[serde(rename = "ListenAddress", default)]
    pub listen_address: String,
    #[serde(rename = "ListenPort", default)]
    pub listen_port: u16,
    #[serde(rename = "PerIPLimit", default)]
    pub per_ip_limit: u32,
    #[serde(rename = "Password", default)]
    pub password: String,
}

/// Minimal tunnel front: a 10-byte password header, then a length-framed
/// destination address, then a plain bidirectional byte pump.
pub struct SockDaemon {
    config: SockDaemonConfig,
    password_header: [u8; PASSWORD_HEADER_LEN],
    rate_limit: Arc<RateLimiter>,
    logger: DaemonLogger,
    shared: SharedState,
}

impl SockDaemon {
    pub fn new(config: SockDaemonConfig, shared: SharedState) -> OutpostResult<Self> {
        if config.password.is_empty() {
            return Err(OutpostError::ConfigError(
                "SockDaemon.Password must not be empty".to_string(),
            ));
        }
        let logger = DaemonLogger::new(
            "SOCKD",
            format!("{}:{}", config.listen_address, config.listen_port),
            shared.logs.clone(),
        );
        let rate_limit = Arc::new(RateLimiter::new(config.per_ip_limit, logger.clone()));
        // Pad or truncate the configured password to the header size
        let mut password_header = [b' '; PASSWORD_HEADER_LEN];
        for (slot, byte) in password_header
            .iter_mut()
            .zip(config.password.bytes().take(PASSWORD_HEADER_LEN))
        {
            *slot = byte;
        }
        Ok(Self {
            config,
            password_header,
            rate_limit,
            logger,
            shared,
        })
    }

    pub async fn start_and_block(&self) -> OutpostResult<()> {
        let listen_addr = format!("{}:{}", self.config.listen_address, self.config.listen_port);
        let listener = TcpListener::bind(&listen_addr).await.map_err(|err| {
            OutpostError::NetworkError(format!("failed to listen on {} - {}", listen_addr, err))
        })?;
        self.logger.info("start_and_block", &listen_addr, "going to serve tunnels");
        let mut shutdown = self.shared.subscribe_shutdown();
        loop {
            if self.shared.is_locked_down() {
                return Err(OutpostError::EmergencyLockDown);
            }
            let (stream, peer) = tokio::select! {
                _ = shutdown.changed() => return self.shared.exit_status(),
                accepted = listener.accept() => accepted?,
            };
            if !self.rate_limit.add(&peer.ip().to_string(), true) {
                drop(stream);
                continue;
            }
            let password_header = self.password_header;
            let logger = self.logger.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_tunnel(stream, password_header, logger.clone()).await {
                    logger.warning(
                        "serve_tunnel",
                        &peer.ip().to_string(),
                        &format!("tunnel ended with error - {}", err),
                    );
                }
            });
        }
    }
}

async fn serve_tunnel(
    mut stream: TcpStream,
    password_header: [u8; PASSWORD_HEADER_LEN],
    logger: DaemonLogger,
) -> OutpostResult<()> {
    let io_deadline = Duration::from_secs(SOCK_IO_TIMEOUT_SEC);
    let mut presented = [0u8; PASSWORD_HEADER_LEN];
    timeout(io_deadline, stream.read_exact(&mut presented))
        .await
        .map_err(|_| OutpostError::NetworkError("timed out reading password".to_string()))??;
    if presented != password_header {
        // Wrong password gets a silent close, nothing to learn here
        return Ok(());
    }
    let mut length_frame = [0u8; 2];
    timeout(io_deadline, stream.read_exact(&mut length_frame))
        .await
        .map_err(|_| OutpostError::NetworkError("timed out reading destination".to_string()))??;
    let destination_len = u16::from_be_bytes(length_frame) as usize;
    if destination_len == 0 || destination_len > MAX_DESTINATION_LEN {
        return Err(OutpostError::NetworkError(format!(
            "refusing destination frame of {} bytes",
            destination_len
        )));
    }
    let mut destination_bytes = vec![0u8; destination_len];
    timeout(io_deadline, stream.read_exact(&mut destination_bytes))
        .await
        .map_err(|_| OutpostError::NetworkError("timed out reading destination".to_string()))??;
    let destination = String::from_utf8_lossy(&destination_bytes).into_owned();
    let mut upstream = timeout(io_deadline, TcpStream::connect(&destination))
        .await
        .map_err(|_| {
            OutpostError::NetworkError(format!("timed out connecting to {}", destination))
        })??;
    logger.info("serve_tunnel", &destination, "tunnel established");
    let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
    let _ = stream.shutdown().await;
    Ok(())
}
