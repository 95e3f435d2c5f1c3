// outpost: Receive-only SMTP daemon and the mail command processor

use crate::error::{OutpostError, OutpostResult};
use crate::mailer::Mailer;
use crate::pipeline::{Command, CommandPipeline};
use crate::ratelimit::RateLimiter;
use crate::ringlog::DaemonLogger;
use crate::supervisor::SharedState;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Deadline on every read and write within an SMTP session
const SMTP_IO_TIMEOUT_SEC: u64 = 60;
/// Ceiling on an accepted message
const MAX_MAIL_SIZE: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MailDaemonConfig {
    #[serde(rename = "ListenAddress", default)]
    pub listen_address: String,
    #[serde(rename = "ListenPort", default)]
    pub listen_port: u16,
    #[serde(rename = "PerIPLimit", default)]
    pub per_ip_limit: u32,
    /// Recipients that get every accepted message verbatim
    #[serde(rename = "ForwardTo", default)]
    pub forward_to: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MailProcessorConfig {
    #[serde(rename = "CommandTimeoutSec", default)]
    pub command_timeout_sec: u64,
}

/// Feeds the plain-text body of an accepted message through the command
/// pipeline, one line at a time, and mails the result back to the envelope
/// sender. Messages without a single authenticating line are dropped.
pub struct MailProcessor {
    pipeline: Arc<CommandPipeline>,
    command_timeout_sec: u64,
    mailer: Mailer,
    logger: DaemonLogger,
}

impl MailProcessor {
    pub fn new(
        config: MailProcessorConfig,
        pipeline: Arc<CommandPipeline>,
        mailer: Mailer,
        logger: DaemonLogger,
    ) -> Self {
        let command_timeout_sec = if config.command_timeout_sec == 0 {
            120
        } else {
            config.command_timeout_sec
        };
        Self {
            pipeline,
            command_timeout_sec,
            mailer,
            logger,
        }
    }

    pub async fn process(&self, raw_message: &[u8], envelope_from: &str) -> OutpostResult<()> {
        let parsed = mailparse::parse_mail(raw_message)
            .map_err(|err| OutpostError::MailError(format!("cannot parse message - {}", err)))?;
        let body = extract_text_body(&parsed)
            .map_err(|err| OutpostError::MailError(format!("cannot read body - {}", err)))?;
        for line in body.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let (_, result) = self
                .pipeline
                .transform(Command::new(line, self.command_timeout_sec, "smtpd"))
                .await;
            if result.error == Some(OutpostError::PinAndShortcutNotFound) {
                continue;
            }
            self.logger
                .info("process", envelope_from, "message carried a command");
            if self.mailer.is_configured() && !envelope_from.is_empty() {
                self.mailer
                    .send(
                        "outpost command reply",
                        &result.combined_text,
                        &[envelope_from.to_string()],
                    )
                    .await?;
            }
            return Ok(());
        }
        Err(OutpostError::PinAndShortcutNotFound)
    }
}

/// The plain-text part of the message, or the top-level body when there is
/// no multipart structure.
fn extract_text_body(parsed: &mailparse::ParsedMail<'_>) -> Result<String, mailparse::MailParseError> {
    if parsed.subparts.is_empty() {
        return parsed.get_body();
    }
    for part in &parsed.subparts {
        if part.ctype.mimetype == "text/plain" {
            return part.get_body();
        }
    }
    parsed.subparts[0].get_body()
}

/// Receive-only SMTP front. Accepted messages are processed inline and
/// discarded; there is no queue and no DSN.
pub struct MailDaemon {
    config: MailDaemonConfig,
    processor: Option<Arc<MailProcessor>>,
    mailer: Mailer,
    rate_limit: Arc<RateLimiter>,
    logger: DaemonLogger,
    shared: SharedState,
}

impl MailDaemon {
    pub fn new(
        config: MailDaemonConfig,
        processor: Option<Arc<MailProcessor>>,
        mailer: Mailer,
        shared: SharedState,
    ) -> OutpostResult<Self> {
        let logger = DaemonLogger::new(
            "SMTPD",
            format!("{}:{}", config.listen_address, config.listen_port),
            shared.logs.clone(),
        );
        let rate_limit = Arc::new(RateLimiter::new(config.per_ip_limit, logger.clone()));
        Ok(Self {
            config,
            processor,
            mailer,
            rate_limit,
            logger,
            shared,
        })
    }

    pub async fn start_and_block(&self) -> OutpostResult<()> {
        let listen_addr = format!("{}:{}", self.config.listen_address, self.config.listen_port);
        let listener = tokio::net::TcpListener::bind(&listen_addr)
            .await
            .map_err(|err| {
                OutpostError::NetworkError(format!("failed to listen on {} - {}", listen_addr, err))
            })?;
        self.logger.info("start_and_block", &listen_addr, "going to receive mails");
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
            let processor = self.processor.clone();
            let mailer = self.mailer.clone();
            let forward_to = self.config.forward_to.clone();
            let logger = self.logger.clone();
            tokio::spawn(async move {
                if let Err(err) =
                    serve_smtp_session(stream, processor, mailer, forward_to, logger.clone()).await
                {
                    logger.warning(
                        "serve_smtp_session",
                        &peer.ip().to_string(),
                        &format!("session ended with error - {}", err),
                    );
                }
            });
        }
    }
}

async fn read_smtp_line<R>(reader: &mut BufReader<R>) -> OutpostResult<Option<String>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    let read = timeout(
        Duration::from_secs(SMTP_IO_TIMEOUT_SEC),
        reader.read_line(&mut line),
    )
    .await
    .map_err(|_| OutpostError::NetworkError("client went quiet".to_string()))??;
    if read == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// One SMTP session: greet, take the envelope and message data, then hand
/// the message to the processor and the verbatim forwarders.
async fn serve_smtp_session(
    stream: TcpStream,
    processor: Option<Arc<MailProcessor>>,
    mailer: Mailer,
    forward_to: Vec<String>,
    logger: DaemonLogger,
) -> OutpostResult<()> {
    let peer = stream.peer_addr()?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    write_half
        .write_all(b"220 outpost SMTP service ready\r\n")
        .await?;
    let mut envelope_from = String::new();
    loop {
        let Some(line) = read_smtp_line(&mut reader).await? else {
            return Ok(());
        };
        let keyword = line
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        match keyword.as_str() {
            "HELO" | "EHLO" => {
                write_half.write_all(b"250 outpost\r\n").await?;
            }
            "MAIL" => {
                envelope_from = parse_smtp_address(&line);
                write_half.write_all(b"250 OK\r\n").await?;
            }
            "RCPT" => {
                write_half.write_all(b"250 OK\r\n").await?;
            }
            "DATA" => {
                write_half
                    .write_all(b"354 end data with <CR><LF>.<CR><LF>\r\n")
                    .await?;
                let mut message = String::new();
                loop {
                    let Some(data_line) = read_smtp_line(&mut reader).await? else {
                        return Ok(());
                    };
                    if data_line == "." {
                        break;
                    }
                    // Reverse dot-stuffing
                    let data_line = data_line.strip_prefix('.').unwrap_or(&data_line);
                    if message.len() + data_line.len() > MAX_MAIL_SIZE {
                        write_half
                            .write_all(b"552 message too large\r\n")
                            .await?;
                        return Ok(());
                    }
                    message.push_str(data_line);
                    message.push_str("\r\n");
                }
                write_half.write_all(b"250 OK message accepted\r\n").await?;
                dispatch_message(
                    message,
                    envelope_from.clone(),
                    processor.clone(),
                    mailer.clone(),
                    forward_to.clone(),
                    logger.clone(),
                    peer.ip().to_string(),
                );
                envelope_from.clear();
            }
            "RSET" | "NOOP" => {
                envelope_from.clear();
                write_half.write_all(b"250 OK\r\n").await?;
            }
            "QUIT" => {
                write_half.write_all(b"221 bye\r\n").await?;
                return Ok(());
            }
            _ => {
                write_half
                    .write_all(b"502 command not implemented\r\n")
                    .await?;
            }
        }
    }
}

/// Process and forward off the session task so that the client is released
/// as soon as the message is accepted.
fn dispatch_message(
    message: String,
    envelope_from: String,
    processor: Option<Arc<MailProcessor>>,
    mailer: Mailer,
    forward_to: Vec<String>,
    logger: DaemonLogger,
    peer_ip: String,
) {
    tokio::spawn(async move {
        if let Some(processor) = processor {
            match processor.process(message.as_bytes(), &envelope_from).await {
                Ok(()) => {}
                Err(OutpostError::PinAndShortcutNotFound) => {
                    logger.info("dispatch_message", &peer_ip, "message carries no command");
                }
                Err(err) => {
                    logger.warning(
                        "dispatch_message",
                        &peer_ip,
                        &format!("failed to process message - {}", err),
                    );
                }
            }
        }
        if !forward_to.is_empty() && mailer.is_configured() {
            if let Err(err) = mailer.forward_raw(&message, &forward_to).await {
                logger.warning(
                    "dispatch_message",
                    &peer_ip,
                    &format!("failed to forward message - {}", err),
                );
            }
        }
    });
}

fn parse_smtp_address(line: &str) -> String {
    if let (Some(open), Some(close)) = (line.find('<'), line.rfind('>')) {
        if close > open {
            return line[open + 1..close].to_string();
        }
    }
    line.split(':').nth(1).unwrap_or("").trim().to_string()
}
