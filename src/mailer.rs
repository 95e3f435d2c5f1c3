// outpost: Outbound mail - a minimal SMTP relay client and the mail-send
// feature built on top of it

use crate::error::{OutpostError, OutpostResult};
use crate::feature::Feature;
use crate::pipeline::{Command, CommandResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

const CONNECT_TIMEOUT_SEC: u64 = 10;
const DIALOGUE_TIMEOUT_SEC: u64 = 60;

/// Outbound SMTP relay. Plain-text dialogue, no TLS; the relay is expected
/// to sit on a trusted network (typically localhost).
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Mailer {
    #[serde(rename = "MailFrom", default)]
    pub mail_from: String,
    #[serde(rename = "MTAHost", default)]
    pub mta_host: String,
    #[serde(rename = "MTAPort", default)]
    pub mta_port: u16,
}

impl Mailer {
    pub fn is_configured(&self) -> bool {
        !self.mail_from.is_empty() && !self.mta_host.is_empty() && self.mta_port != 0
    }

    /// Send a plain-text message to every recipient in one SMTP transaction.
    pub async fn send(
        &self,
        subject: &str,
        body: &str,
        recipients: &[String],
    ) -> OutpostResult<()> {
        let message = format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\n\r\n{}",
            self.mail_from,
            recipients.join(", "),
            subject,
            body
        );
        self.deliver(&message, recipients).await
    }

    /// Deliver a complete, already-formatted message verbatim.
    pub async fn forward_raw(&self, raw_message: &str, recipients: &[String]) -> OutpostResult<()> {
        self.deliver(raw_message, recipients).await
    }

    async fn deliver(&self, message: &str, recipients: &[String]) -> OutpostResult<()> {
        if !self.is_configured() {
            return Err(OutpostError::IncompleteConfig);
        }
        if recipients.is_empty() {
            return Err(OutpostError::MailError("no recipients".to_string()));
        }
        let addr = format!("{}:{}", self.mta_host, self.mta_port);
        let stream = timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SEC),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| OutpostError::MailError(format!("timed out connecting to {}", addr)))?
        .map_err(|err| OutpostError::MailError(format!("failed to connect to {} - {}", addr, err)))?;
        timeout(
            Duration::from_secs(DIALOGUE_TIMEOUT_SEC),
            self.dialogue(stream, message, recipients),
        )
        .await
        .map_err(|_| OutpostError::MailError(format!("SMTP dialogue with {} timed out", addr)))?
    }

    async fn dialogue(
        &self,
        stream: TcpStream,
        message: &str,
        recipients: &[String],
    ) -> OutpostResult<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        expect_reply(&mut reader, "220").await?;
        write_half.write_all(b"HELO outpost\r\n").await?;
        expect_reply(&mut reader, "250").await?;
        write_half
            .write_all(format!("MAIL FROM:<{}>\r\n", self.mail_from).as_bytes())
            .await?;
        expect_reply(&mut reader, "250").await?;
        for recipient in recipients {
            write_half
                .write_all(format!("RCPT TO:<{}>\r\n", recipient).as_bytes())
                .await?;
            expect_reply(&mut reader, "250").await?;
        }
        write_half.write_all(b"DATA\r\n").await?;
        expect_reply(&mut reader, "354").await?;
        for line in message.lines() {
            // Dot-stuffing per RFC 5321
            if line.starts_with('.') {
                write_half.write_all(b".").await?;
            }
            write_half.write_all(line.as_bytes()).await?;
            write_half.write_all(b"\r\n").await?;
        }
        write_half.write_all(b".\r\n").await?;
        expect_reply(&mut reader, "250").await?;
        write_half.write_all(b"QUIT\r\n").await?;
        Ok(())
    }
}

/// Read one (possibly multi-line) SMTP reply and check its code.
async fn expect_reply<R>(reader: &mut BufReader<R>, code: &str) -> OutpostResult<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Err(OutpostError::MailError("connection closed by MTA".to_string()));
        }
        let line = line.trim_end();
        if line.len() >= 4 && line.as_bytes()[3] == b'-' {
            continue;
        }
        if line.starts_with(code) {
            return Ok(());
        }
        return Err(OutpostError::MailError(format!("MTA replied {:?}", line)));
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MailSendConfig {}

/// Mail-send feature: payload is `recipient` followed by the message text.
pub struct MailSend {
    mailer: Mailer,
}

impl MailSend {
    pub fn new(mailer: Mailer) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl Feature for MailSend {
    fn is_configured(&self) -> bool {
        self.mailer.is_configured()
    }

    fn trigger_prefix(&self) -> &'static str {
        ".m"
    }

    async fn self_test(&self) -> OutpostResult<()> {
        if !self.is_configured() {
            return Err(OutpostError::IncompleteConfig);
        }
        let addr = format!("{}:{}", self.mailer.mta_host, self.mailer.mta_port);
        timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SEC),
            TcpStream::connect(&addr),
        )
        .await
        .map_err(|_| OutpostError::MailError(format!("timed out dialing {}", addr)))?
        .map_err(|err| OutpostError::MailError(format!("dial {} - {}", addr, err)))?;
        Ok(())
    }

    fn initialise(&mut self) -> OutpostResult<()> {
        Ok(())
    }

    async fn execute(&self, cmd: &Command) -> CommandResult {
        let mut parts = cmd.content.splitn(2, char::is_whitespace);
        let recipient = parts.next().unwrap_or("").to_string();
        let body = parts.next().unwrap_or("").trim_start().to_string();
        if recipient.is_empty() || body.is_empty() {
            return CommandResult::from_error(OutpostError::FeatureError(
                "usage: recipient message...".to_string(),
            ));
        }
        match self
            .mailer
            .send("Message from outpost", &body, &[recipient])
            .await
        {
            Ok(()) => CommandResult::from_output(format!("sent {} characters", body.len())),
            Err(err) => CommandResult::from_error(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mailer_configuration_check() {
        assert!(!Mailer::default().is_configured());
        let mailer = Mailer {
            mail_from: "outpost@localhost".to_string(),
            mta_host: "127.0.0.1".to_string(),
            mta_port: 25,
        };
        assert!(mailer.is_configured());
    }

    #[tokio::test]
    async fn test_unconfigured_mailer_refuses_to_send() {
        let result = Mailer::default()
            .send("subject", "body", &["someone@localhost".to_string()])
            .await;
        assert_eq!(result, Err(OutpostError::IncompleteConfig));
    }

    #[tokio::test]
    async fn test_mail_send_feature_rejects_empty_payload() {
        let feature = MailSend::new(Mailer {
            mail_from: "outpost@localhost".to_string(),
            mta_host: "127.0.0.1".to_string(),
            mta_port: 25,
        });
        let result = feature.execute(&Command::new("", 10, "test")).await;
        assert!(result.error.is_some());
    }
}
