// outpost: Configuration - one JSON document, one optional block per daemon

use crate::bot::TelegramBotConfig;
use crate::dnsd::DnsDaemonConfig;
use crate::error::{OutpostError, OutpostResult};
use crate::feature::FeaturesConfig;
use crate::health::HealthCheckConfig;
use crate::httpd::{HttpDaemonConfig, HttpHandlersConfig};
use crate::mailer::Mailer;
use crate::pipeline::PipelineConfig;
use crate::smtpd::{MailDaemonConfig, MailProcessorConfig};
use crate::sockd::SockDaemonConfig;
use serde::Deserialize;

/// The whole configuration tree. Presence of a daemon block enables that
/// daemon; each front carries its own pipeline block.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(rename = "Features", default)]
    pub features: FeaturesConfig,
    #[serde(rename = "Mailer")]
    pub mailer: Option<Mailer>,
    #[serde(rename = "DNSDaemon")]
    pub dns_daemon: Option<DnsDaemonConfig>,
    #[serde(rename = "HTTPDaemon")]
    pub http_daemon: Option<HttpDaemonConfig>,
    #[serde(rename = "HTTPHandlers", default)]
    pub http_handlers: HttpHandlersConfig,
    #[serde(rename = "HTTPBridges")]
    pub http_bridges: Option<PipelineConfig>,
    #[serde(rename = "MailDaemon")]
    pub mail_daemon: Option<MailDaemonConfig>,
    #[serde(rename = "MailProcessor")]
    pub mail_processor: Option<MailProcessorConfig>,
    #[serde(rename = "MailProcessorBridges")]
    pub mail_processor_bridges: Option<PipelineConfig>,
    #[serde(rename = "SockDaemon")]
    pub sock_daemon: Option<SockDaemonConfig>,
    #[serde(rename = "TelegramBot")]
    pub telegram_bot: Option<TelegramBotConfig>,
    #[serde(rename = "TelegramBotBridges")]
    pub telegram_bot_bridges: Option<PipelineConfig>,
    #[serde(rename = "HealthCheck")]
    pub health_check: Option<HealthCheckConfig>,
}

impl Config {
    pub fn from_json(document: &[u8]) -> OutpostResult<Self> {
        Ok(serde_json::from_slice(document)?)
    }

    pub fn from_file(path: &str) -> OutpostResult<Self> {
        let document = std::fs::read(path).map_err(|err| {
            OutpostError::ConfigError(format!("cannot read config file {} - {}", path, err))
        })?;
        Self::from_json(&document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_document_deserialises() {
        let document = r#"{
  "Features": {
    "Shell": {"InterpreterPath": "/bin/sh"}
  },
  "Mailer": {"MailFrom": "outpost@localhost", "MTAHost": "127.0.0.1", "MTAPort": 25},
  "DNSDaemon": {
    "ListenAddress": "127.0.0.1",
    "ListenPort": 61211,
    "ForwardTo": "8.8.8.8",
    "AllowQueryIPPrefixes": ["127.0"],
    "PerIPLimit": 10
  },
  "HTTPDaemon": {
    "ListenAddress": "127.0.0.1",
    "ListenPort": 23486,
    "BaseRateLimit": 10,
    "ServeDirectories": {"/my/dir": "/tmp/served"}
  },
  "HTTPHandlers": {
    "IndexEndpoints": ["/", "/index.html"],
    "IndexEndpointConfig": {"HTMLFilePath": "/tmp/index.html"},
    "CommandFormEndpoint": "/cmd_form",
    "MailMeEndpoint": "/mail_me",
    "MailMeEndpointConfig": {"Recipients": ["howard@localhost"]},
    "WebProxyEndpoint": "/proxy",
    "SelfTestEndpoint": "/test",
    "InformationEndpoint": "/info",
    "TwilioSMSEndpoint": "/sms",
    "TwilioCallEndpoint": "/call",
    "TwilioCallEndpointConfig": {"CallGreeting": "Hi there"}
  },
  "HTTPBridges": {
    "TranslateSequences": {"Sequences": [["alpha", "beta"]]},
    "PINAndShortcuts": {"PIN": "httpsecret", "Shortcuts": {"shortcut": ".s echo shortcut"}},
    "NotifyViaEmail": {"Recipients": ["howard@localhost"]},
    "LintText": {"TrimSpaces": true, "CompressToSingleLine": true, "MaxLength": 35}
  },
  "MailDaemon": {
    "ListenAddress": "127.0.0.1",
    "ListenPort": 18573,
    "PerIPLimit": 10,
    "ForwardTo": ["howard@localhost", "root@localhost"]
  },
  "MailProcessor": {"CommandTimeoutSec": 10},
  "MailProcessorBridges": {
    "PINAndShortcuts": {"PIN": "mailsecret", "Shortcuts": {"mailshortcut": ".s echo mail"}},
    "LintText": {"TrimSpaces": true, "MaxLength": 70}
  },
  "SockDaemon": {
    "ListenAddress": "127.0.0.1",
    "ListenPort": 6891,
    "PerIPLimit": 10,
    "Password": "1234567"
  },
  "TelegramBot": {"AuthorizationToken": "dummy-token"},
  "TelegramBotBridges": {
    "PINAndShortcuts": {"PIN": "telegramsecret"},
    "LintText": {"TrimSpaces": true, "MaxLength": 120}
  },
  "HealthCheck": {"TCPPorts": [9114], "IntervalSec": 300, "Recipients": ["howard@localhost"]}
}"#;
        let config = Config::from_json(document.as_bytes()).expect("deserialise");
        assert!(config.features.shell.is_some());
        assert_eq!(config.dns_daemon.as_ref().unwrap().listen_port, 61211);
        assert_eq!(
            config.dns_daemon.as_ref().unwrap().allow_query_ip_prefixes,
            vec!["127.0"]
        );
        assert_eq!(config.http_daemon.as_ref().unwrap().base_rate_limit, 10);
        assert_eq!(config.http_handlers.index_endpoints.len(), 2);
        let bridges = config.http_bridges.as_ref().unwrap();
        assert_eq!(bridges.pin_and_shortcuts.pin, "httpsecret");
        assert_eq!(
            bridges.translate_sequences.sequences,
            vec![("alpha".to_string(), "beta".to_string())]
        );
        assert_eq!(bridges.lint_text.max_length, 35);
        assert_eq!(config.mail_daemon.as_ref().unwrap().forward_to.len(), 2);
        assert_eq!(config.sock_daemon.as_ref().unwrap().password, "1234567");
        assert_eq!(config.health_check.as_ref().unwrap().tcp_ports, vec![9114]);
    }

    #[test]
    fn test_empty_document_has_no_daemons() {
        let config = Config::from_json(b"{}").expect("deserialise");
        assert!(config.dns_daemon.is_none());
        assert!(config.http_daemon.is_none());
        assert!(config.mail_daemon.is_none());
        assert!(config.sock_daemon.is_none());
        assert!(config.telegram_bot.is_none());
        assert!(config.health_check.is_none());
    }

    #[test]
    fn test_malformed_document_is_a_config_error() {
        assert!(Config::from_json(b"not json at all").is_err());
    }
}
