// outpost: Periodic health check - port reachability, feature self tests,
// emailed report

use crate::error::{OutpostError, OutpostResult};
use crate::feature::FeatureSet;
use crate::mailer::Mailer;
use crate::ringlog::DaemonLogger;
use crate::supervisor::SharedState;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

const PORT_DIAL_TIMEOUT_SEC: u64 = 5;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HealthCheckConfig {
    /// Loopback TCP ports expected to accept connections
    #[serde(rename = "TCPPorts", default)]
    pub tcp_ports: Vec<u16>,
    #[serde(rename = "IntervalSec", default)]
    pub interval_sec: u64,
    #[serde(rename = "Recipients", default)]
    pub recipients: Vec<String>,
}

/// Periodically dials the configured ports, self-tests every feature and
/// mails a report with a digest of recent warnings.
pub struct HealthCheck {
    config: HealthCheckConfig,
    features: Arc<FeatureSet>,
    mailer: Mailer,
    logger: DaemonLogger,
    shared: SharedState,
}

impl HealthCheck {
    pub fn new(
        config: HealthCheckConfig,
        features: Arc<FeatureSet>,
        mailer: Mailer,
        shared: SharedState,
    ) -> Self {
        let logger = DaemonLogger::new("HEALTH", "", shared.logs.clone());
        Self {
            config,
            features,
            mailer,
            logger,
            shared,
        }
    }

    async fn dial_port(port: u16) -> bool {
        timeout(
            Duration::from_secs(PORT_DIAL_TIMEOUT_SEC),
            TcpStream::connect(("127.0.0.1", port)),
        )
        .await
        .map(|dialed| dialed.is_ok())
        .unwrap_or(false)
    }

    /// Run every check once and mail the report. True iff everything passed.
    pub async fn execute(&self) -> bool {
        let mut port_failures = Vec::new();
        for &port in &self.config.tcp_ports {
            if !Self::dial_port(port).await {
                port_failures.push(port);
            }
        }
        let feature_failures = self.features.self_test_all().await;
        let all_ok = port_failures.is_empty() && feature_failures.is_empty();

        let mut report = String::new();
        report.push_str(if all_ok { "All checks OK\n" } else { "Some checks failed\n" });
        if !port_failures.is_empty() {
            report.push_str(&format!("Unreachable TCP ports: {:?}\n", port_failures));
        }
        for (trigger, err) in &feature_failures {
            report.push_str(&format!("Feature {} failed: {}\n", trigger, err));
        }
        report.push_str("\nRecent warnings:\n");
        for line in self.shared.logs.warnings.snapshot() {
            report.push_str(&line);
            report.push('\n');
        }
        if self.mailer.is_configured() && !self.config.recipients.is_empty() {
            let subject = if all_ok {
                "outpost health check OK"
            } else {
                "outpost health check FAILED"
            };
            if let Err(err) = self
                .mailer
                .send(subject, &report, &self.config.recipients)
                .await
            {
                self.logger
                    .warning("execute", "", &format!("failed to send report - {}", err));
            }
        }
        if !all_ok {
            self.logger.warning("execute", "", "some checks failed");
        }
        all_ok
    }

    /// Run checks on the configured interval until shutdown or lockdown.
    pub async fn start_and_block(&self) -> OutpostResult<()> {
        self.logger.info(
            "start_and_block",
            "",
            &format!("going to check every {} seconds", self.config.interval_sec),
        );
        let mut shutdown = self.shared.subscribe_shutdown();
        // interval() refuses a zero period
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.interval_sec.max(1)));
        loop {
            if self.shared.is_locked_down() {
                return Err(OutpostError::EmergencyLockDown);
            }
            tokio::select! {
                _ = shutdown.changed() => return self.shared.exit_status(),
                _ = ticker.tick() => {
                    self.execute().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{FeatureSet, FeaturesConfig};
    use crate::ringlog::LogBuffers;
    use serde_json::json;

    fn health_with_ports(ports: Vec<u16>) -> HealthCheck {
        let features_config: FeaturesConfig =
            serde_json::from_value(json!({"Shell": {"InterpreterPath": "/bin/sh"}})).unwrap();
        let features =
            Arc::new(FeatureSet::from_config(&features_config, Mailer::default()).unwrap());
        HealthCheck::new(
            HealthCheckConfig {
                tcp_ports: ports,
                interval_sec: 300,
                recipients: Vec::new(),
            },
            features,
            Mailer::default(),
            SharedState::new(LogBuffers::new()),
        )
    }

    #[tokio::test]
    async fn test_execute_passes_with_listening_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        let check = health_with_ports(vec![port]);
        assert!(check.execute().await);
    }

    #[tokio::test]
    async fn test_execute_fails_with_dead_port() {
        // Bind and immediately drop to find a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let check = health_with_ports(vec![port]);
        assert!(!check.execute().await);
    }
}
