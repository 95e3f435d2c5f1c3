// outpost: Supervisor - starts every enabled daemon and propagates the
// emergency lock-down

use crate::bot::TelegramBot;
use crate::config::Config;
use crate::dnsd::DnsDaemon;
use crate::error::{OutpostError, OutpostResult};
use crate::feature::FeatureSet;
use crate::health::HealthCheck;
use crate::httpd::HttpDaemon;
use crate::mailer::Mailer;
use crate::pipeline::{CommandPipeline, PipelineConfig};
use crate::ringlog::{DaemonLogger, LogBuffers};
use crate::smtpd::{MailDaemon, MailProcessor};
use crate::sockd::SockDaemon;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Process-wide capabilities handed to every daemon at construction: the
/// emergency lock-down flag, the log ring buffers and the cooperative
/// shutdown channel. Not ambient globals, so tests can instantiate fresh
/// instances.
#[derive(Clone)]
pub struct SharedState {
    lockdown: Arc<AtomicBool>,
    pub logs: LogBuffers,
    shutdown: watch::Sender<bool>,
}

impl SharedState {
    pub fn new(logs: LogBuffers) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            lockdown: Arc::new(AtomicBool::new(false)),
            logs,
            shutdown,
        }
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Ask every accept loop to return at its next iteration.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// The panic cord: every daemon's accept loop returns the lock-down
    /// sentinel on its next iteration.
    pub fn lock_down(&self) {
        self.lockdown.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(true);
    }

    pub fn is_locked_down(&self) -> bool {
        self.lockdown.load(Ordering::SeqCst)
    }

    /// What an accept loop should return once it has been woken up.
    pub fn exit_status(&self) -> OutpostResult<()> {
        if self.is_locked_down() {
            Err(OutpostError::EmergencyLockDown)
        } else {
            Ok(())
        }
    }
}

/// Builds every daemon whose configuration block is present and runs them
/// until they all stop, a daemon fails, or the process is told to stop.
pub struct Supervisor {
    config: Config,
    shared: SharedState,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shared: SharedState::new(LogBuffers::new()),
        }
    }

    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    fn build_pipeline(
        &self,
        config: &PipelineConfig,
        features: &Arc<FeatureSet>,
        mailer: &Mailer,
        front: &'static str,
    ) -> OutpostResult<Arc<CommandPipeline>> {
        let logger = DaemonLogger::new("PIPELINE", front, self.shared.logs.clone());
        Ok(Arc::new(CommandPipeline::new(
            config.clone(),
            features.clone(),
            mailer.clone(),
            logger,
        )?))
    }

    /// Launch the enabled daemons and block until they are done. A non-Ok
    /// return means the process should exit non-zero.
    pub async fn run(&self) -> OutpostResult<()> {
        let logger = DaemonLogger::new("SUPERVISOR", "", self.shared.logs.clone());
        let mailer = self.config.mailer.clone().unwrap_or_default();
        let features = Arc::new(FeatureSet::from_config(&self.config.features, mailer.clone())?);

        let mut daemons: JoinSet<(&'static str, OutpostResult<()>)> = JoinSet::new();

        if let Some(dns_config) = &self.config.dns_daemon {
            let daemon = Arc::new(DnsDaemon::new(dns_config.clone(), self.shared.clone())?);
            daemons.spawn(async move { ("DNSD", daemon.start_and_block().await) });
        }
        if let Some(http_config) = &self.config.http_daemon {
            let pipeline = match &self.config.http_bridges {
                Some(bridges) => Some(self.build_pipeline(bridges, &features, &mailer, "httpd")?),
                None => None,
            };
            let daemon = Arc::new(HttpDaemon::new(
                http_config.clone(),
                self.config.http_handlers.clone(),
                pipeline,
                features.clone(),
                mailer.clone(),
                self.shared.clone(),
            )?);
            daemons.spawn(async move { ("HTTPD", daemon.start_and_block().await) });
        }
        if let Some(mail_config) = &self.config.mail_daemon {
            let processor = match (&self.config.mail_processor, &self.config.mail_processor_bridges)
            {
                (Some(processor_config), Some(bridges)) => {
                    let pipeline = self.build_pipeline(bridges, &features, &mailer, "smtpd")?;
                    Some(Arc::new(MailProcessor::new(
                        processor_config.clone(),
                        pipeline,
                        mailer.clone(),
                        DaemonLogger::new("MAILPROC", "", self.shared.logs.clone()),
                    )))
                }
                _ => None,
            };
            let daemon = Arc::new(MailDaemon::new(
                mail_config.clone(),
                processor,
                mailer.clone(),
                self.shared.clone(),
            )?);
            daemons.spawn(async move { ("SMTPD", daemon.start_and_block().await) });
        }
        if let Some(sock_config) = &self.config.sock_daemon {
            let daemon = Arc::new(SockDaemon::new(sock_config.clone(), self.shared.clone())?);
            daemons.spawn(async move { ("SOCKD", daemon.start_and_block().await) });
        }
        if let Some(bot_config) = &self.config.telegram_bot {
            let bridges = self.config.telegram_bot_bridges.as_ref().ok_or_else(|| {
                OutpostError::ConfigError(
                    "TelegramBot is enabled but TelegramBotBridges is absent".to_string(),
                )
            })?;
            let pipeline = self.build_pipeline(bridges, &features, &mailer, "telegram")?;
            let daemon = Arc::new(TelegramBot::new(
                bot_config.clone(),
                pipeline,
                self.shared.clone(),
            )?);
            daemons.spawn(async move { ("TELEGRAM", daemon.start_and_block().await) });
        }
        if let Some(health_config) = &self.config.health_check {
            let daemon = Arc::new(HealthCheck::new(
                health_config.clone(),
                features.clone(),
                mailer.clone(),
                self.shared.clone(),
            ));
            daemons.spawn(async move { ("HEALTH", daemon.start_and_block().await) });
        }
        if daemons.is_empty() {
            return Err(OutpostError::ConfigError(
                "no daemon is enabled in the configuration".to_string(),
            ));
        }

        let signal_shared = self.shared.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                signal_shared.request_shutdown();
            }
        });

        let mut failure: Option<OutpostError> = None;
        while let Some(joined) = daemons.join_next().await {
            match joined {
                Ok((name, Ok(()))) => {
                    logger.info("run", name, "daemon has stopped");
                }
                Ok((name, Err(err))) => {
                    logger.warning("run", name, &format!("daemon failed - {}", err));
                    if failure.is_none() {
                        failure = Some(err);
                    }
                    self.shared.request_shutdown();
                }
                Err(join_err) => {
                    logger.warning("run", "", &format!("daemon task died - {}", join_err));
                    if failure.is_none() {
                        failure = Some(OutpostError::NetworkError(join_err.to_string()));
                    }
                    self.shared.request_shutdown();
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => self.shared.exit_status(),
        }
    }
}
