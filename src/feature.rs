// outpost: Feature registry - dispatch from trigger prefix to the unit that
// does the actual work

use crate::error::{OutpostError, OutpostResult};
use crate::mailer::{MailSend, MailSendConfig, Mailer};
use crate::pipeline::{Command, CommandResult, TRIGGER_PREFIX_LEN};
use crate::shell::{Shell, ShellConfig};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

/// A single executable unit dispatched by its two-character trigger prefix.
#[async_trait]
pub trait Feature: Send + Sync {
    /// Whether the feature has everything it needs to run.
    fn is_configured(&self) -> bool;

    /// Two-character, lower-case trigger, unique across enabled features.
    fn trigger_prefix(&self) -> &'static str;

    /// Cheap functional check used by the health report and /test endpoint.
    async fn self_test(&self) -> OutpostResult<()>;

    /// One-time setup before the feature enters the registry.
    fn initialise(&mut self) -> OutpostResult<()>;

    async fn execute(&self, cmd: &Command) -> CommandResult;
}

/// Feature-specific options bag from the `Features` config block.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FeaturesConfig {
    #[serde(rename = "Shell")]
    pub shell: Option<ShellConfig>,
    #[serde(rename = "MailSend")]
    pub mail_send: Option<MailSendConfig>,
}

/// Flat registry keyed by trigger prefix. Features that are present in the
/// configuration but report themselves unconfigured are left out.
pub struct FeatureSet {
    lookup_by_trigger: HashMap<&'static str, Arc<dyn Feature>>,
}

impl FeatureSet {
    pub fn from_config(config: &FeaturesConfig, mailer: Mailer) -> OutpostResult<Self> {
        let mut candidates: Vec<Box<dyn Feature>> = Vec::new();
        if let Some(shell_config) = &config.shell {
            candidates.push(Box::new(Shell::new(shell_config.clone())));
        }
        if config.mail_send.is_some() {
            candidates.push(Box::new(MailSend::new(mailer)));
        }

        let mut lookup_by_trigger: HashMap<&'static str, Arc<dyn Feature>> = HashMap::new();
        for mut feature in candidates {
            if !feature.is_configured() {
                continue;
            }
            feature.initialise()?;
            let trigger = feature.trigger_prefix();
            if trigger.len() != TRIGGER_PREFIX_LEN || trigger != trigger.to_lowercase() {
                return Err(OutpostError::ConfigError(format!(
                    "invalid trigger prefix {:?}",
                    trigger
                )));
            }
            if lookup_by_trigger
                .insert(trigger, Arc::from(feature))
                .is_some()
            {
                return Err(OutpostError::ConfigError(format!(
                    "duplicate trigger prefix {:?}",
                    trigger
                )));
            }
        }
        Ok(Self { lookup_by_trigger })
    }

    pub fn lookup(&self, trigger: &str) -> Option<&Arc<dyn Feature>> {
        self.lookup_by_trigger.get(trigger)
    }

    pub fn triggers(&self) -> Vec<&'static str> {
        let mut triggers: Vec<&'static str> = self.lookup_by_trigger.keys().copied().collect();
        triggers.sort_unstable();
        triggers
    }

    pub fn len(&self) -> usize {
        self.lookup_by_trigger.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lookup_by_trigger.is_empty()
    }

    /// Run every feature's self test concurrently and collect the failures
    /// as (trigger, error) pairs.
    pub async fn self_test_all(&self) -> Vec<(String, OutpostError)> {
        let checks = self
            .lookup_by_trigger
            .iter()
            .map(|(trigger, feature)| async move {
                (trigger.to_string(), feature.self_test().await)
            });
        let mut failures: Vec<(String, OutpostError)> = futures::future::join_all(checks)
            .await
            .into_iter()
            .filter_map(|(trigger, outcome)| outcome.err().map(|err| (trigger, err)))
            .collect();
        failures.sort_by(|a, b| a.0.cmp(&b.0));
        failures
    }
}
