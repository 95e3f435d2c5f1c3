// outpost: Command pipeline - the ordered transformer chain between wire
// parsing and feature execution

use crate::error::{OutpostError, OutpostResult};
use crate::feature::FeatureSet;
use crate::mailer::Mailer;
use crate::ringlog::DaemonLogger;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Length of a feature trigger prefix
pub const TRIGGER_PREFIX_LEN: usize = 2;

/// An immutable command record shaped from wire input.
#[derive(Debug, Clone)]
pub struct Command {
    /// Raw UTF-8 text as extracted from the wire
    pub content: String,
    /// Upper bound on feature execution, seconds
    pub timeout_sec: u64,
    /// Tag identifying the originating front
    pub daemon_name: &'static str,
}

impl Command {
    pub fn new(content: impl Into<String>, timeout_sec: u64, daemon_name: &'static str) -> Self {
        Self {
            content: content.into(),
            timeout_sec,
            daemon_name,
        }
    }
}

/// The outcome paired with each command. `combined_text` is the surface fed
/// back onto the wire.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub error: Option<OutpostError>,
    pub output: String,
    pub combined_text: String,
}

impl CommandResult {
    pub fn reset_combined_text(&mut self) {
        self.combined_text = match &self.error {
            Some(err) => format!("Error: {}", err),
            None => self.output.clone(),
        };
    }

    pub fn from_error(error: OutpostError) -> Self {
        let mut result = CommandResult {
            error: Some(error),
            ..Default::default()
        };
        result.reset_combined_text();
        result
    }

    pub fn from_output(output: impl Into<String>) -> Self {
        let mut result = CommandResult {
            error: None,
            output: output.into(),
            ..Default::default()
        };
        result.reset_combined_text();
        result
    }
}

/// Ordered (from, to) substitutions applied to inbound text.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TranslateSequences {
    #[serde(rename = "Sequences", default)]
    pub sequences: Vec<(String, String)>,
}

/// The shared secret and the shortcut aliases that gate command execution.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PinAndShortcuts {
    #[serde(rename = "PIN", default)]
    pub pin: String,
    #[serde(rename = "Shortcuts", default)]
    pub shortcuts: HashMap<String, String>,
}

/// Recipients of the fire-and-forget command notification email.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct NotifyViaEmail {
    #[serde(rename = "Recipients", default)]
    pub recipients: Vec<String>,
}

/// Post-processing applied to the combined result text, in field order.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LintText {
    #[serde(rename = "TrimSpaces", default)]
    pub trim_spaces: bool,
    #[serde(rename = "CompressToSingleLine", default)]
    pub compress_to_single_line: bool,
    #[serde(rename = "KeepVisible7BitCharOnly", default)]
    pub keep_visible_7bit_char_only: bool,
    #[serde(rename = "CompressSpaces", default)]
    pub compress_spaces: bool,
    /// 0 = no cap
    #[serde(rename = "MaxLength", default)]
    pub max_length: usize,
}

impl LintText {
    pub fn apply(&self, text: &str) -> String {
        let mut text = text.to_string();
        if self.trim_spaces {
            text = text.trim().to_string();
        }
        if self.compress_to_single_line {
            text = text.replace("\r\n", ";").replace(['\r', '\n'], ";");
        }
        if self.keep_visible_7bit_char_only {
            text.retain(|c| (' '..='~').contains(&c));
        }
        if self.compress_spaces {
            let mut compressed = String::with_capacity(text.len());
            let mut in_space = false;
            for c in text.chars() {
                if c.is_whitespace() {
                    if !in_space {
                        compressed.push(' ');
                    }
                    in_space = true;
                } else {
                    compressed.push(c);
                    in_space = false;
                }
            }
            text = compressed;
        }
        if self.max_length > 0 && text.len() > self.max_length {
            let mut cut = self.max_length;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }
        text
    }
}

/// Per-front pipeline configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PipelineConfig {
    #[serde(rename = "TranslateSequences", default)]
    pub translate_sequences: TranslateSequences,
    #[serde(rename = "PINAndShortcuts", default)]
    pub pin_and_shortcuts: PinAndShortcuts,
    #[serde(rename = "NotifyViaEmail", default)]
    pub notify_via_email: NotifyViaEmail,
    #[serde(rename = "LintText", default)]
    pub lint_text: LintText,
}

/// The ordered chain of stateless transformers around a feature invocation:
/// translate in, trim, PIN/shortcut match, dispatch with timeout, lint out,
/// notify. Stateless per invocation; concurrent calls are fine.
pub struct CommandPipeline {
    config: PipelineConfig,
    features: Arc<FeatureSet>,
    mailer: Mailer,
    logger: DaemonLogger,
}

impl CommandPipeline {
    /// A pipeline with an empty PIN and no shortcuts would run anything sent
    /// to it, so that combination is rejected here.
    pub fn new(
        config: PipelineConfig,
        features: Arc<FeatureSet>,
        mailer: Mailer,
        logger: DaemonLogger,
    ) -> OutpostResult<Self> {
        if config.pin_and_shortcuts.pin.is_empty() && config.pin_and_shortcuts.shortcuts.is_empty() {
            return Err(OutpostError::ConfigError(
                "pipeline needs a PIN or at least one shortcut".to_string(),
            ));
        }
        Ok(Self {
            config,
            features,
            mailer,
            logger,
        })
    }

    /// Apply the PIN/shortcut gate. On success the returned string is the
    /// feature invocation text; on failure the input did not authenticate.
    fn match_pin_or_shortcut(&self, content: &str) -> OutpostResult<String> {
        let gate = &self.config.pin_and_shortcuts;
        if !gate.pin.is_empty() {
            if let Some(rest) = content.strip_prefix(&gate.pin) {
                if let Some(expansion) = gate.shortcuts.get(rest.trim()) {
                    return Ok(expansion.clone());
                }
                return Ok(rest.trim_start().to_string());
            }
        }
        if let Some(expansion) = gate.shortcuts.get(content.trim()) {
            return Ok(expansion.clone());
        }
        Err(OutpostError::PinAndShortcutNotFound)
    }

    async fn dispatch(&self, cmd: &Command) -> CommandResult {
        if cmd.content.len() < TRIGGER_PREFIX_LEN || !cmd.content.is_char_boundary(TRIGGER_PREFIX_LEN)
        {
            return CommandResult::from_error(OutpostError::BadPrefix);
        }
        let (prefix, payload) = cmd.content.split_at(TRIGGER_PREFIX_LEN);
        let feature = match self.features.lookup(prefix) {
            Some(feature) => feature,
            None => return CommandResult::from_error(OutpostError::BadPrefix),
        };
        let invocation = Command::new(payload.trim_start(), cmd.timeout_sec, cmd.daemon_name);
        match tokio::time::timeout(
            Duration::from_secs(cmd.timeout_sec),
            feature.execute(&invocation),
        )
        .await
        {
            Ok(mut result) => {
                result.reset_combined_text();
                result
            }
            Err(_) => CommandResult::from_error(OutpostError::FeatureTimeout),
        }
    }

    fn notify(&self, cmd: &Command, result: &CommandResult) {
        let recipients = self.config.notify_via_email.recipients.clone();
        if recipients.is_empty() || !self.mailer.is_configured() {
            return;
        }
        let mailer = self.mailer.clone();
        let logger = self.logger.clone();
        let subject = format!("outpost {} has run a command", cmd.daemon_name);
        let body = format!("Command: {}\n\nOutput:\n{}", cmd.content, result.combined_text);
        tokio::spawn(async move {
            if let Err(err) = mailer.send(&subject, &body, &recipients).await {
                logger.warning("notify", "", &format!("failed to send notification - {}", err));
            }
        });
    }

    /// Run the full chain over one command. Always returns a result; stages
    /// that reject short-circuit before any feature is invoked.
    pub async fn transform(&self, mut cmd: Command) -> (Command, CommandResult) {
        for (from, to) in &self.config.translate_sequences.sequences {
            cmd.content = cmd.content.replace(from, to);
        }
        cmd.content = cmd.content.trim().to_string();
        match self.match_pin_or_shortcut(&cmd.content) {
            Ok(invocation) => cmd.content = invocation,
            Err(err) => {
                let mut result = CommandResult::from_error(err);
                result.combined_text = self.config.lint_text.apply(&result.combined_text);
                return (cmd, result);
            }
        }
        let mut result = self.dispatch(&cmd).await;
        result.combined_text = self.config.lint_text.apply(&result.combined_text);
        self.logger.info(
            "transform",
            cmd.daemon_name,
            &format!("command has run with result: {}", result.combined_text),
        );
        self.notify(&cmd, &result);
        (cmd, result)
    }
}
