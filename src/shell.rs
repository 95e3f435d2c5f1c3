// outpost: Shell feature - run the command payload under an interpreter

use crate::error::{OutpostError, OutpostResult};
use crate::feature::Feature;
use crate::pipeline::{Command, CommandResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;

#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    #[serde(rename = "InterpreterPath", default = "ShellConfig::default_interpreter")]
    pub interpreter_path: String,
}

impl ShellConfig {
    fn default_interpreter() -> String {
        "/bin/sh".to_string()
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            interpreter_path: Self::default_interpreter(),
        }
    }
}

/// Executes the payload as `interpreter -c <payload>` and returns combined
/// stdout and stderr. The pipeline enforces the command timeout; the spawned
/// process is killed when the execution future is dropped.
pub struct Shell {
    config: ShellConfig,
}

impl Shell {
    pub fn new(config: ShellConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Feature for Shell {
    fn is_configured(&self) -> bool {
        !self.config.interpreter_path.is_empty()
    }

    fn trigger_prefix(&self) -> &'static str {
        ".s"
    }

    async fn self_test(&self) -> OutpostResult<()> {
        if !self.is_configured() {
            return Err(OutpostError::IncompleteConfig);
        }
        let result = self
            .execute(&Command::new("printf shell-self-test", 10, "selftest"))
            .await;
        match result.error {
            None if result.output == "shell-self-test" => Ok(()),
            None => Err(OutpostError::FeatureError(format!(
                "unexpected self test output {:?}",
                result.output
            ))),
            Some(err) => Err(err),
        }
    }

    fn initialise(&mut self) -> OutpostResult<()> {
        if !std::path::Path::new(&self.config.interpreter_path).exists() {
            return Err(OutpostError::ConfigError(format!(
                "interpreter {:?} does not exist",
                self.config.interpreter_path
            )));
        }
        Ok(())
    }

    async fn execute(&self, cmd: &Command) -> CommandResult {
        let spawned = tokio::process::Command::new(&self.config.interpreter_path)
            .arg("-c")
            .arg(&cmd.content)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;
        match spawned {
            Ok(output) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                let error = if output.status.success() {
                    None
                } else {
                    Some(OutpostError::FeatureError(format!(
                        "exit status {}",
                        output.status.code().unwrap_or(-1)
                    )))
                };
                let mut result = CommandResult {
                    error,
                    output: combined,
                    ..Default::default()
                };
                result.reset_combined_text();
                result
            }
            Err(err) => CommandResult::from_error(OutpostError::FeatureError(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_captures_stdout() {
        let shell = Shell::new(ShellConfig::default());
        let result = shell.execute(&Command::new("echo hello", 10, "test")).await;
        assert_eq!(result.error, None);
        assert_eq!(result.output, "hello\n");
    }

    #[tokio::test]
    async fn test_execute_reports_exit_status() {
        let shell = Shell::new(ShellConfig::default());
        let result = shell.execute(&Command::new("exit 3", 10, "test")).await;
        assert_eq!(
            result.error,
            Some(OutpostError::FeatureError("exit status 3".to_string()))
        );
    }

    #[tokio::test]
    async fn test_self_test_passes_with_real_interpreter() {
        let shell = Shell::new(ShellConfig::default());
        assert!(shell.self_test().await.is_ok());
    }

    #[test]
    fn test_initialise_rejects_missing_interpreter() {
        let mut shell = Shell::new(ShellConfig {
            interpreter_path: "/nonexistent/interpreter".to_string(),
        });
        assert!(shell.initialise().is_err());
    }
}
