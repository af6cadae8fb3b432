//! Child-process agent backend
//!
//! Spawns the configured CLI once per attempt with the prompt as its last
//! argument. There is no long-lived agent process.

use super::AgentBackend;
use crate::config::AgentConfig;
use crate::core::errors::AgentError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Cap on stderr carried into error messages
const STDERR_PREVIEW_CHARS: usize = 500;

pub struct CliAgent {
    command: PathBuf,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl CliAgent {
    pub fn new(command: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            working_dir: None,
            timeout: None,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            command: PathBuf::from(&config.command),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
            timeout: config.timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn command(&self, prompt: &str) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .arg(prompt)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl AgentBackend for CliAgent {
    fn name(&self) -> &str {
        self.command.to_str().unwrap_or("agent")
    }

    async fn run(&self, prompt: &str) -> Result<String, AgentError> {
        let started = Instant::now();
        let output = self.command(prompt).output();

        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, output).await {
                Ok(result) => result?,
                // Dropping the future kills the child (kill_on_drop)
                Err(_) => return Err(AgentError::Timeout(limit.as_secs())),
            },
            None => output.await?,
        };

        tracing::debug!(
            agent = %self.name(),
            code = ?output.status.code(),
            stdout_bytes = output.stdout.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Agent process exited"
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::Exit {
                code: output.status.code(),
                stderr: stderr.trim().chars().take(STDERR_PREVIEW_CHARS).collect(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
