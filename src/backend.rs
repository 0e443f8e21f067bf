//! Inference backend supervision
//!
//! Makes sure a llama-server instance is healthy before the first completion
//! request. An externally managed server is detected by a health probe and
//! left alone; otherwise one is spawned and polled until ready.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::config::BackendConfig;
use crate::Result;

/// Health probe timeout
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Delay between health polls while the spawned server loads its model
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Supervision state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Nothing known yet
    Unknown,
    /// Health probe in flight
    Probing,
    /// Server spawned, waiting for it to become healthy
    Spawning,
    /// Server answered the health probe
    Healthy,
    /// Spawned server never became healthy
    Failed,
}

/// Supervises the llama-server process.
///
/// The supervisor is the only authority over state transitions; callers hold
/// it exclusively, so two tasks in this process can never double-spawn. A
/// second orchestrator process racing the probe remains possible and is
/// accepted as best-effort.
pub struct BackendSupervisor {
    config: BackendConfig,
    client: reqwest::Client,
    state: SupervisorState,
    child: Option<Child>,
}

impl BackendSupervisor {
    /// Create a supervisor for the configured backend
    ///
    /// # Errors
    ///
    /// Returns error if the probe HTTP client cannot be constructed; a
    /// client without the probe timeout would hang `ensure_ready`.
    pub fn new(config: BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;

        Ok(Self {
            config,
            client,
            state: SupervisorState::Unknown,
            child: None,
        })
    }

    /// Current supervision state
    #[must_use]
    pub const fn state(&self) -> SupervisorState {
        self.state
    }

    /// Ensure a healthy server, spawning one if necessary.
    ///
    /// Idempotent: returns immediately once healthy. A previous failure is
    /// not sticky across calls — the next call re-probes, which lets an
    /// operator start the server by hand after the orchestrator came up.
    /// Returns `false` when the server never became healthy; callers treat
    /// that as degraded service, not a fatal error.
    pub async fn ensure_ready(&mut self) -> bool {
        if self.state == SupervisorState::Healthy {
            return true;
        }

        self.state = SupervisorState::Probing;
        if self.probe().await {
            tracing::info!(port = self.config.port, "llama-server already running");
            self.state = SupervisorState::Healthy;
            return true;
        }

        match self.spawn() {
            Ok(child) => {
                self.child = Some(child);
                self.state = SupervisorState::Spawning;
            }
            Err(e) => {
                tracing::error!(
                    bin = %self.config.server_bin.display(),
                    error = %e,
                    "failed to spawn llama-server"
                );
                self.state = SupervisorState::Failed;
                return false;
            }
        }

        tracing::info!("waiting for llama-server to load model");
        for _ in 0..self.config.startup_timeout_secs {
            if self.probe().await {
                tracing::info!(port = self.config.port, "llama-server ready");
                self.state = SupervisorState::Healthy;
                return true;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        tracing::error!(
            timeout_secs = self.config.startup_timeout_secs,
            "llama-server failed to become healthy"
        );
        self.state = SupervisorState::Failed;
        false
    }

    /// One health probe against `GET /health`
    async fn probe(&self) -> bool {
        let url = format!("http://127.0.0.1:{}/health", self.config.port);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Spawn the server with fixed resource parameters, all stdio detached
    fn spawn(&self) -> std::io::Result<Child> {
        Command::new(&self.config.server_bin)
            .arg("-m")
            .arg(&self.config.model)
            .args(["--port", &self.config.port.to_string()])
            .args(["--ctx-size", &self.config.ctx_size.to_string()])
            .args(["--threads", &self.config.threads.to_string()])
            .args(["--threads-batch", &self.config.threads.to_string()])
            .args(["--batch-size", &self.config.batch_size.to_string()])
            .args(["--flash-attn", "on"])
            .arg("--mlock")
            .arg("--log-disable")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    fn unreachable_config() -> BackendConfig {
        BackendConfig {
            // nothing listens here and the binary does not exist
            server_bin: "/nonexistent/llama-server".into(),
            port: 1,
            startup_timeout_secs: 1,
            ..BackendConfig::default()
        }
    }

    #[tokio::test]
    async fn failed_spawn_reports_degraded_not_panic() {
        let mut supervisor = BackendSupervisor::new(unreachable_config()).unwrap();
        assert_eq!(supervisor.state(), SupervisorState::Unknown);

        assert!(!supervisor.ensure_ready().await);
        assert_eq!(supervisor.state(), SupervisorState::Failed);
    }

    #[tokio::test]
    async fn failure_is_not_sticky() {
        let mut supervisor = BackendSupervisor::new(unreachable_config()).unwrap();
        assert!(!supervisor.ensure_ready().await);

        // a later call starts over from a fresh probe
        assert!(!supervisor.ensure_ready().await);
        assert_eq!(supervisor.state(), SupervisorState::Failed);
    }
}
