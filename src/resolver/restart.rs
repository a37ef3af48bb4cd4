//! Restart Coordinator: runs the configured resolver restart command and
//! waits for a health check to confirm the resolver came back.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use super::ResolverError;

/// A liveness probe supplied by the Health Checkers (C11), boxed so the
/// Restart Coordinator doesn't need a compile-time dependency on the health
/// module's concrete resolver-query type.
pub type HealthProbe = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

pub struct RestartCoordinator {
    command: Vec<String>,
    timeout: Duration,
    health_probe: Option<HealthProbe>,
    retry_interval: Duration,
    max_retries: u32,
}

impl RestartCoordinator {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            health_probe: None,
            retry_interval: Duration::from_millis(500),
            max_retries: 10,
        }
    }

    pub fn with_health_probe(mut self, probe: HealthProbe) -> Self {
        self.health_probe = Some(probe);
        self
    }

    /// Run the restart command, if one is configured, then wait for the
    /// health probe (if any) to report healthy within the retry budget.
    /// Skipped entirely when no command is configured — the resolver is
    /// assumed to be watching its config file for changes.
    pub async fn restart(&self) -> Result<(), ResolverError> {
        let Some((program, args)) = self.command.split_first() else {
            return Ok(());
        };

        let mut cmd = Command::new(program);
        cmd.args(args);

        let run = cmd.status();
        let status = timeout(self.timeout, run)
            .await
            .map_err(|_| ResolverError::RestartError("restart command timed out".to_owned()))?
            .map_err(|err| ResolverError::RestartError(err.to_string()))?;

        if !status.success() {
            return Err(ResolverError::RestartError(format!(
                "restart command exited with status {status}"
            )));
        }

        if let Some(probe) = &self.health_probe {
            self.wait_healthy(probe).await?;
        }

        Ok(())
    }

    async fn wait_healthy(&self, probe: &HealthProbe) -> Result<(), ResolverError> {
        for attempt in 0..self.max_retries {
            if probe().await {
                return Ok(());
            }
            if attempt + 1 < self.max_retries {
                tokio::time::sleep(self.retry_interval).await;
            }
        }
        Err(ResolverError::RestartError(
            "resolver did not become healthy after restart".to_owned(),
        ))
    }

    /// Placeholder for restoring a previous config generation. The spec
    /// leaves this path optional but requires a distinguishable error when
    /// it's invoked without an implementation.
    pub async fn rollback(&self, _backup_path: &camino::Utf8Path) -> Result<(), ResolverError> {
        Err(ResolverError::RollbackNotImplemented)
    }
}
