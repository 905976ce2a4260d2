use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use warden_common::WardenError;

#[derive(Error, Debug, Clone)]
pub enum ReadinessError {
    #[error("{target} not ready after {waited:?}: {last}")]
    TimedOut {
        target: String,
        waited: Duration,
        last: String,
    },

    #[error("{target} failed readiness after {failures} consecutive failures: {message}")]
    Failed {
        target: String,
        failures: u32,
        message: String,
    },

    #[error("readiness wait for {0} cancelled")]
    Cancelled(String),
}

impl From<ReadinessError> for WardenError {
    fn from(err: ReadinessError) -> Self {
        let target = match &err {
            ReadinessError::TimedOut { target, .. }
            | ReadinessError::Failed { target, .. }
            | ReadinessError::Cancelled(target) => target.clone(),
        };
        WardenError::backend("wait for readiness", target, err)
    }
}

/// Readiness check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    pub check_interval: Duration,
    pub initial_delay: Duration,
    pub timeout: Duration,
    /// Extra wait after the first successful check, for targets that report ready
    /// slightly before they accept work.
    pub settle: Duration,
    pub failure_threshold: u32,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            initial_delay: Duration::ZERO,
            timeout: Duration::from_secs(10 * 60),
            settle: Duration::from_secs(30),
            failure_threshold: 3,
        }
    }
}

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    /// Not ready yet; keep polling.
    Pending(String),
    /// Counted against the failure threshold.
    Failed(String),
}

#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn check(&self) -> ProbeOutcome;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessStatus {
    pub ready: bool,
    pub checks_performed: u32,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub message: String,
}

impl Default for ReadinessStatus {
    fn default() -> Self {
        Self {
            ready: false,
            checks_performed: 0,
            consecutive_failures: 0,
            last_check: None,
            message: "Not checked yet".to_string(),
        }
    }
}

/// Polls a probe at a fixed interval until it reports ready, the timeout elapses,
/// or the caller cancels.
pub struct ReadinessChecker {
    config: ReadinessConfig,
    status: ReadinessStatus,
}

impl ReadinessChecker {
    pub fn new(config: ReadinessConfig) -> Self {
        Self {
            config,
            status: ReadinessStatus::default(),
        }
    }

    pub fn status(&self) -> &ReadinessStatus {
        &self.status
    }

    pub async fn wait_for_ready(
        &mut self,
        target: &str,
        probe: &dyn ReadinessProbe,
        cancel: &CancellationToken,
    ) -> Result<ReadinessStatus, ReadinessError> {
        let waited = self.config.timeout;
        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            res = timeout(waited, self.poll(target, probe)) => Some(res),
        };
        let status = match polled {
            None => return Err(ReadinessError::Cancelled(target.to_string())),
            Some(Ok(inner)) => inner?,
            Some(Err(_)) => {
                return Err(ReadinessError::TimedOut {
                    target: target.to_string(),
                    waited,
                    last: self.status.message.clone(),
                })
            }
        };

        if self.config.settle > Duration::ZERO {
            debug!(target, settle = ?self.config.settle, "Target ready, settling");
            tokio::select! {
                _ = cancel.cancelled() => return Err(ReadinessError::Cancelled(target.to_string())),
                _ = sleep(self.config.settle) => {}
            }
        }
        info!(target, checks = status.checks_performed, "Target is ready");
        Ok(status)
    }

    async fn poll(
        &mut self,
        target: &str,
        probe: &dyn ReadinessProbe,
    ) -> Result<ReadinessStatus, ReadinessError> {
        if self.config.initial_delay > Duration::ZERO {
            sleep(self.config.initial_delay).await;
        }

        loop {
            let outcome = probe.check().await;
            self.update_status(&outcome);

            if self.status.ready {
                return Ok(self.status.clone());
            }
            if self.status.consecutive_failures >= self.config.failure_threshold {
                return Err(ReadinessError::Failed {
                    target: target.to_string(),
                    failures: self.status.consecutive_failures,
                    message: self.status.message.clone(),
                });
            }
            debug!(target, message = %self.status.message, "Not ready yet");
            sleep(self.config.check_interval).await;
        }
    }

    fn update_status(&mut self, outcome: &ProbeOutcome) {
        self.status.checks_performed += 1;
        self.status.last_check = Some(Utc::now());

        match outcome {
            ProbeOutcome::Ready => {
                self.status.ready = true;
                self.status.consecutive_failures = 0;
                self.status.message = "Ready".to_string();
            }
            ProbeOutcome::Pending(reason) => {
                self.status.ready = false;
                self.status.consecutive_failures = 0;
                self.status.message = reason.clone();
            }
            ProbeOutcome::Failed(reason) => {
                self.status.ready = false;
                self.status.consecutive_failures += 1;
                self.status.message = format!(
                    "{reason} ({}/{})",
                    self.status.consecutive_failures, self.config.failure_threshold
                );
            }
        }
    }
}
