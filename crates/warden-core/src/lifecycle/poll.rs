//! Bounded readiness polling.
//!
//! Every wait in the lifecycle controller (daemon readiness, suspend
//! confirmation, dependent teardown) goes through [`PollBudget`]: an
//! explicit attempt count and interval that produces a typed timeout
//! instead of blocking indefinitely.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;

use crate::collaborators::CollaboratorError;
use crate::config::humantime_serde;

/// A bounded retry budget: up to `attempts` probes, `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollBudget {
    /// Maximum number of probes before giving up.
    pub attempts: u32,
    /// Delay between probes.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl PollBudget {
    /// Construct a budget.
    #[must_use]
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Total time this budget can spend waiting.
    #[must_use]
    pub fn total_wait(&self) -> Duration {
        self.interval.saturating_mul(self.attempts)
    }

    /// Probe until `probe` reports `true`, the budget is exhausted, or
    /// the probe itself fails.
    ///
    /// # Errors
    ///
    /// - [`PollError::Timeout`] when every attempt reported `false`
    /// - [`PollError::Collaborator`] when a probe returned an error
    pub async fn wait_until<F, Fut>(&self, what: &'static str, mut probe: F) -> Result<(), PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, CollaboratorError>>,
    {
        for attempt in 0..self.attempts {
            if probe().await? {
                return Ok(());
            }
            if attempt + 1 < self.attempts {
                sleep(self.interval).await;
            }
        }
        Err(PollError::Timeout {
            what,
            waited: self.total_wait(),
        })
    }
}

/// Outcome of an exhausted or failed poll.
#[derive(Debug, Error)]
pub enum PollError {
    /// The condition did not hold within the budget.
    #[error("timed out waiting for {what} after {waited:?}")]
    Timeout {
        /// What was being waited for.
        what: &'static str,
        /// Total time spent waiting.
        waited: Duration,
    },

    /// A probe failed outright.
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}
