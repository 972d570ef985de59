//! Retry executor - bounded attempts per entry
//!
//! Every attempt starts from the same input entry, so a failed attempt's
//! partial data never leaks into the next one. Only the last attempt's entry
//! survives when the budget runs out.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::domain::McEntry;
use crate::infrastructure::config::RetryConfig;
use crate::infrastructure::navigator::Page;

use super::stages::RecordPipeline;

/// How an entry left the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    /// An insurance key field was populated
    Enriched,
    /// The snapshot resolved but offered nothing further to fetch
    Terminal,
    /// All attempts were spent without a key field
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct EnrichmentOutcome {
    pub entry: McEntry,
    pub attempts: u32,
    pub status: OutcomeStatus,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_secs(config.backoff_secs),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run `pipeline` on `entry` until it enriches, turns terminal, or the budget is spent
    pub async fn execute(
        &self,
        pipeline: &dyn RecordPipeline,
        page: &mut dyn Page,
        entry: McEntry,
    ) -> EnrichmentOutcome {
        let mc = entry.mc_number.clone();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut last = None;

        for attempt in 1..=max_attempts {
            debug!(mc = %mc, attempt, "Enrichment attempt {}/{}", attempt, max_attempts);
            let result = pipeline.run(&mut *page, entry.clone()).await;
            let attempted = result.entry.with_attempts(attempt);

            if attempted.has_key_enrichment_field() {
                info!(mc = %mc, attempt, "✅ Enriched");
                return EnrichmentOutcome {
                    entry: attempted,
                    attempts: attempt,
                    status: OutcomeStatus::Enriched,
                };
            }

            match result.error {
                Some(error) => {
                    warn!(mc = %mc, attempt, stage = %error.stage, "Attempt failed: {}", error);
                }
                None if !attempted.usdot_status.trim().is_empty() && !attempted.has_insurance_link() => {
                    info!(mc = %mc, attempt, usdot_status = %attempted.usdot_status, "No insurance link, nothing left to fetch");
                    return EnrichmentOutcome {
                        entry: attempted,
                        attempts: attempt,
                        status: OutcomeStatus::Terminal,
                    };
                }
                None => {
                    warn!(mc = %mc, attempt, "Attempt finished without insurance data");
                }
            }

            last = Some(attempted);
            if attempt < max_attempts && !self.policy.backoff.is_zero() {
                tokio::time::sleep(self.policy.backoff).await;
            }
        }

        warn!(mc = %mc, attempts = max_attempts, "❌ Retry budget exhausted");
        EnrichmentOutcome {
            entry: last.unwrap_or(entry).with_attempts(max_attempts),
            attempts: max_attempts,
            status: OutcomeStatus::Exhausted,
        }
    }
}
