//! # Worker Pool
//!
//! 배치 단위 병렬 처리:
//! - 배치 하나 = 격리된 브라우저 컨텍스트 하나 (쿠키/연결 공유 없음)
//! - 바깥쪽: `Semaphore` 로 동시 배치 수 제한, `JoinSet` 으로 수거
//! - 안쪽: `buffer_unordered` 로 배치 내 페이지 동시성 제한
//!
//! Every outcome is appended to the progress store as soon as its entry
//! finishes, so a crash mid-batch loses at most the in-flight entries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::McEntry;
use crate::infrastructure::config::defaults;
use crate::infrastructure::navigator::{Browser, BrowserLauncher, NavigationError, with_timeout};
use crate::infrastructure::progress_store::ProgressStore;

use super::retry_executor::{EnrichmentOutcome, OutcomeStatus, RetryExecutor, RetryPolicy};
use super::stages::RecordPipeline;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool not configured: {0} missing")]
    Missing(&'static str),

    #[error("worker pool setting {0} must be greater than zero")]
    Zero(&'static str),
}

/// Split `entries` into consecutive batches of at most `batch_size`
#[must_use]
pub fn partition(entries: Vec<McEntry>, batch_size: usize) -> Vec<Vec<McEntry>> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(entries.len().div_ceil(batch_size));
    let mut iter = entries.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(batch_size).collect());
    }
    batches
}

/// What happened to one batch
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub index: usize,
    pub size: usize,
    pub outcomes: Vec<EnrichmentOutcome>,
    /// Set when the browser context never started; no entry was touched
    pub launch_error: Option<NavigationError>,
    /// Batch was never started because the run was cancelled
    pub cancelled: bool,
    /// Entries that could not get a page, left pending
    pub page_failures: usize,
    /// Outcomes the progress store failed to record
    pub write_failures: usize,
    /// At least one outcome differs from the entry it started from
    pub changed: bool,
}

impl BatchReport {
    fn new(index: usize, size: usize) -> Self {
        Self {
            index,
            size,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn is_launch_failure(&self) -> bool {
        self.launch_error.is_some()
    }

    #[must_use]
    pub fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

/// Notified from the collecting task, one batch at a time
#[async_trait]
pub trait BatchObserver: Send + Sync {
    async fn on_batch_complete(&self, report: &BatchReport);
}

/// Observer that ignores every batch
pub struct NoopObserver;

#[async_trait]
impl BatchObserver for NoopObserver {
    async fn on_batch_complete(&self, _report: &BatchReport) {}
}

enum EntryResult {
    Recorded { outcome: EnrichmentOutcome, changed: bool },
    Unrecorded { outcome: EnrichmentOutcome, changed: bool },
    NoPage,
}

/// Batch-parallel enrichment runner
#[derive(Clone)]
pub struct WorkerPool {
    launcher: Arc<dyn BrowserLauncher>,
    pipeline: Arc<dyn RecordPipeline>,
    store: Arc<ProgressStore>,
    executor: RetryExecutor,
    max_workers: usize,
    page_concurrency: usize,
    launch_timeout: Duration,
}

impl WorkerPool {
    #[must_use]
    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder::new()
    }

    #[must_use]
    pub const fn max_workers(&self) -> usize {
        self.max_workers
    }

    #[must_use]
    pub const fn page_concurrency(&self) -> usize {
        self.page_concurrency
    }

    /// Run every batch; reports come back in completion order
    pub async fn run(
        &self,
        batches: Vec<Vec<McEntry>>,
        cancel: CancellationToken,
        observer: &dyn BatchObserver,
    ) -> Vec<BatchReport> {
        let total = batches.len();
        info!(
            "🚀 Dispatching {} batch(es): {} worker(s), {} page(s) each",
            total, self.max_workers, self.page_concurrency
        );

        let permits = Arc::new(Semaphore::new(self.max_workers));
        let mut set = JoinSet::new();
        for (index, batch) in batches.into_iter().enumerate() {
            let pool = self.clone();
            let permits = Arc::clone(&permits);
            let cancel = cancel.clone();
            set.spawn(async move {
                let size = batch.len();
                let permit = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    permit = permits.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit.filter(|_| !cancel.is_cancelled()) else {
                    debug!(batch = index, "Batch not dispatched (cancelled)");
                    return BatchReport {
                        cancelled: true,
                        ..BatchReport::new(index, size)
                    };
                };
                pool.run_batch(index, batch).await
            });
        }

        let mut reports = Vec::with_capacity(total);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => {
                    observer.on_batch_complete(&report).await;
                    reports.push(report);
                }
                Err(e) => error!("Batch task panicked or was aborted: {}", e),
            }
        }
        reports
    }

    async fn run_batch(&self, index: usize, entries: Vec<McEntry>) -> BatchReport {
        let mut report = BatchReport::new(index, entries.len());
        info!(batch = index, size = report.size, "📦 Batch started");

        let browser = match with_timeout("launch", self.launch_timeout, self.launcher.launch()).await {
            Ok(browser) => browser,
            Err(e) => {
                error!(batch = index, "🚫 Browser context failed to start, {} entries stay pending: {}", report.size, e);
                report.launch_error = Some(e);
                return report;
            }
        };

        let results: Vec<EntryResult> = stream::iter(entries)
            .map(|entry| {
                let browser = Arc::clone(&browser);
                async move { self.run_entry(index, browser.as_ref(), entry).await }
            })
            .buffer_unordered(self.page_concurrency)
            .collect()
            .await;
        browser.close().await;

        for result in results {
            match result {
                EntryResult::Recorded { outcome, changed } => {
                    report.changed |= changed;
                    report.outcomes.push(outcome);
                }
                EntryResult::Unrecorded { outcome, changed } => {
                    report.changed |= changed;
                    report.write_failures += 1;
                    report.outcomes.push(outcome);
                }
                EntryResult::NoPage => report.page_failures += 1,
            }
        }

        info!(
            batch = index,
            "📦 Batch finished: {} enriched, {} terminal, {} exhausted, {} without page",
            report.count(OutcomeStatus::Enriched),
            report.count(OutcomeStatus::Terminal),
            report.count(OutcomeStatus::Exhausted),
            report.page_failures
        );
        report
    }

    async fn run_entry(&self, index: usize, browser: &dyn Browser, entry: McEntry) -> EntryResult {
        let mut page = match browser.new_page().await {
            Ok(page) => page,
            Err(e) => {
                warn!(batch = index, mc = %entry.mc_number, "Could not open page: {}", e);
                return EntryResult::NoPage;
            }
        };

        let before = entry.clone();
        let outcome = self.executor.execute(self.pipeline.as_ref(), page.as_mut(), entry).await;
        let changed = outcome.entry.clone().with_attempts(before.attempt_count) != before;

        match self.store.append(&outcome.entry).await {
            Ok(()) => EntryResult::Recorded { outcome, changed },
            Err(e) => {
                error!(batch = index, mc = %outcome.entry.mc_number, "💥 Progress write failed: {}", e);
                EntryResult::Unrecorded { outcome, changed }
            }
        }
    }
}

/// Builder for [`WorkerPool`]
pub struct WorkerPoolBuilder {
    launcher: Option<Arc<dyn BrowserLauncher>>,
    pipeline: Option<Arc<dyn RecordPipeline>>,
    store: Option<Arc<ProgressStore>>,
    policy: RetryPolicy,
    max_workers: usize,
    page_concurrency: usize,
    launch_timeout: Duration,
}

impl WorkerPoolBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            launcher: None,
            pipeline: None,
            store: None,
            policy: RetryPolicy {
                max_attempts: defaults::MAX_ATTEMPTS,
                backoff: Duration::from_secs(defaults::RETRY_BACKOFF_SECS),
            },
            max_workers: defaults::MAX_WORKERS,
            page_concurrency: defaults::PAGE_CONCURRENCY,
            launch_timeout: Duration::from_secs(defaults::LAUNCH_TIMEOUT_SECS),
        }
    }

    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn BrowserLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    #[must_use]
    pub fn with_pipeline(mut self, pipeline: Arc<dyn RecordPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    #[must_use]
    pub fn with_progress_store(mut self, store: Arc<ProgressStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub const fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub const fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    #[must_use]
    pub const fn with_page_concurrency(mut self, page_concurrency: usize) -> Self {
        self.page_concurrency = page_concurrency;
        self
    }

    #[must_use]
    pub const fn with_launch_timeout(mut self, launch_timeout: Duration) -> Self {
        self.launch_timeout = launch_timeout;
        self
    }

    pub fn build(self) -> Result<WorkerPool, PoolError> {
        if self.max_workers == 0 {
            return Err(PoolError::Zero("max_workers"));
        }
        if self.page_concurrency == 0 {
            return Err(PoolError::Zero("page_concurrency"));
        }
        Ok(WorkerPool {
            launcher: self.launcher.ok_or(PoolError::Missing("launcher"))?,
            pipeline: self.pipeline.ok_or(PoolError::Missing("pipeline"))?,
            store: self.store.ok_or(PoolError::Missing("progress store"))?,
            executor: RetryExecutor::new(self.policy),
            max_workers: self.max_workers,
            page_concurrency: self.page_concurrency,
            launch_timeout: self.launch_timeout,
        })
    }
}

impl Default for WorkerPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}
