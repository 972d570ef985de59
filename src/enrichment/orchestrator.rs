//! # Enrichment Orchestrator
//!
//! 전체 실행 흐름:
//! 1. 레지스터에서 후보 목록 로드
//! 2. 진행 로그 스캔 → 이미 완료된 키 제외, 재시도 대상 우선 배치
//! 3. 배치 분할 → 워커 풀 실행 (배치 완료마다 증분 저장)
//! 4. 전체 진행 로그 → ACTIVE 필터 → 중복 제거 → 최종 원자적 내보내기
//!
//! `EnrichmentMode::InsuranceOnly` 는 레지스터를 읽지 않는다: 진행 로그에서
//! 보험 정보가 아직 없고 링크가 있는 레코드만 다시 처리한다.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::{FlatRecord, McEntry};
use crate::infrastructure::config::PipelineConfig;
use crate::infrastructure::exporter::{AtomicExporter, ExportError};
use crate::infrastructure::navigator::BrowserLauncher;
use crate::infrastructure::progress_store::{ProgressStore, ProgressStoreError, ResumeState};

use super::dedup::deduplicate;
use super::register::{RegisterError, RegisterSource, unique_by_key};
use super::retry_executor::{OutcomeStatus, RetryPolicy};
use super::stages::{EnrichmentMode, RecordPipeline};
use super::worker_pool::{BatchObserver, BatchReport, PoolError, WorkerPool, partition};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("register fetch failed: {0}")]
    Register(#[from] RegisterError),

    #[error("progress store failed: {0}")]
    Progress(#[from] ProgressStoreError),

    #[error("final export failed: {0}")]
    Export(#[from] ExportError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("orchestrator not configured: {0} missing")]
    NotConfigured(&'static str),
}

/// End-of-run counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub candidates: usize,
    /// Already fully enriched in an earlier run
    pub skipped: usize,
    pub attempted: usize,
    pub enriched: usize,
    pub terminal: usize,
    pub exhausted: usize,
    /// Batches whose browser context never started
    pub launch_failures: usize,
    pub exported: usize,
}

impl RunSummary {
    fn absorb(&mut self, report: &BatchReport) {
        self.attempted += report.outcomes.len();
        self.enriched += report.count(OutcomeStatus::Enriched);
        self.terminal += report.count(OutcomeStatus::Terminal);
        self.exhausted += report.count(OutcomeStatus::Exhausted);
        if report.is_launch_failure() {
            self.launch_failures += 1;
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidates={} skipped={} attempted={} enriched={} terminal={} exhausted={} launch_failures={} exported={}",
            self.candidates,
            self.skipped,
            self.attempted,
            self.enriched,
            self.terminal,
            self.exhausted,
            self.launch_failures,
            self.exported
        )
    }
}

/// Entries to enrich this run, re-enrichment keys first
#[derive(Debug, Default)]
pub struct WorkPlan {
    pub work: Vec<McEntry>,
    pub skipped: usize,
}

/// Subtract fully enriched keys from `candidates`
///
/// A key with prior records starts from its latest one, so data gathered by
/// an earlier partial run (an insurance link, say) carries over. The attempt
/// budget starts fresh every run.
#[must_use]
pub fn plan_work(candidates: Vec<McEntry>, resume: &ResumeState) -> WorkPlan {
    let mut seen = HashSet::new();
    let mut retry_first = Vec::new();
    let mut fresh = Vec::new();
    let mut skipped = 0;

    for candidate in candidates {
        let key = candidate.key();
        if key.is_empty() || !seen.insert(key.clone()) {
            continue;
        }
        if resume.is_fully_enriched(&key) {
            skipped += 1;
            continue;
        }
        match resume.prior.get(&key) {
            Some(prior) => {
                let seeded = McEntry {
                    is_new: candidate.is_new,
                    ..prior.clone()
                };
                let seeded = seeded.with_attempts(0);
                if resume.needs_reenrichment.contains(&key) {
                    retry_first.push(seeded);
                } else {
                    fresh.push(seeded);
                }
            }
            None => fresh.push(candidate),
        }
    }

    retry_first.extend(fresh);
    WorkPlan {
        work: retry_first,
        skipped,
    }
}

/// Stored records that can go straight to the insurance pages, in key order
///
/// Every other logged key counts as skipped.
#[must_use]
pub fn plan_insurance_pass(resume: &ResumeState) -> WorkPlan {
    let mut work: Vec<McEntry> = resume
        .needs_reenrichment
        .iter()
        .filter_map(|key| resume.prior.get(key))
        .filter(|entry| entry.has_insurance_link() && !entry.usdot_status.trim().is_empty())
        .map(|entry| entry.clone().with_attempts(0))
        .collect();
    work.sort_by_key(McEntry::key);
    WorkPlan {
        skipped: resume.prior.len() - work.len(),
        work,
    }
}

/// Export rows from every progress record, oldest first in `records`
///
/// Records are considered newest first so that equal-rank duplicates resolve
/// to the most recent outcome.
#[must_use]
pub fn final_records(records: &[McEntry]) -> Vec<FlatRecord> {
    let active = records.iter().rev().filter(|e| e.is_active()).cloned();
    deduplicate(active).iter().map(FlatRecord::from).collect()
}

/// Collects outcomes and re-exports after every batch that changed something
struct IncrementalSaver {
    records: Mutex<Vec<McEntry>>,
    exporter: AtomicExporter,
}

impl IncrementalSaver {
    fn new(records: Vec<McEntry>, exporter: AtomicExporter) -> Self {
        Self {
            records: Mutex::new(records),
            exporter,
        }
    }

    fn into_records(self) -> Vec<McEntry> {
        self.records.into_inner()
    }
}

#[async_trait]
impl BatchObserver for IncrementalSaver {
    async fn on_batch_complete(&self, report: &BatchReport) {
        let rows = {
            let mut records = self.records.lock().await;
            records.extend(report.outcomes.iter().map(|o| o.entry.clone()));
            if !report.changed {
                return;
            }
            final_records(&records)
        };

        match self.exporter.export_async(rows).await {
            Ok(saved) => info!(batch = report.index, "💾 Incremental save: {} record(s)", saved.records),
            // the next batch or the final export retries the write
            Err(e) => warn!(batch = report.index, "⚠️ Incremental save failed: {}", e),
        }
    }
}

/// Drives one full enrichment run
pub struct Orchestrator {
    config: PipelineConfig,
    source: Option<Arc<dyn RegisterSource>>,
    launcher: Arc<dyn BrowserLauncher>,
    pipeline: Arc<dyn RecordPipeline>,
    mode: EnrichmentMode,
    today: NaiveDate,
    cancel: CancellationToken,
}

impl Orchestrator {
    #[must_use]
    pub fn builder(config: PipelineConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub const fn mode(&self) -> EnrichmentMode {
        self.mode
    }

    async fn candidates(&self) -> Result<Vec<McEntry>, PipelineError> {
        let source = self
            .source
            .as_ref()
            .ok_or(PipelineError::NotConfigured("register source"))?;
        let listings = unique_by_key(source.fetch().await?);
        Ok(listings
            .into_iter()
            .map(|listing| McEntry::from_listing(listing, self.today))
            .collect())
    }

    fn exporter(&self) -> AtomicExporter {
        AtomicExporter::new(self.config.output.json_path(), self.config.output.csv_path())
    }

    pub async fn run(&self) -> Result<RunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        info!(run_id = %run_id, mode = %self.mode, "🚚 Enrichment run started");

        let candidates = match self.mode {
            EnrichmentMode::Full => Some(self.candidates().await?),
            EnrichmentMode::InsuranceOnly => None,
        };

        let store = Arc::new(ProgressStore::open(self.config.output.progress_path()).await?);
        let scan = store.load().await?;
        let resume = ResumeState::from_entries(&scan.entries);

        let mut summary = RunSummary::default();
        let plan = match candidates {
            Some(candidates) => {
                summary.candidates = candidates.len();
                plan_work(candidates, &resume)
            }
            None => {
                summary.candidates = resume.prior.len();
                plan_insurance_pass(&resume)
            }
        };
        summary.skipped = plan.skipped;
        info!(
            run_id = %run_id,
            "📋 {} candidate(s): {} fully enriched earlier, {} need re-enrichment, {} to process",
            summary.candidates,
            resume.fully_enriched.len(),
            resume.needs_reenrichment.len(),
            plan.work.len()
        );

        let batches = partition(plan.work, self.config.batch.batch_size);

        let pool = WorkerPool::builder()
            .with_launcher(Arc::clone(&self.launcher))
            .with_pipeline(Arc::clone(&self.pipeline))
            .with_progress_store(Arc::clone(&store))
            .with_retry_policy(RetryPolicy::from(&self.config.retry))
            .with_max_workers(self.config.batch.max_workers)
            .with_page_concurrency(self.config.batch.page_concurrency)
            .with_launch_timeout(self.config.timeouts.launch())
            .build()?;

        let saver = IncrementalSaver::new(scan.entries, self.exporter());
        let reports = pool.run(batches, self.cancel.clone(), &saver).await;
        for report in &reports {
            summary.absorb(report);
        }
        let cancelled = reports.iter().filter(|r| r.cancelled).count();
        if cancelled > 0 {
            warn!(run_id = %run_id, "🛑 {} batch(es) not dispatched after cancellation", cancelled);
        }

        let rows = final_records(&saver.into_records());
        let exported = self.exporter().export_async(rows).await?;
        summary.exported = exported.records;

        info!(run_id = %run_id, "🏁 Run finished: {}", summary);
        Ok(summary)
    }
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    config: PipelineConfig,
    source: Option<Arc<dyn RegisterSource>>,
    launcher: Option<Arc<dyn BrowserLauncher>>,
    pipeline: Option<Arc<dyn RecordPipeline>>,
    mode: EnrichmentMode,
    today: Option<NaiveDate>,
    cancel: CancellationToken,
}

impl OrchestratorBuilder {
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            source: None,
            launcher: None,
            pipeline: None,
            mode: EnrichmentMode::Full,
            today: None,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_register_source(mut self, source: Arc<dyn RegisterSource>) -> Self {
        self.source = Some(source);
        self
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

    /// `InsuranceOnly` works from the progress log and needs no register source
    #[must_use]
    pub const fn with_mode(mut self, mode: EnrichmentMode) -> Self {
        self.mode = mode;
        self
    }

    /// Run date used for `is_new`; defaults to the local date
    #[must_use]
    pub const fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> Result<Orchestrator, PipelineError> {
        if self.mode == EnrichmentMode::Full && self.source.is_none() {
            return Err(PipelineError::NotConfigured("register source"));
        }
        Ok(Orchestrator {
            source: self.source,
            launcher: self.launcher.ok_or(PipelineError::NotConfigured("launcher"))?,
            pipeline: self.pipeline.ok_or(PipelineError::NotConfigured("pipeline"))?,
            mode: self.mode,
            today: self.today.unwrap_or_else(|| chrono::Local::now().date_naive()),
            cancel: self.cancel,
            config: self.config,
        })
    }
}
