//! Enrichment pipeline - register → batches → retry → progress log → export
//!
//! Only the navigator, extractor and solver traits reach the outside world;
//! everything in here runs unchanged against scripted pages in tests.

pub mod dedup; // Carrier-key deduplication
pub mod orchestrator; // Run driver and incremental save
pub mod register; // Candidate sources
pub mod retry_executor; // Bounded attempts per entry
pub mod stages; // SAFER / SMS / L&I workflows
pub mod worker_pool; // Batch-parallel execution

pub use dedup::deduplicate;
pub use orchestrator::{
    Orchestrator, OrchestratorBuilder, PipelineError, RunSummary, final_records, plan_insurance_pass, plan_work,
};
pub use register::{FileRegisterSource, LiveRegisterSource, RegisterError, RegisterSource};
pub use retry_executor::{EnrichmentOutcome, OutcomeStatus, RetryExecutor, RetryPolicy};
pub use stages::{AttemptResult, EnrichmentMode, FmcsaStages, RecordPipeline, Stage, StageError};
pub use worker_pool::{BatchObserver, BatchReport, NoopObserver, PoolError, WorkerPool, WorkerPoolBuilder, partition};
