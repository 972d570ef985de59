//! FMCSA Enrich - resumable batch enrichment of newly registered motor carriers
//!
//! Newly decided MC numbers from the FMCSA register are looked up on SAFER,
//! the SMS registration page and the L&I insurance pages, then exported as
//! JSON and CSV. Progress is logged per carrier so an interrupted run
//! resumes where it stopped.

pub mod domain;
pub mod enrichment;
pub mod infrastructure;

pub use domain::{CarrierKey, FlatRecord, McEntry};
pub use enrichment::{Orchestrator, RunSummary};
pub use infrastructure::PipelineConfig;
