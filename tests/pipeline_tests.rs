//! End-to-end runs of the orchestrator against scripted pages
//!
//! The navigator and pipeline are in-memory; the progress log and the
//! exports are real files in a temp directory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use fmcsa_enrich::domain::{CSV_COLUMNS, FlatRecord, InsuranceRecord, InsuranceStatus, McEntry, RegisterListing};
use fmcsa_enrich::enrichment::{
    AttemptResult, EnrichmentMode, FmcsaStages, Orchestrator, RecordPipeline, RegisterError, RegisterSource,
    RunSummary, Stage, StageError,
};
use fmcsa_enrich::infrastructure::navigator::{Browser, BrowserLauncher, NavigationError, Page};
use fmcsa_enrich::infrastructure::{DisabledSolver, FmcsaExtractor, PipelineConfig, ProgressStore};

// ---------------------------------------------------------------------------
// Scripted collaborators
// ---------------------------------------------------------------------------

struct NullPage;

#[async_trait]
impl Page for NullPage {
    async fn goto(&mut self, _url: &str) -> Result<(), NavigationError> {
        Ok(())
    }
    async fn wait_for(&mut self, _selector: &str) -> Result<(), NavigationError> {
        Ok(())
    }
    async fn exists(&self, _selector: &str) -> Result<bool, NavigationError> {
        Ok(false)
    }
    async fn attribute(&self, _selector: &str, _name: &str) -> Result<Option<String>, NavigationError> {
        Ok(None)
    }
    async fn fill(&mut self, _selector: &str, _value: &str) -> Result<(), NavigationError> {
        Ok(())
    }
    async fn check(&mut self, _selector: &str) -> Result<(), NavigationError> {
        Ok(())
    }
    async fn submit(&mut self, _selector: &str) -> Result<(), NavigationError> {
        Ok(())
    }
    async fn content(&self) -> Result<String, NavigationError> {
        Ok(String::new())
    }
    fn url(&self) -> String {
        String::new()
    }
}

struct NullBrowser;

#[async_trait]
impl Browser for NullBrowser {
    async fn new_page(&self) -> Result<Box<dyn Page>, NavigationError> {
        Ok(Box::new(NullPage))
    }
}

/// Launches succeed unless `broken`
#[derive(Default)]
struct Launcher {
    broken: bool,
    launches: AtomicUsize,
}

impl Launcher {
    fn broken() -> Self {
        Self {
            broken: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl BrowserLauncher for Launcher {
    async fn launch(&self) -> Result<Arc<dyn Browser>, NavigationError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.broken {
            Err(NavigationError::Launch("chromium exited with code 1".into()))
        } else {
            Ok(Arc::new(NullBrowser))
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Behaviour {
    /// Active carrier with an active policy
    Insured,
    /// Not authorized, no insurance link
    Inactive,
    /// Snapshot works, the insurance page always times out
    InsuranceTimeout,
}

/// Per-carrier scripted workflow; unknown carriers are insured
#[derive(Default)]
struct Scripted {
    behaviours: HashMap<String, Behaviour>,
    calls: Mutex<HashMap<String, u32>>,
}

impl Scripted {
    fn with(mut self, mc: &str, behaviour: Behaviour) -> Self {
        self.behaviours.insert(mc.to_string(), behaviour);
        self
    }

    fn calls(&self, mc: &str) -> u32 {
        self.calls.lock().unwrap().get(mc).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    fn called_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.calls.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl RecordPipeline for Scripted {
    async fn run(&self, _page: &mut dyn Page, entry: McEntry) -> AttemptResult {
        let key = entry.key().to_string();
        *self.calls.lock().unwrap().entry(key.clone()).or_default() += 1;
        tokio::time::sleep(Duration::from_millis(1)).await;

        let behaviour = self.behaviours.get(&key).copied().unwrap_or(Behaviour::Insured);
        let snapshot = McEntry {
            usdot: "3901234".into(),
            legal_name: format!("{} LLC", entry.company_name),
            ..entry
        };
        match behaviour {
            Behaviour::Insured => AttemptResult::completed(McEntry {
                usdot_status: "ACTIVE".into(),
                insurance_link: "https://li-public.fmcsa.dot.gov/LIVIEW/pkg_carrquery.prc_carrlist?n_dotno=1".into(),
                insurance: Some(InsuranceRecord {
                    form: "91X".into(),
                    carrier: "ACME MUTUAL".into(),
                    status: InsuranceStatus::Active,
                    ..InsuranceRecord::default()
                }),
                ..snapshot
            }),
            Behaviour::Inactive => AttemptResult::completed(McEntry {
                usdot_status: "NOT AUTHORIZED".into(),
                ..snapshot
            }),
            Behaviour::InsuranceTimeout => AttemptResult::failed(
                McEntry {
                    usdot_status: "ACTIVE".into(),
                    insurance_link: "https://li-public.fmcsa.dot.gov/LIVIEW/pkg_carrquery.prc_carrlist?n_dotno=2".into(),
                    ..snapshot
                },
                StageError::new(
                    Stage::Insurance,
                    NavigationError::Timeout {
                        operation: "goto",
                        after: Duration::from_secs(120),
                    },
                ),
            ),
        }
    }
}

const LI_LINK: &str = "https://li-public.fmcsa.dot.gov/LIVIEW/pkg_carrquery.prc_carrlist?n_dotno=2";
const LI_SEARCH: &str = r#"<form action="pkg_carrquery.prc_carrlist"><input name="n_dotno"><input type="submit"></form>"#;
const LI_RESULTS: &str = r#"<form action="pkg_carrquery.prc_getdetail"><input type="submit" value="HTML"></form>"#;
const LI_DETAIL: &str = r#"<form action="pkg_carrquery.prc_activeinsurance"><input type="submit"></form>"#;
const LI_ACTIVE: &str = r"<table><tr><th>Form</th><th>Type</th><th>Insurance Carrier</th></tr>
    <tr><td>91X</td><td>BIPD</td><td>ACME MUTUAL</td><td>P-1</td><td>09/01/2026</td><td>$0</td><td>$750,000</td><td>09/05/2026</td><td></td></tr></table>";

/// L&I search → results → detail → active insurance; each page submits to the next
fn li_page(name: &str) -> Option<(&'static str, Option<&'static str>)> {
    match name {
        LI_LINK => Some((LI_SEARCH, Some("li-results"))),
        "li-results" => Some((LI_RESULTS, Some("li-detail"))),
        "li-detail" => Some((LI_DETAIL, Some("li-active"))),
        "li-active" => Some((LI_ACTIVE, None)),
        _ => None,
    }
}

/// Serves only the L&I pages and records every URL opened
struct LiPage {
    visits: Arc<Mutex<Vec<String>>>,
    current: String,
}

impl LiPage {
    fn html(&self) -> &'static str {
        li_page(&self.current).map_or("", |(html, _)| html)
    }

    fn select(&self, selector: &str) -> Result<Option<String>, NavigationError> {
        let parsed = scraper::Selector::parse(selector)
            .map_err(|_| NavigationError::InvalidSelector { selector: selector.to_string() })?;
        let doc = scraper::Html::parse_document(self.html());
        Ok(doc.select(&parsed).next().map(|e| e.html()))
    }
}

#[async_trait]
impl Page for LiPage {
    async fn goto(&mut self, url: &str) -> Result<(), NavigationError> {
        self.visits.lock().unwrap().push(url.to_string());
        if li_page(url).is_none() {
            return Err(NavigationError::Http { status: 404, url: url.to_string() });
        }
        self.current = url.to_string();
        Ok(())
    }
    async fn wait_for(&mut self, selector: &str) -> Result<(), NavigationError> {
        match self.select(selector)? {
            Some(_) => Ok(()),
            None => Err(NavigationError::SelectorMissing { selector: selector.to_string() }),
        }
    }
    async fn exists(&self, selector: &str) -> Result<bool, NavigationError> {
        Ok(self.select(selector)?.is_some())
    }
    async fn attribute(&self, _selector: &str, _name: &str) -> Result<Option<String>, NavigationError> {
        Ok(None)
    }
    async fn fill(&mut self, _selector: &str, _value: &str) -> Result<(), NavigationError> {
        Ok(())
    }
    async fn check(&mut self, _selector: &str) -> Result<(), NavigationError> {
        Ok(())
    }
    async fn submit(&mut self, selector: &str) -> Result<(), NavigationError> {
        let next = li_page(&self.current)
            .and_then(|(_, next)| next)
            .ok_or(NavigationError::NoForm { selector: selector.to_string() })?;
        self.current = next.to_string();
        Ok(())
    }
    async fn content(&self) -> Result<String, NavigationError> {
        Ok(self.html().to_string())
    }
    fn url(&self) -> String {
        self.current.clone()
    }
}

#[derive(Default)]
struct LiLauncher {
    visits: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl BrowserLauncher for LiLauncher {
    async fn launch(&self) -> Result<Arc<dyn Browser>, NavigationError> {
        Ok(Arc::new(LiBrowser(Arc::clone(&self.visits))))
    }
}

struct LiBrowser(Arc<Mutex<Vec<String>>>);

#[async_trait]
impl Browser for LiBrowser {
    async fn new_page(&self) -> Result<Box<dyn Page>, NavigationError> {
        Ok(Box::new(LiPage {
            visits: Arc::clone(&self.0),
            current: String::new(),
        }))
    }
}

struct Register(Vec<RegisterListing>);

#[async_trait]
impl RegisterSource for Register {
    async fn fetch(&self) -> Result<Vec<RegisterListing>, RegisterError> {
        Ok(self.0.clone())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn listing(mc: &str) -> RegisterListing {
    RegisterListing {
        mc_number: mc.into(),
        company_name: format!("CARRIER {mc}"),
        state: "WA".into(),
        decision_date: "10/10/2026".into(),
        register_date: "October 15, 2026".into(),
    }
}

fn listings(n: usize) -> Vec<RegisterListing> {
    (1..=n).map(|i| listing(&format!("MC-{}", 1_500_000 + i))).collect()
}

fn config(dir: &TempDir, batch_size: usize) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.output.output_dir = dir.path().to_path_buf();
    config.batch.batch_size = batch_size;
    config.batch.max_workers = 2;
    config.batch.page_concurrency = 2;
    config.retry.max_attempts = 3;
    config.retry.backoff_secs = 0;
    config
}

async fn run(
    config: &PipelineConfig,
    register: Vec<RegisterListing>,
    launcher: Arc<Launcher>,
    pipeline: Arc<Scripted>,
) -> RunSummary {
    Orchestrator::builder(config.clone())
        .with_register_source(Arc::new(Register(register)))
        .with_launcher(launcher)
        .with_pipeline(pipeline)
        .with_today(NaiveDate::from_ymd_opt(2026, 10, 18).unwrap())
        .with_cancellation(CancellationToken::new())
        .build()
        .unwrap()
        .run()
        .await
        .unwrap()
}

fn exported(config: &PipelineConfig) -> Vec<FlatRecord> {
    let text = std::fs::read_to_string(config.output.json_path()).unwrap();
    serde_json::from_str(&text).unwrap()
}

async fn progress(config: &PipelineConfig) -> Vec<McEntry> {
    ProgressStore::scan(config.output.progress_path()).await.unwrap().entries
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_run_enriches_and_exports_every_active_carrier() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 2);
    let pipeline = Arc::new(Scripted::default());

    let summary = run(&config, listings(5), Arc::new(Launcher::default()), Arc::clone(&pipeline)).await;

    assert_eq!(summary.candidates, 5);
    assert_eq!(summary.attempted, 5);
    assert_eq!(summary.enriched, 5);
    assert_eq!(summary.exported, 5);
    assert_eq!(progress(&config).await.len(), 5);

    let rows = exported(&config);
    assert!(rows.iter().all(|r| r.insurance_insurance_status == "Active"));
    assert!(rows.iter().all(|r| r.decision_date == "2026-10-10" && r.is_new_mc));
}

#[tokio::test]
async fn second_run_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 2);
    let first = Arc::new(Scripted::default());
    run(&config, listings(4), Arc::new(Launcher::default()), Arc::clone(&first)).await;
    let json_before = std::fs::read(config.output.json_path()).unwrap();
    let csv_before = std::fs::read(config.output.csv_path()).unwrap();

    let second = Arc::new(Scripted::default());
    let summary = run(&config, listings(4), Arc::new(Launcher::default()), Arc::clone(&second)).await;

    assert_eq!(second.total_calls(), 0);
    assert_eq!(summary.skipped, 4);
    assert_eq!(summary.attempted, 0);
    assert_eq!(progress(&config).await.len(), 4);
    assert_eq!(std::fs::read(config.output.json_path()).unwrap(), json_before);
    assert_eq!(std::fs::read(config.output.csv_path()).unwrap(), csv_before);
}

#[tokio::test]
async fn retry_bound_keeps_last_partial_state() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 10);
    let pipeline = Arc::new(Scripted::default().with("MC-1500002", Behaviour::InsuranceTimeout));

    let summary = run(&config, listings(3), Arc::new(Launcher::default()), Arc::clone(&pipeline)).await;

    assert_eq!(pipeline.calls("MC-1500002"), 3);
    assert_eq!(pipeline.calls("MC-1500001"), 1);
    assert_eq!(summary.exhausted, 1);
    assert_eq!(summary.enriched, 2);

    let log = progress(&config).await;
    let stuck = log.iter().find(|e| e.mc_number == "MC-1500002").unwrap();
    assert_eq!(stuck.attempt_count, 3);
    assert!(stuck.insurance.is_none());
    assert!(stuck.has_insurance_link());
    assert_eq!(stuck.legal_name, "CARRIER MC-1500002 LLC");
}

#[tokio::test]
async fn exhausted_carrier_is_retried_first_next_run() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 10);
    let failing = Arc::new(Scripted::default().with("MC-1500002", Behaviour::InsuranceTimeout));
    run(&config, listings(3), Arc::new(Launcher::default()), failing).await;

    let recovered = Arc::new(Scripted::default());
    let summary = run(&config, listings(3), Arc::new(Launcher::default()), Arc::clone(&recovered)).await;

    assert_eq!(recovered.called_keys(), vec!["MC-1500002".to_string()]);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.enriched, 1);
    assert_eq!(summary.exported, 3);
}

#[tokio::test]
async fn inactive_carriers_are_logged_but_not_exported() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 2);
    let pipeline = Arc::new(Scripted::default().with("MC-1500003", Behaviour::Inactive));

    let summary = run(&config, listings(3), Arc::new(Launcher::default()), Arc::clone(&pipeline)).await;

    assert_eq!(summary.terminal, 1);
    assert_eq!(pipeline.calls("MC-1500003"), 1);
    assert_eq!(progress(&config).await.len(), 3);

    let rows = exported(&config);
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.mc_number != "MC-1500003"));

    let csv = std::fs::read_to_string(config.output.csv_path()).unwrap();
    let header = csv.lines().next().unwrap();
    let expected: Vec<String> = CSV_COLUMNS.iter().map(|c| format!("\"{c}\"")).collect();
    assert_eq!(header, expected.join(","));
    assert_eq!(csv.lines().count(), 3);
}

#[tokio::test]
async fn resume_after_crash_only_runs_remaining_batches() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 2);
    let all = listings(10);

    // batches 1 and 2 finished before the crash
    {
        let store = ProgressStore::open(config.output.progress_path()).await.unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        for row in &all[..4] {
            let done = McEntry {
                usdot_status: "ACTIVE".into(),
                insurance: Some(InsuranceRecord {
                    carrier: "ACME MUTUAL".into(),
                    status: InsuranceStatus::Lapsed,
                    cancellation_date: "09/30/2026".into(),
                    ..InsuranceRecord::default()
                }),
                ..McEntry::from_listing(row.clone(), today)
            };
            store.append(&done).await.unwrap();
        }
    }

    let pipeline = Arc::new(Scripted::default());
    let summary = run(&config, all.clone(), Arc::new(Launcher::default()), Arc::clone(&pipeline)).await;

    let expected: Vec<String> = all[4..].iter().map(|l| l.mc_number.clone()).collect();
    assert_eq!(pipeline.called_keys(), expected);
    assert_eq!(summary.skipped, 4);
    assert_eq!(summary.attempted, 6);
    assert_eq!(summary.exported, 10);
}

#[tokio::test]
async fn launch_failure_leaves_entries_pending() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 2);
    let launcher = Arc::new(Launcher::broken());
    let pipeline = Arc::new(Scripted::default());

    let summary = run(&config, listings(5), Arc::clone(&launcher), Arc::clone(&pipeline)).await;

    assert_eq!(launcher.launches.load(Ordering::SeqCst), 3);
    assert_eq!(summary.launch_failures, 3);
    assert_eq!(summary.attempted, 0);
    assert_eq!(pipeline.total_calls(), 0);
    assert!(progress(&config).await.is_empty());
    assert!(exported(&config).is_empty());

    let retry = Arc::new(Scripted::default());
    let summary = run(&config, listings(5), Arc::new(Launcher::default()), Arc::clone(&retry)).await;
    assert_eq!(summary.enriched, 5);
    assert_eq!(retry.total_calls(), 5);
}

#[tokio::test]
async fn duplicate_records_export_once_with_identity_preferred() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 2);

    // two earlier records for the same carrier: the newer one lost its identity fields
    {
        let store = ProgressStore::open(config.output.progress_path()).await.unwrap();
        let base = McEntry {
            mc_number: "MC-1500001-C".into(),
            usdot_status: "ACTIVE".into(),
            insurance: Some(InsuranceRecord {
                form: "91X".into(),
                status: InsuranceStatus::Active,
                ..InsuranceRecord::default()
            }),
            ..McEntry::default()
        };
        let with_identity = McEntry {
            email: "DISPATCH@CASCADEHAUL.COM".into(),
            ..base.clone()
        };
        store.append_all(&[with_identity, base]).await.unwrap();
    }

    let register = vec![listing("MC-1500001"), listing("MC-1500001 -C"), listing("MC-1500002")];
    let summary = run(&config, register, Arc::new(Launcher::default()), Arc::new(Scripted::default())).await;
    assert_eq!(summary.candidates, 2);
    assert_eq!(summary.skipped, 1);

    let rows = exported(&config);
    assert_eq!(rows.len(), 2);
    let first = rows.iter().find(|r| r.mc_number.starts_with("MC-1500001")).unwrap();
    assert_eq!(first.email, "DISPATCH@CASCADEHAUL.COM");

    // a rerun over the same log produces the same bytes
    let before = std::fs::read(config.output.json_path()).unwrap();
    run(&config, vec![listing("MC-1500001")], Arc::new(Launcher::default()), Arc::new(Scripted::default())).await;
    assert_eq!(std::fs::read(config.output.json_path()).unwrap(), before);
}

#[tokio::test]
async fn cancelled_run_dispatches_no_batches() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir, 2);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let pipeline = Arc::new(Scripted::default());

    let summary = Orchestrator::builder(config.clone())
        .with_register_source(Arc::new(Register(listings(4))))
        .with_launcher(Arc::new(Launcher::default()))
        .with_pipeline(pipeline.clone())
        .with_cancellation(cancel)
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(pipeline.total_calls(), 0);
    assert_eq!(summary.attempted, 0);
    assert_eq!(summary.candidates, 4);
}

#[tokio::test]
async fn insurance_only_pass_revisits_stored_links_without_snapshot() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, 2);
    config.batch.politeness_delay_min_ms = 0;
    config.batch.politeness_delay_max_ms = 0;
    let failing = Arc::new(Scripted::default().with("MC-1500002", Behaviour::InsuranceTimeout));
    run(&config, listings(3), Arc::new(Launcher::default()), failing).await;

    let launcher = Arc::new(LiLauncher::default());
    let stages = FmcsaStages::new(
        Arc::new(FmcsaExtractor),
        Arc::new(DisabledSolver),
        config.timeouts.clone(),
        &config.batch,
    )
    .with_mode(EnrichmentMode::InsuranceOnly);

    let summary = Orchestrator::builder(config.clone())
        .with_launcher(launcher.clone())
        .with_pipeline(Arc::new(stages))
        .with_mode(EnrichmentMode::InsuranceOnly)
        .with_today(NaiveDate::from_ymd_opt(2026, 10, 18).unwrap())
        .build()
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.candidates, 3);
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.enriched, 1);
    assert_eq!(summary.exported, 3);

    // only the stored L&I link was opened: no SAFER query, no SMS page
    assert_eq!(*launcher.visits.lock().unwrap(), vec![LI_LINK.to_string()]);

    let rows = exported(&config);
    let revisited = rows.iter().find(|r| r.mc_number == "MC-1500002").unwrap();
    assert_eq!(revisited.insurance_insurance_carrier, "ACME MUTUAL");
    assert_eq!(revisited.legal_name, "CARRIER MC-1500002 LLC");
}
