//! Stage workflows - SAFER snapshot → SMS registration → insurance detail
//!
//! One call of [`RecordPipeline::run`] is one enrichment attempt. Stages
//! produce patches; the attempt returns a new entry with every patch applied
//! so far, even when a later stage fails.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{InsuranceRecord, McEntry, RegistrationPatch, SnapshotPatch};
use crate::infrastructure::captcha::{CaptchaSolver, extract_site_key};
use crate::infrastructure::config::{BatchConfig, TimeoutConfig, fmcsa};
use crate::infrastructure::extractor::PageExtractor;
use crate::infrastructure::navigator::{NavigationError, Page, with_timeout};

const SAFER_MC_RADIO: &str = r#"input[name="query_param"][value="MC_MX"]"#;
const SAFER_QUERY_INPUT: &str = r#"input[name="query_string"]"#;
const SAFER_SUBMIT: &str = r#"input[type="SUBMIT"], input[type="submit"]"#;

const DOCKET_INPUT: &str = r#"input[name="n_docketno"]"#;
const DOCKET_PREFIX: &str = r#"select[name="s_prefix"]"#;
const DOT_INPUT: &str = r#"input[name="n_dotno"]"#;
const RECAPTCHA_FRAME: &str = r#"iframe[src*="recaptcha"]"#;
const RECAPTCHA_RESPONSE: &str = r#"[name="g-recaptcha-response"]"#;
const LI_SUBMIT: &str = r#"input[type="submit"]"#;
const DETAIL_FORM: &str = r#"form[action*="pkg_carrquery.prc_getdetail"]"#;
const ACTIVE_INSURANCE_FORM: &str = r#"form[action*="prc_activeinsurance"]"#;
const INSURANCE_HISTORY_FORM: &str = r#"form[action*="prc_insurancehistory"]"#;

/// 파이프라인 단계
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Snapshot,
    Registration,
    Insurance,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Snapshot => "snapshot",
            Self::Registration => "registration",
            Self::Insurance => "insurance",
        })
    }
}

/// Which stages an attempt runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EnrichmentMode {
    /// SAFER → SMS → L&I for every entry
    #[default]
    Full,
    /// Stored records with a link and a status go straight to L&I
    InsuranceOnly,
}

impl fmt::Display for EnrichmentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Full => "full",
            Self::InsuranceOnly => "insurance-only",
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{stage} stage failed: {source}")]
pub struct StageError {
    pub stage: Stage,
    #[source]
    pub source: NavigationError,
}

impl StageError {
    #[must_use]
    pub const fn new(stage: Stage, source: NavigationError) -> Self {
        Self { stage, source }
    }
}

/// Result of one attempt: the entry as far as it got, and what stopped it
#[derive(Debug, Clone)]
pub struct AttemptResult {
    pub entry: McEntry,
    pub error: Option<StageError>,
}

impl AttemptResult {
    #[must_use]
    pub const fn completed(entry: McEntry) -> Self {
        Self { entry, error: None }
    }

    #[must_use]
    pub const fn failed(entry: McEntry, error: StageError) -> Self {
        Self {
            entry,
            error: Some(error),
        }
    }
}

/// One bounded navigate → extract pass over an entry
#[async_trait]
pub trait RecordPipeline: Send + Sync {
    async fn run(&self, page: &mut dyn Page, entry: McEntry) -> AttemptResult;
}

/// The SAFER → SMS → L&I workflow
pub struct FmcsaStages {
    extractor: Arc<dyn PageExtractor>,
    solver: Arc<dyn CaptchaSolver>,
    timeouts: TimeoutConfig,
    politeness_ms: (u64, u64),
    mode: EnrichmentMode,
}

impl FmcsaStages {
    #[must_use]
    pub fn new(
        extractor: Arc<dyn PageExtractor>,
        solver: Arc<dyn CaptchaSolver>,
        timeouts: TimeoutConfig,
        batch: &BatchConfig,
    ) -> Self {
        Self {
            extractor,
            solver,
            timeouts,
            politeness_ms: (batch.politeness_delay_min_ms, batch.politeness_delay_max_ms),
            mode: EnrichmentMode::Full,
        }
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: EnrichmentMode) -> Self {
        self.mode = mode;
        self
    }

    /// Stored snapshot is reused only when it already resolved a status and a link
    fn skips_snapshot(&self, entry: &McEntry) -> bool {
        self.mode == EnrichmentMode::InsuranceOnly
            && entry.has_insurance_link()
            && !entry.usdot_status.trim().is_empty()
    }

    async fn goto(&self, page: &mut dyn Page, url: &str) -> Result<(), NavigationError> {
        with_timeout("goto", self.timeouts.navigation(), page.goto(url)).await
    }

    async fn wait_for(&self, page: &mut dyn Page, selector: &str) -> Result<(), NavigationError> {
        with_timeout("wait_for", self.timeouts.selector(), page.wait_for(selector)).await
    }

    async fn submit(&self, page: &mut dyn Page, selector: &str) -> Result<(), NavigationError> {
        with_timeout("submit", self.timeouts.submit(), page.submit(selector)).await
    }

    async fn politeness_delay(&self) {
        let (min, max) = self.politeness_ms;
        if max == 0 {
            return;
        }
        let ms = fastrand::u64(min..=max);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    async fn snapshot(&self, page: &mut dyn Page, entry: &McEntry) -> Result<SnapshotPatch, NavigationError> {
        let digits = entry.key().digits();
        self.politeness_delay().await;

        self.goto(page, fmcsa::SAFER_SNAPSHOT_URL).await?;
        self.wait_for(page, SAFER_MC_RADIO).await?;
        page.check(SAFER_MC_RADIO).await?;
        page.fill(SAFER_QUERY_INPUT, &digits).await?;
        self.submit(page, SAFER_SUBMIT).await?;
        debug!(mc = %entry.mc_number, "SAFER queried MC/MX {}", digits);

        let mut patch = self.extractor.snapshot(&page.content().await?);
        if patch.usdot.is_empty() {
            patch.usdot = digits;
        }
        Ok(patch)
    }

    async fn registration(
        &self,
        page: &mut dyn Page,
        usdot: &str,
    ) -> Result<Option<RegistrationPatch>, NavigationError> {
        self.goto(page, &fmcsa::sms_registration_url(usdot)).await?;
        let html = page.content().await?;
        if !self.extractor.is_registration_page(&html) {
            return Ok(None);
        }
        Ok(Some(self.extractor.registration(&html)))
    }

    /// Soft stage: any failure only means the search goes out without a token
    async fn solve_captcha(&self, page: &mut dyn Page, mc: &str) {
        let src = match page.attribute(RECAPTCHA_FRAME, "src").await {
            Ok(Some(src)) => src,
            Ok(None) => return,
            Err(e) => {
                warn!(mc, stage = %Stage::Insurance, "reCAPTCHA probe failed: {}", e);
                return;
            }
        };
        let Some(site_key) = extract_site_key(&src) else {
            warn!(mc, stage = %Stage::Insurance, "reCAPTCHA frame without site key");
            return;
        };

        let url = page.url();
        let solved = tokio::time::timeout(
            self.timeouts.captcha(),
            self.solver.solve_recaptcha(&site_key, &url),
        )
        .await;
        match solved {
            Ok(Ok(token)) => {
                if let Err(e) = page.fill(RECAPTCHA_RESPONSE, &token).await {
                    warn!(mc, stage = %Stage::Insurance, "Could not inject reCAPTCHA token: {}", e);
                } else {
                    info!(mc, "🧩 reCAPTCHA solved");
                }
            }
            Ok(Err(e)) => warn!(mc, stage = %Stage::Insurance, "reCAPTCHA not solved: {}", e),
            Err(_) => warn!(mc, stage = %Stage::Insurance, "reCAPTCHA solve timed out"),
        }
    }

    async fn insurance(
        &self,
        page: &mut dyn Page,
        entry: &McEntry,
    ) -> Result<Option<InsuranceRecord>, NavigationError> {
        let mc = entry.mc_number.as_str();
        let digits = entry.key().digits();
        self.goto(page, &entry.insurance_link).await?;

        let search_field = if page.exists(DOCKET_INPUT).await? {
            page.fill(DOCKET_INPUT, &digits).await?;
            if page.exists(DOCKET_PREFIX).await? {
                page.fill(DOCKET_PREFIX, "MC").await?;
            }
            true
        } else if page.exists(DOT_INPUT).await? {
            page.fill(DOT_INPUT, &digits).await?;
            true
        } else {
            false
        };

        if search_field {
            self.solve_captcha(page, mc).await;
            self.submit(page, LI_SUBMIT).await?;
        } else {
            debug!(mc, "No docket search form, assuming results page");
        }

        if page.exists(DETAIL_FORM).await? {
            self.submit(page, DETAIL_FORM).await?;
        }

        let mut record = self.extractor.insurance(&page.content().await?);
        if page.exists(ACTIVE_INSURANCE_FORM).await? {
            self.submit(page, ACTIVE_INSURANCE_FORM).await?;
            record = self.extractor.insurance(&page.content().await?);
        }
        if record.is_none() && page.exists(INSURANCE_HISTORY_FORM).await? {
            self.submit(page, INSURANCE_HISTORY_FORM).await?;
            record = self.extractor.insurance(&page.content().await?);
        }
        Ok(record)
    }

    async fn insurance_attempt(&self, page: &mut dyn Page, entry: McEntry) -> AttemptResult {
        match self.insurance(page, &entry).await {
            Ok(record) => {
                if record.is_none() {
                    warn!(mc = %entry.mc_number, stage = %Stage::Insurance, "No policy row on insurance page");
                }
                AttemptResult::completed(entry.with_insurance(record))
            }
            Err(e) => AttemptResult::failed(entry, StageError::new(Stage::Insurance, e)),
        }
    }
}

#[async_trait]
impl RecordPipeline for FmcsaStages {
    async fn run(&self, page: &mut dyn Page, entry: McEntry) -> AttemptResult {
        let mc = entry.mc_number.clone();

        if self.skips_snapshot(&entry) {
            debug!(mc = %mc, "Insurance-only pass, reusing stored snapshot");
            return self.insurance_attempt(page, entry).await;
        }

        let entry = match self.snapshot(page, &entry).await {
            Ok(patch) => entry.with_snapshot(patch),
            Err(e) => return AttemptResult::failed(entry, StageError::new(Stage::Snapshot, e)),
        };

        // registration data is best effort; insurance does not depend on it
        let entry = match self.registration(page, &entry.usdot).await {
            Ok(Some(patch)) => entry.with_registration(patch),
            Ok(None) => {
                warn!(mc = %mc, stage = %Stage::Registration, usdot = %entry.usdot, "No registration details on SMS page");
                entry
            }
            Err(e) => {
                warn!(mc = %mc, stage = %Stage::Registration, "SMS registration unavailable: {}", e);
                entry
            }
        };

        if !entry.has_insurance_link() {
            debug!(mc = %mc, "No insurance link on snapshot");
            return AttemptResult::completed(entry);
        }

        self.insurance_attempt(page, entry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::InsuranceStatus;
    use crate::infrastructure::captcha::DisabledSolver;
    use crate::infrastructure::config::PipelineConfig;
    use crate::infrastructure::extractor::FmcsaExtractor;
    use std::collections::HashMap;

    /// Serves canned pages; submits route by selector
    struct CannedPage {
        pages: HashMap<String, String>,
        submits: HashMap<String, String>,
        current: String,
        fills: Vec<(String, String)>,
    }

    impl CannedPage {
        fn new(pages: &[(&str, &str)], submits: &[(&str, &str)]) -> Self {
            let own = |pairs: &[(&str, &str)]| {
                pairs
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect::<HashMap<_, _>>()
            };
            Self {
                pages: own(pages),
                submits: own(submits),
                current: String::new(),
                fills: Vec::new(),
            }
        }

        fn html(&self) -> String {
            self.pages.get(&self.current).cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl Page for CannedPage {
        async fn goto(&mut self, url: &str) -> Result<(), NavigationError> {
            if self.pages.contains_key(url) {
                self.current = url.to_string();
                Ok(())
            } else {
                Err(NavigationError::Http { status: 404, url: url.to_string() })
            }
        }

        async fn wait_for(&mut self, selector: &str) -> Result<(), NavigationError> {
            if self.exists(selector).await? {
                Ok(())
            } else {
                Err(NavigationError::SelectorMissing { selector: selector.to_string() })
            }
        }

        async fn exists(&self, selector: &str) -> Result<bool, NavigationError> {
            let doc = scraper::Html::parse_document(&self.html());
            let parsed = scraper::Selector::parse(selector)
                .map_err(|_| NavigationError::InvalidSelector { selector: selector.to_string() })?;
            let found = doc.select(&parsed).next().is_some();
            Ok(found)
        }

        async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>, NavigationError> {
            let doc = scraper::Html::parse_document(&self.html());
            let parsed = scraper::Selector::parse(selector)
                .map_err(|_| NavigationError::InvalidSelector { selector: selector.to_string() })?;
            let value = doc.select(&parsed).next().and_then(|e| e.value().attr(name).map(str::to_string));
            Ok(value)
        }

        async fn fill(&mut self, selector: &str, value: &str) -> Result<(), NavigationError> {
            self.fills.push((selector.to_string(), value.to_string()));
            Ok(())
        }

        async fn check(&mut self, _selector: &str) -> Result<(), NavigationError> {
            Ok(())
        }

        async fn submit(&mut self, selector: &str) -> Result<(), NavigationError> {
            let key = format!("{}|{}", self.current, selector);
            let target = self
                .submits
                .get(&key)
                .cloned()
                .ok_or(NavigationError::NoForm { selector: selector.to_string() })?;
            self.current = target;
            Ok(())
        }

        async fn content(&self) -> Result<String, NavigationError> {
            Ok(self.html())
        }

        fn url(&self) -> String {
            self.current.clone()
        }
    }

    const LINK: &str = "https://li-public.fmcsa.dot.gov/LIVIEW/pkg_carrquery.prc_carrlist?n_dotno=3901234";
    const SMS: &str = "https://ai.fmcsa.dot.gov/SMS/Carrier/3901234/CarrierRegistration.aspx";

    fn stages() -> FmcsaStages {
        let mut config = PipelineConfig::default();
        config.batch.politeness_delay_min_ms = 0;
        config.batch.politeness_delay_max_ms = 0;
        FmcsaStages::new(
            Arc::new(FmcsaExtractor),
            Arc::new(DisabledSolver),
            config.timeouts,
            &config.batch,
        )
    }

    const SAFER_QUERY: &str = r#"<form><input type="radio" name="query_param" value="MC_MX"><input name="query_string"><input type="SUBMIT" value="Search"></form>"#;

    fn snapshot_result(with_link: bool) -> String {
        let link = if with_link {
            format!(r#"<tr><td><a href="{LINK}">L&I</a></td></tr>"#)
        } else {
            String::new()
        };
        format!(
            r"<table><tr><th>USDOT Status:</th><td>ACTIVE</td></tr><tr><th>USDOT Number:</th><td>3901234</td></tr>{link}</table>"
        )
    }

    const REGISTRATION: &str = r#"<ul class="col1"><li><label>Legal Name:</label><span class="dat">CASCADE HAULING LLC</span></li>
        <li><label>Email:</label><span class="dat">OPS@CASCADE.COM</span></li></ul>"#;

    const LI_SEARCH: &str = r#"<form action="pkg_carrquery.prc_carrlist"><input name="n_dotno"><input type="submit"></form>"#;
    const LI_RESULTS: &str = r#"<form action="pkg_carrquery.prc_getdetail"><input type="submit" value="HTML"></form>"#;
    const LI_DETAIL: &str = r#"<form action="pkg_carrquery.prc_activeinsurance"><input type="submit"></form>"#;
    const LI_ACTIVE: &str = r"<table><tr><th>Form</th><th>Type</th><th>Insurance Carrier</th></tr>
        <tr><td>91X</td><td>BIPD</td><td>ACME MUTUAL</td><td>P-1</td><td>09/01/2026</td><td>$0</td><td>$750,000</td><td>09/05/2026</td><td></td></tr></table>";

    fn full_site(with_link: bool) -> CannedPage {
        let result = snapshot_result(with_link);
        let safer_submit = format!("{}|{SAFER_SUBMIT}", fmcsa::SAFER_SNAPSHOT_URL);
        let li_submit = format!("{LINK}|{LI_SUBMIT}");
        let detail_submit = format!("li-results|{DETAIL_FORM}");
        let active_submit = format!("li-detail|{ACTIVE_INSURANCE_FORM}");
        CannedPage::new(
            &[
                (fmcsa::SAFER_SNAPSHOT_URL, SAFER_QUERY),
                ("safer-result", result.as_str()),
                (SMS, REGISTRATION),
                (LINK, LI_SEARCH),
                ("li-results", LI_RESULTS),
                ("li-detail", LI_DETAIL),
                ("li-active", LI_ACTIVE),
            ],
            &[
                (safer_submit.as_str(), "safer-result"),
                (li_submit.as_str(), "li-results"),
                (detail_submit.as_str(), "li-detail"),
                (active_submit.as_str(), "li-active"),
            ],
        )
    }

    #[tokio::test]
    async fn full_workflow_enriches_entry() {
        let mut page = full_site(true);
        let entry = McEntry {
            mc_number: "MC-1500123-C".into(),
            ..McEntry::default()
        };

        let result = stages().run(&mut page, entry).await;
        assert!(result.error.is_none());
        let entry = result.entry;
        assert_eq!(entry.usdot_status, "ACTIVE");
        assert_eq!(entry.usdot, "3901234");
        assert_eq!(entry.legal_name, "CASCADE HAULING LLC");
        assert_eq!(entry.email, "OPS@CASCADE.COM");
        let insurance = entry.insurance.unwrap();
        assert_eq!(insurance.carrier, "ACME MUTUAL");
        assert_eq!(insurance.status, InsuranceStatus::Active);
        assert!(page.fills.contains(&(DOT_INPUT.to_string(), "1500123".to_string())));
        assert!(page.fills.contains(&(SAFER_QUERY_INPUT.to_string(), "1500123".to_string())));
    }

    #[tokio::test]
    async fn missing_link_stops_after_registration() {
        let mut page = full_site(false);
        let entry = McEntry {
            mc_number: "MC-1500123".into(),
            ..McEntry::default()
        };
        let result = stages().run(&mut page, entry).await;
        assert!(result.error.is_none());
        assert!(result.entry.insurance.is_none());
        assert!(!result.entry.has_insurance_link());
        assert_eq!(result.entry.usdot_status, "ACTIVE");
    }

    #[tokio::test]
    async fn insurance_failure_keeps_partial_entry() {
        let mut page = full_site(true);
        page.pages.remove(LINK);
        let entry = McEntry {
            mc_number: "MC-1500123".into(),
            ..McEntry::default()
        };
        let result = stages().run(&mut page, entry).await;
        let error = result.error.unwrap();
        assert_eq!(error.stage, Stage::Insurance);
        assert_eq!(result.entry.legal_name, "CASCADE HAULING LLC");
        assert_eq!(result.entry.insurance_link, LINK);
    }

    fn stored(with_link: bool) -> McEntry {
        McEntry {
            mc_number: "MC-1500123".into(),
            usdot: "3901234".into(),
            usdot_status: "ACTIVE".into(),
            legal_name: "CASCADE HAULING LLC".into(),
            insurance_link: if with_link { LINK.into() } else { String::new() },
            ..McEntry::default()
        }
    }

    #[tokio::test]
    async fn insurance_only_reuses_stored_snapshot() {
        let mut page = full_site(true);
        page.pages.remove(fmcsa::SAFER_SNAPSHOT_URL);
        page.pages.remove(SMS);

        let stages = stages().with_mode(EnrichmentMode::InsuranceOnly);
        let result = stages.run(&mut page, stored(true)).await;

        assert!(result.error.is_none());
        assert_eq!(result.entry.insurance.unwrap().carrier, "ACME MUTUAL");
        assert_eq!(result.entry.legal_name, "CASCADE HAULING LLC");
        assert!(page.fills.iter().all(|(selector, _)| selector != SAFER_QUERY_INPUT));
    }

    #[tokio::test]
    async fn insurance_only_without_link_runs_full_workflow() {
        let mut page = full_site(true);
        let stages = stages().with_mode(EnrichmentMode::InsuranceOnly);
        let result = stages.run(&mut page, stored(false)).await;

        assert!(result.error.is_none());
        assert_eq!(result.entry.insurance_link, LINK);
        assert!(page.fills.contains(&(SAFER_QUERY_INPUT.to_string(), "1500123".to_string())));
    }

    #[tokio::test]
    async fn full_mode_ignores_stored_link() {
        let mut page = full_site(true);
        page.pages.remove(fmcsa::SAFER_SNAPSHOT_URL);
        let result = stages().run(&mut page, stored(true)).await;
        assert_eq!(result.error.map(|e| e.stage), Some(Stage::Snapshot));
    }

    #[tokio::test]
    async fn snapshot_failure_returns_input() {
        let mut page = CannedPage::new(&[], &[]);
        let entry = McEntry {
            mc_number: "MC-7".into(),
            ..McEntry::default()
        };
        let result = stages().run(&mut page, entry.clone()).await;
        assert_eq!(result.error.map(|e| e.stage), Some(Stage::Snapshot));
        assert_eq!(result.entry, entry);
    }
}
