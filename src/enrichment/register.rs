//! Register sources - where candidate carriers come from
//!
//! - [`FileRegisterSource`]: a JSON array or CSV export of register rows
//! - [`LiveRegisterSource`]: the published L&I register, newest dates first

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::{CarrierKey, RegisterListing};
use crate::infrastructure::config::{RegisterConfig, TimeoutConfig};
use crate::infrastructure::extractor::PageExtractor;
use crate::infrastructure::navigator::{BrowserLauncher, NavigationError, Page, with_timeout};

const PD_DATE_INPUT: &str = r#"input[name="pd_date"]"#;
const REGISTER_DETAIL_FORM: &str = r#"form[action*="prc_reg_detail"]"#;

#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("failed to read register file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("register file {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("register file {path} is not valid CSV: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("unsupported register file type: {0}")]
    UnsupportedFormat(PathBuf),

    #[error("register navigation failed: {0}")]
    Navigation(#[from] NavigationError),

    #[error("no published register dates found")]
    NoDates,
}

#[async_trait]
pub trait RegisterSource: Send + Sync {
    /// Candidate rows, at most one per carrier key
    async fn fetch(&self) -> Result<Vec<RegisterListing>, RegisterError>;
}

/// First row per carrier key; rows without a key are dropped
#[must_use]
pub fn unique_by_key(listings: Vec<RegisterListing>) -> Vec<RegisterListing> {
    let mut seen: HashSet<CarrierKey> = HashSet::new();
    listings
        .into_iter()
        .filter(|listing| {
            let key = CarrierKey::normalize(&listing.mc_number);
            !key.is_empty() && seen.insert(key)
        })
        .collect()
}

/// Keep rows whose state is in `states`; an empty filter keeps everything
#[must_use]
pub fn filter_states(listings: Vec<RegisterListing>, states: &[String]) -> Vec<RegisterListing> {
    if states.is_empty() {
        return listings;
    }
    listings
        .into_iter()
        .filter(|l| states.iter().any(|s| s.eq_ignore_ascii_case(l.state.trim())))
        .collect()
}

/// Register rows from a local JSON or CSV file
#[derive(Debug, Clone)]
pub struct FileRegisterSource {
    path: PathBuf,
}

impl FileRegisterSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(&self, bytes: &[u8]) -> Result<Vec<RegisterListing>, RegisterError> {
        let extension = self
            .path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        match extension.as_deref() {
            Some("json") => serde_json::from_slice(bytes).map_err(|source| RegisterError::Json {
                path: self.path.clone(),
                source,
            }),
            Some("csv") => {
                let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(bytes);
                reader
                    .deserialize()
                    .collect::<Result<Vec<RegisterListing>, _>>()
                    .map_err(|source| RegisterError::Csv {
                        path: self.path.clone(),
                        source,
                    })
            }
            _ => Err(RegisterError::UnsupportedFormat(self.path.clone())),
        }
    }
}

#[async_trait]
impl RegisterSource for FileRegisterSource {
    async fn fetch(&self) -> Result<Vec<RegisterListing>, RegisterError> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|source| RegisterError::Io {
            path: self.path.clone(),
            source,
        })?;
        let rows = self.parse(&bytes)?;
        let total = rows.len();
        let listings = unique_by_key(rows);
        info!("📄 Register file {:?}: {} row(s), {} unique carrier(s)", self.path, total, listings.len());
        Ok(listings)
    }
}

/// The published L&I register, read through the navigator
pub struct LiveRegisterSource {
    launcher: Arc<dyn BrowserLauncher>,
    extractor: Arc<dyn PageExtractor>,
    config: RegisterConfig,
    timeouts: TimeoutConfig,
}

impl LiveRegisterSource {
    #[must_use]
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        extractor: Arc<dyn PageExtractor>,
        config: RegisterConfig,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            launcher,
            extractor,
            config,
            timeouts,
        }
    }

    async fn open_listing(&self, page: &mut dyn Page) -> Result<String, NavigationError> {
        with_timeout("goto", self.timeouts.navigation(), page.goto(&self.config.listing_url)).await?;
        page.content().await
    }

    async fn read_register(&self, page: &mut dyn Page) -> Result<Vec<RegisterListing>, RegisterError> {
        let html = self.open_listing(page).await?;
        let dates = self.extractor.register_dates(&html);
        if dates.is_empty() {
            return Err(RegisterError::NoDates);
        }

        let mut listings = Vec::new();
        for date in dates.iter().take(self.config.register_dates.max(1)) {
            // every detail form posts back to the same handler; reload for a clean form state
            self.open_listing(page).await?;
            page.fill(PD_DATE_INPUT, &date.pd_date).await?;
            with_timeout("submit", self.timeouts.submit(), page.submit(REGISTER_DETAIL_FORM)).await?;

            let rows = self.extractor.register_listings(&page.content().await?, &date.display);
            info!("📰 Register {}: {} row(s)", date.display, rows.len());
            listings.extend(rows);
        }
        Ok(listings)
    }
}

#[async_trait]
impl RegisterSource for LiveRegisterSource {
    async fn fetch(&self) -> Result<Vec<RegisterListing>, RegisterError> {
        let browser = with_timeout("launch", self.timeouts.launch(), self.launcher.launch()).await?;
        let result = match browser.new_page().await {
            Ok(mut page) => self.read_register(page.as_mut()).await,
            Err(e) => Err(e.into()),
        };
        browser.close().await;

        let rows = result?;
        let total = rows.len();
        let kept = filter_states(rows, &self.config.state_filter);
        if kept.len() < total {
            debug!("State filter {:?} dropped {} row(s)", self.config.state_filter, total - kept.len());
        }
        let listings = unique_by_key(kept);
        if listings.is_empty() {
            warn!("⚠️ Register yielded no carriers for states {:?}", self.config.state_filter);
        }
        Ok(listings)
    }
}
