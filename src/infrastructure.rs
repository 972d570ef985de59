//! Infrastructure layer - configuration, logging, page automation and file I/O
//!
//! Everything that touches the network or the filesystem lives here; the
//! enrichment pipeline only sees the traits re-exported below.

pub mod captcha; // 2Captcha reCAPTCHA solver
pub mod config; // Configuration constants and loading
pub mod exporter; // Atomic JSON/CSV writer
pub mod extractor; // SAFER / SMS / L&I page extraction
pub mod http_navigator; // reqwest + scraper Navigator
pub mod logging; // Logging infrastructure
pub mod navigator; // Navigator traits
pub mod progress_store; // Append-only progress log

pub use captcha::{CaptchaError, CaptchaSolver, DisabledSolver, TwoCaptchaSolver};
pub use config::{ConfigManager, PipelineConfig};
pub use exporter::{AtomicExporter, ExportError, ExportReport};
pub use extractor::{FmcsaExtractor, PageExtractor, RegisterDate};
pub use http_navigator::{HttpLauncher, HttpNavigatorConfig};
pub use navigator::{Browser, BrowserLauncher, NavigationError, Page};
pub use progress_store::{ProgressScan, ProgressStore, ProgressStoreError, ResumeState};
