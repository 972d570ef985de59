//! Navigator - narrow page-automation interface
//!
//! 파이프라인 코어는 이 트레이트들만 알고, 실제 자동화 엔진은 모른다.
//! A [`BrowserLauncher`] yields one isolated [`Browser`] per batch; each
//! in-flight workflow owns its own [`Page`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NavigationError {
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("HTTP {status} for {url}")]
    Http { status: u16, url: String },

    #[error("request failed for {url}: {message}")]
    Request { url: String, message: String },

    #[error("selector not found: {selector}")]
    SelectorMissing { selector: String },

    #[error("invalid selector: {selector}")]
    InvalidSelector { selector: String },

    #[error("element {selector} has no name attribute")]
    Unnamed { selector: String },

    #[error("no form around {selector}")]
    NoForm { selector: String },

    #[error("page has no document loaded")]
    NoDocument,

    #[error("browser launch failed: {0}")]
    Launch(String),
}

impl NavigationError {
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Await `fut` for at most `after`; elapsed time becomes [`NavigationError::Timeout`]
pub async fn with_timeout<T, F>(
    operation: &'static str,
    after: Duration,
    fut: F,
) -> Result<T, NavigationError>
where
    F: Future<Output = Result<T, NavigationError>>,
{
    tokio::time::timeout(after, fut)
        .await
        .unwrap_or_else(|_| Err(NavigationError::Timeout { operation, after }))
}

/// Starts isolated browser contexts
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn Browser>, NavigationError>;
}

/// One isolated context (cookies, connections) shared by the pages of a batch
#[async_trait]
pub trait Browser: Send + Sync {
    async fn new_page(&self) -> Result<Box<dyn Page>, NavigationError>;

    async fn close(&self) {}
}

/// One tab. Selectors are CSS.
#[async_trait]
pub trait Page: Send + Sync {
    /// Load `url` and wait until the document is available
    async fn goto(&mut self, url: &str) -> Result<(), NavigationError>;

    /// Resolve once `selector` matches, or fail
    async fn wait_for(&mut self, selector: &str) -> Result<(), NavigationError>;

    async fn exists(&self, selector: &str) -> Result<bool, NavigationError>;

    async fn attribute(
        &self,
        selector: &str,
        name: &str,
    ) -> Result<Option<String>, NavigationError>;

    /// Set the value of a text input, textarea or select
    async fn fill(&mut self, selector: &str, value: &str) -> Result<(), NavigationError>;

    /// Tick a radio button or checkbox
    async fn check(&mut self, selector: &str) -> Result<(), NavigationError>;

    /// Submit the form matched by `selector` (a form or one of its buttons)
    async fn submit(&mut self, selector: &str) -> Result<(), NavigationError>;

    async fn content(&self) -> Result<String, NavigationError>;

    fn url(&self) -> String;
}
