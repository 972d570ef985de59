//! reCAPTCHA solving through the 2Captcha HTTP API
//!
//! 풀이 실패는 해당 단계의 소프트 실패일 뿐이며, 호출자는 토큰 없이 계속 진행한다.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use super::config::{CaptchaConfig, fmcsa};

static SITE_KEY: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"[?&]k=([\w-]+)").unwrap()
});

const NOT_READY: &str = "CAPCHA_NOT_READY";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptchaError {
    #[error("captcha solving is disabled (no API key)")]
    Disabled,

    #[error("captcha service request failed: {0}")]
    Request(String),

    #[error("captcha service rejected the task: {0}")]
    Rejected(String),

    #[error("captcha not solved within {}s", .0.as_secs())]
    Timeout(Duration),
}

#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    /// Token for the reCAPTCHA identified by `site_key` on `page_url`
    async fn solve_recaptcha(&self, site_key: &str, page_url: &str) -> Result<String, CaptchaError>;
}

/// Site key from a reCAPTCHA iframe `src`
#[must_use]
pub fn extract_site_key(iframe_src: &str) -> Option<String> {
    SITE_KEY
        .captures(iframe_src)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Used when no API key is configured
pub struct DisabledSolver;

#[async_trait]
impl CaptchaSolver for DisabledSolver {
    async fn solve_recaptcha(&self, _site_key: &str, _page_url: &str) -> Result<String, CaptchaError> {
        Err(CaptchaError::Disabled)
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: u8,
    request: String,
}

/// `Ok(Some(token))` solved, `Ok(None)` still working, `Err` rejected
fn interpret(response: ApiResponse) -> Result<Option<String>, CaptchaError> {
    match (response.status, response.request.as_str()) {
        (1, _) => Ok(Some(response.request)),
        (_, NOT_READY) => Ok(None),
        _ => Err(CaptchaError::Rejected(response.request)),
    }
}

pub struct TwoCaptchaSolver {
    client: Client,
    api_key: String,
    poll_interval: Duration,
    timeout: Duration,
}

impl TwoCaptchaSolver {
    pub fn new(api_key: impl Into<String>, config: &CaptchaConfig, timeout: Duration) -> Result<Self, CaptchaError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CaptchaError::Request(e.to_string()))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            timeout,
        })
    }

    async fn call(&self, url: &str, params: &[(&str, &str)]) -> Result<ApiResponse, CaptchaError> {
        self.client
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(|e| CaptchaError::Request(e.to_string()))?
            .json::<ApiResponse>()
            .await
            .map_err(|e| CaptchaError::Request(e.to_string()))
    }

    async fn submit_and_poll(&self, site_key: &str, page_url: &str) -> Result<String, CaptchaError> {
        let submitted = self
            .call(
                fmcsa::TWO_CAPTCHA_IN_URL,
                &[
                    ("key", self.api_key.as_str()),
                    ("method", "userrecaptcha"),
                    ("googlekey", site_key),
                    ("pageurl", page_url),
                    ("json", "1"),
                ],
            )
            .await?;
        let task_id = interpret(submitted)?.ok_or_else(|| CaptchaError::Rejected(NOT_READY.to_string()))?;
        debug!("2Captcha task {} submitted", task_id);

        loop {
            tokio::time::sleep(self.poll_interval).await;
            let polled = self
                .call(
                    fmcsa::TWO_CAPTCHA_RES_URL,
                    &[
                        ("key", self.api_key.as_str()),
                        ("action", "get"),
                        ("id", task_id.as_str()),
                        ("json", "1"),
                    ],
                )
                .await?;
            if let Some(token) = interpret(polled)? {
                return Ok(token);
            }
        }
    }
}

#[async_trait]
impl CaptchaSolver for TwoCaptchaSolver {
    async fn solve_recaptcha(&self, site_key: &str, page_url: &str) -> Result<String, CaptchaError> {
        info!("🧩 Solving reCAPTCHA (sitekey {}) on {}", site_key, page_url);
        tokio::time::timeout(self.timeout, self.submit_and_poll(site_key, page_url))
            .await
            .unwrap_or_else(|_| Err(CaptchaError::Timeout(self.timeout)))
    }
}
