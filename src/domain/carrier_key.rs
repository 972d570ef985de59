//! Carrier key - normalized MC number used as the deduplication unit
//!
//! 레지스터는 같은 운송사를 `MC-12345-C`, `MC-12345 -C`, `MC-12345` 처럼
//! 서로 다른 표기로 게시하므로, 모든 비교는 정규화된 키로 수행한다.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static TRAILING_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"\s*-[A-Za-z]$").unwrap()
});

/// Normalized MC number
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CarrierKey(String);

impl CarrierKey {
    /// Strip a trailing single-letter suffix and collapse whitespace
    #[must_use]
    pub fn normalize(raw: &str) -> Self {
        let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        let stripped = TRAILING_SUFFIX.replace(&collapsed, "");
        Self(stripped.trim().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Digits only, as typed into the docket search forms
    #[must_use]
    pub fn digits(&self) -> String {
        self.0.chars().filter(char::is_ascii_digit).collect()
    }
}

impl fmt::Display for CarrierKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CarrierKey {
    fn from(raw: &str) -> Self {
        Self::normalize(raw)
    }
}
