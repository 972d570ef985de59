//! Insurance sub-record extracted from the Active/Pending Insurance page

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::dates::parse_date;

/// 보험 상태
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsuranceStatus {
    Active,
    Lapsed,
    #[default]
    Unknown,
}

impl InsuranceStatus {
    /// Cancellation date on file means the policy lapsed
    #[must_use]
    pub fn from_cancellation(cancellation_date: &str) -> Self {
        if cancellation_date.trim().is_empty() {
            Self::Active
        } else {
            Self::Lapsed
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "Active",
            Self::Lapsed => "Lapsed",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for InsuranceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy on file. Always replaced as a whole, never patched field by field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsuranceRecord {
    pub form: String,
    #[serde(rename = "type")]
    pub insurance_type: String,
    pub carrier: String,
    pub policy_surety: String,
    pub posted_date: String,
    pub effective_date: String,
    pub cancellation_date: String,
    pub status: InsuranceStatus,
    pub coverage_from: String,
    pub coverage_to: String,
}

impl InsuranceRecord {
    /// Any of the key enrichment fields populated
    #[must_use]
    pub fn has_key_field(&self) -> bool {
        self.status != InsuranceStatus::Unknown
            || [
                &self.form,
                &self.insurance_type,
                &self.carrier,
                &self.policy_surety,
                &self.posted_date,
                &self.effective_date,
                &self.cancellation_date,
                &self.coverage_from,
                &self.coverage_to,
            ]
            .iter()
            .any(|v| !v.trim().is_empty())
    }

    /// Effective date more than a year old
    #[must_use]
    pub fn renewal_due(&self, today: NaiveDate) -> bool {
        parse_date(&self.effective_date).is_some_and(|eff| (today - eff).num_days() > 365)
    }
}
