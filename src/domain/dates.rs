//! Date parsing helpers for register and insurance dates

use chrono::NaiveDate;

/// Formats seen on the register listing, SAFER and L&I pages
const DATE_FORMATS: &[&str] = &["%m/%d/%Y", "%Y-%m-%d", "%B %d, %Y", "%b %d, %Y", "%d-%b-%Y"];

/// Window in days for a decision to count as "new"
pub const NEW_MC_WINDOW_DAYS: i64 = 30;

#[must_use]
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
}

/// `YYYY-MM-DD` when parseable, the input unchanged otherwise
#[must_use]
pub fn normalize_date(raw: &str) -> String {
    parse_date(raw).map_or_else(|| raw.to_string(), |d| d.format("%Y-%m-%d").to_string())
}

/// Decision date within `days` of `today` (future dates count as new)
#[must_use]
pub fn is_within_days(raw: &str, today: NaiveDate, days: i64) -> bool {
    parse_date(raw).is_some_and(|d| (today - d).num_days() <= days)
}
