//! MC entry - the canonical carrier record carried through the pipeline
//!
//! Enrichment stages never mutate an entry in place: each stage yields a patch
//! and `with_*` returns a new entry, so a discarded attempt leaves no trace.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::carrier_key::CarrierKey;
use super::dates::{NEW_MC_WINDOW_DAYS, is_within_days};
use super::insurance::{InsuranceRecord, InsuranceStatus};

/// Current on-disk layout of [`McEntry`]
pub const ENTRY_SCHEMA_VERSION: u16 = 1;

const fn schema_version_default() -> u16 {
    ENTRY_SCHEMA_VERSION
}

/// Derived enrichment state (never stored)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentState {
    Pending,
    Enriched,
    Failed,
}

/// One row of the register listing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterListing {
    pub mc_number: String,
    pub company_name: String,
    pub state: String,
    pub decision_date: String,
    pub register_date: String,
}

/// Fields resolved from the SAFER company snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotPatch {
    pub usdot_status: String,
    pub usdot: String,
    pub safety_rating: String,
    pub physical_address: String,
    pub mailing_address: String,
    pub phone: String,
    pub power_units: String,
    pub drivers: String,
    pub oos_percent_vehicle: String,
    pub oos_percent_driver: String,
    pub oos_percent_hazmat: String,
    pub crash_fatal: String,
    pub crash_injury: String,
    pub crash_tow: String,
    pub crash_total: String,
    pub insurance_link: String,
}

/// Fields resolved from the SMS carrier registration page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationPatch {
    pub usdot: String,
    pub legal_name: String,
    pub dba_name: String,
    pub address: String,
    pub telephone: String,
    pub fax: String,
    pub email: String,
    pub mcs_150_date: String,
    pub vehicle_miles_traveled: String,
    pub vmt_year: String,
    pub power_units: String,
    pub drivers: String,
    pub carrier_operation: String,
}

impl RegistrationPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Canonical MC entry; also the schema of one progress log line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct McEntry {
    #[serde(default = "schema_version_default")]
    pub schema_version: u16,
    pub mc_number: String,
    pub company_name: String,
    pub state: String,
    pub decision_date: String,
    pub register_date: String,
    #[serde(alias = "is_new_mc")]
    pub is_new: bool,
    pub usdot_status: String,

    // SAFER snapshot
    pub safety_rating: String,
    pub physical_address: String,
    pub mailing_address: String,
    pub phone: String,
    pub oos_percent_vehicle: String,
    pub oos_percent_driver: String,
    pub oos_percent_hazmat: String,
    pub crash_fatal: String,
    pub crash_injury: String,
    pub crash_tow: String,
    pub crash_total: String,

    // SMS registration
    pub usdot: String,
    pub legal_name: String,
    pub dba_name: String,
    pub address: String,
    pub telephone: String,
    pub fax: String,
    pub email: String,
    pub mcs_150_date: String,
    pub vehicle_miles_traveled: String,
    pub vmt_year: String,
    pub power_units: String,
    pub drivers: String,
    pub carrier_operation: String,

    pub insurance_link: String,
    pub insurance: Option<InsuranceRecord>,

    /// Enrichment attempts spent on the run that produced this record
    pub attempt_count: u32,
}

impl Default for McEntry {
    fn default() -> Self {
        Self {
            schema_version: ENTRY_SCHEMA_VERSION,
            mc_number: String::new(),
            company_name: String::new(),
            state: String::new(),
            decision_date: String::new(),
            register_date: String::new(),
            is_new: false,
            usdot_status: String::new(),
            safety_rating: String::new(),
            physical_address: String::new(),
            mailing_address: String::new(),
            phone: String::new(),
            oos_percent_vehicle: String::new(),
            oos_percent_driver: String::new(),
            oos_percent_hazmat: String::new(),
            crash_fatal: String::new(),
            crash_injury: String::new(),
            crash_tow: String::new(),
            crash_total: String::new(),
            usdot: String::new(),
            legal_name: String::new(),
            dba_name: String::new(),
            address: String::new(),
            telephone: String::new(),
            fax: String::new(),
            email: String::new(),
            mcs_150_date: String::new(),
            vehicle_miles_traveled: String::new(),
            vmt_year: String::new(),
            power_units: String::new(),
            drivers: String::new(),
            carrier_operation: String::new(),
            insurance_link: String::new(),
            insurance: None,
            attempt_count: 0,
        }
    }
}

/// Non-empty patch values win; empty ones keep what is already there
fn overlay(target: &mut String, value: String) {
    if !value.trim().is_empty() {
        *target = value;
    }
}

/// Newlines and doubled spaces come through from the SMS modal markup
fn single_line(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl McEntry {
    /// New pending entry from a register row
    #[must_use]
    pub fn from_listing(listing: RegisterListing, today: NaiveDate) -> Self {
        let is_new = is_within_days(&listing.decision_date, today, NEW_MC_WINDOW_DAYS);
        Self {
            mc_number: listing.mc_number,
            company_name: listing.company_name,
            state: listing.state,
            decision_date: listing.decision_date,
            register_date: listing.register_date,
            is_new,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn key(&self) -> CarrierKey {
        CarrierKey::normalize(&self.mc_number)
    }

    #[must_use]
    pub fn with_snapshot(mut self, patch: SnapshotPatch) -> Self {
        overlay(&mut self.usdot_status, patch.usdot_status);
        overlay(&mut self.usdot, patch.usdot);
        overlay(&mut self.safety_rating, patch.safety_rating);
        overlay(&mut self.physical_address, patch.physical_address);
        overlay(&mut self.mailing_address, patch.mailing_address);
        overlay(&mut self.phone, patch.phone);
        overlay(&mut self.power_units, patch.power_units);
        overlay(&mut self.drivers, patch.drivers);
        overlay(&mut self.oos_percent_vehicle, patch.oos_percent_vehicle);
        overlay(&mut self.oos_percent_driver, patch.oos_percent_driver);
        overlay(&mut self.oos_percent_hazmat, patch.oos_percent_hazmat);
        overlay(&mut self.crash_fatal, patch.crash_fatal);
        overlay(&mut self.crash_injury, patch.crash_injury);
        overlay(&mut self.crash_tow, patch.crash_tow);
        overlay(&mut self.crash_total, patch.crash_total);
        overlay(&mut self.insurance_link, patch.insurance_link);
        self
    }

    #[must_use]
    pub fn with_registration(mut self, patch: RegistrationPatch) -> Self {
        overlay(&mut self.usdot, patch.usdot);
        overlay(&mut self.legal_name, patch.legal_name);
        overlay(&mut self.dba_name, patch.dba_name);
        overlay(&mut self.address, single_line(&patch.address));
        overlay(&mut self.telephone, patch.telephone);
        overlay(&mut self.fax, patch.fax);
        overlay(&mut self.email, patch.email);
        overlay(&mut self.mcs_150_date, patch.mcs_150_date);
        overlay(&mut self.vehicle_miles_traveled, patch.vehicle_miles_traveled);
        overlay(&mut self.vmt_year, patch.vmt_year);
        overlay(&mut self.power_units, patch.power_units);
        overlay(&mut self.drivers, patch.drivers);
        overlay(&mut self.carrier_operation, patch.carrier_operation);
        self
    }

    /// `Some` replaces the whole sub-record, `None` leaves it untouched
    #[must_use]
    pub fn with_insurance(mut self, insurance: Option<InsuranceRecord>) -> Self {
        if let Some(record) = insurance {
            self.insurance = Some(record);
        }
        self
    }

    #[must_use]
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempt_count = attempts;
        self
    }

    /// Retry success criterion: any insurance key field populated
    #[must_use]
    pub fn has_key_enrichment_field(&self) -> bool {
        self.insurance
            .as_ref()
            .is_some_and(InsuranceRecord::has_key_field)
    }

    /// Email, legal name or MCS-150 date populated
    #[must_use]
    pub fn has_identity(&self) -> bool {
        [&self.email, &self.legal_name, &self.mcs_150_date]
            .iter()
            .any(|v| !v.trim().is_empty())
    }

    #[must_use]
    pub fn has_insurance_link(&self) -> bool {
        !self.insurance_link.trim().is_empty()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.usdot_status.trim().eq_ignore_ascii_case("ACTIVE")
    }

    /// Insurance missing or status still unknown
    #[must_use]
    pub fn needs_reenrichment(&self) -> bool {
        self.insurance
            .as_ref()
            .is_none_or(|ins| ins.status == InsuranceStatus::Unknown)
    }

    #[must_use]
    pub fn enrichment_state(&self, max_attempts: u32) -> EnrichmentState {
        if self.has_key_enrichment_field() {
            EnrichmentState::Enriched
        } else if self.attempt_count >= max_attempts {
            EnrichmentState::Failed
        } else {
            EnrichmentState::Pending
        }
    }

    /// Sufficiently enriched: key field present or attempts exhausted
    #[must_use]
    pub fn is_settled(&self, max_attempts: u32) -> bool {
        self.enrichment_state(max_attempts) != EnrichmentState::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 18).unwrap()
    }

    fn listing(mc: &str) -> RegisterListing {
        RegisterListing {
            mc_number: mc.into(),
            company_name: "CASCADE HAULING LLC".into(),
            state: "WA".into(),
            decision_date: "10/10/2026".into(),
            register_date: "October 15, 2026".into(),
        }
    }

    #[test]
    fn listing_becomes_pending_entry() {
        let entry = McEntry::from_listing(listing("MC-1500123-C"), today());
        assert_eq!(entry.key().as_str(), "MC-1500123");
        assert!(entry.is_new);
        assert_eq!(entry.enrichment_state(3), EnrichmentState::Pending);
        assert!(entry.needs_reenrichment());
    }

    #[test]
    fn registration_overlays_only_non_empty_values() {
        let entry = McEntry::from_listing(listing("MC-1"), today()).with_snapshot(SnapshotPatch {
            usdot_status: "ACTIVE".into(),
            power_units: "4".into(),
            drivers: "5".into(),
            ..SnapshotPatch::default()
        });
        let entry = entry.with_registration(RegistrationPatch {
            drivers: "6".into(),
            address: "12 MAIN ST\n  SPOKANE,  WA".into(),
            ..RegistrationPatch::default()
        });
        assert_eq!(entry.power_units, "4");
        assert_eq!(entry.drivers, "6");
        assert_eq!(entry.address, "12 MAIN ST SPOKANE, WA");
        assert!(entry.is_active());
    }

    #[test]
    fn insurance_is_replaced_whole_or_not_at_all() {
        let first = InsuranceRecord {
            form: "91X".into(),
            carrier: "ACME MUTUAL".into(),
            status: InsuranceStatus::Active,
            ..InsuranceRecord::default()
        };
        let entry = McEntry::default().with_insurance(Some(first.clone()));
        let untouched = entry.clone().with_insurance(None);
        assert_eq!(untouched.insurance, Some(first));

        let second = InsuranceRecord {
            form: "BMC-34".into(),
            ..InsuranceRecord::default()
        };
        let replaced = entry.with_insurance(Some(second.clone()));
        assert_eq!(replaced.insurance, Some(second));
    }

    #[test]
    fn enrichment_state_is_derived() {
        let entry = McEntry::default().with_attempts(3);
        assert_eq!(entry.enrichment_state(3), EnrichmentState::Failed);
        assert!(entry.is_settled(3));

        let enriched = entry.with_insurance(Some(InsuranceRecord {
            status: InsuranceStatus::Lapsed,
            ..InsuranceRecord::default()
        }));
        assert_eq!(enriched.enrichment_state(3), EnrichmentState::Enriched);
        assert!(!enriched.needs_reenrichment());
    }

    #[test]
    fn legacy_lines_deserialize_with_defaults() {
        let entry: McEntry =
            serde_json::from_str(r#"{"mc_number":"MC-9","is_new_mc":true,"extra":"x"}"#).unwrap();
        assert_eq!(entry.schema_version, ENTRY_SCHEMA_VERSION);
        assert!(entry.is_new);
        assert!(entry.insurance.is_none());
    }
}
