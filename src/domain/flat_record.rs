//! Flat export row
//!
//! 보험 하위 레코드를 `insurance_*` 컬럼으로 펼친 내보내기용 행.
//! Field order is the CSV column order; [`CSV_COLUMNS`] mirrors it for headers.

use serde::{Deserialize, Serialize};

use super::dates::normalize_date;
use super::entry::McEntry;
use super::insurance::InsuranceStatus;

pub const CSV_COLUMNS: &[&str] = &[
    "mc_number",
    "company_name",
    "state",
    "decision_date",
    "register_date",
    "is_new_mc",
    "usdot_status",
    "safety_rating",
    "physical_address",
    "mailing_address",
    "phone",
    "power_units",
    "drivers",
    "oos_percent_vehicle",
    "oos_percent_driver",
    "oos_percent_hazmat",
    "crash_fatal",
    "crash_injury",
    "crash_tow",
    "crash_total",
    "insurance_link",
    "mcs_150_date",
    "legal_name",
    "dba_name",
    "usdot",
    "address",
    "telephone",
    "fax",
    "email",
    "vehicle_miles_traveled",
    "vmt_year",
    "carrier_operation",
    "insurance_form",
    "insurance_type",
    "insurance_insurance_carrier",
    "insurance_policy_surety",
    "insurance_posted_date",
    "insurance_effective_date",
    "insurance_cancellation_date",
    "insurance_insurance_status",
    "insurance_coverage_from",
    "insurance_coverage_to",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatRecord {
    pub mc_number: String,
    pub company_name: String,
    pub state: String,
    pub decision_date: String,
    pub register_date: String,
    pub is_new_mc: bool,
    pub usdot_status: String,
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
    pub mcs_150_date: String,
    pub legal_name: String,
    pub dba_name: String,
    pub usdot: String,
    pub address: String,
    pub telephone: String,
    pub fax: String,
    pub email: String,
    pub vehicle_miles_traveled: String,
    pub vmt_year: String,
    pub carrier_operation: String,
    pub insurance_form: String,
    pub insurance_type: String,
    pub insurance_insurance_carrier: String,
    pub insurance_policy_surety: String,
    pub insurance_posted_date: String,
    pub insurance_effective_date: String,
    pub insurance_cancellation_date: String,
    pub insurance_insurance_status: String,
    pub insurance_coverage_from: String,
    pub insurance_coverage_to: String,
}

fn one_line(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl From<&McEntry> for FlatRecord {
    fn from(entry: &McEntry) -> Self {
        let ins = entry.insurance.clone().unwrap_or_default();
        let status = entry
            .insurance
            .as_ref()
            .map_or(InsuranceStatus::Unknown, |i| i.status);

        Self {
            mc_number: entry.mc_number.clone(),
            company_name: entry.company_name.clone(),
            state: entry.state.clone(),
            decision_date: normalize_date(&entry.decision_date),
            register_date: normalize_date(&entry.register_date),
            is_new_mc: entry.is_new,
            usdot_status: entry.usdot_status.clone(),
            safety_rating: entry.safety_rating.clone(),
            physical_address: one_line(&entry.physical_address),
            mailing_address: one_line(&entry.mailing_address),
            phone: entry.phone.clone(),
            power_units: entry.power_units.clone(),
            drivers: entry.drivers.clone(),
            oos_percent_vehicle: entry.oos_percent_vehicle.clone(),
            oos_percent_driver: entry.oos_percent_driver.clone(),
            oos_percent_hazmat: entry.oos_percent_hazmat.clone(),
            crash_fatal: entry.crash_fatal.clone(),
            crash_injury: entry.crash_injury.clone(),
            crash_tow: entry.crash_tow.clone(),
            crash_total: entry.crash_total.clone(),
            insurance_link: entry.insurance_link.clone(),
            mcs_150_date: entry.mcs_150_date.clone(),
            legal_name: entry.legal_name.clone(),
            dba_name: entry.dba_name.clone(),
            usdot: entry.usdot.clone(),
            address: one_line(&entry.address),
            telephone: entry.telephone.clone(),
            fax: entry.fax.clone(),
            email: entry.email.clone(),
            vehicle_miles_traveled: entry.vehicle_miles_traveled.clone(),
            vmt_year: entry.vmt_year.clone(),
            carrier_operation: entry.carrier_operation.clone(),
            insurance_form: ins.form,
            insurance_type: ins.insurance_type,
            insurance_insurance_carrier: ins.carrier,
            insurance_policy_surety: ins.policy_surety,
            insurance_posted_date: ins.posted_date,
            insurance_effective_date: ins.effective_date,
            insurance_cancellation_date: ins.cancellation_date,
            insurance_insurance_status: status.as_str().to_string(),
            insurance_coverage_from: ins.coverage_from,
            insurance_coverage_to: ins.coverage_to,
        }
    }
}
