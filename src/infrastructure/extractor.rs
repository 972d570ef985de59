//! FMCSA page extractors
//!
//! HTML → 구조화 레코드. 모든 추출은 필드 단위로 방어적으로 수행되며,
//! 기대한 테이블/필드가 없으면 해당 필드를 빈 값으로 둔다 (에러 아님).

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::domain::{InsuranceRecord, InsuranceStatus, RegisterListing, RegistrationPatch, SnapshotPatch};

use super::config::fmcsa;

/// Published register date (display text + the `pd_date` form value)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDate {
    pub display: String,
    pub pd_date: String,
}

/// HTML → record, one method per page kind
pub trait PageExtractor: Send + Sync {
    /// SAFER company snapshot
    fn snapshot(&self, html: &str) -> SnapshotPatch;

    /// Whether `html` is an SMS carrier registration page at all
    fn is_registration_page(&self, html: &str) -> bool;

    /// SMS carrier registration
    fn registration(&self, html: &str) -> RegistrationPatch;

    /// Active/Pending insurance (or insurance history); `None` when no policy row exists
    fn insurance(&self, html: &str) -> Option<InsuranceRecord>;

    /// Register dates listing
    fn register_dates(&self, html: &str) -> Vec<RegisterDate>;

    /// Register detail rows for one published date
    fn register_listings(&self, html: &str, register_date: &str) -> Vec<RegisterListing>;
}

macro_rules! selector {
    ($name:ident, $css:expr) => {
        static $name: Lazy<Selector> = Lazy::new(|| {
            #[allow(clippy::unwrap_used)]
            Selector::parse($css).unwrap()
        });
    };
}

selector!(TABLE, "table");
selector!(TR, "tr");
selector!(TH, "th");
selector!(LABEL_CELLS, "th, td");
selector!(ANCHOR, "a[href]");
selector!(REG_LIST_ITEMS, "ul.col1 li, ul.col2 li");
selector!(LABEL, "label");
selector!(DAT, "span.dat");
selector!(REGBOX_H3, "#regBox h3");
selector!(PD_DATE, "input[name=\"pd_date\"]");

static MCS150_DATE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"MCS-150 Date:\s*([\d/]+)").unwrap()
});

static REGISTRATION_TEXT: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    [
        ("mcs_150_date", r"MCS-150 Date:\s*([\d/]+)"),
        ("legal_name", r"Legal Name:\s*([^\n]*)"),
        ("dba_name", r"DBA Name:\s*([^\n]*)"),
        ("usdot", r"U\.S\. DOT#:\s*(\d+)"),
        ("address", r"Address:\s*([^\n]*)"),
        ("telephone", r"Telephone:\s*([()\d\- ]+)"),
        ("fax", r"Fax:\s*([^\n]*)"),
        ("email", r"Email:\s*([\w.\-]+@[\w.\-]+)"),
        ("vehicle_miles_traveled", r"Vehicle Miles Traveled:\s*([\d,]+)"),
        ("vmt_year", r"VMT Year:\s*(\d+)"),
        ("power_units", r"Power Units:\s*(\d+)"),
        ("drivers", r"Drivers:\s*(\d+)"),
        ("carrier_operation", r"Carrier Operation:\s*([^\n]*)"),
    ]
    .into_iter()
    .filter_map(|(field, pattern)| Regex::new(pattern).ok().map(|re| (field, re)))
    .collect()
});

/// Whitespace-collapsed text of an element
fn text_of(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Direct `td`/`th` children of a row
fn cells(row: ElementRef<'_>) -> Vec<ElementRef<'_>> {
    row.children()
        .filter_map(ElementRef::wrap)
        .filter(|c| matches!(c.value().name(), "td" | "th"))
        .collect()
}

/// Text of the first `td` after the first `th` containing `label`
fn labelled_value(doc: &Html, label: &str) -> String {
    let mut found = false;
    for cell in doc.select(&LABEL_CELLS) {
        match cell.value().name() {
            "th" if !found && text_of(cell).contains(label) => found = true,
            "td" if found => return text_of(cell),
            _ => {}
        }
    }
    String::new()
}

/// Innermost table having a header cell containing each of `headers`
fn table_with_headers<'a>(doc: &'a Html, headers: &[&str]) -> Option<ElementRef<'a>> {
    doc.select(&TABLE)
        .filter(|table| {
            let ths: Vec<String> = table.select(&TH).map(text_of).collect();
            headers.iter().all(|h| ths.iter().any(|t| t.contains(h)))
        })
        .last()
}

/// Data cells of the first row whose header cell contains `label`
fn row_values(table: ElementRef<'_>, label: &str) -> Vec<String> {
    table
        .select(&TR)
        .find_map(|row| {
            let cells = cells(row);
            let is_match = cells
                .first()
                .is_some_and(|c| c.value().name() == "th" && text_of(*c).contains(label));
            is_match.then(|| {
                cells
                    .iter()
                    .filter(|c| c.value().name() == "td")
                    .map(|c| text_of(*c))
                    .collect()
            })
        })
        .unwrap_or_default()
}

fn nth(values: &[String], index: usize) -> String {
    values.get(index).cloned().unwrap_or_default()
}

/// Absolute L&I URL for a snapshot link
fn absolute_li_url(href: &str) -> String {
    let href = href.trim();
    if href.starts_with("http") {
        href.to_string()
    } else if href.starts_with('/') {
        format!("{}{href}", fmcsa::LI_PUBLIC_BASE)
    } else {
        format!("{}/LIVIEW/{href}", fmcsa::LI_PUBLIC_BASE)
    }
}

fn insurance_link(doc: &Html) -> String {
    let direct = doc.select(&ANCHOR).find_map(|a| {
        let href = a.value().attr("href")?;
        (href.contains("pkg_carrquery.prc_carrlist") && href.contains("n_dotno=")).then_some(href)
    });
    let by_caption = || {
        doc.select(&ANCHOR).find_map(|a| {
            let parent = a.parent().and_then(ElementRef::wrap)?;
            text_of(parent)
                .contains("For Licensing and Insurance details")
                .then(|| a.value().attr("href"))
                .flatten()
        })
    };
    direct.or_else(by_caption).map(absolute_li_url).unwrap_or_default()
}

fn normalize_label(label: &str) -> String {
    label.replace(':', "").replace('\u{a0}', " ").trim().to_lowercase()
}

fn registration_slot<'p>(patch: &'p mut RegistrationPatch, field: &str) -> Option<&'p mut String> {
    let slot = match field {
        "mcs-150 date" | "mcs_150_date" => &mut patch.mcs_150_date,
        "legal name" | "legal_name" => &mut patch.legal_name,
        "dba name" | "dba_name" => &mut patch.dba_name,
        "u.s. dot#" | "usdot" => &mut patch.usdot,
        "address" => &mut patch.address,
        "telephone" => &mut patch.telephone,
        "fax" => &mut patch.fax,
        "email" => &mut patch.email,
        "vehicle miles traveled" | "vehicle_miles_traveled" => &mut patch.vehicle_miles_traveled,
        "vmt year" | "vmt_year" => &mut patch.vmt_year,
        "power units" | "power_units" => &mut patch.power_units,
        "drivers" => &mut patch.drivers,
        "carrier operation" | "carrier_operation" => &mut patch.carrier_operation,
        _ => return None,
    };
    Some(slot)
}

/// `NAME - CITY, ST` → (name, state)
fn split_title(title: &str) -> (String, String) {
    if let Some((name, city_state)) = title.rsplit_once('-') {
        if city_state.contains(',') {
            let state = city_state
                .rsplit_once(',')
                .map(|(_, st)| st.trim().to_string())
                .unwrap_or_default();
            return (name.trim().to_string(), state);
        }
    }
    (title.trim().to_string(), String::new())
}

/// Scraper-based extractor for the SAFER, SMS and L&I pages
#[derive(Debug, Clone, Copy, Default)]
pub struct FmcsaExtractor;

impl PageExtractor for FmcsaExtractor {
    fn snapshot(&self, html: &str) -> SnapshotPatch {
        let doc = Html::parse_document(html);

        let (safety_rating, oos, crashes) = {
            let rating = table_with_headers(&doc, &["Review Information"])
                .map(|t| nth(&row_values(t, "Rating:"), 0))
                .unwrap_or_default();
            let oos = table_with_headers(&doc, &["Inspection Type"])
                .map(|t| row_values(t, "Out of Service %"))
                .unwrap_or_default();
            let crashes = table_with_headers(&doc, &["Type", "Fatal"])
                .map(|t| row_values(t, "Crashes"))
                .unwrap_or_default();
            (rating, oos, crashes)
        };

        SnapshotPatch {
            usdot_status: labelled_value(&doc, "USDOT Status"),
            usdot: labelled_value(&doc, "USDOT Number"),
            safety_rating,
            physical_address: labelled_value(&doc, "Physical Address"),
            mailing_address: labelled_value(&doc, "Mailing Address"),
            phone: labelled_value(&doc, "Phone"),
            power_units: labelled_value(&doc, "Power Units"),
            drivers: labelled_value(&doc, "Drivers"),
            oos_percent_vehicle: nth(&oos, 0),
            oos_percent_driver: nth(&oos, 1),
            oos_percent_hazmat: nth(&oos, 2),
            crash_fatal: nth(&crashes, 0),
            crash_injury: nth(&crashes, 1),
            crash_tow: nth(&crashes, 2),
            crash_total: nth(&crashes, 3),
            insurance_link: insurance_link(&doc),
        }
    }

    fn is_registration_page(&self, html: &str) -> bool {
        html.contains("Legal Name:") || html.contains("MCS-150 Date:")
    }

    fn registration(&self, html: &str) -> RegistrationPatch {
        let doc = Html::parse_document(html);
        let mut patch = RegistrationPatch::default();

        for item in doc.select(&REG_LIST_ITEMS) {
            let (Some(label), Some(value)) = (item.select(&LABEL).next(), item.select(&DAT).next()) else {
                continue;
            };
            let label = normalize_label(&text_of(label));
            let value = text_of(value);
            if value.is_empty() || value.to_lowercase().ends_with("dot#:") || value == label {
                continue;
            }
            if let Some(slot) = registration_slot(&mut patch, &label) {
                *slot = value;
            }
        }

        if let Some(h3) = doc.select(&REGBOX_H3).next() {
            if let Some(date) = MCS150_DATE.captures(&text_of(h3)).and_then(|c| c.get(1)) {
                patch.mcs_150_date = date.as_str().to_string();
            }
        }

        // text fallback for anything the list markup did not carry
        let text = doc
            .root_element()
            .text()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        for (field, pattern) in REGISTRATION_TEXT.iter() {
            let Some(slot) = registration_slot(&mut patch, field) else { continue };
            if !slot.is_empty() {
                continue;
            }
            if let Some(value) = pattern.captures(&text).and_then(|c| c.get(1)) {
                let value = value.as_str().trim();
                if !value.is_empty() && !value.ends_with(':') {
                    *slot = value.to_string();
                }
            }
        }

        patch
    }

    fn insurance(&self, html: &str) -> Option<InsuranceRecord> {
        let doc = Html::parse_document(html);
        let table = doc.select(&TABLE).find(|table| {
            let headers: Vec<String> = table.select(&TH).map(|th| text_of(th).to_lowercase()).collect();
            ["form", "type", "insurance carrier"]
                .iter()
                .all(|h| headers.iter().any(|t| t == h))
        })?;

        // the last complete policy row wins
        table
            .select(&TR)
            .skip(1)
            .map(|row| cells(row).into_iter().map(text_of).collect::<Vec<_>>())
            .filter(|values| values.len() >= 7)
            .last()
            .map(|values| {
                let cancellation_date = nth(&values, 8);
                InsuranceRecord {
                    form: nth(&values, 0),
                    insurance_type: nth(&values, 1),
                    carrier: nth(&values, 2),
                    policy_surety: nth(&values, 3),
                    posted_date: nth(&values, 4),
                    coverage_from: nth(&values, 5),
                    coverage_to: nth(&values, 6),
                    effective_date: nth(&values, 7),
                    status: InsuranceStatus::from_cancellation(&cancellation_date),
                    cancellation_date,
                }
            })
    }

    fn register_dates(&self, html: &str) -> Vec<RegisterDate> {
        let doc = Html::parse_document(html);
        doc.select(&TR)
            .filter_map(|row| {
                let th = row.select(&TH).next()?;
                let pd_date = row.select(&PD_DATE).next()?.value().attr("value")?.trim().to_string();
                Some(RegisterDate {
                    display: text_of(th),
                    pd_date,
                })
            })
            .collect()
    }

    fn register_listings(&self, html: &str, register_date: &str) -> Vec<RegisterListing> {
        let doc = Html::parse_document(html);
        doc.select(&TR)
            .filter_map(|row| {
                let values: Vec<String> = cells(row).into_iter().map(text_of).collect();
                if values.len() < 3 || !(values[0].contains("MC-") || values[0].contains("FF-")) {
                    return None;
                }
                let (company_name, state) = split_title(&values[1]);
                Some(RegisterListing {
                    mc_number: values[0].clone(),
                    company_name,
                    state,
                    decision_date: values[2].clone(),
                    register_date: register_date.to_string(),
                })
            })
            .collect()
    }
}
