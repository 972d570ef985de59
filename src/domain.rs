//! Domain module - carrier records and the rules that govern them
//!
//! Pure types only: no I/O, no async. Everything here is shared by the
//! enrichment pipeline and the infrastructure adapters.

pub mod carrier_key;
pub mod dates;
pub mod entry;
pub mod flat_record;
pub mod insurance;

pub use carrier_key::CarrierKey;
pub use entry::{EnrichmentState, McEntry, RegisterListing, RegistrationPatch, SnapshotPatch};
pub use flat_record::{CSV_COLUMNS, FlatRecord};
pub use insurance::{InsuranceRecord, InsuranceStatus};
