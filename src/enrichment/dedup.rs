//! Deduplication by carrier key
//!
//! A record carrying identity data (email, legal name or MCS-150 date) beats
//! one that doesn't; after that a record with an insurance link wins. Equal
//! ranks keep whichever record came first, so the caller decides recency by
//! the order it feeds records in.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use crate::domain::{CarrierKey, McEntry};

/// Preference rank; higher wins
#[must_use]
pub fn rank(entry: &McEntry) -> (bool, bool) {
    (entry.has_identity(), entry.has_insurance_link())
}

/// One record per key, in first-seen key order. Records with an empty key are dropped.
#[must_use]
pub fn deduplicate<I>(entries: I) -> Vec<McEntry>
where
    I: IntoIterator<Item = McEntry>,
{
    let mut slots: HashMap<CarrierKey, usize> = HashMap::new();
    let mut kept: Vec<McEntry> = Vec::new();

    for entry in entries {
        let key = entry.key();
        if key.is_empty() {
            continue;
        }
        match slots.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(kept.len());
                kept.push(entry);
            }
            Entry::Occupied(slot) => {
                let current = &mut kept[*slot.get()];
                if rank(&entry) > rank(current) {
                    *current = entry;
                }
            }
        }
    }
    kept
}
