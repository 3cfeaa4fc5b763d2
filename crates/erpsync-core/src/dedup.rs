//! Collapses repeated natural keys inside one fetched page.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};

use chrono::NaiveDateTime;
use serde_json::Value;

use crate::coerce::as_timestamp;
use crate::descriptor::DedupStrategy;
use crate::RawRecord;

/// Structured natural key: one canonical JSON rendering per key field.
pub type DedupKey = Vec<String>;

/// Returns `None` when any key field is missing or null; such records are
/// treated as unique.
pub fn dedup_key(record: &RawRecord, fields: &[String]) -> Option<DedupKey> {
    if fields.is_empty() {
        return None;
    }
    fields
        .iter()
        .map(|field| match record.get(field) {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.to_string()),
        })
        .collect()
}

impl DedupStrategy {
    /// Applies the strategy; `key_fields` is used when the strategy does not
    /// name its own fields. Survivors keep their input order.
    pub fn apply(&self, records: Vec<RawRecord>, key_fields: &[String]) -> Vec<RawRecord> {
        match self {
            DedupStrategy::None => records,
            DedupStrategy::KeepLast { fields } => {
                let fields = if fields.is_empty() { key_fields } else { fields.as_slice() };
                keep_last(records, fields)
            }
            DedupStrategy::KeepMaxTimestamp {
                fields,
                timestamp_field,
            } => {
                let fields = if fields.is_empty() { key_fields } else { fields.as_slice() };
                keep_max_timestamp(records, fields, timestamp_field)
            }
        }
    }
}

pub fn keep_last(records: Vec<RawRecord>, fields: &[String]) -> Vec<RawRecord> {
    let mut seen = HashSet::new();
    let mut keep = vec![false; records.len()];
    for (idx, record) in records.iter().enumerate().rev() {
        keep[idx] = match dedup_key(record, fields) {
            Some(key) => seen.insert(key),
            None => true,
        };
    }
    retain_marked(records, &keep)
}

pub fn keep_max_timestamp(
    records: Vec<RawRecord>,
    fields: &[String],
    timestamp_field: &str,
) -> Vec<RawRecord> {
    let mut best: HashMap<DedupKey, (usize, Option<NaiveDateTime>)> = HashMap::new();
    let mut keep = vec![false; records.len()];

    for (idx, record) in records.iter().enumerate() {
        let Some(key) = dedup_key(record, fields) else {
            keep[idx] = true;
            continue;
        };
        // Unparsable or missing timestamps rank lowest.
        let ts = as_timestamp(record, timestamp_field).ok().flatten();
        match best.entry(key) {
            Entry::Occupied(mut slot) => {
                if ts >= slot.get().1 {
                    slot.insert((idx, ts));
                }
            }
            Entry::Vacant(slot) => {
                slot.insert((idx, ts));
            }
        }
    }
    for (idx, _) in best.values() {
        keep[*idx] = true;
    }
    retain_marked(records, &keep)
}

fn retain_marked(records: Vec<RawRecord>, keep: &[bool]) -> Vec<RawRecord> {
    records
        .into_iter()
        .zip(keep.iter())
        .filter_map(|(record, keep)| keep.then_some(record))
        .collect()
}
