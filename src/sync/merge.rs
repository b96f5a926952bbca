//! Deterministic 3-way merge over JSONL exports, record-by-record keyed on
//! `id`. Built to run as a git merge driver over `.hive/issues.jsonl`, so
//! the output must be byte-stable and independent of which replica runs it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{CLOCK_SKEW_GRACE_MS, DEFAULT_TOMBSTONE_TTL_MS, MIN_TOMBSTONE_TTL_MS};
use crate::error::Result;
use crate::store::parse_dt;

#[derive(Debug, Default, Clone, Copy)]
pub struct MergeOptions {
    /// Apply the default conflict policy (newer `updated_at` wins, ties to
    /// the higher `sequence`) instead of reporting conflicts.
    pub resolve_conflicts: bool,
    pub tombstone_ttl_ms: Option<i64>,
}

#[derive(Debug)]
pub struct MergeOutcome {
    /// Merged JSONL, sorted by id, byte-stable.
    pub merged: String,
    pub conflicts: Vec<MergeConflict>,
}

/// An unresolved record carrying all three versions for the caller.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MergeConflict {
    pub id: String,
    pub base: Option<Value>,
    pub ours: Option<Value>,
    pub theirs: Option<Value>,
}

/// Merge two descendants of a common base. Per record:
/// one-sided change wins; identical changes collapse; a live tombstone
/// beats everything; divergent changes conflict (or resolve per options).
pub fn merge_3way(base: &str, ours: &str, theirs: &str, opts: MergeOptions) -> Result<MergeOutcome> {
    let base_map = parse_records(base);
    let ours_map = parse_records(ours);
    let theirs_map = parse_records(theirs);
    let now = Utc::now();
    let ttl_ms = opts
        .tombstone_ttl_ms
        .unwrap_or(DEFAULT_TOMBSTONE_TTL_MS)
        .max(MIN_TOMBSTONE_TTL_MS);

    let mut ids: Vec<&String> = base_map
        .keys()
        .chain(ours_map.keys())
        .chain(theirs_map.keys())
        .collect();
    ids.sort();
    ids.dedup();

    let mut merged = String::new();
    let mut conflicts = Vec::new();

    for id in ids {
        let base_rec = base_map.get(id);
        let ours_rec = ours_map.get(id);
        let theirs_rec = theirs_map.get(id);

        let resolution = merge_record(base_rec, ours_rec, theirs_rec, ttl_ms, now);
        match resolution {
            Resolution::Take(record) => {
                merged.push_str(&serde_json::to_string(record)?);
                merged.push('\n');
            }
            Resolution::Drop => {}
            Resolution::Conflict => {
                if opts.resolve_conflicts {
                    let winner = prefer_newer(ours_rec, theirs_rec);
                    if let Some(record) = winner {
                        merged.push_str(&serde_json::to_string(record)?);
                        merged.push('\n');
                    }
                } else {
                    conflicts.push(MergeConflict {
                        id: id.clone(),
                        base: base_rec.cloned(),
                        ours: ours_rec.cloned(),
                        theirs: theirs_rec.cloned(),
                    });
                }
            }
        }
    }

    Ok(MergeOutcome { merged, conflicts })
}

enum Resolution<'a> {
    Take(&'a Value),
    Drop,
    Conflict,
}

fn merge_record<'a>(
    base: Option<&'a Value>,
    ours: Option<&'a Value>,
    theirs: Option<&'a Value>,
    ttl_ms: i64,
    now: DateTime<Utc>,
) -> Resolution<'a> {
    // A live tombstone on either side wins outright.
    let ours_tomb = ours.filter(|r| live_tombstone(r, ttl_ms, now));
    let theirs_tomb = theirs.filter(|r| live_tombstone(r, ttl_ms, now));
    if let Some(tomb) = ours_tomb.or(theirs_tomb) {
        return Resolution::Take(tomb);
    }

    let ours_changed = !same_record(base, ours);
    let theirs_changed = !same_record(base, theirs);

    match (ours, theirs) {
        (None, None) => Resolution::Drop,
        (Some(our), Some(their)) => {
            if same_record(ours, theirs) {
                Resolution::Take(our)
            } else if !ours_changed {
                Resolution::Take(their)
            } else if !theirs_changed {
                Resolution::Take(our)
            } else {
                Resolution::Conflict
            }
        }
        // Present on one side only: an unchanged record that disappeared
        // stays deleted; a changed one survives the other side's deletion.
        (Some(our), None) => {
            if ours_changed {
                Resolution::Take(our)
            } else {
                Resolution::Drop
            }
        }
        (None, Some(their)) => {
            if theirs_changed {
                Resolution::Take(their)
            } else {
                Resolution::Drop
            }
        }
    }
}

/// Records are "the same" when their content hashes agree, falling back to
/// deep equality for records that carry no hash.
fn same_record(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            match (hash_of(a), hash_of(b)) {
                (Some(ha), Some(hb)) => ha == hb,
                _ => a == b,
            }
        }
        _ => false,
    }
}

fn hash_of(record: &Value) -> Option<&str> {
    record.get("content_hash").and_then(Value::as_str)
}

fn live_tombstone(record: &Value, ttl_ms: i64, now: DateTime<Utc>) -> bool {
    if record.get("status").and_then(Value::as_str) != Some("tombstone") {
        return false;
    }
    let Some(deleted_at) = record.get("deleted_at").and_then(Value::as_str) else {
        return false;
    };
    now < parse_dt(deleted_at) + chrono::Duration::milliseconds(ttl_ms + CLOCK_SKEW_GRACE_MS)
}

/// Default conflict policy: newer `updated_at` wins, ties broken by the
/// higher `sequence` when both carry one, finally by ours.
fn prefer_newer<'a>(ours: Option<&'a Value>, theirs: Option<&'a Value>) -> Option<&'a Value> {
    match (ours, theirs) {
        (Some(our), Some(their)) => {
            let our_time = our.get("updated_at").and_then(Value::as_str).map(parse_dt);
            let their_time = their.get("updated_at").and_then(Value::as_str).map(parse_dt);
            match (our_time, their_time) {
                (Some(a), Some(b)) if a < b => Some(their),
                (Some(a), Some(b)) if a > b => Some(our),
                _ => {
                    let our_seq = our.get("sequence").and_then(Value::as_i64).unwrap_or(0);
                    let their_seq = their.get("sequence").and_then(Value::as_i64).unwrap_or(0);
                    if their_seq > our_seq { Some(their) } else { Some(our) }
                }
            }
        }
        (our, their) => our.or(their),
    }
}

fn parse_records(jsonl: &str) -> BTreeMap<String, Value> {
    let mut map = BTreeMap::new();
    for line in jsonl.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(line)
            && let Some(id) = value.get("id").and_then(Value::as_str)
        {
            map.insert(id.to_string(), value);
        }
    }
    map
}
