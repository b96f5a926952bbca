//! Append-only event log.
//!
//! Every coordination fact is appended here before the projections are
//! updated, inside the same transaction. `sequence` is per-project and
//! strictly increasing; `(project_key, sequence)` is the canonical read
//! order. Events are never mutated or deleted outside `Database::reset`.

use chrono::Utc;
use rusqlite::{Transaction, params};
use serde_json::Value;

use super::{HiveStore, projections};
use crate::error::Result;

pub const BEAD_CREATED: &str = "bead_created";
pub const BEAD_UPDATED: &str = "bead_updated";
pub const BEAD_STATUS_CHANGED: &str = "bead_status_changed";
pub const BEAD_CLOSED: &str = "bead_closed";
pub const BEAD_REOPENED: &str = "bead_reopened";
pub const BEAD_DELETED: &str = "bead_deleted";
pub const BEAD_COMPACTED: &str = "bead_compacted";
pub const BEAD_DEPENDENCY_ADDED: &str = "bead_dependency_added";
pub const BEAD_DEPENDENCY_REMOVED: &str = "bead_dependency_removed";
pub const BEAD_LABEL_ADDED: &str = "bead_label_added";
pub const BEAD_LABEL_REMOVED: &str = "bead_label_removed";
pub const BEAD_COMMENT_ADDED: &str = "bead_comment_added";
pub const BEAD_COMMENT_UPDATED: &str = "bead_comment_updated";
pub const BEAD_COMMENT_DELETED: &str = "bead_comment_deleted";
pub const BEAD_EPIC_CLOSURE_ELIGIBLE: &str = "bead_epic_closure_eligible";
pub const AGENT_REGISTERED: &str = "agent_registered";
pub const AGENT_SEEN: &str = "agent_seen";
pub const AGENT_REMOVED: &str = "agent_removed";
pub const MESSAGE_SENT: &str = "message_sent";
pub const MESSAGE_READ: &str = "message_read";
pub const RESERVATION_ACQUIRED: &str = "reservation_acquired";
pub const RESERVATION_RELEASED: &str = "reservation_released";
pub const DECISION_RECORDED: &str = "decision_recorded";
pub const SYNC_IMPORTED: &str = "sync_imported";

#[derive(Debug, Clone, serde::Serialize)]
pub struct HiveEvent {
    pub id: i64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub project_key: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub sequence: i64,
    pub data: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendedEvent {
    pub id: i64,
    pub sequence: i64,
}

#[derive(Debug, Default, Clone)]
pub struct EventFilter {
    pub project_key: Option<String>,
    pub types: Vec<String>,
    pub bead_id: Option<String>,
    /// Unix ms, inclusive.
    pub since: Option<i64>,
    /// Unix ms, exclusive.
    pub until: Option<i64>,
    pub after_sequence: Option<i64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl EventFilter {
    pub fn for_project(project_key: impl Into<String>) -> Self {
        Self {
            project_key: Some(project_key.into()),
            ..Self::default()
        }
    }
}

/// Append a row and apply it to the projections inside an existing
/// transaction. The caller owns commit/rollback, so partial failures roll
/// back both the event and its projection updates.
pub(crate) fn append_in_tx(
    tx: &Transaction<'_>,
    event_type: &str,
    project_key: &str,
    data: Value,
) -> Result<HiveEvent> {
    let sequence: i64 = tx.query_row(
        "SELECT COALESCE(MAX(sequence), 0) + 1 FROM events WHERE project_key = ?1",
        params![project_key],
        |row| row.get(0),
    )?;
    let timestamp = Utc::now().timestamp_millis();
    tx.execute(
        "INSERT INTO events (type, project_key, timestamp, sequence, data)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![event_type, project_key, timestamp, sequence, data.to_string()],
    )?;
    let event = HiveEvent {
        id: tx.last_insert_rowid(),
        event_type: event_type.to_string(),
        project_key: project_key.to_string(),
        timestamp,
        sequence,
        data,
    };
    projections::apply_event(tx, &event)?;
    Ok(event)
}

impl HiveStore {
    /// Append a single event and update the projections atomically.
    pub fn append_event(
        &self,
        event_type: &str,
        project_key: &str,
        data: Value,
    ) -> Result<AppendedEvent> {
        let tx = self.database().conn().unchecked_transaction()?;
        let event = append_in_tx(&tx, event_type, project_key, data)?;
        tx.commit()?;
        tracing::debug!(
            event_type,
            project_key,
            sequence = event.sequence,
            "event appended"
        );
        Ok(AppendedEvent {
            id: event.id,
            sequence: event.sequence,
        })
    }

    /// Read events in ascending sequence order.
    pub fn read_events(&self, filter: &EventFilter) -> Result<Vec<HiveEvent>> {
        let mut sql = String::from(
            "SELECT id, type, project_key, timestamp, sequence, data FROM events WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(project) = &filter.project_key {
            sql.push_str(&format!(" AND project_key = ?{}", args.len() + 1));
            args.push(Box::new(project.clone()));
        }
        if !filter.types.is_empty() {
            let placeholders: Vec<String> = filter
                .types
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", args.len() + 1 + i))
                .collect();
            sql.push_str(&format!(" AND type IN ({})", placeholders.join(", ")));
            for t in &filter.types {
                args.push(Box::new(t.clone()));
            }
        }
        if let Some(bead_id) = &filter.bead_id {
            sql.push_str(&format!(
                " AND json_extract(data, '$.bead_id') = ?{}",
                args.len() + 1
            ));
            args.push(Box::new(bead_id.clone()));
        }
        if let Some(since) = filter.since {
            sql.push_str(&format!(" AND timestamp >= ?{}", args.len() + 1));
            args.push(Box::new(since));
        }
        if let Some(until) = filter.until {
            sql.push_str(&format!(" AND timestamp < ?{}", args.len() + 1));
            args.push(Box::new(until));
        }
        if let Some(after) = filter.after_sequence {
            sql.push_str(&format!(" AND sequence > ?{}", args.len() + 1));
            args.push(Box::new(after));
        }
        sql.push_str(" ORDER BY project_key, sequence");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = filter.offset {
            if filter.limit.is_none() {
                sql.push_str(" LIMIT -1");
            }
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        let mut stmt = self.database().conn().prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            args.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(params_ref.as_slice(), |row| {
            let data: String = row.get(5)?;
            Ok(HiveEvent {
                id: row.get(0)?,
                event_type: row.get(1)?,
                project_key: row.get(2)?,
                timestamp: row.get(3)?,
                sequence: row.get(4)?,
                data: serde_json::from_str(&data).unwrap_or(Value::Null),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// The highest sequence for a project, 0 if none.
    pub fn max_sequence(&self, project_key: &str) -> Result<i64> {
        let max: i64 = self.database().conn().query_row(
            "SELECT COALESCE(MAX(sequence), 0) FROM events WHERE project_key = ?1",
            params![project_key],
            |row| row.get(0),
        )?;
        Ok(max)
    }

    /// Recovery path: optionally truncate the projection tables for the
    /// project, then re-apply every event in sequence order. Returns the
    /// number of events replayed.
    pub fn replay(&self, project_key: &str, clear_views: bool) -> Result<usize> {
        let tx = self.database().conn().unchecked_transaction()?;
        if clear_views {
            projections::clear_project_views(&tx, project_key)?;
        }

        let events: Vec<HiveEvent> = {
            let mut stmt = tx.prepare(
                "SELECT id, type, project_key, timestamp, sequence, data
                 FROM events WHERE project_key = ?1 ORDER BY sequence",
            )?;
            let rows = stmt.query_map(params![project_key], |row| {
                let data: String = row.get(5)?;
                Ok(HiveEvent {
                    id: row.get(0)?,
                    event_type: row.get(1)?,
                    project_key: row.get(2)?,
                    timestamp: row.get(3)?,
                    sequence: row.get(4)?,
                    data: serde_json::from_str(&data).unwrap_or(Value::Null),
                })
            })?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        for event in &events {
            projections::apply_event(&tx, event)?;
        }
        tx.commit()?;
        tracing::info!(project_key, events = events.len(), "replay complete");
        Ok(events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sequences_are_per_project_and_monotonic() {
        let store = HiveStore::open_memory().unwrap();
        let a1 = store
            .append_event(BEAD_COMPACTED, "/a", json!({"bead_id": "bd-1"}))
            .unwrap();
        let b1 = store
            .append_event(BEAD_COMPACTED, "/b", json!({"bead_id": "bd-2"}))
            .unwrap();
        let a2 = store
            .append_event(BEAD_COMPACTED, "/a", json!({"bead_id": "bd-3"}))
            .unwrap();
        assert_eq!(a1.sequence, 1);
        assert_eq!(b1.sequence, 1);
        assert_eq!(a2.sequence, 2);
    }

    #[test]
    fn append_increases_max_sequence() {
        let store = HiveStore::open_memory().unwrap();
        let before = store.max_sequence("/repo").unwrap();
        let appended = store
            .append_event(BEAD_COMPACTED, "/repo", json!({}))
            .unwrap();
        assert!(appended.sequence > before);
        assert_eq!(store.max_sequence("/repo").unwrap(), appended.sequence);
    }

    #[test]
    fn read_events_filters_by_type_and_sequence() {
        let store = HiveStore::open_memory().unwrap();
        store
            .append_event(BEAD_COMPACTED, "/repo", json!({"bead_id": "bd-1"}))
            .unwrap();
        store
            .append_event(SYNC_IMPORTED, "/repo", json!({}))
            .unwrap();
        store
            .append_event(BEAD_COMPACTED, "/repo", json!({"bead_id": "bd-2"}))
            .unwrap();

        let filter = EventFilter {
            project_key: Some("/repo".into()),
            types: vec![BEAD_COMPACTED.into()],
            ..Default::default()
        };
        let events = store.read_events(&filter).unwrap();
        assert_eq!(events.len(), 2);

        let filter = EventFilter {
            project_key: Some("/repo".into()),
            after_sequence: Some(1),
            ..Default::default()
        };
        let events = store.read_events(&filter).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 2);
    }

    #[test]
    fn read_events_filters_by_bead_id() {
        let store = HiveStore::open_memory().unwrap();
        store
            .append_event(BEAD_COMPACTED, "/repo", json!({"bead_id": "bd-1"}))
            .unwrap();
        store
            .append_event(BEAD_COMPACTED, "/repo", json!({"bead_id": "bd-2"}))
            .unwrap();
        let filter = EventFilter {
            project_key: Some("/repo".into()),
            bead_id: Some("bd-2".into()),
            ..Default::default()
        };
        let events = store.read_events(&filter).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["bead_id"], "bd-2");
    }

    #[test]
    fn suffix_reads_are_prefix_contiguous() {
        let store = HiveStore::open_memory().unwrap();
        for i in 0..5 {
            store
                .append_event(BEAD_COMPACTED, "/repo", json!({"n": i}))
                .unwrap();
        }
        let all = store
            .read_events(&EventFilter::for_project("/repo"))
            .unwrap();
        let suffix = store
            .read_events(&EventFilter {
                project_key: Some("/repo".into()),
                after_sequence: Some(2),
                ..Default::default()
            })
            .unwrap();
        let tail: Vec<i64> = all.iter().skip(2).map(|e| e.sequence).collect();
        let got: Vec<i64> = suffix.iter().map(|e| e.sequence).collect();
        assert_eq!(tail, got);
    }
}
