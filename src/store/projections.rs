//! Materialized read models, updated on every event append.
//!
//! `apply_event` is a pure function of `(event, current state)`: applying
//! the same event twice yields the same end state, which is what makes
//! `replay` safe. Anything that needs validation (cycle checks) or emits
//! follow-up events (epic closure) happens in the writer operations before
//! the event is appended, never here.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{OptionalExtension, Transaction, params};
use serde_json::Value;

use super::{events, graph};
use crate::error::{HiveError, Result};

fn data_str<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

fn data_i64(data: &Value, key: &str) -> Option<i64> {
    data.get(key).and_then(Value::as_i64)
}

fn event_time(event: &events::HiveEvent) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(event.timestamp)
        .single()
        .unwrap_or_else(Utc::now)
}

fn require_bead_id(event: &events::HiveEvent) -> Result<&str> {
    data_str(&event.data, "bead_id").ok_or_else(|| HiveError::Parse {
        line: 0,
        message: format!("event '{}' missing bead_id", event.event_type),
    })
}

fn mark_dirty(tx: &Transaction<'_>, bead_id: &str, at: DateTime<Utc>) -> Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO dirty_beads (bead_id, marked_at) VALUES (?1, ?2)",
        params![bead_id, at.to_rfc3339()],
    )?;
    Ok(())
}

/// Apply one event to the projection tables. Runs inside the same
/// transaction as the event insert (or inside a replay transaction).
pub(crate) fn apply_event(tx: &Transaction<'_>, event: &events::HiveEvent) -> Result<()> {
    let data = &event.data;
    let project = event.project_key.as_str();
    let at = event_time(event);

    match event.event_type.as_str() {
        events::BEAD_CREATED => {
            let bead_id = require_bead_id(event)?;
            let created_at = data_str(data, "created_at")
                .map(|s| s.to_string())
                .unwrap_or_else(|| at.to_rfc3339());
            tx.execute(
                "INSERT OR REPLACE INTO beads
                    (id, project_key, title, description, issue_type, priority, status,
                     parent_id, assignee, created_at, updated_at, content_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'open', ?7, ?8, ?9, ?9, ?10)",
                params![
                    bead_id,
                    project,
                    data_str(data, "title").unwrap_or(""),
                    data_str(data, "description"),
                    data_str(data, "issue_type").unwrap_or("task"),
                    data_i64(data, "priority").unwrap_or(2),
                    data_str(data, "parent_id"),
                    data_str(data, "assignee"),
                    created_at,
                    data_str(data, "content_hash").unwrap_or(""),
                ],
            )?;
            if let Some(labels) = data.get("labels").and_then(Value::as_array) {
                for label in labels.iter().filter_map(Value::as_str) {
                    tx.execute(
                        "INSERT OR IGNORE INTO bead_labels (bead_id, label) VALUES (?1, ?2)",
                        params![bead_id, label],
                    )?;
                }
            }
            mark_dirty(tx, bead_id, at)?;
        }

        events::BEAD_UPDATED => {
            let bead_id = require_bead_id(event)?;
            // Patch semantics: only keys present in the payload change; an
            // explicit JSON null clears a nullable field.
            for field in ["title", "description", "issue_type", "parent_id", "assignee"] {
                if let Some(value) = data.get(field) {
                    tx.execute(
                        &format!("UPDATE beads SET {field} = ?1 WHERE id = ?2"),
                        params![value.as_str(), bead_id],
                    )?;
                }
            }
            if let Some(priority) = data_i64(data, "priority") {
                tx.execute(
                    "UPDATE beads SET priority = ?1 WHERE id = ?2",
                    params![priority, bead_id],
                )?;
            }
            tx.execute(
                "UPDATE beads SET updated_at = ?1, content_hash = COALESCE(?2, content_hash)
                 WHERE id = ?3",
                params![at.to_rfc3339(), data_str(data, "content_hash"), bead_id],
            )?;
            mark_dirty(tx, bead_id, at)?;
        }

        events::BEAD_STATUS_CHANGED => {
            let bead_id = require_bead_id(event)?;
            let to = data_str(data, "to").unwrap_or("open");
            if to == "closed" {
                tx.execute(
                    "UPDATE beads SET status = ?1, closed_at = ?2, updated_at = ?2,
                        content_hash = COALESCE(?3, content_hash)
                     WHERE id = ?4",
                    params![to, at.to_rfc3339(), data_str(data, "content_hash"), bead_id],
                )?;
            } else {
                tx.execute(
                    "UPDATE beads SET status = ?1, updated_at = ?2,
                        content_hash = COALESCE(?3, content_hash)
                     WHERE id = ?4",
                    params![to, at.to_rfc3339(), data_str(data, "content_hash"), bead_id],
                )?;
            }
            mark_dirty(tx, bead_id, at)?;
            // A closure (or un-closure) changes what blocks the dependents.
            graph::invalidate_blocked_cache_conn(tx, project, bead_id)?;
        }

        events::BEAD_CLOSED => {
            let bead_id = require_bead_id(event)?;
            let files_touched = data
                .get("files_touched")
                .filter(|v| v.is_array())
                .map(|v| v.to_string());
            tx.execute(
                "UPDATE beads SET status = 'closed', closed_at = ?1, updated_at = ?1,
                    close_reason = ?2, files_touched = COALESCE(?3, files_touched),
                    content_hash = COALESCE(?4, content_hash)
                 WHERE id = ?5",
                params![
                    at.to_rfc3339(),
                    data_str(data, "reason"),
                    files_touched,
                    data_str(data, "content_hash"),
                    bead_id
                ],
            )?;
            mark_dirty(tx, bead_id, at)?;
            graph::invalidate_blocked_cache_conn(tx, project, bead_id)?;
        }

        events::BEAD_REOPENED => {
            let bead_id = require_bead_id(event)?;
            tx.execute(
                "UPDATE beads SET status = 'open', closed_at = NULL, close_reason = NULL,
                    updated_at = ?1, content_hash = COALESCE(?2, content_hash)
                 WHERE id = ?3",
                params![at.to_rfc3339(), data_str(data, "content_hash"), bead_id],
            )?;
            mark_dirty(tx, bead_id, at)?;
            graph::invalidate_blocked_cache_conn(tx, project, bead_id)?;
        }

        events::BEAD_DELETED => {
            let bead_id = require_bead_id(event)?;
            tx.execute(
                "UPDATE beads SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2",
                params![at.to_rfc3339(), bead_id],
            )?;
            mark_dirty(tx, bead_id, at)?;
            graph::invalidate_blocked_cache_conn(tx, project, bead_id)?;
        }

        events::BEAD_DEPENDENCY_ADDED => {
            let bead_id = require_bead_id(event)?;
            let depends_on = data_str(data, "depends_on_id").unwrap_or_default();
            let relationship = data_str(data, "relationship").unwrap_or("blocks");
            tx.execute(
                "INSERT OR IGNORE INTO bead_dependencies
                    (bead_id, depends_on_id, relationship, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![bead_id, depends_on, relationship, at.to_rfc3339()],
            )?;
            mark_dirty(tx, bead_id, at)?;
            if relationship == "blocks" {
                graph::invalidate_blocked_cache_conn(tx, project, bead_id)?;
            }
        }

        events::BEAD_DEPENDENCY_REMOVED => {
            let bead_id = require_bead_id(event)?;
            let depends_on = data_str(data, "depends_on_id").unwrap_or_default();
            let relationship = data_str(data, "relationship").unwrap_or("blocks");
            tx.execute(
                "DELETE FROM bead_dependencies
                 WHERE bead_id = ?1 AND depends_on_id = ?2 AND relationship = ?3",
                params![bead_id, depends_on, relationship],
            )?;
            mark_dirty(tx, bead_id, at)?;
            if relationship == "blocks" {
                graph::invalidate_blocked_cache_conn(tx, project, bead_id)?;
            }
        }

        events::BEAD_LABEL_ADDED => {
            let bead_id = require_bead_id(event)?;
            tx.execute(
                "INSERT OR IGNORE INTO bead_labels (bead_id, label) VALUES (?1, ?2)",
                params![bead_id, data_str(data, "label").unwrap_or_default()],
            )?;
            mark_dirty(tx, bead_id, at)?;
        }

        events::BEAD_LABEL_REMOVED => {
            let bead_id = require_bead_id(event)?;
            tx.execute(
                "DELETE FROM bead_labels WHERE bead_id = ?1 AND label = ?2",
                params![bead_id, data_str(data, "label").unwrap_or_default()],
            )?;
            mark_dirty(tx, bead_id, at)?;
        }

        events::BEAD_COMMENT_ADDED => {
            let bead_id = require_bead_id(event)?;
            tx.execute(
                "INSERT OR REPLACE INTO bead_comments
                    (id, bead_id, author, body, parent_comment_id, created_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    data_i64(data, "comment_id").unwrap_or_default(),
                    bead_id,
                    data_str(data, "author").unwrap_or(""),
                    data_str(data, "body").unwrap_or(""),
                    data_i64(data, "parent_comment_id"),
                    data_str(data, "created_at").unwrap_or(&at.to_rfc3339()),
                    data.get("metadata").filter(|v| !v.is_null()).map(|v| v.to_string()),
                ],
            )?;
            mark_dirty(tx, bead_id, at)?;
        }

        events::BEAD_COMMENT_UPDATED => {
            let bead_id = require_bead_id(event)?;
            tx.execute(
                "UPDATE bead_comments SET body = ?1 WHERE id = ?2 AND bead_id = ?3",
                params![
                    data_str(data, "body").unwrap_or(""),
                    data_i64(data, "comment_id").unwrap_or_default(),
                    bead_id
                ],
            )?;
            mark_dirty(tx, bead_id, at)?;
        }

        events::BEAD_COMMENT_DELETED => {
            let bead_id = require_bead_id(event)?;
            let comment_id = data_i64(data, "comment_id").unwrap_or_default();
            // Drop the subtree: SQLite has no recursive delete here, so walk
            // children via a recursive CTE first.
            tx.execute(
                "DELETE FROM bead_comments WHERE id IN (
                    WITH RECURSIVE subtree(id) AS (
                        SELECT ?1
                        UNION
                        SELECT c.id FROM bead_comments c
                        JOIN subtree s ON c.parent_comment_id = s.id
                    )
                    SELECT id FROM subtree
                 ) AND bead_id = ?2",
                params![comment_id, bead_id],
            )?;
            mark_dirty(tx, bead_id, at)?;
        }

        events::AGENT_REGISTERED => {
            let name = data_str(data, "name").unwrap_or_default();
            tx.execute(
                "INSERT INTO agents (project_key, name, program, model, registered_at, last_seen_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT (project_key, name) DO UPDATE SET
                    program = excluded.program,
                    model = excluded.model,
                    last_seen_at = excluded.last_seen_at",
                params![
                    project,
                    name,
                    data_str(data, "program"),
                    data_str(data, "model"),
                    at.to_rfc3339()
                ],
            )?;
        }

        events::AGENT_SEEN => {
            tx.execute(
                "UPDATE agents SET last_seen_at = ?1 WHERE project_key = ?2 AND name = ?3",
                params![at.to_rfc3339(), project, data_str(data, "name").unwrap_or_default()],
            )?;
        }

        events::AGENT_REMOVED => {
            let name = data_str(data, "name").unwrap_or_default();
            tx.execute(
                "DELETE FROM reservations WHERE project_key = ?1 AND agent = ?2",
                params![project, name],
            )?;
            tx.execute(
                "DELETE FROM agents WHERE project_key = ?1 AND name = ?2",
                params![project, name],
            )?;
        }

        events::MESSAGE_SENT => {
            tx.execute(
                "INSERT OR REPLACE INTO messages
                    (id, project_key, sender, recipients, subject, body, created_at, read_by)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '[]')",
                params![
                    data_i64(data, "message_id").unwrap_or_default(),
                    project,
                    data_str(data, "sender").unwrap_or(""),
                    data.get("recipients").map(|v| v.to_string()).unwrap_or_else(|| "[]".into()),
                    data_str(data, "subject"),
                    data_str(data, "body").unwrap_or(""),
                    at.to_rfc3339()
                ],
            )?;
        }

        events::MESSAGE_READ => {
            let message_id = data_i64(data, "message_id").unwrap_or_default();
            let agent = data_str(data, "agent").unwrap_or_default();
            let read_by: Option<String> = tx
                .query_row(
                    "SELECT read_by FROM messages WHERE id = ?1 AND project_key = ?2",
                    params![message_id, project],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(read_by) = read_by {
                let mut readers: Vec<String> =
                    serde_json::from_str(&read_by).unwrap_or_default();
                if !readers.iter().any(|r| r == agent) {
                    readers.push(agent.to_string());
                    tx.execute(
                        "UPDATE messages SET read_by = ?1 WHERE id = ?2 AND project_key = ?3",
                        params![serde_json::to_string(&readers)?, message_id, project],
                    )?;
                }
            }
        }

        events::RESERVATION_ACQUIRED => {
            tx.execute(
                "INSERT OR REPLACE INTO reservations
                    (id, project_key, agent, file_glob, acquired_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    data_i64(data, "reservation_id").unwrap_or_default(),
                    project,
                    data_str(data, "agent").unwrap_or(""),
                    data_str(data, "file_glob").unwrap_or(""),
                    at.to_rfc3339(),
                    data_str(data, "expires_at").unwrap_or_default()
                ],
            )?;
        }

        events::RESERVATION_RELEASED => {
            tx.execute(
                "DELETE FROM reservations WHERE id = ?1 AND project_key = ?2",
                params![data_i64(data, "reservation_id").unwrap_or_default(), project],
            )?;
        }

        events::DECISION_RECORDED => {
            if let Some(trace) = data.get("trace") {
                tx.execute(
                    "INSERT OR REPLACE INTO decision_traces
                        (id, decision_type, epic_id, bead_id, agent_name, project_key,
                         decision, rationale, inputs_gathered, policy_evaluated,
                         alternatives, precedent_cited, outcome_event_id, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    params![
                        data_str(trace, "id").unwrap_or_default(),
                        data_str(trace, "decision_type").unwrap_or_default(),
                        data_str(trace, "epic_id"),
                        data_str(trace, "bead_id"),
                        data_str(trace, "agent_name").unwrap_or(""),
                        project,
                        trace.get("decision").map(|v| v.to_string()).unwrap_or_else(|| "{}".into()),
                        data_str(trace, "rationale"),
                        trace.get("inputs_gathered").filter(|v| !v.is_null()).map(|v| v.to_string()),
                        trace.get("policy_evaluated").filter(|v| !v.is_null()).map(|v| v.to_string()),
                        trace.get("alternatives").filter(|v| !v.is_null()).map(|v| v.to_string()),
                        trace.get("precedent_cited").filter(|v| !v.is_null()).map(|v| v.to_string()),
                        data_i64(trace, "outcome_event_id"),
                        data_str(trace, "timestamp").unwrap_or(&at.to_rfc3339())
                    ],
                )?;
            }
        }

        events::SYNC_IMPORTED => {
            if let Some(records) = data.get("records") {
                let touched = crate::sync::apply_import_records(tx, project, records)?;
                for bead_id in &touched {
                    graph::invalidate_blocked_cache_conn(tx, project, bead_id)?;
                }
            }
        }

        // Markers consumed by readers of the log; no projection impact.
        events::BEAD_EPIC_CLOSURE_ELIGIBLE | events::BEAD_COMPACTED => {}

        other => {
            tracing::debug!(event_type = other, "ignoring unknown event type");
        }
    }
    Ok(())
}

/// Truncate every projection for one project. Used by `replay(clear_views)`.
pub(crate) fn clear_project_views(tx: &Transaction<'_>, project_key: &str) -> Result<()> {
    for table in ["bead_labels", "bead_comments", "bead_dependencies", "blocked_beads_cache", "dirty_beads"] {
        tx.execute(
            &format!(
                "DELETE FROM {table} WHERE bead_id IN
                    (SELECT id FROM beads WHERE project_key = ?1)"
            ),
            params![project_key],
        )?;
    }
    for table in ["beads", "agents", "messages", "reservations", "decision_traces"] {
        tx.execute(
            &format!("DELETE FROM {table} WHERE project_key = ?1"),
            params![project_key],
        )?;
    }
    Ok(())
}
