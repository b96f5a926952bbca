//! High-level bead operations: each one validates, appends an event, and
//! lets the projection layer materialize the change, all in one
//! transaction.

use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};
use serde_json::json;

use super::events::append_in_tx;
use super::{HiveStore, events, graph, parse_dt, parse_dt_opt, parse_string_array};
use crate::error::{HiveError, Result};
use crate::model::{
    Bead, BeadDependency, Comment, IssueType, Relationship, Status, content_hash_of, new_bead_id,
};

#[derive(Debug, Default, Clone)]
pub struct NewBead {
    /// Caller-provided stable id; generated (`bd-…`) when absent.
    pub id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub issue_type: IssueType,
    /// 0 is most urgent, 3 least. Defaults to 2.
    pub priority: Option<u8>,
    pub parent_id: Option<String>,
    pub assignee: Option<String>,
    pub labels: Vec<String>,
}

/// Partial update; `None` leaves the field alone. Use the `clear_*` flags
/// to null out nullable fields.
#[derive(Debug, Default, Clone)]
pub struct BeadPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub issue_type: Option<IssueType>,
    pub priority: Option<u8>,
    pub parent_id: Option<String>,
    pub assignee: Option<String>,
    pub clear_assignee: bool,
    pub clear_parent: bool,
}

#[derive(Debug, Default, Clone)]
pub struct BeadFilter {
    pub status: Option<Status>,
    pub issue_type: Option<IssueType>,
    pub priority: Option<u8>,
    pub parent_id: Option<String>,
    pub assignee: Option<String>,
    pub label: Option<String>,
    pub include_deleted: bool,
    pub limit: Option<usize>,
}

fn bead_from_row(row: &Row<'_>) -> rusqlite::Result<Bead> {
    Ok(Bead {
        id: row.get(0)?,
        project_key: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        issue_type: row
            .get::<_, String>(4)?
            .parse()
            .unwrap_or(IssueType::Task),
        priority: row.get::<_, i64>(5)? as u8,
        status: row.get::<_, String>(6)?.parse().unwrap_or(Status::Open),
        parent_id: row.get(7)?,
        assignee: row.get(8)?,
        created_at: parse_dt(&row.get::<_, String>(9)?),
        updated_at: parse_dt(&row.get::<_, String>(10)?),
        closed_at: parse_dt_opt(row.get(11)?),
        close_reason: row.get(12)?,
        deleted_at: parse_dt_opt(row.get(13)?),
        content_hash: row.get(14)?,
        files_touched: parse_string_array(row.get(15)?),
    })
}

const BEAD_COLUMNS: &str = "id, project_key, title, description, issue_type, priority, status, \
     parent_id, assignee, created_at, updated_at, closed_at, close_reason, deleted_at, \
     content_hash, files_touched";

impl HiveStore {
    pub fn create_bead(&self, project_key: &str, new: NewBead) -> Result<Bead> {
        let id = new.id.unwrap_or_else(new_bead_id);
        let priority = new.priority.unwrap_or(2).min(3);
        let content_hash = content_hash_of(
            &new.title,
            new.description.as_deref(),
            new.issue_type,
            priority,
            Status::Open,
            new.parent_id.as_deref(),
            new.assignee.as_deref(),
        );
        let mut labels = new.labels;
        labels.sort();
        labels.dedup();

        let tx = self.database().conn().unchecked_transaction()?;
        if bead_exists(&tx, &id)? {
            return Err(HiveError::Constraint(format!("bead '{id}' already exists")));
        }
        append_in_tx(
            &tx,
            events::BEAD_CREATED,
            project_key,
            json!({
                "bead_id": id,
                "title": new.title,
                "description": new.description,
                "issue_type": new.issue_type.to_string(),
                "priority": priority,
                "parent_id": new.parent_id,
                "assignee": new.assignee,
                "labels": labels,
                "created_at": Utc::now().to_rfc3339(),
                "content_hash": content_hash,
            }),
        )?;
        tx.commit()?;
        self.get_bead(&id)?
            .ok_or_else(|| HiveError::NotFound { kind: "bead", id })
    }

    pub fn update_bead(&self, project_key: &str, bead_id: &str, patch: BeadPatch) -> Result<Bead> {
        let current = self.require_bead(bead_id)?;
        let title = patch.title.clone().unwrap_or_else(|| current.title.clone());
        let description = if patch.description.is_some() {
            patch.description.clone()
        } else {
            current.description.clone()
        };
        let issue_type = patch.issue_type.unwrap_or(current.issue_type);
        let priority = patch.priority.unwrap_or(current.priority).min(3);
        let parent_id = if patch.clear_parent {
            None
        } else {
            patch.parent_id.clone().or_else(|| current.parent_id.clone())
        };
        let assignee = if patch.clear_assignee {
            None
        } else {
            patch.assignee.clone().or_else(|| current.assignee.clone())
        };
        let content_hash = content_hash_of(
            &title,
            description.as_deref(),
            issue_type,
            priority,
            current.status,
            parent_id.as_deref(),
            assignee.as_deref(),
        );

        let mut data = serde_json::Map::new();
        data.insert("bead_id".into(), json!(bead_id));
        data.insert("content_hash".into(), json!(content_hash));
        if let Some(title) = &patch.title {
            data.insert("title".into(), json!(title));
        }
        if let Some(description) = &patch.description {
            data.insert("description".into(), json!(description));
        }
        if let Some(issue_type) = patch.issue_type {
            data.insert("issue_type".into(), json!(issue_type.to_string()));
        }
        if let Some(priority) = patch.priority {
            data.insert("priority".into(), json!(priority.min(3)));
        }
        if patch.clear_parent {
            data.insert("parent_id".into(), serde_json::Value::Null);
        } else if let Some(parent_id) = &patch.parent_id {
            data.insert("parent_id".into(), json!(parent_id));
        }
        if patch.clear_assignee {
            data.insert("assignee".into(), serde_json::Value::Null);
        } else if let Some(assignee) = &patch.assignee {
            data.insert("assignee".into(), json!(assignee));
        }

        self.append_event(events::BEAD_UPDATED, project_key, data.into())?;
        self.require_bead(bead_id)
    }

    pub fn change_status(&self, project_key: &str, bead_id: &str, to: Status) -> Result<Bead> {
        let current = self.require_bead(bead_id)?;
        if current.status == to {
            return Ok(current);
        }
        if current.status == Status::Tombstone {
            return Err(HiveError::InvalidTransition(
                current.status.to_string(),
                to.to_string(),
            ));
        }
        let content_hash = content_hash_of(
            &current.title,
            current.description.as_deref(),
            current.issue_type,
            current.priority,
            to,
            current.parent_id.as_deref(),
            current.assignee.as_deref(),
        );
        self.append_event(
            events::BEAD_STATUS_CHANGED,
            project_key,
            json!({
                "bead_id": bead_id,
                "from": current.status.to_string(),
                "to": to.to_string(),
                "content_hash": content_hash,
            }),
        )?;
        self.require_bead(bead_id)
    }

    /// Close with a reason and the files the work touched. If this closes
    /// the last open child of an epic, a `bead_epic_closure_eligible`
    /// marker is appended for the coordinator to consume.
    pub fn close_bead(
        &self,
        project_key: &str,
        bead_id: &str,
        reason: Option<&str>,
        files_touched: &[String],
    ) -> Result<Bead> {
        let current = self.require_bead(bead_id)?;
        if current.status == Status::Tombstone {
            return Err(HiveError::InvalidTransition(
                current.status.to_string(),
                "closed".into(),
            ));
        }
        let content_hash = content_hash_of(
            &current.title,
            current.description.as_deref(),
            current.issue_type,
            current.priority,
            Status::Closed,
            current.parent_id.as_deref(),
            current.assignee.as_deref(),
        );
        let duration_ms = (Utc::now() - current.created_at).num_milliseconds();

        let tx = self.database().conn().unchecked_transaction()?;
        append_in_tx(
            &tx,
            events::BEAD_CLOSED,
            project_key,
            json!({
                "bead_id": bead_id,
                "reason": reason,
                "files_touched": files_touched,
                "duration_ms": duration_ms,
                "content_hash": content_hash,
            }),
        )?;
        // Epic closure check runs against the just-updated projection.
        if let Some(parent_id) = &current.parent_id {
            let parent_is_epic: Option<String> = tx
                .query_row(
                    "SELECT issue_type FROM beads WHERE id = ?1 AND status != 'closed'",
                    params![parent_id],
                    |row| row.get(0),
                )
                .optional()?;
            if parent_is_epic.as_deref() == Some("epic") {
                let open_children: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM beads
                     WHERE parent_id = ?1 AND status NOT IN ('closed', 'tombstone')
                       AND deleted_at IS NULL",
                    params![parent_id],
                    |row| row.get(0),
                )?;
                if open_children == 0 {
                    append_in_tx(
                        &tx,
                        events::BEAD_EPIC_CLOSURE_ELIGIBLE,
                        project_key,
                        json!({ "bead_id": parent_id, "closed_child": bead_id }),
                    )?;
                }
            }
        }
        tx.commit()?;
        self.require_bead(bead_id)
    }

    pub fn reopen_bead(&self, project_key: &str, bead_id: &str) -> Result<Bead> {
        let current = self.require_bead(bead_id)?;
        if current.status != Status::Closed {
            return Err(HiveError::InvalidTransition(
                current.status.to_string(),
                "open".into(),
            ));
        }
        let content_hash = content_hash_of(
            &current.title,
            current.description.as_deref(),
            current.issue_type,
            current.priority,
            Status::Open,
            current.parent_id.as_deref(),
            current.assignee.as_deref(),
        );
        self.append_event(
            events::BEAD_REOPENED,
            project_key,
            json!({ "bead_id": bead_id, "content_hash": content_hash }),
        )?;
        self.require_bead(bead_id)
    }

    /// Soft delete: sets `deleted_at`; the row becomes a tombstone after
    /// the sync TTL and is eventually garbage collected.
    pub fn delete_bead(&self, project_key: &str, bead_id: &str) -> Result<()> {
        self.require_bead(bead_id)?;
        self.append_event(
            events::BEAD_DELETED,
            project_key,
            json!({ "bead_id": bead_id }),
        )?;
        Ok(())
    }

    /// Remove the historical events of a deleted bead, leaving a single
    /// `bead_compacted` marker. The one sanctioned hole in "events are
    /// never deleted".
    pub fn compact_bead(&self, project_key: &str, bead_id: &str) -> Result<usize> {
        let current = self.require_bead(bead_id)?;
        if current.deleted_at.is_none() {
            return Err(HiveError::InvalidTransition(
                current.status.to_string(),
                "compacted".into(),
            ));
        }
        let tx = self.database().conn().unchecked_transaction()?;
        let removed = tx.execute(
            "DELETE FROM events
             WHERE project_key = ?1 AND json_extract(data, '$.bead_id') = ?2",
            params![project_key, bead_id],
        )?;
        append_in_tx(
            &tx,
            events::BEAD_COMPACTED,
            project_key,
            json!({ "bead_id": bead_id, "events_removed": removed }),
        )?;
        tx.commit()?;
        Ok(removed)
    }

    /// Add a dependency edge. `blocks` edges are cycle-checked first; a
    /// rejected edge leaves no trace in the log.
    pub fn add_dependency(
        &self,
        project_key: &str,
        bead_id: &str,
        depends_on_id: &str,
        relationship: Relationship,
    ) -> Result<()> {
        self.require_bead(bead_id)?;
        self.require_bead(depends_on_id)?;
        let tx = self.database().conn().unchecked_transaction()?;
        if relationship == Relationship::Blocks
            && graph::would_create_cycle_conn(&tx, bead_id, depends_on_id)?
        {
            return Err(HiveError::Cycle(
                bead_id.to_string(),
                depends_on_id.to_string(),
            ));
        }
        append_in_tx(
            &tx,
            events::BEAD_DEPENDENCY_ADDED,
            project_key,
            json!({
                "bead_id": bead_id,
                "depends_on_id": depends_on_id,
                "relationship": relationship.to_string(),
            }),
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn remove_dependency(
        &self,
        project_key: &str,
        bead_id: &str,
        depends_on_id: &str,
        relationship: Relationship,
    ) -> Result<()> {
        self.append_event(
            events::BEAD_DEPENDENCY_REMOVED,
            project_key,
            json!({
                "bead_id": bead_id,
                "depends_on_id": depends_on_id,
                "relationship": relationship.to_string(),
            }),
        )?;
        Ok(())
    }

    pub fn add_label(&self, project_key: &str, bead_id: &str, label: &str) -> Result<()> {
        self.require_bead(bead_id)?;
        self.append_event(
            events::BEAD_LABEL_ADDED,
            project_key,
            json!({ "bead_id": bead_id, "label": label }),
        )?;
        Ok(())
    }

    pub fn remove_label(&self, project_key: &str, bead_id: &str, label: &str) -> Result<()> {
        self.append_event(
            events::BEAD_LABEL_REMOVED,
            project_key,
            json!({ "bead_id": bead_id, "label": label }),
        )?;
        Ok(())
    }

    pub fn add_comment(
        &self,
        project_key: &str,
        bead_id: &str,
        author: &str,
        body: &str,
        parent_comment_id: Option<i64>,
    ) -> Result<i64> {
        self.require_bead(bead_id)?;
        let tx = self.database().conn().unchecked_transaction()?;
        // Allocate the id here so the event carries it and replay is exact.
        let comment_id: i64 = tx.query_row(
            "SELECT COALESCE(MAX(id), 0) + 1 FROM bead_comments",
            [],
            |row| row.get(0),
        )?;
        append_in_tx(
            &tx,
            events::BEAD_COMMENT_ADDED,
            project_key,
            json!({
                "bead_id": bead_id,
                "comment_id": comment_id,
                "author": author,
                "body": body,
                "parent_comment_id": parent_comment_id,
                "created_at": Utc::now().to_rfc3339(),
            }),
        )?;
        tx.commit()?;
        Ok(comment_id)
    }

    pub fn update_comment(
        &self,
        project_key: &str,
        bead_id: &str,
        comment_id: i64,
        body: &str,
    ) -> Result<()> {
        self.append_event(
            events::BEAD_COMMENT_UPDATED,
            project_key,
            json!({ "bead_id": bead_id, "comment_id": comment_id, "body": body }),
        )?;
        Ok(())
    }

    pub fn delete_comment(&self, project_key: &str, bead_id: &str, comment_id: i64) -> Result<()> {
        self.append_event(
            events::BEAD_COMMENT_DELETED,
            project_key,
            json!({ "bead_id": bead_id, "comment_id": comment_id }),
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Read surface: projections only, never the event log.
    // -----------------------------------------------------------------------

    pub fn get_bead(&self, bead_id: &str) -> Result<Option<Bead>> {
        self.database()
            .conn()
            .query_row(
                &format!("SELECT {BEAD_COLUMNS} FROM beads WHERE id = ?1"),
                params![bead_id],
                bead_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    pub(crate) fn require_bead(&self, bead_id: &str) -> Result<Bead> {
        self.get_bead(bead_id)?.ok_or_else(|| HiveError::NotFound {
            kind: "bead",
            id: bead_id.to_string(),
        })
    }

    pub fn query_beads(&self, project_key: &str, filter: &BeadFilter) -> Result<Vec<Bead>> {
        let mut sql = format!("SELECT {BEAD_COLUMNS} FROM beads WHERE project_key = ?1");
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = vec![Box::new(project_key.to_string())];

        if let Some(status) = filter.status {
            sql.push_str(&format!(" AND status = ?{}", args.len() + 1));
            args.push(Box::new(status.to_string()));
        }
        if let Some(issue_type) = filter.issue_type {
            sql.push_str(&format!(" AND issue_type = ?{}", args.len() + 1));
            args.push(Box::new(issue_type.to_string()));
        }
        if let Some(priority) = filter.priority {
            sql.push_str(&format!(" AND priority = ?{}", args.len() + 1));
            args.push(Box::new(priority as i64));
        }
        if let Some(parent_id) = &filter.parent_id {
            sql.push_str(&format!(" AND parent_id = ?{}", args.len() + 1));
            args.push(Box::new(parent_id.clone()));
        }
        if let Some(assignee) = &filter.assignee {
            sql.push_str(&format!(" AND assignee = ?{}", args.len() + 1));
            args.push(Box::new(assignee.clone()));
        }
        if let Some(label) = &filter.label {
            sql.push_str(&format!(
                " AND id IN (SELECT bead_id FROM bead_labels WHERE label = ?{})",
                args.len() + 1
            ));
            args.push(Box::new(label.clone()));
        }
        if !filter.include_deleted {
            sql.push_str(" AND deleted_at IS NULL");
        }
        sql.push_str(" ORDER BY priority, created_at, id");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = self.database().conn().prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            args.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(params_ref.as_slice(), bead_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn get_dependencies(&self, bead_id: &str) -> Result<Vec<BeadDependency>> {
        let mut stmt = self.database().conn().prepare(
            "SELECT bead_id, depends_on_id, relationship FROM bead_dependencies
             WHERE bead_id = ?1 ORDER BY depends_on_id, relationship",
        )?;
        let rows = stmt.query_map(params![bead_id], dep_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn get_dependents(&self, bead_id: &str) -> Result<Vec<BeadDependency>> {
        let mut stmt = self.database().conn().prepare(
            "SELECT bead_id, depends_on_id, relationship FROM bead_dependencies
             WHERE depends_on_id = ?1 ORDER BY bead_id, relationship",
        )?;
        let rows = stmt.query_map(params![bead_id], dep_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn get_labels(&self, bead_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .database()
            .conn()
            .prepare("SELECT label FROM bead_labels WHERE bead_id = ?1 ORDER BY label")?;
        let rows = stmt.query_map(params![bead_id], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn get_comments(&self, bead_id: &str) -> Result<Vec<Comment>> {
        let mut stmt = self.database().conn().prepare(
            "SELECT id, bead_id, author, body, parent_comment_id, created_at, metadata
             FROM bead_comments WHERE bead_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![bead_id], |row| {
            let metadata: Option<String> = row.get(6)?;
            Ok(Comment {
                id: row.get(0)?,
                bead_id: row.get(1)?,
                author: row.get(2)?,
                body: row.get(3)?,
                parent_comment_id: row.get(4)?,
                created_at: parse_dt(&row.get::<_, String>(5)?),
                metadata: metadata.and_then(|s| serde_json::from_str(&s).ok()),
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Ready = open or in_progress, not deleted, no blocked-cache row.
    /// Tie-break: priority ascending, then created_at, then id.
    pub fn get_ready(&self, project_key: &str, limit: usize) -> Result<Vec<Bead>> {
        let mut stmt = self.database().conn().prepare(&format!(
            "SELECT {BEAD_COLUMNS} FROM beads b
             WHERE b.project_key = ?1
               AND b.status IN ('open', 'in_progress')
               AND b.deleted_at IS NULL
               AND NOT EXISTS (SELECT 1 FROM blocked_beads_cache c WHERE c.bead_id = b.id)
             ORDER BY b.priority, b.created_at, b.id
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![project_key, limit as i64], bead_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn get_next_ready(&self, project_key: &str) -> Result<Option<String>> {
        Ok(self.get_ready(project_key, 1)?.into_iter().next().map(|b| b.id))
    }

    /// Beads touched since the last flush, oldest mark first.
    pub fn get_dirty(&self, project_key: &str) -> Result<Vec<String>> {
        let mut stmt = self.database().conn().prepare(
            "SELECT d.bead_id FROM dirty_beads d
             JOIN beads b ON b.id = d.bead_id
             WHERE b.project_key = ?1
             ORDER BY d.marked_at, d.bead_id",
        )?;
        let rows = stmt.query_map(params![project_key], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn clear_dirty(&self, bead_ids: &[String]) -> Result<usize> {
        let mut cleared = 0;
        let conn = self.database().conn();
        let mut stmt = conn.prepare("DELETE FROM dirty_beads WHERE bead_id = ?1")?;
        for id in bead_ids {
            cleared += stmt.execute(params![id])?;
        }
        Ok(cleared)
    }
}

fn bead_exists(conn: &rusqlite::Connection, bead_id: &str) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM beads WHERE id = ?1)",
        params![bead_id],
        |row| row.get(0),
    )?;
    Ok(exists)
}

fn dep_from_row(row: &Row<'_>) -> rusqlite::Result<BeadDependency> {
    Ok(BeadDependency {
        bead_id: row.get(0)?,
        depends_on_id: row.get(1)?,
        relationship: row
            .get::<_, String>(2)?
            .parse()
            .unwrap_or(Relationship::Blocks),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::events::EventFilter;

    fn quick(store: &HiveStore, id: &str, priority: u8) -> Bead {
        store
            .create_bead(
                "/repo",
                NewBead {
                    id: Some(id.into()),
                    title: format!("bead {id}"),
                    priority: Some(priority),
                    ..Default::default()
                },
            )
            .unwrap()
    }

    #[test]
    fn create_appends_event_and_materializes() {
        let store = HiveStore::open_memory().unwrap();
        store
            .create_bead(
                "/repo",
                NewBead {
                    id: Some("bd-1".into()),
                    title: "t".into(),
                    issue_type: IssueType::Task,
                    priority: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();

        let events = store
            .read_events(&EventFilter::for_project("/repo"))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "bead_created");
        assert_eq!(events[0].data["bead_id"], "bd-1");

        let bead = store.get_bead("bd-1").unwrap().unwrap();
        assert_eq!(bead.title, "t");
        assert_eq!(bead.status, Status::Open);
        assert!(!bead.content_hash.is_empty());
    }

    #[test]
    fn duplicate_create_is_a_constraint_error() {
        let store = HiveStore::open_memory().unwrap();
        quick(&store, "bd-1", 2);
        let err = store
            .create_bead(
                "/repo",
                NewBead {
                    id: Some("bd-1".into()),
                    title: "again".into(),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, HiveError::Constraint(_)));
    }

    #[test]
    fn update_patches_only_named_fields() {
        let store = HiveStore::open_memory().unwrap();
        let before = quick(&store, "bd-1", 1);
        let after = store
            .update_bead(
                "/repo",
                "bd-1",
                BeadPatch {
                    description: Some("new description".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(after.title, before.title);
        assert_eq!(after.description.as_deref(), Some("new description"));
        assert_eq!(after.priority, 1);
        assert_ne!(after.content_hash, before.content_hash);
    }

    #[test]
    fn close_sets_closed_at_and_reason() {
        let store = HiveStore::open_memory().unwrap();
        quick(&store, "bd-1", 2);
        let closed = store
            .close_bead("/repo", "bd-1", Some("fixed"), &["src/lib.rs".into()])
            .unwrap();
        assert_eq!(closed.status, Status::Closed);
        assert!(closed.closed_at.is_some());
        assert_eq!(closed.close_reason.as_deref(), Some("fixed"));
        assert_eq!(closed.files_touched, vec!["src/lib.rs"]);
    }

    #[test]
    fn reopen_clears_closure_fields() {
        let store = HiveStore::open_memory().unwrap();
        quick(&store, "bd-1", 2);
        store.close_bead("/repo", "bd-1", Some("done"), &[]).unwrap();
        let reopened = store.reopen_bead("/repo", "bd-1").unwrap();
        assert_eq!(reopened.status, Status::Open);
        assert!(reopened.closed_at.is_none());
        assert!(reopened.close_reason.is_none());
    }

    #[test]
    fn reopen_requires_closed() {
        let store = HiveStore::open_memory().unwrap();
        quick(&store, "bd-1", 2);
        let err = store.reopen_bead("/repo", "bd-1").unwrap_err();
        assert!(matches!(err, HiveError::InvalidTransition(_, _)));
    }

    #[test]
    fn closing_last_child_emits_epic_closure_marker() {
        let store = HiveStore::open_memory().unwrap();
        store
            .create_bead(
                "/repo",
                NewBead {
                    id: Some("bd-epic".into()),
                    title: "the epic".into(),
                    issue_type: IssueType::Epic,
                    ..Default::default()
                },
            )
            .unwrap();
        for child in ["bd-c1", "bd-c2"] {
            store
                .create_bead(
                    "/repo",
                    NewBead {
                        id: Some(child.into()),
                        title: child.into(),
                        parent_id: Some("bd-epic".into()),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        store.close_bead("/repo", "bd-c1", None, &[]).unwrap();
        let markers = store
            .read_events(&EventFilter {
                project_key: Some("/repo".into()),
                types: vec![events::BEAD_EPIC_CLOSURE_ELIGIBLE.into()],
                ..Default::default()
            })
            .unwrap();
        assert!(markers.is_empty());

        store.close_bead("/repo", "bd-c2", None, &[]).unwrap();
        let markers = store
            .read_events(&EventFilter {
                project_key: Some("/repo".into()),
                types: vec![events::BEAD_EPIC_CLOSURE_ELIGIBLE.into()],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].data["bead_id"], "bd-epic");
    }

    #[test]
    fn cycle_rejection_leaves_no_rows() {
        let store = HiveStore::open_memory().unwrap();
        for id in ["bd-1", "bd-2", "bd-3"] {
            quick(&store, id, 2);
        }
        store
            .add_dependency("/repo", "bd-1", "bd-2", Relationship::Blocks)
            .unwrap();
        store
            .add_dependency("/repo", "bd-2", "bd-3", Relationship::Blocks)
            .unwrap();
        let err = store
            .add_dependency("/repo", "bd-3", "bd-1", Relationship::Blocks)
            .unwrap_err();
        assert!(matches!(err, HiveError::Cycle(_, _)));

        let deps = store.get_dependencies("bd-3").unwrap();
        assert!(deps.is_empty());
        let count: i64 = store
            .database()
            .conn()
            .query_row("SELECT COUNT(*) FROM bead_dependencies", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn ready_selection_orders_by_priority_then_age() {
        let store = HiveStore::open_memory().unwrap();
        quick(&store, "bd-a", 1);
        quick(&store, "bd-b", 0);
        quick(&store, "bd-c", 0);
        // bd-b is blocked by an open bead.
        store
            .add_dependency("/repo", "bd-b", "bd-c", Relationship::Blocks)
            .unwrap();
        assert_eq!(store.get_next_ready("/repo").unwrap().as_deref(), Some("bd-c"));

        store.close_bead("/repo", "bd-c", None, &[]).unwrap();
        // Unblocked now, and priority 0 beats bd-a's 1.
        assert_eq!(store.get_next_ready("/repo").unwrap().as_deref(), Some("bd-b"));
    }

    #[test]
    fn deleted_beads_are_never_ready() {
        let store = HiveStore::open_memory().unwrap();
        quick(&store, "bd-a", 0);
        store.delete_bead("/repo", "bd-a").unwrap();
        assert_eq!(store.get_next_ready("/repo").unwrap(), None);
    }

    #[test]
    fn labels_are_a_set() {
        let store = HiveStore::open_memory().unwrap();
        quick(&store, "bd-1", 2);
        store.add_label("/repo", "bd-1", "p0").unwrap();
        store.add_label("/repo", "bd-1", "p0").unwrap();
        store.add_label("/repo", "bd-1", "backend").unwrap();
        assert_eq!(store.get_labels("bd-1").unwrap(), vec!["backend", "p0"]);
        store.remove_label("/repo", "bd-1", "p0").unwrap();
        assert_eq!(store.get_labels("bd-1").unwrap(), vec!["backend"]);
    }

    #[test]
    fn comment_tree_and_subtree_delete() {
        let store = HiveStore::open_memory().unwrap();
        quick(&store, "bd-1", 2);
        let root = store
            .add_comment("/repo", "bd-1", "alice", "root", None)
            .unwrap();
        let child = store
            .add_comment("/repo", "bd-1", "bob", "child", Some(root))
            .unwrap();
        let _other = store
            .add_comment("/repo", "bd-1", "carol", "sibling", None)
            .unwrap();
        assert_eq!(store.get_comments("bd-1").unwrap().len(), 3);

        store.update_comment("/repo", "bd-1", child, "edited").unwrap();
        let comments = store.get_comments("bd-1").unwrap();
        assert_eq!(comments.iter().find(|c| c.id == child).unwrap().body, "edited");

        store.delete_comment("/repo", "bd-1", root).unwrap();
        let remaining = store.get_comments("bd-1").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].body, "sibling");
    }

    #[test]
    fn dirty_tracking_accumulates_and_clears() {
        let store = HiveStore::open_memory().unwrap();
        quick(&store, "bd-1", 2);
        quick(&store, "bd-2", 2);
        let dirty = store.get_dirty("/repo").unwrap();
        assert_eq!(dirty.len(), 2);
        store.clear_dirty(&dirty).unwrap();
        assert!(store.get_dirty("/repo").unwrap().is_empty());

        store.add_label("/repo", "bd-1", "x").unwrap();
        assert_eq!(store.get_dirty("/repo").unwrap(), vec!["bd-1"]);
    }

    #[test]
    fn replay_reproduces_projections() {
        let store = HiveStore::open_memory().unwrap();
        quick(&store, "bd-1", 1);
        quick(&store, "bd-2", 2);
        store
            .add_dependency("/repo", "bd-2", "bd-1", Relationship::Blocks)
            .unwrap();
        store.add_label("/repo", "bd-1", "p0").unwrap();
        store.close_bead("/repo", "bd-1", Some("done"), &[]).unwrap();

        let before = store.query_beads("/repo", &BeadFilter::default()).unwrap();
        let blocked_before = store.get_blocked("/repo").unwrap();

        let replayed = store.replay("/repo", true).unwrap();
        assert!(replayed >= 5);

        let after = store.query_beads("/repo", &BeadFilter::default()).unwrap();
        let blocked_after = store.get_blocked("/repo").unwrap();
        assert_eq!(before, after);
        assert_eq!(blocked_before, blocked_after);
        assert_eq!(store.get_labels("bd-1").unwrap(), vec!["p0"]);
    }

    #[test]
    fn compact_removes_bead_events() {
        let store = HiveStore::open_memory().unwrap();
        quick(&store, "bd-1", 2);
        store.add_label("/repo", "bd-1", "x").unwrap();
        store.delete_bead("/repo", "bd-1").unwrap();
        let removed = store.compact_bead("/repo", "bd-1").unwrap();
        assert_eq!(removed, 3);
        let events = store
            .read_events(&EventFilter {
                project_key: Some("/repo".into()),
                bead_id: Some("bd-1".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, events::BEAD_COMPACTED);
    }
}
