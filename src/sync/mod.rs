//! JSONL sync: byte-stable export of projections, tolerant import with
//! tombstone semantics, a deterministic 3-way merge driver, and the
//! debounced flush manager that keeps `.hive/*.jsonl` current.
//!
//! The canonical field order of the wire records is the declaration order
//! of [`BeadRecord`] and [`MemoryRecord`]; nothing else defines it. Lines
//! are compact JSON, `\n`-terminated, sorted by id, with `None`/empty
//! fields omitted, so identical state always serializes to identical bytes.

pub mod flush;
pub mod merge;

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::Result;
use crate::model::{IssueType, Relationship, Status};
use crate::store::events;
use crate::store::{HiveStore, parse_string_array};

pub const DEFAULT_TOMBSTONE_TTL_MS: i64 = 30 * 24 * 60 * 60 * 1000;
pub const MIN_TOMBSTONE_TTL_MS: i64 = 24 * 60 * 60 * 1000;
pub const CLOCK_SKEW_GRACE_MS: i64 = 5 * 60 * 1000;

pub const ISSUES_FILE: &str = "issues.jsonl";
pub const MEMORIES_FILE: &str = "memories.jsonl";
pub const SYNC_LOCK_FILE: &str = "sync.lock";

/// One bead on the wire. Field order here is the canonical JSONL order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeadRecord {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub issue_type: IssueType,
    pub priority: u8,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<DependencyRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRecord {
    pub depends_on: String,
    pub relationship: Relationship,
}

/// One memory on the wire. Embeddings are never exported; they are
/// regenerated on import when an embedder is reachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub information: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ExportOptions {
    /// Soft-deleted beads are exported as tombstones by default; set to
    /// skip them entirely.
    pub skip_deleted: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ImportOptions {
    pub skip_existing: bool,
    /// Override for tests; `DEFAULT_TOMBSTONE_TTL_MS` when unset.
    pub tombstone_ttl_ms: Option<i64>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ImportSummary {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub tombstones_applied: usize,
    pub errors: Vec<ImportError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportError {
    pub line: usize,
    pub message: String,
}

/// True while a tombstone must still win merges: inside TTL plus the
/// clock-skew grace window.
pub fn tombstone_is_live(deleted_at: DateTime<Utc>, ttl_ms: i64, now: DateTime<Utc>) -> bool {
    let ttl = ttl_ms.max(MIN_TOMBSTONE_TTL_MS);
    now < deleted_at + Duration::milliseconds(ttl + CLOCK_SKEW_GRACE_MS)
}

/// Serialize every bead of the project, one compact object per line,
/// ordered by id. Output is byte-reproducible for identical state.
pub fn export_beads(store: &HiveStore, project_key: &str, opts: ExportOptions) -> Result<String> {
    let mut stmt = store.database().conn().prepare(
        "SELECT id, title, description, issue_type, priority, status, parent_id, assignee,
                created_at, updated_at, closed_at, deleted_at, content_hash
         FROM beads WHERE project_key = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![project_key], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, i64>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, Option<String>>(7)?,
            row.get::<_, String>(8)?,
            row.get::<_, String>(9)?,
            row.get::<_, Option<String>>(10)?,
            row.get::<_, Option<String>>(11)?,
            row.get::<_, String>(12)?,
        ))
    })?;

    let mut out = String::new();
    for row in rows {
        let (
            id,
            title,
            description,
            issue_type,
            priority,
            status,
            parent_id,
            assignee,
            created_at,
            updated_at,
            closed_at,
            deleted_at,
            content_hash,
        ) = row?;

        let deleted_at = deleted_at.map(|s| super::store::parse_dt(&s));
        if opts.skip_deleted && deleted_at.is_some() {
            continue;
        }
        // A soft-deleted bead travels as a tombstone regardless of the
        // status column, so replicas converge on the deletion.
        let status = if deleted_at.is_some() {
            Status::Tombstone
        } else {
            status.parse().unwrap_or(Status::Open)
        };

        let record = BeadRecord {
            id: id.clone(),
            title,
            description,
            issue_type: issue_type.parse().unwrap_or(IssueType::Task),
            priority: priority as u8,
            status,
            parent_id,
            assignee,
            created_at: super::store::parse_dt(&created_at),
            updated_at: super::store::parse_dt(&updated_at),
            closed_at: closed_at.map(|s| super::store::parse_dt(&s)),
            deleted_at,
            content_hash,
            labels: store.get_labels(&id)?,
            dependencies: export_dependencies(store, &id)?,
        };
        out.push_str(&serde_json::to_string(&record)?);
        out.push('\n');
    }
    Ok(out)
}

fn export_dependencies(store: &HiveStore, bead_id: &str) -> Result<Vec<DependencyRecord>> {
    let mut deps: Vec<DependencyRecord> = store
        .get_dependencies(bead_id)?
        .into_iter()
        .map(|d| DependencyRecord {
            depends_on: d.depends_on_id,
            relationship: d.relationship,
        })
        .collect();
    deps.sort_by(|a, b| {
        (&a.depends_on, a.relationship.to_string()).cmp(&(&b.depends_on, b.relationship.to_string()))
    });
    Ok(deps)
}

/// Serialize every memory of the store, ordered by id, embeddings omitted.
pub fn export_memories(store: &HiveStore) -> Result<String> {
    let mut stmt = store.database().conn().prepare(
        "SELECT id, content, metadata, collection, tags, confidence, created_at
         FROM memories ORDER BY id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Option<String>>(4)?,
            row.get::<_, f64>(5)?,
            row.get::<_, String>(6)?,
        ))
    })?;
    let mut out = String::new();
    for row in rows {
        let (id, content, metadata, collection, tags, confidence, created_at) = row?;
        let record = MemoryRecord {
            id,
            information: content,
            metadata: metadata.and_then(|s| serde_json::from_str(&s).ok()),
            collection: Some(collection),
            tags: parse_string_array(tags),
            confidence: Some(confidence),
            created_at: super::store::parse_dt(&created_at),
        };
        out.push_str(&serde_json::to_string(&record)?);
        out.push('\n');
    }
    Ok(out)
}

/// Import beads from JSONL. Malformed lines are collected into the
/// summary and never abort the batch. The applied records travel inside
/// a single `sync_imported` event, and the projection layer materializes
/// them, so a later `replay(clear_views)` reconstructs imported state
/// exactly like evented state.
pub fn import_beads(
    store: &HiveStore,
    project_key: &str,
    jsonl: &str,
    opts: ImportOptions,
) -> Result<ImportSummary> {
    let ttl_ms = opts.tombstone_ttl_ms.unwrap_or(DEFAULT_TOMBSTONE_TTL_MS);
    let now = Utc::now();
    let mut summary = ImportSummary::default();
    let mut applied: Vec<BeadRecord> = Vec::new();

    let tx = store.database().conn().unchecked_transaction()?;
    for (idx, line) in jsonl.lines().enumerate() {
        let line_no = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        let record: BeadRecord = match serde_json::from_str(line) {
            Ok(record) => record,
            Err(err) => {
                summary.errors.push(ImportError {
                    line: line_no,
                    message: err.to_string(),
                });
                continue;
            }
        };

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM beads WHERE id = ?1)",
            params![record.id],
            |row| row.get(0),
        )?;

        if record.status == Status::Tombstone {
            let Some(deleted_at) = record.deleted_at else {
                summary.errors.push(ImportError {
                    line: line_no,
                    message: format!("tombstone '{}' has no deleted_at", record.id),
                });
                continue;
            };
            if !tombstone_is_live(deleted_at, ttl_ms, now) {
                summary.skipped += 1;
                continue;
            }
            applied.push(record);
            summary.tombstones_applied += 1;
            continue;
        }

        if exists && opts.skip_existing {
            summary.skipped += 1;
            continue;
        }
        applied.push(record);
        if exists {
            summary.updated += 1;
        } else {
            summary.created += 1;
        }
    }

    events::append_in_tx(
        &tx,
        events::SYNC_IMPORTED,
        project_key,
        json!({
            "created": summary.created,
            "updated": summary.updated,
            "skipped": summary.skipped,
            "tombstones_applied": summary.tombstones_applied,
            "errors": summary.errors.len(),
            "records": applied,
        }),
    )?;
    tx.commit()?;
    tracing::info!(
        project_key,
        created = summary.created,
        updated = summary.updated,
        skipped = summary.skipped,
        tombstones = summary.tombstones_applied,
        errors = summary.errors.len(),
        "import complete"
    );
    Ok(summary)
}

/// Materialize the `records` array of a `sync_imported` event. Called
/// from the projection switch; returns the touched ids so the caller can
/// rebuild their blocked caches.
pub(crate) fn apply_import_records(
    conn: &rusqlite::Connection,
    project_key: &str,
    records: &serde_json::Value,
) -> Result<Vec<String>> {
    let mut touched = Vec::new();
    let Some(records) = records.as_array() else {
        return Ok(touched);
    };
    for value in records {
        let Ok(record) = serde_json::from_value::<BeadRecord>(value.clone()) else {
            tracing::warn!("sync_imported carried an unreadable record; skipping");
            continue;
        };
        upsert_record(conn, project_key, &record)?;
        touched.push(record.id);
    }
    Ok(touched)
}

fn upsert_record(
    tx: &rusqlite::Connection,
    project_key: &str,
    record: &BeadRecord,
) -> Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO beads
            (id, project_key, title, description, issue_type, priority, status, parent_id,
             assignee, created_at, updated_at, closed_at, deleted_at, content_hash)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            record.id,
            project_key,
            record.title,
            record.description,
            record.issue_type.to_string(),
            record.priority as i64,
            record.status.to_string(),
            record.parent_id,
            record.assignee,
            record.created_at.to_rfc3339(),
            record.updated_at.to_rfc3339(),
            record.closed_at.map(|t| t.to_rfc3339()),
            record.deleted_at.map(|t| t.to_rfc3339()),
            record.content_hash,
        ],
    )?;
    tx.execute(
        "DELETE FROM bead_labels WHERE bead_id = ?1",
        params![record.id],
    )?;
    for label in &record.labels {
        tx.execute(
            "INSERT OR IGNORE INTO bead_labels (bead_id, label) VALUES (?1, ?2)",
            params![record.id, label],
        )?;
    }
    tx.execute(
        "DELETE FROM bead_dependencies WHERE bead_id = ?1",
        params![record.id],
    )?;
    for dep in &record.dependencies {
        tx.execute(
            "INSERT OR IGNORE INTO bead_dependencies
                (bead_id, depends_on_id, relationship, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.id,
                dep.depends_on,
                dep.relationship.to_string(),
                record.updated_at.to_rfc3339()
            ],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::beads::{BeadFilter, NewBead};

    fn seeded_store() -> HiveStore {
        let store = HiveStore::open_memory().unwrap();
        store
            .create_bead(
                "/repo",
                NewBead {
                    id: Some("bd-a".into()),
                    title: "first".into(),
                    priority: Some(1),
                    labels: vec!["p0".into()],
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .create_bead(
                "/repo",
                NewBead {
                    id: Some("bd-b".into()),
                    title: "second".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .create_bead(
                "/repo",
                NewBead {
                    id: Some("bd-c".into()),
                    title: "doomed".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .add_dependency("/repo", "bd-b", "bd-a", Relationship::Blocks)
            .unwrap();
        store.delete_bead("/repo", "bd-c").unwrap();
        store
    }

    #[test]
    fn export_is_byte_stable() {
        let store = seeded_store();
        let first = export_beads(&store, "/repo", ExportOptions::default()).unwrap();
        let second = export_beads(&store, "/repo", ExportOptions::default()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.lines().count(), 3);
        // Sorted by id, newline terminated, no embeddings anywhere.
        assert!(first.starts_with("{\"id\":\"bd-a\""));
        assert!(first.ends_with('\n'));
    }

    #[test]
    fn deleted_beads_export_as_tombstones() {
        let store = seeded_store();
        let out = export_beads(&store, "/repo", ExportOptions::default()).unwrap();
        let tombstone_line = out.lines().find(|l| l.contains("bd-c")).unwrap();
        let record: BeadRecord = serde_json::from_str(tombstone_line).unwrap();
        assert_eq!(record.status, Status::Tombstone);
        assert!(record.deleted_at.is_some());
    }

    #[test]
    fn round_trip_reproduces_projection_state() {
        let source = seeded_store();
        let exported = export_beads(&source, "/repo", ExportOptions::default()).unwrap();

        let target = HiveStore::open_memory().unwrap();
        let summary =
            import_beads(&target, "/repo", &exported, ImportOptions::default()).unwrap();
        assert_eq!(summary.created, 2);
        assert_eq!(summary.tombstones_applied, 1);
        assert!(summary.errors.is_empty());

        let re_exported = export_beads(&target, "/repo", ExportOptions::default()).unwrap();
        assert_eq!(exported, re_exported);

        // Blocked cache was rebuilt from the imported edges.
        assert_eq!(target.get_blockers("bd-b").unwrap(), vec!["bd-a"]);
        let filter = BeadFilter {
            include_deleted: true,
            ..Default::default()
        };
        assert_eq!(target.query_beads("/repo", &filter).unwrap().len(), 3);
    }

    #[test]
    fn malformed_lines_are_collected_not_fatal() {
        let store = HiveStore::open_memory().unwrap();
        let jsonl = "\n{not json}\n{\"id\":\"bd-x\",\"title\":\"ok\",\"issue_type\":\"task\",\
                     \"priority\":2,\"status\":\"open\",\
                     \"created_at\":\"2026-01-01T00:00:00Z\",\
                     \"updated_at\":\"2026-01-01T00:00:00Z\",\"content_hash\":\"h\"}\n";
        let summary = import_beads(&store, "/repo", jsonl, ImportOptions::default()).unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].line, 2);
        assert!(store.get_bead("bd-x").unwrap().is_some());
    }

    #[test]
    fn skip_existing_preserves_local_rows() {
        let store = seeded_store();
        let mut exported = export_beads(&store, "/repo", ExportOptions::default()).unwrap();
        exported = exported.replace("\"title\":\"first\"", "\"title\":\"overwritten\"");
        let summary = import_beads(
            &store,
            "/repo",
            &exported,
            ImportOptions {
                skip_existing: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(summary.created, 0);
        assert!(summary.skipped >= 2);
        assert_eq!(store.get_bead("bd-a").unwrap().unwrap().title, "first");
    }

    #[test]
    fn expired_tombstones_are_skipped() {
        let store = HiveStore::open_memory().unwrap();
        let old = Utc::now() - Duration::days(90);
        let line = serde_json::to_string(&BeadRecord {
            id: "bd-old".into(),
            title: "long gone".into(),
            description: None,
            issue_type: IssueType::Task,
            priority: 2,
            status: Status::Tombstone,
            parent_id: None,
            assignee: None,
            created_at: old,
            updated_at: old,
            closed_at: None,
            deleted_at: Some(old),
            content_hash: "h".into(),
            labels: vec![],
            dependencies: vec![],
        })
        .unwrap();
        let summary = import_beads(&store, "/repo", &line, ImportOptions::default()).unwrap();
        assert_eq!(summary.tombstones_applied, 0);
        assert_eq!(summary.skipped, 1);
        assert!(store.get_bead("bd-old").unwrap().is_none());
    }

    #[test]
    fn tombstone_liveness_window() {
        let now = Utc::now();
        assert!(tombstone_is_live(now - Duration::days(10), DEFAULT_TOMBSTONE_TTL_MS, now));
        assert!(!tombstone_is_live(now - Duration::days(31), DEFAULT_TOMBSTONE_TTL_MS, now));
        // Slight clock skew into the future is tolerated.
        assert!(tombstone_is_live(now + Duration::minutes(2), DEFAULT_TOMBSTONE_TTL_MS, now));
        // TTL below the floor is clamped up.
        assert!(tombstone_is_live(now - Duration::hours(12), 1, now));
    }

    #[test]
    fn memories_export_round_trips_without_embeddings() {
        let store = HiveStore::open_memory().unwrap();
        store
            .database()
            .conn()
            .execute(
                "INSERT INTO memories (id, content, collection, created_at, confidence, tags)
                 VALUES ('m-1', 'remember this', 'default', '2026-01-01T00:00:00+00:00', 0.9, '[\"x\"]')",
                [],
            )
            .unwrap();
        let out = export_memories(&store).unwrap();
        assert_eq!(out.lines().count(), 1);
        let record: MemoryRecord = serde_json::from_str(out.lines().next().unwrap()).unwrap();
        assert_eq!(record.information, "remember this");
        assert!(!out.contains("embedding"));
    }
}
