//! Forward-only, versioned schema evolution.
//!
//! Migrations are declarative SQL applied in version order, each inside its
//! own transaction, with a WAL checkpoint after each. Downgrades are
//! refused: a database stamped newer than [`LATEST_VERSION`] fails to open.

use chrono::Utc;
use rusqlite::params;

use super::Database;
use crate::error::{HiveError, Result};

pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub up_sql: &'static str,
}

/// Dimension of the embedding vectors stored in `memory_embeddings`.
/// Must match the embedding model served by the configured embedder.
pub const EMBEDDING_DIM: usize = 1024;

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "event log, bead projections, dependency graph, caches",
        up_sql: "CREATE TABLE events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                type TEXT NOT NULL,
                project_key TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                sequence INTEGER NOT NULL,
                data TEXT NOT NULL DEFAULT '{}',
                UNIQUE (project_key, sequence)
            );
            CREATE INDEX idx_events_project_seq ON events(project_key, sequence);
            CREATE INDEX idx_events_type ON events(type);

            CREATE TABLE beads (
                id TEXT PRIMARY KEY,
                project_key TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                issue_type TEXT NOT NULL DEFAULT 'task',
                priority INTEGER NOT NULL DEFAULT 2,
                status TEXT NOT NULL DEFAULT 'open',
                parent_id TEXT,
                assignee TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                closed_at TEXT,
                close_reason TEXT,
                deleted_at TEXT,
                content_hash TEXT NOT NULL,
                files_touched TEXT
            );
            CREATE INDEX idx_beads_project ON beads(project_key);
            CREATE INDEX idx_beads_status ON beads(status);
            CREATE INDEX idx_beads_parent ON beads(parent_id);

            CREATE TABLE bead_dependencies (
                bead_id TEXT NOT NULL,
                depends_on_id TEXT NOT NULL,
                relationship TEXT NOT NULL DEFAULT 'blocks',
                created_at TEXT NOT NULL,
                PRIMARY KEY (bead_id, depends_on_id, relationship)
            );
            CREATE INDEX idx_deps_depends_on ON bead_dependencies(depends_on_id);

            CREATE TABLE bead_labels (
                bead_id TEXT NOT NULL,
                label TEXT NOT NULL,
                PRIMARY KEY (bead_id, label)
            );

            CREATE TABLE bead_comments (
                id INTEGER PRIMARY KEY,
                bead_id TEXT NOT NULL,
                author TEXT NOT NULL,
                body TEXT NOT NULL,
                parent_comment_id INTEGER,
                created_at TEXT NOT NULL,
                metadata TEXT
            );
            CREATE INDEX idx_comments_bead ON bead_comments(bead_id);

            CREATE TABLE blocked_beads_cache (
                bead_id TEXT PRIMARY KEY,
                blocker_ids TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE dirty_beads (
                bead_id TEXT PRIMARY KEY,
                marked_at TEXT NOT NULL
            );

            CREATE TABLE sync_state (
                project_key TEXT PRIMARY KEY,
                last_flushed_sequence INTEGER NOT NULL DEFAULT 0,
                flushed_at TEXT
            );",
    },
    Migration {
        version: 2,
        description: "agent registry, messages, reservations, decision traces",
        up_sql: "CREATE TABLE agents (
                project_key TEXT NOT NULL,
                name TEXT NOT NULL,
                program TEXT,
                model TEXT,
                registered_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL,
                PRIMARY KEY (project_key, name)
            );

            CREATE TABLE messages (
                id INTEGER PRIMARY KEY,
                project_key TEXT NOT NULL,
                sender TEXT NOT NULL,
                recipients TEXT NOT NULL,
                subject TEXT,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                read_by TEXT NOT NULL DEFAULT '[]'
            );
            CREATE INDEX idx_messages_project ON messages(project_key);

            CREATE TABLE reservations (
                id INTEGER PRIMARY KEY,
                project_key TEXT NOT NULL,
                agent TEXT NOT NULL,
                file_glob TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            CREATE INDEX idx_reservations_expires ON reservations(expires_at);

            CREATE TABLE decision_traces (
                id TEXT PRIMARY KEY,
                decision_type TEXT NOT NULL,
                epic_id TEXT,
                bead_id TEXT,
                agent_name TEXT NOT NULL,
                project_key TEXT NOT NULL,
                decision TEXT NOT NULL,
                rationale TEXT,
                inputs_gathered TEXT,
                policy_evaluated TEXT,
                alternatives TEXT,
                precedent_cited TEXT,
                outcome_event_id INTEGER,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX idx_decisions_bead ON decision_traces(bead_id);",
    },
    Migration {
        version: 3,
        description: "semantic memory store: rows, FTS index, vector index",
        up_sql: "CREATE TABLE memories (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                metadata TEXT,
                collection TEXT NOT NULL DEFAULT 'default',
                created_at TEXT NOT NULL,
                confidence REAL NOT NULL DEFAULT 1.0
                    CHECK (confidence >= 0.0 AND confidence <= 1.0),
                tags TEXT NOT NULL DEFAULT '[]',
                agent_type TEXT,
                session_id TEXT,
                message_role TEXT,
                message_idx INTEGER,
                source_path TEXT
            );
            CREATE INDEX idx_memories_collection ON memories(collection);
            CREATE INDEX idx_memories_session ON memories(session_id, message_idx);
            CREATE INDEX idx_memories_agent_type ON memories(agent_type);
            CREATE INDEX idx_memories_role ON memories(message_role);

            CREATE VIRTUAL TABLE memories_fts USING fts5(
                content,
                id UNINDEXED,
                content='memories',
                content_rowid='rowid'
            );

            CREATE VIRTUAL TABLE memory_embeddings USING vec0(
                memory_id TEXT PRIMARY KEY,
                embedding FLOAT[1024] distance_metric=cosine
            );",
    },
    Migration {
        version: 4,
        description: "session index staleness state",
        up_sql: "CREATE TABLE session_index_state (
                source_path TEXT PRIMARY KEY,
                last_indexed_at TEXT NOT NULL,
                file_mtime INTEGER NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0
            );",
    },
];

pub const LATEST_VERSION: i64 = 4;

/// Every schema object, in drop order (virtual tables first so their shadow
/// tables go with them). Used by the administrative reset.
pub const ALL_TABLES: &[&str] = &[
    "memories_fts",
    "memory_embeddings",
    "memories",
    "session_index_state",
    "decision_traces",
    "reservations",
    "messages",
    "agents",
    "sync_state",
    "dirty_beads",
    "blocked_beads_cache",
    "bead_comments",
    "bead_labels",
    "bead_dependencies",
    "beads",
    "events",
    "schema_version",
];

fn ensure_version_table(db: &Database) -> Result<()> {
    db.conn().execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )?;
    Ok(())
}

pub fn current_version(db: &Database) -> Result<i64> {
    ensure_version_table(db)?;
    let version: Option<i64> = db
        .conn()
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get(0)
        })?;
    Ok(version.unwrap_or(0))
}

/// Apply pending migrations in version order. Each migration runs inside a
/// single transaction together with its `schema_version` stamp, and is
/// followed by a WAL checkpoint.
pub fn run_migrations(db: &Database) -> Result<()> {
    let mut version = current_version(db)?;
    if version > LATEST_VERSION {
        return Err(HiveError::Schema(format!(
            "database is at schema version {version}, newer than this binary's {LATEST_VERSION}; refusing to downgrade"
        )));
    }

    for migration in MIGRATIONS {
        if migration.version <= version {
            continue;
        }
        tracing::info!(
            from = version,
            to = migration.version,
            description = migration.description,
            "applying migration"
        );
        let tx = db.conn().unchecked_transaction()?;
        tx.execute_batch(migration.up_sql)?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![migration.version, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        db.checkpoint()?;
        version = migration.version;
    }
    Ok(())
}
