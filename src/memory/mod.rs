//! Semantic memory: textual memories with vector and full-text indexes in
//! the same database as the coordination tables. Vector rows live in the
//! `memory_embeddings` vec0 table and are deleted in the same transaction
//! as their memory; the FTS index is maintained explicitly as an
//! external-content table.

pub mod search;

use rusqlite::{OptionalExtension, Row, params};

use crate::db::{Database, migrations::EMBEDDING_DIM};
use crate::embedding::{EmbedderHealth, EmbeddingClient};
use crate::error::{HiveError, Result};
use crate::model::Memory;
use crate::store::{parse_dt, parse_string_array};

pub struct MemoryStore<'a> {
    db: &'a Database,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MemoryStats {
    pub memories: i64,
    pub embeddings: i64,
}

pub(crate) fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

pub(crate) const MEMORY_COLUMNS: &str = "id, content, metadata, collection, created_at, \
     confidence, tags, agent_type, session_id, message_role, message_idx, source_path";

pub(crate) fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<Memory> {
    let metadata: Option<String> = row.get(2)?;
    let role: Option<String> = row.get(9)?;
    Ok(Memory {
        id: row.get(0)?,
        content: row.get(1)?,
        metadata: metadata.and_then(|s| serde_json::from_str(&s).ok()),
        collection: row.get(3)?,
        created_at: parse_dt(&row.get::<_, String>(4)?),
        confidence: row.get(5)?,
        tags: parse_string_array(row.get(6)?),
        agent_type: row.get(7)?,
        session_id: row.get(8)?,
        message_role: role.and_then(|r| r.parse().ok()),
        message_idx: row.get(10)?,
        source_path: row.get(11)?,
    })
}

impl<'a> MemoryStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub(crate) fn database(&self) -> &Database {
        self.db
    }

    /// Atomic upsert of the memory row, its FTS entry, and (when given)
    /// its embedding. A `None` embedding leaves the memory searchable by
    /// FTS only, which is the graceful-degradation path.
    pub fn store(&self, memory: &Memory, embedding: Option<&[f32]>) -> Result<()> {
        if let Some(embedding) = embedding
            && embedding.len() != EMBEDDING_DIM
        {
            return Err(HiveError::Mismatch(format!(
                "embedding has {} dimensions, expected {EMBEDDING_DIM}",
                embedding.len()
            )));
        }

        let tx = self.db.conn().unchecked_transaction()?;

        // External-content FTS: remove the stale entry before the row changes.
        let old: Option<(i64, String)> = tx
            .query_row(
                "SELECT rowid, content FROM memories WHERE id = ?1",
                params![memory.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        if let Some((rowid, old_content)) = &old {
            tx.execute(
                "INSERT INTO memories_fts (memories_fts, rowid, content, id)
                 VALUES ('delete', ?1, ?2, ?3)",
                params![rowid, old_content, memory.id],
            )?;
        }

        tx.execute(
            "INSERT INTO memories
                (id, content, metadata, collection, created_at, confidence, tags,
                 agent_type, session_id, message_role, message_idx, source_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT (id) DO UPDATE SET
                content = excluded.content,
                metadata = excluded.metadata,
                collection = excluded.collection,
                confidence = excluded.confidence,
                tags = excluded.tags,
                agent_type = excluded.agent_type,
                session_id = excluded.session_id,
                message_role = excluded.message_role,
                message_idx = excluded.message_idx,
                source_path = excluded.source_path",
            params![
                memory.id,
                memory.content,
                memory.metadata.as_ref().map(|v| v.to_string()),
                memory.collection,
                memory.created_at.to_rfc3339(),
                memory.confidence,
                serde_json::to_string(&memory.tags)?,
                memory.agent_type,
                memory.session_id,
                memory.message_role.map(|r| r.to_string()),
                memory.message_idx,
                memory.source_path,
            ],
        )?;

        let rowid: i64 = tx.query_row(
            "SELECT rowid FROM memories WHERE id = ?1",
            params![memory.id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO memories_fts (rowid, content, id) VALUES (?1, ?2, ?3)",
            params![rowid, memory.content, memory.id],
        )?;

        tx.execute(
            "DELETE FROM memory_embeddings WHERE memory_id = ?1",
            params![memory.id],
        )?;
        if let Some(embedding) = embedding {
            tx.execute(
                "INSERT INTO memory_embeddings (memory_id, embedding) VALUES (?1, ?2)",
                params![memory.id, embedding_to_bytes(embedding)],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Memory>> {
        self.db
            .conn()
            .query_row(
                &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1"),
                params![id],
                memory_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Delete a memory; the FTS entry and embedding go with it.
    pub fn remove(&self, id: &str) -> Result<()> {
        let tx = self.db.conn().unchecked_transaction()?;
        let old: Option<(i64, String)> = tx
            .query_row(
                "SELECT rowid, content FROM memories WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((rowid, content)) = old else {
            return Err(HiveError::NotFound {
                kind: "memory",
                id: id.to_string(),
            });
        };
        tx.execute(
            "INSERT INTO memories_fts (memories_fts, rowid, content, id)
             VALUES ('delete', ?1, ?2, ?3)",
            params![rowid, content, id],
        )?;
        tx.execute(
            "DELETE FROM memory_embeddings WHERE memory_id = ?1",
            params![id],
        )?;
        tx.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    /// Refresh the decay clock: a validated memory scores as if stored now.
    pub fn validate(&self, id: &str) -> Result<()> {
        let changed = self.db.conn().execute(
            "UPDATE memories SET created_at = ?1 WHERE id = ?2",
            params![chrono::Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(HiveError::NotFound {
                kind: "memory",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn list(&self, collection: Option<&str>, limit: usize) -> Result<Vec<Memory>> {
        let mut sql = format!("SELECT {MEMORY_COLUMNS} FROM memories");
        if collection.is_some() {
            sql.push_str(" WHERE collection = ?1");
        }
        sql.push_str(&format!(" ORDER BY created_at DESC, id LIMIT {limit}"));
        let mut stmt = self.db.conn().prepare(&sql)?;
        let rows = match collection {
            Some(collection) => stmt.query_map(params![collection], memory_from_row)?,
            None => stmt.query_map([], memory_from_row)?,
        };
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// Whether semantic (vector) search is currently possible. FTS always
    /// works; the embedder decides the rest.
    pub async fn check_health(&self, client: &EmbeddingClient) -> EmbedderHealth {
        client.check_health().await
    }

    pub fn stats(&self) -> Result<MemoryStats> {
        let memories: i64 =
            self.db
                .conn()
                .query_row("SELECT COUNT(*) FROM memories", [], |row| row.get(0))?;
        let embeddings: i64 = self.db.conn().query_row(
            "SELECT COUNT(*) FROM memory_embeddings",
            [],
            |row| row.get(0),
        )?;
        Ok(MemoryStats {
            memories,
            embeddings,
        })
    }
}
