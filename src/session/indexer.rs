//! Session indexing: transcript -> chunks -> embeddings -> memory store,
//! with mtime-based staleness tracking so unchanged files are never
//! re-embedded.

use std::path::Path;

use chrono::Utc;
use futures::StreamExt;
use rusqlite::params;

use super::{parser, patterns};
use crate::db::Database;
use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::memory::MemoryStore;
use crate::model::{Memory, SessionMessage};

/// A file is stale once its mtime runs this far ahead of the indexed one.
pub const STALENESS_GRACE_SECS: i64 = 300;
pub const DEFAULT_EMBED_CONCURRENCY: usize = 5;
pub const SESSIONS_COLLECTION: &str = "sessions";

/// One unit of embedding. The baseline is 1 chunk = 1 message; splitting
/// long messages into multiple chunks is the designated extension point.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub message: SessionMessage,
}

pub fn chunk_messages(messages: Vec<SessionMessage>) -> Vec<Chunk> {
    messages
        .into_iter()
        .map(|message| Chunk { message })
        .collect()
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct IndexReport {
    pub indexed: usize,
    pub embedded: usize,
    /// True when the path matched no agent pattern and was left alone.
    pub skipped: bool,
}

pub struct SessionIndexer<'a> {
    db: &'a Database,
    concurrency: usize,
}

impl<'a> SessionIndexer<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self {
            db,
            concurrency: DEFAULT_EMBED_CONCURRENCY,
        }
    }

    pub fn with_concurrency(db: &'a Database, concurrency: usize) -> Self {
        Self {
            db,
            concurrency: concurrency.max(1),
        }
    }

    // -----------------------------------------------------------------------
    // Staleness tracking
    // -----------------------------------------------------------------------

    pub fn record_indexed(&self, path: &str, mtime_secs: i64, message_count: i64) -> Result<()> {
        self.db.conn().execute(
            "INSERT INTO session_index_state (source_path, last_indexed_at, file_mtime, message_count)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (source_path) DO UPDATE SET
                last_indexed_at = excluded.last_indexed_at,
                file_mtime = excluded.file_mtime,
                message_count = excluded.message_count",
            params![path, Utc::now().to_rfc3339(), mtime_secs, message_count],
        )?;
        Ok(())
    }

    /// Never indexed, or drifted past the grace window => stale.
    pub fn is_stale(&self, path: &str, current_mtime: i64) -> Result<bool> {
        let recorded: Option<i64> = self
            .db
            .conn()
            .query_row(
                "SELECT file_mtime FROM session_index_state WHERE source_path = ?1",
                params![path],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(match recorded {
            None => true,
            Some(file_mtime) => current_mtime - file_mtime > STALENESS_GRACE_SECS,
        })
    }

    /// Bulk staleness via a single `IN` query; unknown paths come back
    /// stale.
    pub fn check_bulk(&self, items: &[(String, i64)]) -> Result<Vec<(String, bool)>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = (1..=items.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "SELECT source_path, file_mtime FROM session_index_state
             WHERE source_path IN ({})",
            placeholders.join(", ")
        );
        let mut stmt = self.db.conn().prepare(&sql)?;
        let args: Vec<&dyn rusqlite::types::ToSql> = items
            .iter()
            .map(|(path, _)| path as &dyn rusqlite::types::ToSql)
            .collect();
        let known: std::collections::HashMap<String, i64> = stmt
            .query_map(args.as_slice(), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<std::result::Result<_, _>>()?;

        Ok(items
            .iter()
            .map(|(path, current_mtime)| {
                let stale = match known.get(path) {
                    None => true,
                    Some(file_mtime) => current_mtime - file_mtime > STALENESS_GRACE_SECS,
                };
                (path.clone(), stale)
            })
            .collect())
    }

    // -----------------------------------------------------------------------
    // Indexing pipeline
    // -----------------------------------------------------------------------

    /// Parse, chunk, embed (bounded concurrency), and store one transcript.
    /// Embedding failures degrade to null embeddings so FTS still works;
    /// they never fail the index run.
    pub async fn index_file(&self, client: &EmbeddingClient, path: &Path) -> Result<IndexReport> {
        let path_str = path.to_string_lossy().to_string();
        let Some(agent_type) = patterns::detect_agent_type(&path_str) else {
            tracing::debug!(path = %path_str, "no agent pattern matched; skipping");
            return Ok(IndexReport {
                skipped: true,
                ..Default::default()
            });
        };

        self.index_file_as(client, path, &agent_type).await
    }

    /// Index with a known agent type, bypassing pattern discovery.
    pub async fn index_file_as(
        &self,
        client: &EmbeddingClient,
        path: &Path,
        agent_type: &str,
    ) -> Result<IndexReport> {
        let path_str = path.to_string_lossy().to_string();
        let messages = parser::parse_session_file(path, agent_type)?;
        let chunks = chunk_messages(messages);

        let embeddings: Vec<Option<Vec<f32>>> = futures::stream::iter(chunks.iter())
            .map(|chunk| async move {
                match client.embed(&chunk.message.content).await {
                    Ok(vector) => Some(vector),
                    Err(err) => {
                        tracing::warn!(error = %err, "chunk embedding failed; storing without vector");
                        None
                    }
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await;

        let memories = MemoryStore::new(self.db);
        let mut embedded = 0;
        for (chunk, embedding) in chunks.iter().zip(&embeddings) {
            let message = &chunk.message;
            let mut memory = Memory::new(
                format!("{}:{}", message.session_id, message.message_idx),
                message.content.clone(),
                SESSIONS_COLLECTION,
            );
            memory.created_at = message.timestamp.unwrap_or_else(Utc::now);
            memory.agent_type = Some(message.agent_type.clone());
            memory.session_id = Some(message.session_id.clone());
            memory.message_role = Some(message.role);
            memory.message_idx = Some(message.message_idx as i64);
            memory.source_path = message.source_path.clone();
            memories.store(&memory, embedding.as_deref())?;
            if embedding.is_some() {
                embedded += 1;
            }
        }

        let mtime = file_mtime_secs(path)?;
        self.record_indexed(&path_str, mtime, chunks.len() as i64)?;
        tracing::info!(
            path = %path_str,
            agent_type,
            messages = chunks.len(),
            embedded,
            "session indexed"
        );
        Ok(IndexReport {
            indexed: chunks.len(),
            embedded,
            skipped: false,
        })
    }
}

pub fn file_mtime_secs(path: &Path) -> Result<i64> {
    let mtime = std::fs::metadata(path)?
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Ok(mtime.as_secs() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indexer_db() -> Database {
        Database::open_memory().unwrap()
    }

    #[test]
    fn never_indexed_is_stale() {
        let db = indexer_db();
        let indexer = SessionIndexer::new(&db);
        assert!(indexer.is_stale("/s/a.jsonl", 1_000).unwrap());
    }

    #[test]
    fn staleness_boundary_is_exclusive() {
        let db = indexer_db();
        let indexer = SessionIndexer::new(&db);
        indexer.record_indexed("/s/a.jsonl", 1_000, 12).unwrap();

        assert!(!indexer.is_stale("/s/a.jsonl", 1_000).unwrap());
        // Exactly at mtime + grace: still fresh.
        assert!(!indexer
            .is_stale("/s/a.jsonl", 1_000 + STALENESS_GRACE_SECS)
            .unwrap());
        assert!(indexer
            .is_stale("/s/a.jsonl", 1_000 + STALENESS_GRACE_SECS + 1)
            .unwrap());
    }

    #[test]
    fn bulk_check_treats_unknown_as_stale() {
        let db = indexer_db();
        let indexer = SessionIndexer::new(&db);
        indexer.record_indexed("/s/fresh.jsonl", 1_000, 3).unwrap();
        indexer.record_indexed("/s/old.jsonl", 1_000, 3).unwrap();

        let results = indexer
            .check_bulk(&[
                ("/s/fresh.jsonl".into(), 1_100),
                ("/s/old.jsonl".into(), 2_000),
                ("/s/new.jsonl".into(), 1_000),
            ])
            .unwrap();
        assert_eq!(
            results,
            vec![
                ("/s/fresh.jsonl".to_string(), false),
                ("/s/old.jsonl".to_string(), true),
                ("/s/new.jsonl".to_string(), true),
            ]
        );
        assert!(indexer.check_bulk(&[]).unwrap().is_empty());
    }

    #[test]
    fn record_indexed_upserts() {
        let db = indexer_db();
        let indexer = SessionIndexer::new(&db);
        indexer.record_indexed("/s/a.jsonl", 1_000, 3).unwrap();
        indexer.record_indexed("/s/a.jsonl", 2_000, 5).unwrap();
        let (mtime, count): (i64, i64) = db
            .conn()
            .query_row(
                "SELECT file_mtime, message_count FROM session_index_state
                 WHERE source_path = '/s/a.jsonl'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(mtime, 2_000);
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn index_file_degrades_to_null_embeddings() {
        use crate::embedding::{EmbeddingClient, EmbeddingConfig};
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let sessions = dir.path().join(".claude").join("projects").join("-repo");
        std::fs::create_dir_all(&sessions).unwrap();
        let path = sessions.join("abc123.jsonl");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"{{"type":"user","sessionId":"abc123","message":{{"role":"user","content":"index me"}}}}"#
        )
        .unwrap();
        writeln!(
            file,
            r#"{{"type":"assistant","message":{{"role":"assistant","content":"stored"}}}}"#
        )
        .unwrap();

        let db = indexer_db();
        let indexer = SessionIndexer::new(&db);
        // Port 1 is closed: every embed call fails, messages store anyway.
        let client = EmbeddingClient::new(EmbeddingConfig {
            host: "http://127.0.0.1:1".into(),
            timeout: std::time::Duration::from_millis(100),
            ..Default::default()
        })
        .unwrap();

        let report = indexer
            .index_file_as(&client, &path, "claude-code")
            .await
            .unwrap();
        assert_eq!(report.indexed, 2);
        assert_eq!(report.embedded, 0);
        assert!(!report.skipped);

        let memories = MemoryStore::new(&db);
        let stored = memories.search_session("abc123", 10).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].content, "index me");
        // FTS still finds the unembedded content.
        let hits = memories
            .fts_search("index", &crate::memory::search::SearchOptions::default())
            .unwrap();
        assert_eq!(hits.len(), 1);

        // Freshly indexed file is not stale.
        let mtime = file_mtime_secs(&path).unwrap();
        assert!(!indexer.is_stale(&path.to_string_lossy(), mtime).unwrap());
    }

    #[tokio::test]
    async fn unmatched_paths_are_skipped() {
        use crate::embedding::EmbeddingClient;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("random.jsonl");
        std::fs::write(&path, "{}\n").unwrap();

        let db = indexer_db();
        let indexer = SessionIndexer::new(&db);
        let client = EmbeddingClient::with_defaults().unwrap();
        let report = indexer.index_file(&client, &path).await.unwrap();
        assert!(report.skipped);
        assert_eq!(report.indexed, 0);
    }
}
