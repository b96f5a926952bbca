//! Vector and full-text retrieval with time-decayed relevance.
//!
//! The two index paths are alternatives, not a fused ranking: `find`
//! prefers the vector path and falls back to FTS when the embedder is
//! unreachable (or when the caller forces `fts`). Reciprocal-rank fusion
//! is a named extension point, not implemented here.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use super::{MEMORY_COLUMNS, MemoryStore, embedding_to_bytes, memory_from_row};
use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::model::Memory;

/// Relevance halves every 90 days.
pub const DECAY_HALF_LIFE_DAYS: f64 = 90.0;
pub const DEFAULT_SEARCH_LIMIT: usize = 10;
pub const DEFAULT_SCORE_THRESHOLD: f64 = 0.3;
const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    pub threshold: f64,
    pub collection: Option<String>,
    /// Force the FTS path even when an embedder is available.
    pub fts: bool,
    /// Return full content instead of the 200-char preview.
    pub expand: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_SEARCH_LIMIT,
            threshold: DEFAULT_SCORE_THRESHOLD,
            collection: None,
            fts: false,
            expand: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Vector,
    Fts,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryHit {
    pub memory: Memory,
    pub score: f64,
    pub match_type: MatchType,
}

impl<'a> MemoryStore<'a> {
    /// Cosine ANN search: score is `1 - cosine_distance`, filtered by the
    /// threshold, ordered by distance ascending.
    pub fn vector_search(&self, query: &[f32], opts: &SearchOptions) -> Result<Vec<MemoryHit>> {
        // Over-fetch so collection filtering cannot starve the page.
        let candidates = (opts.limit.max(1)) * 3;
        let mut stmt = self.database().conn().prepare(
            "SELECT memory_id, distance FROM memory_embeddings
             WHERE embedding MATCH ?1
             ORDER BY distance LIMIT ?2",
        )?;
        let scored: Vec<(String, f64)> = stmt
            .query_map(params![embedding_to_bytes(query), candidates as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut hits = Vec::new();
        for (id, distance) in scored {
            let score = 1.0 - distance;
            if score < opts.threshold {
                continue;
            }
            let Some(memory) = self.get(&id)? else {
                continue;
            };
            if let Some(collection) = &opts.collection
                && &memory.collection != collection
            {
                continue;
            }
            hits.push(MemoryHit {
                memory,
                score,
                match_type: MatchType::Vector,
            });
            if hits.len() >= opts.limit {
                break;
            }
        }
        Ok(hits)
    }

    /// BM25-ranked full-text search; the FTS5 rank is negated into a
    /// positive "higher is better" score.
    pub fn fts_search(&self, query: &str, opts: &SearchOptions) -> Result<Vec<MemoryHit>> {
        let escaped = escape_fts_query(query);
        if escaped.is_empty() {
            return Ok(Vec::new());
        }
        let candidates = (opts.limit.max(1)) * 3;
        let mut stmt = self.database().conn().prepare(
            "SELECT id, rank FROM memories_fts
             WHERE memories_fts MATCH ?1
             ORDER BY rank LIMIT ?2",
        )?;
        let scored: Vec<(String, f64)> = stmt
            .query_map(params![escaped, candidates as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut hits = Vec::new();
        for (id, rank) in scored {
            let Some(memory) = self.get(&id)? else {
                continue;
            };
            if let Some(collection) = &opts.collection
                && &memory.collection != collection
            {
                continue;
            }
            hits.push(MemoryHit {
                memory,
                score: -rank,
                match_type: MatchType::Fts,
            });
            if hits.len() >= opts.limit {
                break;
            }
        }
        Ok(hits)
    }

    /// Embed the query and search by vector; degrade to FTS when the
    /// embedder fails. Applies time decay and preview truncation.
    pub async fn find(
        &self,
        client: &EmbeddingClient,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<MemoryHit>> {
        let mut hits = if opts.fts {
            self.fts_search(query, opts)?
        } else {
            match client.embed(query).await {
                Ok(vector) => self.vector_search(&vector, opts)?,
                Err(err) => {
                    tracing::warn!(error = %err, "embedder unavailable, degrading to FTS");
                    self.fts_search(query, opts)?
                }
            }
        };

        apply_decay(&mut hits, Utc::now());
        if !opts.expand {
            for hit in &mut hits {
                hit.memory.content = truncate_preview(&hit.memory.content, PREVIEW_CHARS);
            }
        }
        Ok(hits)
    }

    /// Memories in collections can also be searched per collection by the
    /// session viewer; expose a narrow helper for that path.
    pub fn search_session(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        let mut stmt = self.database().conn().prepare(&format!(
            "SELECT {MEMORY_COLUMNS} FROM memories
             WHERE session_id = ?1 ORDER BY message_idx LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![session_id, limit as i64], memory_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

/// Multiply every score by `0.5^(age_days / 90)` and re-sort descending.
pub fn apply_decay(hits: &mut [MemoryHit], now: DateTime<Utc>) {
    for hit in hits.iter_mut() {
        let age_days = (now - hit.memory.created_at).num_seconds() as f64 / 86_400.0;
        hit.score *= decay_factor(age_days);
    }
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
}

pub fn decay_factor(age_days: f64) -> f64 {
    0.5f64.powf(age_days.max(0.0) / DECAY_HALF_LIFE_DAYS)
}

/// Wrap each whitespace-delimited word in quotes so FTS5 treats the query
/// as plain terms (implicit AND) instead of MATCH syntax.
fn escape_fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|word| format!("\"{}\"", word.replace('"', "")))
        .filter(|w| w != "\"\"")
        .collect::<Vec<_>>()
        .join(" ")
}

fn truncate_preview(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let cut: String = content.chars().take(max_chars).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::db::migrations::EMBEDDING_DIM;
    use crate::model::Memory;

    fn unit_vec(dim_hot: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[dim_hot] = 1.0;
        v
    }

    fn seeded(db: &Database) -> MemoryStore<'_> {
        let store = MemoryStore::new(db);
        store
            .store(
                &Memory::new("m-rust", "rust ownership and borrowing rules", "default"),
                Some(&unit_vec(0)),
            )
            .unwrap();
        store
            .store(
                &Memory::new("m-sql", "sqlite write ahead log checkpoints", "default"),
                Some(&unit_vec(100)),
            )
            .unwrap();
        store
    }

    #[test]
    fn vector_search_returns_nearest_first() {
        let db = Database::open_memory().unwrap();
        let store = seeded(&db);
        let hits = store
            .vector_search(&unit_vec(0), &SearchOptions::default())
            .unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].memory.id, "m-rust");
        assert!(hits[0].score > 0.99);
        assert_eq!(hits[0].match_type, MatchType::Vector);
        // Orthogonal memory scores ~0 and falls under the 0.3 threshold.
        assert!(!hits.iter().any(|h| h.memory.id == "m-sql"));
    }

    #[test]
    fn vector_search_scores_non_increasing() {
        let db = Database::open_memory().unwrap();
        let store = MemoryStore::new(&db);
        for i in 0..5 {
            let mut v = unit_vec(0);
            v[1] = i as f32 * 0.2;
            store
                .store(&Memory::new(format!("m-{i}"), format!("memory {i}"), "default"), Some(&v))
                .unwrap();
        }
        let hits = store
            .vector_search(&unit_vec(0), &SearchOptions::default())
            .unwrap();
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn fts_search_matches_keywords() {
        let db = Database::open_memory().unwrap();
        let store = seeded(&db);
        let hits = store
            .fts_search("write ahead log", &SearchOptions::default())
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory.id, "m-sql");
        assert!(hits[0].score > 0.0);
        assert_eq!(hits[0].match_type, MatchType::Fts);
    }

    #[test]
    fn fts_search_survives_hostile_queries() {
        let db = Database::open_memory().unwrap();
        let store = seeded(&db);
        store
            .fts_search("\"unbalanced OR (weird", &SearchOptions::default())
            .unwrap();
        assert!(store.fts_search("   ", &SearchOptions::default()).unwrap().is_empty());
    }

    #[test]
    fn collection_filter_applies_to_both_paths() {
        let db = Database::open_memory().unwrap();
        let store = seeded(&db);
        let mut session_memory = Memory::new("m-sess", "rust ownership notes", "sessions");
        session_memory.session_id = Some("s1".into());
        store.store(&session_memory, Some(&unit_vec(0))).unwrap();

        let opts = SearchOptions {
            collection: Some("sessions".into()),
            ..Default::default()
        };
        let hits = store.vector_search(&unit_vec(0), &opts).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory.id, "m-sess");

        let hits = store.fts_search("ownership", &opts).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].memory.id, "m-sess");
    }

    #[test]
    fn decay_halves_every_ninety_days() {
        assert!((decay_factor(0.0) - 1.0).abs() < 1e-9);
        assert!((decay_factor(90.0) - 0.5).abs() < 1e-9);
        assert!((decay_factor(180.0) - 0.25).abs() < 1e-9);
        // Clock skew into the future never boosts.
        assert!((decay_factor(-5.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn decay_reorders_identical_scores_by_age() {
        let db = Database::open_memory().unwrap();
        let store = MemoryStore::new(&db);
        let now = Utc::now();
        let fresh = Memory::new("m-fresh", "same content", "default");
        let mut stale = Memory::new("m-stale", "same content", "default");
        stale.created_at = now - chrono::Duration::days(180);
        store.store(&fresh, Some(&unit_vec(0))).unwrap();
        store.store(&stale, Some(&unit_vec(0))).unwrap();

        let mut hits = store
            .vector_search(&unit_vec(0), &SearchOptions::default())
            .unwrap();
        apply_decay(&mut hits, now);
        assert_eq!(hits[0].memory.id, "m-fresh");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
        assert_eq!(hits[1].memory.id, "m-stale");
        assert!((hits[1].score - 0.25).abs() < 1e-3);
    }

    #[test]
    fn preview_truncation_is_char_safe() {
        assert_eq!(truncate_preview("short", 200), "short");
        let long = "é".repeat(300);
        let preview = truncate_preview(&long, 200);
        assert_eq!(preview.chars().count(), 201);
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn session_lookup_orders_by_message_idx() {
        let db = Database::open_memory().unwrap();
        let store = MemoryStore::new(&db);
        for idx in [3i64, 1, 2] {
            let mut memory = Memory::new(format!("m-{idx}"), format!("line {idx}"), "sessions");
            memory.session_id = Some("s1".into());
            memory.message_idx = Some(idx);
            store.store(&memory, None).unwrap();
        }
        let messages = store.search_session("s1", 10).unwrap();
        let ids: Vec<i64> = messages.iter().filter_map(|m| m.message_idx).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
