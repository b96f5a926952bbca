//! Dependency graph traversal and the blocked-work cache.
//!
//! Only `blocks` edges carry traversal semantics; `related` and
//! `discovered-from` are free-form annotations. The `blocks` subgraph is
//! kept acyclic by checking every insertion, and traversals are depth
//! limited so a malformed graph degrades to `GraphTooDeep` instead of
//! spinning.

use chrono::Utc;
use rusqlite::{Connection, params};

use super::HiveStore;
use crate::error::{HiveError, Result};

pub const MAX_GRAPH_DEPTH: usize = 100;

/// True iff adding `bead_id -> depends_on_id` would close a cycle in the
/// `blocks` subgraph, i.e. `bead_id` is already reachable from
/// `depends_on_id` over dependency edges.
pub(crate) fn would_create_cycle_conn(
    conn: &Connection,
    bead_id: &str,
    depends_on_id: &str,
) -> Result<bool> {
    if bead_id == depends_on_id {
        return Ok(true);
    }
    check_depth(conn, depends_on_id, Direction::Downstream)?;
    let mut stmt = conn.prepare(
        "WITH RECURSIVE reach(id, depth) AS (
            SELECT ?1, 0
            UNION
            SELECT d.depends_on_id, r.depth + 1
            FROM bead_dependencies d
            JOIN reach r ON d.bead_id = r.id
            WHERE d.relationship = 'blocks' AND r.depth < ?3
        )
        SELECT EXISTS(SELECT 1 FROM reach WHERE id = ?2)",
    )?;
    let exists: bool = stmt.query_row(
        params![depends_on_id, bead_id, MAX_GRAPH_DEPTH as i64],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Transitive blockers of `bead_id` that are still open: not closed, not
/// tombstoned, not soft-deleted. Traversal passes through closed beads so
/// an open blocker behind a closed intermediate still counts.
pub(crate) fn open_blockers_conn(
    conn: &Connection,
    project_key: &str,
    bead_id: &str,
) -> Result<Vec<String>> {
    check_depth(conn, bead_id, Direction::Downstream)?;
    let mut stmt = conn.prepare(
        "WITH RECURSIVE reach(id, depth) AS (
            SELECT ?1, 0
            UNION
            SELECT d.depends_on_id, r.depth + 1
            FROM bead_dependencies d
            JOIN reach r ON d.bead_id = r.id
            WHERE d.relationship = 'blocks' AND r.depth < ?3
        )
        SELECT DISTINCT b.id FROM reach r
        JOIN beads b ON b.id = r.id
        WHERE r.id != ?1
          AND b.project_key = ?2
          AND b.status NOT IN ('closed', 'tombstone')
          AND b.deleted_at IS NULL
        ORDER BY b.id",
    )?;
    let rows = stmt.query_map(
        params![bead_id, project_key, MAX_GRAPH_DEPTH as i64],
        |row| row.get(0),
    )?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Into::into)
}

/// Recompute the cache row for one bead: upsert when blockers remain,
/// delete when none (absence of a row means unblocked).
pub(crate) fn rebuild_blocked_cache_conn(
    conn: &Connection,
    project_key: &str,
    bead_id: &str,
) -> Result<()> {
    let blockers = open_blockers_conn(conn, project_key, bead_id)?;
    if blockers.is_empty() {
        conn.execute(
            "DELETE FROM blocked_beads_cache WHERE bead_id = ?1",
            params![bead_id],
        )?;
    } else {
        conn.execute(
            "INSERT OR REPLACE INTO blocked_beads_cache (bead_id, blocker_ids, updated_at)
             VALUES (?1, ?2, ?3)",
            params![
                bead_id,
                serde_json::to_string(&blockers)?,
                Utc::now().to_rfc3339()
            ],
        )?;
    }
    Ok(())
}

/// Rebuild the cache for `bead_id` and every bead that directly or
/// transitively depends on it.
pub(crate) fn invalidate_blocked_cache_conn(
    conn: &Connection,
    project_key: &str,
    bead_id: &str,
) -> Result<()> {
    check_depth(conn, bead_id, Direction::Upstream)?;
    let affected: Vec<String> = {
        let mut stmt = conn.prepare(
            "WITH RECURSIVE dependents(id, depth) AS (
                SELECT ?1, 0
                UNION
                SELECT d.bead_id, r.depth + 1
                FROM bead_dependencies d
                JOIN dependents r ON d.depends_on_id = r.id
                WHERE d.relationship = 'blocks' AND r.depth < ?2
            )
            SELECT DISTINCT id FROM dependents",
        )?;
        let rows = stmt.query_map(params![bead_id, MAX_GRAPH_DEPTH as i64], |row| row.get(0))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()?
    };
    for id in &affected {
        rebuild_blocked_cache_conn(conn, project_key, id)?;
    }
    Ok(())
}

enum Direction {
    /// Follow `bead -> depends_on` edges.
    Downstream,
    /// Follow reverse edges toward dependents.
    Upstream,
}

/// Probe the traversal depth from `start`; error with `GraphTooDeep` when
/// the frontier is still growing at the depth cap.
fn check_depth(conn: &Connection, start: &str, direction: Direction) -> Result<()> {
    let join = match direction {
        Direction::Downstream => "d.bead_id = r.id",
        Direction::Upstream => "d.depends_on_id = r.id",
    };
    let next = match direction {
        Direction::Downstream => "d.depends_on_id",
        Direction::Upstream => "d.bead_id",
    };
    let sql = format!(
        "WITH RECURSIVE reach(id, depth) AS (
            SELECT ?1, 0
            UNION
            SELECT {next}, r.depth + 1
            FROM bead_dependencies d
            JOIN reach r ON {join}
            WHERE d.relationship = 'blocks' AND r.depth < ?2
        )
        SELECT COALESCE(MAX(depth), 0) FROM reach"
    );
    let max_depth: i64 = conn.query_row(&sql, params![start, MAX_GRAPH_DEPTH as i64], |row| {
        row.get(0)
    })?;
    if max_depth >= MAX_GRAPH_DEPTH as i64 {
        return Err(HiveError::GraphTooDeep(MAX_GRAPH_DEPTH));
    }
    Ok(())
}

impl HiveStore {
    pub fn would_create_cycle(&self, bead_id: &str, depends_on_id: &str) -> Result<bool> {
        would_create_cycle_conn(self.database().conn(), bead_id, depends_on_id)
    }

    pub fn get_open_blockers(&self, project_key: &str, bead_id: &str) -> Result<Vec<String>> {
        open_blockers_conn(self.database().conn(), project_key, bead_id)
    }

    pub fn rebuild_blocked_cache(&self, project_key: &str, bead_id: &str) -> Result<()> {
        rebuild_blocked_cache_conn(self.database().conn(), project_key, bead_id)
    }

    pub fn invalidate_blocked_cache(&self, project_key: &str, bead_id: &str) -> Result<()> {
        invalidate_blocked_cache_conn(self.database().conn(), project_key, bead_id)
    }

    /// Cached transitive open blockers; empty when the bead is unblocked.
    pub fn get_blockers(&self, bead_id: &str) -> Result<Vec<String>> {
        let cached: Option<String> = self
            .database()
            .conn()
            .query_row(
                "SELECT blocker_ids FROM blocked_beads_cache WHERE bead_id = ?1",
                params![bead_id],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;
        Ok(cached
            .and_then(|json| serde_json::from_str(&json).ok())
            .unwrap_or_default())
    }

    /// Every blocked bead of the project with its blocker set.
    pub fn get_blocked(&self, project_key: &str) -> Result<Vec<(String, Vec<String>)>> {
        let mut stmt = self.database().conn().prepare(
            "SELECT c.bead_id, c.blocker_ids FROM blocked_beads_cache c
             JOIN beads b ON b.id = c.bead_id
             WHERE b.project_key = ?1
             ORDER BY c.bead_id",
        )?;
        let rows = stmt.query_map(params![project_key], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut blocked = Vec::new();
        for row in rows {
            let (bead_id, blockers_json) = row?;
            blocked.push((
                bead_id,
                serde_json::from_str(&blockers_json).unwrap_or_default(),
            ));
        }
        Ok(blocked)
    }
}
