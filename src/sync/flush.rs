//! Debounced background flusher: exports dirty projections to the
//! `.hive/*.jsonl` files with at most one write in flight. The sequence
//! reached by each flush is recorded in `sync_state`, so a restarted
//! process knows exactly what the files already contain.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rusqlite::params;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{ExportOptions, ISSUES_FILE, MEMORIES_FILE, SYNC_LOCK_FILE, export_beads, export_memories};
use crate::error::{HiveError, Result};
use crate::lock::FileLock;
use crate::store::HiveStore;

pub const DEFAULT_FLUSH_DEBOUNCE_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy)]
pub struct FlushOptions {
    pub debounce: Duration,
}

impl Default for FlushOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_FLUSH_DEBOUNCE_MS),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub beads_flushed: usize,
    pub flushed_sequence: i64,
}

/// Export the current projection state for a project into `hive_dir`,
/// atomically (staging file + rename), then clear the dirty set and record
/// the flushed sequence. Safe to call directly; the manager calls it too.
/// The sync files have at most one writer at a time, enforced through the
/// `sync.lock` file beside them.
pub fn flush_once(store: &HiveStore, project_key: &str, hive_dir: &Path) -> Result<FlushReport> {
    let dirty = store.get_dirty(project_key)?;
    let sequence = store.max_sequence(project_key)?;

    std::fs::create_dir_all(hive_dir)?;
    let _lock = FileLock::acquire(&hive_dir.join(SYNC_LOCK_FILE))?;
    let issues = export_beads(store, project_key, ExportOptions::default())?;
    write_atomic(&hive_dir.join(ISSUES_FILE), &issues)?;
    let memories = export_memories(store)?;
    write_atomic(&hive_dir.join(MEMORIES_FILE), &memories)?;

    store.clear_dirty(&dirty)?;
    store.database().conn().execute(
        "INSERT INTO sync_state (project_key, last_flushed_sequence, flushed_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (project_key) DO UPDATE SET
            last_flushed_sequence = excluded.last_flushed_sequence,
            flushed_at = excluded.flushed_at",
        params![project_key, sequence, Utc::now().to_rfc3339()],
    )?;
    tracing::debug!(
        project_key,
        beads = dirty.len(),
        sequence,
        "flushed projections to JSONL"
    );
    Ok(FlushReport {
        beads_flushed: dirty.len(),
        flushed_sequence: sequence,
    })
}

/// Sequence recorded by the last completed flush, 0 when never flushed.
pub fn last_flushed_sequence(store: &HiveStore, project_key: &str) -> Result<i64> {
    let sequence: Option<i64> = store
        .database()
        .conn()
        .query_row(
            "SELECT last_flushed_sequence FROM sync_state WHERE project_key = ?1",
            params![project_key],
            |row| row.get(0),
        )
        .map(Some)
        .or_else(|err| match err {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    Ok(sequence.unwrap_or(0))
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let staging = path.with_extension("jsonl.staging");
    std::fs::write(&staging, content)?;
    std::fs::rename(&staging, path)?;
    Ok(())
}

/// Debounced, at-most-one-in-flight writer. `notify_dirty` is cheap and
/// non-blocking; bursts coalesce into a single export once the debounce
/// window goes quiet.
pub struct FlushManager {
    signal: mpsc::UnboundedSender<()>,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl FlushManager {
    pub fn spawn(
        store: Arc<Mutex<HiveStore>>,
        project_key: String,
        hive_dir: PathBuf,
        opts: FlushOptions,
    ) -> Self {
        let (signal, mut signal_rx) = mpsc::unbounded_channel::<()>();
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    received = signal_rx.recv() => {
                        if received.is_none() {
                            break;
                        }
                        // Debounce: keep absorbing signals until quiet.
                        loop {
                            tokio::select! {
                                more = signal_rx.recv() => {
                                    if more.is_none() {
                                        break;
                                    }
                                }
                                _ = tokio::time::sleep(opts.debounce) => break,
                            }
                        }
                        let store = Arc::clone(&store);
                        let project = project_key.clone();
                        let dir = hive_dir.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            let guard = store
                                .lock()
                                .map_err(|_| HiveError::Locked("store mutex poisoned".into()))?;
                            flush_once(&guard, &project, &dir)
                        })
                        .await;
                        match result {
                            Ok(Ok(_)) => {}
                            Ok(Err(err)) => {
                                tracing::warn!(error = %err, "flush failed; will retry on next change")
                            }
                            Err(err) => tracing::error!(error = %err, "flush task panicked"),
                        }
                    }
                }
            }
        });

        Self {
            signal,
            shutdown,
            handle: Some(handle),
        }
    }

    /// Mark the project dirty; the flush happens after the debounce window.
    pub fn notify_dirty(&self) {
        let _ = self.signal.send(());
    }

    /// Stop the background task. Idempotent.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
