//! Debounced session-directory watcher.
//!
//! Wraps the OS notification backend behind two channels: coalesced
//! per-path events and a side channel for errors that must never halt the
//! watch loop. A dead backend is recreated with exponential backoff.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const DEFAULT_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_SUFFIX: &str = ".jsonl";
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Added,
    Changed,
    Unlinked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchKind,
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Only paths ending with this suffix are reported.
    pub suffix: String,
    /// Per-path quiet window before an event is emitted.
    pub debounce: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            suffix: DEFAULT_SUFFIX.to_string(),
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
        }
    }
}

pub struct SessionWatcher {
    events: mpsc::UnboundedReceiver<WatchEvent>,
    errors: mpsc::UnboundedReceiver<String>,
    ready: watch::Receiver<bool>,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl SessionWatcher {
    /// Watch `dirs` recursively. Existing matching files are reported as
    /// `Added` during the initial scan; `wait_ready` resolves once that
    /// scan is done.
    pub fn spawn(dirs: Vec<PathBuf>, config: WatcherConfig) -> Self {
        let (event_tx, events) = mpsc::unbounded_channel();
        let (error_tx, errors) = mpsc::unbounded_channel();
        let (ready_tx, ready) = watch::channel(false);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(watch_loop(
            dirs,
            config,
            event_tx,
            error_tx,
            ready_tx,
            shutdown_rx,
        ));

        Self {
            events,
            errors,
            ready,
            shutdown,
            handle: Some(handle),
        }
    }

    pub async fn wait_ready(&mut self) {
        while !*self.ready.borrow() {
            if self.ready.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn next_event(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }

    pub fn try_next_error(&mut self) -> Option<String> {
        self.errors.try_recv().ok()
    }

    /// Cancel pending debounce timers and wait for the backend to close.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn watch_loop(
    dirs: Vec<PathBuf>,
    config: WatcherConfig,
    event_tx: mpsc::UnboundedSender<WatchEvent>,
    error_tx: mpsc::UnboundedSender<String>,
    ready_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;
    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let (raw_tx, mut raw_rx) = mpsc::channel::<std::result::Result<Event, notify::Error>>(256);
        let watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.blocking_send(res);
            },
            Config::default(),
        );
        let mut watcher = match watcher {
            Ok(watcher) => watcher,
            Err(err) => {
                let _ = error_tx.send(format!("watcher init failed: {err}"));
                if backoff_or_shutdown(&mut attempt, &mut shutdown_rx).await {
                    return;
                }
                continue;
            }
        };
        let mut watching_any = false;
        for dir in &dirs {
            match watcher.watch(dir, RecursiveMode::Recursive) {
                Ok(()) => watching_any = true,
                Err(err) => {
                    let _ = error_tx
                        .send(format!("cannot watch {}: {err}", dir.display()));
                }
            }
        }
        if !watching_any {
            drop(watcher);
            if backoff_or_shutdown(&mut attempt, &mut shutdown_rx).await {
                return;
            }
            continue;
        }
        attempt = 0;

        // Initial scan: surface pre-existing transcripts, then signal ready.
        for dir in &dirs {
            scan_existing(dir, &config.suffix, &event_tx);
        }
        let _ = ready_tx.send(true);

        let mut pending: HashMap<PathBuf, (WatchKind, Instant)> = HashMap::new();
        let backend_died = loop {
            let next_flush = pending
                .values()
                .map(|(_, at)| *at + config.debounce)
                .min()
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        // Pending debounce timers die with the watcher.
                        return;
                    }
                }
                raw = raw_rx.recv() => {
                    match raw {
                        Some(Ok(event)) => {
                            coalesce(&mut pending, &event, &config.suffix);
                        }
                        Some(Err(err)) => {
                            let _ = error_tx.send(err.to_string());
                        }
                        None => break true,
                    }
                }
                _ = tokio::time::sleep_until(next_flush) => {
                    let now = Instant::now();
                    let due: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, (_, at))| now.duration_since(*at) >= config.debounce)
                        .map(|(path, _)| path.clone())
                        .collect();
                    for path in due {
                        if let Some((kind, _)) = pending.remove(&path) {
                            let _ = event_tx.send(WatchEvent { path, kind });
                        }
                    }
                }
            }
        };

        drop(watcher);
        if backend_died {
            let _ = error_tx.send("watch backend closed; restarting".to_string());
            if backoff_or_shutdown(&mut attempt, &mut shutdown_rx).await {
                return;
            }
        }
    }
}

/// Sleep the exponential backoff for `attempt`; true means shut down.
async fn backoff_or_shutdown(attempt: &mut u32, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    let shift = (*attempt).min(8);
    let backoff = Duration::from_millis(100u64 << shift).min(MAX_BACKOFF);
    *attempt = attempt.saturating_add(1);
    tokio::select! {
        _ = tokio::time::sleep(backoff) => false,
        _ = shutdown_rx.changed() => *shutdown_rx.borrow(),
    }
}

fn matches_suffix(path: &Path, suffix: &str) -> bool {
    path.to_string_lossy().ends_with(suffix)
}

fn coalesce(pending: &mut HashMap<PathBuf, (WatchKind, Instant)>, event: &Event, suffix: &str) {
    let kind = match event.kind {
        EventKind::Create(_) => WatchKind::Added,
        EventKind::Modify(_) => WatchKind::Changed,
        EventKind::Remove(_) => WatchKind::Unlinked,
        _ => return,
    };
    let now = Instant::now();
    for path in &event.paths {
        if !matches_suffix(path, suffix) {
            continue;
        }
        let merged = match (pending.get(path).map(|(k, _)| *k), kind) {
            // A burst on a fresh file stays one Added.
            (Some(WatchKind::Added), WatchKind::Changed) => WatchKind::Added,
            // Deleted then recreated reads as a change.
            (Some(WatchKind::Unlinked), WatchKind::Added) => WatchKind::Changed,
            (_, kind) => kind,
        };
        pending.insert(path.clone(), (merged, now));
    }
}

fn scan_existing(dir: &Path, suffix: &str, event_tx: &mpsc::UnboundedSender<WatchEvent>) {
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&current) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if matches_suffix(&path, suffix) {
                let _ = event_tx.send(WatchEvent {
                    path,
                    kind: WatchKind::Added,
                });
            }
        }
    }
}
