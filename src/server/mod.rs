//! Durable-stream server: the event log over HTTP.
//!
//! `GET /streams/{project_key}` pages events after an offset as JSON;
//! `?live=true` upgrades to a long-lived SSE stream that replays the
//! backlog and then tails new appends, one `data:` frame per event.
//! Tailing is poll-based against the shared database, so subscribers see
//! each event at most once, in sequence order, within one poll tick of a
//! direct reader.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use futures::Stream;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{HiveError, Result};
use crate::store::HiveStore;
use crate::store::events::EventFilter;

pub const DEFAULT_PORT: u16 = 7470;
pub const DEFAULT_POLL_MS: u64 = 250;
const DEFAULT_PAGE_LIMIT: usize = 100;
const TAIL_BATCH: usize = 256;

/// One event on the wire: `offset` is the per-project sequence.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StreamItem {
    pub offset: i64,
    pub data: Value,
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub poll: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(DEFAULT_POLL_MS),
        }
    }
}

type SubscriptionMap = Arc<Mutex<HashMap<u64, (String, i64)>>>;

#[derive(Clone)]
struct AppState {
    store: Arc<Mutex<HiveStore>>,
    shutdown: watch::Receiver<bool>,
    subscriptions: SubscriptionMap,
    next_subscription: Arc<AtomicU64>,
    poll: Duration,
}

pub struct StreamServer {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    subscriptions: SubscriptionMap,
    handle: Option<JoinHandle<()>>,
}

impl StreamServer {
    /// Bind and serve. Use port 0 to pick a free port; `local_addr` has
    /// the resolved address.
    pub async fn bind(
        store: Arc<Mutex<HiveStore>>,
        addr: SocketAddr,
        config: ServerConfig,
    ) -> Result<Self> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let subscriptions: SubscriptionMap = Arc::new(Mutex::new(HashMap::new()));
        let state = AppState {
            store,
            shutdown: shutdown_rx.clone(),
            subscriptions: Arc::clone(&subscriptions),
            next_subscription: Arc::new(AtomicU64::new(1)),
            poll: config.poll,
        };

        let app = Router::new()
            .route("/streams/{project_key}", get(stream_handler))
            .fallback(not_found)
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let mut serve_shutdown = shutdown_rx;
        let handle = tokio::spawn(async move {
            let graceful = async move {
                while serve_shutdown.changed().await.is_ok() {
                    if *serve_shutdown.borrow() {
                        break;
                    }
                }
            };
            if let Err(err) = axum::serve(listener, app)
                .with_graceful_shutdown(graceful)
                .await
            {
                tracing::error!(error = %err, "stream server exited with error");
            }
        });

        tracing::info!(%addr, "stream server listening");
        Ok(Self {
            addr,
            shutdown,
            subscriptions,
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Open SSE subscriptions, for observability and tests.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Stop serving. Every open SSE stream observes end-of-stream; new
    /// requests fail fast. Idempotent.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

fn error_body(status: StatusCode, err: &HiveError) -> Response {
    let body = json!({
        "error": {
            "code": status.as_u16(),
            "kind": err.code(),
            "message": err.to_string(),
            "retryable": err.retryable(),
        }
    });
    (status, Json(body)).into_response()
}

async fn not_found() -> Response {
    let body = json!({
        "error": {
            "code": 404,
            "kind": "not_found",
            "message": "unknown route",
            "retryable": false,
        }
    });
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

/// Lenient query parsing: a malformed offset or limit falls back to the
/// default instead of erroring.
fn parse_param<T: std::str::FromStr>(params: &HashMap<String, String>, key: &str, default: T) -> T {
    params
        .get(key)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn read_page(
    store: &Arc<Mutex<HiveStore>>,
    project_key: &str,
    after: i64,
    limit: usize,
) -> Result<Vec<StreamItem>> {
    let guard = store
        .lock()
        .map_err(|_| HiveError::Locked("store mutex poisoned".into()))?;
    let events = guard.read_events(&EventFilter {
        project_key: Some(project_key.to_string()),
        after_sequence: Some(after),
        limit: Some(limit),
        ..Default::default()
    })?;
    Ok(events
        .into_iter()
        .map(|event| StreamItem {
            offset: event.sequence,
            timestamp: event.timestamp,
            data: json!({
                "id": event.id,
                "type": event.event_type,
                "project_key": event.project_key,
                "data": event.data,
            }),
        })
        .collect())
}

async fn stream_handler(
    Path(project_key): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    if *state.shutdown.borrow() {
        return error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            &HiveError::Locked("server is stopping".into()),
        );
    }

    let offset: i64 = parse_param(&params, "offset", 0);
    let live = params.get("live").map(String::as_str) == Some("true");

    if !live {
        let limit: usize = parse_param(&params, "limit", DEFAULT_PAGE_LIMIT);
        return match read_page(&state.store, &project_key, offset, limit) {
            Ok(items) => Json(items).into_response(),
            Err(err) => error_body(StatusCode::INTERNAL_SERVER_ERROR, &err),
        };
    }

    let stream = tail_stream(state, project_key, offset);
    let sse = Sse::new(stream);
    ([(header::CACHE_CONTROL, "no-cache")], sse).into_response()
}

/// Registry entry that cleans itself up when the client disconnects (the
/// stream is dropped) or the server stops.
struct SubscriptionGuard {
    id: u64,
    subscriptions: SubscriptionMap,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Ok(mut map) = self.subscriptions.lock() {
            map.remove(&self.id);
        }
    }
}

struct TailState {
    store: Arc<Mutex<HiveStore>>,
    shutdown: watch::Receiver<bool>,
    project_key: String,
    last_offset: i64,
    queue: std::collections::VecDeque<StreamItem>,
    poll: Duration,
    _guard: SubscriptionGuard,
}

fn tail_stream(
    state: AppState,
    project_key: String,
    offset: i64,
) -> impl Stream<Item = std::result::Result<SseEvent, std::convert::Infallible>> {
    let id = state.next_subscription.fetch_add(1, Ordering::Relaxed);
    if let Ok(mut map) = state.subscriptions.lock() {
        map.insert(id, (project_key.clone(), offset));
    }
    let tail = TailState {
        store: state.store,
        shutdown: state.shutdown,
        project_key,
        last_offset: offset,
        queue: std::collections::VecDeque::new(),
        poll: state.poll,
        _guard: SubscriptionGuard {
            id,
            subscriptions: state.subscriptions,
        },
    };

    futures::stream::unfold(tail, |mut tail| async move {
        loop {
            if *tail.shutdown.borrow() {
                return None;
            }
            if let Some(item) = tail.queue.pop_front() {
                let frame = match serde_json::to_string(&item) {
                    Ok(json) => SseEvent::default().data(json),
                    Err(err) => {
                        tracing::error!(error = %err, "unserializable stream item");
                        continue;
                    }
                };
                return Some((Ok(frame), tail));
            }

            match read_page(&tail.store, &tail.project_key, tail.last_offset, TAIL_BATCH) {
                Ok(items) if !items.is_empty() => {
                    tail.last_offset = items.last().map(|i| i.offset).unwrap_or(tail.last_offset);
                    tail.queue.extend(items);
                }
                Ok(_) => {
                    let mut shutdown = tail.shutdown.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(tail.poll) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "tail read failed; retrying after poll");
                    tokio::time::sleep(tail.poll).await;
                }
            }
        }
    })
}
