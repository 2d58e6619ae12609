//! Application service HTTP endpoint.
//!
//! The homeserver pushes room events to the bridge in transactions:
//!
//! ```text
//! PUT /_matrix/app/v1/transactions/{txn_id}?access_token={hs_token}
//! { "events": [ ... ] }
//! ```
//!
//! Every event that decodes is queued for the event processor. Transactions
//! are retried by the homeserver until acknowledged, so transaction IDs that
//! were already accepted are acknowledged again without re-queuing.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::config::AppServiceSettings;
use crate::error::BridgeError;
use crate::event_processor::EventSender;
use crate::handler::MatrixEvent;

/// How many accepted transaction IDs are remembered for deduplication.
const SEEN_TXN_CAPACITY: usize = 1024;

// ── Shared State ─────────────────────────────────────────────────────────────

/// Transaction IDs already accepted, oldest first.
#[derive(Default)]
struct SeenTransactions {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenTransactions {
    fn contains(&self, txn_id: &str) -> bool {
        self.ids.contains(txn_id)
    }

    /// Record `txn_id`. Returns false if it was already seen.
    fn insert(&mut self, txn_id: &str) -> bool {
        if self.ids.contains(txn_id) {
            return false;
        }
        if self.order.len() == SEEN_TXN_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(txn_id.to_string());
        self.ids.insert(txn_id.to_string());
        true
    }
}

#[derive(Clone)]
pub struct AppServiceState {
    hs_token: Arc<str>,
    events: EventSender,
    seen: Arc<Mutex<SeenTransactions>>,
}

impl AppServiceState {
    pub fn new(hs_token: &str, events: EventSender) -> Self {
        Self {
            hs_token: Arc::from(hs_token),
            events,
            seen: Arc::new(Mutex::new(SeenTransactions::default())),
        }
    }
}

/// Build the application service router.
pub fn router(state: AppServiceState) -> Router {
    Router::new()
        .route("/transactions/:txn_id", put(transaction_handler))
        .route("/_matrix/app/v1/transactions/:txn_id", put(transaction_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Route Handlers ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AuthQuery {
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Transaction {
    #[serde(default)]
    events: Vec<Value>,
}

fn error_response(status: StatusCode, errcode: &str, message: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "errcode": errcode, "error": message })))
}

fn request_token(query: &AuthQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = &query.access_token {
        return Some(token.clone());
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn transaction_handler(
    State(state): State<AppServiceState>,
    Path(txn_id): Path<String>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    Json(txn): Json<Transaction>,
) -> impl IntoResponse {
    match request_token(&query, &headers) {
        None => {
            return error_response(
                StatusCode::UNAUTHORIZED,
                "M_MISSING_TOKEN",
                "Missing access token",
            )
        }
        Some(token) if token != *state.hs_token => {
            return error_response(StatusCode::FORBIDDEN, "M_FORBIDDEN", "Invalid access token")
        }
        Some(_) => {}
    }

    if state.seen.lock().contains(&txn_id) {
        tracing::debug!(txn_id = txn_id.as_str(), "Ignoring repeated transaction");
        return (StatusCode::OK, Json(json!({})));
    }

    let mut queued = 0usize;
    for raw in txn.events {
        let event = match serde_json::from_value::<MatrixEvent>(raw) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(txn_id = txn_id.as_str(), error = %e, "Skipping malformed event");
                continue;
            }
        };
        if state.events.send(event).is_err() {
            // Not acknowledged, so the homeserver retries the transaction.
            tracing::warn!(txn_id = txn_id.as_str(), "Event queue closed, rejecting transaction");
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "M_UNKNOWN",
                "Event queue is not accepting events",
            );
        }
        queued += 1;
    }
    state.seen.lock().insert(&txn_id);
    tracing::debug!(txn_id = txn_id.as_str(), queued, "Accepted transaction");

    (StatusCode::OK, Json(json!({})))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "wa-bridge",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

// ── Server ───────────────────────────────────────────────────────────────────

struct Server {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<std::io::Result<()>>,
    local_addr: SocketAddr,
}

/// The HTTP server owned by the supervisor.
pub struct AppService {
    settings: AppServiceSettings,
    events: EventSender,
    server: Option<Server>,
}

impl AppService {
    pub fn new(settings: AppServiceSettings, events: EventSender) -> Self {
        Self {
            settings,
            events,
            server: None,
        }
    }

    /// Bind the listener and spawn the server task.
    pub async fn start(&mut self) -> Result<SocketAddr, BridgeError> {
        let addr = self.settings.bind_addr.clone();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|source| BridgeError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| BridgeError::Bind {
            addr: addr.clone(),
            source,
        })?;

        let app = router(AppServiceState::new(
            &self.settings.hs_token,
            self.events.clone(),
        ));
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        tracing::info!(addr = %local_addr, "Application service listening");
        self.server = Some(Server {
            shutdown_tx,
            handle,
            local_addr,
        });
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.local_addr)
    }

    /// Stop accepting requests and wait for in-flight ones to finish.
    pub async fn stop(&mut self) -> Result<(), BridgeError> {
        let Server {
            shutdown_tx,
            handle,
            ..
        } = self
            .server
            .take()
            .ok_or(BridgeError::NotRunning("application service"))?;
        let _ = shutdown_tx.send(());
        match handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BridgeError::Serve(e)),
            Err(_) => Err(BridgeError::TaskJoin {
                task: "application service",
            }),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
