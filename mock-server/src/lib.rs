//! In-memory sidecar speaking the `/v1.0` invoke and state HTTP routes.
//!
//! Besides the happy paths it has a few switches for exercising client
//! error handling:
//! - app id `slow` answers after `SLOW_DELAY`,
//! - method `empty` answers `204 No Content`,
//! - store `no-transactions` rejects transactions with a 500,
//! - bulk reads of keys starting with `fail-` report a per-key error,
//! - `Sidecar::with_api_token` requires the `dapr-api-token` header.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    extract::{Path, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::RwLock};
use tracing::debug;
use uuid::Uuid;

pub const API_TOKEN_HEADER: &str = "dapr-api-token";
pub const SLOW_APP_ID: &str = "slow";
pub const SLOW_DELAY: Duration = Duration::from_millis(500);
pub const EMPTY_METHOD: &str = "empty";
pub const NON_TRANSACTIONAL_STORE: &str = "no-transactions";
pub const FAILING_KEY_PREFIX: &str = "fail-";

/// A stored value with its current etag.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
    pub value: Value,
    pub etag: String,
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WriteOptions {
    pub concurrency: Option<String>,
    pub consistency: Option<String>,
}

/// One element of a save request, also used as the request of a
/// transactional operation.
#[derive(Debug, Deserialize)]
pub struct SaveRequest {
    pub key: String,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub options: Option<WriteOptions>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SaveRequest {
    fn first_write(&self) -> bool {
        self.options
            .as_ref()
            .and_then(|o| o.concurrency.as_deref())
            == Some("first-write")
    }
}

#[derive(Debug, Deserialize)]
pub struct BulkGetRequest {
    pub keys: Vec<String>,
    #[serde(default)]
    pub parallelism: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkGetItem {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransactionOperation {
    pub operation: String,
    pub request: SaveRequest,
}

#[derive(Debug, Deserialize)]
pub struct TransactionRequest {
    pub operations: Vec<TransactionOperation>,
}

pub type Stores = HashMap<String, HashMap<String, Entry>>;

#[derive(Default)]
struct Inner {
    stores: RwLock<Stores>,
    last_payload: RwLock<Option<Value>>,
    requests: AtomicUsize,
    api_token: Option<String>,
}

/// Handle to the mock sidecar's state. Clones share the same stores.
#[derive(Clone, Default)]
pub struct Sidecar {
    inner: Arc<Inner>,
}

impl Sidecar {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sidecar that answers 401 unless `dapr-api-token` equals `token`.
    pub fn with_api_token(token: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                api_token: Some(token.into()),
                ..Default::default()
            }),
        }
    }

    /// Number of HTTP requests received so far, including rejected ones.
    pub fn request_count(&self) -> usize {
        self.inner.requests.load(Ordering::SeqCst)
    }

    /// JSON body of the most recent state write, bulk read or transaction.
    pub async fn last_payload(&self) -> Option<Value> {
        self.inner.last_payload.read().await.clone()
    }

    pub async fn entry(&self, store: &str, key: &str) -> Option<Entry> {
        let stores = self.inner.stores.read().await;
        stores.get(store).and_then(|s| s.get(key)).cloned()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/v1.0/healthz", get(healthz))
            .route(
                "/v1.0/invoke/{app_id}/method/{*method}",
                get(invoke).post(invoke),
            )
            .route("/v1.0/state/{store}", post(save_state))
            .route("/v1.0/state/{store}/bulk", post(get_bulk_state))
            .route("/v1.0/state/{store}/transaction", post(execute_transaction))
            .route(
                "/v1.0/state/{store}/{key}",
                get(get_state).delete(delete_state),
            )
            .layer(middleware::from_fn_with_state(self.clone(), track))
            .with_state(self.clone())
    }

    pub async fn serve(self, listener: TcpListener) -> Result<(), std::io::Error> {
        axum::serve(listener, self.router()).await
    }

    async fn record(&self, payload: &Value) {
        *self.inner.last_payload.write().await = Some(payload.clone());
    }
}

pub fn app() -> Router {
    Sidecar::new().router()
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    Sidecar::new().serve(listener).await
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({"errorCode": code, "message": message.into()})),
    )
        .into_response()
}

fn etag_conflict(key: &str) -> Response {
    error_response(
        StatusCode::CONFLICT,
        "ERR_STATE_SAVE",
        format!("possible etag mismatch for key {key}"),
    )
}

async fn track(State(sidecar): State<Sidecar>, request: Request, next: Next) -> Response {
    sidecar.inner.requests.fetch_add(1, Ordering::SeqCst);
    debug!("{} {}", request.method(), request.uri());

    if let Some(expected) = &sidecar.inner.api_token {
        let provided = request
            .headers()
            .get(API_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        if provided != Some(expected.as_str()) {
            return error_response(
                StatusCode::UNAUTHORIZED,
                "ERR_UNAUTHORIZED",
                "missing or invalid api token",
            );
        }
    }
    next.run(request).await
}

async fn healthz() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn invoke(
    Path((app_id, method_name)): Path<(String, String)>,
    method: Method,
    body: String,
) -> Response {
    if app_id == SLOW_APP_ID {
        tokio::time::sleep(SLOW_DELAY).await;
    }
    if method_name == EMPTY_METHOD {
        return StatusCode::NO_CONTENT.into_response();
    }
    let body = if body.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&body).unwrap_or(Value::String(body))
    };
    Json(json!({
        "appId": app_id,
        "method": method_name,
        "httpVerb": method.as_str(),
        "body": body,
    }))
    .into_response()
}

/// Reject a write whose etag does not match, or a first-write to an
/// existing key without an etag.
fn check_write(
    store: &HashMap<String, Entry>,
    key: &str,
    etag: Option<&str>,
    first_write: bool,
) -> Result<(), Response> {
    match (etag, store.get(key)) {
        (Some(expected), Some(entry)) if entry.etag == expected => Ok(()),
        (Some(_), _) => Err(etag_conflict(key)),
        (None, Some(_)) if first_write => Err(etag_conflict(key)),
        (None, _) => Ok(()),
    }
}

fn apply_save(store: &mut HashMap<String, Entry>, item: SaveRequest) {
    match item.value {
        Some(value) => {
            let ttl_seconds = item
                .metadata
                .get("ttlInSeconds")
                .and_then(|ttl| ttl.parse().ok());
            store.insert(
                item.key,
                Entry {
                    value,
                    etag: Uuid::new_v4().to_string(),
                    ttl_seconds,
                },
            );
        }
        None => {
            store.remove(&item.key);
        }
    }
}

async fn save_state(
    State(sidecar): State<Sidecar>,
    Path(store_name): Path<String>,
    Json(payload): Json<Value>,
) -> Response {
    sidecar.record(&payload).await;
    let items: Vec<SaveRequest> = match serde_json::from_value(payload) {
        Ok(items) => items,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "ERR_MALFORMED_REQUEST", e.to_string()),
    };

    let mut stores = sidecar.inner.stores.write().await;
    let store = stores.entry(store_name).or_default();
    for item in &items {
        if let Err(conflict) = check_write(store, &item.key, item.etag.as_deref(), item.first_write()) {
            return conflict;
        }
    }
    for item in items {
        apply_save(store, item);
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn get_state(
    State(sidecar): State<Sidecar>,
    Path((store_name, key)): Path<(String, String)>,
) -> Response {
    match sidecar.entry(&store_name, &key).await {
        Some(entry) => (
            StatusCode::OK,
            [(header::ETAG, entry.etag)],
            Json(entry.value),
        )
            .into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn delete_state(
    State(sidecar): State<Sidecar>,
    Path((store_name, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let if_match = headers
        .get(header::IF_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_matches('"').to_string());

    let mut stores = sidecar.inner.stores.write().await;
    let store = stores.entry(store_name).or_default();
    if let Err(conflict) = check_write(store, &key, if_match.as_deref(), false) {
        return conflict;
    }
    store.remove(&key);
    StatusCode::NO_CONTENT.into_response()
}

async fn get_bulk_state(
    State(sidecar): State<Sidecar>,
    Path(store_name): Path<String>,
    Json(payload): Json<Value>,
) -> Response {
    sidecar.record(&payload).await;
    let request: BulkGetRequest = match serde_json::from_value(payload) {
        Ok(request) => request,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "ERR_MALFORMED_REQUEST", e.to_string()),
    };

    let stores = sidecar.inner.stores.read().await;
    let store = stores.get(&store_name);
    let items: Vec<BulkGetItem> = request
        .keys
        .into_iter()
        .map(|key| {
            if key.starts_with(FAILING_KEY_PREFIX) {
                return BulkGetItem {
                    error: Some(format!("simulated failure reading key {key}")),
                    key,
                    data: None,
                    etag: None,
                };
            }
            let entry = store.and_then(|s| s.get(&key));
            BulkGetItem {
                data: entry.map(|e| e.value.clone()),
                etag: entry.map(|e| e.etag.clone()),
                error: None,
                key,
            }
        })
        .collect();
    Json(items).into_response()
}

async fn execute_transaction(
    State(sidecar): State<Sidecar>,
    Path(store_name): Path<String>,
    Json(payload): Json<Value>,
) -> Response {
    sidecar.record(&payload).await;
    if store_name == NON_TRANSACTIONAL_STORE {
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERR_STATE_STORE_NOT_SUPPORTED",
            format!("state store {store_name} doesn't support transactions"),
        );
    }
    let request: TransactionRequest = match serde_json::from_value(payload) {
        Ok(request) => request,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, "ERR_MALFORMED_REQUEST", e.to_string()),
    };

    let mut stores = sidecar.inner.stores.write().await;
    let store = stores.entry(store_name).or_default();
    for op in &request.operations {
        if op.operation != "upsert" && op.operation != "delete" {
            return error_response(
                StatusCode::BAD_REQUEST,
                "ERR_NOT_SUPPORTED_STATE_OPERATION",
                format!("operation type {} not supported", op.operation),
            );
        }
        if let Err(conflict) = check_write(store, &op.request.key, op.request.etag.as_deref(), false) {
            return conflict;
        }
    }
    for op in request.operations {
        if op.operation == "delete" {
            store.remove(&op.request.key);
        } else {
            apply_save(store, op.request);
        }
    }
    StatusCode::NO_CONTENT.into_response()
}
