//! Typed client for the sidecar's service invocation and state APIs.
//!
//! # Design
//! Every operation is split in two: a synchronous `build_*` method that
//! validates its arguments and produces the `HttpRequest` it would send,
//! and an async method that executes it through the `Transport` and decodes
//! the response. Validation never touches the network, so a blank store
//! name or key fails immediately without a round trip.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::config::SidecarConfig;
use crate::error::{Error, Result};
use crate::http::{HttpMethod, HttpRequest, HttpResponse};
use crate::options::ClientOptions;
use crate::pool::ConnectionPool;
use crate::transport::Transport;
use crate::types::{BulkStateItem, Consistency, StateItem, StateOptions, TransactionOperation};
use crate::wire::{BulkGetRequest, BulkGetResponseItem, SaveStateRequest, TransactionRequest};

/// Client for a single sidecar endpoint.
///
/// Cheap to clone. Clones share the same options and the same connection
/// pool; dropping a client never closes the pool.
#[derive(Debug, Clone)]
pub struct DaprClient {
    transport: Transport,
}

impl DaprClient {
    /// Create a client that uses the process-wide shared connection pool.
    pub fn new(options: ClientOptions) -> Result<Self> {
        Ok(Self::with_pool(options, ConnectionPool::shared()?))
    }

    /// Create a client on an explicitly provided pool.
    pub fn with_pool(options: ClientOptions, pool: ConnectionPool) -> Self {
        debug!("Creating sidecar client for {}", options.endpoint());
        Self {
            transport: Transport::new(options, pool),
        }
    }

    /// Create a client from the `DAPR_*` environment variables and defaults.
    pub fn from_env() -> Result<Self> {
        Self::new(SidecarConfig::default().resolve()?)
    }

    pub fn options(&self) -> &ClientOptions {
        self.transport.options()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    // -----------------------------------------------------------------------
    // Service invocation
    // -----------------------------------------------------------------------

    /// Build the request for `invoke_method`: POST when a body is given,
    /// GET otherwise. `method_name` may contain `/`-separated segments.
    pub fn build_invoke_method<Req: Serialize + ?Sized>(
        &self,
        app_id: &str,
        method_name: &str,
        request: Option<&Req>,
    ) -> Result<HttpRequest> {
        require("app_id", app_id)?;
        require("method_name", method_name)?;

        let mut segments = vec!["invoke", app_id, "method"];
        segments.extend(method_name.trim_matches('/').split('/'));
        let path = self.transport.url(&segments[..]);

        match request {
            Some(body) => HttpRequest::new(HttpMethod::Post, path).with_json_body(body),
            None => Ok(HttpRequest::new(HttpMethod::Get, path)),
        }
    }

    /// Invoke `method_name` on the application `app_id` and decode its JSON
    /// response. An empty response decodes to `Resp::default()`.
    pub async fn invoke_method<Req, Resp>(
        &self,
        app_id: &str,
        method_name: &str,
        request: Option<&Req>,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned + Default,
    {
        let request = self.build_invoke_method(app_id, method_name, request)?;
        self.transport.execute(&request).await?.json()
    }

    // -----------------------------------------------------------------------
    // Single-key state
    // -----------------------------------------------------------------------

    pub fn build_save_state<V: Serialize>(
        &self,
        store_name: &str,
        key: &str,
        value: &V,
        options: Option<&StateOptions>,
    ) -> Result<HttpRequest> {
        require("store_name", store_name)?;
        require("key", key)?;
        if let Some(options) = options {
            validate_options(options)?;
        }
        let body = [SaveStateRequest::new(key, value, None, options)];
        HttpRequest::new(HttpMethod::Post, self.transport.url(&["state", store_name]))
            .with_json_body(&body)
    }

    /// Save `value` under `key`.
    pub async fn save_state<V: Serialize>(
        &self,
        store_name: &str,
        key: &str,
        value: &V,
        options: Option<&StateOptions>,
    ) -> Result<()> {
        let request = self.build_save_state(store_name, key, value, options)?;
        self.transport.execute(&request).await.map(|_| ())
    }

    /// Like `save_state`, but an etag or first-write conflict returns
    /// `Ok(false)` instead of an error.
    pub async fn try_save_state<V: Serialize>(
        &self,
        store_name: &str,
        key: &str,
        value: &V,
        options: Option<&StateOptions>,
    ) -> Result<bool> {
        let request = self.build_save_state(store_name, key, value, options)?;
        conflict_as_false(self.transport.execute(&request).await)
    }

    pub fn build_get_state(
        &self,
        store_name: &str,
        key: &str,
        consistency: Option<Consistency>,
    ) -> Result<HttpRequest> {
        require("store_name", store_name)?;
        require("key", key)?;
        let mut request =
            HttpRequest::new(HttpMethod::Get, self.transport.url(&["state", store_name, key]));
        if let Some(consistency) = consistency {
            request
                .query
                .push(("consistency".to_string(), consistency.as_str().to_string()));
        }
        Ok(request)
    }

    /// Read the value under `key`. A missing key yields `T::default()`; use
    /// `Option<V>` as `T` to tell "missing" apart from a default value.
    pub async fn get_state<T: DeserializeOwned + Default>(
        &self,
        store_name: &str,
        key: &str,
        consistency: Option<Consistency>,
    ) -> Result<T> {
        self.get_state_and_etag(store_name, key, consistency)
            .await
            .map(|(value, _)| value)
    }

    /// Read the value under `key` together with its current etag.
    pub async fn get_state_and_etag<T: DeserializeOwned + Default>(
        &self,
        store_name: &str,
        key: &str,
        consistency: Option<Consistency>,
    ) -> Result<(T, Option<String>)> {
        let request = self.build_get_state(store_name, key, consistency)?;
        let response = self.transport.execute(&request).await?;
        Ok((response.json()?, response.etag()))
    }

    /// Build the delete request. Modes go in the query string, the etag in
    /// an `If-Match` header.
    pub fn build_delete_state(
        &self,
        store_name: &str,
        key: &str,
        options: Option<&StateOptions>,
    ) -> Result<HttpRequest> {
        require("store_name", store_name)?;
        require("key", key)?;
        let mut request =
            HttpRequest::new(HttpMethod::Delete, self.transport.url(&["state", store_name, key]));
        if let Some(options) = options {
            if let Some(concurrency) = options.concurrency {
                request
                    .query
                    .push(("concurrency".to_string(), concurrency.as_str().to_string()));
            }
            if let Some(consistency) = options.consistency {
                request
                    .query
                    .push(("consistency".to_string(), consistency.as_str().to_string()));
            }
            if let Some(etag) = &options.etag {
                request.headers.push(("If-Match".to_string(), etag.clone()));
            }
        }
        Ok(request)
    }

    pub async fn delete_state(
        &self,
        store_name: &str,
        key: &str,
        options: Option<&StateOptions>,
    ) -> Result<()> {
        let request = self.build_delete_state(store_name, key, options)?;
        self.transport.execute(&request).await.map(|_| ())
    }

    /// Like `delete_state`, but an etag conflict returns `Ok(false)`.
    pub async fn try_delete_state(
        &self,
        store_name: &str,
        key: &str,
        options: Option<&StateOptions>,
    ) -> Result<bool> {
        let request = self.build_delete_state(store_name, key, options)?;
        conflict_as_false(self.transport.execute(&request).await)
    }

    // -----------------------------------------------------------------------
    // Bulk state
    // -----------------------------------------------------------------------

    pub fn build_save_bulk_state<V: Serialize>(
        &self,
        store_name: &str,
        items: &[StateItem<V>],
    ) -> Result<HttpRequest> {
        require("store_name", store_name)?;
        if items.is_empty() {
            return Err(Error::validation("items", "must not be empty"));
        }
        for item in items {
            require("key", &item.key)?;
            if let Some(options) = &item.options {
                validate_options(options)?;
            }
        }
        let body: Vec<_> = items
            .iter()
            .map(|item| {
                SaveStateRequest::new(
                    &item.key,
                    &item.value,
                    item.etag.as_deref(),
                    item.options.as_ref(),
                )
            })
            .collect();
        HttpRequest::new(HttpMethod::Post, self.transport.url(&["state", store_name]))
            .with_json_body(&body)
    }

    /// Save several items in one request.
    pub async fn save_bulk_state<V: Serialize>(
        &self,
        store_name: &str,
        items: &[StateItem<V>],
    ) -> Result<()> {
        let request = self.build_save_bulk_state(store_name, items)?;
        self.transport.execute(&request).await.map(|_| ())
    }

    pub fn build_get_bulk_state<K: AsRef<str>>(
        &self,
        store_name: &str,
        keys: &[K],
        parallelism: Option<u32>,
    ) -> Result<HttpRequest> {
        require("store_name", store_name)?;
        let keys = require_keys(keys)?;
        if parallelism == Some(0) {
            return Err(Error::validation("parallelism", "must be greater than zero"));
        }
        let body = BulkGetRequest { keys, parallelism };
        HttpRequest::new(HttpMethod::Post, self.transport.url(&["state", store_name, "bulk"]))
            .with_json_body(&body)
    }

    /// Read several keys in one request.
    ///
    /// This is a partial-success operation: keys the store failed to read
    /// come back with `error` set. Each item's payload is decoded separately
    /// because the sidecar returns heterogeneous JSON per key.
    pub async fn get_bulk_state<K, T>(
        &self,
        store_name: &str,
        keys: &[K],
        parallelism: Option<u32>,
    ) -> Result<Vec<BulkStateItem<T>>>
    where
        K: AsRef<str>,
        T: DeserializeOwned,
    {
        let request = self.build_get_bulk_state(store_name, keys, parallelism)?;
        let response = self.transport.execute(&request).await?;
        self.parse_get_bulk_state(&response)
    }

    /// Decode a bulk-get response envelope, then each item on its own.
    pub fn parse_get_bulk_state<T: DeserializeOwned>(
        &self,
        response: &HttpResponse,
    ) -> Result<Vec<BulkStateItem<T>>> {
        let items: Vec<BulkGetResponseItem> = response.json()?;
        Ok(items.into_iter().map(BulkGetResponseItem::into_typed).collect())
    }

    pub fn build_delete_bulk_state<K: AsRef<str>>(
        &self,
        store_name: &str,
        keys: &[K],
    ) -> Result<HttpRequest> {
        require("store_name", store_name)?;
        let keys = require_keys(keys)?;
        let body: Vec<_> = keys.into_iter().map(SaveStateRequest::key_only).collect();
        HttpRequest::new(HttpMethod::Post, self.transport.url(&["state", store_name]))
            .with_json_body(&body)
    }

    /// Remove several keys in one request.
    pub async fn delete_bulk_state<K: AsRef<str>>(&self, store_name: &str, keys: &[K]) -> Result<()> {
        let request = self.build_delete_bulk_state(store_name, keys)?;
        self.transport.execute(&request).await.map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    pub fn build_execute_state_transaction<V: Serialize>(
        &self,
        store_name: &str,
        operations: &[TransactionOperation<V>],
    ) -> Result<HttpRequest> {
        require("store_name", store_name)?;
        if operations.is_empty() {
            return Err(Error::validation("operations", "must not be empty"));
        }
        for operation in operations {
            require("key", operation.key())?;
        }
        let body = TransactionRequest::new(operations);
        HttpRequest::new(
            HttpMethod::Post,
            self.transport.url(&["state", store_name, "transaction"]),
        )
        .with_json_body(&body)
    }

    /// Apply `operations` atomically, in order. Atomicity is provided by the
    /// store; a store without transaction support answers with an ordinary
    /// `Error::Status`.
    pub async fn execute_state_transaction<V: Serialize>(
        &self,
        store_name: &str,
        operations: &[TransactionOperation<V>],
    ) -> Result<()> {
        let request = self.build_execute_state_transaction(store_name, operations)?;
        self.transport.execute(&request).await.map(|_| ())
    }

    // -----------------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------------

    /// Succeeds when the sidecar reports itself healthy.
    pub async fn check_health(&self) -> Result<()> {
        self.transport.get(&["healthz"], Vec::new()).await.map(|_| ())
    }
}

/// Reject empty and whitespace-only identifiers.
fn require(parameter: &'static str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(parameter, "must not be empty or whitespace"));
    }
    Ok(())
}

fn require_keys<K: AsRef<str>>(keys: &[K]) -> Result<Vec<&str>> {
    if keys.is_empty() {
        return Err(Error::validation("keys", "must not be empty"));
    }
    keys.iter()
        .map(|key| {
            let key = key.as_ref();
            require("keys", key).map(|_| key)
        })
        .collect()
}

fn validate_options(options: &StateOptions) -> Result<()> {
    if options.ttl_seconds == Some(0) {
        return Err(Error::validation("ttl_seconds", "must be greater than zero"));
    }
    Ok(())
}

fn conflict_as_false(result: Result<HttpResponse>) -> Result<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(err) if err.status() == Some(reqwest::StatusCode::CONFLICT) => {
            debug!("State write rejected by concurrency check: {}", err);
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::types::{BulkItemError, Concurrency};
    use serde_json::{json, Value};

    fn client() -> DaprClient {
        DaprClient::with_pool(
            ClientOptions::new("http://localhost:3500").unwrap(),
            ConnectionPool::new(PoolConfig::default()).unwrap(),
        )
    }

    fn body(request: &HttpRequest) -> Value {
        serde_json::from_str(request.body.as_deref().unwrap()).unwrap()
    }

    fn assert_validation(result: Result<HttpRequest>, expected: &str) {
        match result {
            Err(Error::Validation { parameter, .. }) => assert_eq!(parameter, expected),
            other => panic!("expected validation error for {expected}, got {other:?}"),
        }
    }

    #[test]
    fn invoke_with_body_posts() {
        let req = client()
            .build_invoke_method("orders", "create", Some(&json!({"id": 1})))
            .unwrap();
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.path, "http://localhost:3500/v1.0/invoke/orders/method/create");
        assert_eq!(body(&req), json!({"id": 1}));
    }

    #[test]
    fn invoke_without_body_gets() {
        let req = client()
            .build_invoke_method::<()>("orders", "v2/list", None)
            .unwrap();
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(req.path, "http://localhost:3500/v1.0/invoke/orders/method/v2/list");
        assert!(req.body.is_none());
    }

    #[test]
    fn invoke_rejects_blank_identifiers() {
        let c = client();
        assert_validation(c.build_invoke_method::<()>("", "m", None), "app_id");
        assert_validation(c.build_invoke_method::<()>("app", "  ", None), "method_name");
    }

    #[test]
    fn save_state_with_all_options() {
        let options = StateOptions {
            concurrency: Some(Concurrency::FirstWrite),
            consistency: Some(Consistency::Strong),
            etag: Some("e1".to_string()),
            ttl_seconds: Some(60),
        };
        let req = client()
            .build_save_state("store", "k", &json!({"n": 1}), Some(&options))
            .unwrap();
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.path, "http://localhost:3500/v1.0/state/store");
        assert_eq!(
            body(&req),
            json!([{
                "key": "k",
                "value": {"n": 1},
                "etag": "e1",
                "options": {"concurrency": "first-write", "consistency": "strong"},
                "metadata": {"ttlInSeconds": "60"}
            }])
        );
    }

    #[test]
    fn save_state_without_options_is_minimal() {
        let req = client().build_save_state("store", "k", &"v", None).unwrap();
        assert_eq!(body(&req), json!([{"key": "k", "value": "v"}]));
    }

    #[test]
    fn save_state_rejects_zero_ttl() {
        let options = StateOptions::default().with_ttl_seconds(0);
        let result = client().build_save_state("store", "k", &1, Some(&options));
        assert_validation(result, "ttl_seconds");
    }

    #[test]
    fn state_operations_reject_blank_store_and_key() {
        let c = client();
        assert_validation(c.build_save_state("", "k", &1, None), "store_name");
        assert_validation(c.build_save_state("s", " \t", &1, None), "key");
        assert_validation(c.build_get_state(" ", "k", None), "store_name");
        assert_validation(c.build_get_state("s", "", None), "key");
        assert_validation(c.build_delete_state("", "k", None), "store_name");
        assert_validation(c.build_delete_state("s", "\n", None), "key");
    }

    #[test]
    fn get_state_consistency_query() {
        let req = client()
            .build_get_state("store", "k", Some(Consistency::Eventual))
            .unwrap();
        assert_eq!(req.method, HttpMethod::Get);
        assert_eq!(req.path, "http://localhost:3500/v1.0/state/store/k");
        assert_eq!(req.query_param("consistency"), Some("eventual"));

        let req = client().build_get_state("store", "k", None).unwrap();
        assert!(req.query.is_empty());
    }

    #[test]
    fn delete_state_maps_options() {
        let options = StateOptions::default()
            .with_concurrency(Concurrency::LastWrite)
            .with_consistency(Consistency::Strong)
            .with_etag("5");
        let req = client()
            .build_delete_state("store", "k", Some(&options))
            .unwrap();
        assert_eq!(req.method, HttpMethod::Delete);
        assert_eq!(req.query_param("concurrency"), Some("last-write"));
        assert_eq!(req.query_param("consistency"), Some("strong"));
        assert_eq!(req.header("if-match"), Some("5"));
        assert!(req.body.is_none());
    }

    #[test]
    fn save_bulk_state_one_element_per_item() {
        let items = vec![
            StateItem::new("a", json!(1)),
            StateItem::new("b", json!(2)).with_etag("3"),
        ];
        let req = client().build_save_bulk_state("store", &items).unwrap();
        assert_eq!(req.path, "http://localhost:3500/v1.0/state/store");
        assert_eq!(
            body(&req),
            json!([{"key": "a", "value": 1}, {"key": "b", "value": 2, "etag": "3"}])
        );
    }

    #[test]
    fn bulk_operations_reject_empty_input() {
        let c = client();
        let no_items: Vec<StateItem<i32>> = Vec::new();
        let no_keys: Vec<&str> = Vec::new();
        let no_ops: Vec<TransactionOperation> = Vec::new();
        assert_validation(c.build_save_bulk_state("s", &no_items), "items");
        assert_validation(c.build_get_bulk_state("s", &no_keys, None), "keys");
        assert_validation(c.build_delete_bulk_state("s", &no_keys), "keys");
        assert_validation(c.build_execute_state_transaction("s", &no_ops), "operations");
    }

    #[test]
    fn bulk_operations_reject_blank_keys() {
        let c = client();
        assert_validation(c.build_get_bulk_state("s", &["a", " "], None), "keys");
        assert_validation(c.build_delete_bulk_state("s", &["", "b"]), "keys");
        assert_validation(
            c.build_save_bulk_state("s", &[StateItem::new("", 1)]),
            "key",
        );
    }

    #[test]
    fn get_bulk_state_body() {
        let req = client()
            .build_get_bulk_state("store", &["a", "b"], Some(4))
            .unwrap();
        assert_eq!(req.path, "http://localhost:3500/v1.0/state/store/bulk");
        assert_eq!(body(&req), json!({"keys": ["a", "b"], "parallelism": 4}));

        let req = client()
            .build_get_bulk_state("store", &[String::from("a")], None)
            .unwrap();
        assert_eq!(body(&req), json!({"keys": ["a"]}));
    }

    #[test]
    fn delete_bulk_state_sends_keys_only() {
        let req = client().build_delete_bulk_state("store", &["a", "b"]).unwrap();
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(body(&req), json!([{"key": "a"}, {"key": "b"}]));
    }

    #[test]
    fn transaction_preserves_order() {
        let ops = vec![
            TransactionOperation::upsert("a", json!("v1")),
            TransactionOperation::delete("b"),
        ];
        let req = client()
            .build_execute_state_transaction("store", &ops)
            .unwrap();
        assert_eq!(req.path, "http://localhost:3500/v1.0/state/store/transaction");
        let body = body(&req);
        let operations = body["operations"].as_array().unwrap();
        assert_eq!(operations.len(), 2);
        assert_eq!(operations[0]["operation"], "upsert");
        assert_eq!(operations[0]["request"]["key"], "a");
        assert_eq!(operations[0]["request"]["value"], "v1");
        assert_eq!(operations[1]["operation"], "delete");
        assert_eq!(operations[1]["request"]["key"], "b");
    }

    #[test]
    fn parse_bulk_state_keeps_failed_items() {
        let response = HttpResponse {
            status: 200,
            headers: Vec::new(),
            body: r#"[
                {"key":"a","data":{"n":1},"etag":"1"},
                {"key":"b","error":"store unavailable"},
                {"key":"c","data":{"n":3},"etag":"4"}
            ]"#
            .to_string(),
        };
        let items: Vec<BulkStateItem<Value>> = client().parse_get_bulk_state(&response).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].value, Some(json!({"n": 1})));
        assert!(items[1].is_error());
        assert_eq!(
            items[1].error,
            Some(BulkItemError::Store("store unavailable".to_string()))
        );
        assert_eq!(items[2].etag.as_deref(), Some("4"));
    }

    #[test]
    fn parse_bulk_state_rejects_malformed_envelope() {
        let response = HttpResponse {
            status: 200,
            headers: Vec::new(),
            body: r#"{"not":"an array"}"#.to_string(),
        };
        let err = client().parse_get_bulk_state::<Value>(&response).unwrap_err();
        assert!(matches!(err, Error::Deserialization(_)));
    }

    #[test]
    fn keys_are_percent_encoded() {
        let req = client().build_get_state("store", "user/42", None).unwrap();
        assert_eq!(req.path, "http://localhost:3500/v1.0/state/store/user%2F42");
    }
}
