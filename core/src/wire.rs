//! JSON shapes exchanged with the sidecar's state API.
//!
//! Optional fields are skipped rather than sent as `null`: an absent
//! `options` object keeps the store's default concurrency and consistency.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{BulkItemError, BulkStateItem, StateOptions, TransactionOperation};

/// Metadata key carrying a value's time to live.
pub const TTL_METADATA_KEY: &str = "ttlInSeconds";

#[derive(Debug, Serialize)]
pub(crate) struct WireStateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    concurrency: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    consistency: Option<&'static str>,
}

impl WireStateOptions {
    fn from_options(options: &StateOptions) -> Option<Self> {
        if options.concurrency.is_none() && options.consistency.is_none() {
            return None;
        }
        Some(Self {
            concurrency: options.concurrency.map(|c| c.as_str()),
            consistency: options.consistency.map(|c| c.as_str()),
        })
    }
}

/// One element of the array POSTed to `/v1.0/state/{store}`.
#[derive(Debug, Serialize)]
pub(crate) struct SaveStateRequest<'a, V> {
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a V>,
    #[serde(skip_serializing_if = "Option::is_none")]
    etag: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<WireStateOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<BTreeMap<&'static str, String>>,
}

impl<'a, V> SaveStateRequest<'a, V> {
    /// `etag` takes precedence over `options.etag`.
    pub(crate) fn new(
        key: &'a str,
        value: &'a V,
        etag: Option<&'a str>,
        options: Option<&'a StateOptions>,
    ) -> Self {
        let etag = etag.or_else(|| options.and_then(|o| o.etag.as_deref()));
        let metadata = options
            .and_then(|o| o.ttl_seconds)
            .map(|ttl| BTreeMap::from([(TTL_METADATA_KEY, ttl.to_string())]));
        Self {
            key,
            value: Some(value),
            etag,
            options: options.and_then(WireStateOptions::from_options),
            metadata,
        }
    }
}

impl<'a> SaveStateRequest<'a, ()> {
    /// Element without a value, used to remove keys in bulk.
    pub(crate) fn key_only(key: &'a str) -> Self {
        Self {
            key,
            value: None,
            etag: None,
            options: None,
            metadata: None,
        }
    }
}

/// Body of `POST /v1.0/state/{store}/bulk`.
#[derive(Debug, Serialize)]
pub(crate) struct BulkGetRequest<'a> {
    pub keys: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<u32>,
}

/// One element of the bulk get response. `data` is kept as untyped JSON
/// because each key may hold a different shape; `into_typed` performs the
/// second decode into the caller's type.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct BulkGetResponseItem {
    pub key: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl BulkGetResponseItem {
    /// Decode `data` into `T`. A per-key store error or a value that does not
    /// fit `T` is reported through `error`, never as a failure of the call.
    pub(crate) fn into_typed<T: DeserializeOwned>(self) -> BulkStateItem<T> {
        let store_error = self.error.filter(|e| !e.is_empty());
        let (value, error) = match (store_error, self.data) {
            (Some(error), _) => (None, Some(BulkItemError::Store(error))),
            (None, None) | (None, Some(serde_json::Value::Null)) => (None, None),
            (None, Some(data)) => match serde_json::from_value(data) {
                Ok(value) => (Some(value), None),
                Err(e) => (None, Some(BulkItemError::Decode(e.to_string()))),
            },
        };
        BulkStateItem {
            key: self.key,
            value,
            etag: self.etag,
            error,
        }
    }
}

/// Body of `POST /v1.0/state/{store}/transaction`.
#[derive(Debug, Serialize)]
pub(crate) struct TransactionRequest<'a, V> {
    operations: Vec<TransactionOperationWire<'a, V>>,
}

#[derive(Debug, Serialize)]
struct TransactionOperationWire<'a, V> {
    operation: &'static str,
    request: TransactionOperationRequest<'a, V>,
}

#[derive(Debug, Serialize)]
struct TransactionOperationRequest<'a, V> {
    key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a V>,
    #[serde(skip_serializing_if = "Option::is_none")]
    etag: Option<&'a str>,
}

impl<'a, V> TransactionRequest<'a, V> {
    /// Keeps the caller's operation order.
    pub(crate) fn new(operations: &'a [TransactionOperation<V>]) -> Self {
        Self {
            operations: operations
                .iter()
                .map(|op| TransactionOperationWire {
                    operation: op.kind().as_str(),
                    request: TransactionOperationRequest {
                        key: op.key(),
                        value: op.value(),
                        etag: op.etag(),
                    },
                })
                .collect(),
        }
    }
}
