//! Value types accepted and returned by the state API.
//!
//! These are built per call and never retained by the client. Their mapping
//! onto the sidecar wire format lives in `crate::wire`.

use std::fmt;
use std::str::FromStr;

/// Concurrency mode for a state write or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Concurrency {
    /// Reject the write unless the supplied etag matches (or, with no etag,
    /// unless the key does not exist yet).
    FirstWrite,
    /// The last write wins.
    LastWrite,
}

impl Concurrency {
    pub const ALL: [Concurrency; 2] = [Concurrency::FirstWrite, Concurrency::LastWrite];

    /// Wire name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Concurrency::FirstWrite => "first-write",
            Concurrency::LastWrite => "last-write",
        }
    }
}

/// Consistency mode for state reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Consistency {
    Strong,
    Eventual,
}

impl Consistency {
    pub const ALL: [Consistency; 2] = [Consistency::Strong, Consistency::Eventual];

    /// Wire name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Consistency::Strong => "strong",
            Consistency::Eventual => "eventual",
        }
    }
}

/// Error returned when parsing an unknown concurrency or consistency name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown mode `{0}`")]
pub struct UnknownMode(pub String);

impl FromStr for Concurrency {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| UnknownMode(s.to_string()))
    }
}

impl FromStr for Consistency {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| UnknownMode(s.to_string()))
    }
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call options for state writes and deletes.
///
/// When neither `concurrency` nor `consistency` is set the request carries
/// no `options` object, leaving the store's defaults in charge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateOptions {
    pub concurrency: Option<Concurrency>,
    pub consistency: Option<Consistency>,
    pub etag: Option<String>,
    /// Time to live of the written value. Must be positive.
    pub ttl_seconds: Option<u32>,
}

impl StateOptions {
    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = Some(consistency);
        self
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_ttl_seconds(mut self, ttl_seconds: u32) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }
}

/// One key/value pair of a state save.
#[derive(Debug, Clone, PartialEq)]
pub struct StateItem<V> {
    pub key: String,
    pub value: V,
    pub etag: Option<String>,
    pub options: Option<StateOptions>,
}

impl<V> StateItem<V> {
    pub fn new(key: impl Into<String>, value: V) -> Self {
        Self {
            key: key.into(),
            value,
            etag: None,
            options: None,
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_options(mut self, options: StateOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Kind of a transactional state operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Upsert,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Upsert => "upsert",
            OperationKind::Delete => "delete",
        }
    }
}

/// One step of a state transaction. An upsert always carries a value and a
/// delete never does.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionOperation<V = serde_json::Value> {
    kind: OperationKind,
    key: String,
    value: Option<V>,
    etag: Option<String>,
}

impl<V> TransactionOperation<V> {
    pub fn upsert(key: impl Into<String>, value: V) -> Self {
        Self {
            kind: OperationKind::Upsert,
            key: key.into(),
            value: Some(value),
            etag: None,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            kind: OperationKind::Delete,
            key: key.into(),
            value: None,
            etag: None,
        }
    }

    pub fn with_etag(mut self, etag: impl Into<String>) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }
}

/// Why one key of a bulk get carries no value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BulkItemError {
    /// The store reported a failure reading this key.
    #[error("{0}")]
    Store(String),
    /// The store returned a value that does not decode into the requested type.
    #[error("failed to decode value: {0}")]
    Decode(String),
}

/// One entry of a bulk get. Keys that could not be read or decoded come back
/// with `error` set instead of failing the whole call.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkStateItem<T> {
    pub key: String,
    pub value: Option<T>,
    pub etag: Option<String>,
    pub error: Option<BulkItemError>,
}

impl<T> BulkStateItem<T> {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_decode_error(&self) -> bool {
        matches!(self.error, Some(BulkItemError::Decode(_)))
    }
}
