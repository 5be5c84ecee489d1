//! Error types for the sidecar client.
//!
//! # Design
//! Configuration and validation failures are raised before any I/O. Failures
//! to reach the sidecar are normalised once, in the transport: with fail-fast
//! enabled they become `BackendUnavailable` carrying a remediation hint,
//! otherwise the raw `reqwest` error is returned as `Transport`. A non-2xx
//! answer from the sidecar is always `Status`, whatever the fail-fast policy.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Errors returned by `DaprClient` and its building blocks.
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration value (endpoint, timeout, env override) is malformed.
    #[error("invalid configuration value `{value}`: {reason}")]
    Configuration { value: String, reason: String },

    /// A caller-supplied identifier or argument is empty or otherwise invalid.
    #[error("invalid argument `{parameter}`: {reason}")]
    Validation {
        parameter: &'static str,
        reason: String,
    },

    /// The sidecar could not be reached (connect failure or timeout) while
    /// fail-fast is enabled.
    #[error("{hint}")]
    BackendUnavailable {
        hint: String,
        #[source]
        source: Unreachable,
    },

    /// Raw connectivity error, surfaced unchanged because fail-fast is off.
    #[error(transparent)]
    Transport(reqwest::Error),

    /// No pool permit became free before the request deadline, with
    /// fail-fast off.
    #[error("no pooled connection became available within {waited:?}")]
    PoolTimeout { waited: Duration },

    /// The sidecar answered with a non-2xx status.
    #[error("sidecar returned {status}: {body}")]
    Status {
        status: StatusCode,
        body: String,
        #[source]
        source: reqwest::Error,
    },

    /// The request payload could not be serialized to JSON.
    #[error("failed to serialize request payload")]
    Serialization(#[source] serde_json::Error),

    /// The response body could not be deserialized into the expected type.
    #[error("failed to deserialize response body")]
    Deserialization(#[source] serde_json::Error),

    /// The connection pool was closed by the application.
    #[error("connection pool has been closed")]
    PoolClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Why the sidecar was considered unreachable.
#[derive(Debug, Error)]
pub enum Unreachable {
    /// Connect, send or response timeout reported by the HTTP client.
    #[error(transparent)]
    Request(#[from] reqwest::Error),

    /// Every pool permit stayed busy until the request deadline.
    #[error("no pooled connection became available within {0:?}")]
    PoolExhausted(Duration),
}

impl Unreachable {
    pub fn is_connect(&self) -> bool {
        matches!(self, Unreachable::Request(e) if e.is_connect())
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Unreachable::Request(e) => e.is_timeout(),
            Unreachable::PoolExhausted(_) => true,
        }
    }
}

impl Error {
    pub(crate) fn validation(parameter: &'static str, reason: impl Into<String>) -> Self {
        Error::Validation {
            parameter,
            reason: reason.into(),
        }
    }

    pub(crate) fn configuration(value: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Configuration {
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// HTTP status reported by the sidecar, if this is a `Status` error.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Error::BackendUnavailable { .. })
    }
}
