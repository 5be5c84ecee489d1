//! Async client for a sidecar's HTTP API: service invocation and key/value
//! state management.
//!
//! # Overview
//! `DaprClient` validates arguments, builds plain-data `HttpRequest`s and
//! executes them through a `Transport` that shares one `ConnectionPool`
//! with every other client in the process.
//!
//! # Design
//! - `ClientOptions` is validated once at construction and immutable after.
//! - `build_*` methods are synchronous and network-free, so request shapes
//!   are testable without a sidecar.
//! - Connectivity failures, including a pool that stays saturated until the
//!   request deadline, become `Error::BackendUnavailable` when fail-fast is
//!   enabled and are passed through raw otherwise. Non-2xx answers are
//!   always `Error::Status`.
//! - The pool bounds concurrent requests and periodically recycles its
//!   connections so that clients follow sidecar replicas that move.

pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod options;
pub mod pool;
pub mod transport;
pub mod types;
mod wire;

pub use client::DaprClient;
pub use config::SidecarConfig;
pub use error::{Error, Result, Unreachable};
pub use http::{HttpMethod, HttpRequest, HttpResponse};
pub use options::ClientOptions;
pub use pool::{ConnectionPool, PoolConfig};
pub use transport::Transport;
pub use types::{
    BulkItemError, BulkStateItem, Concurrency, Consistency, OperationKind, StateItem, StateOptions,
    TransactionOperation, UnknownMode,
};
