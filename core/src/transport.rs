//! Executes `HttpRequest`s against the sidecar through the shared pool.
//!
//! # Design
//! The transport is the only place that talks to `reqwest`. Connectivity
//! failures are classified in exactly one branch (`connectivity_error`):
//! with fail-fast enabled they become `Error::BackendUnavailable`, otherwise
//! the raw `reqwest::Error` is passed through. Status errors are produced by
//! `reqwest`'s own status check and are not affected by fail-fast.
//!
//! One deadline covers the whole call: waiting for a pool permit, sending
//! and reading the body. It is attached to each request, never to the
//! shared client. The response body is always read (or the response
//! dropped) before returning, and the pool permit is released when the
//! lease goes out of scope, on every path.

use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result, Unreachable};
use crate::http::{HttpMethod, HttpRequest, HttpResponse};
use crate::options::ClientOptions;
use crate::pool::ConnectionPool;

/// Header carrying the sidecar API token.
pub const API_TOKEN_HEADER: &str = "dapr-api-token";

/// Version prefix of every sidecar HTTP route.
pub const API_VERSION: &str = "v1.0";

#[derive(Debug, Clone)]
pub struct Transport {
    options: ClientOptions,
    pool: ConnectionPool,
}

impl Transport {
    pub fn new(options: ClientOptions, pool: ConnectionPool) -> Self {
        Self { options, pool }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Absolute URL for `/v1.0/{segments...}`. Each segment is
    /// percent-encoded, so keys containing `/` or `?` stay one segment.
    pub fn url<S: AsRef<str>>(&self, segments: &[S]) -> String {
        let mut url: Url = self.options.endpoint().clone();
        url.set_query(None);
        url.set_fragment(None);
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push(API_VERSION);
            path.extend(segments.iter().map(|s| s.as_ref()));
        }
        url.to_string()
    }

    pub async fn post<B: serde::Serialize + ?Sized>(
        &self,
        segments: &[&str],
        body: Option<&B>,
    ) -> Result<HttpResponse> {
        let mut request = HttpRequest::new(HttpMethod::Post, self.url(segments));
        if let Some(body) = body {
            request = request.with_json_body(body)?;
        }
        self.execute(&request).await
    }

    pub async fn get(
        &self,
        segments: &[&str],
        query: Vec<(String, String)>,
    ) -> Result<HttpResponse> {
        let mut request = HttpRequest::new(HttpMethod::Get, self.url(segments));
        request.query = query;
        self.execute(&request).await
    }

    pub async fn delete(&self, segments: &[&str], query: Vec<(String, String)>) -> Result<()> {
        let mut request = HttpRequest::new(HttpMethod::Delete, self.url(segments));
        request.query = query;
        self.execute(&request).await.map(|_| ())
    }

    /// Send `request` and return the fully-read response.
    pub async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let timeout = self.options.request_timeout();
        let deadline = Instant::now() + timeout;
        let lease = match timeout_at(deadline, self.pool.lease()).await {
            Ok(lease) => lease?,
            Err(_) => return Err(self.connectivity_error(Unreachable::PoolExhausted(timeout))),
        };

        let mut builder = lease
            .client()
            .request(request.method.into(), request.path.as_str())
            .timeout(deadline.saturating_duration_since(Instant::now()));
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = self.options.api_token() {
            builder = builder.header(API_TOKEN_HEADER, token);
        }
        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone());
        }

        debug!("{} {}", request.method.as_str(), request.path);

        let response = builder
            .send()
            .await
            .map_err(|e| self.connectivity_error(e.into()))?;

        let status = response.status();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        if let Some(source) = response.error_for_status_ref().err() {
            // Drain the body so the connection can be reused.
            let body = response.text().await.unwrap_or_default();
            debug!(
                "{} {} failed with {}: {}",
                request.method.as_str(),
                request.path,
                status,
                body
            );
            return Err(Error::Status {
                status,
                body,
                source,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| self.connectivity_error(e.into()))?;

        Ok(HttpResponse {
            status: status.as_u16(),
            headers,
            body,
        })
    }

    fn connectivity_error(&self, cause: Unreachable) -> Error {
        let unreachable = match &cause {
            Unreachable::Request(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Unreachable::PoolExhausted(_) => true,
        };
        if self.options.fail_fast() && unreachable {
            let hint = remediation_hint(self.options.endpoint());
            warn!("{}: {}", hint, cause);
            return Error::BackendUnavailable {
                hint,
                source: cause,
            };
        }
        match cause {
            Unreachable::Request(source) => Error::Transport(source),
            Unreachable::PoolExhausted(waited) => Error::PoolTimeout { waited },
        }
    }
}

fn remediation_hint(endpoint: &Url) -> String {
    format!(
        "the sidecar at {endpoint} is not reachable; make sure it is running \
         (for example `dapr run --app-id <app-id> -- <command>`) and that the \
         endpoint and port are correct"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::pool::PoolConfig;

    fn transport(endpoint: &str) -> Transport {
        Transport::new(
            ClientOptions::new(endpoint).unwrap(),
            ConnectionPool::new(PoolConfig::default()).unwrap(),
        )
    }

    #[test]
    fn url_prefixes_api_version() {
        let t = transport("http://localhost:3500");
        assert_eq!(
            t.url(&["state", "store", "key"]),
            "http://localhost:3500/v1.0/state/store/key"
        );
    }

    #[test]
    fn url_keeps_endpoint_path_prefix() {
        let t = transport("http://gateway:8080/sidecar/");
        assert_eq!(t.url(&["healthz"]), "http://gateway:8080/sidecar/v1.0/healthz");
    }

    #[test]
    fn url_encodes_each_segment() {
        let t = transport("http://localhost:3500");
        assert_eq!(
            t.url(&["state", "store", "a/b c?"]),
            "http://localhost:3500/v1.0/state/store/a%2Fb%20c%3F"
        );
    }

    #[test]
    fn pool_exhaustion_follows_fail_fast() {
        let waited = Duration::from_millis(50);
        let fail_fast = transport("http://localhost:3500");
        let err = fail_fast.connectivity_error(Unreachable::PoolExhausted(waited));
        match err {
            Error::BackendUnavailable { source, .. } => assert!(source.is_timeout()),
            other => panic!("expected backend unavailable, got {other:?}"),
        }

        let raw = Transport::new(
            ClientOptions::new("http://localhost:3500")
                .unwrap()
                .with_fail_fast(false),
            ConnectionPool::new(PoolConfig::default()).unwrap(),
        );
        let err = raw.connectivity_error(Unreachable::PoolExhausted(waited));
        assert!(matches!(err, Error::PoolTimeout { waited: w } if w == waited));
    }

    #[test]
    fn remediation_hint_mentions_endpoint() {
        let endpoint = Url::parse("http://127.0.0.1:3999").unwrap();
        let hint = remediation_hint(&endpoint);
        assert!(hint.contains("http://127.0.0.1:3999/"));
        assert!(hint.contains("make sure it is running"));
    }
}
