//! Immutable client configuration.
//!
//! # Design
//! `ClientOptions` can only be obtained through `ClientOptions::new`, which
//! validates the endpoint. A client therefore never exists with an endpoint
//! that would only be rejected on the first request.

use std::time::Duration;

use reqwest::header::HeaderValue;
use reqwest::Url;

use crate::error::{Error, Result};

/// Endpoint of a sidecar running next to the application with default ports.
pub const DEFAULT_HTTP_ENDPOINT: &str = "http://127.0.0.1:3500";

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection and behaviour settings for a `DaprClient`.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    endpoint: Url,
    api_token: Option<String>,
    request_timeout: Duration,
    fail_fast: bool,
}

impl ClientOptions {
    /// Validate `endpoint` and build options with default timeout and
    /// fail-fast enabled.
    ///
    /// The endpoint must be an absolute `http` or `https` URI.
    pub fn new(endpoint: &str) -> Result<Self> {
        let endpoint = parse_endpoint(endpoint)?;
        Ok(Self {
            endpoint,
            api_token: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            fail_fast: true,
        })
    }

    /// Options for a sidecar on the default local endpoint.
    pub fn local() -> Result<Self> {
        Self::new(DEFAULT_HTTP_ENDPOINT)
    }

    /// Send `token` as `dapr-api-token` on every request. Blank tokens are
    /// treated as absent; tokens that cannot be sent as a header value are
    /// rejected.
    pub fn with_api_token(mut self, token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        if token.trim().is_empty() {
            self.api_token = None;
            return Ok(self);
        }
        // The token itself is a secret and stays out of the error.
        HeaderValue::from_str(&token).map_err(|_| {
            Error::configuration("api token", "not a valid HTTP header value")
        })?;
        self.api_token = Some(token);
        Ok(self)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Result<Self> {
        if timeout.is_zero() {
            return Err(Error::configuration(
                format!("{timeout:?}"),
                "request timeout must be greater than zero",
            ));
        }
        self.request_timeout = timeout;
        Ok(self)
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn api_token(&self) -> Option<&str> {
        self.api_token.as_deref()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }
}

fn parse_endpoint(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| Error::configuration(raw, format!("not an absolute URI: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::configuration(
            raw,
            format!("scheme must be http or https, got `{}`", url.scheme()),
        ));
    }
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(Error::configuration(raw, "endpoint must include a host"));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_http_and_https() {
        for raw in ["http://localhost:3500", "https://sidecar.internal", "http://10.0.0.1:80/prefix"] {
            let options = ClientOptions::new(raw).unwrap();
            assert!(options.fail_fast());
            assert_eq!(options.request_timeout(), DEFAULT_REQUEST_TIMEOUT);
            assert!(options.api_token().is_none());
        }
    }

    #[test]
    fn rejects_other_schemes() {
        for raw in ["ftp://localhost", "unix:///tmp/sock", "grpc://localhost:50001"] {
            let err = ClientOptions::new(raw).unwrap_err();
            match err {
                Error::Configuration { value, .. } => assert_eq!(value, raw),
                other => panic!("expected configuration error, got {other:?}"),
            }
        }
    }

    #[test]
    fn rejects_unparseable_and_relative() {
        for raw in ["", "   ", "localhost:3500", "/v1.0/state", "http://"] {
            assert!(
                matches!(ClientOptions::new(raw), Err(Error::Configuration { .. })),
                "{raw:?} should be rejected"
            );
        }
    }

    #[test]
    fn builder_methods_apply() {
        let options = ClientOptions::local()
            .unwrap()
            .with_api_token("secret")
            .unwrap()
            .with_fail_fast(false)
            .with_request_timeout(Duration::from_millis(250))
            .unwrap();
        assert_eq!(options.api_token(), Some("secret"));
        assert!(!options.fail_fast());
        assert_eq!(options.request_timeout(), Duration::from_millis(250));
        assert_eq!(options.endpoint().as_str(), "http://127.0.0.1:3500/");
    }

    #[test]
    fn blank_token_is_absent() {
        let options = ClientOptions::local().unwrap().with_api_token("  ").unwrap();
        assert!(options.api_token().is_none());
    }

    #[test]
    fn token_with_control_characters_is_rejected() {
        for token in ["line\nbreak", "nul\0byte", "del\x7f"] {
            let err = ClientOptions::local().unwrap().with_api_token(token).unwrap_err();
            match err {
                Error::Configuration { value, .. } => assert_eq!(value, "api token"),
                other => panic!("expected configuration error, got {other:?}"),
            }
        }
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = ClientOptions::local()
            .unwrap()
            .with_request_timeout(Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
