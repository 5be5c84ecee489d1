//! Resolve `ClientOptions` from stored configuration and environment overrides.
//!
//! Precedence for every field is environment > stored config > built-in
//! default. Stored configuration is a YAML document such as:
//!
//! ```yaml
//! http_endpoint: http://127.0.0.1:3500
//! api_token: secret
//! fail_fast: true
//! request_timeout_ms: 5000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::options::{ClientOptions, DEFAULT_HTTP_ENDPOINT};

pub const ENV_HTTP_ENDPOINT: &str = "DAPR_HTTP_ENDPOINT";
pub const ENV_HTTP_PORT: &str = "DAPR_HTTP_PORT";
pub const ENV_API_TOKEN: &str = "DAPR_API_TOKEN";
pub const ENV_FAIL_FAST: &str = "DAPR_FAIL_FAST";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "DAPR_REQUEST_TIMEOUT_MS";

/// Stored sidecar settings. Every field is optional; missing fields fall
/// back to the environment or the built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarConfig {
    pub http_endpoint: Option<String>,
    pub api_token: Option<String>,
    pub fail_fast: Option<bool>,
    pub request_timeout_ms: Option<u64>,
}

impl SidecarConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::configuration("sidecar config", format!("invalid YAML: {e}")))
    }

    /// Load stored configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| Error::configuration(path.display().to_string(), e.to_string()))?;
        debug!("Loaded sidecar config from {}", path.display());
        Self::from_yaml_str(&yaml)
    }

    /// Resolve against the process environment.
    pub fn resolve(&self) -> Result<ClientOptions> {
        self.resolve_with(|name| std::env::var(name).ok())
    }

    /// Resolve using `lookup` as the source of environment overrides.
    pub fn resolve_with<F>(&self, lookup: F) -> Result<ClientOptions>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let endpoint = match (env(ENV_HTTP_ENDPOINT), env(ENV_HTTP_PORT)) {
            (Some(endpoint), _) => endpoint,
            (None, Some(port)) => {
                let port: u16 = port.trim().parse().map_err(|_| {
                    Error::configuration(format!("{ENV_HTTP_PORT}={port}"), "not a valid port")
                })?;
                format!("http://127.0.0.1:{port}")
            }
            (None, None) => self
                .http_endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_HTTP_ENDPOINT.to_string()),
        };

        let mut options = ClientOptions::new(&endpoint)?;

        if let Some(token) = env(ENV_API_TOKEN).or_else(|| self.api_token.clone()) {
            options = options.with_api_token(token)?;
        }

        let fail_fast = match env(ENV_FAIL_FAST) {
            Some(raw) => parse_bool(ENV_FAIL_FAST, &raw)?,
            None => self.fail_fast.unwrap_or(true),
        };
        options = options.with_fail_fast(fail_fast);

        let timeout_ms = match env(ENV_REQUEST_TIMEOUT_MS) {
            Some(raw) => raw.trim().parse::<u64>().map_err(|_| {
                Error::configuration(
                    format!("{ENV_REQUEST_TIMEOUT_MS}={raw}"),
                    "expected a number of milliseconds",
                )
            })?,
            None => self
                .request_timeout_ms
                .unwrap_or(crate::options::DEFAULT_REQUEST_TIMEOUT.as_millis() as u64),
        };
        options.with_request_timeout(Duration::from_millis(timeout_ms))
    }
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::configuration(
            format!("{name}={raw}"),
            "expected true or false",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_config_or_env() {
        let options = SidecarConfig::default().resolve_with(env(&[])).unwrap();
        assert_eq!(options.endpoint().as_str(), "http://127.0.0.1:3500/");
        assert!(options.fail_fast());
        assert_eq!(options.request_timeout(), Duration::from_secs(5));
        assert!(options.api_token().is_none());
    }

    #[test]
    fn stored_config_overrides_defaults() {
        let stored = SidecarConfig::from_yaml_str(
            "http_endpoint: http://sidecar:3600\napi_token: stored\nfail_fast: false\nrequest_timeout_ms: 750\n",
        )
        .unwrap();
        let options = stored.resolve_with(env(&[])).unwrap();
        assert_eq!(options.endpoint().as_str(), "http://sidecar:3600/");
        assert_eq!(options.api_token(), Some("stored"));
        assert!(!options.fail_fast());
        assert_eq!(options.request_timeout(), Duration::from_millis(750));
    }

    #[test]
    fn environment_overrides_stored_config() {
        let stored = SidecarConfig {
            http_endpoint: Some("http://sidecar:3600".to_string()),
            api_token: Some("stored".to_string()),
            fail_fast: Some(true),
            request_timeout_ms: Some(750),
        };
        let options = stored
            .resolve_with(env(&[
                (ENV_HTTP_ENDPOINT, "https://override:443"),
                (ENV_API_TOKEN, "from-env"),
                (ENV_FAIL_FAST, "off"),
                (ENV_REQUEST_TIMEOUT_MS, "100"),
            ]))
            .unwrap();
        assert_eq!(options.endpoint().as_str(), "https://override/");
        assert_eq!(options.api_token(), Some("from-env"));
        assert!(!options.fail_fast());
        assert_eq!(options.request_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn port_override_builds_local_endpoint() {
        let stored = SidecarConfig {
            http_endpoint: Some("http://sidecar:3600".to_string()),
            ..Default::default()
        };
        let options = stored.resolve_with(env(&[(ENV_HTTP_PORT, "3511")])).unwrap();
        assert_eq!(options.endpoint().as_str(), "http://127.0.0.1:3511/");
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let options = SidecarConfig::default()
            .resolve_with(env(&[(ENV_HTTP_ENDPOINT, ""), (ENV_FAIL_FAST, " ")]))
            .unwrap();
        assert_eq!(options.endpoint().as_str(), "http://127.0.0.1:3500/");
        assert!(options.fail_fast());
    }

    #[test]
    fn malformed_values_are_configuration_errors() {
        let cases: &[(&str, &str)] = &[
            (ENV_HTTP_ENDPOINT, "tcp://nope"),
            (ENV_HTTP_PORT, "port"),
            (ENV_FAIL_FAST, "maybe"),
            (ENV_REQUEST_TIMEOUT_MS, "soon"),
            (ENV_REQUEST_TIMEOUT_MS, "0"),
            (ENV_API_TOKEN, "multi\nline"),
        ];
        for (name, value) in cases {
            let err = SidecarConfig::default()
                .resolve_with(env(&[(*name, *value)]))
                .unwrap_err();
            assert!(
                matches!(err, Error::Configuration { .. }),
                "{name}={value} should fail, got {err:?}"
            );
        }
    }

    #[test]
    fn invalid_yaml_is_rejected() {
        let err = SidecarConfig::from_yaml_str("fail_fast: [not, a, bool]").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn missing_file_is_rejected() {
        let err = SidecarConfig::load("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
