//! HTTP requests and responses described as plain data.
//!
//! # Design
//! `DaprClient::build_*` methods produce an `HttpRequest` without touching
//! the network, which keeps request construction deterministic and easy to
//! test. `Transport::execute` sends it and returns an `HttpResponse` whose
//! body has already been read in full, so the underlying connection is back
//! in the pool by the time the caller decodes it.

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// An HTTP request against the sidecar.
///
/// `path` is the absolute URL without query string; `query` pairs are
/// appended by the transport. `body` is serialized JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, path: String) -> Self {
        Self {
            method,
            path,
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_json_body<B: serde::Serialize + ?Sized>(mut self, body: &B) -> Result<Self> {
        self.body = Some(serde_json::to_string(body).map_err(Error::Serialization)?);
        Ok(self)
    }

    /// Value of the first query parameter named `name`.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// A completed response from the sidecar. Header names are lower-case.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    /// Decode the body as JSON. An empty or whitespace-only body yields
    /// `T::default()`, which is how the sidecar reports a missing key.
    pub fn json<T: DeserializeOwned + Default>(&self) -> Result<T> {
        if self.body.trim().is_empty() {
            return Ok(T::default());
        }
        serde_json::from_str(&self.body).map_err(Error::Deserialization)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn etag(&self) -> Option<String> {
        self.header("etag").map(|v| v.trim_matches('"').to_string())
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
