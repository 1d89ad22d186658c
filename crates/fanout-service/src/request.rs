//! Descriptions of requests and their per-call configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use fanout_cache::{CachePriority, RequestFingerprint, escape_component};
use serde::{Deserialize, Serialize};

use crate::transport::TransportRequest;

/// The header name used by [`Request::set_api_key`].
pub const DEFAULT_API_KEY_HEADER: &str = "x-api-key";
/// The content type set by [`Request::set_json_content_type`].
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// The token prefix used by [`Request::set_auth_token`].
pub const DEFAULT_AUTH_PREFIX: &str = "Bearer";

/// The HTTP methods a [`Request`] can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Put,
    Post,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Post => "POST",
            Self::Delete => "DELETE",
        }
    }

    /// Whether responses to this method may be served from and written to the cache.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::Get)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A complete description of a request.
///
/// Path segments, params and query pairs are percent-encoded when the URL is resolved. Params and
/// queries are kept sorted by key, so the order in which they are added does not matter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    base_url: String,
    paths: Vec<String>,
    method: HttpMethod,
    params: BTreeMap<String, String>,
    queries: BTreeMap<String, String>,
    headers: BTreeMap<String, String>,
    body: Option<Bytes>,
}

impl Request {
    pub fn new(method: HttpMethod, base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            paths: Vec::new(),
            method,
            params: BTreeMap::new(),
            queries: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn get(base_url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, base_url)
    }

    pub fn post(base_url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, base_url)
    }

    pub fn put(base_url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Put, base_url)
    }

    pub fn delete(base_url: impl Into<String>) -> Self {
        Self::new(HttpMethod::Delete, base_url)
    }

    /// Appends a path segment. A `/` inside the segment separates further segments.
    pub fn with_path(mut self, segment: impl Into<String>) -> Self {
        self.paths.push(segment.into());
        self
    }

    /// Appends a `/key/value` pair to the path.
    pub fn with_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(key.into(), value.to_string());
        self
    }

    /// Adds a `key=value` query pair.
    pub fn with_query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.queries.insert(key.into(), value.to_string());
        self
    }

    /// Sets a header, replacing any previous value of the same name.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Sets a header, replacing any previous value of the same name.
    ///
    /// Header names are case-insensitive.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers
            .retain(|existing, _| !existing.eq_ignore_ascii_case(&name));
        self.headers.insert(name, value.into());
    }

    /// Sets the API key in the [`DEFAULT_API_KEY_HEADER`] header.
    pub fn set_api_key(&mut self, key: impl Into<String>) {
        self.set_api_key_header(DEFAULT_API_KEY_HEADER, key);
    }

    /// Sets the API key in a custom header.
    pub fn set_api_key_header(&mut self, header: impl Into<String>, key: impl Into<String>) {
        self.set_header(header, key);
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.set_header("Content-Type", content_type);
    }

    pub fn set_json_content_type(&mut self) {
        self.set_content_type(JSON_CONTENT_TYPE);
    }

    /// Sets the `Authorization` header to `Bearer {token}`.
    pub fn set_auth_token(&mut self, token: &str) {
        self.set_auth_token_with_prefix(DEFAULT_AUTH_PREFIX, token);
    }

    /// Sets the `Authorization` header to `{prefix} {token}`.
    pub fn set_auth_token_with_prefix(&mut self, prefix: &str, token: &str) {
        self.set_header("Authorization", format!("{prefix} {token}"));
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Builds the full URL of the request.
    ///
    /// The result has the shape `{base_url}/{paths}[/{key}/{value}...][?{key}={value}&...]`.
    pub fn resolved_url(&self) -> String {
        let mut url = self.base_url.trim_end_matches('/').to_owned();
        url.push('/');

        let segments = self
            .paths
            .iter()
            .flat_map(|path| path.split('/'))
            .filter(|segment| !segment.is_empty())
            .map(escape_component)
            .collect::<Vec<_>>();
        url.push_str(&segments.join("/"));

        for (key, value) in &self.params {
            if !url.ends_with('/') {
                url.push('/');
            }
            url.push_str(&escape_component(key));
            url.push('/');
            url.push_str(&escape_component(value));
        }

        let mut separator = '?';
        for (key, value) in &self.queries {
            url.push(separator);
            url.push_str(&escape_component(key));
            url.push('=');
            url.push_str(&escape_component(value));
            separator = '&';
        }

        url
    }

    /// The identity of this request for caching and coalescing.
    pub fn fingerprint(&self) -> RequestFingerprint {
        let mut builder = RequestFingerprint::builder(self.method.as_str());
        builder.url(&self.resolved_url());
        for (name, value) in &self.headers {
            builder.header(name, value);
        }
        if let Some(body) = &self.body {
            builder.body(body);
        }
        builder.build()
    }

    pub(crate) fn to_transport_request(&self) -> TransportRequest {
        TransportRequest {
            method: self.method,
            url: self.resolved_url(),
            headers: self
                .headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
            body: self.body.clone(),
        }
    }
}

/// Per-call configuration of a request.
///
/// Fields missing from a deserialized configuration keep their default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Write a successful response to the cache.
    pub should_cache: bool,
    /// Serve the request from the cache if possible.
    pub use_cache: bool,
    /// Share the transport call with identical in-flight requests.
    pub coalesce: bool,
    /// How long a cached response stays valid.
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
    /// The eviction priority of a cached response.
    pub cache_priority: CachePriority,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            should_cache: true,
            use_cache: true,
            coalesce: true,
            cache_ttl: Duration::from_secs(300),
            cache_priority: CachePriority::Medium,
        }
    }
}

impl RequestConfig {
    pub fn should_cache(mut self, should_cache: bool) -> Self {
        self.should_cache = should_cache;
        self
    }

    pub fn use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn coalesce(mut self, coalesce: bool) -> Self {
        self.coalesce = coalesce;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn cache_priority(mut self, priority: CachePriority) -> Self {
        self.cache_priority = priority;
        self
    }
}
