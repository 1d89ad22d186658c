use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::header::{self, HeaderName, HeaderValue};

use super::{RawResponse, Transport, TransportOutcome, TransportRequest};
use crate::config::{Config, Timeouts};
use crate::error::TransportError;
use crate::request::HttpMethod;

/// Creates a [`reqwest::Client`] with the provided timeouts.
pub fn create_client(timeouts: &Timeouts) -> reqwest::Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .connect_timeout(timeouts.connect)
        .timeout(timeouts.max_request)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}

/// A [`Transport`] that performs HTTP requests with [`reqwest`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeouts: Timeouts,
    user_agent: HeaderValue,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, timeouts: Timeouts, user_agent: &str) -> Self {
        let user_agent = HeaderValue::from_str(user_agent).unwrap_or_else(|_| {
            tracing::warn!(user_agent, "Invalid User-Agent, falling back to default");
            HeaderValue::from_static(concat!("fanout/", env!("CARGO_PKG_VERSION")))
        });
        Self {
            client,
            timeouts,
            user_agent,
        }
    }

    pub fn from_config(config: &Config) -> reqwest::Result<Self> {
        let client = create_client(&config.timeouts)?;
        Ok(Self::new(client, config.timeouts, &config.user_agent))
    }

    fn build(&self, request: TransportRequest) -> Result<reqwest::Request, TransportError> {
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Delete => reqwest::Method::DELETE,
        };
        let url = reqwest::Url::parse(&request.url)
            .map_err(|err| TransportError::InvalidRequest(format!("{}: {err}", request.url)))?;

        let mut headers = header::HeaderMap::with_capacity(request.headers.len() + 1);
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| TransportError::InvalidRequest(format!("header name `{name}`")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| TransportError::InvalidRequest(format!("value of header `{name}`")))?;
            headers.append(name, value);
        }
        if !headers.contains_key(header::USER_AGENT) {
            headers.insert(header::USER_AGENT, self.user_agent.clone());
        }

        let mut builder = self.client.request(method, url).headers(headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        builder.build().map_err(|err| self.convert_error(&err))
    }

    async fn send(self, request: TransportRequest) -> TransportOutcome {
        let method = request.method;
        let request = self.build(request)?;
        tracing::trace!(%method, url = %request.url(), "Sending request");

        let start = Instant::now();
        let response = self
            .client
            .execute(request)
            .await
            .map_err(|err| self.convert_error(&err))?;

        let status = response.status().as_u16();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            let value = String::from_utf8_lossy(value.as_bytes());
            match headers.entry(name.as_str().to_owned()) {
                Entry::Occupied(mut entry) => {
                    let joined: &mut String = entry.get_mut();
                    joined.push_str(", ");
                    joined.push_str(&value);
                }
                Entry::Vacant(entry) => {
                    entry.insert(value.into_owned());
                }
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| self.convert_error(&err))?;

        metric!(timer("transport.duration") = start.elapsed(), "method" => method.as_str());
        metric!(time_raw("transport.response_size") = body.len() as u64);

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }

    fn convert_error(&self, err: &reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeouts.max_request)
        } else if err.is_connect() {
            TransportError::with_root_cause(TransportError::Connect, err)
        } else if err.is_builder() {
            TransportError::with_root_cause(TransportError::InvalidRequest, err)
        } else {
            TransportError::with_root_cause(TransportError::Other, err)
        }
    }
}

impl Transport for HttpTransport {
    fn execute(&self, request: TransportRequest) -> BoxFuture<'static, TransportOutcome> {
        self.clone().send(request).boxed()
    }
}
