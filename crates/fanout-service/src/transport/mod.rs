//! The binding between the orchestrator and the network.

use std::collections::BTreeMap;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::TransportError;
use crate::request::HttpMethod;

mod http;

pub use http::{HttpTransport, create_client};

/// The outcome of a single transport call.
///
/// Unsuccessful status codes are not an error at this level, they are carried in the
/// [`RawResponse`].
pub type TransportOutcome = Result<RawResponse, TransportError>;

/// A fully resolved request, ready to be put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

/// A response as received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    /// Response headers with lower-cased names.
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl RawResponse {
    /// Only `200 OK` counts as success.
    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// Executes requests.
///
/// The returned future must be `'static` since the orchestrator drives it on a detached task,
/// independent of the caller that triggered it.
pub trait Transport: Send + Sync + 'static {
    fn execute(&self, request: TransportRequest) -> BoxFuture<'static, TransportOutcome>;
}
