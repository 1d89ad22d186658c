use std::error::Error;
use std::time::Duration;

use thiserror::Error;

use crate::transport::RawResponse;

/// A failure of the transport itself, before any response was received.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The request did not complete within the configured time.
    #[error("request timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),
    /// No connection could be established.
    #[error("failed to connect: {0}")]
    Connect(String),
    /// The request could not be built, for example because of an invalid URL or header.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Any other transport failure.
    #[error("transport failed: {0}")]
    Other(String),
}

impl TransportError {
    /// Whether this failure indicates that the remote could not be reached at all.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::Connect(_))
    }

    /// Creates an error of the given kind from the root cause of `err`.
    pub(crate) fn with_root_cause(kind: fn(String) -> Self, err: &dyn Error) -> Self {
        let mut source = err;
        while let Some(next) = source.source() {
            source = next;
        }
        kind(source.to_string())
    }
}

/// The response body could not be decoded into the requested type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to decode response: {0}")]
pub struct DecodeError(pub String);

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        Self(err.to_string())
    }
}

/// Everything that can go wrong with a request, at the level of raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RawFailure {
    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A response was received but its status does not indicate success.
    #[error("unsuccessful response with status {}", .0.status)]
    Unsuccessful(RawResponse),
    /// The payload could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),
    /// The orchestrator was dropped before the request completed.
    #[error("the request was canceled")]
    Canceled,
}

impl RawFailure {
    /// The full response, if one was received.
    pub fn response(&self) -> Option<&RawResponse> {
        match self {
            Self::Unsuccessful(response) => Some(response),
            _ => None,
        }
    }
}

/// Constructs a caller-defined error from a [`RawFailure`].
///
/// Implement this for your own error type to receive it from
/// [`RequestOrchestrator::request`](crate::orchestrator::RequestOrchestrator::request). The full
/// response of unsuccessful requests is available through [`RawFailure::response`].
pub trait FromRawFailure: Sized {
    fn from_raw_failure(failure: RawFailure) -> Self;
}

impl FromRawFailure for RawFailure {
    fn from_raw_failure(failure: RawFailure) -> Self {
        failure
    }
}

/// The default error of typed requests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error(transparent)]
    Transport(TransportError),
    #[error("server responded with status {}", .0.status)]
    Unsuccessful(RawResponse),
    #[error(transparent)]
    Decode(DecodeError),
    #[error("the request was canceled")]
    Canceled,
}

impl RequestError {
    /// The status code of an unsuccessful response.
    pub fn status(&self) -> Option<u16> {
        self.response().map(|response| response.status)
    }

    /// The full unsuccessful response.
    pub fn response(&self) -> Option<&RawResponse> {
        match self {
            Self::Unsuccessful(response) => Some(response),
            _ => None,
        }
    }

    /// See [`TransportError::is_not_connected`].
    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::Transport(err) if err.is_not_connected())
    }
}

impl FromRawFailure for RequestError {
    fn from_raw_failure(failure: RawFailure) -> Self {
        match failure {
            RawFailure::Transport(err) => Self::Transport(err),
            RawFailure::Unsuccessful(response) => Self::Unsuccessful(response),
            RawFailure::Decode(err) => Self::Decode(err),
            RawFailure::Canceled => Self::Canceled,
        }
    }
}

impl From<RawFailure> for RequestError {
    fn from(failure: RawFailure) -> Self {
        Self::from_raw_failure(failure)
    }
}
