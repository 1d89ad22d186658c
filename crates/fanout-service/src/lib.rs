//! Request orchestration on top of the [`fanout_cache`] primitives.
//!
//! The [`RequestOrchestrator`](orchestrator::RequestOrchestrator) fronts a pluggable
//! [`Transport`](transport::Transport) with a byte-bounded response cache and request coalescing:
//! identical concurrent requests result in a single transport call whose outcome is fanned out to
//! every caller.

#[macro_use]
pub mod metrics;

pub mod config;
pub mod decode;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod request;
pub mod transport;

pub use fanout_cache::{CachePriority, RequestFingerprint};
