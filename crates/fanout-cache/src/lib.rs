//! The in-memory primitives behind the fanout request orchestrator.
//!
//! These primitives are runtime-agnostic and can be composed by any caller:
//!
//! - [`RequestFingerprint`] is the identity of "the same logical request". It is built through a
//!   [`FingerprintBuilder`] which accepts stable, human-readable metadata and hashes it.
//! - [`BoundedCache`] keeps response payloads under a byte capacity, expiring them after a TTL and
//!   evicting the lowest [`CachePriority`] (then the soonest to expire) first when room runs out.
//! - [`Coalescer`] tracks the callers waiting on an in-flight request and fans a single outcome
//!   out to all of them.

#![warn(missing_docs)]

mod bounded;
mod coalescer;
mod fingerprint;

pub use bounded::*;
pub use coalescer::*;
pub use fingerprint::*;

#[cfg(any(test, feature = "test"))]
pub(crate) use tokio::time;

#[cfg(not(any(test, feature = "test")))]
pub(crate) use std::time;
