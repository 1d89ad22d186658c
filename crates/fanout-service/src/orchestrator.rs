//! The request orchestrator: cache lookup, request coalescing and transport in front of each other.
//!
//! A request goes through the following steps:
//!
//! 1. Read-only requests are looked up in the [`BoundedCache`], and answered from there if a
//!    valid entry exists.
//! 2. The request joins the [`Coalescer`]. The first caller for a fingerprint becomes the leader
//!    and starts the transport call on a detached task, every other caller waits for that call.
//! 3. Once the transport call completes, a successful read-only response is written to the cache
//!    and the outcome is delivered to all waiting callers.
//!
//! The detached task only holds a [`Weak`] reference to the orchestrator. Callers going away never
//! cancel the transport call, and an orchestrator that is dropped while a call is in flight
//! silently discards its outcome. Background requests started with
//! [`RequestOrchestrator::request_with_handler`] do not keep the orchestrator alive either.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use fanout_cache::{
    BoundedCache, CachePriority, Coalescer, Joined, PutOutcome, RequestFingerprint, Waiter,
};
use futures::future::BoxFuture;
use sentry::{Hub, SentryFutureExt};
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::decode::decode_json;
use crate::error::{FromRawFailure, RawFailure, TransportError};
use crate::request::{Request, RequestConfig};
use crate::transport::{HttpTransport, Transport, TransportOutcome, TransportRequest};

/// How a response is written to the cache.
#[derive(Debug, Clone, Copy)]
struct CacheWrite {
    ttl: Duration,
    priority: CachePriority,
}

/// A request that has been handed to the cache, the coalescer or the transport.
enum Dispatched {
    /// Answered from the cache.
    Ready(Bytes),
    /// An uncoalesced transport call, awaited by the caller itself.
    Inline {
        execution: BoxFuture<'static, TransportOutcome>,
        fingerprint: RequestFingerprint,
        write: Option<CacheWrite>,
    },
    /// Waiting on a coalesced transport call.
    Waiting(Waiter<RequestFingerprint, TransportOutcome>),
}

struct Inner {
    transport: Box<dyn Transport>,
    cache: Option<BoundedCache>,
    coalescer: Coalescer<RequestFingerprint, TransportOutcome>,
    default_config: RequestConfig,
}

impl Inner {
    fn lookup(&self, fingerprint: &RequestFingerprint) -> Option<Bytes> {
        let cache = self.cache.as_ref()?;
        match cache.get(fingerprint) {
            Some(payload) => {
                tracing::trace!(%fingerprint, "Cache hit");
                metric!(counter("cache.hit") += 1);
                Some(payload)
            }
            None => {
                metric!(counter("cache.miss") += 1);
                None
            }
        }
    }

    fn store(
        &self,
        fingerprint: &RequestFingerprint,
        outcome: &TransportOutcome,
        write: Option<CacheWrite>,
    ) {
        let (Some(cache), Some(write), Ok(response)) = (&self.cache, write, outcome) else {
            return;
        };
        if !response.is_success() {
            return;
        }

        match cache.put(
            fingerprint.clone(),
            response.body.clone(),
            write.ttl,
            write.priority,
        ) {
            PutOutcome::Inserted { evicted } => {
                if evicted > 0 {
                    metric!(counter("cache.evicted") += evicted as i64);
                }
            }
            PutOutcome::Rejected => metric!(counter("cache.rejected") += 1),
            PutOutcome::Expired => {}
        }
        metric!(gauge("cache.usage") = cache.usage() as u64);
    }

    /// Answers `request` from the cache, or joins or starts the transport call for it.
    fn dispatch(self: &Arc<Self>, request: &Request, config: &RequestConfig) -> Dispatched {
        let method = request.method();
        metric!(counter("orchestrator.request") += 1, "method" => method.as_str());

        let fingerprint = request.fingerprint();
        let cacheable = method.is_read_only();

        if cacheable && config.use_cache {
            if let Some(payload) = self.lookup(&fingerprint) {
                return Dispatched::Ready(payload);
            }
        }

        let write = (cacheable && config.should_cache).then_some(CacheWrite {
            ttl: config.cache_ttl,
            priority: config.cache_priority,
        });

        if !config.coalesce {
            metric!(counter("transport.execute") += 1, "method" => method.as_str());
            return Dispatched::Inline {
                execution: self.transport.execute(request.to_transport_request()),
                fingerprint,
                write,
            };
        }

        let Joined { is_leader, waiter } = self.coalescer.join(fingerprint.clone());
        if is_leader {
            tracing::debug!(%fingerprint, %method, "Starting request");
            metric!(counter("coalescer.leader") += 1);
            self.spawn_transport(fingerprint, request.to_transport_request(), write);
        } else {
            tracing::debug!(%fingerprint, %method, "Joining in-flight request");
            metric!(counter("coalescer.joined") += 1);
        }

        Dispatched::Waiting(waiter)
    }

    fn spawn_transport(
        self: &Arc<Self>,
        fingerprint: RequestFingerprint,
        request: TransportRequest,
        write: Option<CacheWrite>,
    ) {
        metric!(counter("transport.execute") += 1, "method" => request.method.as_str());
        let call = PendingCall {
            inner: Arc::downgrade(self),
            fingerprint,
            write,
            done: false,
        };
        let execution = self.transport.execute(request);

        let task = async move {
            let outcome = execution.await;
            call.complete(outcome);
        };
        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
    }
}

/// A coalesced transport call that still has to be resolved.
///
/// If it is dropped before completing, because the transport panicked or the task was aborted,
/// its waiters receive a transport failure instead of waiting forever.
struct PendingCall {
    inner: Weak<Inner>,
    fingerprint: RequestFingerprint,
    write: Option<CacheWrite>,
    done: bool,
}

impl PendingCall {
    fn complete(mut self, outcome: TransportOutcome) {
        self.done = true;
        complete(&self.inner, &self.fingerprint, outcome, self.write);
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        tracing::error!(fingerprint = %self.fingerprint, "Transport call did not complete");
        let outcome = Err(TransportError::Other(
            "transport call did not complete".into(),
        ));
        complete(&self.inner, &self.fingerprint, outcome, None);
    }
}

/// Fronts a [`Transport`] with a response cache and request coalescing.
///
/// The orchestrator is cheap to clone, all clones share the same cache and in-flight requests.
/// It has to be used from within a tokio runtime.
#[derive(Clone)]
pub struct RequestOrchestrator {
    inner: Arc<Inner>,
}

impl fmt::Debug for RequestOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOrchestrator")
            .field("cache_capacity", &self.cache_capacity())
            .field("cache_usage", &self.cache_usage())
            .field("pending_requests", &self.pending_requests())
            .finish()
    }
}

impl RequestOrchestrator {
    /// Creates an orchestrator with a cache of `cache_capacity` bytes.
    ///
    /// A capacity of `0` disables the cache.
    pub fn new(transport: impl Transport, cache_capacity: usize) -> Self {
        Self::with_default_config(transport, cache_capacity, RequestConfig::default())
    }

    /// Like [`new`](Self::new), with the [`RequestConfig`] returned by
    /// [`default_config`](Self::default_config).
    pub fn with_default_config(
        transport: impl Transport,
        cache_capacity: usize,
        default_config: RequestConfig,
    ) -> Self {
        let cache = if cache_capacity == 0 {
            tracing::info!("Response cache disabled");
            None
        } else {
            tracing::info!(capacity = cache_capacity, "Response cache enabled");
            Some(BoundedCache::new(cache_capacity))
        };

        Self {
            inner: Arc::new(Inner {
                transport: Box::new(transport),
                cache,
                coalescer: Coalescer::new(),
                default_config,
            }),
        }
    }

    /// Creates an orchestrator sending requests over HTTP, configured by `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let transport = HttpTransport::from_config(config).context("failed to create HTTP client")?;
        Ok(Self::with_default_config(
            transport,
            config.cache_capacity_bytes(),
            config.default_request,
        ))
    }

    /// The request configuration used when none is given explicitly.
    pub fn default_config(&self) -> RequestConfig {
        self.inner.default_config
    }

    /// The cache capacity in bytes, `0` if caching is disabled.
    pub fn cache_capacity(&self) -> usize {
        self.inner.cache.as_ref().map_or(0, BoundedCache::capacity)
    }

    /// The number of bytes currently held by the cache.
    pub fn cache_usage(&self) -> usize {
        self.inner.cache.as_ref().map_or(0, BoundedCache::usage)
    }

    /// The number of distinct requests currently in flight.
    pub fn pending_requests(&self) -> usize {
        self.inner.coalescer.pending_count()
    }

    /// Drops all cached responses.
    pub fn clear_cache(&self) {
        if let Some(cache) = &self.inner.cache {
            cache.clear();
        }
    }

    /// Executes `request` and returns the raw response payload.
    ///
    /// Only `200` responses are successful, all other responses are returned as
    /// [`RawFailure::Unsuccessful`].
    pub async fn request_raw(
        &self,
        request: &Request,
        config: &RequestConfig,
    ) -> Result<Bytes, RawFailure> {
        let dispatched = self.inner.dispatch(request, config);
        finish(&Arc::downgrade(&self.inner), dispatched).await
    }

    /// Executes `request` and decodes the JSON response payload into `D`.
    ///
    /// Failures are turned into the caller's error type through [`FromRawFailure`].
    pub async fn request<D, E>(&self, request: &Request, config: &RequestConfig) -> Result<D, E>
    where
        D: DeserializeOwned,
        E: FromRawFailure,
    {
        decode_payload(self.request_raw(request, config).await)
    }

    /// Executes `request` in the background and calls `handler` with the outcome.
    ///
    /// The handler is called at most once, from within the runtime. The background task does not
    /// keep the orchestrator alive. If all its clones are dropped before the request completes,
    /// the handler is not called.
    pub fn request_with_handler<D, E, F>(
        &self,
        request: Request,
        config: RequestConfig,
        handler: F,
    ) -> JoinHandle<()>
    where
        D: DeserializeOwned + Send + 'static,
        E: FromRawFailure + Send + 'static,
        F: FnOnce(Result<D, E>) + Send + 'static,
    {
        let inner = Arc::downgrade(&self.inner);
        let task = async move {
            let Some(strong) = inner.upgrade() else {
                return;
            };
            let dispatched = strong.dispatch(&request, &config);
            drop(strong);

            let result = finish(&inner, dispatched).await;
            if let Err(RawFailure::Canceled) = result {
                tracing::debug!("Orchestrator dropped, not calling the handler");
                return;
            }
            handler(decode_payload(result));
        };
        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())))
    }
}

/// Waits for a dispatched request to finish.
///
/// Returns [`RawFailure::Canceled`] if the orchestrator is dropped in the meantime.
async fn finish(inner: &Weak<Inner>, dispatched: Dispatched) -> Result<Bytes, RawFailure> {
    match dispatched {
        Dispatched::Ready(payload) => Ok(payload),
        Dispatched::Inline {
            execution,
            fingerprint,
            write,
        } => {
            let outcome = execution.await;
            let Some(inner) = inner.upgrade() else {
                return Err(RawFailure::Canceled);
            };
            inner.store(&fingerprint, &outcome, write);
            into_payload(outcome)
        }
        Dispatched::Waiting(waiter) => match waiter.await {
            Ok(outcome) => into_payload(outcome),
            Err(_) => Err(RawFailure::Canceled),
        },
    }
}

fn complete(
    inner: &Weak<Inner>,
    fingerprint: &RequestFingerprint,
    outcome: TransportOutcome,
    write: Option<CacheWrite>,
) {
    let Some(inner) = inner.upgrade() else {
        tracing::debug!(%fingerprint, "Orchestrator dropped, discarding response");
        return;
    };

    // Write before resolving, so callers arriving after the resolution hit the cache.
    inner.store(fingerprint, &outcome, write);
    if inner.coalescer.resolve(fingerprint, outcome).is_none() {
        metric!(counter("coalescer.orphan_resolve") += 1);
    }
}

fn decode_payload<D, E>(payload: Result<Bytes, RawFailure>) -> Result<D, E>
where
    D: DeserializeOwned,
    E: FromRawFailure,
{
    let payload = payload.map_err(E::from_raw_failure)?;
    decode_json(&payload).map_err(|err| E::from_raw_failure(RawFailure::Decode(err)))
}

fn into_payload(outcome: TransportOutcome) -> Result<Bytes, RawFailure> {
    let response = outcome?;
    if response.is_success() {
        Ok(response.body)
    } else {
        Err(RawFailure::Unsuccessful(response))
    }
}
