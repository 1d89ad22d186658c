//! Helpers for testing the orchestrator and its transports.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using a [`HitCounter`], make sure that it is held until all requests to the server
//!    have been made. If the server is dropped, the port is closed and requests fail to connect.
//!    To avoid this, assign it to a variable: `let hitcounter = HitCounter::new();`.
//!
//!  - [`MockTransport`] avoids the network altogether and is the better fit for tests that
//!    only care about what the orchestrator does with a response.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::routing::{any, get};
use bytes::Bytes;
use fanout_service::error::TransportError;
use fanout_service::transport::{RawResponse, Transport, TransportOutcome, TransportRequest};
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `fanout` crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("fanout_cache=trace,fanout_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    /// Creates a new test server serving the given `axum` router.
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A test server that counts the requests to each URI.
///
/// It serves the following routes:
///
///  - `/delay/{duration}/{path}`: Waits for the given duration (in `humantime` format) and then
///    responds with a JSON object containing the path.
///  - `/respond_statuscode/{num}/{tail}`: Responds with the given status code.
///  - `/garbage_data/{tail}`: Responds with the tail as plain text.
///  - `/echo/{tail}`: Responds with a JSON object describing the request: method, headers, query
///    and body.
pub struct HitCounter {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl HitCounter {
    pub fn new() -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri), req: extract::Request, next: Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.to_string()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let router = Router::new()
            .route(
                "/delay/:time/*path",
                get(
                    |extract::Path((time, path)): extract::Path<(String, String)>| async move {
                        let duration = humantime::parse_duration(&time).unwrap();
                        tokio::time::sleep(duration).await;

                        axum::Json(serde_json::json!({ "path": path }))
                    },
                ),
            )
            .route(
                "/respond_statuscode/:num/*tail",
                get(
                    |extract::Path((num, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(num).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .route(
                "/garbage_data/*tail",
                get(|extract::Path(tail): extract::Path<String>| async move { tail }),
            )
            .route(
                "/echo/*tail",
                any(
                    |method: Method,
                     extract::Query(query): extract::Query<BTreeMap<String, String>>,
                     headers: HeaderMap,
                     body: Bytes| async move {
                        let headers: BTreeMap<_, _> = headers
                            .iter()
                            .map(|(name, value)| {
                                (
                                    name.to_string(),
                                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                                )
                            })
                            .collect();
                        axum::Json(serde_json::json!({
                            "method": method.as_str(),
                            "query": query,
                            "headers": headers,
                            "body": String::from_utf8_lossy(&body),
                        }))
                    },
                ),
            )
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// Returns the total number of requests since the last call, and resets the counters.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns the number of requests per URI since the last call, and resets the counters.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    pub fn url(&self, path: &str) -> String {
        self.server.url(path)
    }
}

impl Default for HitCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct MockState {
    responses: HashMap<String, TransportOutcome>,
    requests: Vec<TransportRequest>,
}

/// A scriptable in-memory [`Transport`].
///
/// Responses are registered per URL. Requests to URLs without a registered response are answered
/// with a `404`. Every request is recorded and takes the configured delay, which makes it possible
/// to have requests overlap in tests using paused time.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    delay: Duration,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every response by `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Responds to requests for `url` with the given status and body.
    pub fn respond(&self, url: &str, status: u16, body: impl Into<Bytes>) -> &Self {
        let response = RawResponse {
            status,
            headers: Default::default(),
            body: body.into(),
        };
        self.set_outcome(url, Ok(response))
    }

    /// Fails requests for `url` with the given transport error.
    pub fn fail(&self, url: &str, error: TransportError) -> &Self {
        self.set_outcome(url, Err(error))
    }

    fn set_outcome(&self, url: &str, outcome: TransportOutcome) -> &Self {
        self.state
            .lock()
            .unwrap()
            .responses
            .insert(url.to_owned(), outcome);
        self
    }

    /// The number of requests executed so far.
    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    /// The number of requests executed for `url` so far.
    pub fn calls_for(&self, url: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|request| request.url == url)
            .count()
    }

    /// All requests executed so far, in order.
    pub fn requests(&self) -> Vec<TransportRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

impl Transport for MockTransport {
    fn execute(&self, request: TransportRequest) -> BoxFuture<'static, TransportOutcome> {
        let outcome = {
            let mut state = self.state.lock().unwrap();
            let outcome = state.responses.get(&request.url).cloned().unwrap_or_else(|| {
                Ok(RawResponse {
                    status: 404,
                    headers: Default::default(),
                    body: Bytes::new(),
                })
            });
            state.requests.push(request);
            outcome
        };

        let delay = self.delay;
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            outcome
        }
        .boxed()
    }
}
