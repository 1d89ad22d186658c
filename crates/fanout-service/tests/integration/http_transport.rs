use std::time::Duration;

use fanout_service::config::{Config, Timeouts};
use fanout_service::error::{RawFailure, RequestError, TransportError};
use fanout_service::orchestrator::RequestOrchestrator;
use fanout_service::request::{Request, RequestConfig};
use fanout_service::transport::{HttpTransport, create_client};
use fanout_test::HitCounter;
use serde::Deserialize;

fn orchestrator() -> RequestOrchestrator {
    RequestOrchestrator::from_config(&Config::default()).unwrap()
}

#[derive(Debug, Deserialize)]
struct Echo {
    method: String,
    query: serde_json::Map<String, serde_json::Value>,
    headers: serde_json::Map<String, serde_json::Value>,
    body: String,
}

#[tokio::test]
async fn test_concurrent_requests_hit_server_once() {
    fanout_test::setup();

    let hitcounter = HitCounter::new();
    let orchestrator = orchestrator();
    let config = RequestConfig::default();
    let request = Request::get(hitcounter.url("")).with_path("delay/100ms/items");

    let (a, b) = futures::join!(
        orchestrator.request_raw(&request, &config),
        orchestrator.request_raw(&request, &config),
    );

    let a = a.unwrap();
    assert_eq!(a, b.unwrap());
    assert_eq!(&a[..], br#"{"path":"items"}"#);
    assert_eq!(
        hitcounter.all_hits(),
        [("/delay/100ms/items".to_owned(), 1)]
    );
}

#[tokio::test]
async fn test_cached_response_avoids_network() {
    fanout_test::setup();

    let hitcounter = HitCounter::new();
    let orchestrator = orchestrator();
    let config = RequestConfig::default();
    let request = Request::get(hitcounter.url(""))
        .with_path("echo/items")
        .with_query("page", 1);

    let first: Echo = orchestrator
        .request::<_, RequestError>(&request, &config)
        .await
        .unwrap();
    let second: Echo = orchestrator
        .request::<_, RequestError>(&request, &config)
        .await
        .unwrap();

    assert_eq!(first.method, "GET");
    assert_eq!(first.query["page"], "1");
    assert_eq!(first.body, second.body);
    assert_eq!(hitcounter.accesses(), 1);

    // Another query is another request.
    let other = request.clone().with_query("page", 2);
    orchestrator
        .request::<Echo, RequestError>(&other, &config)
        .await
        .unwrap();
    assert_eq!(hitcounter.accesses(), 1);
}

#[tokio::test]
async fn test_post_is_sent_every_time() {
    fanout_test::setup();

    let hitcounter = HitCounter::new();
    let orchestrator = orchestrator();
    let config = RequestConfig::default();

    let mut request = Request::post(hitcounter.url(""))
        .with_path("echo/items")
        .with_body(r#"{"name":"first"}"#);
    request.set_json_content_type();

    for _ in 0..2 {
        let echo: Echo = orchestrator
            .request::<_, RequestError>(&request, &config)
            .await
            .unwrap();
        assert_eq!(echo.method, "POST");
        assert_eq!(echo.body, r#"{"name":"first"}"#);
        assert_eq!(echo.headers["content-type"], "application/json");
    }
    assert_eq!(hitcounter.accesses(), 2);
    assert_eq!(orchestrator.cache_usage(), 0);
}

#[tokio::test]
async fn test_headers_are_sent() {
    fanout_test::setup();

    let hitcounter = HitCounter::new();
    let orchestrator = orchestrator();

    let mut request = Request::get(hitcounter.url("")).with_path("echo/headers");
    request.set_api_key("secret");
    request.set_auth_token("token");

    let echo: Echo = orchestrator
        .request::<_, RequestError>(&request, &RequestConfig::default())
        .await
        .unwrap();

    assert_eq!(echo.headers["x-api-key"], "secret");
    assert_eq!(echo.headers["authorization"], "Bearer token");
    assert!(
        echo.headers["user-agent"]
            .as_str()
            .unwrap()
            .starts_with("fanout/")
    );
}

#[tokio::test]
async fn test_unsuccessful_status() {
    fanout_test::setup();

    let hitcounter = HitCounter::new();
    let orchestrator = orchestrator();
    let config = RequestConfig::default();
    let request = Request::get(hitcounter.url("")).with_path("respond_statuscode/404/item");

    let err = orchestrator
        .request::<serde_json::Value, RequestError>(&request, &config)
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(404));

    // Unsuccessful responses are not cached.
    let err = orchestrator
        .request_raw(&request, &config)
        .await
        .unwrap_err();
    assert!(matches!(err, RawFailure::Unsuccessful(ref response) if response.status == 404));
    assert_eq!(hitcounter.accesses(), 2);
}

#[tokio::test]
async fn test_garbage_data_fails_to_decode() {
    fanout_test::setup();

    let hitcounter = HitCounter::new();
    let orchestrator = orchestrator();
    let request = Request::get(hitcounter.url("")).with_path("garbage_data/not-json");

    let err = orchestrator
        .request::<Echo, RequestError>(&request, &RequestConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RequestError::Decode(_)), "{err:?}");

    // The raw payload itself was fine.
    let payload = orchestrator
        .request_raw(&request, &RequestConfig::default())
        .await
        .unwrap();
    assert_eq!(payload, "not-json");
}

#[tokio::test]
async fn test_timeout() {
    fanout_test::setup();

    let hitcounter = HitCounter::new();
    let timeouts = Timeouts {
        connect: Duration::from_secs(1),
        max_request: Duration::from_millis(100),
    };
    let transport = HttpTransport::new(create_client(&timeouts).unwrap(), timeouts, "fanout/test");
    let orchestrator = RequestOrchestrator::new(transport, 0);
    let request = Request::get(hitcounter.url("")).with_path("delay/1s/slow");

    let err = orchestrator
        .request_raw(&request, &RequestConfig::default())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        RawFailure::Transport(TransportError::Timeout(Duration::from_millis(100)))
    );
}

#[tokio::test]
async fn test_connection_refused() {
    fanout_test::setup();

    let addr = {
        // Bind and immediately release a port, nothing listens there afterwards.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let orchestrator = orchestrator();
    let request = Request::get(format!("http://{addr}")).with_path("items");

    let err = orchestrator
        .request::<serde_json::Value, RequestError>(&request, &RequestConfig::default())
        .await
        .unwrap_err();
    assert!(err.is_not_connected(), "{err:?}");
}

#[tokio::test]
async fn test_invalid_url() {
    fanout_test::setup();

    let orchestrator = orchestrator();
    let request = Request::get("not a url").with_path("items");

    let err = orchestrator
        .request_raw(&request, &RequestConfig::default())
        .await
        .unwrap_err();
    assert!(
        matches!(err, RawFailure::Transport(TransportError::InvalidRequest(_))),
        "{err:?}"
    );
}
