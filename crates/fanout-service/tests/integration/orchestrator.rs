use std::time::Duration;

use fanout_service::CachePriority;
use fanout_service::error::{RawFailure, RequestError, TransportError};
use fanout_service::orchestrator::RequestOrchestrator;
use fanout_service::request::{Request, RequestConfig};
use fanout_test::MockTransport;

const BASE: &str = "https://api.example.com";

fn url(path: &str) -> String {
    format!("{BASE}/{path}")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_callers_share_one_call() {
    fanout_test::setup();

    let transport = MockTransport::new().with_delay(Duration::from_millis(100));
    transport.respond(&url("items"), 200, "[1,2,3]");
    let orchestrator = RequestOrchestrator::new(transport.clone(), 1_000_000);

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                let request = Request::get(BASE).with_path("items");
                orchestrator
                    .request::<Vec<u32>, RequestError>(&request, &RequestConfig::default())
                    .await
            })
        })
        .collect();

    for task in futures::future::join_all(tasks).await {
        assert_eq!(task.unwrap().unwrap(), [1, 2, 3]);
    }
    assert_eq!(transport.calls(), 1);
    assert_eq!(orchestrator.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_distinct_requests_are_not_coalesced() {
    fanout_test::setup();

    let transport = MockTransport::new().with_delay(Duration::from_millis(100));
    transport
        .respond(&url("a"), 200, "a")
        .respond(&url("b"), 200, "b");
    let orchestrator = RequestOrchestrator::new(transport.clone(), 1_000_000);
    let config = RequestConfig::default();

    let a = Request::get(BASE).with_path("a");
    let b = Request::get(BASE).with_path("b");
    let mut b_with_header = b.clone();
    b_with_header.set_auth_token("other user");

    let (a, b, b_with_header) = futures::join!(
        orchestrator.request_raw(&a, &config),
        orchestrator.request_raw(&b, &config),
        orchestrator.request_raw(&b_with_header, &config),
    );
    assert_eq!(a.unwrap(), "a");
    assert_eq!(b.unwrap(), "b");
    assert_eq!(b_with_header.unwrap(), "b");

    assert_eq!(transport.calls_for(&url("a")), 1);
    assert_eq!(transport.calls_for(&url("b")), 2);
}

#[tokio::test(start_paused = true)]
async fn test_eviction_by_priority() {
    fanout_test::setup();

    let transport = MockTransport::new();
    transport
        .respond(&url("a"), 200, vec![b'a'; 60])
        .respond(&url("b"), 200, vec![b'b'; 30])
        .respond(&url("c"), 200, vec![b'c'; 50]);
    let orchestrator = RequestOrchestrator::new(transport.clone(), 100);

    let fetch = |path: &'static str, priority: CachePriority| {
        let orchestrator = orchestrator.clone();
        async move {
            let request = Request::get(BASE).with_path(path);
            let config = RequestConfig::default().cache_priority(priority);
            orchestrator.request_raw(&request, &config).await.unwrap()
        }
    };

    fetch("a", CachePriority::Low).await;
    fetch("b", CachePriority::High).await;
    assert_eq!(orchestrator.cache_usage(), 90);

    // Making room for `c` evicts the lower priority `a`.
    fetch("c", CachePriority::Medium).await;
    assert_eq!(orchestrator.cache_usage(), 80);
    assert_eq!(transport.calls(), 3);

    fetch("b", CachePriority::High).await;
    fetch("c", CachePriority::Medium).await;
    assert_eq!(transport.calls(), 3);

    fetch("a", CachePriority::Low).await;
    assert_eq!(transport.calls_for(&url("a")), 2);
}

#[tokio::test(start_paused = true)]
async fn test_oversized_response_is_not_cached() {
    fanout_test::setup();

    let transport = MockTransport::new();
    transport.respond(&url("large"), 200, vec![0; 101]);
    let orchestrator = RequestOrchestrator::new(transport.clone(), 100);
    let request = Request::get(BASE).with_path("large");

    for _ in 0..2 {
        let payload = orchestrator
            .request_raw(&request, &RequestConfig::default())
            .await
            .unwrap();
        assert_eq!(payload.len(), 101);
    }
    assert_eq!(transport.calls(), 2);
    assert_eq!(orchestrator.cache_usage(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failures_start_over() {
    fanout_test::setup();

    let transport = MockTransport::new().with_delay(Duration::from_millis(10));
    transport.fail(&url("flaky"), TransportError::Connect("offline".into()));
    let orchestrator = RequestOrchestrator::new(transport.clone(), 1_000_000);
    let request = Request::get(BASE).with_path("flaky");
    let config = RequestConfig::default();

    let err = orchestrator.request_raw(&request, &config).await.unwrap_err();
    assert_eq!(
        err,
        RawFailure::Transport(TransportError::Connect("offline".into()))
    );

    // Once the failure is delivered, the next request goes to the transport again.
    transport.respond(&url("flaky"), 200, "back");
    let payload = orchestrator.request_raw(&request, &config).await.unwrap();
    assert_eq!(payload, "back");
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_handler_style() {
    fanout_test::setup();

    let transport = MockTransport::new().with_delay(Duration::from_millis(50));
    transport.respond(&url("items"), 200, r#"{"count": 3}"#);
    let orchestrator = RequestOrchestrator::new(transport.clone(), 1_000_000);

    #[derive(Debug, serde::Deserialize)]
    struct Count {
        count: u32,
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let tx = tx.clone();
            orchestrator.request_with_handler(
                Request::get(BASE).with_path("items"),
                RequestConfig::default(),
                move |result: Result<Count, RequestError>| {
                    tx.send(result.unwrap().count).unwrap();
                },
            )
        })
        .collect();
    drop(tx);

    for handle in handles {
        handle.await.unwrap();
    }

    let mut counts = Vec::new();
    while let Some(count) = rx.recv().await {
        counts.push(count);
    }
    assert_eq!(counts, [3, 3, 3]);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_request_description_reaches_transport() {
    fanout_test::setup();

    let transport = MockTransport::new();
    let orchestrator = RequestOrchestrator::new(transport.clone(), 0);

    let mut request = Request::put(BASE)
        .with_path("users/42")
        .with_param("field", "name")
        .with_query("notify", true)
        .with_body("Jane");
    request.set_content_type("text/plain");

    let err = orchestrator
        .request_raw(&request, &RequestConfig::default())
        .await
        .unwrap_err();
    assert_eq!(err.response().map(|response| response.status), Some(404));

    let sent = transport.requests().remove(0);
    assert_eq!(sent.method.as_str(), "PUT");
    assert_eq!(sent.url, url("users/42/field/name?notify=true"));
    assert_eq!(
        sent.headers,
        [("Content-Type".to_owned(), "text/plain".to_owned())]
    );
    assert_eq!(sent.body.as_deref(), Some(&b"Jane"[..]));
}
