//! End-to-end executor behavior against a mock backend.

use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ngm_client::{ClientBuilder, RequestError, RequestOptions, RetryPolicy};
use ngm_core::storage::{PERMISSIONS_KEY, SESSION_KEYS, TABLE_LAYOUT_KEY, TOKEN_KEY, USER_KEY};
use ngm_core::{CancelController, CancelReason, TokenStore};

use crate::common::{harness, token_expiring_in};

#[tokio::test]
async fn health_returns_parsed_object() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "environment": "production" })))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server);
    let value = h.client.request("/health", RequestOptions::new()).await.unwrap();

    assert_eq!(value, Some(json!({ "environment": "production" })));
}

#[tokio::test]
async fn unauthorized_clears_session_and_redirects() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/secure"))
        .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server);
    h.store.set(TOKEN_KEY, &token_expiring_in(3600)).unwrap();
    h.store.set(USER_KEY, r#"{"user_id":"u-42"}"#).unwrap();
    h.store.set(PERMISSIONS_KEY, "[]").unwrap();
    h.store.set(TABLE_LAYOUT_KEY, "compact").unwrap();

    let value = h.client.request("/secure", RequestOptions::new()).await.unwrap();

    assert_eq!(value, None);
    for key in SESSION_KEYS {
        assert_eq!(h.store.get(key), None, "{key} should be cleared");
    }
    assert_eq!(h.store.get(TABLE_LAYOUT_KEY).as_deref(), Some("compact"));
    assert_eq!(h.navigator.visits(), vec!["login.html"]);
}

#[tokio::test]
async fn slow_endpoint_times_out_naming_the_path() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let h = harness(&server);
    let started = Instant::now();
    let err = h
        .client
        .request("/slow", RequestOptions::new().timeout(Duration::from_millis(50)))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(err.is_timeout(), "expected timeout, got {err:?}");
    assert!(err.to_string().contains("/slow"), "{err}");
    assert!(elapsed >= Duration::from_millis(50), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
}

#[tokio::test]
async fn silent_server_times_out_after_budget() {
    // Accepts connections and never answers.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _hold = tokio::spawn(async move {
        let mut open = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            open.push(socket);
        }
    });

    let server = MockServer::start().await;
    let h = harness(&server);
    let started = Instant::now();
    let err = h
        .client
        .request(
            &format!("http://{addr}/never"),
            RequestOptions::new().timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();

    assert!(
        matches!(err, RequestError::Timeout { budget, .. } if budget == Duration::from_millis(100))
    );
    assert!(started.elapsed() >= Duration::from_millis(100));
}

#[tokio::test]
async fn external_cancel_before_timeout_is_cancelled() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/reports"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let h = harness(&server);
    let controller = CancelController::new();
    let options = RequestOptions::new()
        .timeout(Duration::from_millis(500))
        .signal(controller.signal());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        controller.cancel(CancelReason::Aborted);
    });

    let started = Instant::now();
    let err = h.client.request("/reports", options).await.unwrap_err();
    canceller.await.unwrap();

    assert!(err.is_cancellation(), "expected cancellation, got {err:?}");
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn already_cancelled_signal_sends_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vendors"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let h = harness(&server);
    let controller = CancelController::new();
    controller.cancel(CancelReason::Superseded);

    let err = h
        .client
        .request("/vendors", RequestOptions::new().signal(controller.signal()))
        .await
        .unwrap_err();
    assert!(err.is_cancellation());
}

#[tokio::test]
async fn persistent_server_error_is_retried_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/unstable"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .expect(2)
        .mount(&server)
        .await;

    let h = harness(&server);
    let err = h
        .client
        .request("/unstable", RequestOptions::new())
        .await
        .unwrap_err();

    assert_eq!(err.status().map(|s| s.as_u16()), Some(503));
    assert!(matches!(err, RequestError::Http { ref body, .. } if body == "maintenance"));
}

#[tokio::test]
async fn retry_backoff_counts_against_the_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/unstable"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server);
    let client = ClientBuilder::new(server.uri(), h.store.clone(), h.session.clone())
        .retry_policy(RetryPolicy::default())
        .build()
        .unwrap();

    let err = client
        .request("/unstable", RequestOptions::new().timeout(Duration::from_millis(200)))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "expected timeout during backoff, got {err:?}");
}

#[tokio::test]
async fn error_body_excerpt_is_truncated() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(404).set_body_string("é".repeat(500)))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server);
    let err = h.client.get("/broken").await.unwrap_err();

    let RequestError::Http { body, status, .. } = err else {
        panic!("expected HTTP error");
    };
    assert_eq!(status.as_u16(), 404);
    assert_eq!(body.chars().count(), 200);
}

#[tokio::test]
async fn empty_and_invalid_bodies() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/vendors/7"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
        .mount(&server)
        .await;

    let h = harness(&server);
    assert_eq!(h.client.delete("/vendors/7").await.unwrap(), None);
    assert!(matches!(
        h.client.get("/page").await,
        Err(RequestError::Parse { .. })
    ));
}

#[tokio::test]
async fn bearer_token_is_attached_unless_skipped() {
    let server = MockServer::start().await;
    let h = harness(&server);
    let token = token_expiring_in(3600);
    h.store.set(TOKEN_KEY, &token).unwrap();

    Mock::given(method("GET"))
        .and(path("/me"))
        .and(header("authorization", format!("Bearer {token}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "u-42" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/public"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    assert!(h.client.get("/me").await.unwrap().is_some());
    h.client
        .request("/public", RequestOptions::new().skip_auth())
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let public = requests
        .iter()
        .find(|r| r.url.path() == "/public")
        .unwrap();
    assert!(public.headers.get("authorization").is_none());
    assert!(public.headers.get("x-request-id").is_some());
}

#[tokio::test]
async fn typed_post_round_trip() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct Created {
        id: u32,
        name: String,
    }

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/vendors"))
        .and(body_json(json!({ "name": "Acme Steel" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 9, "name": "Acme Steel" })))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server);
    let created: Option<Created> = h
        .client
        .request_json(
            "/vendors",
            RequestOptions::new()
                .method(reqwest::Method::POST)
                .json(json!({ "name": "Acme Steel" })),
        )
        .await
        .unwrap();

    assert_eq!(
        created,
        Some(Created {
            id: 9,
            name: "Acme Steel".into()
        })
    );
}

#[tokio::test]
async fn raw_response_is_returned_unread() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/export.csv"))
        .respond_with(ResponseTemplate::new(200).set_body_string("id,amount\n1,20\n"))
        .mount(&server)
        .await;

    let h = harness(&server);
    let response = h
        .client
        .request_raw("/export.csv", RequestOptions::new())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "id,amount\n1,20\n");
}
