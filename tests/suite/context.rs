//! Application context: cancel groups and failure reporting end to end.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ngm_client::{AppContext, RequestError, RequestOptions};
use ngm_core::{MemoryTokenStore, SessionGuard, TokenStore};

use crate::common::{RecordingNavigator, RecordingNotifier, test_builder, test_config};

fn context(server: &MockServer, notifier: Arc<RecordingNotifier>) -> AppContext {
    let config = test_config(&server.uri());
    let store: Arc<dyn TokenStore> = Arc::new(MemoryTokenStore::new());
    let session = Arc::new(SessionGuard::new(
        store.clone(),
        Arc::new(RecordingNavigator::default()),
        config.login_path.clone(),
        config.public_views.clone(),
    ));
    AppContext::with_client(
        test_builder(&config.api_base, store.clone(), session.clone()),
        config,
        store,
        notifier,
        session,
    )
    .unwrap()
}

#[tokio::test]
async fn newer_call_in_group_supersedes_older() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vendors"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{ "id": 1 }]))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let ctx = context(&server, Arc::new(RecordingNotifier::default()));

    let (first, second) = tokio::join!(
        ctx.request_in_group("vendor-list", "/vendors?page=1", RequestOptions::new()),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ctx.request_in_group("vendor-list", "/vendors?page=2", RequestOptions::new())
                .await
        }
    );

    assert!(matches!(first, Err(RequestError::Cancelled { .. })), "{first:?}");
    assert_eq!(second.unwrap(), Some(json!([{ "id": 1 }])));
    assert_eq!(ctx.groups.len(), 1);
    ctx.shutdown();
}

#[tokio::test]
async fn background_failures_are_reported_and_cancellations_are_not() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/dashboard"))
        .respond_with(ResponseTemplate::new(500).set_body_string("database unavailable"))
        .mount(&server)
        .await;

    let notifier = Arc::new(RecordingNotifier::default());
    let ctx = context(&server, notifier.clone());

    let client = ctx.client.clone();
    ctx.spawn(async move { client.get("/dashboard").await.map(drop) })
        .await
        .unwrap();

    let superseded = ctx.groups.begin("charts");
    let _current = ctx.groups.begin("charts");
    let client = ctx.client.clone();
    ctx.spawn(async move {
        client
            .request("/dashboard", RequestOptions::new().signal(superseded))
            .await
            .map(drop)
    })
    .await
    .unwrap();

    // Let the monitor drain its channel.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let errors = notifier.errors();
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert_eq!(errors[0].0, "Unexpected Error");
    assert!(errors[0].1.contains("500"), "{}", errors[0].1);
    assert!(errors[0].1.chars().count() <= 100);
    ctx.shutdown();
}
