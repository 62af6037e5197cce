//! Shared test utilities and fixtures

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::{Value, json};
use wiremock::MockServer;

use ngm_client::{Client, ClientBuilder, RetryPolicy};
use ngm_config::ResolvedConfig;
use ngm_core::{MemoryTokenStore, Navigator, Notifier, SessionGuard, TokenStore};

/// Backoff short enough to keep retry tests fast.
pub const TEST_BACKOFF: Duration = Duration::from_millis(10);

/// Unsigned three-segment token with the given claims.
pub fn mint_token(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
    format!("{header}.{payload}.test-signature")
}

pub fn token_expiring_in(seconds: i64) -> String {
    let exp = chrono::Utc::now().timestamp() + seconds;
    mint_token(&json!({ "sub": "u-42", "role": "manager", "exp": exp }))
}

#[derive(Default)]
pub struct RecordingNavigator {
    pub visits: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn visits(&self) -> Vec<String> {
        self.visits.lock().unwrap().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, location: &str) {
        self.visits.lock().unwrap().push(location.to_string());
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub errors: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn errors(&self) -> Vec<(String, String)> {
        self.errors.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn success(&self, _: &str, _: &str) {}
    fn warning(&self, _: &str, _: &str) {}
    fn error(&self, title: &str, message: &str, _details: Option<&str>) {
        self.errors
            .lock()
            .unwrap()
            .push((title.to_string(), message.to_string()));
    }
}

/// Client wired to an in-memory store and a recording navigator.
pub struct Harness {
    pub store: Arc<MemoryTokenStore>,
    pub navigator: Arc<RecordingNavigator>,
    pub session: Arc<SessionGuard>,
    pub client: Client,
}

pub fn harness(server: &MockServer) -> Harness {
    let store = Arc::new(MemoryTokenStore::new());
    let navigator = Arc::new(RecordingNavigator::default());
    let session = Arc::new(SessionGuard::new(
        store.clone(),
        navigator.clone(),
        "login.html",
        vec!["login".into(), "landing".into(), "index".into()],
    ));
    let client = test_builder(&server.uri(), store.clone(), session.clone())
        .build()
        .unwrap();
    Harness {
        store,
        navigator,
        session,
        client,
    }
}

pub fn test_builder(
    api_base: &str,
    store: Arc<dyn TokenStore>,
    session: Arc<SessionGuard>,
) -> ClientBuilder {
    ClientBuilder::new(api_base, store, session).retry_policy(RetryPolicy {
        backoff: TEST_BACKOFF,
        ..RetryPolicy::default()
    })
}

/// Defaults as if no config file or environment overrides existed.
pub fn test_config(api_base: &str) -> ResolvedConfig {
    let mut config = ngm_config::resolve_with(None, |_| None).unwrap();
    config.api_base = api_base.trim_end_matches('/').to_string();
    config.store_path = None;
    config
}
