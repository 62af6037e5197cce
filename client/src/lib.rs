//! HTTP executor for the NGM backend.
//!
//! Every call runs under one wall-clock budget that covers the network
//! exchange, the retry backoff and the body read. The budget is combined with
//! an optional caller signal (usually from a
//! [`CancelGroupRegistry`](ngm_core::CancelGroupRegistry)); whichever fires
//! first stops the call. A 401 never reaches the caller as an error: the
//! session guard clears local state and redirects, and the call resolves to
//! `Ok(None)`.

mod context;
mod error;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use ngm_config::ResolvedConfig;
use ngm_core::{CancelReason, CancelSignal, SessionGuard, TokenStore, combine, deadline};
use ngm_types::take_chars;

pub use context::AppContext;
pub use error::RequestError;
pub use retry::{RetryMethods, RetryPolicy};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);
/// Characters of an error response body kept in [`RequestError::Http`].
pub const ERROR_EXCERPT_CHARS: usize = 200;

const MAX_ERROR_BODY_BYTES: usize = 4 * 1024;
const CONNECT_TIMEOUT_SECS: u64 = 10;
const TCP_KEEPALIVE_SECS: u64 = 60;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;
const POOL_MAX_IDLE_PER_HOST: usize = 4;

/// Request payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    Text(String),
}

/// Per-call options. Everything not set here uses the client's defaults.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: Method,
    /// Wall-clock budget for the whole call. Defaults to [`DEFAULT_TIMEOUT`].
    pub timeout: Option<Duration>,
    /// Additional cancellation source.
    pub signal: Option<CancelSignal>,
    /// Omit the bearer header.
    pub skip_auth: bool,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: Option<Body>,
}

impl RequestOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn signal(mut self, signal: CancelSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn skip_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(Body::Json(body));
        self
    }

    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.body = Some(Body::Text(body.into()));
        self
    }
}

pub struct ClientBuilder {
    api_base: String,
    store: Arc<dyn TokenStore>,
    session: Arc<SessionGuard>,
    retry: RetryPolicy,
    default_timeout: Duration,
    http: Option<reqwest::Client>,
}

impl ClientBuilder {
    pub fn new(
        api_base: impl Into<String>,
        store: Arc<dyn TokenStore>,
        session: Arc<SessionGuard>,
    ) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            store,
            session,
            retry: RetryPolicy::default(),
            default_timeout: DEFAULT_TIMEOUT,
            http: None,
        }
    }

    /// Builder seeded from resolved configuration.
    pub fn from_config(
        config: &ResolvedConfig,
        store: Arc<dyn TokenStore>,
        session: Arc<SessionGuard>,
    ) -> Self {
        let mut builder = Self::new(config.api_base.clone(), store, session);
        if let Some(timeout) = config.timeout {
            builder.default_timeout = timeout;
        }
        if let Some(backoff) = config.retry_backoff {
            builder.retry.backoff = backoff;
        }
        if config.retry_idempotent_only {
            builder.retry.methods = RetryMethods::IdempotentOnly;
        }
        builder
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Use a preconfigured transport instead of the default one.
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    pub fn build(self) -> Result<Client, reqwest::Error> {
        let http = match self.http {
            Some(http) => http,
            None => base_client_builder().build()?,
        };
        Ok(Client {
            http,
            api_base: self.api_base,
            store: self.store,
            session: self.session,
            retry: self.retry,
            default_timeout: self.default_timeout,
        })
    }
}

/// Transport defaults: keepalive, a small idle pool, and a cookie store so
/// server-set cookies ride along with every call.
fn base_client_builder() -> reqwest::ClientBuilder {
    let mut default_headers = HeaderMap::new();
    default_headers.insert(
        reqwest::header::ACCEPT,
        HeaderValue::from_static("application/json"),
    );

    reqwest::Client::builder()
        .user_agent(concat!("ngm/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
        .cookie_store(true)
        .default_headers(default_headers)
}

#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    api_base: String,
    store: Arc<dyn TokenStore>,
    session: Arc<SessionGuard>,
    retry: RetryPolicy,
    default_timeout: Duration,
}

enum Read {
    Raw,
    Json,
}

enum Outcome {
    Raw(Response),
    Json(Option<Value>),
    SessionExpired,
}

impl Client {
    #[must_use]
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    #[must_use]
    pub fn session(&self) -> &Arc<SessionGuard> {
        &self.session
    }

    /// Root-relative paths are joined to the API base; anything else must be absolute.
    pub fn resolve_url(&self, url: &str) -> Result<Url, RequestError> {
        let full = if url.starts_with('/') {
            format!("{}{url}", self.api_base)
        } else {
            url.to_string()
        };
        Url::parse(&full).map_err(|source| RequestError::InvalidUrl { url: full, source })
    }

    /// Issue a call and parse the body as JSON.
    ///
    /// An empty body and a 401 both yield `Ok(None)`.
    pub async fn request(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<Option<Value>, RequestError> {
        match self.execute(url, options, Read::Json).await? {
            Outcome::Json(value) => Ok(value),
            Outcome::SessionExpired | Outcome::Raw(_) => Ok(None),
        }
    }

    /// Like [`request`](Self::request), but hand back the successful response
    /// unread. Reading its body happens outside the call's budget.
    pub async fn request_raw(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<Option<Response>, RequestError> {
        match self.execute(url, options, Read::Raw).await? {
            Outcome::Raw(response) => Ok(Some(response)),
            Outcome::SessionExpired | Outcome::Json(_) => Ok(None),
        }
    }

    /// Like [`request`](Self::request), deserializing the body into `T`.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<Option<T>, RequestError> {
        let resolved = self.resolve_url(url)?;
        let Some(value) = self.request(url, options).await? else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|source| RequestError::Parse {
                url: resolved.to_string(),
                source,
            })
    }

    pub async fn get(&self, url: &str) -> Result<Option<Value>, RequestError> {
        self.request(url, RequestOptions::new()).await
    }

    pub async fn post(&self, url: &str, body: Value) -> Result<Option<Value>, RequestError> {
        self.request(url, RequestOptions::new().method(Method::POST).json(body))
            .await
    }

    pub async fn patch(&self, url: &str, body: Value) -> Result<Option<Value>, RequestError> {
        self.request(url, RequestOptions::new().method(Method::PATCH).json(body))
            .await
    }

    pub async fn delete(&self, url: &str) -> Result<Option<Value>, RequestError> {
        self.request(url, RequestOptions::new().method(Method::DELETE))
            .await
    }

    async fn execute(
        &self,
        url: &str,
        options: RequestOptions,
        read: Read,
    ) -> Result<Outcome, RequestError> {
        let RequestOptions {
            method,
            timeout,
            signal,
            skip_auth,
            headers,
            query,
            body,
        } = options;

        let url = self.resolve_url(url)?;
        let budget = timeout.unwrap_or(self.default_timeout);
        // Dropping `_timer` on any exit releases the timeout task.
        let (timeout_signal, _timer) = deadline(budget);
        let cancel = match &signal {
            Some(external) => combine(&[timeout_signal, external.clone()]),
            None => timeout_signal,
        };

        let token = if skip_auth || headers.contains_key(AUTHORIZATION) {
            None
        } else {
            self.store.token()
        };
        let request_id = retry::generate_request_id();

        let build_request = || {
            let mut builder = self
                .http
                .request(method.clone(), url.clone())
                .headers(headers.clone())
                .header(retry::REQUEST_ID_HEADER, &request_id);
            if let Some(token) = &token {
                builder = builder.bearer_auth(token);
            }
            if !query.is_empty() {
                builder = builder.query(&query);
            }
            match &body {
                Some(Body::Json(value)) => builder.json(value),
                Some(Body::Text(text)) => builder.body(text.clone()),
                None => builder,
            }
        };

        let perform = async {
            tracing::debug!(%method, %url, request_id = %request_id, "Sending request");
            let response = retry::send_with_retry(build_request, &method, &self.retry)
                .await
                .map_err(|source| RequestError::Transport {
                    method: method.clone(),
                    url: url.to_string(),
                    source,
                })?;
            self.interpret(&method, &url, response, read).await
        };

        tokio::select! {
            biased;
            reason = cancel.cancelled() => Err(stopped(&method, &url, reason)),
            result = perform => result,
        }
    }

    async fn interpret(
        &self,
        method: &Method,
        url: &Url,
        response: Response,
        read: Read,
    ) -> Result<Outcome, RequestError> {
        let status = response.status();

        if status.is_success() || status.is_redirection() {
            return match read {
                Read::Raw => Ok(Outcome::Raw(response)),
                Read::Json => {
                    let text = response
                        .text()
                        .await
                        .map_err(|source| RequestError::Transport {
                            method: method.clone(),
                            url: url.to_string(),
                            source,
                        })?;
                    parse_body(url, &text).map(Outcome::Json)
                }
            };
        }

        if status == StatusCode::UNAUTHORIZED {
            tracing::info!(%method, %url, "Server rejected the session");
            self.session.clear_and_redirect();
            return Ok(Outcome::SessionExpired);
        }

        let body = read_capped_error_body(response).await;
        tracing::warn!(%method, %url, %status, "Request failed");
        Err(RequestError::Http {
            method: method.clone(),
            url: url.to_string(),
            status,
            body: take_chars(&body, ERROR_EXCERPT_CHARS).to_string(),
        })
    }
}

fn parse_body(url: &Url, text: &str) -> Result<Option<Value>, RequestError> {
    if text.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text)
        .map(Some)
        .map_err(|source| RequestError::Parse {
            url: url.to_string(),
            source,
        })
}

/// Error for a call stopped by its combined signal. `reason` is whichever
/// constituent fired first, so a timer that also elapses later is ignored.
fn stopped(method: &Method, url: &Url, reason: CancelReason) -> RequestError {
    match reason {
        CancelReason::Timeout { budget } => {
            tracing::warn!(%method, %url, budget_ms = budget.as_millis(), "Request timed out");
            RequestError::Timeout {
                budget,
                url: url.to_string(),
            }
        }
        reason => {
            tracing::debug!(%method, %url, ?reason, "Request cancelled");
            RequestError::Cancelled {
                url: url.to_string(),
            }
        }
    }
}

async fn read_capped_error_body(response: Response) -> String {
    use futures_util::StreamExt;
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            break;
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}
