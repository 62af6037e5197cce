//! Server-error retry.
//!
//! # Policy
//!
//! - Max retries: 1 (2 total attempts)
//! - Fixed backoff: 2 seconds
//! - Retryable: any 5xx response
//! - Not retried: transport errors, 4xx, 401 (handled by the session guard)
//!
//! Retries are sequential. The caller's cancellation budget covers the
//! backoff sleep, so a timed-out or superseded call stops waiting mid-backoff.
//!
//! Every attempt of one logical call carries the same `X-Request-Id`.

use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use uuid::Uuid;

pub const MAX_RETRIES: u32 = 1;
pub const RETRY_BACKOFF: Duration = Duration::from_millis(2000);

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Which methods may be reissued after a server error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryMethods {
    #[default]
    All,
    /// GET, HEAD, OPTIONS, PUT, DELETE.
    IdempotentOnly,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    pub backoff: Duration,
    pub methods: RetryMethods,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            backoff: RETRY_BACKOFF,
            methods: RetryMethods::All,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn allows(&self, method: &Method) -> bool {
        match self.methods {
            RetryMethods::All => true,
            RetryMethods::IdempotentOnly => is_idempotent(method),
        }
    }
}

#[must_use]
pub fn is_idempotent(method: &Method) -> bool {
    [
        Method::GET,
        Method::HEAD,
        Method::OPTIONS,
        Method::PUT,
        Method::DELETE,
    ]
    .contains(method)
}

#[must_use]
pub fn should_retry(status: StatusCode) -> bool {
    status.is_server_error()
}

#[must_use]
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Send a request, reissuing it once on a server error.
///
/// `build_request` is called for each attempt and must produce the identical
/// call. The last response is returned whatever its status; only transport
/// failures are errors.
pub async fn send_with_retry<F>(
    build_request: F,
    method: &Method,
    policy: &RetryPolicy,
) -> Result<Response, reqwest::Error>
where
    F: Fn() -> RequestBuilder,
{
    let mut retry_count = 0;
    loop {
        let response = build_request().send().await?;
        let status = response.status();

        if !should_retry(status) || retry_count >= policy.max_retries {
            return Ok(response);
        }
        if !policy.allows(method) {
            tracing::debug!(%method, %status, "Not retrying non-idempotent request");
            return Ok(response);
        }

        retry_count += 1;
        tracing::debug!(
            %status,
            retry_count,
            delay_ms = policy.backoff.as_millis(),
            "Retrying request after server error"
        );
        drop(response);
        tokio::time::sleep(policy.backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_server_errors_retry() {
        assert!(should_retry(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(should_retry(StatusCode::SERVICE_UNAVAILABLE));
        assert!(should_retry(StatusCode::GATEWAY_TIMEOUT));

        assert!(!should_retry(StatusCode::OK));
        assert!(!should_retry(StatusCode::BAD_REQUEST));
        assert!(!should_retry(StatusCode::UNAUTHORIZED));
        assert!(!should_retry(StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn idempotent_only_policy_skips_post_and_patch() {
        let policy = RetryPolicy {
            methods: RetryMethods::IdempotentOnly,
            ..RetryPolicy::default()
        };
        assert!(policy.allows(&Method::GET));
        assert!(policy.allows(&Method::DELETE));
        assert!(!policy.allows(&Method::POST));
        assert!(!policy.allows(&Method::PATCH));

        assert!(RetryPolicy::default().allows(&Method::POST));
    }

    #[test]
    fn defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.backoff, Duration::from_secs(2));
        assert_ne!(generate_request_id(), generate_request_id());
    }
}
