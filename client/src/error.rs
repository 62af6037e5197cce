use std::time::Duration;

use reqwest::{Method, StatusCode};

use ngm_core::Rejection;
use ngm_types::truncate_with_ellipsis;

/// Body characters shown in [`RequestError::user_summary`].
const SUMMARY_BODY_CHARS: usize = 80;

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Request timed out after {}s: {url}", .budget.as_secs_f64())]
    Timeout { budget: Duration, url: String },

    /// Superseded by a newer call in the same cancel group, or aborted by the caller.
    #[error("Request cancelled: {url}")]
    Cancelled { url: String },

    #[error("{method} {url} failed with {status}: {body}")]
    Http {
        method: Method,
        url: String,
        status: StatusCode,
        /// First characters of the response body.
        body: String,
    },

    #[error("Response from {url} is not valid JSON: {source}")]
    Parse {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{method} {url} failed: {source}")]
    Transport {
        method: Method,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Invalid request URL {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

impl RequestError {
    /// Cancellations are expected control flow and never shown to the user.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    #[must_use]
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Short text for a notification, or `None` when nothing should be shown.
    #[must_use]
    pub fn user_summary(&self) -> Option<String> {
        match self {
            Self::Cancelled { .. } => None,
            Self::Timeout { budget, .. } => Some(format!(
                "The server did not respond within {}s. Please try again.",
                budget.as_secs_f64()
            )),
            Self::Http { status, body, .. } if body.trim().is_empty() => {
                Some(format!("The server returned {status}."))
            }
            Self::Http { status, body, .. } => Some(format!(
                "The server returned {status}: {}",
                truncate_with_ellipsis(body, SUMMARY_BODY_CHARS)
            )),
            Self::Parse { .. } => Some("The server sent a response that could not be read.".into()),
            Self::Transport { .. } => Some("Could not reach the server. Check your connection.".into()),
            Self::InvalidUrl { url, .. } => Some(format!("Invalid address: {url}")),
        }
    }
}

impl From<RequestError> for Rejection {
    fn from(error: RequestError) -> Self {
        if error.is_cancellation() {
            Self::cancellation(error.to_string())
        } else {
            Self::failure(error.to_string())
        }
    }
}
