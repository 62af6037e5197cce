//! Bearer token inspection and the session guard.
//!
//! Tokens are `header.payload.signature`. Only the payload is read, and only
//! to learn who the session belongs to and when it expires; the signature is
//! the backend's business.
//!
//! # State machine
//!
//! ```text
//! Unauthenticated --(valid token stored)--> Authenticated
//! Authenticated --(expiry | 401 | logout)--> Unauthenticated (+ redirect to login)
//! ```
//!
//! Leaving `Authenticated` always ends with a navigation to the login
//! location; the guard never downgrades silently in place.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use ngm_types::{PermissionSnapshot, UserProfile};

use crate::notify::Navigator;
use crate::storage::{PERMISSIONS_KEY, SESSION_KEYS, StoreError, TOKEN_KEY, TokenStore, USER_KEY};

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token is not three dot-separated segments")]
    InvalidFormat,
    #[error("token payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("token payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("token payload is not a JSON object")]
    NotAnObject,
    #[error("token claim `{0}` is not a valid timestamp")]
    InvalidTimestamp(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("token expired at {0}")]
    Expired(DateTime<Utc>),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to serialize session data: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Claims decoded from a bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub subject: Option<String>,
    pub role: Option<String>,
    pub issued_at: Option<DateTime<Utc>>,
    /// `None` means the token does not expire.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Decode the payload segment of `token`.
    pub fn decode(token: &str) -> Result<Self, TokenError> {
        let mut parts = token.trim().split('.');
        let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(_), Some(payload), Some(_), None) if !payload.is_empty() => payload,
            _ => return Err(TokenError::InvalidFormat),
        };

        let payload = payload.trim_end_matches('=');
        let bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .or_else(|_| STANDARD_NO_PAD.decode(payload))?;
        let Value::Object(claims) = serde_json::from_slice::<Value>(&bytes)? else {
            return Err(TokenError::NotAnObject);
        };

        Ok(Self {
            subject: string_claim(&claims, "sub"),
            role: string_claim(&claims, "role"),
            issued_at: timestamp_claim(&claims, "iat").unwrap_or_else(|e| {
                tracing::debug!("Ignoring token claim: {e}");
                None
            }),
            expires_at: timestamp_claim(&claims, "exp")?,
        })
    }

    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

fn string_claim(claims: &Map<String, Value>, name: &str) -> Option<String> {
    match claims.get(name)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Seconds since the epoch, possibly fractional, converted at millisecond precision.
///
/// Values beyond chrono's range saturate, so an absurdly distant `exp` never expires.
fn timestamp_claim(
    claims: &Map<String, Value>,
    name: &'static str,
) -> Result<Option<DateTime<Utc>>, TokenError> {
    let Some(value) = claims.get(name).filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let seconds = value.as_f64().ok_or(TokenError::InvalidTimestamp(name))?;
    let millis = (seconds * 1000.0).round();
    let saturated = if millis > 0.0 {
        DateTime::<Utc>::MAX_UTC
    } else {
        DateTime::<Utc>::MIN_UTC
    };
    Ok(Some(
        DateTime::from_timestamp_millis(millis as i64).unwrap_or(saturated),
    ))
}

/// Whether `token` is well-formed and unexpired right now. Never panics.
#[must_use]
pub fn is_valid(token: &str) -> bool {
    is_valid_at(token, Utc::now())
}

/// Whether `token` is well-formed and unexpired at `now`.
#[must_use]
pub fn is_valid_at(token: &str, now: DateTime<Utc>) -> bool {
    match Session::decode(token) {
        Ok(session) => !session.is_expired_at(now),
        Err(e) => {
            tracing::debug!("Rejecting bearer token: {e}");
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
}

/// Gate for protected views and the single handler for session invalidation.
pub struct SessionGuard {
    store: Arc<dyn TokenStore>,
    navigator: Arc<dyn Navigator>,
    login_path: String,
    public_views: Vec<String>,
    redirecting: AtomicBool,
}

impl SessionGuard {
    pub fn new(
        store: Arc<dyn TokenStore>,
        navigator: Arc<dyn Navigator>,
        login_path: impl Into<String>,
        public_views: Vec<String>,
    ) -> Self {
        Self {
            store,
            navigator,
            login_path: login_path.into(),
            public_views: public_views
                .iter()
                .map(|view| view_name(view).to_string())
                .collect(),
            redirecting: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    #[must_use]
    pub fn is_public(&self, view: &str) -> bool {
        let name = view_name(view);
        self.public_views.iter().any(|public| public == name)
    }

    /// Decide whether `view` may render.
    ///
    /// Public views always pass. For protected views a missing or invalid
    /// token clears the session and redirects to login. Call this before any
    /// protected content is produced.
    pub fn check_access(&self, view: &str) -> bool {
        if self.is_public(view) {
            return true;
        }
        match self.store.token() {
            Some(token) if is_valid(&token) => true,
            Some(_) => {
                tracing::info!(view, "Stored session is invalid or expired");
                self.clear_and_redirect();
                false
            }
            None => {
                tracing::info!(view, "No session for protected view");
                self.clear_and_redirect();
                false
            }
        }
    }

    /// Drop token, profile and permissions, then navigate to login.
    ///
    /// Storage is cleared on every call; navigation happens once until the
    /// next successful [`login`](Self::login), so a burst of 401s produces a
    /// single redirect.
    pub fn clear_and_redirect(&self) {
        self.remove_session_keys();

        if self.redirecting.swap(true, Ordering::SeqCst) {
            tracing::debug!("Redirect to login already in progress");
            return;
        }
        tracing::info!(location = %self.login_path, "Session ended; redirecting to login");
        self.navigator.navigate(&self.login_path);
    }

    /// Store a freshly issued session.
    ///
    /// The token must decode and be unexpired; nothing is written otherwise.
    /// If a write fails, every session key is removed before the error returns.
    pub fn login(
        &self,
        token: &str,
        profile: Option<&UserProfile>,
        permissions: Option<&PermissionSnapshot>,
    ) -> Result<Session, SessionError> {
        let token = token.trim();
        let session = Session::decode(token)?;
        if let Some(expires_at) = session.expires_at
            && session.is_expired_at(Utc::now())
        {
            return Err(SessionError::Expired(expires_at));
        }

        let profile = profile.map(serde_json::to_string).transpose()?;
        let permissions = permissions.map(serde_json::to_string).transpose()?;

        if let Err(e) = self.write_session(token, profile.as_deref(), permissions.as_deref()) {
            tracing::warn!("Login failed while storing the session; clearing it: {e}");
            self.remove_session_keys();
            return Err(e.into());
        }

        self.redirecting.store(false, Ordering::SeqCst);
        tracing::info!(subject = ?session.subject, "Session started");
        Ok(session)
    }

    /// The token goes in last so a failed write never leaves it next to
    /// stale profile or permissions.
    fn write_session(
        &self,
        token: &str,
        profile: Option<&str>,
        permissions: Option<&str>,
    ) -> Result<(), StoreError> {
        match profile {
            Some(profile) => self.store.set(USER_KEY, profile)?,
            None => self.store.remove(USER_KEY)?,
        }
        match permissions {
            Some(permissions) => self.store.set(PERMISSIONS_KEY, permissions)?,
            None => self.store.remove(PERMISSIONS_KEY)?,
        }
        self.store.set(TOKEN_KEY, token)
    }

    fn remove_session_keys(&self) {
        for key in SESSION_KEYS {
            if let Err(e) = self.store.remove(key) {
                tracing::warn!(key, "Failed to clear session key: {e}");
            }
        }
    }

    /// Explicit logout.
    pub fn logout(&self) {
        self.clear_and_redirect();
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        if self.session().is_some() {
            SessionState::Authenticated
        } else {
            SessionState::Unauthenticated
        }
    }

    /// The current session, if the stored token is valid.
    #[must_use]
    pub fn session(&self) -> Option<Session> {
        let token = self.store.token()?;
        Session::decode(&token)
            .ok()
            .filter(|session| !session.is_expired_at(Utc::now()))
    }

    #[must_use]
    pub fn profile(&self) -> Option<UserProfile> {
        let raw = self.store.get(USER_KEY)?;
        serde_json::from_str(&raw)
            .inspect_err(|e| tracing::warn!("Ignoring unreadable cached profile: {e}"))
            .ok()
    }

    /// Cached module permissions. Unreadable data yields an empty snapshot.
    #[must_use]
    pub fn permissions(&self) -> PermissionSnapshot {
        let Some(raw) = self.store.get(PERMISSIONS_KEY) else {
            return PermissionSnapshot::default();
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!("Ignoring unreadable cached permissions: {e}");
            PermissionSnapshot::default()
        })
    }

    #[must_use]
    pub fn can_view(&self, module_key: &str) -> bool {
        self.permissions().can_view(module_key)
    }
}

/// `"/app/login.html?next=x"` -> `"login"`. The site root is `"index"`.
fn view_name(view: &str) -> &str {
    let view = view.split(['?', '#']).next().unwrap_or(view);
    let view = view.rsplit('/').next().unwrap_or(view);
    match view.strip_suffix(".html").unwrap_or(view) {
        "" => "index",
        name => name,
    }
}
