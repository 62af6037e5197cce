//! Configuration loading and API base URL resolution.
//!
//! Configuration lives in `~/.ngm/config.toml`:
//!
//! ```toml
//! [api]
//! base_url = "https://api.example.com"
//! environment = "production"
//!
//! [request]
//! timeout_ms = 30000
//! retry_backoff_ms = 2000
//! retry_idempotent_only = false
//!
//! [session]
//! login_path = "login.html"
//! public_views = ["login", "landing", "index"]
//! store_path = "${HOME}/.ngm/session.json"
//! ```
//!
//! String values support `${VAR}` expansion. `NGM_API_BASE` and `NGM_ENV`
//! override the `[api]` section. A missing file is not an error: the resolver
//! falls back to the local development backend.

use serde::Deserialize;
use std::{env, fmt, fs, path::PathBuf, time::Duration};
use url::Url;

/// Backend used when nothing else is configured.
pub const DEFAULT_DEV_BASE_URL: &str = "http://127.0.0.1:8000";
/// Where session invalidation sends the user.
pub const DEFAULT_LOGIN_PATH: &str = "login.html";
/// Views reachable without a session.
pub const DEFAULT_PUBLIC_VIEWS: &[&str] = &["login", "landing", "index"];

pub const API_BASE_ENV: &str = "NGM_API_BASE";
pub const ENVIRONMENT_ENV: &str = "NGM_ENV";

#[derive(Debug, Default, Deserialize)]
pub struct NgmConfig {
    pub api: Option<ApiSection>,
    pub request: Option<RequestSection>,
    pub session: Option<SessionSection>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiSection {
    pub base_url: Option<String>,
    pub environment: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RequestSection {
    /// Wall-clock budget per logical call. Default: 30000.
    pub timeout_ms: Option<u64>,
    /// Delay before the single retry after a 5xx. Default: 2000.
    pub retry_backoff_ms: Option<u64>,
    /// Only retry methods that are safe to replay.
    #[serde(default)]
    pub retry_idempotent_only: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionSection {
    pub login_path: Option<String>,
    pub public_views: Option<Vec<String>>,
    /// File backing the token store. Defaults to `~/.ngm/session.json`.
    pub store_path: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid API base URL {value:?}: {source}")]
    InvalidBaseUrl {
        value: String,
        source: url::ParseError,
    },
    #[error("unknown environment {0:?} (expected development or production)")]
    UnknownEnvironment(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" | "local" => Some(Self::Development),
            "prod" | "production" => Some(Self::Production),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }

    /// Loopback hosts are development backends; everything else is production.
    fn infer(base: &Url) -> Self {
        match base.host_str() {
            Some("localhost" | "127.0.0.1" | "[::1]") => Self::Development,
            _ => Self::Production,
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the request layer needs from configuration, fully resolved.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute base URL without a trailing slash.
    pub api_base: String,
    pub environment: Environment,
    pub timeout: Option<Duration>,
    pub retry_backoff: Option<Duration>,
    pub retry_idempotent_only: bool,
    pub login_path: String,
    pub public_views: Vec<String>,
    pub store_path: Option<PathBuf>,
}

impl NgmConfig {
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(path).map(Some)
    }

    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {:?}: {}", path, err);
                return Err(ConfigError::Read { path, source: err });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(err) => {
                tracing::warn!("Failed to parse config at {:?}: {}", path, err);
                Err(ConfigError::Parse { path, source: err })
            }
        }
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }
}

/// Resolve configuration against the process environment.
pub fn resolve(config: Option<&NgmConfig>) -> Result<ResolvedConfig, ConfigError> {
    resolve_with(config, |key| env::var(key).ok())
}

/// Resolve configuration using `lookup` for environment variables.
///
/// Precedence for the base URL: `NGM_API_BASE`, then `[api] base_url`, then
/// [`DEFAULT_DEV_BASE_URL`]. The environment is taken from `NGM_ENV`, then
/// `[api] environment`, and otherwise inferred from the base URL host.
pub fn resolve_with<F>(config: Option<&NgmConfig>, lookup: F) -> Result<ResolvedConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let api = config.and_then(|c| c.api.as_ref());
    let request = config.and_then(|c| c.request.as_ref());
    let session = config.and_then(|c| c.session.as_ref());
    let expand = |value: &str| expand_vars_with(value, &lookup);

    let raw_base = lookup(API_BASE_ENV)
        .filter(|v| !v.trim().is_empty())
        .or_else(|| api.and_then(|a| a.base_url.as_deref()).map(expand))
        .unwrap_or_else(|| DEFAULT_DEV_BASE_URL.to_string());
    let raw_base = raw_base.trim().trim_end_matches('/').to_string();
    let parsed = Url::parse(&raw_base).map_err(|source| ConfigError::InvalidBaseUrl {
        value: raw_base.clone(),
        source,
    })?;

    let environment = match lookup(ENVIRONMENT_ENV)
        .or_else(|| api.and_then(|a| a.environment.clone()))
    {
        Some(raw) => Environment::parse(&raw).ok_or(ConfigError::UnknownEnvironment(raw))?,
        None => Environment::infer(&parsed),
    };

    let public_views = session
        .and_then(|s| s.public_views.clone())
        .unwrap_or_else(|| DEFAULT_PUBLIC_VIEWS.iter().map(ToString::to_string).collect());

    let store_path = session
        .and_then(|s| s.store_path.as_deref())
        .map(|p| PathBuf::from(expand(p)))
        .or_else(default_store_path);

    tracing::debug!(api_base = %raw_base, environment = %environment, "Resolved configuration");

    Ok(ResolvedConfig {
        api_base: raw_base,
        environment,
        timeout: request
            .and_then(|r| r.timeout_ms)
            .map(Duration::from_millis),
        retry_backoff: request
            .and_then(|r| r.retry_backoff_ms)
            .map(Duration::from_millis),
        retry_idempotent_only: request.is_some_and(|r| r.retry_idempotent_only),
        login_path: session
            .and_then(|s| s.login_path.as_deref())
            .map(expand)
            .unwrap_or_else(|| DEFAULT_LOGIN_PATH.to_string()),
        public_views,
        store_path,
    })
}

/// Replace `${VAR}` references using the process environment.
#[must_use]
pub fn expand_env_vars(value: &str) -> String {
    expand_vars_with(value, |key| env::var(key).ok())
}

/// Replace `${VAR}` references using `lookup`. Missing variables expand to
/// nothing; an unclosed `${` is kept literally.
pub fn expand_vars_with<F>(value: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let Some(end_rel) = rest[start + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let var = &rest[start + 2..start + 2 + end_rel];
        if !var.is_empty() {
            out.push_str(&lookup(var).unwrap_or_default());
        }
        rest = &rest[start + 2 + end_rel + 1..];
    }
    out.push_str(rest);
    out
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ngm").join("config.toml"))
}

fn default_store_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ngm").join("session.json"))
}
