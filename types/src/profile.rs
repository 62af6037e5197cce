//! Persisted user profile and module permission shapes.
//!
//! Both are cached next to the bearer token after login and dropped together
//! with it when the session ends.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Cached user profile returned by the login endpoint.
///
/// Only the identifying fields are typed; everything else the backend sends
/// is kept verbatim in `extra` so a round trip through storage is lossless.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_role: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// View permission for one dashboard module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModulePermission {
    pub module_key: String,
    #[serde(default)]
    pub can_view: bool,
}

/// The cached list of module permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSnapshot(Vec<ModulePermission>);

impl PermissionSnapshot {
    #[must_use]
    pub fn new(entries: Vec<ModulePermission>) -> Self {
        Self(entries)
    }

    /// Unknown modules are not viewable.
    #[must_use]
    pub fn can_view(&self, module_key: &str) -> bool {
        self.0
            .iter()
            .any(|entry| entry.module_key == module_key && entry.can_view)
    }

    #[must_use]
    pub fn entries(&self) -> &[ModulePermission] {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
