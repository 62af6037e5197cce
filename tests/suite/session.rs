//! Session lifecycle over a persisted store.

use std::sync::Arc;

use serde_json::json;

use ngm_core::storage::{PERMISSIONS_KEY, TOKEN_KEY, USER_KEY};
use ngm_core::{FileTokenStore, SessionGuard, SessionState, TokenStore, is_valid};
use ngm_types::{ModulePermission, PermissionSnapshot, UserProfile};

use crate::common::{RecordingNavigator, mint_token, token_expiring_in};

fn guard(store: Arc<dyn TokenStore>) -> (SessionGuard, Arc<RecordingNavigator>) {
    let navigator = Arc::new(RecordingNavigator::default());
    let guard = SessionGuard::new(
        store,
        navigator.clone(),
        "login.html",
        vec!["login".into(), "landing".into(), "index".into()],
    );
    (guard, navigator)
}

#[test]
fn token_validity_boundaries() {
    assert!(!is_valid(&token_expiring_in(-1)));
    assert!(is_valid(&token_expiring_in(3600)));
    assert!(is_valid(&mint_token(&json!({ "sub": "u-1" }))));
    for malformed in ["", "one", "one.two", "a.%%%.c", "a.b.c.d"] {
        assert!(!is_valid(malformed), "{malformed:?}");
    }
}

#[test]
fn login_survives_restart_and_logout_clears_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");

    {
        let store: Arc<dyn TokenStore> = Arc::new(FileTokenStore::open(&path).unwrap());
        let (guard, _) = guard(store);
        let profile: UserProfile =
            serde_json::from_value(json!({ "user_id": "u-42", "user_name": "Dana" })).unwrap();
        let permissions = PermissionSnapshot::new(vec![
            ModulePermission {
                module_key: "expenses".into(),
                can_view: true,
            },
            ModulePermission {
                module_key: "payroll".into(),
                can_view: false,
            },
        ]);
        guard
            .login(&token_expiring_in(3600), Some(&profile), Some(&permissions))
            .unwrap();
    }

    let store: Arc<dyn TokenStore> = Arc::new(FileTokenStore::open(&path).unwrap());
    let (guard, navigator) = guard(store.clone());
    assert_eq!(guard.state(), SessionState::Authenticated);
    assert!(guard.check_access("expenses.html"));
    assert!(guard.can_view("expenses"));
    assert!(!guard.can_view("payroll"));
    assert_eq!(
        guard.profile().and_then(|p| p.user_name).as_deref(),
        Some("Dana")
    );

    guard.logout();
    assert_eq!(navigator.visits(), vec!["login.html"]);

    let reopened = FileTokenStore::open(&path).unwrap();
    for key in [TOKEN_KEY, USER_KEY, PERMISSIONS_KEY] {
        assert_eq!(reopened.get(key), None);
    }
}

#[test]
fn expired_session_blocks_protected_views_only() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn TokenStore> =
        Arc::new(FileTokenStore::open(dir.path().join("session.json")).unwrap());
    store.set(TOKEN_KEY, &token_expiring_in(-60)).unwrap();
    let (guard, navigator) = guard(store.clone());

    assert!(guard.check_access("landing.html"));
    assert!(navigator.visits().is_empty());
    assert!(store.token().is_some());

    assert!(!guard.check_access("pipeline.html"));
    assert_eq!(navigator.visits(), vec!["login.html"]);
    assert_eq!(store.token(), None);
}
