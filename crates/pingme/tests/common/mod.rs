//! Test utilities and common setup.
#![allow(dead_code)]

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use pingme::api::{self, AppState};
use pingme::auth::{AuthConfig, AuthState};
use pingme::chat::ChatConfig;
use pingme::db::Database;
use pingme::identity::UserDirectory;
use serde_json::Value;
use tower::ServiceExt;

/// Users seeded into every test app, in id order (1, 2, 3).
pub const USERS: [&str; 3] = ["alice", "bob", "carol"];

/// Dev mode plus a real secret, so both `dev:` and signed tokens work.
pub fn test_auth_config() -> AuthConfig {
    AuthConfig {
        dev_mode: true,
        jwt_secret: Some("test-secret-for-integration-tests-minimum-32-chars".to_string()),
        ..AuthConfig::default()
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub db: Database,
}

/// Build the full router over an in-memory database with seeded users.
pub async fn test_app() -> TestApp {
    let db = Database::in_memory().await.expect("in-memory database");
    let users = UserDirectory::new(db.pool().clone());
    for name in USERS {
        users.create(name).await.expect("seed user");
    }

    let auth = AuthState::new(test_auth_config());
    let state = AppState::from_database(auth, &db, ChatConfig::default());
    let router = api::create_router(state.clone());

    TestApp { router, state, db }
}

pub fn dev_token(username: &str) -> String {
    format!("dev:{username}")
}

impl TestApp {
    /// Send a request with an optional bearer token and decode the JSON reply.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(&json).unwrap())
            }
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }
}
