//! Authentication middleware.

use axum::{
    extract::{FromRequestParts, State},
    http::{header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use log::{debug, warn};
use std::sync::Arc;

use super::{AuthConfig, AuthError, Claims};

const TOKEN_ISSUER: &str = "pingme-auth";

/// Extract a Bearer token from an Authorization header value.
fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }

    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if token.is_empty() {
        return Err(AuthError::InvalidAuthHeader);
    }

    if parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }

    Ok(token)
}

fn token_from_cookie_header<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name.trim() == cookie_name {
            Some(value.trim())
        } else {
            None
        }
    })
}

fn token_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == "token" {
            urlencoding::decode(value).ok().map(|s| s.into_owned())
        } else {
            None
        }
    })
}

/// Authentication state shared across handlers.
#[derive(Clone)]
pub struct AuthState {
    config: Arc<AuthConfig>,
    secret: Option<String>,
    decoding_key: Option<DecodingKey>,
}

impl AuthState {
    /// Create new auth state from config.
    /// Resolves `env:VAR_NAME` syntax in jwt_secret at construction time.
    pub fn new(config: AuthConfig) -> Self {
        let secret = config.resolve_jwt_secret().ok().flatten();
        let decoding_key = secret
            .as_ref()
            .map(|s| DecodingKey::from_secret(s.as_bytes()));

        Self {
            config: Arc::new(config),
            secret,
            decoding_key,
        }
    }

    pub fn is_dev_mode(&self) -> bool {
        self.config.dev_mode
    }

    /// Get allowed CORS origins from config.
    pub fn allowed_origins(&self) -> &[String] {
        &self.config.allowed_origins
    }

    /// Validate a token and return its claims.
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        if self.config.dev_mode {
            if let Some(username) = token.strip_prefix("dev:") {
                return self.dev_claims(username);
            }
        }

        let decoding_key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;

        let token_data = decode::<Claims>(token, decoding_key, &validation).map_err(|e| {
            warn!("JWT validation failed: {:?}", e);
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        if token_data.claims.username.trim().is_empty() {
            return Err(AuthError::InvalidToken("empty username claim".to_string()));
        }

        Ok(token_data.claims)
    }

    fn dev_claims(&self, username: &str) -> Result<Claims, AuthError> {
        if username.trim().is_empty() {
            return Err(AuthError::InvalidToken("empty dev username".to_string()));
        }
        Ok(Claims::new(
            username,
            Utc::now().timestamp(),
            self.config.token_ttl_hours * 3600,
            "dev",
        ))
    }

    /// Mint a signed token for `username`, as the auth service would.
    pub fn generate_token(&self, username: &str) -> Result<String, AuthError> {
        let secret = self
            .secret
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let claims = Claims::new(
            username,
            Utc::now().timestamp(),
            self.config.token_ttl_hours * 3600,
            TOKEN_ISSUER,
        );

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|e| AuthError::Internal(e.to_string()))
    }
}

/// Authenticated caller extracted from request.
///
/// Carries only the validated token claims; chat operations resolve the
/// numeric user id from it on every call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub claims: Claims,
}

impl CurrentUser {
    pub fn new(claims: Claims) -> Self {
        Self { claims }
    }

    pub fn username(&self) -> &str {
        &self.claims.username
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AuthError::MissingAuthHeader)
    }
}

/// Authentication middleware.
///
/// Validates the token and injects `CurrentUser` into request extensions.
/// Token sources in priority order:
/// 1. Authorization: Bearer <token> header
/// 2. auth_token cookie
/// 3. token query parameter (for WebSocket connections)
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let cookie_token = req
        .headers()
        .get(axum::http::header::COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookie_header| token_from_cookie_header(cookie_header, "auth_token"));

    // Browsers can't set headers on a WebSocket upgrade.
    let query_token = req.uri().query().and_then(token_from_query);

    let claims = if let Some(header) = auth_header {
        let token = bearer_token_from_header(header)?;
        auth.validate_token(token)?
    } else if let Some(token) = cookie_token {
        auth.validate_token(token)?
    } else if let Some(ref token) = query_token {
        auth.validate_token(token)?
    } else {
        return Err(AuthError::MissingAuthHeader);
    };

    debug!("Authenticated request from {}", claims.username);
    req.extensions_mut().insert(CurrentUser::new(claims));

    Ok(next.run(req).await)
}

#[cfg(test)]
#[allow(clippy::field_reassign_with_default)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-for-unit-tests-minimum-32-chars-long";

    fn signed_state() -> AuthState {
        let mut config = AuthConfig::default();
        config.jwt_secret = Some(SECRET.to_string());
        AuthState::new(config)
    }

    #[test]
    fn test_bearer_token_from_header_valid() {
        assert_eq!(
            bearer_token_from_header("Bearer abc.def.ghi").unwrap(),
            "abc.def.ghi"
        );
        assert_eq!(
            bearer_token_from_header("bearer   token123").unwrap(),
            "token123"
        );
    }

    #[test]
    fn test_bearer_token_from_header_invalid() {
        let cases = [
            "",
            "Bearer",
            "Bearer ",
            "Token something",
            "Bearer token extra",
        ];

        for case in cases {
            assert!(
                bearer_token_from_header(case).is_err(),
                "{case} should fail"
            );
        }
    }

    #[test]
    fn test_token_from_cookie_and_query() {
        assert_eq!(
            token_from_cookie_header("theme=dark; auth_token=abc; x=1", "auth_token"),
            Some("abc")
        );
        assert_eq!(token_from_cookie_header("theme=dark", "auth_token"), None);

        assert_eq!(
            token_from_query("a=1&token=dev%3Aalice"),
            Some("dev:alice".to_string())
        );
        assert_eq!(token_from_query("a=1"), None);
    }

    #[test]
    fn test_generate_and_validate_token() {
        let state = signed_state();
        let token = state.generate_token("alice").unwrap();
        let claims = state.validate_token(&token).unwrap();
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.iss.as_deref(), Some(TOKEN_ISSUER));
    }

    #[test]
    fn test_token_signed_with_other_secret_rejected() {
        let mut config = AuthConfig::default();
        config.jwt_secret = Some("another-secret-that-is-also-32-chars-long".to_string());
        let other = AuthState::new(config);
        let token = other.generate_token("mallory").unwrap();

        let result = signed_state().validate_token(&token);
        assert!(matches!(result, Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn test_expired_token_rejected() {
        let now = Utc::now().timestamp();
        let claims = Claims::new("alice", now - 7200, 3600, TOKEN_ISSUER);
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        let result = signed_state().validate_token(&token);
        assert!(matches!(result, Err(AuthError::TokenExpired)));
    }

    #[test]
    fn test_dev_tokens_only_in_dev_mode() {
        let mut config = AuthConfig::default();
        config.dev_mode = true;
        let dev = AuthState::new(config);
        assert_eq!(dev.validate_token("dev:bob").unwrap().username, "bob");
        assert!(dev.validate_token("dev:").is_err());

        assert!(signed_state().validate_token("dev:bob").is_err());
    }
}
