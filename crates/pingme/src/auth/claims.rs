//! JWT claims.

use serde::{Deserialize, Serialize};

/// Claims carried by a PingMe access token.
///
/// The auth service signs the username; the numeric user id is looked up in
/// the identity store on every request rather than trusted from the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Login name of the caller.
    pub username: String,

    /// Expiration time (as Unix timestamp).
    pub exp: i64,

    /// Issued at (as Unix timestamp).
    #[serde(default)]
    pub iat: Option<i64>,

    /// Issuer.
    #[serde(default)]
    pub iss: Option<String>,
}

impl Claims {
    pub fn new(username: impl Into<String>, iat: i64, ttl_secs: i64, iss: &str) -> Self {
        Self {
            username: username.into(),
            exp: iat + ttl_secs,
            iat: Some(iat),
            iss: Some(iss.to_string()),
        }
    }
}
