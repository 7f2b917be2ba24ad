//! Authentication module.
//!
//! Validates HS256 bearer tokens issued by the PingMe auth service and injects
//! the caller as [`CurrentUser`]. A dev mode accepts `dev:<username>` tokens.

mod claims;
mod config;
mod error;
mod middleware;

pub use claims::Claims;
pub use config::{AuthConfig, ConfigValidationError};
pub use error::AuthError;
pub use middleware::{AuthState, CurrentUser, auth_middleware};
