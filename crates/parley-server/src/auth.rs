//! Session verification.
//!
//! Sessions are issued by the account service and mirrored onto the user
//! row. REST handlers take an [`AuthUser`] extractor; the socket upgrade
//! verifies once before registering anything.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;
use chrono::Utc;
use tracing::debug;

use parley_store::{users, User};

use crate::db::Store;
use crate::error::ServerError;

pub const MSG_INVALID_TOKEN: &str = "Invalid token, please login again...";
pub const MSG_SESSION_EXPIRED: &str = "Session expired, please login again...";
pub const MSG_DEACTIVATED: &str = "account is deactivated";
pub const MSG_SUSPENDED: &str = "Your account is blocked, please contact the support team";

#[async_trait]
pub trait SessionVerifier: Send + Sync {
    /// Resolve a session credential to its user.
    async fn verify(&self, token: &str) -> Result<User, ServerError>;
}

/// Checks the session token stored on the user row.
#[derive(Clone)]
pub struct StoreSessionVerifier {
    store: Store,
}

impl StoreSessionVerifier {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SessionVerifier for StoreSessionVerifier {
    async fn verify(&self, token: &str) -> Result<User, ServerError> {
        if token.is_empty() {
            return Err(ServerError::Unauthorized(MSG_INVALID_TOKEN.to_string()));
        }
        let token = token.to_string();
        let user = self
            .store
            .call(move |conn| Ok(users::find_by_session_token(conn, &token)?))
            .await?
            .ok_or_else(|| ServerError::Unauthorized(MSG_INVALID_TOKEN.to_string()))?;

        check_account(&user)?;
        debug!(user = %user.id, "session verified");
        Ok(user)
    }
}

fn check_account(user: &User) -> Result<(), ServerError> {
    if user.session_expires_at.is_some_and(|at| at <= Utc::now()) {
        return Err(ServerError::Unauthorized(MSG_SESSION_EXPIRED.to_string()));
    }
    if !user.is_active {
        return Err(ServerError::Unauthorized(MSG_DEACTIVATED.to_string()));
    }
    if user.is_suspended {
        return Err(ServerError::Unauthorized(MSG_SUSPENDED.to_string()));
    }
    Ok(())
}

/// Token from `Authorization`, with or without the `Bearer ` prefix.
pub fn token_from_headers(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get("authorization")?.to_str().ok()?.trim();
    let token = match raw.strip_prefix("Bearer") {
        Some(rest) if rest.is_empty() || rest.starts_with(' ') => rest.trim(),
        _ => raw,
    };
    (!token.is_empty()).then_some(token)
}

/// The verified caller of a REST handler.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    Arc<dyn SessionVerifier>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let verifier = Arc::<dyn SessionVerifier>::from_ref(state);
        let token = token_from_headers(&parts.headers)
            .ok_or_else(|| ServerError::Unauthorized(MSG_INVALID_TOKEN.to_string()))?;
        verifier.verify(token).await.map(AuthUser)
    }
}
