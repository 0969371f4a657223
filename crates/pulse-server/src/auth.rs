//! Bearer token extraction and verification for socket upgrades.

use axum::http::HeaderMap;
use tracing::debug;

use pulse_shared::auth::verify_bearer;
use pulse_shared::error::TokenError;
use pulse_shared::types::UserId;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,

    #[error(transparent)]
    Invalid(#[from] TokenError),
}

/// Verifies access tokens against the issuer's Ed25519 key.
#[derive(Clone)]
pub struct TokenVerifier {
    issuer_pubkey: [u8; 32],
}

impl TokenVerifier {
    pub fn new(issuer_pubkey: [u8; 32]) -> Self {
        Self { issuer_pubkey }
    }

    /// Authenticate an upgrade request. The `Authorization` header wins over
    /// the `token` query parameter (browsers cannot set headers on upgrades).
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
    ) -> Result<UserId, AuthError> {
        let header_token = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));

        let token = header_token
            .or(query_token)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::Missing)?;

        let user_id = verify_bearer(token, &self.issuer_pubkey)?;
        debug!(user = %user_id, "Token verified");
        Ok(user_id)
    }
}
