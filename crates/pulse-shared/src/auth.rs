//! Signed access tokens.
//!
//! The auth service signs `user_id || valid_until` with its Ed25519 key and
//! hands the client an opaque bearer string (base64url of the JSON token).
//! The realtime server only needs the issuer's public key to verify it.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::TokenError;
use crate::types::UserId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub user_id: UserId,
    pub valid_until: DateTime<Utc>,
    pub signature: Vec<u8>,
}

impl AccessToken {
    /// Encode as the bearer string clients send.
    pub fn to_bearer(&self) -> String {
        // Serializing a struct of plain fields cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn from_bearer(bearer: &str) -> Result<Self, TokenError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(bearer.trim())
            .map_err(|_| TokenError::Encoding)?;
        serde_json::from_slice(&bytes).map_err(|_| TokenError::Encoding)
    }
}

fn signed_payload(user_id: &UserId, valid_until: &DateTime<Utc>) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(user_id.0.as_bytes());
    payload.extend_from_slice(valid_until.to_rfc3339().as_bytes());
    payload
}

pub fn create_access_token(
    user_id: UserId,
    valid_until: DateTime<Utc>,
    issuer_key: &SigningKey,
) -> AccessToken {
    let signature = issuer_key.sign(&signed_payload(&user_id, &valid_until));

    AccessToken {
        user_id,
        valid_until,
        signature: signature.to_bytes().to_vec(),
    }
}

/// Verify a token against the issuer key, returning the authenticated user.
pub fn verify_access_token(
    token: &AccessToken,
    issuer_pubkey: &[u8; 32],
) -> Result<UserId, TokenError> {
    if Utc::now() > token.valid_until {
        return Err(TokenError::Expired);
    }

    let verifying_key =
        VerifyingKey::from_bytes(issuer_pubkey).map_err(|_| TokenError::BadIssuerKey)?;
    if verifying_key.is_weak() {
        return Err(TokenError::BadIssuerKey);
    }

    let signature =
        Signature::from_slice(&token.signature).map_err(|_| TokenError::BadSignature)?;

    verifying_key
        .verify_strict(&signed_payload(&token.user_id, &token.valid_until), &signature)
        .map_err(|_| TokenError::BadSignature)?;

    Ok(token.user_id)
}

/// Decode and verify a bearer string in one step.
pub fn verify_bearer(bearer: &str, issuer_pubkey: &[u8; 32]) -> Result<UserId, TokenError> {
    let token = AccessToken::from_bearer(bearer)?;
    verify_access_token(&token, issuer_pubkey)
}
