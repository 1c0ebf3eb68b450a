//! Bearer token verification for the command endpoint.
//!
//! Tokens are HS256 JWTs signed with the shared platform secret. The
//! daemon only verifies; minting happens in the platform when a user
//! logs in. Verification checks the signature and, when present, the
//! `exp` claim. No other claims are required.

use std::collections::HashSet;

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::error::ApiError;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(default)]
    v: f64,
    #[serde(default)]
    exp: i64,
}

/// Verify a bearer token against the shared secret.
///
/// Any failure, from a malformed token to a stale `exp`, maps to the
/// bad-token error code so callers cannot distinguish why.
pub fn verify_token(secret: &str, token: &str) -> Result<(), ApiError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.required_spec_claims = HashSet::new();
    validation.leeway = 60;

    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map(|_| ())
        .map_err(|err| ApiError::bad_token(format!("parse token: {err}")))
}

/// Mint a token the way the platform does when a user logs in.
pub fn sign_token(secret: &str, expires_in: chrono::Duration) -> anyhow::Result<String> {
    let claims = Claims {
        v: 1.0,
        exp: (chrono::Utc::now() + expires_in).timestamp(),
    };
    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;
    Ok(token)
}
