//! Session tokens presented on the WebSocket handshake.
//!
//! Issuing accounts and checking passwords happens elsewhere; this crate only
//! mints and verifies the short HS256 tokens that carry an already
//! authenticated user id into the relay.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::domain::UserId;
use thiserror::Error;

const ISSUER: &str = "relay";
const SUBJECT_PREFIX: &str = "user:";

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub secret: String,
    pub ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    sub: String,
    exp: i64,
    iat: i64,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing session token")]
    MissingToken,
    #[error("invalid session token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
    #[error("token subject `{0}` is not a user")]
    InvalidSubject(String),
    #[error("token lifetime must be a positive number of seconds, got {0}")]
    InvalidTtl(i64),
}

/// Fails with `InvalidTtl` unless the lifetime is positive and representable.
pub fn mint_token(cfg: &TokenConfig, user_id: UserId) -> Result<String, AuthError> {
    let now = Utc::now();
    let exp = Duration::try_seconds(cfg.ttl_seconds)
        .filter(|ttl| *ttl > Duration::zero())
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or(AuthError::InvalidTtl(cfg.ttl_seconds))?;
    let claims = Claims {
        iss: ISSUER.to_string(),
        sub: format!("{SUBJECT_PREFIX}{}", user_id.0),
        iat: now.timestamp(),
        exp: exp.timestamp(),
    };

    Ok(encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(cfg.secret.as_bytes()),
    )?)
}

/// Verifies signature, issuer and expiry, and returns the user the token was
/// issued for.
pub fn verify_token(cfg: &TokenConfig, token: &str) -> Result<UserId, AuthError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[ISSUER]);
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(cfg.secret.as_bytes()),
        &validation,
    )?;

    data.claims
        .sub
        .strip_prefix(SUBJECT_PREFIX)
        .and_then(|id| id.parse::<i64>().ok())
        .map(UserId)
        .ok_or(AuthError::InvalidSubject(data.claims.sub))
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
