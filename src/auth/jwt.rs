// src/auth/jwt.rs
// HS256 token issuing and verification

use anyhow::{anyhow, Result};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Access tokens expire in minutes, refresh tokens in days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// user id
    pub sub: String,
    pub username: String,
    pub kind: TokenKind,
    pub exp: usize,
    pub iat: usize,
}

fn jwt_secret() -> String {
    std::env::var("BA_JWT_SECRET")
        .unwrap_or_else(|_| "ba-agent-jwt-secret-change-in-production".to_string())
}

fn create_token(user_id: &str, username: &str, kind: TokenKind, lifetime: chrono::Duration) -> Result<String> {
    let now = chrono::Utc::now();
    let expiration = now
        .checked_add_signed(lifetime)
        .ok_or_else(|| anyhow!("failed to compute expiration"))?
        .timestamp() as usize;

    let claims = Claims {
        sub: user_id.to_string(),
        username: username.to_string(),
        kind,
        exp: expiration,
        iat: now.timestamp() as usize,
    };

    let key = EncodingKey::from_secret(jwt_secret().as_bytes());
    encode(&Header::default(), &claims, &key).map_err(|e| anyhow!("failed to create token: {}", e))
}

pub fn create_access_token(user_id: &str, username: &str, minutes: i64) -> Result<String> {
    create_token(
        user_id,
        username,
        TokenKind::Access,
        chrono::Duration::minutes(minutes),
    )
}

pub fn create_refresh_token(user_id: &str, username: &str, days: i64) -> Result<String> {
    create_token(
        user_id,
        username,
        TokenKind::Refresh,
        chrono::Duration::days(days),
    )
}

pub fn verify_token(token: &str) -> Result<Claims> {
    let key = DecodingKey::from_secret(jwt_secret().as_bytes());
    decode::<Claims>(token, &key, &Validation::default())
        .map(|data| data.claims)
        .map_err(|e| anyhow!("invalid token: {}", e))
}
