use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::errors::{Error, Result};

/// Claims carried by the metadata token handed to each runner VM.
#[derive(Debug, Serialize, Deserialize)]
pub struct InstanceClaims {
    /// Instance name.
    pub sub: String,
    pub pool_id: String,
    pub iat: i64,
    pub exp: i64,
}

/// Mint a fresh metadata token for one create attempt. The expiry tracks
/// the pool's runner timeout; a VM that outlives it has already been
/// reaped.
pub fn mint_instance_token(
    secret: &str,
    instance_name: &str,
    pool_id: Uuid,
    ttl: Duration,
) -> Result<String> {
    let now = Utc::now();
    let claims = InstanceClaims {
        sub: instance_name.to_string(),
        pool_id: pool_id.to_string(),
        iat: now.timestamp(),
        exp: (now + chrono::Duration::from_std(ttl).map_err(|e| Error::Other(e.into()))?)
            .timestamp(),
    };
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| Error::Other(e.into()))
}

pub fn verify_instance_token(secret: &str, token: &str) -> Result<InstanceClaims> {
    jsonwebtoken::decode::<InstanceClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| Error::Unauthorized("invalid instance token".to_string()))
}
