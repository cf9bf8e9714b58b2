use std::time::Duration;

use axum::extract::FromRef;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

use crate::{config::JwtConfig, state::AppState, users::repo::User};

/// Claims carried by a short-lived access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: Uuid,
    pub email: String,
    pub username: String,
    pub iat: usize,
    pub exp: usize,
}

/// Claims carried by a long-lived refresh token; identity only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub sub: Uuid,
    pub iat: usize,
    pub exp: usize,
}

/// Signing and verification material for both token kinds. Access and refresh
/// tokens use independent secrets, so one can never verify as the other.
#[derive(Clone)]
pub struct JwtKeys {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl JwtKeys {
    pub fn from_config(cfg: &JwtConfig) -> Self {
        Self {
            access_encoding: EncodingKey::from_secret(cfg.access_secret.as_bytes()),
            access_decoding: DecodingKey::from_secret(cfg.access_secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(cfg.refresh_secret.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(cfg.refresh_secret.as_bytes()),
            access_ttl: Duration::from_secs(cfg.access_ttl_minutes * 60),
            refresh_ttl: Duration::from_secs(cfg.refresh_ttl_days * 24 * 60 * 60),
        }
    }

    fn window(&self, ttl: Duration) -> (usize, usize) {
        let now = OffsetDateTime::now_utc();
        let exp = now + TimeDuration::seconds(ttl.as_secs() as i64);
        (now.unix_timestamp() as usize, exp.unix_timestamp() as usize)
    }

    pub fn sign_access(&self, user: &User) -> anyhow::Result<String> {
        let (iat, exp) = self.window(self.access_ttl);
        let claims = AccessClaims {
            sub: user.id,
            email: user.email.clone(),
            username: user.username.clone(),
            iat,
            exp,
        };
        let token = encode(&Header::default(), &claims, &self.access_encoding)?;
        debug!(user_id = %user.id, "access token signed");
        Ok(token)
    }

    pub fn sign_refresh(&self, user_id: Uuid) -> anyhow::Result<String> {
        let (iat, exp) = self.window(self.refresh_ttl);
        let claims = RefreshClaims {
            sub: user_id,
            iat,
            exp,
        };
        let token = encode(&Header::default(), &claims, &self.refresh_encoding)?;
        debug!(user_id = %user_id, "refresh token signed");
        Ok(token)
    }

    pub fn verify_access(&self, token: &str) -> anyhow::Result<AccessClaims> {
        let data = decode::<AccessClaims>(token, &self.access_decoding, &Validation::default())?;
        Ok(data.claims)
    }

    pub fn verify_refresh(&self, token: &str) -> anyhow::Result<RefreshClaims> {
        let data = decode::<RefreshClaims>(token, &self.refresh_decoding, &Validation::default())?;
        Ok(data.claims)
    }
}

impl FromRef<AppState> for JwtKeys {
    fn from_ref(state: &AppState) -> Self {
        JwtKeys::from_config(&state.config.jwt)
    }
}
