use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use tracing::warn;
use uuid::Uuid;

use crate::{
    error::ApiError,
    users::{
        cookies::{cookie_value, ACCESS_COOKIE},
        jwt::JwtKeys,
    },
};

/// Authenticated caller, established from a verified access token taken from
/// the `Authorization: Bearer` header or the `accessToken` cookie.
#[derive(Debug)]
pub struct AuthUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    JwtKeys: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let keys = JwtKeys::from_ref(state);

        let bearer = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::to_string);

        let token = bearer
            .or_else(|| {
                parts
                    .headers
                    .get(header::COOKIE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|h| cookie_value(h, ACCESS_COOKIE))
            })
            .ok_or_else(|| ApiError::unauthorized("missing access token"))?;

        let claims = keys.verify_access(&token).map_err(|_| {
            warn!("invalid or expired access token");
            ApiError::unauthorized("invalid or expired access token")
        })?;

        Ok(AuthUser(claims.sub))
    }
}
