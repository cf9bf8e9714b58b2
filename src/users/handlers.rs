use axum::{
    extract::{rejection::JsonRejection, FromRef, Multipart, State},
    http::{header::SET_COOKIE, HeaderMap},
    response::AppendHeaders,
    routing::{get, post},
    Json, Router,
};
use tracing::instrument;

use crate::{
    error::ApiError,
    response::ApiResponse,
    state::AppState,
    users::{
        cookies::{auth_cookie, cookie_value, expired_cookie, ACCESS_COOKIE, REFRESH_COOKIE},
        dto::{ChangePasswordRequest, LoginData, LoginRequest, PublicUser, RefreshRequest, TokenPairData},
        extractors::AuthUser,
        jwt::JwtKeys,
        services::{self, MediaUpload, RegisterInput, TokenPair},
    },
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/users/register", post(register))
        .route("/users/login", post(login))
        .route("/users/logout", post(logout))
        .route("/users/refresh-token", post(refresh_token))
        .route("/users/change-password", post(change_password))
        .route("/users/me", get(me))
}

type SetCookies = AppendHeaders<[(axum::http::HeaderName, String); 2]>;

fn set_token_cookies(keys: &JwtKeys, pair: &TokenPair) -> SetCookies {
    AppendHeaders([
        (
            SET_COOKIE,
            auth_cookie(ACCESS_COOKIE, &pair.access, keys.access_ttl.as_secs()),
        ),
        (
            SET_COOKIE,
            auth_cookie(REFRESH_COOKIE, &pair.refresh, keys.refresh_ttl.as_secs()),
        ),
    ])
}

fn clear_token_cookies() -> SetCookies {
    AppendHeaders([
        (SET_COOKIE, expired_cookie(ACCESS_COOKIE)),
        (SET_COOKIE, expired_cookie(REFRESH_COOKIE)),
    ])
}

fn bad_multipart(e: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::validation(format!("malformed multipart body: {}", e))
}

// Keeps body-parsing failures inside the response envelope instead of
// axum's plain-text rejections.
fn bad_json(e: JsonRejection) -> ApiError {
    ApiError::validation(format!("invalid request body: {}", e))
}

#[instrument(skip_all)]
async fn register(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<ApiResponse<PublicUser>, ApiError> {
    let mut input = RegisterInput::default();

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "username" => input.username = field.text().await.map_err(bad_multipart)?,
            "email" => input.email = field.text().await.map_err(bad_multipart)?,
            "fullName" => input.full_name = field.text().await.map_err(bad_multipart)?,
            "password" => input.password = field.text().await.map_err(bad_multipart)?,
            "avatar" | "coverImage" => {
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field.bytes().await.map_err(bad_multipart)?;
                let upload = MediaUpload {
                    bytes,
                    content_type,
                };
                if name == "avatar" {
                    input.avatar = Some(upload);
                } else {
                    input.cover_image = Some(upload);
                }
            }
            _ => {
                // unknown part, drain and ignore
                let _ = field.bytes().await;
            }
        }
    }

    let user = services::register(state.users.as_ref(), state.media.as_ref(), input).await?;
    Ok(ApiResponse::created(
        PublicUser::from(user),
        "user registered successfully",
    ))
}

#[instrument(skip_all)]
async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<(SetCookies, ApiResponse<LoginData>), ApiError> {
    let Json(payload) = payload.map_err(bad_json)?;
    let keys = JwtKeys::from_ref(&state);
    let (user, pair) = services::login(
        state.users.as_ref(),
        &keys,
        payload.username,
        payload.email,
        &payload.password,
    )
    .await?;

    let cookies = set_token_cookies(&keys, &pair);
    let body = ApiResponse::ok(
        LoginData {
            user: PublicUser::from(user),
            access_token: pair.access,
            refresh_token: pair.refresh,
        },
        "user logged in successfully",
    );
    Ok((cookies, body))
}

#[instrument(skip_all, fields(user_id = %user_id))]
async fn logout(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<(SetCookies, ApiResponse<()>), ApiError> {
    services::logout(state.users.as_ref(), user_id).await?;
    Ok((
        clear_token_cookies(),
        ApiResponse::ok((), "user logged out successfully"),
    ))
}

#[instrument(skip_all)]
async fn refresh_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Option<Json<RefreshRequest>>,
) -> Result<(SetCookies, ApiResponse<TokenPairData>), ApiError> {
    let from_cookie = headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| cookie_value(h, REFRESH_COOKIE));
    let presented = from_cookie
        .or_else(|| payload.and_then(|Json(p)| p.refresh_token))
        .ok_or_else(|| ApiError::unauthorized("refresh token is required"))?;

    let keys = JwtKeys::from_ref(&state);
    let pair = services::refresh_session(state.users.as_ref(), &keys, &presented).await?;

    let cookies = set_token_cookies(&keys, &pair);
    let body = ApiResponse::ok(
        TokenPairData {
            access_token: pair.access,
            refresh_token: pair.refresh,
        },
        "access token refreshed",
    );
    Ok((cookies, body))
}

#[instrument(skip_all, fields(user_id = %user_id))]
async fn change_password(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    payload: Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> Result<ApiResponse<()>, ApiError> {
    let Json(payload) = payload.map_err(bad_json)?;
    services::change_password(
        state.users.as_ref(),
        user_id,
        &payload.old_password,
        &payload.new_password,
        &payload.confirm_password,
    )
    .await?;
    Ok(ApiResponse::ok((), "password changed successfully"))
}


#[instrument(skip_all, fields(user_id = %user_id))]
async fn me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<ApiResponse<PublicUser>, ApiError> {
    let user = services::current_user(state.users.as_ref(), user_id).await?;
    Ok(ApiResponse::ok(
        PublicUser::from(user),
        "current user fetched successfully",
    ))
}
