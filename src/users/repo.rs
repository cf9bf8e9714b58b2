use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// User record in the database. `username` and `email` are stored trimmed and
/// lowercased; the unique indexes apply to the stored form. Never serialized
/// directly: responses go through `PublicUser`, which projects away the
/// password hash and refresh token.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub password_hash: String,
    pub avatar_url: String,
    pub cover_image_url: Option<String>,
    pub refresh_token: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Fields required to insert a new user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub full_name: String,
    pub password_hash: String,
    pub avatar_url: String,
    pub cover_image_url: Option<String>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("username or email already taken")]
    Duplicate,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db) = e {
            if db.is_unique_violation() {
                return StoreError::Duplicate;
            }
        }
        StoreError::Other(e.into())
    }
}

/// Persistence seam for user records. The production implementation is
/// Postgres; tests run against an in-memory store.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_username_or_email(
        &self,
        username: &str,
        email: &str,
    ) -> Result<Option<User>, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    async fn create(&self, new: NewUser) -> Result<User, StoreError>;

    /// Overwrite the stored refresh token; `None` clears it (logout).
    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> Result<(), StoreError>;

    /// Compare-and-swap rotation: replaces `current` with `next` only if the
    /// stored token still equals `current`. Returns whether the swap landed,
    /// so two concurrent refreshes with the same token cannot both win.
    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        current: &str,
        next: &str,
    ) -> Result<bool, StoreError>;

    async fn set_password_hash(&self, id: Uuid, hash: &str) -> Result<(), StoreError>;
}

pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

const USER_COLUMNS: &str = "id, username, email, full_name, password_hash, avatar_url, \
                            cover_image_url, refresh_token, created_at, updated_at";

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_username_or_email(
        &self,
        username: &str,
        email: &str,
    ) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1 OR email = $2"
        ))
        .bind(username)
        .bind(email)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn create(&self, new: NewUser) -> Result<User, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (username, email, full_name, password_hash, avatar_url, cover_image_url)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(&new.username)
        .bind(&new.email)
        .bind(&new.full_name)
        .bind(&new.password_hash)
        .bind(&new.avatar_url)
        .bind(&new.cover_image_url)
        .fetch_one(&self.db)
        .await?;
        Ok(user)
    }

    async fn set_refresh_token(&self, id: Uuid, token: Option<&str>) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET refresh_token = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(token)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn rotate_refresh_token(
        &self,
        id: Uuid,
        current: &str,
        next: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE users SET refresh_token = $3, updated_at = now() \
             WHERE id = $1 AND refresh_token = $2",
        )
        .bind(id)
        .bind(current)
        .bind(next)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_password_hash(&self, id: Uuid, hash: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET password_hash = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(hash)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}
