use std::sync::Arc;

use anyhow::Context;
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::config::AppConfig;
use crate::media::{MediaStorage, S3MediaStorage};
use crate::users::repo::{PgUserStore, UserStore};

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<AppConfig>,
    pub users: Arc<dyn UserStore>,
    pub media: Arc<dyn MediaStorage>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let db = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .context("connect to database")?;

        let media =
            Arc::new(S3MediaStorage::new(&config.media).await?) as Arc<dyn MediaStorage>;
        let users = Arc::new(PgUserStore::new(db.clone())) as Arc<dyn UserStore>;

        Ok(Self {
            db,
            config,
            users,
            media,
        })
    }

}
