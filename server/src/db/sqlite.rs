//! SQLite implementation of UserStore

use super::{UserRecord, UserStore};
use crate::database;
use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Pool, Sqlite};
use tracing::warn;

pub struct SqliteUserStore {
    pool: Pool<Sqlite>,
}

impl SqliteUserStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl UserStore for SqliteUserStore {
    async fn verify_user(&self, user_id: &str, user_key: &str) -> Option<UserRecord> {
        match database::verify_user(&self.pool, user_id, user_key).await {
            Ok(record) => record,
            Err(e) => {
                warn!("User lookup failed: {}", e);
                None
            }
        }
    }

    async fn load_user_settings(&self, user_id: &str, user_key: &str) -> Result<serde_json::Value> {
        database::load_user_settings(&self.pool, user_id, user_key).await
    }

    async fn register_user(&self, user_id: &str, user_key: &str) -> Result<UserRecord> {
        database::register_user(&self.pool, user_id, user_key).await
    }
}
