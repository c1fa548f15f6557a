//! User store abstraction
//!
//! The relay treats credential verification as a collaborator behind the
//! `UserStore` trait. Persistent nodes use SQLite; tests and ephemeral nodes
//! use the in-memory store.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

pub use memory::MemoryUserStore;
pub use sqlite::SqliteUserStore;

/// A verified user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub user_id: String,
    pub created_at: i64,
}

#[async_trait]
pub trait UserStore: Send + Sync + 'static {
    /// `Some` when the user exists and the key matches
    async fn verify_user(&self, user_id: &str, user_key: &str) -> Option<UserRecord>;

    /// Settings document for a verified user; fails on bad credentials
    async fn load_user_settings(&self, user_id: &str, user_key: &str) -> Result<serde_json::Value>;

    /// Create a user. Re-registering with the same key is a no-op; a
    /// different key for an existing user is an error.
    async fn register_user(&self, user_id: &str, user_key: &str) -> Result<UserRecord>;
}
