//! In-memory UserStore

use super::{UserRecord, UserStore};
use crate::auth::{has_credentials, hash_user_key, verify_user_key};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;

struct StoredUser {
    key_hash: String,
    settings: serde_json::Value,
    created_at: i64,
}

#[derive(Default)]
pub struct MemoryUserStore {
    users: DashMap<String, StoredUser>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `(user_id, user_key)` pairs
    pub fn with_users<'a>(users: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let store = Self::new();
        for (user_id, user_key) in users {
            store.insert(user_id, user_key);
        }
        store
    }

    fn insert(&self, user_id: &str, user_key: &str) -> UserRecord {
        let created_at = unix_now();
        self.users.insert(
            user_id.to_string(),
            StoredUser {
                key_hash: hash_user_key(user_key),
                settings: serde_json::json!({}),
                created_at,
            },
        );
        UserRecord {
            user_id: user_id.to_string(),
            created_at,
        }
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn verify_user(&self, user_id: &str, user_key: &str) -> Option<UserRecord> {
        if !has_credentials(user_id, user_key) {
            return None;
        }
        let entry = self.users.get(user_id)?;
        verify_user_key(user_key, &entry.key_hash).then(|| UserRecord {
            user_id: user_id.to_string(),
            created_at: entry.created_at,
        })
    }

    async fn load_user_settings(&self, user_id: &str, user_key: &str) -> Result<serde_json::Value> {
        self.verify_user(user_id, user_key)
            .await
            .ok_or_else(|| anyhow::anyhow!("Invalid credentials"))?;
        let entry = self
            .users
            .get(user_id)
            .ok_or_else(|| anyhow::anyhow!("Invalid credentials"))?;
        Ok(entry.settings.clone())
    }

    async fn register_user(&self, user_id: &str, user_key: &str) -> Result<UserRecord> {
        if !has_credentials(user_id, user_key) {
            anyhow::bail!("userId and userKey are required");
        }
        if let Some(existing) = self.users.get(user_id) {
            if verify_user_key(user_key, &existing.key_hash) {
                return Ok(UserRecord {
                    user_id: user_id.to_string(),
                    created_at: existing.created_at,
                });
            }
            anyhow::bail!("User {} already exists with a different key", user_id);
        }
        Ok(self.insert(user_id, user_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_verify_and_register() {
        let store = MemoryUserStore::with_users([("u1", "k1")]);
        assert!(store.verify_user("u1", "k1").await.is_some());
        assert!(store.verify_user("u1", "bad").await.is_none());
        assert!(store.verify_user("", "k1").await.is_none());

        assert!(store.register_user("u1", "k1").await.is_ok());
        assert!(store.register_user("u1", "other").await.is_err());
        assert!(store.register_user("u2", "k2").await.is_ok());
        assert_eq!(store.load_user_settings("u2", "k2").await.unwrap(), serde_json::json!({}));
        assert!(store.load_user_settings("u2", "nope").await.is_err());
    }
}
