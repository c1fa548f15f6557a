//! Database operations

use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite, migrate::MigrateDatabase};
use anyhow::Result;
use tracing::info;

use crate::auth::{has_credentials, hash_user_key, verify_user_key};
use crate::db::UserRecord;

/// Initialize the database connection pool
pub async fn init(database_url: &str) -> Result<Pool<Sqlite>> {
    let in_memory = database_url.contains(":memory:");

    // Create database file if it doesn't exist
    if !in_memory && !sqlx::Sqlite::database_exists(database_url).await.unwrap_or(false) {
        info!("Creating database at {}", database_url);
        sqlx::Sqlite::create_database(database_url).await?;
    }

    // Every in-memory connection is a separate database
    let pool = SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { 5 })
        .connect(database_url)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// Run database migrations
pub async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
    info!("Running database migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            user_id TEXT PRIMARY KEY,
            key_hash TEXT NOT NULL,
            settings TEXT NOT NULL DEFAULT '{}',
            last_seen INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
            created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );
        "#
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Look up a user and check the presented key
pub async fn verify_user(
    pool: &Pool<Sqlite>,
    user_id: &str,
    user_key: &str,
) -> Result<Option<UserRecord>> {
    if !has_credentials(user_id, user_key) {
        return Ok(None);
    }

    let row: Option<(String, i64)> = sqlx::query_as(
        r#"
        SELECT key_hash, created_at FROM users WHERE user_id = ?1
        "#
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    let Some((key_hash, created_at)) = row else {
        return Ok(None);
    };
    if !verify_user_key(user_key, &key_hash) {
        return Ok(None);
    }

    update_last_seen(pool, user_id).await?;
    Ok(Some(UserRecord {
        user_id: user_id.to_string(),
        created_at,
    }))
}

/// Update user last seen
pub async fn update_last_seen(pool: &Pool<Sqlite>, user_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE users SET last_seen = strftime('%s', 'now') WHERE user_id = ?1
        "#
    )
    .bind(user_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Register a user, idempotent for the same key
pub async fn register_user(pool: &Pool<Sqlite>, user_id: &str, user_key: &str) -> Result<UserRecord> {
    if !has_credentials(user_id, user_key) {
        anyhow::bail!("userId and userKey are required");
    }

    if let Some(existing) = verify_user(pool, user_id, user_key).await? {
        return Ok(existing);
    }

    let inserted = sqlx::query(
        r#"
        INSERT INTO users (user_id, key_hash)
        VALUES (?1, ?2)
        ON CONFLICT(user_id) DO NOTHING
        "#
    )
    .bind(user_id)
    .bind(hash_user_key(user_key))
    .execute(pool)
    .await?;

    if inserted.rows_affected() == 0 {
        anyhow::bail!("User {} already exists with a different key", user_id);
    }

    info!("Registered user {}", user_id);
    verify_user(pool, user_id, user_key)
        .await?
        .ok_or_else(|| anyhow::anyhow!("User {} vanished after insert", user_id))
}

/// Load the settings document for a verified user
pub async fn load_user_settings(
    pool: &Pool<Sqlite>,
    user_id: &str,
    user_key: &str,
) -> Result<serde_json::Value> {
    verify_user(pool, user_id, user_key)
        .await?
        .ok_or_else(|| anyhow::anyhow!("Invalid credentials"))?;

    let settings: String = sqlx::query_scalar(
        r#"
        SELECT settings FROM users WHERE user_id = ?1
        "#
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;

    Ok(serde_json::from_str(&settings)?)
}
