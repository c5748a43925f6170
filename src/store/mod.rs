// User persistence on SQLite.
//
// One pool for the process lifetime; every operation acquires and releases
// its own pooled connection, with no transaction spanning a dispatch.

use std::path::Path;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Identity and preference record for one chat user.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub(crate) struct User {
    pub tg_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    /// Validated against the registry on every read; an unknown or absent
    /// key means "use the default model", never an error.
    pub selected_model_key: Option<String>,
    /// Gates whether the dispatch pipeline processes this user at all.
    pub is_activated: bool,
    /// Membership in the error-escalation broadcast set.
    pub is_admin: bool,
    pub created_at: chrono::NaiveDateTime,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum StoreError {
    #[error("database connection failed: {0}")]
    Connection(String),
    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// Lookup and update operations on the user set.
///
/// Results keep "not found" (`Ok(None)`) distinct from "store failure"
/// (`Err`) so callers can log the difference, even where they then treat
/// both the same way.
#[async_trait]
pub(crate) trait UserDirectory: Send + Sync {
    async fn get_user(&self, tg_id: i64) -> Result<Option<User>, StoreError>;

    /// Insert a user row with `is_activated = false`, `is_admin = false`.
    /// Returns `false` when the row already existed.
    async fn create_user(
        &self,
        tg_id: i64,
        username: Option<&str>,
        first_name: Option<&str>,
        last_name: Option<&str>,
        selected_model_key: &str,
    ) -> Result<bool, StoreError>;

    async fn update_selected_model(&self, tg_id: i64, key: &str) -> Result<(), StoreError>;

    async fn list_admins(&self) -> Result<Vec<User>, StoreError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    tg_id              INTEGER PRIMARY KEY,
    username           TEXT,
    first_name         TEXT,
    last_name          TEXT,
    selected_model_key TEXT,
    is_activated       INTEGER NOT NULL DEFAULT 0,
    is_admin           INTEGER NOT NULL DEFAULT 0,
    created_at         TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)";

/// SQLite-backed [`UserDirectory`].
pub(crate) struct SqliteUserStore {
    pool: SqlitePool,
}

impl SqliteUserStore {
    /// Open (creating if missing) the database at `path` and run migrations.
    pub(crate) async fn connect(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::Connection(format!("failed to create database directory: {e}"))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    #[cfg(test)]
    pub(crate) async fn connect_in_memory() -> Result<Self, StoreError> {
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        // One connection, or each pooled connection would see its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for SqliteUserStore {
    async fn get_user(&self, tg_id: i64) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE tg_id = ?")
            .bind(tg_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn create_user(
        &self,
        tg_id: i64,
        username: Option<&str>,
        first_name: Option<&str>,
        last_name: Option<&str>,
        selected_model_key: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO users (tg_id, username, first_name, last_name, selected_model_key, is_activated, is_admin)
             VALUES (?, ?, ?, ?, ?, 0, 0)
             ON CONFLICT(tg_id) DO NOTHING",
        )
        .bind(tg_id)
        .bind(username)
        .bind(first_name)
        .bind(last_name)
        .bind(selected_model_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_selected_model(&self, tg_id: i64, key: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET selected_model_key = ? WHERE tg_id = ?")
            .bind(key)
            .bind(tg_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_admins(&self) -> Result<Vec<User>, StoreError> {
        let admins = sqlx::query_as::<_, User>("SELECT * FROM users WHERE is_admin = 1")
            .fetch_all(&self.pool)
            .await?;
        Ok(admins)
    }
}
