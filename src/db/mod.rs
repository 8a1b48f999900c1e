//! Database access.
//!
//! A thin repository layer over SQLite: explicit SQL, explicit row mapping,
//! UTC-millisecond instants, TEXT UUIDs, JSON columns for lists and maps.
//! Operations that must share a transaction with the scheduler or the
//! dispatcher take a `&mut SqliteConnection` instead of the pool.

mod connections;
mod outcomes;
mod posts;
mod schedules;
mod videos;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Transaction};
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect and run migrations.
    pub async fn open(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| Error::config_missing(format!("invalid DATABASE_URL: {e}")))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, sqlx::Sqlite>> {
        Ok(self.pool.begin().await?)
    }
}

pub(crate) fn parse_uuid(row: &sqlx::sqlite::SqliteRow, column: &str) -> Result<Uuid> {
    let raw: String = row.get(column);
    Uuid::parse_str(&raw).map_err(|_| Error::internal(format!("malformed uuid in column {column}")))
}

pub(crate) fn json_column<T: serde::de::DeserializeOwned>(
    row: &sqlx::sqlite::SqliteRow,
    column: &str,
) -> Result<T> {
    let raw: String = row.get(column);
    serde_json::from_str(&raw)
        .map_err(|_| Error::internal(format!("malformed json in column {column}")))
}

pub(crate) fn json_string<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

#[cfg(test)]
pub(crate) async fn test_db() -> (tempfile::TempDir, Database) {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let path = dir.path().join("test.db");
    let db = Database::open(&format!("sqlite:{}", path.display()))
        .await
        .expect("open test db");
    (dir, db)
}
