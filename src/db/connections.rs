//! Platform connection rows. Token blobs are stored sealed.

use sqlx::Row;
use uuid::Uuid;

use super::{json_column, json_string, parse_uuid, Database};
use crate::error::{Error, Result};
use crate::types::{PlatformConnection, PlatformId};

fn map_connection(row: &sqlx::sqlite::SqliteRow) -> Result<PlatformConnection> {
    Ok(PlatformConnection {
        id: parse_uuid(row, "id")?,
        user_id: row.get("user_id"),
        platform: PlatformId::parse(row.get::<String, _>("platform").as_str())
            .map_err(|_| Error::internal("malformed platform in connection row"))?,
        account_id: row.get("account_id"),
        display_name: row.get("display_name"),
        scopes: json_column(row, "scopes")?,
        access_token_sealed: row.get("access_token_sealed"),
        refresh_token_sealed: row.get("refresh_token_sealed"),
        expires_at: row.get("expires_at"),
        active: row.get::<i64, _>("active") != 0,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

impl Database {
    /// Insert a fresh connection, deactivating any previous active row for
    /// the same (user, platform, platform account) first so the partial
    /// unique index holds.
    pub async fn insert_connection(&self, conn: &PlatformConnection) -> Result<()> {
        let mut tx = self.begin().await?;

        sqlx::query(
            "UPDATE platform_connections SET active = 0, updated_at = ?
             WHERE user_id = ? AND platform = ? AND account_id = ? AND active = 1",
        )
        .bind(conn.updated_at)
        .bind(&conn.user_id)
        .bind(conn.platform.as_str())
        .bind(&conn.account_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO platform_connections
                (id, user_id, platform, account_id, display_name, scopes,
                 access_token_sealed, refresh_token_sealed, expires_at, active,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(conn.id.to_string())
        .bind(&conn.user_id)
        .bind(conn.platform.as_str())
        .bind(&conn.account_id)
        .bind(&conn.display_name)
        .bind(json_string(&conn.scopes)?)
        .bind(&conn.access_token_sealed)
        .bind(&conn.refresh_token_sealed)
        .bind(conn.expires_at)
        .bind(if conn.active { 1i64 } else { 0i64 })
        .bind(conn.created_at)
        .bind(conn.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_connection(&self, id: Uuid) -> Result<Option<PlatformConnection>> {
        let row = sqlx::query("SELECT * FROM platform_connections WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_connection).transpose()
    }

    /// The active connection for (user, platform), if any.
    pub async fn active_connection(
        &self,
        user_id: &str,
        platform: PlatformId,
    ) -> Result<Option<PlatformConnection>> {
        let row = sqlx::query(
            "SELECT * FROM platform_connections
             WHERE user_id = ? AND platform = ? AND active = 1
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(user_id)
        .bind(platform.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(map_connection).transpose()
    }

    pub async fn list_connections(&self, user_id: &str) -> Result<Vec<PlatformConnection>> {
        let rows = sqlx::query(
            "SELECT * FROM platform_connections WHERE user_id = ? AND active = 1
             ORDER BY platform",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_connection).collect()
    }

    pub async fn deactivate_connection(&self, id: Uuid, now: i64) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE platform_connections SET active = 0, updated_at = ? WHERE id = ? AND active = 1",
        )
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn deactivate_user_platform(
        &self,
        user_id: &str,
        platform: PlatformId,
        now: i64,
    ) -> Result<u64> {
        let res = sqlx::query(
            "UPDATE platform_connections SET active = 0, updated_at = ?
             WHERE user_id = ? AND platform = ? AND active = 1",
        )
        .bind(now)
        .bind(user_id)
        .bind(platform.as_str())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    /// Store a refreshed token bundle on an existing connection.
    pub async fn update_connection_tokens(
        &self,
        id: Uuid,
        access_token_sealed: Vec<u8>,
        refresh_token_sealed: Option<Vec<u8>>,
        expires_at: i64,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE platform_connections
             SET access_token_sealed = ?,
                 refresh_token_sealed = COALESCE(?, refresh_token_sealed),
                 expires_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(access_token_sealed)
        .bind(refresh_token_sealed)
        .bind(expires_at)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
