//! Multi-post and post rows, including the dispatcher's claim transition.

use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::{json_column, json_string, parse_uuid, Database};
use crate::error::{Error, ErrorKind, Result};
use crate::types::{MultiPost, PlatformId, Post, PostStatus};

fn map_post(row: &sqlx::sqlite::SqliteRow) -> Result<Post> {
    Ok(Post {
        id: parse_uuid(row, "id")?,
        multi_post_id: parse_uuid(row, "multi_post_id")?,
        user_id: row.get("user_id"),
        video_id: parse_uuid(row, "video_id")?,
        platform: PlatformId::parse(row.get::<String, _>("platform").as_str())
            .map_err(|_| Error::internal("malformed platform in post row"))?,
        caption: row.get("caption"),
        tags: json_column(row, "tags")?,
        status: PostStatus::parse(row.get::<String, _>("status").as_str())
            .ok_or_else(|| Error::internal("malformed status in post row"))?,
        attempts: row.get("attempts"),
        error_kind: row
            .get::<Option<String>, _>("error_kind")
            .as_deref()
            .and_then(ErrorKind::parse),
        error_message: row.get("error_message"),
        platform_post_id: row.get("platform_post_id"),
        platform_url: row.get("platform_url"),
        posted_at: row.get("posted_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_multi_post(row: &sqlx::sqlite::SqliteRow) -> Result<MultiPost> {
    Ok(MultiPost {
        id: parse_uuid(row, "id")?,
        user_id: row.get("user_id"),
        video_id: parse_uuid(row, "video_id")?,
        created_at: row.get("created_at"),
    })
}

impl Database {
    pub async fn insert_multi_post_tx(
        &self,
        conn: &mut SqliteConnection,
        multi_post: &MultiPost,
    ) -> Result<()> {
        sqlx::query("INSERT INTO multi_posts (id, user_id, video_id, created_at) VALUES (?, ?, ?, ?)")
            .bind(multi_post.id.to_string())
            .bind(&multi_post.user_id)
            .bind(multi_post.video_id.to_string())
            .bind(multi_post.created_at)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn insert_post_tx(&self, conn: &mut SqliteConnection, post: &Post) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO posts (id, multi_post_id, user_id, video_id, platform, caption,
                               tags, status, attempts, error_kind, error_message,
                               platform_post_id, platform_url, posted_at,
                               created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(post.id.to_string())
        .bind(post.multi_post_id.to_string())
        .bind(&post.user_id)
        .bind(post.video_id.to_string())
        .bind(post.platform.as_str())
        .bind(&post.caption)
        .bind(json_string(&post.tags)?)
        .bind(post.status.as_str())
        .bind(post.attempts)
        .bind(post.error_kind.map(|k| k.as_str()))
        .bind(&post.error_message)
        .bind(&post.platform_post_id)
        .bind(&post.platform_url)
        .bind(post.posted_at)
        .bind(post.created_at)
        .bind(post.updated_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn get_post(&self, id: Uuid) -> Result<Option<Post>> {
        let row = sqlx::query("SELECT * FROM posts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_post).transpose()
    }

    pub async fn get_post_tx(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> Result<Option<Post>> {
        let row = sqlx::query("SELECT * FROM posts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(map_post).transpose()
    }

    pub async fn get_multi_post(&self, id: Uuid) -> Result<Option<MultiPost>> {
        let row = sqlx::query("SELECT * FROM multi_posts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_multi_post).transpose()
    }

    pub async fn posts_for_multi_post(&self, multi_post_id: Uuid) -> Result<Vec<Post>> {
        let rows = sqlx::query("SELECT * FROM posts WHERE multi_post_id = ? ORDER BY platform")
            .bind(multi_post_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_post).collect()
    }

    pub async fn list_posts(
        &self,
        user_id: &str,
        status: Option<PostStatus>,
        platform: Option<PlatformId>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Post>> {
        let rows = sqlx::query(
            "SELECT * FROM posts
             WHERE user_id = ?
               AND (? IS NULL OR status = ?)
               AND (? IS NULL OR platform = ?)
             ORDER BY created_at DESC
             LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(status.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .bind(platform.map(|p| p.as_str()))
        .bind(platform.map(|p| p.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_post).collect()
    }

    /// Dispatcher claim: move a `PENDING`/`PROCESSING` post to `PROCESSING`
    /// and bump the attempt counter. Returns `None` when the post is already
    /// terminal (the idempotent-drop path).
    pub async fn claim_post_for_attempt(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
        now: i64,
    ) -> Result<Option<Post>> {
        let res = sqlx::query(
            "UPDATE posts
             SET status = 'PROCESSING', attempts = attempts + 1, updated_at = ?
             WHERE id = ? AND status IN ('PENDING', 'PROCESSING')",
        )
        .bind(now)
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;

        if res.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_post_tx(conn, id).await
    }

    pub async fn mark_post_posted(
        &self,
        id: Uuid,
        platform_post_id: &str,
        platform_url: Option<&str>,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE posts
             SET status = 'POSTED', platform_post_id = ?, platform_url = ?,
                 posted_at = ?, error_kind = NULL, error_message = NULL, updated_at = ?
             WHERE id = ? AND status = 'PROCESSING'",
        )
        .bind(platform_post_id)
        .bind(platform_url)
        .bind(now)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_post_failed(
        &self,
        id: Uuid,
        kind: ErrorKind,
        message: &str,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE posts
             SET status = 'FAILED', error_kind = ?, error_message = ?, updated_at = ?
             WHERE id = ? AND status IN ('PENDING', 'PROCESSING')",
        )
        .bind(kind.as_str())
        .bind(message)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_post_failed_tx(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
        kind: ErrorKind,
        message: &str,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE posts
             SET status = 'FAILED', error_kind = ?, error_message = ?, updated_at = ?
             WHERE id = ? AND status IN ('PENDING', 'PROCESSING')",
        )
        .bind(kind.as_str())
        .bind(message)
        .bind(now)
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Record a transient failure on a still-in-flight post.
    pub async fn record_post_error(
        &self,
        id: Uuid,
        kind: ErrorKind,
        message: &str,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE posts SET error_kind = ?, error_message = ?, updated_at = ?
             WHERE id = ? AND status = 'PROCESSING'",
        )
        .bind(kind.as_str())
        .bind(message)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cooperative cancel: only `PENDING` posts can be canceled.
    pub async fn cancel_post_if_pending(&self, id: Uuid, now: i64) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE posts SET status = 'CANCELED', updated_at = ?
             WHERE id = ? AND status = 'PENDING'",
        )
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Completion instant of the most recent `POSTED` post for the
    /// (user, platform, video) triple; the governor's cooldown anchor.
    pub async fn last_posted_at(
        &self,
        conn: &mut SqliteConnection,
        user_id: &str,
        platform: PlatformId,
        video_id: Uuid,
    ) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT MAX(posted_at) AS last FROM posts
             WHERE user_id = ? AND platform = ? AND video_id = ? AND status = 'POSTED'",
        )
        .bind(user_id)
        .bind(platform.as_str())
        .bind(video_id.to_string())
        .fetch_one(&mut *conn)
        .await?;
        Ok(row.get("last"))
    }
}
