//! Video rows.

use sqlx::Row;
use uuid::Uuid;

use super::{json_column, json_string, parse_uuid, Database};
use crate::error::Result;
use crate::types::{Video, VideoStatus};

fn map_video(row: &sqlx::sqlite::SqliteRow) -> Result<Video> {
    Ok(Video {
        id: parse_uuid(row, "id")?,
        user_id: row.get("user_id"),
        title: row.get("title"),
        storage_key: row.get("storage_key"),
        container: row.get("container"),
        codec: row.get("codec"),
        duration_ms: row.get("duration_ms"),
        width: row.get("width"),
        height: row.get("height"),
        size_bytes: row.get("size_bytes"),
        status: VideoStatus::parse(row.get::<String, _>("status").as_str())
            .unwrap_or(VideoStatus::Failed),
        default_caption: row.get("default_caption"),
        default_tags: json_column(row, "default_tags")?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

impl Database {
    pub async fn insert_video(&self, video: &Video) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO videos (id, user_id, title, storage_key, container, codec,
                                duration_ms, width, height, size_bytes, status,
                                default_caption, default_tags, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(video.id.to_string())
        .bind(&video.user_id)
        .bind(&video.title)
        .bind(&video.storage_key)
        .bind(&video.container)
        .bind(&video.codec)
        .bind(video.duration_ms)
        .bind(video.width)
        .bind(video.height)
        .bind(video.size_bytes)
        .bind(video.status.as_str())
        .bind(&video.default_caption)
        .bind(json_string(&video.default_tags)?)
        .bind(video.created_at)
        .bind(video.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_video(&self, id: Uuid) -> Result<Option<Video>> {
        let row = sqlx::query("SELECT * FROM videos WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_video).transpose()
    }

    pub async fn list_videos(&self, user_id: &str) -> Result<Vec<Video>> {
        let rows = sqlx::query("SELECT * FROM videos WHERE user_id = ? ORDER BY created_at DESC")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_video).collect()
    }

    pub async fn set_video_status(
        &self,
        id: Uuid,
        status: VideoStatus,
        size_bytes: Option<i64>,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE videos SET status = ?, size_bytes = COALESCE(?, size_bytes), updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(size_bytes)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_video_defaults(
        &self,
        id: Uuid,
        caption: Option<String>,
        tags: Vec<String>,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE videos SET default_caption = ?, default_tags = ?, updated_at = ? WHERE id = ?",
        )
        .bind(caption)
        .bind(json_string(&tags)?)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove a video row. Posts keep their weak `video_id` reference;
    /// platform-side content is untouched.
    pub async fn delete_video(&self, id: Uuid) -> Result<bool> {
        let res = sqlx::query("DELETE FROM videos WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }
}
