//! Video operations: upload intents, completion, defaults, listing.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use super::events::{Event, EventBus};
use crate::clock::Clock;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::storage::ObjectStore;
use crate::types::{Video, VideoStatus};

/// Lifetime of the presigned upload URL returned by `create_video_intent`.
const UPLOAD_URL_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
pub struct CreateVideoIntent {
    pub user_id: String,
    pub title: String,
    pub container: String,
    pub codec: String,
    pub duration_ms: i64,
    pub width: i64,
    pub height: i64,
    pub size_bytes: i64,
    pub default_caption: Option<String>,
    pub default_tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VideoIntent {
    pub video: Video,
    pub upload_url: String,
}

pub struct VideoService {
    db: Database,
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl VideoService {
    pub fn new(
        db: Database,
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            store,
            clock,
            events,
        }
    }

    /// Register a video and hand back a presigned PUT URL for the client's
    /// direct upload. The row stays `uploading` until completion.
    pub async fn create_video_intent(&self, request: CreateVideoIntent) -> Result<VideoIntent> {
        if request.title.trim().is_empty() {
            return Err(Error::validation("title must not be empty"));
        }
        if request.duration_ms <= 0 {
            return Err(Error::validation("duration must be positive"));
        }
        if request.size_bytes <= 0 {
            return Err(Error::validation("size must be positive"));
        }

        let now = self.clock.now_ms();
        let id = self.clock.new_id();
        let container = request.container.to_ascii_lowercase();
        let storage_key = format!("videos/{}/{id}.{container}", request.user_id);
        let video = Video {
            id,
            user_id: request.user_id,
            title: request.title,
            storage_key,
            container,
            codec: request.codec.to_ascii_lowercase(),
            duration_ms: request.duration_ms,
            width: request.width,
            height: request.height,
            size_bytes: request.size_bytes,
            status: VideoStatus::Uploading,
            default_caption: request.default_caption,
            default_tags: request.default_tags,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_video(&video).await?;

        let upload_url = self
            .store
            .presigned_put_url(&video.storage_key, UPLOAD_URL_TTL)
            .await?;
        info!(video_id = %video.id, "video intent created");
        Ok(VideoIntent { video, upload_url })
    }

    /// Confirm the client's upload: verify the object landed in the store
    /// and mark the row `ready`. Idempotent for already-ready videos.
    pub async fn complete_video_upload(&self, user_id: &str, video_id: Uuid) -> Result<Video> {
        let video = self.owned_video(user_id, video_id).await?;
        if video.status == VideoStatus::Ready {
            return Ok(video);
        }

        let actual_size = self.store.size(&video.storage_key).await? as i64;
        let now = self.clock.now_ms();
        self.db
            .set_video_status(video_id, VideoStatus::Ready, Some(actual_size), now)
            .await?;
        self.events.emit(Event::VideoReady { video_id });
        info!(video_id = %video_id, size_bytes = actual_size, "video upload completed");

        self.owned_video(user_id, video_id).await
    }

    pub async fn get_video(&self, user_id: &str, video_id: Uuid) -> Result<Video> {
        self.owned_video(user_id, video_id).await
    }

    pub async fn list_videos(&self, user_id: &str) -> Result<Vec<Video>> {
        self.db.list_videos(user_id).await
    }

    /// Update the user-editable caption/tag defaults. Everything else is
    /// immutable once the video is ready.
    pub async fn update_defaults(
        &self,
        user_id: &str,
        video_id: Uuid,
        default_caption: Option<String>,
        default_tags: Vec<String>,
    ) -> Result<Video> {
        self.owned_video(user_id, video_id).await?;
        self.db
            .update_video_defaults(video_id, default_caption, default_tags, self.clock.now_ms())
            .await?;
        self.owned_video(user_id, video_id).await
    }

    /// Delete the video row. Platform-side content already published from
    /// it is untouched.
    pub async fn delete_video(&self, user_id: &str, video_id: Uuid) -> Result<()> {
        self.owned_video(user_id, video_id).await?;
        self.db.delete_video(video_id).await?;
        Ok(())
    }

    async fn owned_video(&self, user_id: &str, video_id: Uuid) -> Result<Video> {
        match self.db.get_video(video_id).await? {
            Some(video) if video.user_id == user_id => Ok(video),
            _ => Err(Error::validation("video not found")),
        }
    }
}
