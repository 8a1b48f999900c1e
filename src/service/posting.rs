//! Immediate multi-post operations and post queries.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use super::events::{Event, EventBus};
use super::{normalize_targets, TargetInput};
use crate::broker::{EnqueueOptions, JobBroker, PostJob, POST_QUEUE};
use crate::clock::Clock;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::types::{
    MultiPost, MultiPostState, PlatformId, Post, PostOutcome, PostStatus, TargetSpecs, Video,
    VideoStatus,
};

#[derive(Debug, Clone)]
pub struct CreateMultiPost {
    pub user_id: String,
    pub video_id: Uuid,
    pub targets: Vec<TargetInput>,
}

#[derive(Debug, Clone)]
pub struct MultiPostView {
    pub multi_post: MultiPost,
    pub state: MultiPostState,
    pub posts: Vec<Post>,
}

#[derive(Debug, Clone)]
pub struct PostView {
    pub post: Post,
    pub outcomes: Vec<PostOutcome>,
}

#[derive(Debug, Clone, Default)]
pub struct ListPostsQuery {
    pub status: Option<String>,
    pub platform: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub struct PostingService {
    db: Database,
    broker: Arc<dyn JobBroker>,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl PostingService {
    pub fn new(
        db: Database,
        broker: Arc<dyn JobBroker>,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            broker,
            clock,
            events,
        }
    }

    /// Create a multi-post: one post per target platform, all enqueued for
    /// immediate dispatch in the same transaction that materializes them.
    ///
    /// The repost cooldown is deliberately not checked here; the dispatcher
    /// evaluates it under the post transition transaction, so the outcome
    /// lands on the post rather than failing the whole request.
    pub async fn create_multi_post(&self, request: CreateMultiPost) -> Result<MultiPostView> {
        let targets = normalize_targets(&request.targets)?;
        let video = self.ready_video(&request.user_id, request.video_id).await?;
        self.ensure_connected(&request.user_id, &targets).await?;

        let now = self.clock.now_ms();
        let multi_post = MultiPost {
            id: self.clock.new_id(),
            user_id: request.user_id.clone(),
            video_id: video.id,
            created_at: now,
        };

        let mut tx = self.db.begin().await?;
        self.db.insert_multi_post_tx(&mut tx, &multi_post).await?;

        let mut posts = Vec::with_capacity(targets.len());
        for (platform, spec) in &targets {
            let post = Post {
                id: self.clock.new_id(),
                multi_post_id: multi_post.id,
                user_id: request.user_id.clone(),
                video_id: video.id,
                platform: *platform,
                caption: spec.caption.clone(),
                tags: spec.tags.clone(),
                status: PostStatus::Pending,
                attempts: 0,
                error_kind: None,
                error_message: None,
                platform_post_id: None,
                platform_url: None,
                posted_at: None,
                created_at: now,
                updated_at: now,
            };
            self.db.insert_post_tx(&mut tx, &post).await?;

            let payload = serde_json::to_string(&PostJob { post_id: post.id })?;
            self.broker
                .enqueue(
                    &mut tx,
                    POST_QUEUE,
                    &payload,
                    EnqueueOptions {
                        delay: Duration::ZERO,
                        dedup_key: Some(post.id.to_string()),
                    },
                )
                .await?;
            posts.push(post);
        }
        tx.commit().await?;

        info!(multi_post_id = %multi_post.id, posts = posts.len(), "multi-post created");
        self.events.emit(Event::MultiPostCreated {
            multi_post_id: multi_post.id,
            post_ids: posts.iter().map(|p| p.id).collect(),
        });

        Ok(MultiPostView {
            state: MultiPostState::derive(&posts),
            multi_post,
            posts,
        })
    }

    pub async fn get_multi_post(&self, user_id: &str, multi_post_id: Uuid) -> Result<MultiPostView> {
        let multi_post = match self.db.get_multi_post(multi_post_id).await? {
            Some(mp) if mp.user_id == user_id => mp,
            _ => return Err(Error::validation("multi-post not found")),
        };
        let posts = self.db.posts_for_multi_post(multi_post_id).await?;
        Ok(MultiPostView {
            state: MultiPostState::derive(&posts),
            multi_post,
            posts,
        })
    }

    pub async fn list_posts(&self, user_id: &str, query: ListPostsQuery) -> Result<Vec<Post>> {
        let status = query
            .status
            .as_deref()
            .map(|s| {
                PostStatus::parse(&s.to_ascii_uppercase())
                    .ok_or_else(|| Error::validation(format!("unknown post status: {s}")))
            })
            .transpose()?;
        let platform = query
            .platform
            .as_deref()
            .map(PlatformId::parse)
            .transpose()?;
        self.db
            .list_posts(
                user_id,
                status,
                platform,
                query.limit.unwrap_or(50).clamp(1, 200),
                query.offset.unwrap_or(0).max(0),
            )
            .await
    }

    pub async fn get_post(&self, user_id: &str, post_id: Uuid) -> Result<PostView> {
        let post = self.owned_post(user_id, post_id).await?;
        let outcomes = self.db.outcomes_for_post(post_id).await?;
        Ok(PostView { post, outcomes })
    }

    /// Cancel a pending post. Cancellation is cooperative: an in-flight
    /// attempt completes, so only `PENDING` posts can be canceled.
    pub async fn cancel_post(&self, user_id: &str, post_id: Uuid) -> Result<Post> {
        self.owned_post(user_id, post_id).await?;
        if !self
            .db
            .cancel_post_if_pending(post_id, self.clock.now_ms())
            .await?
        {
            return Err(Error::validation("only pending posts can be canceled"));
        }
        self.owned_post(user_id, post_id).await
    }

    /// Cancel every still-pending post of a multi-post; returns the count.
    pub async fn cancel_multi_post(&self, user_id: &str, multi_post_id: Uuid) -> Result<u64> {
        let view = self.get_multi_post(user_id, multi_post_id).await?;
        let mut canceled = 0;
        for post in &view.posts {
            if post.status == PostStatus::Pending
                && self
                    .db
                    .cancel_post_if_pending(post.id, self.clock.now_ms())
                    .await?
            {
                canceled += 1;
            }
        }
        Ok(canceled)
    }

    async fn owned_post(&self, user_id: &str, post_id: Uuid) -> Result<Post> {
        match self.db.get_post(post_id).await? {
            Some(post) if post.user_id == user_id => Ok(post),
            _ => Err(Error::validation("post not found")),
        }
    }

    async fn ready_video(&self, user_id: &str, video_id: Uuid) -> Result<Video> {
        let video = match self.db.get_video(video_id).await? {
            Some(video) if video.user_id == user_id => video,
            _ => return Err(Error::validation("video not found")),
        };
        if video.status != VideoStatus::Ready {
            return Err(Error::validation("video is not ready"));
        }
        Ok(video)
    }

    async fn ensure_connected(&self, user_id: &str, targets: &TargetSpecs) -> Result<()> {
        for platform in targets.keys() {
            if self
                .db
                .active_connection(user_id, *platform)
                .await?
                .is_none()
            {
                return Err(Error::validation(format!("{platform} is not connected")));
            }
        }
        Ok(())
    }
}
