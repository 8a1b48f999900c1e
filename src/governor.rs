//! Repost governor: per-(user, platform, video) cooldown and caption
//! variant rotation for recurring schedules.

use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::db::Database;
use crate::error::Result;
use crate::types::PlatformId;

/// Cooldown window, wall-clock, measured from the prior success's
/// completion instant.
pub const COOLDOWN_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RepostDecision {
    Allowed,
    Denied { hours_remaining: f64 },
}

/// Stateless policy gate. `check` takes the caller's connection so the
/// decision and the post transition share one transaction.
pub struct RepostGovernor;

impl RepostGovernor {
    /// Deny when a `POSTED` post exists for the triple within the window.
    pub async fn check(
        db: &Database,
        conn: &mut SqliteConnection,
        user_id: &str,
        platform: PlatformId,
        video_id: Uuid,
        now: i64,
    ) -> Result<RepostDecision> {
        let last = db.last_posted_at(conn, user_id, platform, video_id).await?;
        match last {
            Some(posted_at) if now - posted_at < COOLDOWN_MS => {
                let remaining_ms = COOLDOWN_MS - (now - posted_at);
                Ok(RepostDecision::Denied {
                    hours_remaining: remaining_ms as f64 / 3_600_000.0,
                })
            }
            _ => Ok(RepostDecision::Allowed),
        }
    }

    /// Variant for the current cursor, or `None` when the list is empty
    /// (base captions apply).
    pub fn select_variant(variants: &[String], cursor: i64) -> Option<&str> {
        if variants.is_empty() {
            return None;
        }
        let index = cursor.rem_euclid(variants.len() as i64) as usize;
        Some(variants[index].as_str())
    }

    /// Case-insensitive normalization to the canonical enum.
    pub fn normalize_platform(name: &str) -> Result<PlatformId> {
        PlatformId::parse(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_db;
    use crate::error::ErrorKind;
    use crate::types::{MultiPost, Post, PostStatus};

    async fn seed_posted(db: &Database, user: &str, platform: PlatformId, posted_at: i64) -> Uuid {
        let video_id = Uuid::new_v4();
        let multi_post = MultiPost {
            id: Uuid::new_v4(),
            user_id: user.to_string(),
            video_id,
            created_at: 0,
        };
        let post = Post {
            id: Uuid::new_v4(),
            multi_post_id: multi_post.id,
            user_id: user.to_string(),
            video_id,
            platform,
            caption: "c".into(),
            tags: vec![],
            status: PostStatus::Pending,
            attempts: 0,
            error_kind: None,
            error_message: None,
            platform_post_id: None,
            platform_url: None,
            posted_at: None,
            created_at: 0,
            updated_at: 0,
        };
        let mut tx = db.begin().await.unwrap();
        db.insert_multi_post_tx(&mut tx, &multi_post).await.unwrap();
        db.insert_post_tx(&mut tx, &post).await.unwrap();
        db.claim_post_for_attempt(&mut tx, post.id, posted_at)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        db.mark_post_posted(post.id, "pid", None, posted_at)
            .await
            .unwrap();
        video_id
    }

    #[tokio::test]
    async fn denies_within_window_with_hours_remaining() {
        let (_dir, db) = test_db().await;
        let posted_at = 1_000_000_000;
        let video_id = seed_posted(&db, "u1", PlatformId::Youtube, posted_at).await;

        // One hour later: 23 hours remain.
        let now = posted_at + 3_600_000;
        let mut conn = db.pool().acquire().await.unwrap();
        let decision =
            RepostGovernor::check(&db, &mut conn, "u1", PlatformId::Youtube, video_id, now)
                .await
                .unwrap();
        match decision {
            RepostDecision::Denied { hours_remaining } => {
                assert!((hours_remaining - 23.0).abs() < 0.01);
            }
            RepostDecision::Allowed => panic!("expected denial"),
        }
    }

    #[tokio::test]
    async fn allows_after_window() {
        let (_dir, db) = test_db().await;
        let posted_at = 1_000_000_000;
        let video_id = seed_posted(&db, "u1", PlatformId::Youtube, posted_at).await;

        let now = posted_at + COOLDOWN_MS;
        let mut conn = db.pool().acquire().await.unwrap();
        let decision =
            RepostGovernor::check(&db, &mut conn, "u1", PlatformId::Youtube, video_id, now)
                .await
                .unwrap();
        assert_eq!(decision, RepostDecision::Allowed);
    }

    #[tokio::test]
    async fn scoping_is_per_user_platform_video() {
        let (_dir, db) = test_db().await;
        let posted_at = 1_000_000_000;
        let video_id = seed_posted(&db, "u1", PlatformId::Youtube, posted_at).await;
        let now = posted_at + 60_000;

        let mut conn = db.pool().acquire().await.unwrap();
        // Different platform: allowed.
        let decision =
            RepostGovernor::check(&db, &mut conn, "u1", PlatformId::Tiktok, video_id, now)
                .await
                .unwrap();
        assert_eq!(decision, RepostDecision::Allowed);

        // Different user: allowed.
        let decision =
            RepostGovernor::check(&db, &mut conn, "u2", PlatformId::Youtube, video_id, now)
                .await
                .unwrap();
        assert_eq!(decision, RepostDecision::Allowed);

        // Different video: allowed.
        let decision = RepostGovernor::check(
            &db,
            &mut conn,
            "u1",
            PlatformId::Youtube,
            Uuid::new_v4(),
            now,
        )
        .await
        .unwrap();
        assert_eq!(decision, RepostDecision::Allowed);
    }

    #[tokio::test]
    async fn processing_posts_do_not_bear_cooldown() {
        let (_dir, db) = test_db().await;
        let video_id = Uuid::new_v4();
        let multi_post = MultiPost {
            id: Uuid::new_v4(),
            user_id: "u1".into(),
            video_id,
            created_at: 0,
        };
        let post = Post {
            id: Uuid::new_v4(),
            multi_post_id: multi_post.id,
            user_id: "u1".into(),
            video_id,
            platform: PlatformId::Youtube,
            caption: "c".into(),
            tags: vec![],
            status: PostStatus::Processing,
            attempts: 1,
            error_kind: None,
            error_message: None,
            platform_post_id: None,
            platform_url: None,
            posted_at: None,
            created_at: 0,
            updated_at: 0,
        };
        let mut tx = db.begin().await.unwrap();
        db.insert_multi_post_tx(&mut tx, &multi_post).await.unwrap();
        db.insert_post_tx(&mut tx, &post).await.unwrap();
        tx.commit().await.unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        let decision =
            RepostGovernor::check(&db, &mut conn, "u1", PlatformId::Youtube, video_id, 1_000)
                .await
                .unwrap();
        assert_eq!(decision, RepostDecision::Allowed);
    }

    #[test]
    fn variant_selection_is_cursor_mod_len() {
        let variants: Vec<String> = vec!["v0".into(), "v1".into(), "v2".into()];
        assert_eq!(RepostGovernor::select_variant(&variants, 0), Some("v0"));
        assert_eq!(RepostGovernor::select_variant(&variants, 1), Some("v1"));
        assert_eq!(RepostGovernor::select_variant(&variants, 2), Some("v2"));
        assert_eq!(RepostGovernor::select_variant(&variants, 3), Some("v0"));
        assert_eq!(RepostGovernor::select_variant(&variants, 100), Some("v1"));
        assert_eq!(RepostGovernor::select_variant(&[], 5), None);
    }

    #[test]
    fn platform_normalization() {
        assert_eq!(
            RepostGovernor::normalize_platform("tikTok").unwrap(),
            PlatformId::Tiktok
        );
        let err = RepostGovernor::normalize_platform("vine").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }
}
