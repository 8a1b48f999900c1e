//! Dispatcher behavior under contention and failure: the token refresh
//! race, the attempt cap, and dual-credential configuration gaps.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use vidcast::clock::{Clock, VirtualClock};
use vidcast::config::Config;
use vidcast::error::{Error, ErrorKind};
use vidcast::platforms::mock::MockAdapter;
use vidcast::platforms::{AdapterRegistry, PlatformAdapter};
use vidcast::service::posting::CreateMultiPost;
use vidcast::service::videos::CreateVideoIntent;
use vidcast::service::{TargetInput, VidcastService};
use vidcast::storage::MemoryStore;
use vidcast::types::{OutcomeKind, PlatformId, PostStatus};

struct Harness {
    _dir: TempDir,
    service: VidcastService,
    clock: Arc<VirtualClock>,
    store: Arc<MemoryStore>,
    mocks: HashMap<PlatformId, Arc<MockAdapter>>,
}

/// Build a harness around pre-constructed mock adapters so tests can tweak
/// adapter behavior (refresh support, app-credential requirements). The
/// mocks and the service must share the same clock instance.
async fn harness_with(clock: Arc<VirtualClock>, mocks_in: Vec<Arc<MockAdapter>>) -> Harness {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("test.db");
    let config = Config::from_toml(&format!(
        r#"
        database_url = "sqlite:{}"
        encryption_key = "integration-test-key"
        "#,
        db_path.display()
    ))
    .unwrap();

    let store = Arc::new(MemoryStore::new());

    let mut mocks = HashMap::new();
    let mut adapters: Vec<Arc<dyn PlatformAdapter>> = Vec::new();
    for mock in mocks_in {
        mocks.insert(mock.id(), mock.clone());
        adapters.push(mock);
    }
    let registry = Arc::new(AdapterRegistry::with_adapters(adapters));

    let service = VidcastService::assemble(config, store.clone(), clock.clone(), registry)
        .await
        .unwrap();

    Harness {
        _dir: dir,
        service,
        clock,
        store,
        mocks,
    }
}

fn test_clock() -> Arc<VirtualClock> {
    Arc::new(VirtualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
    ))
}

impl Harness {
    async fn connect(&self, user: &str, platform: PlatformId) {
        let start = self
            .service
            .connections()
            .start_platform_oauth(user, platform.as_str())
            .await
            .unwrap();
        self.service
            .connections()
            .complete_platform_oauth(user, platform.as_str(), "auth-code", &start.state)
            .await
            .unwrap();
    }

    async fn ready_video(&self, user: &str) -> uuid::Uuid {
        let intent = self
            .service
            .videos()
            .create_video_intent(CreateVideoIntent {
                user_id: user.to_string(),
                title: "clip".into(),
                container: "mp4".into(),
                codec: "h264".into(),
                duration_ms: 30_000,
                width: 1080,
                height: 1920,
                size_bytes: 1_000_000,
                default_caption: None,
                default_tags: vec![],
            })
            .await
            .unwrap();
        self.store
            .put(&intent.video.storage_key, vec![7u8; 1_000_000]);
        self.service
            .videos()
            .complete_video_upload(user, intent.video.id)
            .await
            .unwrap()
            .id
    }

    async fn single_post(&self, user: &str, video_id: uuid::Uuid, platform: PlatformId) -> uuid::Uuid {
        let view = self
            .service
            .posting()
            .create_multi_post(CreateMultiPost {
                user_id: user.to_string(),
                video_id,
                targets: vec![TargetInput {
                    platform: platform.as_str().to_string(),
                    caption: "caption".into(),
                    tags: vec![],
                }],
            })
            .await
            .unwrap();
        view.posts[0].id
    }
}

#[tokio::test]
async fn concurrent_posts_share_one_token_refresh() {
    let clock = test_clock();
    let instagram = Arc::new(MockAdapter::new(
        PlatformId::Instagram,
        clock.clone() as Arc<dyn Clock>,
    ));
    let h = harness_with(clock.clone(), vec![instagram.clone()]).await;

    h.connect("u1", PlatformId::Instagram).await;

    // Two posts for the same connection, different videos (so the repost
    // governor stays out of the way).
    let video_a = h.ready_video("u1").await;
    let video_b = h.ready_video("u1").await;
    let post_a = h.single_post("u1", video_a, PlatformId::Instagram).await;
    let post_b = h.single_post("u1", video_b, PlatformId::Instagram).await;

    // Let the stored token expire into the safety window.
    clock.advance(Duration::from_secs(3600));

    let dispatcher = h.service.dispatcher();
    let (a, b) = tokio::join!(dispatcher.process_next(), dispatcher.process_next());
    assert!(a.unwrap());
    assert!(b.unwrap());

    for post_id in [post_a, post_b] {
        let post = h.service.posting().get_post("u1", post_id).await.unwrap();
        assert_eq!(post.post.status, PostStatus::Posted);
    }
    // Exactly one network refresh despite two concurrent publishes.
    assert_eq!(instagram.refresh_count(), 1);
}

#[tokio::test]
async fn fifth_failed_attempt_is_terminal() {
    let clock = test_clock();
    let youtube = Arc::new(MockAdapter::new(
        PlatformId::Youtube,
        clock.clone() as Arc<dyn Clock>,
    ));
    for _ in 0..5 {
        youtube.push_publish_err(Error::new(ErrorKind::PlatformTransient, "upstream 502"));
    }
    let h = harness_with(clock.clone(), vec![youtube.clone()]).await;

    h.connect("u1", PlatformId::Youtube).await;
    let video_id = h.ready_video("u1").await;
    let post_id = h.single_post("u1", video_id, PlatformId::Youtube).await;

    let dispatcher = h.service.dispatcher();
    for attempt in 1..=5 {
        assert!(dispatcher.process_next().await.unwrap(), "attempt {attempt}");
        // Skip past any backoff (max 360s at attempt 4, jittered x1.5).
        h.clock.advance(Duration::from_secs(900));
    }

    let post = h.service.posting().get_post("u1", post_id).await.unwrap();
    assert_eq!(post.post.status, PostStatus::Failed);
    assert_eq!(post.post.error_kind, Some(ErrorKind::PlatformTransient));
    assert_eq!(post.post.attempts, 5);

    // One outcome per attempt; only the last is on a terminal post, and no
    // sixth attempt happens.
    assert_eq!(post.outcomes.len(), 5);
    assert!(post
        .outcomes
        .iter()
        .all(|o| o.outcome == OutcomeKind::TransientFail));
    assert!(!dispatcher.process_next().await.unwrap());
    assert_eq!(youtube.publish_count(), 5);
}

#[tokio::test]
async fn expired_token_report_is_retried_once_after_refresh() {
    let clock = test_clock();
    let tiktok = Arc::new(MockAdapter::new(
        PlatformId::Tiktok,
        clock.clone() as Arc<dyn Clock>,
    ));
    // First publish call reports an expired token; the in-attempt retry
    // succeeds with the refreshed token.
    tiktok.push_publish_err(Error::new(ErrorKind::AuthExpired, "token expired"));
    let h = harness_with(clock.clone(), vec![tiktok.clone()]).await;

    h.connect("u1", PlatformId::Tiktok).await;
    let video_id = h.ready_video("u1").await;
    let post_id = h.single_post("u1", video_id, PlatformId::Tiktok).await;

    // Some time passes between connect and dispatch.
    h.clock.advance(Duration::from_secs(60));

    let dispatcher = h.service.dispatcher();
    assert!(dispatcher.process_next().await.unwrap());

    let post = h.service.posting().get_post("u1", post_id).await.unwrap();
    assert_eq!(post.post.status, PostStatus::Posted);
    // One logical attempt, two publish calls, one forced refresh.
    assert_eq!(post.post.attempts, 1);
    assert_eq!(tiktok.publish_count(), 2);
    assert_eq!(tiktok.refresh_count(), 1);
}

#[tokio::test]
async fn missing_app_credential_fails_before_publish() {
    let clock = test_clock();
    let twitter = Arc::new(
        MockAdapter::new(PlatformId::Twitter, clock.clone() as Arc<dyn Clock>)
            .requiring_app_credential(),
    );
    let h = harness_with(clock.clone(), vec![twitter.clone()]).await;

    h.connect("u1", PlatformId::Twitter).await;
    let video_id = h.ready_video("u1").await;
    let post_id = h.single_post("u1", video_id, PlatformId::Twitter).await;

    let dispatcher = h.service.dispatcher();
    assert!(dispatcher.process_next().await.unwrap());

    let post = h.service.posting().get_post("u1", post_id).await.unwrap();
    assert_eq!(post.post.status, PostStatus::Failed);
    assert_eq!(post.post.error_kind, Some(ErrorKind::ConfigMissing));
    // Failed fast: the adapter was never invoked.
    assert_eq!(twitter.publish_count(), 0);
}

#[tokio::test]
async fn pkce_verifier_round_trips_through_state() {
    let clock = test_clock();
    let twitter = Arc::new(
        MockAdapter::new(PlatformId::Twitter, clock.clone() as Arc<dyn Clock>)
            .with_code_verifier(),
    );
    let h = harness_with(clock.clone(), vec![twitter.clone()]).await;

    let start = h
        .service
        .connections()
        .start_platform_oauth("u1", "twitter")
        .await
        .unwrap();
    // The verifier rides only inside the signed state, never in the clear.
    assert!(!start.state.contains("mock-verifier-1"));

    h.service
        .connections()
        .complete_platform_oauth("u1", "twitter", "auth-code", &start.state)
        .await
        .unwrap();

    let exchanges = twitter.exchanges();
    assert_eq!(exchanges.len(), 1);
    assert_eq!(exchanges[0].0, "auth-code");
    assert_eq!(exchanges[0].1.as_deref(), Some("mock-verifier-1"));

    // A state from one dance cannot stand in for another: a second dance
    // mints a distinct verifier.
    let second = h
        .service
        .connections()
        .start_platform_oauth("u1", "twitter")
        .await
        .unwrap();
    assert_ne!(second.state, start.state);
    h.service
        .connections()
        .complete_platform_oauth("u1", "twitter", "auth-code-2", &second.state)
        .await
        .unwrap();
    assert_eq!(
        twitter.exchanges()[1].1.as_deref(),
        Some("mock-verifier-2")
    );
}

#[tokio::test]
async fn terminal_posts_drop_redelivered_jobs() {
    let clock = test_clock();
    let youtube = Arc::new(MockAdapter::new(
        PlatformId::Youtube,
        clock.clone() as Arc<dyn Clock>,
    ));
    let h = harness_with(clock.clone(), vec![youtube.clone()]).await;

    h.connect("u1", PlatformId::Youtube).await;
    let video_id = h.ready_video("u1").await;
    let post_id = h.single_post("u1", video_id, PlatformId::Youtube).await;

    // Cancel before dispatch: the queued job must be dropped, not published.
    h.service.posting().cancel_post("u1", post_id).await.unwrap();

    let dispatcher = h.service.dispatcher();
    assert!(dispatcher.process_next().await.unwrap());
    assert!(!dispatcher.process_next().await.unwrap());

    let post = h.service.posting().get_post("u1", post_id).await.unwrap();
    assert_eq!(post.post.status, PostStatus::Canceled);
    assert_eq!(post.post.attempts, 0);
    assert!(post.outcomes.is_empty());
    assert_eq!(youtube.publish_count(), 0);
}
