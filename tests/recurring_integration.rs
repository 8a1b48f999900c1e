//! Recurring schedule behavior: caption rotation across firings, retry on
//! rate limiting, cadence advancement, pause/resume.

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
use vidcast::service::scheduling::CreateRecurringSchedule;
use vidcast::service::videos::CreateVideoIntent;
use vidcast::service::{TargetInput, VidcastService};
use vidcast::storage::MemoryStore;
use vidcast::types::{Cadence, OutcomeKind, PlatformId, PostStatus, RecurringState, VideoStatus};

struct Harness {
    _dir: TempDir,
    service: VidcastService,
    clock: Arc<VirtualClock>,
    store: Arc<MemoryStore>,
    mocks: HashMap<PlatformId, Arc<MockAdapter>>,
}

async fn harness(platforms: &[PlatformId]) -> Harness {
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

    let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
    let clock = Arc::new(VirtualClock::new(start));
    let store = Arc::new(MemoryStore::new());

    let mut mocks = HashMap::new();
    let mut adapters: Vec<Arc<dyn PlatformAdapter>> = Vec::new();
    for platform in platforms {
        let mock = Arc::new(MockAdapter::new(*platform, clock.clone() as Arc<dyn Clock>));
        adapters.push(mock.clone());
        mocks.insert(*platform, mock);
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
        let video = self
            .service
            .videos()
            .complete_video_upload(user, intent.video.id)
            .await
            .unwrap();
        assert_eq!(video.status, VideoStatus::Ready);
        video.id
    }

    fn set_clock(&self, y: i32, mo: u32, d: u32, h: u32, mi: u32) {
        self.clock
            .set(Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap());
    }
}

fn target(platform: PlatformId, caption: &str) -> TargetInput {
    TargetInput {
        platform: platform.as_str().to_string(),
        caption: caption.to_string(),
        tags: vec![],
    }
}

#[tokio::test]
async fn daily_rotation_with_rate_limit_retry() {
    let h = harness(&[PlatformId::Facebook]).await;
    h.connect("u1", PlatformId::Facebook).await;
    let video_id = h.ready_video("u1").await;

    let schedule = h
        .service
        .scheduling()
        .create_recurring_schedule(CreateRecurringSchedule {
            user_id: "u1".into(),
            video_id,
            cadence: Cadence::Daily { hour: 12, minute: 0 },
            targets: vec![target(PlatformId::Facebook, "base caption")],
            caption_variants: vec!["v0".into(), "v1".into(), "v2".into()],
        })
        .await
        .unwrap();
    assert_eq!(
        schedule.next_occurrence,
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0)
            .unwrap()
            .timestamp_millis()
    );

    let scheduler = h.service.scheduler();
    let dispatcher = h.service.dispatcher();
    let facebook = &h.mocks[&PlatformId::Facebook];

    // Day 1: firing at 12:00 uses variant v0; the first attempt is rate
    // limited with a 120s hint.
    h.set_clock(2025, 6, 1, 12, 0);
    assert_eq!(scheduler.tick_once().await.unwrap(), 1);
    facebook.push_publish_err(Error::rate_limited("quota exhausted", 120_000));

    assert!(dispatcher.process_next().await.unwrap());
    let posts = h
        .service
        .posting()
        .list_posts("u1", Default::default())
        .await
        .unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(posts[0].status, PostStatus::Processing);
    assert_eq!(posts[0].attempts, 1);

    // The retry honors the 120s hint: nothing is claimable before it.
    h.clock.advance(Duration::from_secs(119));
    assert!(!dispatcher.process_next().await.unwrap());
    h.clock.advance(Duration::from_secs(2));
    assert!(dispatcher.process_next().await.unwrap());

    let post = h
        .service
        .posting()
        .get_post("u1", posts[0].id)
        .await
        .unwrap();
    assert_eq!(post.post.status, PostStatus::Posted);
    assert_eq!(post.post.attempts, 2);
    assert_eq!(post.outcomes.len(), 2);
    assert_eq!(post.outcomes[0].outcome, OutcomeKind::TransientFail);
    assert_eq!(post.outcomes[0].error_kind, Some(ErrorKind::RateLimited));
    assert_eq!(post.outcomes[1].outcome, OutcomeKind::Success);

    // Days 2-4: variants rotate v1, v2, and wrap back to v0.
    for (day, minute) in [(2, 5u32), (3, 6), (4, 7)] {
        h.set_clock(2025, 6, day, 12, minute);
        assert_eq!(scheduler.tick_once().await.unwrap(), 1, "day {day}");
        assert!(dispatcher.process_next().await.unwrap(), "day {day}");
    }

    let captions: Vec<String> = facebook.published().iter().map(|r| r.caption.clone()).collect();
    // Two attempts on day 1 (both v0), then one per day.
    assert_eq!(captions, vec!["v0", "v0", "v1", "v2", "v0"]);

    let stored = h
        .service
        .scheduling()
        .list_recurring_schedules("u1")
        .await
        .unwrap();
    assert_eq!(stored[0].variant_cursor, 4);
    assert_eq!(
        stored[0].next_occurrence,
        Utc.with_ymd_and_hms(2025, 6, 5, 12, 0, 0)
            .unwrap()
            .timestamp_millis()
    );
    assert_eq!(stored[0].state, RecurringState::Active);

    // Every firing produced a posted row.
    let posts = h
        .service
        .posting()
        .list_posts("u1", Default::default())
        .await
        .unwrap();
    assert_eq!(posts.len(), 4);
    assert!(posts.iter().all(|p| p.status == PostStatus::Posted));
}

#[tokio::test]
async fn empty_variant_list_uses_base_captions() {
    let h = harness(&[PlatformId::Facebook]).await;
    h.connect("u1", PlatformId::Facebook).await;
    let video_id = h.ready_video("u1").await;

    h.service
        .scheduling()
        .create_recurring_schedule(CreateRecurringSchedule {
            user_id: "u1".into(),
            video_id,
            cadence: Cadence::Daily { hour: 12, minute: 0 },
            targets: vec![target(PlatformId::Facebook, "the base caption")],
            caption_variants: vec![],
        })
        .await
        .unwrap();

    h.set_clock(2025, 6, 1, 12, 0);
    assert_eq!(h.service.scheduler().tick_once().await.unwrap(), 1);
    assert!(h.service.dispatcher().process_next().await.unwrap());

    let published = h.mocks[&PlatformId::Facebook].published();
    assert_eq!(published[0].caption, "the base caption");
}

#[tokio::test]
async fn missed_occurrences_collapse_into_one_firing() {
    let h = harness(&[PlatformId::Facebook]).await;
    h.connect("u1", PlatformId::Facebook).await;
    let video_id = h.ready_video("u1").await;

    h.service
        .scheduling()
        .create_recurring_schedule(CreateRecurringSchedule {
            user_id: "u1".into(),
            video_id,
            cadence: Cadence::Daily { hour: 12, minute: 0 },
            targets: vec![target(PlatformId::Facebook, "caption")],
            caption_variants: vec![],
        })
        .await
        .unwrap();

    // Three days of downtime: one firing, next occurrence strictly future.
    h.set_clock(2025, 6, 4, 13, 0);
    assert_eq!(h.service.scheduler().tick_once().await.unwrap(), 1);
    assert_eq!(h.service.scheduler().tick_once().await.unwrap(), 0);

    let stored = h
        .service
        .scheduling()
        .list_recurring_schedules("u1")
        .await
        .unwrap();
    assert_eq!(
        stored[0].next_occurrence,
        Utc.with_ymd_and_hms(2025, 6, 5, 12, 0, 0)
            .unwrap()
            .timestamp_millis()
    );

    let posts = h
        .service
        .posting()
        .list_posts("u1", Default::default())
        .await
        .unwrap();
    assert_eq!(posts.len(), 1);
}

#[tokio::test]
async fn pause_suppresses_firing_and_resume_recomputes() {
    let h = harness(&[PlatformId::Facebook]).await;
    h.connect("u1", PlatformId::Facebook).await;
    let video_id = h.ready_video("u1").await;

    let schedule = h
        .service
        .scheduling()
        .create_recurring_schedule(CreateRecurringSchedule {
            user_id: "u1".into(),
            video_id,
            cadence: Cadence::Daily { hour: 12, minute: 0 },
            targets: vec![target(PlatformId::Facebook, "caption")],
            caption_variants: vec![],
        })
        .await
        .unwrap();

    h.service
        .scheduling()
        .pause_recurring("u1", schedule.id)
        .await
        .unwrap();

    // Past the occurrence while paused: nothing fires.
    h.set_clock(2025, 6, 2, 9, 0);
    assert_eq!(h.service.scheduler().tick_once().await.unwrap(), 0);

    let resumed = h
        .service
        .scheduling()
        .resume_recurring("u1", schedule.id)
        .await
        .unwrap();
    assert_eq!(resumed.state, RecurringState::Active);
    // Strictly in the future from the resume instant.
    assert_eq!(
        resumed.next_occurrence,
        Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0)
            .unwrap()
            .timestamp_millis()
    );
    assert_eq!(h.service.scheduler().tick_once().await.unwrap(), 0);

    // Double-pause and double-resume are validation errors.
    h.service
        .scheduling()
        .pause_recurring("u1", schedule.id)
        .await
        .unwrap();
    let err = h
        .service
        .scheduling()
        .pause_recurring("u1", schedule.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);
}

#[tokio::test]
async fn monthly_cadence_clamps_to_february() {
    let h = harness(&[PlatformId::Facebook]).await;
    h.connect("u1", PlatformId::Facebook).await;
    let video_id = h.ready_video("u1").await;

    // Created on Jan 31 2026 just after the day-31 firing time.
    h.set_clock(2026, 1, 31, 11, 0);
    let schedule = h
        .service
        .scheduling()
        .create_recurring_schedule(CreateRecurringSchedule {
            user_id: "u1".into(),
            video_id,
            cadence: Cadence::Monthly {
                day: 31,
                hour: 10,
                minute: 0,
            },
            targets: vec![target(PlatformId::Facebook, "caption")],
            caption_variants: vec![],
        })
        .await
        .unwrap();
    // 2026 is not a leap year: February clamps to the 28th.
    assert_eq!(
        schedule.next_occurrence,
        Utc.with_ymd_and_hms(2026, 2, 28, 10, 0, 0)
            .unwrap()
            .timestamp_millis()
    );

    h.set_clock(2026, 2, 28, 10, 0);
    assert_eq!(h.service.scheduler().tick_once().await.unwrap(), 1);

    let stored = h
        .service
        .scheduling()
        .list_recurring_schedules("u1")
        .await
        .unwrap();
    assert_eq!(
        stored[0].next_occurrence,
        Utc.with_ymd_and_hms(2026, 3, 31, 10, 0, 0)
            .unwrap()
            .timestamp_millis()
    );
}
