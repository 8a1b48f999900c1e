//! Dispatcher worker pool.
//!
//! Stateless workers claim post jobs from the broker and drive the platform
//! adapters. The post row's state machine is the idempotency anchor: a job
//! whose post is already terminal is acked and dropped, the governor check
//! shares the claim transaction, and retry decisions derive from the error
//! kind with full-jitter exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::Rng;
use tracing::{error, info, warn};

use crate::broker::{ClaimedJob, JobBroker, PostJob, POST_QUEUE};
use crate::clock::Clock;
use crate::db::Database;
use crate::error::{Error, ErrorKind, Result};
use crate::governor::{RepostDecision, RepostGovernor};
use crate::platforms::{
    validate_caption, validate_media, AdapterRegistry, PublishContext, PublishSpec, PublishedPost,
    VideoSource,
};
use crate::service::events::{Event, EventBus};
use crate::storage::ObjectStore;
use crate::tokens::TokenManager;
use crate::types::{OutcomeKind, Post, PostOutcome, VideoStatus};

const BACKOFF_BASE_MS: u64 = 30_000;
const BACKOFF_CAP_MS: u64 = 15 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub concurrency: usize,
    pub publish_deadline: Duration,
    pub max_attempts: i64,
    /// Sleep between claims when the queue is empty.
    pub idle_poll: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            publish_deadline: Duration::from_millis(1_800_000),
            max_attempts: 5,
            idle_poll: Duration::from_millis(500),
        }
    }
}

pub struct Dispatcher {
    db: Database,
    broker: Arc<dyn JobBroker>,
    registry: Arc<AdapterRegistry>,
    tokens: Arc<TokenManager>,
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    config: DispatcherConfig,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        broker: Arc<dyn JobBroker>,
        registry: Arc<AdapterRegistry>,
        tokens: Arc<TokenManager>,
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            db,
            broker,
            registry,
            tokens,
            store,
            clock,
            events,
            config,
        }
    }

    fn visibility(&self) -> Duration {
        // Keep the job invisible for the whole attempt plus slack.
        self.config.publish_deadline + Duration::from_secs(60)
    }

    /// Run `concurrency` workers until the process exits.
    pub async fn run(self: Arc<Self>) {
        let mut handles = Vec::with_capacity(self.config.concurrency);
        for worker in 0..self.config.concurrency {
            let dispatcher = self.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.worker_loop(worker).await;
            }));
        }
        join_all(handles).await;
    }

    async fn worker_loop(&self, worker: usize) {
        info!(worker, "dispatcher worker started");
        loop {
            match self.process_next().await {
                Ok(true) => {}
                Ok(false) => self.clock.sleep(self.config.idle_poll).await,
                Err(e) => {
                    error!(worker, error = %e, "job processing failed");
                    self.clock.sleep(self.config.idle_poll).await;
                }
            }
        }
    }

    /// Claim and process one job. Returns false when the queue is empty.
    pub async fn process_next(&self) -> Result<bool> {
        match self.broker.claim(POST_QUEUE, self.visibility()).await? {
            Some(job) => {
                self.process(job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Process one claimed job end to end.
    pub async fn process(&self, job: ClaimedJob) -> Result<()> {
        let Ok(payload) = serde_json::from_str::<PostJob>(&job.payload) else {
            warn!(job_id = %job.handle.id, "dropping malformed job payload");
            self.broker.ack(&job.handle).await?;
            return Ok(());
        };
        let post_id = payload.post_id;
        let now = self.clock.now_ms();

        // Claim the post and evaluate the cooldown in one transaction so a
        // concurrent success for the same (user, platform, video) cannot
        // slip between check and transition.
        let mut tx = self.db.begin().await?;
        let Some(post) = self.db.claim_post_for_attempt(&mut tx, post_id, now).await? else {
            tx.commit().await?;
            self.broker.ack(&job.handle).await?;
            return Ok(());
        };
        let decision = RepostGovernor::check(
            &self.db,
            &mut tx,
            &post.user_id,
            post.platform,
            post.video_id,
            now,
        )
        .await?;
        if let RepostDecision::Denied { hours_remaining } = decision {
            let denial = Error::cooldown(hours_remaining);
            self.db
                .mark_post_failed_tx(&mut tx, post_id, denial.kind, &denial.message, now)
                .await?;
            tx.commit().await?;

            self.append_outcome(&post, now, now, OutcomeKind::PermanentFail, Some(&denial))
                .await?;
            self.broker.ack(&job.handle).await?;
            self.events.emit(Event::PostFailed {
                post_id,
                platform: post.platform,
                error_kind: denial.kind,
            });
            return Ok(());
        }
        tx.commit().await?;

        let started = self.clock.now_ms();
        let result = self.attempt(&post).await;
        let finished = self.clock.now_ms();

        match result {
            Ok(published) => {
                self.db
                    .mark_post_posted(
                        post_id,
                        &published.platform_post_id,
                        published.platform_url.as_deref(),
                        finished,
                    )
                    .await?;
                self.append_outcome(&post, started, finished, OutcomeKind::Success, None)
                    .await?;
                self.broker.ack(&job.handle).await?;
                info!(post_id = %post_id, platform = %post.platform,
                      platform_post_id = %published.platform_post_id, "post published");
                self.events.emit(Event::PostPublished {
                    post_id,
                    platform: post.platform,
                    platform_post_id: published.platform_post_id,
                    platform_url: published.platform_url,
                });
            }
            Err(e) if e.is_transient() && post.attempts < self.config.max_attempts => {
                self.db
                    .record_post_error(post_id, e.kind, &e.message, finished)
                    .await?;
                self.append_outcome(&post, started, finished, OutcomeKind::TransientFail, Some(&e))
                    .await?;
                let delay = retry_delay(post.attempts, e.retry_after_ms);
                warn!(post_id = %post_id, platform = %post.platform, attempt = post.attempts,
                      error = %e, delay_ms = delay.as_millis() as u64, "transient failure, retrying");
                self.broker.nack(&job.handle, delay).await?;
                self.events.emit(Event::PostRetrying {
                    post_id,
                    platform: post.platform,
                    attempt: post.attempts,
                    delay_ms: delay.as_millis() as u64,
                });
            }
            Err(e) => {
                let outcome = if e.is_transient() {
                    OutcomeKind::TransientFail
                } else {
                    OutcomeKind::PermanentFail
                };
                self.db
                    .mark_post_failed(post_id, e.kind, &e.message, finished)
                    .await?;
                self.append_outcome(&post, started, finished, outcome, Some(&e))
                    .await?;
                self.broker.ack(&job.handle).await?;
                warn!(post_id = %post_id, platform = %post.platform, attempt = post.attempts,
                      error = %e, "post failed terminally");
                self.events.emit(Event::PostFailed {
                    post_id,
                    platform: post.platform,
                    error_kind: e.kind,
                });
            }
        }
        Ok(())
    }

    /// One publish attempt: resolve the connection, pre-flight, acquire a
    /// token, and invoke the adapter under the attempt deadline.
    async fn attempt(&self, post: &Post) -> Result<PublishedPost> {
        let connection = self
            .db
            .active_connection(&post.user_id, post.platform)
            .await?
            .ok_or_else(|| Error::new(ErrorKind::AuthRevoked, "platform not connected"))?;
        let adapter = self.registry.get(post.platform)?;

        let video = self
            .db
            .get_video(post.video_id)
            .await?
            .ok_or_else(|| Error::validation("source video no longer exists"))?;
        if video.status != VideoStatus::Ready {
            return Err(Error::validation("source video is not ready"));
        }

        validate_caption(post.platform, &post.caption)?;
        validate_media(adapter.as_ref(), &video)?;

        // Dual-credential platforms fail fast before any network call.
        let app_credential = if adapter.requires_app_credential() {
            Some(self.tokens.app_credential()?.clone())
        } else {
            None
        };

        let access_token = self
            .tokens
            .access_token(adapter.as_ref(), connection.id)
            .await?;

        let spec = PublishSpec::new(post.caption.clone(), post.tags.clone());
        let source = VideoSource {
            key: &video.storage_key,
            size_bytes: video.size_bytes,
            container: &video.container,
            store: self.store.as_ref(),
        };
        let ctx = PublishContext {
            clock: self.clock.as_ref(),
            account_id: &connection.account_id,
            app_credential: app_credential.as_ref(),
        };

        let result = self
            .publish_with_deadline(adapter.as_ref(), &source, &spec, &access_token, &ctx)
            .await;

        // An expired-token report gets exactly one in-attempt retry after a
        // forced refresh.
        let result = match result {
            Err(e) if e.kind == ErrorKind::AuthExpired => {
                let access_token = self
                    .tokens
                    .force_refresh(adapter.as_ref(), connection.id)
                    .await?;
                self.publish_with_deadline(adapter.as_ref(), &source, &spec, &access_token, &ctx)
                    .await
            }
            other => other,
        };

        // A revocation report retires the connection; later requests fail
        // fast at validation instead of reaching the adapter.
        if let Err(e) = &result {
            if e.kind == ErrorKind::AuthRevoked {
                self.db
                    .deactivate_connection(connection.id, self.clock.now_ms())
                    .await?;
                warn!(connection_id = %connection.id, platform = %post.platform,
                      "connection deactivated after revocation");
            }
        }
        result
    }

    async fn publish_with_deadline(
        &self,
        adapter: &dyn crate::platforms::PlatformAdapter,
        source: &VideoSource<'_>,
        spec: &PublishSpec,
        access_token: &str,
        ctx: &PublishContext<'_>,
    ) -> Result<PublishedPost> {
        match tokio::time::timeout(
            self.config.publish_deadline,
            adapter.publish(source, spec, access_token, ctx),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::new(
                ErrorKind::Timeout,
                "publish attempt exceeded the deadline",
            )),
        }
    }

    async fn append_outcome(
        &self,
        post: &Post,
        started_at: i64,
        finished_at: i64,
        outcome: OutcomeKind,
        error: Option<&Error>,
    ) -> Result<()> {
        self.db
            .append_outcome(&PostOutcome {
                id: None,
                post_id: post.id,
                attempt: post.attempts,
                started_at,
                finished_at,
                outcome,
                error_kind: error.map(|e| e.kind),
                response_excerpt: error.map(|e| e.message.clone()),
            })
            .await
    }
}

/// Full-jitter exponential backoff, floored by any platform retry hint.
pub fn retry_delay(attempt: i64, retry_after_ms: Option<u64>) -> Duration {
    let exponent = attempt.clamp(1, 16) as u32 - 1;
    let computed = BACKOFF_BASE_MS
        .saturating_mul(1u64 << exponent)
        .min(BACKOFF_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0.5..=1.5);
    let jittered = (computed as f64 * jitter) as u64;
    Duration::from_millis(jittered.max(retry_after_ms.unwrap_or(0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        for _ in 0..50 {
            let first = retry_delay(1, None).as_millis() as u64;
            assert!((15_000..=45_000).contains(&first), "got {first}");

            let second = retry_delay(2, None).as_millis() as u64;
            assert!((30_000..=90_000).contains(&second), "got {second}");

            // Attempt 6 would be 960s uncapped; the cap is 900s.
            let capped = retry_delay(6, None).as_millis() as u64;
            assert!((450_000..=1_350_000).contains(&capped), "got {capped}");
        }
    }

    #[test]
    fn retry_hint_is_a_floor() {
        for _ in 0..50 {
            let delay = retry_delay(1, Some(120_000)).as_millis() as u64;
            assert!(delay >= 120_000, "got {delay}");
        }
    }

    #[test]
    fn default_config_matches_contract() {
        let config = DispatcherConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.publish_deadline, Duration::from_millis(1_800_000));
    }
}
