//! Scheduler beat.
//!
//! A periodic loop that fires due one-shot and recurring schedules. Each
//! candidate is claimed with a conditional update inside its own firing
//! transaction, so any number of processes can run the loop concurrently:
//! a row claimed elsewhere is simply skipped. Materialized posts and their
//! broker jobs commit atomically with the schedule transition.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use tracing::{error, info};
use uuid::Uuid;

use crate::broker::{EnqueueOptions, JobBroker, PostJob, POST_QUEUE};
use crate::clock::{ms_to_datetime, Clock};
use crate::db::Database;
use crate::error::Result;
use crate::governor::RepostGovernor;
use crate::service::events::{Event, EventBus};
use crate::types::{
    Cadence, MultiPost, Post, PostStatus, RecurringSchedule, Schedule, TargetSpecs,
};

pub const DEFAULT_TICK: Duration = Duration::from_secs(30);

pub struct Scheduler {
    db: Database,
    broker: Arc<dyn JobBroker>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    tick: Duration,
}

impl Scheduler {
    pub fn new(
        db: Database,
        broker: Arc<dyn JobBroker>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        tick: Duration,
    ) -> Self {
        Self {
            db,
            broker,
            clock,
            events,
            tick,
        }
    }

    /// Run the beat until the process exits.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.tick);
        loop {
            interval.tick().await;
            match self.tick_once().await {
                Ok(fired) => {
                    if fired > 0 {
                        info!(fired, "fired due schedules");
                    }
                }
                Err(e) => {
                    error!(error = %e, "scheduler tick failed");
                }
            }
        }
    }

    /// One pass over due schedules; returns the number of firings.
    pub async fn tick_once(&self) -> Result<u64> {
        // Half-tick lookahead keeps firings within one tick of the target.
        let window_end = self.clock.now_ms() + (self.tick.as_millis() as i64) / 2;
        let mut fired = 0u64;

        for schedule in self.db.due_schedules(window_end).await? {
            match self.fire_one_shot(&schedule).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => {
                    // The transaction rolled back; the next tick retries.
                    error!(schedule_id = %schedule.id, error = %e, "one-shot firing failed");
                }
            }
        }

        for schedule in self.db.due_recurring_schedules(window_end).await? {
            match self.fire_recurring(&schedule).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(schedule_id = %schedule.id, error = %e, "recurring firing failed");
                }
            }
        }

        Ok(fired)
    }

    async fn fire_one_shot(&self, schedule: &Schedule) -> Result<bool> {
        let mut tx = self.db.begin().await?;
        if !self.db.claim_schedule_fired(&mut tx, schedule.id).await? {
            return Ok(false);
        }
        let post_ids = self
            .materialize(&mut tx, &schedule.user_id, schedule.video_id, &schedule.targets, None)
            .await?;
        tx.commit().await?;

        self.events.emit(Event::ScheduleFired {
            schedule_id: schedule.id,
            post_ids: post_ids.clone(),
        });
        info!(schedule_id = %schedule.id, posts = post_ids.len(), "one-shot schedule fired");
        Ok(true)
    }

    async fn fire_recurring(&self, schedule: &RecurringSchedule) -> Result<bool> {
        // Next occurrence is computed from the missed anchor, strictly in
        // the future; occurrences missed during downtime collapse into this
        // single firing.
        let anchor = ms_to_datetime(schedule.next_occurrence.max(self.clock.now_ms()));
        let next = Self::next_occurrence(schedule.cadence, anchor);

        let mut tx = self.db.begin().await?;
        if !self
            .db
            .claim_recurring_fired(
                &mut tx,
                schedule.id,
                schedule.next_occurrence,
                next.timestamp_millis(),
            )
            .await?
        {
            return Ok(false);
        }

        let variant =
            RepostGovernor::select_variant(&schedule.caption_variants, schedule.variant_cursor)
                .map(str::to_string);
        let post_ids = self
            .materialize(
                &mut tx,
                &schedule.user_id,
                schedule.video_id,
                &schedule.targets,
                variant.as_deref(),
            )
            .await?;
        tx.commit().await?;

        self.events.emit(Event::ScheduleFired {
            schedule_id: schedule.id,
            post_ids: post_ids.clone(),
        });
        info!(
            schedule_id = %schedule.id,
            posts = post_ids.len(),
            next_occurrence = next.timestamp_millis(),
            "recurring schedule fired"
        );
        Ok(true)
    }

    /// Materialize one multi-post with a post per target platform and one
    /// broker job per post (dedup key = post id). Runs inside the caller's
    /// firing transaction.
    async fn materialize(
        &self,
        tx: &mut sqlx::SqliteConnection,
        user_id: &str,
        video_id: Uuid,
        targets: &TargetSpecs,
        caption_variant: Option<&str>,
    ) -> Result<Vec<Uuid>> {
        let now = self.clock.now_ms();
        let multi_post = MultiPost {
            id: self.clock.new_id(),
            user_id: user_id.to_string(),
            video_id,
            created_at: now,
        };
        self.db.insert_multi_post_tx(tx, &multi_post).await?;

        let mut post_ids = Vec::with_capacity(targets.len());
        for (platform, spec) in targets {
            let caption = caption_variant.unwrap_or(&spec.caption).to_string();
            let post = Post {
                id: self.clock.new_id(),
                multi_post_id: multi_post.id,
                user_id: user_id.to_string(),
                video_id,
                platform: *platform,
                caption,
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
            self.db.insert_post_tx(tx, &post).await?;

            let payload = serde_json::to_string(&PostJob { post_id: post.id })?;
            self.broker
                .enqueue(
                    tx,
                    POST_QUEUE,
                    &payload,
                    EnqueueOptions {
                        delay: Duration::ZERO,
                        dedup_key: Some(post.id.to_string()),
                    },
                )
                .await?;
            post_ids.push(post.id);
        }
        Ok(post_ids)
    }

    /// First cadence occurrence strictly after `after`. Monthly cadences
    /// clamp to the last day of short months (day 31 in February fires on
    /// Feb 28, or Feb 29 in leap years).
    pub fn next_occurrence(cadence: Cadence, after: DateTime<Utc>) -> DateTime<Utc> {
        match cadence {
            Cadence::Daily { hour, minute } => {
                let mut candidate = at_time(after.date_naive(), hour, minute);
                while candidate <= after {
                    candidate += chrono::Duration::days(1);
                }
                candidate
            }
            Cadence::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let mut candidate = at_time(after.date_naive(), hour, minute);
                while candidate <= after
                    || candidate.weekday().num_days_from_monday() != u32::from(weekday)
                {
                    candidate += chrono::Duration::days(1);
                }
                candidate
            }
            Cadence::Monthly { day, hour, minute } => {
                let mut year = after.year();
                let mut month = after.month();
                let mut candidate = monthly_candidate(year, month, day, hour, minute);
                while candidate <= after {
                    month += 1;
                    if month > 12 {
                        month = 1;
                        year += 1;
                    }
                    candidate = monthly_candidate(year, month, day, hour, minute);
                }
                candidate
            }
        }
    }
}

fn at_time(date: NaiveDate, hour: u32, minute: u32) -> DateTime<Utc> {
    date.and_hms_opt(hour, minute, 0)
        .expect("validated cadence time")
        .and_utc()
}

fn monthly_candidate(year: i32, month: u32, day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    let clamped = day.min(last_day_of_month(year, month));
    let date = NaiveDate::from_ymd_opt(year, month, clamped).expect("clamped day is valid");
    at_time(date, hour, minute)
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}
