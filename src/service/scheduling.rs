//! Schedule operations: one-shot and recurring creation, pause/resume,
//! cancellation, listing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use super::events::EventBus;
use super::{normalize_targets, TargetInput};
use crate::clock::Clock;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::platforms::validate_caption;
use crate::scheduler::Scheduler;
use crate::types::{
    Cadence, RecurringSchedule, RecurringState, Schedule, ScheduleState, TargetSpecs, Video,
    VideoStatus,
};

/// Minimum lead time for one-shot schedules; exactly this far out is
/// accepted.
pub const MIN_LEAD_MS: i64 = 5 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct CreateSchedule {
    pub user_id: String,
    pub video_id: Uuid,
    pub scheduled_at: DateTime<Utc>,
    pub targets: Vec<TargetInput>,
}

#[derive(Debug, Clone)]
pub struct CreateRecurringSchedule {
    pub user_id: String,
    pub video_id: Uuid,
    pub cadence: Cadence,
    pub targets: Vec<TargetInput>,
    /// Ordered caption variants; empty reuses the base captions.
    pub caption_variants: Vec<String>,
}

pub struct ScheduleService {
    db: Database,
    clock: Arc<dyn Clock>,
    #[allow(dead_code)]
    events: EventBus,
}

impl ScheduleService {
    pub fn new(db: Database, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        Self { db, clock, events }
    }

    /// Create a one-shot schedule at least five minutes out.
    pub async fn create_schedule(&self, request: CreateSchedule) -> Result<Schedule> {
        let now = self.clock.now_ms();
        let scheduled_at = request.scheduled_at.timestamp_millis();
        if scheduled_at < now + MIN_LEAD_MS {
            return Err(Error::validation(
                "scheduled time must be at least 5 minutes in the future",
            ));
        }

        let targets = normalize_targets(&request.targets)?;
        self.ready_video(&request.user_id, request.video_id).await?;
        self.ensure_connected(&request.user_id, &targets).await?;

        let schedule = Schedule {
            id: self.clock.new_id(),
            user_id: request.user_id,
            video_id: request.video_id,
            targets,
            scheduled_at,
            state: ScheduleState::Pending,
            created_at: now,
        };
        self.db.insert_schedule(&schedule).await?;
        info!(schedule_id = %schedule.id, scheduled_at, "schedule created");
        Ok(schedule)
    }

    /// Create a recurring schedule; the first occurrence is the cadence's
    /// next strictly-future instant.
    pub async fn create_recurring_schedule(
        &self,
        request: CreateRecurringSchedule,
    ) -> Result<RecurringSchedule> {
        request.cadence.validate()?;
        let targets = normalize_targets(&request.targets)?;

        // Every variant must fit every target platform, since the variant
        // replaces the base caption on all of them.
        for variant in &request.caption_variants {
            for platform in targets.keys() {
                validate_caption(*platform, variant)?;
            }
        }

        self.ready_video(&request.user_id, request.video_id).await?;
        self.ensure_connected(&request.user_id, &targets).await?;

        let now = self.clock.now_utc();
        let next_occurrence = Scheduler::next_occurrence(request.cadence, now);
        let schedule = RecurringSchedule {
            id: self.clock.new_id(),
            user_id: request.user_id,
            video_id: request.video_id,
            targets,
            cadence: request.cadence,
            caption_variants: request.caption_variants,
            variant_cursor: 0,
            state: RecurringState::Active,
            next_occurrence: next_occurrence.timestamp_millis(),
            created_at: now.timestamp_millis(),
        };
        self.db.insert_recurring_schedule(&schedule).await?;
        info!(
            schedule_id = %schedule.id,
            next_occurrence = schedule.next_occurrence,
            "recurring schedule created"
        );
        Ok(schedule)
    }

    pub async fn cancel_schedule(&self, user_id: &str, schedule_id: Uuid) -> Result<()> {
        self.owned_schedule(user_id, schedule_id).await?;
        if !self.db.cancel_schedule_if_pending(schedule_id).await? {
            return Err(Error::validation("only pending schedules can be canceled"));
        }
        info!(schedule_id = %schedule_id, "schedule canceled");
        Ok(())
    }

    pub async fn pause_recurring(&self, user_id: &str, schedule_id: Uuid) -> Result<()> {
        self.owned_recurring(user_id, schedule_id).await?;
        if !self
            .db
            .set_recurring_state(schedule_id, RecurringState::Active, RecurringState::Paused)
            .await?
        {
            return Err(Error::validation("only active schedules can be paused"));
        }
        info!(schedule_id = %schedule_id, "recurring schedule paused");
        Ok(())
    }

    /// Resume a paused schedule. The next occurrence is recomputed so it is
    /// strictly in the future; occurrences missed while paused do not fire.
    pub async fn resume_recurring(&self, user_id: &str, schedule_id: Uuid) -> Result<RecurringSchedule> {
        let schedule = self.owned_recurring(user_id, schedule_id).await?;
        let next = Scheduler::next_occurrence(schedule.cadence, self.clock.now_utc());
        if !self
            .db
            .resume_recurring(schedule_id, next.timestamp_millis())
            .await?
        {
            return Err(Error::validation("only paused schedules can be resumed"));
        }
        info!(schedule_id = %schedule_id, next_occurrence = next.timestamp_millis(),
              "recurring schedule resumed");
        self.owned_recurring(user_id, schedule_id).await
    }

    pub async fn cancel_recurring(&self, user_id: &str, schedule_id: Uuid) -> Result<()> {
        self.owned_recurring(user_id, schedule_id).await?;
        let canceled = self
            .db
            .set_recurring_state(schedule_id, RecurringState::Active, RecurringState::Canceled)
            .await?
            || self
                .db
                .set_recurring_state(schedule_id, RecurringState::Paused, RecurringState::Canceled)
                .await?;
        if !canceled {
            return Err(Error::validation("schedule is already canceled"));
        }
        info!(schedule_id = %schedule_id, "recurring schedule canceled");
        Ok(())
    }

    pub async fn list_schedules(&self, user_id: &str) -> Result<Vec<Schedule>> {
        self.db.list_schedules(user_id).await
    }

    pub async fn list_recurring_schedules(&self, user_id: &str) -> Result<Vec<RecurringSchedule>> {
        self.db.list_recurring_schedules(user_id).await
    }

    async fn owned_schedule(&self, user_id: &str, schedule_id: Uuid) -> Result<Schedule> {
        match self.db.get_schedule(schedule_id).await? {
            Some(schedule) if schedule.user_id == user_id => Ok(schedule),
            _ => Err(Error::validation("schedule not found")),
        }
    }

    async fn owned_recurring(&self, user_id: &str, schedule_id: Uuid) -> Result<RecurringSchedule> {
        match self.db.get_recurring_schedule(schedule_id).await? {
            Some(schedule) if schedule.user_id == user_id => Ok(schedule),
            _ => Err(Error::validation("schedule not found")),
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
