//! Schedule rows and the scheduler's claim transitions.

use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use super::{json_column, json_string, parse_uuid, Database};
use crate::error::Result;
use crate::types::{
    Cadence, RecurringSchedule, RecurringState, Schedule, ScheduleState, TargetSpecs,
};

fn map_schedule(row: &sqlx::sqlite::SqliteRow) -> Result<Schedule> {
    Ok(Schedule {
        id: parse_uuid(row, "id")?,
        user_id: row.get("user_id"),
        video_id: parse_uuid(row, "video_id")?,
        targets: json_column::<TargetSpecs>(row, "targets")?,
        scheduled_at: row.get("scheduled_at"),
        state: ScheduleState::parse(row.get::<String, _>("state").as_str())
            .unwrap_or(ScheduleState::Canceled),
        created_at: row.get("created_at"),
    })
}

fn map_recurring(row: &sqlx::sqlite::SqliteRow) -> Result<RecurringSchedule> {
    Ok(RecurringSchedule {
        id: parse_uuid(row, "id")?,
        user_id: row.get("user_id"),
        video_id: parse_uuid(row, "video_id")?,
        targets: json_column::<TargetSpecs>(row, "targets")?,
        cadence: json_column::<Cadence>(row, "cadence")?,
        caption_variants: json_column(row, "caption_variants")?,
        variant_cursor: row.get("variant_cursor"),
        state: RecurringState::parse(row.get::<String, _>("state").as_str())
            .unwrap_or(RecurringState::Canceled),
        next_occurrence: row.get("next_occurrence"),
        created_at: row.get("created_at"),
    })
}

impl Database {
    pub async fn insert_schedule(&self, schedule: &Schedule) -> Result<()> {
        sqlx::query(
            "INSERT INTO schedules (id, user_id, video_id, targets, scheduled_at, state, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(schedule.id.to_string())
        .bind(&schedule.user_id)
        .bind(schedule.video_id.to_string())
        .bind(json_string(&schedule.targets)?)
        .bind(schedule.scheduled_at)
        .bind(schedule.state.as_str())
        .bind(schedule.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_schedule).transpose()
    }

    pub async fn list_schedules(&self, user_id: &str) -> Result<Vec<Schedule>> {
        let rows = sqlx::query("SELECT * FROM schedules WHERE user_id = ? ORDER BY scheduled_at")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_schedule).collect()
    }

    /// Pending one-shot schedules due at or before `window_end`.
    pub async fn due_schedules(&self, window_end: i64) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(
            "SELECT * FROM schedules WHERE state = 'PENDING' AND scheduled_at <= ?
             ORDER BY scheduled_at",
        )
        .bind(window_end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_schedule).collect()
    }

    /// Claim a one-shot schedule inside the firing transaction. A row already
    /// claimed by a concurrent scheduler is skipped.
    pub async fn claim_schedule_fired(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
    ) -> Result<bool> {
        let res =
            sqlx::query("UPDATE schedules SET state = 'FIRED' WHERE id = ? AND state = 'PENDING'")
                .bind(id.to_string())
                .execute(&mut *conn)
                .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn cancel_schedule_if_pending(&self, id: Uuid) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE schedules SET state = 'CANCELED' WHERE id = ? AND state = 'PENDING'",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn insert_recurring_schedule(&self, schedule: &RecurringSchedule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO recurring_schedules
                (id, user_id, video_id, targets, cadence, caption_variants,
                 variant_cursor, state, next_occurrence, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(schedule.id.to_string())
        .bind(&schedule.user_id)
        .bind(schedule.video_id.to_string())
        .bind(json_string(&schedule.targets)?)
        .bind(json_string(&schedule.cadence)?)
        .bind(json_string(&schedule.caption_variants)?)
        .bind(schedule.variant_cursor)
        .bind(schedule.state.as_str())
        .bind(schedule.next_occurrence)
        .bind(schedule.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_recurring_schedule(&self, id: Uuid) -> Result<Option<RecurringSchedule>> {
        let row = sqlx::query("SELECT * FROM recurring_schedules WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_recurring).transpose()
    }

    pub async fn list_recurring_schedules(&self, user_id: &str) -> Result<Vec<RecurringSchedule>> {
        let rows = sqlx::query(
            "SELECT * FROM recurring_schedules WHERE user_id = ? ORDER BY next_occurrence",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_recurring).collect()
    }

    /// Active recurring schedules due at or before `window_end`.
    pub async fn due_recurring_schedules(&self, window_end: i64) -> Result<Vec<RecurringSchedule>> {
        let rows = sqlx::query(
            "SELECT * FROM recurring_schedules
             WHERE state = 'ACTIVE' AND next_occurrence <= ?
             ORDER BY next_occurrence",
        )
        .bind(window_end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(map_recurring).collect()
    }

    /// Claim a recurring firing: advance the cursor and the next occurrence
    /// in one conditional update keyed on the observed occurrence, so two
    /// scheduler processes cannot both fire the same instant.
    pub async fn claim_recurring_fired(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
        observed_occurrence: i64,
        next_occurrence: i64,
    ) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE recurring_schedules
             SET next_occurrence = ?, variant_cursor = variant_cursor + 1
             WHERE id = ? AND state = 'ACTIVE' AND next_occurrence = ?",
        )
        .bind(next_occurrence)
        .bind(id.to_string())
        .bind(observed_occurrence)
        .execute(&mut *conn)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn set_recurring_state(
        &self,
        id: Uuid,
        from: RecurringState,
        to: RecurringState,
    ) -> Result<bool> {
        let res = sqlx::query("UPDATE recurring_schedules SET state = ? WHERE id = ? AND state = ?")
            .bind(to.as_str())
            .bind(id.to_string())
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Resume with a freshly computed strictly-future occurrence.
    pub async fn resume_recurring(&self, id: Uuid, next_occurrence: i64) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE recurring_schedules SET state = 'ACTIVE', next_occurrence = ?
             WHERE id = ? AND state = 'PAUSED'",
        )
        .bind(next_occurrence)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_db;
    use super::*;
    use crate::types::{PlatformId, PlatformPostSpec};

    fn targets() -> TargetSpecs {
        let mut t = TargetSpecs::new();
        t.insert(
            PlatformId::Facebook,
            PlatformPostSpec {
                caption: "base".into(),
                tags: vec![],
            },
        );
        t
    }

    fn sample_schedule(at: i64) -> Schedule {
        Schedule {
            id: Uuid::new_v4(),
            user_id: "u1".into(),
            video_id: Uuid::new_v4(),
            targets: targets(),
            scheduled_at: at,
            state: ScheduleState::Pending,
            created_at: 0,
        }
    }

    fn sample_recurring(next: i64) -> RecurringSchedule {
        RecurringSchedule {
            id: Uuid::new_v4(),
            user_id: "u1".into(),
            video_id: Uuid::new_v4(),
            targets: targets(),
            cadence: Cadence::Daily { hour: 12, minute: 0 },
            caption_variants: vec!["v0".into(), "v1".into()],
            variant_cursor: 0,
            state: RecurringState::Active,
            next_occurrence: next,
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn due_selection_respects_window_and_state() {
        let (_dir, db) = test_db().await;
        db.insert_schedule(&sample_schedule(100)).await.unwrap();
        db.insert_schedule(&sample_schedule(500)).await.unwrap();
        let canceled = sample_schedule(50);
        db.insert_schedule(&canceled).await.unwrap();
        db.cancel_schedule_if_pending(canceled.id).await.unwrap();

        let due = db.due_schedules(200).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].scheduled_at, 100);
    }

    #[tokio::test]
    async fn claim_schedule_is_exactly_once() {
        let (_dir, db) = test_db().await;
        let schedule = sample_schedule(100);
        db.insert_schedule(&schedule).await.unwrap();

        let mut tx = db.begin().await.unwrap();
        assert!(db.claim_schedule_fired(&mut tx, schedule.id).await.unwrap());
        assert!(!db.claim_schedule_fired(&mut tx, schedule.id).await.unwrap());
        tx.commit().await.unwrap();

        let got = db.get_schedule(schedule.id).await.unwrap().unwrap();
        assert_eq!(got.state, ScheduleState::Fired);
    }

    #[tokio::test]
    async fn recurring_claim_advances_cursor_once() {
        let (_dir, db) = test_db().await;
        let schedule = sample_recurring(1_000);
        db.insert_recurring_schedule(&schedule).await.unwrap();

        let mut tx = db.begin().await.unwrap();
        assert!(db
            .claim_recurring_fired(&mut tx, schedule.id, 1_000, 87_400_000)
            .await
            .unwrap());
        // Second claim with the stale observed occurrence loses.
        assert!(!db
            .claim_recurring_fired(&mut tx, schedule.id, 1_000, 87_400_000)
            .await
            .unwrap());
        tx.commit().await.unwrap();

        let got = db.get_recurring_schedule(schedule.id).await.unwrap().unwrap();
        assert_eq!(got.variant_cursor, 1);
        assert_eq!(got.next_occurrence, 87_400_000);
    }

    #[tokio::test]
    async fn pause_resume_cycle() {
        let (_dir, db) = test_db().await;
        let schedule = sample_recurring(1_000);
        db.insert_recurring_schedule(&schedule).await.unwrap();

        assert!(db
            .set_recurring_state(schedule.id, RecurringState::Active, RecurringState::Paused)
            .await
            .unwrap());
        // Paused schedules are never due.
        assert!(db.due_recurring_schedules(10_000).await.unwrap().is_empty());

        assert!(db.resume_recurring(schedule.id, 2_000).await.unwrap());
        let due = db.due_recurring_schedules(10_000).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].next_occurrence, 2_000);
    }

    #[tokio::test]
    async fn cadence_and_variants_round_trip() {
        let (_dir, db) = test_db().await;
        let mut schedule = sample_recurring(1_000);
        schedule.cadence = Cadence::Monthly {
            day: 31,
            hour: 8,
            minute: 15,
        };
        db.insert_recurring_schedule(&schedule).await.unwrap();

        let got = db.get_recurring_schedule(schedule.id).await.unwrap().unwrap();
        assert_eq!(got.cadence, schedule.cadence);
        assert_eq!(got.caption_variants, vec!["v0".to_string(), "v1".to_string()]);
    }
}
