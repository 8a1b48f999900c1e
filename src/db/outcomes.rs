//! Append-only post outcome rows.

use sqlx::Row;
use uuid::Uuid;

use super::{parse_uuid, Database};
use crate::error::{ErrorKind, Result};
use crate::types::{OutcomeKind, PostOutcome};

fn map_outcome(row: &sqlx::sqlite::SqliteRow) -> Result<PostOutcome> {
    Ok(PostOutcome {
        id: Some(row.get("id")),
        post_id: parse_uuid(row, "post_id")?,
        attempt: row.get("attempt"),
        started_at: row.get("started_at"),
        finished_at: row.get("finished_at"),
        outcome: OutcomeKind::parse(row.get::<String, _>("outcome").as_str())
            .unwrap_or(OutcomeKind::PermanentFail),
        error_kind: row
            .get::<Option<String>, _>("error_kind")
            .as_deref()
            .and_then(ErrorKind::parse),
        response_excerpt: row.get("response_excerpt"),
    })
}

impl Database {
    pub async fn append_outcome(&self, outcome: &PostOutcome) -> Result<()> {
        sqlx::query(
            "INSERT INTO post_outcomes
                (post_id, attempt, started_at, finished_at, outcome, error_kind, response_excerpt)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(outcome.post_id.to_string())
        .bind(outcome.attempt)
        .bind(outcome.started_at)
        .bind(outcome.finished_at)
        .bind(outcome.outcome.as_str())
        .bind(outcome.error_kind.map(|k| k.as_str()))
        .bind(&outcome.response_excerpt)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn outcomes_for_post(&self, post_id: Uuid) -> Result<Vec<PostOutcome>> {
        let rows = sqlx::query("SELECT * FROM post_outcomes WHERE post_id = ? ORDER BY attempt")
            .bind(post_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_outcome).collect()
    }
}
