//! Run archive in Postgres.
//!
//! The full run is kept as JSONB; the columns alongside it exist only to
//! filter and order listings.

use async_trait::async_trait;

use super::Db;
use crate::archive::{RunArchive, RunFilter};
use crate::error::{Error, Result};
use crate::model::{RunId, WorkflowRun};

#[async_trait]
impl RunArchive for Db {
    async fn archive(&self, run: &WorkflowRun) -> Result<()> {
        let body = serde_json::to_value(run)?;
        let attempts = i32::try_from(run.attempts.len()).unwrap_or(i32::MAX);

        sqlx::query(
            "INSERT INTO workflow_runs
                (id, workflow, state, idempotency_key, failure, alertable,
                 attempts, started_at, finished_at, run)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (id) DO UPDATE SET
                state = EXCLUDED.state,
                idempotency_key = EXCLUDED.idempotency_key,
                failure = EXCLUDED.failure,
                alertable = EXCLUDED.alertable,
                attempts = EXCLUDED.attempts,
                finished_at = EXCLUDED.finished_at,
                run = EXCLUDED.run",
        )
        .bind(run.id.0)
        .bind(&run.workflow)
        .bind(run.state.as_str())
        .bind(&run.key)
        .bind(run.failure_kind().map(|k| k.as_str()))
        .bind(run.is_alertable_failure())
        .bind(attempts)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(body)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: RunId) -> Result<WorkflowRun> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT run FROM workflow_runs WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        let (body,) = row.ok_or_else(|| Error::NotFound(format!("run {id}")))?;
        Ok(serde_json::from_value(body)?)
    }

    async fn list(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>> {
        let limit = i64::try_from(filter.limit).unwrap_or(i64::MAX);
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            "SELECT run FROM workflow_runs
             WHERE ($1::text IS NULL OR state = $1)
               AND ($2::text IS NULL OR workflow = $2)
               AND (NOT $3 OR alertable)
             ORDER BY started_at DESC
             LIMIT $4",
        )
        .bind(filter.state.map(|s| s.as_str()))
        .bind(filter.workflow.as_deref())
        .bind(filter.alertable_only)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(body,)| serde_json::from_value(body).map_err(Error::from))
            .collect()
    }
}
