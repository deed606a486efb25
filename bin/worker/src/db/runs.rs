//! Workflow run repository.

use super::to_i64;
use amber_relay_core::WorkflowRunId;
use amber_relay_workflow::{RunStatus, RunStore, RunStoreError, WorkflowRun};
use async_trait::async_trait;
use sqlx::{FromRow, PgPool};

#[derive(FromRow)]
struct RunRow {
    status: String,
    record: serde_json::Value,
}

impl RunRow {
    fn try_into_run(self) -> Result<WorkflowRun, RunStoreError> {
        serde_json::from_value(self.record).map_err(|e| RunStoreError::StorageFailed {
            message: format!("invalid run record (status {}): {e}", self.status),
        })
    }
}

fn storage(e: sqlx::Error) -> RunStoreError {
    RunStoreError::StorageFailed {
        message: e.to_string(),
    }
}

fn encode(run: &WorkflowRun) -> Result<serde_json::Value, RunStoreError> {
    serde_json::to_value(run).map_err(|e| RunStoreError::StorageFailed {
        message: e.to_string(),
    })
}

/// Runs in the `workflow_runs` table.
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    /// Creates a new repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn create(&self, run: &WorkflowRun) -> Result<(), RunStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_runs
                (id, workflow_id, workspace_id, status, revision, current_node_id, wake_key,
                 record, started_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(run.id.to_string())
        .bind(run.workflow_id.to_string())
        .bind(run.workspace_id.to_string())
        .bind(run.status.as_str())
        .bind(to_i64(run.revision))
        .bind(&run.current_node_id)
        .bind(&run.wake_key)
        .bind(encode(run)?)
        .bind(run.started_at)
        .bind(run.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(RunStoreError::AlreadyExists { run_id: run.id });
        }
        Ok(())
    }

    async fn get(&self, run_id: WorkflowRunId) -> Result<Option<WorkflowRun>, RunStoreError> {
        let row: Option<RunRow> = sqlx::query_as(
            r#"
            SELECT status, record
            FROM workflow_runs
            WHERE id = $1
            "#,
        )
        .bind(run_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        row.map(RunRow::try_into_run).transpose()
    }

    async fn update_if(
        &self,
        run: &WorkflowRun,
        expected: RunStatus,
    ) -> Result<WorkflowRun, RunStoreError> {
        let updated = WorkflowRun {
            revision: run.revision + 1,
            ..run.clone()
        };
        let row: Option<RunRow> = sqlx::query_as(
            r#"
            UPDATE workflow_runs
            SET status = $2, revision = $3, current_node_id = $4, wake_key = $5,
                record = $6, updated_at = $7
            WHERE id = $1 AND status = $8 AND revision = $9
            RETURNING status, record
            "#,
        )
        .bind(run.id.to_string())
        .bind(updated.status.as_str())
        .bind(to_i64(updated.revision))
        .bind(&updated.current_node_id)
        .bind(&updated.wake_key)
        .bind(encode(&updated)?)
        .bind(updated.updated_at)
        .bind(expected.as_str())
        .bind(to_i64(run.revision))
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        if let Some(row) = row {
            return row.try_into_run();
        }
        match self.get(run.id).await? {
            Some(current) => Err(RunStoreError::Conflict {
                run_id: run.id,
                expected,
                actual: current.status,
            }),
            None => Err(RunStoreError::NotFound { run_id: run.id }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amber_relay_core::{WorkflowId, WorkspaceId};
    use amber_relay_workflow::TriggerMessage;
    use chrono::Utc;

    #[test]
    fn records_round_trip_through_the_row() {
        let message = TriggerMessage::start(WorkflowId::new(), WorkspaceId::new(), "trigger_webhook");
        let mut run = WorkflowRun::start(&message, Utc::now());
        run.advance(Some("send".to_string()), Utc::now());

        let row = RunRow {
            status: run.status.as_str().to_string(),
            record: encode(&run).unwrap(),
        };
        assert_eq!(row.try_into_run().unwrap(), run);
    }

    #[test]
    fn corrupt_record_is_a_storage_error() {
        let row = RunRow {
            status: "running".to_string(),
            record: serde_json::json!({ "id": 7 }),
        };
        assert!(matches!(
            row.try_into_run(),
            Err(RunStoreError::StorageFailed { .. })
        ));
    }
}
