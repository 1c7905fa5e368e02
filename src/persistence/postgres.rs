//! Postgres execution store.
//!
//! Each operation runs in one database transaction. The execution row is
//! locked with `SELECT … FOR UPDATE`, the caller's condition is checked
//! against the stored `next_event_id`, and a mismatch aborts with
//! [`StoreError::ConditionFailed`] before anything is written. Pending
//! record maps travel as JSONB documents; history batches as opaque BYTEA.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::history::HistoryEvent;
use crate::persistence::{
    ActivityInfo, AppendHistoryEventsRequest, BufferedReplicationTask, ChildExecutionInfo,
    CreateWorkflowExecutionRequest, CurrentExecution, DomainId, ExecutionStore,
    GetWorkflowExecutionRequest, GetWorkflowExecutionResponse, ReplicationState, ReplicationTask,
    RequestCancelInfo, ResetWorkflowExecutionRequest, RunId, SignalInfo, StoreError, StoreResult,
    TimerInfo, TimerTask, TransferTask, UpdateWorkflowExecutionRequest, WorkflowExecutionInfo,
    WorkflowSnapshot, WorkflowState,
};

/// Production execution store backed by PostgreSQL.
#[derive(Clone)]
pub struct PostgresExecutionStore {
    pool: PgPool,
}

impl PostgresExecutionStore {
    /// Connect and run migrations.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        Self::connect_with_pool_size(database_url, 10).await
    }

    pub async fn connect_with_pool_size(
        database_url: &str,
        max_connections: u32,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| StoreError::Internal(format!("migration failed: {err}")))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn snapshot_from_row(row: &PgRow) -> StoreResult<WorkflowSnapshot> {
    let execution_info: WorkflowExecutionInfo =
        serde_json::from_value(row.try_get::<Value, _>("execution")?)?;
    let replication_state: Option<ReplicationState> = row
        .try_get::<Option<Value>, _>("replication_state")?
        .map(serde_json::from_value)
        .transpose()?;
    let activity_infos: HashMap<i64, ActivityInfo> =
        serde_json::from_value(row.try_get::<Value, _>("activity_infos")?)?;
    let timer_infos: HashMap<String, TimerInfo> =
        serde_json::from_value(row.try_get::<Value, _>("timer_infos")?)?;
    let child_execution_infos: HashMap<i64, ChildExecutionInfo> =
        serde_json::from_value(row.try_get::<Value, _>("child_execution_infos")?)?;
    let request_cancel_infos: HashMap<i64, RequestCancelInfo> =
        serde_json::from_value(row.try_get::<Value, _>("request_cancel_infos")?)?;
    let signal_infos: HashMap<i64, SignalInfo> =
        serde_json::from_value(row.try_get::<Value, _>("signal_infos")?)?;
    let signal_requested_ids: HashSet<String> =
        serde_json::from_value(row.try_get::<Value, _>("signal_requested_ids")?)?;
    let buffered_events: Vec<HistoryEvent> =
        serde_json::from_value(row.try_get::<Value, _>("buffered_events")?)?;
    let buffered_replication_tasks: HashMap<i64, BufferedReplicationTask> =
        serde_json::from_value(row.try_get::<Value, _>("buffered_replication_tasks")?)?;

    Ok(WorkflowSnapshot {
        execution_info,
        replication_state,
        activity_infos,
        timer_infos,
        child_execution_infos,
        request_cancel_infos,
        signal_infos,
        signal_requested_ids,
        buffered_events,
        buffered_replication_tasks,
    })
}

const SNAPSHOT_COLUMNS: &str = "execution, replication_state, next_event_id, state, \
     activity_infos, timer_infos, child_execution_infos, request_cancel_infos, \
     signal_infos, signal_requested_ids, buffered_events, buffered_replication_tasks";

async fn write_snapshot(
    tx: &mut Transaction<'_, Postgres>,
    snapshot: &WorkflowSnapshot,
) -> StoreResult<()> {
    let info = &snapshot.execution_info;
    sqlx::query(
        r#"
        UPDATE workflow_executions SET
            execution = $4,
            replication_state = $5,
            next_event_id = $6,
            state = $7,
            activity_infos = $8,
            timer_infos = $9,
            child_execution_infos = $10,
            request_cancel_infos = $11,
            signal_infos = $12,
            signal_requested_ids = $13,
            buffered_events = $14,
            buffered_replication_tasks = $15,
            last_updated_at = NOW()
        WHERE domain_id = $1 AND workflow_id = $2 AND run_id = $3
        "#,
    )
    .bind(info.domain_id.0)
    .bind(&info.workflow_id)
    .bind(info.run_id.0)
    .bind(serde_json::to_value(info)?)
    .bind(
        snapshot
            .replication_state
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?,
    )
    .bind(info.next_event_id)
    .bind(info.state.as_str())
    .bind(serde_json::to_value(&snapshot.activity_infos)?)
    .bind(serde_json::to_value(&snapshot.timer_infos)?)
    .bind(serde_json::to_value(&snapshot.child_execution_infos)?)
    .bind(serde_json::to_value(&snapshot.request_cancel_infos)?)
    .bind(serde_json::to_value(&snapshot.signal_infos)?)
    .bind(serde_json::to_value(&snapshot.signal_requested_ids)?)
    .bind(serde_json::to_value(&snapshot.buffered_events)?)
    .bind(serde_json::to_value(&snapshot.buffered_replication_tasks)?)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Lock the execution row and verify the caller's condition. Returns the
/// stored snapshot for the delta fold.
async fn lock_and_check(
    tx: &mut Transaction<'_, Postgres>,
    domain_id: DomainId,
    workflow_id: &str,
    run_id: RunId,
    condition: i64,
) -> StoreResult<WorkflowSnapshot> {
    let query = format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM workflow_executions \
         WHERE domain_id = $1 AND workflow_id = $2 AND run_id = $3 FOR UPDATE"
    );
    let row = sqlx::query(&query)
        .bind(domain_id.0)
        .bind(workflow_id)
        .bind(run_id.0)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("{workflow_id}/{run_id}")))?;

    let stored_next: i64 = row.try_get("next_event_id")?;
    if stored_next != condition {
        return Err(StoreError::ConditionFailed(format!(
            "expected next_event_id {condition}, stored {stored_next}"
        )));
    }
    snapshot_from_row(&row)
}

async fn insert_execution_row(
    tx: &mut Transaction<'_, Postgres>,
    info: &WorkflowExecutionInfo,
    replication_state: Option<&ReplicationState>,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO workflow_executions
            (domain_id, workflow_id, run_id, execution, replication_state, next_event_id, state)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(info.domain_id.0)
    .bind(&info.workflow_id)
    .bind(info.run_id.0)
    .bind(serde_json::to_value(info)?)
    .bind(replication_state.map(serde_json::to_value).transpose()?)
    .bind(info.next_event_id)
    .bind(info.state.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_transfer_tasks(
    tx: &mut Transaction<'_, Postgres>,
    domain_id: Uuid,
    workflow_id: &str,
    run_id: Uuid,
    tasks: &[TransferTask],
) -> StoreResult<()> {
    for task in tasks {
        sqlx::query(
            "INSERT INTO transfer_tasks (domain_id, workflow_id, run_id, payload, version) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(domain_id)
        .bind(workflow_id)
        .bind(run_id)
        .bind(&task.payload)
        .bind(task.version)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn insert_timer_tasks(
    tx: &mut Transaction<'_, Postgres>,
    domain_id: Uuid,
    workflow_id: &str,
    run_id: Uuid,
    tasks: &[TimerTask],
) -> StoreResult<()> {
    for task in tasks {
        sqlx::query(
            "INSERT INTO timer_tasks (domain_id, workflow_id, run_id, fire_at, payload, version) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(domain_id)
        .bind(workflow_id)
        .bind(run_id)
        .bind(task.fire_at)
        .bind(&task.payload)
        .bind(task.version)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn insert_replication_tasks(
    tx: &mut Transaction<'_, Postgres>,
    domain_id: Uuid,
    workflow_id: &str,
    run_id: Uuid,
    tasks: &[ReplicationTask],
) -> StoreResult<()> {
    for task in tasks {
        sqlx::query(
            r#"
            INSERT INTO replication_tasks
                (domain_id, workflow_id, run_id, first_event_id, next_event_id, version, last_replication_info)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(domain_id)
        .bind(workflow_id)
        .bind(run_id)
        .bind(task.first_event_id)
        .bind(task.next_event_id)
        .bind(task.version)
        .bind(serde_json::to_value(&task.last_replication_info)?)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Create the execution row, point the current-run pointer at it, and queue
/// its initial tasks. Shared between workflow start and continue-as-new.
async fn create_in_transaction(
    tx: &mut Transaction<'_, Postgres>,
    request: &CreateWorkflowExecutionRequest,
) -> StoreResult<()> {
    let info = &request.execution_info;

    let existing = sqlx::query(
        r#"
        SELECT c.run_id, c.expires_at, e.state
        FROM current_executions c
        LEFT JOIN workflow_executions e
            ON e.domain_id = c.domain_id AND e.workflow_id = c.workflow_id AND e.run_id = c.run_id
        WHERE c.domain_id = $1 AND c.workflow_id = $2
        FOR UPDATE OF c
        "#,
    )
    .bind(info.domain_id.0)
    .bind(&info.workflow_id)
    .fetch_optional(&mut **tx)
    .await?;

    if let Some(row) = existing {
        let state: Option<String> = row.try_get("state")?;
        let expires_at: Option<chrono::DateTime<Utc>> = row.try_get("expires_at")?;
        let running = state
            .as_deref()
            .and_then(WorkflowState::parse)
            .map(|s| s != WorkflowState::Completed)
            .unwrap_or(false);
        let expired = expires_at.map(|e| e <= Utc::now()).unwrap_or(false);
        if running && !expired {
            let run_id: Uuid = row.try_get("run_id")?;
            return Err(StoreError::AlreadyExists(format!(
                "{}/{} already has running run {}",
                info.domain_id, info.workflow_id, run_id
            )));
        }
    }

    insert_execution_row(tx, info, request.replication_state.as_ref()).await?;

    sqlx::query(
        r#"
        INSERT INTO current_executions (domain_id, workflow_id, run_id, expires_at)
        VALUES ($1, $2, $3, NULL)
        ON CONFLICT (domain_id, workflow_id)
            DO UPDATE SET run_id = EXCLUDED.run_id, expires_at = NULL
        "#,
    )
    .bind(info.domain_id.0)
    .bind(&info.workflow_id)
    .bind(info.run_id.0)
    .execute(&mut **tx)
    .await?;

    insert_transfer_tasks(
        tx,
        info.domain_id.0,
        &info.workflow_id,
        info.run_id.0,
        &request.transfer_tasks,
    )
    .await?;
    insert_timer_tasks(
        tx,
        info.domain_id.0,
        &info.workflow_id,
        info.run_id.0,
        &request.timer_tasks,
    )
    .await?;
    Ok(())
}

#[async_trait]
impl ExecutionStore for PostgresExecutionStore {
    async fn create_workflow_execution(
        &self,
        request: &CreateWorkflowExecutionRequest,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        create_in_transaction(&mut tx, request).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_workflow_execution(
        &self,
        request: &GetWorkflowExecutionRequest,
    ) -> StoreResult<GetWorkflowExecutionResponse> {
        let query = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM workflow_executions \
             WHERE domain_id = $1 AND workflow_id = $2 AND run_id = $3"
        );
        let row = sqlx::query(&query)
            .bind(request.domain_id.0)
            .bind(&request.execution.workflow_id)
            .bind(request.execution.run_id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(request.execution.to_string()))?;
        Ok(GetWorkflowExecutionResponse {
            state: snapshot_from_row(&row)?,
        })
    }

    async fn update_workflow_execution(
        &self,
        request: &UpdateWorkflowExecutionRequest,
    ) -> StoreResult<()> {
        let info = &request.execution_info;
        let mut tx = self.pool.begin().await?;

        let mut snapshot = lock_and_check(
            &mut tx,
            info.domain_id,
            &info.workflow_id,
            info.run_id,
            request.condition,
        )
        .await?;
        request.apply_record_changes(&mut snapshot);
        write_snapshot(&mut tx, &snapshot).await?;

        insert_transfer_tasks(
            &mut tx,
            info.domain_id.0,
            &info.workflow_id,
            info.run_id.0,
            &request.transfer_tasks,
        )
        .await?;
        insert_timer_tasks(
            &mut tx,
            info.domain_id.0,
            &info.workflow_id,
            info.run_id.0,
            &request.timer_tasks,
        )
        .await?;
        insert_replication_tasks(
            &mut tx,
            info.domain_id.0,
            &info.workflow_id,
            info.run_id.0,
            &request.replication_tasks,
        )
        .await?;

        if let Some(doomed) = &request.delete_timer_task {
            sqlx::query(
                r#"
                DELETE FROM timer_tasks
                WHERE id = (
                    SELECT id FROM timer_tasks
                    WHERE domain_id = $1 AND workflow_id = $2 AND run_id = $3
                        AND fire_at = $4 AND payload = $5
                    LIMIT 1
                )
                "#,
            )
            .bind(info.domain_id.0)
            .bind(&info.workflow_id)
            .bind(info.run_id.0)
            .bind(doomed.fire_at)
            .bind(&doomed.payload)
            .execute(&mut *tx)
            .await?;
        }

        if request.finish_execution {
            let expires_at = Utc::now() + Duration::seconds(request.finished_execution_ttl as i64);
            sqlx::query(
                "UPDATE current_executions SET expires_at = $4 \
                 WHERE domain_id = $1 AND workflow_id = $2 AND run_id = $3",
            )
            .bind(info.domain_id.0)
            .bind(&info.workflow_id)
            .bind(info.run_id.0)
            .bind(expires_at)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(create) = &request.continue_as_new {
            create_in_transaction(&mut tx, create).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn reset_workflow_execution(
        &self,
        request: &ResetWorkflowExecutionRequest,
    ) -> StoreResult<()> {
        let info = &request.snapshot.execution_info;
        let mut tx = self.pool.begin().await?;
        lock_and_check(
            &mut tx,
            info.domain_id,
            &info.workflow_id,
            info.run_id,
            request.condition,
        )
        .await?;
        write_snapshot(&mut tx, &request.snapshot).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append_history_events(
        &self,
        request: &AppendHistoryEventsRequest,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO history_batches
                (domain_id, workflow_id, run_id, first_event_id, transaction_id, data)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (domain_id, workflow_id, run_id, first_event_id)
                DO UPDATE SET transaction_id = EXCLUDED.transaction_id, data = EXCLUDED.data
                WHERE history_batches.transaction_id < EXCLUDED.transaction_id
            "#,
        )
        .bind(request.domain_id.0)
        .bind(&request.execution.workflow_id)
        .bind(request.execution.run_id.0)
        .bind(request.first_event_id)
        .bind(request.transaction_id)
        .bind(&request.events)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ConditionFailed(format!(
                "batch at event {} already written by a newer transaction",
                request.first_event_id
            )));
        }
        Ok(())
    }

    async fn get_current_execution(
        &self,
        domain_id: DomainId,
        workflow_id: &str,
    ) -> StoreResult<CurrentExecution> {
        let row = sqlx::query(
            "SELECT run_id, expires_at FROM current_executions \
             WHERE domain_id = $1 AND workflow_id = $2",
        )
        .bind(domain_id.0)
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(workflow_id.to_string()))?;

        let run_id: Uuid = row.try_get("run_id")?;
        let expires_at: Option<chrono::DateTime<Utc>> = row.try_get("expires_at")?;
        if let Some(expires) = expires_at {
            if expires <= Utc::now() {
                return Err(StoreError::NotFound(format!(
                    "{workflow_id} (current run expired)"
                )));
            }
        }
        Ok(CurrentExecution {
            run_id: RunId(run_id),
            expires_at,
        })
    }
}
