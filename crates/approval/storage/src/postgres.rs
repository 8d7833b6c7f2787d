//! PostgreSQL adapter for approval storage.
//!
//! Workflow versions and instances are stored as JSONB documents next to
//! the columns the guards and listings filter on. The instance
//! compare-and-swap is a single conditional `UPDATE`.

use crate::model::{compute_audit_hash, AuditAppend, AuditRecord, CasGuard};
use crate::traits::{AuditStore, InstanceStore, QueryWindow, WorkflowStore};
use crate::{StorageError, StorageResult};
use approval_types::{ApprovalInstance, ApprovalWorkflow, InstanceId, RecordRef, WorkflowId};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Acquire, Row};
use uuid::Uuid;

/// PostgreSQL-backed storage adapter.
#[derive(Clone)]
pub struct PostgresApprovalStorage {
    pool: PgPool,
}

impl PostgresApprovalStorage {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS approval_workflows (
                workflow_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                name TEXT NOT NULL,
                priority INTEGER NOT NULL,
                is_active BOOLEAN NOT NULL,
                definition JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (workflow_id, version)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS approval_instances (
                instance_id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                workflow_version INTEGER NOT NULL,
                record_table TEXT NOT NULL,
                record_id TEXT NOT NULL,
                status TEXT NOT NULL,
                current_step INTEGER NOT NULL,
                revision BIGINT NOT NULL,
                body JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS approval_instances_record_idx
                ON approval_instances (record_table, record_id)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS approval_audit_events (
                event_id TEXT PRIMARY KEY,
                sequence BIGINT NOT NULL UNIQUE,
                timestamp TIMESTAMPTZ NOT NULL,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                instance_id TEXT,
                workflow_id TEXT,
                payload JSONB NOT NULL,
                previous_hash TEXT,
                hash TEXT NOT NULL
            )
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for PostgresApprovalStorage {
    async fn insert_workflow_version(&self, workflow: ApprovalWorkflow) -> StorageResult<()> {
        let definition = serde_json::to_value(&workflow)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        // Only insert when this is exactly the next version.
        let result = sqlx::query(
            r#"
            INSERT INTO approval_workflows
                (workflow_id, version, name, priority, is_active, definition, created_at)
            SELECT $1, $2, $3, $4, $5, $6, $7
             WHERE COALESCE(
                    (SELECT MAX(version) FROM approval_workflows WHERE workflow_id = $1), 0
                   ) = $2 - 1
            "#,
        )
        .bind(workflow.id.0.clone())
        .bind(to_i32(workflow.version)?)
        .bind(workflow.name.clone())
        .bind(workflow.priority)
        .bind(workflow.is_active)
        .bind(definition)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!(
                "workflow {} version {} is not the next version",
                workflow.id, workflow.version
            )));
        }
        Ok(())
    }

    async fn get_workflow_version(
        &self,
        workflow_id: &WorkflowId,
        version: u32,
    ) -> StorageResult<Option<ApprovalWorkflow>> {
        let row = sqlx::query(
            "SELECT definition FROM approval_workflows WHERE workflow_id = $1 AND version = $2",
        )
        .bind(workflow_id.0.clone())
        .bind(to_i32(version)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        row.map(|r| json_column(&r, "definition")).transpose()
    }

    async fn get_latest_workflow(
        &self,
        workflow_id: &WorkflowId,
    ) -> StorageResult<Option<ApprovalWorkflow>> {
        let row = sqlx::query(
            r#"
            SELECT definition FROM approval_workflows
             WHERE workflow_id = $1
             ORDER BY version DESC
             LIMIT 1
            "#,
        )
        .bind(workflow_id.0.clone())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        row.map(|r| json_column(&r, "definition")).transpose()
    }

    async fn list_workflow_versions(
        &self,
        workflow_id: &WorkflowId,
    ) -> StorageResult<Vec<ApprovalWorkflow>> {
        let rows = sqlx::query(
            "SELECT definition FROM approval_workflows WHERE workflow_id = $1 ORDER BY version ASC",
        )
        .bind(workflow_id.0.clone())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.iter().map(|r| json_column(r, "definition")).collect()
    }

    async fn list_latest_workflows(&self) -> StorageResult<Vec<ApprovalWorkflow>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (workflow_id) definition
              FROM approval_workflows
             ORDER BY workflow_id, version DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.iter().map(|r| json_column(r, "definition")).collect()
    }
}

#[async_trait]
impl InstanceStore for PostgresApprovalStorage {
    async fn insert_instance(&self, instance: ApprovalInstance) -> StorageResult<()> {
        let body = serde_json::to_value(&instance)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO approval_instances
                (instance_id, workflow_id, workflow_version, record_table, record_id,
                 status, current_step, revision, body, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(instance.id.0.clone())
        .bind(instance.workflow_id.0.clone())
        .bind(to_i32(instance.workflow_version)?)
        .bind(instance.record.record_table.clone())
        .bind(instance.record.record_id.clone())
        .bind(instance.status.as_str())
        .bind(to_i32(instance.current_step)?)
        .bind(to_i64(instance.revision)?)
        .bind(body)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_conflict)?;

        Ok(())
    }

    async fn get_instance(
        &self,
        instance_id: &InstanceId,
    ) -> StorageResult<Option<ApprovalInstance>> {
        let row = sqlx::query("SELECT body FROM approval_instances WHERE instance_id = $1")
            .bind(instance_id.0.clone())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        row.map(|r| json_column(&r, "body")).transpose()
    }

    async fn compare_and_swap_instance(
        &self,
        expected: CasGuard,
        mut next: ApprovalInstance,
    ) -> StorageResult<ApprovalInstance> {
        next.revision = expected.revision + 1;
        let body =
            serde_json::to_value(&next).map_err(|e| StorageError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            r#"
            UPDATE approval_instances
               SET body = $1,
                   status = $2,
                   current_step = $3,
                   revision = $4,
                   updated_at = $5
             WHERE instance_id = $6
               AND revision = $7
               AND status = $8
               AND current_step = $9
            "#,
        )
        .bind(body)
        .bind(next.status.as_str())
        .bind(to_i32(next.current_step)?)
        .bind(to_i64(next.revision)?)
        .bind(next.updated_at)
        .bind(next.id.0.clone())
        .bind(to_i64(expected.revision)?)
        .bind(expected.status.as_str())
        .bind(to_i32(expected.current_step)?)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            let exists = self.get_instance(&next.id).await?.is_some();
            if exists {
                return Err(StorageError::CasMismatch(format!(
                    "instance {} changed since revision {}",
                    next.id, expected.revision
                )));
            }
            return Err(StorageError::NotFound(format!(
                "instance {} not found",
                next.id
            )));
        }

        Ok(next)
    }

    async fn list_open_instances(&self) -> StorageResult<Vec<ApprovalInstance>> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM approval_instances
             WHERE status NOT IN ('approved', 'rejected', 'cancelled')
             ORDER BY created_at DESC, instance_id DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.iter().map(|r| json_column(r, "body")).collect()
    }

    async fn list_instances_for_record(
        &self,
        record: &RecordRef,
    ) -> StorageResult<Vec<ApprovalInstance>> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM approval_instances
             WHERE record_table = $1 AND record_id = $2
             ORDER BY created_at DESC, instance_id DESC
            "#,
        )
        .bind(record.record_table.clone())
        .bind(record.record_id.clone())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.iter().map(|r| json_column(r, "body")).collect()
    }

    async fn list_instances(&self, window: QueryWindow) -> StorageResult<Vec<ApprovalInstance>> {
        let rows = if window.limit == 0 {
            sqlx::query(
                r#"
                SELECT body FROM approval_instances
                 ORDER BY created_at DESC, instance_id DESC
                 OFFSET $1
                "#,
            )
            .bind(usize_to_i64(window.offset)?)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
        } else {
            sqlx::query(
                r#"
                SELECT body FROM approval_instances
                 ORDER BY created_at DESC, instance_id DESC
                 LIMIT $1 OFFSET $2
                "#,
            )
            .bind(usize_to_i64(window.limit)?)
            .bind(usize_to_i64(window.offset)?)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
        };

        rows.iter().map(|r| json_column(r, "body")).collect()
    }
}

#[async_trait]
impl AuditStore for PostgresApprovalStorage {
    async fn append_audit(&self, event: AuditAppend) -> StorageResult<AuditRecord> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let conn = tx
            .acquire()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        sqlx::query("LOCK TABLE approval_audit_events IN EXCLUSIVE MODE")
            .execute(&mut *conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let last = sqlx::query(
            "SELECT sequence, hash FROM approval_audit_events ORDER BY sequence DESC LIMIT 1",
        )
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let (sequence, previous_hash) = if let Some(row) = last {
            let seq: i64 = row
                .try_get("sequence")
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            let prev: String = row
                .try_get("hash")
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            (seq + 1, Some(prev))
        } else {
            (1_i64, None)
        };

        let hash = compute_audit_hash(&event, previous_hash.as_deref(), sequence as u64)?;
        let event_id = format!("audit-{}", Uuid::new_v4());

        sqlx::query(
            r#"
            INSERT INTO approval_audit_events
                (event_id, sequence, timestamp, actor, action, instance_id, workflow_id, payload, previous_hash, hash)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(event_id.clone())
        .bind(sequence)
        .bind(event.timestamp)
        .bind(event.actor.clone())
        .bind(event.action.clone())
        .bind(event.instance_id.as_ref().map(|id| id.0.clone()))
        .bind(event.workflow_id.as_ref().map(|id| id.0.clone()))
        .bind(event.payload.clone())
        .bind(previous_hash.clone())
        .bind(hash.clone())
        .execute(&mut *conn)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(AuditRecord::from_append(
            event,
            event_id,
            sequence as u64,
            previous_hash,
            hash,
        ))
    }

    async fn list_audit(&self, window: QueryWindow) -> StorageResult<Vec<AuditRecord>> {
        let rows = if window.limit == 0 {
            sqlx::query(
                r#"
                SELECT event_id, sequence, timestamp, actor, action, instance_id, workflow_id, payload, previous_hash, hash
                  FROM approval_audit_events
                 ORDER BY sequence DESC
                 OFFSET $1
                "#,
            )
            .bind(usize_to_i64(window.offset)?)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
        } else {
            sqlx::query(
                r#"
                SELECT event_id, sequence, timestamp, actor, action, instance_id, workflow_id, payload, previous_hash, hash
                  FROM approval_audit_events
                 ORDER BY sequence DESC
                 LIMIT $1 OFFSET $2
                "#,
            )
            .bind(usize_to_i64(window.limit)?)
            .bind(usize_to_i64(window.offset)?)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
        };

        rows.into_iter().map(audit_row_to_record).collect()
    }

    async fn list_audit_for_instance(
        &self,
        instance_id: &InstanceId,
    ) -> StorageResult<Vec<AuditRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, sequence, timestamp, actor, action, instance_id, workflow_id, payload, previous_hash, hash
              FROM approval_audit_events
             WHERE instance_id = $1
             ORDER BY sequence ASC
            "#,
        )
        .bind(instance_id.0.clone())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter().map(audit_row_to_record).collect()
    }

    async fn latest_audit_hash(&self) -> StorageResult<Option<String>> {
        let row =
            sqlx::query("SELECT hash FROM approval_audit_events ORDER BY sequence DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;

        row.map(|r| r.try_get::<String, _>("hash"))
            .transpose()
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

fn json_column<T: serde::de::DeserializeOwned>(
    row: &sqlx::postgres::PgRow,
    column: &str,
) -> StorageResult<T> {
    let value: serde_json::Value = row
        .try_get(column)
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn audit_row_to_record(row: sqlx::postgres::PgRow) -> StorageResult<AuditRecord> {
    let instance_id: Option<String> = row
        .try_get("instance_id")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let workflow_id: Option<String> = row
        .try_get("workflow_id")
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    Ok(AuditRecord {
        event_id: row
            .try_get("event_id")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        sequence: row
            .try_get::<i64, _>("sequence")
            .map_err(|e| StorageError::Backend(e.to_string()))? as u64,
        timestamp: row
            .try_get("timestamp")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        actor: row
            .try_get("actor")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        action: row
            .try_get("action")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        instance_id: instance_id.map(InstanceId::new),
        workflow_id: workflow_id.map(WorkflowId::new),
        payload: row
            .try_get("payload")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        previous_hash: row
            .try_get("previous_hash")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
        hash: row
            .try_get("hash")
            .map_err(|e| StorageError::Backend(e.to_string()))?,
    })
}

fn map_sqlx_conflict(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return StorageError::Conflict(db_err.message().to_string());
        }
    }
    StorageError::Backend(err.to_string())
}

fn to_i32(value: u32) -> StorageResult<i32> {
    i32::try_from(value).map_err(|_| StorageError::InvalidInput("value too large".to_string()))
}

fn to_i64(value: u64) -> StorageResult<i64> {
    i64::try_from(value).map_err(|_| StorageError::InvalidInput("value too large".to_string()))
}

fn usize_to_i64(value: usize) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::InvalidInput("window value too large".to_string()))
}
