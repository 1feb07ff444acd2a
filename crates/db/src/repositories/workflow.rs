use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::SqliteConnection;
use tracing::debug;

use ladder_core::domain::action::WorkflowAction;
use ladder_core::domain::approval::{Approval, ApprovalId, ApprovalStatus, ChangeSet};
use ladder_core::domain::document::ApprovalDocumentId;
use ladder_core::domain::entity::{EntityRef, EntityType};
use ladder_core::domain::identity::{InstitutionId, UserId};
use ladder_core::domain::task::{ApprovalTask, TaskId, TaskStatus, TaskStatusCounts};
use ladder_core::workflow::{
    PendingTask, StoreError, WorkflowPlan, WorkflowStore, WorkflowTransition,
};

use super::{
    column, decode_level, decode_optional_timestamp, decode_timestamp, encode_timestamp,
    is_unique_violation, RepositoryError,
};
use crate::DbPool;

const APPROVAL_COLUMNS: &str = "a.id, a.institution_id, a.document_id, a.entity_type, a.entity_id,
     a.entity_label, a.action, a.status, a.current_level, a.requested_by, a.change_before,
     a.change_after, a.created_at, a.updated_at, a.completed_at";

const TASK_COLUMNS: &str = "t.id AS task_id, t.approval_id AS task_approval_id, t.level AS task_level,
     t.status AS task_status, t.acted_by AS task_acted_by, t.acted_at AS task_acted_at,
     t.comment AS task_comment, t.created_at AS task_created_at, t.updated_at AS task_updated_at";

/// SQLite-backed [`WorkflowStore`].
///
/// Plans and transitions are written inside one transaction each. A
/// transition re-checks its preconditions with guarded `UPDATE`s, so two
/// writers racing on the same task leave exactly one committed decision.
pub struct SqlWorkflowStore {
    pool: DbPool,
}

impl SqlWorkflowStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn decode_json(value: Option<String>) -> Result<Option<serde_json::Value>, RepositoryError> {
    value
        .map(|raw| {
            serde_json::from_str(&raw)
                .map_err(|e| RepositoryError::Decode(format!("invalid change payload: {e}")))
        })
        .transpose()
}

fn encode_json(value: Option<&serde_json::Value>) -> Option<String> {
    value.map(serde_json::Value::to_string)
}

fn row_to_approval(row: &SqliteRow) -> Result<Approval, RepositoryError> {
    let entity_type: String = column(row, "entity_type")?;
    let action: String = column(row, "action")?;
    let status: String = column(row, "status")?;
    let current_level: i64 = column(row, "current_level")?;
    let created_at: String = column(row, "created_at")?;
    let updated_at: String = column(row, "updated_at")?;

    Ok(Approval {
        id: ApprovalId(column(row, "id")?),
        institution_id: InstitutionId(column(row, "institution_id")?),
        document_id: ApprovalDocumentId(column(row, "document_id")?),
        entity: EntityRef::new(
            EntityType::parse(&entity_type).ok_or_else(|| {
                RepositoryError::Decode(format!("unknown entity type `{entity_type}`"))
            })?,
            column::<String>(row, "entity_id")?,
        ),
        entity_label: column(row, "entity_label")?,
        action: WorkflowAction::parse(&action)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown action `{action}`")))?,
        status: ApprovalStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown approval status `{status}`")))?,
        current_level: decode_level(current_level)?,
        requested_by: UserId(column(row, "requested_by")?),
        change: ChangeSet::new(
            decode_json(column(row, "change_before")?)?,
            decode_json(column(row, "change_after")?)?,
        ),
        created_at: decode_timestamp(&created_at)?,
        updated_at: decode_timestamp(&updated_at)?,
        completed_at: decode_optional_timestamp(column(row, "completed_at")?)?,
    })
}

/// Decodes task columns selected under `TASK_COLUMNS` aliases.
fn row_to_task(row: &SqliteRow) -> Result<ApprovalTask, RepositoryError> {
    let level: i64 = column(row, "task_level")?;
    let status: String = column(row, "task_status")?;
    let created_at: String = column(row, "task_created_at")?;
    let updated_at: String = column(row, "task_updated_at")?;

    Ok(ApprovalTask {
        id: TaskId(column(row, "task_id")?),
        approval_id: ApprovalId(column(row, "task_approval_id")?),
        level: decode_level(level)?,
        status: TaskStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown task status `{status}`")))?,
        acted_by: column::<Option<String>>(row, "task_acted_by")?.map(UserId),
        acted_at: decode_optional_timestamp(column(row, "task_acted_at")?)?,
        comment: column(row, "task_comment")?,
        created_at: decode_timestamp(&created_at)?,
        updated_at: decode_timestamp(&updated_at)?,
    })
}

fn row_to_pending(row: &SqliteRow) -> Result<PendingTask, RepositoryError> {
    Ok(PendingTask { task: row_to_task(row)?, approval: row_to_approval(row)? })
}

async fn insert_approval(
    conn: &mut SqliteConnection,
    approval: &Approval,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO approval (id, institution_id, document_id, entity_type, entity_id,
                               entity_label, action, status, current_level, requested_by,
                               change_before, change_after, created_at, updated_at, completed_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&approval.id.0)
    .bind(&approval.institution_id.0)
    .bind(&approval.document_id.0)
    .bind(approval.entity.entity_type.as_str())
    .bind(&approval.entity.entity_id)
    .bind(&approval.entity_label)
    .bind(approval.action.as_str())
    .bind(approval.status.as_str())
    .bind(i64::from(approval.current_level))
    .bind(&approval.requested_by.0)
    .bind(encode_json(approval.change.before.as_ref()))
    .bind(encode_json(approval.change.after.as_ref()))
    .bind(encode_timestamp(approval.created_at))
    .bind(encode_timestamp(approval.updated_at))
    .bind(approval.completed_at.map(encode_timestamp))
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_task(conn: &mut SqliteConnection, task: &ApprovalTask) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO approval_task (id, approval_id, level, status, acted_by, acted_at, comment,
                                    created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&task.id.0)
    .bind(&task.approval_id.0)
    .bind(i64::from(task.level))
    .bind(task.status.as_str())
    .bind(task.acted_by.as_ref().map(|user| user.0.as_str()))
    .bind(task.acted_at.map(encode_timestamp))
    .bind(task.comment.as_deref())
    .bind(encode_timestamp(task.created_at))
    .bind(encode_timestamp(task.updated_at))
    .execute(conn)
    .await?;
    Ok(())
}

impl SqlWorkflowStore {
    async fn pending_tasks_where(
        &self,
        filter: &str,
        bind: String,
    ) -> Result<Vec<PendingTask>, RepositoryError> {
        let sql = format!(
            "SELECT {APPROVAL_COLUMNS}, {TASK_COLUMNS}
             FROM approval_task t
             JOIN approval a ON a.id = t.approval_id
             WHERE t.status = 'pending' AND {filter}
             ORDER BY t.created_at, t.id"
        );
        let rows = sqlx::query(&sql).bind(bind).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_pending).collect()
    }

    /// Overwrites a task's last-touched time. Used by tooling that replays
    /// aged workflows.
    pub async fn touch_task(
        &self,
        id: &TaskId,
        updated_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query("UPDATE approval_task SET updated_at = ? WHERE id = ?")
            .bind(encode_timestamp(updated_at))
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait::async_trait]
impl WorkflowStore for SqlWorkflowStore {
    async fn find_approval(&self, id: &ApprovalId) -> Result<Option<Approval>, StoreError> {
        let row = sqlx::query(&format!("SELECT {APPROVAL_COLUMNS} FROM approval a WHERE a.id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        match row {
            Some(ref r) => Ok(Some(row_to_approval(r)?)),
            None => Ok(None),
        }
    }

    async fn find_pending_approval(
        &self,
        institution_id: &InstitutionId,
        entity: &EntityRef,
    ) -> Result<Option<Approval>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {APPROVAL_COLUMNS} FROM approval a
             WHERE a.institution_id = ? AND a.entity_type = ? AND a.entity_id = ?
               AND a.status = 'pending'"
        ))
        .bind(&institution_id.0)
        .bind(entity.entity_type.as_str())
        .bind(&entity.entity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        match row {
            Some(ref r) => Ok(Some(row_to_approval(r)?)),
            None => Ok(None),
        }
    }

    async fn find_task(&self, id: &TaskId) -> Result<Option<ApprovalTask>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM approval_task t WHERE t.id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        match row {
            Some(ref r) => Ok(Some(row_to_task(r)?)),
            None => Ok(None),
        }
    }

    async fn list_tasks(
        &self,
        approval_id: &ApprovalId,
    ) -> Result<Vec<ApprovalTask>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM approval_task t WHERE t.approval_id = ? ORDER BY t.level"
        ))
        .bind(&approval_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.iter().map(row_to_task).collect::<Result<Vec<_>, _>>()?)
    }

    async fn list_pending_tasks(
        &self,
        institution_id: &InstitutionId,
    ) -> Result<Vec<PendingTask>, StoreError> {
        Ok(self.pending_tasks_where("a.institution_id = ?", institution_id.0.clone()).await?)
    }

    async fn list_stale_pending_tasks(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PendingTask>, StoreError> {
        Ok(self.pending_tasks_where("t.updated_at < ?", encode_timestamp(cutoff)).await?)
    }

    async fn count_tasks(
        &self,
        institution_id: &InstitutionId,
    ) -> Result<TaskStatusCounts, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT t.status, COUNT(*)
             FROM approval_task t
             JOIN approval a ON a.id = t.approval_id
             WHERE a.institution_id = ?
             GROUP BY t.status",
        )
        .bind(&institution_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        let mut counts = TaskStatusCounts::default();
        for (status, count) in rows {
            let status = TaskStatus::parse(&status).ok_or_else(|| {
                RepositoryError::Decode(format!("unknown task status `{status}`"))
            })?;
            counts.add(status, u64::try_from(count).unwrap_or(0));
        }
        Ok(counts)
    }

    async fn create_workflow(&self, plan: &WorkflowPlan) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::from)?;

        if let Err(error) = insert_approval(&mut tx, &plan.approval).await {
            if is_unique_violation(&error) {
                return Err(StoreError::ActiveWorkflowExists {
                    entity: plan.approval.entity.clone(),
                });
            }
            return Err(RepositoryError::from(error).into());
        }
        for task in &plan.tasks {
            insert_task(&mut tx, task).await.map_err(RepositoryError::from)?;
        }

        tx.commit().await.map_err(RepositoryError::from)?;
        debug!(
            event_name = "db.workflow.created",
            approval_id = %plan.approval.id,
            tasks = plan.tasks.len(),
            "workflow persisted"
        );
        Ok(())
    }

    async fn commit_transition(&self, transition: &WorkflowTransition) -> Result<(), StoreError> {
        let acted = &transition.acted_task;
        let approval = &transition.approval;
        let mut tx = self.pool.begin().await.map_err(RepositoryError::from)?;

        let task_update = sqlx::query(
            "UPDATE approval_task
             SET status = ?, acted_by = ?, acted_at = ?, comment = ?, updated_at = ?
             WHERE id = ? AND status = 'pending'",
        )
        .bind(acted.status.as_str())
        .bind(acted.acted_by.as_ref().map(|user| user.0.as_str()))
        .bind(acted.acted_at.map(encode_timestamp))
        .bind(acted.comment.as_deref())
        .bind(encode_timestamp(acted.updated_at))
        .bind(&acted.id.0)
        .execute(&mut *tx)
        .await
        .map_err(RepositoryError::from)?;
        if task_update.rows_affected() != 1 {
            return Err(StoreError::TaskNotPending { task_id: acted.id.0.clone() });
        }

        let approval_update = sqlx::query(
            "UPDATE approval
             SET status = ?, current_level = ?, updated_at = ?, completed_at = ?
             WHERE id = ? AND status = 'pending' AND current_level = ?",
        )
        .bind(approval.status.as_str())
        .bind(i64::from(approval.current_level))
        .bind(encode_timestamp(approval.updated_at))
        .bind(approval.completed_at.map(encode_timestamp))
        .bind(&approval.id.0)
        .bind(i64::from(transition.expected_level))
        .execute(&mut *tx)
        .await
        .map_err(RepositoryError::from)?;
        if approval_update.rows_affected() != 1 {
            return Err(StoreError::ApprovalChanged { approval_id: approval.id.0.clone() });
        }

        for task in &transition.created_tasks {
            if let Err(error) = insert_task(&mut tx, task).await {
                if is_unique_violation(&error) {
                    return Err(StoreError::ApprovalChanged { approval_id: approval.id.0.clone() });
                }
                return Err(RepositoryError::from(error).into());
            }
        }

        tx.commit().await.map_err(RepositoryError::from)?;
        Ok(())
    }
}
