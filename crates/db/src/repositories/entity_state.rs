use chrono::{DateTime, Utc};
use serde::Serialize;

use ladder_core::domain::approval::{Approval, ApprovalId, ApprovalStatus};
use ladder_core::domain::entity::EntityRef;
use ladder_core::domain::identity::InstitutionId;
use ladder_core::workflow::{EntityLifecycle, HookError};

use super::{decode_timestamp, encode_timestamp, RepositoryError};
use crate::DbPool;

/// Latest approval outcome recorded against a governed entity.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EntityApprovalState {
    pub entity: EntityRef,
    pub approval_id: ApprovalId,
    pub status: ApprovalStatus,
    /// The `after` side of the approved change; empty until approval.
    pub applied_change: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

/// Entity hook that mirrors workflow outcomes into `entity_approval_state`.
/// Approval applies the change's `after` payload; rejection discards it.
pub struct SqlEntityStateRecorder {
    pool: DbPool,
}

impl SqlEntityStateRecorder {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn find(
        &self,
        institution_id: &InstitutionId,
        entity: &EntityRef,
    ) -> Result<Option<EntityApprovalState>, RepositoryError> {
        let row: Option<(String, String, Option<String>, String)> = sqlx::query_as(
            "SELECT approval_id, approval_status, applied_change, updated_at
             FROM entity_approval_state
             WHERE institution_id = ? AND entity_type = ? AND entity_id = ?",
        )
        .bind(&institution_id.0)
        .bind(entity.entity_type.as_str())
        .bind(&entity.entity_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((approval_id, status, applied_change, updated_at)) = row else {
            return Ok(None);
        };
        let applied_change = applied_change
            .map(|raw| {
                serde_json::from_str(&raw)
                    .map_err(|e| RepositoryError::Decode(format!("invalid applied change: {e}")))
            })
            .transpose()?;

        Ok(Some(EntityApprovalState {
            entity: entity.clone(),
            approval_id: ApprovalId(approval_id),
            status: ApprovalStatus::parse(&status).ok_or_else(|| {
                RepositoryError::Decode(format!("unknown approval status `{status}`"))
            })?,
            applied_change,
            updated_at: decode_timestamp(&updated_at)?,
        }))
    }

    async fn record(
        &self,
        approval: &Approval,
        status: ApprovalStatus,
        applied_change: Option<&serde_json::Value>,
    ) -> Result<(), HookError> {
        sqlx::query(
            "INSERT INTO entity_approval_state (entity_type, entity_id, institution_id, approval_id,
                                                approval_status, applied_change, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(institution_id, entity_type, entity_id) DO UPDATE SET
                 approval_id = excluded.approval_id,
                 approval_status = excluded.approval_status,
                 applied_change = excluded.applied_change,
                 updated_at = excluded.updated_at",
        )
        .bind(approval.entity.entity_type.as_str())
        .bind(&approval.entity.entity_id)
        .bind(&approval.institution_id.0)
        .bind(&approval.id.0)
        .bind(status.as_str())
        .bind(applied_change.map(serde_json::Value::to_string))
        .bind(encode_timestamp(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| HookError::Failed(e.to_string()))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl EntityLifecycle for SqlEntityStateRecorder {
    async fn on_submitted(&self, approval: &Approval) -> Result<(), HookError> {
        self.record(approval, ApprovalStatus::Pending, None).await
    }

    async fn on_approved(&self, approval: &Approval) -> Result<(), HookError> {
        self.record(approval, ApprovalStatus::Approved, approval.change.after.as_ref()).await
    }

    async fn on_rejected(&self, approval: &Approval) -> Result<(), HookError> {
        self.record(approval, ApprovalStatus::Rejected, None).await
    }
}
