use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::approval::{Approval, ApprovalId};
use crate::domain::document::{ApprovalDocument, ApprovalDocumentId};
use crate::domain::entity::{EntityRef, EntityType};
use crate::domain::identity::InstitutionId;
use crate::domain::task::{ApprovalTask, TaskId, TaskStatusCounts};
use crate::workflow::engine::{WorkflowPlan, WorkflowTransition};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("task `{task_id}` is no longer pending")]
    TaskNotPending { task_id: String },
    #[error("approval `{approval_id}` changed concurrently")]
    ApprovalChanged { approval_id: String },
    #[error("entity `{entity}` already has a pending approval")]
    ActiveWorkflowExists { entity: EntityRef },
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("stored record could not be decoded: {0}")]
    Corrupt(String),
}

/// A pending task together with the approval that owns it.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingTask {
    pub task: ApprovalTask,
    pub approval: Approval,
}

/// Persistence for approvals and tasks.
///
/// `create_workflow` and `commit_transition` are atomic: either every row of
/// the plan/transition is written or none is.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn find_approval(&self, id: &ApprovalId) -> Result<Option<Approval>, StoreError>;

    /// Pending approval for an entity, scoped to the owning institution.
    async fn find_pending_approval(
        &self,
        institution_id: &InstitutionId,
        entity: &EntityRef,
    ) -> Result<Option<Approval>, StoreError>;

    async fn find_task(&self, id: &TaskId) -> Result<Option<ApprovalTask>, StoreError>;

    async fn list_tasks(&self, approval_id: &ApprovalId)
        -> Result<Vec<ApprovalTask>, StoreError>;

    async fn list_pending_tasks(
        &self,
        institution_id: &InstitutionId,
    ) -> Result<Vec<PendingTask>, StoreError>;

    /// Pending tasks across all institutions last touched before `cutoff`.
    async fn list_stale_pending_tasks(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PendingTask>, StoreError>;

    async fn count_tasks(&self, institution_id: &InstitutionId)
        -> Result<TaskStatusCounts, StoreError>;

    /// Fails with `ActiveWorkflowExists` when the entity already has a
    /// pending approval.
    async fn create_workflow(&self, plan: &WorkflowPlan) -> Result<(), StoreError>;

    /// Applies a transition only if the acted task is still pending and the
    /// approval is still pending at `transition.expected_level`.
    async fn commit_transition(&self, transition: &WorkflowTransition) -> Result<(), StoreError>;
}

/// Read access to approval document configuration.
#[async_trait]
pub trait DocumentCatalog: Send + Sync {
    /// The active document for an entity type inside an institution.
    async fn find_for_entity(
        &self,
        institution_id: &InstitutionId,
        entity_type: EntityType,
    ) -> Result<Option<ApprovalDocument>, StoreError>;

    async fn find_document(
        &self,
        id: &ApprovalDocumentId,
    ) -> Result<Option<ApprovalDocument>, StoreError>;

    async fn list_documents(
        &self,
        institution_id: &InstitutionId,
    ) -> Result<Vec<ApprovalDocument>, StoreError>;
}
