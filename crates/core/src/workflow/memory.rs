use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::approval::{Approval, ApprovalId};
use crate::domain::document::{ApprovalDocument, ApprovalDocumentId, DocumentValidationError};
use crate::domain::entity::{EntityRef, EntityType};
use crate::domain::identity::InstitutionId;
use crate::domain::task::{ApprovalTask, TaskId, TaskStatusCounts};
use crate::workflow::engine::{WorkflowPlan, WorkflowTransition};
use crate::workflow::store::{DocumentCatalog, PendingTask, StoreError, WorkflowStore};

#[derive(Debug, Default)]
struct WorkflowState {
    approvals: HashMap<ApprovalId, Approval>,
    tasks: HashMap<TaskId, ApprovalTask>,
}

impl WorkflowState {
    fn has_task_at(&self, approval_id: &ApprovalId, level: u32) -> bool {
        self.tasks.values().any(|task| &task.approval_id == approval_id && task.level == level)
    }

    fn pending_with_approval(
        &self,
        mut keep: impl FnMut(&ApprovalTask, &Approval) -> bool,
    ) -> Vec<PendingTask> {
        let mut pending: Vec<PendingTask> = self
            .tasks
            .values()
            .filter(|task| task.is_pending())
            .filter_map(|task| {
                let approval = self.approvals.get(&task.approval_id)?;
                keep(task, approval)
                    .then(|| PendingTask { task: task.clone(), approval: approval.clone() })
            })
            .collect();
        pending.sort_by(|a, b| {
            a.task.created_at.cmp(&b.task.created_at).then_with(|| a.task.id.0.cmp(&b.task.id.0))
        });
        pending
    }
}

/// Process-local store. Each write takes the lock once, so plans and
/// transitions apply atomically with the same preconditions as the SQL store.
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    state: RwLock<WorkflowState>,
    documents: RwLock<HashMap<ApprovalDocumentId, ApprovalDocument>>,
}

impl InMemoryWorkflowStore {
    /// Validates and stores a document. An active document replaces any other
    /// active document for the same institution and entity type.
    pub async fn insert_document(
        &self,
        document: ApprovalDocument,
    ) -> Result<(), DocumentValidationError> {
        document.validate()?;
        let mut documents = self.documents.write().await;
        if document.active {
            for existing in documents.values_mut() {
                if existing.id != document.id
                    && existing.institution_id == document.institution_id
                    && existing.entity_type == document.entity_type
                {
                    existing.active = false;
                }
            }
        }
        documents.insert(document.id.clone(), document);
        Ok(())
    }

    pub async fn remove_document(&self, id: &ApprovalDocumentId) -> Option<ApprovalDocument> {
        self.documents.write().await.remove(id)
    }

    /// Rewinds a task's staleness clock.
    pub async fn touch_task(&self, id: &TaskId, updated_at: DateTime<Utc>) -> bool {
        let mut state = self.state.write().await;
        match state.tasks.get_mut(id) {
            Some(task) => {
                task.updated_at = updated_at;
                true
            }
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn find_approval(&self, id: &ApprovalId) -> Result<Option<Approval>, StoreError> {
        Ok(self.state.read().await.approvals.get(id).cloned())
    }

    async fn find_pending_approval(
        &self,
        institution_id: &InstitutionId,
        entity: &EntityRef,
    ) -> Result<Option<Approval>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .approvals
            .values()
            .find(|approval| {
                approval.is_pending()
                    && &approval.institution_id == institution_id
                    && &approval.entity == entity
            })
            .cloned())
    }

    async fn find_task(&self, id: &TaskId) -> Result<Option<ApprovalTask>, StoreError> {
        Ok(self.state.read().await.tasks.get(id).cloned())
    }

    async fn list_tasks(
        &self,
        approval_id: &ApprovalId,
    ) -> Result<Vec<ApprovalTask>, StoreError> {
        let state = self.state.read().await;
        let mut tasks: Vec<ApprovalTask> =
            state.tasks.values().filter(|task| &task.approval_id == approval_id).cloned().collect();
        tasks.sort_by_key(|task| task.level);
        Ok(tasks)
    }

    async fn list_pending_tasks(
        &self,
        institution_id: &InstitutionId,
    ) -> Result<Vec<PendingTask>, StoreError> {
        let state = self.state.read().await;
        Ok(state.pending_with_approval(|_, approval| &approval.institution_id == institution_id))
    }

    async fn list_stale_pending_tasks(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PendingTask>, StoreError> {
        let state = self.state.read().await;
        Ok(state.pending_with_approval(|task, _| task.updated_at < cutoff))
    }

    async fn count_tasks(
        &self,
        institution_id: &InstitutionId,
    ) -> Result<TaskStatusCounts, StoreError> {
        let state = self.state.read().await;
        let mut counts = TaskStatusCounts::default();
        for task in state.tasks.values() {
            let in_institution = state
                .approvals
                .get(&task.approval_id)
                .is_some_and(|approval| &approval.institution_id == institution_id);
            if in_institution {
                counts.add(task.status, 1);
            }
        }
        Ok(counts)
    }

    async fn create_workflow(&self, plan: &WorkflowPlan) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if plan.approval.is_pending()
            && state
                .approvals
                .values()
                .any(|approval| {
                    approval.is_pending()
                        && approval.institution_id == plan.approval.institution_id
                        && approval.entity == plan.approval.entity
                })
        {
            return Err(StoreError::ActiveWorkflowExists { entity: plan.approval.entity.clone() });
        }

        state.approvals.insert(plan.approval.id.clone(), plan.approval.clone());
        for task in &plan.tasks {
            state.tasks.insert(task.id.clone(), task.clone());
        }
        Ok(())
    }

    async fn commit_transition(&self, transition: &WorkflowTransition) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let acted = &transition.acted_task;

        let still_pending = state.tasks.get(&acted.id).is_some_and(ApprovalTask::is_pending);
        if !still_pending {
            return Err(StoreError::TaskNotPending { task_id: acted.id.0.clone() });
        }

        let approval_id = &transition.approval.id;
        let unchanged = state.approvals.get(approval_id).is_some_and(|approval| {
            approval.is_pending() && approval.current_level == transition.expected_level
        });
        let collides = transition
            .created_tasks
            .iter()
            .any(|task| state.has_task_at(&task.approval_id, task.level));
        if !unchanged || collides {
            return Err(StoreError::ApprovalChanged { approval_id: approval_id.0.clone() });
        }

        state.tasks.insert(acted.id.clone(), acted.clone());
        for task in &transition.created_tasks {
            state.tasks.insert(task.id.clone(), task.clone());
        }
        state.approvals.insert(approval_id.clone(), transition.approval.clone());
        Ok(())
    }
}

#[async_trait::async_trait]
impl DocumentCatalog for InMemoryWorkflowStore {
    async fn find_for_entity(
        &self,
        institution_id: &InstitutionId,
        entity_type: EntityType,
    ) -> Result<Option<ApprovalDocument>, StoreError> {
        let documents = self.documents.read().await;
        Ok(documents
            .values()
            .find(|document| {
                document.active
                    && &document.institution_id == institution_id
                    && document.entity_type == entity_type
            })
            .cloned())
    }

    async fn find_document(
        &self,
        id: &ApprovalDocumentId,
    ) -> Result<Option<ApprovalDocument>, StoreError> {
        Ok(self.documents.read().await.get(id).cloned())
    }

    async fn list_documents(
        &self,
        institution_id: &InstitutionId,
    ) -> Result<Vec<ApprovalDocument>, StoreError> {
        let documents = self.documents.read().await;
        let mut listed: Vec<ApprovalDocument> = documents
            .values()
            .filter(|document| &document.institution_id == institution_id)
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        Ok(listed)
    }
}
