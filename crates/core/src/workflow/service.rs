use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::domain::action::WorkflowAction;
use crate::domain::approval::{Approval, ApprovalId, ChangeSet};
use crate::domain::document::{ApprovalDocument, ApprovalDocumentId, ApprovalDocumentLevel};
use crate::domain::entity::ApprovableEntity;
use crate::domain::identity::InstitutionId;
use crate::domain::task::{ApprovalTask, TaskId, TaskStatusCounts};
use crate::workflow::context::WorkflowContext;
use crate::workflow::engine::{
    Decision, StartRequest, TransitionOutcome, WorkflowEngine, WorkflowError, WorkflowTransition,
};
use crate::workflow::hooks::{EntityHookRegistry, HookError};
use crate::workflow::notify::{Notification, NotificationKind, Notifier};
use crate::workflow::resolver::{ApproverResolver, IdentityDirectory};
use crate::workflow::store::{DocumentCatalog, PendingTask, StoreError, WorkflowStore};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ApprovalDetail {
    pub approval: Approval,
    pub tasks: Vec<ApprovalTask>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaskDetail {
    pub task: ApprovalTask,
    pub approval: Approval,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Dashboard {
    pub institution_id: InstitutionId,
    pub tasks: TaskStatusCounts,
    pub awaiting_me: u64,
}

/// Entry point for every approval workflow operation.
///
/// Authorization and bookkeeping happen here; the state transitions
/// themselves are computed by [`WorkflowEngine`] and persisted atomically by
/// the [`WorkflowStore`]. Notifications, audit events and entity hooks run
/// after the store has accepted a transition and never undo it.
#[derive(Clone)]
pub struct ApprovalWorkflow {
    store: Arc<dyn WorkflowStore>,
    catalog: Arc<dyn DocumentCatalog>,
    resolver: ApproverResolver,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    hooks: EntityHookRegistry,
    engine: WorkflowEngine,
}

impl ApprovalWorkflow {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        catalog: Arc<dyn DocumentCatalog>,
        directory: Arc<dyn IdentityDirectory>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            catalog,
            resolver: ApproverResolver::new(directory),
            notifier,
            audit,
            hooks: EntityHookRegistry::default(),
            engine: WorkflowEngine,
        }
    }

    pub fn with_hooks(mut self, hooks: EntityHookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn resolver(&self) -> &ApproverResolver {
        &self.resolver
    }

    pub async fn initiate(
        &self,
        ctx: &WorkflowContext,
        entity: &(dyn ApprovableEntity + Sync),
        action: WorkflowAction,
        change: ChangeSet,
    ) -> Result<Approval, WorkflowError> {
        let entity_ref = entity.entity_ref();
        if entity.institution_id() != ctx.institution_id {
            return Err(WorkflowError::EntityNotFound { entity: entity_ref });
        }

        let document = self
            .catalog
            .find_for_entity(&ctx.institution_id, entity_ref.entity_type)
            .await?
            .ok_or_else(|| WorkflowError::NoDocumentConfigured {
                institution_id: ctx.institution_id.clone(),
                entity_type: entity_ref.entity_type,
            })?;

        if self.store.find_pending_approval(&ctx.institution_id, &entity_ref).await?.is_some() {
            return Err(WorkflowError::AlreadyInProgress { entity: entity_ref });
        }

        let plan = self.engine.start(
            &document,
            StartRequest {
                institution_id: ctx.institution_id.clone(),
                entity: entity_ref.clone(),
                entity_label: entity.label(),
                action,
                change,
                requested_by: &ctx.actor_id,
            },
            Utc::now(),
        )?;

        self.store.create_workflow(&plan).await.map_err(|error| match error {
            StoreError::ActiveWorkflowExists { entity } => {
                WorkflowError::AlreadyInProgress { entity }
            }
            other => WorkflowError::Store(other),
        })?;

        let approval = &plan.approval;
        info!(
            event_name = "workflow.approval.created",
            correlation_id = %ctx.correlation_id,
            institution_id = %ctx.institution_id,
            approval_id = %approval.id,
            document_id = %document.id,
            entity = %approval.entity,
            action = approval.action.as_str(),
            current_level = approval.current_level,
            "approval workflow started"
        );

        let mut created = self
            .event(ctx, "approval.created", AuditCategory::Workflow, AuditOutcome::Success, approval)
            .with_metadata("document_id", document.id.0.clone())
            .with_metadata("action", approval.action.as_str())
            .with_metadata("current_level", approval.current_level.to_string());
        if !approval.change.is_empty() {
            if let Ok(change) = serde_json::to_value(&approval.change) {
                created = created.with_change(change);
            }
        }
        self.audit.emit(created);

        self.emit_auto_approvals(ctx, approval, &plan.tasks);

        if let Some(hook) = self.hooks.get(approval.entity.entity_type) {
            if let Err(error) = hook.on_submitted(approval).await {
                self.hook_failed(ctx, approval, "on_submitted", &error);
            }
        }

        if let Some(task) = plan.pending_task() {
            self.notify_assigned(ctx, &document, approval, task).await;
        }
        if plan.outcome.is_terminal() {
            self.finish(ctx, approval, plan.outcome).await;
        }

        Ok(plan.approval)
    }

    pub async fn approve(
        &self,
        ctx: &WorkflowContext,
        task_id: &TaskId,
        comment: Option<String>,
    ) -> Result<Approval, WorkflowError> {
        self.decide(ctx, task_id, Decision::Approve, comment).await
    }

    pub async fn reject(
        &self,
        ctx: &WorkflowContext,
        task_id: &TaskId,
        comment: Option<String>,
    ) -> Result<Approval, WorkflowError> {
        self.decide(ctx, task_id, Decision::Reject, comment).await
    }

    /// Approves on behalf of the level using overrider standing. The task is
    /// recorded as overridden.
    pub async fn override_task(
        &self,
        ctx: &WorkflowContext,
        task_id: &TaskId,
        comment: Option<String>,
    ) -> Result<Approval, WorkflowError> {
        self.decide(ctx, task_id, Decision::Override, comment).await
    }

    /// Authorization is checked before the pending state, so a caller with no
    /// standing gets `Unauthorized` even on a task that is already decided.
    async fn decide(
        &self,
        ctx: &WorkflowContext,
        task_id: &TaskId,
        decision: Decision,
        comment: Option<String>,
    ) -> Result<Approval, WorkflowError> {
        let TaskDetail { task, approval } = self.task_detail(ctx, task_id).await?;
        let document = self.bound_document(&approval).await?;
        let level = document.level(task.level).ok_or_else(|| WorkflowError::InvalidLevelState {
            approval_id: approval.id.clone(),
            detail: format!("level {} is missing from document `{}`", task.level, document.id),
        })?;

        let standing = self.resolver.standing(&ctx.institution_id, level, &ctx.actor_id).await?;
        let (allowed, required) = match decision {
            Decision::Approve | Decision::Reject => (standing.may_decide(), "approver"),
            Decision::Override => (standing.overrider, "overrider"),
        };
        if !allowed {
            warn!(
                event_name = "workflow.authorization.denied",
                correlation_id = %ctx.correlation_id,
                institution_id = %ctx.institution_id,
                approval_id = %approval.id,
                task_id = %task.id,
                actor = %ctx.actor_id,
                decision = decision.as_str(),
                "actor lacks standing on task level"
            );
            self.audit.emit(
                self.event(
                    ctx,
                    "authorization.denied",
                    AuditCategory::Authorization,
                    AuditOutcome::Rejected,
                    &approval,
                )
                .with_metadata("task_id", task.id.0.clone())
                .with_metadata("level", task.level.to_string())
                .with_metadata("decision", decision.as_str()),
            );
            return Err(WorkflowError::Unauthorized {
                actor: ctx.actor_id.clone(),
                task_id: task.id,
                required,
            });
        }

        let transition = self.engine.decide(
            &document,
            &approval,
            &task,
            decision,
            &ctx.actor_id,
            comment,
            Utc::now(),
        )?;

        self.store.commit_transition(&transition).await.map_err(|error| match error {
            StoreError::TaskNotPending { .. } | StoreError::ApprovalChanged { .. } => {
                WorkflowError::AlreadyActioned { task_id: task.id.clone() }
            }
            other => WorkflowError::Store(other),
        })?;

        info!(
            event_name = "workflow.task.decided",
            correlation_id = %ctx.correlation_id,
            institution_id = %ctx.institution_id,
            approval_id = %transition.approval.id,
            task_id = %task.id,
            actor = %ctx.actor_id,
            decision = decision.as_str(),
            level = task.level,
            status = transition.approval.status.as_str(),
            current_level = transition.approval.current_level,
            "approval task decided"
        );

        self.after_transition(ctx, &document, decision, &transition).await;
        Ok(transition.approval)
    }

    /// Pending tasks in the caller's institution that the caller may act on.
    pub async fn get_pending_tasks_for(
        &self,
        ctx: &WorkflowContext,
    ) -> Result<Vec<ApprovalTask>, WorkflowError> {
        Ok(self.pending_work_for(ctx).await?.into_iter().map(|pending| pending.task).collect())
    }

    /// Like [`Self::get_pending_tasks_for`] but keeps each task's approval.
    pub async fn pending_work_for(
        &self,
        ctx: &WorkflowContext,
    ) -> Result<Vec<PendingTask>, WorkflowError> {
        let pending = self.store.list_pending_tasks(&ctx.institution_id).await?;
        let mut documents: HashMap<ApprovalDocumentId, Option<ApprovalDocument>> = HashMap::new();
        let mut actionable = Vec::new();

        for item in pending {
            let document_id = &item.approval.document_id;
            if !documents.contains_key(document_id) {
                let document = self.catalog.find_document(document_id).await?;
                documents.insert(document_id.clone(), document);
            }
            let Some(level) = documents
                .get(document_id)
                .and_then(Option::as_ref)
                .and_then(|document| document.level(item.task.level))
            else {
                continue;
            };

            let standing =
                self.resolver.standing(&ctx.institution_id, level, &ctx.actor_id).await?;
            if standing.may_decide() {
                actionable.push(item);
            }
        }

        Ok(actionable)
    }

    pub async fn dashboard(&self, ctx: &WorkflowContext) -> Result<Dashboard, WorkflowError> {
        let tasks = self.store.count_tasks(&ctx.institution_id).await?;
        let awaiting_me = self.pending_work_for(ctx).await?.len() as u64;
        Ok(Dashboard { institution_id: ctx.institution_id.clone(), tasks, awaiting_me })
    }

    pub async fn approval_detail(
        &self,
        ctx: &WorkflowContext,
        approval_id: &ApprovalId,
    ) -> Result<ApprovalDetail, WorkflowError> {
        let approval = self
            .store
            .find_approval(approval_id)
            .await?
            .filter(|approval| approval.institution_id == ctx.institution_id)
            .ok_or_else(|| WorkflowError::ApprovalNotFound(approval_id.clone()))?;
        let tasks = self.store.list_tasks(&approval.id).await?;
        Ok(ApprovalDetail { approval, tasks })
    }

    pub async fn task_detail(
        &self,
        ctx: &WorkflowContext,
        task_id: &TaskId,
    ) -> Result<TaskDetail, WorkflowError> {
        let not_found = || WorkflowError::TaskNotFound(task_id.clone());
        let task = self.store.find_task(task_id).await?.ok_or_else(not_found)?;
        let approval = self.store.find_approval(&task.approval_id).await?.ok_or_else(|| {
            WorkflowError::Store(StoreError::Corrupt(format!(
                "task `{}` references missing approval `{}`",
                task.id, task.approval_id
            )))
        })?;

        if approval.institution_id != ctx.institution_id {
            return Err(not_found());
        }
        Ok(TaskDetail { task, approval })
    }

    pub async fn documents(
        &self,
        ctx: &WorkflowContext,
    ) -> Result<Vec<ApprovalDocument>, WorkflowError> {
        Ok(self.catalog.list_documents(&ctx.institution_id).await?)
    }

    pub async fn document(
        &self,
        ctx: &WorkflowContext,
        id: &ApprovalDocumentId,
    ) -> Result<ApprovalDocument, WorkflowError> {
        self.catalog
            .find_document(id)
            .await?
            .filter(|document| document.institution_id == ctx.institution_id)
            .ok_or_else(|| WorkflowError::DocumentNotFound(id.clone()))
    }

    /// The document an approval was started against, even if it has since
    /// been deactivated.
    async fn bound_document(&self, approval: &Approval) -> Result<ApprovalDocument, WorkflowError> {
        self.catalog.find_document(&approval.document_id).await?.ok_or_else(|| {
            WorkflowError::InvalidLevelState {
                approval_id: approval.id.clone(),
                detail: format!("document `{}` no longer exists", approval.document_id),
            }
        })
    }

    async fn after_transition(
        &self,
        ctx: &WorkflowContext,
        document: &ApprovalDocument,
        decision: Decision,
        transition: &WorkflowTransition,
    ) {
        let approval = &transition.approval;
        let acted = &transition.acted_task;

        if decision == Decision::Override {
            self.audit.emit(
                self.event(ctx, "task.overridden", AuditCategory::Workflow, AuditOutcome::Success, approval)
                    .with_metadata("task_id", acted.id.0.clone())
                    .with_metadata("level", acted.level.to_string()),
            );
        }
        self.emit_auto_approvals(ctx, approval, &transition.created_tasks);

        match transition.outcome {
            TransitionOutcome::Advanced { from_level, to_level } => {
                self.audit.emit(
                    self.event(
                        ctx,
                        "approval.level_advanced",
                        AuditCategory::Workflow,
                        AuditOutcome::Success,
                        approval,
                    )
                    .with_metadata("from_level", from_level.to_string())
                    .with_metadata("to_level", to_level.to_string()),
                );
                if let Some(task) = transition.pending_task() {
                    self.notify_assigned(ctx, document, approval, task).await;
                }
            }
            outcome => self.finish(ctx, approval, outcome).await,
        }
    }

    /// Terminal side effects: audit, requester notification, entity hook.
    async fn finish(&self, ctx: &WorkflowContext, approval: &Approval, outcome: TransitionOutcome) {
        let (event_type, kind, message) = match outcome {
            TransitionOutcome::Approved { final_level } => (
                "approval.approved",
                NotificationKind::WorkflowApproved,
                format!("{} was approved at level {final_level}", approval.entity_label),
            ),
            TransitionOutcome::Rejected { level } => (
                "approval.rejected",
                NotificationKind::WorkflowRejected,
                format!("{} was rejected at level {level}", approval.entity_label),
            ),
            TransitionOutcome::Started { .. } | TransitionOutcome::Advanced { .. } => return,
        };

        info!(
            event_name = "workflow.approval.completed",
            correlation_id = %ctx.correlation_id,
            institution_id = %ctx.institution_id,
            approval_id = %approval.id,
            entity = %approval.entity,
            status = approval.status.as_str(),
            current_level = approval.current_level,
            "approval workflow reached a terminal state"
        );
        self.audit.emit(
            self.event(ctx, event_type, AuditCategory::Workflow, AuditOutcome::Success, approval)
                .with_metadata("final_level", approval.current_level.to_string()),
        );

        self.send(
            ctx,
            Notification {
                recipient: approval.requested_by.clone(),
                institution_id: approval.institution_id.clone(),
                kind,
                message,
                approval_id: approval.id.clone(),
                task_id: None,
            },
        )
        .await;

        let Some(hook) = self.hooks.get(approval.entity.entity_type) else {
            return;
        };
        let (stage, result) = match outcome {
            TransitionOutcome::Approved { .. } => ("on_approved", hook.on_approved(approval).await),
            _ => ("on_rejected", hook.on_rejected(approval).await),
        };
        if let Err(error) = result {
            self.hook_failed(ctx, approval, stage, &error);
        }
    }

    async fn notify_assigned(
        &self,
        ctx: &WorkflowContext,
        document: &ApprovalDocument,
        approval: &Approval,
        task: &ApprovalTask,
    ) {
        let Some(level) = document.level(task.level) else {
            return;
        };
        let approvers = match self.resolver.approvers(&approval.institution_id, level).await {
            Ok(approvers) => approvers,
            Err(error) => {
                warn!(
                    event_name = "workflow.notification.resolution_failed",
                    correlation_id = %ctx.correlation_id,
                    approval_id = %approval.id,
                    task_id = %task.id,
                    error = %error,
                    "could not resolve approvers to notify"
                );
                BTreeSet::new()
            }
        };

        let message = format!(
            "{} is awaiting your approval at level {}",
            approval.entity_label,
            level_label(level)
        );
        for recipient in approvers {
            self.send(
                ctx,
                Notification {
                    recipient,
                    institution_id: approval.institution_id.clone(),
                    kind: NotificationKind::TaskAssigned,
                    message: message.clone(),
                    approval_id: approval.id.clone(),
                    task_id: Some(task.id.clone()),
                },
            )
            .await;
        }
    }

    async fn send(&self, ctx: &WorkflowContext, notification: Notification) {
        let recipient = notification.recipient.clone();
        let kind = notification.kind;
        let approval_id = notification.approval_id.clone();

        if let Err(error) = self.notifier.notify(notification).await {
            warn!(
                event_name = "workflow.notification.failed",
                correlation_id = %ctx.correlation_id,
                approval_id = %approval_id,
                recipient = %recipient,
                kind = kind.as_str(),
                error = %error,
                "notification delivery failed"
            );
            self.audit.emit(
                AuditEvent::new(
                    &AuditContext::from(ctx),
                    "notification.failed",
                    AuditCategory::Notification,
                    AuditOutcome::Failed,
                )
                .with_metadata("approval_id", approval_id.0)
                .with_metadata("recipient", recipient.0)
                .with_metadata("kind", kind.as_str()),
            );
        }
    }

    fn emit_auto_approvals(
        &self,
        ctx: &WorkflowContext,
        approval: &Approval,
        tasks: &[ApprovalTask],
    ) {
        for task in tasks.iter().filter(|task| !task.is_pending()) {
            self.audit.emit(
                self.event(ctx, "task.auto_approved", AuditCategory::Workflow, AuditOutcome::Success, approval)
                    .with_metadata("task_id", task.id.0.clone())
                    .with_metadata("level", task.level.to_string()),
            );
        }
    }

    fn hook_failed(&self, ctx: &WorkflowContext, approval: &Approval, stage: &str, error: &HookError) {
        warn!(
            event_name = "workflow.hook.failed",
            correlation_id = %ctx.correlation_id,
            institution_id = %ctx.institution_id,
            approval_id = %approval.id,
            entity = %approval.entity,
            stage,
            error = %error,
            "entity lifecycle hook failed"
        );
        self.audit.emit(
            self.event(ctx, "hook.failed", AuditCategory::Hook, AuditOutcome::Failed, approval)
                .with_metadata("stage", stage)
                .with_metadata("error", error.to_string()),
        );
    }

    fn event(
        &self,
        ctx: &WorkflowContext,
        event_type: &str,
        category: AuditCategory,
        outcome: AuditOutcome,
        approval: &Approval,
    ) -> AuditEvent {
        AuditEvent::new(&AuditContext::from(ctx), event_type, category, outcome)
            .for_approval(&approval.id, &approval.entity)
    }
}

fn level_label(level: &ApprovalDocumentLevel) -> String {
    match &level.name {
        Some(name) => format!("{} ({name})", level.level),
        None => level.level.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::ApprovalWorkflow;
    use crate::audit::InMemoryAuditSink;
    use crate::domain::action::WorkflowAction;
    use crate::domain::approval::{ApprovalStatus, ChangeSet};
    use crate::domain::document::{
        ApprovalDocument, ApprovalDocumentId, ApprovalDocumentLevel, Principal,
    };
    use crate::domain::entity::{EntitySnapshot, EntityType};
    use crate::domain::identity::{ApproverGroup, GroupId, InstitutionId, RoleId, UserId};
    use crate::domain::task::{TaskId, TaskStatus};
    use crate::workflow::context::WorkflowContext;
    use crate::workflow::engine::WorkflowError;
    use crate::workflow::hooks::{EntityHookRegistry, HookCall, RecordingLifecycle};
    use crate::workflow::memory::InMemoryWorkflowStore;
    use crate::workflow::notify::{InMemoryNotifier, NotificationKind};
    use crate::workflow::resolver::InMemoryIdentityDirectory;
    use crate::workflow::store::WorkflowStore;

    struct Harness {
        workflow: ApprovalWorkflow,
        store: Arc<InMemoryWorkflowStore>,
        directory: Arc<InMemoryIdentityDirectory>,
        notifier: InMemoryNotifier,
        audit: InMemoryAuditSink,
        hooks: RecordingLifecycle,
    }

    fn inst() -> InstitutionId {
        InstitutionId("inst-1".to_string())
    }

    fn user(id: &str) -> UserId {
        UserId(id.to_string())
    }

    fn ctx(actor: &str) -> WorkflowContext {
        WorkflowContext::new(inst(), user(actor), format!("req-{actor}"))
    }

    fn project(id: &str) -> EntitySnapshot {
        EntitySnapshot {
            entity_type: EntityType::Project,
            entity_id: id.to_string(),
            institution_id: inst(),
            label: Some(format!("Project {id}")),
        }
    }

    /// Level 1: u-lead or u-lead-2. Level 2: group g-hr (role-hr holders),
    /// overridable by u-ceo. Level 3: u-dir.
    fn three_level_document() -> ApprovalDocument {
        let now = Utc::now();
        ApprovalDocument {
            id: ApprovalDocumentId("DOC-PROJECT".to_string()),
            institution_id: inst(),
            entity_type: EntityType::Project,
            name: "Project approvals".to_string(),
            levels: vec![
                ApprovalDocumentLevel::new(
                    1,
                    vec![Principal::User(user("u-lead")), Principal::User(user("u-lead-2"))],
                )
                .with_name("Team lead"),
                ApprovalDocumentLevel::new(2, vec![Principal::Group(GroupId("g-hr".to_string()))])
                    .with_name("HR")
                    .with_overriders(vec![Principal::User(user("u-ceo"))]),
                ApprovalDocumentLevel::new(3, vec![Principal::User(user("u-dir"))])
                    .with_name("Director"),
            ],
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    async fn harness_with(hooks: RecordingLifecycle) -> Harness {
        let store = Arc::new(InMemoryWorkflowStore::default());
        store.insert_document(three_level_document()).await.expect("valid document");

        let directory = Arc::new(InMemoryIdentityDirectory::default());
        for id in ["u-req", "u-lead", "u-lead-2", "u-hr", "u-ceo", "u-dir", "u-nobody"] {
            directory.add_user(&inst(), &user(id));
        }
        let hr = RoleId("role-hr".to_string());
        directory.add_role(&inst(), &hr);
        directory.assign_role(&user("u-hr"), &hr);
        directory.add_group(ApproverGroup {
            id: GroupId("g-hr".to_string()),
            institution_id: inst(),
            name: "HR".to_string(),
            users: Vec::new(),
            roles: vec![hr],
        });

        let notifier = InMemoryNotifier::default();
        let audit = InMemoryAuditSink::default();
        let workflow = ApprovalWorkflow::new(
            store.clone(),
            store.clone(),
            directory.clone(),
            Arc::new(notifier.clone()),
            Arc::new(audit.clone()),
        )
        .with_hooks(EntityHookRegistry::default().register_all(Arc::new(hooks.clone())));

        Harness { workflow, store, directory, notifier, audit, hooks }
    }

    async fn harness() -> Harness {
        harness_with(RecordingLifecycle::default()).await
    }

    async fn pending_task(harness: &Harness, approval_id: &crate::domain::approval::ApprovalId) -> TaskId {
        let tasks = harness.store.list_tasks(approval_id).await.expect("tasks");
        let pending: Vec<_> = tasks.into_iter().filter(|task| task.is_pending()).collect();
        assert_eq!(pending.len(), 1, "exactly one pending task per pending approval");
        pending[0].id.clone()
    }

    #[tokio::test]
    async fn three_level_progression_reaches_approved_and_fires_hook_once() {
        let h = harness().await;
        let approval = h
            .workflow
            .initiate(
                &ctx("u-req"),
                &project("P-1"),
                WorkflowAction::Update,
                ChangeSet::new(None, Some(serde_json::json!({"name": "Apollo"}))),
            )
            .await
            .expect("initiate");
        assert_eq!(approval.status, ApprovalStatus::Pending);
        assert_eq!(approval.current_level, 1);

        for (actor, expected_level) in [("u-lead", 2), ("u-hr", 3)] {
            let task = pending_task(&h, &approval.id).await;
            let updated = h.workflow.approve(&ctx(actor), &task, None).await.expect("approve");
            assert_eq!(updated.status, ApprovalStatus::Pending);
            assert_eq!(updated.current_level, expected_level);
        }

        let task = pending_task(&h, &approval.id).await;
        let done = h
            .workflow
            .approve(&ctx("u-dir"), &task, Some("ship it".to_string()))
            .await
            .expect("final approve");
        assert_eq!(done.status, ApprovalStatus::Approved);
        assert_eq!(done.current_level, 3);
        assert!(done.completed_at.is_some());

        let detail = h.workflow.approval_detail(&ctx("u-req"), &approval.id).await.expect("detail");
        assert_eq!(detail.tasks.len(), 3);
        assert!(detail.tasks.iter().all(|task| task.status == TaskStatus::Approved));
        assert_eq!(detail.tasks[2].comment.as_deref(), Some("ship it"));
        assert_eq!(detail.tasks[2].acted_by, Some(user("u-dir")));

        assert_eq!(
            h.hooks.calls(),
            vec![HookCall::Submitted(approval.id.clone()), HookCall::Approved(approval.id.clone())]
        );
        let to_requester = h.notifier.sent_to(&user("u-req"));
        assert_eq!(to_requester.len(), 1);
        assert_eq!(to_requester[0].kind, NotificationKind::WorkflowApproved);
        assert_eq!(h.audit.events_of_type("approval.level_advanced").len(), 2);
        assert_eq!(h.audit.events_of_type("approval.approved").len(), 1);
        assert!(h.audit.events_of_type("approval.created")[0].change.is_some());
    }

    #[tokio::test]
    async fn new_level_tasks_notify_every_resolved_approver() {
        let h = harness().await;
        let approval = h
            .workflow
            .initiate(&ctx("u-req"), &project("P-1"), WorkflowAction::Create, ChangeSet::default())
            .await
            .expect("initiate");

        let assigned: Vec<_> = h
            .notifier
            .sent()
            .into_iter()
            .filter(|n| n.kind == NotificationKind::TaskAssigned)
            .map(|n| n.recipient.0)
            .collect();
        assert_eq!(assigned, vec!["u-lead".to_string(), "u-lead-2".to_string()]);

        h.notifier.clear();
        let task = pending_task(&h, &approval.id).await;
        h.workflow.approve(&ctx("u-lead"), &task, None).await.expect("approve");
        let assigned = h.notifier.sent_to(&user("u-hr"));
        assert_eq!(assigned.len(), 1);
        assert!(assigned[0].message.contains("level 2 (HR)"));
        assert!(h.notifier.sent_to(&user("u-ceo")).is_empty());
    }

    #[tokio::test]
    async fn user_without_standing_at_level_two_is_unauthorized() {
        let h = harness().await;
        let approval = h
            .workflow
            .initiate(&ctx("u-req"), &project("P-1"), WorkflowAction::Create, ChangeSet::default())
            .await
            .expect("initiate");
        let task = pending_task(&h, &approval.id).await;
        h.workflow.approve(&ctx("u-lead"), &task, None).await.expect("level 1");

        let level_two = pending_task(&h, &approval.id).await;
        let error =
            h.workflow.approve(&ctx("u-lead"), &level_two, None).await.expect_err("no standing");
        assert!(matches!(error, WorkflowError::Unauthorized { required: "approver", .. }));

        let stored = h.store.find_task(&level_two).await.expect("find").expect("task");
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(h.audit.events_of_type("authorization.denied").len(), 1);
    }

    #[tokio::test]
    async fn override_at_level_two_advances_to_level_three() {
        let h = harness().await;
        let approval = h
            .workflow
            .initiate(&ctx("u-req"), &project("P-1"), WorkflowAction::Create, ChangeSet::default())
            .await
            .expect("initiate");
        let task = pending_task(&h, &approval.id).await;
        h.workflow.approve(&ctx("u-lead"), &task, None).await.expect("level 1");

        let level_two = pending_task(&h, &approval.id).await;
        let error = h
            .workflow
            .override_task(&ctx("u-hr"), &level_two, None)
            .await
            .expect_err("approver is not an overrider");
        assert!(matches!(error, WorkflowError::Unauthorized { required: "overrider", .. }));

        let updated = h
            .workflow
            .override_task(&ctx("u-ceo"), &level_two, Some("urgent".to_string()))
            .await
            .expect("override");
        assert_eq!(updated.current_level, 3);
        assert_eq!(updated.status, ApprovalStatus::Pending);

        let overridden = h.store.find_task(&level_two).await.expect("find").expect("task");
        assert_eq!(overridden.status, TaskStatus::Overridden);
        assert_eq!(overridden.acted_by, Some(user("u-ceo")));
        assert_eq!(h.audit.events_of_type("task.overridden").len(), 1);
    }

    #[tokio::test]
    async fn overrider_may_also_approve_and_reject() {
        let h = harness().await;
        let approval = h
            .workflow
            .initiate(&ctx("u-req"), &project("P-1"), WorkflowAction::Create, ChangeSet::default())
            .await
            .expect("initiate");
        let task = pending_task(&h, &approval.id).await;
        h.workflow.approve(&ctx("u-lead"), &task, None).await.expect("level 1");

        let level_two = pending_task(&h, &approval.id).await;
        let rejected = h.workflow.reject(&ctx("u-ceo"), &level_two, None).await.expect("reject");
        assert_eq!(rejected.status, ApprovalStatus::Rejected);
    }

    #[tokio::test]
    async fn rejection_at_level_two_creates_no_later_task() {
        let h = harness().await;
        let approval = h
            .workflow
            .initiate(&ctx("u-req"), &project("P-1"), WorkflowAction::Delete, ChangeSet::default())
            .await
            .expect("initiate");
        let task = pending_task(&h, &approval.id).await;
        h.workflow.approve(&ctx("u-lead"), &task, None).await.expect("level 1");

        let level_two = pending_task(&h, &approval.id).await;
        let rejected = h
            .workflow
            .reject(&ctx("u-hr"), &level_two, Some("missing budget".to_string()))
            .await
            .expect("reject");
        assert_eq!(rejected.status, ApprovalStatus::Rejected);
        assert_eq!(rejected.current_level, 2);

        let tasks = h.store.list_tasks(&approval.id).await.expect("tasks");
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|task| task.level <= 2));
        assert_eq!(h.hooks.calls().last(), Some(&HookCall::Rejected(approval.id.clone())));
        let to_requester = h.notifier.sent_to(&user("u-req"));
        assert_eq!(to_requester.len(), 1);
        assert_eq!(to_requester[0].kind, NotificationKind::WorkflowRejected);

        let error = h.workflow.approve(&ctx("u-hr"), &level_two, None).await.expect_err("closed");
        assert_eq!(error, WorkflowError::AlreadyActioned { task_id: level_two });
    }

    #[tokio::test]
    async fn concurrent_approvals_on_one_task_have_a_single_winner() {
        let h = harness().await;
        let approval = h
            .workflow
            .initiate(&ctx("u-req"), &project("P-1"), WorkflowAction::Create, ChangeSet::default())
            .await
            .expect("initiate");
        let task = pending_task(&h, &approval.id).await;

        let first_ctx = ctx("u-lead");
        let second_ctx = ctx("u-lead-2");
        let (first, second) = tokio::join!(
            h.workflow.approve(&first_ctx, &task, None),
            h.workflow.approve(&second_ctx, &task, None),
        );

        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
        assert!(outcomes.iter().any(|outcome| matches!(
            outcome,
            Err(WorkflowError::AlreadyActioned { task_id }) if task_id == &task
        )));

        let tasks = h.store.list_tasks(&approval.id).await.expect("tasks");
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks.iter().filter(|task| task.is_pending()).count(), 1);
        let stored = h.store.find_approval(&approval.id).await.expect("find").expect("approval");
        assert_eq!(stored.current_level, 2);
    }

    #[tokio::test]
    async fn revoking_the_granting_role_blocks_the_next_attempt_only() {
        let h = harness().await;
        let first = h
            .workflow
            .initiate(&ctx("u-req"), &project("P-1"), WorkflowAction::Create, ChangeSet::default())
            .await
            .expect("initiate first");
        let second = h
            .workflow
            .initiate(&ctx("u-req"), &project("P-2"), WorkflowAction::Create, ChangeSet::default())
            .await
            .expect("initiate second");

        for approval in [&first, &second] {
            let task = pending_task(&h, &approval.id).await;
            h.workflow.approve(&ctx("u-lead"), &task, None).await.expect("level 1");
        }
        let first_level_two = pending_task(&h, &first.id).await;
        h.workflow.approve(&ctx("u-hr"), &first_level_two, None).await.expect("before revoke");

        h.directory.revoke_role(&user("u-hr"), &RoleId("role-hr".to_string()));
        let second_level_two = pending_task(&h, &second.id).await;
        let error = h
            .workflow
            .approve(&ctx("u-hr"), &second_level_two, None)
            .await
            .expect_err("revoked");
        assert!(matches!(error, WorkflowError::Unauthorized { .. }));

        let error = h
            .workflow
            .approve(&ctx("u-hr"), &first_level_two, None)
            .await
            .expect_err("standing is checked before the task state");
        assert!(matches!(error, WorkflowError::Unauthorized { .. }));

        let prior = h.store.find_task(&first_level_two).await.expect("find").expect("task");
        assert_eq!(prior.status, TaskStatus::Approved);
        assert_eq!(prior.acted_by, Some(user("u-hr")));
    }

    #[tokio::test]
    async fn initiate_without_document_is_refused() {
        let h = harness().await;
        let event = EntitySnapshot {
            entity_type: EntityType::CalendarEvent,
            entity_id: "EV-1".to_string(),
            institution_id: inst(),
            label: None,
        };

        let error = h
            .workflow
            .initiate(&ctx("u-req"), &event, WorkflowAction::Create, ChangeSet::default())
            .await
            .expect_err("no document");
        assert_eq!(
            error,
            WorkflowError::NoDocumentConfigured {
                institution_id: inst(),
                entity_type: EntityType::CalendarEvent,
            }
        );
    }

    #[tokio::test]
    async fn second_initiate_for_a_pending_entity_is_refused() {
        let h = harness().await;
        h.workflow
            .initiate(&ctx("u-req"), &project("P-1"), WorkflowAction::Create, ChangeSet::default())
            .await
            .expect("initiate");

        let error = h
            .workflow
            .initiate(&ctx("u-req"), &project("P-1"), WorkflowAction::Update, ChangeSet::default())
            .await
            .expect_err("already in progress");
        assert!(matches!(error, WorkflowError::AlreadyInProgress { .. }));
    }

    #[tokio::test]
    async fn same_entity_id_in_another_institution_starts_its_own_workflow() {
        let h = harness().await;
        let other = InstitutionId("inst-2".to_string());
        let now = Utc::now();
        h.store
            .insert_document(ApprovalDocument {
                id: ApprovalDocumentId("DOC-OTHER".to_string()),
                institution_id: other.clone(),
                entity_type: EntityType::Project,
                name: "Other project approvals".to_string(),
                levels: vec![ApprovalDocumentLevel::new(1, vec![Principal::User(user("u-other"))])],
                active: true,
                created_at: now,
                updated_at: now,
            })
            .await
            .expect("valid document");
        h.directory.add_user(&other, &user("u-other"));

        let ours = h
            .workflow
            .initiate(&ctx("u-req"), &project("P-1"), WorkflowAction::Create, ChangeSet::default())
            .await
            .expect("initiate in inst-1");
        let theirs_ctx = WorkflowContext::new(other.clone(), user("u-other"), "req-other");
        let theirs = h
            .workflow
            .initiate(
                &theirs_ctx,
                &EntitySnapshot {
                    entity_type: EntityType::Project,
                    entity_id: "P-1".to_string(),
                    institution_id: other.clone(),
                    label: None,
                },
                WorkflowAction::Create,
                ChangeSet::default(),
            )
            .await
            .expect("same id in inst-2 is a different entity");
        assert_ne!(ours.id, theirs.id);

        let task = pending_task(&h, &theirs.id).await;
        let approved = h.workflow.approve(&theirs_ctx, &task, None).await.expect("approve");
        assert_eq!(approved.status, ApprovalStatus::Approved);

        let error = h
            .workflow
            .initiate(&ctx("u-req"), &project("P-1"), WorkflowAction::Update, ChangeSet::default())
            .await
            .expect_err("inst-1 workflow still pending");
        assert!(matches!(error, WorkflowError::AlreadyInProgress { .. }));
    }

    #[tokio::test]
    async fn other_institutions_see_tasks_and_approvals_as_missing() {
        let h = harness().await;
        let approval = h
            .workflow
            .initiate(&ctx("u-req"), &project("P-1"), WorkflowAction::Create, ChangeSet::default())
            .await
            .expect("initiate");
        let task = pending_task(&h, &approval.id).await;
        let outsider =
            WorkflowContext::new(InstitutionId("inst-2".to_string()), user("u-lead"), "req-x");

        let error = h.workflow.approve(&outsider, &task, None).await.expect_err("foreign");
        assert_eq!(error, WorkflowError::TaskNotFound(task.clone()));
        let error = h.workflow.approval_detail(&outsider, &approval.id).await.expect_err("foreign");
        assert_eq!(error, WorkflowError::ApprovalNotFound(approval.id.clone()));

        let unknown = TaskId("TSK-missing".to_string());
        let error = h.workflow.approve(&ctx("u-lead"), &unknown, None).await.expect_err("missing");
        assert_eq!(error, WorkflowError::TaskNotFound(unknown));
    }

    #[tokio::test]
    async fn failing_terminal_hook_is_audited_without_undoing_the_transition() {
        let h = harness_with(RecordingLifecycle::failing()).await;
        let approval = h
            .workflow
            .initiate(&ctx("u-req"), &project("P-1"), WorkflowAction::Create, ChangeSet::default())
            .await
            .expect("initiate");
        let task = pending_task(&h, &approval.id).await;

        let rejected = h.workflow.reject(&ctx("u-lead"), &task, None).await.expect("reject");
        assert_eq!(rejected.status, ApprovalStatus::Rejected);

        let stored = h.store.find_approval(&approval.id).await.expect("find").expect("approval");
        assert_eq!(stored.status, ApprovalStatus::Rejected);
        let failures = h.audit.events_of_type("hook.failed");
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].metadata.get("stage").map(String::as_str), Some("on_rejected"));
    }

    #[tokio::test]
    async fn auto_approve_levels_are_skipped_during_progression() {
        let h = harness().await;
        let mut document = three_level_document();
        document.id = ApprovalDocumentId("DOC-AUTO".to_string());
        document.levels[1] = ApprovalDocumentLevel::auto(2);
        h.store.insert_document(document).await.expect("valid document");

        let approval = h
            .workflow
            .initiate(&ctx("u-req"), &project("P-1"), WorkflowAction::Create, ChangeSet::default())
            .await
            .expect("initiate");
        let task = pending_task(&h, &approval.id).await;
        let updated = h.workflow.approve(&ctx("u-lead"), &task, None).await.expect("level 1");
        assert_eq!(updated.current_level, 3);

        let tasks = h.store.list_tasks(&approval.id).await.expect("tasks");
        assert_eq!(tasks[1].status, TaskStatus::Approved);
        assert_eq!(tasks[1].acted_by, None);
        assert_eq!(tasks[1].comment.as_deref(), Some("auto-approved"));
        assert_eq!(h.audit.events_of_type("task.auto_approved").len(), 1);
    }

    #[tokio::test]
    async fn pending_tasks_and_dashboard_follow_caller_standing() {
        let h = harness().await;
        for id in ["P-1", "P-2"] {
            h.workflow
                .initiate(&ctx("u-req"), &project(id), WorkflowAction::Create, ChangeSet::default())
                .await
                .expect("initiate");
        }

        let lead_tasks = h.workflow.get_pending_tasks_for(&ctx("u-lead")).await.expect("tasks");
        assert_eq!(lead_tasks.len(), 2);
        assert!(h.workflow.get_pending_tasks_for(&ctx("u-hr")).await.expect("tasks").is_empty());

        h.workflow.approve(&ctx("u-lead"), &lead_tasks[0].id, None).await.expect("approve");
        let hr_tasks = h.workflow.get_pending_tasks_for(&ctx("u-hr")).await.expect("tasks");
        assert_eq!(hr_tasks.len(), 1);
        assert_eq!(hr_tasks[0].level, 2);
        let ceo_tasks = h.workflow.get_pending_tasks_for(&ctx("u-ceo")).await.expect("tasks");
        assert_eq!(ceo_tasks.len(), 1);

        let dashboard = h.workflow.dashboard(&ctx("u-lead")).await.expect("dashboard");
        assert_eq!(dashboard.tasks.pending, 2);
        assert_eq!(dashboard.tasks.approved, 1);
        assert_eq!(dashboard.awaiting_me, 1);
    }
}
