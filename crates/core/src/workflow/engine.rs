use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::action::WorkflowAction;
use crate::domain::approval::{Approval, ApprovalId, ApprovalStatus, ChangeSet};
use crate::domain::document::{ApprovalDocument, ApprovalDocumentId};
use crate::domain::entity::{EntityRef, EntityType};
use crate::domain::identity::{InstitutionId, UserId};
use crate::domain::task::{ApprovalTask, TaskId, TaskStatus};
use crate::workflow::resolver::DirectoryError;
use crate::workflow::store::StoreError;

pub const AUTO_APPROVE_COMMENT: &str = "auto-approved";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("no approval document configured for `{entity_type}` in institution `{institution_id}`")]
    NoDocumentConfigured { institution_id: InstitutionId, entity_type: EntityType },
    #[error("entity `{entity}` already has a pending approval")]
    AlreadyInProgress { entity: EntityRef },
    #[error("user `{actor}` has no {required} standing on task `{task_id}`")]
    Unauthorized { actor: UserId, task_id: TaskId, required: &'static str },
    #[error("task `{task_id}` has already been actioned")]
    AlreadyActioned { task_id: TaskId },
    #[error("task `{0}` not found")]
    TaskNotFound(TaskId),
    #[error("approval `{0}` not found")]
    ApprovalNotFound(ApprovalId),
    #[error("approval document `{0}` not found")]
    DocumentNotFound(ApprovalDocumentId),
    #[error("entity `{entity}` not found")]
    EntityNotFound { entity: EntityRef },
    #[error("approval `{approval_id}` is in an invalid level state: {detail}")]
    InvalidLevelState { approval_id: ApprovalId, detail: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
    Override,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Override => "override",
        }
    }

    fn task_status(&self) -> TaskStatus {
        match self {
            Self::Approve => TaskStatus::Approved,
            Self::Reject => TaskStatus::Rejected,
            Self::Override => TaskStatus::Overridden,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionOutcome {
    Started { level: u32 },
    Advanced { from_level: u32, to_level: u32 },
    Approved { final_level: u32 },
    Rejected { level: u32 },
}

impl TransitionOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved { .. } | Self::Rejected { .. })
    }
}

/// Rows to write when a workflow starts.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkflowPlan {
    pub approval: Approval,
    pub tasks: Vec<ApprovalTask>,
    pub outcome: TransitionOutcome,
}

impl WorkflowPlan {
    pub fn pending_task(&self) -> Option<&ApprovalTask> {
        self.tasks.iter().find(|task| task.is_pending())
    }
}

/// Rows to write when a task is decided. `expected_level` is the level the
/// approval was at when the decision was computed; the store refuses the
/// write if it moved.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkflowTransition {
    pub expected_level: u32,
    pub approval: Approval,
    pub acted_task: ApprovalTask,
    pub created_tasks: Vec<ApprovalTask>,
    pub outcome: TransitionOutcome,
}

impl WorkflowTransition {
    pub fn pending_task(&self) -> Option<&ApprovalTask> {
        self.created_tasks.iter().find(|task| task.is_pending())
    }
}

pub struct StartRequest<'a> {
    pub institution_id: InstitutionId,
    pub entity: EntityRef,
    pub entity_label: String,
    pub action: WorkflowAction,
    pub change: ChangeSet,
    pub requested_by: &'a UserId,
}

/// Deterministic approval state machine. Computes the rows a transition
/// produces without touching storage; authorization happens upstream.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkflowEngine;

enum Entered {
    Pending { level: u32 },
    Completed { level: u32 },
}

impl WorkflowEngine {
    pub fn start(
        &self,
        document: &ApprovalDocument,
        request: StartRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<WorkflowPlan, WorkflowError> {
        let mut approval = Approval {
            id: ApprovalId(format!("APR-{}", Uuid::new_v4().simple())),
            institution_id: request.institution_id,
            document_id: document.id.clone(),
            entity: request.entity,
            entity_label: request.entity_label,
            action: request.action,
            status: ApprovalStatus::Pending,
            current_level: 1,
            requested_by: request.requested_by.clone(),
            change: request.change,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        let mut tasks = Vec::new();
        let outcome = match enter_level(document, &mut approval, 1, &mut tasks, now)? {
            Entered::Pending { level } => TransitionOutcome::Started { level },
            Entered::Completed { level } => TransitionOutcome::Approved { final_level: level },
        };

        Ok(WorkflowPlan { approval, tasks, outcome })
    }

    pub fn decide(
        &self,
        document: &ApprovalDocument,
        approval: &Approval,
        task: &ApprovalTask,
        decision: Decision,
        actor: &UserId,
        comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<WorkflowTransition, WorkflowError> {
        if task.approval_id != approval.id {
            return Err(invalid(approval, format!("task `{}` belongs to another approval", task.id.0)));
        }

        if !task.is_pending() {
            return Err(WorkflowError::AlreadyActioned { task_id: task.id.clone() });
        }

        if !approval.is_pending() {
            return Err(invalid(
                approval,
                format!("task `{}` is pending but the approval is {}", task.id.0, approval.status.as_str()),
            ));
        }

        if task.level != approval.current_level {
            return Err(invalid(
                approval,
                format!(
                    "pending task at level {} but approval is at level {}",
                    task.level, approval.current_level
                ),
            ));
        }

        if document.level(task.level).is_none() {
            return Err(invalid(
                approval,
                format!("level {} is missing from document `{}`", task.level, document.id.0),
            ));
        }

        let mut acted_task = task.clone();
        acted_task.status = decision.task_status();
        acted_task.acted_by = Some(actor.clone());
        acted_task.acted_at = Some(now);
        acted_task.comment = comment;
        acted_task.updated_at = now;

        let mut next = approval.clone();
        next.updated_at = now;
        let mut created_tasks = Vec::new();

        let outcome = match decision {
            Decision::Reject => {
                next.status = ApprovalStatus::Rejected;
                next.completed_at = Some(now);
                TransitionOutcome::Rejected { level: task.level }
            }
            Decision::Approve | Decision::Override if document.is_final_level(task.level) => {
                next.status = ApprovalStatus::Approved;
                next.completed_at = Some(now);
                TransitionOutcome::Approved { final_level: task.level }
            }
            Decision::Approve | Decision::Override => {
                match enter_level(document, &mut next, task.level + 1, &mut created_tasks, now)? {
                    Entered::Pending { level } => {
                        TransitionOutcome::Advanced { from_level: task.level, to_level: level }
                    }
                    Entered::Completed { level } => {
                        TransitionOutcome::Approved { final_level: level }
                    }
                }
            }
        };

        Ok(WorkflowTransition {
            expected_level: approval.current_level,
            approval: next,
            acted_task,
            created_tasks,
            outcome,
        })
    }
}

/// Moves the approval onto `level`, creating its task. Auto-approve levels
/// are closed immediately and the walk continues with the next level.
fn enter_level(
    document: &ApprovalDocument,
    approval: &mut Approval,
    mut level: u32,
    tasks: &mut Vec<ApprovalTask>,
    now: DateTime<Utc>,
) -> Result<Entered, WorkflowError> {
    loop {
        let Some(config) = document.level(level) else {
            return Err(invalid(
                approval,
                format!("level {level} is missing from document `{}`", document.id.0),
            ));
        };

        approval.current_level = level;
        let mut task = ApprovalTask::pending(approval.id.clone(), level, now);

        if !config.auto_approve {
            tasks.push(task);
            return Ok(Entered::Pending { level });
        }

        task.status = TaskStatus::Approved;
        task.acted_at = Some(now);
        task.comment = Some(AUTO_APPROVE_COMMENT.to_string());
        tasks.push(task);

        if document.is_final_level(level) {
            approval.status = ApprovalStatus::Approved;
            approval.completed_at = Some(now);
            return Ok(Entered::Completed { level });
        }
        level += 1;
    }
}

fn invalid(approval: &Approval, detail: String) -> WorkflowError {
    WorkflowError::InvalidLevelState { approval_id: approval.id.clone(), detail }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{Decision, StartRequest, TransitionOutcome, WorkflowEngine, WorkflowError};
    use crate::domain::action::WorkflowAction;
    use crate::domain::approval::{ApprovalStatus, ChangeSet};
    use crate::domain::document::{
        ApprovalDocument, ApprovalDocumentId, ApprovalDocumentLevel, Principal,
    };
    use crate::domain::entity::{EntityRef, EntityType};
    use crate::domain::identity::{InstitutionId, UserId};
    use crate::domain::task::TaskStatus;

    fn user(id: &str) -> UserId {
        UserId(id.to_string())
    }

    fn document(levels: Vec<ApprovalDocumentLevel>) -> ApprovalDocument {
        let now = Utc::now();
        ApprovalDocument {
            id: ApprovalDocumentId("DOC-1".to_string()),
            institution_id: InstitutionId("inst-1".to_string()),
            entity_type: EntityType::Project,
            name: "Project approvals".to_string(),
            levels,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn three_levels() -> ApprovalDocument {
        document(vec![
            ApprovalDocumentLevel::new(1, vec![Principal::User(user("u-a"))]),
            ApprovalDocumentLevel::new(2, vec![Principal::User(user("u-b"))]),
            ApprovalDocumentLevel::new(3, vec![Principal::User(user("u-c"))]),
        ])
    }

    fn request(requested_by: &UserId) -> StartRequest<'_> {
        StartRequest {
            institution_id: InstitutionId("inst-1".to_string()),
            entity: EntityRef::new(EntityType::Project, "P-1"),
            entity_label: "Project Apollo".to_string(),
            action: WorkflowAction::Create,
            change: ChangeSet::default(),
            requested_by,
        }
    }

    #[test]
    fn start_creates_pending_approval_with_level_one_task() {
        let requester = user("u-req");
        let plan = WorkflowEngine
            .start(&three_levels(), request(&requester), Utc::now())
            .expect("start should succeed");

        assert_eq!(plan.outcome, TransitionOutcome::Started { level: 1 });
        assert_eq!(plan.approval.status, ApprovalStatus::Pending);
        assert_eq!(plan.approval.current_level, 1);
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].level, 1);
        assert_eq!(plan.tasks[0].status, TaskStatus::Pending);
    }

    #[test]
    fn approving_a_middle_level_creates_only_the_next_task() {
        let engine = WorkflowEngine;
        let doc = three_levels();
        let requester = user("u-req");
        let plan = engine.start(&doc, request(&requester), Utc::now()).expect("start");

        let transition = engine
            .decide(&doc, &plan.approval, &plan.tasks[0], Decision::Approve, &user("u-a"), None, Utc::now())
            .expect("approve level 1");

        assert_eq!(transition.outcome, TransitionOutcome::Advanced { from_level: 1, to_level: 2 });
        assert_eq!(transition.expected_level, 1);
        assert_eq!(transition.approval.current_level, 2);
        assert_eq!(transition.acted_task.status, TaskStatus::Approved);
        assert_eq!(transition.acted_task.acted_by, Some(user("u-a")));
        assert_eq!(transition.created_tasks.len(), 1);
        assert_eq!(transition.created_tasks[0].level, 2);
    }

    #[test]
    fn approving_the_final_level_completes_the_workflow() {
        let engine = WorkflowEngine;
        let doc = document(vec![ApprovalDocumentLevel::new(1, vec![Principal::User(user("u-a"))])]);
        let requester = user("u-req");
        let plan = engine.start(&doc, request(&requester), Utc::now()).expect("start");

        let transition = engine
            .decide(&doc, &plan.approval, &plan.tasks[0], Decision::Approve, &user("u-a"), None, Utc::now())
            .expect("approve");

        assert_eq!(transition.outcome, TransitionOutcome::Approved { final_level: 1 });
        assert_eq!(transition.approval.status, ApprovalStatus::Approved);
        assert_eq!(transition.approval.current_level, 1);
        assert!(transition.approval.completed_at.is_some());
        assert!(transition.created_tasks.is_empty());
    }

    #[test]
    fn rejection_terminates_without_creating_later_tasks() {
        let engine = WorkflowEngine;
        let doc = three_levels();
        let requester = user("u-req");
        let plan = engine.start(&doc, request(&requester), Utc::now()).expect("start");

        let transition = engine
            .decide(
                &doc,
                &plan.approval,
                &plan.tasks[0],
                Decision::Reject,
                &user("u-a"),
                Some("budget missing".to_string()),
                Utc::now(),
            )
            .expect("reject");

        assert_eq!(transition.outcome, TransitionOutcome::Rejected { level: 1 });
        assert_eq!(transition.approval.status, ApprovalStatus::Rejected);
        assert_eq!(transition.approval.current_level, 1);
        assert_eq!(transition.acted_task.comment.as_deref(), Some("budget missing"));
        assert!(transition.created_tasks.is_empty());
    }

    #[test]
    fn override_advances_like_approve_but_tags_the_task() {
        let engine = WorkflowEngine;
        let doc = three_levels();
        let requester = user("u-req");
        let plan = engine.start(&doc, request(&requester), Utc::now()).expect("start");

        let transition = engine
            .decide(&doc, &plan.approval, &plan.tasks[0], Decision::Override, &user("u-ceo"), None, Utc::now())
            .expect("override");

        assert_eq!(transition.acted_task.status, TaskStatus::Overridden);
        assert_eq!(transition.outcome, TransitionOutcome::Advanced { from_level: 1, to_level: 2 });
    }

    #[test]
    fn deciding_a_non_pending_task_is_already_actioned() {
        let engine = WorkflowEngine;
        let doc = three_levels();
        let requester = user("u-req");
        let plan = engine.start(&doc, request(&requester), Utc::now()).expect("start");
        let mut task = plan.tasks[0].clone();
        task.status = TaskStatus::Approved;

        let error = engine
            .decide(&doc, &plan.approval, &task, Decision::Approve, &user("u-a"), None, Utc::now())
            .expect_err("already actioned");
        assert_eq!(error, WorkflowError::AlreadyActioned { task_id: task.id });
    }

    #[test]
    fn missing_next_level_is_an_invalid_level_state() {
        let engine = WorkflowEngine;
        let doc = three_levels();
        let requester = user("u-req");
        let plan = engine.start(&doc, request(&requester), Utc::now()).expect("start");

        let mut shrunk = doc.clone();
        shrunk.levels.remove(1);

        let error = engine
            .decide(&shrunk, &plan.approval, &plan.tasks[0], Decision::Approve, &user("u-a"), None, Utc::now())
            .expect_err("level 2 missing");
        assert!(matches!(error, WorkflowError::InvalidLevelState { .. }));
    }

    #[test]
    fn auto_approve_levels_are_skipped_with_a_closed_task() {
        let engine = WorkflowEngine;
        let doc = document(vec![
            ApprovalDocumentLevel::auto(1),
            ApprovalDocumentLevel::new(2, vec![Principal::User(user("u-b"))]),
            ApprovalDocumentLevel::auto(3),
        ]);
        let requester = user("u-req");

        let plan = engine.start(&doc, request(&requester), Utc::now()).expect("start");
        assert_eq!(plan.outcome, TransitionOutcome::Started { level: 2 });
        assert_eq!(plan.approval.current_level, 2);
        assert_eq!(plan.tasks.len(), 2);
        assert_eq!(plan.tasks[0].status, TaskStatus::Approved);
        assert_eq!(plan.tasks[0].acted_by, None);
        assert_eq!(plan.pending_task().map(|task| task.level), Some(2));

        let pending = plan.pending_task().expect("pending task").clone();
        let transition = engine
            .decide(&doc, &plan.approval, &pending, Decision::Approve, &user("u-b"), None, Utc::now())
            .expect("approve level 2");
        assert_eq!(transition.outcome, TransitionOutcome::Approved { final_level: 3 });
        assert_eq!(transition.approval.current_level, 3);
        assert_eq!(transition.created_tasks.len(), 1);
        assert_eq!(transition.created_tasks[0].status, TaskStatus::Approved);
    }

    #[test]
    fn fully_automatic_document_completes_at_start() {
        let doc = document(vec![ApprovalDocumentLevel::auto(1), ApprovalDocumentLevel::auto(2)]);
        let requester = user("u-req");

        let plan = WorkflowEngine.start(&doc, request(&requester), Utc::now()).expect("start");
        assert_eq!(plan.outcome, TransitionOutcome::Approved { final_level: 2 });
        assert_eq!(plan.approval.status, ApprovalStatus::Approved);
        assert!(plan.pending_task().is_none());
    }
}
