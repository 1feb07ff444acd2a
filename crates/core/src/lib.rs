pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod reminders;
pub mod workflow;

pub use audit::{AuditEvent, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use domain::action::WorkflowAction;
pub use domain::approval::{Approval, ApprovalId, ApprovalStatus, ChangeSet};
pub use domain::document::{
    ApprovalDocument, ApprovalDocumentId, ApprovalDocumentLevel, DocumentValidationError,
    Principal,
};
pub use domain::entity::{ApprovableEntity, EntityRef, EntitySnapshot, EntityType};
pub use domain::identity::{ApproverGroup, GroupId, InstitutionId, RoleId, UserId};
pub use domain::task::{ApprovalTask, TaskId, TaskStatus, TaskStatusCounts};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use reminders::{ReminderConfig, ReminderReport, ReminderScheduler};
pub use workflow::{ApprovalWorkflow, WorkflowContext, WorkflowError};
