//! Multi-level approval workflows: approver resolution, the level state
//! machine, persistence ports and the orchestrating service.

pub mod context;
pub mod engine;
pub mod hooks;
pub mod memory;
pub mod notify;
pub mod resolver;
pub mod service;
pub mod store;

pub use context::WorkflowContext;
pub use engine::{
    Decision, StartRequest, TransitionOutcome, WorkflowEngine, WorkflowError, WorkflowPlan,
    WorkflowTransition, AUTO_APPROVE_COMMENT,
};
pub use hooks::{EntityHookRegistry, EntityLifecycle, HookCall, HookError, RecordingLifecycle};
pub use memory::InMemoryWorkflowStore;
pub use notify::{InMemoryNotifier, Notification, NotificationKind, Notifier, NotifyError};
pub use resolver::{
    ApproverResolver, DirectoryError, IdentityDirectory, InMemoryIdentityDirectory, Standing,
};
pub use service::{ApprovalDetail, ApprovalWorkflow, Dashboard, TaskDetail};
pub use store::{DocumentCatalog, PendingTask, StoreError, WorkflowStore};
