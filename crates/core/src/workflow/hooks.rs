use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::approval::{Approval, ApprovalId};
use crate::domain::entity::EntityType;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum HookError {
    #[error("entity hook failed: {0}")]
    Failed(String),
}

/// Lets a governed entity react to its approval lifecycle. Terminal hooks
/// run once, after the deciding transition has been committed.
#[async_trait]
pub trait EntityLifecycle: Send + Sync {
    async fn on_submitted(&self, approval: &Approval) -> Result<(), HookError> {
        let _ = approval;
        Ok(())
    }

    /// Apply the pending change to the real entity.
    async fn on_approved(&self, approval: &Approval) -> Result<(), HookError>;

    /// Discard the pending change.
    async fn on_rejected(&self, approval: &Approval) -> Result<(), HookError>;
}

#[derive(Clone, Default)]
pub struct EntityHookRegistry {
    hooks: HashMap<EntityType, Arc<dyn EntityLifecycle>>,
}

impl EntityHookRegistry {
    pub fn register(mut self, entity_type: EntityType, hook: Arc<dyn EntityLifecycle>) -> Self {
        self.hooks.insert(entity_type, hook);
        self
    }

    /// Registers the same hook for every entity type.
    pub fn register_all(mut self, hook: Arc<dyn EntityLifecycle>) -> Self {
        for entity_type in EntityType::ALL {
            self.hooks.insert(entity_type, hook.clone());
        }
        self
    }

    pub fn get(&self, entity_type: EntityType) -> Option<&Arc<dyn EntityLifecycle>> {
        self.hooks.get(&entity_type)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HookCall {
    Submitted(ApprovalId),
    Approved(ApprovalId),
    Rejected(ApprovalId),
}

/// Records every hook invocation.
#[derive(Clone, Default)]
pub struct RecordingLifecycle {
    calls: Arc<Mutex<Vec<HookCall>>>,
    fail_terminal: bool,
}

impl RecordingLifecycle {
    pub fn failing() -> Self {
        Self { calls: Arc::default(), fail_terminal: true }
    }

    pub fn calls(&self) -> Vec<HookCall> {
        match self.calls.lock() {
            Ok(calls) => calls.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, call: HookCall) {
        match self.calls.lock() {
            Ok(mut calls) => calls.push(call),
            Err(poisoned) => poisoned.into_inner().push(call),
        }
    }

    fn terminal_result(&self) -> Result<(), HookError> {
        if self.fail_terminal {
            return Err(HookError::Failed("entity store rejected the change".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EntityLifecycle for RecordingLifecycle {
    async fn on_submitted(&self, approval: &Approval) -> Result<(), HookError> {
        self.record(HookCall::Submitted(approval.id.clone()));
        Ok(())
    }

    async fn on_approved(&self, approval: &Approval) -> Result<(), HookError> {
        self.record(HookCall::Approved(approval.id.clone()));
        self.terminal_result()
    }

    async fn on_rejected(&self, approval: &Approval) -> Result<(), HookError> {
        self.record(HookCall::Rejected(approval.id.clone()));
        self.terminal_result()
    }
}
