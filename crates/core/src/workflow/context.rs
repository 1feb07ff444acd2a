use uuid::Uuid;

use crate::domain::identity::{InstitutionId, UserId};

/// Caller identity for one engine call. Passed explicitly on every
/// operation; the engine never looks up request state on its own.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkflowContext {
    pub institution_id: InstitutionId,
    pub actor_id: UserId,
    pub correlation_id: String,
}

impl WorkflowContext {
    pub fn new(
        institution_id: InstitutionId,
        actor_id: UserId,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self { institution_id, actor_id, correlation_id: correlation_id.into() }
    }

    /// Context with a freshly generated correlation id.
    pub fn for_actor(institution_id: InstitutionId, actor_id: UserId) -> Self {
        Self::new(institution_id, actor_id, format!("req-{}", Uuid::new_v4().simple()))
    }
}
