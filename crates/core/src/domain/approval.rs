use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::action::WorkflowAction;
use crate::domain::document::ApprovalDocumentId;
use crate::domain::entity::EntityRef;
use crate::domain::identity::{InstitutionId, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalId(pub String);

impl fmt::Display for ApprovalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Explicit before/after pair for the change an approval gates. The entity
/// applies `after` once the workflow is approved.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl ChangeSet {
    pub fn new(before: Option<Value>, after: Option<Value>) -> Self {
        Self { before, after }
    }

    pub fn is_empty(&self) -> bool {
        self.before.is_none() && self.after.is_none()
    }
}

/// One workflow instance bound to one governed entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub id: ApprovalId,
    pub institution_id: InstitutionId,
    pub document_id: ApprovalDocumentId,
    pub entity: EntityRef,
    pub entity_label: String,
    pub action: WorkflowAction,
    pub status: ApprovalStatus,
    /// 1-based; frozen at the terminating level once status leaves pending.
    pub current_level: u32,
    pub requested_by: UserId,
    pub change: ChangeSet,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Approval {
    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::{ApprovalStatus, ChangeSet};

    #[test]
    fn approval_status_round_trips_from_storage_encoding() {
        for status in [ApprovalStatus::Pending, ApprovalStatus::Approved, ApprovalStatus::Rejected] {
            assert_eq!(ApprovalStatus::parse(status.as_str()), Some(status));
        }
        assert!(!ApprovalStatus::Pending.is_terminal());
        assert!(ApprovalStatus::Rejected.is_terminal());
    }

    #[test]
    fn empty_change_set_has_no_sides() {
        assert!(ChangeSet::default().is_empty());
        assert!(!ChangeSet::new(None, Some(serde_json::json!({"name": "Apollo"}))).is_empty());
    }
}
