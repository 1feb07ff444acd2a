use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::approval::ApprovalId;
use crate::domain::identity::UserId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TaskId {
    pub fn generate() -> Self {
        Self(format!("TSK-{}", Uuid::new_v4().simple()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Approved,
    Rejected,
    Overridden,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Overridden => "overridden",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "overridden" => Some(Self::Overridden),
            _ => None,
        }
    }
}

/// The actionable unit at one level of one approval. Immutable once it
/// leaves `Pending`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalTask {
    pub id: TaskId,
    pub approval_id: ApprovalId,
    pub level: u32,
    pub status: TaskStatus,
    pub acted_by: Option<UserId>,
    pub acted_at: Option<DateTime<Utc>>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovalTask {
    pub fn pending(approval_id: ApprovalId, level: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::generate(),
            approval_id,
            level,
            status: TaskStatus::Pending,
            acted_by: None,
            acted_at: None,
            comment: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }
}

/// Task counts for dashboards.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusCounts {
    pub pending: u64,
    pub approved: u64,
    pub rejected: u64,
    pub overridden: u64,
}

impl TaskStatusCounts {
    pub fn add(&mut self, status: TaskStatus, count: u64) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::Approved => self.approved += count,
            TaskStatus::Rejected => self.rejected += count,
            TaskStatus::Overridden => self.overridden += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.approved + self.rejected + self.overridden
    }
}
