use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::entity::EntityType;
use crate::domain::identity::{GroupId, InstitutionId, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApprovalDocumentId(pub String);

impl fmt::Display for ApprovalDocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A user or group named on a level's approver or overrider list.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Principal {
    User(UserId),
    Group(GroupId),
}

impl Principal {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Group(_) => "group",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::User(UserId(id)) | Self::Group(GroupId(id)) => id,
        }
    }

    pub fn from_parts(kind: &str, id: impl Into<String>) -> Option<Self> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User(UserId(id.into()))),
            "group" => Some(Self::Group(GroupId(id.into()))),
            _ => None,
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDocumentLevel {
    pub level: u32,
    pub name: Option<String>,
    pub approvers: Vec<Principal>,
    /// Privileged bypass of this level's normal approver requirement.
    pub overriders: Vec<Principal>,
    pub auto_approve: bool,
}

impl ApprovalDocumentLevel {
    pub fn new(level: u32, approvers: Vec<Principal>) -> Self {
        Self { level, name: None, approvers, overriders: Vec::new(), auto_approve: false }
    }

    pub fn auto(level: u32) -> Self {
        Self { level, name: None, approvers: Vec::new(), overriders: Vec::new(), auto_approve: true }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_overriders(mut self, overriders: Vec<Principal>) -> Self {
        self.overriders = overriders;
        self
    }
}

/// Per-institution, per-entity-type chain of approval levels.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDocument {
    pub id: ApprovalDocumentId,
    pub institution_id: InstitutionId,
    pub entity_type: EntityType,
    pub name: String,
    pub levels: Vec<ApprovalDocumentLevel>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DocumentValidationError {
    #[error("approval document `{document_id}` has no levels")]
    NoLevels { document_id: String },
    #[error("approval document `{document_id}` expected level {expected} but found level {found}")]
    NonContiguousLevels { document_id: String, expected: u32, found: u32 },
    #[error("level {level} of approval document `{document_id}` has no approvers and is not auto-approve")]
    LevelWithoutApprovers { document_id: String, level: u32 },
    #[error("level {level} of approval document `{document_id}` lists `{principal}` as both approver and overrider")]
    OverriderAlsoApprover { document_id: String, level: u32, principal: String },
}

impl ApprovalDocument {
    pub fn level(&self, level: u32) -> Option<&ApprovalDocumentLevel> {
        self.levels.iter().find(|candidate| candidate.level == level)
    }

    pub fn level_count(&self) -> u32 {
        self.levels.iter().map(|level| level.level).max().unwrap_or(0)
    }

    pub fn is_final_level(&self, level: u32) -> bool {
        level == self.level_count()
    }

    pub fn validate(&self) -> Result<(), DocumentValidationError> {
        let document_id = self.id.0.clone();
        if self.levels.is_empty() {
            return Err(DocumentValidationError::NoLevels { document_id });
        }

        for (index, level) in self.levels.iter().enumerate() {
            let expected = index as u32 + 1;
            if level.level != expected {
                return Err(DocumentValidationError::NonContiguousLevels {
                    document_id,
                    expected,
                    found: level.level,
                });
            }

            if level.approvers.is_empty() && !level.auto_approve {
                return Err(DocumentValidationError::LevelWithoutApprovers {
                    document_id,
                    level: level.level,
                });
            }

            let approvers: HashSet<&Principal> = level.approvers.iter().collect();
            if let Some(shared) = level.overriders.iter().find(|p| approvers.contains(p)) {
                return Err(DocumentValidationError::OverriderAlsoApprover {
                    document_id,
                    level: level.level,
                    principal: shared.to_string(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{
        ApprovalDocument, ApprovalDocumentId, ApprovalDocumentLevel, DocumentValidationError,
        Principal,
    };
    use crate::domain::entity::EntityType;
    use crate::domain::identity::{GroupId, InstitutionId, UserId};

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

    fn user(id: &str) -> Principal {
        Principal::User(UserId(id.to_string()))
    }

    #[test]
    fn accepts_contiguous_levels_with_approvers_or_auto_approve() {
        let doc = document(vec![
            ApprovalDocumentLevel::new(1, vec![user("u-lead")]),
            ApprovalDocumentLevel::auto(2),
            ApprovalDocumentLevel::new(3, vec![Principal::Group(GroupId("g-hr".to_string()))])
                .with_overriders(vec![user("u-ceo")]),
        ]);

        assert_eq!(doc.validate(), Ok(()));
        assert_eq!(doc.level_count(), 3);
        assert!(doc.is_final_level(3));
        assert!(!doc.is_final_level(2));
    }

    #[test]
    fn rejects_document_without_levels() {
        assert!(matches!(document(Vec::new()).validate(), Err(DocumentValidationError::NoLevels { .. })));
    }

    #[test]
    fn rejects_gap_in_level_numbers() {
        let doc = document(vec![
            ApprovalDocumentLevel::new(1, vec![user("u-a")]),
            ApprovalDocumentLevel::new(3, vec![user("u-b")]),
        ]);

        assert_eq!(
            doc.validate(),
            Err(DocumentValidationError::NonContiguousLevels {
                document_id: "DOC-1".to_string(),
                expected: 2,
                found: 3,
            })
        );
    }

    #[test]
    fn rejects_level_numbering_that_does_not_start_at_one() {
        let doc = document(vec![ApprovalDocumentLevel::new(0, vec![user("u-a")])]);
        assert!(matches!(
            doc.validate(),
            Err(DocumentValidationError::NonContiguousLevels { expected: 1, found: 0, .. })
        ));
    }

    #[test]
    fn rejects_level_without_approvers_unless_auto_approve() {
        let doc = document(vec![ApprovalDocumentLevel::new(1, Vec::new())]);
        assert_eq!(
            doc.validate(),
            Err(DocumentValidationError::LevelWithoutApprovers {
                document_id: "DOC-1".to_string(),
                level: 1,
            })
        );
    }

    #[test]
    fn rejects_overrider_that_duplicates_an_approver() {
        let doc = document(vec![
            ApprovalDocumentLevel::new(1, vec![user("u-a")]).with_overriders(vec![user("u-a")])
        ]);

        assert_eq!(
            doc.validate(),
            Err(DocumentValidationError::OverriderAlsoApprover {
                document_id: "DOC-1".to_string(),
                level: 1,
                principal: "user:u-a".to_string(),
            })
        );
    }

    #[test]
    fn principal_parts_round_trip() {
        let group = Principal::Group(GroupId("g-1".to_string()));
        assert_eq!(Principal::from_parts(group.kind(), group.id()), Some(group));
        assert_eq!(Principal::from_parts("role", "r-1"), None);
    }
}
