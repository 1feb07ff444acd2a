use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::identity::InstitutionId;

/// Every kind of domain object that can be put under an approval workflow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Project,
    ProjectTask,
    CalendarEvent,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [Self::Project, Self::ProjectTask, Self::CalendarEvent];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::ProjectTask => "project_task",
            Self::CalendarEvent => "calendar_event",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "project" => Some(Self::Project),
            "project_task" => Some(Self::ProjectTask),
            "calendar_event" => Some(Self::CalendarEvent),
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: EntityType, entity_id: impl Into<String>) -> Self {
        Self { entity_type, entity_id: entity_id.into() }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// Contract implemented by every governed domain object.
pub trait ApprovableEntity {
    fn entity_type(&self) -> EntityType;
    fn entity_id(&self) -> String;
    fn institution_id(&self) -> InstitutionId;

    /// Human readable label used in notifications.
    fn label(&self) -> String {
        format!("{} {}", self.entity_type(), self.entity_id())
    }

    fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_type(), self.entity_id())
    }
}

/// Detached description of a governed entity, used when the caller only
/// holds identifiers (HTTP requests, CLI fixtures).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub institution_id: InstitutionId,
    pub label: Option<String>,
}

impl ApprovableEntity for EntitySnapshot {
    fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    fn entity_id(&self) -> String {
        self.entity_id.clone()
    }

    fn institution_id(&self) -> InstitutionId {
        self.institution_id.clone()
    }

    fn label(&self) -> String {
        self.label.clone().unwrap_or_else(|| format!("{} {}", self.entity_type, self.entity_id))
    }
}
