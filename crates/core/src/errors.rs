use thiserror::Error;

use crate::domain::document::DocumentValidationError;
use crate::workflow::{StoreError, WorkflowError};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    InvalidDocument(#[from] DocumentValidationError),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, correlation_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String, correlation_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Forbidden { .. } => "You are not allowed to act on this approval task.",
            Self::NotFound { .. } => "The requested resource does not exist.",
            Self::Conflict { .. } => {
                "The resource was changed by someone else. Refresh and try again."
            }
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest { .. } => 400,
            Self::Forbidden { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::Conflict { .. } => 409,
            Self::ServiceUnavailable { .. } => 503,
            Self::Internal { .. } => 500,
        }
    }

    pub fn correlation_id(&self) -> &str {
        match self {
            Self::BadRequest { correlation_id, .. }
            | Self::Forbidden { correlation_id, .. }
            | Self::NotFound { correlation_id, .. }
            | Self::Conflict { correlation_id, .. }
            | Self::ServiceUnavailable { correlation_id, .. }
            | Self::Internal { correlation_id, .. } => correlation_id,
        }
    }

    /// Detail safe to return to a caller. Internal and availability failures
    /// only ever expose the generic user message.
    pub fn public_message(&self) -> &str {
        match self {
            Self::BadRequest { message, .. }
            | Self::Forbidden { message, .. }
            | Self::NotFound { message, .. }
            | Self::Conflict { message, .. } => message,
            Self::ServiceUnavailable { .. } | Self::Internal { .. } => self.user_message(),
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Forbidden { correlation_id: id, .. }
            | InterfaceError::NotFound { correlation_id: id, .. }
            | InterfaceError::Conflict { correlation_id: id, .. }
            | InterfaceError::ServiceUnavailable { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        let message = value.to_string();
        let correlation_id = "unassigned".to_owned();
        match value {
            ApplicationError::Workflow(error) => match error {
                WorkflowError::NoDocumentConfigured { .. } => {
                    Self::BadRequest { message, correlation_id }
                }
                WorkflowError::Unauthorized { .. } => Self::Forbidden { message, correlation_id },
                WorkflowError::TaskNotFound(_)
                | WorkflowError::ApprovalNotFound(_)
                | WorkflowError::DocumentNotFound(_)
                | WorkflowError::EntityNotFound { .. } => Self::NotFound { message, correlation_id },
                WorkflowError::AlreadyActioned { .. }
                | WorkflowError::AlreadyInProgress { .. }
                | WorkflowError::Store(StoreError::TaskNotPending { .. })
                | WorkflowError::Store(StoreError::ApprovalChanged { .. })
                | WorkflowError::Store(StoreError::ActiveWorkflowExists { .. }) => {
                    Self::Conflict { message, correlation_id }
                }
                WorkflowError::Store(StoreError::Backend(_)) | WorkflowError::Directory(_) => {
                    Self::ServiceUnavailable { message, correlation_id }
                }
                WorkflowError::InvalidLevelState { .. }
                | WorkflowError::Store(StoreError::Corrupt(_)) => {
                    Self::Internal { message, correlation_id }
                }
            },
            ApplicationError::Domain(_) => Self::BadRequest { message, correlation_id },
            ApplicationError::Persistence(_) | ApplicationError::Integration(_) => {
                Self::ServiceUnavailable { message, correlation_id }
            }
            ApplicationError::Configuration(_) => Self::Internal { message, correlation_id },
        }
    }
}
