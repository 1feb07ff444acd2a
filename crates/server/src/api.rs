//! JSON API over [`ApprovalWorkflow`].
//!
//! Authentication happens upstream; callers identify themselves with the
//! `x-institution-id` and `x-actor-id` headers. Every error body carries the
//! request's correlation id so it can be matched against the server log.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use ladder_core::domain::approval::Approval;
use ladder_core::domain::document::{ApprovalDocument, ApprovalDocumentId};
use ladder_core::domain::entity::{EntitySnapshot, EntityType};
use ladder_core::domain::identity::{InstitutionId, UserId};
use ladder_core::domain::task::{ApprovalTask, TaskId};
use ladder_core::workflow::{ApprovalDetail, Dashboard, PendingTask, TaskDetail};
use ladder_core::{
    ApplicationError, ApprovalId, ApprovalWorkflow, ChangeSet, InterfaceError, WorkflowAction,
    WorkflowContext, WorkflowError,
};
use ladder_db::DbPool;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::health;

pub const INSTITUTION_HEADER: &str = "x-institution-id";
pub const ACTOR_HEADER: &str = "x-actor-id";
pub const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct ApiState {
    workflow: ApprovalWorkflow,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
    pub correlation_id: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);
type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct InitiateRequest {
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default)]
    pub label: Option<String>,
    pub action: String,
    #[serde(default)]
    pub change: ChangeSet,
}

#[derive(Debug, Default, Deserialize)]
pub struct DecisionRequest {
    #[serde(default)]
    pub comment: Option<String>,
}

/// A pending task with enough of its approval to render an inbox row.
#[derive(Debug, Serialize)]
pub struct PendingTaskView {
    pub task: ApprovalTask,
    pub approval: Approval,
}

impl From<PendingTask> for PendingTaskView {
    fn from(pending: PendingTask) -> Self {
        Self { task: pending.task, approval: pending.approval }
    }
}

pub fn router(workflow: ApprovalWorkflow, db_pool: DbPool) -> Router {
    Router::new()
        .route("/api/v1/approval-documents", get(list_documents))
        .route("/api/v1/approval-documents/{id}", get(get_document))
        .route("/api/v1/approvals", post(initiate_approval))
        .route("/api/v1/approvals/{id}", get(get_approval))
        .route("/api/v1/approval-tasks", get(list_pending_tasks))
        .route("/api/v1/approval-tasks/{id}", get(get_task))
        .route("/api/v1/approval-tasks/{id}/approve", post(approve_task))
        .route("/api/v1/approval-tasks/{id}/reject", post(reject_task))
        .route("/api/v1/override/{id}", post(override_task))
        .route("/api/v1/dashboard", get(dashboard))
        .with_state(ApiState { workflow })
        .merge(health::router(db_pool))
        .layer(TraceLayer::new_for_http())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn list_documents(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<ApprovalDocument>>> {
    let ctx = caller(&headers)?;
    let documents = state.workflow.documents(&ctx).await.map_err(|e| workflow_error(e, &ctx))?;
    Ok(Json(documents))
}

pub async fn get_document(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<ApprovalDocument>> {
    let ctx = caller(&headers)?;
    let document = state
        .workflow
        .document(&ctx, &ApprovalDocumentId(id))
        .await
        .map_err(|e| workflow_error(e, &ctx))?;
    Ok(Json(document))
}

pub async fn initiate_approval(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<InitiateRequest>,
) -> ApiResult<(StatusCode, Json<Approval>)> {
    let ctx = caller(&headers)?;
    let entity_type = EntityType::parse(&request.entity_type).ok_or_else(|| {
        bad_request(format!("unknown entity type `{}`", request.entity_type), &ctx.correlation_id)
    })?;
    let action = WorkflowAction::parse(&request.action).ok_or_else(|| {
        bad_request(format!("unknown action `{}`", request.action), &ctx.correlation_id)
    })?;
    if request.entity_id.trim().is_empty() {
        return Err(bad_request("entity_id must not be empty".to_string(), &ctx.correlation_id));
    }

    let entity = EntitySnapshot {
        entity_type,
        entity_id: request.entity_id.trim().to_string(),
        institution_id: ctx.institution_id.clone(),
        label: request.label,
    };
    let approval = state
        .workflow
        .initiate(&ctx, &entity, action, request.change)
        .await
        .map_err(|e| workflow_error(e, &ctx))?;

    info!(
        event_name = "api.approval.initiated",
        correlation_id = %ctx.correlation_id,
        institution_id = %ctx.institution_id,
        approval_id = %approval.id,
        "approval initiated via api"
    );
    Ok((StatusCode::CREATED, Json(approval)))
}

pub async fn get_approval(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<ApprovalDetail>> {
    let ctx = caller(&headers)?;
    let detail = state
        .workflow
        .approval_detail(&ctx, &ApprovalId(id))
        .await
        .map_err(|e| workflow_error(e, &ctx))?;
    Ok(Json(detail))
}

pub async fn list_pending_tasks(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<PendingTaskView>>> {
    let ctx = caller(&headers)?;
    let pending =
        state.workflow.pending_work_for(&ctx).await.map_err(|e| workflow_error(e, &ctx))?;
    Ok(Json(pending.into_iter().map(PendingTaskView::from).collect()))
}

pub async fn get_task(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<TaskDetail>> {
    let ctx = caller(&headers)?;
    let detail =
        state.workflow.task_detail(&ctx, &TaskId(id)).await.map_err(|e| workflow_error(e, &ctx))?;
    Ok(Json(detail))
}

pub async fn approve_task(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Approval>> {
    let ctx = caller(&headers)?;
    let request = decision_request(&body, &ctx)?;
    let approval = state
        .workflow
        .approve(&ctx, &TaskId(id), request.comment)
        .await
        .map_err(|e| workflow_error(e, &ctx))?;
    Ok(Json(approval))
}

pub async fn reject_task(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Approval>> {
    let ctx = caller(&headers)?;
    let request = decision_request(&body, &ctx)?;
    let approval = state
        .workflow
        .reject(&ctx, &TaskId(id), request.comment)
        .await
        .map_err(|e| workflow_error(e, &ctx))?;
    Ok(Json(approval))
}

pub async fn override_task(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Approval>> {
    let ctx = caller(&headers)?;
    let request = decision_request(&body, &ctx)?;
    let approval = state
        .workflow
        .override_task(&ctx, &TaskId(id), request.comment)
        .await
        .map_err(|e| workflow_error(e, &ctx))?;
    Ok(Json(approval))
}

pub async fn dashboard(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> ApiResult<Json<Dashboard>> {
    let ctx = caller(&headers)?;
    let dashboard = state.workflow.dashboard(&ctx).await.map_err(|e| workflow_error(e, &ctx))?;
    Ok(Json(dashboard))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn caller(headers: &HeaderMap) -> ApiResult<WorkflowContext> {
    let correlation_id = header_value(headers, CORRELATION_HEADER);
    let institution_id = header_value(headers, INSTITUTION_HEADER);
    let actor_id = header_value(headers, ACTOR_HEADER);

    let (Some(institution_id), Some(actor_id)) = (institution_id, actor_id) else {
        let correlation_id = correlation_id.unwrap_or_else(|| "unassigned".to_string());
        return Err(bad_request(
            format!("`{INSTITUTION_HEADER}` and `{ACTOR_HEADER}` headers are required"),
            &correlation_id,
        ));
    };

    let institution_id = InstitutionId(institution_id);
    let actor_id = UserId(actor_id);
    Ok(match correlation_id {
        Some(correlation_id) => WorkflowContext::new(institution_id, actor_id, correlation_id),
        None => WorkflowContext::for_actor(institution_id, actor_id),
    })
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Decision bodies are optional; an empty body means "no comment".
fn decision_request(body: &Bytes, ctx: &WorkflowContext) -> ApiResult<DecisionRequest> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(DecisionRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| bad_request(format!("invalid decision body: {e}"), &ctx.correlation_id))
}

fn bad_request(message: String, correlation_id: &str) -> ApiError {
    interface_error(InterfaceError::BadRequest {
        message,
        correlation_id: correlation_id.to_string(),
    })
}

fn workflow_error(error: WorkflowError, ctx: &WorkflowContext) -> ApiError {
    interface_error(ApplicationError::from(error).into_interface(ctx.correlation_id.clone()))
}

fn interface_error(error: InterfaceError) -> ApiError {
    if matches!(error, InterfaceError::Internal { .. } | InterfaceError::ServiceUnavailable { .. })
    {
        error!(
            event_name = "api.request.failed",
            correlation_id = %error.correlation_id(),
            error = %error,
            "request failed"
        );
    }

    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = ErrorBody {
        error: ErrorDetail {
            code: error_code(&error),
            message: error.public_message().to_string(),
            correlation_id: error.correlation_id().to_string(),
        },
    };
    (status, Json(body))
}

fn error_code(error: &InterfaceError) -> &'static str {
    match error {
        InterfaceError::BadRequest { .. } => "bad_request",
        InterfaceError::Forbidden { .. } => "forbidden",
        InterfaceError::NotFound { .. } => "not_found",
        InterfaceError::Conflict { .. } => "conflict",
        InterfaceError::ServiceUnavailable { .. } => "service_unavailable",
        InterfaceError::Internal { .. } => "internal",
    }
}
