use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use signoff_core::approvals::{
    is_reserved_identity, Actor, ApprovalService, NewApprovalRequest, RequestQuery, RequestView,
};
use signoff_core::domain::request::{ApprovalRequest, RequestId, RequestStatus, StepId};
use signoff_core::domain::workflow::{WorkflowDefinition, WorkflowId};
use signoff_core::errors::{ApplicationError, DomainError, InterfaceError};
use signoff_core::workflows::{WorkflowCatalog, WorkflowDraft};

pub const ACTOR_EMAIL_HEADER: &str = "x-actor-email";
pub const ACTOR_ADMIN_HEADER: &str = "x-actor-admin";
pub const TENANT_HEADER: &str = "x-tenant-id";
pub const CORRELATION_HEADER: &str = "x-correlation-id";

#[derive(Clone)]
pub struct ApiState {
    pub catalog: Arc<WorkflowCatalog>,
    pub service: Arc<ApprovalService>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/workflows", post(save_workflow).get(list_workflows))
        .route("/workflows/{id}", get(get_workflow))
        .route("/workflows/{id}/activate", post(activate_workflow))
        .route("/workflows/{id}/deactivate", post(deactivate_workflow))
        .route("/workflows/{id}/archive", post(archive_workflow))
        .route("/approval-requests", post(submit_request).get(list_requests))
        .route("/approval-requests/{id}", get(get_request))
        .route("/approval-requests/{id}/approve", post(approve))
        .route("/approval-requests/{id}/reject", post(reject))
        .route("/approval-requests/{id}/comment", post(comment))
        .route("/approval-requests/{id}/delegate", post(delegate))
        .route("/approval-requests/{id}/cancel", post(cancel))
        .route("/approval-requests/{id}/steps/{step_id}/resolve", post(re_resolve))
        .with_state(state)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub error_class: String,
    pub correlation_id: String,
}

#[derive(Debug)]
pub struct ApiError(InterfaceError);

impl ApiError {
    fn new(error: ApplicationError, correlation_id: &str) -> Self {
        Self(error.into_interface(correlation_id))
    }

    fn bad_request(message: impl Into<String>, correlation_id: &str) -> Self {
        Self::new(DomainError::Validation(message.into()).into(), correlation_id)
    }

    fn status(&self) -> StatusCode {
        match self.0 {
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::Forbidden { .. } => StatusCode::FORBIDDEN,
            InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InterfaceError::Conflict { .. } => StatusCode::CONFLICT,
            InterfaceError::Unprocessable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Storage and directory details stay in the logs.
        let error = match self.0 {
            InterfaceError::ServiceUnavailable { .. } | InterfaceError::Internal { .. } => {
                warn!(
                    event_name = "api.request.failed",
                    correlation_id = %self.0.correlation_id(),
                    error_class = self.0.error_class(),
                    error = %self.0.message(),
                    "request failed"
                );
                self.0.user_message().to_string()
            }
            _ => self.0.message().to_string(),
        };
        let body = ErrorBody {
            error,
            error_class: self.0.error_class().to_string(),
            correlation_id: self.0.correlation_id().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Caller identity and correlation id taken from the request headers.
struct Caller {
    actor: Actor,
    correlation_id: String,
}

impl Caller {
    fn from_headers(headers: &HeaderMap) -> ApiResult<Self> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };

        let correlation_id = header(CORRELATION_HEADER)
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let Some(email) = header(ACTOR_EMAIL_HEADER) else {
            return Err(ApiError::new(
                DomainError::NotAuthorized {
                    actor: "anonymous".to_string(),
                    reason: format!("missing `{ACTOR_EMAIL_HEADER}` header"),
                }
                .into(),
                &correlation_id,
            ));
        };
        if is_reserved_identity(email) {
            return Err(ApiError::new(
                DomainError::NotAuthorized {
                    actor: email.to_string(),
                    reason: "the `system` identity cannot call the API".to_string(),
                }
                .into(),
                &correlation_id,
            ));
        }
        let Some(tenant_id) = header(TENANT_HEADER) else {
            return Err(ApiError::bad_request(
                format!("missing `{TENANT_HEADER}` header"),
                &correlation_id,
            ));
        };
        let is_admin = header(ACTOR_ADMIN_HEADER)
            .is_some_and(|value| value.eq_ignore_ascii_case("true") || value == "1");

        let actor =
            if is_admin { Actor::admin(tenant_id, email) } else { Actor::user(tenant_id, email) };
        Ok(Self { actor, correlation_id })
    }

    fn fail(&self, error: ApplicationError) -> ApiError {
        ApiError::new(error, &self.correlation_id)
    }

    fn body<T>(&self, payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
        payload
            .map(|Json(body)| body)
            .map_err(|rejection| ApiError::bad_request(rejection.body_text(), &self.correlation_id))
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct WorkflowListParams {
    #[serde(default)]
    pub include_archived: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct RequestListParams {
    pub status: Option<String>,
    pub entity_type: Option<String>,
    pub approver: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DecisionBody {
    pub step_id: StepId,
    #[serde(default)]
    pub decision_notes: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CommentBody {
    pub comments: String,
    #[serde(default)]
    pub step_id: Option<StepId>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DelegateBody {
    pub step_id: StepId,
    pub to: String,
    #[serde(default)]
    pub from: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub reason: Option<String>,
}

async fn save_workflow(
    State(state): State<ApiState>,
    headers: HeaderMap,
    payload: Result<Json<WorkflowDraft>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<WorkflowDefinition>)> {
    let caller = Caller::from_headers(&headers)?;
    let draft = caller.body(payload)?;
    let created = draft.id.is_none();
    let workflow = state.catalog.save(&caller.actor, draft).await.map_err(|e| caller.fail(e))?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(workflow)))
}

async fn list_workflows(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Query<WorkflowListParams>,
) -> ApiResult<Json<Vec<WorkflowDefinition>>> {
    let caller = Caller::from_headers(&headers)?;
    let workflows = state
        .catalog
        .list(&caller.actor, params.include_archived)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(Json(workflows))
}

async fn get_workflow(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkflowDefinition>> {
    let caller = Caller::from_headers(&headers)?;
    let workflow =
        state.catalog.get(&caller.actor, &WorkflowId(id)).await.map_err(|e| caller.fail(e))?;
    Ok(Json(workflow))
}

async fn activate_workflow(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkflowDefinition>> {
    let caller = Caller::from_headers(&headers)?;
    let workflow =
        state.catalog.activate(&caller.actor, &WorkflowId(id)).await.map_err(|e| caller.fail(e))?;
    Ok(Json(workflow))
}

async fn deactivate_workflow(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkflowDefinition>> {
    let caller = Caller::from_headers(&headers)?;
    let workflow = state
        .catalog
        .deactivate(&caller.actor, &WorkflowId(id))
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(Json(workflow))
}

async fn archive_workflow(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkflowDefinition>> {
    let caller = Caller::from_headers(&headers)?;
    let workflow =
        state.catalog.archive(&caller.actor, &WorkflowId(id)).await.map_err(|e| caller.fail(e))?;
    Ok(Json(workflow))
}

async fn submit_request(
    State(state): State<ApiState>,
    headers: HeaderMap,
    payload: Result<Json<NewApprovalRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ApprovalRequest>)> {
    let caller = Caller::from_headers(&headers)?;
    let submission = caller.body(payload)?;
    let request =
        state.service.submit(&caller.actor, submission).await.map_err(|e| caller.fail(e))?;
    info!(
        event_name = "api.request.submitted",
        correlation_id = %caller.correlation_id,
        request_id = %request.id.0,
        "approval request created"
    );
    Ok((StatusCode::CREATED, Json(request)))
}

async fn list_requests(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(params): Query<RequestListParams>,
) -> ApiResult<Json<Vec<ApprovalRequest>>> {
    let caller = Caller::from_headers(&headers)?;
    let status = match params.status.as_deref().map(str::trim).filter(|raw| !raw.is_empty()) {
        Some(raw) => Some(RequestStatus::parse(raw).ok_or_else(|| {
            ApiError::bad_request(format!("unknown status `{raw}`"), &caller.correlation_id)
        })?),
        None => None,
    };
    let query = RequestQuery {
        status,
        entity_type: params.entity_type,
        approver: params.approver,
        limit: params.limit,
    };
    let requests = state.service.list(&caller.actor, query).await.map_err(|e| caller.fail(e))?;
    Ok(Json(requests))
}

async fn get_request(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<RequestView>> {
    let caller = Caller::from_headers(&headers)?;
    let view = state.service.get(&caller.actor, &RequestId(id)).await.map_err(|e| caller.fail(e))?;
    Ok(Json(view))
}

async fn approve(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    payload: Result<Json<DecisionBody>, JsonRejection>,
) -> ApiResult<Json<ApprovalRequest>> {
    let caller = Caller::from_headers(&headers)?;
    let body = caller.body(payload)?;
    let request = state
        .service
        .approve(&caller.actor, &RequestId(id), &body.step_id, body.decision_notes)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(Json(request))
}

async fn reject(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    payload: Result<Json<DecisionBody>, JsonRejection>,
) -> ApiResult<Json<ApprovalRequest>> {
    let caller = Caller::from_headers(&headers)?;
    let body = caller.body(payload)?;
    let request = state
        .service
        .reject(&caller.actor, &RequestId(id), &body.step_id, body.decision_notes)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(Json(request))
}

async fn comment(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    payload: Result<Json<CommentBody>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ApprovalRequest>)> {
    let caller = Caller::from_headers(&headers)?;
    let body = caller.body(payload)?;
    let request = state
        .service
        .comment(&caller.actor, &RequestId(id), body.step_id, body.comments)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn delegate(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    payload: Result<Json<DelegateBody>, JsonRejection>,
) -> ApiResult<Json<ApprovalRequest>> {
    let caller = Caller::from_headers(&headers)?;
    let body = caller.body(payload)?;
    let request = state
        .service
        .delegate(&caller.actor, &RequestId(id), &body.step_id, body.from, body.to)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(Json(request))
}

async fn cancel(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<ApprovalRequest>> {
    let caller = Caller::from_headers(&headers)?;
    // The body is optional for cancellation.
    let reason = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        serde_json::from_slice::<CancelBody>(&body)
            .map_err(|error| ApiError::bad_request(error.to_string(), &caller.correlation_id))?
            .reason
    };
    let request = state
        .service
        .cancel(&caller.actor, &RequestId(id), reason)
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(Json(request))
}

async fn re_resolve(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path((id, step_id)): Path<(String, String)>,
) -> ApiResult<Json<ApprovalRequest>> {
    let caller = Caller::from_headers(&headers)?;
    let request = state
        .service
        .re_resolve(&caller.actor, &RequestId(id), &StepId(step_id))
        .await
        .map_err(|e| caller.fail(e))?;
    Ok(Json(request))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::Router;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use signoff_core::approvals::{ApprovalService, InMemoryIdentityDirectory};
    use signoff_core::clock::SystemClock;
    use signoff_core::notifications::InMemoryNotificationSink;
    use signoff_core::store::InMemoryApprovalStore;
    use signoff_core::workflows::WorkflowCatalog;

    use super::{router, ApiState};

    fn app() -> Router {
        let store = Arc::new(InMemoryApprovalStore::default());
        let clock = Arc::new(SystemClock);
        let directory = InMemoryIdentityDirectory::default()
            .with_role("tenant-a", "manager", &["mgr@example.com"])
            .with_role("tenant-a", "ciso", &["ciso@example.com"]);
        let service = Arc::new(ApprovalService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(directory),
            Arc::new(InMemoryNotificationSink::default()),
            clock.clone(),
        ));
        router(ApiState { catalog: Arc::new(WorkflowCatalog::new(store, clock)), service })
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        actor: Option<(&str, bool)>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri).header("x-tenant-id", "tenant-a");
        if let Some((email, admin)) = actor {
            request = request.header("x-actor-email", email);
            if admin {
                request = request.header("x-actor-admin", "true");
            }
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .expect("request"),
            None => request.body(Body::empty()).expect("request"),
        };

        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1 << 20).await.expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("json body")
        };
        (status, value)
    }

    async fn create_workflow(app: &Router) -> String {
        let (status, workflow) = call(
            app,
            "POST",
            "/workflows",
            Some(("admin@example.com", true)),
            Some(json!({
                "name": "Policy sign-off",
                "trigger_entity_type": "policy",
                "steps": [
                    {"step_number": 1, "step_name": "Manager", "approver_type": "role", "approver_roles": ["manager"]},
                    {"step_number": 2, "step_name": "CISO", "approver_type": "role", "approver_roles": ["ciso"]}
                ]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        workflow["id"].as_str().expect("workflow id").to_string()
    }

    async fn submit(app: &Router, workflow_id: &str) -> Value {
        let (status, request) = call(
            app,
            "POST",
            "/approval-requests",
            Some(("rita@example.com", false)),
            Some(json!({
                "workflow_id": workflow_id,
                "entity_type": "policy",
                "entity_id": "POL-9",
                "request_title": "Remote access policy",
                "entity_data": {"version": 3}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        request
    }

    #[tokio::test]
    async fn full_two_step_flow_over_http() {
        let app = app();
        let workflow_id = create_workflow(&app).await;
        let request = submit(&app, &workflow_id).await;
        let id = request["id"].as_str().expect("id").to_string();
        assert_eq!(request["overall_status"], "in_progress");

        let step_one = request["steps"][0]["id"].as_str().expect("step").to_string();
        let (status, request) = call(
            &app,
            "POST",
            &format!("/approval-requests/{id}/approve"),
            Some(("mgr@example.com", false)),
            Some(json!({"step_id": step_one, "decision_notes": "fine"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let step_two = request["steps"][1]["id"].as_str().expect("step").to_string();

        let (status, pending) = call(
            &app,
            "GET",
            "/approval-requests?approver=ciso@example.com&status=in_progress",
            Some(("ciso@example.com", false)),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pending.as_array().map(Vec::len), Some(1));

        let (status, request) = call(
            &app,
            "POST",
            &format!("/approval-requests/{id}/reject"),
            Some(("ciso@example.com", false)),
            Some(json!({"step_id": step_two, "decision_notes": "add MFA section"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(request["overall_status"], "rejected");
        assert_eq!(request["final_decision_notes"], "add MFA section");

        let (status, view) =
            call(&app, "GET", &format!("/approval-requests/{id}"), Some(("rita@example.com", false)), None)
                .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["actions"].as_array().map(Vec::len), Some(2));
        assert_eq!(view["overall_status"], "rejected");
    }

    #[tokio::test]
    async fn errors_carry_class_and_correlation_id() {
        let app = app();
        let workflow_id = create_workflow(&app).await;
        let request = submit(&app, &workflow_id).await;
        let id = request["id"].as_str().expect("id").to_string();
        let step_one = request["steps"][0]["id"].as_str().expect("step").to_string();

        let (status, body) = call(
            &app,
            "POST",
            &format!("/approval-requests/{id}/approve"),
            Some(("eve@example.com", false)),
            Some(json!({"step_id": step_one})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error_class"], "not_authorized");
        assert!(body["correlation_id"].as_str().is_some_and(|id| !id.is_empty()));

        let (status, _) = call(
            &app,
            "POST",
            &format!("/approval-requests/{id}/reject"),
            Some(("mgr@example.com", false)),
            Some(json!({"step_id": step_one})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &app,
            "POST",
            &format!("/approval-requests/{id}/approve"),
            Some(("mgr@example.com", false)),
            Some(json!({"step_id": step_one})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error_class"], "conflict");

        let (status, body) =
            call(&app, "GET", "/approval-requests/REQ-missing", Some(("rita@example.com", false)), None)
                .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_class"], "not_found");

        let (status, body) = call(&app, "GET", "/workflows", None, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error_class"], "not_authorized");

        let (status, body) = call(
            &app,
            "POST",
            "/approval-requests",
            Some(("rita@example.com", false)),
            Some(json!({"workflow_id": workflow_id})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_class"], "validation");
    }

    #[tokio::test]
    async fn workflow_administration_requires_admin_header() {
        let app = app();
        let workflow_id = create_workflow(&app).await;

        let (status, _) = call(
            &app,
            "POST",
            &format!("/workflows/{workflow_id}/deactivate"),
            Some(("rita@example.com", false)),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, workflow) = call(
            &app,
            "POST",
            &format!("/workflows/{workflow_id}/archive"),
            Some(("admin@example.com", true)),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(workflow["is_active"], false);

        let (status, body) = call(
            &app,
            "POST",
            "/approval-requests",
            Some(("rita@example.com", false)),
            Some(json!({
                "workflow_id": workflow_id,
                "entity_type": "policy",
                "entity_id": "POL-10",
                "request_title": "Too late"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_class"], "validation");
    }

    #[tokio::test]
    async fn system_identity_is_refused_at_the_boundary() {
        let app = app();
        let workflow_id = create_workflow(&app).await;
        let request = submit(&app, &workflow_id).await;
        let id = request["id"].as_str().expect("id").to_string();
        let step_one = request["steps"][0]["id"].as_str().expect("step").to_string();

        let (status, body) = call(
            &app,
            "POST",
            &format!("/approval-requests/{id}/approve"),
            Some(("SYSTEM", false)),
            Some(json!({"step_id": step_one})),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error_class"], "not_authorized");

        let (status, body) = call(
            &app,
            "POST",
            &format!("/approval-requests/{id}/delegate"),
            Some(("mgr@example.com", false)),
            Some(json!({"step_id": step_one, "to": "System"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_class"], "validation");
    }

    #[tokio::test]
    async fn cancel_accepts_an_empty_body() {
        let app = app();
        let workflow_id = create_workflow(&app).await;
        let request = submit(&app, &workflow_id).await;
        let id = request["id"].as_str().expect("id").to_string();

        let (status, request) = call(
            &app,
            "POST",
            &format!("/approval-requests/{id}/cancel"),
            Some(("rita@example.com", false)),
            None,
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(request["overall_status"], "cancelled");
    }
}
