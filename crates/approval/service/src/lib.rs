#![deny(unsafe_code)]

use approval_adapters::MockLedgerNetwork;
use approval_engine::{
    BroadcastNotificationSink, ConfirmInput, DispatchOutcome, EngineConfig, ExecutionDispatcher,
    FanoutNotificationSink, LedgerNetworkRegistry, Resolution, TracingNotificationSink,
    WorkflowCoordinator,
};
use approval_store::{QueryWindow, StorageConfig, StorageError};
use approval_types::{
    ActorId, ApprovalError, ApprovalRequest, ApprovalStatus, Confirmation, Disposition,
    DomainKind, NewApprovalRequest, RequestId, StatusTransition,
};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::error;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub storage: StorageConfig,
    pub engine: EngineConfig,
    /// Chains served by the local ledger network.
    pub ledger_chains: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::Memory,
            engine: EngineConfig::default(),
            ledger_chains: vec!["devnet".to_string()],
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub coordinator: Arc<WorkflowCoordinator>,
    events: Arc<BroadcastNotificationSink>,
    started_at: DateTime<Utc>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        let ServiceConfig {
            storage,
            engine,
            ledger_chains,
        } = config;
        let storage = storage.bootstrap().await?;

        let chains = ledger_chains.iter().map(String::as_str).collect::<Vec<_>>();
        let networks =
            LedgerNetworkRegistry::new().with(Arc::new(MockLedgerNetwork::new("local", &chains)));
        let dispatcher = ExecutionDispatcher::with_networks(networks, &engine);

        let events = Arc::new(BroadcastNotificationSink::default());
        let sink = FanoutNotificationSink::new()
            .with(Arc::new(TracingNotificationSink))
            .with(events.clone());
        let coordinator =
            WorkflowCoordinator::new(storage, dispatcher, engine).with_sink(Arc::new(sink));

        Ok(Self {
            coordinator: Arc::new(coordinator),
            events,
            started_at: Utc::now(),
        })
    }

    /// Status transitions published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusTransition> {
        self.events.subscribe()
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/requests", post(create_request))
        .route("/v1/requests/pending", get(list_pending))
        .route("/v1/requests/:id", get(get_request))
        .route("/v1/requests/:id/confirmations", get(list_confirmations))
        .route("/v1/requests/:id/confirm", post(confirm))
        .route("/v1/requests/:id/withdraw", post(withdraw))
        .route("/v1/requests/:id/dispatch", post(dispatch))
        .route("/v1/requests/:id/reconcile", post(reconcile))
        .route("/v1/requests/:id/resolve", post(resolve))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("engine error: {0}")]
    Engine(#[from] ApprovalError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Approval(#[from] ApprovalError),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Http { status, .. } => *status,
            Self::Approval(err) => match err {
                ApprovalError::Validation(_) => StatusCode::BAD_REQUEST,
                ApprovalError::NotDesignatedApprover { .. } | ApprovalError::NotOriginator { .. } => {
                    StatusCode::FORBIDDEN
                }
                ApprovalError::NotFound(_) => StatusCode::NOT_FOUND,
                ApprovalError::RequestNotPending { .. }
                | ApprovalError::InvalidTransition { .. }
                | ApprovalError::Conflict { .. }
                | ApprovalError::StaleExecution { .. }
                | ApprovalError::NotApproved { .. } => StatusCode::CONFLICT,
                ApprovalError::Execution(_) => StatusCode::BAD_GATEWAY,
                ApprovalError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = %status, error = %self, "Request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// A request as returned over HTTP, with its user-facing disposition.
#[derive(Debug, Clone, Serialize)]
pub struct RequestView {
    #[serde(flatten)]
    pub request: ApprovalRequest,
    pub disposition: Disposition,
}

impl From<ApprovalRequest> for RequestView {
    fn from(request: ApprovalRequest) -> Self {
        Self {
            disposition: request.disposition(),
            request,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct StatusResponse {
    request_id: RequestId,
    status: ApprovalStatus,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    storage_backend: &'static str,
    auto_dispatch: bool,
    started_at: DateTime<Utc>,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "approval-service",
        storage_backend: state.coordinator.backend_label(),
        auto_dispatch: state.coordinator.config().auto_dispatch,
        started_at: state.started_at,
    })
}

async fn create_request(
    State(state): State<ServiceState>,
    Json(request): Json<NewApprovalRequest>,
) -> Result<(StatusCode, Json<StatusResponse>), ApiError> {
    let request_id = state.coordinator.create_request(request).await?;
    let created = state.coordinator.get_status(&request_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(StatusResponse {
            request_id,
            status: created.status,
        }),
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct PendingQuery {
    domain: String,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct PendingResponse {
    domain: DomainKind,
    returned: usize,
    items: Vec<RequestView>,
}

async fn list_pending(
    State(state): State<ServiceState>,
    Query(query): Query<PendingQuery>,
) -> Result<Json<PendingResponse>, ApiError> {
    let domain = query
        .domain
        .parse::<DomainKind>()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    let window = QueryWindow::new(query.limit.unwrap_or(100).min(1000), query.offset.unwrap_or(0));

    let items = state
        .coordinator
        .list_pending(domain, window)
        .await?
        .into_iter()
        .map(RequestView::from)
        .collect::<Vec<_>>();

    Ok(Json(PendingResponse {
        domain,
        returned: items.len(),
        items,
    }))
}

async fn get_request(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<RequestView>, ApiError> {
    let request = state.coordinator.get_status(&RequestId::new(id)).await?;
    Ok(Json(request.into()))
}

#[derive(Debug, Clone, Deserialize)]
struct ConfirmationsQuery {
    history: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
struct ConfirmationsResponse {
    request_id: RequestId,
    items: Vec<Confirmation>,
}

async fn list_confirmations(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    Query(query): Query<ConfirmationsQuery>,
) -> Result<Json<ConfirmationsResponse>, ApiError> {
    let request_id = RequestId::new(id);
    let items = state
        .coordinator
        .confirmations(&request_id, query.history.unwrap_or(false))
        .await?;
    Ok(Json(ConfirmationsResponse { request_id, items }))
}

async fn confirm(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    Json(input): Json<ConfirmInput>,
) -> Result<Json<StatusResponse>, ApiError> {
    let request_id = RequestId::new(id);
    let status = state.coordinator.confirm(&request_id, input).await?;
    Ok(Json(StatusResponse { request_id, status }))
}

#[derive(Debug, Clone, Deserialize)]
struct ActorBody {
    actor_id: ActorId,
}

async fn withdraw(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    Json(body): Json<ActorBody>,
) -> Result<Json<StatusResponse>, ApiError> {
    let request_id = RequestId::new(id);
    let status = state
        .coordinator
        .withdraw(&request_id, &body.actor_id)
        .await?;
    Ok(Json(StatusResponse { request_id, status }))
}

async fn dispatch(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<DispatchOutcome>, ApiError> {
    Ok(Json(state.coordinator.dispatch(&RequestId::new(id)).await?))
}

async fn reconcile(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<RequestView>, ApiError> {
    let request = state.coordinator.reconcile(&RequestId::new(id)).await?;
    Ok(Json(request.into()))
}

#[derive(Debug, Clone, Deserialize)]
struct ResolveBody {
    actor_id: ActorId,
    #[serde(flatten)]
    resolution: Resolution,
}

async fn resolve(
    Path(id): Path<String>,
    State(state): State<ServiceState>,
    Json(body): Json<ResolveBody>,
) -> Result<Json<RequestView>, ApiError> {
    let request = state
        .coordinator
        .resolve(&RequestId::new(id), &body.actor_id, body.resolution)
        .await?;
    Ok(Json(request.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn app_with(auto_dispatch: bool) -> (ServiceState, Router) {
        let state = ServiceState::bootstrap(ServiceConfig {
            engine: EngineConfig::default().with_auto_dispatch(auto_dispatch),
            ..ServiceConfig::default()
        })
        .await
        .unwrap();
        let app = build_router(state.clone());
        (state, app)
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn redemption(required: u32, approvers: &[&str]) -> Value {
        json!({
            "domain": {
                "kind": "redemption_settlement",
                "beneficiary": "investor-42",
                "amount": "150000",
                "asset_type": "TBILL-26"
            },
            "required_approvals": required,
            "approvers": approvers,
            "created_by": "issuer-ops"
        })
    }

    async fn create(app: &Router, body: Value) -> String {
        let (status, created) = call(app, "POST", "/v1/requests", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED, "{created}");
        created["request_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn health_reports_backend() {
        let (_, app) = app_with(false).await;
        let (status, body) = call(&app, "GET", "/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["storage_backend"], "memory");
        assert_eq!(body["auto_dispatch"], false);
    }

    #[tokio::test]
    async fn redemption_flow_over_http() {
        let (state, app) = app_with(false).await;
        let mut events = state.subscribe();
        let id = create(&app, redemption(2, &["a", "b", "c"])).await;

        let (status, body) = call(
            &app,
            "POST",
            &format!("/v1/requests/{id}/confirm"),
            Some(json!({ "approver_id": "a", "decision": "approve" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "pending");

        let (_, body) = call(
            &app,
            "POST",
            &format!("/v1/requests/{id}/confirm"),
            Some(json!({ "approver_id": "b", "decision": "approve", "note": "checked wallet" })),
        )
        .await;
        assert_eq!(body["status"], "approved");

        let (status, outcome) = call(&app, "POST", &format!("/v1/requests/{id}/dispatch"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome["outcome"], "executed");
        assert!(outcome["reference"].as_str().unwrap().starts_with("stl_"));

        let (_, again) = call(&app, "POST", &format!("/v1/requests/{id}/dispatch"), None).await;
        assert_eq!(again["outcome"], "already_executed");

        let (status, view) = call(&app, "GET", &format!("/v1/requests/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["status"], "executed");
        assert_eq!(view["disposition"], "executed");
        assert_eq!(view["execution_attempts"], 1);

        let first = events.try_recv().unwrap();
        assert_eq!(first.to, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn ledger_transaction_auto_dispatches() {
        let (_, app) = app_with(true).await;
        let id = create(
            &app,
            json!({
                "domain": {
                    "kind": "ledger_transaction",
                    "destination": "0x8ba1f109551bd432803012645ac136ddd64dba72",
                    "amount": 5000000,
                    "chain_id": "devnet"
                },
                "required_approvals": 1,
                "approvers": ["a", "b"],
                "created_by": "treasury"
            }),
        )
        .await;

        let (_, body) = call(
            &app,
            "POST",
            &format!("/v1/requests/{id}/confirm"),
            Some(json!({ "approver_id": "b", "decision": "approve", "proof": [1, 2, 3] })),
        )
        .await;
        assert_eq!(body["status"], "executed");

        let (_, view) = call(&app, "GET", &format!("/v1/requests/{id}"), None).await;
        assert!(view["execution_reference"].as_str().unwrap().starts_with("0x"));
        assert_eq!(view["submission_reference"], "local-1");

        let (_, history) = call(
            &app,
            "GET",
            &format!("/v1/requests/{id}/confirmations?history=true"),
            None,
        )
        .await;
        assert_eq!(history["items"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let (_, app) = app_with(false).await;

        let (status, body) = call(&app, "POST", "/v1/requests", Some(redemption(0, &["a"]))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("required_approvals"));

        let (status, _) = call(&app, "GET", "/v1/requests/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let id = create(&app, redemption(1, &["a"])).await;
        let (status, _) = call(
            &app,
            "POST",
            &format!("/v1/requests/{id}/confirm"),
            Some(json!({ "approver_id": "mallory", "decision": "approve" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(&app, "POST", &format!("/v1/requests/{id}/dispatch"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(
            &app,
            "POST",
            &format!("/v1/requests/{id}/resolve"),
            Some(json!({ "actor_id": "ops", "resolution": "not_executed" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(&app, "GET", "/v1/requests/pending?domain=payroll", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let superseded = ApiError::from(ApprovalError::StaleExecution {
            request_id: RequestId::new("r-1"),
            attempt: 1,
            current: 2,
        });
        assert_eq!(superseded.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn withdraw_and_pending_listing() {
        let (_, app) = app_with(false).await;
        let kept = create(&app, redemption(2, &["a", "b"])).await;
        let withdrawn = create(&app, redemption(2, &["a", "b"])).await;

        let (status, _) = call(
            &app,
            "POST",
            &format!("/v1/requests/{withdrawn}/withdraw"),
            Some(json!({ "actor_id": "a" })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(
            &app,
            "POST",
            &format!("/v1/requests/{withdrawn}/withdraw"),
            Some(json!({ "actor_id": "issuer-ops" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "revoked");

        let (status, body) = call(
            &app,
            "GET",
            "/v1/requests/pending?domain=redemption_settlement",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let items = body["items"].as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["id"], kept.as_str());
        assert_eq!(items[0]["disposition"], "pending");
    }
}
