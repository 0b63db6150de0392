use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;
use tracing::{debug, info};

use portshare_broker::{BrokerError, CreateSessionParams, DiscoveryFilter};
use portshare_proto::ConnectionDetails;

use crate::models::*;
use crate::AppState;

const DEFAULT_DISCOVER_LIMIT: usize = 50;
const MAX_DISCOVER_LIMIT: usize = 200;

type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map a broker error to an HTTP status and stable error code
fn into_api_error(err: BrokerError) -> ApiError {
    let (status, code) = match &err {
        BrokerError::Conflict { .. } => (StatusCode::CONFLICT, "CONFLICT"),
        BrokerError::ResourceExhausted => (StatusCode::TOO_MANY_REQUESTS, "RESOURCE_EXHAUSTED"),
        BrokerError::AllocationExhausted { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "ALLOCATION_EXHAUSTED")
        }
        BrokerError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
        BrokerError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN"),
        BrokerError::ViewerLimitExceeded { .. } => {
            (StatusCode::TOO_MANY_REQUESTS, "VIEWER_LIMIT_EXCEEDED")
        }
        BrokerError::TransportTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TRANSPORT_TIMEOUT"),
        BrokerError::InvalidState { .. } => (StatusCode::CONFLICT, "INVALID_STATE"),
        BrokerError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT"),
    };

    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: Some(code.to_string()),
        }),
    )
}

/// Create a new tunnel session
#[utoipa::path(
    post,
    path = "/api/sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Session created", body = CreateSessionResponse),
        (status = 400, description = "Invalid request", body = ErrorResponse),
        (status = 409, description = "Project name already in use", body = ErrorResponse),
        (status = 429, description = "Session capacity reached", body = ErrorResponse),
        (status = 503, description = "URL allocation exhausted", body = ErrorResponse)
    ),
    tag = "sessions"
)]
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    info!(
        owner_id = %request.owner_id,
        project = %request.project_name,
        "Creating tunnel session"
    );

    let created = state
        .broker
        .create(CreateSessionParams {
            owner_id: request.owner_id,
            project_name: request.project_name,
            local_port: request.local_port,
            metadata: request.metadata,
            visibility: request.visibility,
        })
        .map_err(into_api_error)?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            tunnel_id: created.tunnel_id,
            state: created.state,
            credential: created.credential,
            public_url: created.public_url,
            connection: created.connection,
        }),
    ))
}

/// List an owner's sessions
#[utoipa::path(
    get,
    path = "/api/sessions",
    params(
        ("owner_id" = String, Query, description = "Owner account identifier")
    ),
    responses(
        (status = 200, description = "List of sessions", body = SessionList)
    ),
    tag = "sessions"
)]
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OwnerQuery>,
) -> Json<SessionList> {
    debug!(owner_id = %query.owner_id, "Listing sessions");

    let sessions = state.broker.list_by_owner(&query.owner_id);
    let total = sessions.len();
    Json(SessionList { sessions, total })
}

/// Get one session
#[utoipa::path(
    get,
    path = "/api/sessions/{id}",
    params(
        ("id" = String, Path, description = "Tunnel ID")
    ),
    responses(
        (status = 200, description = "Session summary", body = portshare_proto::SessionSummary),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    tag = "sessions"
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<portshare_proto::SessionSummary>, ApiError> {
    debug!(tunnel_id = %id, "Getting session");

    state.broker.get(&id).map(Json).map_err(into_api_error)
}

/// Close a session
#[utoipa::path(
    delete,
    path = "/api/sessions/{id}",
    params(
        ("id" = String, Path, description = "Tunnel ID"),
        ("requester_id" = String, Query, description = "Account requesting the close")
    ),
    responses(
        (status = 200, description = "Session closing", body = CloseSessionResponse),
        (status = 403, description = "Requester is not the owner", body = ErrorResponse),
        (status = 404, description = "Session not found", body = ErrorResponse)
    ),
    tag = "sessions"
)]
pub async fn close_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<CloseQuery>,
) -> Result<Json<CloseSessionResponse>, ApiError> {
    info!(tunnel_id = %id, requester = %query.requester_id, "Closing tunnel session");

    let new_state = state
        .broker
        .close(&id, &query.requester_id)
        .map_err(into_api_error)?;

    Ok(Json(CloseSessionResponse {
        tunnel_id: id,
        state: new_state,
    }))
}

/// Connection details for the owner's transport
#[utoipa::path(
    get,
    path = "/api/sessions/{id}/connection",
    params(
        ("id" = String, Path, description = "Tunnel ID")
    ),
    responses(
        (status = 200, description = "Connection details", body = ConnectionDetails),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 409, description = "Session already torn down", body = ErrorResponse)
    ),
    tag = "sessions"
)]
pub async fn connection_details(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ConnectionDetails>, ApiError> {
    debug!(tunnel_id = %id, "Getting connection details");

    state
        .broker
        .connection_details(&id)
        .map(Json)
        .map_err(into_api_error)
}

/// List public, routable sessions
#[utoipa::path(
    get,
    path = "/api/discover",
    params(
        ("category" = Option<String>, Query, description = "Filter by category"),
        ("framework" = Option<String>, Query, description = "Filter by framework"),
        ("q" = Option<String>, Query, description = "Search project names and descriptions"),
        ("limit" = Option<usize>, Query, description = "Maximum results (default: 50, max: 200)")
    ),
    responses(
        (status = 200, description = "Discoverable sessions", body = SessionList)
    ),
    tag = "discovery"
)]
pub async fn discover(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DiscoverQuery>,
) -> Json<SessionList> {
    debug!(?query, "Discovery listing");

    let mut filter = DiscoveryFilter::new();
    if let Some(category) = query.category {
        filter = filter.with_category(category);
    }
    if let Some(framework) = query.framework {
        filter = filter.with_framework(framework);
    }
    if let Some(q) = query.q {
        filter = filter.with_query(q);
    }
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DISCOVER_LIMIT)
        .min(MAX_DISCOVER_LIMIT);

    let sessions = state.broker.list_discoverable(&filter, limit);
    let total = sessions.len();
    Json(SessionList { sessions, total })
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: state.broker.active_sessions(),
    })
}
