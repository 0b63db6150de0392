use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use portshare_proto::{ConnectionDetails, ProjectMetadata, SessionState, SessionSummary, Visibility};

/// Request to create a new tunnel session
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateSessionRequest {
    /// Owning account identifier
    pub owner_id: String,
    /// Project label; becomes part of the public URL
    pub project_name: String,
    /// Local port the tunnel proxies to (1-65535)
    pub local_port: u16,
    /// Display metadata
    #[serde(default)]
    pub metadata: ProjectMetadata,
    /// Discovery visibility
    pub visibility: Visibility,
}

/// Response when creating a tunnel session
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateSessionResponse {
    /// Created tunnel identifier
    pub tunnel_id: String,
    /// Initial session state (always `pending`)
    pub state: SessionState,
    /// Ephemeral transport credential
    pub credential: String,
    /// Allocated public URL
    pub public_url: String,
    /// Transport connection details
    pub connection: ConnectionDetails,
}

/// List of session summaries
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionList {
    /// Session summaries
    pub sessions: Vec<SessionSummary>,
    /// Total count
    pub total: usize,
}

/// Response to a close request
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CloseSessionResponse {
    /// Tunnel identifier
    pub tunnel_id: String,
    /// State after the close request (`closing`, or `closed` if teardown
    /// already finished)
    pub state: SessionState,
}

/// Query parameters for listing an owner's sessions
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct OwnerQuery {
    /// Owner account identifier
    pub owner_id: String,
}

/// Query parameters for a close request
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CloseQuery {
    /// Account requesting the close; must be the session owner
    pub requester_id: String,
}

/// Query parameters for the discovery listing
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct DiscoverQuery {
    /// Filter by category (case-insensitive)
    #[serde(default)]
    pub category: Option<String>,
    /// Filter by framework (case-insensitive)
    #[serde(default)]
    pub framework: Option<String>,
    /// Substring match over project name and description
    #[serde(default)]
    pub q: Option<String>,
    /// Maximum results (default: 50, max: 200)
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Service version
    pub version: String,
    /// Sessions currently able to carry traffic
    pub active_sessions: usize,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
    /// Stable machine-readable error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}
