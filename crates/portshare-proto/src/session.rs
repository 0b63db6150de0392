//! Tunnel session entity and state machine
//!
//! A `TunnelSession` is one instance of exposing a local port publicly. The
//! state machine is strictly monotonic: once a session has entered `closing`
//! no earlier state is ever revisited.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

/// Lifecycle state of a tunnel session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Created, waiting for the owner's transport to establish the reverse channel
    Pending,
    /// Reverse channel established, no public traffic forwarded yet
    Connected,
    /// At least one public request has been forwarded
    Active,
    /// Teardown in progress: draining connections, releasing URL and credential
    Closing,
    /// Terminal; retained briefly for audit reads, then purged
    Closed,
}

impl SessionState {
    /// Whether inbound public traffic may be forwarded in this state
    pub fn is_routable(&self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Active)
    }

    /// Whether this state is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed)
    }

    /// Whether a transport credential is valid in this state
    pub fn credential_valid(&self) -> bool {
        matches!(
            self,
            SessionState::Pending | SessionState::Connected | SessionState::Active
        )
    }

    /// Check whether a direct transition to `next` is legal
    ///
    /// Legal transitions:
    /// - `pending -> connected`
    /// - `connected -> active`
    /// - `pending | connected | active -> closing`
    /// - `closing -> closed`
    pub fn can_transition(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Pending, Connected)
                | (Connected, Active)
                | (Pending, Closing)
                | (Connected, Closing)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Pending => write!(f, "pending"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(SessionState::Pending),
            "connected" => Ok(SessionState::Connected),
            "active" => Ok(SessionState::Active),
            "closing" => Ok(SessionState::Closing),
            "closed" => Ok(SessionState::Closed),
            _ => Err(format!("Unknown session state: {}", s)),
        }
    }
}

/// Session visibility, gating inclusion in the public discovery listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Listed in discovery while routable
    Public,
    /// Reachable by URL only, never listed
    Private,
}

/// Why a session entered `closing`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Explicit close request from the owner
    Requested,
    /// Maximum session duration reached
    Expired,
    /// Transport never connected within the connect timeout
    ConnectTimeout,
    /// Transport disconnected and the reconnect grace window lapsed
    DisconnectGrace,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Requested => write!(f, "requested"),
            CloseReason::Expired => write!(f, "expired"),
            CloseReason::ConnectTimeout => write!(f, "connect_timeout"),
            CloseReason::DisconnectGrace => write!(f, "disconnect_grace"),
        }
    }
}

/// Display-only descriptive fields for a session
///
/// Closed set of named optional fields; none of them carry invariants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct ProjectMetadata {
    /// Framework the project is built with (e.g. "axum", "next.js")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    /// Primary implementation language
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Category used for discovery filtering (e.g. "game", "tool")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Free-form description shown in listings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ProjectMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_framework(mut self, framework: impl Into<String>) -> Self {
        self.framework = Some(framework.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Live viewer accounting for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct SessionStats {
    /// Current concurrent public viewers; never exceeds `viewer_tier_cap`
    pub viewers_count: u32,
    /// Maximum concurrent viewers admitted for this session's tier
    pub viewer_tier_cap: u32,
}

impl SessionStats {
    pub fn new(viewer_tier_cap: u32) -> Self {
        Self {
            viewers_count: 0,
            viewer_tier_cap,
        }
    }
}

/// A tunnel session: one instance of exposing a local port publicly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelSession {
    /// Opaque unique identifier, immutable after creation
    pub tunnel_id: String,
    /// Owning account (opaque reference, not managed here)
    pub owner_id: String,
    /// Human-chosen label, unique per owner among non-closed sessions
    pub project_name: String,
    /// Port on the owner's machine the session proxies to
    pub local_port: u16,
    /// Display-only descriptive fields
    pub metadata: ProjectMetadata,
    /// Discovery gating
    pub visibility: Visibility,
    /// Ephemeral transport credential; `Some` iff the state is non-terminal
    /// and not `closing`
    pub credential: Option<String>,
    /// Allocated public URL, unique among non-closed sessions
    pub public_url: String,
    /// Lifecycle state
    pub state: SessionState,
    /// Creation timestamp
    pub started_at: DateTime<Utc>,
    /// Hard ceiling: `started_at + max_duration`, never extended
    pub expires_at: DateTime<Utc>,
    /// Viewer accounting
    pub stats: SessionStats,
    /// Set while the transport is disconnected inside the grace window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,
    /// Why the session entered `closing` (set on that transition)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<CloseReason>,
    /// When the session reached `closed`; drives audit-retention purging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl TunnelSession {
    /// Whether the hard duration ceiling has been reached
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Build the summary view exposed by listings and discovery
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            tunnel_id: self.tunnel_id.clone(),
            owner_id: self.owner_id.clone(),
            project_name: self.project_name.clone(),
            public_url: self.public_url.clone(),
            state: self.state,
            visibility: self.visibility,
            metadata: self.metadata.clone(),
            started_at: self.started_at,
            expires_at: self.expires_at,
            stats: self.stats,
        }
    }
}

/// Summary view of a session, safe to hand to listings (no credential)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct SessionSummary {
    /// Tunnel identifier
    pub tunnel_id: String,
    /// Owning account
    pub owner_id: String,
    /// Project label
    pub project_name: String,
    /// Public URL
    pub public_url: String,
    /// Lifecycle state
    pub state: SessionState,
    /// Discovery gating
    pub visibility: Visibility,
    /// Display metadata
    pub metadata: ProjectMetadata,
    /// Creation timestamp
    pub started_at: DateTime<Utc>,
    /// Expiry ceiling
    pub expires_at: DateTime<Utc>,
    /// Viewer accounting
    pub stats: SessionStats,
}
