//! Registry state-change events
//!
//! The registry publishes one event per observable state change. Consumers
//! (the discovery index, primarily) subscribe over a broadcast channel, so a
//! closure is reflected within one delivery cycle rather than a poll delay.

use serde::{Deserialize, Serialize};

use crate::session::{CloseReason, SessionSummary};

/// A state change observed by the tunnel registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Session inserted in `pending`
    Created { summary: SessionSummary },
    /// Reverse channel bound; the session became routable
    Connected { summary: SessionSummary },
    /// First public request forwarded
    Activated { tunnel_id: String },
    /// Teardown started
    Closing {
        tunnel_id: String,
        reason: CloseReason,
    },
    /// Teardown finished; URL and credential released
    Closed { tunnel_id: String },
    /// Entry purged from the registry after the audit retention window
    Removed { tunnel_id: String },
}

impl SessionEvent {
    /// The tunnel this event concerns
    pub fn tunnel_id(&self) -> &str {
        match self {
            SessionEvent::Created { summary } | SessionEvent::Connected { summary } => {
                &summary.tunnel_id
            }
            SessionEvent::Activated { tunnel_id }
            | SessionEvent::Closing { tunnel_id, .. }
            | SessionEvent::Closed { tunnel_id }
            | SessionEvent::Removed { tunnel_id } => tunnel_id,
        }
    }
}
