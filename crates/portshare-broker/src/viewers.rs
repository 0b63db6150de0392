//! Concurrent viewer admission
//!
//! Counts long-lived public viewer connections per tunnel against the
//! session's tier cap. Increment and decrement run under the same per-entry
//! lock as state transitions, so the count can never race a concurrent
//! close or another join.

use std::sync::Arc;
use tracing::{debug, warn};

use portshare_proto::SessionState;

use crate::error::BrokerError;
use crate::registry::TunnelRegistry;

/// Admission control for viewer connections
pub struct ViewerCounter {
    registry: Arc<TunnelRegistry>,
}

impl ViewerCounter {
    pub fn new(registry: Arc<TunnelRegistry>) -> Self {
        Self { registry }
    }

    /// Admit one viewer
    ///
    /// Rejected with `ViewerLimitExceeded` once the count has reached the
    /// tier cap, and with `InvalidState` when the session cannot serve
    /// viewers. Returns the new count on success.
    pub fn join(&self, tunnel_id: &str) -> Result<u32, BrokerError> {
        let entry = self.registry.session_handle(tunnel_id)?;
        let mut session = entry.lock().unwrap();

        if !session.state.is_routable() {
            return Err(BrokerError::InvalidState {
                state: session.state,
            });
        }

        if session.stats.viewers_count >= session.stats.viewer_tier_cap {
            debug!(
                tunnel_id = %tunnel_id,
                cap = session.stats.viewer_tier_cap,
                "Viewer rejected: tier cap reached"
            );
            return Err(BrokerError::ViewerLimitExceeded {
                cap: session.stats.viewer_tier_cap,
            });
        }

        session.stats.viewers_count += 1;
        Ok(session.stats.viewers_count)
    }

    /// Release one viewer slot
    ///
    /// Idempotent: a leave without a matching join clamps at zero and is
    /// logged as an anomaly, never surfaced to the caller. A leave on an
    /// unknown or already-closed session is likewise ignored; the closing
    /// path resets the count itself.
    pub fn leave(&self, tunnel_id: &str) -> u32 {
        let entry = match self.registry.session_handle(tunnel_id) {
            Ok(entry) => entry,
            Err(_) => {
                debug!(tunnel_id = %tunnel_id, "Viewer leave for unknown tunnel, ignoring");
                return 0;
            }
        };

        let mut session = entry.lock().unwrap();
        if session.stats.viewers_count == 0 {
            if session.state != SessionState::Closed {
                warn!(
                    tunnel_id = %tunnel_id,
                    "Viewer leave without matching join, clamping at zero"
                );
            }
            return 0;
        }

        session.stats.viewers_count -= 1;
        session.stats.viewers_count
    }

    /// Current count for a tunnel
    pub fn count(&self, tunnel_id: &str) -> Result<u32, BrokerError> {
        Ok(self.registry.get(tunnel_id)?.stats.viewers_count)
    }
}
