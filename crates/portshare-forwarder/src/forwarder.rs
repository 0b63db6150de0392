//! Request forwarding over established reverse channels
//!
//! An inbound public request resolves its `public_url` through the
//! registry; only sessions in a routable state are forwarded to. Anything
//! else gets a distinct "tunnel unavailable" error rather than a silent
//! drop or an ambiguous timeout.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use portshare_broker::{
    BrokerError, ChannelError, ChannelManager, ReverseChannel, TunnelRegistry, ViewerCounter,
};
use portshare_proto::{ForwardRequest, ForwardResponse};

/// Forwarding errors
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Tunnel unavailable: {url}")]
    TunnelUnavailable { url: String },

    #[error("Viewer limit reached (cap {cap})")]
    ViewerLimitExceeded { cap: u32 },

    #[error("Forwarded request timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Reverse channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Forwarder configuration
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Per-request deadline for the round trip over the reverse channel
    pub request_timeout: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Admission ticket for one long-lived viewer connection
///
/// Returned by `open_viewer`; hand it back to `close_viewer` when the
/// viewer disconnects.
#[derive(Debug)]
pub struct ViewerTicket {
    tunnel_id: String,
}

impl ViewerTicket {
    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }
}

/// Routes public traffic onto reverse channels
pub struct Forwarder {
    registry: Arc<TunnelRegistry>,
    channels: Arc<ChannelManager>,
    viewers: Arc<ViewerCounter>,
    config: ForwarderConfig,
}

impl Forwarder {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        channels: Arc<ChannelManager>,
        viewers: Arc<ViewerCounter>,
        config: ForwarderConfig,
    ) -> Self {
        Self {
            registry,
            channels,
            viewers,
            config,
        }
    }

    /// Resolve a public URL to a routable session's tunnel id
    fn resolve(&self, public_url: &str) -> Result<String, ForwardError> {
        let unavailable = || ForwardError::TunnelUnavailable {
            url: public_url.to_string(),
        };

        let tunnel_id = self.registry.resolve_url(public_url).ok_or_else(unavailable)?;
        let session = self.registry.get(&tunnel_id).map_err(|_| unavailable())?;
        if !session.state.is_routable() {
            debug!(
                tunnel_id = %tunnel_id,
                state = %session.state,
                "Rejecting forward: session not routable"
            );
            return Err(unavailable());
        }
        Ok(tunnel_id)
    }

    /// Forward one public request to the owning session's local port
    ///
    /// The first successful forward moves a `connected` session to
    /// `active`. The in-flight guard is held for the whole round trip so
    /// teardown can drain it.
    pub async fn forward(
        &self,
        public_url: &str,
        request: ForwardRequest,
    ) -> Result<ForwardResponse, ForwardError> {
        let tunnel_id = self.resolve(public_url)?;
        let channel = self
            .channels
            .get(&tunnel_id)
            .await
            .ok_or_else(|| ForwardError::TunnelUnavailable {
                url: public_url.to_string(),
            })?;

        let _guard = self.channels.begin_forward(&tunnel_id);
        let response = tokio::time::timeout(self.config.request_timeout, channel.forward(request))
            .await
            .map_err(|_| ForwardError::Timeout {
                timeout: self.config.request_timeout,
            })??;

        // Observational only; a concurrent close may legally win the race
        let _ = self.registry.mark_active(&tunnel_id);
        Ok(response)
    }

    /// Admit a long-lived viewer connection
    ///
    /// Applies the viewer tier cap before any streaming starts; ordinary
    /// pass-through forwarding is not counted.
    pub fn open_viewer(&self, public_url: &str) -> Result<ViewerTicket, ForwardError> {
        let tunnel_id = self.resolve(public_url)?;
        match self.viewers.join(&tunnel_id) {
            Ok(_) => Ok(ViewerTicket { tunnel_id }),
            Err(BrokerError::ViewerLimitExceeded { cap }) => {
                Err(ForwardError::ViewerLimitExceeded { cap })
            }
            Err(_) => Err(ForwardError::TunnelUnavailable {
                url: public_url.to_string(),
            }),
        }
    }

    /// Release a viewer admission when the connection ends
    pub fn close_viewer(&self, ticket: ViewerTicket) {
        self.viewers.leave(&ticket.tunnel_id);
    }
}
