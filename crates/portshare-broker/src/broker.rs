//! Tunnel broker facade
//!
//! Wires the credential issuer, URL allocator, registry, discovery index,
//! channel manager, and lifecycle supervisor into the control-plane API the
//! gateway layer consumes. Session creation either fully succeeds or fully
//! fails: a credential or URL reserved for a create that later fails is
//! rolled back before the error is returned.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use portshare_auth::CredentialIssuer;
use portshare_proto::{
    CloseReason, ConnectionDetails, ProjectMetadata, SessionState, SessionStats,
    SessionSummary, TransportEndpoint, TunnelSession, Visibility,
};
use portshare_router::UrlAllocator;

use crate::channel::{ChannelManager, ReverseChannel};
use crate::discovery::{DiscoveryFilter, DiscoveryIndex};
use crate::error::BrokerError;
use crate::registry::TunnelRegistry;
use crate::supervisor::{chrono_dur, LifecycleSupervisor, SupervisorConfig};
use crate::viewers::ViewerCounter;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Hard session duration ceiling; `expires_at` is never extended
    pub max_duration: Duration,
    /// Concurrent viewer cap stamped on new sessions
    pub viewer_tier_cap: u32,
    /// Where owners' transports connect
    pub transport_endpoint: TransportEndpoint,
    /// Lifecycle supervisor timing
    pub supervisor: SupervisorConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(8 * 60 * 60),
            viewer_tier_cap: 10,
            transport_endpoint: TransportEndpoint::new("relay.portshare.dev", 443, "websocket"),
            supervisor: SupervisorConfig::default(),
        }
    }
}

/// A session creation request
#[derive(Debug, Clone)]
pub struct CreateSessionParams {
    pub owner_id: String,
    pub project_name: String,
    pub local_port: u16,
    pub metadata: ProjectMetadata,
    pub visibility: Visibility,
}

/// Everything returned from a successful create
#[derive(Debug, Clone)]
pub struct CreatedSession {
    pub tunnel_id: String,
    pub state: SessionState,
    pub credential: String,
    pub public_url: String,
    pub connection: ConnectionDetails,
}

/// The session control plane
pub struct TunnelBroker {
    registry: Arc<TunnelRegistry>,
    issuer: Arc<CredentialIssuer>,
    allocator: Arc<UrlAllocator>,
    channels: Arc<ChannelManager>,
    discovery: Arc<DiscoveryIndex>,
    viewers: Arc<ViewerCounter>,
    supervisor: Arc<LifecycleSupervisor>,
    config: BrokerConfig,
}

impl TunnelBroker {
    pub fn new(
        issuer: Arc<CredentialIssuer>,
        allocator: Arc<UrlAllocator>,
        config: BrokerConfig,
    ) -> Self {
        let registry = Arc::new(TunnelRegistry::new());
        let channels = Arc::new(ChannelManager::new());
        let discovery = Arc::new(DiscoveryIndex::new());
        let viewers = Arc::new(ViewerCounter::new(registry.clone()));
        let supervisor = Arc::new(LifecycleSupervisor::new(
            registry.clone(),
            issuer.clone(),
            allocator.clone(),
            channels.clone(),
            config.supervisor.clone(),
        ));

        Self {
            registry,
            issuer,
            allocator,
            channels,
            discovery,
            viewers,
            supervisor,
            config,
        }
    }

    /// Spawn the background tasks: discovery refresh and the sweep loop
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.discovery.spawn_refresh(self.registry.subscribe()),
            self.supervisor.clone().spawn(),
        ]
    }

    pub fn registry(&self) -> Arc<TunnelRegistry> {
        self.registry.clone()
    }

    pub fn channels(&self) -> Arc<ChannelManager> {
        self.channels.clone()
    }

    pub fn viewers(&self) -> Arc<ViewerCounter> {
        self.viewers.clone()
    }

    /// Create a new tunnel session in `pending`
    ///
    /// Credential issuance (which enforces the concurrency caps) happens
    /// before any registry state exists; URL allocation and registry
    /// insertion are atomic as a unit via rollback.
    pub fn create(&self, params: CreateSessionParams) -> Result<CreatedSession, BrokerError> {
        if params.local_port == 0 {
            return Err(BrokerError::InvalidArgument(
                "local_port must be between 1 and 65535".to_string(),
            ));
        }
        self.allocator.validate_project_name(&params.project_name)?;

        let tunnel_id = Uuid::new_v4().to_string();
        let credential = self.issuer.issue(&tunnel_id, &params.owner_id)?;

        let public_url = match self
            .allocator
            .allocate(&params.owner_id, &params.project_name)
        {
            Ok(url) => url,
            Err(err) => {
                self.issuer.revoke(&tunnel_id);
                return Err(err.into());
            }
        };

        let now = Utc::now();
        let session = TunnelSession {
            tunnel_id: tunnel_id.clone(),
            owner_id: params.owner_id,
            project_name: params.project_name,
            local_port: params.local_port,
            metadata: params.metadata,
            visibility: params.visibility,
            credential: Some(credential.clone()),
            public_url: public_url.clone(),
            state: SessionState::Pending,
            started_at: now,
            expires_at: now + chrono_dur(self.config.max_duration),
            stats: SessionStats::new(self.config.viewer_tier_cap),
            disconnected_at: None,
            close_reason: None,
            closed_at: None,
        };

        if let Err(err) = self.registry.create(session) {
            // No leaked reservations on a failed create
            self.allocator.release(&public_url);
            self.issuer.revoke(&tunnel_id);
            return Err(err);
        }

        Ok(CreatedSession {
            tunnel_id,
            state: SessionState::Pending,
            credential: credential.clone(),
            public_url,
            connection: ConnectionDetails {
                endpoint: self.config.transport_endpoint.clone(),
                credential,
                local_port: params.local_port,
            },
        })
    }

    /// Close a session on the owner's request
    ///
    /// Idempotent: closing an already-closing or closed session returns the
    /// current state. Teardown (drain, URL release, credential revocation)
    /// continues asynchronously.
    pub fn close(&self, tunnel_id: &str, requester_id: &str) -> Result<SessionState, BrokerError> {
        let session = self.registry.get(tunnel_id)?;
        if session.owner_id != requester_id {
            return Err(BrokerError::Forbidden);
        }

        let state = self.registry.begin_close(tunnel_id, CloseReason::Requested)?;
        if state == SessionState::Closing {
            let supervisor = self.supervisor.clone();
            let tunnel_id = tunnel_id.to_string();
            tokio::spawn(async move {
                supervisor.finalize(&tunnel_id).await;
            });
        }
        Ok(state)
    }

    /// Connection details for the owner's transport
    ///
    /// Unavailable once the credential has been invalidated by teardown.
    pub fn connection_details(&self, tunnel_id: &str) -> Result<ConnectionDetails, BrokerError> {
        let session = self.registry.get(tunnel_id)?;
        match session.credential {
            Some(credential) => Ok(ConnectionDetails {
                endpoint: self.config.transport_endpoint.clone(),
                credential,
                local_port: session.local_port,
            }),
            None => Err(BrokerError::InvalidState {
                state: session.state,
            }),
        }
    }

    /// Bind an established reverse channel to its session
    ///
    /// Called by the transport layer once the owner's machine has
    /// connected and presented its credential. A reconnect inside the
    /// disconnect grace window resumes the session, replacing the stale
    /// channel.
    pub async fn transport_connected(
        &self,
        tunnel_id: &str,
        credential: &str,
        channel: Arc<dyn ReverseChannel>,
    ) -> Result<SessionState, BrokerError> {
        self.issuer.validate(tunnel_id, credential)?;
        let state = self.registry.mark_connected(tunnel_id)?;
        if let Some(stale) = self.channels.register(tunnel_id, channel).await {
            stale.shutdown().await;
        }
        info!(tunnel_id = %tunnel_id, state = %state, "Transport bound to session");
        Ok(state)
    }

    /// Record an asynchronous transport disconnect
    ///
    /// Starts the grace window; the supervisor force-closes the session if
    /// the transport does not return in time.
    pub fn transport_disconnected(&self, tunnel_id: &str) -> Result<(), BrokerError> {
        self.registry.mark_disconnected(tunnel_id, Utc::now())
    }

    /// Summary of one session
    pub fn get(&self, tunnel_id: &str) -> Result<SessionSummary, BrokerError> {
        Ok(self.registry.get(tunnel_id)?.summary())
    }

    /// Summaries of one owner's sessions
    pub fn list_by_owner(&self, owner_id: &str) -> Vec<SessionSummary> {
        self.registry.list_by_owner(owner_id)
    }

    /// Public, routable sessions from the discovery index
    pub fn list_discoverable(&self, filter: &DiscoveryFilter, limit: usize) -> Vec<SessionSummary> {
        self.discovery.list(filter, limit)
    }

    /// Sessions currently able to carry traffic
    pub fn active_sessions(&self) -> usize {
        self.registry.count_routable()
    }
}
