//! Lifecycle supervisor
//!
//! Periodic sweeper enforcing the hard session lifecycle: connect timeouts,
//! the maximum session duration, disconnect grace windows, drain-bounded
//! teardown, and purging of closed entries after the audit retention
//! window. Every check-then-transition runs atomically per session, so a
//! sweep can never act on a session that a concurrent close already moved.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use portshare_auth::CredentialIssuer;
use portshare_proto::{CloseReason, SessionState};
use portshare_router::UrlAllocator;

use crate::channel::{ChannelManager, ReverseChannel};
use crate::registry::TunnelRegistry;

/// Supervisor timing configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Period between sweeps
    pub sweep_interval: Duration,
    /// How long a session may sit in `pending` before it fails to `closing`
    pub connect_timeout: Duration,
    /// How long a disconnected transport is tolerated before force-close
    pub grace_window: Duration,
    /// How long teardown waits for in-flight forwards to finish
    pub drain_timeout: Duration,
    /// Poll period while draining
    pub drain_poll_interval: Duration,
    /// How long `closed` sessions stay readable before being purged
    pub closed_retention: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            grace_window: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
            drain_poll_interval: Duration::from_millis(100),
            closed_retention: Duration::from_secs(300),
        }
    }
}

pub(crate) fn chrono_dur(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Enforces session lifecycle limits and drives teardown
pub struct LifecycleSupervisor {
    registry: Arc<TunnelRegistry>,
    issuer: Arc<CredentialIssuer>,
    allocator: Arc<UrlAllocator>,
    channels: Arc<ChannelManager>,
    config: SupervisorConfig,
    /// Tunnels currently being finalized, so an explicit close and a sweep
    /// never tear the same session down twice
    finalizing: DashMap<String, ()>,
}

impl LifecycleSupervisor {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        issuer: Arc<CredentialIssuer>,
        allocator: Arc<UrlAllocator>,
        channels: Arc<ChannelManager>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            registry,
            issuer,
            allocator,
            channels,
            config,
            finalizing: DashMap::new(),
        }
    }

    /// Spawn the periodic sweep loop
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        info!(
            interval_secs = self.config.sweep_interval.as_secs(),
            "Starting lifecycle supervisor"
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.sweep().await;
            }
        })
    }

    /// One sweep over a snapshot of session ids
    pub async fn sweep(&self) {
        let now = Utc::now();
        for tunnel_id in self.registry.list_ids() {
            self.sweep_session(&tunnel_id, now).await;
        }
    }

    async fn sweep_session(&self, tunnel_id: &str, now: DateTime<Utc>) {
        let connect_timeout = chrono_dur(self.config.connect_timeout);
        let grace_window = chrono_dur(self.config.grace_window);
        let retention = chrono_dur(self.config.closed_retention);

        // Each close check runs atomically under the session's entry lock;
        // a NotFound just means the session was purged since the snapshot.
        let _ = self
            .registry
            .begin_close_if(tunnel_id, CloseReason::Expired, |s| s.is_expired(now));
        let _ = self
            .registry
            .begin_close_if(tunnel_id, CloseReason::ConnectTimeout, |s| {
                s.state == SessionState::Pending && now - s.started_at >= connect_timeout
            });
        let _ = self
            .registry
            .begin_close_if(tunnel_id, CloseReason::DisconnectGrace, |s| {
                s.disconnected_at
                    .is_some_and(|since| now - since >= grace_window)
            });

        let session = match self.registry.get(tunnel_id) {
            Ok(session) => session,
            Err(_) => return,
        };

        match session.state {
            SessionState::Closing => self.finalize(tunnel_id).await,
            SessionState::Closed => {
                let purgeable = session
                    .closed_at
                    .is_some_and(|closed| now - closed >= retention);
                if purgeable {
                    let _ = self.registry.remove(tunnel_id);
                }
            }
            _ => {}
        }
    }

    /// Drive a `closing` session to `closed`
    ///
    /// Drains in-flight forwards up to the drain timeout, then forcibly
    /// terminates the channel, revokes the credential, and releases the
    /// URL. Safe to call concurrently; only one finalizer runs per tunnel.
    pub async fn finalize(&self, tunnel_id: &str) {
        if self.finalizing.insert(tunnel_id.to_string(), ()).is_some() {
            return;
        }
        self.finalize_inner(tunnel_id).await;
        self.finalizing.remove(tunnel_id);
    }

    async fn finalize_inner(&self, tunnel_id: &str) {
        let session = match self.registry.get(tunnel_id) {
            Ok(session) => session,
            Err(_) => return,
        };
        if session.state != SessionState::Closing {
            return;
        }

        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        while self.channels.inflight_count(tunnel_id) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(self.config.drain_poll_interval).await;
        }

        let remaining = self.channels.inflight_count(tunnel_id);
        if remaining > 0 {
            warn!(
                tunnel_id = %tunnel_id,
                remaining,
                "Drain timeout lapsed, forcibly terminating in-flight connections"
            );
        }

        if let Some(channel) = self.channels.unregister(tunnel_id).await {
            channel.shutdown().await;
        }
        self.issuer.revoke(tunnel_id);
        self.allocator.release(&session.public_url);

        if let Err(err) = self.registry.finalize_close(tunnel_id, Utc::now()) {
            debug!(tunnel_id = %tunnel_id, error = %err, "Session already finalized");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use portshare_auth::IssuerConfig;
    use portshare_proto::{
        ForwardRequest, ForwardResponse, ProjectMetadata, SessionStats, TunnelSession,
        Visibility,
    };
    use portshare_router::AllocatorConfig;

    use crate::channel::{ChannelError, ReverseChannel};

    struct NullChannel;

    #[async_trait]
    impl ReverseChannel for NullChannel {
        async fn forward(
            &self,
            _request: ForwardRequest,
        ) -> Result<ForwardResponse, ChannelError> {
            Err(ChannelError::Closed)
        }

        async fn shutdown(&self) {}
    }

    struct Harness {
        registry: Arc<TunnelRegistry>,
        issuer: Arc<CredentialIssuer>,
        allocator: Arc<UrlAllocator>,
        channels: Arc<ChannelManager>,
        supervisor: Arc<LifecycleSupervisor>,
    }

    fn harness(config: SupervisorConfig) -> Harness {
        let registry = Arc::new(TunnelRegistry::new());
        let issuer = Arc::new(CredentialIssuer::new(
            b"sweep_test_secret",
            IssuerConfig::default(),
        ));
        let allocator = Arc::new(UrlAllocator::new(AllocatorConfig::default()));
        let channels = Arc::new(ChannelManager::new());
        let supervisor = Arc::new(LifecycleSupervisor::new(
            registry.clone(),
            issuer.clone(),
            allocator.clone(),
            channels.clone(),
            config,
        ));
        Harness {
            registry,
            issuer,
            allocator,
            channels,
            supervisor,
        }
    }

    /// Create a session the way the broker does: credential, URL, then entry
    fn seed_session(h: &Harness, tunnel_id: &str, project: &str) -> TunnelSession {
        let credential = h.issuer.issue(tunnel_id, "u1").unwrap();
        let public_url = h.allocator.allocate("u1", project).unwrap();
        let now = Utc::now();
        let session = TunnelSession {
            tunnel_id: tunnel_id.to_string(),
            owner_id: "u1".to_string(),
            project_name: project.to_string(),
            local_port: 3000,
            metadata: ProjectMetadata::new(),
            visibility: Visibility::Public,
            credential: Some(credential),
            public_url,
            state: SessionState::Pending,
            started_at: now,
            expires_at: now + ChronoDuration::hours(8),
            stats: SessionStats::new(10),
            disconnected_at: None,
            close_reason: None,
            closed_at: None,
        };
        h.registry.create(session.clone()).unwrap();
        session
    }

    #[tokio::test]
    async fn test_sweep_closes_expired_session() {
        let h = harness(SupervisorConfig::default());
        let seeded = seed_session(&h, "t1", "demo");
        h.registry.mark_connected("t1").unwrap();

        // Not expired yet: sweep leaves it alone
        h.supervisor.sweep().await;
        assert_eq!(h.registry.get("t1").unwrap().state, SessionState::Connected);

        // Backdate expiry by recreating the clock condition
        {
            let entry = h.registry.session_handle("t1").unwrap();
            entry.lock().unwrap().expires_at = Utc::now() - ChronoDuration::seconds(1);
        }
        h.supervisor.sweep().await;

        let session = h.registry.get("t1").unwrap();
        assert_eq!(session.state, SessionState::Closed);
        assert_eq!(session.close_reason, Some(CloseReason::Expired));
        // URL and credential are gone
        assert!(!h.allocator.is_allocated(&seeded.public_url));
        assert_eq!(h.issuer.active_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_times_out_pending_session() {
        let h = harness(SupervisorConfig {
            connect_timeout: Duration::from_secs(15),
            ..Default::default()
        });
        seed_session(&h, "t1", "demo");

        {
            let entry = h.registry.session_handle("t1").unwrap();
            entry.lock().unwrap().started_at = Utc::now() - ChronoDuration::seconds(20);
        }
        h.supervisor.sweep().await;

        let session = h.registry.get("t1").unwrap();
        assert_eq!(session.state, SessionState::Closed);
        assert_eq!(session.close_reason, Some(CloseReason::ConnectTimeout));
    }

    #[tokio::test]
    async fn test_sweep_respects_grace_window() {
        let h = harness(SupervisorConfig {
            grace_window: Duration::from_secs(30),
            ..Default::default()
        });
        seed_session(&h, "t1", "demo");
        h.registry.mark_connected("t1").unwrap();

        // Recent disconnect: still inside the grace window
        h.registry
            .mark_disconnected("t1", Utc::now() - ChronoDuration::seconds(5))
            .unwrap();
        h.supervisor.sweep().await;
        assert_eq!(h.registry.get("t1").unwrap().state, SessionState::Connected);

        // Reconnect clears the stamp; the session survives the next sweep
        h.registry.mark_connected("t1").unwrap();
        h.supervisor.sweep().await;
        assert_eq!(h.registry.get("t1").unwrap().state, SessionState::Connected);

        // A disconnect older than the grace window closes the session
        h.registry
            .mark_disconnected("t1", Utc::now() - ChronoDuration::seconds(31))
            .unwrap();
        h.supervisor.sweep().await;

        let session = h.registry.get("t1").unwrap();
        assert_eq!(session.state, SessionState::Closed);
        assert_eq!(session.close_reason, Some(CloseReason::DisconnectGrace));
    }

    #[tokio::test]
    async fn test_finalize_waits_for_drain_then_forces() {
        let h = harness(SupervisorConfig {
            drain_timeout: Duration::from_millis(200),
            drain_poll_interval: Duration::from_millis(20),
            ..Default::default()
        });
        seed_session(&h, "t1", "demo");
        h.registry.mark_connected("t1").unwrap();
        h.channels.register("t1", Arc::new(NullChannel)).await;

        // Hold an in-flight forward across the whole drain window
        let guard = h.channels.begin_forward("t1");

        h.registry
            .begin_close("t1", CloseReason::Requested)
            .unwrap();
        let started = tokio::time::Instant::now();
        h.supervisor.finalize("t1").await;

        // Drain window was honored, then teardown was forced
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(h.registry.get("t1").unwrap().state, SessionState::Closed);
        assert!(h.channels.get("t1").await.is_none());
        drop(guard);
    }

    #[tokio::test]
    async fn test_closed_sessions_purged_after_retention() {
        let h = harness(SupervisorConfig {
            closed_retention: Duration::from_secs(300),
            ..Default::default()
        });
        seed_session(&h, "t1", "demo");
        h.registry
            .begin_close("t1", CloseReason::Requested)
            .unwrap();
        h.supervisor.finalize("t1").await;

        // Still readable for audit right after closing
        h.supervisor.sweep().await;
        assert!(h.registry.get("t1").is_ok());

        {
            let entry = h.registry.session_handle("t1").unwrap();
            entry.lock().unwrap().closed_at = Some(Utc::now() - ChronoDuration::seconds(301));
        }
        h.supervisor.sweep().await;
        assert!(matches!(
            h.registry.get("t1"),
            Err(crate::error::BrokerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_never_resurrects_closed_sessions() {
        let h = harness(SupervisorConfig::default());
        seed_session(&h, "t1", "demo");
        h.registry
            .begin_close("t1", CloseReason::Requested)
            .unwrap();
        h.supervisor.finalize("t1").await;

        // Backdate expiry; the sweep must leave the closed session alone
        {
            let entry = h.registry.session_handle("t1").unwrap();
            entry.lock().unwrap().expires_at = Utc::now() - ChronoDuration::hours(1);
        }
        h.supervisor.sweep().await;

        let session = h.registry.get("t1").unwrap();
        assert_eq!(session.state, SessionState::Closed);
        assert_eq!(session.close_reason, Some(CloseReason::Requested));
    }
}
