//! Authoritative tunnel session registry
//!
//! Single source of truth for session state. Every mutation of a session's
//! state, stats, or timestamps goes through here and is serialized per
//! tunnel id by a per-entry mutex; the map-level critical section covers
//! only inserting or removing an entry by id. State changes are published
//! on a broadcast channel consumed by the discovery index.
//!
//! Lock discipline: entry mutexes are never held across `.await`, and the
//! session map is never mutated while an entry mutex is held.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use portshare_proto::{
    CloseReason, SessionEvent, SessionState, SessionSummary, TunnelSession,
};

use crate::error::BrokerError;

/// Capacity of the state-change broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Registry for live tunnel sessions
pub struct TunnelRegistry {
    /// tunnel_id -> session, with a per-entry mutex serializing transitions
    sessions: DashMap<String, Arc<Mutex<TunnelSession>>>,
    /// public_url -> tunnel_id, for non-closed sessions
    urls: DashMap<String, String>,
    /// owner-scoped project key -> tunnel_id, for non-closed sessions
    projects: DashMap<String, String>,
    events: broadcast::Sender<SessionEvent>,
}

fn project_key(owner_id: &str, project_name: &str) -> String {
    format!("{}::{}", owner_id, project_name.to_ascii_lowercase())
}

impl TunnelRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sessions: DashMap::new(),
            urls: DashMap::new(),
            projects: DashMap::new(),
            events,
        }
    }

    /// Subscribe to state-change events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine; discovery may not be wired up in tests
        let _ = self.events.send(event);
    }

    /// Insert a freshly built `pending` session
    ///
    /// Rejects with `Conflict` when the owner already has a non-closed
    /// session under the same project name. The project-key reservation and
    /// the session insert happen under one map entry, so two concurrent
    /// creates for the same `(owner, project)` cannot both succeed.
    pub fn create(&self, session: TunnelSession) -> Result<SessionSummary, BrokerError> {
        debug_assert_eq!(session.state, SessionState::Pending);

        let key = project_key(&session.owner_id, &session.project_name);
        match self.projects.entry(key) {
            Entry::Occupied(_) => {
                warn!(
                    owner_id = %session.owner_id,
                    project = %session.project_name,
                    "Rejecting create: project already has a live session"
                );
                Err(BrokerError::Conflict {
                    project: session.project_name.clone(),
                })
            }
            Entry::Vacant(vacant) => {
                let summary = session.summary();
                let tunnel_id = session.tunnel_id.clone();

                self.urls
                    .insert(session.public_url.clone(), tunnel_id.clone());
                self.sessions
                    .insert(tunnel_id.clone(), Arc::new(Mutex::new(session)));
                vacant.insert(tunnel_id.clone());

                info!(
                    tunnel_id = %tunnel_id,
                    owner_id = %summary.owner_id,
                    public_url = %summary.public_url,
                    "Registered new tunnel session"
                );
                self.emit(SessionEvent::Created {
                    summary: summary.clone(),
                });
                Ok(summary)
            }
        }
    }

    fn entry(&self, tunnel_id: &str) -> Result<Arc<Mutex<TunnelSession>>, BrokerError> {
        self.sessions
            .get(tunnel_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| BrokerError::NotFound(tunnel_id.to_string()))
    }

    pub(crate) fn session_handle(
        &self,
        tunnel_id: &str,
    ) -> Result<Arc<Mutex<TunnelSession>>, BrokerError> {
        self.entry(tunnel_id)
    }

    /// Get a point-in-time copy of a session
    pub fn get(&self, tunnel_id: &str) -> Result<TunnelSession, BrokerError> {
        let entry = self.entry(tunnel_id)?;
        let session = entry.lock().unwrap();
        Ok(session.clone())
    }

    /// Resolve a public URL to its owning tunnel id (non-closed sessions)
    pub fn resolve_url(&self, public_url: &str) -> Option<String> {
        self.urls.get(public_url).map(|e| e.value().clone())
    }

    /// Snapshot of all registered tunnel ids
    pub fn list_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Summaries of one owner's sessions, most recently started first
    pub fn list_by_owner(&self, owner_id: &str) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .filter_map(|e| {
                let session = e.value().lock().unwrap();
                (session.owner_id == owner_id).then(|| session.summary())
            })
            .collect();

        summaries.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| a.tunnel_id.cmp(&b.tunnel_id))
        });
        summaries
    }

    /// Total registered sessions, including closed ones awaiting purge
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Sessions currently able to carry traffic
    pub fn count_routable(&self) -> usize {
        self.sessions
            .iter()
            .filter(|e| e.value().lock().unwrap().state.is_routable())
            .count()
    }

    /// Transition on transport connect: `pending -> connected`
    ///
    /// A transport reconnecting inside the disconnect grace window resumes
    /// the session: the stamp is cleared and the state is returned
    /// unchanged (`connected` stays `connected`, `active` stays `active`).
    pub fn mark_connected(&self, tunnel_id: &str) -> Result<SessionState, BrokerError> {
        let entry = self.entry(tunnel_id)?;
        let event = {
            let mut session = entry.lock().unwrap();
            match session.state {
                SessionState::Pending => {
                    session.state = SessionState::Connected;
                    session.disconnected_at = None;
                    Some(SessionEvent::Connected {
                        summary: session.summary(),
                    })
                }
                SessionState::Connected | SessionState::Active => {
                    if session.disconnected_at.take().is_some() {
                        info!(tunnel_id = %tunnel_id, "Transport reconnected inside grace window");
                    }
                    None
                }
                state @ (SessionState::Closing | SessionState::Closed) => {
                    return Err(BrokerError::InvalidState { state });
                }
            }
        };

        if let Some(event) = event {
            info!(tunnel_id = %tunnel_id, "Tunnel session connected");
            self.emit(event);
        }
        let state = entry.lock().unwrap().state;
        Ok(state)
    }

    /// Transition on first forwarded request: `connected -> active`
    ///
    /// Purely observational; repeated calls and calls on an already-active
    /// session are no-ops.
    pub fn mark_active(&self, tunnel_id: &str) -> Result<SessionState, BrokerError> {
        let entry = self.entry(tunnel_id)?;
        let activated = {
            let mut session = entry.lock().unwrap();
            match session.state {
                SessionState::Connected => {
                    session.state = SessionState::Active;
                    true
                }
                SessionState::Active => false,
                state => return Err(BrokerError::InvalidState { state }),
            }
        };

        if activated {
            debug!(tunnel_id = %tunnel_id, "Tunnel session active: first request forwarded");
            self.emit(SessionEvent::Activated {
                tunnel_id: tunnel_id.to_string(),
            });
        }
        Ok(SessionState::Active)
    }

    /// Record an asynchronous transport disconnect
    ///
    /// Starts the reconnect grace window; the supervisor closes the session
    /// once the window lapses. Not an owner-visible error at this point.
    pub fn mark_disconnected(
        &self,
        tunnel_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), BrokerError> {
        let entry = self.entry(tunnel_id)?;
        let mut session = entry.lock().unwrap();
        if session.state.is_routable() && session.disconnected_at.is_none() {
            session.disconnected_at = Some(now);
            info!(tunnel_id = %tunnel_id, "Transport disconnected, grace window started");
        }
        Ok(())
    }

    /// Move a session to `closing`
    ///
    /// Idempotent: a session already in `closing` or `closed` is left
    /// untouched and its current state returned.
    pub fn begin_close(
        &self,
        tunnel_id: &str,
        reason: CloseReason,
    ) -> Result<SessionState, BrokerError> {
        self.begin_close_if(tunnel_id, reason, |_| true)
            .map(|state| state.expect("unconditional close always applies"))
    }

    /// Atomically check a predicate and move the session to `closing`
    ///
    /// The predicate runs under the session's entry lock, so the check and
    /// the transition cannot interleave with a concurrent transition (a
    /// stale read followed by a blind write is impossible). Returns
    /// `Ok(None)` when the predicate declined, `Ok(Some(state))` otherwise.
    pub fn begin_close_if<F>(
        &self,
        tunnel_id: &str,
        reason: CloseReason,
        predicate: F,
    ) -> Result<Option<SessionState>, BrokerError>
    where
        F: FnOnce(&TunnelSession) -> bool,
    {
        let entry = self.entry(tunnel_id)?;
        let event = {
            let mut session = entry.lock().unwrap();
            match session.state {
                SessionState::Closing | SessionState::Closed => {
                    return Ok(Some(session.state));
                }
                _ => {
                    if !predicate(&session) {
                        return Ok(None);
                    }
                    session.state = SessionState::Closing;
                    session.close_reason = Some(reason);
                    // Credential is only valid while pending/connected/active
                    session.credential = None;
                    SessionEvent::Closing {
                        tunnel_id: tunnel_id.to_string(),
                        reason,
                    }
                }
            }
        };

        info!(tunnel_id = %tunnel_id, reason = %reason, "Tunnel session closing");
        self.emit(event);
        Ok(Some(SessionState::Closing))
    }

    /// Complete teardown: `closing -> closed`
    ///
    /// Frees the URL and project-name reservations held in the registry's
    /// own indexes; the caller is responsible for having released the URL
    /// allocation and revoked the credential first.
    pub fn finalize_close(
        &self,
        tunnel_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), BrokerError> {
        let entry = self.entry(tunnel_id)?;
        let (public_url, key) = {
            let mut session = entry.lock().unwrap();
            match session.state {
                SessionState::Closing => {
                    session.state = SessionState::Closed;
                    session.closed_at = Some(now);
                    session.stats.viewers_count = 0;
                    (
                        session.public_url.clone(),
                        project_key(&session.owner_id, &session.project_name),
                    )
                }
                state => return Err(BrokerError::InvalidState { state }),
            }
        };

        self.urls.remove(&public_url);
        self.projects.remove(&key);

        info!(tunnel_id = %tunnel_id, "Tunnel session closed");
        self.emit(SessionEvent::Closed {
            tunnel_id: tunnel_id.to_string(),
        });
        Ok(())
    }

    /// Purge a `closed` session from the registry
    pub fn remove(&self, tunnel_id: &str) -> Result<(), BrokerError> {
        let entry = self.entry(tunnel_id)?;
        {
            let session = entry.lock().unwrap();
            if session.state != SessionState::Closed {
                return Err(BrokerError::InvalidState {
                    state: session.state,
                });
            }
        }
        // State is terminal, so nothing can transition between the check
        // above and the removal below.
        self.sessions.remove(tunnel_id);

        debug!(tunnel_id = %tunnel_id, "Purged closed tunnel session");
        self.emit(SessionEvent::Removed {
            tunnel_id: tunnel_id.to_string(),
        });
        Ok(())
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use portshare_proto::{ProjectMetadata, SessionStats, Visibility};

    fn test_session(tunnel_id: &str, owner_id: &str, project: &str) -> TunnelSession {
        let now = Utc::now();
        TunnelSession {
            tunnel_id: tunnel_id.to_string(),
            owner_id: owner_id.to_string(),
            project_name: project.to_string(),
            local_port: 3000,
            metadata: ProjectMetadata::new(),
            visibility: Visibility::Public,
            credential: Some("tok".to_string()),
            public_url: format!("https://{}-{}.portshare.dev", owner_id, project),
            state: SessionState::Pending,
            started_at: now,
            expires_at: now + Duration::hours(8),
            stats: SessionStats::new(10),
            disconnected_at: None,
            close_reason: None,
            closed_at: None,
        }
    }

    #[test]
    fn test_create_and_get() {
        let registry = TunnelRegistry::new();
        registry.create(test_session("t1", "u1", "demo")).unwrap();

        let session = registry.get("t1").unwrap();
        assert_eq!(session.state, SessionState::Pending);
        assert_eq!(session.owner_id, "u1");
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_duplicate_project_conflict() {
        let registry = TunnelRegistry::new();
        registry.create(test_session("t1", "u1", "demo")).unwrap();

        let result = registry.create(test_session("t2", "u1", "demo"));
        assert!(matches!(result, Err(BrokerError::Conflict { .. })));

        // Project names are owner-scoped
        assert!(registry.create(test_session("t3", "u2", "demo")).is_ok());
    }

    #[test]
    fn test_project_conflict_is_case_insensitive() {
        let registry = TunnelRegistry::new();
        registry.create(test_session("t1", "u1", "demo")).unwrap();

        let result = registry.create(test_session("t2", "u1", "Demo"));
        assert!(matches!(result, Err(BrokerError::Conflict { .. })));
    }

    #[test]
    fn test_full_lifecycle_transitions() {
        let registry = TunnelRegistry::new();
        registry.create(test_session("t1", "u1", "demo")).unwrap();

        assert_eq!(
            registry.mark_connected("t1").unwrap(),
            SessionState::Connected
        );
        assert_eq!(registry.mark_active("t1").unwrap(), SessionState::Active);
        assert_eq!(
            registry.begin_close("t1", CloseReason::Requested).unwrap(),
            SessionState::Closing
        );
        registry.finalize_close("t1", Utc::now()).unwrap();
        assert_eq!(registry.get("t1").unwrap().state, SessionState::Closed);
    }

    #[test]
    fn test_mark_active_requires_connected() {
        let registry = TunnelRegistry::new();
        registry.create(test_session("t1", "u1", "demo")).unwrap();

        let result = registry.mark_active("t1");
        assert!(matches!(
            result,
            Err(BrokerError::InvalidState {
                state: SessionState::Pending
            })
        ));
    }

    #[test]
    fn test_mark_active_is_idempotent() {
        let registry = TunnelRegistry::new();
        registry.create(test_session("t1", "u1", "demo")).unwrap();
        registry.mark_connected("t1").unwrap();

        assert_eq!(registry.mark_active("t1").unwrap(), SessionState::Active);
        assert_eq!(registry.mark_active("t1").unwrap(), SessionState::Active);
    }

    #[test]
    fn test_connect_rejected_once_closing() {
        let registry = TunnelRegistry::new();
        registry.create(test_session("t1", "u1", "demo")).unwrap();
        registry.begin_close("t1", CloseReason::Requested).unwrap();

        assert!(matches!(
            registry.mark_connected("t1"),
            Err(BrokerError::InvalidState {
                state: SessionState::Closing
            })
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let registry = TunnelRegistry::new();
        registry.create(test_session("t1", "u1", "demo")).unwrap();

        assert_eq!(
            registry.begin_close("t1", CloseReason::Requested).unwrap(),
            SessionState::Closing
        );
        // Second close is a no-op returning the current state
        assert_eq!(
            registry.begin_close("t1", CloseReason::Expired).unwrap(),
            SessionState::Closing
        );
        // The original reason is preserved
        assert_eq!(
            registry.get("t1").unwrap().close_reason,
            Some(CloseReason::Requested)
        );

        registry.finalize_close("t1", Utc::now()).unwrap();
        assert_eq!(
            registry.begin_close("t1", CloseReason::Requested).unwrap(),
            SessionState::Closed
        );
    }

    #[test]
    fn test_begin_close_clears_credential() {
        let registry = TunnelRegistry::new();
        registry.create(test_session("t1", "u1", "demo")).unwrap();
        registry.begin_close("t1", CloseReason::Requested).unwrap();

        assert_eq!(registry.get("t1").unwrap().credential, None);
    }

    #[test]
    fn test_begin_close_if_predicate_declines() {
        let registry = TunnelRegistry::new();
        registry.create(test_session("t1", "u1", "demo")).unwrap();

        let result = registry
            .begin_close_if("t1", CloseReason::Expired, |s| s.is_expired(Utc::now()))
            .unwrap();
        assert_eq!(result, None);
        assert_eq!(registry.get("t1").unwrap().state, SessionState::Pending);
    }

    #[test]
    fn test_finalize_frees_url_and_project() {
        let registry = TunnelRegistry::new();
        let session = test_session("t1", "u1", "demo");
        let url = session.public_url.clone();
        registry.create(session).unwrap();

        assert_eq!(registry.resolve_url(&url), Some("t1".to_string()));

        registry.begin_close("t1", CloseReason::Requested).unwrap();
        registry.finalize_close("t1", Utc::now()).unwrap();

        // URL no longer routes, and the project name is free again
        assert_eq!(registry.resolve_url(&url), None);
        assert!(registry.create(test_session("t2", "u1", "demo")).is_ok());
    }

    #[test]
    fn test_remove_requires_closed() {
        let registry = TunnelRegistry::new();
        registry.create(test_session("t1", "u1", "demo")).unwrap();

        assert!(matches!(
            registry.remove("t1"),
            Err(BrokerError::InvalidState { .. })
        ));

        registry.begin_close("t1", CloseReason::Requested).unwrap();
        registry.finalize_close("t1", Utc::now()).unwrap();
        registry.remove("t1").unwrap();

        assert!(matches!(registry.get("t1"), Err(BrokerError::NotFound(_))));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_reconnect_inside_grace_resumes() {
        let registry = TunnelRegistry::new();
        registry.create(test_session("t1", "u1", "demo")).unwrap();
        registry.mark_connected("t1").unwrap();
        registry.mark_active("t1").unwrap();

        registry.mark_disconnected("t1", Utc::now()).unwrap();
        assert!(registry.get("t1").unwrap().disconnected_at.is_some());

        // Reconnect clears the stamp; an active session stays active
        assert_eq!(registry.mark_connected("t1").unwrap(), SessionState::Active);
        assert!(registry.get("t1").unwrap().disconnected_at.is_none());
    }

    #[test]
    fn test_list_by_owner_ordering() {
        let registry = TunnelRegistry::new();

        let mut first = test_session("t1", "u1", "alpha");
        first.started_at = Utc::now() - Duration::minutes(10);
        let mut second = test_session("t2", "u1", "beta");
        second.started_at = Utc::now();
        registry.create(first).unwrap();
        registry.create(second).unwrap();
        registry.create(test_session("t3", "u2", "other")).unwrap();

        let sessions = registry.list_by_owner("u1");
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].tunnel_id, "t2");
        assert_eq!(sessions[1].tunnel_id, "t1");
    }

    #[test]
    fn test_events_emitted_through_lifecycle() {
        let registry = TunnelRegistry::new();
        let mut events = registry.subscribe();

        registry.create(test_session("t1", "u1", "demo")).unwrap();
        registry.mark_connected("t1").unwrap();
        registry.mark_active("t1").unwrap();
        registry.begin_close("t1", CloseReason::Requested).unwrap();
        registry.finalize_close("t1", Utc::now()).unwrap();
        registry.remove("t1").unwrap();

        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::Created { .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::Connected { .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::Activated { .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::Closing {
                reason: CloseReason::Requested,
                ..
            }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::Closed { .. }
        ));
        assert!(matches!(
            events.try_recv().unwrap(),
            SessionEvent::Removed { .. }
        ));
    }

    #[test]
    fn test_concurrent_creates_same_project_one_wins() {
        let registry = Arc::new(TunnelRegistry::new());
        let mut handles = Vec::new();

        for i in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                registry.create(test_session(&format!("t{}", i), "u1", "demo"))
            }));
        }

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1, "Exactly one concurrent create may win");
        assert!(results
            .iter()
            .filter(|r| r.is_err())
            .all(|r| matches!(r, Err(BrokerError::Conflict { .. }))));
    }
}
