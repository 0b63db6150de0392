//! Event-driven discovery index
//!
//! A queryable snapshot of public, routable sessions, refreshed from the
//! registry's broadcast events rather than polling. A closed session
//! disappears from discovery within one event-delivery cycle.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use portshare_proto::{SessionEvent, SessionState, SessionSummary, Visibility};

/// Filters applied to the public listing
#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    /// Exact category match (case-insensitive)
    pub category: Option<String>,
    /// Exact framework match (case-insensitive)
    pub framework: Option<String>,
    /// Substring match over project name and description (case-insensitive)
    pub query: Option<String>,
}

impl DiscoveryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_framework(mut self, framework: impl Into<String>) -> Self {
        self.framework = Some(framework.into());
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    fn matches(&self, summary: &SessionSummary) -> bool {
        if let Some(ref category) = self.category {
            let found = summary
                .metadata
                .category
                .as_deref()
                .is_some_and(|c| c.eq_ignore_ascii_case(category));
            if !found {
                return false;
            }
        }

        if let Some(ref framework) = self.framework {
            let found = summary
                .metadata
                .framework
                .as_deref()
                .is_some_and(|f| f.eq_ignore_ascii_case(framework));
            if !found {
                return false;
            }
        }

        if let Some(ref query) = self.query {
            let query = query.to_lowercase();
            let in_name = summary.project_name.to_lowercase().contains(&query);
            let in_description = summary
                .metadata
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(&query));
            if !in_name && !in_description {
                return false;
            }
        }

        true
    }
}

/// Queryable snapshot of discoverable sessions
pub struct DiscoveryIndex {
    entries: DashMap<String, SessionSummary>,
}

impl DiscoveryIndex {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Spawn the refresh task consuming registry events
    pub fn spawn_refresh(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<SessionEvent>,
    ) -> JoinHandle<()> {
        let index = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => index.apply(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Discovery index lagged behind registry events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Registry event channel closed, stopping discovery refresh");
                        break;
                    }
                }
            }
        })
    }

    /// Apply one registry event to the snapshot
    pub fn apply(&self, event: SessionEvent) {
        match event {
            SessionEvent::Connected { summary } => {
                if summary.visibility == Visibility::Public {
                    self.entries.insert(summary.tunnel_id.clone(), summary);
                }
            }
            SessionEvent::Activated { tunnel_id } => {
                if let Some(mut entry) = self.entries.get_mut(&tunnel_id) {
                    entry.state = SessionState::Active;
                }
            }
            SessionEvent::Closing { tunnel_id, .. }
            | SessionEvent::Closed { tunnel_id }
            | SessionEvent::Removed { tunnel_id } => {
                self.entries.remove(&tunnel_id);
            }
            // Pending sessions are not discoverable yet
            SessionEvent::Created { .. } => {}
        }
    }

    /// List discoverable sessions, most recently started first
    ///
    /// Ties are broken by tunnel id for deterministic ordering; the result
    /// is truncated to `limit`.
    pub fn list(&self, filter: &DiscoveryFilter, limit: usize) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .entries
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();

        summaries.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| a.tunnel_id.cmp(&b.tunnel_id))
        });
        summaries.truncate(limit);
        summaries
    }

    /// Number of discoverable sessions
    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for DiscoveryIndex {
    fn default() -> Self {
        Self::new()
    }
}
