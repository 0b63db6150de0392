//! Reverse channel management
//!
//! The broker sits above the tunnel transport behind the `ReverseChannel`
//! trait: whatever the transport layer is, it hands the broker something
//! that can carry a forwarded request to the owner's machine. The manager
//! also counts in-flight forwards per tunnel so teardown can drain them.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use portshare_proto::{ForwardRequest, ForwardResponse};

/// Reverse channel errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Reverse channel closed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),
}

/// An established reverse channel to one owner's machine
#[async_trait]
pub trait ReverseChannel: Send + Sync {
    /// Carry one forwarded request to the local server and return its response
    async fn forward(&self, request: ForwardRequest) -> Result<ForwardResponse, ChannelError>;

    /// Tear the channel down; in-flight forwards may fail with `Closed`
    async fn shutdown(&self);
}

/// Tracks one in-flight forward; the slot is released on drop
pub struct ForwardGuard {
    inflight: Arc<AtomicUsize>,
}

impl Drop for ForwardGuard {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Manages all established reverse channels
pub struct ChannelManager {
    channels: RwLock<HashMap<String, Arc<dyn ReverseChannel>>>,
    inflight: DashMap<String, Arc<AtomicUsize>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            inflight: DashMap::new(),
        }
    }

    /// Register a reverse channel for a tunnel
    ///
    /// A reconnecting transport replaces its stale predecessor; the old
    /// channel, if any, is returned so the caller can shut it down.
    pub async fn register(
        &self,
        tunnel_id: &str,
        channel: Arc<dyn ReverseChannel>,
    ) -> Option<Arc<dyn ReverseChannel>> {
        let replaced = self
            .channels
            .write()
            .await
            .insert(tunnel_id.to_string(), channel);

        if replaced.is_some() {
            debug!(tunnel_id = %tunnel_id, "Replaced stale reverse channel");
        } else {
            debug!(tunnel_id = %tunnel_id, "Registered reverse channel");
        }
        replaced
    }

    /// Remove and return a tunnel's channel
    pub async fn unregister(&self, tunnel_id: &str) -> Option<Arc<dyn ReverseChannel>> {
        let removed = self.channels.write().await.remove(tunnel_id);
        if removed.is_some() {
            debug!(tunnel_id = %tunnel_id, "Unregistered reverse channel");
        }
        self.inflight.remove(tunnel_id);
        removed
    }

    /// Get a tunnel's channel
    pub async fn get(&self, tunnel_id: &str) -> Option<Arc<dyn ReverseChannel>> {
        self.channels.read().await.get(tunnel_id).cloned()
    }

    /// Number of registered channels
    pub async fn count(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Begin an in-flight forward for a tunnel
    ///
    /// The returned guard must be held for the duration of the forward;
    /// dropping it releases the slot.
    pub fn begin_forward(&self, tunnel_id: &str) -> ForwardGuard {
        let counter = self
            .inflight
            .entry(tunnel_id.to_string())
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::SeqCst);
        ForwardGuard { inflight: counter }
    }

    /// Current in-flight forwards for a tunnel
    pub fn inflight_count(&self, tunnel_id: &str) -> usize {
        self.inflight
            .get(tunnel_id)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

impl Default for ChannelManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoChannel;

    #[async_trait]
    impl ReverseChannel for EchoChannel {
        async fn forward(
            &self,
            request: ForwardRequest,
        ) -> Result<ForwardResponse, ChannelError> {
            Ok(ForwardResponse {
                status: 200,
                headers: Vec::new(),
                body: request.body,
            })
        }

        async fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn test_register_get_unregister() {
        let manager = ChannelManager::new();
        assert!(manager.get("t1").await.is_none());

        manager.register("t1", Arc::new(EchoChannel)).await;
        assert!(manager.get("t1").await.is_some());
        assert_eq!(manager.count().await, 1);

        assert!(manager.unregister("t1").await.is_some());
        assert!(manager.get("t1").await.is_none());
        assert!(manager.unregister("t1").await.is_none());
    }

    #[tokio::test]
    async fn test_register_replaces_stale_channel() {
        let manager = ChannelManager::new();

        assert!(manager.register("t1", Arc::new(EchoChannel)).await.is_none());
        assert!(manager.register("t1", Arc::new(EchoChannel)).await.is_some());
        assert_eq!(manager.count().await, 1);
    }

    #[tokio::test]
    async fn test_inflight_counting() {
        let manager = ChannelManager::new();
        manager.register("t1", Arc::new(EchoChannel)).await;

        assert_eq!(manager.inflight_count("t1"), 0);
        let guard_a = manager.begin_forward("t1");
        let guard_b = manager.begin_forward("t1");
        assert_eq!(manager.inflight_count("t1"), 2);

        drop(guard_a);
        assert_eq!(manager.inflight_count("t1"), 1);
        drop(guard_b);
        assert_eq!(manager.inflight_count("t1"), 0);
    }
}
