//! Process-wide registry of live connections.
//!
//! Workers publish observable metadata here; the registry never reaches
//! back into a worker. Lifecycle hooks are `register`, `update_auth`,
//! `update_subscriptions`, `deregister`. No lock is held across I/O — every
//! method copies in or out under a short write/read section.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::RwLock;

/// Observable state of one connection, eventually consistent with the
/// owning worker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionMetadata {
    pub connection_id: String,
    pub remote_address: String,
    /// Milliseconds since the Unix epoch.
    pub connected_at: i64,
    pub authenticated: bool,
    pub user_id: Option<String>,
    pub roles: Vec<String>,
    pub store_subscription_count: usize,
    pub rules_subscription_count: usize,
}

impl ConnectionMetadata {
    pub fn new(connection_id: &str, remote_address: &str) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            remote_address: remote_address.to_string(),
            connected_at: crate::protocol::now_ms(),
            authenticated: false,
            user_id: None,
            roles: Vec::new(),
            store_subscription_count: 0,
            rules_subscription_count: 0,
        }
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<HashMap<String, ConnectionMetadata>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, metadata: ConnectionMetadata) {
        self.inner
            .write()
            .await
            .insert(metadata.connection_id.clone(), metadata);
    }

    pub async fn update_auth(
        &self,
        connection_id: &str,
        user_id: Option<String>,
        roles: Vec<String>,
    ) {
        if let Some(meta) = self.inner.write().await.get_mut(connection_id) {
            meta.authenticated = user_id.is_some();
            meta.user_id = user_id;
            meta.roles = roles;
        }
    }

    pub async fn update_subscriptions(
        &self,
        connection_id: &str,
        store_count: usize,
        rules_count: usize,
    ) {
        if let Some(meta) = self.inner.write().await.get_mut(connection_id) {
            meta.store_subscription_count = store_count;
            meta.rules_subscription_count = rules_count;
        }
    }

    /// Idempotent — deregistering an unknown id is a no-op.
    pub async fn deregister(&self, connection_id: &str) {
        self.inner.write().await.remove(connection_id);
    }

    pub async fn get(&self, connection_id: &str) -> Option<ConnectionMetadata> {
        self.inner.read().await.get(connection_id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<ConnectionMetadata> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Total store + rules subscriptions across all live connections.
    pub async fn subscription_count(&self) -> usize {
        self.inner
            .read()
            .await
            .values()
            .map(|m| m.store_subscription_count + m.rules_subscription_count)
            .sum()
    }
}
