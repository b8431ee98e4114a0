//! Capability traits for the external collaborators.
//!
//! The connection core does not implement a query engine, a rule engine, or
//! an identity database. It consumes them through the traits below, the way
//! the worker consumes its transport: operations in, pushes out through a
//! sink, never a direct transport write.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::StoreError;

// ─── Sessions ────────────────────────────────────────────────────────────────

/// The authenticated identity of one connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaims {
    pub user_id: String,
    pub roles: Vec<String>,
    /// Milliseconds since the Unix epoch; `None` means no expiry.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl SessionClaims {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= now_ms)
    }
}

// ─── Push delivery ───────────────────────────────────────────────────────────

/// A change notification for one subscription.
#[derive(Debug, Clone)]
pub struct PushEvent {
    pub subscription_id: String,
    pub data: Value,
}

/// Where a collaborator delivers pushes for one connection's subscriptions.
///
/// The sink forwards into the owning worker's inbox; collaborators never
/// touch the transport. Delivery is non-blocking and best-effort — a sink
/// whose connection died swallows the event.
#[derive(Clone)]
pub struct PushSink {
    deliver: Arc<dyn Fn(PushEvent) + Send + Sync>,
}

impl PushSink {
    pub fn new(deliver: impl Fn(PushEvent) + Send + Sync + 'static) -> Self {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    pub fn push(&self, subscription_id: &str, data: Value) {
        (self.deliver)(PushEvent {
            subscription_id: subscription_id.to_string(),
            data,
        });
    }
}

/// Opaque unsubscribe thunk. Invoked exactly once, unconditionally, when the
/// subscription or its connection dies.
pub type Canceler = Box<dyn FnOnce() + Send + Sync>;

/// What a collaborator hands back for a new subscription.
pub struct SubscriptionGrant {
    pub subscription_id: String,
    pub initial_data: Value,
    pub canceler: Canceler,
}

impl std::fmt::Debug for SubscriptionGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGrant")
            .field("subscription_id", &self.subscription_id)
            .field("initial_data", &self.initial_data)
            .field("canceler", &"<canceler>")
            .finish()
    }
}

// ─── Collaborator traits ─────────────────────────────────────────────────────

/// The reactive data store: bucket CRUD, named queries, live subscriptions.
#[async_trait]
pub trait Store: Send + Sync {
    /// Execute a non-subscription operation (`insert`, `update`, `delete`,
    /// `get`, `all`, `query`, ...). `operation` is the name with the
    /// `store.` prefix already stripped.
    async fn execute(&self, operation: &str, fields: &Map<String, Value>)
        -> Result<Value, StoreError>;

    /// Bind a named query to a connection. Subsequent changes arrive through
    /// `sink`; the grant's canceler tears the binding down.
    async fn subscribe(
        &self,
        query: &str,
        params: Value,
        sink: PushSink,
    ) -> Result<SubscriptionGrant, StoreError>;

    /// Await all pending query re-evaluations. Test suites call this between
    /// a mutation and any assertion against pushes.
    async fn settle(&self);
}

/// The rule engine, a sibling of [`Store`] with identical lifecycle
/// semantics. Rule pushes are delivered on the `"event"` channel.
#[async_trait]
pub trait RulesEngine: Send + Sync {
    async fn execute(&self, operation: &str, fields: &Map<String, Value>)
        -> Result<Value, StoreError>;

    async fn subscribe(
        &self,
        query: &str,
        params: Value,
        sink: PushSink,
    ) -> Result<SubscriptionGrant, StoreError>;

    async fn settle(&self);
}

/// Token validation backing `auth.login`. `None` means the token is
/// rejected; expiry of returned claims is enforced by the session facade.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Option<SessionClaims>;
}

/// Authorizes auth-gated operations. `session` is `None` when the gate is
/// advisory and the connection never logged in.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn check(
        &self,
        session: Option<&SessionClaims>,
        operation: &str,
        resource: &str,
    ) -> bool;
}
