//! Per-connection worker.
//!
//! Exactly one worker owns exactly one transport for its whole lifetime.
//! The worker is the single writer of its own state and of every outgoing
//! frame: inbound frames arrive on the owned WebSocket stream, pushes and
//! supervisor commands arrive through the inbox, heartbeats through an
//! owned interval. Nothing else ever touches the transport.

pub mod session;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace};

use crate::audit::{operation_tier, AuditEntry, AuditResult};
use crate::error::{ErrorKind, RequestError};
use crate::identity::ADMIN_ROLE;
use crate::protocol::{self, now_ms, ClientFrame, Request};
use crate::rate_limit::RateDecision;
use crate::registry::ConnectionMetadata;
use crate::store::{Canceler, PushSink, SessionClaims};
use crate::ServerContext;

use transport::{Transport, CLOSE_HEARTBEAT_TIMEOUT, CLOSE_NORMAL};

/// Which producer a push came from; becomes the `channel` field on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushChannel {
    Subscription,
    Event,
}

impl PushChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushChannel::Subscription => "subscription",
            PushChannel::Event => "event",
        }
    }
}

/// Messages delivered to the worker through its inbox. Collaborators push
/// here; they never write the transport directly.
pub enum WorkerMessage {
    Push {
        subscription_id: String,
        channel: PushChannel,
        data: Value,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Normal,
    Shutdown,
    HeartbeatTimeout,
}

/// State exclusively owned by one worker. Never shared; observable parts
/// are mirrored into the registry.
pub struct ConnectionState {
    pub connection_id: String,
    pub remote_address: String,
    pub session: Option<SessionClaims>,
    pub session_id: Option<String>,
    pub store_subscriptions: HashMap<String, Canceler>,
    pub rules_subscriptions: HashMap<String, Canceler>,
    pub first_ping_sent_at: Option<Instant>,
    pub last_ping_sent_at: Option<Instant>,
    pub last_pong_received_at: Option<Instant>,
}

pub struct ConnectionWorker {
    pub(crate) ctx: Arc<ServerContext>,
    pub(crate) state: ConnectionState,
    pub(crate) transport: Transport,
    inbox_tx: mpsc::UnboundedSender<WorkerMessage>,
    inbox_rx: mpsc::UnboundedReceiver<WorkerMessage>,
    terminated: bool,
}

impl ConnectionWorker {
    pub fn new(
        ctx: Arc<ServerContext>,
        connection_id: String,
        remote_address: String,
        transport: Transport,
        inbox_tx: mpsc::UnboundedSender<WorkerMessage>,
        inbox_rx: mpsc::UnboundedReceiver<WorkerMessage>,
    ) -> Self {
        Self {
            ctx,
            state: ConnectionState {
                connection_id,
                remote_address,
                session: None,
                session_id: None,
                store_subscriptions: HashMap::new(),
                rules_subscriptions: HashMap::new(),
                first_ping_sent_at: None,
                last_ping_sent_at: None,
                last_pong_received_at: None,
            },
            transport,
            inbox_tx,
            inbox_rx,
            terminated: false,
        }
    }

    /// Drive the connection until it stops, then clean up. The welcome frame
    /// goes out before the first client frame is consumed.
    pub async fn run(mut self, mut stream: SplitStream<WebSocketStream<TcpStream>>) {
        self.ctx
            .registry
            .register(ConnectionMetadata::new(
                &self.state.connection_id,
                &self.state.remote_address,
            ))
            .await;

        if !self
            .transport
            .send_frame(protocol::welcome(self.ctx.config.requires_auth()))
        {
            self.terminate(StopReason::Normal).await;
            return;
        }

        let mut heartbeat =
            tokio::time::interval(Duration::from_millis(self.ctx.config.heartbeat.interval_ms));
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await; // consume the immediate first tick

        let reason = loop {
            tokio::select! {
                inbox = self.inbox_rx.recv() => match inbox {
                    Some(WorkerMessage::Push { subscription_id, channel, data }) => {
                        self.handle_push(&subscription_id, channel, &data);
                    }
                    Some(WorkerMessage::Shutdown) => {
                        if self.ctx.config.grace_period_ms > 0 {
                            self.transport
                                .send_frame(protocol::system("shutdown", json!({})));
                        }
                        break StopReason::Shutdown;
                    }
                    None => break StopReason::Normal,
                },
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if !self.handle_frame(&text).await {
                            break StopReason::Normal;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => self.transport.send_pong(data),
                    Some(Ok(Message::Close(_))) | None => break StopReason::Normal,
                    Some(Err(e)) => {
                        // No close is coming after a stream error; tear down.
                        debug!(
                            connection = %self.state.connection_id,
                            err = %e,
                            "transport error"
                        );
                        break StopReason::Normal;
                    }
                    Some(Ok(_)) => {}
                },
                _ = heartbeat.tick() => {
                    if !self.heartbeat_tick() {
                        break StopReason::HeartbeatTimeout;
                    }
                }
            }
        };

        self.terminate(reason).await;
    }

    // ─── Request pipeline ────────────────────────────────────────────────────

    /// Handle one inbound text frame. Returns `false` once the transport is
    /// known dead.
    async fn handle_frame(&mut self, raw: &str) -> bool {
        match protocol::parse_frame(raw) {
            Err(failure) => {
                // The request id is unrecoverable; the error correlates to 0.
                let err = RequestError::new(failure.kind, failure.message);
                self.transport.send_frame(protocol::error(0, &err))
            }
            Ok(ClientFrame::Pong { .. }) => {
                self.state.last_pong_received_at = Some(Instant::now());
                true
            }
            Ok(ClientFrame::Request(req)) => {
                let user_before = self.state.session.as_ref().map(|c| c.user_id.clone());
                let session_before = self.state.session_id.clone();
                let outcome = self.execute_request(&req).await;
                self.audit_request(&req, &outcome, user_before, session_before);
                let frame = match &outcome {
                    Ok(data) => protocol::result(req.id, data),
                    Err(err) => protocol::error(req.id, err),
                };
                self.transport.send_frame(frame)
            }
        }
    }

    /// Gates, then dispatch. Exactly one `Ok`/`Err` per request.
    async fn execute_request(&mut self, req: &Request) -> Result<Value, RequestError> {
        let exempt = req.kind.starts_with("auth.") || req.kind == "ping";

        // The gate only exists when auth is configured and required. In
        // advisory mode it must not touch session state; expiry is then
        // observed through auth.whoami alone.
        if !exempt && self.ctx.config.requires_auth() {
            let expired = self
                .state
                .session
                .as_ref()
                .is_some_and(|c| c.expired(now_ms()));
            if expired {
                self.clear_session().await;
                return Err(RequestError::unauthorized("Session expired"));
            }
            if self.state.session.is_none() {
                return Err(RequestError::unauthorized("Authentication required"));
            }
        }

        if let Some(limiter) = &self.ctx.rate_limiter {
            if let RateDecision::Limited { retry_after_ms } =
                limiter.check(&self.state.connection_id)
            {
                return Err(
                    RequestError::new(ErrorKind::RateLimited, "Rate limit exceeded")
                        .with_details(json!({ "retryAfterMs": retry_after_ms })),
                );
            }
        }

        if !exempt {
            if let Some(checker) = &self.ctx.config.permissions {
                let resource = resource_for(req);
                if !checker
                    .check(self.state.session.as_ref(), &req.kind, &resource)
                    .await
                {
                    return Err(RequestError::forbidden(format!(
                        "Operation not permitted: {}",
                        req.kind
                    )));
                }
            }
        }

        self.dispatch(req).await
    }

    async fn dispatch(&mut self, req: &Request) -> Result<Value, RequestError> {
        match req.kind.as_str() {
            "ping" => Ok(json!({ "pong": true, "serverTime": now_ms() })),
            "auth.login" => session::login(self, req).await,
            "auth.whoami" => session::whoami(self).await,
            "auth.logout" => session::logout(self).await,
            kind if kind.starts_with("store.") => {
                self.dispatch_store(req, &kind["store.".len()..]).await
            }
            kind if kind.starts_with("rules.") => {
                self.dispatch_rules(req, &kind["rules.".len()..]).await
            }
            kind if kind.starts_with("identity.") => self.dispatch_identity(req).await,
            other => Err(RequestError::new(
                ErrorKind::UnknownOperation,
                format!("Unknown operation: {other}"),
            )),
        }
    }

    async fn dispatch_store(&mut self, req: &Request, op: &str) -> Result<Value, RequestError> {
        match op {
            "subscribe" => {
                let query = req.str_field("query")?;
                let params = req.value_field("params");
                let sink = self.push_sink(PushChannel::Subscription);
                let grant = self.ctx.config.store.subscribe(query, params, sink).await?;
                self.state
                    .store_subscriptions
                    .insert(grant.subscription_id.clone(), grant.canceler);
                self.publish_subscription_counts().await;
                Ok(json!({
                    "subscriptionId": grant.subscription_id,
                    "initialData": grant.initial_data,
                }))
            }
            "unsubscribe" => {
                let id = req.str_field("subscriptionId")?;
                // Only ids registered on this connection can be dropped.
                match self.state.store_subscriptions.remove(id) {
                    Some(cancel) => {
                        cancel();
                        self.publish_subscription_counts().await;
                        Ok(json!({ "unsubscribed": true }))
                    }
                    None => Err(RequestError::not_found(format!(
                        "Unknown subscription: {id}"
                    ))),
                }
            }
            other => Ok(self.ctx.config.store.execute(other, &req.fields).await?),
        }
    }

    async fn dispatch_rules(&mut self, req: &Request, op: &str) -> Result<Value, RequestError> {
        let Some(rules) = self.ctx.config.rules.clone() else {
            return Err(RequestError::new(
                ErrorKind::RulesNotAvailable,
                "Rule engine is not available",
            ));
        };
        match op {
            "subscribe" => {
                let query = req.str_field("query")?;
                let params = req.value_field("params");
                let sink = self.push_sink(PushChannel::Event);
                let grant = rules.subscribe(query, params, sink).await?;
                self.state
                    .rules_subscriptions
                    .insert(grant.subscription_id.clone(), grant.canceler);
                self.publish_subscription_counts().await;
                Ok(json!({
                    "subscriptionId": grant.subscription_id,
                    "initialData": grant.initial_data,
                }))
            }
            "unsubscribe" => {
                let id = req.str_field("subscriptionId")?;
                match self.state.rules_subscriptions.remove(id) {
                    Some(cancel) => {
                        cancel();
                        self.publish_subscription_counts().await;
                        Ok(json!({ "unsubscribed": true }))
                    }
                    None => Err(RequestError::not_found(format!(
                        "Unknown subscription: {id}"
                    ))),
                }
            }
            other => Ok(rules.execute(other, &req.fields).await?),
        }
    }

    /// `identity.*` exists only in built-in identity mode and is admin-only.
    async fn dispatch_identity(&mut self, req: &Request) -> Result<Value, RequestError> {
        let Some(identity) = self
            .ctx
            .config
            .auth
            .as_ref()
            .and_then(|a| a.built_in.clone())
        else {
            return Err(RequestError::new(
                ErrorKind::UnknownOperation,
                format!("Unknown operation: {}", req.kind),
            ));
        };
        let is_admin = self
            .state
            .session
            .as_ref()
            .is_some_and(|c| c.has_role(ADMIN_ROLE));
        if !is_admin {
            return Err(RequestError::forbidden("Admin role required"));
        }
        match req.kind.as_str() {
            "identity.issueToken" => {
                let user_id = req.str_field("userId")?;
                let roles = req
                    .fields
                    .get("roles")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let ttl_ms = req.fields.get("ttlMs").and_then(Value::as_i64);
                let token = identity.issue_token(user_id, roles, ttl_ms);
                Ok(json!({ "token": token }))
            }
            "identity.revokeToken" => {
                let token = req.str_field("token")?;
                Ok(json!({ "revoked": identity.revoke_token(token) }))
            }
            other => Err(RequestError::new(
                ErrorKind::UnknownOperation,
                format!("Unknown operation: {other}"),
            )),
        }
    }

    // ─── Push pipeline ───────────────────────────────────────────────────────

    fn push_sink(&self, channel: PushChannel) -> PushSink {
        let tx = self.inbox_tx.clone();
        PushSink::new(move |ev| {
            let _ = tx.send(WorkerMessage::Push {
                subscription_id: ev.subscription_id,
                channel,
                data: ev.data,
            });
        })
    }

    fn handle_push(&mut self, subscription_id: &str, channel: PushChannel, data: &Value) {
        let owned = match channel {
            PushChannel::Subscription => {
                self.state.store_subscriptions.contains_key(subscription_id)
            }
            PushChannel::Event => self.state.rules_subscriptions.contains_key(subscription_id),
        };
        // A push can race an unsubscribe; the binding is gone, drop it.
        if !owned {
            return;
        }
        if self.transport.buffered_bytes() >= self.ctx.config.backpressure.high_water_mark {
            // The query re-emits on the next change; dropping is safe.
            trace!(
                connection = %self.state.connection_id,
                subscription = subscription_id,
                "push dropped under backpressure"
            );
            return;
        }
        self.transport
            .send_frame(protocol::push(channel.as_str(), subscription_id, data));
    }

    // ─── Heartbeat ───────────────────────────────────────────────────────────

    /// Send a ping and check liveness. Returns `false` when the connection
    /// has gone `timeout_ms` without a pong since pinging started.
    fn heartbeat_tick(&mut self) -> bool {
        let now = Instant::now();
        if let Some(first_ping) = self.state.first_ping_sent_at {
            let baseline = self.state.last_pong_received_at.unwrap_or(first_ping);
            let timeout = Duration::from_millis(self.ctx.config.heartbeat.timeout_ms);
            if now.duration_since(baseline) > timeout {
                return false;
            }
        }
        self.transport.send_frame(protocol::ping(now_ms()));
        if self.state.first_ping_sent_at.is_none() {
            self.state.first_ping_sent_at = Some(now);
        }
        self.state.last_ping_sent_at = Some(now);
        true
    }

    // ─── Bookkeeping ─────────────────────────────────────────────────────────

    pub(crate) async fn clear_session(&mut self) {
        self.state.session = None;
        self.state.session_id = None;
        self.ctx
            .registry
            .update_auth(&self.state.connection_id, None, Vec::new())
            .await;
    }

    async fn publish_subscription_counts(&self) {
        self.ctx
            .registry
            .update_subscriptions(
                &self.state.connection_id,
                self.state.store_subscriptions.len(),
                self.state.rules_subscriptions.len(),
            )
            .await;
    }

    fn audit_request(
        &self,
        req: &Request,
        outcome: &Result<Value, RequestError>,
        user_before: Option<String>,
        session_before: Option<String>,
    ) {
        let tier = operation_tier(&req.kind);
        if !self.ctx.audit.records(tier) {
            return;
        }
        // Login installs the session during dispatch, logout clears it;
        // prefer the current session, fall back to the pre-dispatch one.
        let user_id = self
            .state
            .session
            .as_ref()
            .map(|c| c.user_id.clone())
            .or(user_before);
        let session_id = self.state.session_id.clone().or(session_before);
        self.ctx.audit.append(AuditEntry {
            timestamp: now_ms(),
            user_id,
            session_id,
            operation: req.kind.clone(),
            resource: resource_for(req),
            result: match outcome {
                Ok(_) => AuditResult::Success,
                Err(_) => AuditResult::Error,
            },
            error: outcome
                .as_ref()
                .err()
                .map(|e| e.audit_message().to_string()),
            details: None,
            remote_address: self.state.remote_address.clone(),
        });
    }

    /// Idempotent teardown: cancel every subscription, close the transport,
    /// drop the connection from the shared services.
    pub(crate) async fn terminate(&mut self, reason: StopReason) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        for (_, cancel) in self.state.store_subscriptions.drain() {
            cancel();
        }
        for (_, cancel) in self.state.rules_subscriptions.drain() {
            cancel();
        }

        let (code, reason_text) = match reason {
            StopReason::Normal => (CLOSE_NORMAL, "normal_closure"),
            StopReason::Shutdown => (CLOSE_NORMAL, "server_shutdown"),
            StopReason::HeartbeatTimeout => (CLOSE_HEARTBEAT_TIMEOUT, "heartbeat_timeout"),
        };
        self.transport.close(code, reason_text);

        self.ctx
            .registry
            .deregister(&self.state.connection_id)
            .await;
        if let Some(limiter) = &self.ctx.rate_limiter {
            limiter.forget(&self.state.connection_id);
        }

        info!(
            connection = %self.state.connection_id,
            reason = ?reason,
            "connection closed"
        );
    }
}

/// The thing an operation acts on, for permission checks and the audit
/// trail: the bucket, query, subscription, rule, or user it names.
fn resource_for(req: &Request) -> String {
    for key in ["bucket", "query", "subscriptionId", "rule", "userId"] {
        if let Some(v) = req.fields.get(key).and_then(Value::as_str) {
            return v.to_string();
        }
    }
    String::new()
}
