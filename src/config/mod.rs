use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::error;

use crate::audit::{AuditConfig, Tier, DEFAULT_MAX_ENTRIES};
use crate::identity::BuiltInIdentity;
use crate::rate_limit::RateLimitConfig;
use crate::store::{PermissionChecker, RulesEngine, Store, TokenValidator};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 4800;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_HIGH_WATER_MARK: usize = 1024 * 1024;
const DEFAULT_GRACE_PERIOD_MS: u64 = 0;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

// ─── Runtime configuration ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HeartbeatConfig {
    /// How often the worker sends a `ping` frame.
    pub interval_ms: u64,
    /// How long without a `pong` before the connection closes with 4001.
    pub timeout_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BackpressureConfig {
    /// Outbound bytes queued on the transport above which pushes are
    /// dropped. Responses are never dropped.
    pub high_water_mark: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

/// Authentication setup. Presence enables the auth gate.
#[derive(Clone)]
pub struct AuthConfig {
    pub validator: Arc<dyn TokenValidator>,
    /// When `false` the gate is advisory: requests pass without a session,
    /// but login still works and sessions still expire.
    pub required: bool,
    /// Set when built-in identity mode backs the validator; enables the
    /// `identity.*` operations.
    pub built_in: Option<Arc<BuiltInIdentity>>,
}

impl AuthConfig {
    pub fn external(validator: Arc<dyn TokenValidator>) -> Self {
        Self {
            validator,
            required: true,
            built_in: None,
        }
    }

    /// Built-in identity mode bootstrapped from an admin secret.
    pub fn built_in(admin_secret: &str) -> Self {
        let identity = Arc::new(BuiltInIdentity::new(admin_secret));
        Self {
            validator: identity.clone(),
            required: true,
            built_in: Some(identity),
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Everything a [`crate::server::Server`] needs: the listener address, the
/// external collaborators, and the per-connection tunables.
#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    /// 0 selects an ephemeral port.
    pub port: u16,
    pub store: Arc<dyn Store>,
    pub rules: Option<Arc<dyn RulesEngine>>,
    pub auth: Option<AuthConfig>,
    pub permissions: Option<Arc<dyn PermissionChecker>>,
    pub rate_limit: Option<RateLimitConfig>,
    pub heartbeat: HeartbeatConfig,
    pub backpressure: BackpressureConfig,
    pub audit: AuditConfig,
    /// Graceful-shutdown window. 0 means immediate.
    pub grace_period_ms: u64,
    /// Bound on a single worker's terminate during forced shutdown.
    pub shutdown_timeout_ms: u64,
}

impl ServerConfig {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            store,
            rules: None,
            auth: None,
            permissions: None,
            rate_limit: None,
            heartbeat: HeartbeatConfig::default(),
            backpressure: BackpressureConfig::default(),
            audit: AuditConfig::default(),
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }

    /// Whether new connections are told they must authenticate.
    pub fn requires_auth(&self) -> bool {
        self.auth.as_ref().is_some_and(|a| a.required)
    }
}

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `fluxd.toml` — all fields are optional overrides.
/// Priority: CLI / env var  >  TOML  >  built-in default.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    /// Log level filter string, e.g. "debug", "info,fluxd=trace".
    log: Option<String>,
    grace_period_ms: Option<u64>,
    heartbeat: Option<HeartbeatConfig>,
    rate_limit: Option<RateLimitConfig>,
    backpressure: Option<BackpressureConfig>,
    audit: Option<FileAuditConfig>,
    auth: Option<FileAuthConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct FileAuditConfig {
    /// Recorded tiers, e.g. `["admin", "write"]`.
    tiers: Option<Vec<Tier>>,
    max_entries: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct FileAuthConfig {
    required: Option<bool>,
    /// Enables built-in identity mode when set.
    admin_secret: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Option<Self> {
        let contents = std::fs::read_to_string(path).ok()?;
        match toml::from_str::<FileConfig>(&contents) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                error!(path = %path.display(), err = %e, "failed to parse config file — using defaults");
                None
            }
        }
    }
}

/// File + CLI options resolved into the pieces `main` needs to assemble a
/// [`ServerConfig`]. The store and any external collaborators are wired in
/// code, not in the file.
pub struct ResolvedOptions {
    pub host: String,
    pub port: u16,
    pub log: String,
    pub grace_period_ms: u64,
    pub heartbeat: HeartbeatConfig,
    pub rate_limit: Option<RateLimitConfig>,
    pub backpressure: BackpressureConfig,
    pub audit: AuditConfig,
    pub auth_required: bool,
    pub admin_secret: Option<String>,
}

impl ResolvedOptions {
    pub fn new(
        file: FileConfig,
        cli_host: Option<String>,
        cli_port: Option<u16>,
        cli_log: Option<String>,
    ) -> Self {
        let admin_secret = std::env::var("FLUXD_ADMIN_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| file.auth.as_ref().and_then(|a| a.admin_secret.clone()));

        let file_audit = file.audit.unwrap_or_default();
        let audit = AuditConfig {
            tiers: file_audit
                .tiers
                .map(HashSet::from_iter)
                .unwrap_or_else(|| HashSet::from([Tier::Admin])),
            max_entries: file_audit.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES),
            sink: None,
        };

        Self {
            host: cli_host
                .or(file.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: cli_port.or(file.port).unwrap_or(DEFAULT_PORT),
            log: cli_log.or(file.log).unwrap_or_else(|| "info".to_string()),
            grace_period_ms: file.grace_period_ms.unwrap_or(DEFAULT_GRACE_PERIOD_MS),
            heartbeat: file.heartbeat.unwrap_or_default(),
            rate_limit: file.rate_limit,
            backpressure: file.backpressure.unwrap_or_default(),
            audit,
            auth_required: file.auth.as_ref().and_then(|a| a.required).unwrap_or(true),
            admin_secret,
        }
    }
}
