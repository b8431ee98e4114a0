use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use serde_json::Value;
use tracing::info;

use fluxd::config::{FileConfig, ResolvedOptions};
use fluxd::store::memory::{bucket_all, MemoryStore};
use fluxd::{AuthConfig, Server, ServerConfig};

#[derive(Parser)]
#[command(
    name = "fluxd",
    about = "fluxd — real-time reactive data server",
    version
)]
struct Args {
    /// Listener host
    #[arg(long, env = "FLUXD_HOST")]
    host: Option<String>,

    /// Listener port (0 = ephemeral)
    #[arg(long, env = "FLUXD_PORT")]
    port: Option<u16>,

    /// Path to the TOML config file
    #[arg(long, env = "FLUXD_CONFIG", default_value = "fluxd.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "FLUXD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "FLUXD_LOG_FILE")]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Init once — must happen before any tracing calls.
    let log_level = args.log.as_deref().unwrap_or("info").to_owned();
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    let file = FileConfig::load(&args.config).unwrap_or_default();
    let opts = ResolvedOptions::new(file, args.host, args.port, args.log);

    // The standalone binary runs on the in-memory store with the generic
    // "all" query: subscribe with params {"bucket": "<name>"} to follow a
    // bucket. Library embedders wire their own store and queries.
    let store = Arc::new(MemoryStore::new());
    store.define_query("all", |buckets, params| {
        match params.get("bucket").and_then(Value::as_str) {
            Some(bucket) => bucket_all(buckets, bucket),
            None => Value::Array(Vec::new()),
        }
    });

    let mut config = ServerConfig::new(store);
    config.host = opts.host;
    config.port = opts.port;
    config.heartbeat = opts.heartbeat;
    config.rate_limit = opts.rate_limit;
    config.backpressure = opts.backpressure;
    config.audit = opts.audit;
    config.grace_period_ms = opts.grace_period_ms;
    config.auth = opts.admin_secret.as_deref().map(|secret| {
        let mut auth = AuthConfig::built_in(secret);
        auth.required = opts.auth_required;
        auth
    });

    if config.auth.is_none() {
        info!("no admin secret configured — authentication is disabled");
    }

    let server = Server::start(config).await?;
    info!(addr = %server.local_addr(), "fluxd ready");

    wait_for_shutdown().await;
    server.stop().await?;
    Ok(())
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// If the log directory cannot be created, falls back to stdout-only logging
/// with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("fluxd.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .compact()
                .init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}

/// Resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
