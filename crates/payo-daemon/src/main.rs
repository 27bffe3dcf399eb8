//! payo-daemon entry point.
//!
//! Loads config and secrets, opens the store, boots the agent and serves the
//! local UI API on a loopback address until ctrl-c.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{bail, Context};
use axum::http::{HeaderValue, Method};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, warn, Level};

use payo_audit::TamperLog;
use payo_config::{load_layered_yaml, report_unused_keys, resolve_secrets, UnusedKeyPolicy};
use payo_daemon::{platform::ShellDevice, routes, state};
use payo_db::SqliteStore;
use payo_runtime::{Agent, AgentDeps, AgentSettings};
use payo_transport::{HeartbeatTransport, HttpBackend, RetryPolicy};

const ENV_CONFIG_PATHS: &str = "PAYO_CONFIG";
const ENV_DAEMON_ADDR: &str = "PAYO_DAEMON_ADDR";
const ENV_BRIDGE_COMPONENT: &str = "PAYO_BRIDGE_COMPONENT";
const DEFAULT_CONFIG_PATH: &str = "config/agent.yaml";
const DEFAULT_BRIDGE_COMPONENT: &str = "com.payo.agent/.PolicyReceiver";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Silent if the file does not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let paths_raw =
        std::env::var(ENV_CONFIG_PATHS).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let paths: Vec<&str> = paths_raw.split(',').map(str::trim).filter(|p| !p.is_empty()).collect();
    let loaded = load_layered_yaml(&paths)?;
    let unused = report_unused_keys(&loaded.config_json, UnusedKeyPolicy::Warn)?;
    for key in &unused.unused_leaf_pointers {
        warn!(key = %key, "config key is not read by the agent");
    }
    let cfg = loaded.agent()?;
    let secrets = resolve_secrets(&loaded.config_json)?;
    info!(config_hash = %loaded.config_hash, "config loaded");

    let pool = payo_db::connect(&cfg.storage.db_path).await?;
    payo_db::migrate(&pool).await?;
    let registration = payo_db::load_registration(&pool).await?;

    let device_id = match (&registration, &cfg.device_id) {
        (Some(r), _) => r.device_id.clone(),
        (None, Some(id)) => id.clone(),
        (None, None) => bail!(
            "REGISTRATION_MISSING: no device registration and no device.device_id in config"
        ),
    };
    let registered_sims = registration
        .as_ref()
        .map(|r| r.sim_serials.clone())
        .unwrap_or_default();

    let store = Arc::new(SqliteStore::new(pool.clone()));
    let backend = HttpBackend::new(
        cfg.backend.base_url.clone(),
        Duration::from_millis(cfg.backend.timeout_ms),
        secrets.api_key.clone(),
        secrets.signing_secret.clone(),
    )
    .context("backend client")?;
    let transport = Arc::new(HeartbeatTransport::new(
        Arc::new(backend),
        store.clone(),
        store.clone(),
        RetryPolicy {
            base: Duration::from_millis(cfg.retry.base_ms),
            factor: cfg.retry.factor,
            max_attempts: cfg.retry.max_attempts,
        },
    ));

    let component = std::env::var(ENV_BRIDGE_COMPONENT)
        .unwrap_or_else(|_| DEFAULT_BRIDGE_COMPONENT.to_string());
    let device = Arc::new(ShellDevice::new(component));
    let tamper_log = match TamperLog::open(&cfg.storage.tamper_log_path) {
        Ok(log) => Some(log),
        Err(e) => {
            warn!(error = %e, path = %cfg.storage.tamper_log_path, "tamper log unavailable");
            None
        }
    };

    let deps = AgentDeps {
        device_id,
        probe: device.clone(),
        policy: device.clone(),
        admin: device.clone(),
        info: device,
        lock_store: store.clone(),
        schedule_store: store.clone(),
        ledger: store.clone(),
        registration: store,
        transport,
        tamper_log,
        listeners: Vec::new(),
    };
    let agent = Agent::build(deps, AgentSettings::from_config(&cfg, &registered_sims))
        .await
        .context("agent boot")?;
    info!(
        lock_state = %agent.boot_record.state.as_str(),
        seq = agent.boot_record.seq,
        "agent booted"
    );
    let handle = agent.start();

    let shared = Arc::new(state::AppState::from_handle(&handle));
    state::spawn_lock_forwarder(Arc::clone(&shared));
    state::spawn_notice_forwarder(Arc::clone(&shared), handle.subscribe(), Some(pool));

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr(&cfg.daemon_addr)?;
    info!("payo-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server crashed")?;

    info!("shutting down agent");
    handle.shutdown().await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// Env overrides config. Anything but a loopback address is refused.
fn bind_addr(configured: &str) -> anyhow::Result<SocketAddr> {
    let raw = std::env::var(ENV_DAEMON_ADDR).unwrap_or_else(|_| configured.to_string());
    let addr: SocketAddr = raw
        .parse()
        .with_context(|| format!("invalid daemon address: {raw}"))?;
    if !addr.ip().is_loopback() {
        bail!("daemon address must be loopback, got {addr}");
    }
    Ok(addr)
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:8899",
        "http://127.0.0.1:8899",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
