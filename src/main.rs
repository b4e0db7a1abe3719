//! OnChain Gateway - Main entry point
//!
//! This binary loads configuration, wires the gateway pipeline together, and
//! runs the HTTP server with all routes and middleware. The database is
//! optional; without `DB_URL` the durable cache tier and usage sink fall
//! back to memory-only operation.

use anyhow::{Context, Result};
use chrono::Local;
use onchain_gateway_rust::{
    api::{build_router, AppState},
    cache::{CacheStore, CacheTier, MemoryTier, PostgresTier, SensitiveContentFilter},
    core::config::{default_config_path, AppConfig},
    core::database::{Database, DatabaseConfig},
    core::metrics::init_metrics,
    services::{
        optimizer_from_name, Gateway, GatewayComponents, GatewayPolicy, KeyRegistry, PricingBook,
        PricingTable, ProviderRouter, QuotaLedger, SettlementGateway, SimulatedSettlement,
        UsageRecorder, UsageSink, WalletDirectory,
    },
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    // Detect optimal worker threads from environment or cgroup
    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(|| detect_cpu_limit().unwrap_or(1));

    println!("Tokio runtime: using {} worker threads", worker_threads);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

/// Custom time formatter that uses local timezone (respects TZ environment variable)
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S"))
    }
}

async fn async_main() -> Result<()> {
    // NO_COLOR disables ANSI codes for file logging
    let no_color = std::env::var("NO_COLOR").is_ok();
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    // Noise-suppression filters for hyper/h2/reqwest are always appended
    // so a plain RUST_LOG=debug cannot flood the output with chunked
    // transfer logs.
    let base_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info,onchain_gateway_rust=debug".to_string());
    let filter_str = format!(
        "{},hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn",
        base_filter
    );
    let filter = tracing_subscriber::EnvFilter::new(filter_str);

    if json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_timer(LocalTime))
            .init();
    } else if no_color {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(LocalTime)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_timer(LocalTime))
            .init();
    }

    init_metrics();

    let config_path = default_config_path();
    let config = AppConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;
    tracing::info!(
        "Configuration loaded: {} providers, {} credentials, {} quota tiers",
        config.providers.len(),
        config.credentials.len(),
        config.quotas.tiers.len()
    );

    let database = match DatabaseConfig::from_env() {
        Ok(db_config) => {
            tracing::info!("Connecting to database...");
            let db = Database::connect(&db_config)
                .await
                .context("Failed to connect to database")?;
            tracing::info!("Database connected, durable cache tier and usage sink enabled");
            Some(db)
        }
        Err(_) => {
            tracing::info!("DB_URL not set, running with in-memory storage only");
            None
        }
    };

    let host = config.server.host.clone();
    let port = config.server.port;

    let state = build_state(config, database.as_ref()).await?;
    spawn_maintenance_tasks(&state);

    let app = build_router(Arc::clone(&state));

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", host, port))?;
    tracing::info!("Starting OnChain Gateway on {}", addr);
    tracing::info!("Gateway API: POST /api/v1 (optimize, chat, wallet), GET /api/v1 (analytics, providers, info)");
    tracing::info!("Swagger UI: /docs");
    tracing::info!("Metrics endpoint: /metrics");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Drain the usage sink so no billing records are lost on the way out
    state.gateway.recorder.shutdown().await;
    tracing::info!("Shutdown complete");

    Ok(())
}

/// Wire every pipeline component together from configuration.
async fn build_state(config: AppConfig, database: Option<&Database>) -> Result<Arc<AppState>> {
    let registry = Arc::new(KeyRegistry::new());
    registry.sync_from_config(&config.credentials);

    let quotas = Arc::new(QuotaLedger::new(&config.quotas));

    let fast: Arc<dyn CacheTier> = Arc::new(MemoryTier::new(config.cache.fast_capacity));
    let durable: Arc<dyn CacheTier> = match database {
        Some(db) => Arc::new(
            PostgresTier::new(db.pool().clone())
                .await
                .context("Failed to initialize the durable cache tier")?,
        ),
        // Memory fallback sized relative to the fast tier
        None => Arc::new(MemoryTier::new(config.cache.fast_capacity * 4)),
    };
    let cache = Arc::new(CacheStore::new(
        fast,
        durable,
        SensitiveContentFilter::new(&config.cache.denylist),
        Duration::from_secs(config.cache.default_ttl_secs),
    ));

    let pricing = Arc::new(PricingBook::new(PricingTable::from_config(&config.pricing)));

    let providers = config.enabled_providers();
    tracing::info!(
        "Provider chain: {}",
        providers
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    );
    let router = Arc::new(ProviderRouter::new(
        create_http_client(&config),
        providers,
        Arc::clone(&pricing),
    ));

    let optimizer = optimizer_from_name(&config.optimizer.strategy)
        .with_context(|| format!("Unknown optimizer strategy: {}", config.optimizer.strategy))?;
    tracing::info!("Prompt optimizer: {}", config.optimizer.strategy);

    let sink = database.map(|db| UsageSink::new(db.pool().clone(), &config.usage));
    let recorder = Arc::new(UsageRecorder::new(&config.usage, sink));

    let settlement = config
        .settlement
        .enabled
        .then(|| Arc::new(SimulatedSettlement) as Arc<dyn SettlementGateway>);

    let policy = GatewayPolicy::from_config(&config);
    let gateway = Arc::new(Gateway::new(
        GatewayComponents {
            registry,
            quotas,
            cache,
            optimizer,
            router,
            pricing,
            recorder,
            settlement,
            wallets: Arc::new(WalletDirectory::new()),
        },
        policy,
    ));

    Ok(Arc::new(AppState {
        config,
        gateway,
        started_at: Instant::now(),
    }))
}

/// Periodic upkeep: quota window sweep and cache expiry purge.
fn spawn_maintenance_tasks(state: &Arc<AppState>) {
    let gateway = Arc::clone(&state.gateway);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            gateway.quotas.sweep();
            let (fast, durable) = gateway.cache.purge_expired().await;
            if fast + durable > 0 {
                tracing::debug!(fast, durable, "purged expired cache entries");
            }
        }
    });
}

/// Create the shared upstream HTTP client with connection pooling.
/// Per-attempt timeouts are applied by the router, not here.
fn create_http_client(config: &AppConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(!config.server.verify_ssl)
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .tcp_keepalive(std::time::Duration::from_secs(60))
        .http2_keep_alive_interval(std::time::Duration::from_secs(30))
        .http2_keep_alive_timeout(std::time::Duration::from_secs(10))
        .build()
        .expect("Failed to build HTTP client")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining...");
}

/// Detect CPU limit from cgroup (for containerized environments)
fn detect_cpu_limit() -> Option<usize> {
    // Try cgroup v2 first
    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        let parts: Vec<&str> = max.split_whitespace().collect();
        if parts.len() == 2 {
            if let (Ok(quota), Ok(period)) = (parts[0].parse::<i64>(), parts[1].parse::<i64>()) {
                if quota > 0 {
                    let cores = ((quota as f64 / period as f64).ceil() as usize).max(1);
                    println!("Detected CPU limit from cgroup v2: {} cores", cores);
                    return Some(cores);
                }
            }
        }
    }

    // Fallback to cgroup v1
    let quota = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;

    let period = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;

    if quota > 0 {
        let cores = ((quota as f64 / period as f64).ceil() as usize).max(1);
        println!("Detected CPU limit from cgroup v1: {} cores", cores);
        Some(cores)
    } else {
        None
    }
}
