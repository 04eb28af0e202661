//! Herald API server binary entrypoint.

use std::net::SocketAddr;
use std::time::Duration;

use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_common::db::{PoolSettings, create_pool, run_migrations};
use herald_common::redis_pool::create_consumer_connection;
use herald_engine::analytics::{retention_cutoff, spawn_retention};
use herald_engine::clock::spawn_clock;
use herald_engine::ingest::run_redis_source;
use herald_engine::rules::{default_rule_specs, load_rule_specs};
use herald_engine::template::TemplateStore;

use herald_api::routes::create_router;
use herald_api::state::{AppState, Storage};

const MAX_BODY_BYTES: usize = 256 * 1024;
const RETENTION_PERIOD: Duration = Duration::from_secs(3600);

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("herald_api=debug,herald_engine=debug,herald_notifier=debug,tower_http=debug")
    });

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    tracing::info!("Starting Herald API server...");

    let config = AppConfig::from_env()?;

    let storage = match &config.database_url {
        Some(url) => {
            let pool = create_pool(url, &PoolSettings::from_config(&config)).await?;
            run_migrations(&pool).await?;
            tracing::info!("Database pool created");
            Storage::postgres(pool)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, subscriptions and deliveries are kept in memory");
            Storage::memory()
        }
    };

    let templates = match &config.templates_path {
        Some(path) => TemplateStore::from_file(path)?,
        None => TemplateStore::with_defaults(),
    };
    let rule_specs = match &config.rules_path {
        Some(path) => load_rule_specs(path)?,
        None => default_rule_specs(),
    };

    let (state, pipeline_tasks) = AppState::build(config.clone(), storage, templates, rule_specs)?;
    tracing::info!(rules = state.rules.rule_count(), "Rule engine ready");

    // Warm analytics from the persisted log
    let history = state
        .delivery_log
        .since(retention_cutoff(chrono::Utc::now()))
        .await?;
    state.analytics.rebuild(&history);
    tracing::info!(records = history.len(), "Analytics rebuilt");
    let retention = spawn_retention(
        state.analytics.clone(),
        state.delivery_log.clone(),
        RETENTION_PERIOD,
    );

    let sweeper = state
        .registry
        .spawn_sweeper(Duration::from_secs(config.sweep_interval_secs.max(1)));
    let clock = spawn_clock(state.pipeline.clone(), state.local_offset);

    let redis_source = match &config.redis_url {
        Some(url) => {
            let conn = create_consumer_connection(url, &config.redis_event_key).await?;
            tracing::info!("Redis connection established");
            let pipeline = state.pipeline.clone();
            let key = config.redis_event_key.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = run_redis_source(conn, key, pipeline).await {
                    tracing::error!(error = %e, "Redis event source stopped");
                }
            }))
        }
        None => None,
    };

    let registry = state.registry.clone();
    let app = create_router(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = config.bind_addr.parse()?;
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            let closing = registry.shutdown_all();
            tracing::info!(connections = closing, "Shutting down");
        })
        .await?;

    // Stop the producers so the pipeline drains and its stages exit
    clock.abort();
    sweeper.abort();
    retention.abort();
    if let Some(source) = redis_source {
        source.abort();
    }
    pipeline_tasks.join().await;

    Ok(())
}
