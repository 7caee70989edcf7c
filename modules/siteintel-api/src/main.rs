use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use siteintel_common::{Config, TargetSchema};
use siteintel_engine::{
    FileConfig, Orchestrator, OrchestratorDeps, OrchestratorSettings, ScraperRegistry,
};
use siteintel_store::PgStore;

mod error;
mod rest;

pub struct AppState {
    pub orchestrator: Orchestrator,
}

fn init_tracing() -> Result<()> {
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let filter = EnvFilter::from_default_env().add_directive("siteintel=info".parse()?);
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

fn load_registry(config: &Config) -> Result<(ScraperRegistry, TargetSchema)> {
    let Some(path) = &config.scrapers_config else {
        warn!("SCRAPERS_CONFIG not set; starting with no scrapers registered");
        return Ok((ScraperRegistry::new(), TargetSchema::default()));
    };
    let file_config = FileConfig::load(path)?;
    let registry = ScraperRegistry::from_file_config(
        &file_config,
        Duration::from_secs(config.adapter_timeout_secs),
    )?;
    Ok((registry, file_config.schema.unwrap_or_default()))
}

/// Purge expired locks and cached results on a fixed interval.
fn start_sweeper(orchestrator: Orchestrator, every: Duration) {
    info!(interval_secs = every.as_secs(), "Starting lock and result sweeper");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            if let Err(e) = orchestrator.sweep().await {
                warn!(error = %e, "Sweep failed");
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing()?;

    let config = Config::from_env()?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(20)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    let store = Arc::new(PgStore::new(pool));
    store.migrate().await.context("Failed to run migrations")?;

    let (registry, schema) = load_registry(&config)?;
    let deps = OrchestratorDeps::builder()
        .sessions(store.clone())
        .locks(store.clone())
        .results(store.clone())
        .snapshots(store)
        .registry(Arc::new(registry))
        .schema(schema)
        .settings(OrchestratorSettings::from_config(&config))
        .build();
    let orchestrator = Orchestrator::new(deps);

    start_sweeper(
        orchestrator.clone(),
        Duration::from_secs(config.lock_ttl_secs.max(5)),
    );

    let state = Arc::new(AppState { orchestrator });
    let app = rest::router(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(
                |request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                },
            ),
        );

    let addr = format!("{}:{}", config.api_host, config.api_port);
    info!("siteintel API starting on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
