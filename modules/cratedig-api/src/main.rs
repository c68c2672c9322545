use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{routing::get, Router};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cratedig_common::Config;
use cratedig_crawler::{BandcampFetcher, CrawlConfig, JobRegistry, Orchestrator};
use cratedig_graph::GraphStore;

mod routes;

pub struct AppState {
    pub orchestrator: Orchestrator<BandcampFetcher>,
    pub registry: Arc<JobRegistry>,
    pub config: Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("cratedig=info".parse()?))
        .init();

    let config = Config::from_env();

    let store = GraphStore::connect(&config.database_url).await?;
    store.migrate().await?;
    info!(database = config.database_url.as_str(), "Store ready");

    let fetcher = Arc::new(BandcampFetcher::new(
        Duration::from_secs(config.fetch_timeout_secs),
        config.page_size,
    ));
    let crawl_config = CrawlConfig {
        stale_days: config.stale_days,
        stage_workers: config.crawl_workers,
        ..CrawlConfig::default()
    };
    let orchestrator = Orchestrator::new(
        store.clone(),
        fetcher,
        config.crawl_workers,
        crawl_config,
    );

    if config.background_refresh {
        let refresher = orchestrator.clone();
        tokio::spawn(async move {
            if let Err(err) = refresher.run_background_refresh().await {
                warn!(error = %err, "Background refresh stopped");
            }
        });
        info!("Background refresh enabled");
    }

    let state = Arc::new(AppState {
        orchestrator,
        registry: JobRegistry::new(),
        config: config.clone(),
    });

    let app = Router::new()
        // Health check
        .route("/", get(|| async { "ok" }))
        // Polling API
        .route("/api/get_user", get(routes::get_user))
        .route("/api/get_status", get(routes::get_status))
        .route("/api/get_recommendations", get(routes::get_recommendations))
        .with_state(state)
        // CORS
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        // Logging layer: method + path + status + latency only
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

    let addr = format!("{}:{}", config.host, config.port);
    info!("cratedig API starting on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
