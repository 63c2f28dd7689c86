use std::{sync::Arc, time::Duration};

use backend::{
    auth::AuthContext,
    cache::GraphCache,
    config::AppConfig,
    create_router,
    database::{PgUsageSink, UsageSink},
    directions::{DirectionsService, OsrmClient},
    geocoding::GeocodingClient,
    isochrone::IsochroneService,
    loader::OverpassLoader,
    store::GraphStore,
    usage::UsageTracker,
    AppState,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Disk graphs older than this are removed at startup.
const GRAPH_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 3600);

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "backend=debug,axum::rejection=trace".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env().expect("invalid configuration");

    let store = Arc::new(GraphStore::open(&config.cache_root).expect("graph store"));
    match store.remove_older_than(GRAPH_MAX_AGE) {
        Ok(0) => {}
        Ok(removed) => tracing::info!(removed, "cleaned up stale graph files"),
        Err(err) => tracing::warn!(error = %err, "graph store cleanup failed"),
    }

    let fetcher = Arc::new(OverpassLoader::new(
        config.overpass_url.clone(),
        config.max_graph_nodes,
    ));
    let cache = GraphCache::spawn(
        store,
        fetcher,
        config.max_memory_graphs,
        config.prefetch_queue_capacity,
    );

    let sink: Option<Arc<dyn UsageSink>> = match &config.database_url {
        Some(url) => match PgUsageSink::connect(url).await {
            Ok(sink) => {
                if let Err(err) = sink.migrate().await {
                    tracing::error!(error = %err, "migration failed, usage tracking disabled");
                    None
                } else {
                    Some(Arc::new(sink))
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "database unavailable, usage tracking disabled");
                None
            }
        },
        None => {
            tracing::warn!("DATABASE_URL not set, usage tracking disabled");
            None
        }
    };
    let tracker = Arc::new(UsageTracker::new(sink, AuthContext::new(&config.jwt_secret)));

    let state = AppState {
        isochrones: Arc::new(IsochroneService::new(cache.clone())),
        directions: Arc::new(DirectionsService::new(
            OsrmClient::new(config.osrm_url.clone()),
            cache.clone(),
        )),
        geocoder: Arc::new(GeocodingClient::new(config.nominatim_url.clone())),
        tracker,
        config: Arc::new(config),
        cache,
    };

    let addr = state.config.bind_addr;
    let cache = state.cache.clone();
    let app = create_router(state);

    tracing::info!("starting backend on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await.expect("bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server");

    cache.shutdown();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
