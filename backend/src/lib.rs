pub mod auth;
pub mod cache;
pub mod config;
pub mod database;
pub mod directions;
pub mod directions_handlers;
pub mod error;
pub mod geocoding;
pub mod geocoding_handlers;
pub mod graph;
pub mod isochrone;
pub mod isochrone_handlers;
pub mod loader;
pub mod matrix;
pub mod matrix_handlers;
pub mod solver;
pub mod store;
#[cfg(feature = "test-helpers")]
pub mod test_support;
pub mod usage;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::{
    cache::GraphCache,
    config::AppConfig,
    directions::DirectionsService,
    error::ServiceError,
    geocoding::GeocodingClient,
    isochrone::IsochroneService,
    usage::{track_usage, ApiKind, UsageTracker},
};
use shared::{Profile, SUPPORTED_MODES};

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<GraphCache>,
    pub isochrones: Arc<IsochroneService>,
    pub directions: Arc<DirectionsService>,
    pub geocoder: Arc<GeocodingClient>,
    pub tracker: Arc<UsageTracker>,
    pub config: Arc<AppConfig>,
}

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let directions_routes = Router::new()
        .route("/route", post(directions_handlers::route))
        .route("/simple", post(directions_handlers::simple))
        .route("/route_pdp", post(directions_handlers::route_pdp))
        .route("/modes", get(directions_handlers::modes))
        .layer(middleware::from_fn_with_state(
            state.tracker.bind(ApiKind::Routing),
            track_usage,
        ));

    let matrix_routes = Router::new()
        .route("/calculate", post(matrix_handlers::calculate))
        .layer(middleware::from_fn_with_state(
            state.tracker.bind(ApiKind::Matrix),
            track_usage,
        ));

    let isochrone_routes = Router::new()
        .route("/calculate", post(isochrone_handlers::calculate))
        .route("/geojson", post(isochrone_handlers::geojson))
        .route("/compare", post(isochrone_handlers::compare))
        .route("/stats", post(isochrone_handlers::stats))
        .route("/batch", post(isochrone_handlers::batch))
        .route("/cache/status", get(isochrone_handlers::cache_status))
        .route("/cache/clear", post(isochrone_handlers::cache_clear))
        .route("/preload", post(isochrone_handlers::preload))
        .layer(middleware::from_fn_with_state(
            state.tracker.bind(ApiKind::Isochrone),
            track_usage,
        ));

    let geocoding_routes = Router::new()
        .route("/geocode", post(geocoding_handlers::geocode))
        .route("/reverse", post(geocoding_handlers::reverse))
        .route("/batch", post(geocoding_handlers::batch))
        .layer(middleware::from_fn_with_state(
            state.tracker.bind(ApiKind::Geocoding),
            track_usage,
        ));

    Router::new()
        .nest("/api/directions", directions_routes)
        .nest("/api/matrix", matrix_routes)
        .nest("/api/isochrone", isochrone_routes)
        .nest("/api/geocoding", geocoding_routes)
        .route("/health", get(health))
        .layer(cors)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Normalizes a request-level transport mode; absence means driving.
pub(crate) fn parse_mode(mode: Option<&str>) -> Result<Profile, ServiceError> {
    match mode {
        None => Ok(Profile::Driving),
        Some(raw) => Ok(Profile::parse(raw)?),
    }
}

pub(crate) fn supported_modes_json() -> serde_json::Value {
    json!({
        "supported_modes": SUPPORTED_MODES,
        "default": Profile::Driving.as_str(),
        "aliases": {
            "driving": ["car", "auto", "drive"],
            "walking": ["walk", "foot", "pedestrian"],
            "cycling": ["bike", "cycle", "bicycle"],
        },
        "default_speeds_kph": {
            "driving": Profile::Driving.default_speed_kph(),
            "walking": Profile::Walking.default_speed_kph(),
            "cycling": Profile::Cycling.default_speed_kph(),
        },
    })
}
