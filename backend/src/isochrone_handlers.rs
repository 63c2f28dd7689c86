use axum::{extract::State, http::HeaderMap, Json};
use geojson::{FeatureCollection, JsonObject};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared::{
    Coordinate, IsochroneBatchRequest, IsochroneCompareRequest, IsochroneRequest, IsochroneResult,
    PreloadRequest, Profile,
};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::CacheStatus,
    error::ServiceError,
    isochrone::{
        band_statistics, to_feature_collection, AreaGrowth, BandStats, BatchResponse,
        CompareResponse, PreloadResponse,
    },
    AppState,
};

const MAX_TRAVEL_TIMES: usize = 10;
const MAX_TRAVEL_TIME_MIN: f64 = 120.0;
const MAX_BATCH_LOCATIONS: usize = 10;
const MAX_COMPARE_MODES: usize = 3;
const MAX_PRELOAD_LOCATIONS: usize = 20;

fn validate_center(lat: f64, lon: f64) -> Result<Coordinate, ServiceError> {
    let center = Coordinate::new(lat, lon);
    if !center.is_valid() {
        return Err(ServiceError::bad_request(
            "latitude must be within [-90, 90] and longitude within [-180, 180]",
        ));
    }
    Ok(center)
}

fn validate_travel_times(times: &[f64]) -> Result<(), ServiceError> {
    if times.is_empty() {
        return Err(ServiceError::bad_request(
            "travel_times must be a non-empty list",
        ));
    }
    if times.len() > MAX_TRAVEL_TIMES {
        return Err(ServiceError::bad_request(format!(
            "maximum {MAX_TRAVEL_TIMES} travel times allowed"
        )));
    }
    if times
        .iter()
        .any(|t| !t.is_finite() || *t <= 0.0 || *t > MAX_TRAVEL_TIME_MIN)
    {
        return Err(ServiceError::bad_request(format!(
            "travel times must be positive numbers <= {MAX_TRAVEL_TIME_MIN} minutes"
        )));
    }
    Ok(())
}

fn validate_tolerance(tolerance: f64) -> Result<(), ServiceError> {
    if !tolerance.is_finite() || tolerance < 0.0 {
        return Err(ServiceError::bad_request(
            "simplify_tolerance must be a non-negative number",
        ));
    }
    Ok(())
}

fn parse_travel_mode(mode: &str) -> Result<Profile, ServiceError> {
    Ok(Profile::parse(mode)?)
}

#[derive(Debug, Serialize)]
pub struct CalculateResponse {
    #[serde(flatten)]
    pub result: IsochroneResult,
    pub cache_info: CacheInfo,
}

#[derive(Debug, Serialize)]
pub struct CacheInfo {
    pub memory_graphs: usize,
    pub max_memory_graphs: usize,
}

pub async fn calculate(
    State(state): State<AppState>,
    Json(req): Json<IsochroneRequest>,
) -> Result<Json<CalculateResponse>, ServiceError> {
    let center = validate_center(req.latitude, req.longitude)?;
    validate_travel_times(&req.travel_times)?;
    validate_tolerance(req.simplify_tolerance)?;
    let profile = parse_travel_mode(&req.travel_mode)?;

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let result = state
        .isochrones
        .calculate(center, &req.travel_times, profile, req.simplify_tolerance, &cancel)
        .await?;

    let (memory_graphs, max_memory_graphs) = state.cache.memory_usage().await;
    Ok(Json(CalculateResponse {
        result: result.as_ref().clone(),
        cache_info: CacheInfo {
            memory_graphs,
            max_memory_graphs,
        },
    }))
}

pub async fn geojson(
    State(state): State<AppState>,
    Json(req): Json<IsochroneRequest>,
) -> Result<Json<FeatureCollection>, ServiceError> {
    let center = validate_center(req.latitude, req.longitude)?;
    validate_travel_times(&req.travel_times)?;
    validate_tolerance(req.simplify_tolerance)?;
    let profile = parse_travel_mode(&req.travel_mode)?;

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let result = state
        .isochrones
        .calculate(center, &req.travel_times, profile, req.simplify_tolerance, &cancel)
        .await?;

    let mut collection = to_feature_collection(&result);
    let mut foreign = JsonObject::new();
    foreign.insert("center".into(), json!(result.center));
    foreign.insert("travel_mode".into(), json!(result.travel_mode));
    foreign.insert(
        "processing_time_seconds".into(),
        json!(result.processing_time_seconds),
    );
    collection.foreign_members = Some(foreign);
    Ok(Json(collection))
}

pub async fn compare(
    State(state): State<AppState>,
    Json(req): Json<IsochroneCompareRequest>,
) -> Result<Json<CompareResponse>, ServiceError> {
    let center = validate_center(req.latitude, req.longitude)?;
    validate_travel_times(std::slice::from_ref(&req.travel_time))?;
    validate_tolerance(req.simplify_tolerance)?;

    if req.travel_modes.is_empty() {
        return Err(ServiceError::bad_request("travel_modes must not be empty"));
    }
    if req.travel_modes.len() > MAX_COMPARE_MODES {
        return Err(ServiceError::bad_request(format!(
            "maximum {MAX_COMPARE_MODES} travel modes allowed"
        )));
    }
    let mut profiles = Vec::with_capacity(req.travel_modes.len());
    for mode in &req.travel_modes {
        let profile = parse_travel_mode(mode)?;
        if !profiles.contains(&profile) {
            profiles.push(profile);
        }
    }

    let response = state
        .isochrones
        .compare(center, req.travel_time, &profiles, req.simplify_tolerance)
        .await;
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub center: Coordinate,
    pub travel_mode: String,
    pub statistics: Vec<BandStats>,
    pub area_growth_analysis: Vec<AreaGrowth>,
    pub processing_time_seconds: f64,
}

pub async fn stats(
    State(state): State<AppState>,
    Json(req): Json<IsochroneRequest>,
) -> Result<Json<StatsResponse>, ServiceError> {
    let center = validate_center(req.latitude, req.longitude)?;
    validate_travel_times(&req.travel_times)?;
    let profile = parse_travel_mode(&req.travel_mode)?;

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let result = state
        .isochrones
        .calculate(center, &req.travel_times, profile, req.simplify_tolerance, &cancel)
        .await?;

    let (statistics, area_growth_analysis) = band_statistics(&result);
    Ok(Json(StatsResponse {
        center: result.center,
        travel_mode: result.travel_mode.clone(),
        statistics,
        area_growth_analysis,
        processing_time_seconds: result.processing_time_seconds,
    }))
}

pub async fn batch(
    State(state): State<AppState>,
    Json(req): Json<IsochroneBatchRequest>,
) -> Result<Json<BatchResponse>, ServiceError> {
    if req.locations.is_empty() {
        return Err(ServiceError::bad_request("locations must be a non-empty list"));
    }
    if req.locations.len() > MAX_BATCH_LOCATIONS {
        return Err(ServiceError::bad_request(format!(
            "maximum {MAX_BATCH_LOCATIONS} locations allowed"
        )));
    }
    for (i, location) in req.locations.iter().enumerate() {
        validate_center(location.latitude, location.longitude)
            .map_err(|_| ServiceError::bad_request(format!("location {i} is invalid")))?;
    }
    validate_travel_times(&req.travel_times)?;
    validate_tolerance(req.simplify_tolerance)?;
    let profile = parse_travel_mode(&req.travel_mode)?;

    let response = state
        .isochrones
        .batch(&req.locations, req.travel_times, profile, req.simplify_tolerance)
        .await;
    Ok(Json(response))
}

pub async fn cache_status(State(state): State<AppState>) -> Json<CacheStatus> {
    Json(state.cache.status().await)
}

#[derive(Debug, Deserialize)]
pub struct CacheClearRequest {
    #[serde(default = "default_true")]
    pub clear_memory: bool,
    #[serde(default)]
    pub clear_disk: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CacheClearRequest {
    fn default() -> Self {
        Self {
            clear_memory: true,
            clear_disk: false,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CacheClearResponse {
    pub cleared: Vec<String>,
}

/// Clearing the cache mutates shared state; an authenticated identity is
/// required.
pub async fn cache_clear(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<CacheClearRequest>>,
) -> Result<Json<CacheClearResponse>, ServiceError> {
    if state.tracker.auth().identity(&headers).is_none() {
        return Err(ServiceError::Unauthorized);
    }
    let req = body.map(|Json(req)| req).unwrap_or_default();

    let mut cleared = Vec::new();
    if req.clear_memory {
        let count = state.cache.clear_memory().await;
        cleared.push(format!("memory cache ({count} graphs)"));
    }
    if req.clear_disk {
        let store = state.cache.store().clone();
        let count = tokio::task::spawn_blocking(move || store.clear())
            .await
            .map_err(|_| ServiceError::Internal)?
            .map_err(|err| {
                tracing::error!(error = %err, "disk cache clear failed");
                ServiceError::Internal
            })?;
        cleared.push(format!("disk cache ({count} files)"));
    }
    Ok(Json(CacheClearResponse { cleared }))
}

pub async fn preload(
    State(state): State<AppState>,
    Json(req): Json<PreloadRequest>,
) -> Result<Json<PreloadResponse>, ServiceError> {
    if req.locations.is_empty() {
        return Err(ServiceError::bad_request("no locations specified"));
    }
    if req.locations.len() > MAX_PRELOAD_LOCATIONS {
        return Err(ServiceError::bad_request(format!(
            "maximum {MAX_PRELOAD_LOCATIONS} locations allowed for preloading"
        )));
    }
    for (i, location) in req.locations.iter().enumerate() {
        validate_center(location.latitude, location.longitude)
            .map_err(|_| ServiceError::bad_request(format!("location {i} is invalid")))?;
    }
    if req.radii_m.iter().any(|r| !r.is_finite() || *r <= 0.0) {
        return Err(ServiceError::bad_request("radii must be positive"));
    }
    let mut profiles = Vec::with_capacity(req.travel_modes.len());
    for mode in &req.travel_modes {
        let profile = parse_travel_mode(mode)?;
        if !profiles.contains(&profile) {
            profiles.push(profile);
        }
    }

    let response = state
        .isochrones
        .preload(&req.locations, &profiles, &req.radii_m)
        .await;
    Ok(Json(response))
}
