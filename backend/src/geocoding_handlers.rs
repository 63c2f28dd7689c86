use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use shared::{ApiError, BatchGeocodeRequest, GeocodeRequest, ReverseGeocodeRequest};

use crate::{
    error::ServiceError,
    geocoding::{BatchOutcome, GeocodeError},
    loader::FetchError,
    AppState,
};

const MAX_BATCH_ADDRESSES: usize = 10;

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ApiError::new("location not found")),
    )
        .into_response()
}

fn upstream(err: String) -> ServiceError {
    ServiceError::UpstreamUnavailable(FetchError::Upstream(err))
}

pub async fn geocode(
    State(state): State<AppState>,
    Json(req): Json<GeocodeRequest>,
) -> Result<Response, ServiceError> {
    if req.address.trim().is_empty() {
        return Err(ServiceError::bad_request("address must not be empty"));
    }
    match state.geocoder.geocode(req.address.trim()).await {
        Ok(result) => Ok(Json(result).into_response()),
        Err(GeocodeError::NotFound) => Ok(not_found()),
        Err(GeocodeError::Upstream(err)) => Err(upstream(err)),
    }
}

pub async fn reverse(
    State(state): State<AppState>,
    Json(req): Json<ReverseGeocodeRequest>,
) -> Result<Response, ServiceError> {
    let center = shared::Coordinate::new(req.latitude, req.longitude);
    if !center.is_valid() {
        return Err(ServiceError::bad_request(
            "latitude must be within [-90, 90] and longitude within [-180, 180]",
        ));
    }
    match state.geocoder.reverse(req.latitude, req.longitude).await {
        Ok(result) => Ok(Json(result).into_response()),
        Err(GeocodeError::NotFound) => Ok(not_found()),
        Err(GeocodeError::Upstream(err)) => Err(upstream(err)),
    }
}

#[derive(Debug, Serialize)]
pub struct BatchGeocodeResponse {
    pub results: std::collections::HashMap<String, BatchOutcome>,
}

pub async fn batch(
    State(state): State<AppState>,
    Json(req): Json<BatchGeocodeRequest>,
) -> Result<Json<BatchGeocodeResponse>, ServiceError> {
    if req.addresses.is_empty() {
        return Err(ServiceError::bad_request("addresses must not be empty"));
    }
    if req.addresses.len() > MAX_BATCH_ADDRESSES {
        return Err(ServiceError::bad_request(format!(
            "maximum {MAX_BATCH_ADDRESSES} addresses allowed"
        )));
    }
    let results = state.geocoder.batch(&req.addresses).await;
    Ok(Json(BatchGeocodeResponse { results }))
}
