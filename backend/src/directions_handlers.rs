use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use shared::{
    Coordinate, PdpRouteRequest, RouteRequest, RouteResult, RouteSolution, SimpleRouteRequest,
    TaskKind,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::ServiceError,
    parse_mode,
    solver::{self, covering_region, Stop},
    supported_modes_json, AppState,
};

pub(crate) fn ensure_valid_coords<'a>(
    coords: impl IntoIterator<Item = &'a Coordinate>,
    what: &str,
) -> Result<(), ServiceError> {
    for (i, coord) in coords.into_iter().enumerate() {
        if !coord.is_valid() {
            return Err(ServiceError::bad_request(format!(
                "{what} {i} has out-of-range coordinates"
            )));
        }
    }
    Ok(())
}

pub async fn route(
    State(state): State<AppState>,
    Json(req): Json<RouteRequest>,
) -> Result<Json<RouteResult>, ServiceError> {
    if req.waypoints.len() < 2 {
        return Err(ServiceError::bad_request("at least 2 waypoints are required"));
    }
    ensure_valid_coords(&req.waypoints, "waypoint")?;
    let profile = parse_mode(req.transport_mode.as_deref())?;

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let result = state
        .directions
        .route(
            req.waypoints,
            profile,
            req.optimize_route,
            req.use_graph_fallback,
            &cancel,
        )
        .await?;
    Ok(Json(result))
}

pub async fn simple(
    State(state): State<AppState>,
    Json(req): Json<SimpleRouteRequest>,
) -> Result<Json<RouteResult>, ServiceError> {
    ensure_valid_coords([&req.origin, &req.destination], "endpoint")?;
    let profile = parse_mode(req.transport_mode.as_deref())?;

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    // Two-point route; the graph fallback is always armed here.
    let result = state
        .directions
        .route(
            vec![req.origin, req.destination],
            profile,
            false,
            true,
            &cancel,
        )
        .await?;
    Ok(Json(result))
}

#[derive(Debug, Serialize)]
pub struct PdpRouteResponse {
    pub status: String,
    pub solution: RouteSolution,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directions: Option<RouteResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directions_error: Option<String>,
}

/// Pickup-delivery routing: matrix optimization first, then full directions
/// over the optimized stop order. A directions failure degrades to a
/// partial-success response carrying the solution alone.
pub async fn route_pdp(
    State(state): State<AppState>,
    Json(req): Json<PdpRouteRequest>,
) -> Result<Response, ServiceError> {
    if !req.current_location.is_valid() {
        return Err(ServiceError::bad_request(
            "current_location has out-of-range coordinates",
        ));
    }
    if req.locations.len() < 2 {
        return Err(ServiceError::bad_request(
            "at least 2 locations are required",
        ));
    }
    for (i, task) in req.locations.iter().enumerate() {
        if !task.coordinate().is_valid() {
            return Err(ServiceError::bad_request(format!(
                "location {i} has out-of-range coordinates"
            )));
        }
    }

    let pickups = req
        .locations
        .iter()
        .filter(|l| l.kind == TaskKind::Pickup)
        .count();
    let deliveries = req
        .locations
        .iter()
        .filter(|l| l.kind == TaskKind::Delivery)
        .count();
    if pickups == 0 || deliveries == 0 {
        return Err(ServiceError::bad_request(
            "at least one pickup and one delivery are required",
        ));
    }
    solver::validate_pdp(&req.locations).map_err(ServiceError::BadRequest)?;
    let profile = parse_mode(req.transport_mode.as_deref())?;

    let mut stops = vec![Stop::current(req.current_location)];
    stops.extend(req.locations.iter().map(Stop::from_task));

    let points: Vec<Coordinate> = stops.iter().map(|s| s.coord).collect();
    let (center, radius_m) =
        covering_region(&points).ok_or_else(|| ServiceError::bad_request("no locations"))?;
    let graph = state
        .cache
        .get(center.lat, center.lon, radius_m, profile)
        .await?;

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let solution = {
        let graph = Arc::clone(&graph);
        let stops = stops.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || solver::solve(&graph, &stops, true, &cancel))
            .await
            .map_err(|_| ServiceError::Internal)??
    };

    let waypoints: Vec<Coordinate> = solution
        .optimal_route_coordinates
        .iter()
        .map(|(lat, lon)| Coordinate::new(*lat, *lon))
        .collect();

    match state
        .directions
        .route(waypoints, profile, false, true, &cancel)
        .await
    {
        Ok(directions) => Ok(Json(PdpRouteResponse {
            status: "success".to_string(),
            solution,
            directions: Some(directions),
            directions_error: None,
        })
        .into_response()),
        Err(err) => {
            tracing::warn!(error = %err, "directions failed after matrix optimization");
            Ok((
                StatusCode::MULTI_STATUS,
                Json(PdpRouteResponse {
                    status: "partial_success".to_string(),
                    solution,
                    directions: None,
                    directions_error: Some(err.to_string()),
                }),
            )
                .into_response())
        }
    }
}

pub async fn modes() -> Json<serde_json::Value> {
    Json(supported_modes_json())
}
