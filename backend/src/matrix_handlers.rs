use std::sync::Arc;

use axum::{extract::State, Json};
use shared::{Coordinate, MatrixRequest, RouteSolution, TaskKind};
use tokio_util::sync::CancellationToken;

use crate::{
    error::ServiceError,
    parse_mode,
    solver::{self, covering_region, Stop},
    AppState,
};

/// Distance/time matrix optimization over the current location and task
/// list. Pickup-delivery mode engages when the flag is set or when the
/// locations carry pickup/delivery types.
pub async fn calculate(
    State(state): State<AppState>,
    Json(req): Json<MatrixRequest>,
) -> Result<Json<RouteSolution>, ServiceError> {
    if !req.current_location.is_valid() {
        return Err(ServiceError::bad_request(
            "current_location has out-of-range coordinates",
        ));
    }
    if req.locations.is_empty() {
        return Err(ServiceError::bad_request("no locations provided"));
    }
    for (i, task) in req.locations.iter().enumerate() {
        if !task.coordinate().is_valid() {
            return Err(ServiceError::bad_request(format!(
                "location {i} has out-of-range coordinates"
            )));
        }
    }

    let pdp = req.pdp
        || req
            .locations
            .iter()
            .any(|l| matches!(l.kind, TaskKind::Pickup | TaskKind::Delivery));
    if pdp {
        solver::validate_pdp(&req.locations).map_err(ServiceError::BadRequest)?;
    }
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
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || solver::solve(&graph, &stops, pdp, &cancel))
            .await
            .map_err(|_| ServiceError::Internal)??
    };
    Ok(Json(solution))
}
