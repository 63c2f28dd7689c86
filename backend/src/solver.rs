use std::collections::{BTreeSet, HashSet};

use shared::{Coordinate, RouteSegment, RouteSolution, TaskKind, TaskLocation};
use tokio_util::sync::CancellationToken;

use crate::{
    graph::RoadGraph,
    matrix::{build_matrix, MatrixCancelled, CONGESTION_FACTOR},
};

/// Speed assumed for fallback segments estimated without a road path.
const FALLBACK_SPEED_KPH: f64 = 20.0;

#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    #[error("no valid locations to route")]
    NoLocations,
    #[error("selected locations are not connected by the road network")]
    Disconnected,
    #[error("{0}")]
    InconsistentPdp(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SolveError {
    #[error(transparent)]
    Solver(#[from] SolverError),
    #[error(transparent)]
    Cancelled(#[from] MatrixCancelled),
}

/// One stop of a routing problem. The first stop is always the current
/// location.
#[derive(Debug, Clone)]
pub struct Stop {
    pub label: String,
    pub coord: Coordinate,
    pub kind: TaskKind,
    pub package_id: Option<String>,
}

impl Stop {
    pub fn current(coord: Coordinate) -> Self {
        Self {
            label: "current".to_string(),
            coord,
            kind: TaskKind::Current,
            package_id: None,
        }
    }

    pub fn from_task(task: &TaskLocation) -> Self {
        Self {
            label: task.location_id.clone(),
            coord: task.coordinate(),
            kind: task.kind,
            package_id: task.package_id.clone(),
        }
    }

    pub fn waypoint(index: usize, coord: Coordinate) -> Self {
        Self {
            label: format!("waypoint_{index}"),
            coord,
            kind: TaskKind::Waypoint,
            package_id: None,
        }
    }
}

/// Centroid and fetch radius covering every point, with a safety buffer so
/// nearest-node snapping stays inside the graph.
pub fn covering_region(points: &[Coordinate]) -> Option<(Coordinate, f64)> {
    const BUFFER_M: f64 = 5_000.0;
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let center = Coordinate::new(
        points.iter().map(|c| c.lat).sum::<f64>() / n,
        points.iter().map(|c| c.lon).sum::<f64>() / n,
    );
    let max_m = points
        .iter()
        .map(|c| center.haversine_m(*c))
        .fold(0.0, f64::max);
    Some((center, max_m + BUFFER_M))
}

/// Checks the pickup/delivery pairing invariants: a package appears at most
/// once as pickup and once as delivery, and no delivery lacks its pickup.
pub fn validate_pdp(locations: &[TaskLocation]) -> Result<(), String> {
    let mut pickups: HashSet<&str> = HashSet::new();
    let mut deliveries: HashSet<&str> = HashSet::new();

    for task in locations {
        let Some(package) = task.package_id.as_deref() else {
            if matches!(task.kind, TaskKind::Pickup | TaskKind::Delivery) {
                return Err(format!(
                    "location '{}' is a {:?} without a package_id",
                    task.location_id, task.kind
                ));
            }
            continue;
        };
        match task.kind {
            TaskKind::Pickup => {
                if !pickups.insert(package) {
                    return Err(format!("package '{package}' has more than one pickup"));
                }
            }
            TaskKind::Delivery => {
                if !deliveries.insert(package) {
                    return Err(format!("package '{package}' has more than one delivery"));
                }
            }
            TaskKind::Current | TaskKind::Waypoint => {}
        }
    }

    for package in &deliveries {
        if !pickups.contains(package) {
            return Err(format!("package '{package}' has a delivery but no pickup"));
        }
    }
    Ok(())
}

/// Solves the stop ordering over the cached road graph. `pdp` enables the
/// precedence constraint coupling pickups to deliveries.
pub fn solve(
    graph: &RoadGraph,
    stops: &[Stop],
    pdp: bool,
    cancel: &CancellationToken,
) -> Result<RouteSolution, SolveError> {
    if stops.len() < 2 {
        return Err(SolverError::NoLocations.into());
    }

    let nodes: Vec<_> = stops
        .iter()
        .map(|stop| graph.nearest_node(stop.coord))
        .collect::<Option<Vec<_>>>()
        .ok_or(SolverError::NoLocations)?;

    let matrix = build_matrix(graph, &nodes, cancel)?;
    if matrix.fully_estimated() {
        return Err(SolverError::Disconnected.into());
    }

    let plan = greedy_order(&matrix.distance, stops, pdp)?;
    Ok(assemble(stops, &matrix.distance, &matrix.time, &plan))
}

#[derive(Debug)]
pub(crate) struct Plan {
    pub order: Vec<usize>,
    /// Indices of legs whose cost came from the great-circle fallback.
    pub fallback_legs: Vec<usize>,
}

/// Greedy nearest-neighbour frontier starting at index 0. Ties break on the
/// smaller index. With `pdp`, a delivery only becomes selectable once its
/// paired pickup is in the route; an empty frontier force-selects the
/// smallest-index unvisited node, which must not violate precedence.
pub(crate) fn greedy_order(
    distance: &[Vec<f64>],
    stops: &[Stop],
    pdp: bool,
) -> Result<Plan, SolverError> {
    let n = stops.len();
    let mut unvisited: BTreeSet<usize> = (1..n).collect();
    let mut picked: HashSet<&str> = HashSet::new();
    let mut order = vec![0usize];
    let mut fallback_legs = Vec::new();
    let mut current = 0usize;

    while !unvisited.is_empty() {
        let mut next = None;
        let mut best = f64::INFINITY;

        for &candidate in &unvisited {
            if pdp && is_gated(&stops[candidate], &picked) {
                continue;
            }
            let d = distance[current][candidate];
            if d < best {
                best = d;
                next = Some(candidate);
            }
        }

        let chosen = match next {
            Some(idx) => idx,
            None => {
                // Fallback step: force the smallest-index unvisited node.
                // The precedence constraint is never relaxed.
                let forced = *unvisited.first().expect("unvisited not empty");
                if pdp && is_gated(&stops[forced], &picked) {
                    return Err(SolverError::InconsistentPdp(format!(
                        "delivery '{}' cannot be scheduled after its pickup",
                        stops[forced].label
                    )));
                }
                fallback_legs.push(order.len());
                forced
            }
        };

        if stops[chosen].kind == TaskKind::Pickup {
            if let Some(package) = stops[chosen].package_id.as_deref() {
                picked.insert(package);
            }
        }
        order.push(chosen);
        unvisited.remove(&chosen);
        current = chosen;
    }

    Ok(Plan {
        order,
        fallback_legs,
    })
}

fn is_gated(stop: &Stop, picked: &HashSet<&str>) -> bool {
    stop.kind == TaskKind::Delivery
        && stop
            .package_id
            .as_deref()
            .map(|package| !picked.contains(package))
            .unwrap_or(false)
}

fn assemble(stops: &[Stop], distance: &[Vec<f64>], time: &[Vec<f64>], plan: &Plan) -> RouteSolution {
    let mut total_distance_m = 0.0;
    let mut total_time_s = 0.0;
    let mut segments = Vec::with_capacity(plan.order.len().saturating_sub(1));

    for (leg, pair) in plan.order.windows(2).enumerate() {
        let (from, to) = (pair[0], pair[1]);
        let (leg_distance, leg_time) = if plan.fallback_legs.contains(&(leg + 1)) {
            let straight_m = stops[from].coord.haversine_m(stops[to].coord);
            let seconds =
                straight_m / (FALLBACK_SPEED_KPH * 1000.0 / 3600.0) * CONGESTION_FACTOR;
            (straight_m, seconds)
        } else {
            (distance[from][to], time[from][to])
        };

        total_distance_m += leg_distance;
        total_time_s += leg_time;

        let package_id = match stops[to].kind {
            TaskKind::Pickup | TaskKind::Delivery => stops[to].package_id.clone(),
            TaskKind::Current | TaskKind::Waypoint => None,
        };
        segments.push(RouteSegment {
            package_id,
            distance_km: round2(leg_distance / 1000.0),
            segment: format!("{} → {}", stops[from].label, stops[to].label),
            duration_segment: format_duration(leg_time),
        });
    }

    RouteSolution {
        optimal_route: plan.order.iter().map(|&i| stops[i].label.clone()).collect(),
        minimum_distance_km: round2(total_distance_m / 1000.0),
        estimated_travel_time_seconds: total_time_s.max(0.0) as u64,
        estimated_travel_time: format_duration(total_time_s),
        optimal_route_coordinates: plan
            .order
            .iter()
            .map(|&i| (stops[i].coord.lat, stops[i].coord.lon))
            .collect(),
        segment_details: segments,
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// "1h 5m 3s" when hours are present, "5m 3s" otherwise.
pub fn format_duration(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {secs}s")
    } else {
        format!("{minutes}m {secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EdgeRecord, GraphFile, NodeRecord};
    use shared::Profile;

    fn task(
        location_id: &str,
        lat: f64,
        lon: f64,
        kind: TaskKind,
        package_id: Option<&str>,
    ) -> TaskLocation {
        TaskLocation {
            latitude: lat,
            longitude: lon,
            kind,
            location_id: location_id.to_string(),
            package_id: package_id.map(String::from),
        }
    }

    fn stop(label: &str, kind: TaskKind, package: Option<&str>) -> Stop {
        Stop {
            label: label.to_string(),
            coord: Coordinate::new(41.0, 21.0),
            kind,
            package_id: package.map(String::from),
        }
    }

    /// Dense driveable grid so every stop resolves to a connected node.
    fn grid_graph() -> RoadGraph {
        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        let size = 5u64;
        for row in 0..size {
            for col in 0..size {
                let id = row * size + col + 1;
                nodes.push(NodeRecord {
                    id,
                    lat: 41.0 + row as f64 * 0.01,
                    lon: 21.0 + col as f64 * 0.01,
                });
                let mut connect = |from: u64, to: u64| {
                    edges.push(EdgeRecord {
                        from,
                        to,
                        length_m: 1100.0,
                        highway: "residential".into(),
                        maxspeed_kph: None,
                        speed_kph: 0.0,
                        travel_time_s: 0.0,
                        geometry: None,
                    });
                    edges.push(EdgeRecord {
                        from: to,
                        to: from,
                        length_m: 1100.0,
                        highway: "residential".into(),
                        maxspeed_kph: None,
                        speed_kph: 0.0,
                        travel_time_s: 0.0,
                        geometry: None,
                    });
                };
                if col > 0 {
                    connect(id, id - 1);
                }
                if row > 0 {
                    connect(id, id - size);
                }
            }
        }
        RoadGraph::from_file(GraphFile {
            profile: Profile::Driving,
            nodes,
            edges,
        })
        .unwrap()
    }

    #[test]
    fn tsp_route_starts_at_current_and_visits_everything() {
        let graph = grid_graph();
        let stops = vec![
            Stop::current(Coordinate::new(41.0, 21.0)),
            Stop::from_task(&task("far", 41.04, 21.04, TaskKind::Current, None)),
            Stop::from_task(&task("near", 41.01, 21.0, TaskKind::Current, None)),
        ];
        let solution = solve(&graph, &stops, false, &CancellationToken::new()).unwrap();

        assert_eq!(solution.optimal_route[0], "current");
        assert_eq!(solution.optimal_route.len(), 3);
        // Greedy picks the nearer stop first.
        assert_eq!(solution.optimal_route[1], "near");
        assert_eq!(solution.segment_details.len(), 2);
        assert!(solution.minimum_distance_km > 0.0);
        assert_eq!(
            solution.optimal_route_coordinates.first().copied(),
            Some((41.0, 21.0))
        );
    }

    #[test]
    fn greedy_ties_break_on_smaller_index() {
        let stops = vec![
            stop("current", TaskKind::Current, None),
            stop("a", TaskKind::Current, None),
            stop("b", TaskKind::Current, None),
        ];
        // Equal distances everywhere: index order must win.
        let distance = vec![vec![0.0, 10.0, 10.0], vec![10.0, 0.0, 10.0], vec![10.0, 10.0, 0.0]];
        let plan = greedy_order(&distance, &stops, false).unwrap();
        assert_eq!(plan.order, vec![0, 1, 2]);
    }

    #[test]
    fn pdp_orders_pickup_before_delivery() {
        let graph = grid_graph();
        let stops = vec![
            Stop::current(Coordinate::new(41.0, 21.0)),
            // Delivery is closer to the start than its pickup.
            Stop {
                label: "d1".into(),
                coord: Coordinate::new(41.01, 21.0),
                kind: TaskKind::Delivery,
                package_id: Some("pkg1".into()),
            },
            Stop {
                label: "p1".into(),
                coord: Coordinate::new(41.04, 21.04),
                kind: TaskKind::Pickup,
                package_id: Some("pkg1".into()),
            },
        ];
        let solution = solve(&graph, &stops, true, &CancellationToken::new()).unwrap();

        let pickup_pos = solution.optimal_route.iter().position(|l| l == "p1").unwrap();
        let delivery_pos = solution.optimal_route.iter().position(|l| l == "d1").unwrap();
        assert!(pickup_pos < delivery_pos, "route: {:?}", solution.optimal_route);
    }

    #[test]
    fn exhausted_frontier_estimates_by_great_circle() {
        // No finite candidate: every off-diagonal distance is infinite, so
        // the frontier is empty and the solver force-selects by index.
        let stops = vec![
            Stop {
                label: "current".into(),
                coord: Coordinate::new(41.0, 21.0),
                kind: TaskKind::Current,
                package_id: None,
            },
            Stop {
                label: "w1".into(),
                coord: Coordinate::new(41.0, 21.1),
                kind: TaskKind::Waypoint,
                package_id: None,
            },
        ];
        let inf = f64::INFINITY;
        let distance = vec![vec![0.0, inf], vec![inf, 0.0]];
        let time = distance.clone();

        let plan = greedy_order(&distance, &stops, true).unwrap();
        assert_eq!(plan.order, vec![0, 1]);
        assert_eq!(plan.fallback_legs, vec![1]);

        let solution = assemble(&stops, &distance, &time, &plan);
        let straight_m = stops[0].coord.haversine_m(stops[1].coord);
        let expected_s = straight_m / (FALLBACK_SPEED_KPH * 1000.0 / 3600.0) * CONGESTION_FACTOR;
        assert!((solution.minimum_distance_km - round2(straight_m / 1000.0)).abs() < 0.01);
        assert!(
            (solution.estimated_travel_time_seconds as f64 - expected_s).abs() < 1.0,
            "got {}, expected {expected_s}",
            solution.estimated_travel_time_seconds
        );
    }

    #[test]
    fn orphan_delivery_is_inconsistent() {
        let stops = vec![
            stop("current", TaskKind::Current, None),
            stop("d_orphan", TaskKind::Delivery, Some("ghost")),
        ];
        let distance = vec![vec![0.0, 5.0], vec![5.0, 0.0]];
        let err = greedy_order(&distance, &stops, true).unwrap_err();
        assert!(matches!(err, SolverError::InconsistentPdp(_)));
    }

    #[test]
    fn validate_pdp_rejects_duplicate_and_orphan_packages() {
        let valid = vec![
            task("p1", 41.0, 21.0, TaskKind::Pickup, Some("pkg1")),
            task("d1", 41.1, 21.1, TaskKind::Delivery, Some("pkg1")),
        ];
        assert!(validate_pdp(&valid).is_ok());

        let duplicate = vec![
            task("p1", 41.0, 21.0, TaskKind::Pickup, Some("pkg1")),
            task("p2", 41.1, 21.1, TaskKind::Pickup, Some("pkg1")),
            task("d1", 41.2, 21.2, TaskKind::Delivery, Some("pkg1")),
        ];
        assert!(validate_pdp(&duplicate).is_err());

        let orphan = vec![task("d1", 41.0, 21.0, TaskKind::Delivery, Some("pkg1"))];
        assert!(validate_pdp(&orphan).is_err());

        let missing_package = vec![task("p1", 41.0, 21.0, TaskKind::Pickup, None)];
        assert!(validate_pdp(&missing_package).is_err());
    }

    #[test]
    fn duration_formatting_matches_contract() {
        assert_eq!(format_duration(3963.0), "1h 6m 3s");
        assert_eq!(format_duration(310.0), "5m 10s");
        assert_eq!(format_duration(0.0), "0m 0s");
    }

    mod precedence_property {
        use super::*;
        use proptest::prelude::*;

        fn arbitrary_instance() -> impl Strategy<Value = (Vec<Stop>, Vec<Vec<f64>>)> {
            // 1..=4 packages, each a pickup/delivery pair, plus the start.
            (1usize..=4).prop_flat_map(|packages| {
                let n = packages * 2 + 1;
                let matrix = proptest::collection::vec(
                    proptest::collection::vec(1.0f64..50_000.0, n),
                    n,
                );
                matrix.prop_map(move |mut distance| {
                    for (i, row) in distance.iter_mut().enumerate() {
                        row[i] = 0.0;
                    }
                    let mut stops = vec![Stop {
                        label: "current".into(),
                        coord: Coordinate::new(41.0, 21.0),
                        kind: TaskKind::Current,
                        package_id: None,
                    }];
                    for p in 0..packages {
                        stops.push(Stop {
                            label: format!("p{p}"),
                            coord: Coordinate::new(41.0, 21.0),
                            kind: TaskKind::Pickup,
                            package_id: Some(format!("pkg{p}")),
                        });
                        stops.push(Stop {
                            label: format!("d{p}"),
                            coord: Coordinate::new(41.0, 21.0),
                            kind: TaskKind::Delivery,
                            package_id: Some(format!("pkg{p}")),
                        });
                    }
                    (stops, distance)
                })
            })
        }

        proptest! {
            #[test]
            fn pickups_always_precede_deliveries((stops, distance) in arbitrary_instance()) {
                let plan = greedy_order(&distance, &stops, true).unwrap();
                for (i, stop) in stops.iter().enumerate() {
                    if stop.kind == TaskKind::Delivery {
                        let package = stop.package_id.as_deref().unwrap();
                        let pickup = stops
                            .iter()
                            .position(|s| {
                                s.kind == TaskKind::Pickup
                                    && s.package_id.as_deref() == Some(package)
                            })
                            .unwrap();
                        let pickup_pos =
                            plan.order.iter().position(|&x| x == pickup).unwrap();
                        let delivery_pos =
                            plan.order.iter().position(|&x| x == i).unwrap();
                        prop_assert!(pickup_pos < delivery_pos);
                    }
                }
            }
        }
    }
}
