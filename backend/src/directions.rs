use std::sync::Arc;
use std::time::{Duration, Instant};

use geo_types::{Coord, LineString};
use serde::Deserialize;
use shared::{Coordinate, Profile, RouteMetadata, RouteResult, RouteStep};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::GraphCache,
    error::ServiceError,
    graph::BoundingBox,
    loader::FetchError,
    matrix::shortest_path,
    solver::{self, format_duration, Stop},
};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);
const POLYLINE_PRECISION: u32 = 5;
/// Margin around the waypoint bounding box when fetching fallback graphs.
const FALLBACK_MARGIN_KM: f64 = 5.0;

/// Client for an OSRM-compatible routing engine. Steps and geometry are
/// passed through; no instruction generation happens here.
pub struct OsrmClient {
    http: reqwest::Client,
    base_url: String,
}

impl OsrmClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .user_agent("geospatial-backend")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub async fn route(
        &self,
        waypoints: &[Coordinate],
        profile: Profile,
    ) -> Result<OsrmRoute, String> {
        let coords = waypoints
            .iter()
            .map(|c| format!("{:.6},{:.6}", c.lon, c.lat))
            .collect::<Vec<_>>()
            .join(";");
        let url = format!("{}/route/v1/{}/{}", self.base_url, profile, coords);

        let response = self
            .http
            .get(&url)
            .query(&[
                ("overview", "full"),
                ("geometries", "geojson"),
                ("steps", "true"),
                ("annotations", "true"),
            ])
            .send()
            .await
            .map_err(|err| err.to_string())?
            .error_for_status()
            .map_err(|err| err.to_string())?;

        let OsrmResponse { code, routes } =
            response.json().await.map_err(|err| err.to_string())?;
        routes
            .into_iter()
            .next()
            .ok_or_else(|| format!("no route in upstream response (code {code})"))
    }
}

#[derive(Debug, Deserialize)]
struct OsrmResponse {
    #[serde(default)]
    code: String,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
pub struct OsrmRoute {
    #[serde(default)]
    pub distance: f64,
    #[serde(default)]
    pub duration: f64,
    pub geometry: Option<OsrmGeometry>,
    #[serde(default)]
    pub legs: Vec<OsrmLeg>,
}

#[derive(Debug, Deserialize)]
pub struct OsrmGeometry {
    #[serde(default)]
    pub coordinates: Vec<[f64; 2]>,
}

#[derive(Debug, Deserialize)]
pub struct OsrmLeg {
    #[serde(default)]
    pub steps: Vec<OsrmStep>,
}

#[derive(Debug, Deserialize)]
pub struct OsrmStep {
    #[serde(default)]
    pub distance: f64,
    #[serde(default)]
    pub duration: f64,
    pub maneuver: Option<OsrmManeuver>,
    pub geometry: Option<OsrmGeometry>,
}

#[derive(Debug, Deserialize)]
pub struct OsrmManeuver {
    #[serde(default)]
    pub location: Vec<f64>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub instruction: Option<String>,
}

pub struct DirectionsService {
    osrm: OsrmClient,
    cache: Arc<GraphCache>,
}

impl DirectionsService {
    pub fn new(osrm: OsrmClient, cache: Arc<GraphCache>) -> Self {
        Self { osrm, cache }
    }

    /// Routes through the given waypoints: upstream engine first, falling
    /// back to the cached road graph when enabled. `optimize` reorders the
    /// waypoints with the TSP heuristic beforehand.
    pub async fn route(
        &self,
        waypoints: Vec<Coordinate>,
        profile: Profile,
        optimize: bool,
        use_graph_fallback: bool,
        cancel: &CancellationToken,
    ) -> Result<RouteResult, ServiceError> {
        let started = Instant::now();

        let waypoints = if optimize {
            match self.optimize_order(&waypoints, profile, cancel).await {
                Ok(ordered) => ordered,
                Err(err) => {
                    tracing::warn!(error = %err, "route optimization failed, keeping order");
                    waypoints
                }
            }
        } else {
            waypoints
        };

        match self.osrm.route(&waypoints, profile).await {
            Ok(route) => Ok(self.from_upstream(route, &waypoints, profile, optimize, started)),
            Err(upstream_err) => {
                if !use_graph_fallback {
                    tracing::warn!(error = %upstream_err, "upstream routing failed");
                    return Err(ServiceError::UpstreamUnavailable(FetchError::Upstream(
                        upstream_err,
                    )));
                }
                tracing::info!(error = %upstream_err, "upstream routing failed, using graph fallback");
                self.graph_fallback(&waypoints, profile, optimize, started, cancel)
                    .await
            }
        }
    }

    async fn optimize_order(
        &self,
        waypoints: &[Coordinate],
        profile: Profile,
        cancel: &CancellationToken,
    ) -> Result<Vec<Coordinate>, ServiceError> {
        let graph = self.bbox_graph(waypoints, profile).await?;
        let stops: Vec<Stop> = waypoints
            .iter()
            .enumerate()
            .map(|(i, c)| {
                if i == 0 {
                    Stop::current(*c)
                } else {
                    Stop::waypoint(i, *c)
                }
            })
            .collect();

        let graph_clone = graph.clone();
        let cancel = cancel.clone();
        let solution = tokio::task::spawn_blocking(move || {
            solver::solve(&graph_clone, &stops, false, &cancel)
        })
        .await
        .map_err(|_| ServiceError::Internal)??;

        Ok(solution
            .optimal_route_coordinates
            .iter()
            .map(|(lat, lon)| Coordinate::new(*lat, *lon))
            .collect())
    }

    fn from_upstream(
        &self,
        route: OsrmRoute,
        waypoints: &[Coordinate],
        profile: Profile,
        optimized: bool,
        started: Instant,
    ) -> RouteResult {
        let geometry: Vec<[f64; 2]> = route
            .geometry
            .map(|g| g.coordinates)
            .unwrap_or_else(|| waypoints.iter().map(|c| [c.lon, c.lat]).collect());
        let decoded: Vec<(f64, f64)> = geometry.iter().map(|p| (p[1], p[0])).collect();

        let steps: Vec<RouteStep> = route
            .legs
            .iter()
            .flat_map(|leg| &leg.steps)
            .enumerate()
            .map(|(i, step)| {
                let location = step
                    .maneuver
                    .as_ref()
                    .filter(|m| m.location.len() >= 2)
                    .map(|m| Coordinate::new(m.location[1], m.location[0]))
                    .unwrap_or_else(|| waypoints[0]);
                RouteStep {
                    instruction: step
                        .maneuver
                        .as_ref()
                        .and_then(|m| m.instruction.clone())
                        .unwrap_or_else(|| format!("Step {}", i + 1)),
                    distance: step.distance,
                    duration: step.duration,
                    start_location: location,
                    end_location: location,
                    path: step
                        .geometry
                        .as_ref()
                        .map(|g| g.coordinates.iter().map(|p| (p[1], p[0])).collect()),
                    transport_mode: profile.as_str().to_string(),
                }
            })
            .collect();

        let total_steps = steps.len();
        RouteResult {
            status: "success".to_string(),
            source: "upstream".to_string(),
            transport_mode: profile.as_str().to_string(),
            distance: route.distance / 1000.0,
            duration: route.duration,
            duration_str: format_duration(route.duration),
            steps,
            polyline: encode_polyline(&decoded),
            decoded_polyline: decoded,
            geometry,
            waypoints: waypoints.to_vec(),
            metadata: RouteMetadata {
                execution_time: started.elapsed().as_secs_f64(),
                optimized,
                total_waypoints: waypoints.len(),
                total_steps,
            },
        }
    }

    /// Shortest paths over the cached graph between consecutive waypoints,
    /// with a straight-line repair when a pair is not connected.
    async fn graph_fallback(
        &self,
        waypoints: &[Coordinate],
        profile: Profile,
        optimized: bool,
        started: Instant,
        cancel: &CancellationToken,
    ) -> Result<RouteResult, ServiceError> {
        let graph = self.bbox_graph(waypoints, profile).await?;
        let speed_kph = profile.default_speed_kph();

        let mut geometry: Vec<[f64; 2]> = Vec::new();
        let mut steps = Vec::new();
        let mut total_distance = 0.0;
        let mut total_duration = 0.0;

        for (i, pair) in waypoints.windows(2).enumerate() {
            if cancel.is_cancelled() {
                return Err(ServiceError::Internal);
            }
            let (from, to) = (pair[0], pair[1]);
            let from_node = graph.nearest_node(from);
            let to_node = graph.nearest_node(to);

            let segment = match (from_node, to_node) {
                (Some(a), Some(b)) => shortest_path(&graph, a, b),
                _ => None,
            };

            let (distance, path): (f64, Vec<Coordinate>) = match segment {
                Some((meters, nodes)) => (meters, graph.path_coordinates(&nodes)),
                None => (from.haversine_m(to), vec![from, to]),
            };
            let duration = distance / (speed_kph * 1000.0 / 3600.0);

            geometry.extend(path.iter().map(|c| [c.lon, c.lat]));
            steps.push(RouteStep {
                instruction: format!("Route segment {} ({})", i + 1, profile),
                distance,
                duration,
                start_location: from,
                end_location: to,
                path: Some(path.iter().map(|c| (c.lat, c.lon)).collect()),
                transport_mode: profile.as_str().to_string(),
            });
            total_distance += distance;
            total_duration += duration;
        }

        if geometry.is_empty() {
            return Err(ServiceError::RouteUnavailable);
        }

        let decoded: Vec<(f64, f64)> = geometry.iter().map(|p| (p[1], p[0])).collect();
        let total_steps = steps.len();
        Ok(RouteResult {
            status: "success".to_string(),
            source: "graph_fallback".to_string(),
            transport_mode: profile.as_str().to_string(),
            distance: total_distance / 1000.0,
            duration: total_duration,
            duration_str: format_duration(total_duration),
            steps,
            polyline: encode_polyline(&decoded),
            decoded_polyline: decoded,
            geometry,
            waypoints: waypoints.to_vec(),
            metadata: RouteMetadata {
                execution_time: started.elapsed().as_secs_f64(),
                optimized,
                total_waypoints: waypoints.len(),
                total_steps,
            },
        })
    }

    async fn bbox_graph(
        &self,
        waypoints: &[Coordinate],
        profile: Profile,
    ) -> Result<Arc<crate::graph::RoadGraph>, ServiceError> {
        let bbox = BoundingBox::from_points(waypoints, FALLBACK_MARGIN_KM)
            .ok_or(ServiceError::RouteUnavailable)?;
        Ok(self.cache.bbox_graph(bbox, profile).await?)
    }
}

/// Encodes a (lat, lng) sequence with the standard precision-5 algorithm.
pub fn encode_polyline(points: &[(f64, f64)]) -> String {
    let line: LineString<f64> = points
        .iter()
        .map(|(lat, lon)| Coord { x: *lon, y: *lat })
        .collect();
    polyline::encode_coordinates(line, POLYLINE_PRECISION).unwrap_or_default()
}

/// Decodes back to (lat, lng) pairs.
pub fn decode_polyline(encoded: &str) -> Vec<(f64, f64)> {
    polyline::decode_polyline(encoded, POLYLINE_PRECISION)
        .map(|line| line.coords().map(|c| (c.y, c.x)).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::GraphStore;
    use crate::test_support::SyntheticFetcher;

    #[test]
    fn polyline_round_trips_lat_lng() {
        let points = vec![(41.12, 20.80), (41.5, 21.0), (41.99, 21.43)];
        let encoded = encode_polyline(&points);
        assert!(!encoded.is_empty());
        let decoded = decode_polyline(&encoded);
        assert_eq!(decoded.len(), points.len());
        for (a, b) in decoded.iter().zip(points.iter()) {
            assert!((a.0 - b.0).abs() < 1e-5);
            assert!((a.1 - b.1).abs() < 1e-5);
        }
    }

    fn unreachable_osrm() -> OsrmClient {
        // Nothing listens on this port; upstream calls fail immediately.
        OsrmClient::new("http://127.0.0.1:9")
    }

    async fn service(dir: &std::path::Path) -> (DirectionsService, Arc<SyntheticFetcher>) {
        let store = Arc::new(GraphStore::open(dir).unwrap());
        let fetcher = Arc::new(SyntheticFetcher::default());
        let cache = GraphCache::spawn(store, fetcher.clone(), 5, 16);
        (DirectionsService::new(unreachable_osrm(), cache), fetcher)
    }

    #[tokio::test]
    async fn fallback_routes_over_the_cached_graph() {
        let dir = tempfile::tempdir().unwrap();
        let (service, fetcher) = service(dir.path()).await;

        let waypoints = vec![
            Coordinate::new(41.00, 21.00),
            Coordinate::new(41.05, 21.05),
        ];
        let result = service
            .route(waypoints, Profile::Driving, false, true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.source, "graph_fallback");
        assert_eq!(result.status, "success");
        assert!(result.distance > 5.0, "got {} km", result.distance);
        assert!(result.duration > 0.0);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(fetcher.bbox_calls(), 1, "fallback fetches one bbox graph");

        // The advertised polyline decodes to the decoded_polyline sequence.
        let decoded = decode_polyline(&result.polyline);
        assert_eq!(decoded.len(), result.decoded_polyline.len());
        for (a, b) in decoded.iter().zip(result.decoded_polyline.iter()) {
            assert!((a.0 - b.0).abs() < 1e-5);
            assert!((a.1 - b.1).abs() < 1e-5);
        }
    }

    #[tokio::test]
    async fn upstream_failure_without_fallback_is_bad_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _) = service(dir.path()).await;

        let waypoints = vec![
            Coordinate::new(41.00, 21.00),
            Coordinate::new(41.05, 21.05),
        ];
        let err = service
            .route(waypoints, Profile::Driving, false, false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::UpstreamUnavailable(_)));
    }
}
