use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    num::NonZeroUsize,
    sync::{Arc, Mutex},
    time::Instant,
};

use geo::{Area, ConvexHull, MultiPoint, Point, Simplify};
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, Value as GeoValue};
use lru::LruCache;
use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use serde::Serialize;
use shared::{BatchLocation, Coordinate, IsochroneBand, IsochroneResult, Profile};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{cache::CacheError, cache::GraphCache, graph::RoadGraph, solver::round2};

/// Meters per degree of latitude, used to convert the simplification
/// tolerance and polygon areas.
const METERS_PER_DEGREE: f64 = 111_320.0;
const KM_PER_DEGREE: f64 = 111.32;

/// Above this node count the Dijkstra is cutoff-limited; smaller graphs run
/// a full single-source pass for locality.
const SUBGRAPH_NODE_THRESHOLD: usize = 10_000;

/// Safety factor on the fetch radius so the graph covers the worst cutoff.
const FETCH_RADIUS_MARGIN: f64 = 1.5;
const MIN_FETCH_RADIUS_M: f64 = 2000.0;

const RESULT_CACHE_SIZE: usize = 100;
/// Bounded pool shared by multi-mode comparison and batch requests.
const COMPARISON_WORKERS: usize = 4;

const COMPARE_DEADLINE: std::time::Duration = std::time::Duration::from_secs(60);
const BATCH_DEADLINE: std::time::Duration = std::time::Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum IsochroneError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("isochrone computation cancelled")]
    Cancelled,
}

/// Key of the computed-polygon cache. Center is rounded to 4 decimals;
/// cutoffs are sorted seconds. Entries are written once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResultKey {
    lat_e4: i64,
    lon_e4: i64,
    cutoffs_s: Vec<u32>,
    profile: Profile,
    tolerance_mm: u64,
}

impl ResultKey {
    fn new(center: Coordinate, cutoffs_s: &[u32], profile: Profile, tolerance_m: f64) -> Self {
        Self {
            lat_e4: (center.lat * 10_000.0).round() as i64,
            lon_e4: (center.lon * 10_000.0).round() as i64,
            cutoffs_s: cutoffs_s.to_vec(),
            profile,
            tolerance_mm: (tolerance_m.max(0.0) * 1000.0).round() as u64,
        }
    }
}

pub struct IsochroneService {
    cache: Arc<GraphCache>,
    results: Mutex<LruCache<ResultKey, Arc<IsochroneResult>>>,
    pool: Arc<Semaphore>,
}

impl IsochroneService {
    pub fn new(cache: Arc<GraphCache>) -> Self {
        Self {
            cache,
            results: Mutex::new(LruCache::new(
                NonZeroUsize::new(RESULT_CACHE_SIZE).expect("nonzero"),
            )),
            pool: Arc::new(Semaphore::new(COMPARISON_WORKERS)),
        }
    }

    pub fn graph_cache(&self) -> &Arc<GraphCache> {
        &self.cache
    }

    /// Computes reachability polygons for each cutoff (minutes, ascending).
    /// Results are memoized best-effort by (center, cutoffs, profile,
    /// tolerance).
    pub async fn calculate(
        &self,
        center: Coordinate,
        travel_times_min: &[f64],
        profile: Profile,
        tolerance_m: f64,
        cancel: &CancellationToken,
    ) -> Result<Arc<IsochroneResult>, IsochroneError> {
        let started = Instant::now();

        let mut cutoffs_s: Vec<u32> = travel_times_min
            .iter()
            .map(|minutes| (minutes * 60.0).round() as u32)
            .collect();
        cutoffs_s.sort_unstable();
        cutoffs_s.dedup();

        let key = ResultKey::new(center, &cutoffs_s, profile, tolerance_m);
        if let Some(hit) = self.results.lock().expect("results lock").get(&key) {
            tracing::debug!("isochrone result cache hit");
            return Ok(hit.clone());
        }

        let max_cutoff_s = cutoffs_s.last().copied().unwrap_or(0);
        let radius_m = fetch_radius_m(max_cutoff_s, profile);
        let graph = self
            .cache
            .get(center.lat, center.lon, radius_m, profile)
            .await?;

        let bands = {
            let cancel = cancel.clone();
            let cutoffs = cutoffs_s.clone();
            tokio::task::spawn_blocking(move || compute_bands(&graph, center, &cutoffs, tolerance_m, &cancel))
                .await
                .map_err(|_| IsochroneError::Cancelled)??
        };

        let result = Arc::new(IsochroneResult {
            center,
            travel_mode: profile.as_str().to_string(),
            isochrones: bands,
            processing_time_seconds: round2(started.elapsed().as_secs_f64()),
        });

        self.results
            .lock()
            .expect("results lock")
            .put(key, result.clone());
        Ok(result)
    }

    /// One isochrone per transport mode, computed in parallel on the worker
    /// pool under an aggregate deadline.
    pub async fn compare(
        self: &Arc<Self>,
        center: Coordinate,
        travel_time_min: f64,
        profiles: &[Profile],
        tolerance_m: f64,
    ) -> CompareResponse {
        let started = Instant::now();
        let mut set = JoinSet::new();

        for &profile in profiles {
            let service = self.clone();
            let pool = self.pool.clone();
            set.spawn(async move {
                let _permit = pool.acquire_owned().await;
                let outcome = service
                    .calculate(
                        center,
                        &[travel_time_min],
                        profile,
                        tolerance_m,
                        &CancellationToken::new(),
                    )
                    .await;
                (profile, outcome)
            });
        }

        let deadline = tokio::time::Instant::now() + COMPARE_DEADLINE;
        let mut comparisons: HashMap<String, ModeComparison> = HashMap::new();

        while !set.is_empty() {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok((profile, Ok(result))))) => {
                    let entry = match result.isochrones.first() {
                        Some(band) => ModeComparison::Band {
                            area_km2: band.area_km2,
                            reachable_nodes: band.reachable_nodes,
                            polygon_coordinates: band.polygon_coordinates.clone(),
                            processing_time_seconds: result.processing_time_seconds,
                        },
                        None => ModeComparison::Failed {
                            error: "no isochrone generated".to_string(),
                        },
                    };
                    comparisons.insert(profile.as_str().to_string(), entry);
                }
                Ok(Some(Ok((profile, Err(err))))) => {
                    comparisons.insert(
                        profile.as_str().to_string(),
                        ModeComparison::Failed {
                            error: err.to_string(),
                        },
                    );
                }
                Ok(Some(Err(err))) => {
                    tracing::warn!(error = %err, "comparison task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    set.abort_all();
                    break;
                }
            }
        }

        for &profile in profiles {
            comparisons
                .entry(profile.as_str().to_string())
                .or_insert_with(|| ModeComparison::Failed {
                    error: "comparison deadline exceeded".to_string(),
                });
        }

        let summary = summarize(&comparisons);
        CompareResponse {
            center,
            travel_time_minutes: travel_time_min,
            comparisons,
            summary,
            total_processing_time_seconds: round2(started.elapsed().as_secs_f64()),
        }
    }

    /// Isochrones for several locations, bounded by the pool and a 120 s
    /// aggregate deadline. Failed locations report their error in place.
    pub async fn batch(
        self: &Arc<Self>,
        locations: &[BatchLocation],
        travel_times_min: Vec<f64>,
        profile: Profile,
        tolerance_m: f64,
    ) -> BatchResponse {
        let started = Instant::now();
        let mut set = JoinSet::new();

        for (index, location) in locations.iter().enumerate() {
            let service = self.clone();
            let pool = self.pool.clone();
            let center = Coordinate::new(location.latitude, location.longitude);
            let name = location
                .name
                .clone()
                .unwrap_or_else(|| format!("Location {index}"));
            let times = travel_times_min.clone();
            set.spawn(async move {
                let _permit = pool.acquire_owned().await;
                let outcome = service
                    .calculate(center, &times, profile, tolerance_m, &CancellationToken::new())
                    .await;
                (index, name, outcome)
            });
        }

        let deadline = tokio::time::Instant::now() + BATCH_DEADLINE;
        let mut entries: Vec<BatchEntry> = Vec::with_capacity(locations.len());

        while !set.is_empty() {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok((index, name, outcome)))) => {
                    entries.push(match outcome {
                        Ok(result) => BatchEntry {
                            location_index: index,
                            location_name: name,
                            result: Some(result.as_ref().clone()),
                            error: None,
                        },
                        Err(err) => BatchEntry {
                            location_index: index,
                            location_name: name,
                            result: None,
                            error: Some(err.to_string()),
                        },
                    });
                }
                Ok(Some(Err(err))) => {
                    tracing::warn!(error = %err, "batch task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    set.abort_all();
                    break;
                }
            }
        }

        for (index, location) in locations.iter().enumerate() {
            if !entries.iter().any(|e| e.location_index == index) {
                entries.push(BatchEntry {
                    location_index: index,
                    location_name: location
                        .name
                        .clone()
                        .unwrap_or_else(|| format!("Location {index}")),
                    result: None,
                    error: Some("batch deadline exceeded".to_string()),
                });
            }
        }
        entries.sort_by_key(|e| e.location_index);

        let successful = entries.iter().filter(|e| e.error.is_none()).count();
        BatchResponse {
            travel_mode: profile.as_str().to_string(),
            travel_times: travel_times_min,
            total_locations: locations.len(),
            successful_calculations: successful,
            failed_calculations: entries.len() - successful,
            results: entries,
            total_processing_time_seconds: round2(started.elapsed().as_secs_f64()),
        }
    }

    /// Warms the graph cache for the given locations.
    pub async fn preload(
        self: &Arc<Self>,
        locations: &[BatchLocation],
        profiles: &[Profile],
        radii_m: &[f64],
    ) -> PreloadResponse {
        let mut set = JoinSet::new();
        for location in locations {
            for &profile in profiles {
                for &radius in radii_m {
                    let cache = self.cache.clone();
                    let pool = self.pool.clone();
                    let name = location
                        .name
                        .clone()
                        .unwrap_or_else(|| format!("{},{}", location.latitude, location.longitude));
                    let (lat, lon) = (location.latitude, location.longitude);
                    set.spawn(async move {
                        let _permit = pool.acquire_owned().await;
                        let outcome = cache.get(lat, lon, radius, profile).await;
                        (name, outcome.map(|_| ()).map_err(|err| err.to_string()))
                    });
                }
            }
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok((name, outcome)) = joined {
                results.push(PreloadEntry {
                    location: name,
                    status: if outcome.is_ok() { "success" } else { "error" }.to_string(),
                    error: outcome.err(),
                });
            }
        }

        let successful = results.iter().filter(|r| r.error.is_none()).count();
        PreloadResponse {
            successful,
            failed: results.len() - successful,
            preload_results: results,
        }
    }
}

fn fetch_radius_m(max_cutoff_s: u32, profile: Profile) -> f64 {
    let minutes = max_cutoff_s as f64 / 60.0;
    let reach = minutes * profile.default_speed_kph() * 1000.0 / 60.0 * FETCH_RADIUS_MARGIN;
    reach.max(MIN_FETCH_RADIUS_M)
}

/// Single-source reachability over `travel_time_s`, then one convex hull per
/// cutoff. Cutoffs below three reachable nodes are skipped.
fn compute_bands(
    graph: &RoadGraph,
    center: Coordinate,
    cutoffs_s: &[u32],
    tolerance_m: f64,
    cancel: &CancellationToken,
) -> Result<Vec<IsochroneBand>, IsochroneError> {
    let Some(origin) = graph.nearest_node(center) else {
        return Ok(Vec::new());
    };

    let max_cutoff_s = cutoffs_s.last().copied().unwrap_or(0) as f64;
    let cutoff = if graph.node_count() > SUBGRAPH_NODE_THRESHOLD {
        Some(max_cutoff_s)
    } else {
        None
    };
    let times = travel_times_from(graph, origin, cutoff, cancel)?;

    let mut bands = Vec::with_capacity(cutoffs_s.len());
    for &cutoff_s in cutoffs_s {
        let reachable: Vec<(NodeIndex, f64)> = times
            .iter()
            .filter(|(_, t)| **t <= cutoff_s as f64)
            .map(|(n, t)| (*n, *t))
            .collect();
        if reachable.len() < 3 {
            continue;
        }

        let points: Vec<Point<f64>> = reachable
            .iter()
            .map(|(node, _)| {
                let coord = graph.node_coord(*node);
                Point::new(coord.lon, coord.lat)
            })
            .collect();

        let hull = MultiPoint::new(points).convex_hull();
        let hull = if tolerance_m > 0.0 {
            hull.simplify(&(tolerance_m / METERS_PER_DEGREE))
        } else {
            hull
        };

        let area_km2 = hull.unsigned_area() * KM_PER_DEGREE * KM_PER_DEGREE;
        let ring: Vec<[f64; 2]> = hull.exterior().coords().map(|c| [c.x, c.y]).collect();

        bands.push(IsochroneBand {
            travel_time_minutes: round2(cutoff_s as f64 / 60.0),
            area_km2: round2(area_km2),
            reachable_nodes: reachable.len(),
            polygon_coordinates: vec![ring],
        });
    }

    Ok(bands)
}

/// Dijkstra over edge travel times. With a cutoff, nodes beyond it are never
/// expanded; without one the whole component is settled. Cancellation is
/// polled at iteration boundaries.
fn travel_times_from(
    graph: &RoadGraph,
    origin: NodeIndex,
    cutoff_s: Option<f64>,
    cancel: &CancellationToken,
) -> Result<HashMap<NodeIndex, f64>, IsochroneError> {
    #[derive(PartialEq)]
    struct Entry {
        cost: f64,
        node: NodeIndex,
    }
    impl Eq for Entry {}
    impl PartialOrd for Entry {
        fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }
    impl Ord for Entry {
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            self.cost
                .partial_cmp(&other.cost)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.node.cmp(&other.node))
        }
    }

    let inner = graph.graph();
    let mut dist: HashMap<NodeIndex, f64> = HashMap::new();
    let mut heap = BinaryHeap::new();
    dist.insert(origin, 0.0);
    heap.push(Reverse(Entry {
        cost: 0.0,
        node: origin,
    }));

    let mut iterations = 0usize;
    while let Some(Reverse(Entry { cost, node })) = heap.pop() {
        iterations += 1;
        if iterations % 1024 == 0 && cancel.is_cancelled() {
            return Err(IsochroneError::Cancelled);
        }
        if dist.get(&node).map(|&d| cost > d).unwrap_or(false) {
            continue;
        }
        for edge in inner.edges(node) {
            let next = edge.target();
            let next_cost = cost + edge.weight().travel_time_s;
            if let Some(limit) = cutoff_s {
                if next_cost > limit {
                    continue;
                }
            }
            let better = dist
                .get(&next)
                .map(|&current| next_cost < current)
                .unwrap_or(true);
            if better {
                dist.insert(next, next_cost);
                heap.push(Reverse(Entry {
                    cost: next_cost,
                    node: next,
                }));
            }
        }
    }

    Ok(dist)
}

/// GeoJSON FeatureCollection: one Feature per cutoff, polygon geometry plus
/// travel time, area and node-count properties.
pub fn to_feature_collection(result: &IsochroneResult) -> FeatureCollection {
    let features = result
        .isochrones
        .iter()
        .map(|band| {
            let rings: Vec<Vec<Vec<f64>>> = band
                .polygon_coordinates
                .iter()
                .map(|ring| ring.iter().map(|p| p.to_vec()).collect())
                .collect();

            let mut properties = JsonObject::new();
            properties.insert("travel_time_minutes".into(), band.travel_time_minutes.into());
            properties.insert("area_km2".into(), band.area_km2.into());
            properties.insert("reachable_nodes".into(), band.reachable_nodes.into());

            Feature {
                bbox: None,
                geometry: Some(Geometry::new(GeoValue::Polygon(rings))),
                id: None,
                properties: Some(properties),
                foreign_members: None,
            }
        })
        .collect();

    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

// ---------------------------------------------------------------------------
// Aggregate responses
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ModeComparison {
    Band {
        area_km2: f64,
        reachable_nodes: usize,
        polygon_coordinates: Vec<Vec<[f64; 2]>>,
        processing_time_seconds: f64,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Serialize)]
pub struct CompareSummary {
    pub largest_area: AreaRef,
    pub smallest_area: AreaRef,
    pub area_ratio_largest_to_smallest: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct AreaRef {
    pub mode: String,
    pub area_km2: f64,
}

#[derive(Debug, Serialize)]
pub struct CompareResponse {
    pub center: Coordinate,
    pub travel_time_minutes: f64,
    pub comparisons: HashMap<String, ModeComparison>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<CompareSummary>,
    pub total_processing_time_seconds: f64,
}

#[derive(Debug, Serialize)]
pub struct BatchEntry {
    pub location_index: usize,
    pub location_name: String,
    #[serde(flatten)]
    pub result: Option<IsochroneResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub travel_mode: String,
    pub travel_times: Vec<f64>,
    pub total_locations: usize,
    pub successful_calculations: usize,
    pub failed_calculations: usize,
    pub results: Vec<BatchEntry>,
    pub total_processing_time_seconds: f64,
}

#[derive(Debug, Serialize)]
pub struct PreloadEntry {
    pub location: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PreloadResponse {
    pub successful: usize,
    pub failed: usize,
    pub preload_results: Vec<PreloadEntry>,
}

fn summarize(comparisons: &HashMap<String, ModeComparison>) -> Option<CompareSummary> {
    let mut areas: Vec<(&str, f64)> = comparisons
        .iter()
        .filter_map(|(mode, entry)| match entry {
            ModeComparison::Band { area_km2, .. } => Some((mode.as_str(), *area_km2)),
            ModeComparison::Failed { .. } => None,
        })
        .collect();
    if areas.is_empty() {
        return None;
    }
    areas.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let (largest_mode, largest) = areas[0];
    let (smallest_mode, smallest) = *areas.last().expect("non-empty");
    Some(CompareSummary {
        largest_area: AreaRef {
            mode: largest_mode.to_string(),
            area_km2: largest,
        },
        smallest_area: AreaRef {
            mode: smallest_mode.to_string(),
            area_km2: smallest,
        },
        area_ratio_largest_to_smallest: (smallest > 0.0).then(|| round2(largest / smallest)),
    })
}

/// Per-cutoff statistics with growth analysis between consecutive cutoffs.
pub fn band_statistics(result: &IsochroneResult) -> (Vec<BandStats>, Vec<AreaGrowth>) {
    let stats: Vec<BandStats> = result
        .isochrones
        .iter()
        .map(|band| BandStats {
            travel_time_minutes: band.travel_time_minutes,
            area_km2: band.area_km2,
            reachable_nodes: band.reachable_nodes,
            vertex_count: band
                .polygon_coordinates
                .first()
                .map(|ring| ring.len())
                .unwrap_or(0),
        })
        .collect();

    let growth = stats
        .windows(2)
        .map(|pair| {
            let (prev, curr) = (&pair[0], &pair[1]);
            let rate = if prev.area_km2 > 0.0 {
                (curr.area_km2 - prev.area_km2) / prev.area_km2 * 100.0
            } else {
                0.0
            };
            AreaGrowth {
                from_minutes: prev.travel_time_minutes,
                to_minutes: curr.travel_time_minutes,
                area_increase_km2: round2(curr.area_km2 - prev.area_km2),
                growth_rate_percent: (rate * 10.0).round() / 10.0,
            }
        })
        .collect();

    (stats, growth)
}

#[derive(Debug, Serialize)]
pub struct BandStats {
    pub travel_time_minutes: f64,
    pub area_km2: f64,
    pub reachable_nodes: usize,
    pub vertex_count: usize,
}

#[derive(Debug, Serialize)]
pub struct AreaGrowth {
    pub from_minutes: f64,
    pub to_minutes: f64,
    pub area_increase_km2: f64,
    pub growth_rate_percent: f64,
}
