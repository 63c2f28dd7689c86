//! Deterministic in-process graphs for tests: a dense synthetic road grid
//! standing in for the upstream OSM provider.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use shared::{Coordinate, Profile};

use crate::graph::{BoundingBox, EdgeRecord, GraphFile, NodeRecord, RegionKey};
use crate::loader::{FetchError, GraphFetcher};

/// Target spacing between grid nodes; the grid size adapts to the requested
/// radius within these bounds (odd, so the center is an exact node).
const TARGET_SPACING_M: f64 = 1200.0;
const MIN_GRID_SIZE: i64 = 21;
const MAX_GRID_SIZE: i64 = 121;

/// Dense neighbourhood (axis, diagonal and knight-like moves) so shortest
/// paths stay within a percent or two of the great-circle distance.
const NEIGHBOUR_OFFSETS: [(i64, i64); 12] = [
    (0, 1),
    (1, 0),
    (1, 1),
    (1, -1),
    (1, 2),
    (2, 1),
    (1, -2),
    (2, -1),
    (1, 3),
    (3, 1),
    (1, -3),
    (3, -1),
];

fn grid_size(radius_m: f64) -> i64 {
    let size = (radius_m * 2.0 / TARGET_SPACING_M).round() as i64;
    (size | 1).clamp(MIN_GRID_SIZE, MAX_GRID_SIZE)
}

/// Synthetic residential grid centred on `center`, spanning `radius_m` in
/// each direction. Edges carry real haversine lengths; annotation happens in
/// `RoadGraph::from_file` exactly as for upstream graphs.
pub fn grid_graph_file(center: Coordinate, profile: Profile, radius_m: f64) -> GraphFile {
    let size = grid_size(radius_m);
    let half = size / 2;
    let lat_step = (radius_m / half as f64) / 111_320.0;
    let lon_step = lat_step / center.lat.to_radians().cos().max(0.2);

    let node_id = |row: i64, col: i64| ((row + half) * size + (col + half) + 1) as u64;
    let node_coord = |row: i64, col: i64| {
        Coordinate::new(
            center.lat + row as f64 * lat_step,
            center.lon + col as f64 * lon_step,
        )
    };

    let mut nodes = Vec::new();
    let mut edges = Vec::new();

    for row in -half..=half {
        for col in -half..=half {
            nodes.push(NodeRecord {
                id: node_id(row, col),
                lat: node_coord(row, col).lat,
                lon: node_coord(row, col).lon,
            });

            for (dr, dc) in NEIGHBOUR_OFFSETS {
                let (nr, nc) = (row + dr, col + dc);
                if nr < -half || nr > half || nc < -half || nc > half {
                    continue;
                }
                let length_m = node_coord(row, col).haversine_m(node_coord(nr, nc));
                for (from, to) in [
                    (node_id(row, col), node_id(nr, nc)),
                    (node_id(nr, nc), node_id(row, col)),
                ] {
                    edges.push(EdgeRecord {
                        from,
                        to,
                        length_m,
                        highway: "residential".into(),
                        maxspeed_kph: None,
                        speed_kph: 0.0,
                        travel_time_s: 0.0,
                        geometry: None,
                    });
                }
            }
        }
    }

    GraphFile {
        profile,
        nodes,
        edges,
    }
}

/// Upstream stand-in that synthesizes a grid for any requested region and
/// counts how often each key is hit.
#[derive(Default)]
pub struct SyntheticFetcher {
    region_calls: AtomicUsize,
    region_keys: std::sync::Mutex<Vec<String>>,
    bbox_calls: AtomicUsize,
    delay: Option<Duration>,
}

impl SyntheticFetcher {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Total region fetches, including background prefetches.
    pub fn region_calls(&self) -> usize {
        self.region_calls.load(Ordering::SeqCst)
    }

    /// Fetch count for one exact region key, immune to prefetch noise.
    pub fn calls_for(&self, stem: &str) -> usize {
        self.region_keys
            .lock()
            .expect("keys lock")
            .iter()
            .filter(|k| k.as_str() == stem)
            .count()
    }

    pub fn bbox_calls(&self) -> usize {
        self.bbox_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GraphFetcher for SyntheticFetcher {
    async fn fetch_region(&self, key: &RegionKey) -> Result<GraphFile, FetchError> {
        self.region_calls.fetch_add(1, Ordering::SeqCst);
        self.region_keys
            .lock()
            .expect("keys lock")
            .push(key.file_stem());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(grid_graph_file(key.center(), key.profile(), key.radius_m()))
    }

    async fn fetch_bbox(
        &self,
        bbox: &BoundingBox,
        profile: Profile,
    ) -> Result<GraphFile, FetchError> {
        self.bbox_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let center = bbox.center();
        let radius_m = Coordinate::new(bbox.min_lat, bbox.min_lon).haversine_m(center);
        Ok(grid_graph_file(center, profile, radius_m.max(2000.0)))
    }
}
