use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use kdtree::distance::squared_euclidean;
use kdtree::KdTree;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use shared::{Coordinate, Profile};

pub const MPH_TO_KPH: f64 = 1.60934;
const DEFAULT_ROAD_SPEED_KPH: f64 = 50.0;

/// Speed assumptions per OSM highway class, used when an edge carries no
/// usable maxspeed. Matched by substring so variants like `motorway_link`
/// resolve to their base class.
const HIGHWAY_SPEEDS_KPH: [(&str, f64); 11] = [
    ("motorway", 120.0),
    ("trunk", 100.0),
    ("primary", 90.0),
    ("secondary", 80.0),
    ("tertiary", 60.0),
    ("residential", 40.0),
    ("service", 30.0),
    ("living_street", 20.0),
    ("pedestrian", 5.0),
    ("track", 30.0),
    ("unclassified", 50.0),
];

pub fn highway_speed_kph(highway: &str) -> f64 {
    HIGHWAY_SPEEDS_KPH
        .iter()
        .find(|(class, _)| highway.contains(class))
        .map(|(_, kph)| *kph)
        .unwrap_or(DEFAULT_ROAD_SPEED_KPH)
}

/// Parses an OSM maxspeed tag value. Handles plain km/h numbers and the
/// `"NN mph"` form.
pub fn parse_maxspeed(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let (number, mph) = match raw.strip_suffix("mph") {
        Some(prefix) => (prefix.trim(), true),
        None => (raw.split_whitespace().next()?, false),
    };
    let value: f64 = number.parse().ok()?;
    if value <= 0.0 {
        return None;
    }
    Some(if mph { value * MPH_TO_KPH } else { value })
}

/// Per-edge speed for a profile-annotated graph: driving honours posted
/// maxspeed then falls back to the highway class table; walking and cycling
/// move at the profile speed regardless of road class.
pub fn edge_speed_kph(profile: Profile, highway: &str, maxspeed_kph: Option<f64>) -> f64 {
    match profile {
        Profile::Driving => maxspeed_kph.unwrap_or_else(|| highway_speed_kph(highway)),
        Profile::Walking | Profile::Cycling => profile.default_speed_kph(),
    }
}

pub fn travel_time_s(length_m: f64, speed_kph: f64) -> f64 {
    length_m / (speed_kph * 1000.0 / 3600.0)
}

// ---------------------------------------------------------------------------
// Serialized graph form (the on-disk and on-the-wire shape)
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphFile {
    pub profile: Profile,
    pub nodes: Vec<NodeRecord>,
    pub edges: Vec<EdgeRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: u64,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub from: u64,
    pub to: u64,
    pub length_m: f64,
    pub highway: String,
    #[serde(default)]
    pub maxspeed_kph: Option<f64>,
    #[serde(default)]
    pub speed_kph: f64,
    #[serde(default)]
    pub travel_time_s: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Vec<Coordinate>>,
}

// ---------------------------------------------------------------------------
// In-memory graph
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("graph contains no nodes")]
    EmptyGraph,
    #[error("edge references unknown node {0}")]
    MissingNode(u64),
    #[error("node {0} has a non-finite coordinate")]
    BadCoordinate(u64),
}

#[derive(Clone, Debug)]
pub struct RoadNode {
    pub id: u64,
    pub coord: Coordinate,
}

#[derive(Clone, Debug)]
pub struct RoadEdge {
    pub length_m: f64,
    pub highway: String,
    pub maxspeed_kph: Option<f64>,
    pub speed_kph: f64,
    pub travel_time_s: f64,
    pub geometry: Option<Vec<Coordinate>>,
}

/// Directed road network for one profile, with a spatial index for
/// nearest-node lookups.
pub struct RoadGraph {
    graph: DiGraph<RoadNode, RoadEdge>,
    index: KdTree<f64, NodeIndex, [f64; 2]>,
    profile: Profile,
}

impl RoadGraph {
    /// Builds the in-memory graph. Edges lacking a travel time are annotated
    /// here; a profile-annotated graph always has positive length and
    /// travel_time on every edge.
    pub fn from_file(file: GraphFile) -> Result<Self, GraphError> {
        if file.nodes.is_empty() {
            return Err(GraphError::EmptyGraph);
        }

        let mut graph = DiGraph::with_capacity(file.nodes.len(), file.edges.len());
        let mut index = KdTree::new(2);
        let mut id_to_index = HashMap::with_capacity(file.nodes.len());

        for node in file.nodes {
            let coord = Coordinate::new(node.lat, node.lon);
            if !coord.lat.is_finite() || !coord.lon.is_finite() {
                return Err(GraphError::BadCoordinate(node.id));
            }
            let idx = graph.add_node(RoadNode { id: node.id, coord });
            index
                .add([coord.lon, coord.lat], idx)
                .map_err(|_| GraphError::BadCoordinate(node.id))?;
            id_to_index.insert(node.id, idx);
        }

        for edge in file.edges {
            let from = *id_to_index
                .get(&edge.from)
                .ok_or(GraphError::MissingNode(edge.from))?;
            let to = *id_to_index
                .get(&edge.to)
                .ok_or(GraphError::MissingNode(edge.to))?;
            if edge.length_m <= 0.0 {
                continue;
            }

            let speed_kph = if edge.speed_kph > 0.0 {
                edge.speed_kph
            } else {
                edge_speed_kph(file.profile, &edge.highway, edge.maxspeed_kph)
            };
            let time_s = if edge.travel_time_s > 0.0 {
                edge.travel_time_s
            } else {
                travel_time_s(edge.length_m, speed_kph)
            };

            graph.add_edge(
                from,
                to,
                RoadEdge {
                    length_m: edge.length_m,
                    highway: edge.highway,
                    maxspeed_kph: edge.maxspeed_kph,
                    speed_kph,
                    travel_time_s: time_s,
                    geometry: edge.geometry,
                },
            );
        }

        Ok(Self {
            graph,
            index,
            profile: file.profile,
        })
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    pub fn graph(&self) -> &DiGraph<RoadNode, RoadEdge> {
        &self.graph
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn node_coord(&self, idx: NodeIndex) -> Coordinate {
        self.graph[idx].coord
    }

    pub fn nearest_node(&self, target: Coordinate) -> Option<NodeIndex> {
        self.index
            .nearest(&[target.lon, target.lat], 1, &squared_euclidean)
            .ok()?
            .first()
            .map(|(_, idx)| **idx)
    }

    /// Coordinates along a node path, expanding fine-grained edge geometry
    /// where an edge carries it.
    pub fn path_coordinates(&self, path: &[NodeIndex]) -> Vec<Coordinate> {
        let mut coords = Vec::with_capacity(path.len());
        if let Some(&first) = path.first() {
            coords.push(self.node_coord(first));
        }
        for pair in path.windows(2) {
            let edge = self
                .graph
                .edges_connecting(pair[0], pair[1])
                .min_by(|a, b| {
                    a.weight()
                        .length_m
                        .partial_cmp(&b.weight().length_m)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
            if let Some(edge) = edge {
                if let Some(geometry) = &edge.weight().geometry {
                    coords.extend(geometry.iter().copied());
                }
            }
            coords.push(self.node_coord(pair[1]));
        }
        coords
    }

    pub fn to_file(&self) -> GraphFile {
        let nodes = self
            .graph
            .node_weights()
            .map(|n| NodeRecord {
                id: n.id,
                lat: n.coord.lat,
                lon: n.coord.lon,
            })
            .collect();
        let edges = self
            .graph
            .edge_indices()
            .map(|e| {
                let (from, to) = self.graph.edge_endpoints(e).expect("edge endpoints");
                let w = &self.graph[e];
                EdgeRecord {
                    from: self.graph[from].id,
                    to: self.graph[to].id,
                    length_m: w.length_m,
                    highway: w.highway.clone(),
                    maxspeed_kph: w.maxspeed_kph,
                    speed_kph: w.speed_kph,
                    travel_time_s: w.travel_time_s,
                    geometry: w.geometry.clone(),
                }
            })
            .collect();
        GraphFile {
            profile: self.profile,
            nodes,
            edges,
        }
    }
}

// ---------------------------------------------------------------------------
// Cache keys
// ---------------------------------------------------------------------------

/// Bucketed region identifier: coordinates rounded to 3 decimals, radius to
/// whole kilometers. Queries landing in the same bucket share one graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionKey {
    lat_bucket: i64,
    lon_bucket: i64,
    radius_km: u32,
    profile: Profile,
}

impl RegionKey {
    pub fn new(lat: f64, lon: f64, radius_m: f64, profile: Profile) -> Self {
        Self {
            lat_bucket: (lat * 1000.0).round() as i64,
            lon_bucket: (lon * 1000.0).round() as i64,
            radius_km: (radius_m / 1000.0).floor().max(1.0) as u32,
            profile,
        }
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    pub fn center(&self) -> Coordinate {
        Coordinate::new(self.lat_bucket as f64 / 1000.0, self.lon_bucket as f64 / 1000.0)
    }

    pub fn radius_m(&self) -> f64 {
        self.radius_km as f64 * 1000.0
    }

    /// The 8 surrounding buckets (one step along each axis), candidates for
    /// background prefetch.
    pub fn neighbours(&self) -> Vec<RegionKey> {
        let mut out = Vec::with_capacity(8);
        for dlat in [-1i64, 0, 1] {
            for dlon in [-1i64, 0, 1] {
                if dlat == 0 && dlon == 0 {
                    continue;
                }
                out.push(RegionKey {
                    lat_bucket: self.lat_bucket + dlat,
                    lon_bucket: self.lon_bucket + dlon,
                    radius_km: self.radius_km,
                    profile: self.profile,
                });
            }
        }
        out
    }

    /// File stem: `<lat>_<lng>_<km>km_<profile>`.
    pub fn file_stem(&self) -> String {
        let center = self.center();
        format!(
            "{:.3}_{:.3}_{}km_{}",
            center.lat, center.lon, self.radius_km, self.profile
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    /// Smallest box containing all points, padded by a margin in kilometers.
    pub fn from_points(points: &[Coordinate], margin_km: f64) -> Option<Self> {
        let first = points.first()?;
        let mut bbox = Self {
            min_lat: first.lat,
            max_lat: first.lat,
            min_lon: first.lon,
            max_lon: first.lon,
        };
        for p in &points[1..] {
            bbox.min_lat = bbox.min_lat.min(p.lat);
            bbox.max_lat = bbox.max_lat.max(p.lat);
            bbox.min_lon = bbox.min_lon.min(p.lon);
            bbox.max_lon = bbox.max_lon.max(p.lon);
        }

        // 1 degree of latitude is roughly 111 km; longitude shrinks with
        // the cosine of latitude.
        let lat_margin = margin_km / 111.0;
        let avg_lat = (bbox.min_lat + bbox.max_lat) / 2.0;
        let lon_margin = margin_km / (111.0 * avg_lat.to_radians().cos().max(0.01));
        bbox.min_lat -= lat_margin;
        bbox.max_lat += lat_margin;
        bbox.min_lon -= lon_margin;
        bbox.max_lon += lon_margin;
        Some(bbox)
    }

    pub fn center(&self) -> Coordinate {
        Coordinate::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lon + self.max_lon) / 2.0,
        )
    }

    pub fn key(&self, profile: Profile) -> BBoxKey {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        // Round to 3 decimals (~100m) so nearby requests share a file.
        ((self.min_lat * 1000.0).round() as i64).hash(&mut hasher);
        ((self.max_lat * 1000.0).round() as i64).hash(&mut hasher);
        ((self.min_lon * 1000.0).round() as i64).hash(&mut hasher);
        ((self.max_lon * 1000.0).round() as i64).hash(&mut hasher);
        profile.hash(&mut hasher);
        BBoxKey {
            hash: hasher.finish(),
        }
    }
}

/// Key for graphs built from an explicit enclosing rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BBoxKey {
    hash: u64,
}

impl BBoxKey {
    /// File stem: `bbox_<10-char-hash>`.
    pub fn file_stem(&self) -> String {
        let hex = format!("{:016x}", self.hash);
        format!("bbox_{}", &hex[..10])
    }
}
