use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;
use rayon::prelude::*;
use tokio_util::sync::CancellationToken;

use crate::graph::{highway_speed_kph, RoadGraph};

/// Fixed per-stop delay for every interior node on a path.
pub const INTERSECTION_PENALTY_S: f64 = 15.0;
/// Multiplicative penalty over pure kinematic travel time.
pub const CONGESTION_FACTOR: f64 = 1.4;
/// Fixed startup/stop overhead added once per leg.
pub const STARTUP_OVERHEAD_S: f64 = 20.0;
/// Conservative speed for pairs the road network cannot connect.
pub const UNREACHABLE_FALLBACK_KPH: f64 = 25.0;

const DEFAULT_EDGE_SPEED_KPH: f64 = 50.0;

#[derive(Debug, thiserror::Error)]
#[error("matrix construction cancelled")]
pub struct MatrixCancelled;

/// Square matrices over a chosen node list. `estimated[i][j]` marks pairs
/// repaired with the great-circle fallback because no road path exists.
pub struct MatrixSet {
    pub distance: Vec<Vec<f64>>,
    pub time: Vec<Vec<f64>>,
    pub path: Vec<Vec<Vec<NodeIndex>>>,
    pub estimated: Vec<Vec<bool>>,
}

impl MatrixSet {
    pub fn len(&self) -> usize {
        self.distance.len()
    }

    pub fn is_empty(&self) -> bool {
        self.distance.is_empty()
    }

    /// True when no off-diagonal pair has a road path at all.
    pub fn fully_estimated(&self) -> bool {
        let n = self.len();
        n > 1
            && (0..n).all(|i| (0..n).all(|j| i == j || self.estimated[i][j]))
    }
}

/// Builds distance/time/path matrices for the selected nodes. Each source
/// row is an independent Dijkstra over edge length; rows run in parallel.
/// Cancellation is observed at row boundaries.
pub fn build_matrix(
    graph: &RoadGraph,
    nodes: &[NodeIndex],
    cancel: &CancellationToken,
) -> Result<MatrixSet, MatrixCancelled> {
    let n = nodes.len();

    let rows: Vec<Result<Row, MatrixCancelled>> = nodes
        .par_iter()
        .map(|&source| {
            if cancel.is_cancelled() {
                return Err(MatrixCancelled);
            }
            Ok(single_source_row(graph, source, nodes))
        })
        .collect();

    let mut distance = Vec::with_capacity(n);
    let mut time = Vec::with_capacity(n);
    let mut path = Vec::with_capacity(n);
    let mut estimated = Vec::with_capacity(n);

    for (i, row) in rows.into_iter().enumerate() {
        let row = row?;
        let mut dist_row = row.distance;
        let mut time_row = row.time;
        let path_row = row.path;
        let mut estimated_row = vec![false; n];

        for j in 0..n {
            if i == j {
                dist_row[j] = 0.0;
                time_row[j] = 0.0;
                continue;
            }
            if dist_row[j].is_finite() {
                continue;
            }
            // No road path: repair with great-circle distance at a
            // conservative urban speed and flag the pair.
            let from = graph.node_coord(nodes[i]);
            let to = graph.node_coord(nodes[j]);
            let straight_m = from.haversine_m(to);
            dist_row[j] = straight_m;
            time_row[j] = straight_m / (UNREACHABLE_FALLBACK_KPH * 1000.0 / 3600.0);
            estimated_row[j] = true;
        }

        distance.push(dist_row);
        time.push(time_row);
        path.push(path_row);
        estimated.push(estimated_row);
    }

    Ok(MatrixSet {
        distance,
        time,
        path,
        estimated,
    })
}

/// Shortest path between two nodes by edge length: (meters, node path).
pub fn shortest_path(
    graph: &RoadGraph,
    source: NodeIndex,
    target: NodeIndex,
) -> Option<(f64, Vec<NodeIndex>)> {
    let (dist, prev) = dijkstra_by_length(graph, source, &[target]);
    let meters = *dist.get(&target)?;
    let path = reconstruct(&prev, source, target);
    if path.is_empty() {
        return None;
    }
    Some((meters, path))
}

struct Row {
    distance: Vec<f64>,
    time: Vec<f64>,
    path: Vec<Vec<NodeIndex>>,
}

fn single_source_row(graph: &RoadGraph, source: NodeIndex, targets: &[NodeIndex]) -> Row {
    let (dist, prev) = dijkstra_by_length(graph, source, targets);

    let mut distance = vec![f64::INFINITY; targets.len()];
    let mut time = vec![f64::INFINITY; targets.len()];
    let mut path = vec![Vec::new(); targets.len()];

    for (j, &target) in targets.iter().enumerate() {
        if let Some(&d) = dist.get(&target) {
            let node_path = reconstruct(&prev, source, target);
            time[j] = realistic_travel_time(graph, &node_path);
            distance[j] = d;
            path[j] = node_path;
        }
    }

    Row {
        distance,
        time,
        path,
    }
}

#[derive(PartialEq)]
struct HeapEntry {
    cost: f64,
    node: NodeIndex,
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.cost
            .partial_cmp(&other.cost)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| self.node.cmp(&other.node))
    }
}

/// Dijkstra keyed by edge length with predecessor tracking. Stops early once
/// every target is settled.
fn dijkstra_by_length(
    graph: &RoadGraph,
    source: NodeIndex,
    targets: &[NodeIndex],
) -> (HashMap<NodeIndex, f64>, HashMap<NodeIndex, NodeIndex>) {
    let inner = graph.graph();
    let mut dist: HashMap<NodeIndex, f64> = HashMap::new();
    let mut prev: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut settled: HashMap<NodeIndex, bool> = HashMap::new();
    let mut heap = BinaryHeap::new();

    let wanted: std::collections::HashSet<NodeIndex> = targets.iter().copied().collect();
    let mut remaining = wanted.len();

    dist.insert(source, 0.0);
    heap.push(Reverse(HeapEntry {
        cost: 0.0,
        node: source,
    }));

    while let Some(Reverse(HeapEntry { cost, node })) = heap.pop() {
        if settled.insert(node, true).is_some() {
            continue;
        }
        if wanted.contains(&node) {
            remaining -= 1;
            if remaining == 0 {
                break;
            }
        }

        for edge in inner.edges(node) {
            let next = edge.target();
            let next_cost = cost + edge.weight().length_m;
            let better = dist
                .get(&next)
                .map(|&current| next_cost < current)
                .unwrap_or(true);
            if better {
                dist.insert(next, next_cost);
                prev.insert(next, node);
                heap.push(Reverse(HeapEntry {
                    cost: next_cost,
                    node: next,
                }));
            }
        }
    }

    (dist, prev)
}

fn reconstruct(
    prev: &HashMap<NodeIndex, NodeIndex>,
    source: NodeIndex,
    target: NodeIndex,
) -> Vec<NodeIndex> {
    if source == target {
        return vec![source];
    }
    let mut path = vec![target];
    let mut cursor = target;
    while let Some(&p) = prev.get(&cursor) {
        path.push(p);
        if p == source {
            path.reverse();
            return path;
        }
        cursor = p;
    }
    Vec::new()
}

/// Travel-time estimate for a concrete node path:
/// per-edge kinematic time from posted maxspeed (falling back to the highway
/// class table), plus 15 s per interior intersection, all scaled by the 1.4
/// congestion factor, plus a 20 s startup/stop overhead.
pub fn realistic_travel_time(graph: &RoadGraph, path: &[NodeIndex]) -> f64 {
    if path.len() < 2 {
        return 0.0;
    }

    let inner = graph.graph();
    let mut kinematic = 0.0;

    for pair in path.windows(2) {
        let Some(edge) = inner
            .edges_connecting(pair[0], pair[1])
            .min_by(|a, b| {
                a.weight()
                    .length_m
                    .partial_cmp(&b.weight().length_m)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        else {
            continue;
        };
        let weight = edge.weight();
        let speed_kph = weight
            .maxspeed_kph
            .unwrap_or_else(|| lookup_speed(&weight.highway));
        kinematic += weight.length_m / (speed_kph * 1000.0 / 3600.0);
    }

    let interior = path.len().saturating_sub(2) as f64;
    let intersections = interior * INTERSECTION_PENALTY_S;
    (kinematic + intersections) * CONGESTION_FACTOR + STARTUP_OVERHEAD_S
}

fn lookup_speed(highway: &str) -> f64 {
    if highway.is_empty() {
        DEFAULT_EDGE_SPEED_KPH
    } else {
        highway_speed_kph(highway)
    }
}
