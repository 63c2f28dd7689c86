use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use shared::{Coordinate, Profile};

use crate::graph::{edge_speed_kph, parse_maxspeed, travel_time_s, BoundingBox, EdgeRecord, GraphFile, NodeRecord, RegionKey};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("upstream provider unavailable: {0}")]
    Upstream(String),
    #[error("upstream returned no nodes for the requested area")]
    EmptyGraph,
    #[error("graph exceeds the configured node limit ({nodes} > {limit})")]
    Oversize { nodes: usize, limit: usize },
}

/// Port for obtaining road graphs from an upstream OSM-data provider. Every
/// returned graph is profile-annotated: positive length and travel_time on
/// each edge.
#[async_trait]
pub trait GraphFetcher: Send + Sync {
    async fn fetch_region(&self, key: &RegionKey) -> Result<GraphFile, FetchError>;
    async fn fetch_bbox(&self, bbox: &BoundingBox, profile: Profile)
        -> Result<GraphFile, FetchError>;
}

/// Overpass-compatible loader. One retry with backoff, then the region is
/// reported unavailable.
pub struct OverpassLoader {
    http: reqwest::Client,
    base_url: String,
    node_limit: usize,
}

impl OverpassLoader {
    pub fn new(base_url: impl Into<String>, node_limit: usize) -> Self {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent("geospatial-backend")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url: base_url.into(),
            node_limit,
        }
    }

    async fn run_query(&self, query: String, profile: Profile) -> Result<GraphFile, FetchError> {
        let mut attempt = 0;
        let response = loop {
            match self.post_query(&query).await {
                Ok(response) => break response,
                Err(err) if attempt == 0 => {
                    tracing::warn!(error = %err, "upstream fetch failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(RETRY_BACKOFF * 2u32.pow(attempt)).await;
                }
                Err(err) => return Err(FetchError::Upstream(err)),
            }
        };

        build_graph_file(response, profile, self.node_limit)
    }

    async fn post_query(&self, query: &str) -> Result<OverpassResponse, String> {
        let response = self
            .http
            .post(&self.base_url)
            .form(&[("data", query)])
            .send()
            .await
            .map_err(|err| err.to_string())?;
        let response = response.error_for_status().map_err(|err| err.to_string())?;
        response
            .json::<OverpassResponse>()
            .await
            .map_err(|err| err.to_string())
    }
}

#[async_trait]
impl GraphFetcher for OverpassLoader {
    async fn fetch_region(&self, key: &RegionKey) -> Result<GraphFile, FetchError> {
        let center = key.center();
        let query = format!(
            "[out:json][timeout:25];way(around:{:.0},{:.5},{:.5})[\"highway\"~\"{}\"];(._;>;);out body;",
            key.radius_m(),
            center.lat,
            center.lon,
            highway_filter(key.profile()),
        );
        tracing::info!(key = %key.file_stem(), "fetching graph from upstream");
        self.run_query(query, key.profile()).await
    }

    async fn fetch_bbox(
        &self,
        bbox: &BoundingBox,
        profile: Profile,
    ) -> Result<GraphFile, FetchError> {
        let query = format!(
            "[out:json][timeout:25];way({:.5},{:.5},{:.5},{:.5})[\"highway\"~\"{}\"];(._;>;);out body;",
            bbox.min_lat,
            bbox.min_lon,
            bbox.max_lat,
            bbox.max_lon,
            highway_filter(profile),
        );
        tracing::info!(key = %bbox.key(profile).file_stem(), "fetching bbox graph from upstream");
        self.run_query(query, profile).await
    }
}

fn highway_filter(profile: Profile) -> &'static str {
    match profile {
        Profile::Driving => {
            "motorway|trunk|primary|secondary|tertiary|residential|unclassified|service|living_street"
        }
        Profile::Walking => {
            "footway|path|pedestrian|steps|track|living_street|residential|service|unclassified|tertiary|secondary|primary"
        }
        Profile::Cycling => {
            "cycleway|path|track|living_street|residential|service|unclassified|tertiary|secondary|primary"
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct OverpassResponse {
    #[serde(default)]
    elements: Vec<OverpassElement>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OverpassElement {
    #[serde(rename = "type")]
    kind: String,
    id: i64,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    nodes: Vec<i64>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

/// Assembles an annotated graph from raw Overpass elements. Oneway tags are
/// honoured for driving; walking and cycling traverse every edge both ways.
pub(crate) fn build_graph_file(
    response: OverpassResponse,
    profile: Profile,
    node_limit: usize,
) -> Result<GraphFile, FetchError> {
    let mut coords: HashMap<i64, Coordinate> = HashMap::new();
    let mut ways = Vec::new();

    for element in response.elements {
        match element.kind.as_str() {
            "node" => {
                if let (Some(lat), Some(lon)) = (element.lat, element.lon) {
                    coords.insert(element.id, Coordinate::new(lat, lon));
                }
            }
            "way" if element.tags.contains_key("highway") => {
                ways.push((element.nodes, element.tags));
            }
            _ => {}
        }
    }

    let mut edges = Vec::new();
    let mut used: HashSet<i64> = HashSet::new();

    for (node_refs, tags) in ways {
        let highway = tags.get("highway").cloned().unwrap_or_default();
        let maxspeed_kph = tags.get("maxspeed").and_then(|raw| parse_maxspeed(raw));
        let oneway = tags.get("oneway").map(String::as_str);
        let (forward, backward) = match (profile, oneway) {
            (Profile::Driving, Some("yes") | Some("1") | Some("true")) => (true, false),
            (Profile::Driving, Some("-1")) => (false, true),
            _ => (true, true),
        };

        for pair in node_refs.windows(2) {
            let (from, to) = (pair[0], pair[1]);
            let (Some(a), Some(b)) = (coords.get(&from), coords.get(&to)) else {
                continue;
            };
            let length_m = a.haversine_m(*b);
            if length_m <= 0.0 {
                continue;
            }
            let speed_kph = edge_speed_kph(profile, &highway, maxspeed_kph);
            let time_s = travel_time_s(length_m, speed_kph);
            used.insert(from);
            used.insert(to);
            if forward {
                edges.push(EdgeRecord {
                    from: from as u64,
                    to: to as u64,
                    length_m,
                    highway: highway.clone(),
                    maxspeed_kph,
                    speed_kph,
                    travel_time_s: time_s,
                    geometry: None,
                });
            }
            if backward {
                edges.push(EdgeRecord {
                    from: to as u64,
                    to: from as u64,
                    length_m,
                    highway: highway.clone(),
                    maxspeed_kph,
                    speed_kph,
                    travel_time_s: time_s,
                    geometry: None,
                });
            }
        }
    }

    let mut nodes: Vec<NodeRecord> = used
        .iter()
        .filter_map(|id| {
            coords.get(id).map(|coord| NodeRecord {
                id: *id as u64,
                lat: coord.lat,
                lon: coord.lon,
            })
        })
        .collect();
    nodes.sort_by_key(|n| n.id);

    if nodes.is_empty() {
        return Err(FetchError::EmptyGraph);
    }
    if nodes.len() > node_limit {
        return Err(FetchError::Oversize {
            nodes: nodes.len(),
            limit: node_limit,
        });
    }

    Ok(GraphFile {
        profile,
        nodes,
        edges,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_from(json: &str) -> OverpassResponse {
        serde_json::from_str(json).expect("overpass json")
    }

    const SAMPLE: &str = r#"{
        "elements": [
            {"type": "node", "id": 1, "lat": 41.0, "lon": 21.0},
            {"type": "node", "id": 2, "lat": 41.001, "lon": 21.0},
            {"type": "node", "id": 3, "lat": 41.002, "lon": 21.0},
            {"type": "way", "id": 10, "nodes": [1, 2, 3],
             "tags": {"highway": "residential", "maxspeed": "30"}}
        ]
    }"#;

    #[test]
    fn builds_bidirectional_edges_by_default() {
        let file = build_graph_file(response_from(SAMPLE), Profile::Driving, 10_000).unwrap();
        assert_eq!(file.nodes.len(), 3);
        assert_eq!(file.edges.len(), 4, "two segments, both directions");
        for edge in &file.edges {
            assert_eq!(edge.speed_kph, 30.0);
            assert!(edge.travel_time_s > 0.0);
        }
    }

    #[test]
    fn oneway_is_respected_for_driving_only() {
        let json = r#"{
            "elements": [
                {"type": "node", "id": 1, "lat": 41.0, "lon": 21.0},
                {"type": "node", "id": 2, "lat": 41.001, "lon": 21.0},
                {"type": "way", "id": 10, "nodes": [1, 2],
                 "tags": {"highway": "primary", "oneway": "yes"}}
            ]
        }"#;
        let driving = build_graph_file(response_from(json), Profile::Driving, 10_000).unwrap();
        assert_eq!(driving.edges.len(), 1);
        assert_eq!(driving.edges[0].from, 1);

        let walking = build_graph_file(response_from(json), Profile::Walking, 10_000).unwrap();
        assert_eq!(walking.edges.len(), 2);
        assert!(walking.edges.iter().all(|e| e.speed_kph == 5.0));
    }

    #[test]
    fn empty_response_is_an_error() {
        let err = build_graph_file(response_from(r#"{"elements": []}"#), Profile::Driving, 10)
            .unwrap_err();
        assert!(matches!(err, FetchError::EmptyGraph));
    }

    #[test]
    fn node_limit_is_enforced() {
        let err = build_graph_file(response_from(SAMPLE), Profile::Driving, 2).unwrap_err();
        assert!(matches!(err, FetchError::Oversize { nodes: 3, limit: 2 }));
    }

    #[test]
    fn ways_referencing_unknown_nodes_are_skipped() {
        let json = r#"{
            "elements": [
                {"type": "node", "id": 1, "lat": 41.0, "lon": 21.0},
                {"type": "way", "id": 10, "nodes": [1, 99],
                 "tags": {"highway": "primary"}}
            ]
        }"#;
        let err = build_graph_file(response_from(json), Profile::Driving, 10).unwrap_err();
        assert!(matches!(err, FetchError::EmptyGraph));
    }
}
