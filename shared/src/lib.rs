use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    #[serde(alias = "latitude", deserialize_with = "lenient_f64")]
    pub lat: f64,
    #[serde(alias = "lng", alias = "longitude", deserialize_with = "lenient_f64")]
    pub lon: f64,
}

const EARTH_RADIUS_KM: f64 = 6_371.0;

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    pub fn haversine_km(self, other: Self) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlat = (other.lat - self.lat).to_radians();
        let dlon = (other.lon - self.lon).to_radians();

        let sin_dlat = (dlat / 2.0).sin();
        let sin_dlon = (dlon / 2.0).sin();

        let h = sin_dlat * sin_dlat + lat1.cos() * lat2.cos() * sin_dlon * sin_dlon;
        2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
    }

    pub fn haversine_m(self, other: Self) -> f64 {
        self.haversine_km(other) * 1000.0
    }
}

/// Accepts both JSON numbers and numeric strings ("41.99") for lat/lng
/// fields, since several upstream clients send coordinates as strings.
pub fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(f64),
        Text(String),
    }

    match NumOrString::deserialize(deserializer)? {
        NumOrString::Num(value) => Ok(value),
        NumOrString::Text(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom(format!("invalid number: {text:?}"))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Driving,
    Walking,
    Cycling,
}

pub const SUPPORTED_MODES: [&str; 3] = ["driving", "walking", "cycling"];

#[derive(Debug, thiserror::Error)]
#[error("invalid transport mode: '{input}'. Supported modes: driving, walking, cycling")]
pub struct UnknownProfile {
    pub input: String,
}

impl Profile {
    /// Normalizes request-level aliases to the canonical profile. The
    /// mapping is idempotent: canonical names parse to themselves.
    pub fn parse(mode: &str) -> Result<Self, UnknownProfile> {
        let mode = mode.trim().to_ascii_lowercase();
        if mode.is_empty() {
            return Ok(Profile::Driving);
        }
        match mode.as_str() {
            "driving" | "drive" | "car" | "auto" => Ok(Profile::Driving),
            "walking" | "walk" | "foot" | "pedestrian" => Ok(Profile::Walking),
            "cycling" | "cycle" | "bike" | "bicycle" => Ok(Profile::Cycling),
            _ => Err(UnknownProfile { input: mode }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Driving => "driving",
            Profile::Walking => "walking",
            Profile::Cycling => "cycling",
        }
    }

    /// Speed assumed where edge attributes are missing.
    pub fn default_speed_kph(&self) -> f64 {
        match self {
            Profile::Driving => 50.0,
            Profile::Walking => 5.0,
            Profile::Cycling => 15.0,
        }
    }
}

impl std::fmt::Display for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Current,
    Waypoint,
    Pickup,
    Delivery,
}

/// One stop of a matrix / pickup-delivery request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLocation {
    #[serde(alias = "lat", deserialize_with = "lenient_f64")]
    pub latitude: f64,
    #[serde(alias = "lng", alias = "lon", deserialize_with = "lenient_f64")]
    pub longitude: f64,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    pub location_id: String,
    #[serde(default)]
    pub package_id: Option<String>,
}

impl TaskLocation {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

// ---------------------------------------------------------------------------
// Directions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRequest {
    pub waypoints: Vec<Coordinate>,
    #[serde(default)]
    pub transport_mode: Option<String>,
    #[serde(default)]
    pub optimize_route: bool,
    #[serde(default, alias = "use_osmnx_fallback")]
    pub use_graph_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleRouteRequest {
    pub origin: Coordinate,
    pub destination: Coordinate,
    #[serde(default)]
    pub transport_mode: Option<String>,
    #[serde(default)]
    pub alternatives: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdpRouteRequest {
    pub current_location: Coordinate,
    pub locations: Vec<TaskLocation>,
    #[serde(default)]
    pub transport_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteStep {
    pub instruction: String,
    pub distance: f64,
    pub duration: f64,
    pub start_location: Coordinate,
    pub end_location: Coordinate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<(f64, f64)>>,
    pub transport_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResult {
    pub status: String,
    pub source: String,
    pub transport_mode: String,
    /// Kilometers.
    pub distance: f64,
    /// Seconds.
    pub duration: f64,
    pub duration_str: String,
    pub steps: Vec<RouteStep>,
    /// (lng, lat) points as returned by the upstream engine.
    pub geometry: Vec<[f64; 2]>,
    /// (lat, lng) points; decodes from `polyline`.
    pub decoded_polyline: Vec<(f64, f64)>,
    pub polyline: String,
    pub waypoints: Vec<Coordinate>,
    pub metadata: RouteMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteMetadata {
    pub execution_time: f64,
    pub optimized: bool,
    pub total_waypoints: usize,
    pub total_steps: usize,
}

// ---------------------------------------------------------------------------
// Matrix / Route Solver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixRequest {
    pub current_location: Coordinate,
    pub locations: Vec<TaskLocation>,
    #[serde(default)]
    pub pdp: bool,
    #[serde(default)]
    pub transport_mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSegment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_id: Option<String>,
    pub distance_km: f64,
    pub segment: String,
    pub duration_segment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSolution {
    pub optimal_route: Vec<String>,
    pub minimum_distance_km: f64,
    pub estimated_travel_time_seconds: u64,
    pub estimated_travel_time: String,
    /// (lat, lng) pairs in visit order.
    pub optimal_route_coordinates: Vec<(f64, f64)>,
    pub segment_details: Vec<RouteSegment>,
}

// ---------------------------------------------------------------------------
// Isochrones
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsochroneRequest {
    #[serde(deserialize_with = "lenient_f64")]
    pub latitude: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub longitude: f64,
    #[serde(default = "default_travel_times")]
    pub travel_times: Vec<f64>,
    #[serde(default = "default_travel_mode")]
    pub travel_mode: String,
    #[serde(default = "default_simplify_tolerance")]
    pub simplify_tolerance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsochroneCompareRequest {
    #[serde(deserialize_with = "lenient_f64")]
    pub latitude: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub longitude: f64,
    pub travel_time: f64,
    #[serde(default = "default_compare_modes")]
    pub travel_modes: Vec<String>,
    #[serde(default = "default_simplify_tolerance")]
    pub simplify_tolerance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchLocation {
    #[serde(deserialize_with = "lenient_f64")]
    pub latitude: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub longitude: f64,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsochroneBatchRequest {
    pub locations: Vec<BatchLocation>,
    #[serde(default = "default_travel_times")]
    pub travel_times: Vec<f64>,
    #[serde(default = "default_travel_mode")]
    pub travel_mode: String,
    #[serde(default = "default_simplify_tolerance")]
    pub simplify_tolerance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreloadRequest {
    pub locations: Vec<BatchLocation>,
    #[serde(default = "default_preload_modes")]
    pub travel_modes: Vec<String>,
    #[serde(default = "default_preload_radii")]
    pub radii_m: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsochroneBand {
    pub travel_time_minutes: f64,
    pub area_km2: f64,
    pub reachable_nodes: usize,
    /// Exterior ring as [[lng, lat], ...]; first point equals last.
    pub polygon_coordinates: Vec<Vec<[f64; 2]>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsochroneResult {
    pub center: Coordinate,
    pub travel_mode: String,
    pub isochrones: Vec<IsochroneBand>,
    pub processing_time_seconds: f64,
}

// ---------------------------------------------------------------------------
// Geocoding
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeocodeRequest {
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseGeocodeRequest {
    #[serde(deserialize_with = "lenient_f64")]
    pub latitude: f64,
    #[serde(deserialize_with = "lenient_f64")]
    pub longitude: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchGeocodeRequest {
    pub addresses: Vec<String>,
}

// ---------------------------------------------------------------------------
// Errors on the wire
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_modes: Option<Vec<String>>,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            supported_modes: None,
        }
    }
}

pub fn default_travel_times() -> Vec<f64> {
    vec![5.0, 10.0, 15.0]
}

pub fn default_travel_mode() -> String {
    "driving".to_string()
}

pub fn default_simplify_tolerance() -> f64 {
    20.0
}

pub fn default_compare_modes() -> Vec<String> {
    vec!["driving".into(), "walking".into(), "cycling".into()]
}

pub fn default_preload_modes() -> Vec<String> {
    vec!["driving".into()]
}

pub fn default_preload_radii() -> Vec<f64> {
    vec![2000.0, 5000.0]
}
