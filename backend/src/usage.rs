use std::{sync::Arc, time::Instant};

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use serde_json::Value;

use crate::{
    auth::{AuthContext, Identity},
    database::{AnalyticsRecord, UsageRecord, UsageSink},
};

/// Generous cap when buffering bodies for analytics; larger bodies pass
/// through untouched but unrecorded.
const BODY_CAP: usize = 16 * 1024 * 1024;

const ADDRESS_CAP: usize = 500;
const PLACE_ID_CAP: usize = 255;
const LOCATION_TYPE_CAP: usize = 100;
const ROUTE_TYPE_CAP: usize = 50;
const POLYLINE_CAP: usize = 2000;

/// API class bound to a route group at registration time; analytics
/// extraction dispatches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKind {
    Routing,
    Matrix,
    Geocoding,
    Isochrone,
}

impl ApiKind {
    pub fn id(&self) -> i32 {
        match self {
            ApiKind::Routing => 1,
            ApiKind::Matrix => 2,
            ApiKind::Geocoding => 3,
            ApiKind::Isochrone => 4,
        }
    }
}

pub struct UsageTracker {
    sink: Option<Arc<dyn UsageSink>>,
    auth: AuthContext,
}

/// Per-route-group middleware state.
#[derive(Clone)]
pub struct RouteUsage {
    pub tracker: Arc<UsageTracker>,
    pub api_kind: ApiKind,
}

impl UsageTracker {
    pub fn new(sink: Option<Arc<dyn UsageSink>>, auth: AuthContext) -> Self {
        Self { sink, auth }
    }

    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    pub fn bind(self: &Arc<Self>, api_kind: ApiKind) -> RouteUsage {
        RouteUsage {
            tracker: self.clone(),
            api_kind,
        }
    }

    /// Persists the usage row, and an analytics row for successful
    /// authenticated requests. Failures here are logged and never surface.
    #[allow(clippy::too_many_arguments)]
    async fn record(
        &self,
        api_kind: ApiKind,
        endpoint: &str,
        identity: Option<Identity>,
        status: u16,
        elapsed_s: f64,
        request_size: usize,
        response_size: usize,
        ip_address: Option<String>,
        user_agent: Option<String>,
        request_json: Option<Value>,
        response_json: Option<Value>,
    ) {
        let Some(sink) = &self.sink else {
            return;
        };
        let Some(identity) = identity else {
            tracing::debug!(endpoint, "skipping usage tracking, anonymous request");
            return;
        };

        let usage = UsageRecord {
            user_id: identity.user_id,
            api_id: api_kind.id(),
            api_key_id: identity.api_key_id,
            endpoint: endpoint.to_string(),
            status_code: status as i32,
            response_time: elapsed_s,
            request_size: request_size as i64,
            response_size: response_size as i64,
            ip_address,
            user_agent,
            timestamp: Utc::now(),
        };

        let usage_id = match sink.record_usage(&usage).await {
            Ok(id) => id,
            Err(err) => {
                tracing::error!(error = %err, endpoint, "failed to persist usage record");
                return;
            }
        };

        if status >= 400 {
            tracing::debug!(endpoint, status, "skipping analytics for failed request");
            return;
        }

        let mut analytics = extract_analytics(
            api_kind,
            request_json.as_ref(),
            response_json.as_ref(),
        );
        analytics.usage_id = usage_id;
        analytics.user_id = identity.user_id;
        analytics.api_id = api_kind.id();
        analytics.timestamp = Some(Utc::now());

        if let Err(err) = sink.record_analytics(&analytics).await {
            tracing::error!(error = %err, endpoint, "failed to persist analytics record");
        }
    }
}

/// Middleware wrapping every tracked route group. Buffers both bodies so the
/// analytics extractor can see the JSON payloads, then restores them.
pub async fn track_usage(State(layer): State<RouteUsage>, req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let endpoint = req.uri().path().to_string();
    let ip_address = client_ip(req.headers());
    let user_agent = header_string(req.headers(), axum::http::header::USER_AGENT);
    let identity = layer.tracker.auth.identity(req.headers());

    let (parts, body) = req.into_parts();
    let request_bytes = to_bytes(body, BODY_CAP).await.unwrap_or_default();
    let request_json: Option<Value> = serde_json::from_slice(&request_bytes).ok();
    let req = Request::from_parts(parts, Body::from(request_bytes.clone()));

    let response = next.run(req).await;
    let status = response.status().as_u16();
    tracing::debug!(%method, endpoint, status, "request tracked");

    let (res_parts, res_body) = response.into_parts();
    let response_bytes = to_bytes(res_body, BODY_CAP).await.unwrap_or_default();
    let response_json: Option<Value> = serde_json::from_slice(&response_bytes).ok();
    let response = Response::from_parts(res_parts, Body::from(response_bytes.clone()));

    layer
        .tracker
        .record(
            layer.api_kind,
            &endpoint,
            identity,
            status,
            started.elapsed().as_secs_f64(),
            request_bytes.len(),
            response_bytes.len(),
            ip_address,
            user_agent,
            request_json,
            response_json,
        )
        .await;

    response
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| header_string(headers, axum::http::HeaderName::from_static("x-real-ip")))
}

fn header_string(headers: &HeaderMap, name: impl axum::http::header::AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

// ---------------------------------------------------------------------------
// Analytics extraction
// ---------------------------------------------------------------------------

pub(crate) fn extract_analytics(
    api_kind: ApiKind,
    request: Option<&Value>,
    response: Option<&Value>,
) -> AnalyticsRecord {
    let mut record = AnalyticsRecord {
        raw_request: request.map(|r| r.to_string()),
        ..AnalyticsRecord::default()
    };

    match api_kind {
        ApiKind::Routing => extract_routing(&mut record, request, response),
        ApiKind::Matrix => extract_matrix(&mut record, request, response),
        ApiKind::Geocoding => extract_geocoding(&mut record, request, response),
        ApiKind::Isochrone => extract_isochrone(&mut record, request, response),
    }
    record
}

fn extract_geocoding(record: &mut AnalyticsRecord, request: Option<&Value>, response: Option<&Value>) {
    if let Some(request) = request {
        if let Some(address) = request.get("address").and_then(Value::as_str) {
            record.address = Some(cap(address, ADDRESS_CAP));
        }
        if let Some((lat, lon)) = coord_fields(request) {
            record.start_latitude = Some(lat);
            record.start_longitude = Some(lon);
        }
    }

    let Some(response) = response else { return };

    // For batch lookups, classify by the first successful result.
    if let Some(results) = response.get("results").and_then(Value::as_array) {
        if let Some(first) = results.iter().find(|r| r.get("error").is_none()) {
            extract_geocoding(record, None, Some(first));
            return;
        }
    }

    if let Some((lat, lon)) = coord_fields(response) {
        record.start_latitude = Some(lat);
        record.start_longitude = Some(lon);
    } else if let Some(coords) = response.get("coordinates") {
        if record.start_latitude.is_none() {
            if let Some((lat, lon)) = coord_fields(coords) {
                record.start_latitude = Some(lat);
                record.start_longitude = Some(lon);
            }
        }
    }

    for key in ["display_name", "formatted_address", "address"] {
        if let Some(text) = response.get(key).and_then(Value::as_str) {
            record.formatted_address = Some(cap(text, ADDRESS_CAP));
            break;
        }
    }

    if let Some(raw) = response.get("raw").filter(|r| r.is_object()) {
        for key in ["place_id", "osm_id"] {
            if let Some(value) = raw.get(key) {
                record.place_id = Some(cap(&scalar_string(value), PLACE_ID_CAP));
                break;
            }
        }
        for key in ["type", "class", "addresstype"] {
            if let Some(text) = raw.get(key).and_then(Value::as_str) {
                record.location_type = Some(cap(text, LOCATION_TYPE_CAP));
                break;
            }
        }
    }
}

fn extract_matrix(record: &mut AnalyticsRecord, request: Option<&Value>, response: Option<&Value>) {
    if let Some(request) = request {
        if let Some((lat, lon)) = request.get("current_location").and_then(coord_fields) {
            record.start_latitude = Some(lat);
            record.start_longitude = Some(lon);
        }
        if let Some(locations) = request.get("locations").and_then(Value::as_array) {
            record.waypoints_count = Some(locations.len() as i32);
        }
        if let Some(pdp) = request.get("pdp").and_then(Value::as_bool) {
            record.route_type = Some(if pdp { "pickup_delivery" } else { "standard" }.to_string());
        }
    }

    let Some(response) = response else { return };

    if let Some(km) = response.get("minimum_distance_km").and_then(numeric) {
        record.distance_meters = Some((km * 1000.0) as i64);
    }
    if let Some(seconds) = response.get("estimated_travel_time_seconds").and_then(numeric) {
        record.duration_seconds = Some(seconds as i64);
    }
    if let Some(coords) = response.get("optimal_route_coordinates").and_then(Value::as_array) {
        if let Some(last) = coords.last().and_then(Value::as_array) {
            if last.len() >= 2 {
                record.end_latitude = last[0].as_f64();
                record.end_longitude = last[1].as_f64();
            }
        }
        if !coords.is_empty() {
            record.polyline = Some(cap(
                &serde_json::to_string(coords).unwrap_or_default(),
                POLYLINE_CAP,
            ));
        }
    }

    if record.distance_meters.is_none() {
        let nested = response
            .get("route")
            .or_else(|| response.get("solution"))
            .unwrap_or(response);
        for key in ["total_distance", "distance", "total_distance_meters"] {
            if let Some(meters) = nested.get(key).and_then(numeric) {
                record.distance_meters = Some(meters as i64);
                break;
            }
        }
        if record.duration_seconds.is_none() {
            for key in ["total_duration", "duration", "total_time"] {
                if let Some(seconds) = nested.get(key).and_then(numeric) {
                    record.duration_seconds = Some(seconds as i64);
                    break;
                }
            }
        }
    }
}

fn extract_routing(record: &mut AnalyticsRecord, request: Option<&Value>, response: Option<&Value>) {
    if let Some(request) = request {
        if let Some(waypoints) = request.get("waypoints").and_then(Value::as_array) {
            record.waypoints_count = Some(waypoints.len() as i32);
            if let Some((lat, lon)) = waypoints.first().and_then(coord_fields) {
                record.start_latitude = Some(lat);
                record.start_longitude = Some(lon);
            }
            if waypoints.len() > 1 {
                if let Some((lat, lon)) = waypoints.last().and_then(coord_fields) {
                    record.end_latitude = Some(lat);
                    record.end_longitude = Some(lon);
                }
            }
        }
        for key in ["transport_mode", "mode", "profile"] {
            if let Some(mode) = request.get(key).and_then(Value::as_str) {
                record.route_type = Some(cap(mode, ROUTE_TYPE_CAP));
                break;
            }
        }
    }

    let Some(response) = response else { return };

    if let Some(route) = response
        .get("routes")
        .and_then(Value::as_array)
        .and_then(|routes| routes.first())
        .or_else(|| response.get("route"))
    {
        // Upstream-shaped payload: distances already in meters.
        for key in ["distance", "total_distance"] {
            if let Some(meters) = route.get(key).and_then(numeric) {
                record.distance_meters = Some(meters as i64);
                break;
            }
        }
        for key in ["duration", "total_duration"] {
            if let Some(seconds) = route.get(key).and_then(numeric) {
                record.duration_seconds = Some(seconds as i64);
                break;
            }
        }
        for key in ["polyline", "geometry"] {
            if let Some(value) = route.get(key) {
                record.polyline = Some(cap(&scalar_string(value), POLYLINE_CAP));
                break;
            }
        }
    } else {
        // Flat route result: distance is in kilometers.
        if let Some(km) = response.get("distance").and_then(numeric) {
            record.distance_meters = Some((km * 1000.0) as i64);
        }
        if let Some(seconds) = response.get("duration").and_then(numeric) {
            record.duration_seconds = Some(seconds as i64);
        }
        if let Some(encoded) = response.get("polyline").and_then(Value::as_str) {
            record.polyline = Some(cap(encoded, POLYLINE_CAP));
        }
    }
}

fn extract_isochrone(record: &mut AnalyticsRecord, request: Option<&Value>, response: Option<&Value>) {
    if let Some(request) = request {
        if let Some((lat, lon)) = coord_fields(request)
            .or_else(|| request.get("center").and_then(coord_fields))
        {
            record.start_latitude = Some(lat);
            record.start_longitude = Some(lon);
        }
        if let Some(times) = request.get("travel_times").and_then(Value::as_array) {
            record.waypoints_count = Some(times.len() as i32);
            let max = times.iter().filter_map(numeric).fold(f64::MIN, f64::max);
            if max > f64::MIN {
                record.duration_seconds = Some((max * 60.0) as i64);
            }
        } else if let Some(single) = request.get("travel_time").and_then(numeric) {
            record.waypoints_count = Some(1);
            record.duration_seconds = Some((single * 60.0) as i64);
        }
        for key in ["travel_mode", "mode", "profile"] {
            if let Some(mode) = request.get(key).and_then(Value::as_str) {
                record.route_type = Some(cap(mode, ROUTE_TYPE_CAP));
                break;
            }
        }
    }

    let Some(response) = response else { return };

    if let Some(features) = response.get("features").and_then(Value::as_array) {
        if record.waypoints_count.is_none() {
            record.waypoints_count = Some(features.len() as i32);
        }
        if let Some(geometry) = features.first().and_then(|f| f.get("geometry")) {
            record.polyline = Some(cap(
                &serde_json::to_string(geometry).unwrap_or_default(),
                POLYLINE_CAP,
            ));
        }
    } else if let Some(bands) = response.get("isochrones").and_then(Value::as_array) {
        if record.waypoints_count.is_none() {
            record.waypoints_count = Some(bands.len() as i32);
        }
        if let Some(ring) = bands.first().and_then(|b| b.get("polygon_coordinates")) {
            record.polyline = Some(cap(
                &serde_json::to_string(ring).unwrap_or_default(),
                POLYLINE_CAP,
            ));
        }
    } else if let Some(polygon) = response.get("polygon") {
        record.polyline = Some(cap(&scalar_string(polygon), POLYLINE_CAP));
    }
}

fn cap(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// (lat, lon) from `{lat,lng}` / `{latitude,longitude}` objects.
fn coord_fields(value: &Value) -> Option<(f64, f64)> {
    let lat = value
        .get("latitude")
        .or_else(|| value.get("lat"))
        .and_then(numeric)?;
    let lon = value
        .get("longitude")
        .or_else(|| value.get("lng"))
        .or_else(|| value.get("lon"))
        .and_then(numeric)?;
    Some((lat, lon))
}
