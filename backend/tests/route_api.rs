use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::Query,
    http::Request,
    routing::get,
    Json, Router,
};
use hyper::StatusCode;
use backend::{
    auth::AuthContext,
    cache::GraphCache,
    config::AppConfig,
    create_router,
    database::{MemorySink, UsageSink},
    directions::{decode_polyline, DirectionsService, OsrmClient},
    geocoding::GeocodingClient,
    isochrone::IsochroneService,
    store::GraphStore,
    test_support::SyntheticFetcher,
    usage::UsageTracker,
    AppState,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

const JWT_SECRET: &str = "test-secret";

struct TestApp {
    router: Router,
    sink: Arc<MemorySink>,
    _dir: TempDir,
}

/// Stub Nominatim upstream: addresses containing "nowhere" resolve to an
/// empty result set, everything else to a fixed street.
async fn spawn_nominatim_stub() -> String {
    async fn search(
        Query(params): Query<std::collections::HashMap<String, String>>,
    ) -> Json<Value> {
        let q = params.get("q").cloned().unwrap_or_default();
        if q.contains("nowhere") {
            return Json(json!([]));
        }
        Json(json!([{
            "place_id": 321,
            "lat": "1.0",
            "lon": "2.0",
            "display_name": format!("{q} Street"),
            "type": "road",
            "class": "highway"
        }]))
    }

    let app = Router::new().route("/search", get(search));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("stub listener");
    let addr = listener.local_addr().expect("stub addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn test_app_with_capacity(max_memory_graphs: usize) -> TestApp {
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(GraphStore::open(dir.path()).expect("store"));
    let fetcher = Arc::new(SyntheticFetcher::default());
    let cache = GraphCache::spawn(store, fetcher, max_memory_graphs, 32);

    let sink = Arc::new(MemorySink::default());
    let sink_dyn: Arc<dyn UsageSink> = sink.clone();
    let tracker = Arc::new(UsageTracker::new(
        Some(sink_dyn),
        AuthContext::new(JWT_SECRET),
    ));

    let nominatim_url = spawn_nominatim_stub().await;
    let state = AppState {
        isochrones: Arc::new(IsochroneService::new(cache.clone())),
        // Nothing listens on port 9; upstream routing always falls back.
        directions: Arc::new(DirectionsService::new(
            OsrmClient::new("http://127.0.0.1:9"),
            cache.clone(),
        )),
        geocoder: Arc::new(GeocodingClient::new(nominatim_url)),
        tracker,
        config: Arc::new(AppConfig::default()),
        cache,
    };

    TestApp {
        router: create_router(state),
        sink,
        _dir: dir,
    }
}

async fn test_app() -> TestApp {
    test_app_with_capacity(5).await
}

fn bearer_token() -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};
    let exp = chrono::Utc::now().timestamp() + 3600;
    let claims = json!({"sub": "42", "api_key_id": 7, "exp": exp});
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .expect("token")
}

fn post(uri: &str, payload: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .expect("request")
}

fn post_authed(uri: &str, payload: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", bearer_token()))
        .body(Body::from(payload.to_string()))
        .expect("request")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), 64 * 1024 * 1024)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn health_reports_ok() {
    let app = test_app().await;
    let response = app
        .router
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn tsp_three_point_route_starts_at_current() {
    let app = test_app().await;
    let payload = json!({
        "current_location": {"latitude": 41.12, "longitude": 20.80},
        "locations": [
            {"latitude": 41.99, "longitude": 21.43, "type": "waypoint", "location_id": "w1"},
            {"latitude": 41.99, "longitude": 21.46, "type": "waypoint", "location_id": "w2"}
        ],
        "pdp": false
    });

    let response = app
        .router
        .oneshot(post("/api/matrix/calculate", payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;

    assert_eq!(body["optimal_route"][0], "current");
    assert_eq!(body["optimal_route"].as_array().unwrap().len(), 3);

    let distance_km = body["minimum_distance_km"].as_f64().unwrap();
    assert!(
        (70.0..=120.0).contains(&distance_km),
        "distance {distance_km} km out of expected range"
    );

    let time_string = body["estimated_travel_time"].as_str().unwrap();
    assert!(
        time_string.contains('h'),
        "expected >= 1h, got {time_string}"
    );
    let seconds = body["estimated_travel_time_seconds"].as_u64().unwrap();
    assert!(seconds >= 3600);
}

#[tokio::test]
async fn pdp_route_lists_pickup_before_delivery() {
    let app = test_app().await;
    let payload = json!({
        "current_location": {"latitude": 41.12, "longitude": 20.80},
        "locations": [
            {"latitude": 41.99, "longitude": 21.43, "type": "pickup",
             "location_id": "p1", "package_id": "pkg1"},
            {"latitude": 41.99, "longitude": 21.46, "type": "delivery",
             "location_id": "d1", "package_id": "pkg1"}
        ],
        "pdp": true
    });

    let response = app
        .router
        .oneshot(post("/api/matrix/calculate", payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;

    let route: Vec<&str> = body["optimal_route"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    let pickup = route.iter().position(|l| *l == "p1").unwrap();
    let delivery = route.iter().position(|l| *l == "d1").unwrap();
    assert!(pickup < delivery, "route was {route:?}");
}

#[tokio::test]
async fn pdp_full_flow_returns_matrix_and_directions() {
    let app = test_app().await;
    let payload = json!({
        "current_location": {"latitude": 41.12, "longitude": 20.80},
        "locations": [
            {"latitude": 41.15, "longitude": 20.83, "type": "pickup",
             "location_id": "p1", "package_id": "pkg1"},
            {"latitude": 41.17, "longitude": 20.85, "type": "delivery",
             "location_id": "d1", "package_id": "pkg1"}
        ],
        "transport_mode": "driving"
    });

    let response = app
        .router
        .oneshot(post("/api/directions/route_pdp", payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "success");
    assert!(body["solution"]["optimal_route"].is_array());
    assert_eq!(body["directions"]["source"], "graph_fallback");
}

#[tokio::test]
async fn transport_mode_aliases_normalize_and_unknown_is_rejected() {
    let app = test_app().await;

    let ok_payload = json!({
        "waypoints": [
            {"lat": 41.12, "lng": 20.80},
            {"lat": 41.15, "lng": 20.83}
        ],
        "transport_mode": "car",
        "use_graph_fallback": true
    });
    let response = app
        .router
        .clone()
        .oneshot(post("/api/directions/route", ok_payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["transport_mode"], "driving");

    let bad_payload = json!({
        "waypoints": [
            {"lat": 41.12, "lng": 20.80},
            {"lat": 41.15, "lng": 20.83}
        ],
        "transport_mode": "ufo"
    });
    let response = app
        .router
        .oneshot(post("/api/directions/route", bad_payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    let modes: Vec<&str> = body["supported_modes"]
        .as_array()
        .expect("supported_modes enumerated")
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(modes, vec!["driving", "walking", "cycling"]);
}

#[tokio::test]
async fn string_coordinates_are_coerced() {
    let app = test_app().await;
    let payload = json!({
        "waypoints": [
            {"lat": "41.12", "lng": "20.80"},
            {"lat": "41.15", "lng": "20.83"}
        ],
        "use_graph_fallback": true
    });
    let response = app
        .router
        .oneshot(post("/api/directions/route", payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn route_polyline_decodes_to_reported_sequence() {
    let app = test_app().await;
    let payload = json!({
        "waypoints": [
            {"lat": 41.12, "lng": 20.80},
            {"lat": 41.16, "lng": 20.84}
        ],
        "use_graph_fallback": true
    });
    let response = app
        .router
        .oneshot(post("/api/directions/route", payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;

    let encoded = body["polyline"].as_str().unwrap();
    let reported: Vec<(f64, f64)> = body["decoded_polyline"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| {
            let pair = p.as_array().unwrap();
            (pair[0].as_f64().unwrap(), pair[1].as_f64().unwrap())
        })
        .collect();
    let decoded = decode_polyline(encoded);
    assert_eq!(decoded.len(), reported.len());
    for (a, b) in decoded.iter().zip(reported.iter()) {
        assert!((a.0 - b.0).abs() < 1e-5);
        assert!((a.1 - b.1).abs() < 1e-5);
    }
}

#[tokio::test]
async fn optimize_route_reorders_waypoints() {
    let app = test_app().await;
    // Listed out of order: the middle waypoint is the farthest.
    let payload = json!({
        "waypoints": [
            {"lat": 41.00, "lng": 21.00},
            {"lat": 41.08, "lng": 21.08},
            {"lat": 41.02, "lng": 21.02}
        ],
        "optimize_route": true,
        "use_graph_fallback": true
    });

    let response = app
        .router
        .oneshot(post("/api/directions/route", payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["metadata"]["optimized"], true);

    // Visit order should be nearest-first from the start.
    let waypoints = body["waypoints"].as_array().unwrap();
    let second_lat = waypoints[1]["lat"].as_f64().unwrap();
    assert!(
        (second_lat - 41.02).abs() < 0.02,
        "expected the near waypoint second, got {second_lat}"
    );
}

#[tokio::test]
async fn isochrone_areas_grow_with_cutoff_and_rings_close() {
    let app = test_app().await;
    let payload = json!({
        "latitude": 40.7128,
        "longitude": -74.0060,
        "travel_times": [5, 10, 15],
        "travel_mode": "drive"
    });

    let response = app
        .router
        .oneshot(post("/api/isochrone/calculate", payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;

    let bands = body["isochrones"].as_array().unwrap();
    assert_eq!(bands.len(), 3);

    let mut last_area = 0.0;
    let mut last_nodes = 0;
    for band in bands {
        let area = band["area_km2"].as_f64().unwrap();
        let nodes = band["reachable_nodes"].as_u64().unwrap() as usize;
        assert!(area >= last_area, "areas must be non-decreasing");
        assert!(nodes >= last_nodes, "node counts must be non-decreasing");
        last_area = area;
        last_nodes = nodes;

        let ring = band["polygon_coordinates"][0].as_array().unwrap();
        assert!(ring.len() >= 4);
        assert_eq!(ring.first(), ring.last(), "ring must close");
    }
}

#[tokio::test]
async fn isochrone_geojson_parses_with_closed_rings() {
    let app = test_app().await;
    let payload = json!({
        "latitude": 40.7128,
        "longitude": -74.0060,
        "travel_times": [5, 10],
        "travel_mode": "driving"
    });

    let response = app
        .router
        .oneshot(post("/api/isochrone/geojson", payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), 64 * 1024 * 1024).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    let parsed: geojson::GeoJson = text.parse().expect("valid GeoJSON");

    let geojson::GeoJson::FeatureCollection(fc) = parsed else {
        panic!("expected a FeatureCollection");
    };
    assert_eq!(fc.features.len(), 2);
    for feature in &fc.features {
        let Some(geometry) = &feature.geometry else {
            panic!("feature without geometry")
        };
        let geojson::Value::Polygon(rings) = &geometry.value else {
            panic!("expected polygon geometry")
        };
        for ring in rings {
            assert_eq!(ring.first(), ring.last(), "exterior ring must close");
        }
        let props = feature.properties.as_ref().unwrap();
        assert!(props.contains_key("travel_time_minutes"));
        assert!(props.contains_key("area_km2"));
        assert!(props.contains_key("reachable_nodes"));
    }
}

#[tokio::test]
async fn isochrone_rejects_out_of_range_inputs() {
    let app = test_app().await;

    let too_many: Vec<f64> = (1..=11).map(|t| t as f64).collect();
    let response = app
        .router
        .clone()
        .oneshot(post(
            "/api/isochrone/calculate",
            json!({"latitude": 40.7, "longitude": -74.0, "travel_times": too_many}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .router
        .clone()
        .oneshot(post(
            "/api/isochrone/calculate",
            json!({"latitude": 40.7, "longitude": -74.0, "travel_times": [130.0]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .router
        .oneshot(post(
            "/api/isochrone/calculate",
            json!({"latitude": 95.0, "longitude": -74.0}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn memory_cache_keeps_two_most_recent_graphs() {
    let app = test_app_with_capacity(2).await;

    for (lat, lon) in [(40.0, -74.0), (41.0, -75.0), (42.0, -76.0)] {
        let response = app
            .router
            .clone()
            .oneshot(post(
                "/api/isochrone/calculate",
                json!({"latitude": lat, "longitude": lon, "travel_times": [5]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .router
        .oneshot(
            Request::builder()
                .uri("/api/isochrone/cache/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;

    assert_eq!(body["memory_graphs"], 2);
    assert_eq!(body["max_memory_graphs"], 2);
    let keys: Vec<&str> = body["cached_keys"]
        .as_array()
        .unwrap()
        .iter()
        .map(|k| k.as_str().unwrap())
        .collect();
    assert!(keys.iter().any(|k| k.starts_with("41.000_-75.000")));
    assert!(keys.iter().any(|k| k.starts_with("42.000_-76.000")));

    let disk: Vec<&str> = body["disk_files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|k| k.as_str().unwrap())
        .collect();
    for prefix in ["40.000_-74.000", "41.000_-75.000", "42.000_-76.000"] {
        assert!(
            disk.iter().any(|k| k.starts_with(prefix)),
            "{prefix} missing from disk: {disk:?}"
        );
    }
}

#[tokio::test]
async fn cache_clear_requires_identity() {
    let app = test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(post("/api/isochrone/cache/clear", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .router
        .oneshot(post_authed("/api/isochrone/cache/clear", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["cleared"].as_array().unwrap().len() >= 1);
}

#[tokio::test]
async fn geocode_success_persists_typed_analytics() {
    let app = test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(post_authed("/api/geocoding/geocode", json!({"address": "X"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["latitude"], 1.0);
    assert_eq!(body["longitude"], 2.0);
    assert_eq!(body["display_name"], "X Street");

    let usage = app.sink.usage_records();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].user_id, 42);
    assert_eq!(usage[0].api_id, 3);
    assert_eq!(usage[0].status_code, 200);
    assert_eq!(usage[0].endpoint, "/api/geocoding/geocode");

    let analytics = app.sink.analytics_records();
    assert_eq!(analytics.len(), 1);
    assert_eq!(analytics[0].address.as_deref(), Some("X"));
    assert_eq!(analytics[0].formatted_address.as_deref(), Some("X Street"));
    assert_eq!(analytics[0].start_latitude, Some(1.0));
    assert_eq!(analytics[0].start_longitude, Some(2.0));
    assert_eq!(analytics[0].place_id.as_deref(), Some("321"));
    assert_eq!(analytics[0].location_type.as_deref(), Some("road"));
}

#[tokio::test]
async fn failed_geocode_persists_usage_but_no_analytics() {
    let app = test_app().await;

    let response = app
        .router
        .oneshot(post_authed(
            "/api/geocoding/geocode",
            json!({"address": "nowhere at all"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let usage = app.sink.usage_records();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].status_code, 404);
    assert!(app.sink.analytics_records().is_empty());
}

#[tokio::test]
async fn anonymous_requests_are_not_tracked() {
    let app = test_app().await;

    let response = app
        .router
        .oneshot(post("/api/geocoding/geocode", json!({"address": "X"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(app.sink.usage_records().is_empty());
    assert!(app.sink.analytics_records().is_empty());
}

#[tokio::test]
async fn modes_endpoint_lists_aliases() {
    let app = test_app().await;
    let response = app
        .router
        .oneshot(
            Request::builder()
                .uri("/api/directions/modes")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["default"], "driving");
    assert!(body["aliases"]["driving"]
        .as_array()
        .unwrap()
        .iter()
        .any(|a| a == "car"));
}

#[tokio::test]
async fn orphan_delivery_in_matrix_request_is_rejected() {
    let app = test_app().await;
    let payload = json!({
        "current_location": {"latitude": 41.12, "longitude": 20.80},
        "locations": [
            {"latitude": 41.15, "longitude": 20.83, "type": "delivery",
             "location_id": "d1", "package_id": "ghost"}
        ],
        "pdp": true
    });
    let response = app
        .router
        .oneshot(post("/api/matrix/calculate", payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
