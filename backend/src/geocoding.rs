use std::{collections::HashMap, num::NonZeroUsize, sync::Mutex, time::Duration};

use lru::LruCache;
use serde::Serialize;
use serde_json::Value;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);
const RESULT_CACHE_SIZE: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum GeocodeError {
    #[error("geocoding upstream unavailable: {0}")]
    Upstream(String),
    #[error("location not found")]
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeocodeResult {
    pub latitude: f64,
    pub longitude: f64,
    pub display_name: String,
    pub raw: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReverseResult {
    pub address: String,
    pub raw: Value,
}

/// Thin client for a Nominatim-compatible service. Lookups are cached; no
/// interpretation happens beyond lifting the fields the analytics layer
/// reads.
pub struct GeocodingClient {
    http: reqwest::Client,
    base_url: String,
    forward_cache: Mutex<LruCache<String, GeocodeResult>>,
    reverse_cache: Mutex<LruCache<(i64, i64), ReverseResult>>,
}

impl GeocodingClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .user_agent("geospatial-backend")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url: base_url.into(),
            forward_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(RESULT_CACHE_SIZE).expect("nonzero"),
            )),
            reverse_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(RESULT_CACHE_SIZE).expect("nonzero"),
            )),
        }
    }

    pub async fn geocode(&self, address: &str) -> Result<GeocodeResult, GeocodeError> {
        if let Some(hit) = self
            .forward_cache
            .lock()
            .expect("cache lock")
            .get(address)
            .cloned()
        {
            return Ok(hit);
        }

        let url = format!("{}/search", self.base_url);
        let body: Value = self
            .http
            .get(&url)
            .query(&[
                ("q", address),
                ("format", "jsonv2"),
                ("limit", "1"),
                ("addressdetails", "1"),
            ])
            .send()
            .await
            .map_err(|err| GeocodeError::Upstream(err.to_string()))?
            .error_for_status()
            .map_err(|err| GeocodeError::Upstream(err.to_string()))?
            .json()
            .await
            .map_err(|err| GeocodeError::Upstream(err.to_string()))?;

        let result = parse_search_response(body)?;
        self.forward_cache
            .lock()
            .expect("cache lock")
            .put(address.to_string(), result.clone());
        Ok(result)
    }

    pub async fn reverse(&self, lat: f64, lon: f64) -> Result<ReverseResult, GeocodeError> {
        let key = ((lat * 1e6).round() as i64, (lon * 1e6).round() as i64);
        if let Some(hit) = self
            .reverse_cache
            .lock()
            .expect("cache lock")
            .get(&key)
            .cloned()
        {
            return Ok(hit);
        }

        let url = format!("{}/reverse", self.base_url);
        let body: Value = self
            .http
            .get(&url)
            .query(&[
                ("lat", lat.to_string().as_str()),
                ("lon", lon.to_string().as_str()),
                ("format", "jsonv2"),
            ])
            .send()
            .await
            .map_err(|err| GeocodeError::Upstream(err.to_string()))?
            .error_for_status()
            .map_err(|err| GeocodeError::Upstream(err.to_string()))?
            .json()
            .await
            .map_err(|err| GeocodeError::Upstream(err.to_string()))?;

        let result = parse_reverse_response(body)?;
        self.reverse_cache
            .lock()
            .expect("cache lock")
            .put(key, result.clone());
        Ok(result)
    }

    /// Sequential batch lookup; each address resolves or carries its error.
    pub async fn batch(&self, addresses: &[String]) -> HashMap<String, BatchOutcome> {
        let mut results = HashMap::with_capacity(addresses.len());
        for address in addresses {
            let outcome = match self.geocode(address).await {
                Ok(result) => BatchOutcome::Ok(result),
                Err(err) => BatchOutcome::Err {
                    error: err.to_string(),
                },
            };
            results.insert(address.clone(), outcome);
        }
        results
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum BatchOutcome {
    Ok(GeocodeResult),
    Err { error: String },
}

fn parse_search_response(body: Value) -> Result<GeocodeResult, GeocodeError> {
    let first = body
        .as_array()
        .and_then(|results| results.first())
        .ok_or(GeocodeError::NotFound)?;

    let latitude = lenient_field(first, "lat").ok_or(GeocodeError::NotFound)?;
    let longitude = lenient_field(first, "lon").ok_or(GeocodeError::NotFound)?;
    let display_name = first
        .get("display_name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(GeocodeResult {
        latitude,
        longitude,
        display_name,
        raw: first.clone(),
    })
}

fn parse_reverse_response(body: Value) -> Result<ReverseResult, GeocodeError> {
    if body.get("error").is_some() {
        return Err(GeocodeError::NotFound);
    }
    let address = body
        .get("display_name")
        .and_then(Value::as_str)
        .ok_or(GeocodeError::NotFound)?
        .to_string();
    Ok(ReverseResult {
        address,
        raw: body,
    })
}

/// Nominatim serializes coordinates as strings; accept numbers too.
fn lenient_field(value: &Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn search_response_lifts_first_result() {
        let body = json!([{
            "place_id": 12345,
            "lat": "41.9981",
            "lon": "21.4254",
            "display_name": "Skopje, North Macedonia",
            "type": "city",
            "class": "place"
        }]);
        let result = parse_search_response(body).unwrap();
        assert_eq!(result.latitude, 41.9981);
        assert_eq!(result.longitude, 21.4254);
        assert_eq!(result.display_name, "Skopje, North Macedonia");
        assert_eq!(result.raw["place_id"], 12345);
    }

    #[test]
    fn empty_search_response_is_not_found() {
        assert!(matches!(
            parse_search_response(json!([])),
            Err(GeocodeError::NotFound)
        ));
    }

    #[test]
    fn reverse_error_body_is_not_found() {
        let body = json!({"error": "Unable to geocode"});
        assert!(matches!(
            parse_reverse_response(body),
            Err(GeocodeError::NotFound)
        ));

        let ok = json!({"display_name": "Partizanska, Skopje", "address": {"road": "Partizanska"}});
        let result = parse_reverse_response(ok).unwrap();
        assert_eq!(result.address, "Partizanska, Skopje");
    }
}
