use std::{env, net::SocketAddr, path::PathBuf};

const DEFAULT_OVERPASS_URL: &str = "https://overpass-api.de/api/interpreter";
const DEFAULT_OSRM_URL: &str = "http://localhost:5000";
const DEFAULT_NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org";
const DEFAULT_CACHE_DIR: &str = "data/cache";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

pub const DEFAULT_MAX_MEMORY_GRAPHS: usize = 5;
pub const DEFAULT_PREFETCH_QUEUE_CAPACITY: usize = 16;
pub const DEFAULT_MAX_GRAPH_NODES: usize = 250_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Service configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub overpass_url: String,
    pub osrm_url: String,
    pub nominatim_url: String,
    pub cache_root: PathBuf,
    pub max_memory_graphs: usize,
    pub prefetch_queue_capacity: usize,
    pub max_graph_nodes: usize,
    pub jwt_secret: String,
    pub database_url: Option<String>,
    pub bind_addr: SocketAddr,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            overpass_url: env_or("OVERPASS_URL", DEFAULT_OVERPASS_URL),
            osrm_url: env_or("OSRM_URL", DEFAULT_OSRM_URL),
            nominatim_url: env_or("NOMINATIM_URL", DEFAULT_NOMINATIM_URL),
            cache_root: PathBuf::from(env_or("CACHE_DIR", DEFAULT_CACHE_DIR)),
            max_memory_graphs: parse_env("MAX_MEMORY_GRAPHS", DEFAULT_MAX_MEMORY_GRAPHS)?,
            prefetch_queue_capacity: parse_env(
                "PREFETCH_QUEUE_CAPACITY",
                DEFAULT_PREFETCH_QUEUE_CAPACITY,
            )?,
            max_graph_nodes: parse_env("MAX_GRAPH_NODES", DEFAULT_MAX_GRAPH_NODES)?,
            jwt_secret: env_or("JWT_SECRET", ""),
            database_url: env::var("DATABASE_URL").ok(),
            bind_addr: parse_env("BIND_ADDR", DEFAULT_BIND_ADDR.parse().expect("valid default"))?,
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            overpass_url: DEFAULT_OVERPASS_URL.to_string(),
            osrm_url: DEFAULT_OSRM_URL.to_string(),
            nominatim_url: DEFAULT_NOMINATIM_URL.to_string(),
            cache_root: PathBuf::from(DEFAULT_CACHE_DIR),
            max_memory_graphs: DEFAULT_MAX_MEMORY_GRAPHS,
            prefetch_queue_capacity: DEFAULT_PREFETCH_QUEUE_CAPACITY,
            max_graph_nodes: DEFAULT_MAX_GRAPH_NODES,
            jwt_secret: String::new(),
            database_url: None,
            bind_addr: DEFAULT_BIND_ADDR.parse().expect("valid default"),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}
