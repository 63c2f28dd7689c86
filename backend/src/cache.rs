use std::{
    collections::HashSet,
    num::NonZeroUsize,
    pin::pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use lru::LruCache;
use shared::{Coordinate, Profile};
use tokio::sync::{mpsc, watch, Mutex, Notify};

use crate::{
    graph::{BoundingBox, GraphFile, RegionKey, RoadGraph},
    loader::{FetchError, GraphFetcher},
    store::{GraphStore, StoreError},
};

/// A request whose exact key is being fetched may be answered with the
/// geographically nearest cached graph of the same profile, if one lies
/// within this distance.
const PROVISIONAL_MAX_KM: f64 = 50.0;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("graph construction failed: {0}")]
    Graph(#[from] crate::graph::GraphError),
}

struct CacheInner {
    lru: LruCache<RegionKey, Arc<RoadGraph>>,
    in_progress: HashSet<RegionKey>,
}

/// Multi-tier graph cache: memory LRU over the disk store, with a single
/// background worker prefetching neighbouring regions. All shared state
/// lives behind one lock; the in-progress set lets the lock be released
/// during disk and network I/O without double-fetching a key.
pub struct GraphCache {
    inner: Mutex<CacheInner>,
    fetch_done: Notify,
    store: Arc<GraphStore>,
    fetcher: Arc<dyn GraphFetcher>,
    prefetch_tx: mpsc::Sender<RegionKey>,
    queue_depth: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
    capacity: usize,
}

#[derive(Debug, serde::Serialize)]
pub struct CacheStatus {
    pub memory_graphs: usize,
    pub max_memory_graphs: usize,
    pub cached_keys: Vec<String>,
    pub in_progress: usize,
    pub prefetch_queue_depth: usize,
    pub disk_files: Vec<String>,
}

impl GraphCache {
    /// Builds the cache and spawns its prefetch worker.
    pub fn spawn(
        store: Arc<GraphStore>,
        fetcher: Arc<dyn GraphFetcher>,
        max_memory_graphs: usize,
        prefetch_capacity: usize,
    ) -> Arc<Self> {
        let capacity = max_memory_graphs.max(1);
        let (prefetch_tx, prefetch_rx) = mpsc::channel(prefetch_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let cache = Arc::new(Self {
            inner: Mutex::new(CacheInner {
                lru: LruCache::new(NonZeroUsize::new(capacity).expect("nonzero capacity")),
                in_progress: HashSet::new(),
            }),
            fetch_done: Notify::new(),
            store,
            fetcher,
            prefetch_tx,
            queue_depth: AtomicUsize::new(0),
            shutdown_tx,
            capacity,
        });

        tokio::spawn(prefetch_worker(cache.clone(), prefetch_rx, shutdown_rx));
        cache
    }

    /// Returns a profile-annotated graph for the region, resolving memory,
    /// then disk, then a synchronous upstream fetch. A fetch also enqueues
    /// the 8 neighbouring regions for background download.
    pub async fn get(
        self: &Arc<Self>,
        lat: f64,
        lon: f64,
        radius_m: f64,
        profile: Profile,
    ) -> Result<Arc<RoadGraph>, CacheError> {
        let key = RegionKey::new(lat, lon, radius_m, profile);

        loop {
            let mut notified = pin!(self.fetch_done.notified());
            {
                let mut inner = self.inner.lock().await;
                if let Some(graph) = inner.lru.get(&key) {
                    tracing::debug!(key = %key.file_stem(), "memory cache hit");
                    return Ok(graph.clone());
                }
                if !inner.in_progress.contains(&key) {
                    inner.in_progress.insert(key);
                    break;
                }
                // Same key already being fetched: hand out the nearest
                // cached graph as a provisional answer, else wait.
                if let Some(graph) = nearest_cached(&mut inner, &key) {
                    tracing::debug!(key = %key.file_stem(), "provisional nearby graph served");
                    return Ok(graph);
                }
                notified.as_mut().enable();
            }
            notified.await;
        }

        let guard = InFlightGuard::new(self.clone(), key);
        let result = self.load_or_fetch(&key).await;
        let fetched = matches!(result, Ok((_, true)));

        {
            let mut inner = self.inner.lock().await;
            inner.in_progress.remove(&key);
            if let Ok((graph, _)) = &result {
                inner.lru.put(key, graph.clone());
            }
        }
        guard.disarm();
        self.fetch_done.notify_waiters();

        if fetched {
            self.enqueue_neighbours(&key).await;
        }
        result.map(|(graph, _)| graph)
    }

    /// Disk-then-fetch resolution for a graph over an explicit rectangle.
    /// BBox graphs bypass the memory LRU; they are corridor-shaped and
    /// rarely shared between requests.
    pub async fn bbox_graph(
        &self,
        bbox: BoundingBox,
        profile: Profile,
    ) -> Result<Arc<RoadGraph>, CacheError> {
        let stem = bbox.key(profile).file_stem();
        if let Some(file) = self.try_disk(&stem).await {
            return Ok(Arc::new(RoadGraph::from_file(file)?));
        }
        let file = self.fetcher.fetch_bbox(&bbox, profile).await?;
        self.save_to_store(&stem, &file).await;
        Ok(Arc::new(RoadGraph::from_file(file)?))
    }

    /// Resolves disk then network. The bool is true when the upstream
    /// provider was hit. Never called with the cache lock held.
    async fn load_or_fetch(&self, key: &RegionKey) -> Result<(Arc<RoadGraph>, bool), CacheError> {
        let stem = key.file_stem();
        if let Some(file) = self.try_disk(&stem).await {
            tracing::debug!(key = %stem, "disk cache hit");
            return Ok((Arc::new(RoadGraph::from_file(file)?), false));
        }

        let file = self.fetcher.fetch_region(key).await?;
        self.save_to_store(&stem, &file).await;
        Ok((Arc::new(RoadGraph::from_file(file)?), true))
    }

    async fn try_disk(&self, stem: &str) -> Option<GraphFile> {
        let store = self.store.clone();
        let stem = stem.to_string();
        let result = tokio::task::spawn_blocking(move || store.load(&stem)).await;
        match result {
            Ok(Ok(file)) => Some(file),
            Ok(Err(StoreError::NotFound(_))) => None,
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "graph store read failed");
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "graph store task failed");
                None
            }
        }
    }

    /// Store failures degrade to cache misses on the next restart; they do
    /// not fail the request.
    async fn save_to_store(&self, stem: &str, file: &GraphFile) {
        let store = self.store.clone();
        let stem = stem.to_string();
        let file = file.clone();
        let result = tokio::task::spawn_blocking(move || store.save(&stem, &file)).await;
        if let Ok(Err(err)) = result {
            tracing::warn!(error = %err, "failed to persist graph");
        }
    }

    async fn enqueue_neighbours(&self, key: &RegionKey) {
        let inner = self.inner.lock().await;
        let candidates: Vec<RegionKey> = key
            .neighbours()
            .into_iter()
            .filter(|n| !inner.lru.contains(n) && !inner.in_progress.contains(n))
            .collect();
        drop(inner);

        for neighbour in candidates {
            // Queue-full is silently tolerated.
            if self.prefetch_tx.try_send(neighbour).is_ok() {
                self.queue_depth.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Ensures a region exists in the disk store. Prefetched graphs do not
    /// displace interactively requested graphs from memory.
    async fn prefetch(self: &Arc<Self>, key: RegionKey) -> Result<(), CacheError> {
        {
            let mut inner = self.inner.lock().await;
            if inner.lru.contains(&key) || inner.in_progress.contains(&key) {
                return Ok(());
            }
            inner.in_progress.insert(key);
        }
        let guard = InFlightGuard::new(self.clone(), key);

        let stem = key.file_stem();
        let store = self.store.clone();
        let stem_for_probe = stem.clone();
        let on_disk = tokio::task::spawn_blocking(move || store.has(&stem_for_probe))
            .await
            .unwrap_or(false);

        let result = if on_disk {
            Ok(())
        } else {
            match self.fetcher.fetch_region(&key).await {
                Ok(file) => {
                    self.save_to_store(&stem, &file).await;
                    Ok(())
                }
                Err(err) => Err(CacheError::Fetch(err)),
            }
        };

        self.inner.lock().await.in_progress.remove(&key);
        guard.disarm();
        self.fetch_done.notify_waiters();
        result
    }

    pub async fn status(&self) -> CacheStatus {
        let (memory_graphs, cached_keys, in_progress) = {
            let inner = self.inner.lock().await;
            (
                inner.lru.len(),
                inner.lru.iter().map(|(k, _)| k.file_stem()).collect(),
                inner.in_progress.len(),
            )
        };
        let store = self.store.clone();
        let disk_files = tokio::task::spawn_blocking(move || store.list())
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();

        CacheStatus {
            memory_graphs,
            max_memory_graphs: self.capacity,
            cached_keys,
            in_progress,
            prefetch_queue_depth: self.queue_depth.load(Ordering::Relaxed),
            disk_files,
        }
    }

    /// Current number of in-memory graphs and the configured bound.
    pub async fn memory_usage(&self) -> (usize, usize) {
        (self.inner.lock().await.lru.len(), self.capacity)
    }

    /// Drops every in-memory graph; disk copies stay canonical.
    pub async fn clear_memory(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let cleared = inner.lru.len();
        inner.lru.clear();
        cleared
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    /// Signals the prefetch worker to stop after the current item.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Nearest cached graph with the requested profile within
/// [`PROVISIONAL_MAX_KM`]; refreshes the entry's recency when found.
fn nearest_cached(inner: &mut CacheInner, key: &RegionKey) -> Option<Arc<RoadGraph>> {
    let center: Coordinate = key.center();
    let best_key = inner
        .lru
        .iter()
        .filter(|(candidate, _)| candidate.profile() == key.profile())
        .map(|(candidate, _)| (*candidate, center.haversine_km(candidate.center())))
        .filter(|(_, km)| *km <= PROVISIONAL_MAX_KM)
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(candidate, _)| candidate)?;
    inner.lru.get(&best_key).cloned()
}

/// Clears a leaked in-progress marker if the owning request is cancelled
/// mid-fetch, so later requests for the key are not stuck waiting.
struct InFlightGuard {
    cache: Option<Arc<GraphCache>>,
    key: RegionKey,
}

impl InFlightGuard {
    fn new(cache: Arc<GraphCache>, key: RegionKey) -> Self {
        Self {
            cache: Some(cache),
            key,
        }
    }

    fn disarm(mut self) {
        self.cache = None;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(cache) = self.cache.take() {
            let key = self.key;
            tokio::spawn(async move {
                cache.inner.lock().await.in_progress.remove(&key);
                cache.fetch_done.notify_waiters();
            });
        }
    }
}

async fn prefetch_worker(
    cache: Arc<GraphCache>,
    mut rx: mpsc::Receiver<RegionKey>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            item = rx.recv() => {
                let Some(key) = item else { break };
                cache.queue_depth.fetch_sub(1, Ordering::Relaxed);
                if *shutdown.borrow() {
                    break;
                }
                if let Err(err) = cache.prefetch(key).await {
                    // Prefetch is best-effort: log and keep draining.
                    tracing::warn!(key = %key.file_stem(), error = %err, "prefetch failed");
                }
            }
        }
    }
    tracing::debug!("prefetch worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SyntheticFetcher;
    use std::time::Duration;

    fn new_cache(
        dir: &std::path::Path,
        fetcher: Arc<SyntheticFetcher>,
        capacity: usize,
    ) -> Arc<GraphCache> {
        let store = Arc::new(GraphStore::open(dir).expect("store"));
        GraphCache::spawn(store, fetcher, capacity, 32)
    }

    #[tokio::test]
    async fn memory_hit_avoids_refetch() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(SyntheticFetcher::default());
        let cache = new_cache(dir.path(), fetcher.clone(), 5);

        cache.get(41.0, 21.0, 5000.0, Profile::Driving).await.unwrap();
        cache.get(41.0, 21.0, 5000.0, Profile::Driving).await.unwrap();
        assert_eq!(fetcher.calls_for("41.000_21.000_5km_driving"), 1);
    }

    #[tokio::test]
    async fn disk_hit_survives_memory_clear() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(SyntheticFetcher::default());
        let cache = new_cache(dir.path(), fetcher.clone(), 5);

        cache.get(41.0, 21.0, 5000.0, Profile::Driving).await.unwrap();
        assert_eq!(cache.clear_memory().await, 1);
        cache.get(41.0, 21.0, 5000.0, Profile::Driving).await.unwrap();
        assert_eq!(
            fetcher.calls_for("41.000_21.000_5km_driving"),
            1,
            "second hit must come from disk"
        );
    }

    #[tokio::test]
    async fn lru_bound_holds_while_disk_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(SyntheticFetcher::default());
        let cache = new_cache(dir.path(), fetcher.clone(), 2);

        cache.get(41.0, 21.0, 5000.0, Profile::Driving).await.unwrap();
        cache.get(42.0, 22.0, 5000.0, Profile::Driving).await.unwrap();
        cache.get(43.0, 23.0, 5000.0, Profile::Driving).await.unwrap();

        let status = cache.status().await;
        assert_eq!(status.memory_graphs, 2);
        assert!(status
            .cached_keys
            .iter()
            .any(|k| k.starts_with("42.000_22.000")));
        assert!(status
            .cached_keys
            .iter()
            .any(|k| k.starts_with("43.000_23.000")));

        for stem in ["41.000_21.000_5km_driving", "42.000_22.000_5km_driving", "43.000_23.000_5km_driving"] {
            assert!(cache.store().has(stem), "{stem} must exist on disk");
        }
    }

    #[tokio::test]
    async fn concurrent_requests_fetch_once() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(SyntheticFetcher::with_delay(Duration::from_millis(100)));
        let cache = new_cache(dir.path(), fetcher.clone(), 5);

        let (a, b) = tokio::join!(
            cache.get(41.0, 21.0, 5000.0, Profile::Driving),
            cache.get(41.0, 21.0, 5000.0, Profile::Driving),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(
            fetcher.calls_for("41.000_21.000_5km_driving"),
            1,
            "in-progress set must dedupe"
        );
    }

    #[tokio::test]
    async fn in_flight_key_gets_nearest_cached_answer() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(SyntheticFetcher::default());
        let cache = new_cache(dir.path(), fetcher.clone(), 5);

        // Warm a graph ~1.1km away from the upcoming request.
        cache.get(41.0, 21.0, 5000.0, Profile::Driving).await.unwrap();

        let slow = Arc::new(SyntheticFetcher::with_delay(Duration::from_millis(300)));
        let store = cache.store().clone();
        let cache = GraphCache::spawn(store, slow, 5, 32);
        cache.get(41.0, 21.0, 5000.0, Profile::Driving).await.unwrap();

        let pending = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get(41.01, 21.0, 5000.0, Profile::Driving).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let provisional = cache
            .get(41.01, 21.0, 5000.0, Profile::Driving)
            .await
            .unwrap();
        // The provisional graph is the already-cached neighbour, whose nodes
        // sit around (41.0, 21.0).
        let node = provisional.node_coord(provisional.nearest_node(Coordinate::new(41.0, 21.0)).unwrap());
        assert!(node.haversine_km(Coordinate::new(41.0, 21.0)) < 2.0);

        pending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn fetch_enqueues_neighbour_prefetch() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(SyntheticFetcher::default());
        let cache = new_cache(dir.path(), fetcher.clone(), 5);

        cache.get(41.0, 21.0, 5000.0, Profile::Driving).await.unwrap();

        // The worker drains in the background; wait for the neighbours to
        // land on disk.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let files = cache.store().list().unwrap();
            if files.len() >= 9 {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected 9 graphs on disk, found {}",
                files.len()
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(fetcher.region_calls(), 9, "center + 8 neighbours");
    }

    #[tokio::test]
    async fn profiles_do_not_share_graphs() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(SyntheticFetcher::default());
        let cache = new_cache(dir.path(), fetcher.clone(), 5);

        let driving = cache.get(41.0, 21.0, 5000.0, Profile::Driving).await.unwrap();
        let walking = cache.get(41.0, 21.0, 5000.0, Profile::Walking).await.unwrap();
        assert_eq!(driving.profile(), Profile::Driving);
        assert_eq!(walking.profile(), Profile::Walking);
        assert_eq!(fetcher.calls_for("41.000_21.000_5km_driving"), 1);
        assert_eq!(fetcher.calls_for("41.000_21.000_5km_walking"), 1);
    }
}
