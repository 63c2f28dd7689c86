use std::{
    fs::{self, File},
    io::{self, BufReader},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use crate::graph::GraphFile;

/// Extension of every cached graph file under the store root.
pub const GRAPH_EXT: &str = "graph.zst";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no cached graph for key {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode graph: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Persistent graph files, one per sanitized cache key. Disk copies are the
/// canonical form and survive restarts; writers go through a temp file and a
/// rename so concurrent readers never observe a partial graph.
pub struct GraphStore {
    root: PathBuf,
}

impl GraphStore {
    /// Opens the store, creating the folder if missing.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, stem: &str) -> PathBuf {
        self.root.join(format!("{stem}.{GRAPH_EXT}"))
    }

    pub fn has(&self, stem: &str) -> bool {
        self.path_for(stem).exists()
    }

    /// Loads a graph file. A corrupted file is deleted and reported as
    /// NotFound so the caller re-fetches.
    pub fn load(&self, stem: &str) -> Result<GraphFile, StoreError> {
        let path = self.path_for(stem);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(stem.to_string()));
            }
            Err(err) => return Err(err.into()),
        };

        let decoder = match zstd::stream::read::Decoder::new(file) {
            Ok(decoder) => decoder,
            Err(err) => return self.discard_corrupt(stem, &path, err),
        };
        match serde_json::from_reader(BufReader::new(decoder)) {
            Ok(graph) => Ok(graph),
            Err(err) => self.discard_corrupt(stem, &path, err),
        }
    }

    fn discard_corrupt<E: std::fmt::Display>(
        &self,
        stem: &str,
        path: &Path,
        err: E,
    ) -> Result<GraphFile, StoreError> {
        tracing::warn!(key = stem, error = %err, "removing corrupt graph file");
        let _ = fs::remove_file(path);
        Err(StoreError::NotFound(stem.to_string()))
    }

    pub fn save(&self, stem: &str, graph: &GraphFile) -> Result<(), StoreError> {
        let path = self.path_for(stem);
        let tmp = self.root.join(format!("{stem}.{GRAPH_EXT}.tmp"));

        let file = File::create(&tmp)?;
        let mut encoder = zstd::stream::write::Encoder::new(file, 3)?;
        serde_json::to_writer(&mut encoder, graph).map_err(|err| {
            let _ = fs::remove_file(&tmp);
            StoreError::Encode(err)
        })?;
        encoder.finish()?;

        fs::rename(&tmp, &path)?;
        tracing::debug!(key = stem, "graph saved to store");
        Ok(())
    }

    /// Stems of every cached graph file.
    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut stems = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(&format!(".{GRAPH_EXT}")) {
                stems.push(stem.to_string());
            }
        }
        stems.sort();
        Ok(stems)
    }

    /// Deletes graph files older than the given age. Returns how many were
    /// removed.
    pub fn remove_older_than(&self, max_age: Duration) -> Result<usize, StoreError> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;
        for stem in self.list()? {
            let path = self.path_for(&stem);
            let modified = path.metadata().and_then(|m| m.modified());
            if matches!(modified, Ok(time) if time < cutoff) {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "expired graph files removed");
        }
        Ok(removed)
    }

    /// Removes every cached graph file. Returns how many were deleted.
    pub fn clear(&self) -> Result<usize, StoreError> {
        let stems = self.list()?;
        for stem in &stems {
            fs::remove_file(self.path_for(stem))?;
        }
        Ok(stems.len())
    }
}
