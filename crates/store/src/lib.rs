//! jobseq store: the in-memory FIFO queue of serialized job documents.
//!
//! The queue lives only in this process. It is seeded once, from a config map
//! or a directory of YAML files, and afterwards only grows at the back.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use jobseq_kubehub::{Cluster, ClusterError};
use metrics::gauge;
use tracing::{debug, info};

/// Ordered queue of pending job documents (serialized YAML/JSON).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobQueue {
    items: VecDeque<String>,
}

impl JobQueue {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub fn pop_front(&mut self) -> Option<String> {
        let item = self.items.pop_front();
        gauge!("jobseq_queue_depth", self.items.len() as f64);
        item
    }

    /// Append after everything already queued; never at the front.
    pub fn extend_back<I: IntoIterator<Item = String>>(&mut self, docs: I) {
        let before = self.items.len();
        self.items.extend(docs);
        gauge!("jobseq_queue_depth", self.items.len() as f64);
        debug!(added = self.items.len() - before, queued = self.items.len(), "queue extended");
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> { self.items.iter() }
}

impl FromIterator<String> for JobQueue {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self { items: iter.into_iter().collect() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("reading seed config map {name}: {source}")]
    ConfigMap { name: String, #[source] source: ClusterError },
    #[error("reading job files from {}: {source}", path.display())]
    Io { path: PathBuf, #[source] source: std::io::Error },
}

/// Where the initial queue comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedSource {
    ConfigMap(String),
    Directory(PathBuf),
}

impl SeedSource {
    /// A configured config map name wins over the directory scan.
    pub fn choose(config_map: Option<String>, dir: impl Into<PathBuf>) -> Self {
        match config_map.filter(|s| !s.is_empty()) {
            Some(name) => SeedSource::ConfigMap(name),
            None => SeedSource::Directory(dir.into()),
        }
    }

    pub async fn load(&self, cluster: &dyn Cluster, namespace: &str) -> Result<JobQueue, SeedError> {
        match self {
            SeedSource::ConfigMap(name) => seed_from_config_map(cluster, namespace, name).await,
            SeedSource::Directory(dir) => seed_from_dir(dir),
        }
    }
}

/// Values of a config map, in key order.
pub async fn seed_from_config_map(cluster: &dyn Cluster, namespace: &str, name: &str) -> Result<JobQueue, SeedError> {
    info!(ns = %namespace, configmap = %name, "reading initial configmap");
    let data = cluster
        .read_config_map(namespace, name)
        .await
        .map_err(|source| SeedError::ConfigMap { name: name.to_string(), source })?;
    Ok(data.into_values().collect())
}

/// Contents of `*.yaml` / `*.yml` files directly under `dir`, ordered by file name.
pub fn seed_from_dir(dir: &Path) -> Result<JobQueue, SeedError> {
    info!(dir = %dir.display(), "reading job files from directory");
    let io_err = |source| SeedError::Io { path: dir.to_path_buf(), source };
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        let is_yaml = matches!(path.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"));
        // Follows symlinks: config map volumes expose files as links into `..data/`.
        if is_yaml && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    let mut queue = JobQueue::new();
    for path in files {
        let text = std::fs::read_to_string(&path).map_err(|source| SeedError::Io { path: path.clone(), source })?;
        debug!(file = %path.display(), bytes = text.len(), "job file loaded");
        queue.extend_back(std::iter::once(text));
    }
    Ok(queue)
}
