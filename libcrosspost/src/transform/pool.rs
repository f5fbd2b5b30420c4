//! Pool of transform workers
//!
//! Each source location is served by its own worker so that repeated
//! transforms of one file reuse a single decode. The pool bounds how many
//! transforms run at once, recycles workers that sat idle past the timeout,
//! and replaces workers that died.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info};

use super::protocol::{TransformRequest, TransformedFile};
use super::worker::{TransformWorker, WorkerBackend, DEFAULT_REQUEST_TIMEOUT};
use crate::error::TransformError;

#[derive(Debug, Clone)]
pub struct TransformPoolConfig {
    pub backend: WorkerBackend,
    /// Maximum number of transforms running at the same time
    pub max_workers: usize,
    /// Workers unused for this long are stopped
    pub idle_timeout: Duration,
    /// A worker that takes longer than this on one request is replaced
    pub request_timeout: Duration,
}

impl Default for TransformPoolConfig {
    fn default() -> Self {
        Self {
            backend: WorkerBackend::InProcess,
            max_workers: num_cpus::get().max(1),
            idle_timeout: Duration::from_secs(300),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

struct PoolEntry {
    worker: Arc<TransformWorker>,
    last_used: Instant,
}

pub struct TransformWorkerPool {
    config: TransformPoolConfig,
    workers: Mutex<HashMap<String, PoolEntry>>,
    permits: Semaphore,
    decodes: Arc<AtomicU64>,
    spawned: AtomicUsize,
}

impl TransformWorkerPool {
    pub fn new(config: TransformPoolConfig) -> Self {
        let permits = Semaphore::new(config.max_workers.max(1));
        Self {
            config,
            workers: Mutex::new(HashMap::new()),
            permits,
            decodes: Arc::new(AtomicU64::new(0)),
            spawned: AtomicUsize::new(0),
        }
    }

    /// Normalize the image at `location` to at most `width` pixels wide at `quality`
    pub async fn transform(
        &self,
        location: &str,
        quality: u8,
        mime_type: &str,
        width: u32,
    ) -> Result<TransformedFile, TransformError> {
        self.submit(TransformRequest {
            location: location.to_string(),
            quality,
            mime_type: mime_type.to_string(),
            width,
            buffer: None,
        })
        .await
    }

    pub async fn submit(&self, request: TransformRequest) -> Result<TransformedFile, TransformError> {
        self.evict_idle();

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TransformError::Worker("transform pool is closed".to_string()))?;

        let location = request.location.clone();
        let worker = self.worker_for(&location)?;
        let result = worker.transform(request).await;

        let mut workers = self.lock();
        if worker.is_alive() {
            if let Some(entry) = workers.get_mut(&location) {
                entry.last_used = Instant::now();
            }
        } else {
            workers.remove(&location);
        }

        result
    }

    fn worker_for(&self, location: &str) -> Result<Arc<TransformWorker>, TransformError> {
        let mut workers = self.lock();
        if let Some(entry) = workers.get(location) {
            if entry.worker.is_alive() {
                return Ok(Arc::clone(&entry.worker));
            }
        }

        if workers.len() >= self.config.max_workers {
            evict_least_recent(&mut workers);
        }

        let index = self.spawned.fetch_add(1, Ordering::Relaxed);
        let worker = Arc::new(TransformWorker::spawn(
            format!("{}", index),
            &self.config.backend,
            Arc::clone(&self.decodes),
        )?
        .with_request_timeout(self.config.request_timeout));
        debug!(worker = %worker.name(), %location, "Assigned transform worker");

        workers.insert(
            location.to_string(),
            PoolEntry {
                worker: Arc::clone(&worker),
                last_used: Instant::now(),
            },
        );
        Ok(worker)
    }

    /// Stop workers idle longer than the timeout. Returns how many were removed.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let timeout = self.config.idle_timeout;
        let mut workers = self.lock();
        let before = workers.len();
        workers.retain(|_, entry| {
            in_use(entry) || now.saturating_duration_since(entry.last_used) < timeout
        });
        let evicted = before - workers.len();
        if evicted > 0 {
            info!(evicted, "Recycled idle transform workers");
        }
        evicted
    }

    pub fn active_workers(&self) -> usize {
        self.lock().len()
    }

    /// Total source decodes performed by in-process workers of this pool
    pub fn decode_count(&self) -> u64 {
        self.decodes.load(Ordering::Relaxed)
    }

    /// Stop every worker and refuse further requests
    pub async fn shutdown(&self) {
        self.permits.close();
        let workers: Vec<Arc<TransformWorker>> =
            self.lock().drain().map(|(_, entry)| entry.worker).collect();
        for worker in workers {
            worker.shutdown().await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PoolEntry>> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The pool map holds one reference; anything more is a request in progress
fn in_use(entry: &PoolEntry) -> bool {
    Arc::strong_count(&entry.worker) > 1
}

fn evict_least_recent(workers: &mut HashMap<String, PoolEntry>) {
    let oldest = workers
        .iter()
        .filter(|(_, entry)| !in_use(entry))
        .min_by_key(|(_, entry)| entry.last_used)
        .map(|(location, _)| location.clone());
    if let Some(location) = oldest {
        debug!(%location, "Evicting least recently used transform worker");
        workers.remove(&location);
    }
}
