//! Content-addressed cache of arbitrated OCR results.

use crate::config::CacheConfig;
use crate::error::CacheError;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use telemetry::metrics::LPR_CACHE_HEALTH;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Value stored per fingerprint: cleaned text and arbitrated confidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedOcr {
    pub text: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,

    /// Entries held in process memory
    pub memory_size: usize,

    /// Whether a shared backend is attached and reachable
    pub backend_connected: bool,

    /// Entries held by the shared backend
    pub backend_size: usize,
}

/// Result cache collaborator.
///
/// Writes are idempotent: storing the same fingerprint twice keeps one entry.
pub trait ResultCache: Send + Sync {
    fn get(&self, fingerprint: &str) -> Result<Option<CachedOcr>, CacheError>;
    fn put(&self, fingerprint: &str, value: CachedOcr) -> Result<(), CacheError>;
    fn stats(&self) -> CacheStats;
    fn health_check(&self) -> Result<(), CacheError>;
}

/// SHA-256 over the image dimensions, color type and raw pixels
pub fn fingerprint(image: &DynamicImage) -> String {
    fingerprint_with_context(image, &[])
}

/// Fingerprint of a crop read under `context`: the same pixels read with
/// different hints get different keys
pub fn fingerprint_with_context(image: &DynamicImage, context: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image.width().to_le_bytes());
    hasher.update(image.height().to_le_bytes());
    hasher.update(format!("{:?}", image.color()).as_bytes());
    hasher.update(image.as_bytes());
    for part in context {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
struct Entry {
    value: CachedOcr,
    inserted_at: Instant,
    /// Recency tick, also the key of this entry in `recency`
    last_used: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    items: HashMap<String, Entry>,
    /// Recency tick to key, least recently used first
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    stats: CacheStats,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn touch(&mut self, key: &str) {
        let tick = self.tick();
        if let Some(entry) = self.items.get_mut(key) {
            self.recency.remove(&entry.last_used);
            entry.last_used = tick;
            self.recency.insert(tick, key.to_string());
        }
    }

    fn insert(&mut self, key: &str, value: CachedOcr) {
        let tick = self.tick();
        let entry = Entry {
            value,
            inserted_at: Instant::now(),
            last_used: tick,
        };
        if let Some(previous) = self.items.insert(key.to_string(), entry) {
            self.recency.remove(&previous.last_used);
        }
        self.recency.insert(tick, key.to_string());
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.items.remove(key) {
            self.recency.remove(&entry.last_used);
        }
    }

    fn evict_oldest(&mut self) -> bool {
        match self.recency.pop_first() {
            Some((_, key)) => self.items.remove(&key).is_some(),
            None => false,
        }
    }
}

/// In-process LRU cache with a TTL per entry
pub struct MemoryResultCache {
    max_entries: usize,
    ttl: Duration,
    state: Mutex<CacheState>,
}

impl MemoryResultCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            max_entries: max_entries.max(1),
            ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries, Duration::from_secs(config.ttl_secs))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, CacheState>, CacheError> {
        self.state
            .lock()
            .map_err(|e| CacheError::Unavailable(format!("cache lock poisoned: {}", e)))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultCache for MemoryResultCache {
    fn get(&self, fingerprint: &str) -> Result<Option<CachedOcr>, CacheError> {
        let mut state = self.lock()?;

        let cached = state.items.get(fingerprint).cloned();
        match cached {
            Some(entry) if entry.inserted_at.elapsed() > self.ttl => {
                state.remove(fingerprint);
                state.stats.expirations += 1;
                state.stats.misses += 1;
                Ok(None)
            }
            Some(entry) => {
                state.touch(fingerprint);
                state.stats.hits += 1;
                Ok(Some(entry.value))
            }
            None => {
                state.stats.misses += 1;
                Ok(None)
            }
        }
    }

    fn put(&self, fingerprint: &str, value: CachedOcr) -> Result<(), CacheError> {
        let mut state = self.lock()?;

        if !state.items.contains_key(fingerprint) {
            while state.items.len() >= self.max_entries && !state.recency.is_empty() {
                if state.evict_oldest() {
                    state.stats.evictions += 1;
                }
            }
        }

        state.insert(fingerprint, value);
        Ok(())
    }

    fn stats(&self) -> CacheStats {
        match self.lock() {
            Ok(state) => CacheStats {
                memory_size: state.items.len(),
                ..state.stats.clone()
            },
            Err(_) => CacheStats::default(),
        }
    }

    fn health_check(&self) -> Result<(), CacheError> {
        self.lock().map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheHealth {
    Unknown,
    Healthy,
    Error,
}

/// Periodically probes the cache and records the outcome in a status cell.
///
/// The probe never blocks recognition; a failing cache only flips the status
/// to [`CacheHealth::Error`].
pub struct CacheHealthMonitor {
    cache: Arc<dyn ResultCache>,
    interval: Duration,
    status: Arc<RwLock<CacheHealth>>,
}

impl CacheHealthMonitor {
    pub fn new(cache: Arc<dyn ResultCache>, interval: Duration) -> Self {
        Self {
            cache,
            interval: interval.max(Duration::from_millis(10)),
            status: Arc::new(RwLock::new(CacheHealth::Unknown)),
        }
    }

    /// Shared handle to the status cell
    pub fn status_handle(&self) -> Arc<RwLock<CacheHealth>> {
        Arc::clone(&self.status)
    }

    pub fn status(&self) -> CacheHealth {
        self.status
            .read()
            .map(|s| *s)
            .unwrap_or(CacheHealth::Error)
    }

    /// Run one probe and record it
    pub fn check_once(&self) -> CacheHealth {
        let health = match self.cache.health_check() {
            Ok(()) => CacheHealth::Healthy,
            Err(e) => {
                warn!(error = %e, "cache health check failed");
                CacheHealth::Error
            }
        };

        if let Ok(mut status) = self.status.write() {
            if *status != health {
                info!(status = ?health, "cache health changed");
            }
            *status = health;
        }
        LPR_CACHE_HEALTH.set(i64::from(health == CacheHealth::Healthy));
        health
    }

    /// Probe loop; returns when `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs_f64(), "cache health monitor started");
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("cache health monitor stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let stats = self.cache.stats();
                    let health = self.check_once();
                    debug!(
                        ?health,
                        hits = stats.hits,
                        misses = stats.misses,
                        entries = stats.memory_size,
                        "cache health probe"
                    );
                }
            }
        }
    }
}
