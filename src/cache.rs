//! Freshness-gated cache of the pod map.
//!
//! This module provides [`RefreshCache`], the single entry point the scrape
//! handler and the background poller use to obtain the current pod map. A
//! map younger than the freshness threshold is served as-is; an older one is
//! replaced by calling the [`PodFinder`] under the write lock.
//!
//! Readers of a fresh map never wait on the finder. Readers that arrive while
//! a refresh runs wait for it and then see the new map; there is no window in
//! which a partially built map is visible.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::pods::{FindError, PodFinder, PodInfoMap};

/// Default maximum age of a cached map.
pub const DEFAULT_FRESHNESS_THRESHOLD: Duration = Duration::from_secs(1);

/// Cached map plus refresh bookkeeping.
#[derive(Debug, Clone, Default)]
struct CacheEntry {
    pods: Arc<PodInfoMap>,
    last_refreshed: Option<Instant>,
    last_refresh_duration_seconds: f64,
    last_refresh_success: bool,
    refresh_count: u64,
    failure_count: u64,
}

impl CacheEntry {
    fn is_fresh(&self, threshold: Duration) -> bool {
        self.last_refreshed
            .is_some_and(|at| at.elapsed() <= threshold)
    }
}

/// Point-in-time view of the cache bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStatus {
    pub domains: usize,
    pub processes: usize,
    pub last_refreshed: Option<Instant>,
    pub last_refresh_duration_seconds: f64,
    pub last_refresh_success: bool,
    pub refresh_count: u64,
    pub failure_count: u64,
}

impl CacheStatus {
    /// True once at least one refresh has succeeded.
    pub fn has_data(&self) -> bool {
        self.last_refreshed.is_some()
    }
}

pub struct RefreshCache {
    finder: Arc<dyn PodFinder>,
    threshold: Duration,
    entry: RwLock<CacheEntry>,
}

impl std::fmt::Debug for RefreshCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshCache")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl RefreshCache {
    pub fn new(finder: Arc<dyn PodFinder>, threshold: Duration) -> Self {
        Self {
            finder,
            threshold,
            entry: RwLock::new(CacheEntry::default()),
        }
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Returns the current pod map, refreshing it first if it is older than
    /// the threshold.
    ///
    /// On a finder error the previous map and its timestamp are kept and the
    /// error is returned; [`RefreshCache::snapshot`] still serves the
    /// last-good map.
    #[instrument(skip(self))]
    pub async fn update(&self) -> Result<Arc<PodInfoMap>, FindError> {
        {
            let entry = self.entry.read().await;
            if entry.is_fresh(self.threshold) {
                return Ok(Arc::clone(&entry.pods));
            }
        }

        let mut entry = self.entry.write().await;
        // Another caller may have refreshed while we waited for the lock.
        if entry.is_fresh(self.threshold) {
            debug!("Pod map refreshed by a concurrent caller");
            return Ok(Arc::clone(&entry.pods));
        }

        let start = Instant::now();
        let result = self.finder.find_pods().await;
        entry.last_refresh_duration_seconds = start.elapsed().as_secs_f64();
        entry.refresh_count += 1;

        match result {
            Ok(found) => {
                let next = merge_pod_maps(&entry.pods, found);
                entry.pods = Arc::new(next);
                entry.last_refreshed = Some(Instant::now());
                entry.last_refresh_success = true;
                debug!(
                    "Pod map refreshed in {:.3}s: {} domains",
                    entry.last_refresh_duration_seconds,
                    entry.pods.len()
                );
                Ok(Arc::clone(&entry.pods))
            }
            Err(e) => {
                entry.last_refresh_success = false;
                entry.failure_count += 1;
                warn!("Pod map refresh failed, keeping previous map: {}", e);
                Err(e)
            }
        }
    }

    /// Current map without triggering a refresh.
    pub async fn snapshot(&self) -> Arc<PodInfoMap> {
        Arc::clone(&self.entry.read().await.pods)
    }

    pub async fn status(&self) -> CacheStatus {
        let entry = self.entry.read().await;
        CacheStatus {
            domains: entry.pods.len(),
            processes: entry.pods.values().map(|p| p.processes.len()).sum(),
            last_refreshed: entry.last_refreshed,
            last_refresh_duration_seconds: entry.last_refresh_duration_seconds,
            last_refresh_success: entry.last_refresh_success,
            refresh_count: entry.refresh_count,
            failure_count: entry.failure_count,
        }
    }
}

/// Applies a freshly found map to the previous one: vanished domains are
/// dropped, the rest are replaced wholesale.
fn merge_pod_maps(previous: &PodInfoMap, found: PodInfoMap) -> PodInfoMap {
    let mut next = previous.clone();
    next.retain(|domain, _| {
        let keep = found.contains_key(domain);
        if !keep {
            debug!("Domain {} disappeared", domain);
        }
        keep
    });
    for (domain, info) in found {
        next.insert(domain, info);
    }
    next
}
