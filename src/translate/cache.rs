//! Bounded LRU cache of engine handles keyed by language pair.
//! A miss triggers exactly one build per pair; concurrent callers for the same
//! pair await that build and share its outcome. Failed builds are not cached.
//!
//! Handles are `Arc`s: evicting a pair only stops new lookups from seeing it,
//! calls already holding the handle keep running.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::{Engine, EngineFactory, EngineLoadError, LanguagePair};
use crate::metrics::{metric_names, MetricsRegistry};

type BuildOutcome = Result<Arc<dyn Engine>, EngineLoadError>;
/// Settles to `Some` once the build task is done.
type PendingBuild = watch::Receiver<Option<BuildOutcome>>;

/// Map of ready engines plus the builds currently in progress.
/// Both live under one lock so a pair is never both absent from `entries`
/// and missing its in-flight build while that build is running.
struct CacheState {
    entries: LruCache<LanguagePair, Arc<dyn Engine>>,
    in_flight: HashMap<LanguagePair, PendingBuild>,
}

/// Everything a detached build task needs after its caller is gone.
struct Shared {
    state: Mutex<CacheState>,
    factory: Arc<dyn EngineFactory>,
    build_timeout: Duration,
    metrics: Arc<MetricsRegistry>,
}

pub struct EngineCache {
    shared: Arc<Shared>,
}

impl EngineCache {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        capacity: NonZeroUsize,
        build_timeout: Duration,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(CacheState {
                    entries: LruCache::new(capacity),
                    in_flight: HashMap::new(),
                }),
                factory,
                build_timeout,
                metrics,
            }),
        }
    }

    /// Return the engine for `pair`, building it on first use.
    ///
    /// The build runs on its own task: callers that give up (a dropped
    /// request) do not cancel it, and later callers join the same build.
    pub async fn resolve(&self, pair: &LanguagePair) -> BuildOutcome {
        let mut pending = {
            let mut state = self.shared.state.lock();
            if let Some(engine) = state.entries.get(pair) {
                let engine = Arc::clone(engine);
                drop(state);
                self.shared.metrics.incr(metric_names::CACHE_HIT);
                debug!(pair = %pair, "engine_cache_hit");
                return Ok(engine);
            }
            match state.in_flight.get(pair) {
                Some(pending) => pending.clone(),
                None => {
                    let (done, pending) = watch::channel(None);
                    state.in_flight.insert(pair.clone(), pending.clone());
                    tokio::spawn(Arc::clone(&self.shared).load(pair.clone(), done));
                    pending
                }
            }
        };

        let settled = match pending.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };
        match settled {
            Some(outcome) => outcome,
            None => {
                // The build task died without reporting; let the next caller start over.
                self.shared
                    .state
                    .lock()
                    .in_flight
                    .retain(|_, build| build.has_changed().is_ok());
                Err(EngineLoadError::unavailable(pair.clone(), "engine build task aborted"))
            }
        }
    }
}

impl Shared {
    async fn load(self: Arc<Self>, pair: LanguagePair, done: watch::Sender<Option<BuildOutcome>>) {
        self.metrics.incr(metric_names::CACHE_MISS);
        info!(pair = %pair, "engine_load_started");
        let start = Instant::now();

        let outcome = match tokio::time::timeout(self.build_timeout, self.factory.build(&pair)).await {
            Ok(result) => result,
            Err(_) => Err(EngineLoadError::timed_out(pair.clone(), self.build_timeout)),
        };

        let (evicted, cached) = {
            let mut state = self.state.lock();
            state.in_flight.remove(&pair);
            let evicted = match &outcome {
                Ok(engine) => state
                    .entries
                    .push(pair.clone(), Arc::clone(engine))
                    .map(|(evicted, _)| evicted)
                    .filter(|evicted| *evicted != pair),
                Err(_) => None,
            };
            (evicted, state.entries.len())
        };

        match &outcome {
            Ok(_) => {
                let elapsed_us = start.elapsed().as_micros() as f64;
                self.metrics.record(metric_names::ENGINE_BUILD, elapsed_us);
                info!(
                    pair = %pair,
                    elapsed_ms = elapsed_us / 1000.0,
                    cached,
                    "engine_loaded"
                );
            }
            Err(e) => {
                self.metrics.incr(metric_names::ENGINE_LOAD_FAILED);
                error!(pair = %pair, kind = %e.kind, cause = %e.cause, "engine_load_failed");
            }
        }
        if let Some(evicted) = evicted {
            self.metrics.incr(metric_names::CACHE_EVICTION);
            info!(evicted = %evicted, "engine_evicted");
        }

        // Nobody waiting is fine: the engine is already cached.
        done.send_replace(Some(outcome));
    }
}

impl EngineCache {
    /// Number of ready engines.
    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.state.lock().entries.cap().get()
    }

    /// Whether `pair` has a ready engine. Does not touch recency.
    pub fn contains(&self, pair: &LanguagePair) -> bool {
        self.shared.state.lock().entries.contains(pair)
    }

    /// Cached pairs, most recently used first.
    #[cfg(test)]
    fn pairs_by_recency(&self) -> Vec<LanguagePair> {
        self.shared
            .state
            .lock()
            .entries
            .iter()
            .map(|(pair, _)| pair.clone())
            .collect()
    }

    /// Drop every cached engine. In-flight builds are unaffected.
    pub fn clear(&self) {
        let mut state = self.shared.state.lock();
        let dropped = state.entries.len();
        state.entries.clear();
        info!(dropped, "engine_cache_cleared");
    }
}
