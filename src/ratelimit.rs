//! Per-client admission gate.
//!
//! Each client gets a bucket of fixed counting windows, one per quota. A
//! window restarts at the first hit after it has elapsed. Every hit is
//! counted before the ceilings are checked, so a rejected request still
//! occupies its slot in the current windows.
//!
//! Global quotas apply to every route; route quotas add tighter limits on
//! top. All applicable quotas must pass.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(24 * 3600);

/// At most `max` requests per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub max: u32,
    pub window: Duration,
}

impl Quota {
    pub fn new(max: u32, window: Duration) -> Self {
        Self { max, window }
    }

    pub fn per_minute(max: u32) -> Self {
        Self::new(max, MINUTE)
    }

    pub fn per_day(max: u32) -> Self {
        Self::new(max, DAY)
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.window {
            w if w == DAY => write!(f, "{} per 1 day", self.max),
            w if w == HOUR => write!(f, "{} per 1 hour", self.max),
            w if w == MINUTE => write!(f, "{} per 1 minute", self.max),
            w => write!(f, "{} per {} seconds", self.max, w.as_secs()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rate limit exceeded: {quota}")]
pub struct RateLimitExceeded {
    pub quota: Quota,
    pub retry_after: Duration,
}

impl RateLimitExceeded {
    /// `retry_after` rounded up to whole seconds, as sent in `Retry-After`.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self {
            started: now,
            count: 0,
        }
    }

    /// Count one hit. Returns how long until the window resets if the
    /// hit pushed it over `quota`.
    fn hit(&mut self, quota: &Quota, now: Instant) -> Option<Duration> {
        if now.saturating_duration_since(self.started) >= quota.window {
            *self = Window::new(now);
        }
        self.count = self.count.saturating_add(1);
        if self.count > quota.max {
            let resets_at = self.started + quota.window;
            Some(resets_at.saturating_duration_since(now))
        } else {
            None
        }
    }
}

struct ClientBucket {
    global: Vec<Window>,
    routes: HashMap<String, Vec<Window>>,
    last_seen: Instant,
}

pub struct RateLimiter {
    global: Vec<Quota>,
    routes: HashMap<String, Vec<Quota>>,
    buckets: RwLock<HashMap<String, Arc<Mutex<ClientBucket>>>>,
}

impl RateLimiter {
    pub fn new(global: Vec<Quota>) -> Self {
        Self {
            global,
            routes: HashMap::new(),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Add quotas that only apply to `route`.
    pub fn with_route(mut self, route: &str, quotas: Vec<Quota>) -> Self {
        self.routes.insert(route.to_string(), quotas);
        self
    }

    pub fn admit(&self, client: &str, route: &str) -> Result<(), RateLimitExceeded> {
        self.admit_at(client, route, Instant::now())
    }

    pub fn admit_at(&self, client: &str, route: &str, now: Instant) -> Result<(), RateLimitExceeded> {
        let bucket = self.bucket(client, now);
        let mut bucket = bucket.lock();
        bucket.last_seen = now;

        let mut worst: Option<RateLimitExceeded> = None;
        let mut note = |quota: &Quota, retry_after: Option<Duration>| {
            if let Some(retry_after) = retry_after {
                if worst.as_ref().map_or(true, |w| retry_after > w.retry_after) {
                    worst = Some(RateLimitExceeded {
                        quota: *quota,
                        retry_after,
                    });
                }
            }
        };

        for (quota, window) in self.global.iter().zip(bucket.global.iter_mut()) {
            note(quota, window.hit(quota, now));
        }
        if let Some(quotas) = self.routes.get(route) {
            let windows = bucket
                .routes
                .entry(route.to_string())
                .or_insert_with(|| vec![Window::new(now); quotas.len()]);
            for (quota, window) in quotas.iter().zip(windows.iter_mut()) {
                note(quota, window.hit(quota, now));
            }
        }

        match worst {
            Some(exceeded) => Err(exceeded),
            None => Ok(()),
        }
    }

    fn bucket(&self, client: &str, now: Instant) -> Arc<Mutex<ClientBucket>> {
        if let Some(bucket) = self.buckets.read().get(client) {
            return Arc::clone(bucket);
        }
        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(client.to_string()).or_insert_with(|| {
            debug!(client, "rate_bucket_created");
            Arc::new(Mutex::new(ClientBucket {
                global: vec![Window::new(now); self.global.len()],
                routes: HashMap::new(),
                last_seen: now,
            }))
        });
        Arc::clone(bucket)
    }

    /// Longest window over all quotas. A bucket idle this long holds only
    /// expired windows.
    pub fn idle_horizon(&self) -> Duration {
        self.global
            .iter()
            .chain(self.routes.values().flatten())
            .map(|q| q.window)
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Forget clients idle past the longest window. Returns how many were dropped.
    ///
    /// `admit_at` looks a bucket up before locking it. A bucket some admission
    /// still holds is kept however stale it looks, so that admission's hit is
    /// not recorded on a bucket that already left the map.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        let horizon = self.idle_horizon();
        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            Arc::strong_count(bucket) > 1
                || now.saturating_duration_since(bucket.lock().last_seen) < horizon
        });
        let dropped = before - buckets.len();
        debug!(dropped, remaining = buckets.len(), "rate_buckets_swept");
        dropped
    }

    /// Number of tracked clients.
    pub fn tracked_clients(&self) -> usize {
        self.buckets.read().len()
    }
}
