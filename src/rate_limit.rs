use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use dashmap::DashMap;

/// Every this many checks, keys with no hit inside the window are dropped.
pub const PURGE_EVERY: usize = 1024;

fn prune(hits: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = hits.front() {
        if now.duration_since(*front) >= window { hits.pop_front(); } else { break; }
    }
}

/// Sliding window in-memory rate limiter (process local).
#[derive(Clone)]
pub struct InMemoryRateLimiter {
    store: Arc<DashMap<String, VecDeque<Instant>>>,
    checks: Arc<AtomicUsize>,
    pub enabled: bool,
}

impl InMemoryRateLimiter {
    pub fn new(enabled: bool) -> Self {
        Self { store: Arc::new(DashMap::new()), checks: Arc::new(AtomicUsize::new(0)), enabled }
    }

    /// Returns true if allowed, false if limited.
    pub fn check(&self, key: &str, limit: usize, window: Duration) -> bool {
        if !self.enabled { return true; }
        // purge before taking the entry guard, retain locks every shard
        if self.checks.fetch_add(1, Ordering::Relaxed).wrapping_add(1) % PURGE_EVERY == 0 {
            self.purge_idle(window);
        }
        let now = Instant::now();
        let mut entry = self.store.entry(key.to_string()).or_default();
        prune(&mut entry, now, window);
        if entry.len() < limit {
            entry.push_back(now);
            true
        } else {
            false
        }
    }

    /// Drops keys whose every hit is older than `window`.
    pub fn purge_idle(&self, window: Duration) {
        let now = Instant::now();
        self.store.retain(|_, hits| {
            prune(hits, now, window);
            !hits.is_empty()
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.store.len()
    }
}

/// Vote throttling settings, read from `RL_*` variables.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub vote_limit: usize,
    pub vote_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { enabled: true, vote_limit: 30, vote_window: Duration::from_secs(60) }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        fn usize_env(name: &str, default: usize) -> usize { std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default) }
        fn dur_env(name: &str, default: u64) -> Duration { Duration::from_secs(std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)) }
        let d = Self::default();
        Self {
            enabled: std::env::var("RL_ENABLED").map(|v| v != "0" && !v.eq_ignore_ascii_case("false")).unwrap_or(d.enabled),
            vote_limit: usize_env("RL_VOTE_LIMIT", d.vote_limit),
            vote_window: dur_env("RL_VOTE_WINDOW", d.vote_window.as_secs()),
        }
    }
}

/// High level guard used by handlers.
#[derive(Clone)]
pub struct RateLimiterFacade {
    pub limiter: InMemoryRateLimiter,
    pub cfg: RateLimitConfig,
}

impl RateLimiterFacade {
    pub fn new(limiter: InMemoryRateLimiter, cfg: RateLimitConfig) -> Self { Self { limiter, cfg } }

    pub fn from_config(cfg: RateLimitConfig) -> Self {
        Self::new(InMemoryRateLimiter::new(cfg.enabled), cfg)
    }

    /// Keyed by client address; voters behind one address share the budget.
    pub fn allow_vote(&self, client: &str) -> bool { self.limiter.check(&format!("vote:{client}"), self.cfg.vote_limit, self.cfg.vote_window) }
}
