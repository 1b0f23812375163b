//! Result cache for read-only tool commands
//!
//! Only successful, size-bounded results of allow-listed commands are stored.
//! Entries expire after a per-command TTL (checked lazily on read and by a
//! periodic sweep). When the cache is full, expired entries go first; then
//! the lowest scoring ~20% are evicted, where
//! `score = 0.7 * hit_count + 0.3 * seconds_since_cache_start(last_accessed)`.

use crate::command::{CacheProvenance, CommandResult};
use chrono::{DateTime, Utc};
use conduit_foundation::util::{normalize_json, CompositeKey};
use conduit_foundation::CacheConfig;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

const HIT_WEIGHT: f64 = 0.7;
const RECENCY_WEIGHT: f64 = 0.3;

/// Share of entries evicted in one pass (1/5 = 20%)
const EVICTION_DIVISOR: usize = 5;

// ============================================================================
// Cache Key
// ============================================================================

/// Deterministic key over command name + normalized arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(u64);

impl CacheKey {
    fn from_normalized(command: &str, normalized: &Value) -> Self {
        let mut key = CompositeKey::new();
        key.push_str(command);
        key.push_json(normalized);
        Self(key.finalize())
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// ============================================================================
// Entries & Stats
// ============================================================================

#[derive(Debug)]
struct CacheEntry {
    command: String,
    args: Value,
    result: CommandResult,
    cached_at: DateTime<Utc>,
    expires_at: Instant,
    last_accessed: Instant,
    hit_count: u64,
    size_bytes: usize,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub total_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    rejected: u64,
}

impl CacheState {
    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - self.entries.len();
        self.expirations += removed as u64;
        removed
    }
}

// ============================================================================
// Result Cache
// ============================================================================

/// TTL + frequency/recency bounded cache of command results
pub struct ResultCache {
    config: CacheConfig,
    /// Reference point for recency scores
    epoch: Instant,
    state: Mutex<CacheState>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            state: Mutex::new(CacheState::default()),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Key for `command` + `args`, invariant to key order and surrounding
    /// whitespace in string values
    pub fn generate_key(command: &str, args: &Value) -> CacheKey {
        CacheKey::from_normalized(command, &normalize_json(args))
    }

    /// Look up a cached result.
    ///
    /// A hit bumps the entry's hit count and recency and returns a copy
    /// marked `cached` with provenance attached.
    pub fn get(&self, command: &str, args: &Value) -> Option<CommandResult> {
        let normalized = normalize_json(args);
        let key = CacheKey::from_normalized(command, &normalized);
        let now = Instant::now();

        let mut state = self.state.lock();

        let expired = match state.entries.get(&key) {
            None => {
                state.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            state.entries.remove(&key);
            state.expirations += 1;
            state.misses += 1;
            trace!(command, key = %key, "Cache entry expired");
            return None;
        }

        let Some(entry) = state.entries.get_mut(&key) else {
            return None;
        };

        // Hash collision: same key, different request
        if entry.command != command || entry.args != normalized {
            state.misses += 1;
            return None;
        }

        entry.hit_count += 1;
        entry.last_accessed = now;

        let mut result = entry.result.clone();
        result.cached = true;
        result.cache_info = Some(CacheProvenance {
            key: key.to_string(),
            hit_count: entry.hit_count,
            cached_at: entry.cached_at,
        });
        let hit_count = entry.hit_count;

        state.hits += 1;
        debug!(command, key = %key, hit_count, "Cache hit");
        Some(result)
    }

    /// Store a result. Returns false when the result is not cacheable:
    /// caching disabled, failed result, command not allow-listed, or
    /// serialized size above `max_result_bytes`.
    pub fn set(
        &self,
        command: &str,
        args: &Value,
        result: &CommandResult,
        ttl: Option<Duration>,
    ) -> bool {
        if let Some(reason) = self.rejection_reason(command, result) {
            self.state.lock().rejected += 1;
            debug!(command, reason, "Result not cached");
            return false;
        }

        let size_bytes = result.estimated_size();
        if size_bytes > self.config.max_result_bytes {
            self.state.lock().rejected += 1;
            debug!(
                command,
                size_bytes,
                limit = self.config.max_result_bytes,
                "Result too large to cache"
            );
            return false;
        }

        let normalized = normalize_json(args);
        let key = CacheKey::from_normalized(command, &normalized);
        let ttl = ttl.unwrap_or_else(|| self.config.ttl_for(command));
        let now = Instant::now();

        let mut stored = result.clone();
        stored.cached = false;
        stored.cache_info = None;
        stored.execution = None;

        let mut state = self.state.lock();
        if !state.entries.contains_key(&key) && state.entries.len() >= self.config.max_entries {
            self.evict(&mut state, now);
        }

        state.entries.insert(
            key,
            CacheEntry {
                command: command.to_string(),
                args: normalized,
                result: stored,
                cached_at: Utc::now(),
                expires_at: now + ttl,
                last_accessed: now,
                hit_count: 0,
                size_bytes,
            },
        );

        debug!(command, key = %key, ttl_secs = ttl.as_secs(), "Cached result");
        true
    }

    fn rejection_reason(&self, command: &str, result: &CommandResult) -> Option<&'static str> {
        if !self.config.enabled {
            Some("cache disabled")
        } else if !result.success {
            Some("failed result")
        } else if !self.config.is_cacheable(command) {
            Some("command not cacheable")
        } else {
            None
        }
    }

    /// Make room for one insertion
    fn evict(&self, state: &mut CacheState, now: Instant) {
        let expired = state.purge_expired(now);
        if state.entries.len() < self.config.max_entries {
            trace!(expired, "Eviction satisfied by expired entries");
            return;
        }

        let count = (state.entries.len() / EVICTION_DIVISOR).max(1);
        let mut ranked: Vec<(CacheKey, f64, Instant)> = state
            .entries
            .iter()
            .map(|(key, entry)| (*key, self.score(entry), entry.last_accessed))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.2.cmp(&b.2)));

        for (key, score, _) in ranked.into_iter().take(count) {
            state.entries.remove(&key);
            trace!(key = %key, score, "Evicted cache entry");
        }
        state.evictions += count as u64;
        debug!(evicted = count, expired, "Cache eviction");
    }

    fn score(&self, entry: &CacheEntry) -> f64 {
        let recency = entry.last_accessed.duration_since(self.epoch).as_secs_f64();
        HIT_WEIGHT * entry.hit_count as f64 + RECENCY_WEIGHT * recency
    }

    /// Drop one entry, or every entry of `command` when `args` is `None`.
    /// Returns the number of entries removed.
    pub fn invalidate(&self, command: &str, args: Option<&Value>) -> usize {
        let mut state = self.state.lock();
        let removed = match args {
            Some(args) => {
                let key = Self::generate_key(command, args);
                usize::from(state.entries.remove(&key).is_some())
            }
            None => {
                let before = state.entries.len();
                state.entries.retain(|_, entry| entry.command != command);
                before - state.entries.len()
            }
        };
        debug!(command, removed, "Invalidated cache entries");
        removed
    }

    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    /// Remove expired entries now
    pub fn purge_expired(&self) -> usize {
        self.state.lock().purge_expired(Instant::now())
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let lookups = state.hits + state.misses;
        CacheStats {
            entries: state.entries.len(),
            max_entries: self.config.max_entries,
            total_bytes: state.entries.values().map(|e| e.size_bytes).sum(),
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
            evictions: state.evictions,
            expirations: state.expirations,
            rejected: state.rejected,
        }
    }

    // ========================================================================
    // Background sweep
    // ========================================================================

    /// Start the periodic expiry sweep on the current tokio runtime.
    ///
    /// The task only holds a weak reference and ends once the cache is
    /// dropped. Calling this again while a sweep is running is a no-op.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.sweep_interval();
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.purge_expired();
                if removed > 0 {
                    debug!(removed, "Swept expired cache entries");
                }
            }
        }));
    }

    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop the background sweep
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for ResultCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(max_entries: usize) -> CacheConfig {
        CacheConfig {
            max_entries,
            cacheable_commands: vec!["status".into(), "list".into(), "search".into()],
            ..Default::default()
        }
    }

    fn ok(text: &str) -> CommandResult {
        CommandResult::success(vec![json!({ "text": text })])
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_then_get_carries_provenance() {
        let cache = ResultCache::new(config(10));
        assert!(cache.set("status", &json!({"path": "."}), &ok("clean"), None));

        let first = cache.get("status", &json!({"path": "."})).unwrap();
        assert!(first.cached);
        assert_eq!(first.messages, vec![json!({"text": "clean"})]);
        assert_eq!(first.cache_info.as_ref().unwrap().hit_count, 1);

        let second = cache.get("status", &json!({"path": "."})).unwrap();
        assert_eq!(second.cache_info.unwrap().hit_count, 2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_ignores_order_and_whitespace() {
        let cache = ResultCache::new(config(10));
        cache.set("search", &json!({"query": " foo ", "limit": 5}), &ok("r"), None);

        assert!(cache.get("search", &json!({"limit": 5, "query": "foo"})).is_some());
        assert!(cache.get("search", &json!({"limit": 6, "query": "foo"})).is_none());
        assert_eq!(
            ResultCache::generate_key("search", &json!({"b": " x", "a": 1})),
            ResultCache::generate_key("search", &json!({"a": 1, "b": "x "}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections() {
        let cache = ResultCache::new(CacheConfig {
            max_result_bytes: 64,
            ..config(10)
        });

        assert!(!cache.set("status", &json!({}), &CommandResult::failure("boom"), None));
        assert!(!cache.set("deploy", &json!({}), &ok("done"), None));
        assert!(!cache.set("status", &json!({}), &ok(&"x".repeat(200)), None));
        assert!(cache.is_empty());
        assert_eq!(cache.stats().rejected, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_boundary() {
        let cache = ResultCache::new(config(10));
        cache.set("list", &json!({}), &ok("a"), Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cache.get("list", &json!({})).is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get("list", &json!({})).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_command_ttl_is_used() {
        let cache = ResultCache::new(config(10));
        // status defaults to 30s
        cache.set("status", &json!({}), &ok("a"), None);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(cache.get("status", &json!({})).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_max_entries() {
        let cache = ResultCache::new(config(5));
        for i in 0..20 {
            cache.set("list", &json!({ "page": i }), &ok("p"), None);
            assert!(cache.len() <= 5);
        }
        assert!(cache.stats().evictions > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_lowest_score_first() {
        let cache = ResultCache::new(config(5));
        for i in 0..5 {
            cache.set("list", &json!({ "page": i }), &ok("p"), None);
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        // page 0 is the oldest but becomes the most used and most recent
        for _ in 0..3 {
            cache.get("list", &json!({"page": 0}));
        }
        tokio::time::advance(Duration::from_secs(1)).await;

        cache.set("list", &json!({"page": 99}), &ok("p"), None);

        assert_eq!(cache.len(), 5);
        assert!(cache.get("list", &json!({"page": 0})).is_some());
        assert!(cache.get("list", &json!({"page": 1})).is_none());
        assert!(cache.get("list", &json!({"page": 99})).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_evicted_before_live_ones() {
        let cache = ResultCache::new(config(2));
        cache.set("list", &json!({"a": 1}), &ok("a"), Some(Duration::from_secs(1)));
        cache.set("list", &json!({"b": 1}), &ok("b"), Some(Duration::from_secs(100)));

        tokio::time::advance(Duration::from_secs(2)).await;
        cache.set("list", &json!({"c": 1}), &ok("c"), None);

        assert!(cache.get("list", &json!({"b": 1})).is_some());
        assert!(cache.get("list", &json!({"c": 1})).is_some());
        assert_eq!(cache.stats().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate() {
        let cache = ResultCache::new(config(10));
        cache.set("list", &json!({"a": 1}), &ok("a"), None);
        cache.set("list", &json!({"b": 1}), &ok("b"), None);
        cache.set("status", &json!({}), &ok("s"), None);

        assert_eq!(cache.invalidate("list", Some(&json!({"a": 1}))), 1);
        assert_eq!(cache.invalidate("list", Some(&json!({"a": 1}))), 0);
        assert_eq!(cache.invalidate("list", None), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_entries() {
        let cache = Arc::new(ResultCache::new(CacheConfig {
            sweep_interval_secs: 1,
            ..config(10)
        }));
        cache.start_sweeper();
        assert!(cache.is_sweeping());

        cache.set("list", &json!({}), &ok("a"), Some(Duration::from_secs(1)));
        tokio::time::sleep(Duration::from_millis(3500)).await;

        assert!(cache.is_empty());
        assert_eq!(cache.stats().expirations, 1);

        cache.shutdown();
        tokio::task::yield_now().await;
        assert!(!cache.is_sweeping());
    }
}
