//! Response and function-result caching with TTL and LRU eviction.
//!
//! Responses are keyed by a stable fingerprint of the normalized request.
//! Reads promote an entry to most-recently-used; inserting a new key into a
//! full cache evicts the least-recently-used entry. `prune` drops everything
//! past its deadline in one sweep.

use crate::request::Request;
use crate::time::{Clock, SystemClock};
use crate::transport::TransportResponse;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default entry lifetime.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(300_000);

/// Default entry capacity.
pub const DEFAULT_CACHE_MAX_SIZE: usize = 1000;

/// Header names that participate in the request fingerprint.
const FINGERPRINT_HEADERS: [&str; 2] = ["accept", "content-type"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl: DEFAULT_CACHE_TTL, max_size: DEFAULT_CACHE_MAX_SIZE }
    }
}

/// Global cache counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// Hit percentage over all lookups; zero when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64 * 100.0
        }
    }
}

/// A stored entry plus its lifetime bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub key: String,
    pub value: T,
    pub timestamp: u64,
    pub expires_at: u64,
}

/// Cached HTTP response payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub data: Value,
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
}

impl From<&TransportResponse> for CachedResponse {
    fn from(response: &TransportResponse) -> Self {
        Self {
            data: response.data.clone(),
            status: response.status,
            status_text: response.status_text.clone(),
            headers: response.headers.clone(),
        }
    }
}

/// Persisted cache state: entries in access order (least-recent first) plus
/// counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot<T> {
    pub entries: Vec<CacheEntry<T>>,
    pub stats: CacheStats,
}

struct CacheCore<T> {
    entries: HashMap<String, CacheEntry<T>>,
    /// Access order, least-recently-used first.
    order: Vec<String>,
    stats: CacheStats,
}

/// Generic TTL + LRU store shared by [`CacheManager`] and
/// [`FunctionCacheManager`]. Cloning shares state.
#[derive(Clone)]
pub struct TtlLruCache<T> {
    core: Arc<Mutex<CacheCore<T>>>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl<T: Clone + Send + 'static> TtlLruCache<T> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            core: Arc::new(Mutex::new(CacheCore {
                entries: HashMap::new(),
                order: Vec::new(),
                stats: CacheStats::default(),
            })),
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Override the clock (deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// Fetch and promote. Expired entries count as misses and are removed.
    pub fn get(&self, key: &str) -> Option<CacheEntry<T>> {
        let mut core = self.lock();
        let now = self.clock.now_millis();
        match core.entries.get(key) {
            Some(entry) if entry.expires_at > now => {
                let entry = entry.clone();
                core.stats.hits += 1;
                promote(&mut core.order, key);
                Some(entry)
            }
            Some(_) => {
                core.entries.remove(key);
                core.order.retain(|k| k != key);
                core.stats.expirations += 1;
                core.stats.misses += 1;
                None
            }
            None => {
                core.stats.misses += 1;
                None
            }
        }
    }

    /// Insert or refresh. A new key into a full cache evicts the
    /// least-recently-used entry first.
    pub fn set(&self, key: impl Into<String>, value: T) {
        let key = key.into();
        let mut core = self.lock();
        let now = self.clock.now_millis();

        if !core.entries.contains_key(&key) && core.entries.len() >= self.config.max_size {
            if let Some(victim) = core.order.first().cloned() {
                core.entries.remove(&victim);
                core.order.retain(|k| k != &victim);
                core.stats.evictions += 1;
                tracing::debug!(key = %victim, "cache evicted least-recently-used entry");
            }
        }

        let entry = CacheEntry {
            key: key.clone(),
            value,
            timestamp: now,
            expires_at: now + self.config.ttl.as_millis() as u64,
        };
        core.entries.insert(key.clone(), entry);
        promote(&mut core.order, &key);
        core.stats.sets += 1;
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut core = self.lock();
        let removed = core.entries.remove(key).is_some();
        if removed {
            core.order.retain(|k| k != key);
        }
        removed
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut core = self.lock();
        let now = self.clock.now_millis();
        let expired: Vec<String> = core
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            core.entries.remove(key);
            core.order.retain(|k| k != key);
        }
        core.stats.expirations += expired.len() as u64;
        expired.len()
    }

    pub fn clear(&self) {
        let mut core = self.lock();
        core.entries.clear();
        core.order.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheCore<T>> {
        self.core.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Clone + Send + Serialize + DeserializeOwned + 'static> TtlLruCache<T> {
    pub fn snapshot(&self) -> CacheSnapshot<T> {
        let core = self.lock();
        let entries = core
            .order
            .iter()
            .filter_map(|key| core.entries.get(key).cloned())
            .collect();
        CacheSnapshot { entries, stats: core.stats.clone() }
    }

    pub fn restore(&self, snapshot: CacheSnapshot<T>) {
        let mut core = self.lock();
        core.entries.clear();
        core.order.clear();
        for entry in snapshot.entries {
            core.order.push(entry.key.clone());
            core.entries.insert(entry.key.clone(), entry);
        }
        core.stats = snapshot.stats;
    }
}

/// Response cache keyed by request fingerprints.
pub type CacheManager = TtlLruCache<CachedResponse>;

/// Result cache for gateway functions, keyed by caller-supplied keys.
pub type FunctionCacheManager = TtlLruCache<Value>;

/// Move `key` to the most-recently-used end.
fn promote(order: &mut Vec<String>, key: &str) {
    order.retain(|k| k != key);
    order.push(key.to_string());
}

/// Stable fingerprint of a normalized request.
///
/// Covers method, protocol, authority, path, sorted query, a fixed header
/// subset and a hash of the body. Two requests with the same fingerprint are
/// interchangeable for caching.
pub fn request_fingerprint(request: &Request) -> String {
    let port = request.port.unwrap_or_else(|| request.protocol.default_port());
    let query: Vec<String> =
        request.query.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    let mut header_parts: Vec<String> = Vec::new();
    for name in FINGERPRINT_HEADERS {
        if let Some((_, value)) =
            request.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            header_parts.push(format!("{}={}", name, value));
        }
    }
    let body_hash = match &request.body {
        Some(body) => fnv1a64(serde_json::to_string(body).unwrap_or_default().as_bytes()),
        None => 0,
    };
    format!(
        "{}|{}|{}|{}|{}|{}|{}|{:016x}",
        request.method.as_str(),
        request.protocol.as_str(),
        request.hostname,
        port,
        request.path,
        query.join("&"),
        header_parts.join(";"),
        body_hash
    )
}

/// FNV-1a, fixed offset basis so fingerprints survive restarts.
fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
