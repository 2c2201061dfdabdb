//! Tool result caching.
//!
//! Avoids re-executing identical tool calls. Outcomes (successes and
//! failures alike) are keyed by the tool name plus a canonical rendering of
//! the arguments, so `{"a":1,"b":2}` and `{"b":2,"a":1}` share an entry.
//! Entries older than the TTL read as misses; when the cache is full the
//! oldest entry is evicted before inserting.
//!
//! The map sits behind an `RwLock` (many concurrent readers, one writer);
//! hit/miss counters are atomics so lookups only need the read lock.

use crate::{Arguments, ToolError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

/// Default entry lifetime.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Default maximum number of entries.
pub const DEFAULT_CACHE_ENTRIES: usize = 1000;

/// Cache sizing.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Entry lifetime. `Duration::ZERO` disables expiry.
    pub ttl: Duration,
    /// Maximum entries before the oldest is evicted. `0` disables storage.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_CACHE_TTL,
            max_entries: DEFAULT_CACHE_ENTRIES,
        }
    }
}

impl CacheConfig {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }
}

/// A stored outcome.
#[derive(Debug, Clone)]
struct CacheEntry {
    /// Canonical arguments, compared on lookup so a hash collision is a miss.
    canonical: String,
    outcome: Result<Value, ToolError>,
    inserted_at: Instant,
}

/// Content-addressed memo of tool outcomes.
#[derive(Debug)]
pub struct ResultCache {
    entries: RwLock<HashMap<(String, u64), CacheEntry>>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a stored outcome. Returns `None` for absent and expired
    /// entries alike. Expired entries stay in place until overwritten,
    /// evicted, or purged.
    pub fn get(&self, tool_name: &str, args: &Arguments) -> Option<Result<Value, ToolError>> {
        let canonical = canonical_json(args);
        let key = (tool_name.to_string(), hash_key(tool_name, &canonical));
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let found = entries
            .get(&key)
            .filter(|e| e.canonical == canonical && !self.is_expired(e))
            .map(|e| e.outcome.clone());
        drop(entries);

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!("Cache hit for {tool_name}");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Store an outcome. At capacity, the single oldest entry is evicted
    /// first (unless this call overwrites an existing key).
    pub fn set(&self, tool_name: &str, args: &Arguments, outcome: Result<Value, ToolError>) {
        if self.config.max_entries == 0 {
            return;
        }
        let canonical = canonical_json(args);
        let key = (tool_name.to_string(), hash_key(tool_name, &canonical));
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if !entries.contains_key(&key) && entries.len() >= self.config.max_entries {
            evict_oldest(&mut entries);
        }
        entries.insert(
            key,
            CacheEntry {
                canonical,
                outcome,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Drop entries whose TTL has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, e| !self.is_expired(e));
        before - entries.len()
    }

    /// `(hits, misses)`.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    /// Hit rate as a fraction (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let (hits, misses) = self.stats();
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub(crate) fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        !self.config.ttl.is_zero() && entry.inserted_at.elapsed() > self.config.ttl
    }
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

/// Evict the entry with the earliest insertion time.
fn evict_oldest(entries: &mut HashMap<(String, u64), CacheEntry>) {
    if let Some(oldest_key) = entries
        .iter()
        .min_by_key(|(_, v)| v.inserted_at)
        .map(|(k, _)| k.clone())
    {
        entries.remove(&oldest_key);
    }
}

/// Render arguments with object keys sorted at every depth.
pub fn canonical_json(args: &Arguments) -> String {
    let mut out = String::new();
    write_canonical_object(args, &mut out);
    out
}

fn write_canonical_object(map: &Arguments, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_canonical(&map[key], out);
    }
    out.push('}');
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_canonical_object(map, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// FNV-1a over the tool name, a NUL separator, and the canonical arguments.
fn hash_key(tool_name: &str, canonical: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    let bytes = tool_name
        .as_bytes()
        .iter()
        .chain(std::iter::once(&0u8))
        .chain(canonical.as_bytes());
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
