use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

/// Minimal key-value cache surface the store wrappers are written against.
///
/// The bundled implementation is in-process; a networked cache (Redis etc.)
/// plugs in behind the same trait. Store wrappers decide whether a backend
/// error surfaces or falls through, so this trait never swallows errors.
pub trait KvCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
    fn delete(&self, key: &str) -> Result<(), CacheError>;
    /// Delete every key under a prefix. Invalidation granularity is always a
    /// whole prefix (tenant or tenant+agent).
    fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError>;
}

/// In-process cache with per-entry expiry. Expired entries are dropped lazily
/// on read and swept opportunistically on write.
pub struct InMemoryKvCache {
    entries: DashMap<String, (String, Instant)>,
}

impl InMemoryKvCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InMemoryKvCache {
    fn default() -> Self {
        Self::new()
    }
}

impl KvCache for InMemoryKvCache {
    fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        if let Some(entry) = self.entries.get(key) {
            let (value, expires_at) = entry.value();
            if Instant::now() < *expires_at {
                return Ok(Some(value.clone()));
            }
        }
        // Lazy expiry: remove on miss-after-expiry.
        self.entries
            .remove_if(key, |_, (_, expires_at)| Instant::now() >= *expires_at);
        Ok(None)
    }

    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        let n = keys.len();
        for key in keys {
            self.entries.remove(&key);
        }
        Ok(n)
    }
}
