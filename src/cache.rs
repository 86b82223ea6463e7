use bytes::Bytes;
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc::{RecvTimeoutError, Sender, channel};
use std::thread;
use std::time::{Duration, Instant};

const COMPACTION_INTERVAL: Duration = Duration::from_secs(300);

/// One cached upstream response. Body and headers are owned copies, never
/// aliases of a live response.
#[derive(Clone)]
pub struct CacheEntry {
    pub body: Bytes,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    inserted: Instant,
    expiry: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        !self.expiry.is_zero() && self.inserted.elapsed() > self.expiry
    }
}

/// Bounded in-memory cache of upstream responses, keyed by request
/// fingerprint. Expired entries are ignored by `lookup` and removed by the
/// periodic compaction pass; when full, the oldest insertion is evicted.
pub struct ResponseCache {
    items: RwLock<HashMap<String, CacheEntry>>,
    max_size: usize,
    shutdown: Mutex<Option<Sender<()>>>,
}

impl ResponseCache {
    pub fn new(max_size: usize) -> Arc<Self> {
        let (tx, rx) = channel::<()>();
        let cache = Arc::new(Self {
            items: RwLock::new(HashMap::new()),
            max_size,
            shutdown: Mutex::new(Some(tx)),
        });

        let worker = cache.clone();
        thread::spawn(move || {
            loop {
                match rx.recv_timeout(COMPACTION_INTERVAL) {
                    Err(RecvTimeoutError::Timeout) => worker.compact(),
                    _ => break,
                }
            }
        });

        cache
    }

    pub fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let items = self.items.read();
        let entry = items.get(key)?;
        if entry.is_expired() {
            debug!("expired cache entry for {}", key);
            return None;
        }
        Some(entry.clone())
    }

    pub fn store(
        &self,
        key: String,
        body: Bytes,
        status: u16,
        headers: Vec<(String, String)>,
        expiry: Duration,
    ) {
        if expiry.is_zero() {
            return;
        }

        let mut items = self.items.write();
        if items.len() >= self.max_size && !items.contains_key(&key) {
            Self::evict_oldest(&mut items);
        }
        items.insert(
            key,
            CacheEntry {
                body,
                status,
                headers,
                inserted: Instant::now(),
                expiry,
            },
        );
    }

    fn evict_oldest(items: &mut HashMap<String, CacheEntry>) {
        let oldest = items
            .iter()
            .min_by_key(|(_, entry)| entry.inserted)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            debug!("evicting oldest cache entry {}", key);
            items.remove(&key);
        }
    }

    /// Drops every expired entry. Runs on the compaction thread and is also
    /// callable directly.
    pub fn compact(&self) {
        self.items.write().retain(|_, entry| !entry.is_expired());
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Stops the compaction thread. Safe to call more than once.
    pub fn close(&self) {
        let _ = self.shutdown.lock().take();
    }
}

/// Cache key for a request: method, host and full request-target.
pub fn fingerprint(method: &str, host: &str, path_and_query: &str) -> String {
    format!("{}:{}{}", method, host, path_and_query)
}

/// Only GET requests without credentials are ever served from or written to
/// the cache.
pub fn is_cacheable_request(method: &str, has_authorization: bool) -> bool {
    method == "GET" && !has_authorization
}

/// Only successful responses are stored.
pub fn is_cacheable_response(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Picks the entry lifetime from the upstream `Cache-Control` header,
/// capped by the host's configured TTL. `no-store`/`no-cache` disable
/// caching for this response; absence of the header yields the host TTL.
pub fn cache_duration(cache_control: Option<&str>, host_ttl: Duration) -> Duration {
    let Some(cache_control) = cache_control else {
        return host_ttl;
    };

    if cache_control.contains("no-store") || cache_control.contains("no-cache") {
        return Duration::ZERO;
    }

    if let Some(rest) = cache_control.split("max-age=").nth(1) {
        let seconds = rest.split(',').next().unwrap_or("").trim();
        if let Ok(seconds) = seconds.parse::<u64>()
            && seconds > 0
        {
            return Duration::from_secs(seconds).min(host_ttl);
        }
    }

    host_ttl
}
