use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default time-to-live for cached responses.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

struct CacheEntry {
    stored_at: Instant,
    body: Vec<u8>,
}

/// Cache of raw upstream response bytes, keyed by `host:port`.
///
/// The key deliberately ignores path, method, and query string: all plain
/// HTTP requests to the same origin share one slot. Entries expire after a
/// fixed TTL; an entry read as expired is evicted before the miss is
/// reported, so a subsequent store always replaces it wholesale.
pub struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(host: &str, port: u16) -> String {
        format!("{host}:{port}")
    }

    /// Returns a copy of the cached body while it is still live. Expired
    /// entries are evicted on the way out.
    pub fn lookup(&self, key: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => Some(entry.body.clone()),
            Some(_) => {
                debug!("cache expired for {key}, evicting");
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Unconditionally overwrites any previous entry for the key.
    pub fn store(&self, key: String, body: Vec<u8>) {
        self.entries.lock().insert(
            key,
            CacheEntry {
                stored_at: Instant::now(),
                body,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
