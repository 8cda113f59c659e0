//! Content-addressed cache for rendered images
//!
//! Entries are keyed by a [`Fingerprint`] of the request, expire after a
//! fixed lifetime, and are bounded in number. When the store is full the
//! oldest-inserted entry is evicted, so the cache stays bounded even if
//! [`CacheStore::sweep_expired`] is never called.

use crate::{truncate_chars, Config, RenderKind, ResolvedOptions};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Number of content characters folded into a fingerprint.
///
/// Requests that differ only after this prefix share a fingerprint.
pub const FINGERPRINT_CONTENT_LIMIT: usize = 1000;

/// Canonical identity of a render request for caching purposes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

#[derive(Serialize)]
struct FingerprintKey<'a> {
    #[serde(rename = "type")]
    kind: RenderKind,
    content: &'a str,
    options: FingerprintOptions<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FingerprintOptions<'a> {
    width: u32,
    height: u32,
    device_scale_factor: f64,
    timeout: u64,
    full_page: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    selector: Option<&'a str>,
}

impl Fingerprint {
    /// Derive the fingerprint for a request.
    ///
    /// The result is a JSON document of the kind, the first
    /// [`FINGERPRINT_CONTENT_LIMIT`] characters of the content, and the
    /// resolved options.
    pub fn compute(kind: RenderKind, content: &str, options: &ResolvedOptions) -> Self {
        let content = truncate_chars(content, FINGERPRINT_CONTENT_LIMIT);
        let key = FingerprintKey {
            kind,
            content,
            options: FingerprintOptions {
                width: options.viewport.width,
                height: options.viewport.height,
                device_scale_factor: options.viewport.device_scale_factor,
                timeout: options.timeout.as_millis() as u64,
                full_page: options.full_page,
                selector: options.selector.as_deref(),
            },
        };

        match serde_json::to_string(&key) {
            Ok(json) => Self(json),
            Err(e) => {
                warn!("Falling back to debug fingerprint: {}", e);
                Self(format!("{kind:?}|{content}|{options:?}"))
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cache behaviour knobs
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    pub enabled: bool,
    pub expiry: Duration,
    pub capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            expiry: Duration::from_secs(300),
            capacity: 100,
        }
    }
}

impl From<&Config> for CacheSettings {
    fn from(config: &Config) -> Self {
        Self {
            enabled: config.cache_enabled,
            expiry: config.cache_expiry(),
            capacity: config.cache_capacity,
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    data: Arc<[u8]>,
    created_at: Instant,
}

#[derive(Debug)]
struct CacheInner {
    entries: HashMap<Fingerprint, CacheEntry>,
    /// Insertion order, oldest first. Holds exactly the keys of `entries`.
    order: VecDeque<Fingerprint>,
    settings: CacheSettings,
}

impl CacheInner {
    fn remove(&mut self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        let entry = self.entries.remove(fingerprint)?;
        if let Some(pos) = self.order.iter().position(|key| key == fingerprint) {
            self.order.remove(pos);
        }
        Some(entry)
    }

    fn evict_oldest(&mut self) {
        if let Some(oldest) = self.order.pop_front() {
            self.entries.remove(&oldest);
            debug!("Evicted oldest cache entry ({} remaining)", self.entries.len());
        }
    }

    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.duration_since(entry.created_at) > self.settings.expiry
    }
}

/// Bounded, expiring image cache shared by every render
#[derive(Debug)]
pub struct CacheStore {
    inner: Mutex<CacheInner>,
}

impl CacheStore {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                settings,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fetch a live entry, dropping it if it has expired.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<Arc<[u8]>> {
        let mut inner = self.lock();
        if !inner.settings.enabled {
            return None;
        }

        let now = Instant::now();
        match inner.entries.get(fingerprint) {
            None => return None,
            Some(entry) if !inner.is_expired(entry, now) => return Some(entry.data.clone()),
            Some(_) => {}
        }

        inner.remove(fingerprint);
        debug!("Dropped expired cache entry on lookup");
        None
    }

    /// Insert or overwrite an entry, evicting the oldest one if full.
    pub fn store(&self, fingerprint: Fingerprint, data: Arc<[u8]>) {
        let mut inner = self.lock();
        if !inner.settings.enabled {
            return;
        }

        if inner.remove(&fingerprint).is_none() {
            while inner.entries.len() >= inner.settings.capacity.max(1) {
                inner.evict_oldest();
            }
        }

        inner.order.push_back(fingerprint.clone());
        inner.entries.insert(
            fingerprint,
            CacheEntry {
                data,
                created_at: Instant::now(),
            },
        );
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Remove every expired entry; returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let mut inner = self.lock();
        let now = Instant::now();
        let before = inner.entries.len();

        let expiry = inner.settings.expiry;
        inner
            .entries
            .retain(|_, entry| now.duration_since(entry.created_at) <= expiry);
        let CacheInner { entries, order, .. } = &mut *inner;
        order.retain(|key| entries.contains_key(key));

        let removed = before - inner.entries.len();
        if removed > 0 {
            debug!("Swept {} expired cache entries", removed);
        }
        removed
    }

    pub fn size(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn settings(&self) -> CacheSettings {
        self.lock().settings.clone()
    }

    /// Apply new settings in place, trimming down to a smaller capacity.
    ///
    /// Disabling the cache drops every entry.
    pub fn reconfigure(&self, settings: CacheSettings) {
        let mut inner = self.lock();
        inner.settings = settings;
        if !inner.settings.enabled {
            inner.entries.clear();
            inner.order.clear();
            debug!("Cache disabled, entries dropped");
            return;
        }
        while inner.entries.len() > inner.settings.capacity.max(1) {
            inner.evict_oldest();
        }
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new(CacheSettings::default())
    }
}
