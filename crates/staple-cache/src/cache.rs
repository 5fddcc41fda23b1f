//! Dual-keyed response cache and its refresh monitor
//!
//! Two maps share ownership of every [`Entry`]: a one-to-one map keyed on
//! entry name, used for iteration and removal, and a many-to-one map keyed
//! on request fingerprint, used to answer lookups. An entry is indexed
//! under one fingerprint per supported hash algorithm, so the same entry
//! answers SHA-1 and SHA-256 requests alike.
//!
//! The monitor is a single background task that wakes on a fixed tick,
//! snapshots the entry set under the read lock, and spawns one refresh
//! task per entry. The cache lock is never held across a fetch, so lookups
//! stay fast no matter how slow the upstream responders are.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::entry::{Entry, ResponseSnapshot};
use crate::error::CacheError;
use crate::ocsp::RequestInfo;

#[derive(Default)]
struct CacheInner {
    /// one-to-one: name -> entry
    entries: HashMap<String, Arc<Entry>>,
    /// many-to-one: request fingerprint -> entry
    lookup_map: HashMap<[u8; 32], Arc<Entry>>,
}

/// Thread-safe index of entries, shared between the responder handler and
/// the monitor
pub struct Cache {
    inner: RwLock<CacheInner>,
}

impl Cache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(CacheInner::default()),
        })
    }

    /// Add an entry under its name and all of its fingerprints.
    ///
    /// An entry with the same name is overwritten, and its old fingerprints
    /// are dropped so the lookup map never points at an evicted entry.
    pub async fn insert(&self, entry: Entry) -> Result<(), CacheError> {
        let digests = entry.digests()?;
        let entry = Arc::new(entry);
        let mut inner = self.inner.write().await;
        if let Some(old) = inner.entries.get(entry.name()).cloned() {
            warn!(entry = %entry.name(), "overwriting existing cache entry");
            if let Ok(old_digests) = old.digests() {
                for digest in old_digests {
                    inner.lookup_map.remove(&digest);
                }
            }
        } else {
            info!(entry = %entry.name(), "adding entry to cache");
        }
        inner
            .entries
            .insert(entry.name().to_string(), Arc::clone(&entry));
        for digest in digests {
            inner.lookup_map.insert(digest, Arc::clone(&entry));
        }
        Ok(())
    }

    /// Add an entry under exactly one externally supplied fingerprint.
    ///
    /// Unlike [`Cache::insert`] a name collision does not overwrite, it
    /// logs and leaves the cache untouched.
    pub async fn insert_single(&self, entry: Entry, digest: [u8; 32]) {
        let entry = Arc::new(entry);
        let mut inner = self.inner.write().await;
        if inner.entries.contains_key(entry.name()) {
            warn!(entry = %entry.name(), "entry already exists in cache");
            return;
        }
        info!(entry = %entry.name(), "adding entry to cache");
        inner
            .entries
            .insert(entry.name().to_string(), Arc::clone(&entry));
        inner.lookup_map.insert(digest, entry);
    }

    /// Remove an entry and every fingerprint pointing at it
    pub async fn remove(&self, name: &str) -> Result<(), CacheError> {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.entries.get(name).cloned() else {
            return Err(CacheError::NotFound(name.to_string()));
        };
        // hold the entry exclusively so an in-flight refresh cannot publish
        // into an entry the index no longer reaches
        let _state = entry.write_guard().await;
        inner.entries.remove(name);
        let digests = entry.digests()?;
        for digest in digests {
            inner.lookup_map.remove(&digest);
        }
        info!(entry = %name, "removed entry from cache");
        Ok(())
    }

    /// Find the entry answering `request`, if any
    pub async fn lookup(&self, request: &RequestInfo) -> Option<Arc<Entry>> {
        let digest = request.digest();
        let inner = self.inner.read().await;
        inner.lookup_map.get(&digest).cloned()
    }

    /// Current response for `request`; an entry that has not loaded a
    /// response yet counts as absent
    pub async fn lookup_response(&self, request: &RequestInfo) -> Option<ResponseSnapshot> {
        let entry = self.lookup(request).await?;
        entry.snapshot().await
    }

    /// Number of named entries
    pub async fn entry_count(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    /// Number of fingerprints in the lookup map
    pub async fn digest_count(&self) -> usize {
        self.inner.read().await.lookup_map.len()
    }

    async fn entries_snapshot(&self) -> Vec<Arc<Entry>> {
        self.inner.read().await.entries.values().cloned().collect()
    }
}

/// Start the background monitor: every `tick`, schedule a refresh for each
/// entry on its own task. Refresh failures are logged per entry and never
/// stop the monitor.
pub fn spawn_monitor(cache: Arc<Cache>, tick: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick of a tokio interval fires immediately, the
        // monitor cadence starts one period from now
        interval.tick().await;
        loop {
            interval.tick().await;
            let entries = cache.entries_snapshot().await;
            debug!(entries = entries.len(), "monitor tick");
            for entry in entries {
                tokio::spawn(async move {
                    entry.refresh_and_log().await;
                });
            }
        }
    })
}
