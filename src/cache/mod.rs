//! Snapshot Cache: node-keyed, versioned xDS snapshots with watch streams.
//!
//! Each node key holds the latest snapshot and a bounded broadcast channel.
//! `set` assigns a strictly increasing version per key and wakes watchers;
//! `clear` ends watcher streams. A watcher that falls behind the channel
//! depth is disconnected with an error rather than silently skipping
//! versions.

pub mod snapshot;

pub use snapshot::EnvoySnapshot;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::core::resource::ResourceKey;
use crate::errors::{Error, Result};

/// Channel depth per key; a watcher lagging behind this many updates is
/// disconnected.
const WATCH_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Clone)]
enum SnapshotEvent {
    Updated(Arc<EnvoySnapshot>),
    Cleared,
}

struct CacheEntry {
    snapshot: Arc<EnvoySnapshot>,
    version: u64,
    events: broadcast::Sender<SnapshotEvent>,
}

/// Keyed store of versioned xDS snapshots.
pub struct SnapshotCache {
    entries: RwLock<HashMap<ResourceKey, CacheEntry>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()) }
    }

    /// Atomically replace the snapshot under `key`, assigning a fresh version
    /// greater than any previous one. Returns the assigned version.
    pub async fn set(&self, key: &ResourceKey, mut snapshot: EnvoySnapshot) -> u64 {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.clone()).or_insert_with(|| {
            let (events, _) = broadcast::channel(WATCH_CHANNEL_DEPTH);
            CacheEntry { snapshot: Arc::new(EnvoySnapshot::default()), version: 0, events }
        });
        entry.version += 1;
        snapshot.version = entry.version;
        let shared = Arc::new(snapshot);
        entry.snapshot = shared.clone();
        let _ = entry.events.send(SnapshotEvent::Updated(shared));
        debug!(key = %key, version = entry.version, "Snapshot published");
        entry.version
    }

    /// Latest snapshot for `key`, if any.
    pub async fn get(&self, key: &ResourceKey) -> Option<Arc<EnvoySnapshot>> {
        let entries = self.entries.read().await;
        entries.get(key).map(|e| e.snapshot.clone())
    }

    /// Remove the entry and signal end-of-stream to watchers.
    pub async fn clear(&self, key: &ResourceKey) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.remove(key) {
            let _ = entry.events.send(SnapshotEvent::Cleared);
            debug!(key = %key, "Snapshot cleared");
        }
    }

    /// Watch `key`: yields the current snapshot, then each subsequent `set`.
    /// A key with no entry yields end-of-stream immediately.
    pub async fn watch(&self, key: &ResourceKey) -> SnapshotWatch {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) => SnapshotWatch {
                current: Some(entry.snapshot.clone()),
                events: Some(entry.events.subscribe()),
            },
            None => SnapshotWatch { current: None, events: None },
        }
    }

    pub async fn keys(&self) -> Vec<ResourceKey> {
        let entries = self.entries.read().await;
        entries.keys().cloned().collect()
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Cursor over one key's snapshot sequence.
pub struct SnapshotWatch {
    current: Option<Arc<EnvoySnapshot>>,
    events: Option<broadcast::Receiver<SnapshotEvent>>,
}

impl SnapshotWatch {
    /// Next snapshot. `Ok(None)` is end-of-stream (key cleared or never
    /// present); `Err` means this watcher lagged and was disconnected.
    pub async fn next(&mut self) -> Result<Option<Arc<EnvoySnapshot>>> {
        if let Some(current) = self.current.take() {
            return Ok(Some(current));
        }
        let Some(events) = self.events.as_mut() else {
            return Ok(None);
        };
        match events.recv().await {
            Ok(SnapshotEvent::Updated(snapshot)) => Ok(Some(snapshot)),
            Ok(SnapshotEvent::Cleared) | Err(broadcast::error::RecvError::Closed) => {
                self.events = None;
                Ok(None)
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                self.events = None;
                Err(Error::internal(format!("snapshot watcher lagged by {} updates", missed)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envoy_types::pb::google::protobuf::Any;

    fn key() -> ResourceKey {
        ResourceKey::new("default", "backend-1")
    }

    fn snapshot_with_cluster(name: &str) -> EnvoySnapshot {
        let mut snap = EnvoySnapshot::default();
        snap.clusters
            .insert(name.into(), Any { type_url: "cluster".into(), value: vec![1, 2, 3] });
        snap
    }

    #[tokio::test]
    async fn versions_are_strictly_increasing_per_key() {
        let cache = SnapshotCache::new();
        let v1 = cache.set(&key(), snapshot_with_cluster("a")).await;
        let v2 = cache.set(&key(), snapshot_with_cluster("b")).await;
        let v3 = cache.set(&key(), snapshot_with_cluster("c")).await;
        assert!(v1 < v2 && v2 < v3);

        let other = ResourceKey::new("default", "backend-2");
        assert_eq!(cache.set(&other, snapshot_with_cluster("x")).await, 1);
    }

    #[tokio::test]
    async fn watch_yields_current_then_updates_monotonically() {
        let cache = SnapshotCache::new();
        cache.set(&key(), snapshot_with_cluster("a")).await;

        let mut watch = cache.watch(&key()).await;
        let first = watch.next().await.unwrap().unwrap();
        assert_eq!(first.version, 1);

        cache.set(&key(), snapshot_with_cluster("b")).await;
        cache.set(&key(), snapshot_with_cluster("c")).await;

        let second = watch.next().await.unwrap().unwrap();
        let third = watch.next().await.unwrap().unwrap();
        assert!(first.version < second.version);
        assert!(second.version < third.version);
    }

    #[tokio::test]
    async fn clear_ends_watch_streams() {
        let cache = SnapshotCache::new();
        cache.set(&key(), snapshot_with_cluster("a")).await;

        let mut watch = cache.watch(&key()).await;
        watch.next().await.unwrap().unwrap();

        cache.clear(&key()).await;
        assert!(watch.next().await.unwrap().is_none());

        // A watch opened after the clear sees end-of-stream immediately.
        let mut late = cache.watch(&key()).await;
        assert!(late.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lagging_watcher_is_disconnected_not_skipped() {
        let cache = SnapshotCache::new();
        cache.set(&key(), snapshot_with_cluster("seed")).await;
        let mut watch = cache.watch(&key()).await;
        watch.next().await.unwrap().unwrap();

        for i in 0..(WATCH_CHANNEL_DEPTH * 2) {
            cache.set(&key(), snapshot_with_cluster(&format!("c{}", i))).await;
        }

        // The watcher fell behind the bounded channel: it must observe an
        // error rather than a silently gappy sequence.
        let mut saw_error = false;
        for _ in 0..(WATCH_CHANNEL_DEPTH * 2 + 1) {
            match watch.next().await {
                Err(_) => {
                    saw_error = true;
                    break;
                }
                Ok(Some(_)) => continue,
                Ok(None) => break,
            }
        }
        assert!(saw_error);
    }
}
