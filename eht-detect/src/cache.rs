//! Session cache: session id → decoded volume
//!
//! Entries are rebuilt on demand from durable session metadata, so the cache
//! is never the source of truth. Population follows an explicit two-step
//! protocol: [`SessionCache::lookup`] never does I/O, while
//! [`SessionCache::materialize`] takes the session's gate, re-checks, and
//! only then runs the loader. Loader failures are not cached.
//!
//! Each session also owns a gate (an async mutex) that serializes cache
//! population, classification writes and mask writes for that session.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use eht_common::Result;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

use crate::volume::Volume;

/// A cached volume, shared between readers and the mask editor
pub type SharedVolume = Arc<RwLock<Volume>>;

/// Process-wide cache of decoded volumes keyed by session id
///
/// No capacity bound or TTL: entries live until the session is deleted.
#[derive(Default)]
pub struct SessionCache {
    volumes: RwLock<HashMap<i64, SharedVolume>>,
    gates: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached volume for a session, if present
    pub async fn lookup(&self, session_id: i64) -> Option<SharedVolume> {
        self.volumes.read().await.get(&session_id).cloned()
    }

    /// Acquire the per-session gate
    pub async fn lock(&self, session_id: i64) -> OwnedMutexGuard<()> {
        let gate = {
            let mut gates = self.gates.lock().await;
            gates.entry(session_id).or_default().clone()
        };
        gate.lock_owned().await
    }

    /// Return the cached volume, loading it under the session gate on a miss
    ///
    /// Concurrent callers for the same session wait on the gate and then
    /// observe the volume installed by whichever caller loaded it first.
    pub async fn materialize<F, Fut>(&self, session_id: i64, load: F) -> Result<SharedVolume>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Volume>>,
    {
        if let Some(volume) = self.lookup(session_id).await {
            debug!(session_id, "Session cache hit");
            return Ok(volume);
        }

        let _gate = self.lock(session_id).await;
        if let Some(volume) = self.lookup(session_id).await {
            debug!(session_id, "Session cache populated while waiting");
            return Ok(volume);
        }

        info!(session_id, "Session cache miss, rebuilding volume");
        let volume = load().await?;
        Ok(self.insert(session_id, volume).await)
    }

    /// Install a freshly loaded volume, replacing any previous entry
    pub async fn insert(&self, session_id: i64, volume: Volume) -> SharedVolume {
        let shared = Arc::new(RwLock::new(volume));
        self.volumes
            .write()
            .await
            .insert(session_id, Arc::clone(&shared));
        shared
    }

    /// Drop a session's volume; returns whether an entry existed
    ///
    /// The session gate stays in place so callers already queued on it keep
    /// serializing against the same mutex.
    pub async fn evict(&self, session_id: i64) -> bool {
        let removed = self.volumes.write().await.remove(&session_id).is_some();
        if removed {
            info!(session_id, "Evicted session volume");
        }
        removed
    }

    /// Forget a session's gate once nobody holds or waits on it
    ///
    /// Returns whether the gate was removed.
    pub async fn release_gate(&self, session_id: i64) -> bool {
        let mut gates = self.gates.lock().await;
        match gates.get(&session_id) {
            Some(gate) if Arc::strong_count(gate) == 1 => {
                gates.remove(&session_id);
                true
            }
            _ => false,
        }
    }

    /// Number of cached volumes
    pub async fn len(&self) -> usize {
        self.volumes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.volumes.read().await.is_empty()
    }
}
