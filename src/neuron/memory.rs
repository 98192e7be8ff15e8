use core::fmt;
use std::{future::Future, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use hashbrown::HashMap;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, warn};

use super::net::wire::{MessageId, Tensor};

/// Everything one forward pass left behind, kept until the matching
/// backward pass and learn step consume it.
pub struct Buffer {
    /// Who called us.
    pub sender_id: String,
    /// The activation they sent.
    pub uspikes: Tensor,
    /// The k downstream responses, slot-ordered, zero-filled where a peer
    /// did not answer.
    pub dspikes: Vec<Tensor>,
    /// Our own output, what the caller received.
    pub lspikes: Tensor,
}

/// One cache slot. `state` is written exactly once by the winning forward
/// pass, `lgrads` exactly once by the winning backward pass.
pub struct Entry {
    created_at: DateTime<Utc>,
    state: OnceCell<Buffer>,
    lgrads: OnceCell<Tensor>,
}

impl Entry {
    fn new() -> Self {
        Self {
            created_at: Utc::now(),
            state: OnceCell::new(),
            lgrads: OnceCell::new(),
        }
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        self.state.get()
    }

    pub fn graded(&self) -> bool {
        self.lgrads.initialized()
    }

    /// Runs `init` to produce the local gradient unless a previous call
    /// already did. Losers of the race wait for the winner and observe its
    /// value; a failed winner leaves the cell empty so a later call can
    /// retry.
    pub async fn grade_once<F, Fut, E>(&self, init: F) -> Result<&Tensor, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Tensor, E>>,
    {
        self.lgrads.get_or_try_init(init).await
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub applied: usize,
    pub failed: usize,
    pub expired: usize,
}

/// The per-message result cache. One entry per message id, bounded by
/// `max_entries` and aged out after `entry_ttl`.
pub struct Memory {
    entries: RwLock<HashMap<MessageId, Arc<Entry>>>,
    max_entries: usize,
    entry_ttl: Duration,
}

impl Memory {
    pub fn new(max_entries: usize, entry_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries,
            entry_ttl,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns the slot for `id`, inserting an empty one if needed. At
    /// capacity the oldest entry that never received a grade is evicted to
    /// make room; fully graded entries are left for the next sweep.
    async fn slot(&self, id: MessageId) -> Arc<Entry> {
        let mut map = self.entries.write().await;
        if !map.contains_key(&id) && map.len() >= self.max_entries {
            let victim = map
                .iter()
                .filter(|(_, e)| !e.graded())
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| *k);
            if let Some(k) = victim {
                map.remove(&k);
                warn!(evicted = %k, "cache full, dropping oldest ungraded entry");
            }
        }
        map.entry(id).or_insert_with(|| Arc::new(Entry::new())).clone()
    }

    /// The idempotent forward path: at most one `factory` run per id.
    /// Concurrent callers for the same id wait on the winner and all
    /// receive the cached output. A failing factory leaves no entry behind.
    pub async fn get_or_init<F, Fut, E>(
        &self,
        id: MessageId,
        factory: F,
    ) -> Result<Tensor, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Buffer, E>>,
    {
        let entry = self.slot(id).await;
        match entry.state.get_or_try_init(factory).await {
            Ok(buffer) => Ok(buffer.lspikes.clone()),
            Err(e) => {
                let mut map = self.entries.write().await;
                if let Some(current) = map.get(&id) {
                    if Arc::ptr_eq(current, &entry)
                        && current.buffer().is_none()
                    {
                        map.remove(&id);
                    }
                }
                Err(e)
            }
        }
    }

    /// Looks up an entry whose forward pass has completed. In-flight and
    /// unknown ids both come back `None`, so a backward pass never observes
    /// a half-built buffer.
    pub async fn find(&self, id: &MessageId) -> Option<Arc<Entry>> {
        self.entries
            .read()
            .await
            .get(id)
            .filter(|e| e.state.initialized())
            .cloned()
    }

    /// One consistent pass over the cache: graded entries are applied and
    /// evicted (retained when `apply` fails, for the next sweep), ungraded
    /// entries older than the TTL are expired. Holding the write lock for
    /// the duration keeps concurrent inserts out of the pass.
    pub async fn sweep<F, E>(&self, mut apply: F) -> SweepStats
    where
        F: FnMut(&Buffer, &Tensor) -> Result<(), E>,
        E: fmt::Display,
    {
        let now = Utc::now();
        let mut stats = SweepStats::default();
        let mut map = self.entries.write().await;
        map.retain(|id, entry| match (entry.buffer(), entry.lgrads.get()) {
            (Some(buffer), Some(lgrads)) => match apply(buffer, lgrads) {
                Ok(()) => {
                    debug!(id = %id, "applied local gradient, evicting");
                    stats.applied += 1;
                    false
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "apply failed, keeping entry");
                    stats.failed += 1;
                    true
                }
            },
            _ => {
                if now.signed_duration_since(entry.created_at)
                    > self.entry_ttl
                {
                    debug!(id = %id, "expiring entry that was never graded");
                    stats.expired += 1;
                    false
                } else {
                    true
                }
            }
        });
        stats
    }
}
