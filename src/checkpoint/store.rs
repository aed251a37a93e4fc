//! Checkpoint store: bounded cache, WAL, asynchronous persistence
//!
//! `create_checkpoint` stays off the blocking path of the caller: the
//! snapshot lands in the in-memory cache and the write-ahead log, and durable
//! persistence happens under one of three policies (immediate, lazy,
//! batched). Exactly one background drain worker runs per store; it starts
//! when the first item needs draining and exits once the pending set is
//! empty.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use super::storage::{CheckpointStorage, StorageError};
use super::wal::WriteAheadLog;
use crate::reliability::RetryPolicy;

/// An immutable point-in-time snapshot
///
/// Checkpoints are write-once: re-creating an existing `(context, id)` pair
/// is rejected. The `state` and `metadata` are opaque to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint id, unique within its context
    pub id: String,

    /// Owning context
    pub context_id: String,

    /// Opaque snapshot payload
    pub state: serde_json::Value,

    /// Opaque caller metadata
    pub metadata: serde_json::Value,

    /// When the checkpoint was created
    pub created_at: DateTime<Utc>,

    /// Whether the checkpoint has reached durable storage
    pub persisted: bool,
}

/// Error type for checkpoint operations
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Checkpoint missing from both cache and storage
    #[error("checkpoint not found: {context}/{id}")]
    NotFound { context: String, id: String },

    /// Write-once violation: the (context, id) pair already exists
    #[error("checkpoint already exists: {context}/{id}")]
    AlreadyExists { context: String, id: String },

    /// Storage backend error on the synchronous path
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Write-ahead log failure; the create cannot be acknowledged
    #[error("write-ahead log error: {0}")]
    Wal(#[source] std::io::Error),
}

/// When durable persistence happens relative to `create_checkpoint`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistencePolicy {
    /// Persist before returning. Slow but strongly durable.
    Immediate,

    /// Hand off to the background drain worker. Fast, eventually durable.
    Lazy,

    /// Accumulate up to `max_items` or `max_delay` before flushing.
    /// Throughput-optimized.
    Batched {
        max_items: usize,
        max_delay: Duration,
    },
}

impl Default for PersistencePolicy {
    fn default() -> Self {
        Self::Lazy
    }
}

/// Checkpoint store configuration
#[derive(Debug, Clone)]
pub struct CheckpointStoreConfig {
    /// Maximum checkpoints held in the in-memory cache
    pub cache_max_size: usize,

    /// Persistence policy (a configuration decision, not per-call)
    pub policy: PersistencePolicy,

    /// Path of the write-ahead log (`None` disables the WAL and with it the
    /// crash-recovery floor; in-memory test setups only)
    pub wal_path: Option<PathBuf>,

    /// Backoff schedule for failed persistence writes
    pub persist_retry: RetryPolicy,
}

impl Default for CheckpointStoreConfig {
    fn default() -> Self {
        Self {
            cache_max_size: 1000,
            policy: PersistencePolicy::default(),
            wal_path: None,
            persist_retry: RetryPolicy::exponential(),
        }
    }
}

impl CheckpointStoreConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cache bound
    pub fn with_cache_max_size(mut self, max: usize) -> Self {
        self.cache_max_size = max.max(1);
        self
    }

    /// Set the persistence policy
    pub fn with_policy(mut self, policy: PersistencePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Enable the write-ahead log at the given path
    pub fn with_wal_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.wal_path = Some(path.into());
        self
    }

    /// Set the persistence retry policy
    pub fn with_persist_retry(mut self, policy: RetryPolicy) -> Self {
        self.persist_retry = policy;
        self
    }
}

/// Cache entry with an LRU stamp
struct CacheEntry {
    checkpoint: Checkpoint,
    last_used: u64,
}

/// Bounded LRU cache keyed by (context id, checkpoint id)
///
/// Entries not yet persisted are never evicted; until the drain worker
/// confirms them they exist nowhere else that reads can reach.
struct CheckpointCache {
    entries: HashMap<(String, String), CacheEntry>,
    max_size: usize,
    tick: u64,
}

impl CheckpointCache {
    fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_size,
            tick: 0,
        }
    }

    fn contains(&self, key: &(String, String)) -> bool {
        self.entries.contains_key(key)
    }

    fn insert(&mut self, checkpoint: Checkpoint) {
        self.tick += 1;
        let key = (checkpoint.context_id.clone(), checkpoint.id.clone());
        self.entries.insert(
            key,
            CacheEntry {
                checkpoint,
                last_used: self.tick,
            },
        );
        self.evict_over_capacity();
    }

    fn get(&mut self, key: &(String, String)) -> Option<Checkpoint> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(key)?;
        entry.last_used = tick;
        Some(entry.checkpoint.clone())
    }

    fn remove(&mut self, key: &(String, String)) -> bool {
        self.entries.remove(key).is_some()
    }

    fn mark_persisted(&mut self, key: &(String, String)) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.checkpoint.persisted = true;
        }
    }

    fn context_ids(&self, context_id: &str) -> Vec<String> {
        self.entries
            .keys()
            .filter(|(ctx, _)| ctx == context_id)
            .map(|(_, id)| id.clone())
            .collect()
    }

    fn evict_over_capacity(&mut self) {
        while self.entries.len() > self.max_size {
            let victim = self
                .entries
                .iter()
                .filter(|(_, e)| e.checkpoint.persisted)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());

            match victim {
                Some(key) => {
                    self.entries.remove(&key);
                }
                // Everything over capacity is still unpersisted; let the
                // drain worker catch up before evicting.
                None => break,
            }
        }
    }
}

/// Pending persistence state, guarded together with the WAL so whole-log
/// truncation can never race a fresh append
struct PersistState {
    queue: VecDeque<Checkpoint>,
    in_flight: usize,
    wal: Option<WriteAheadLog>,
}

struct StoreInner {
    config: CheckpointStoreConfig,
    storage: Arc<dyn CheckpointStorage>,
    cache: Mutex<CheckpointCache>,
    latest: RwLock<HashMap<String, String>>,
    persist: Mutex<PersistState>,
    drain_running: AtomicBool,
}

/// Checkpoint store with zero-latency writes and asynchronous durability
///
/// Cloning is cheap; all clones share the same state. The store must be
/// used within a tokio runtime (the drain worker is a spawned task).
///
/// # Example
///
/// ```ignore
/// let store = CheckpointStore::new(
///     Arc::new(FsStorage::new("/var/lib/engine/checkpoints")),
///     CheckpointStoreConfig::new()
///         .with_wal_path("/var/lib/engine/wal.jsonl")
///         .with_policy(PersistencePolicy::Lazy),
/// )?;
///
/// let recovered = store.recover().await?;
/// info!(recovered, "Checkpoint store ready");
/// ```
#[derive(Clone)]
pub struct CheckpointStore {
    inner: Arc<StoreInner>,
}

impl CheckpointStore {
    /// Create a new store over the given storage backend
    pub fn new(
        storage: Arc<dyn CheckpointStorage>,
        config: CheckpointStoreConfig,
    ) -> Result<Self, CheckpointError> {
        let wal = match &config.wal_path {
            Some(path) => Some(WriteAheadLog::open(path).map_err(CheckpointError::Wal)?),
            None => None,
        };

        Ok(Self {
            inner: Arc::new(StoreInner {
                cache: Mutex::new(CheckpointCache::new(config.cache_max_size)),
                latest: RwLock::new(HashMap::new()),
                persist: Mutex::new(PersistState {
                    queue: VecDeque::new(),
                    in_flight: 0,
                    wal,
                }),
                drain_running: AtomicBool::new(false),
                config,
                storage,
            }),
        })
    }

    /// Create a checkpoint
    ///
    /// The cache insert and the WAL append both complete before this returns;
    /// durable persistence follows the configured policy. Under `Lazy` and
    /// `Batched` this method performs no storage I/O.
    pub async fn create_checkpoint(
        &self,
        context_id: impl Into<String>,
        checkpoint_id: impl Into<String>,
        state: serde_json::Value,
        metadata: serde_json::Value,
    ) -> Result<String, CheckpointError> {
        let checkpoint = Checkpoint {
            id: checkpoint_id.into(),
            context_id: context_id.into(),
            state,
            metadata,
            created_at: Utc::now(),
            persisted: false,
        };
        let key = (checkpoint.context_id.clone(), checkpoint.id.clone());

        // Write-once: reserve the cache slot atomically
        {
            let mut cache = self.inner.cache.lock();
            if cache.contains(&key) {
                return Err(CheckpointError::AlreadyExists {
                    context: key.0,
                    id: key.1,
                });
            }
            cache.insert(checkpoint.clone());
        }

        // Durability floor: the WAL append must succeed before we acknowledge
        {
            let mut persist = self.inner.persist.lock();
            if let Some(wal) = &persist.wal {
                if let Err(e) = wal.append(&checkpoint) {
                    self.inner.cache.lock().remove(&key);
                    return Err(CheckpointError::Wal(e));
                }
            }
            // From here the record is WAL-protected; it must stay counted
            // (queued or in flight) until storage confirms it, or a
            // concurrent create's truncation could discard it
            if self.inner.config.policy == PersistencePolicy::Immediate {
                persist.in_flight += 1;
            } else {
                persist.queue.push_back(checkpoint.clone());
            }
        }

        // Latest pointer only ever advances, and only on creation
        self.inner
            .latest
            .write()
            .insert(checkpoint.context_id.clone(), checkpoint.id.clone());

        match self.inner.config.policy {
            PersistencePolicy::Immediate => match self.inner.storage.put(&checkpoint).await {
                Ok(()) => {
                    complete_in_flight(&self.inner);
                    self.inner.cache.lock().mark_persisted(&key);
                    maybe_truncate_wal(&self.inner);
                }
                // Hand the record to the background worker so it stays
                // pending; the caller learns synchronous durability was not
                // achieved
                Err(e) => {
                    {
                        let mut persist = self.inner.persist.lock();
                        persist.in_flight = persist.in_flight.saturating_sub(1);
                        persist.queue.push_back(checkpoint);
                    }
                    self.schedule_drain();
                    return Err(e.into());
                }
            },
            _ => self.schedule_drain(),
        }

        Ok(checkpoint.id)
    }

    /// Get a checkpoint: cache hit is O(1), miss falls back to storage
    pub async fn get_checkpoint(
        &self,
        context_id: &str,
        checkpoint_id: &str,
    ) -> Result<Checkpoint, CheckpointError> {
        let key = (context_id.to_string(), checkpoint_id.to_string());

        if let Some(checkpoint) = self.inner.cache.lock().get(&key) {
            return Ok(checkpoint);
        }

        match self.inner.storage.get(context_id, checkpoint_id).await? {
            Some(checkpoint) => {
                self.inner.cache.lock().insert(checkpoint.clone());
                Ok(checkpoint)
            }
            None => Err(CheckpointError::NotFound {
                context: key.0,
                id: key.1,
            }),
        }
    }

    /// Get the most recently created checkpoint for a context
    ///
    /// Resolution of the latest id is O(1). Returns `Ok(None)` if the context
    /// has never created a checkpoint. Deleting older checkpoints never moves
    /// the pointer.
    pub async fn get_latest_checkpoint(
        &self,
        context_id: &str,
    ) -> Result<Option<Checkpoint>, CheckpointError> {
        let latest_id = match self.inner.latest.read().get(context_id) {
            Some(id) => id.clone(),
            None => return Ok(None),
        };

        self.get_checkpoint(context_id, &latest_id).await.map(Some)
    }

    /// Return the stored snapshot state for replay/resume
    pub async fn restore_from_checkpoint(
        &self,
        context_id: &str,
        checkpoint_id: &str,
    ) -> Result<serde_json::Value, CheckpointError> {
        Ok(self.get_checkpoint(context_id, checkpoint_id).await?.state)
    }

    /// List checkpoint ids for a context (cache and storage combined)
    pub async fn list_checkpoints(&self, context_id: &str) -> Result<Vec<String>, CheckpointError> {
        let mut ids = self.inner.storage.list(context_id).await?;
        ids.extend(self.inner.cache.lock().context_ids(context_id));
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Delete a checkpoint from cache and storage
    ///
    /// Returns whether anything was deleted. The latest pointer is untouched.
    pub async fn delete_checkpoint(
        &self,
        context_id: &str,
        checkpoint_id: &str,
    ) -> Result<bool, CheckpointError> {
        let key = (context_id.to_string(), checkpoint_id.to_string());
        let cached = self.inner.cache.lock().remove(&key);
        let stored = self.inner.storage.delete(context_id, checkpoint_id).await?;
        Ok(cached || stored)
    }

    /// Replay the WAL to reconstruct checkpoints lost before persistence
    ///
    /// Call once at startup, before accepting new work. Recovered checkpoints
    /// re-enter the cache, the latest pointers, and the persistence queue.
    /// Corrupt log records are skipped. Returns the number of records
    /// recovered.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, CheckpointError> {
        let records = {
            let persist = self.inner.persist.lock();
            match &persist.wal {
                Some(wal) => wal.replay().map_err(CheckpointError::Wal)?,
                None => return Ok(0),
            }
        };

        let count = records.len();
        for mut checkpoint in records {
            checkpoint.persisted = false;
            let context_id = checkpoint.context_id.clone();
            let id = checkpoint.id.clone();

            self.inner.cache.lock().insert(checkpoint.clone());
            self.inner.latest.write().insert(context_id, id);
            self.inner.persist.lock().queue.push_back(checkpoint);
        }

        if count > 0 {
            info!(count, "Recovered checkpoints from WAL");
            self.schedule_drain();
        }
        Ok(count)
    }

    /// Persist everything pending right now (shutdown-time drain)
    ///
    /// On a storage failure the current record goes back to the front of the
    /// pending queue before the error is surfaced, so it stays counted and
    /// keeps blocking WAL truncation until a retry confirms it.
    pub async fn flush(&self) -> Result<(), CheckpointError> {
        loop {
            let next = take_next(&self.inner);
            let Some(checkpoint) = next else { break };

            match self.inner.storage.put(&checkpoint).await {
                Ok(()) => {
                    complete_in_flight(&self.inner);
                    let key = (checkpoint.context_id.clone(), checkpoint.id.clone());
                    self.inner.cache.lock().mark_persisted(&key);
                }
                Err(e) => {
                    let mut persist = self.inner.persist.lock();
                    persist.in_flight = persist.in_flight.saturating_sub(1);
                    persist.queue.push_front(checkpoint);
                    return Err(e.into());
                }
            }
        }

        maybe_truncate_wal(&self.inner);
        Ok(())
    }

    /// Number of checkpoints awaiting durable persistence (for testing)
    pub fn pending_persist_count(&self) -> usize {
        let persist = self.inner.persist.lock();
        persist.queue.len() + persist.in_flight
    }

    /// Whether the drain worker is currently running
    pub fn is_draining(&self) -> bool {
        self.inner.drain_running.load(Ordering::SeqCst)
    }

    /// Start the drain worker if it is not already running
    ///
    /// Idempotent: the compare-and-swap guarantees at most one worker, so
    /// calling this repeatedly never duplicates a drain.
    fn schedule_drain(&self) {
        if self
            .inner
            .drain_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(drain_loop(inner));
        }
    }
}

/// Pop the next pending checkpoint, tracking it as in-flight
fn take_next(inner: &StoreInner) -> Option<Checkpoint> {
    let mut persist = inner.persist.lock();
    let next = persist.queue.pop_front();
    if next.is_some() {
        persist.in_flight += 1;
    }
    next
}

fn complete_in_flight(inner: &StoreInner) {
    let mut persist = inner.persist.lock();
    persist.in_flight = persist.in_flight.saturating_sub(1);
}

/// Truncate the WAL in its entirety, but only when nothing is pending
fn maybe_truncate_wal(inner: &StoreInner) {
    let persist = inner.persist.lock();
    if persist.queue.is_empty() && persist.in_flight == 0 {
        if let Some(wal) = &persist.wal {
            if let Err(e) = wal.truncate() {
                warn!(error = %e, "WAL truncation failed; will retry after next drain");
            }
        }
    }
}

/// Background drain loop: exactly one per store, exits when drained
async fn drain_loop(inner: Arc<StoreInner>) {
    debug!("Persistence worker started");

    loop {
        if let PersistencePolicy::Batched {
            max_items,
            max_delay,
        } = inner.config.policy
        {
            wait_for_batch(&inner, max_items, max_delay).await;
        }

        match take_next(&inner) {
            Some(checkpoint) => {
                persist_with_retry(&inner, checkpoint).await;
                complete_in_flight(&inner);
            }
            None => {
                inner.drain_running.store(false, Ordering::SeqCst);

                // An enqueue may have raced with the shutdown; reclaim the
                // worker role if so, otherwise exit.
                let refill = !inner.persist.lock().queue.is_empty();
                if refill
                    && inner
                        .drain_running
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    continue;
                }
                break;
            }
        }
    }

    maybe_truncate_wal(&inner);
    debug!("Persistence worker exited");
}

/// Batched policy: wait for a full batch or the delay window, whichever first
async fn wait_for_batch(inner: &StoreInner, max_items: usize, max_delay: Duration) {
    let deadline = tokio::time::Instant::now() + max_delay;
    loop {
        let len = inner.persist.lock().queue.len();
        if len >= max_items || len == 0 || tokio::time::Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Write one checkpoint to storage, retrying with capped backoff
///
/// The worker never gives up: the WAL retains the record, and truncation
/// waits for confirmed persistence, so retrying is always safe.
async fn persist_with_retry(inner: &StoreInner, checkpoint: Checkpoint) {
    let policy = &inner.config.persist_retry;
    let mut attempt: u32 = 1;

    loop {
        match inner.storage.put(&checkpoint).await {
            Ok(()) => {
                let key = (checkpoint.context_id.clone(), checkpoint.id.clone());
                inner.cache.lock().mark_persisted(&key);
                return;
            }
            Err(e) => {
                if attempt >= policy.max_attempts {
                    error!(
                        context_id = %checkpoint.context_id,
                        checkpoint_id = %checkpoint.id,
                        attempt,
                        error = %e,
                        "Persistence still failing; continuing with capped backoff"
                    );
                } else {
                    warn!(
                        context_id = %checkpoint.context_id,
                        checkpoint_id = %checkpoint.id,
                        attempt,
                        error = %e,
                        "Persistence write failed; retrying"
                    );
                }

                attempt = attempt.saturating_add(1);
                let delay = policy.delay_for_attempt(attempt.min(policy.max_attempts));
                tokio::time::sleep(delay).await;
            }
        }
    }
}
