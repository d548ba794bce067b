//! Budget-bounded, single-flight cache of decompressed blocks.
//!
//! # Concurrency
//!
//! One mutex guards the id → entry map, the recency index and the pending
//! map. It is held only for lookups, inserts and recency updates; reading and
//! decompressing a block happens outside it, on a worker thread or (with
//! `workers = 0`) on the requesting thread.
//!
//! The first requester of a missing block registers a `Pending` handle in
//! the pending map. Every later requester for the same id finds the handle
//! and waits on it instead of starting a second load. The loader inserts the
//! entry and removes the handle under the same lock acquisition, then
//! publishes the outcome (success or error) to all waiters.
//!
//! # Eviction
//!
//! An entry is pinned while any [`BlockRef`] to it is alive. Eviction walks
//! entries from least to most recently used and removes the first unpinned
//! ones until the new block fits. If pinned entries alone exceed the budget
//! the request fails with [`DfsError::ResourceExhausted`]. A block whose
//! declared size exceeds the whole budget is refused before it is read.
//!
//! # Timeouts
//!
//! With `io_timeout_ms` set, the deadline covers queueing the load as well as
//! waiting for it, so a full job queue behind stalled workers fails with
//! [`DfsError::Timeout`] instead of blocking. Dropping the cache makes the
//! workers answer still-queued jobs with [`DfsError::Cancelled`].

use crate::source::BlockSource;
use crossbeam_channel::{Receiver, SendTimeoutError, Sender};
use dfs_error::{DfsError, Result};
use dfs_types::BlockId;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const DEFAULT_BUDGET_BYTES: u64 = 256 * 1024 * 1024;
const DEFAULT_WORKERS: usize = 2;
const JOBS_PER_WORKER: usize = 16;

/// Cache tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Upper bound on resident decompressed bytes.
    pub budget_bytes: u64,
    /// Decompression threads. `0` loads on the requesting thread.
    pub workers: usize,
    /// Give up waiting for a block after this long.
    pub io_timeout_ms: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: DEFAULT_BUDGET_BYTES,
            workers: DEFAULT_WORKERS,
            io_timeout_ms: None,
        }
    }
}

impl CacheConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DfsError::InvalidConfig(format!("cache config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.budget_bytes == 0 {
            return Err(DfsError::InvalidConfig(
                "cache budget_bytes must be > 0".to_owned(),
            ));
        }
        if self.io_timeout_ms == Some(0) {
            return Err(DfsError::InvalidConfig(
                "cache io_timeout_ms must be > 0 when set".to_owned(),
            ));
        }
        if self.io_timeout_ms.is_some() && self.workers == 0 {
            return Err(DfsError::InvalidConfig(
                "cache io_timeout_ms requires at least one worker".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Completed calls into the block source.
    pub decompressions: u64,
    /// Requests that joined an in-flight load instead of starting one.
    pub coalesced: u64,
    pub resident_bytes: u64,
    pub entries: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    decompressions: AtomicU64,
    coalesced: AtomicU64,
}

/// Shared handle to a cached block payload.
///
/// The entry cannot be evicted while any clone of this handle is alive.
#[derive(Debug, Clone)]
pub struct BlockRef {
    id: BlockId,
    data: Arc<[u8]>,
}

impl BlockRef {
    #[must_use]
    pub fn id(&self) -> BlockId {
        self.id
    }
}

impl Deref for BlockRef {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for BlockRef {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Debug)]
struct Entry {
    data: Arc<[u8]>,
    stamp: u64,
}

impl Entry {
    /// The map's own reference is the only one.
    fn is_pinned(&self) -> bool {
        Arc::strong_count(&self.data) > 1
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<BlockId, Entry>,
    /// stamp → id, oldest first.
    lru: BTreeMap<u64, BlockId>,
    tick: u64,
    resident_bytes: u64,
    pending: HashMap<BlockId, Arc<Pending>>,
}

impl CacheState {
    fn next_stamp(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, id: BlockId) -> Option<Arc<[u8]>> {
        let stamp = self.next_stamp();
        let entry = self.entries.get_mut(&id)?;
        self.lru.remove(&entry.stamp);
        entry.stamp = stamp;
        self.lru.insert(stamp, id);
        Some(Arc::clone(&entry.data))
    }

    /// Evict unpinned entries, oldest first, until `needed` more bytes fit.
    fn make_room(&mut self, needed: u64, budget: u64, counters: &Counters) -> Result<()> {
        if needed > budget {
            return Err(DfsError::ResourceExhausted {
                requested: needed,
                budget,
            });
        }
        while self.resident_bytes + needed > budget {
            let victim = self
                .lru
                .iter()
                .find(|(_, id)| self.entries.get(*id).is_some_and(|e| !e.is_pinned()))
                .map(|(stamp, id)| (*stamp, *id));
            let Some((stamp, id)) = victim else {
                return Err(DfsError::ResourceExhausted {
                    requested: needed,
                    budget,
                });
            };
            self.lru.remove(&stamp);
            if let Some(entry) = self.entries.remove(&id) {
                self.resident_bytes -= entry.data.len() as u64;
            }
            counters.evictions.fetch_add(1, Ordering::Relaxed);
            trace!(target: "dfs::cache", block = id.0, "block_evicted");
        }
        Ok(())
    }

    fn insert(
        &mut self,
        id: BlockId,
        data: Arc<[u8]>,
        budget: u64,
        counters: &Counters,
    ) -> Result<()> {
        self.make_room(data.len() as u64, budget, counters)?;
        let stamp = self.next_stamp();
        self.resident_bytes += data.len() as u64;
        self.lru.insert(stamp, id);
        self.entries.insert(id, Entry { data, stamp });
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PendingState {
    /// Callers currently waiting on this handle.
    waiters: usize,
    outcome: Option<Result<Arc<[u8]>>>,
}

/// Completion handle shared by every caller coalesced onto one load.
#[derive(Debug, Default)]
struct Pending {
    state: Mutex<PendingState>,
    ready: Condvar,
}

impl Pending {
    fn complete(&self, outcome: Result<Arc<[u8]>>) {
        let mut state = self.state.lock();
        if state.waiters > 0 {
            state.outcome = Some(outcome);
        }
        drop(state);
        self.ready.notify_all();
    }

    /// Block until the outcome is published or `deadline` passes.
    ///
    /// The last waiter takes the outcome out of the handle so no stray
    /// reference keeps the entry pinned.
    fn wait(&self, id: BlockId, deadline: Option<(Instant, Duration)>) -> Result<Arc<[u8]>> {
        let mut state = self.state.lock();
        loop {
            let outcome = if state.waiters == 1 {
                state.outcome.take()
            } else {
                state.outcome.clone()
            };
            if let Some(outcome) = outcome {
                state.waiters -= 1;
                return outcome;
            }
            match deadline {
                None => self.ready.wait(&mut state),
                Some((at, timeout)) => {
                    if self.ready.wait_until(&mut state, at).timed_out() && state.outcome.is_none() {
                        state.waiters -= 1;
                        return Err(DfsError::Timeout {
                            block: id.0,
                            waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        });
                    }
                }
            }
        }
    }
}

struct Shared {
    source: Arc<dyn BlockSource>,
    budget: u64,
    state: Mutex<CacheState>,
    counters: Counters,
    shutdown: AtomicBool,
}

impl Shared {
    /// Drop a queued load without running it.
    fn cancel(&self, id: BlockId, pending: &Pending) {
        self.state.lock().pending.remove(&id);
        pending.complete(Err(DfsError::Cancelled));
    }

    /// Load `id` and publish the outcome to the pending handle.
    fn run_load(&self, id: BlockId, pending: &Pending) {
        let loaded = self.source.load(id);
        self.counters.decompressions.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock();
        state.pending.remove(&id);
        let outcome = loaded.and_then(|bytes| {
            let data: Arc<[u8]> = Arc::from(bytes);
            state.insert(id, Arc::clone(&data), self.budget, &self.counters)?;
            Ok(data)
        });
        drop(state);

        if let Err(err) = &outcome {
            debug!(target: "dfs::cache", block = id.0, error = %err, "block_load_failed");
        }
        pending.complete(outcome);
    }
}

struct Job {
    id: BlockId,
    pending: Arc<Pending>,
}

/// Decompressed-block cache over a [`BlockSource`].
pub struct BlockCache {
    shared: Arc<Shared>,
    io_timeout: Option<Duration>,
    jobs: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("budget", &self.shared.budget)
            .field("workers", &self.workers.len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl BlockCache {
    pub fn new(source: Arc<dyn BlockSource>, config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            source,
            budget: config.budget_bytes,
            state: Mutex::new(CacheState::default()),
            counters: Counters::default(),
            shutdown: AtomicBool::new(false),
        });

        let (jobs, workers) = if config.workers == 0 {
            (None, Vec::new())
        } else {
            let (tx, rx) = crossbeam_channel::bounded::<Job>(config.workers * JOBS_PER_WORKER);
            let mut handles = Vec::with_capacity(config.workers);
            for n in 0..config.workers {
                let rx: Receiver<Job> = rx.clone();
                let shared = Arc::clone(&shared);
                let handle = std::thread::Builder::new()
                    .name(format!("dfs-cache-{n}"))
                    .spawn(move || {
                        for job in &rx {
                            if shared.shutdown.load(Ordering::Acquire) {
                                shared.cancel(job.id, &job.pending);
                            } else {
                                shared.run_load(job.id, &job.pending);
                            }
                        }
                    })?;
                handles.push(handle);
            }
            (Some(tx), handles)
        };

        debug!(
            target: "dfs::cache",
            budget = config.budget_bytes,
            workers = config.workers,
            io_timeout_ms = config.io_timeout_ms,
            "cache_started"
        );
        Ok(Self {
            shared,
            io_timeout: config.io_timeout_ms.map(Duration::from_millis),
            jobs,
            workers,
        })
    }

    /// Return the decompressed payload of `id`, loading it at most once no
    /// matter how many callers ask concurrently.
    pub fn get_block(&self, id: BlockId) -> Result<BlockRef> {
        let counters = &self.shared.counters;
        let mut state = self.shared.state.lock();
        if let Some(data) = state.touch(id) {
            drop(state);
            counters.hits.fetch_add(1, Ordering::Relaxed);
            trace!(target: "dfs::cache", block = id.0, "cache_hit");
            return Ok(BlockRef { id, data });
        }

        if let Some(pending) = state.pending.get(&id).map(Arc::clone) {
            pending.state.lock().waiters += 1;
            drop(state);
            counters.coalesced.fetch_add(1, Ordering::Relaxed);
            trace!(target: "dfs::cache", block = id.0, "cache_coalesced");
            return Self::await_pending(id, &pending, self.deadline_from(Instant::now()));
        }

        let size = u64::from(self.shared.source.uncompressed_size(id)?);
        if size > self.shared.budget {
            drop(state);
            debug!(target: "dfs::cache", block = id.0, size, "block_over_budget");
            return Err(DfsError::ResourceExhausted {
                requested: size,
                budget: self.shared.budget,
            });
        }

        let started = Instant::now();
        let pending = Arc::new(Pending::default());
        pending.state.lock().waiters = 1;
        state.pending.insert(id, Arc::clone(&pending));
        drop(state);
        counters.misses.fetch_add(1, Ordering::Relaxed);
        trace!(target: "dfs::cache", block = id.0, "cache_miss");

        match &self.jobs {
            None => self.shared.run_load(id, &pending),
            Some(jobs) => {
                let job = Job {
                    id,
                    pending: Arc::clone(&pending),
                };
                let refused = match self.io_timeout {
                    None => jobs.send(job).err().map(|_| DfsError::Cancelled),
                    Some(timeout) => match jobs.send_timeout(job, timeout) {
                        Ok(()) => None,
                        Err(SendTimeoutError::Timeout(_)) => Some(DfsError::Timeout {
                            block: id.0,
                            waited_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        }),
                        Err(SendTimeoutError::Disconnected(_)) => Some(DfsError::Cancelled),
                    },
                };
                if let Some(err) = refused {
                    debug!(target: "dfs::cache", block = id.0, error = %err, "block_load_not_queued");
                    self.shared.state.lock().pending.remove(&id);
                    pending.complete(Err(err));
                }
            }
        }
        Self::await_pending(id, &pending, self.deadline_from(started))
    }

    fn deadline_from(&self, start: Instant) -> Option<(Instant, Duration)> {
        self.io_timeout.map(|t| (start + t, t))
    }

    fn await_pending(
        id: BlockId,
        pending: &Pending,
        deadline: Option<(Instant, Duration)>,
    ) -> Result<BlockRef> {
        let data = pending.wait(id, deadline)?;
        Ok(BlockRef { id, data })
    }

    /// Whether `id` is currently resident.
    #[must_use]
    pub fn contains(&self, id: BlockId) -> bool {
        self.shared.state.lock().entries.contains_key(&id)
    }

    #[must_use]
    pub fn budget_bytes(&self) -> u64 {
        self.shared.budget
    }

    #[must_use]
    pub fn source(&self) -> &Arc<dyn BlockSource> {
        &self.shared.source
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let c = &self.shared.counters;
        let state = self.shared.state.lock();
        let (resident_bytes, entries) = (state.resident_bytes, state.entries.len() as u64);
        drop(state);
        CacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            evictions: c.evictions.load(Ordering::Relaxed),
            decompressions: c.decompressions.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            resident_bytes,
            entries,
        }
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        // Queued jobs are cancelled; closing the queue ends each worker's
        // receive loop once the backlog is answered.
        self.shared.shutdown.store(true, Ordering::Release);
        self.jobs = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;

    /// Synthetic source: block `n` is `size` bytes of value `n`.
    struct FakeSource {
        size: usize,
        count: u32,
        loads: AtomicUsize,
        delay: Duration,
        fail: Option<BlockId>,
    }

    impl FakeSource {
        fn new(size: usize, count: u32) -> Self {
            Self {
                size,
                count,
                loads: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: None,
            }
        }
    }

    impl BlockSource for FakeSource {
        fn block_count(&self) -> u32 {
            self.count
        }

        fn uncompressed_size(&self, _block: BlockId) -> Result<u32> {
            Ok(u32::try_from(self.size).expect("size"))
        }

        fn load(&self, block: BlockId) -> Result<Vec<u8>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            if self.fail == Some(block) {
                return Err(DfsError::CorruptBlock {
                    block: block.0,
                    detail: "checksum mismatch".into(),
                });
            }
            Ok(vec![u8::try_from(block.0 % 256).expect("byte"); self.size])
        }
    }

    fn config(budget: u64, workers: usize) -> CacheConfig {
        CacheConfig {
            budget_bytes: budget,
            workers,
            io_timeout_ms: None,
        }
    }

    #[test]
    fn hit_after_miss() {
        let source = Arc::new(FakeSource::new(64, 4));
        let cache = BlockCache::new(source.clone(), &config(1024, 0)).expect("cache");
        let first = cache.get_block(BlockId(2)).expect("miss");
        assert_eq!(&*first, &[2_u8; 64][..]);
        let second = cache.get_block(BlockId(2)).expect("hit");
        assert_eq!(first.id(), second.id());
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.decompressions, 1);
        assert_eq!(stats.resident_bytes, 64);
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_misses_coalesce_into_one_load() {
        let mut source = FakeSource::new(128, 1);
        source.delay = Duration::from_millis(50);
        let source = Arc::new(source);
        let cache = Arc::new(BlockCache::new(source.clone(), &config(4096, 2)).expect("cache"));
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let block = cache.get_block(BlockId(0)).expect("get");
                    assert_eq!(block.len(), 128);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }

        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.decompressions, 1);
        assert_eq!(stats.misses + stats.coalesced + stats.hits, 16);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn errors_reach_every_waiter_and_are_not_cached() {
        let mut source = FakeSource::new(32, 2);
        source.fail = Some(BlockId(1));
        let source = Arc::new(source);
        let cache = BlockCache::new(source.clone(), &config(1024, 1)).expect("cache");

        assert!(matches!(
            cache.get_block(BlockId(1)),
            Err(DfsError::CorruptBlock { block: 1, .. })
        ));
        assert!(!cache.contains(BlockId(1)));
        // A failed block does not poison others, and is retried on next request.
        assert_eq!(cache.get_block(BlockId(0)).expect("ok").len(), 32);
        assert!(cache.get_block(BlockId(1)).is_err());
        assert_eq!(source.loads.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn lru_victim_is_oldest_unpinned() {
        let source = Arc::new(FakeSource::new(100, 8));
        let cache = BlockCache::new(source, &config(300, 0)).expect("cache");
        for id in 0..3 {
            drop(cache.get_block(BlockId(id)).expect("fill"));
        }
        // Refresh 0 so that 1 becomes the oldest.
        drop(cache.get_block(BlockId(0)).expect("touch"));
        drop(cache.get_block(BlockId(3)).expect("evicts 1"));
        assert!(cache.contains(BlockId(0)));
        assert!(!cache.contains(BlockId(1)));
        assert!(cache.contains(BlockId(2)));
        assert!(cache.contains(BlockId(3)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn pinned_entries_survive_pressure() {
        let source = Arc::new(FakeSource::new(100, 8));
        let cache = BlockCache::new(source, &config(300, 0)).expect("cache");
        let pinned = cache.get_block(BlockId(0)).expect("pin");
        for id in 1..8 {
            drop(cache.get_block(BlockId(id)).expect("churn"));
            assert!(cache.contains(BlockId(0)), "pinned block evicted at {id}");
        }
        assert_eq!(&*pinned, &[0_u8; 100][..]);
        assert!(cache.stats().resident_bytes <= 300);
    }

    #[test]
    fn fully_pinned_budget_is_resource_exhausted() {
        let source = Arc::new(FakeSource::new(100, 8));
        let cache = BlockCache::new(source, &config(200, 0)).expect("cache");
        let a = cache.get_block(BlockId(0)).expect("a");
        let b = cache.get_block(BlockId(1)).expect("b");
        assert!(matches!(
            cache.get_block(BlockId(2)),
            Err(DfsError::ResourceExhausted {
                requested: 100,
                budget: 200
            })
        ));
        drop(a);
        assert!(cache.get_block(BlockId(2)).is_ok());
        assert_eq!(b.len(), 100);
    }

    #[test]
    fn oversized_block_is_resource_exhausted() {
        let source = Arc::new(FakeSource::new(500, 1));
        for workers in [0, 1] {
            let cache = BlockCache::new(source.clone(), &config(100, workers)).expect("cache");
            assert!(matches!(
                cache.get_block(BlockId(0)),
                Err(DfsError::ResourceExhausted {
                    requested: 500,
                    budget: 100
                })
            ));
            assert_eq!(cache.stats().decompressions, 0);
        }
        // Refused from the declared size, never read.
        assert_eq!(source.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn slow_load_times_out_then_populates() {
        let mut source = FakeSource::new(16, 1);
        source.delay = Duration::from_millis(300);
        let source = Arc::new(source);
        let cfg = CacheConfig {
            budget_bytes: 1024,
            workers: 1,
            io_timeout_ms: Some(20),
        };
        let cache = BlockCache::new(source, &cfg).expect("cache");
        assert!(matches!(
            cache.get_block(BlockId(0)),
            Err(DfsError::Timeout { block: 0, .. })
        ));
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cache.contains(BlockId(0)) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(cache.contains(BlockId(0)));
        assert_eq!(cache.get_block(BlockId(0)).expect("hit").len(), 16);
    }

    #[test]
    fn full_queue_behind_stalled_worker_times_out() {
        let mut source = FakeSource::new(16, 64);
        source.delay = Duration::from_millis(400);
        let source = Arc::new(source);
        let cfg = CacheConfig {
            budget_bytes: 1 << 20,
            workers: 1,
            io_timeout_ms: Some(20),
        };
        let cache = BlockCache::new(source.clone(), &cfg).expect("cache");

        // More distinct misses than the queue holds.
        let requests = u32::try_from(JOBS_PER_WORKER + 4).expect("small");
        for id in 0..requests {
            let started = Instant::now();
            let outcome = cache.get_block(BlockId(id));
            let elapsed = started.elapsed();
            assert!(
                matches!(outcome, Err(DfsError::Timeout { block, .. }) if block == id),
                "block {id}: {outcome:?}"
            );
            assert!(elapsed < Duration::from_millis(300), "block {id} took {elapsed:?}");
        }

        // Shutdown skips the queued backlog instead of loading it.
        let dropping = Instant::now();
        drop(cache);
        assert!(dropping.elapsed() < Duration::from_secs(2));
        assert!(source.loads.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn config_validation_and_json() {
        assert!(CacheConfig::default().validate().is_ok());
        assert!(config(0, 1).validate().is_err());
        let cfg = CacheConfig {
            io_timeout_ms: Some(10),
            workers: 0,
            ..CacheConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(DfsError::InvalidConfig(_))));

        let parsed = CacheConfig::from_json_str(r#"{"budget_bytes": 4096, "io_timeout_ms": 250}"#)
            .expect("json");
        assert_eq!(parsed.budget_bytes, 4096);
        assert_eq!(parsed.workers, DEFAULT_WORKERS);
        assert_eq!(parsed.io_timeout_ms, Some(250));
        assert!(CacheConfig::from_json_str("{\"budget_bytes\": \"lots\"}").is_err());
    }
}
