//! Extraction cache and session coordinator.
//!
//! Reads land here. Materialized entries are served from memory; misses
//! start or join an extraction session. Only one session per solid block
//! is in flight at a time, and sessions of the same archive queue on the
//! handle's decoder lock. A request for an index that a queued session does
//! not cover yet is folded into that session; a request arriving after the
//! session started waits for it to finish and then tries again.

use crate::archive::ArchiveHandle;
use crate::budget::ResourceManager;
use crate::error::{Failure, FsError};
use crate::session::{ExtractionSession, Outcome};
use crate::types::{BlockId, Entry};
use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Cache tuning.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Bytes of materialized entries kept resident
    pub budget_bytes: u64,

    /// Memory declared per running session
    pub session_reservation_bytes: u64,

    /// Delay before a new session freezes its target set
    pub coalesce_window: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 256 * 1024 * 1024,
            session_reservation_bytes: 64 * 1024 * 1024,
            coalesce_window: Duration::from_millis(2),
        }
    }
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Sessions that reached the decoder
    pub decode_passes: u64,
    pub hits: u64,
    pub evictions: u64,
    pub resident_bytes: u64,
    pub resident_entries: usize,
}

#[derive(Default)]
struct FlightState {
    targets: BTreeSet<u32>,
    started: bool,
    outcomes: Option<Arc<BTreeMap<u32, Outcome>>>,
}

/// A session that is queued or running for one block.
struct InFlight {
    state: Mutex<FlightState>,
    done: Condvar,
}

impl InFlight {
    fn new(first: u32) -> Self {
        Self {
            state: Mutex::new(FlightState {
                targets: BTreeSet::from([first]),
                ..FlightState::default()
            }),
            done: Condvar::new(),
        }
    }

    /// Adds `index` to the session if it has not frozen its targets yet.
    /// Returns whether the session will produce `index`.
    fn join(&self, index: u32) -> bool {
        let mut state = self.state.lock();
        if state.targets.contains(&index) {
            return true;
        }
        if state.started {
            return false;
        }
        state.targets.insert(index);
        true
    }

    /// Freezes and returns the target set.
    fn start(&self) -> BTreeSet<u32> {
        let mut state = self.state.lock();
        state.started = true;
        state.targets.clone()
    }

    fn complete(&self, outcomes: Arc<BTreeMap<u32, Outcome>>) {
        let mut state = self.state.lock();
        state.outcomes = Some(outcomes);
        self.done.notify_all();
    }

    fn wait(&self) -> Arc<BTreeMap<u32, Outcome>> {
        let mut state = self.state.lock();
        loop {
            if let Some(outcomes) = &state.outcomes {
                return Arc::clone(outcomes);
            }
            self.done.wait(&mut state);
        }
    }
}

struct Resident {
    bytes: Arc<[u8]>,
}

#[derive(Default)]
struct CacheState {
    resident: Option<LruCache<u32, Resident>>,
    resident_bytes: u64,
    readers: HashMap<u32, usize>,
    in_flight: HashMap<BlockId, Arc<InFlight>>,
}

impl CacheState {
    fn resident(&mut self) -> &mut LruCache<u32, Resident> {
        self.resident.get_or_insert_with(LruCache::unbounded)
    }

    fn is_pinned(&self, index: u32) -> bool {
        self.readers.get(&index).is_some_and(|&count| count > 0)
    }
}

/// The read path's entry point for one archive handle.
pub struct ExtractionCache {
    handle: Arc<ArchiveHandle>,
    resources: Arc<ResourceManager>,
    config: CacheConfig,
    state: Mutex<CacheState>,
    passes: AtomicU64,
    hits: AtomicU64,
    evictions: AtomicU64,
}

impl ExtractionCache {
    pub fn new(
        handle: Arc<ArchiveHandle>,
        resources: Arc<ResourceManager>,
        config: CacheConfig,
    ) -> Self {
        Self {
            handle,
            resources,
            config,
            state: Mutex::new(CacheState::default()),
            passes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn handle(&self) -> &Arc<ArchiveHandle> {
        &self.handle
    }

    /// Reads up to `length` bytes of `entry` starting at `offset`.
    ///
    /// Never reads past the entry's declared size: an offset at or beyond
    /// the end yields an empty buffer, and a range running past it is
    /// clamped to the valid prefix.
    pub fn read(&self, entry: &Entry, offset: u64, length: usize) -> Result<Vec<u8>, FsError> {
        if self.handle.is_cancelled() {
            return Err(FsError::Cancelled);
        }
        if offset >= entry.size || length == 0 {
            return Ok(Vec::new());
        }

        let bytes = self.materialize(entry)?;
        let available = (bytes.len() as u64).min(entry.size);
        let start = offset.min(available) as usize;
        let end = offset.saturating_add(length as u64).min(available) as usize;
        Ok(bytes[start..end].to_vec())
    }

    /// Full contents of `entry`, decoding it if necessary.
    pub fn materialize(&self, entry: &Entry) -> Result<Arc<[u8]>, FsError> {
        let Some(block) = entry.block.filter(|_| entry.has_data()) else {
            return Ok(Arc::from(Vec::new()));
        };

        loop {
            let mut state = self.state.lock();
            if self.handle.is_cancelled() {
                return Err(FsError::Cancelled);
            }
            if let Some(resident) = state.resident().get(&entry.index) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(&resident.bytes));
            }

            match state.in_flight.get(&block).cloned() {
                Some(flight) => {
                    let covered = flight.join(entry.index);
                    drop(state);
                    let outcomes = flight.wait();
                    if covered {
                        return take_outcome(&outcomes, entry.index);
                    }
                    tracing::trace!(index = entry.index, block, "session missed index, retrying");
                }
                None => {
                    let flight = Arc::new(InFlight::new(entry.index));
                    state.in_flight.insert(block, Arc::clone(&flight));
                    drop(state);
                    let outcomes = self.drive(block, &flight);
                    return take_outcome(&outcomes, entry.index);
                }
            }
        }
    }

    /// Runs the session registered for `block` and publishes its outcomes.
    fn drive(&self, block: BlockId, flight: &Arc<InFlight>) -> Arc<BTreeMap<u32, Outcome>> {
        let mut guard = FlightGuard {
            cache: self,
            block,
            flight,
            finished: false,
        };

        if !self.config.coalesce_window.is_zero() {
            std::thread::sleep(self.config.coalesce_window);
        }

        let report = {
            let mut decoder = self.handle.lock_decoder();
            let targets = flight.start();
            self.passes.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(block, targets = ?targets, "decode pass for block");
            ExtractionSession::new(
                &self.handle,
                &self.resources,
                self.config.session_reservation_bytes,
            )
            .run_locked(decoder.as_mut(), &targets)
        };

        let outcomes = Arc::new(report.outcomes);
        guard.publish(Arc::clone(&outcomes));
        outcomes
    }

    fn publish(&self, block: BlockId, flight: &InFlight, outcomes: Arc<BTreeMap<u32, Outcome>>) {
        let mut state = self.state.lock();
        if !self.handle.is_cancelled() {
            for (&index, outcome) in outcomes.iter() {
                if let Outcome::Materialized(bytes) = outcome {
                    self.insert(&mut state, index, Arc::clone(bytes));
                }
            }
            self.evict(&mut state);
        }
        state.in_flight.remove(&block);
        flight.complete(outcomes);
    }

    fn insert(&self, state: &mut CacheState, index: u32, bytes: Arc<[u8]>) {
        let len = bytes.len() as u64;
        if let Some(previous) = state.resident().put(index, Resident { bytes }) {
            state.resident_bytes -= previous.bytes.len() as u64;
        }
        state.resident_bytes += len;
    }

    /// Drops least recently used entries without readers until the cache
    /// fits its budget. Entries with readers are skipped, never dropped.
    fn evict(&self, state: &mut CacheState) {
        if state.resident_bytes <= self.config.budget_bytes {
            return;
        }

        let mut excess = state.resident_bytes - self.config.budget_bytes;
        let victims: Vec<u32> = {
            let readers = &state.readers;
            let resident = state.resident.get_or_insert_with(LruCache::unbounded);
            resident
                .iter()
                .rev()
                .filter(|(index, _)| !readers.get(*index).is_some_and(|&c| c > 0))
                .take_while(|(_, r)| {
                    let keep_going = excess > 0;
                    excess = excess.saturating_sub(r.bytes.len() as u64);
                    keep_going
                })
                .map(|(&index, _)| index)
                .collect()
        };

        for index in victims {
            if let Some(resident) = state.resident().pop(&index) {
                state.resident_bytes -= resident.bytes.len() as u64;
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(index, "evicted cached entry");
            }
        }
    }

    /// Registers an active reader of `index`; pinned entries are not evicted.
    pub fn pin(&self, index: u32) {
        *self.state.lock().readers.entry(index).or_insert(0) += 1;
    }

    /// Releases a reader registered with [`pin`](Self::pin).
    pub fn unpin(&self, index: u32) {
        let mut state = self.state.lock();
        if let Some(count) = state.readers.get_mut(&index) {
            *count -= 1;
            if *count == 0 {
                state.readers.remove(&index);
            }
        }
        self.evict(&mut state);
    }

    pub fn is_resident(&self, index: u32) -> bool {
        self.state.lock().resident().contains(&index)
    }

    pub fn is_pinned(&self, index: u32) -> bool {
        self.state.lock().is_pinned(index)
    }

    pub fn stats(&self) -> CacheStats {
        let mut state = self.state.lock();
        let resident_entries = state.resident().len();
        CacheStats {
            decode_passes: self.passes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            resident_bytes: state.resident_bytes,
            resident_entries,
        }
    }

    /// Cancels the handle and drops every resident entry.
    ///
    /// A running pass stops at its next safe point. Sessions still queued on
    /// the decoder lock find the handle cancelled and fail all their targets
    /// with `Cancelled` without decoding.
    pub fn cancel(&self) {
        self.handle.cancel();
        let mut state = self.state.lock();
        let cleared = state.resident().len();
        state.resident().clear();
        state.resident_bytes = 0;
        tracing::debug!(
            cleared,
            in_flight = state.in_flight.len(),
            "cache cleared on cancel"
        );
    }
}

/// Ensures waiters are released even if the session unwinds.
struct FlightGuard<'a> {
    cache: &'a ExtractionCache,
    block: BlockId,
    flight: &'a Arc<InFlight>,
    finished: bool,
}

impl FlightGuard<'_> {
    fn publish(&mut self, outcomes: Arc<BTreeMap<u32, Outcome>>) {
        self.finished = true;
        self.cache.publish(self.block, self.flight, outcomes);
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let targets = self.flight.state.lock().targets.clone();
        let failure = Failure::Engine("extraction session aborted".into());
        let outcomes = targets
            .into_iter()
            .map(|index| (index, Outcome::Failed(failure.clone())))
            .collect();
        self.cache.publish(self.block, self.flight, Arc::new(outcomes));
    }
}

fn take_outcome(outcomes: &BTreeMap<u32, Outcome>, index: u32) -> Result<Arc<[u8]>, FsError> {
    match outcomes.get(&index) {
        Some(outcome) => outcome.clone().into_result().map_err(FsError::from),
        None => Err(FsError::Extraction(crate::error::ExtractionError::Unavailable)),
    }
}
