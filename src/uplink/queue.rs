//! Sample Queue — sled-backed durable FIFO of location samples awaiting upload
//!
//! Entries are stored in the `entries` tree keyed by entry id (big-endian u64,
//! so iteration order is enqueue order). Counters and per-vehicle sequence
//! numbers live in the `meta` tree. Every mutation commits both trees in one
//! sled transaction, so a crash never leaves a sequence number assigned to a
//! sample that was not stored.
//!
//! An in-memory mirror of the entries is kept behind a mutex; sled is written
//! first and the mirror is only updated once the commit succeeded. With
//! `sync_writes` the flush to disk runs after the mutex is released, so a
//! producer never waits on another caller's fsync.
//!
//! Delivery order is per vehicle: a sample waiting out a retry delay holds
//! back every later sample of the same vehicle.
//!
//! On open, entries left `InFlight` by a previous process are reset to
//! `Pending`: a batch that was in flight when the process died is assumed to
//! have never been delivered.

use super::types::{now_epoch_ms, EntryId, EntryState, QueueEntry, QueueStats, Sample};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const ENTRIES_TREE: &str = "entries";
const META_TREE: &str = "meta";

const KEY_NEXT_ENTRY_ID: &[u8] = b"next_entry_id";
const KEY_DELIVERED_TOTAL: &[u8] = b"delivered_total";
const KEY_DEAD_TOTAL: &[u8] = b"dead_total";
const KEY_EVICTED_TOTAL: &[u8] = b"evicted_total";
const SEQ_PREFIX: &[u8] = b"seq:";

/// Queue errors
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The durable store holds data that cannot be decoded. Unrecoverable
    /// without `SampleQueue::reinitialize`.
    #[error("queue store corrupted: {0}")]
    Corrupted(String),
}

impl QueueError {
    /// Whether the error requires reinitializing the queue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, QueueError::Corrupted(_))
    }
}

impl From<sled::Error> for QueueError {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Corruption { .. } => QueueError::Corrupted(err.to_string()),
            other => QueueError::Storage(other.to_string()),
        }
    }
}

impl From<TransactionError<()>> for QueueError {
    fn from(err: TransactionError<()>) -> Self {
        match err {
            TransactionError::Storage(e) => e.into(),
            TransactionError::Abort(()) => QueueError::Storage("transaction aborted".to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    delivered_total: u64,
    dead_total: u64,
    evicted_total: u64,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: BTreeMap<EntryId, QueueEntry>,
    next_entry_id: EntryId,
    /// Last sequence number handed out per vehicle
    sequences: HashMap<i64, u64>,
    counters: Counters,
}

/// Pending writes for one commit
#[derive(Default)]
struct Commit {
    entries: sled::Batch,
    meta: sled::Batch,
}

/// Durable queue of samples awaiting delivery
pub struct SampleQueue {
    path: PathBuf,
    db: sled::Db,
    entries_tree: sled::Tree,
    meta_tree: sled::Tree,
    capacity: usize,
    sync_writes: bool,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl std::fmt::Debug for SampleQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleQueue")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl SampleQueue {
    /// Create or open a queue at the given directory
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize, sync_writes: bool) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();
        let db = sled::open(&path)?;
        let entries_tree = db.open_tree(ENTRIES_TREE)?;
        let meta_tree = db.open_tree(META_TREE)?;

        let state = Self::load_state(&entries_tree, &meta_tree)?;

        let queue = Self {
            path,
            db,
            entries_tree,
            meta_tree,
            capacity: capacity.max(1),
            sync_writes,
            state: Mutex::new(state),
            notify: Notify::new(),
        };

        let recovered = queue.reset_in_flight()?;
        let stats = queue.stats()?;
        if stats.pending > 0 {
            info!(
                path = %queue.path.display(),
                pending = stats.pending,
                recovered_in_flight = recovered,
                "Sample queue opened with pending samples"
            );
        } else {
            debug!(path = %queue.path.display(), "Sample queue opened (empty)");
        }

        Ok(queue)
    }

    /// Wipe the queue directory. The only way back from `QueueError::Corrupted`.
    pub fn reinitialize<P: AsRef<Path>>(path: P) -> Result<(), QueueError> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_dir_all(path).map_err(|e| QueueError::Storage(e.to_string()))?;
            warn!(path = %path.display(), "Sample queue reinitialized — all queued samples discarded");
        }
        Ok(())
    }

    fn load_state(entries_tree: &sled::Tree, meta_tree: &sled::Tree) -> Result<QueueState, QueueError> {
        let mut state = QueueState::default();

        for item in entries_tree.iter() {
            let (key, value) = item?;
            let id = decode_u64(&key)
                .ok_or_else(|| QueueError::Corrupted(format!("invalid entry key {key:?}")))?;
            let entry: QueueEntry = serde_json::from_slice(&value)
                .map_err(|e| QueueError::Corrupted(format!("entry {id}: {e}")))?;
            if entry.id != id {
                return Err(QueueError::Corrupted(format!(
                    "entry key {id} holds entry {}",
                    entry.id
                )));
            }
            state.entries.insert(id, entry);
        }

        state.next_entry_id = read_counter(meta_tree, KEY_NEXT_ENTRY_ID)?;
        state.counters.delivered_total = read_counter(meta_tree, KEY_DELIVERED_TOTAL)?;
        state.counters.dead_total = read_counter(meta_tree, KEY_DEAD_TOTAL)?;
        state.counters.evicted_total = read_counter(meta_tree, KEY_EVICTED_TOTAL)?;

        for item in meta_tree.scan_prefix(SEQ_PREFIX) {
            let (key, value) = item?;
            let vehicle_id = key[SEQ_PREFIX.len()..]
                .try_into()
                .map(i64::from_be_bytes)
                .map_err(|_| QueueError::Corrupted(format!("invalid sequence key {key:?}")))?;
            let seq = decode_u64(&value)
                .ok_or_else(|| QueueError::Corrupted(format!("invalid sequence for vehicle {vehicle_id}")))?;
            state.sequences.insert(vehicle_id, seq);
        }

        // Ids must keep increasing even if the counter lags a stored entry.
        if let Some((&last_id, _)) = state.entries.iter().next_back() {
            state.next_entry_id = state.next_entry_id.max(last_id + 1);
        }

        Ok(state)
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::Storage("queue lock poisoned".to_string()))
    }

    fn commit(&self, commit: &Commit) -> Result<(), QueueError> {
        (&self.entries_tree, &self.meta_tree).transaction(|(entries, meta)| {
            entries.apply_batch(&commit.entries)?;
            meta.apply_batch(&commit.meta)?;
            Ok::<(), ConflictableTransactionError<()>>(())
        })?;
        Ok(())
    }

    /// Flush committed writes when `sync_writes` is set. Call without the state lock.
    fn persist(&self) -> Result<(), QueueError> {
        if self.sync_writes {
            self.db.flush()?;
        }
        Ok(())
    }

    /// Append a sample, assigning its per-vehicle sequence number.
    ///
    /// When the queue is full the oldest `Pending` entry is evicted (falling
    /// back to the oldest entry of any state) and counted as lost.
    pub fn enqueue(&self, mut sample: Sample) -> Result<QueueEntry, QueueError> {
        let mut state = self.lock()?;
        let mut commit = Commit::default();

        let excess = (state.entries.len() + 1).saturating_sub(self.capacity);
        let evicted: Vec<EntryId> = state
            .entries
            .values()
            .filter(|e| e.state == EntryState::Pending)
            .chain(state.entries.values().filter(|e| e.state != EntryState::Pending))
            .map(|e| e.id)
            .take(excess)
            .collect();
        for id in &evicted {
            commit.entries.remove(id_key(*id));
        }

        let seq = state.sequences.get(&sample.vehicle_id).copied().unwrap_or(0) + 1;
        sample.sequence_number = seq;

        let now = now_epoch_ms();
        let entry = QueueEntry {
            id: state.next_entry_id,
            sample,
            attempts: 0,
            next_retry_at_ms: now,
            state: EntryState::Pending,
            enqueued_at_ms: now,
        };

        commit
            .entries
            .insert(id_key(entry.id), encode_entry(&entry)?);
        commit
            .meta
            .insert(KEY_NEXT_ENTRY_ID, (entry.id + 1).to_be_bytes().to_vec());
        commit
            .meta
            .insert(seq_key(entry.sample.vehicle_id), seq.to_be_bytes().to_vec());

        let evicted_total = state.counters.evicted_total + evicted.len() as u64;
        if !evicted.is_empty() {
            commit
                .meta
                .insert(KEY_EVICTED_TOTAL, evicted_total.to_be_bytes().to_vec());
        }

        self.commit(&commit)?;

        for id in &evicted {
            if let Some(lost) = state.entries.remove(id) {
                warn!(
                    entry_id = id,
                    vehicle_id = lost.sample.vehicle_id,
                    sequence = lost.sample.sequence_number,
                    state = %lost.state,
                    capacity = self.capacity,
                    "Sample queue full — evicted oldest sample"
                );
            }
        }
        state.counters.evicted_total = evicted_total;
        state.next_entry_id = entry.id + 1;
        state.sequences.insert(entry.sample.vehicle_id, seq);
        state.entries.insert(entry.id, entry.clone());
        drop(state);
        self.persist()?;

        debug!(
            entry_id = entry.id,
            vehicle_id = entry.sample.vehicle_id,
            sequence = seq,
            "Sample queued for upload"
        );
        self.notify.notify_one();
        Ok(entry)
    }

    /// Reserve up to `max_size` eligible `Pending` entries (oldest first).
    ///
    /// A vehicle's samples are taken in sequence order only: once a `Pending`
    /// entry is found that is not yet due, later entries of that vehicle are
    /// skipped until it has gone out.
    pub fn take_batch(&self, max_size: usize) -> Result<Vec<QueueEntry>, QueueError> {
        self.take_batch_at(max_size, now_epoch_ms())
    }

    /// Like [`take_batch`](Self::take_batch) with an explicit clock (unix ms).
    pub fn take_batch_at(&self, max_size: usize, now_ms: i64) -> Result<Vec<QueueEntry>, QueueError> {
        if max_size == 0 {
            return Ok(Vec::new());
        }

        let mut state = self.lock()?;
        let mut waiting: HashSet<i64> = HashSet::new();
        let mut batch: Vec<QueueEntry> = Vec::new();
        for entry in state.entries.values() {
            if batch.len() == max_size {
                break;
            }
            if entry.state != EntryState::Pending || waiting.contains(&entry.sample.vehicle_id) {
                continue;
            }
            if entry.next_retry_at_ms > now_ms {
                waiting.insert(entry.sample.vehicle_id);
                continue;
            }
            batch.push(QueueEntry {
                state: EntryState::InFlight,
                ..entry.clone()
            });
        }

        if batch.is_empty() {
            return Ok(batch);
        }

        let mut commit = Commit::default();
        for entry in &batch {
            commit
                .entries
                .insert(id_key(entry.id), encode_entry(entry)?);
        }
        self.commit(&commit)?;

        for entry in &batch {
            state.entries.insert(entry.id, entry.clone());
        }
        drop(state);
        self.persist()?;

        Ok(batch)
    }

    /// Mark entries delivered and remove them. Unknown ids are ignored.
    pub fn ack(&self, ids: &[EntryId]) -> Result<usize, QueueError> {
        let mut state = self.lock()?;
        let present: Vec<EntryId> = ids
            .iter()
            .copied()
            .filter(|id| state.entries.contains_key(id))
            .collect();
        if present.is_empty() {
            return Ok(0);
        }

        let delivered_total = state.counters.delivered_total + present.len() as u64;
        let mut commit = Commit::default();
        for id in &present {
            commit.entries.remove(id_key(*id));
        }
        commit
            .meta
            .insert(KEY_DELIVERED_TOTAL, delivered_total.to_be_bytes().to_vec());
        self.commit(&commit)?;

        for id in &present {
            state.entries.remove(id);
        }
        state.counters.delivered_total = delivered_total;
        drop(state);
        self.persist()?;

        debug!(count = present.len(), "Samples delivered");
        Ok(present.len())
    }

    /// Return in-flight entries to `Pending` after a failed send, counting the attempt.
    pub fn requeue(&self, ids: &[EntryId], delay: Duration) -> Result<usize, QueueError> {
        self.release(ids, delay, true)
    }

    /// Return in-flight entries to `Pending` without counting an attempt.
    pub fn defer(&self, ids: &[EntryId], delay: Duration) -> Result<usize, QueueError> {
        self.release(ids, delay, false)
    }

    fn release(&self, ids: &[EntryId], delay: Duration, count_attempt: bool) -> Result<usize, QueueError> {
        let mut state = self.lock()?;
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let retry_at = now_epoch_ms().saturating_add(delay_ms);

        let updated: Vec<QueueEntry> = ids
            .iter()
            .filter_map(|id| state.entries.get(id))
            .filter(|e| e.state == EntryState::InFlight)
            .map(|e| QueueEntry {
                state: EntryState::Pending,
                attempts: if count_attempt { e.attempts + 1 } else { e.attempts },
                next_retry_at_ms: retry_at,
                ..e.clone()
            })
            .collect();
        if updated.is_empty() {
            return Ok(0);
        }

        let mut commit = Commit::default();
        for entry in &updated {
            commit
                .entries
                .insert(id_key(entry.id), encode_entry(entry)?);
        }
        self.commit(&commit)?;

        let count = updated.len();
        for entry in updated {
            state.entries.insert(entry.id, entry);
        }
        drop(state);
        self.persist()?;

        self.notify.notify_one();
        Ok(count)
    }

    /// Abandon entries: mark them dead, remove them and count them as lost.
    pub fn kill(&self, ids: &[EntryId]) -> Result<usize, QueueError> {
        let mut state = self.lock()?;
        let present: Vec<EntryId> = ids
            .iter()
            .copied()
            .filter(|id| state.entries.contains_key(id))
            .collect();
        if present.is_empty() {
            return Ok(0);
        }

        let dead_total = state.counters.dead_total + present.len() as u64;
        let mut commit = Commit::default();
        for id in &present {
            commit.entries.remove(id_key(*id));
        }
        commit.meta.insert(KEY_DEAD_TOTAL, dead_total.to_be_bytes().to_vec());
        self.commit(&commit)?;

        for id in &present {
            if let Some(dead) = state.entries.remove(id) {
                warn!(
                    entry_id = id,
                    vehicle_id = dead.sample.vehicle_id,
                    sequence = dead.sample.sequence_number,
                    attempts = dead.attempts,
                    state = %EntryState::Dead,
                    "Sample abandoned"
                );
            }
        }
        state.counters.dead_total = dead_total;
        drop(state);
        self.persist()?;

        Ok(present.len())
    }

    /// Reset every `InFlight` entry to `Pending`, eligible immediately.
    pub fn reset_in_flight(&self) -> Result<usize, QueueError> {
        let mut state = self.lock()?;
        let now = now_epoch_ms();
        let reset: Vec<QueueEntry> = state
            .entries
            .values()
            .filter(|e| e.state == EntryState::InFlight)
            .map(|e| QueueEntry {
                state: EntryState::Pending,
                next_retry_at_ms: e.next_retry_at_ms.min(now),
                ..e.clone()
            })
            .collect();
        if reset.is_empty() {
            return Ok(0);
        }

        let mut commit = Commit::default();
        for entry in &reset {
            commit
                .entries
                .insert(id_key(entry.id), encode_entry(entry)?);
        }
        self.commit(&commit)?;

        let count = reset.len();
        for entry in reset {
            state.entries.insert(entry.id, entry);
        }
        drop(state);
        self.persist()?;

        info!(count, "Reset in-flight samples to pending");
        Ok(count)
    }

    /// Earliest retry time (unix ms) among the oldest `Pending` entry of each
    /// vehicle. Later entries cannot go out before their vehicle's head does.
    pub fn next_eligible_at(&self) -> Result<Option<i64>, QueueError> {
        let state = self.lock()?;
        let mut heads: HashSet<i64> = HashSet::new();
        Ok(state
            .entries
            .values()
            .filter(|e| e.state == EntryState::Pending)
            .filter(|e| heads.insert(e.sample.vehicle_id))
            .map(|e| e.next_retry_at_ms)
            .min())
    }

    /// Wait for the next enqueue or requeue.
    ///
    /// A wake-up issued while nobody is waiting is kept, so an enqueue racing
    /// with an empty `take_batch` is not missed.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Snapshot of all entries in FIFO order
    pub fn entries(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let state = self.lock()?;
        Ok(state.entries.values().cloned().collect())
    }

    pub fn len(&self) -> Result<usize, QueueError> {
        Ok(self.lock()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.lock()?.entries.is_empty())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let state = self.lock()?;
        let (pending, in_flight) =
            state
                .entries
                .values()
                .fold((0, 0), |(p, f), e| match e.state {
                    EntryState::Pending => (p + 1, f),
                    EntryState::InFlight => (p, f + 1),
                    EntryState::Delivered | EntryState::Dead => (p, f),
                });
        let c = &state.counters;
        Ok(QueueStats {
            pending,
            in_flight,
            delivered_total: c.delivered_total,
            dead_total: c.dead_total,
            evicted_total: c.evicted_total,
            lost_total: c.dead_total + c.evicted_total,
        })
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<(), QueueError> {
        self.db.flush()?;
        Ok(())
    }
}

fn encode_entry(entry: &QueueEntry) -> Result<Vec<u8>, QueueError> {
    serde_json::to_vec(entry).map_err(|e| QueueError::Serialization(e.to_string()))
}

fn decode_u64(bytes: &[u8]) -> Option<u64> {
    bytes.try_into().ok().map(u64::from_be_bytes)
}

fn read_counter(tree: &sled::Tree, key: &[u8]) -> Result<u64, QueueError> {
    match tree.get(key)? {
        Some(value) => decode_u64(&value).ok_or_else(|| {
            QueueError::Corrupted(format!("invalid counter {}", String::from_utf8_lossy(key)))
        }),
        None => Ok(0),
    }
}

fn id_key(id: EntryId) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

fn seq_key(vehicle_id: i64) -> Vec<u8> {
    let mut key = SEQ_PREFIX.to_vec();
    key.extend_from_slice(&vehicle_id.to_be_bytes());
    key
}
