//! Per-grain transactional lock groups.
//!
//! Concurrent transactions touching one grain are batched into
//! [`LockGroup`]s of mutually non-conflicting members: many readers, or a
//! single writer. Groups form a queue; only the head group holds the
//! lock. A background worker lets members *exit* the lock once their
//! commit role is known and their timestamp precedes every still-pending
//! member's, feeding a timestamp-ordered commit queue; when the head
//! group empties, the next group takes the lock and its deferred tasks
//! run.
//!
//! The conflict rule: a read conflicts only with writers in its group;
//! two writers always conflict. An incoming access that conflicts with
//! strictly lower-priority siblings may resolve the conflict by rolling
//! them back; otherwise the upgrade fails.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Transaction identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// How a transaction will conclude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitRole {
    /// Still executing; outcome unknown.
    #[default]
    NotYetDetermined,
    /// Commits, coordinated by this grain's silo.
    LocalCommit,
    /// Commits, coordinated elsewhere.
    RemoteCommit,
    /// Read-only; completes without writes.
    ReadOnly,
    /// Aborting.
    Abort,
}

/// Reads and writes a caller believes it has performed so far. The lock
/// verifies these against its own records to detect torn call sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessCounts {
    /// Granted read accesses.
    pub reads: u32,
    /// Granted write accesses.
    pub writes: u32,
}

/// One transaction's standing within a lock group.
#[derive(Debug, Clone)]
pub struct TransactionRecord {
    /// Transaction identity.
    pub id: TxId,
    /// Priority timestamp (assigned at transaction start).
    pub priority: u64,
    /// Granted read accesses.
    pub read_count: u32,
    /// Granted write accesses.
    pub write_count: u32,
    /// Current commit role.
    pub role: CommitRole,
    /// Commit timestamp, once the role is determined.
    pub commit_timestamp: Option<u64>,
}

impl TransactionRecord {
    fn new(id: TxId, priority: u64, is_read: bool) -> Self {
        Self {
            id,
            priority,
            read_count: if is_read { 1 } else { 0 },
            write_count: if is_read { 0 } else { 1 },
            role: CommitRole::NotYetDetermined,
            commit_timestamp: None,
        }
    }

    /// Ordering timestamp: the commit timestamp once assigned, the
    /// priority timestamp until then.
    pub fn timestamp(&self) -> u64 {
        self.commit_timestamp.unwrap_or(self.priority)
    }

    /// Whether this member holds any write access.
    pub fn is_writer(&self) -> bool {
        self.write_count > 0
    }

    fn counts(&self) -> AccessCounts {
        AccessCounts {
            reads: self.read_count,
            writes: self.write_count,
        }
    }
}

/// Transactional lock failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// The lock and the caller disagree about the transaction's accesses,
    /// or the transaction is not where it should be.
    #[error("broken lock")]
    BrokenLock,
    /// Validation found the lock state changed underneath the caller.
    #[error("lock validation failed")]
    LockValidationFailed,
    /// A conflicting access could not be resolved by priority.
    #[error("lock upgrade failed")]
    LockUpgrade,
    /// The group deadline passed with members still undetermined.
    #[error("lock deadline exceeded")]
    LockDeadlineExceeded,
    /// The transaction was aborted.
    #[error("transaction aborted")]
    TransactionAborted,
}

/// Runs when the lock admits (or refuses) a deferred entry.
pub type LockTask = Box<dyn FnOnce(Result<(), LockError>) + Send>;

struct Waiter {
    tx: TxId,
    acquire_deadline: Option<Instant>,
    task: LockTask,
}

/// A batch of mutually non-conflicting transactions acquiring the lock
/// together.
struct LockGroup {
    records: HashMap<TxId, TransactionRecord>,
    /// Grows only on insert and is intentionally NOT decremented on
    /// rollback: a heavily rolled-back group closes earlier than strictly
    /// necessary.
    fill_count: usize,
    /// Absolute deadline once the group holds the lock.
    deadline: Option<Instant>,
    /// Tasks to run when the group takes the lock.
    waiting: Vec<Waiter>,
    /// Cached minimum timestamp among NotYetDetermined members.
    min_pending_cache: Option<Option<u64>>,
}

impl LockGroup {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            fill_count: 0,
            deadline: None,
            waiting: Vec::new(),
            min_pending_cache: None,
        }
    }

    /// Members conflicting with an access of the given mode, excluding
    /// the transaction itself.
    fn conflicting(&self, is_read: bool, exclude: TxId) -> Vec<TxId> {
        self.records
            .values()
            .filter(|r| r.id != exclude)
            .filter(|r| if is_read { r.is_writer() } else { true })
            .map(|r| r.id)
            .collect()
    }

    /// Whether a new member with the given mode fits without conflict.
    fn admits(&self, is_read: bool) -> bool {
        if is_read {
            !self.records.values().any(TransactionRecord::is_writer)
        } else {
            self.records.is_empty()
        }
    }

    fn insert(&mut self, record: TransactionRecord) {
        self.records.insert(record.id, record);
        self.fill_count += 1;
        self.min_pending_cache = None;
    }

    /// Minimum timestamp among still-undetermined members, cached.
    fn min_pending(&mut self) -> Option<u64> {
        if let Some(cached) = self.min_pending_cache {
            return cached;
        }
        let min = self
            .records
            .values()
            .filter(|r| r.role == CommitRole::NotYetDetermined)
            .map(TransactionRecord::timestamp)
            .min();
        self.min_pending_cache = Some(min);
        min
    }

    fn invalidate_cache(&mut self) {
        self.min_pending_cache = None;
    }
}

/// Lock manager tuning.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Maximum members per group.
    pub max_group_size: usize,
    /// How long a group may hold the lock with undetermined members.
    pub group_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_group_size: 20,
            group_timeout: Duration::from_secs(10),
        }
    }
}

/// Invoked, in commit-timestamp order, for every record that exits the
/// lock.
pub type CommitSink = Box<dyn Fn(TransactionRecord) + Send + Sync>;

struct LockState {
    current: LockGroup,
    queued: VecDeque<LockGroup>,
    /// Exited records awaiting the commit sink, timestamp-ordered.
    commit_queue: BTreeMap<(u64, TxId), TransactionRecord>,
    /// Failure verdicts for transactions broken by deadline or abort,
    /// consumed by the next `validate`.
    poisoned: HashMap<TxId, LockError>,
}

struct LockInner {
    state: Mutex<LockState>,
    notify: Notify,
    config: LockConfig,
    on_exit: CommitSink,
}

/// The per-grain transactional lock.
pub struct LockManager {
    inner: Arc<LockInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for LockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("LockManager")
            .field("current_members", &state.current.records.len())
            .field("queued_groups", &state.queued.len())
            .finish()
    }
}

impl LockManager {
    /// Lock with the given tuning; exited records flow to `on_exit` in
    /// timestamp order.
    pub fn new(config: LockConfig, on_exit: CommitSink) -> Self {
        let inner = Arc::new(LockInner {
            state: Mutex::new(LockState {
                current: LockGroup::new(),
                queued: VecDeque::new(),
                commit_queue: BTreeMap::new(),
                poisoned: HashMap::new(),
            }),
            notify: Notify::new(),
            config,
            on_exit,
        });
        let worker = tokio::spawn(exit_worker(inner.clone()));
        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Request an access for `tx`, scheduling `task` to run when the
    /// chosen group holds the lock (immediately when it already does).
    ///
    /// `expected` must match the accesses already granted to `tx` here;
    /// a mismatch fails the task with `BrokenLock`.
    pub fn enter(
        &self,
        tx: TxId,
        priority: u64,
        expected: AccessCounts,
        is_read: bool,
        acquire_deadline: Option<Duration>,
        task: LockTask,
    ) {
        let mut runnables: Vec<(LockTask, Result<(), LockError>)> = Vec::new();
        {
            let mut state = self.inner.state.lock();

            // Already a member somewhere?
            if let Some(group_index) = find_group(&state, tx) {
                let group = group_at(&mut state, group_index);
                let record = group.records.get(&tx).cloned();
                let Some(record) = record else {
                    runnables.push((task, Err(LockError::BrokenLock)));
                    drop(state);
                    return run_all(runnables);
                };
                if record.counts() != expected {
                    debug!(%tx, ?expected, "access count mismatch on enter");
                    runnables.push((task, Err(LockError::BrokenLock)));
                    drop(state);
                    return run_all(runnables);
                }

                let conflicting = group.conflicting(is_read, tx);
                let mut poisoned: Vec<TxId> = Vec::new();
                if !conflicting.is_empty() {
                    let resolvable = conflicting.iter().all(|other| {
                        group
                            .records
                            .get(other)
                            .is_some_and(|r| r.priority < priority)
                    });
                    if !resolvable {
                        runnables.push((task, Err(LockError::LockUpgrade)));
                        drop(state);
                        return run_all(runnables);
                    }
                    // Higher priority than every conflicting sibling:
                    // roll them back to make room.
                    for other in conflicting {
                        debug!(%tx, loser = %other, "priority conflict, rolling back sibling");
                        group.records.remove(&other);
                        group.invalidate_cache();
                        let (keep, fail): (Vec<Waiter>, Vec<Waiter>) =
                            group.waiting.drain(..).partition(|w| w.tx != other);
                        group.waiting = keep;
                        for waiter in fail {
                            runnables.push((waiter.task, Err(LockError::TransactionAborted)));
                        }
                        poisoned.push(other);
                    }
                }

                if let Some(record) = group.records.get_mut(&tx) {
                    if is_read {
                        record.read_count += 1;
                    } else {
                        record.write_count += 1;
                    }
                }
                group.invalidate_cache();

                if group_index == 0 {
                    runnables.push((task, Ok(())));
                } else {
                    group.waiting.push(Waiter {
                        tx,
                        acquire_deadline: acquire_deadline.map(|d| Instant::now() + d),
                        task,
                    });
                }
                for other in poisoned {
                    state.poisoned.insert(other, LockError::TransactionAborted);
                }
            } else {
                // New member: first group with room whose conflict check
                // passes, else a fresh group at the tail. An incoming
                // transaction never rolls back members to get a seat.
                let max = self.inner.config.max_group_size;
                let chosen = {
                    let mut found = None;
                    if state.current.fill_count < max && state.current.admits(is_read) {
                        found = Some(0);
                    } else {
                        for (i, group) in state.queued.iter().enumerate() {
                            if group.fill_count < max && group.admits(is_read) {
                                found = Some(i + 1);
                                break;
                            }
                        }
                    }
                    found
                };
                let index = match chosen {
                    Some(index) => index,
                    None => {
                        state.queued.push_back(LockGroup::new());
                        state.queued.len()
                    }
                };
                let group = group_at(&mut state, index);
                group.insert(TransactionRecord::new(tx, priority, is_read));
                if index == 0 {
                    runnables.push((task, Ok(())));
                } else {
                    group.waiting.push(Waiter {
                        tx,
                        acquire_deadline: acquire_deadline.map(|d| Instant::now() + d),
                        task,
                    });
                }
            }
        }
        self.inner.notify.notify_one();
        run_all(runnables);
    }

    /// Awaitable wrapper over [`enter`](Self::enter).
    ///
    /// # Errors
    ///
    /// Whatever the deferred task would have been failed with.
    pub async fn acquire(
        &self,
        tx: TxId,
        priority: u64,
        expected: AccessCounts,
        is_read: bool,
        acquire_deadline: Option<Duration>,
    ) -> Result<(), LockError> {
        let (sender, receiver) = oneshot::channel();
        self.enter(
            tx,
            priority,
            expected,
            is_read,
            acquire_deadline,
            Box::new(move |outcome| {
                let _ = sender.send(outcome);
            }),
        );
        receiver.await.unwrap_or(Err(LockError::TransactionAborted))
    }

    /// Verify `tx` still holds the lock with the expected accesses.
    ///
    /// # Errors
    ///
    /// `BrokenLock` when the transaction is not in the current group (the
    /// poisoned verdict from a deadline abort takes precedence);
    /// `LockValidationFailed` — with rollback — on a count mismatch.
    pub fn validate(
        &self,
        tx: TxId,
        expected: AccessCounts,
    ) -> Result<TransactionRecord, LockError> {
        let mut state = self.inner.state.lock();
        if let Some(verdict) = state.poisoned.remove(&tx) {
            return Err(verdict);
        }
        let Some(record) = state.current.records.get(&tx).cloned() else {
            return Err(LockError::BrokenLock);
        };
        if record.counts() != expected {
            state.current.records.remove(&tx);
            state.current.invalidate_cache();
            drop(state);
            self.inner.notify.notify_one();
            return Err(LockError::LockValidationFailed);
        }
        Ok(record)
    }

    /// Fix a transaction's outcome; determined members become eligible to
    /// exit the lock.
    ///
    /// # Errors
    ///
    /// `BrokenLock` when the transaction is not held here.
    pub fn set_role(
        &self,
        tx: TxId,
        role: CommitRole,
        commit_timestamp: Option<u64>,
    ) -> Result<(), LockError> {
        {
            let mut state = self.inner.state.lock();
            let Some(index) = find_group(&state, tx) else {
                return Err(LockError::BrokenLock);
            };
            let group = group_at(&mut state, index);
            let Some(record) = group.records.get_mut(&tx) else {
                return Err(LockError::BrokenLock);
            };
            record.role = role;
            record.commit_timestamp = commit_timestamp;
            group.invalidate_cache();
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Remove `tx` from whichever group holds it; pending waiters of the
    /// transaction fail with `TransactionAborted`.
    pub fn rollback(&self, tx: TxId) {
        let mut runnables: Vec<(LockTask, Result<(), LockError>)> = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if let Some(index) = find_group(&state, tx) {
                let group = group_at(&mut state, index);
                group.records.remove(&tx);
                group.invalidate_cache();
                let (keep, fail): (Vec<Waiter>, Vec<Waiter>) =
                    group.waiting.drain(..).partition(|w| w.tx != tx);
                group.waiting = keep;
                for waiter in fail {
                    runnables.push((waiter.task, Err(LockError::TransactionAborted)));
                }
            }
        }
        self.inner.notify.notify_one();
        run_all(runnables);
    }

    /// Break every member of the current group.
    pub fn abort_all(&self, verdict: LockError) -> Vec<TxId> {
        let aborted: Vec<TxId> = {
            let mut state = self.inner.state.lock();
            let ids: Vec<TxId> = state.current.records.keys().copied().collect();
            for id in &ids {
                state.current.records.remove(id);
                state.poisoned.insert(*id, verdict.clone());
            }
            state.current.invalidate_cache();
            ids
        };
        self.inner.notify.notify_one();
        aborted
    }

    /// Members of the group currently holding the lock (diagnostics).
    pub fn current_members(&self) -> Vec<TransactionRecord> {
        self.inner.state.lock().current.records.values().cloned().collect()
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

fn run_all(runnables: Vec<(LockTask, Result<(), LockError>)>) {
    for (task, outcome) in runnables {
        task(outcome);
    }
}

/// Index of the group containing `tx`: 0 = current, n+1 = queued[n].
fn find_group(state: &LockState, tx: TxId) -> Option<usize> {
    if state.current.records.contains_key(&tx) {
        return Some(0);
    }
    state
        .queued
        .iter()
        .position(|g| g.records.contains_key(&tx))
        .map(|i| i + 1)
}

fn group_at(state: &mut LockState, index: usize) -> &mut LockGroup {
    if index == 0 {
        &mut state.current
    } else {
        &mut state.queued[index - 1]
    }
}

/// The lock-exit worker: ticks on notification and on the group deadline.
async fn exit_worker(inner: Arc<LockInner>) {
    loop {
        let (runnables, exits, next_deadline) = {
            let mut state = inner.state.lock();
            let mut runnables: Vec<(LockTask, Result<(), LockError>)> = Vec::new();
            let now = Instant::now();

            if !state.current.records.is_empty() {
                // Determined members strictly below the pending minimum
                // exit to the commit queue.
                let min_pending = state.current.min_pending();
                let eligible: Vec<TxId> = state
                    .current
                    .records
                    .values()
                    .filter(|r| r.role != CommitRole::NotYetDetermined)
                    .filter(|r| min_pending.is_none_or(|min| r.timestamp() < min))
                    .map(|r| r.id)
                    .collect();
                for id in eligible {
                    if let Some(record) = state.current.records.remove(&id) {
                        debug!(tx = %id, ts = record.timestamp(), "transaction exits lock");
                        state
                            .commit_queue
                            .insert((record.timestamp(), id), record);
                    }
                }
                state.current.invalidate_cache();

                // Deadline passed with members still undetermined: abort
                // every executing member.
                if let Some(deadline) = state.current.deadline
                    && now > deadline
                    && state.current.min_pending().is_some()
                {
                    warn!("lock group deadline exceeded, aborting members");
                    let ids: Vec<TxId> = state.current.records.keys().copied().collect();
                    for id in ids {
                        state.current.records.remove(&id);
                        state.poisoned.insert(id, LockError::LockDeadlineExceeded);
                    }
                    state.current.invalidate_cache();
                }
            }

            // Empty head: the next group takes the lock.
            if state.current.records.is_empty() && !state.queued.is_empty() {
                let mut next = match state.queued.pop_front() {
                    Some(next) => next,
                    None => LockGroup::new(),
                };
                next.deadline = Some(now + inner.config.group_timeout);

                let mut admitted: Vec<Waiter> = Vec::new();
                for waiter in next.waiting.drain(..) {
                    if !next.records.contains_key(&waiter.tx) {
                        runnables.push((waiter.task, Err(LockError::TransactionAborted)));
                    } else if waiter
                        .acquire_deadline
                        .is_some_and(|deadline| now > deadline)
                    {
                        next.records.remove(&waiter.tx);
                        next.min_pending_cache = None;
                        runnables.push((waiter.task, Err(LockError::LockDeadlineExceeded)));
                    } else {
                        admitted.push(waiter);
                    }
                }
                state.current = next;
                for waiter in admitted {
                    runnables.push((waiter.task, Ok(())));
                }
            }

            // An idle head keeps no deadline; otherwise a stale past
            // deadline would spin the worker.
            if state.current.records.is_empty() && state.queued.is_empty() {
                state.current.deadline = None;
            }

            // Drain exits in timestamp order.
            let mut exits = Vec::new();
            while let Some((_, record)) = state.commit_queue.pop_first() {
                exits.push(record);
            }

            (runnables, exits, state.current.deadline)
        };

        run_all(runnables);
        for record in exits {
            (inner.on_exit)(record);
        }

        match next_deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = inner.notify.notified() => {}
                    _ = tokio::time::sleep_until(deadline + Duration::from_millis(1)) => {}
                }
            }
            None => inner.notify.notified().await,
        }
    }
}

/// Transaction metadata a caller threads through state operations.
#[derive(Debug, Clone, Copy)]
pub struct TransactionInfo {
    /// Transaction identity.
    pub id: TxId,
    /// Priority timestamp.
    pub priority: u64,
}

struct TxStateInner<T> {
    committed: Mutex<T>,
    pending: Mutex<HashMap<TxId, T>>,
    applied: Notify,
}

/// Copy-on-write transactional state for one grain, ordered by a
/// [`LockManager`].
///
/// Reads see the transaction's own pending copy (or the committed value);
/// writes mutate the pending copy; commit order is whatever the lock-exit
/// worker decides from commit timestamps.
pub struct TransactionalState<T: Clone + Send + 'static> {
    inner: Arc<TxStateInner<T>>,
    lock: LockManager,
    counts: Mutex<HashMap<TxId, AccessCounts>>,
}

impl<T: Clone + Send + fmt::Debug + 'static> fmt::Debug for TransactionalState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalState")
            .field("committed", &*self.inner.committed.lock())
            .finish()
    }
}

impl<T: Clone + Send + 'static> TransactionalState<T> {
    /// Transactional state starting from `initial`.
    pub fn new(initial: T, config: LockConfig) -> Self {
        let inner = Arc::new(TxStateInner {
            committed: Mutex::new(initial),
            pending: Mutex::new(HashMap::new()),
            applied: Notify::new(),
        });
        let sink_inner = inner.clone();
        let lock = LockManager::new(
            config,
            Box::new(move |record: TransactionRecord| {
                let value = sink_inner.pending.lock().remove(&record.id);
                if record.role == CommitRole::LocalCommit
                    && let Some(value) = value
                {
                    *sink_inner.committed.lock() = value;
                }
                sink_inner.applied.notify_waiters();
            }),
        );
        Self {
            inner,
            lock,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// The lock ordering access to this state.
    pub fn lock(&self) -> &LockManager {
        &self.lock
    }

    /// Read under the transaction.
    ///
    /// # Errors
    ///
    /// Lock acquisition failures.
    pub async fn read(&self, tx: &TransactionInfo) -> Result<T, LockError> {
        let expected = self.counts.lock().get(&tx.id).copied().unwrap_or_default();
        self.lock
            .acquire(tx.id, tx.priority, expected, true, Some(Duration::from_secs(5)))
            .await?;
        self.counts.lock().entry(tx.id).or_default().reads += 1;

        let pending = self.inner.pending.lock();
        Ok(match pending.get(&tx.id) {
            Some(copy) => copy.clone(),
            None => self.inner.committed.lock().clone(),
        })
    }

    /// Mutate the transaction's working copy.
    ///
    /// # Errors
    ///
    /// Lock acquisition failures.
    pub async fn update(
        &self,
        tx: &TransactionInfo,
        mutate: impl FnOnce(&mut T),
    ) -> Result<(), LockError> {
        let expected = self.counts.lock().get(&tx.id).copied().unwrap_or_default();
        self.lock
            .acquire(tx.id, tx.priority, expected, false, Some(Duration::from_secs(5)))
            .await?;
        self.counts.lock().entry(tx.id).or_default().writes += 1;

        let mut pending = self.inner.pending.lock();
        let entry = pending
            .entry(tx.id)
            .or_insert_with(|| self.inner.committed.lock().clone());
        mutate(entry);
        Ok(())
    }

    /// Declare the transaction committing at `commit_timestamp` and wait
    /// for the write to apply.
    ///
    /// # Errors
    ///
    /// Validation and lock failures.
    pub async fn commit(
        &self,
        tx: &TransactionInfo,
        commit_timestamp: u64,
    ) -> Result<(), LockError> {
        let expected = self.counts.lock().get(&tx.id).copied().unwrap_or_default();
        self.lock.validate(tx.id, expected)?;
        self.lock
            .set_role(tx.id, CommitRole::LocalCommit, Some(commit_timestamp))?;

        // The exit worker applies the write; wait for it.
        loop {
            if !self.inner.pending.lock().contains_key(&tx.id) {
                break;
            }
            let wait = self.inner.applied.notified();
            if tokio::time::timeout(Duration::from_secs(10), wait).await.is_err() {
                return Err(LockError::LockDeadlineExceeded);
            }
        }
        self.counts.lock().remove(&tx.id);
        Ok(())
    }

    /// Abort the transaction, discarding its working copy.
    pub fn abort(&self, tx: &TransactionInfo) {
        self.lock.rollback(tx.id);
        self.inner.pending.lock().remove(&tx.id);
        self.counts.lock().remove(&tx.id);
    }

    /// The committed value.
    pub fn committed(&self) -> T {
        self.inner.committed.lock().clone()
    }
}
