//! Partition lock queues that admit transactions in global id order.
//!
//! A request names every partition its transaction needs and is granted all of them at once or
//! none. Older transactions win: a request is skipped while any partition it needs is held, or
//! is wanted by an older request that is also eligible in the same pass.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use ptx_common::config::SiteConfig;
use ptx_common::error::{PtxError, PtxResult};
use ptx_common::ids::{PartitionCount, PartitionId, TxnId};
use ptx_core::containers::{HotMap, HotSet};
use ptx_core::fragment::CoordinatorStatus;
use tracing::{debug, trace, warn};

/// Continuation invoked once when a lock request is granted (`Ok`) or cancelled (`Rejected`).
pub type LockCallback = Box<dyn FnOnce(CoordinatorStatus) + Send>;

struct LockRequest {
    partitions: Vec<PartitionId>,
    callback: LockCallback,
    is_dtxn: bool,
    inserted_at: Instant,
}

#[derive(Default)]
struct QueueState {
    pending: BTreeMap<TxnId, LockRequest>,
    per_partition: Vec<BTreeSet<TxnId>>,
    holders: Vec<Option<TxnId>>,
    held: HotMap<TxnId, Vec<PartitionId>>,
}

/// Site-wide admission control over partition locks.
pub struct TransactionQueueManager {
    partition_count: PartitionCount,
    incoming_delay: Duration,
    state: Mutex<QueueState>,
}

impl std::fmt::Debug for TransactionQueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionQueueManager")
            .field("partition_count", &self.partition_count)
            .field("incoming_delay", &self.incoming_delay)
            .finish_non_exhaustive()
    }
}

impl TransactionQueueManager {
    /// Creates empty queues for `partition_count` partitions.
    #[must_use]
    pub fn new(partition_count: PartitionCount, incoming_delay: Duration) -> Self {
        let partitions = usize::from(partition_count.get());
        Self {
            partition_count,
            incoming_delay,
            state: Mutex::new(QueueState {
                per_partition: vec![BTreeSet::new(); partitions],
                holders: vec![None; partitions],
                ..QueueState::default()
            }),
        }
    }

    /// Creates queues sized and timed from site configuration.
    #[must_use]
    pub fn from_config(config: &SiteConfig) -> Self {
        Self::new(config.partition_count, config.txn_incoming_delay)
    }

    fn lock(&self) -> PtxResult<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| PtxError::InvalidState("transaction queue mutex is poisoned"))
    }

    /// Queues a lock request for every partition in `partitions`.
    ///
    /// Returns `false` (and drops `callback`) when the partition set is empty or out of range,
    /// or when `txn_id` is already pending or holding locks. Acceptance does not grant.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when the queue mutex is poisoned.
    pub fn lock_queue_insert(
        &self,
        txn_id: TxnId,
        partitions: &[PartitionId],
        callback: LockCallback,
        is_dtxn: bool,
    ) -> PtxResult<bool> {
        let mut wanted = partitions.to_vec();
        wanted.sort_unstable();
        wanted.dedup();
        if wanted.is_empty()
            || wanted
                .iter()
                .any(|partition| !self.partition_count.contains(*partition))
        {
            debug!(txn_id, ?partitions, "rejecting lock request with invalid partitions");
            return Ok(false);
        }

        let mut state = self.lock()?;
        if state.pending.contains_key(&txn_id) || state.held.contains_key(&txn_id) {
            debug!(txn_id, "rejecting duplicate lock request");
            return Ok(false);
        }
        for partition in &wanted {
            let _ = state.per_partition[usize::from(*partition)].insert(txn_id);
        }
        trace!(txn_id, partitions = ?wanted, is_dtxn, "lock request queued");
        let _ = state.pending.insert(
            txn_id,
            LockRequest {
                partitions: wanted,
                callback,
                is_dtxn,
                inserted_at: Instant::now(),
            },
        );
        Ok(true)
    }

    /// Runs one grant pass at the current instant.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when the queue mutex is poisoned.
    pub fn check_lock_queues(&self) -> PtxResult<bool> {
        self.check_lock_queues_at(Instant::now())
    }

    /// Runs one grant pass as if the clock read `now`.
    ///
    /// Returns whether at least one request was granted. Grant callbacks run after the queue
    /// mutex is released.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when the queue mutex is poisoned.
    pub fn check_lock_queues_at(&self, now: Instant) -> PtxResult<bool> {
        let mut granted = Vec::new();
        {
            let mut guard = self.lock()?;
            let state = &mut *guard;
            let eligible: Vec<TxnId> = state
                .pending
                .iter()
                .filter(|(_, request)| {
                    now.saturating_duration_since(request.inserted_at) >= self.incoming_delay
                })
                .map(|(txn_id, _)| *txn_id)
                .collect();

            let mut claimed = HotSet::new();
            for txn_id in eligible {
                let Some(request) = state.pending.get(&txn_id) else {
                    continue;
                };
                let grantable = request.partitions.iter().all(|partition| {
                    state.holders[usize::from(*partition)].is_none()
                        && !claimed.contains(partition)
                });
                claimed.extend(request.partitions.iter().copied());
                if !grantable {
                    continue;
                }

                let Some(request) = state.pending.remove(&txn_id) else {
                    continue;
                };
                for partition in &request.partitions {
                    let index = usize::from(*partition);
                    state.holders[index] = Some(txn_id);
                    let _ = state.per_partition[index].remove(&txn_id);
                }
                debug!(
                    txn_id,
                    partitions = ?request.partitions,
                    is_dtxn = request.is_dtxn,
                    "lock request granted"
                );
                let _ = state.held.insert(txn_id, request.partitions);
                granted.push(request.callback);
            }
        }

        let any = !granted.is_empty();
        for callback in granted {
            callback(CoordinatorStatus::Ok);
        }
        Ok(any)
    }

    /// Releases `partition` for `txn_id`, or cancels the request if it was never granted.
    ///
    /// Releasing never grants by itself; waiting requests move on the next check.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when the queue mutex is poisoned.
    pub fn lock_queue_finished(
        &self,
        txn_id: TxnId,
        status: CoordinatorStatus,
        partition: PartitionId,
    ) -> PtxResult<()> {
        let cancelled = {
            let mut guard = self.lock()?;
            let state = &mut *guard;
            if let Some(request) = state.pending.remove(&txn_id) {
                for queued in &request.partitions {
                    let _ = state.per_partition[usize::from(*queued)].remove(&txn_id);
                }
                Some(request.callback)
            } else {
                if let Some(held) = state.held.get_mut(&txn_id) {
                    if let Some(holder) = state.holders.get_mut(usize::from(partition))
                        && *holder == Some(txn_id)
                    {
                        *holder = None;
                        held.retain(|owned| *owned != partition);
                    }
                    if held.is_empty() {
                        let _ = state.held.remove(&txn_id);
                    }
                } else {
                    trace!(txn_id, partition, "release for transaction without locks");
                }
                None
            }
        };

        if let Some(callback) = cancelled {
            debug!(txn_id, ?status, "pending lock request cancelled");
            callback(CoordinatorStatus::Rejected);
        } else {
            trace!(txn_id, partition, ?status, "partition lock released");
        }
        Ok(())
    }

    /// Returns whether no request is waiting.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when the queue mutex is poisoned.
    pub fn is_lock_queues_empty(&self) -> PtxResult<bool> {
        Ok(self.lock()?.pending.is_empty())
    }

    /// Transaction currently holding `partition`.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when the queue mutex is poisoned.
    pub fn holder_of(&self, partition: PartitionId) -> PtxResult<Option<TxnId>> {
        let state = self.lock()?;
        Ok(state
            .holders
            .get(usize::from(partition))
            .copied()
            .flatten())
    }

    /// Number of requests not yet granted.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when the queue mutex is poisoned.
    pub fn pending_count(&self) -> PtxResult<usize> {
        Ok(self.lock()?.pending.len())
    }

    /// Number of requests waiting for `partition`.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when the queue mutex is poisoned.
    pub fn queue_depth(&self, partition: PartitionId) -> PtxResult<usize> {
        let state = self.lock()?;
        Ok(state
            .per_partition
            .get(usize::from(partition))
            .map_or(0, BTreeSet::len))
    }

    /// Starts a thread that runs a grant pass every `interval` until the handle stops.
    #[must_use]
    pub fn spawn_checker(self: &Arc<Self>, interval: Duration) -> CheckerHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let manager = Arc::clone(self);
        let stop_flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !stop_flag.load(Ordering::Acquire) {
                if let Err(error) = manager.check_lock_queues() {
                    warn!(%error, "lock queue checker stopped");
                    break;
                }
                thread::sleep(interval);
            }
        });
        CheckerHandle {
            stop,
            handle: Some(handle),
        }
    }
}

/// Stops the background lock checker when dropped.
#[derive(Debug)]
pub struct CheckerHandle {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CheckerHandle {
    /// Signals the checker and waits for it to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CheckerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
