//! Single-threaded execution owner of one partition.
//!
//! Every fragment that touches the partition's engine runs on the executor's loop thread, in
//! arrival order. Procedure bodies run on helper threads and block on round latches while their
//! fragments execute. Commit and abort go through the same engine lane, so undo-token operations
//! never interleave with fragment execution.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, mpsc};
use std::thread::{self, JoinHandle};

use ptx_common::config::SiteConfig;
use ptx_common::error::{PtxError, PtxResult};
use ptx_common::ids::{DependencyId, NO_UNDO_TOKEN, PartitionId, TxnId, UndoToken};
use ptx_core::engine::ExecutionEngine;
use ptx_core::fragment::{
    ClientResponse, ClientStatus, CoordinatorReply, CoordinatorStatus, WorkItem,
};
use ptx_core::messenger::{Continuation, Messenger};
use ptx_core::registry::{ExecutorSnapshot, SysProcRegistry};
use ptx_core::table::ResultTable;
use ptx_transaction::latch::RoundLatch;
use ptx_transaction::state::{TransactionTable, TxnKind};
use tracing::{debug, info, trace, warn};

use crate::helper_pool::HelperPool;
use crate::procedure::{ProcedureCatalog, ProcedurePool};

#[path = "executor/round.rs"]
mod round;
#[path = "executor/worker.rs"]
mod worker;

/// Collaborators handed to an executor at startup.
pub struct ExecutorParts {
    /// Storage engine owned by the partition.
    pub engine: Box<dyn ExecutionEngine>,
    /// Transport to other partitions and the coordinator.
    pub messenger: Arc<dyn Messenger>,
    /// Frozen system-procedure fragment handlers.
    pub sysprocs: Arc<SysProcRegistry>,
    /// Frozen procedure factories.
    pub procedures: Arc<ProcedureCatalog>,
    /// Process-wide fragment error counter.
    pub error_counter: Arc<AtomicU64>,
}

impl std::fmt::Debug for ExecutorParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorParts")
            .field("sysprocs", &self.sysprocs)
            .field("procedures", &self.procedures)
            .finish_non_exhaustive()
    }
}

enum LoopCommand {
    Work(WorkItem),
    Shutdown,
}

struct EngineLane {
    engine: Box<dyn ExecutionEngine>,
    last_released: Option<UndoToken>,
    last_committed: Option<TxnId>,
}

#[derive(Default)]
struct Progress {
    current_txn: Option<TxnId>,
    last_executed: Option<TxnId>,
}

struct ExecutorShared {
    partition: PartitionId,
    config: SiteConfig,
    sender: mpsc::Sender<LoopCommand>,
    lane: Mutex<EngineLane>,
    table: Mutex<TransactionTable>,
    finished: Mutex<VecDeque<TxnId>>,
    next_undo_token: AtomicU64,
    messenger: Arc<dyn Messenger>,
    sysprocs: Arc<SysProcRegistry>,
    procedures: ProcedurePool,
    helpers: HelperPool,
    shutdown: AtomicBool,
    stopped: RoundLatch,
    queued: AtomicUsize,
    progress: Mutex<Progress>,
    error_counter: Arc<AtomicU64>,
}

/// Handle to one partition's executor thread.
pub struct PartitionExecutor {
    shared: Arc<ExecutorShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PartitionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionExecutor")
            .field("partition", &self.shared.partition)
            .field("queued", &self.shared.queued.load(Ordering::Acquire))
            .field("shutdown", &self.shared.shutdown.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl PartitionExecutor {
    /// Starts the executor thread and helper pool for `partition`.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidConfig` for bad configuration, or `PtxError::InvalidState` when
    /// a thread cannot be spawned.
    pub fn start(
        partition: PartitionId,
        config: &SiteConfig,
        parts: ExecutorParts,
    ) -> PtxResult<Self> {
        config.validate()?;
        if !config.partition_count.contains(partition) {
            return Err(PtxError::InvalidConfig("partition id is outside the site"));
        }

        let preload_states = config.scaled_preload(
            config.preload_local_txn_states + config.preload_remote_txn_states,
        );
        let preload_dependencies = config.scaled_preload(config.preload_dependency_infos);
        let (sender, receiver) = mpsc::channel();
        let shared = Arc::new(ExecutorShared {
            partition,
            config: config.clone(),
            sender,
            lane: Mutex::new(EngineLane {
                engine: parts.engine,
                last_released: None,
                last_committed: None,
            }),
            table: Mutex::new(TransactionTable::new(
                partition,
                preload_states,
                preload_dependencies,
            )),
            finished: Mutex::new(VecDeque::new()),
            next_undo_token: AtomicU64::new(1),
            messenger: parts.messenger,
            sysprocs: parts.sysprocs,
            procedures: ProcedurePool::new(parts.procedures),
            helpers: HelperPool::start(partition, config.helper_threads)?,
            shutdown: AtomicBool::new(false),
            stopped: RoundLatch::new(1),
            queued: AtomicUsize::new(0),
            progress: Mutex::new(Progress::default()),
            error_counter: parts.error_counter,
        });

        let loop_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("ptx-p{partition}-executor"))
            .spawn(move || worker::run(&loop_shared, &receiver))
            .map_err(|_| PtxError::InvalidState("failed to spawn executor thread"))?;
        info!(partition, preload_states, preload_dependencies, "partition executor started");

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Partition owned by this executor.
    #[must_use]
    pub fn partition_id(&self) -> PartitionId {
        self.shared.partition
    }

    /// Registers `item`'s transaction and continuation, then queues it for the loop thread.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::Shutdown` once the executor is stopping, or `PtxError::Unexpected`
    /// when the continuation kind does not match the work item.
    pub fn do_work(
        &self,
        item: WorkItem,
        continuation: Option<Continuation>,
        single_partitioned: bool,
    ) -> PtxResult<()> {
        self.shared.do_work(item, continuation, single_partitioned)
    }

    /// Ships one table produced for `txn_id` by `sender` into this partition's round.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::MissingTransaction` when this partition does not know the transaction.
    pub fn store_dependency(
        &self,
        txn_id: TxnId,
        sender: PartitionId,
        dep_id: DependencyId,
        table: ResultTable,
    ) -> PtxResult<()> {
        self.shared.store_dependency(txn_id, sender, dep_id, table)
    }

    /// Commits `txn_id` on this partition.
    ///
    /// Returns `false` when the transaction is unknown or already finished.
    ///
    /// # Errors
    ///
    /// Returns the engine's error when releasing the undo token fails.
    pub fn commit(&self, txn_id: TxnId) -> PtxResult<bool> {
        self.shared.commit(txn_id)
    }

    /// Aborts `txn_id` on this partition.
    ///
    /// Returns `false` when the transaction is unknown or already finished.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::OutOfOrderAbort` when a newer undo token was already released, or the
    /// engine's error when rolling back fails.
    pub fn abort(&self, txn_id: TxnId) -> PtxResult<bool> {
        self.shared.abort(txn_id)
    }

    /// Counters describing the executor right now.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when an executor mutex is poisoned.
    pub fn snapshot(&self) -> PtxResult<ExecutorSnapshot> {
        self.shared.snapshot()
    }

    /// Returns whether `txn_id` still has state on this partition.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when the transaction table mutex is poisoned.
    pub fn has_transaction(&self, txn_id: TxnId) -> PtxResult<bool> {
        Ok(self.shared.lock_table()?.contains(txn_id))
    }

    /// Returns whether the loop thread has stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.remaining() == 0
    }

    /// Blocks until the loop thread exits.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::Shutdown` if the stop latch was cancelled.
    pub fn wait_for_shutdown(&self) -> PtxResult<()> {
        self.shared.stopped.wait()
    }

    /// Stops the loop thread and helpers, waking every blocked procedure.
    pub fn shutdown(&self) {
        self.shared.begin_shutdown();
        let _ = self.shared.sender.send(LoopCommand::Shutdown);
        let worker = self
            .worker
            .lock()
            .map(|mut worker| worker.take())
            .unwrap_or_default();
        if let Some(worker) = worker
            && worker.thread().id() != thread::current().id()
        {
            let _ = worker.join();
        }
        self.shared.helpers.join();
    }
}

impl Drop for PartitionExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ExecutorShared {
    fn lock_table(&self) -> PtxResult<MutexGuard<'_, TransactionTable>> {
        self.table
            .lock()
            .map_err(|_| PtxError::InvalidState("transaction table mutex is poisoned"))
    }

    fn lock_lane(&self) -> PtxResult<MutexGuard<'_, EngineLane>> {
        self.lane
            .lock()
            .map_err(|_| PtxError::InvalidState("engine lane mutex is poisoned"))
    }

    fn lock_progress(&self) -> PtxResult<MutexGuard<'_, Progress>> {
        self.progress
            .lock()
            .map_err(|_| PtxError::InvalidState("executor progress mutex is poisoned"))
    }

    fn next_undo_token(&self) -> UndoToken {
        self.next_undo_token.fetch_add(1, Ordering::AcqRel)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn begin_shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(partition = self.partition, "executor shutdown requested");
        self.helpers.cancel();
        if let Ok(table) = self.table.lock() {
            table.cancel_waiters();
        }
    }

    fn record_error(&self) {
        let _ = self.error_counter.fetch_add(1, Ordering::AcqRel);
    }

    fn enqueue(&self, item: WorkItem) -> PtxResult<()> {
        if self.is_shutting_down() {
            return Err(PtxError::Shutdown);
        }
        let _ = self.queued.fetch_add(1, Ordering::AcqRel);
        if self.sender.send(LoopCommand::Work(item)).is_err() {
            let _ = self.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(PtxError::Shutdown);
        }
        Ok(())
    }

    fn do_work(
        &self,
        item: WorkItem,
        continuation: Option<Continuation>,
        single_partitioned: bool,
    ) -> PtxResult<()> {
        if self.is_shutting_down() {
            return Err(PtxError::Shutdown);
        }
        {
            let txn_id = item.txn_id();
            let source = item.source_partition();
            let kind = match &item {
                WorkItem::Fragment(_) if source != self.partition => TxnKind::Remote,
                _ => TxnKind::Local,
            };
            let mut table = self.lock_table()?;
            let state = table.get_or_insert(txn_id, item.client_handle(), source, kind)?;
            if matches!(item, WorkItem::Initiate(_)) || kind == TxnKind::Remote {
                state.set_predict_single_partition(single_partitioned);
            }
            match (&item, continuation) {
                (WorkItem::Initiate(_), Some(Continuation::Client(callback))) => {
                    state.set_client_callback(callback);
                }
                (WorkItem::Fragment(task), Some(Continuation::Fragment(callback))) => {
                    state.register_fragment_callback(task.task_id, callback);
                }
                (_, None) => {}
                (WorkItem::Initiate(_), Some(Continuation::Fragment(_))) => {
                    return Err(PtxError::Unexpected(format!(
                        "initiate task for txn #{txn_id} carries a fragment continuation"
                    )));
                }
                (WorkItem::Fragment(_), Some(Continuation::Client(_))) => {
                    return Err(PtxError::Unexpected(format!(
                        "fragment task for txn #{txn_id} carries a client continuation"
                    )));
                }
            }
        }
        trace!(
            partition = self.partition,
            txn_id = item.txn_id(),
            "work item queued"
        );
        self.enqueue(item)
    }

    fn store_dependency(
        self: &Arc<Self>,
        txn_id: TxnId,
        sender: PartitionId,
        dep_id: DependencyId,
        table: ResultTable,
    ) -> PtxResult<()> {
        let released = self
            .lock_table()?
            .record_result(txn_id, sender, dep_id, table)?;
        self.dispatch_batch(txn_id, released)
    }

    fn commit(&self, txn_id: TxnId) -> PtxResult<bool> {
        let mut lane = self.lock_lane()?;
        let (submitted, last_token) = {
            let table = self.lock_table()?;
            match table.get(txn_id) {
                Ok(state) if !state.is_finished() => {
                    (state.is_submitted_to_engine(), state.last_undo_token())
                }
                Ok(_) => {
                    debug!(partition = self.partition, txn_id, "commit for finished txn ignored");
                    return Ok(false);
                }
                Err(_) => {
                    debug!(partition = self.partition, txn_id, "commit for unknown txn ignored");
                    return Ok(false);
                }
            }
        };

        if submitted
            && let Some(token) = last_token
            && token != NO_UNDO_TOKEN
        {
            lane.engine.release_undo_token(token)?;
            lane.last_released = lane.last_released.max(Some(token));
        }
        lane.last_committed = Some(txn_id);
        self.lock_table()?.get_mut(txn_id)?.mark_finished();
        drop(lane);

        self.queue_finished(txn_id)?;
        debug!(partition = self.partition, txn_id, undo_token = ?last_token, "txn committed");
        Ok(true)
    }

    fn abort(&self, txn_id: TxnId) -> PtxResult<bool> {
        let mut lane = self.lock_lane()?;
        let (submitted, first_token) = {
            let table = self.lock_table()?;
            match table.get(txn_id) {
                Ok(state) if !state.is_finished() => {
                    (state.is_submitted_to_engine(), state.first_undo_token())
                }
                Ok(_) => {
                    debug!(partition = self.partition, txn_id, "abort for finished txn ignored");
                    return Ok(false);
                }
                Err(_) => {
                    debug!(partition = self.partition, txn_id, "abort for unknown txn ignored");
                    return Ok(false);
                }
            }
        };

        if submitted
            && let Some(token) = first_token
            && token != NO_UNDO_TOKEN
        {
            if let Some(released) = lane.last_released
                && token <= released
            {
                return Err(PtxError::OutOfOrderAbort {
                    txn_id,
                    undo_token: token,
                    released,
                });
            }
            lane.engine.undo_undo_token(token)?;
        }
        self.lock_table()?.get_mut(txn_id)?.mark_finished();
        drop(lane);

        self.queue_finished(txn_id)?;
        debug!(partition = self.partition, txn_id, undo_token = ?first_token, "txn aborted");
        Ok(true)
    }

    fn queue_finished(&self, txn_id: TxnId) -> PtxResult<()> {
        self.finished
            .lock()
            .map_err(|_| PtxError::InvalidState("finished queue mutex is poisoned"))?
            .push_back(txn_id);
        Ok(())
    }

    fn send_client_response(&self, response: ClientResponse) -> PtxResult<()> {
        let txn_id = response.txn_id;
        let (callback, single_local) = {
            let mut table = self.lock_table()?;
            let state = table.get_mut(txn_id)?;
            (
                state.take_client_callback(),
                state.predict_single_partition() && state.is_local(),
            )
        };

        let status = CoordinatorStatus::from(response.status);
        if single_local {
            let finished = if response.is_success() {
                self.commit(txn_id)
            } else {
                self.abort(txn_id)
            };
            if let Err(error) = finished {
                warn!(partition = self.partition, txn_id, %error, "inline finish failed");
            }
        }
        if response.status == ClientStatus::UnexpectedError {
            self.record_error();
        }
        debug!(
            partition = self.partition,
            txn_id,
            status = ?response.status,
            "client response ready"
        );

        match callback {
            Some(callback) => callback(CoordinatorReply {
                status,
                payload: response,
            }),
            None => warn!(partition = self.partition, txn_id, "no client continuation registered"),
        }
        Ok(())
    }

    fn load_table(&self, txn_id: TxnId, table_name: &str, data: ResultTable) -> PtxResult<()> {
        let mut lane = self.lock_lane()?;
        let undo_token = self.next_undo_token();
        {
            let mut table = self.lock_table()?;
            let state = table.get_mut(txn_id)?;
            state.note_undo_token(undo_token);
            state.mark_submitted_to_engine();
        }
        let last_committed = lane.last_committed;
        lane.engine
            .load_table(table_name, data, txn_id, last_committed, undo_token)?;
        debug!(partition = self.partition, txn_id, table_name, undo_token, "bulk load applied");
        Ok(())
    }

    fn snapshot(&self) -> PtxResult<ExecutorSnapshot> {
        let last_committed = self.lock_lane()?.last_committed;
        let progress = self.lock_progress()?;
        let (current_txn, last_executed) = (progress.current_txn, progress.last_executed);
        drop(progress);

        let table = self.lock_table()?;
        let mut txns_blocked = 0;
        let mut txns_waiting = 0;
        for state in table.iter() {
            if table.blocked_count(state.txn_id()).unwrap_or(0) > 0 {
                txns_blocked += 1;
            }
            if state.is_waiting() {
                txns_waiting += 1;
            }
        }
        Ok(ExecutorSnapshot {
            partition: self.partition,
            txns_total: table.len(),
            txns_queued: self.queued.load(Ordering::Acquire),
            txns_blocked,
            txns_waiting,
            current_txn,
            last_executed,
            last_committed,
        })
    }
}

#[cfg(test)]
#[path = "executor/tests.rs"]
mod tests;
