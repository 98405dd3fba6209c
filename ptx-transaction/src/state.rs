//! Per-partition transaction states and the table that owns them.
//!
//! A state lives from the first task that names its transaction until cleanup after commit or
//! abort. States and their per-round dependency records are arena slots, so finished
//! transactions hand their memory straight to the next ones.

use std::sync::Arc;

use ptx_common::error::{PtxError, PtxResult};
use ptx_common::ids::{ClientHandle, DependencyId, FragmentTaskId, PartitionId, TxnId, UndoToken};
use ptx_core::containers::HotMap;
use ptx_core::fragment::FragmentTask;
use ptx_core::messenger::{ClientCallback, FragmentCallback};
use ptx_core::procedure::BoundProcedure;
use ptx_core::table::ResultTable;
use tracing::trace;

use crate::dependency::DependencyInfo;
use crate::latch::RoundLatch;
use crate::pool::{ArenaStats, Reusable, SlotArena, SlotId};

/// Where a transaction originated relative to the owning partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TxnKind {
    /// Initiated here; the procedure runs on this partition.
    #[default]
    Local,
    /// Initiated elsewhere; this partition only executes fragments.
    Remote,
}

/// Everything one partition knows about one transaction.
#[derive(Default)]
pub struct TransactionState {
    txn_id: TxnId,
    client_handle: ClientHandle,
    source_partition: PartitionId,
    kind: TxnKind,
    predict_single_partition: bool,
    first_undo_token: Option<UndoToken>,
    last_undo_token: Option<UndoToken>,
    round: u32,
    dependencies: HotMap<DependencyId, SlotId>,
    dependency_order: Vec<DependencyId>,
    expected: usize,
    received: usize,
    latch: Option<Arc<RoundLatch>>,
    submitted_to_engine: bool,
    finished: bool,
    pending_error: Option<PtxError>,
    procedure: Option<BoundProcedure>,
    client_callback: Option<ClientCallback>,
    fragment_callbacks: HotMap<FragmentTaskId, FragmentCallback>,
    next_task_id: FragmentTaskId,
}

impl std::fmt::Debug for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionState")
            .field("txn_id", &self.txn_id)
            .field("source_partition", &self.source_partition)
            .field("kind", &self.kind)
            .field("round", &self.round)
            .field("first_undo_token", &self.first_undo_token)
            .field("last_undo_token", &self.last_undo_token)
            .field("expected", &self.expected)
            .field("received", &self.received)
            .field("submitted_to_engine", &self.submitted_to_engine)
            .field("finished", &self.finished)
            .field("pending_error", &self.pending_error)
            .field("fragment_callbacks", &self.fragment_callbacks.len())
            .finish_non_exhaustive()
    }
}

impl Reusable for TransactionState {
    fn reset(&mut self) {
        *self = Self::default();
    }
}

impl TransactionState {
    /// Transaction id.
    #[must_use]
    pub const fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// Client handle from the initiate task.
    #[must_use]
    pub const fn client_handle(&self) -> ClientHandle {
        self.client_handle
    }

    /// Returns whether the transaction was initiated on this partition.
    #[must_use]
    pub const fn is_local(&self) -> bool {
        matches!(self.kind, TxnKind::Local)
    }

    /// Returns whether the coordinator predicted a single-partition transaction.
    #[must_use]
    pub const fn predict_single_partition(&self) -> bool {
        self.predict_single_partition
    }

    /// Sets the single-partition prediction.
    pub fn set_predict_single_partition(&mut self, single: bool) {
        self.predict_single_partition = single;
    }

    /// First undo token issued for this transaction.
    #[must_use]
    pub const fn first_undo_token(&self) -> Option<UndoToken> {
        self.first_undo_token
    }

    /// Latest undo token issued for this transaction.
    #[must_use]
    pub const fn last_undo_token(&self) -> Option<UndoToken> {
        self.last_undo_token
    }

    /// Records an undo token issued for this transaction's writes.
    pub fn note_undo_token(&mut self, undo_token: UndoToken) {
        let _ = self.first_undo_token.get_or_insert(undo_token);
        self.last_undo_token = Some(undo_token);
    }

    /// Current round number, starting at 1 after the first `begin_round`.
    #[must_use]
    pub const fn round(&self) -> u32 {
        self.round
    }

    /// Returns whether the engine executed anything for this transaction.
    #[must_use]
    pub const fn is_submitted_to_engine(&self) -> bool {
        self.submitted_to_engine
    }

    /// Notes that the engine now holds work for this transaction.
    pub fn mark_submitted_to_engine(&mut self) {
        self.submitted_to_engine = true;
    }

    /// Returns whether commit or abort already ran.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }

    /// Marks the transaction as committed or aborted.
    pub fn mark_finished(&mut self) {
        self.finished = true;
    }

    /// Keeps the first error of a round; later errors are dropped.
    pub fn set_pending_error(&mut self, error: PtxError) {
        if self.pending_error.is_none() {
            self.pending_error = Some(error);
        }
    }

    /// Takes the pending error.
    pub fn take_pending_error(&mut self) -> Option<PtxError> {
        self.pending_error.take()
    }

    /// Binds the procedure instance that runs this transaction.
    pub fn bind_procedure(&mut self, procedure: BoundProcedure) {
        self.procedure = Some(procedure);
    }

    /// Unbinds the procedure instance.
    pub fn take_procedure(&mut self) -> Option<BoundProcedure> {
        self.procedure.take()
    }

    /// Stores the continuation that receives the final client response.
    pub fn set_client_callback(&mut self, callback: ClientCallback) {
        self.client_callback = Some(callback);
    }

    /// Takes the client-response continuation.
    pub fn take_client_callback(&mut self) -> Option<ClientCallback> {
        self.client_callback.take()
    }

    /// Stores the one-shot continuation for a fragment task.
    pub fn register_fragment_callback(
        &mut self,
        task_id: FragmentTaskId,
        callback: FragmentCallback,
    ) {
        let _ = self.fragment_callbacks.insert(task_id, callback);
    }

    /// Takes the continuation registered for `task_id`.
    pub fn take_fragment_callback(&mut self, task_id: FragmentTaskId) -> Option<FragmentCallback> {
        self.fragment_callbacks.remove(&task_id)
    }

    /// Allocates the next fragment task id of this transaction.
    pub fn next_task_id(&mut self) -> FragmentTaskId {
        self.next_task_id += 1;
        self.next_task_id
    }

    /// Returns whether a procedure is blocked on this round.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.latch
            .as_ref()
            .is_some_and(|latch| latch.remaining() > 0)
    }
}

enum Arrival {
    Response,
    Result(ResultTable),
    Failure,
}

enum InputStatus {
    Ready,
    Failed,
    Waiting(DependencyId),
}

/// Live transaction states of one partition.
#[derive(Debug)]
pub struct TransactionTable {
    partition: PartitionId,
    states: SlotArena<TransactionState>,
    dependencies: SlotArena<DependencyInfo>,
    index: HotMap<TxnId, SlotId>,
}

impl TransactionTable {
    /// Creates a table with preloaded state and dependency slots.
    #[must_use]
    pub fn new(partition: PartitionId, preload_states: usize, preload_dependencies: usize) -> Self {
        Self {
            partition,
            states: SlotArena::with_capacity(preload_states),
            dependencies: SlotArena::with_capacity(preload_dependencies),
            index: HotMap::with_capacity(preload_states),
        }
    }

    const fn missing(&self, txn_id: TxnId) -> PtxError {
        PtxError::MissingTransaction {
            txn_id,
            partition: self.partition,
        }
    }

    fn slot_of(&self, txn_id: TxnId) -> PtxResult<SlotId> {
        self.index
            .get(&txn_id)
            .copied()
            .ok_or_else(|| self.missing(txn_id))
    }

    /// Returns the state for `txn_id`, creating it on first sight.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when the index points at a released slot.
    pub fn get_or_insert(
        &mut self,
        txn_id: TxnId,
        client_handle: ClientHandle,
        source_partition: PartitionId,
        kind: TxnKind,
    ) -> PtxResult<&mut TransactionState> {
        let slot = match self.index.get(&txn_id) {
            Some(&slot) => slot,
            None => {
                let slot = self.states.acquire();
                let _ = self.index.insert(txn_id, slot);
                if let Some(state) = self.states.get_mut(slot) {
                    state.txn_id = txn_id;
                    state.client_handle = client_handle;
                    state.source_partition = source_partition;
                    state.kind = kind;
                }
                slot
            }
        };
        self.states
            .get_mut(slot)
            .ok_or(PtxError::InvalidState("transaction index points at a released slot"))
    }

    /// Returns whether `txn_id` has a live state.
    #[must_use]
    pub fn contains(&self, txn_id: TxnId) -> bool {
        self.index.contains_key(&txn_id)
    }

    /// Borrows a state.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::MissingTransaction` for unknown transactions.
    pub fn get(&self, txn_id: TxnId) -> PtxResult<&TransactionState> {
        let slot = self.slot_of(txn_id)?;
        self.states.get(slot).ok_or_else(|| self.missing(txn_id))
    }

    /// Mutably borrows a state.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::MissingTransaction` for unknown transactions.
    pub fn get_mut(&mut self, txn_id: TxnId) -> PtxResult<&mut TransactionState> {
        let slot = self.slot_of(txn_id)?;
        let missing = self.missing(txn_id);
        self.states.get_mut(slot).ok_or(missing)
    }

    /// Number of live states.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns whether no state is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Iterates live states in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &TransactionState> {
        self.index.values().filter_map(|slot| self.states.get(*slot))
    }

    /// Arena counters for states and dependency records.
    #[must_use]
    pub fn arena_stats(&self) -> (ArenaStats, ArenaStats) {
        (self.states.stats(), self.dependencies.stats())
    }

    fn release_round(&mut self, slot: SlotId) {
        let Some(state) = self.states.get_mut(slot) else {
            return;
        };
        for (_, info_slot) in state.dependencies.drain() {
            let _ = self.dependencies.release(info_slot);
        }
        state.dependency_order.clear();
        state.expected = 0;
        state.received = 0;
        state.latch = None;
    }

    /// Starts a new round under a fresh undo token, dropping the previous round's records.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::MissingTransaction` for unknown transactions.
    pub fn begin_round(&mut self, txn_id: TxnId, undo_token: UndoToken) -> PtxResult<()> {
        let slot = self.slot_of(txn_id)?;
        self.release_round(slot);
        let state = self.get_mut(txn_id)?;
        state.round += 1;
        state.note_undo_token(undo_token);
        Ok(())
    }

    /// Expects `dep_id` from `partition` in the current round.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::MissingTransaction` for unknown transactions.
    pub fn register_output(
        &mut self,
        txn_id: TxnId,
        dep_id: DependencyId,
        partition: PartitionId,
    ) -> PtxResult<()> {
        let slot = self.slot_of(txn_id)?;
        let missing = self.missing(txn_id);
        let state = self.states.get_mut(slot).ok_or(missing)?;
        let info_slot = match state.dependencies.get(&dep_id) {
            Some(&info_slot) => info_slot,
            None => {
                let info_slot = self.dependencies.acquire();
                let _ = state.dependencies.insert(dep_id, info_slot);
                state.dependency_order.push(dep_id);
                info_slot
            }
        };
        if let Some(info) = self.dependencies.get_mut(info_slot)
            && info.add_partition(partition)
        {
            state.expected += 1;
        }
        Ok(())
    }

    fn info(&self, slot: SlotId, dep_id: DependencyId) -> Option<&DependencyInfo> {
        let info_slot = *self.states.get(slot)?.dependencies.get(&dep_id)?;
        self.dependencies.get(info_slot)
    }

    fn info_mut(&mut self, slot: SlotId, dep_id: DependencyId) -> Option<&mut DependencyInfo> {
        let info_slot = *self.states.get(slot)?.dependencies.get(&dep_id)?;
        self.dependencies.get_mut(info_slot)
    }

    /// Marks `dep_id` as feeding another fragment of the current round.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::MissingTransaction` for unknown transactions.
    pub fn mark_internal(&mut self, txn_id: TxnId, dep_id: DependencyId) -> PtxResult<()> {
        let slot = self.slot_of(txn_id)?;
        if let Some(info) = self.info_mut(slot, dep_id) {
            info.mark_internal();
        }
        Ok(())
    }

    /// Returns whether every contribution to `dep_id` is recorded.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::MissingTransaction` for unknown transactions.
    pub fn is_dependency_complete(&self, txn_id: TxnId, dep_id: DependencyId) -> PtxResult<bool> {
        let slot = self.slot_of(txn_id)?;
        Ok(self
            .info(slot, dep_id)
            .is_some_and(DependencyInfo::is_complete))
    }

    fn input_status(&self, slot: SlotId, task: &FragmentTask) -> InputStatus {
        for dep_id in task.input_dependency_ids() {
            match self.info(slot, dep_id) {
                Some(info) if info.is_complete() && info.has_failures() => {
                    return InputStatus::Failed;
                }
                Some(info) if info.is_complete() => {}
                _ => return InputStatus::Waiting(dep_id),
            }
        }
        InputStatus::Ready
    }

    fn attach_inputs(&self, slot: SlotId, task: &mut FragmentTask) {
        for dep_id in task.input_dependency_ids() {
            if task.attached_results.contains_key(&dep_id) {
                continue;
            }
            if let Some(info) = self.info(slot, dep_id) {
                task.attach_results(dep_id, info.results_by_partition());
            }
        }
    }

    /// Parks a fragment until its inputs are complete.
    ///
    /// Returns the task back when its inputs are already complete.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::MissingTransaction` for unknown transactions.
    pub fn block_fragment(
        &mut self,
        txn_id: TxnId,
        task: FragmentTask,
    ) -> PtxResult<Option<FragmentTask>> {
        let slot = self.slot_of(txn_id)?;
        match self.input_status(slot, &task) {
            InputStatus::Waiting(dep_id) => {
                if let Some(info) = self.info_mut(slot, dep_id) {
                    info.add_blocked(task);
                    return Ok(None);
                }
                Ok(Some(task))
            }
            InputStatus::Ready | InputStatus::Failed => Ok(Some(task)),
        }
    }

    /// Fragments parked across every dependency of the transaction.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::MissingTransaction` for unknown transactions.
    pub fn blocked_count(&self, txn_id: TxnId) -> PtxResult<usize> {
        let slot = self.slot_of(txn_id)?;
        let state = self.states.get(slot).ok_or_else(|| self.missing(txn_id))?;
        Ok(state
            .dependencies
            .values()
            .filter_map(|info_slot| self.dependencies.get(*info_slot))
            .map(DependencyInfo::blocked_count)
            .sum())
    }

    /// Creates the round latch for everything registered so far.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::MissingTransaction` for unknown transactions.
    pub fn arm_round(&mut self, txn_id: TxnId) -> PtxResult<Arc<RoundLatch>> {
        let state = self.get_mut(txn_id)?;
        let latch = Arc::new(RoundLatch::new(state.expected - state.received));
        state.latch = Some(Arc::clone(&latch));
        Ok(latch)
    }

    /// Records the response acknowledgement for `(partition, dep_id)`.
    ///
    /// Returns fragments whose inputs became complete.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::MissingTransaction` for unknown transactions.
    pub fn record_response(
        &mut self,
        txn_id: TxnId,
        partition: PartitionId,
        dep_id: DependencyId,
    ) -> PtxResult<Vec<FragmentTask>> {
        self.record(txn_id, partition, dep_id, Arrival::Response)
    }

    /// Records the data for `(partition, dep_id)`.
    ///
    /// Returns fragments whose inputs became complete.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::MissingTransaction` for unknown transactions.
    pub fn record_result(
        &mut self,
        txn_id: TxnId,
        partition: PartitionId,
        dep_id: DependencyId,
        table: ResultTable,
    ) -> PtxResult<Vec<FragmentTask>> {
        self.record(txn_id, partition, dep_id, Arrival::Result(table))
    }

    /// Records a failed contribution for `(partition, dep_id)`.
    ///
    /// Fragments waiting on a failed dependency never run; their outputs are failed in turn.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::MissingTransaction` for unknown transactions.
    pub fn record_failure(
        &mut self,
        txn_id: TxnId,
        partition: PartitionId,
        dep_id: DependencyId,
    ) -> PtxResult<Vec<FragmentTask>> {
        self.record(txn_id, partition, dep_id, Arrival::Failure)
    }

    fn record(
        &mut self,
        txn_id: TxnId,
        partition: PartitionId,
        dep_id: DependencyId,
        arrival: Arrival,
    ) -> PtxResult<Vec<FragmentTask>> {
        let slot = self.slot_of(txn_id)?;
        let mut released = Vec::new();
        let mut pending = vec![(partition, dep_id, arrival)];

        while let Some((partition, dep_id, arrival)) = pending.pop() {
            let Some(info) = self.info_mut(slot, dep_id) else {
                trace!(txn_id, partition, dep_id, "ignoring arrival for unregistered dependency");
                continue;
            };
            let recorded = match arrival {
                Arrival::Response => info.add_response(partition),
                Arrival::Result(table) => info.add_result(partition, table),
                Arrival::Failure => info.add_failure(partition),
            };
            if !recorded {
                continue;
            }
            let complete = info.is_complete();
            let failed = info.has_failures();
            let waiting = if complete {
                info.take_blocked()
            } else {
                Vec::new()
            };

            let missing = self.missing(txn_id);
            let state = self.states.get_mut(slot).ok_or(missing)?;
            state.received += 1;
            if let Some(latch) = &state.latch {
                let _ = latch.count_down()?;
            }

            for mut task in waiting {
                let status = if failed {
                    InputStatus::Failed
                } else {
                    self.input_status(slot, &task)
                };
                match status {
                    InputStatus::Ready => {
                        self.attach_inputs(slot, &mut task);
                        released.push(task);
                    }
                    InputStatus::Waiting(next) => {
                        if let Some(info) = self.info_mut(slot, next) {
                            info.add_blocked(task);
                        }
                    }
                    InputStatus::Failed => {
                        for &output in &task.output_dep_ids {
                            pending.push((task.destination_partition, output, Arrival::Failure));
                        }
                    }
                }
            }
        }
        Ok(released)
    }

    /// One merged table per output dependency not consumed inside the round, in registration
    /// order, rows concatenated in partition order.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::MissingTransaction` for unknown transactions, or `PtxError::Engine`
    /// when partitions produced tables with different columns.
    pub fn collect_results(&self, txn_id: TxnId) -> PtxResult<Vec<ResultTable>> {
        let slot = self.slot_of(txn_id)?;
        let state = self.states.get(slot).ok_or_else(|| self.missing(txn_id))?;
        let mut results = Vec::new();
        for dep_id in &state.dependency_order {
            let Some(info) = self.info(slot, *dep_id) else {
                continue;
            };
            if info.is_internal() {
                continue;
            }
            let mut merged = ResultTable::default();
            for table in info.results_by_partition() {
                merged.merge(table)?;
            }
            results.push(merged);
        }
        Ok(results)
    }

    /// Ends the current round and frees its dependency records.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::MissingTransaction` for unknown transactions.
    pub fn finish_round(&mut self, txn_id: TxnId) -> PtxResult<()> {
        let slot = self.slot_of(txn_id)?;
        self.release_round(slot);
        Ok(())
    }

    /// Removes a finished transaction and returns its bound procedure.
    ///
    /// Unknown transactions are treated as already cleaned up.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when the transaction has not finished.
    pub fn remove_finished(&mut self, txn_id: TxnId) -> PtxResult<Option<BoundProcedure>> {
        let Some(&slot) = self.index.get(&txn_id) else {
            return Ok(None);
        };
        let finished = self.states.get(slot).is_some_and(TransactionState::is_finished);
        if !finished {
            return Err(PtxError::InvalidState(
                "cannot clean up an unfinished transaction",
            ));
        }
        self.release_round(slot);
        let procedure = self
            .states
            .get_mut(slot)
            .and_then(TransactionState::take_procedure);
        let _ = self.index.remove(&txn_id);
        let _ = self.states.release(slot);
        Ok(procedure)
    }

    /// Wakes every procedure blocked on a round latch with a shutdown error.
    pub fn cancel_waiters(&self) {
        for state in self.iter() {
            if let Some(latch) = &state.latch {
                latch.cancel();
            }
        }
    }
}

#[cfg(test)]
#[path = "state/tests.rs"]
mod tests;
