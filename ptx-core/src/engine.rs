//! Storage-engine contract used by partition executors.
//!
//! Every call happens on the owning executor's engine lane, so implementations never see
//! concurrent calls for one partition.

use std::collections::HashMap;

use ptx_common::error::PtxResult;
use ptx_common::ids::{DependencyId, FragmentId, PartitionId, TxnId, UndoToken};

use crate::fragment::{DependencySet, FragmentTask};
use crate::table::{ParameterSet, ResultTable};

#[path = "engine/memory.rs"]
mod memory;

pub use memory::{EngineLog, ExecutedBatch, FragmentProgram, FragmentScope, InMemoryEngine};

/// Borrowed view of one fragment batch handed to the engine.
#[derive(Debug, Clone, Copy)]
pub struct FragmentBatch<'a> {
    /// Owning transaction.
    pub txn_id: TxnId,
    /// Partition executing the batch.
    pub partition: PartitionId,
    /// Plan fragments to run, in order.
    pub fragment_ids: &'a [FragmentId],
    /// Input dependency per fragment.
    pub input_dep_ids: &'a [DependencyId],
    /// Output dependency per fragment.
    pub output_dep_ids: &'a [DependencyId],
    /// Parameters per fragment.
    pub params: &'a [ParameterSet],
    /// Last transaction committed on this partition.
    pub last_committed_txn_id: Option<TxnId>,
    /// Undo token covering every write of this batch.
    pub undo_token: UndoToken,
}

impl<'a> FragmentBatch<'a> {
    /// Borrows the fragment vectors of `task`.
    #[must_use]
    pub fn from_task(
        task: &'a FragmentTask,
        partition: PartitionId,
        last_committed_txn_id: Option<TxnId>,
        undo_token: UndoToken,
    ) -> Self {
        Self {
            txn_id: task.txn_id,
            partition,
            fragment_ids: &task.fragment_ids,
            input_dep_ids: &task.input_dep_ids,
            output_dep_ids: &task.output_dep_ids,
            params: &task.params,
            last_committed_txn_id,
            undo_token,
        }
    }
}

/// Synchronous storage-engine interface for one partition.
///
/// Undo tokens are strictly increasing per partition. Releasing a token also releases every
/// older token; undoing a token also undoes every newer token.
pub trait ExecutionEngine: Send {
    /// Makes input tables available to the next `execute_fragments` call.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine cannot accept the tables.
    fn stash_dependencies(
        &mut self,
        dependencies: HashMap<DependencyId, Vec<ResultTable>>,
    ) -> PtxResult<()>;

    /// Runs a batch of plan fragments and returns one output per fragment.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::Engine` when a fragment fails.
    fn execute_fragments(&mut self, batch: &FragmentBatch<'_>) -> PtxResult<DependencySet>;

    /// Bulk-loads rows into a table under `undo_token`.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::Engine` when the rows do not fit the table.
    fn load_table(
        &mut self,
        table_name: &str,
        data: ResultTable,
        txn_id: TxnId,
        last_committed_txn_id: Option<TxnId>,
        undo_token: UndoToken,
    ) -> PtxResult<()>;

    /// Makes all work up to and including `token` permanent.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine state is unusable.
    fn release_undo_token(&mut self, token: UndoToken) -> PtxResult<()>;

    /// Rolls back all work from `token` onward.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine state is unusable.
    fn undo_undo_token(&mut self, token: UndoToken) -> PtxResult<()>;

    /// Periodic maintenance hook.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine state is unusable.
    fn tick(&mut self, now_millis: u64, last_committed_txn_id: Option<TxnId>) -> PtxResult<()>;
}

#[cfg(test)]
#[path = "engine/tests.rs"]
mod tests;
