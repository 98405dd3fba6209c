//! Stored-procedure contract.
//!
//! A procedure runs on its base partition and drives the transaction by submitting fragment
//! batches through the runtime it is handed. Each batch call blocks until every output
//! dependency of the batch has arrived.

use std::sync::Arc;

use ptx_common::error::PtxResult;
use ptx_common::ids::{PartitionId, TxnId};

use crate::fragment::FragmentTask;
use crate::table::{ParameterSet, ResultTable};

/// Services a running procedure may call on its executor.
pub trait ProcedureRuntime {
    /// Transaction being executed.
    fn txn_id(&self) -> TxnId;

    /// Base partition of the transaction.
    fn partition_id(&self) -> PartitionId;

    /// Number of partitions in the site.
    fn partition_count(&self) -> u16;

    /// Dispatches one batch of fragment tasks and waits for their outputs.
    ///
    /// Returns one merged table per output dependency that no other fragment of the batch
    /// consumes, in the order the dependencies were first declared.
    ///
    /// # Errors
    ///
    /// Returns the first fragment error, `PtxError::Deadlock` when nothing in the batch can run,
    /// or `PtxError::Misprediction` when a single-partition transaction leaves its partition.
    fn execute_batch(&self, fragments: Vec<FragmentTask>) -> PtxResult<Vec<ResultTable>>;

    /// Bulk-loads rows into a table on the base partition.
    ///
    /// # Errors
    ///
    /// Returns the engine error when the load fails.
    fn load_table(&self, table_name: &str, data: ResultTable) -> PtxResult<()>;
}

/// One pooled procedure instance.
pub trait StoredProcedure: Send {
    /// Runs the procedure body and returns its result tables.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::UserAbort` to roll back, or any error raised by the runtime.
    fn run(
        &mut self,
        runtime: &dyn ProcedureRuntime,
        params: &ParameterSet,
    ) -> PtxResult<Vec<ResultTable>>;
}

/// Creates fresh procedure instances for a pool.
pub type ProcedureFactory = Arc<dyn Fn() -> Box<dyn StoredProcedure> + Send + Sync>;

/// Procedure instance bound to a transaction, with the name of the pool it came from.
pub struct BoundProcedure {
    /// Pool name.
    pub name: String,
    /// Instance.
    pub instance: Box<dyn StoredProcedure>,
}

impl std::fmt::Debug for BoundProcedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundProcedure")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
