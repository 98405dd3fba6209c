//! Work envelopes exchanged between coordinators and partition executors.
//!
//! Envelopes are kept transport-neutral. A messenger may serialize them, but executors only see
//! these in-memory shapes.

use std::collections::HashMap;

use ptx_common::error::{PtxError, PtxResult};
use ptx_common::ids::{
    ClientHandle, DependencyId, FragmentId, FragmentTaskId, NULL_DEPENDENCY_ID, PartitionId, TxnId,
};

use crate::table::{ParameterSet, ResultTable};

/// Request to start a stored procedure on its base partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiateTask {
    /// Transaction id assigned by the coordinator.
    pub txn_id: TxnId,
    /// Client handle echoed in the final response.
    pub client_handle: ClientHandle,
    /// Partition the procedure runs on.
    pub base_partition: PartitionId,
    /// Registered procedure name.
    pub procedure: String,
    /// Procedure invocation parameters.
    pub params: ParameterSet,
    /// Whether the coordinator predicted this transaction to stay on `base_partition`.
    pub predict_single_partition: bool,
}

/// Batch of plan fragments for one transaction on one destination partition.
///
/// Per-fragment vectors are index-aligned: fragment `i` reads `input_dep_ids[i]`,
/// writes `output_dep_ids[i]`, and binds `params[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentTask {
    /// Owning transaction.
    pub txn_id: TxnId,
    /// Task id used to key one-shot response callbacks.
    pub task_id: FragmentTaskId,
    /// Client handle of the owning transaction.
    pub client_handle: ClientHandle,
    /// Partition that issued the task (the transaction's base partition).
    pub source_partition: PartitionId,
    /// Partition that must execute the task.
    pub destination_partition: PartitionId,
    /// Plan fragments to run, in order.
    pub fragment_ids: Vec<FragmentId>,
    /// Input dependency per fragment, `NULL_DEPENDENCY_ID` when a fragment has none.
    pub input_dep_ids: Vec<DependencyId>,
    /// Output dependency per fragment. Every fragment produces one, so the issuing round
    /// always waits for it.
    pub output_dep_ids: Vec<DependencyId>,
    /// Parameters per fragment.
    pub params: Vec<ParameterSet>,
    /// Whether the fragments are system-procedure fragments.
    pub sysproc: bool,
    /// Whether the transaction is driven by an external distributed coordinator.
    pub using_dtxn_coordinator: bool,
    /// Input tables attached before dispatch, keyed by dependency id.
    pub attached_results: HashMap<DependencyId, Vec<ResultTable>>,
}

impl FragmentTask {
    /// Creates an empty task for `txn_id` flowing from `source` to `destination`.
    #[must_use]
    pub fn new(txn_id: TxnId, source: PartitionId, destination: PartitionId) -> Self {
        Self {
            txn_id,
            task_id: 0,
            client_handle: 0,
            source_partition: source,
            destination_partition: destination,
            fragment_ids: Vec::new(),
            input_dep_ids: Vec::new(),
            output_dep_ids: Vec::new(),
            params: Vec::new(),
            sysproc: false,
            using_dtxn_coordinator: false,
            attached_results: HashMap::new(),
        }
    }

    /// Appends one fragment.
    #[must_use]
    pub fn with_fragment(
        mut self,
        fragment_id: FragmentId,
        input_dep_id: DependencyId,
        output_dep_id: DependencyId,
        params: ParameterSet,
    ) -> Self {
        self.fragment_ids.push(fragment_id);
        self.input_dep_ids.push(input_dep_id);
        self.output_dep_ids.push(output_dep_id);
        self.params.push(params);
        self
    }

    /// Marks the task as carrying system-procedure fragments.
    #[must_use]
    pub fn into_sysproc(mut self) -> Self {
        self.sysproc = true;
        self
    }

    /// Number of fragments in this task.
    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.fragment_ids.len()
    }

    /// Distinct real input dependency ids, in first-seen order.
    #[must_use]
    pub fn input_dependency_ids(&self) -> Vec<DependencyId> {
        let mut ids = Vec::new();
        for &dep_id in &self.input_dep_ids {
            if dep_id != NULL_DEPENDENCY_ID && !ids.contains(&dep_id) {
                ids.push(dep_id);
            }
        }
        ids
    }

    /// Returns whether any fragment reads another fragment's output.
    #[must_use]
    pub fn has_input_dependencies(&self) -> bool {
        self.input_dep_ids
            .iter()
            .any(|&dep_id| dep_id != NULL_DEPENDENCY_ID)
    }

    /// Attaches input tables for one dependency.
    pub fn attach_results(&mut self, dep_id: DependencyId, tables: Vec<ResultTable>) {
        self.attached_results.entry(dep_id).or_default().extend(tables);
    }

    /// Checks that the per-fragment vectors line up and that every fragment names an output.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::Unexpected` when the vectors have different lengths, the task is empty,
    /// or a fragment has no output dependency.
    pub fn validate(&self) -> PtxResult<()> {
        let count = self.fragment_ids.len();
        if count == 0 {
            return Err(PtxError::Unexpected(format!(
                "fragment task for txn #{} carries no fragments",
                self.txn_id
            )));
        }
        if self.input_dep_ids.len() != count
            || self.output_dep_ids.len() != count
            || self.params.len() != count
        {
            return Err(PtxError::Unexpected(format!(
                "fragment task for txn #{} has misaligned fragment vectors",
                self.txn_id
            )));
        }
        if let Some(index) = self
            .output_dep_ids
            .iter()
            .position(|&dep_id| dep_id == NULL_DEPENDENCY_ID)
        {
            return Err(PtxError::Unexpected(format!(
                "fragment {} of txn #{} has no output dependency",
                self.fragment_ids[index], self.txn_id
            )));
        }
        Ok(())
    }
}

/// One item on a partition executor's work queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkItem {
    /// Start a stored procedure.
    Initiate(InitiateTask),
    /// Execute plan fragments.
    Fragment(FragmentTask),
}

impl WorkItem {
    /// Transaction the item belongs to.
    #[must_use]
    pub const fn txn_id(&self) -> TxnId {
        match self {
            Self::Initiate(task) => task.txn_id,
            Self::Fragment(task) => task.txn_id,
        }
    }

    /// Client handle of the owning transaction.
    #[must_use]
    pub const fn client_handle(&self) -> ClientHandle {
        match self {
            Self::Initiate(task) => task.client_handle,
            Self::Fragment(task) => task.client_handle,
        }
    }

    /// Partition that originated the transaction.
    #[must_use]
    pub const fn source_partition(&self) -> PartitionId {
        match self {
            Self::Initiate(task) => task.base_partition,
            Self::Fragment(task) => task.source_partition,
        }
    }
}

/// Output of one fragment execution: parallel dependency ids and tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySet {
    dep_ids: Vec<DependencyId>,
    tables: Vec<ResultTable>,
}

impl DependencySet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one dependency output.
    pub fn push(&mut self, dep_id: DependencyId, table: ResultTable) {
        self.dep_ids.push(dep_id);
        self.tables.push(table);
    }

    /// Dependency ids in output order.
    #[must_use]
    pub fn dependency_ids(&self) -> &[DependencyId] {
        &self.dep_ids
    }

    /// Tables in output order.
    #[must_use]
    pub fn tables(&self) -> &[ResultTable] {
        &self.tables
    }

    /// Number of outputs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dep_ids.len()
    }

    /// Returns whether the set has no outputs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dep_ids.is_empty()
    }

    /// Iterates `(dependency id, table)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (DependencyId, &ResultTable)> {
        self.dep_ids.iter().copied().zip(self.tables.iter())
    }

    /// Consumes the set into `(dependency id, table)` pairs.
    #[must_use]
    pub fn into_pairs(self) -> Vec<(DependencyId, ResultTable)> {
        self.dep_ids.into_iter().zip(self.tables).collect()
    }
}

/// Execution status of a fragment task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentStatus {
    /// All fragments ran.
    Success,
    /// A fragment raised a user-visible error (constraint failure, user abort).
    UserError,
    /// Anything else failed.
    UnexpectedError,
}

/// Response to one fragment task.
///
/// Successful remote responses carry only dependency ids; the tables travel separately as a
/// dependency set. Error responses list the task's output dependency ids so the origin can mark
/// them failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentResponse {
    /// Owning transaction.
    pub txn_id: TxnId,
    /// Task the response answers.
    pub task_id: FragmentTaskId,
    /// Partition that executed the task.
    pub source_partition: PartitionId,
    /// Partition waiting for the response.
    pub destination_partition: PartitionId,
    /// Execution outcome.
    pub status: FragmentStatus,
    /// Dependencies produced (or failed) by the task.
    pub dependency_ids: Vec<DependencyId>,
    /// Failure cause for non-success statuses.
    pub error: Option<PtxError>,
}

impl FragmentResponse {
    /// Creates a successful response acknowledging `dependency_ids`.
    #[must_use]
    pub fn success(
        task: &FragmentTask,
        executed_on: PartitionId,
        dependency_ids: Vec<DependencyId>,
    ) -> Self {
        Self {
            txn_id: task.txn_id,
            task_id: task.task_id,
            source_partition: executed_on,
            destination_partition: task.source_partition,
            status: FragmentStatus::Success,
            dependency_ids,
            error: None,
        }
    }

    /// Creates an error response covering every output dependency of `task`.
    #[must_use]
    pub fn failure(task: &FragmentTask, executed_on: PartitionId, error: PtxError) -> Self {
        let status = match error {
            PtxError::UserAbort(_) | PtxError::Engine(_) => FragmentStatus::UserError,
            _ => FragmentStatus::UnexpectedError,
        };
        Self {
            txn_id: task.txn_id,
            task_id: task.task_id,
            source_partition: executed_on,
            destination_partition: task.source_partition,
            status,
            dependency_ids: task.output_dep_ids.clone(),
            error: Some(error),
        }
    }

    /// Returns whether the task failed.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(
            self.status,
            FragmentStatus::UserError | FragmentStatus::UnexpectedError
        )
    }
}

/// Final status reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// Procedure committed.
    Success,
    /// Procedure requested a rollback.
    UserAbort,
    /// Transaction touched partitions outside its prediction and will be restarted.
    Misprediction,
    /// Anything else.
    UnexpectedError,
}

/// Final response for one client invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientResponse {
    /// Transaction that produced the response.
    pub txn_id: TxnId,
    /// Client handle from the initiate task.
    pub client_handle: ClientHandle,
    /// Outcome.
    pub status: ClientStatus,
    /// Procedure results on success.
    pub results: Vec<ResultTable>,
    /// Failure description, empty on success.
    pub status_message: String,
}

impl ClientResponse {
    /// Maps a procedure outcome to a client response.
    #[must_use]
    pub fn from_outcome(
        txn_id: TxnId,
        client_handle: ClientHandle,
        outcome: PtxResult<Vec<ResultTable>>,
    ) -> Self {
        match outcome {
            Ok(results) => Self {
                txn_id,
                client_handle,
                status: ClientStatus::Success,
                results,
                status_message: String::new(),
            },
            Err(error) => {
                let status = match error {
                    PtxError::UserAbort(_) => ClientStatus::UserAbort,
                    PtxError::Misprediction { .. } => ClientStatus::Misprediction,
                    _ => ClientStatus::UnexpectedError,
                };
                Self {
                    txn_id,
                    client_handle,
                    status,
                    results: Vec::new(),
                    status_message: error.to_string(),
                }
            }
        }
    }

    /// Returns whether the transaction should commit.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.status, ClientStatus::Success)
    }
}

/// Status handed to coordinator callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorStatus {
    /// Proceed (commit, or fragment succeeded).
    Ok,
    /// Abort because the procedure or a fragment failed.
    AbortUser,
    /// Abort because the transaction was mispredicted; the coordinator restarts it.
    AbortMispredict,
    /// Lock request was cancelled before it was granted.
    Rejected,
}

impl From<ClientStatus> for CoordinatorStatus {
    fn from(status: ClientStatus) -> Self {
        match status {
            ClientStatus::Success => Self::Ok,
            ClientStatus::Misprediction => Self::AbortMispredict,
            ClientStatus::UserAbort | ClientStatus::UnexpectedError => Self::AbortUser,
        }
    }
}

/// Reply payload with the status the coordinator acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorReply<T> {
    /// Status the coordinator acts on.
    pub status: CoordinatorStatus,
    /// Message payload.
    pub payload: T,
}
