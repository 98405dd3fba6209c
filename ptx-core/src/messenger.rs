//! Coordinator-facing messaging contract and one-shot response continuations.

use ptx_common::error::{PtxError, PtxResult};
use ptx_common::ids::{PartitionId, TxnId};

use crate::fragment::{
    ClientResponse, CoordinatorReply, DependencySet, FragmentResponse, FragmentTask,
};

/// Continuation invoked once with the response to one fragment task.
pub type FragmentCallback = Box<dyn FnOnce(CoordinatorReply<FragmentResponse>) + Send>;

/// Continuation invoked once with the final response of a locally initiated transaction.
pub type ClientCallback = Box<dyn FnOnce(CoordinatorReply<ClientResponse>) + Send>;

/// Continuation invoked once with every response of a combined work request.
pub type WorkResponseCallback = Box<dyn FnOnce(Vec<FragmentResponse>) + Send>;

/// Continuation attached to a work item when it is queued.
pub enum Continuation {
    /// Final client response for an initiate task.
    Client(ClientCallback),
    /// Response for one fragment task.
    Fragment(FragmentCallback),
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client(_) => f.write_str("Continuation::Client"),
            Self::Fragment(_) => f.write_str("Continuation::Fragment"),
        }
    }
}

/// Transport used by executors to reach other partitions and the supervising coordinator.
pub trait Messenger: Send + Sync {
    /// Sends fragment tasks to their destination partitions as one combined request.
    ///
    /// `callback` runs once, after every task has answered.
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be routed.
    fn request_work(
        &self,
        txn_id: TxnId,
        fragments: Vec<FragmentTask>,
        callback: WorkResponseCallback,
    ) -> PtxResult<()>;

    /// Ships fragment output tables from `sender` to `receiver`.
    ///
    /// # Errors
    ///
    /// Returns an error when the receiving partition cannot accept the data.
    fn send_dependency_set(
        &self,
        txn_id: TxnId,
        sender: PartitionId,
        receiver: PartitionId,
        dependencies: DependencySet,
    ) -> PtxResult<()>;

    /// Asks the supervising layer to stop the whole site after a fatal error.
    fn shutdown_cluster(&self, cause: &PtxError);
}
