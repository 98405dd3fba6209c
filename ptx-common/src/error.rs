//! Shared error model for cross-crate APIs.

use thiserror::Error;

use crate::ids::{FragmentId, PartitionId, TxnId, UndoToken};

/// Unified result type used by all public interfaces in the workspace.
pub type PtxResult<T> = Result<T, PtxError>;

/// Error categories raised by executors, the queue manager, and engine bridges.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PtxError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Runtime state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// A task referenced a transaction that was never registered on this partition.
    #[error("no transaction state for txn #{txn_id} on partition {partition}")]
    MissingTransaction {
        /// Transaction id carried by the offending task.
        txn_id: TxnId,
        /// Partition whose table was searched.
        partition: PartitionId,
    },

    /// Storage engine failed while executing fragments or applying undo operations.
    #[error("execution engine error: {0}")]
    Engine(String),

    /// A transaction predicted as single-partition tried to reach another partition.
    #[error("txn #{txn_id} was mispredicted as single-partition but touches partition {partition}")]
    Misprediction {
        /// Mispredicted transaction.
        txn_id: TxnId,
        /// Partition the offending fragment targets.
        partition: PartitionId,
    },

    /// Every fragment of a batch waits on another fragment's output.
    #[error("deadlock: all fragments for txn #{0} are blocked waiting on input")]
    Deadlock(TxnId),

    /// Stored procedure requested a rollback.
    #[error("user abort: {0}")]
    UserAbort(String),

    /// Anything else that went wrong while running a transaction.
    #[error("unexpected error: {0}")]
    Unexpected(String),

    /// Abort would roll back work that a later, already released undo token covers.
    #[error(
        "out-of-order abort for txn #{txn_id}: undo token {undo_token} is not newer than released token {released}"
    )]
    OutOfOrderAbort {
        /// Transaction being aborted.
        txn_id: TxnId,
        /// First undo token of that transaction.
        undo_token: UndoToken,
        /// Highest token already released to the engine.
        released: UndoToken,
    },

    /// No procedure factory is registered under this name.
    #[error("unknown stored procedure '{0}'")]
    UnknownProcedure(String),

    /// No system-procedure handler is registered for this fragment id.
    #[error("no system procedure handler for fragment #{0}")]
    UnknownSysProcFragment(FragmentId),

    /// Work was rejected or interrupted because the executor is stopping.
    #[error("executor is shutting down")]
    Shutdown,
}

impl PtxError {
    /// Returns whether this error indicates corrupted executor state.
    ///
    /// Fatal errors escalate to a cluster-wide shutdown when they reach the run loop.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::MissingTransaction { .. } | Self::InvalidState(_))
    }
}
