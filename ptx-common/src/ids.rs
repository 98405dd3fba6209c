//! Canonical identifier types used across executors, the queue manager, and the engine bridge.

/// Numeric partition identifier inside a single site.
pub type PartitionId = u16;

/// Monotonic transaction identifier. Lower ids are older and win lock priority.
pub type TxnId = u64;

/// Opaque client handle echoed back in client responses.
pub type ClientHandle = i64;

/// Compiled plan-fragment identifier.
pub type FragmentId = i64;

/// Named intermediate result produced by one fragment and consumed by another.
pub type DependencyId = i32;

/// Per-partition handle into the storage engine's undo log.
pub type UndoToken = u64;

/// Identifier of one fragment task inside a transaction, used to key one-shot response callbacks.
pub type FragmentTaskId = u64;

/// Dependency id meaning "no dependency".
pub const NULL_DEPENDENCY_ID: DependencyId = -1;

/// Reserved undo token meaning "no undo tracking requested".
///
/// Tokens carrying this value are never released or rolled back.
pub const NO_UNDO_TOKEN: UndoToken = UndoToken::MAX;

/// Strongly typed partition-count wrapper to avoid passing raw integers around executor APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionCount(u16);

impl PartitionCount {
    /// Creates a validated partition-count value.
    ///
    /// Returns `None` for zero because a site always owns at least one partition.
    #[must_use]
    pub fn new(value: u16) -> Option<Self> {
        if value == 0 { None } else { Some(Self(value)) }
    }

    /// Returns the inner count.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Returns whether `partition` addresses one of the partitions in range.
    #[must_use]
    pub const fn contains(self, partition: PartitionId) -> bool {
        partition < self.0
    }

    /// Iterates every partition id in ascending order.
    pub fn iter(self) -> impl Iterator<Item = PartitionId> {
        0..self.0
    }
}
