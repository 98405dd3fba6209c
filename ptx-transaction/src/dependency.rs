//! Per-round bookkeeping for one dependency id of one transaction.
//!
//! A `(partition, dependency)` contribution is recorded only once both its response
//! acknowledgement and its data (or a failure) have arrived. Data alone never completes it.

use ptx_common::ids::PartitionId;
use ptx_core::containers::HotSet;
use ptx_core::fragment::FragmentTask;
use ptx_core::table::ResultTable;

use crate::pool::Reusable;

/// Arrival tracking for one dependency id within one round.
#[derive(Debug)]
pub struct DependencyInfo {
    partitions: Vec<PartitionId>,
    results: Vec<(PartitionId, ResultTable)>,
    responses: HotSet<PartitionId>,
    failed: HotSet<PartitionId>,
    recorded: HotSet<PartitionId>,
    blocked: Vec<FragmentTask>,
    internal: bool,
}

impl Default for DependencyInfo {
    fn default() -> Self {
        Self {
            partitions: Vec::new(),
            results: Vec::new(),
            responses: HotSet::new(),
            failed: HotSet::new(),
            recorded: HotSet::new(),
            blocked: Vec::new(),
            internal: false,
        }
    }
}

impl Reusable for DependencyInfo {
    fn reset(&mut self) {
        self.partitions.clear();
        self.results.clear();
        self.responses.clear();
        self.failed.clear();
        self.recorded.clear();
        self.blocked.clear();
        self.internal = false;
    }
}

impl DependencyInfo {
    /// Expects a contribution from `partition`. Returns `false` when it was already expected.
    pub fn add_partition(&mut self, partition: PartitionId) -> bool {
        if self.partitions.contains(&partition) {
            return false;
        }
        self.partitions.push(partition);
        true
    }

    /// Marks the output as consumed by another fragment of the same round.
    pub fn mark_internal(&mut self) {
        self.internal = true;
    }

    /// Returns whether the output only feeds other fragments.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        self.internal
    }

    /// Stores data from `partition`. Returns `true` when this completed its contribution.
    pub fn add_result(&mut self, partition: PartitionId, table: ResultTable) -> bool {
        if !self.partitions.contains(&partition)
            || self.failed.contains(&partition)
            || self.results.iter().any(|(source, _)| *source == partition)
        {
            return false;
        }
        self.results.push((partition, table));
        self.try_record(partition)
    }

    /// Stores the response acknowledgement from `partition`. Returns `true` when this completed
    /// its contribution.
    pub fn add_response(&mut self, partition: PartitionId) -> bool {
        if !self.partitions.contains(&partition) || !self.responses.insert(partition) {
            return false;
        }
        self.try_record(partition)
    }

    /// Records a failed contribution from `partition`, counting as both data and acknowledgement.
    /// Returns `true` when this completed its contribution.
    pub fn add_failure(&mut self, partition: PartitionId) -> bool {
        if !self.partitions.contains(&partition) || !self.failed.insert(partition) {
            return false;
        }
        let _ = self.responses.insert(partition);
        self.try_record(partition)
    }

    fn try_record(&mut self, partition: PartitionId) -> bool {
        if self.recorded.contains(&partition) || !self.responses.contains(&partition) {
            return false;
        }
        let has_data = self.failed.contains(&partition)
            || self.results.iter().any(|(source, _)| *source == partition);
        has_data && self.recorded.insert(partition)
    }

    /// Returns whether `partition`'s contribution is recorded.
    #[must_use]
    pub fn is_recorded(&self, partition: PartitionId) -> bool {
        self.recorded.contains(&partition)
    }

    /// Returns whether every expected partition is recorded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.partitions.is_empty() && self.recorded.len() == self.partitions.len()
    }

    /// Returns whether any contribution failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    /// Received tables ordered by partition id.
    #[must_use]
    pub fn results_by_partition(&self) -> Vec<ResultTable> {
        let mut ordered: Vec<&(PartitionId, ResultTable)> = self.results.iter().collect();
        ordered.sort_by_key(|(partition, _)| *partition);
        ordered.into_iter().map(|(_, table)| table.clone()).collect()
    }

    /// Parks a fragment that cannot run until this dependency is complete.
    pub fn add_blocked(&mut self, task: FragmentTask) {
        self.blocked.push(task);
    }

    /// Takes every parked fragment.
    pub fn take_blocked(&mut self) -> Vec<FragmentTask> {
        std::mem::take(&mut self.blocked)
    }

    /// Number of parked fragments.
    #[must_use]
    pub fn blocked_count(&self) -> usize {
        self.blocked.len()
    }
}
