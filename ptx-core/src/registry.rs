//! System-procedure fragment registry.
//!
//! Built once at startup, then frozen behind an `Arc` and shared by every executor of the site.

use std::collections::HashMap;
use std::sync::Arc;

use ptx_common::error::{PtxError, PtxResult};
use ptx_common::ids::{DependencyId, FragmentId, PartitionId, TxnId};

use crate::containers::HotMap;
use crate::fragment::DependencySet;
use crate::table::{ParameterSet, ResultTable};

/// Point-in-time counters of one partition executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorSnapshot {
    /// Partition the executor owns.
    pub partition: PartitionId,
    /// Live transaction states.
    pub txns_total: usize,
    /// Work items waiting in the queue.
    pub txns_queued: usize,
    /// Transactions with blocked fragments.
    pub txns_blocked: usize,
    /// Transactions waiting on a round latch.
    pub txns_waiting: usize,
    /// Transaction the loop thread is executing right now.
    pub current_txn: Option<TxnId>,
    /// Last transaction whose work the loop thread executed.
    pub last_executed: Option<TxnId>,
    /// Last committed transaction.
    pub last_committed: Option<TxnId>,
}

/// Executor services available to system-procedure fragments.
pub trait SysProcContext {
    /// Partition the fragment runs on.
    fn partition_id(&self) -> PartitionId;

    /// Current executor counters.
    fn snapshot(&self) -> ExecutorSnapshot;
}

/// Handler for the plan fragments of one system procedure.
pub trait SystemProcedure: Send + Sync {
    /// Procedure name, unique per site.
    fn name(&self) -> &'static str;

    /// Fragment ids this procedure answers.
    fn fragment_ids(&self) -> &'static [FragmentId];

    /// Runs one fragment and returns its outputs.
    ///
    /// # Errors
    ///
    /// Returns an error when the fragment cannot produce its output.
    fn execute_plan_fragment(
        &self,
        txn_id: TxnId,
        dependencies: &HashMap<DependencyId, Vec<ResultTable>>,
        fragment_id: FragmentId,
        params: &ParameterSet,
        context: &dyn SysProcContext,
    ) -> PtxResult<DependencySet>;
}

/// Fragment-id to system-procedure table.
#[derive(Clone, Default)]
pub struct SysProcRegistry {
    entries: HotMap<FragmentId, Arc<dyn SystemProcedure>>,
}

impl std::fmt::Debug for SysProcRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut fragments: Vec<_> = self.entries.keys().copied().collect();
        fragments.sort_unstable();
        f.debug_struct("SysProcRegistry")
            .field("fragments", &fragments)
            .finish()
    }
}

impl SysProcRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every fragment id of `procedure`.
    ///
    /// Registering the same handler twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when a fragment id is already owned by another handler.
    pub fn register(&mut self, procedure: Arc<dyn SystemProcedure>) -> PtxResult<()> {
        for fragment_id in procedure.fragment_ids() {
            if let Some(existing) = self.entries.get(fragment_id)
                && !Arc::ptr_eq(existing, &procedure)
            {
                return Err(PtxError::InvalidState(
                    "system-procedure fragment id is already registered",
                ));
            }
        }
        for &fragment_id in procedure.fragment_ids() {
            let _ = self.entries.insert(fragment_id, Arc::clone(&procedure));
        }
        Ok(())
    }

    /// Freezes the registry for sharing across executors.
    #[must_use]
    pub fn freeze(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Returns the handler for `fragment_id`.
    #[must_use]
    pub fn get(&self, fragment_id: FragmentId) -> Option<&Arc<dyn SystemProcedure>> {
        self.entries.get(&fragment_id)
    }

    /// Returns whether `fragment_id` belongs to a system procedure.
    #[must_use]
    pub fn contains(&self, fragment_id: FragmentId) -> bool {
        self.entries.contains_key(&fragment_id)
    }

    /// Number of registered fragment ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether no fragment is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dispatches one fragment to its registered handler.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::UnknownSysProcFragment` for unregistered fragment ids, or the
    /// handler's own error.
    pub fn execute(
        &self,
        txn_id: TxnId,
        dependencies: &HashMap<DependencyId, Vec<ResultTable>>,
        fragment_id: FragmentId,
        params: &ParameterSet,
        context: &dyn SysProcContext,
    ) -> PtxResult<DependencySet> {
        let Some(procedure) = self.entries.get(&fragment_id) else {
            return Err(PtxError::UnknownSysProcFragment(fragment_id));
        };
        procedure.execute_plan_fragment(txn_id, dependencies, fragment_id, params, context)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::{ExecutorSnapshot, SysProcContext, SysProcRegistry, SystemProcedure};
    use crate::fragment::DependencySet;
    use crate::table::{ParameterSet, ResultTable, Value};
    use googletest::prelude::*;
    use ptx_common::error::{PtxError, PtxResult};
    use ptx_common::ids::{DependencyId, FragmentId, PartitionId, TxnId};
    use rstest::rstest;

    struct PartitionEcho;

    impl SystemProcedure for PartitionEcho {
        fn name(&self) -> &'static str {
            "PartitionEcho"
        }

        fn fragment_ids(&self) -> &'static [FragmentId] {
            &[900, 901]
        }

        fn execute_plan_fragment(
            &self,
            _txn_id: TxnId,
            _dependencies: &HashMap<DependencyId, Vec<ResultTable>>,
            fragment_id: FragmentId,
            _params: &ParameterSet,
            context: &dyn SysProcContext,
        ) -> PtxResult<DependencySet> {
            let mut output = DependencySet::new();
            output.push(
                i32::try_from(fragment_id).unwrap_or_default(),
                ResultTable::scalar("PARTITION", Value::Integer(i64::from(context.partition_id()))),
            );
            Ok(output)
        }
    }

    struct FixedContext(PartitionId);

    impl SysProcContext for FixedContext {
        fn partition_id(&self) -> PartitionId {
            self.0
        }

        fn snapshot(&self) -> ExecutorSnapshot {
            ExecutorSnapshot {
                partition: self.0,
                ..ExecutorSnapshot::default()
            }
        }
    }

    #[rstest]
    fn registers_every_fragment_of_a_procedure() {
        let mut registry = SysProcRegistry::new();
        let procedure: Arc<dyn SystemProcedure> = Arc::new(PartitionEcho);
        registry
            .register(Arc::clone(&procedure))
            .expect("first registration");
        registry
            .register(procedure)
            .expect("re-registering the same handler is a no-op");

        assert_that!(registry.len(), eq(2_usize));
        assert_that!(registry.contains(901), eq(true));
    }

    #[rstest]
    fn conflicting_handler_is_rejected() {
        let mut registry = SysProcRegistry::new();
        registry
            .register(Arc::new(PartitionEcho))
            .expect("first registration");
        let result = registry.register(Arc::new(PartitionEcho));
        assert_that!(
            &result,
            eq(&Err(PtxError::InvalidState(
                "system-procedure fragment id is already registered"
            )))
        );
    }

    #[rstest]
    #[case(900, Ok(1_usize))]
    #[case(5, Err(PtxError::UnknownSysProcFragment(5)))]
    fn execute_dispatches_by_fragment_id(
        #[case] fragment_id: FragmentId,
        #[case] expected: PtxResult<usize>,
    ) {
        let mut registry = SysProcRegistry::new();
        registry
            .register(Arc::new(PartitionEcho))
            .expect("registration");
        let registry = registry.freeze();

        let result = registry
            .execute(
                1,
                &HashMap::new(),
                fragment_id,
                &ParameterSet::default(),
                &FixedContext(3),
            )
            .map(|set| set.len());

        assert_that!(&result, eq(&expected));
    }
}
