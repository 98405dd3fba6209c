//! Built-in system procedures.

use std::collections::HashMap;

use ptx_common::error::PtxResult;
use ptx_common::ids::{DependencyId, FragmentId, NULL_DEPENDENCY_ID, TxnId};
use ptx_core::fragment::{DependencySet, FragmentTask};
use ptx_core::procedure::{ProcedureRuntime, StoredProcedure};
use ptx_core::registry::{ExecutorSnapshot, SysProcContext, SystemProcedure};
use ptx_core::table::{ParameterSet, ResultTable, Value};

/// Procedure name clients invoke.
pub const EXECUTOR_STATUS: &str = "@ExecutorStatus";

/// Fragment that reports one partition's counters.
pub const EXECUTOR_STATUS_FRAGMENT: FragmentId = 1_000_001;

/// Dependency carrying the per-partition status rows.
pub const EXECUTOR_STATUS_DEP: DependencyId = 1_000_001;

/// Column layout of the status table.
pub const EXECUTOR_STATUS_COLUMNS: [&str; 8] = [
    "PARTITION",
    "TXNS_TOTAL",
    "TXNS_QUEUED",
    "TXNS_BLOCKED",
    "TXNS_WAITING",
    "CURRENT_TXN",
    "LAST_EXECUTED",
    "LAST_COMMITTED",
];

fn count(value: usize) -> Value {
    Value::Integer(i64::try_from(value).unwrap_or(i64::MAX))
}

fn status_row(snapshot: &ExecutorSnapshot) -> Vec<Value> {
    vec![
        Value::Integer(i64::from(snapshot.partition)),
        count(snapshot.txns_total),
        count(snapshot.txns_queued),
        count(snapshot.txns_blocked),
        count(snapshot.txns_waiting),
        Value::from_optional_id(snapshot.current_txn),
        Value::from_optional_id(snapshot.last_executed),
        Value::from_optional_id(snapshot.last_committed),
    ]
}

/// Fragment handler that turns an executor snapshot into one status row.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecutorStatus;

impl SystemProcedure for ExecutorStatus {
    fn name(&self) -> &'static str {
        EXECUTOR_STATUS
    }

    fn fragment_ids(&self) -> &'static [FragmentId] {
        &[EXECUTOR_STATUS_FRAGMENT]
    }

    fn execute_plan_fragment(
        &self,
        _txn_id: TxnId,
        _dependencies: &HashMap<DependencyId, Vec<ResultTable>>,
        _fragment_id: FragmentId,
        _params: &ParameterSet,
        context: &dyn SysProcContext,
    ) -> PtxResult<DependencySet> {
        let mut table = ResultTable::new(EXECUTOR_STATUS_COLUMNS);
        table.push_row(status_row(&context.snapshot()))?;
        let mut output = DependencySet::new();
        output.push(EXECUTOR_STATUS_DEP, table);
        Ok(output)
    }
}

/// Procedure body that fans the status fragment out to every partition.
///
/// Returns one table with a row per partition, in partition order.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecutorStatusProcedure;

impl StoredProcedure for ExecutorStatusProcedure {
    fn run(
        &mut self,
        runtime: &dyn ProcedureRuntime,
        _params: &ParameterSet,
    ) -> PtxResult<Vec<ResultTable>> {
        let fragments = (0..runtime.partition_count())
            .map(|partition| {
                FragmentTask::new(runtime.txn_id(), runtime.partition_id(), partition)
                    .with_fragment(
                        EXECUTOR_STATUS_FRAGMENT,
                        NULL_DEPENDENCY_ID,
                        EXECUTOR_STATUS_DEP,
                        ParameterSet::default(),
                    )
                    .into_sysproc()
            })
            .collect();
        runtime.execute_batch(fragments)
    }
}
