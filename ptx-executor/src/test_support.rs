use std::sync::Arc;
use std::time::{Duration, Instant};

use ptx_common::config::SiteConfig;
use ptx_common::error::PtxResult;
use ptx_common::ids::{DependencyId, FragmentId, PartitionCount, PartitionId};
use ptx_core::fragment::FragmentTask;
use ptx_core::procedure::{ProcedureRuntime, StoredProcedure};
use ptx_core::table::{ParameterSet, ResultTable, Value};

type Body = dyn Fn(&dyn ProcedureRuntime, &ParameterSet) -> PtxResult<Vec<ResultTable>> + Send + Sync;

/// Procedure whose body is a closure shared by every pooled instance.
pub(crate) struct Scripted(Arc<Body>);

impl StoredProcedure for Scripted {
    fn run(
        &mut self,
        runtime: &dyn ProcedureRuntime,
        params: &ParameterSet,
    ) -> PtxResult<Vec<ResultTable>> {
        (self.0)(runtime, params)
    }
}

pub(crate) fn scripted<F>(body: F) -> impl Fn() -> Box<dyn StoredProcedure> + Send + Sync + 'static
where
    F: Fn(&dyn ProcedureRuntime, &ParameterSet) -> PtxResult<Vec<ResultTable>>
        + Send
        + Sync
        + 'static,
{
    let body: Arc<Body> = Arc::new(body);
    move || Box::new(Scripted(Arc::clone(&body)))
}

pub(crate) fn fast_config(partitions: u16) -> SiteConfig {
    SiteConfig {
        work_poll_timeout: Duration::from_millis(5),
        tick_interval: Duration::from_millis(5),
        txn_incoming_delay: Duration::ZERO,
        lock_check_interval: Duration::from_millis(1),
        preload_local_txn_states: 8,
        preload_remote_txn_states: 8,
        preload_dependency_infos: 16,
        ..SiteConfig::with_partitions(PartitionCount::new(partitions).expect("non-zero partitions"))
    }
}

pub(crate) fn fragment(
    runtime: &dyn ProcedureRuntime,
    destination: PartitionId,
    fragment_id: FragmentId,
    input: DependencyId,
    output: DependencyId,
    params: Vec<Value>,
) -> FragmentTask {
    FragmentTask::new(runtime.txn_id(), runtime.partition_id(), destination).with_fragment(
        fragment_id,
        input,
        output,
        ParameterSet::new(params),
    )
}

/// Polls `check` until it holds or five seconds pass.
pub(crate) fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    check()
}
