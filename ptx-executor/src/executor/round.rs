use std::sync::Arc;

use ptx_common::error::{PtxError, PtxResult};
use ptx_common::ids::{PartitionId, TxnId};
use ptx_core::containers::HotSet;
use ptx_core::fragment::{FragmentResponse, FragmentTask, WorkItem};
use ptx_core::procedure::ProcedureRuntime;
use ptx_core::table::ResultTable;
use tracing::{debug, trace, warn};

use super::ExecutorShared;

/// Runtime handed to a procedure body for one transaction.
pub(super) struct ProcedureContext<'a> {
    shared: &'a Arc<ExecutorShared>,
    txn_id: TxnId,
}

impl<'a> ProcedureContext<'a> {
    pub(super) const fn new(shared: &'a Arc<ExecutorShared>, txn_id: TxnId) -> Self {
        Self { shared, txn_id }
    }
}

impl ProcedureRuntime for ProcedureContext<'_> {
    fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    fn partition_id(&self) -> PartitionId {
        self.shared.partition
    }

    fn partition_count(&self) -> u16 {
        self.shared.config.partition_count.get()
    }

    fn execute_batch(&self, fragments: Vec<FragmentTask>) -> PtxResult<Vec<ResultTable>> {
        self.shared.wait_for_responses(self.txn_id, fragments)
    }

    fn load_table(&self, table_name: &str, data: ResultTable) -> PtxResult<()> {
        self.shared.load_table(self.txn_id, table_name, data)
    }
}

impl ExecutorShared {
    /// Runs one round of fragments for a local transaction and blocks until every expected
    /// contribution has arrived.
    ///
    /// Returns one merged table per output dependency that no fragment of the round consumed.
    pub(super) fn wait_for_responses(
        self: &Arc<Self>,
        txn_id: TxnId,
        mut fragments: Vec<FragmentTask>,
    ) -> PtxResult<Vec<ResultTable>> {
        if fragments.is_empty() {
            return Ok(Vec::new());
        }
        if self.is_shutting_down() {
            return Err(PtxError::Shutdown);
        }

        let batch_size = fragments.len();
        let undo_token = self.next_undo_token();
        let (runnable, latch) = {
            let mut table = self.lock_table()?;
            table.begin_round(txn_id, undo_token)?;
            let state = table.get_mut(txn_id)?;
            let single = state.predict_single_partition();
            let client_handle = state.client_handle();
            for fragment in &mut fragments {
                fragment.txn_id = txn_id;
                fragment.task_id = state.next_task_id();
                fragment.client_handle = client_handle;
                fragment.source_partition = self.partition;
            }

            let rejected = match fragments.iter().try_for_each(FragmentTask::validate) {
                Err(error) => Some(error),
                Ok(()) if single => fragments
                    .iter()
                    .find(|fragment| fragment.destination_partition != self.partition)
                    .map(|stray| PtxError::Misprediction {
                        txn_id,
                        partition: stray.destination_partition,
                    }),
                Ok(()) => None,
            };
            if let Some(error) = rejected {
                table.finish_round(txn_id)?;
                return Err(error);
            }

            let mut produced = HotSet::new();
            for fragment in &fragments {
                for &dep_id in &fragment.output_dep_ids {
                    table.register_output(txn_id, dep_id, fragment.destination_partition)?;
                    let _ = produced.insert(dep_id);
                }
            }
            for fragment in &fragments {
                for dep_id in fragment.input_dependency_ids() {
                    if produced.contains(&dep_id) {
                        table.mark_internal(txn_id, dep_id)?;
                    }
                }
            }

            let mut runnable = Vec::with_capacity(batch_size);
            for fragment in fragments {
                if fragment.has_input_dependencies() {
                    if let Some(ready) = table.block_fragment(txn_id, fragment)? {
                        runnable.push(ready);
                    }
                } else {
                    runnable.push(fragment);
                }
            }
            if runnable.is_empty() {
                table.finish_round(txn_id)?;
                return Err(PtxError::Deadlock(txn_id));
            }

            let latch = table.arm_round(txn_id)?;
            trace!(
                partition = self.partition,
                txn_id,
                batch_size,
                runnable = runnable.len(),
                blocked = table.blocked_count(txn_id)?,
                undo_token,
                "round armed"
            );
            (runnable, latch)
        };

        if let Err(error) = self.dispatch_batch(txn_id, runnable) {
            self.lock_table()?.finish_round(txn_id)?;
            return Err(error);
        }
        latch.wait()?;

        let mut table = self.lock_table()?;
        if let Some(error) = table.get_mut(txn_id)?.take_pending_error() {
            table.finish_round(txn_id)?;
            debug!(partition = self.partition, txn_id, %error, "round failed");
            return Err(error);
        }
        let results = table.collect_results(txn_id);
        table.finish_round(txn_id)?;
        results
    }

    /// Sends runnable fragments on their way: straight onto this loop when every one of them is
    /// local, otherwise as one coordinator-mediated request.
    pub(super) fn dispatch_batch(self: &Arc<Self>, txn_id: TxnId, mut tasks: Vec<FragmentTask>) -> PtxResult<()> {
        if tasks.is_empty() {
            return Ok(());
        }
        if tasks
            .iter()
            .all(|task| task.destination_partition == self.partition)
        {
            for task in tasks {
                self.enqueue(WorkItem::Fragment(task))?;
            }
            return Ok(());
        }

        for task in &mut tasks {
            task.using_dtxn_coordinator = true;
        }
        trace!(partition = self.partition, txn_id, tasks = tasks.len(), "requesting remote work");
        let shared = Arc::clone(self);
        self.messenger.request_work(
            txn_id,
            tasks,
            Box::new(move |responses| {
                if let Err(error) = shared.process_fragment_responses(txn_id, responses) {
                    warn!(partition = shared.partition, txn_id, %error, "fragment responses dropped");
                }
            }),
        )
    }

    /// Applies acknowledgements from a coordinator-mediated request.
    pub(super) fn process_fragment_responses(
        self: &Arc<Self>,
        txn_id: TxnId,
        responses: Vec<FragmentResponse>,
    ) -> PtxResult<()> {
        let mut released = Vec::new();
        {
            let mut table = self.lock_table()?;
            for response in responses {
                if response.is_error() {
                    let error = response.error.unwrap_or_else(|| {
                        PtxError::Unexpected(format!(
                            "partition {} failed txn #{txn_id} without an error",
                            response.source_partition
                        ))
                    });
                    table.get_mut(txn_id)?.set_pending_error(error);
                    for dep_id in response.dependency_ids {
                        released.extend(table.record_failure(
                            txn_id,
                            response.source_partition,
                            dep_id,
                        )?);
                    }
                } else {
                    for dep_id in response.dependency_ids {
                        released.extend(table.record_response(
                            txn_id,
                            response.source_partition,
                            dep_id,
                        )?);
                    }
                }
            }
        }
        self.dispatch_batch(txn_id, released)
    }
}
