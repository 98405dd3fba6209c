use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Arc, mpsc};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use ptx_common::error::{PtxError, PtxResult};
use ptx_common::ids::{NO_UNDO_TOKEN, PartitionId, TxnId, UndoToken};
use ptx_core::engine::FragmentBatch;
use ptx_core::fragment::{
    ClientResponse, CoordinatorReply, CoordinatorStatus, DependencySet, FragmentResponse,
    FragmentTask, InitiateTask, WorkItem,
};
use ptx_core::procedure::BoundProcedure;
use ptx_core::registry::{ExecutorSnapshot, SysProcContext};
use tracing::{debug, error, trace, warn};

use super::round::ProcedureContext;
use super::{ExecutorShared, LoopCommand};

/// Loop-thread entry point.
pub(super) fn run(shared: &Arc<ExecutorShared>, receiver: &mpsc::Receiver<LoopCommand>) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| run_loop(shared, receiver)));
    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(error)) => Some(error),
        Err(payload) => Some(PtxError::Unexpected(panic_message(payload.as_ref()))),
    };
    if let Some(error) = failure {
        error!(partition = shared.partition, %error, "executor loop failed; stopping the site");
        shared.messenger.shutdown_cluster(&error);
    }
    shared.begin_shutdown();
    let _ = shared.stopped.count_down();
    debug!(partition = shared.partition, "executor loop stopped");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "executor loop panicked".to_owned())
}

fn run_loop(shared: &Arc<ExecutorShared>, receiver: &mpsc::Receiver<LoopCommand>) -> PtxResult<()> {
    let mut last_tick: Option<Instant> = None;
    let mut polls: u64 = 0;
    while !shared.is_shutting_down() {
        match receiver.recv_timeout(shared.config.work_poll_timeout) {
            Ok(LoopCommand::Work(item)) => {
                let _ = shared.queued.fetch_sub(1, Ordering::AcqRel);
                if let Err(error) = shared.process(item) {
                    if error.is_fatal() {
                        return Err(error);
                    }
                    warn!(partition = shared.partition, %error, "work item failed");
                }
            }
            Ok(LoopCommand::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        shared.tick(&mut last_tick)?;
        shared.drain_finished()?;

        polls += 1;
        if polls % shared.config.error_report_polls == 0 {
            let errors = shared.error_counter.swap(0, Ordering::AcqRel);
            if errors > 0 {
                warn!(partition = shared.partition, errors, "transaction errors since last report");
            }
        }
    }
    Ok(())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

struct ExecutorContext<'a> {
    shared: &'a ExecutorShared,
}

impl SysProcContext for ExecutorContext<'_> {
    fn partition_id(&self) -> PartitionId {
        self.shared.partition
    }

    fn snapshot(&self) -> ExecutorSnapshot {
        self.shared.snapshot().unwrap_or(ExecutorSnapshot {
            partition: self.shared.partition,
            ..ExecutorSnapshot::default()
        })
    }
}

impl ExecutorShared {
    fn process(self: &Arc<Self>, item: WorkItem) -> PtxResult<()> {
        match item {
            WorkItem::Fragment(task) => self.process_fragment_task(task),
            WorkItem::Initiate(task) => self.process_initiate_task(task),
        }
    }

    /// Ticks the engine at most once per interval; the first call only primes the clock.
    fn tick(&self, last_tick: &mut Option<Instant>) -> PtxResult<()> {
        let now = Instant::now();
        let Some(previous) = *last_tick else {
            *last_tick = Some(now);
            return Ok(());
        };
        if now.duration_since(previous) < self.config.tick_interval {
            return Ok(());
        }
        *last_tick = Some(now);
        let mut lane = self.lock_lane()?;
        let last_committed = lane.last_committed;
        if let Err(error) = lane.engine.tick(now_millis(), last_committed) {
            warn!(partition = self.partition, %error, "engine tick failed");
        }
        Ok(())
    }

    fn drain_finished(&self) -> PtxResult<()> {
        let finished: Vec<TxnId> = self
            .finished
            .lock()
            .map_err(|_| PtxError::InvalidState("finished queue mutex is poisoned"))?
            .drain(..)
            .collect();
        if finished.is_empty() {
            return Ok(());
        }
        let mut table = self.lock_table()?;
        for txn_id in finished {
            if let Some(procedure) = table.remove_finished(txn_id)? {
                self.procedures.give_back(procedure);
            }
            trace!(partition = self.partition, txn_id, "txn state cleaned up");
        }
        Ok(())
    }

    fn process_initiate_task(self: &Arc<Self>, task: InitiateTask) -> PtxResult<()> {
        let procedure = match self.procedures.borrow(&task.procedure) {
            Ok(procedure) => procedure,
            Err(error) => {
                warn!(
                    partition = self.partition,
                    txn_id = task.txn_id,
                    procedure = %task.procedure,
                    %error,
                    "cannot start procedure"
                );
                let response =
                    ClientResponse::from_outcome(task.txn_id, task.client_handle, Err(error));
                return self.send_client_response(response);
            }
        };

        debug!(
            partition = self.partition,
            txn_id = task.txn_id,
            procedure = %task.procedure,
            "starting procedure"
        );
        let shared = Arc::clone(self);
        let (txn_id, client_handle) = (task.txn_id, task.client_handle);
        let submitted = self
            .helpers
            .submit(Box::new(move || shared.run_procedure(task, procedure)));
        if let Err(error) = submitted {
            let response = ClientResponse::from_outcome(txn_id, client_handle, Err(error));
            return self.send_client_response(response);
        }
        Ok(())
    }

    /// Runs on a helper thread.
    fn run_procedure(self: &Arc<Self>, task: InitiateTask, mut procedure: BoundProcedure) {
        let runtime = ProcedureContext::new(self, task.txn_id);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            procedure.instance.run(&runtime, &task.params)
        }))
        .unwrap_or_else(|payload| Err(PtxError::Unexpected(panic_message(payload.as_ref()))));

        match self.lock_table() {
            Ok(mut table) => match table.get_mut(task.txn_id) {
                Ok(state) => state.bind_procedure(procedure),
                Err(_) => self.procedures.give_back(procedure),
            },
            Err(_) => self.procedures.give_back(procedure),
        }

        let response = ClientResponse::from_outcome(task.txn_id, task.client_handle, outcome);
        if let Err(error) = self.send_client_response(response) {
            warn!(partition = self.partition, txn_id = task.txn_id, %error, "client response lost");
        }
    }

    fn set_current_txn(&self, txn_id: Option<TxnId>) -> PtxResult<()> {
        let mut progress = self.lock_progress()?;
        if let Some(txn_id) = txn_id {
            progress.last_executed = Some(txn_id);
        }
        progress.current_txn = txn_id;
        Ok(())
    }

    fn process_fragment_task(self: &Arc<Self>, task: FragmentTask) -> PtxResult<()> {
        let txn_id = task.txn_id;
        let (is_local, undo_token) = {
            let mut table = self.lock_table()?;
            let is_local = table.get(txn_id)?.is_local();
            if !is_local {
                table.begin_round(txn_id, self.next_undo_token())?;
            }
            let undo_token = table.get(txn_id)?.last_undo_token().unwrap_or(NO_UNDO_TOKEN);
            (is_local, undo_token)
        };

        self.set_current_txn(Some(txn_id))?;
        trace!(
            partition = self.partition,
            txn_id,
            task_id = task.task_id,
            fragments = task.fragment_count(),
            undo_token,
            "executing fragment task"
        );
        let outcome = self.execute_task(&task, undo_token);
        self.set_current_txn(None)?;

        let direct = task.source_partition == self.partition && !task.using_dtxn_coordinator;
        match outcome {
            Ok(results) if direct => self.store_local_results(&task, results)?,
            Ok(results) => self.send_results(&task, results)?,
            Err(error) => {
                if error.is_fatal() {
                    return Err(error);
                }
                self.record_error();
                warn!(
                    partition = self.partition,
                    txn_id,
                    task_id = task.task_id,
                    %error,
                    "fragment task failed"
                );
                if direct {
                    self.store_local_failure(&task, error)?;
                } else {
                    self.send_failure(&task, error)?;
                }
            }
        }

        if !is_local && task.using_dtxn_coordinator {
            self.lock_table()?.finish_round(txn_id)?;
        }
        Ok(())
    }

    fn execute_task(&self, task: &FragmentTask, undo_token: UndoToken) -> PtxResult<DependencySet> {
        task.validate()?;
        let results = if task.sysproc {
            let context = ExecutorContext { shared: self };
            let mut results = DependencySet::new();
            for (fragment_id, params) in task.fragment_ids.iter().zip(&task.params) {
                let produced = self.sysprocs.execute(
                    task.txn_id,
                    &task.attached_results,
                    *fragment_id,
                    params,
                    &context,
                )?;
                for (dep_id, table) in produced.into_pairs() {
                    results.push(dep_id, table);
                }
            }
            results
        } else {
            let mut lane = self.lock_lane()?;
            self.lock_table()?.get_mut(task.txn_id)?.mark_submitted_to_engine();
            if !task.attached_results.is_empty() {
                lane.engine
                    .stash_dependencies(task.attached_results.clone())?;
            }
            let batch = FragmentBatch::from_task(task, self.partition, lane.last_committed, undo_token);
            lane.engine.execute_fragments(&batch)?
        };

        if results.len() != task.output_dep_ids.len() {
            return Err(PtxError::Unexpected(format!(
                "txn #{} task {} produced {} outputs for {} dependencies",
                task.txn_id,
                task.task_id,
                results.len(),
                task.output_dep_ids.len()
            )));
        }
        Ok(results)
    }

    fn store_local_results(self: &Arc<Self>, task: &FragmentTask, results: DependencySet) -> PtxResult<()> {
        let mut released = Vec::new();
        {
            let mut table = self.lock_table()?;
            for (dep_id, result) in results.into_pairs() {
                released.extend(table.record_result(task.txn_id, self.partition, dep_id, result)?);
                released.extend(table.record_response(task.txn_id, self.partition, dep_id)?);
            }
        }
        self.dispatch_batch(task.txn_id, released)
    }

    fn store_local_failure(self: &Arc<Self>, task: &FragmentTask, error: PtxError) -> PtxResult<()> {
        let mut released = Vec::new();
        {
            let mut table = self.lock_table()?;
            table.get_mut(task.txn_id)?.set_pending_error(error);
            for &dep_id in &task.output_dep_ids {
                released.extend(table.record_failure(task.txn_id, self.partition, dep_id)?);
            }
        }
        self.dispatch_batch(task.txn_id, released)
    }

    fn send_results(&self, task: &FragmentTask, results: DependencySet) -> PtxResult<()> {
        let response =
            FragmentResponse::success(task, self.partition, results.dependency_ids().to_vec());
        if let Err(error) = self.messenger.send_dependency_set(
            task.txn_id,
            self.partition,
            task.source_partition,
            results,
        ) {
            warn!(partition = self.partition, txn_id = task.txn_id, %error, "dependency shipment failed");
        }
        self.reply(task, CoordinatorStatus::Ok, response)
    }

    fn send_failure(&self, task: &FragmentTask, error: PtxError) -> PtxResult<()> {
        let response = FragmentResponse::failure(task, self.partition, error);
        self.reply(task, CoordinatorStatus::AbortUser, response)
    }

    fn reply(
        &self,
        task: &FragmentTask,
        status: CoordinatorStatus,
        response: FragmentResponse,
    ) -> PtxResult<()> {
        let callback = self
            .lock_table()?
            .get_mut(task.txn_id)?
            .take_fragment_callback(task.task_id);
        match callback {
            Some(callback) => callback(CoordinatorReply {
                status,
                payload: response,
            }),
            None => warn!(
                partition = self.partition,
                txn_id = task.txn_id,
                task_id = task.task_id,
                "no fragment continuation registered; response dropped"
            ),
        }
        Ok(())
    }
}
