use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use super::{ExecutorParts, PartitionExecutor};
use crate::procedure::ProcedureCatalog;
use crate::sysprocs::{EXECUTOR_STATUS, ExecutorStatus, ExecutorStatusProcedure};
use crate::test_support::{eventually, fast_config, fragment, scripted};
use googletest::prelude::*;
use ptx_common::error::{PtxError, PtxResult};
use ptx_common::ids::{NULL_DEPENDENCY_ID, PartitionId, TxnId};
use ptx_core::engine::InMemoryEngine;
use ptx_core::fragment::{
    ClientResponse, ClientStatus, CoordinatorReply, CoordinatorStatus, DependencySet,
    FragmentTask, InitiateTask, WorkItem,
};
use ptx_core::messenger::{Continuation, Messenger, WorkResponseCallback};
use ptx_core::registry::SysProcRegistry;
use ptx_core::table::{ParameterSet, ResultTable, Value};
use rstest::rstest;

const ECHO: i64 = 10;
const INSERT: i64 = 20;

/// Single-partition messenger that records why the site was halted.
///
/// A gated messenger holds the first dependency shipment until the gate opens.
#[derive(Default)]
struct IsolatedMessenger {
    gate: Mutex<Option<mpsc::Receiver<()>>>,
    halted: Mutex<Option<PtxError>>,
}

impl IsolatedMessenger {
    fn gated() -> (Self, mpsc::Sender<()>) {
        let (open, gate) = mpsc::channel();
        let messenger = Self {
            gate: Mutex::new(Some(gate)),
            ..Self::default()
        };
        (messenger, open)
    }

    fn halt_cause(&self) -> Option<PtxError> {
        self.halted.lock().expect("halt cause lock").clone()
    }
}

impl Messenger for IsolatedMessenger {
    fn request_work(
        &self,
        txn_id: TxnId,
        _fragments: Vec<FragmentTask>,
        _callback: WorkResponseCallback,
    ) -> PtxResult<()> {
        Err(PtxError::Unexpected(format!("txn #{txn_id} has no remote partitions")))
    }

    fn send_dependency_set(
        &self,
        _txn_id: TxnId,
        _sender: PartitionId,
        _receiver: PartitionId,
        _dependencies: DependencySet,
    ) -> PtxResult<()> {
        let gate = self.gate.lock().expect("gate lock").take();
        if let Some(gate) = gate {
            let _ = gate.recv_timeout(Duration::from_secs(5));
        }
        Ok(())
    }

    fn shutdown_cluster(&self, cause: &PtxError) {
        let _ = self
            .halted
            .lock()
            .expect("halt cause lock")
            .get_or_insert_with(|| cause.clone());
    }
}

struct Harness {
    executor: PartitionExecutor,
    engine: InMemoryEngine,
    errors: Arc<AtomicU64>,
    messenger: Arc<IsolatedMessenger>,
}

impl Harness {
    fn start(partitions: u16, catalog: ProcedureCatalog) -> Self {
        Self::start_with(partitions, catalog, IsolatedMessenger::default())
    }

    fn start_with(partitions: u16, catalog: ProcedureCatalog, messenger: IsolatedMessenger) -> Self {
        let messenger = Arc::new(messenger);
        let engine = InMemoryEngine::new();
        engine
            .create_table("ACCOUNTS", ["ID"])
            .expect("create table");
        engine
            .register_program(INSERT, |scope| {
                let id = scope.params().get(0).cloned().unwrap_or(Value::Null);
                scope.insert_row("ACCOUNTS", vec![id])?;
                Ok(ResultTable::scalar("MODIFIED", Value::Integer(1)))
            })
            .expect("register program");

        let mut sysprocs = SysProcRegistry::new();
        sysprocs
            .register(Arc::new(ExecutorStatus))
            .expect("register status sysproc");
        let errors = Arc::new(AtomicU64::new(0));
        let parts = ExecutorParts {
            engine: Box::new(engine.clone()),
            messenger: Arc::clone(&messenger) as Arc<dyn Messenger>,
            sysprocs: sysprocs.freeze(),
            procedures: catalog.freeze(),
            error_counter: Arc::clone(&errors),
        };
        let executor =
            PartitionExecutor::start(0, &fast_config(partitions), parts).expect("start executor");
        Self {
            executor,
            engine,
            errors,
            messenger,
        }
    }

    fn run(
        &self,
        txn_id: TxnId,
        procedure: &str,
        single: bool,
    ) -> CoordinatorReply<ClientResponse> {
        let (sender, receiver) = mpsc::channel();
        let task = InitiateTask {
            txn_id,
            client_handle: 7,
            base_partition: 0,
            procedure: procedure.to_owned(),
            params: ParameterSet::new(vec![Value::Integer(5)]),
            predict_single_partition: single,
        };
        let continuation = Continuation::Client(Box::new(move |reply| {
            let _ = sender.send(reply);
        }));
        self.executor
            .do_work(WorkItem::Initiate(task), Some(continuation), single)
            .expect("queue initiate task");
        receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("client response")
    }

    fn accounts(&self) -> usize {
        self.engine
            .table("ACCOUNTS")
            .expect("engine lock")
            .map_or(0, |table| table.row_count())
    }
}

fn catalog() -> ProcedureCatalog {
    let mut catalog = ProcedureCatalog::new();
    catalog.register(
        "Echo",
        scripted(|runtime, params| {
            runtime.execute_batch(vec![fragment(
                runtime,
                0,
                ECHO,
                NULL_DEPENDENCY_ID,
                1,
                params.values().to_vec(),
            )])
        }),
    );
    catalog.register(
        "Insert",
        scripted(|runtime, params| {
            runtime.execute_batch(vec![fragment(
                runtime,
                0,
                INSERT,
                NULL_DEPENDENCY_ID,
                1,
                params.values().to_vec(),
            )])
        }),
    );
    catalog.register(
        "InsertThenAbort",
        scripted(|runtime, params| {
            let _ = runtime.execute_batch(vec![fragment(
                runtime,
                0,
                INSERT,
                NULL_DEPENDENCY_ID,
                1,
                params.values().to_vec(),
            )])?;
            Err(PtxError::UserAbort("changed my mind".to_owned()))
        }),
    );
    catalog.register(
        "BlindInsert",
        scripted(|runtime, params| {
            runtime.execute_batch(vec![fragment(
                runtime,
                0,
                INSERT,
                NULL_DEPENDENCY_ID,
                NULL_DEPENDENCY_ID,
                params.values().to_vec(),
            )])
        }),
    );
    catalog.register(
        "BlindInsertThenAbort",
        scripted(|runtime, params| {
            let _ = runtime.execute_batch(vec![fragment(
                runtime,
                0,
                INSERT,
                NULL_DEPENDENCY_ID,
                NULL_DEPENDENCY_ID,
                params.values().to_vec(),
            )]);
            Err(PtxError::UserAbort("changed my mind".to_owned()))
        }),
    );
    catalog.register(
        "RetryAfterRejectedBatch",
        scripted(|runtime, params| {
            let rejected = runtime.execute_batch(vec![fragment(
                runtime,
                0,
                INSERT,
                NULL_DEPENDENCY_ID,
                NULL_DEPENDENCY_ID,
                params.values().to_vec(),
            )]);
            if rejected.is_ok() {
                return Err(PtxError::Unexpected("batch without output ran".to_owned()));
            }
            runtime.execute_batch(vec![fragment(
                runtime,
                0,
                INSERT,
                NULL_DEPENDENCY_ID,
                1,
                params.values().to_vec(),
            )])
        }),
    );
    catalog.register(
        "Chain",
        scripted(|runtime, params| {
            let produce = fragment(runtime, 0, ECHO, NULL_DEPENDENCY_ID, 1, params.values().to_vec());
            let consume = fragment(runtime, 0, ECHO + 1, 1, 2, Vec::new());
            runtime.execute_batch(vec![consume, produce])
        }),
    );
    catalog.register(
        "Cycle",
        scripted(|runtime, _params| {
            let first = fragment(runtime, 0, ECHO, 5, 6, Vec::new());
            let second = fragment(runtime, 0, ECHO + 1, 6, 5, Vec::new());
            runtime.execute_batch(vec![first, second])
        }),
    );
    catalog.register(
        "Stray",
        scripted(|runtime, params| {
            runtime.execute_batch(vec![fragment(
                runtime,
                1,
                ECHO,
                NULL_DEPENDENCY_ID,
                1,
                params.values().to_vec(),
            )])
        }),
    );
    catalog.register(
        "Load",
        scripted(|runtime, _params| {
            let mut rows = ResultTable::new(["ID"]);
            rows.push_row(vec![Value::Integer(1)])?;
            rows.push_row(vec![Value::Integer(2)])?;
            runtime.load_table("ACCOUNTS", rows)?;
            Ok(Vec::new())
        }),
    );
    catalog.register(EXECUTOR_STATUS, || Box::new(ExecutorStatusProcedure));
    catalog
}

#[rstest]
fn single_partition_procedure_commits_inline() {
    let harness = Harness::start(1, catalog());
    let reply = harness.run(1, "Echo", true);

    assert_that!(reply.status, eq(CoordinatorStatus::Ok));
    assert_that!(reply.payload.client_handle, eq(7));
    assert_that!(reply.payload.results.len(), eq(1_usize));
    assert_that!(reply.payload.results[0].rows()[0][0].as_integer(), eq(Some(5)));

    let log = harness.engine.log().expect("engine log");
    assert_that!(&log.released, eq(&vec![1_u64]));
    let cleaned = eventually(|| !harness.executor.has_transaction(1).unwrap_or(true));
    assert_that!(cleaned, eq(true));
}

#[rstest]
fn finished_transactions_ignore_second_commit_and_abort() {
    let harness = Harness::start(1, catalog());
    let reply = harness.run(1, "Insert", false);
    assert_that!(reply.status, eq(CoordinatorStatus::Ok));

    assert_that!(&harness.executor.commit(1), eq(&Ok(true)));
    assert_that!(&harness.executor.commit(1), eq(&Ok(false)));
    assert_that!(&harness.executor.abort(1), eq(&Ok(false)));
    assert_that!(&harness.executor.commit(99), eq(&Ok(false)));
    assert_that!(harness.accounts(), eq(1_usize));
}

#[rstest]
fn user_abort_rolls_back_writes() {
    let harness = Harness::start(1, catalog());
    let reply = harness.run(1, "InsertThenAbort", true);

    assert_that!(reply.status, eq(CoordinatorStatus::AbortUser));
    assert_that!(reply.payload.status, eq(ClientStatus::UserAbort));
    assert_that!(harness.accounts(), eq(0_usize));
    let log = harness.engine.log().expect("engine log");
    assert_that!(&log.undone, eq(&vec![1_u64]));
}

#[rstest]
fn failing_fragment_aborts_and_counts_errors() {
    let harness = Harness::start(1, catalog());
    harness
        .engine
        .fail_fragment(INSERT, PtxError::Engine("constraint violated".to_owned()))
        .expect("inject failure");

    let reply = harness.run(1, "Insert", true);

    assert_that!(reply.status, eq(CoordinatorStatus::AbortUser));
    assert_that!(
        reply.payload.status_message.as_str(),
        contains_substring("constraint violated")
    );
    assert_that!(harness.errors.load(Ordering::Acquire) >= 1, eq(true));
}

#[rstest]
fn blocked_fragment_runs_once_its_input_arrives() {
    let harness = Harness::start(1, catalog());
    let reply = harness.run(1, "Chain", true);

    assert_that!(reply.status, eq(CoordinatorStatus::Ok));
    assert_that!(reply.payload.results.len(), eq(1_usize));
    assert_that!(reply.payload.results[0].rows()[0][0].as_integer(), eq(Some(5)));

    let log = harness.engine.log().expect("engine log");
    let stashed: Vec<Vec<i32>> = log
        .executed
        .iter()
        .map(|batch| batch.stashed_inputs.clone())
        .collect();
    assert_that!(&stashed, eq(&vec![Vec::new(), vec![1]]));
}

#[rstest]
fn fully_blocked_batch_is_a_deadlock() {
    let harness = Harness::start(1, catalog());
    let reply = harness.run(1, "Cycle", true);

    assert_that!(reply.payload.status, eq(ClientStatus::UnexpectedError));
    assert_that!(
        reply.payload.status_message.as_str(),
        contains_substring("deadlock")
    );
    let executed = harness.engine.log().expect("engine log").executed.len();
    assert_that!(executed, eq(0_usize));
}

#[rstest]
fn single_partition_prediction_violation_is_reported_before_dispatch() {
    let harness = Harness::start(2, catalog());
    let reply = harness.run(1, "Stray", true);

    assert_that!(reply.status, eq(CoordinatorStatus::AbortMispredict));
    assert_that!(reply.payload.status, eq(ClientStatus::Misprediction));
    let executed = harness.engine.log().expect("engine log").executed.len();
    assert_that!(executed, eq(0_usize));
}

#[rstest]
fn abort_behind_a_released_token_is_rejected() {
    let harness = Harness::start(1, catalog());
    assert_that!(harness.run(1, "Insert", false).status, eq(CoordinatorStatus::Ok));
    assert_that!(harness.run(2, "Insert", false).status, eq(CoordinatorStatus::Ok));

    assert_that!(&harness.executor.commit(2), eq(&Ok(true)));
    let result = harness.executor.abort(1);
    assert_that!(
        &result,
        eq(&Err(PtxError::OutOfOrderAbort {
            txn_id: 1,
            undo_token: 1,
            released: 2,
        }))
    );
}

#[rstest]
fn bulk_load_is_undone_with_its_transaction() {
    let harness = Harness::start(1, catalog());
    let reply = harness.run(1, "Load", false);
    assert_that!(reply.status, eq(CoordinatorStatus::Ok));
    assert_that!(harness.accounts(), eq(2_usize));

    assert_that!(&harness.executor.abort(1), eq(&Ok(true)));
    assert_that!(harness.accounts(), eq(0_usize));
    let loads = harness.engine.log().expect("engine log").loads.len();
    assert_that!(loads, eq(1_usize));
}

#[rstest]
fn unknown_procedure_is_answered_with_an_error() {
    let harness = Harness::start(1, catalog());
    let reply = harness.run(1, "Missing", true);

    assert_that!(reply.payload.status, eq(ClientStatus::UnexpectedError));
    assert_that!(
        reply.payload.status_message.as_str(),
        contains_substring("Missing")
    );
}

#[rstest]
fn status_procedure_reports_the_running_transaction() {
    let harness = Harness::start(1, catalog());
    let reply = harness.run(3, EXECUTOR_STATUS, true);

    assert_that!(reply.status, eq(CoordinatorStatus::Ok));
    let rows = reply.payload.results[0].rows();
    assert_that!(rows.len(), eq(1_usize));
    assert_that!(rows[0][0].as_integer(), eq(Some(0)));
    assert_that!(rows[0][5].as_integer(), eq(Some(3)));
}

#[rstest]
fn shutdown_rejects_new_work() {
    let harness = Harness::start(1, catalog());
    harness.executor.shutdown();

    assert_that!(harness.executor.is_stopped(), eq(true));
    let task = InitiateTask {
        txn_id: 1,
        client_handle: 0,
        base_partition: 0,
        procedure: "Echo".to_owned(),
        params: ParameterSet::default(),
        predict_single_partition: true,
    };
    let result = harness
        .executor
        .do_work(WorkItem::Initiate(task), None, true);
    assert_that!(&result, eq(&Err(PtxError::Shutdown)));
}

#[rstest]
fn write_without_output_dependency_is_refused_before_it_runs() {
    let harness = Harness::start(1, catalog());
    let reply = harness.run(1, "BlindInsert", true);

    assert_that!(reply.payload.status, eq(ClientStatus::UnexpectedError));
    assert_that!(
        reply.payload.status_message.as_str(),
        contains_substring("no output dependency")
    );
    assert_that!(harness.accounts(), eq(0_usize));
    let executed = harness.engine.log().expect("engine log").executed.len();
    assert_that!(executed, eq(0_usize));
}

#[rstest]
fn abort_after_refused_write_leaves_no_rows() {
    let harness = Harness::start(1, catalog());
    let reply = harness.run(1, "BlindInsertThenAbort", true);

    assert_that!(reply.status, eq(CoordinatorStatus::AbortUser));
    assert_that!(harness.accounts(), eq(0_usize));
    let cleaned = eventually(|| !harness.executor.has_transaction(1).unwrap_or(true));
    assert_that!(cleaned, eq(true));
    assert_that!(harness.accounts(), eq(0_usize));
}

#[rstest]
fn rejected_batch_leaves_the_transaction_ready_for_another_round() {
    let harness = Harness::start(1, catalog());
    let reply = harness.run(1, "RetryAfterRejectedBatch", true);

    assert_that!(reply.status, eq(CoordinatorStatus::Ok));
    assert_that!(reply.payload.results.len(), eq(1_usize));
    assert_that!(harness.accounts(), eq(1_usize));
    let log = harness.engine.log().expect("engine log");
    assert_that!(log.executed.len(), eq(1_usize));
    assert_that!(&log.released, eq(&vec![2_u64]));
}

#[rstest]
fn engine_ticks_carry_the_last_committed_txn() {
    let harness = Harness::start(1, catalog());
    let ticked = eventually(|| {
        harness
            .engine
            .log()
            .is_ok_and(|log| !log.ticks.is_empty())
    });
    assert_that!(ticked, eq(true));
    let before = harness.engine.log().expect("engine log").ticks;
    assert_that!(before[0].1, eq(None));

    assert_that!(harness.run(1, "Insert", false).status, eq(CoordinatorStatus::Ok));
    assert_that!(&harness.executor.commit(1), eq(&Ok(true)));

    let carried = eventually(|| {
        harness
            .engine
            .log()
            .is_ok_and(|log| log.ticks.iter().any(|&(_, committed)| committed == Some(1)))
    });
    assert_that!(carried, eq(true));
    let after = harness.engine.log().expect("engine log").ticks;
    assert_that!(after.len() > before.len(), eq(true));
    assert_that!(after.windows(2).all(|pair| pair[0].0 <= pair[1].0), eq(true));
}

#[rstest]
fn fragment_for_a_cleaned_up_txn_halts_the_site() {
    let (messenger, open) = IsolatedMessenger::gated();
    let harness = Harness::start_with(2, catalog(), messenger);
    let remote_echo = |txn_id: TxnId| {
        WorkItem::Fragment(FragmentTask::new(txn_id, 1, 0).with_fragment(
            ECHO,
            NULL_DEPENDENCY_ID,
            1,
            ParameterSet::new(vec![Value::Integer(1)]),
        ))
    };

    harness
        .executor
        .do_work(remote_echo(49), None, false)
        .expect("queue blocking fragment");
    harness
        .executor
        .do_work(remote_echo(50), None, false)
        .expect("queue doomed fragment");
    assert_that!(&harness.executor.abort(50), eq(&Ok(true)));
    open.send(()).expect("open gate");

    let stopped = eventually(|| harness.executor.is_stopped());
    assert_that!(stopped, eq(true));
    assert_that!(&harness.executor.wait_for_shutdown(), eq(&Ok(())));
    assert_that!(
        &harness.messenger.halt_cause(),
        eq(&Some(PtxError::MissingTransaction {
            txn_id: 50,
            partition: 0,
        }))
    );
    let result = harness.executor.do_work(remote_echo(51), None, false);
    assert_that!(&result, eq(&Err(PtxError::Shutdown)));
}
