use super::{TransactionTable, TxnKind};
use googletest::prelude::*;
use ptx_common::error::PtxError;
use ptx_common::ids::NULL_DEPENDENCY_ID;
use ptx_core::fragment::FragmentTask;
use ptx_core::table::{ParameterSet, ResultTable, Value};
use rstest::{fixture, rstest};

const TXN: u64 = 1000;

#[fixture]
fn table() -> TransactionTable {
    let mut table = TransactionTable::new(0, 4, 16);
    let _ = table
        .get_or_insert(TXN, 7, 0, TxnKind::Local)
        .expect("state slot");
    table
}

fn cell(value: i64) -> ResultTable {
    ResultTable::scalar("V", Value::Integer(value))
}

#[rstest]
fn unknown_transaction_is_reported_with_partition(table: TransactionTable) {
    let result = table.get(42).map(|state| state.txn_id());
    assert_that!(
        &result,
        eq(&Err(PtxError::MissingTransaction {
            txn_id: 42,
            partition: 0
        }))
    );
    assert_that!(table.len(), eq(1_usize));
}

#[rstest]
fn rounds_track_first_and_last_undo_token(mut table: TransactionTable) {
    table.begin_round(TXN, 3).expect("round 1");
    table.begin_round(TXN, 8).expect("round 2");

    let state = table.get(TXN).expect("state");
    assert_that!(state.first_undo_token(), eq(Some(3)));
    assert_that!(state.last_undo_token(), eq(Some(8)));
    assert_that!(state.round(), eq(2));
}

#[rstest]
fn round_completes_only_when_data_and_acks_arrive(mut table: TransactionTable) {
    table.begin_round(TXN, 1).expect("round");
    table.register_output(TXN, 5, 1).expect("register");
    table.register_output(TXN, 5, 0).expect("register");
    let latch = table.arm_round(TXN).expect("arm");
    assert_that!(latch.remaining(), eq(2_usize));

    let _ = table.record_result(TXN, 1, 5, cell(1)).expect("record");
    assert_that!(latch.remaining(), eq(2_usize));
    let _ = table.record_response(TXN, 1, 5).expect("record");
    let _ = table.record_response(TXN, 0, 5).expect("record");
    assert_that!(latch.remaining(), eq(1_usize));
    let _ = table.record_result(TXN, 0, 5, cell(0)).expect("record");

    assert_that!(latch.wait().is_ok(), eq(true));
    assert_that!(table.is_dependency_complete(TXN, 5).expect("state"), eq(true));

    let results = table.collect_results(TXN).expect("collect");
    assert_that!(results.len(), eq(1_usize));
    let cells: Vec<_> = results[0]
        .rows()
        .iter()
        .map(|row| row[0].as_integer())
        .collect();
    assert_that!(&cells, eq(&vec![Some(0), Some(1)]));
}

#[rstest]
fn blocked_fragment_is_released_with_inputs_attached(mut table: TransactionTable) {
    table.begin_round(TXN, 1).expect("round");
    table.register_output(TXN, 5, 1).expect("register");
    table.register_output(TXN, 6, 0).expect("register");
    table.mark_internal(TXN, 5).expect("internal");

    let consumer = FragmentTask::new(TXN, 0, 0).with_fragment(20, 5, 6, ParameterSet::default());
    let parked = table.block_fragment(TXN, consumer).expect("block");
    assert_that!(parked.is_none(), eq(true));
    assert_that!(table.blocked_count(TXN).expect("state"), eq(1_usize));
    let _ = table.arm_round(TXN).expect("arm");

    let _ = table.record_response(TXN, 1, 5).expect("record");
    let released = table.record_result(TXN, 1, 5, cell(9)).expect("record");

    assert_that!(released.len(), eq(1_usize));
    assert_that!(
        released[0]
            .attached_results
            .get(&5)
            .map(Vec::len),
        eq(Some(1_usize))
    );
    assert_that!(table.blocked_count(TXN).expect("state"), eq(0_usize));
}

#[rstest]
fn failed_input_fails_blocked_outputs_and_opens_latch(mut table: TransactionTable) {
    table.begin_round(TXN, 1).expect("round");
    table.register_output(TXN, 5, 1).expect("register");
    table.register_output(TXN, 6, 0).expect("register");
    table.mark_internal(TXN, 5).expect("internal");
    let consumer = FragmentTask::new(TXN, 0, 0).with_fragment(20, 5, 6, ParameterSet::default());
    let _ = table.block_fragment(TXN, consumer).expect("block");
    let latch = table.arm_round(TXN).expect("arm");

    let released = table.record_failure(TXN, 1, 5).expect("record");

    assert_that!(released.is_empty(), eq(true));
    assert_that!(latch.remaining(), eq(0_usize));
}

#[rstest]
fn internal_outputs_are_not_returned(mut table: TransactionTable) {
    table.begin_round(TXN, 1).expect("round");
    table.register_output(TXN, 5, 0).expect("register");
    table.register_output(TXN, 6, 0).expect("register");
    table.mark_internal(TXN, 5).expect("internal");
    let _ = table.arm_round(TXN).expect("arm");
    for (dep_id, value) in [(5, 1), (6, 2)] {
        let _ = table.record_result(TXN, 0, dep_id, cell(value)).expect("record");
        let _ = table.record_response(TXN, 0, dep_id).expect("record");
    }

    let results = table.collect_results(TXN).expect("collect");
    assert_that!(results.len(), eq(1_usize));
    assert_that!(results[0].rows()[0][0].as_integer(), eq(Some(2)));
}

#[rstest]
fn cleanup_requires_finished_state_and_frees_slots(mut table: TransactionTable) {
    table.begin_round(TXN, 1).expect("round");
    table.register_output(TXN, 5, 0).expect("register");

    let early = table.remove_finished(TXN).map(|procedure| procedure.is_some());
    assert_that!(early.is_err(), eq(true));

    table.get_mut(TXN).expect("state").mark_finished();
    let removed = table.remove_finished(TXN).map(|procedure| procedure.is_some());
    assert_that!(&removed, eq(&Ok(false)));
    assert_that!(table.contains(TXN), eq(false));

    let (states, dependencies) = table.arena_stats();
    assert_that!(states.in_use, eq(0_usize));
    assert_that!(dependencies.in_use, eq(0_usize));

    let again = table.remove_finished(TXN).map(|procedure| procedure.is_some());
    assert_that!(&again, eq(&Ok(false)));
}

#[rstest]
fn arrivals_for_unregistered_dependencies_are_ignored(mut table: TransactionTable) {
    table.begin_round(TXN, 1).expect("round");
    let released = table
        .record_response(TXN, 3, NULL_DEPENDENCY_ID)
        .expect("record");
    assert_that!(released.is_empty(), eq(true));
}
