use std::collections::HashMap;

use super::{ExecutionEngine, FragmentBatch, InMemoryEngine};
use crate::fragment::FragmentTask;
use crate::table::{ParameterSet, ResultTable, Value};
use googletest::prelude::*;
use ptx_common::error::PtxError;
use ptx_common::ids::{NO_UNDO_TOKEN, NULL_DEPENDENCY_ID};
use rstest::{fixture, rstest};

const INSERT_FRAGMENT: i64 = 100;

#[fixture]
fn engine() -> InMemoryEngine {
    let engine = InMemoryEngine::new();
    engine
        .create_table("ACCOUNTS", ["ID"])
        .expect("create table");
    engine
        .register_program(INSERT_FRAGMENT, |scope| {
            let id = scope.params().get(0).cloned().unwrap_or(Value::Null);
            scope.insert_row("ACCOUNTS", vec![id])?;
            Ok(ResultTable::scalar("MODIFIED", Value::Integer(1)))
        })
        .expect("register program");
    engine
}

fn insert_task(txn_id: u64, id: i64) -> FragmentTask {
    FragmentTask::new(txn_id, 0, 0).with_fragment(
        INSERT_FRAGMENT,
        NULL_DEPENDENCY_ID,
        1,
        ParameterSet::new(vec![Value::Integer(id)]),
    )
}

fn run_insert(engine: &mut InMemoryEngine, txn_id: u64, id: i64, undo_token: u64) {
    let task = insert_task(txn_id, id);
    let batch = FragmentBatch::from_task(&task, 0, None, undo_token);
    let output = engine
        .execute_fragments(&batch)
        .expect("insert fragment must run");
    assert_that!(output.len(), eq(1_usize));
}

fn account_rows(engine: &InMemoryEngine) -> usize {
    engine
        .table("ACCOUNTS")
        .expect("engine lock")
        .map_or(0, |table| table.row_count())
}

#[rstest]
fn undo_rolls_back_token_and_every_newer_token(mut engine: InMemoryEngine) {
    run_insert(&mut engine, 1, 10, 1);
    run_insert(&mut engine, 2, 20, 2);
    run_insert(&mut engine, 3, 30, 3);

    engine.undo_undo_token(2).expect("undo must succeed");

    assert_that!(account_rows(&engine), eq(1_usize));
    assert_that!(engine.pending_undo_records().expect("engine lock"), eq(1_usize));
}

#[rstest]
fn release_makes_older_work_permanent(mut engine: InMemoryEngine) {
    run_insert(&mut engine, 1, 10, 1);
    run_insert(&mut engine, 2, 20, 2);

    engine.release_undo_token(1).expect("release must succeed");
    engine.undo_undo_token(1).expect("undo must succeed");

    // Token 1 was released, so only token 2's row can still be rolled back.
    assert_that!(account_rows(&engine), eq(1_usize));
    let log = engine.log().expect("engine lock");
    assert_that!(&log.released, eq(&vec![1]));
    assert_that!(&log.undone, eq(&vec![1]));
}

#[rstest]
fn no_undo_token_writes_are_never_logged(mut engine: InMemoryEngine) {
    run_insert(&mut engine, 1, 10, NO_UNDO_TOKEN);
    assert_that!(engine.pending_undo_records().expect("engine lock"), eq(0_usize));
}

#[rstest]
fn stashed_inputs_feed_pass_through_fragments() {
    let mut engine = InMemoryEngine::new();
    let mut inputs = HashMap::new();
    let _ = inputs.insert(
        7,
        vec![
            ResultTable::scalar("N", Value::Integer(1)),
            ResultTable::scalar("N", Value::Integer(2)),
        ],
    );
    engine.stash_dependencies(inputs).expect("stash");

    let task = FragmentTask::new(5, 0, 0).with_fragment(55, 7, 8, ParameterSet::default());
    let output = engine
        .execute_fragments(&FragmentBatch::from_task(&task, 0, None, 1))
        .expect("pass-through must run");

    assert_that!(output.dependency_ids(), eq(&[8][..]));
    assert_that!(output.tables()[0].row_count(), eq(2_usize));
    let log = engine.log().expect("engine lock");
    assert_that!(&log.executed[0].stashed_inputs, eq(&vec![7]));
}

#[rstest]
fn injected_failures_surface_as_errors(mut engine: InMemoryEngine) {
    engine
        .fail_fragment(INSERT_FRAGMENT, PtxError::Engine("constraint".to_owned()))
        .expect("inject failure");
    let task = insert_task(1, 10);

    let result = engine
        .execute_fragments(&FragmentBatch::from_task(&task, 0, None, 1))
        .map(|set| set.len());

    assert_that!(
        &result,
        eq(&Err(PtxError::Engine("constraint".to_owned())))
    );
}

#[rstest]
fn dropped_outputs_shrink_the_dependency_set(mut engine: InMemoryEngine) {
    engine.drop_output(INSERT_FRAGMENT).expect("inject drop");
    let task = insert_task(1, 10);

    let output = engine
        .execute_fragments(&FragmentBatch::from_task(&task, 0, None, 1))
        .expect("fragment still runs");

    assert_that!(output.is_empty(), eq(true));
    assert_that!(account_rows(&engine), eq(1_usize));
}

#[rstest]
fn bulk_load_is_undoable(mut engine: InMemoryEngine) {
    let mut rows = ResultTable::new(["ID"]);
    rows.push_row(vec![Value::Integer(1)]).expect("row");
    rows.push_row(vec![Value::Integer(2)]).expect("row");

    engine
        .load_table("ACCOUNTS", rows, 9, None, 4)
        .expect("load must succeed");
    assert_that!(account_rows(&engine), eq(2_usize));

    engine.undo_undo_token(4).expect("undo must succeed");
    assert_that!(account_rows(&engine), eq(0_usize));
}
