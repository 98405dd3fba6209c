//! In-memory execution engine with an append-only undo log.
//!
//! Tables only grow through fragment programs and bulk loads, so one undo record is the table
//! length before the write. Handles are cheap clones over shared state, which lets a caller
//! keep inspecting the engine after handing it to an executor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use ptx_common::error::{PtxError, PtxResult};
use ptx_common::ids::{
    DependencyId, FragmentId, NO_UNDO_TOKEN, NULL_DEPENDENCY_ID, TxnId, UndoToken,
};

use super::{ExecutionEngine, FragmentBatch};
use crate::containers::{HotMap, HotSet};
use crate::fragment::DependencySet;
use crate::table::{ParameterSet, ResultTable, Value};

/// User-supplied body of one plan fragment.
pub type FragmentProgram = dyn Fn(&mut FragmentScope<'_>) -> PtxResult<ResultTable> + Send + Sync;

/// Mutable view handed to a fragment program while it runs.
pub struct FragmentScope<'a> {
    txn_id: TxnId,
    fragment_id: FragmentId,
    params: &'a ParameterSet,
    inputs: &'a [ResultTable],
    tables: &'a mut HotMap<String, ResultTable>,
    undo_log: &'a mut Vec<UndoEntry>,
    undo_token: UndoToken,
}

impl FragmentScope<'_> {
    /// Transaction executing the fragment.
    #[must_use]
    pub const fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// Fragment being executed.
    #[must_use]
    pub const fn fragment_id(&self) -> FragmentId {
        self.fragment_id
    }

    /// Fragment parameters.
    #[must_use]
    pub const fn params(&self) -> &ParameterSet {
        self.params
    }

    /// Stashed input tables for this fragment's input dependency.
    #[must_use]
    pub const fn inputs(&self) -> &[ResultTable] {
        self.inputs
    }

    /// Reads a table by name.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&ResultTable> {
        self.tables.get(name)
    }

    /// Appends one row to `table`, recording undo information.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::Engine` when the table is unknown or the row width is wrong.
    pub fn insert_row(&mut self, table: &str, row: Vec<Value>) -> PtxResult<()> {
        let Some(target) = self.tables.get_mut(table) else {
            return Err(PtxError::Engine(format!("unknown table '{table}'")));
        };
        let previous_len = target.row_count();
        target.push_row(row)?;
        if self.undo_token != NO_UNDO_TOKEN {
            self.undo_log.push(UndoEntry {
                token: self.undo_token,
                table: table.to_owned(),
                previous_len,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct UndoEntry {
    token: UndoToken,
    table: String,
    previous_len: usize,
}

/// One `execute_fragments` call as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedBatch {
    /// Transaction that issued the batch.
    pub txn_id: TxnId,
    /// Fragments in the batch.
    pub fragment_ids: Vec<FragmentId>,
    /// Undo token the batch ran under.
    pub undo_token: UndoToken,
    /// Dependency ids that were stashed when the batch started.
    pub stashed_inputs: Vec<DependencyId>,
}

/// Record of every engine call, for inspection by callers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineLog {
    /// Fragment batches in call order.
    pub executed: Vec<ExecutedBatch>,
    /// Released undo tokens in call order.
    pub released: Vec<UndoToken>,
    /// Undone undo tokens in call order.
    pub undone: Vec<UndoToken>,
    /// `(now_millis, last_committed)` per tick.
    pub ticks: Vec<(u64, Option<TxnId>)>,
    /// `(table, txn, undo token)` per bulk load.
    pub loads: Vec<(String, TxnId, UndoToken)>,
}

#[derive(Default)]
struct EngineState {
    tables: HotMap<String, ResultTable>,
    programs: HotMap<FragmentId, Arc<FragmentProgram>>,
    failures: HotMap<FragmentId, PtxError>,
    dropped_outputs: HotSet<FragmentId>,
    stash: HashMap<DependencyId, Vec<ResultTable>>,
    undo_log: Vec<UndoEntry>,
    log: EngineLog,
}

/// Shared-state in-memory engine.
///
/// Fragments without a registered program pass their input tables through when they have
/// inputs, and otherwise echo their parameters as one row (`C0`, `C1`, ...).
#[derive(Clone, Default)]
pub struct InMemoryEngine {
    state: Arc<Mutex<EngineState>>,
}

impl std::fmt::Debug for InMemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_struct("InMemoryEngine");
        if let Ok(state) = self.state.lock() {
            debug
                .field("tables", &state.tables.len())
                .field("programs", &state.programs.len())
                .field("undo_log", &state.undo_log.len());
        }
        debug.finish()
    }
}

impl InMemoryEngine {
    /// Creates an engine with no tables and no programs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> PtxResult<MutexGuard<'_, EngineState>> {
        self.state
            .lock()
            .map_err(|_| PtxError::InvalidState("engine state mutex is poisoned"))
    }

    /// Creates (or replaces) an empty table.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when the engine mutex is poisoned.
    pub fn create_table<I, S>(&self, name: &str, columns: I) -> PtxResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.lock()?;
        let _ = state
            .tables
            .insert(name.to_owned(), ResultTable::new(columns));
        Ok(())
    }

    /// Installs the program run for `fragment_id`.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when the engine mutex is poisoned.
    pub fn register_program<F>(&self, fragment_id: FragmentId, program: F) -> PtxResult<()>
    where
        F: Fn(&mut FragmentScope<'_>) -> PtxResult<ResultTable> + Send + Sync + 'static,
    {
        let mut state = self.lock()?;
        let _ = state.programs.insert(fragment_id, Arc::new(program));
        Ok(())
    }

    /// Makes every execution of `fragment_id` fail with `error`.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when the engine mutex is poisoned.
    pub fn fail_fragment(&self, fragment_id: FragmentId, error: PtxError) -> PtxResult<()> {
        let mut state = self.lock()?;
        let _ = state.failures.insert(fragment_id, error);
        Ok(())
    }

    /// Makes `fragment_id` run but omit its output from the returned dependency set.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when the engine mutex is poisoned.
    pub fn drop_output(&self, fragment_id: FragmentId) -> PtxResult<()> {
        let mut state = self.lock()?;
        let _ = state.dropped_outputs.insert(fragment_id);
        Ok(())
    }

    /// Returns a copy of one table.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when the engine mutex is poisoned.
    pub fn table(&self, name: &str) -> PtxResult<Option<ResultTable>> {
        Ok(self.lock()?.tables.get(name).cloned())
    }

    /// Returns a copy of the call log.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when the engine mutex is poisoned.
    pub fn log(&self) -> PtxResult<EngineLog> {
        Ok(self.lock()?.log.clone())
    }

    /// Number of undo records not yet released or undone.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when the engine mutex is poisoned.
    pub fn pending_undo_records(&self) -> PtxResult<usize> {
        Ok(self.lock()?.undo_log.len())
    }
}

fn default_program(scope: &mut FragmentScope<'_>) -> PtxResult<ResultTable> {
    if !scope.inputs().is_empty() {
        let mut merged = ResultTable::default();
        for input in scope.inputs() {
            merged.merge(input.clone())?;
        }
        return Ok(merged);
    }
    let values = scope.params().values();
    let mut echo = ResultTable::new((0..values.len()).map(|index| format!("C{index}")));
    echo.push_row(values.to_vec())?;
    Ok(echo)
}

impl ExecutionEngine for InMemoryEngine {
    fn stash_dependencies(
        &mut self,
        dependencies: HashMap<DependencyId, Vec<ResultTable>>,
    ) -> PtxResult<()> {
        let mut state = self.lock()?;
        for (dep_id, tables) in dependencies {
            state.stash.entry(dep_id).or_default().extend(tables);
        }
        Ok(())
    }

    fn execute_fragments(&mut self, batch: &FragmentBatch<'_>) -> PtxResult<DependencySet> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let stash = std::mem::take(&mut state.stash);

        let mut stashed_inputs: Vec<DependencyId> = stash.keys().copied().collect();
        stashed_inputs.sort_unstable();
        state.log.executed.push(ExecutedBatch {
            txn_id: batch.txn_id,
            fragment_ids: batch.fragment_ids.to_vec(),
            undo_token: batch.undo_token,
            stashed_inputs,
        });

        let no_params = ParameterSet::default();
        let mut output = DependencySet::new();
        for (index, &fragment_id) in batch.fragment_ids.iter().enumerate() {
            if let Some(error) = state.failures.get(&fragment_id) {
                return Err(error.clone());
            }
            let input_dep_id = batch
                .input_dep_ids
                .get(index)
                .copied()
                .unwrap_or(NULL_DEPENDENCY_ID);
            let inputs = stash.get(&input_dep_id).map_or(&[][..], Vec::as_slice);
            let params = batch.params.get(index).unwrap_or(&no_params);
            let program = state.programs.get(&fragment_id).cloned();

            let mut scope = FragmentScope {
                txn_id: batch.txn_id,
                fragment_id,
                params,
                inputs,
                tables: &mut state.tables,
                undo_log: &mut state.undo_log,
                undo_token: batch.undo_token,
            };
            let table = match program {
                Some(program) => program(&mut scope)?,
                None => default_program(&mut scope)?,
            };

            if state.dropped_outputs.contains(&fragment_id) {
                continue;
            }
            let Some(&output_dep_id) = batch.output_dep_ids.get(index) else {
                return Err(PtxError::Engine(format!(
                    "fragment #{fragment_id} has no output dependency"
                )));
            };
            output.push(output_dep_id, table);
        }
        Ok(output)
    }

    fn load_table(
        &mut self,
        table_name: &str,
        data: ResultTable,
        txn_id: TxnId,
        _last_committed_txn_id: Option<TxnId>,
        undo_token: UndoToken,
    ) -> PtxResult<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        state
            .log
            .loads
            .push((table_name.to_owned(), txn_id, undo_token));
        let target = state.tables.entry(table_name.to_owned()).or_default();
        let previous_len = target.row_count();
        target.merge(data)?;
        if undo_token != NO_UNDO_TOKEN {
            state.undo_log.push(UndoEntry {
                token: undo_token,
                table: table_name.to_owned(),
                previous_len,
            });
        }
        Ok(())
    }

    fn release_undo_token(&mut self, token: UndoToken) -> PtxResult<()> {
        let mut state = self.lock()?;
        state.log.released.push(token);
        state.undo_log.retain(|entry| entry.token > token);
        Ok(())
    }

    fn undo_undo_token(&mut self, token: UndoToken) -> PtxResult<()> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        state.log.undone.push(token);
        while let Some(entry) = state.undo_log.last() {
            if entry.token < token {
                break;
            }
            if let Some(entry) = state.undo_log.pop()
                && let Some(table) = state.tables.get_mut(&entry.table)
            {
                table.truncate(entry.previous_len);
            }
        }
        Ok(())
    }

    fn tick(&mut self, now_millis: u64, last_committed_txn_id: Option<TxnId>) -> PtxResult<()> {
        let mut state = self.lock()?;
        state.log.ticks.push((now_millis, last_committed_txn_id));
        Ok(())
    }
}
