//! Named procedure factories and per-partition instance pools.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ptx_common::error::{PtxError, PtxResult};
use ptx_core::containers::HotMap;
use ptx_core::procedure::{BoundProcedure, ProcedureFactory, StoredProcedure};

/// Site-wide table of procedure factories, frozen before executors start.
#[derive(Clone, Default)]
pub struct ProcedureCatalog {
    factories: HotMap<String, ProcedureFactory>,
}

impl std::fmt::Debug for ProcedureCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort_unstable();
        f.debug_struct("ProcedureCatalog")
            .field("procedures", &names)
            .finish()
    }
}

impl ProcedureCatalog {
    /// Builds an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces the factory for `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn StoredProcedure> + Send + Sync + 'static,
    {
        let _ = self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Returns whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Freezes the catalog for sharing across executors.
    #[must_use]
    pub fn freeze(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn factory(&self, name: &str) -> Option<&ProcedureFactory> {
        self.factories.get(name)
    }
}

/// Idle procedure instances of one partition, keyed by procedure name.
pub struct ProcedurePool {
    catalog: Arc<ProcedureCatalog>,
    idle: Mutex<HotMap<String, Vec<Box<dyn StoredProcedure>>>>,
    created: AtomicUsize,
}

impl std::fmt::Debug for ProcedurePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcedurePool")
            .field("catalog", &self.catalog)
            .field("created", &self.created.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl ProcedurePool {
    /// Creates an empty pool over `catalog`.
    #[must_use]
    pub fn new(catalog: Arc<ProcedureCatalog>) -> Self {
        Self {
            catalog,
            idle: Mutex::new(HotMap::new()),
            created: AtomicUsize::new(0),
        }
    }

    /// Takes an idle instance of `name`, creating one when none is idle.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::UnknownProcedure` for unregistered names.
    pub fn borrow(&self, name: &str) -> PtxResult<BoundProcedure> {
        let Some(factory) = self.catalog.factory(name) else {
            return Err(PtxError::UnknownProcedure(name.to_owned()));
        };
        let reused = self
            .idle
            .lock()
            .map_err(|_| PtxError::InvalidState("procedure pool mutex is poisoned"))?
            .get_mut(name)
            .and_then(Vec::pop);
        let instance = reused.unwrap_or_else(|| {
            self.created.fetch_add(1, Ordering::AcqRel);
            factory()
        });
        Ok(BoundProcedure {
            name: name.to_owned(),
            instance,
        })
    }

    /// Returns an instance to its pool.
    pub fn give_back(&self, procedure: BoundProcedure) {
        if let Ok(mut idle) = self.idle.lock() {
            idle.entry(procedure.name)
                .or_default()
                .push(procedure.instance);
        }
    }

    /// Idle instances of `name`.
    #[must_use]
    pub fn idle_count(&self, name: &str) -> usize {
        self.idle
            .lock()
            .map_or(0, |idle| idle.get(name).map_or(0, Vec::len))
    }

    /// Instances created since startup.
    #[must_use]
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }
}
