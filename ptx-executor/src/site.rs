//! In-process site: every partition executor of one node wired to a local messenger, a shared
//! lock queue manager, and a blocking `invoke` entry point that plays the coordinator.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak, mpsc};

use ptx_common::config::SiteConfig;
use ptx_common::error::{PtxError, PtxResult};
use ptx_common::ids::{PartitionId, TxnId};
use ptx_core::engine::ExecutionEngine;
use ptx_core::fragment::{
    ClientResponse, ClientStatus, CoordinatorReply, CoordinatorStatus, DependencySet,
    FragmentResponse, FragmentTask, InitiateTask, WorkItem,
};
use ptx_core::messenger::{Continuation, Messenger, WorkResponseCallback};
use ptx_core::procedure::StoredProcedure;
use ptx_core::registry::{SysProcRegistry, SystemProcedure};
use ptx_core::table::{ParameterSet, ResultTable};
use ptx_transaction::queue::{CheckerHandle, TransactionQueueManager};
use tracing::{debug, error, info, warn};

use crate::executor::{ExecutorParts, PartitionExecutor};
use crate::procedure::ProcedureCatalog;
use crate::sysprocs::{EXECUTOR_STATUS, ExecutorStatus, ExecutorStatusProcedure};

struct Collector {
    remaining: usize,
    responses: Vec<FragmentResponse>,
    callback: Option<WorkResponseCallback>,
}

fn deliver(collector: &Mutex<Collector>, response: FragmentResponse) {
    let ready = {
        let Ok(mut collector) = collector.lock() else {
            error!("work collector mutex is poisoned");
            return;
        };
        collector.responses.push(response);
        collector.remaining = collector.remaining.saturating_sub(1);
        if collector.remaining == 0 {
            let responses = std::mem::take(&mut collector.responses);
            collector.callback.take().map(|callback| (callback, responses))
        } else {
            None
        }
    };
    if let Some((callback, responses)) = ready {
        callback(responses);
    }
}

/// Messenger that hands work straight to executors of the same process.
#[derive(Default)]
pub struct LocalMessenger {
    executors: OnceLock<Vec<Weak<PartitionExecutor>>>,
    halted: AtomicBool,
    cause: Mutex<Option<PtxError>>,
}

impl std::fmt::Debug for LocalMessenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMessenger")
            .field("partitions", &self.executors.get().map_or(0, Vec::len))
            .field("halted", &self.halted.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl LocalMessenger {
    fn attach(&self, executors: &[Arc<PartitionExecutor>]) -> PtxResult<()> {
        self.executors
            .set(executors.iter().map(Arc::downgrade).collect())
            .map_err(|_| PtxError::InvalidState("local messenger is already attached"))
    }

    fn executor(&self, partition: PartitionId) -> PtxResult<Arc<PartitionExecutor>> {
        self.executors
            .get()
            .and_then(|executors| executors.get(usize::from(partition)))
            .and_then(Weak::upgrade)
            .ok_or(PtxError::Shutdown)
    }

    /// Returns whether a fatal error stopped the site.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Error that stopped the site, if any.
    #[must_use]
    pub fn halt_cause(&self) -> Option<PtxError> {
        self.cause.lock().ok().and_then(|cause| cause.clone())
    }
}

impl Messenger for LocalMessenger {
    fn request_work(
        &self,
        txn_id: TxnId,
        fragments: Vec<FragmentTask>,
        callback: WorkResponseCallback,
    ) -> PtxResult<()> {
        let collector = Arc::new(Mutex::new(Collector {
            remaining: fragments.len(),
            responses: Vec::with_capacity(fragments.len()),
            callback: Some(callback),
        }));
        for task in fragments {
            let destination = task.destination_partition;
            let mut undeliverable = FragmentResponse::failure(&task, destination, PtxError::Shutdown);
            let sink = Arc::clone(&collector);
            let continuation = Continuation::Fragment(Box::new(
                move |reply: CoordinatorReply<FragmentResponse>| deliver(&sink, reply.payload),
            ));
            let routed = self.executor(destination).and_then(|executor| {
                executor.do_work(WorkItem::Fragment(task), Some(continuation), false)
            });
            if let Err(error) = routed {
                warn!(txn_id, destination, %error, "fragment task could not be routed");
                undeliverable.error = Some(error);
                deliver(&collector, undeliverable);
            }
        }
        Ok(())
    }

    fn send_dependency_set(
        &self,
        txn_id: TxnId,
        sender: PartitionId,
        receiver: PartitionId,
        dependencies: DependencySet,
    ) -> PtxResult<()> {
        let executor = self.executor(receiver)?;
        for (dep_id, table) in dependencies.into_pairs() {
            executor.store_dependency(txn_id, sender, dep_id, table)?;
        }
        Ok(())
    }

    fn shutdown_cluster(&self, cause: &PtxError) {
        if self.halted.swap(true, Ordering::AcqRel) {
            return;
        }
        error!(%cause, "fatal executor error; shutting down every partition");
        if let Ok(mut slot) = self.cause.lock() {
            *slot = Some(cause.clone());
        }
        for executor in self.executors.get().into_iter().flatten() {
            if let Some(executor) = executor.upgrade() {
                executor.shutdown();
            }
        }
    }
}

/// Collects procedures and system procedures, then starts a [`LocalSite`].
pub struct SiteBuilder {
    config: SiteConfig,
    catalog: ProcedureCatalog,
    sysprocs: SysProcRegistry,
}

impl std::fmt::Debug for SiteBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteBuilder")
            .field("config", &self.config)
            .field("catalog", &self.catalog)
            .field("sysprocs", &self.sysprocs)
            .finish()
    }
}

impl SiteBuilder {
    /// Registers a stored procedure factory.
    #[must_use]
    pub fn procedure<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn StoredProcedure> + Send + Sync + 'static,
    {
        self.catalog.register(name, factory);
        self
    }

    /// Registers a system procedure's fragment handlers.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidState` when a fragment id is taken by another handler.
    pub fn system_procedure(mut self, procedure: Arc<dyn SystemProcedure>) -> PtxResult<Self> {
        self.sysprocs.register(procedure)?;
        Ok(self)
    }

    /// Starts one executor per partition, asking `engine_for` for each partition's engine.
    ///
    /// # Errors
    ///
    /// Returns configuration or startup errors from the executors.
    pub fn start<F>(mut self, mut engine_for: F) -> PtxResult<LocalSite>
    where
        F: FnMut(PartitionId) -> Box<dyn ExecutionEngine>,
    {
        self.config.validate()?;
        self.sysprocs.register(Arc::new(ExecutorStatus))?;
        if !self.catalog.contains(EXECUTOR_STATUS) {
            self.catalog
                .register(EXECUTOR_STATUS, || Box::new(ExecutorStatusProcedure));
        }

        let messenger = Arc::new(LocalMessenger::default());
        let sysprocs = self.sysprocs.freeze();
        let catalog = self.catalog.freeze();
        let error_counter = Arc::new(AtomicU64::new(0));
        let mut executors = Vec::with_capacity(usize::from(self.config.partition_count.get()));
        for partition in self.config.partition_count.iter() {
            let transport: Arc<dyn Messenger> = Arc::<LocalMessenger>::clone(&messenger);
            let parts = ExecutorParts {
                engine: engine_for(partition),
                messenger: transport,
                sysprocs: Arc::clone(&sysprocs),
                procedures: Arc::clone(&catalog),
                error_counter: Arc::clone(&error_counter),
            };
            executors.push(Arc::new(PartitionExecutor::start(partition, &self.config, parts)?));
        }
        messenger.attach(&executors)?;

        let queue = Arc::new(TransactionQueueManager::from_config(&self.config));
        let checker = queue.spawn_checker(self.config.lock_check_interval);
        info!(partitions = executors.len(), "local site started");
        Ok(LocalSite {
            config: self.config,
            executors,
            messenger,
            queue,
            checker: Mutex::new(checker),
            closed: AtomicBool::new(false),
            next_txn_id: AtomicU64::new(1),
            next_client_handle: AtomicI64::new(1),
            error_counter,
        })
    }
}

/// Every partition of one process plus the coordinator logic that drives transactions.
pub struct LocalSite {
    config: SiteConfig,
    executors: Vec<Arc<PartitionExecutor>>,
    messenger: Arc<LocalMessenger>,
    queue: Arc<TransactionQueueManager>,
    checker: Mutex<CheckerHandle>,
    closed: AtomicBool,
    next_txn_id: AtomicU64,
    next_client_handle: AtomicI64,
    error_counter: Arc<AtomicU64>,
}

impl std::fmt::Debug for LocalSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSite")
            .field("partitions", &self.executors.len())
            .field("next_txn_id", &self.next_txn_id.load(Ordering::Acquire))
            .field("messenger", &self.messenger)
            .finish_non_exhaustive()
    }
}

impl LocalSite {
    /// Starts building a site from `config`.
    #[must_use]
    pub fn builder(config: SiteConfig) -> SiteBuilder {
        SiteBuilder {
            config,
            catalog: ProcedureCatalog::new(),
            sysprocs: SysProcRegistry::new(),
        }
    }

    /// Executor of `partition`.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::InvalidConfig` for partitions outside the site.
    pub fn executor(&self, partition: PartitionId) -> PtxResult<&Arc<PartitionExecutor>> {
        self.executors
            .get(usize::from(partition))
            .ok_or(PtxError::InvalidConfig("partition id is outside the site"))
    }

    /// Lock queues shared by every partition.
    #[must_use]
    pub fn queue(&self) -> &TransactionQueueManager {
        &self.queue
    }

    /// Transaction errors counted since the last periodic report.
    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.error_counter.load(Ordering::Acquire)
    }

    /// Error that forced the site down, if any.
    #[must_use]
    pub fn halt_cause(&self) -> Option<PtxError> {
        self.messenger.halt_cause()
    }

    /// Runs `procedure` at `base_partition`, locking `partitions` first.
    ///
    /// A call whose partition set is just the base partition is predicted single-partition. If
    /// the procedure strays outside that prediction it is restarted under a new transaction id
    /// holding every partition of the site.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::Shutdown` when the site stops before the transaction finishes, or
    /// routing errors. Procedure failures come back as a non-success [`ClientResponse`].
    pub fn invoke(
        &self,
        procedure: &str,
        base_partition: PartitionId,
        params: ParameterSet,
        partitions: &[PartitionId],
    ) -> PtxResult<ClientResponse> {
        let executor = self.executor(base_partition)?;
        let mut touched = partitions.to_vec();
        touched.push(base_partition);
        touched.sort_unstable();
        touched.dedup();
        let client_handle = self.next_client_handle.fetch_add(1, Ordering::AcqRel);

        loop {
            let txn_id = self.next_txn_id.fetch_add(1, Ordering::AcqRel);
            let single = touched.len() == 1;
            self.acquire_locks(txn_id, &touched, !single)?;

            let (sender, receiver) = mpsc::channel();
            let task = InitiateTask {
                txn_id,
                client_handle,
                base_partition,
                procedure: procedure.to_owned(),
                params: params.clone(),
                predict_single_partition: single,
            };
            let continuation = Continuation::Client(Box::new(
                move |reply: CoordinatorReply<ClientResponse>| {
                    let _ = sender.send(reply);
                },
            ));
            let reply = executor
                .do_work(WorkItem::Initiate(task), Some(continuation), single)
                .and_then(|()| self.wait_for(&receiver));

            let status = reply
                .as_ref()
                .map_or(CoordinatorStatus::AbortUser, |reply| reply.status);
            self.finish(txn_id, &touched, status);
            let reply = reply?;

            if reply.status == CoordinatorStatus::AbortMispredict {
                debug!(txn_id, procedure, "restarting mispredicted txn on every partition");
                touched = self.config.partition_count.iter().collect();
                continue;
            }
            return Ok(reply.payload);
        }
    }

    /// Convenience wrapper that runs `procedure` and returns its tables on success.
    ///
    /// # Errors
    ///
    /// Returns `PtxError::UserAbort` or `PtxError::Unexpected` carrying the status message when
    /// the transaction did not commit.
    pub fn call(
        &self,
        procedure: &str,
        base_partition: PartitionId,
        params: ParameterSet,
        partitions: &[PartitionId],
    ) -> PtxResult<Vec<ResultTable>> {
        let response = self.invoke(procedure, base_partition, params, partitions)?;
        match response.status {
            ClientStatus::Success => Ok(response.results),
            ClientStatus::UserAbort => {
                Err(PtxError::UserAbort(response.status_message))
            }
            _ => Err(PtxError::Unexpected(response.status_message)),
        }
    }

    fn acquire_locks(&self, txn_id: TxnId, partitions: &[PartitionId], is_dtxn: bool) -> PtxResult<()> {
        let (sender, receiver) = mpsc::channel();
        let accepted = self.queue.lock_queue_insert(
            txn_id,
            partitions,
            Box::new(move |status| {
                let _ = sender.send(status);
            }),
            is_dtxn,
        )?;
        if !accepted {
            return Err(PtxError::Unexpected(format!(
                "lock request for txn #{txn_id} was not accepted"
            )));
        }
        match self.wait_for(&receiver) {
            Ok(CoordinatorStatus::Ok) => Ok(()),
            Ok(status) => Err(PtxError::Unexpected(format!(
                "lock request for txn #{txn_id} ended with {status:?}"
            ))),
            Err(error) => {
                for &partition in partitions {
                    let _ = self
                        .queue
                        .lock_queue_finished(txn_id, CoordinatorStatus::Rejected, partition);
                }
                Err(error)
            }
        }
    }

    fn wait_for<T>(&self, receiver: &mpsc::Receiver<T>) -> PtxResult<T> {
        loop {
            match receiver.recv_timeout(self.config.work_poll_timeout) {
                Ok(value) => return Ok(value),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if self.messenger.is_halted() || self.closed.load(Ordering::Acquire) {
                        return Err(PtxError::Shutdown);
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(PtxError::Shutdown),
            }
        }
    }

    fn finish(&self, txn_id: TxnId, locked: &[PartitionId], status: CoordinatorStatus) {
        for executor in &self.executors {
            let finished = if status == CoordinatorStatus::Ok {
                executor.commit(txn_id)
            } else {
                executor.abort(txn_id)
            };
            if let Err(error) = finished {
                warn!(txn_id, partition = executor.partition_id(), %error, "finishing txn failed");
            }
        }
        for &partition in locked {
            if let Err(error) = self.queue.lock_queue_finished(txn_id, status, partition) {
                warn!(txn_id, partition, %error, "lock release failed");
            }
        }
    }

    /// Stops the lock checker and every executor.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut checker) = self.checker.lock() {
            checker.stop();
        }
        for executor in &self.executors {
            executor.shutdown();
        }
        info!("local site stopped");
    }
}

impl Drop for LocalSite {
    fn drop(&mut self) {
        self.shutdown();
    }
}
