use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::store::{ConfigRecord, PersistedStatus};
use crate::core::worker::{
    LifecycleState, RunOutcome, RuntimeContext, RuntimeStatus, StateCell, TransitionEvent,
    WorkerRuntime,
};
use crate::error::{FleetError, FleetResult};

struct WorkerHandle {
    cancel: CancellationToken,
    join: JoinHandle<RunOutcome>,
    snapshot: ConfigRecord,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ReconcileReport {
    pub started: Vec<i64>,
    pub already_running: Vec<i64>,
    pub failed: Vec<(i64, String)>,
}

/// In-process registry of running workers.
///
/// At most one instance per worker id is registered. `add`, `remove` and
/// `restart` for the same id are serialized by a per-id lock, and `remove`
/// returns only after the instance's task has finished and its session is
/// closed. An instance that gave up in `Error` stays registered until it is
/// removed or restarted. A retired worker keeps its `Deleted` state machine
/// so late callers cannot start it again.
pub struct Orchestrator {
    ctx: Arc<RuntimeContext>,
    registry: Mutex<HashMap<i64, WorkerHandle>>,
    machines: Mutex<HashMap<i64, Arc<StateCell>>>,
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
    transitions: broadcast::Sender<TransitionEvent>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        let (transitions, _) = broadcast::channel(1024);
        Self {
            ctx,
            registry: Mutex::new(HashMap::new()),
            machines: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            transitions,
        }
    }

    async fn lock_for(&self, worker_id: i64) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(worker_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn cell_for(&self, worker_id: i64) -> Arc<StateCell> {
        self.machines
            .lock()
            .await
            .entry(worker_id)
            .or_insert_with(|| {
                Arc::new(
                    StateCell::new(worker_id, LifecycleState::Created)
                        .with_events(self.transitions.clone()),
                )
            })
            .clone()
    }

    /// Starts the worker. Fails with `AlreadyRunning` if an instance is
    /// registered; a worker that fails to start is not registered.
    pub async fn add(&self, worker_id: i64) -> FleetResult<RuntimeStatus> {
        let lock = self.lock_for(worker_id).await;
        let _guard = lock.lock().await;
        self.add_locked(worker_id).await
    }

    async fn add_locked(&self, worker_id: i64) -> FleetResult<RuntimeStatus> {
        if self.registry.lock().await.contains_key(&worker_id) {
            return Err(FleetError::AlreadyRunning(worker_id));
        }
        if self.is_retired(worker_id).await {
            return Err(FleetError::WorkerNotFound(worker_id));
        }

        let cell = self.cell_for(worker_id).await;
        let runtime = WorkerRuntime::start(worker_id, cell.clone(), self.ctx.clone()).await?;
        let snapshot = runtime.snapshot().clone();
        let cancel = CancellationToken::new();
        let join = tokio::spawn(runtime.run(cancel.clone()));

        self.registry.lock().await.insert(
            worker_id,
            WorkerHandle {
                cancel,
                join,
                snapshot,
            },
        );
        Ok(cell.current())
    }

    /// Stops the worker and waits for its task to finish. Removing a worker
    /// that is not registered is a no-op.
    pub async fn remove(&self, worker_id: i64) -> FleetResult<()> {
        let lock = self.lock_for(worker_id).await;
        let _guard = lock.lock().await;
        if self.stop_locked(worker_id).await? {
            self.persist_stopped(worker_id).await;
        }
        Ok(())
    }

    /// Returns whether an instance was stopped.
    async fn stop_locked(&self, worker_id: i64) -> FleetResult<bool> {
        let Some(handle) = self.registry.lock().await.remove(&worker_id) else {
            debug!(worker_id, "remove: not registered");
            return Ok(false);
        };

        let cell = self.cell_for(worker_id).await;
        cell.transition(LifecycleState::Stopping)?;
        handle.cancel.cancel();
        match handle.join.await {
            Ok(outcome) => debug!(worker_id, ?outcome, "worker task joined"),
            Err(e) => warn!(worker_id, "worker task ended abnormally: {}", e),
        }
        cell.transition(LifecycleState::Stopped)?;
        info!(worker_id, "worker stopped");
        Ok(true)
    }

    async fn persist_stopped(&self, worker_id: i64) {
        if let Err(e) = self
            .ctx
            .store
            .set_worker_state(worker_id, PersistedStatus::Stopped, false)
            .await
        {
            warn!(worker_id, "failed to persist stopped state: {}", e);
        }
    }

    /// Stops any running instance, then starts a new one from a fresh read
    /// of the configuration. Also the way out of `Error`.
    pub async fn restart(&self, worker_id: i64) -> FleetResult<RuntimeStatus> {
        let lock = self.lock_for(worker_id).await;
        let _guard = lock.lock().await;
        self.stop_locked(worker_id).await?;
        self.add_locked(worker_id).await
    }

    async fn is_retired(&self, worker_id: i64) -> bool {
        self.machines
            .lock()
            .await
            .get(&worker_id)
            .is_some_and(|cell| cell.current().state == LifecycleState::Deleted)
    }

    /// Moves the worker's state machine to `Deleted` once its persisted row
    /// is gone. An instance started in the meantime is stopped first, and a
    /// machine left in `Error` by a failed start is wound down to `Stopped`.
    pub async fn retire(&self, worker_id: i64) -> FleetResult<()> {
        let lock = self.lock_for(worker_id).await;
        let _guard = lock.lock().await;
        self.stop_locked(worker_id).await?;

        let cell = self.cell_for(worker_id).await;
        if matches!(
            cell.current().state,
            LifecycleState::Error | LifecycleState::Starting
        ) {
            cell.transition(LifecycleState::Stopping)?;
            cell.transition(LifecycleState::Stopped)?;
        }
        cell.transition(LifecycleState::Deleted)?;
        // Waiters still holding the old lock see the tombstone in `add_locked`.
        self.locks.lock().await.remove(&worker_id);
        info!(worker_id, "worker retired");
        Ok(())
    }

    /// Unregistered workers report `Stopped`.
    pub async fn status(&self, worker_id: i64) -> RuntimeStatus {
        match self.machines.lock().await.get(&worker_id) {
            Some(cell) => cell.current(),
            None => RuntimeStatus {
                worker_id,
                state: LifecycleState::Stopped,
                error_count: 0,
            },
        }
    }

    /// Watches the worker's status. State machines are only created for
    /// workers the store knows about.
    pub async fn subscribe(&self, worker_id: i64) -> FleetResult<watch::Receiver<RuntimeStatus>> {
        if let Some(cell) = self.machines.lock().await.get(&worker_id) {
            return Ok(cell.subscribe());
        }
        if self.ctx.store.find_worker(worker_id).await?.is_none() {
            return Err(FleetError::WorkerNotFound(worker_id));
        }
        Ok(self.cell_for(worker_id).await.subscribe())
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<TransitionEvent> {
        self.transitions.subscribe()
    }

    pub async fn is_registered(&self, worker_id: i64) -> bool {
        self.registry.lock().await.contains_key(&worker_id)
    }

    pub async fn registered_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.registry.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Configuration the running instance started with.
    pub async fn snapshot(&self, worker_id: i64) -> FleetResult<ConfigRecord> {
        self.registry
            .lock()
            .await
            .get(&worker_id)
            .map(|h| h.snapshot.clone())
            .ok_or(FleetError::NotRunning(worker_id))
    }

    /// Starts every worker whose persisted status is active. Individual
    /// failures are logged and reported; they never abort the pass.
    pub async fn reconcile(self: &Arc<Self>) -> FleetResult<ReconcileReport> {
        let workers = self.ctx.store.list_active_workers().await?;
        info!("Reconciling {} active workers", workers.len());

        let mut set = JoinSet::new();
        for worker in workers {
            let this = self.clone();
            set.spawn(async move { (worker.id, this.add(worker.id).await) });
        }

        let mut report = ReconcileReport::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, Ok(_))) => report.started.push(id),
                Ok((id, Err(FleetError::AlreadyRunning(_)))) => report.already_running.push(id),
                Ok((id, Err(e))) => {
                    warn!(worker_id = id, "reconcile: worker left stopped: {}", e);
                    report.failed.push((id, e.to_string()));
                }
                Err(e) => warn!("reconcile task ended abnormally: {}", e),
            }
        }
        report.started.sort_unstable();
        report.already_running.sort_unstable();
        report.failed.sort_by_key(|(id, _)| *id);
        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            "Reconciliation finished"
        );
        Ok(report)
    }

    /// Stops every instance for process exit. Persisted status is left as
    /// is so the next boot reconciles the same set.
    pub async fn shutdown(self: &Arc<Self>) {
        let ids = self.registered_ids().await;
        info!("Stopping {} workers", ids.len());
        let mut set = JoinSet::new();
        for id in ids {
            let this = self.clone();
            set.spawn(async move {
                let lock = this.lock_for(id).await;
                let _guard = lock.lock().await;
                if let Err(e) = this.stop_locked(id).await {
                    warn!(worker_id = id, "shutdown: {}", e);
                }
                if let Err(e) = this.ctx.store.set_running(id, false).await {
                    warn!(worker_id = id, "shutdown: {}", e);
                }
            });
        }
        while set.join_next().await.is_some() {}
    }
}
