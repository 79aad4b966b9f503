use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::handlers::{Dispatcher, HandlerContext};
use super::lifecycle::{LifecycleState, StateCell};
use super::RuntimeContext;
use crate::core::gateway::{GatewaySession, InboundEvent};
use crate::core::store::{ConfigRecord, PersistedStatus, ReadMode, WorkerRecord};
use crate::error::{FleetError, FleetResult};
use crate::logging::credential_fingerprint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Stopped by its orchestrator.
    Cancelled,
    /// Gave up after the retry ceiling; the worker is in `Error`.
    Failed,
}

/// One supervised worker: a gateway session, its dispatcher and the
/// configuration snapshot taken when it started.
pub struct WorkerRuntime {
    worker: WorkerRecord,
    snapshot: ConfigRecord,
    session: Box<dyn GatewaySession>,
    dispatcher: Dispatcher,
    cell: Arc<StateCell>,
    ctx: Arc<RuntimeContext>,
}

impl WorkerRuntime {
    /// Runs the `Starting` phase. On success the worker is `Running` and
    /// ready for [`WorkerRuntime::run`]; on failure it is left in `Error`.
    pub async fn start(
        worker_id: i64,
        cell: Arc<StateCell>,
        ctx: Arc<RuntimeContext>,
    ) -> FleetResult<Self> {
        cell.transition(LifecycleState::Starting)?;
        cell.set_error_count(0);

        match Self::connect(worker_id, &cell, &ctx).await {
            Ok(runtime) => {
                cell.transition(LifecycleState::Running)?;
                runtime.persist(PersistedStatus::Active, true).await;
                if let Err(e) = ctx.store.set_error_count(worker_id, 0).await {
                    warn!(worker_id, "failed to reset error count: {}", e);
                }
                info!(
                    worker_id,
                    username = %runtime.worker.username,
                    revision = runtime.snapshot.revision,
                    "worker running"
                );
                Ok(runtime)
            }
            Err(e) => {
                error!(worker_id, "worker failed to start: {}", e);
                if let Err(t) = cell.transition(LifecycleState::Error) {
                    warn!(worker_id, "{}", t);
                }
                let persisted = match &e {
                    FleetError::InvalidCredential(_) => {
                        ctx.store
                            .set_worker_state(worker_id, PersistedStatus::Error, false)
                            .await
                    }
                    _ => ctx.store.set_running(worker_id, false).await,
                };
                if let Err(p) = persisted {
                    warn!(worker_id, "failed to persist start failure: {}", p);
                }
                Err(e)
            }
        }
    }

    async fn connect(
        worker_id: i64,
        cell: &Arc<StateCell>,
        ctx: &Arc<RuntimeContext>,
    ) -> FleetResult<Self> {
        let worker = ctx.store.get_worker(worker_id).await?;
        let identity = ctx.gateway.authenticate(&worker.credential).await?;
        if !identity.username.eq_ignore_ascii_case(&worker.username) {
            return Err(FleetError::InvalidCredential(format!(
                "credential {} now belongs to @{} instead of @{}",
                credential_fingerprint(&worker.credential),
                identity.username,
                worker.username
            )));
        }

        // Never reuse a snapshot across starts.
        let snapshot = ctx.store.read(worker_id, ReadMode::Fresh).await?;
        let session = ctx.gateway.open_session(&worker.credential).await?;

        Ok(Self {
            worker,
            snapshot,
            session,
            dispatcher: Dispatcher::standard(),
            cell: cell.clone(),
            ctx: ctx.clone(),
        })
    }

    pub fn worker(&self) -> &WorkerRecord {
        &self.worker
    }

    pub fn snapshot(&self) -> &ConfigRecord {
        &self.snapshot
    }

    /// Long-poll loop. Transient failures back off and retry until the
    /// policy's ceiling, then the worker moves to `Error` and the loop ends.
    /// A rejected credential ends the loop in `Error` without retrying.
    /// The session is closed before returning in every case.
    pub async fn run(mut self, cancel: CancellationToken) -> RunOutcome {
        let worker_id = self.worker.id;
        let policy = self.ctx.policy;
        let mut error_count: u32 = 0;

        let outcome = loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break RunOutcome::Cancelled,
                polled = self.session.poll() => polled,
            };

            match polled {
                Ok(events) => {
                    if error_count > 0 {
                        info!(worker_id, "gateway recovered after {} failures", error_count);
                        error_count = 0;
                        self.record_error_count(0).await;
                    }
                    if self.dispatch_all(events, &cancel).await {
                        break RunOutcome::Cancelled;
                    }
                }
                Err(err) => {
                    let err = FleetError::from(err);
                    error_count += 1;
                    self.record_error_count(error_count).await;
                    if !err.is_transient() || policy.exhausted(error_count) {
                        error!(worker_id, error_count, "giving up: {}", err);
                        if let Err(t) = self.cell.transition(LifecycleState::Error) {
                            warn!(worker_id, "{}", t);
                        }
                        self.persist(PersistedStatus::Error, false).await;
                        break RunOutcome::Failed;
                    }
                    let delay = policy.delay_for(error_count);
                    warn!(
                        worker_id,
                        error_count,
                        ?delay,
                        "gateway unavailable, retrying: {}",
                        err
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break RunOutcome::Cancelled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        self.session.close().await;
        info!(worker_id, ?outcome, "worker loop ended");
        outcome
    }

    /// Each handler runs to completion, so a reply that reached the LLM is
    /// always charged. Cancellation is checked between events; returns true
    /// when the rest of the batch was dropped.
    async fn dispatch_all(&self, events: Vec<InboundEvent>, cancel: &CancellationToken) -> bool {
        if events.is_empty() {
            return false;
        }
        if let Err(e) = self.ctx.store.touch_activity(self.worker.id).await {
            warn!(worker_id = self.worker.id, "failed to record activity: {}", e);
        }

        let cx = HandlerContext {
            worker: &self.worker,
            snapshot: &self.snapshot,
            session: self.session.as_ref(),
            runtime: &self.ctx,
        };
        for event in events {
            if cancel.is_cancelled() {
                return true;
            }
            self.dispatcher.dispatch(&cx, &event).await;
        }
        false
    }

    async fn record_error_count(&self, error_count: u32) {
        self.cell.set_error_count(error_count);
        if let Err(e) = self.ctx.store.set_error_count(self.worker.id, error_count).await {
            warn!(worker_id = self.worker.id, "failed to persist error count: {}", e);
        }
    }

    async fn persist(&self, status: PersistedStatus, is_running: bool) {
        if let Err(e) = self
            .ctx
            .store
            .set_worker_state(self.worker.id, status, is_running)
            .await
        {
            warn!(worker_id = self.worker.id, "failed to persist worker state: {}", e);
        }
    }
}
