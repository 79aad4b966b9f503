use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Settings;
use crate::core::gateway::MessagingGateway;
use crate::core::ledger::{UsageLedger, UsageReport};
use crate::core::orchestrator::Orchestrator;
use crate::core::store::{
    CommitResult, ConfigPatch, ConfigRecord, ConfigStore, NewWorker, OwnerAggregate,
    PersistedStatus, ReadMode, WorkerRecord, WorkerStats,
};
use crate::core::worker::RuntimeStatus;
use crate::error::{FleetError, FleetResult};
use crate::logging::credential_fingerprint;

static CREDENTIAL_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{6,12}:[A-Za-z0-9_-]{30,50}$").expect("credential pattern is valid")
});

pub fn is_well_formed_credential(credential: &str) -> bool {
    CREDENTIAL_SHAPE.is_match(credential)
}

#[derive(Debug, Clone, Copy)]
pub struct ControlSettings {
    pub verify_max_wait: Duration,
    pub max_workers_per_owner: usize,
    pub default_limit: i64,
}

impl ControlSettings {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            verify_max_wait: settings.verify_max_wait(),
            max_workers_per_owner: settings.quota.max_workers_per_owner,
            default_limit: settings.quota.default_limit,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateWorkerRequest {
    pub owner_id: i64,
    pub credential: String,
    #[serde(default)]
    pub admin_chat_id: Option<i64>,
    #[serde(default)]
    pub config: Option<ConfigPatch>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedWorker {
    pub worker: WorkerRecord,
    pub commit: CommitResult,
    pub runtime: RuntimeStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Ai,
    SubscriptionGate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpdateOutcome {
    pub commit: CommitResult,
    pub restarted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerView {
    pub worker: WorkerRecord,
    pub config: ConfigRecord,
    pub runtime: RuntimeStatus,
    pub stats: WorkerStats,
}

/// Administrative commands over the fleet.
///
/// Every mutation follows the same path: check ownership, write through the
/// store, verify the write with fresh reads, and only then touch the
/// orchestrator. A write that cannot be confirmed within the verify window
/// surfaces as [`FleetError::NotConfirmed`] and leaves running instances
/// alone.
pub struct ControlPlane {
    store: Arc<ConfigStore>,
    ledger: Arc<UsageLedger>,
    orchestrator: Arc<Orchestrator>,
    gateway: Arc<dyn MessagingGateway>,
    settings: ControlSettings,
}

impl ControlPlane {
    pub fn new(
        store: Arc<ConfigStore>,
        ledger: Arc<UsageLedger>,
        orchestrator: Arc<Orchestrator>,
        gateway: Arc<dyn MessagingGateway>,
        settings: ControlSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            orchestrator,
            gateway,
            settings,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Loads the worker and checks that `owner_id` owns it.
    async fn authorize(&self, owner_id: i64, worker_id: i64) -> FleetResult<WorkerRecord> {
        let worker = self.store.get_worker(worker_id).await?;
        if worker.owner_id != owner_id {
            warn!(owner_id, worker_id, "ownership check failed");
            return Err(FleetError::Forbidden {
                owner_id,
                worker_id,
            });
        }
        Ok(worker)
    }

    async fn confirm_commit(
        &self,
        commit: CommitResult,
        patch: &ConfigPatch,
    ) -> FleetResult<()> {
        let confirmed = self
            .store
            .verify(
                commit.worker_id,
                |current| {
                    current.is_some_and(|c| c.revision >= commit.revision && patch.is_reflected_in(c))
                },
                self.settings.verify_max_wait,
            )
            .await?;
        if confirmed {
            Ok(())
        } else {
            Err(FleetError::NotConfirmed {
                subject: format!("worker {}", commit.worker_id),
                waited: self.settings.verify_max_wait,
            })
        }
    }

    pub async fn create_worker(&self, request: CreateWorkerRequest) -> FleetResult<CreatedWorker> {
        let credential = request.credential.trim().to_string();
        if !is_well_formed_credential(&credential) {
            return Err(FleetError::InvalidCredential(
                "credential does not look like a bot token".to_string(),
            ));
        }

        let owned = self.store.count_workers_for_owner(request.owner_id).await?;
        if owned >= self.settings.max_workers_per_owner {
            return Err(FleetError::WorkerLimitReached {
                owner_id: request.owner_id,
                limit: self.settings.max_workers_per_owner,
            });
        }

        let identity = self.gateway.authenticate(&credential).await?;
        info!(
            owner_id = request.owner_id,
            credential = %credential_fingerprint(&credential),
            username = %identity.username,
            "credential accepted"
        );

        self.store
            .ensure_owner(
                request.owner_id,
                self.settings.default_limit,
                request.admin_chat_id,
            )
            .await?;

        let initial = request.config.unwrap_or_default();
        let (worker, commit) = self
            .store
            .create_worker(
                NewWorker {
                    owner_id: request.owner_id,
                    credential,
                    username: identity.username,
                },
                &initial,
            )
            .await?;
        self.confirm_commit(commit, &initial).await?;

        // The worker exists either way; a failed start is visible in its status.
        let runtime = match self.orchestrator.add(worker.id).await {
            Ok(status) => status,
            Err(e) => {
                warn!(worker_id = worker.id, "worker created but not started: {}", e);
                self.orchestrator.status(worker.id).await
            }
        };
        info!(worker_id = worker.id, owner_id = worker.owner_id, "worker created");

        Ok(CreatedWorker {
            worker,
            commit,
            runtime,
        })
    }

    /// Stops the running instance, then removes the persisted row. The
    /// state machine is retired only once the row is confirmed gone; if that
    /// cannot be confirmed the worker is left stopped.
    pub async fn delete_worker(&self, owner_id: i64, worker_id: i64) -> FleetResult<()> {
        self.authorize(owner_id, worker_id).await?;
        self.orchestrator.remove(worker_id).await?;

        self.store.delete_worker(worker_id).await?;
        let gone = self
            .store
            .verify(
                worker_id,
                |current| current.is_none(),
                self.settings.verify_max_wait,
            )
            .await?;
        if !gone {
            return Err(FleetError::NotConfirmed {
                subject: format!("worker {}", worker_id),
                waited: self.settings.verify_max_wait,
            });
        }

        self.orchestrator.retire(worker_id).await?;
        info!(worker_id, owner_id, "worker deleted");
        Ok(())
    }

    pub async fn toggle_capability(
        &self,
        owner_id: i64,
        worker_id: i64,
        capability: Capability,
        enabled: bool,
    ) -> FleetResult<UpdateOutcome> {
        let patch = match capability {
            Capability::Ai => ConfigPatch {
                ai_enabled: Some(enabled),
                ..Default::default()
            },
            Capability::SubscriptionGate => ConfigPatch {
                subscription_enabled: Some(enabled),
                ..Default::default()
            },
        };
        self.update_config(owner_id, worker_id, patch).await
    }

    /// Capability fields are re-read by the running worker on every use, so
    /// only edits to snapshot fields restart a registered instance.
    pub async fn update_config(
        &self,
        owner_id: i64,
        worker_id: i64,
        patch: ConfigPatch,
    ) -> FleetResult<UpdateOutcome> {
        if patch.is_empty() {
            return Err(FleetError::InvalidConfig("patch is empty".to_string()));
        }
        self.authorize(owner_id, worker_id).await?;

        let commit = self.store.write(worker_id, &patch).await?;
        self.confirm_commit(commit, &patch).await?;

        let restarted =
            if patch.touches_snapshot() && self.orchestrator.is_registered(worker_id).await {
                self.orchestrator.restart(worker_id).await?;
                true
            } else {
                false
            };
        info!(worker_id, revision = commit.revision, restarted, "config updated");
        Ok(UpdateOutcome { commit, restarted })
    }

    /// Also the way out of `Error`.
    pub async fn restart_worker(&self, owner_id: i64, worker_id: i64) -> FleetResult<RuntimeStatus> {
        self.authorize(owner_id, worker_id).await?;
        self.orchestrator.restart(worker_id).await
    }

    pub async fn stop_worker(&self, owner_id: i64, worker_id: i64) -> FleetResult<RuntimeStatus> {
        self.authorize(owner_id, worker_id).await?;
        self.orchestrator.remove(worker_id).await?;
        self.store
            .set_worker_state(worker_id, PersistedStatus::Stopped, false)
            .await?;
        Ok(self.orchestrator.status(worker_id).await)
    }

    pub async fn start_worker(&self, owner_id: i64, worker_id: i64) -> FleetResult<RuntimeStatus> {
        self.authorize(owner_id, worker_id).await?;
        self.orchestrator.add(worker_id).await
    }

    pub async fn raise_quota(&self, owner_id: i64, new_limit: i64) -> FleetResult<OwnerAggregate> {
        self.ledger.raise_limit(owner_id, new_limit).await?;
        let confirmed = self
            .store
            .verify_owner(
                owner_id,
                |aggregate| aggregate.limit == new_limit,
                self.settings.verify_max_wait,
            )
            .await?;
        if !confirmed {
            return Err(FleetError::NotConfirmed {
                subject: format!("owner {}", owner_id),
                waited: self.settings.verify_max_wait,
            });
        }
        self.store.owner_aggregate(owner_id, ReadMode::Fresh).await
    }

    pub async fn usage(&self, owner_id: i64) -> FleetResult<UsageReport> {
        self.ledger.report(owner_id).await
    }

    pub async fn worker_status(&self, owner_id: i64, worker_id: i64) -> FleetResult<WorkerView> {
        let worker = self.authorize(owner_id, worker_id).await?;
        Ok(WorkerView {
            config: self.store.read(worker_id, ReadMode::Cached).await?,
            runtime: self.orchestrator.status(worker_id).await,
            stats: self.store.worker_stats(worker_id).await?,
            worker,
        })
    }

    pub async fn list_workers(&self, owner_id: Option<i64>) -> FleetResult<Vec<WorkerRecord>> {
        self.store.list_workers(owner_id).await
    }
}
