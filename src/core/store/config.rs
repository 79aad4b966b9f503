use rusqlite::params;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{ConfigStore, load_aggregate, load_config};
use crate::core::store::types::{CommitResult, ConfigPatch, ConfigRecord, OwnerAggregate, ReadMode};
use crate::error::{FleetError, FleetResult};

const VERIFY_FIRST_STEP: Duration = Duration::from_millis(25);
const VERIFY_MAX_STEP: Duration = Duration::from_millis(250);

/// Doubling sleep schedule bounded by an overall deadline.
struct VerifyBackoff {
    deadline: Instant,
    step: Duration,
}

impl VerifyBackoff {
    fn new(max_wait: Duration) -> Self {
        Self {
            deadline: Instant::now() + max_wait,
            step: VERIFY_FIRST_STEP,
        }
    }

    /// Sleeps before the next attempt. Returns false once the deadline passed.
    async fn wait(&mut self) -> bool {
        let now = Instant::now();
        if now >= self.deadline {
            return false;
        }
        tokio::time::sleep(self.step.min(self.deadline - now)).await;
        self.step = (self.step * 2).min(VERIFY_MAX_STEP);
        true
    }
}

impl ConfigStore {
    pub async fn read(&self, worker_id: i64, mode: ReadMode) -> FleetResult<ConfigRecord> {
        self.read_optional(worker_id, mode)
            .await?
            .ok_or(FleetError::WorkerNotFound(worker_id))
    }

    pub async fn read_optional(
        &self,
        worker_id: i64,
        mode: ReadMode,
    ) -> FleetResult<Option<ConfigRecord>> {
        if mode == ReadMode::Cached
            && let Some(hit) = self.configs.get(worker_id).await
        {
            return Ok(Some(hit));
        }

        let record = {
            let db = self.db.lock().await;
            load_config(&db, worker_id)?
        };
        match &record {
            Some(r) => {
                self.configs
                    .put_versioned(worker_id, r.clone(), |c| c.revision)
                    .await
            }
            None => self.configs.evict(worker_id).await,
        }
        Ok(record)
    }

    /// Applies `patch` atomically. The merged record is validated before
    /// commit; an invalid result leaves the stored row untouched.
    pub async fn write(&self, worker_id: i64, patch: &ConfigPatch) -> FleetResult<CommitResult> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        let mut record = load_config(&tx, worker_id)?.ok_or(FleetError::WorkerNotFound(worker_id))?;
        patch.apply(&mut record);
        record.validate()?;

        let revision = record.revision + 1;
        tx.execute(
            "UPDATE worker_configs SET welcome_text = ?2, goodbye_text = ?3, ai_enabled = ?4,
                agent_type = ?5, agent_json = ?6, subscription_json = ?7, revision = ?8
             WHERE worker_id = ?1",
            params![
                worker_id,
                record.welcome_text,
                record.goodbye_text,
                record.ai_enabled,
                record.agent.agent_type(),
                serde_json::to_string(&record.agent)?,
                serde_json::to_string(&record.subscription)?,
                revision,
            ],
        )?;
        tx.commit()?;

        debug!(worker_id, revision, "config write committed");
        Ok(CommitResult {
            worker_id,
            revision,
        })
    }

    /// Polls fresh reads until `predicate` holds or `max_wait` elapses.
    /// The predicate sees `None` once the worker's row is gone.
    pub async fn verify<P>(&self, worker_id: i64, predicate: P, max_wait: Duration) -> FleetResult<bool>
    where
        P: Fn(Option<&ConfigRecord>) -> bool,
    {
        let mut backoff = VerifyBackoff::new(max_wait);
        loop {
            let current = self.read_optional(worker_id, ReadMode::Fresh).await?;
            if predicate(current.as_ref()) {
                return Ok(true);
            }
            if !backoff.wait().await {
                debug!(worker_id, ?max_wait, "verify timed out");
                return Ok(false);
            }
        }
    }

    pub async fn owner_aggregate(
        &self,
        owner_id: i64,
        mode: ReadMode,
    ) -> FleetResult<OwnerAggregate> {
        if mode == ReadMode::Cached
            && let Some(hit) = self.aggregates.get(owner_id).await
        {
            return Ok(hit);
        }
        let aggregate = {
            let db = self.db.lock().await;
            load_aggregate(&db, owner_id)?
        };
        let aggregate = aggregate.ok_or(FleetError::OwnerNotFound(owner_id))?;
        self.aggregates.put(owner_id, aggregate.clone()).await;
        Ok(aggregate)
    }

    pub async fn verify_owner<P>(
        &self,
        owner_id: i64,
        predicate: P,
        max_wait: Duration,
    ) -> FleetResult<bool>
    where
        P: Fn(&OwnerAggregate) -> bool,
    {
        let mut backoff = VerifyBackoff::new(max_wait);
        loop {
            let current = self.owner_aggregate(owner_id, ReadMode::Fresh).await?;
            if predicate(&current) {
                return Ok(true);
            }
            if !backoff.wait().await {
                return Ok(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_store;
    use crate::core::store::types::{AgentDescriptor, NewWorker, OpenAiSettings};

    async fn seeded() -> (ConfigStore, i64) {
        let store = test_store();
        store.ensure_owner(10, 1000, None).await.unwrap();
        let (worker, _) = store
            .create_worker(
                NewWorker {
                    owner_id: 10,
                    credential: "111:abc".into(),
                    username: "shop_bot".into(),
                },
                &ConfigPatch::default(),
            )
            .await
            .unwrap();
        (store, worker.id)
    }

    #[tokio::test]
    async fn fresh_read_sees_write_while_cached_read_may_lag() {
        let (store, id) = seeded().await;
        let before = store.read(id, ReadMode::Cached).await.unwrap();
        assert_eq!(before.welcome_text, "");

        let patch = ConfigPatch {
            welcome_text: Some("Hello!".into()),
            ..Default::default()
        };
        let commit = store.write(id, &patch).await.unwrap();
        assert_eq!(commit.revision, before.revision + 1);

        let cached = store.read(id, ReadMode::Cached).await.unwrap();
        assert_eq!(cached.welcome_text, "", "cache entry is still within ttl");

        let fresh = store.read(id, ReadMode::Fresh).await.unwrap();
        assert_eq!(fresh.welcome_text, "Hello!");

        let cached_after_fresh = store.read(id, ReadMode::Cached).await.unwrap();
        assert_eq!(cached_after_fresh.welcome_text, "Hello!");
    }

    #[tokio::test]
    async fn late_fresh_read_does_not_roll_cache_back() {
        let (store, id) = seeded().await;
        let stale = store.read(id, ReadMode::Fresh).await.unwrap();

        let patch = ConfigPatch {
            goodbye_text: Some("Bye".into()),
            ..Default::default()
        };
        store.write(id, &patch).await.unwrap();
        let newer = store.read(id, ReadMode::Fresh).await.unwrap();

        // A fresh read that loaded before the write but lands in the cache after.
        store
            .configs
            .put_versioned(id, stale.clone(), |c| c.revision)
            .await;

        let cached = store.read(id, ReadMode::Cached).await.unwrap();
        assert_eq!(cached.revision, newer.revision);
        assert_eq!(cached.goodbye_text, "Bye");
    }

    #[tokio::test]
    async fn invalid_patch_is_rejected_without_partial_apply() {
        let (store, id) = seeded().await;
        let patch = ConfigPatch {
            welcome_text: Some("should not land".into()),
            ai_enabled: Some(true),
            ..Default::default()
        };
        let err = store.write(id, &patch).await.unwrap_err();
        assert!(matches!(err, FleetError::InvalidConfig(_)));

        let fresh = store.read(id, ReadMode::Fresh).await.unwrap();
        assert_eq!(fresh.welcome_text, "");
        assert!(!fresh.ai_enabled);
        assert_eq!(fresh.revision, 0);
    }

    #[tokio::test]
    async fn enabling_ai_with_agent_in_same_patch_is_valid() {
        let (store, id) = seeded().await;
        let patch = ConfigPatch {
            ai_enabled: Some(true),
            agent: Some(AgentDescriptor::OpenAi {
                handle: "asst_1".into(),
                settings: OpenAiSettings::default(),
            }),
            ..Default::default()
        };
        store.write(id, &patch).await.unwrap();
        let fresh = store.read(id, ReadMode::Fresh).await.unwrap();
        assert!(fresh.ai_enabled);
        assert_eq!(fresh.agent.handle(), "asst_1");
    }

    #[tokio::test]
    async fn write_to_unknown_worker_fails() {
        let store = test_store();
        let err = store.write(404, &ConfigPatch::default()).await.unwrap_err();
        assert!(matches!(err, FleetError::WorkerNotFound(404)));
    }

    #[tokio::test]
    async fn verify_confirms_committed_revision() {
        let (store, id) = seeded().await;
        let commit = store
            .write(
                id,
                &ConfigPatch {
                    goodbye_text: Some("bye".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let ok = store
            .verify(
                id,
                |c| c.is_some_and(|c| c.revision >= commit.revision),
                Duration::from_millis(200),
            )
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn verify_times_out_when_predicate_never_holds() {
        let (store, id) = seeded().await;
        let started = Instant::now();
        let ok = store
            .verify(id, |c| c.is_none(), Duration::from_millis(80))
            .await
            .unwrap();
        assert!(!ok);
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn owner_aggregate_unknown_owner_errors() {
        let store = test_store();
        let err = store.owner_aggregate(5, ReadMode::Fresh).await.unwrap_err();
        assert!(matches!(err, FleetError::OwnerNotFound(5)));
    }
}
