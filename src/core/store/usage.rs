use rusqlite::{OptionalExtension, params};

use super::{ConfigStore, load_aggregate};
use crate::core::store::types::{OwnerAggregate, UsageRecord};
use crate::error::{FleetError, FleetResult};

/// Sum of usage over an owner's workers whose agent is metered.
const METERED_TOTAL_SQL: &str = "SELECT COALESCE(SUM(u.total_units), 0)
     FROM worker_usage u
     JOIN workers w ON w.id = u.worker_id
     JOIN worker_configs c ON c.worker_id = u.worker_id
     WHERE w.owner_id = ?1 AND c.agent_type = 'openai'";

impl ConfigStore {
    /// Adds to the worker's counters and rewrites the owner's aggregate from
    /// the authoritative sum, both inside one transaction.
    pub async fn apply_charge(
        &self,
        worker_id: i64,
        input_units: i64,
        output_units: i64,
    ) -> FleetResult<(UsageRecord, OwnerAggregate)> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        let updated = tx.execute(
            "UPDATE worker_usage
             SET input_units = input_units + ?2,
                 output_units = output_units + ?3,
                 total_units = total_units + ?2 + ?3
             WHERE worker_id = ?1",
            params![worker_id, input_units, output_units],
        )?;
        if updated == 0 {
            return Err(FleetError::WorkerNotFound(worker_id));
        }

        let usage = tx.query_row(
            "SELECT input_units, output_units, total_units FROM worker_usage WHERE worker_id = ?1",
            params![worker_id],
            |row| {
                Ok(UsageRecord {
                    worker_id,
                    input_units: row.get(0)?,
                    output_units: row.get(1)?,
                    total_units: row.get(2)?,
                })
            },
        )?;

        let owner_id: i64 = tx.query_row(
            "SELECT owner_id FROM workers WHERE id = ?1",
            params![worker_id],
            |row| row.get(0),
        )?;
        let total: i64 = tx.query_row(METERED_TOTAL_SQL, params![owner_id], |row| row.get(0))?;
        tx.execute(
            "UPDATE owners SET tokens_used_total = ?2 WHERE id = ?1",
            params![owner_id, total],
        )?;

        let aggregate = load_aggregate(&tx, owner_id)?.ok_or(FleetError::OwnerNotFound(owner_id))?;
        tx.commit()?;
        Ok((usage, aggregate))
    }

    /// Authoritative metered sum, computed from the usage rows.
    pub async fn metered_total(&self, owner_id: i64) -> FleetResult<i64> {
        let db = self.db.lock().await;
        let total = db.query_row(METERED_TOTAL_SQL, params![owner_id], |row| row.get(0))?;
        Ok(total)
    }

    pub async fn usage_for_worker(&self, worker_id: i64) -> FleetResult<UsageRecord> {
        let db = self.db.lock().await;
        db.query_row(
            "SELECT input_units, output_units, total_units FROM worker_usage WHERE worker_id = ?1",
            params![worker_id],
            |row| {
                Ok(UsageRecord {
                    worker_id,
                    input_units: row.get(0)?,
                    output_units: row.get(1)?,
                    total_units: row.get(2)?,
                })
            },
        )
        .optional()?
        .ok_or(FleetError::WorkerNotFound(worker_id))
    }

    pub async fn usage_for_owner(&self, owner_id: i64) -> FleetResult<Vec<UsageRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT u.worker_id, u.input_units, u.output_units, u.total_units
             FROM worker_usage u JOIN workers w ON w.id = u.worker_id
             WHERE w.owner_id = ?1 ORDER BY u.worker_id",
        )?;
        let rows = stmt.query_map(params![owner_id], |row| {
            Ok(UsageRecord {
                worker_id: row.get(0)?,
                input_units: row.get(1)?,
                output_units: row.get(2)?,
                total_units: row.get(3)?,
            })
        })?;
        let mut usage = Vec::new();
        for row in rows {
            usage.push(row?);
        }
        Ok(usage)
    }

    /// Sets the warning flag if neither flag is set yet. True for the one
    /// caller that flipped it.
    pub async fn claim_warning(&self, owner_id: i64) -> FleetResult<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE owners SET warning_sent = 1
             WHERE id = ?1 AND warning_sent = 0 AND exhausted_sent = 0",
            params![owner_id],
        )?;
        Ok(rows == 1)
    }

    /// Sets both flags if the hard-stop notice was not sent yet.
    pub async fn claim_exhausted(&self, owner_id: i64) -> FleetResult<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE owners SET warning_sent = 1, exhausted_sent = 1
             WHERE id = ?1 AND exhausted_sent = 0",
            params![owner_id],
        )?;
        Ok(rows == 1)
    }

    /// Updates the owner's limit. Raising it clears both notification flags.
    pub async fn set_owner_limit(&self, owner_id: i64, new_limit: i64) -> FleetResult<OwnerAggregate> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE owners
             SET warning_sent = CASE WHEN ?2 > tokens_limit THEN 0 ELSE warning_sent END,
                 exhausted_sent = CASE WHEN ?2 > tokens_limit THEN 0 ELSE exhausted_sent END,
                 tokens_limit = ?2
             WHERE id = ?1",
            params![owner_id, new_limit],
        )?;
        if rows == 0 {
            return Err(FleetError::OwnerNotFound(owner_id));
        }
        load_aggregate(&db, owner_id)?.ok_or(FleetError::OwnerNotFound(owner_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_store;
    use crate::core::store::types::{
        AgentDescriptor, ConfigPatch, NewWorker, OpenAiSettings, ReadMode,
    };

    async fn worker(store: &ConfigStore, owner: i64, cred: &str, metered: bool) -> i64 {
        let agent = if metered {
            AgentDescriptor::OpenAi {
                handle: "asst".into(),
                settings: OpenAiSettings::default(),
            }
        } else {
            AgentDescriptor::External {
                platform: "protalk".into(),
                token: "t".into(),
            }
        };
        let (w, _) = store
            .create_worker(
                NewWorker {
                    owner_id: owner,
                    credential: cred.into(),
                    username: cred.into(),
                },
                &ConfigPatch {
                    ai_enabled: Some(true),
                    agent: Some(agent),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        w.id
    }

    #[tokio::test]
    async fn charge_recomputes_aggregate_over_metered_workers_only() {
        let store = test_store();
        store.ensure_owner(1, 1000, None).await.unwrap();
        let a = worker(&store, 1, "a", true).await;
        let b = worker(&store, 1, "b", true).await;
        let ext = worker(&store, 1, "c", false).await;

        store.apply_charge(a, 10, 5).await.unwrap();
        store.apply_charge(ext, 100, 100).await.unwrap();
        let (usage, agg) = store.apply_charge(b, 3, 2).await.unwrap();

        assert_eq!(usage.total_units, 5);
        assert_eq!(agg.total_used, 20);
        assert_eq!(store.metered_total(1).await.unwrap(), 20);
        assert_eq!(store.usage_for_worker(ext).await.unwrap().total_units, 200);
        assert_eq!(store.usage_for_owner(1).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn charge_for_missing_worker_fails() {
        let store = test_store();
        let err = store.apply_charge(99, 1, 1).await.unwrap_err();
        assert!(matches!(err, FleetError::WorkerNotFound(99)));
    }

    #[tokio::test]
    async fn flags_are_claimed_once() {
        let store = test_store();
        store.ensure_owner(1, 1000, None).await.unwrap();
        assert!(store.claim_warning(1).await.unwrap());
        assert!(!store.claim_warning(1).await.unwrap());
        assert!(store.claim_exhausted(1).await.unwrap());
        assert!(!store.claim_exhausted(1).await.unwrap());
    }

    #[tokio::test]
    async fn exhausted_claim_blocks_later_warning() {
        let store = test_store();
        store.ensure_owner(1, 1000, None).await.unwrap();
        assert!(store.claim_exhausted(1).await.unwrap());
        assert!(!store.claim_warning(1).await.unwrap());
    }

    #[tokio::test]
    async fn raising_limit_clears_flags_but_lowering_keeps_them() {
        let store = test_store();
        store.ensure_owner(1, 1000, None).await.unwrap();
        store.claim_exhausted(1).await.unwrap();

        let lowered = store.set_owner_limit(1, 800).await.unwrap();
        assert!(lowered.warned && lowered.exhausted_notified);

        let raised = store.set_owner_limit(1, 5000).await.unwrap();
        assert_eq!(raised.limit, 5000);
        assert!(!raised.warned);
        assert!(!raised.exhausted_notified);

        let fresh = store.owner_aggregate(1, ReadMode::Fresh).await.unwrap();
        assert_eq!(fresh, raised);
    }
}
