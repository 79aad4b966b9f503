use rusqlite::{Connection, OptionalExtension, Row, params};

use super::ConfigStore;
use crate::core::store::types::{
    CommitResult, ConfigPatch, ConfigRecord, NewWorker, PersistedStatus, WorkerRecord,
};
use crate::error::{FleetError, FleetResult};

const WORKER_COLUMNS: &str =
    "id, owner_id, credential, username, status, is_running, error_count, created_at";

fn worker_from_row(row: &Row<'_>) -> rusqlite::Result<WorkerRecord> {
    let status: String = row.get(4)?;
    Ok(WorkerRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        credential: row.get(2)?,
        username: row.get(3)?,
        status: PersistedStatus::from_status(&status).unwrap_or(PersistedStatus::Stopped),
        is_running: row.get(5)?,
        error_count: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn query_workers(
    db: &Connection,
    filter: &str,
    args: &[&dyn rusqlite::ToSql],
) -> FleetResult<Vec<WorkerRecord>> {
    let sql = format!("SELECT {WORKER_COLUMNS} FROM workers {filter} ORDER BY id");
    let mut stmt = db.prepare(&sql)?;
    let rows = stmt.query_map(args, worker_from_row)?;
    let mut workers = Vec::new();
    for row in rows {
        workers.push(row?);
    }
    Ok(workers)
}

impl ConfigStore {
    /// Creates the owner row on first use. Existing owners keep their limit;
    /// a provided admin chat replaces the stored one.
    pub async fn ensure_owner(
        &self,
        owner_id: i64,
        default_limit: i64,
        admin_chat_id: Option<i64>,
    ) -> FleetResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO owners (id, admin_chat_id, tokens_limit) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET admin_chat_id = COALESCE(?2, admin_chat_id)",
            params![owner_id, admin_chat_id, default_limit],
        )?;
        Ok(())
    }

    /// Inserts the worker with its config and usage rows in one transaction.
    /// `initial` is merged into the default config and validated first.
    pub async fn create_worker(
        &self,
        new: NewWorker,
        initial: &ConfigPatch,
    ) -> FleetResult<(WorkerRecord, CommitResult)> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;

        let taken: Option<i64> = tx
            .query_row(
                "SELECT id FROM workers WHERE credential = ?1",
                params![new.credential],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing) = taken {
            return Err(FleetError::InvalidConfig(format!(
                "credential is already bound to worker {existing}"
            )));
        }

        tx.execute(
            "INSERT INTO workers (owner_id, credential, username, status, is_running, error_count)
             VALUES (?1, ?2, ?3, 'active', 0, 0)",
            params![new.owner_id, new.credential, new.username],
        )?;
        let worker_id = tx.last_insert_rowid();

        let mut config = ConfigRecord::new(worker_id);
        initial.apply(&mut config);
        config.validate()?;

        tx.execute(
            "INSERT INTO worker_configs (worker_id, welcome_text, goodbye_text, ai_enabled,
                agent_type, agent_json, subscription_json, revision)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
            params![
                worker_id,
                config.welcome_text,
                config.goodbye_text,
                config.ai_enabled,
                config.agent.agent_type(),
                serde_json::to_string(&config.agent)?,
                serde_json::to_string(&config.subscription)?,
            ],
        )?;
        tx.execute(
            "INSERT INTO worker_usage (worker_id) VALUES (?1)",
            params![worker_id],
        )?;

        let worker = tx.query_row(
            &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
            params![worker_id],
            worker_from_row,
        )?;
        tx.commit()?;

        Ok((
            worker,
            CommitResult {
                worker_id,
                revision: 1,
            },
        ))
    }

    pub async fn find_worker(&self, worker_id: i64) -> FleetResult<Option<WorkerRecord>> {
        let db = self.db.lock().await;
        let worker = db
            .query_row(
                &format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?1"),
                params![worker_id],
                worker_from_row,
            )
            .optional()?;
        Ok(worker)
    }

    pub async fn get_worker(&self, worker_id: i64) -> FleetResult<WorkerRecord> {
        self.find_worker(worker_id)
            .await?
            .ok_or(FleetError::WorkerNotFound(worker_id))
    }

    pub async fn list_workers(&self, owner_id: Option<i64>) -> FleetResult<Vec<WorkerRecord>> {
        let db = self.db.lock().await;
        match owner_id {
            Some(owner) => query_workers(&db, "WHERE owner_id = ?1", params![owner]),
            None => query_workers(&db, "", params![]),
        }
    }

    /// Workers whose desired state is running; the reconciliation set.
    pub async fn list_active_workers(&self) -> FleetResult<Vec<WorkerRecord>> {
        let db = self.db.lock().await;
        query_workers(&db, "WHERE status = 'active'", params![])
    }

    pub async fn count_workers_for_owner(&self, owner_id: i64) -> FleetResult<usize> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM workers WHERE owner_id = ?1",
            params![owner_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Removes the worker and, by cascade, its config and usage rows.
    pub async fn delete_worker(&self, worker_id: i64) -> FleetResult<bool> {
        let rows = {
            let db = self.db.lock().await;
            db.execute("DELETE FROM workers WHERE id = ?1", params![worker_id])?
        };
        self.configs.evict(worker_id).await;
        Ok(rows > 0)
    }

    pub async fn set_worker_state(
        &self,
        worker_id: i64,
        status: PersistedStatus,
        is_running: bool,
    ) -> FleetResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE workers SET status = ?2, is_running = ?3 WHERE id = ?1",
            params![worker_id, status.as_str(), is_running],
        )?;
        Ok(())
    }

    pub async fn set_running(&self, worker_id: i64, is_running: bool) -> FleetResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE workers SET is_running = ?2 WHERE id = ?1",
            params![worker_id, is_running],
        )?;
        Ok(())
    }

    pub async fn set_error_count(&self, worker_id: i64, error_count: u32) -> FleetResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE workers SET error_count = ?2 WHERE id = ?1",
            params![worker_id, error_count],
        )?;
        Ok(())
    }

    /// Worker counts grouped by persisted status.
    pub async fn status_counts(&self) -> FleetResult<Vec<(String, i64)>> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare("SELECT status, COUNT(*) FROM workers GROUP BY status ORDER BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_store;
    use crate::core::store::types::ReadMode;

    fn new_worker(owner_id: i64, credential: &str) -> NewWorker {
        NewWorker {
            owner_id,
            credential: credential.to_string(),
            username: format!("bot_{credential}"),
        }
    }

    #[tokio::test]
    async fn create_worker_persists_active_row_with_defaults() {
        let store = test_store();
        store.ensure_owner(1, 500, Some(77)).await.unwrap();
        let (worker, commit) = store
            .create_worker(new_worker(1, "1:a"), &ConfigPatch::default())
            .await
            .unwrap();
        assert_eq!(worker.owner_id, 1);
        assert_eq!(worker.status, PersistedStatus::Active);
        assert!(!worker.is_running);
        assert_eq!(commit.revision, 1);

        let config = store.read(worker.id, ReadMode::Fresh).await.unwrap();
        assert_eq!(config.revision, 1);
        assert!(!config.ai_enabled);
    }

    #[tokio::test]
    async fn duplicate_credential_is_invalid_config() {
        let store = test_store();
        store.ensure_owner(1, 500, None).await.unwrap();
        store
            .create_worker(new_worker(1, "1:a"), &ConfigPatch::default())
            .await
            .unwrap();
        let err = store
            .create_worker(new_worker(1, "1:a"), &ConfigPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidConfig(_)));
        assert_eq!(store.count_workers_for_owner(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn invalid_initial_config_creates_nothing() {
        let store = test_store();
        store.ensure_owner(1, 500, None).await.unwrap();
        let patch = ConfigPatch {
            ai_enabled: Some(true),
            ..Default::default()
        };
        assert!(store.create_worker(new_worker(1, "1:b"), &patch).await.is_err());
        assert!(store.list_workers(Some(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_cascades_to_config() {
        let store = test_store();
        store.ensure_owner(2, 500, None).await.unwrap();
        let (worker, _) = store
            .create_worker(new_worker(2, "2:a"), &ConfigPatch::default())
            .await
            .unwrap();
        assert!(store.delete_worker(worker.id).await.unwrap());
        assert!(store.read_optional(worker.id, ReadMode::Fresh).await.unwrap().is_none());
        assert!(!store.delete_worker(worker.id).await.unwrap());
    }

    #[tokio::test]
    async fn active_listing_excludes_stopped_and_errored() {
        let store = test_store();
        store.ensure_owner(3, 500, None).await.unwrap();
        let mut ids = Vec::new();
        for cred in ["3:a", "3:b", "3:c"] {
            let (w, _) = store
                .create_worker(new_worker(3, cred), &ConfigPatch::default())
                .await
                .unwrap();
            ids.push(w.id);
        }
        store
            .set_worker_state(ids[1], PersistedStatus::Error, false)
            .await
            .unwrap();
        store
            .set_worker_state(ids[2], PersistedStatus::Stopped, false)
            .await
            .unwrap();
        let active: Vec<i64> = store
            .list_active_workers()
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(active, vec![ids[0]]);

        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts.len(), 3);
    }

    #[tokio::test]
    async fn ensure_owner_keeps_existing_limit() {
        let store = test_store();
        store.ensure_owner(4, 100, None).await.unwrap();
        store.ensure_owner(4, 999, Some(12)).await.unwrap();
        let agg = store.owner_aggregate(4, ReadMode::Fresh).await.unwrap();
        assert_eq!(agg.limit, 100);
        assert_eq!(agg.admin_chat_id, Some(12));
    }
}
