use rusqlite::{OptionalExtension, params};

use super::ConfigStore;
use crate::core::store::types::{StatCounter, WorkerStats};
use crate::error::FleetResult;

impl ConfigStore {
    /// Bumps one delivery counter; the stats row is created on first use.
    pub async fn record_stat(&self, worker_id: i64, counter: StatCounter) -> FleetResult<()> {
        let column = counter.column();
        let db = self.db.lock().await;
        db.execute(
            &format!(
                "INSERT INTO worker_stats (worker_id, {column}) VALUES (?1, 1)
                 ON CONFLICT(worker_id) DO UPDATE SET {column} = {column} + 1"
            ),
            params![worker_id],
        )?;
        Ok(())
    }

    pub async fn touch_activity(&self, worker_id: i64) -> FleetResult<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO worker_stats (worker_id, last_activity) VALUES (?1, CURRENT_TIMESTAMP)
             ON CONFLICT(worker_id) DO UPDATE SET last_activity = CURRENT_TIMESTAMP",
            params![worker_id],
        )?;
        Ok(())
    }

    /// All zero for a worker that has not handled anything yet.
    pub async fn worker_stats(&self, worker_id: i64) -> FleetResult<WorkerStats> {
        let db = self.db.lock().await;
        let stats = db
            .query_row(
                "SELECT welcome_sent, welcome_blocked, goodbye_sent, goodbye_blocked,
                        join_approved, ai_replies, last_activity
                 FROM worker_stats WHERE worker_id = ?1",
                params![worker_id],
                |row| {
                    Ok(WorkerStats {
                        welcome_sent: row.get(0)?,
                        welcome_blocked: row.get(1)?,
                        goodbye_sent: row.get(2)?,
                        goodbye_blocked: row.get(3)?,
                        join_approved: row.get(4)?,
                        ai_replies: row.get(5)?,
                        last_activity: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(stats.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::test_store;
    use crate::core::store::types::{ConfigPatch, NewWorker};

    async fn seeded(store: &ConfigStore) -> i64 {
        store.ensure_owner(3, 100, None).await.unwrap();
        store
            .create_worker(
                NewWorker {
                    owner_id: 3,
                    credential: "42:stats".into(),
                    username: "stats_bot".into(),
                },
                &ConfigPatch::default(),
            )
            .await
            .unwrap()
            .0
            .id
    }

    #[tokio::test]
    async fn counters_accumulate_per_worker() {
        let store = test_store();
        let id = seeded(&store).await;
        assert_eq!(store.worker_stats(id).await.unwrap(), WorkerStats::default());

        store.record_stat(id, StatCounter::WelcomeSent).await.unwrap();
        store.record_stat(id, StatCounter::WelcomeSent).await.unwrap();
        store.record_stat(id, StatCounter::GoodbyeBlocked).await.unwrap();

        let stats = store.worker_stats(id).await.unwrap();
        assert_eq!(stats.welcome_sent, 2);
        assert_eq!(stats.goodbye_blocked, 1);
        assert_eq!(stats.ai_replies, 0);
        assert!(stats.last_activity.is_none());
    }

    #[tokio::test]
    async fn activity_is_stamped_and_removed_with_worker() {
        let store = test_store();
        let id = seeded(&store).await;
        store.touch_activity(id).await.unwrap();
        assert!(store.worker_stats(id).await.unwrap().last_activity.is_some());

        store.delete_worker(id).await.unwrap();
        assert_eq!(store.worker_stats(id).await.unwrap(), WorkerStats::default());
        assert!(store.record_stat(id, StatCounter::AiReplies).await.is_err());
    }
}
