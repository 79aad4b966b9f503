mod cache;
mod config;
mod stats;
mod tokens;
pub mod types;
mod usage;
mod workers;

use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::FleetResult;
use cache::ReadCache;
pub use types::{
    AgentDescriptor, ApiTokenRecord, CommitResult, ConfigPatch, ConfigRecord, NewWorker,
    OpenAiSettings, OwnerAggregate, PersistedStatus, ReadMode, StatCounter, SubscriptionGate,
    TokenScope, UsageRecord, WorkerRecord, WorkerStats,
};

/// Persistence boundary for worker configuration, usage counters and owners.
///
/// One SQLite connection is shared behind an async mutex. Reads come in two
/// consistency modes (see [`ReadMode`]); every config write bumps a
/// per-worker revision that `verify` callers can wait on.
pub struct ConfigStore {
    db: Arc<Mutex<Connection>>,
    configs: ReadCache<ConfigRecord>,
    aggregates: ReadCache<OwnerAggregate>,
}

impl ConfigStore {
    pub async fn open<P: AsRef<Path>>(path: P, cache_ttl: Duration) -> FleetResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let conn = Connection::open(path)?;
        info!("Opened worker store at {}", path.display());
        Self::with_connection(conn, cache_ttl)
    }

    pub fn open_in_memory(cache_ttl: Duration) -> FleetResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, cache_ttl)
    }

    fn with_connection(conn: Connection, cache_ttl: Duration) -> FleetResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
            configs: ReadCache::new(cache_ttl),
            aggregates: ReadCache::new(cache_ttl),
        })
    }

    pub fn get_db(&self) -> Arc<Mutex<Connection>> {
        self.db.clone()
    }
}

fn init_schema(db: &Connection) -> FleetResult<()> {
    db.execute_batch("PRAGMA foreign_keys = ON;")?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS owners (
            id INTEGER PRIMARY KEY,
            admin_chat_id INTEGER,
            tokens_limit INTEGER NOT NULL,
            tokens_used_total INTEGER NOT NULL DEFAULT 0,
            warning_sent INTEGER NOT NULL DEFAULT 0,
            exhausted_sent INTEGER NOT NULL DEFAULT 0,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS workers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id INTEGER NOT NULL REFERENCES owners(id),
            credential TEXT NOT NULL UNIQUE,
            username TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            is_running INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS worker_configs (
            worker_id INTEGER PRIMARY KEY REFERENCES workers(id) ON DELETE CASCADE,
            welcome_text TEXT NOT NULL DEFAULT '',
            goodbye_text TEXT NOT NULL DEFAULT '',
            ai_enabled INTEGER NOT NULL DEFAULT 0,
            agent_type TEXT NOT NULL DEFAULT 'none',
            agent_json TEXT NOT NULL,
            subscription_json TEXT NOT NULL,
            revision INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS worker_usage (
            worker_id INTEGER PRIMARY KEY REFERENCES workers(id) ON DELETE CASCADE,
            input_units INTEGER NOT NULL DEFAULT 0,
            output_units INTEGER NOT NULL DEFAULT 0,
            total_units INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS worker_stats (
            worker_id INTEGER PRIMARY KEY REFERENCES workers(id) ON DELETE CASCADE,
            welcome_sent INTEGER NOT NULL DEFAULT 0,
            welcome_blocked INTEGER NOT NULL DEFAULT 0,
            goodbye_sent INTEGER NOT NULL DEFAULT 0,
            goodbye_blocked INTEGER NOT NULL DEFAULT 0,
            join_approved INTEGER NOT NULL DEFAULT 0,
            ai_replies INTEGER NOT NULL DEFAULT 0,
            last_activity DATETIME
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS api_tokens (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            token_hash TEXT NOT NULL UNIQUE,
            scope TEXT NOT NULL DEFAULT 'admin',
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            last_used_at DATETIME
        )",
        [],
    )?;

    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_workers_owner ON workers(owner_id)",
        [],
    )?;

    Ok(())
}

fn load_config(db: &Connection, worker_id: i64) -> FleetResult<Option<ConfigRecord>> {
    let row = db
        .query_row(
            "SELECT welcome_text, goodbye_text, ai_enabled, agent_json, subscription_json, revision
             FROM worker_configs WHERE worker_id = ?1",
            params![worker_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((welcome_text, goodbye_text, ai_enabled, agent_json, subscription_json, revision)) =
        row
    else {
        return Ok(None);
    };

    Ok(Some(ConfigRecord {
        worker_id,
        welcome_text,
        goodbye_text,
        ai_enabled,
        agent: serde_json::from_str(&agent_json)?,
        subscription: serde_json::from_str(&subscription_json)?,
        revision,
    }))
}

fn load_aggregate(db: &Connection, owner_id: i64) -> FleetResult<Option<OwnerAggregate>> {
    let aggregate = db
        .query_row(
            "SELECT admin_chat_id, tokens_limit, tokens_used_total, warning_sent, exhausted_sent
             FROM owners WHERE id = ?1",
            params![owner_id],
            |row| {
                Ok(OwnerAggregate {
                    owner_id,
                    admin_chat_id: row.get(0)?,
                    limit: row.get(1)?,
                    total_used: row.get(2)?,
                    warned: row.get(3)?,
                    exhausted_notified: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(aggregate)
}

#[cfg(test)]
pub(crate) fn test_store() -> ConfigStore {
    ConfigStore::open_in_memory(Duration::from_secs(60)).expect("in-memory store")
}
