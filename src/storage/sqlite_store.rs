use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::storage::*;

/// Path value selecting a private, non-persistent database.
pub const MEMORY_PATH: &str = ":memory:";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS checkpoints (
        checkpoint_id TEXT PRIMARY KEY,
        workflow_id   TEXT NOT NULL,
        thread_id     TEXT NOT NULL,
        state_json    TEXT NOT NULL,
        timestamp     INTEGER NOT NULL,
        metadata_json TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_checkpoints_workflow_ts ON checkpoints (workflow_id, timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        session_id         TEXT PRIMARY KEY,
        workflow_id        TEXT NOT NULL,
        thread_id          TEXT NOT NULL,
        status             TEXT NOT NULL,
        last_checkpoint_id TEXT,
        metadata_json      TEXT,
        created_at         INTEGER NOT NULL,
        updated_at         INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_sessions_workflow_status ON sessions (workflow_id, status)",
    r#"
    CREATE TABLE IF NOT EXISTS transitions (
        id              INTEGER PRIMARY KEY AUTOINCREMENT,
        checkpoint_id   TEXT NOT NULL,
        workflow_id     TEXT NOT NULL,
        thread_id       TEXT NOT NULL,
        from_node       TEXT,
        to_node         TEXT NOT NULL,
        transition_type TEXT NOT NULL,
        duration_ms     REAL,
        timestamp       INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_transitions_scope_ts ON transitions (workflow_id, thread_id, timestamp)",
];

const CHECKPOINT_COLUMNS: &str =
    "checkpoint_id, workflow_id, thread_id, state_json, timestamp, metadata_json";

const SESSION_COLUMNS: &str =
    "session_id, workflow_id, thread_id, status, last_checkpoint_id, metadata_json, created_at, updated_at";

const TRANSITION_COLUMNS: &str =
    "id, checkpoint_id, workflow_id, thread_id, from_node, to_node, transition_type, duration_ms, timestamp";

/// SQLite-backed state store.
pub struct SqliteStateStore {
    pool: SqlitePool,
    // SQLite allows one writer at a time; queue writers here instead of on busy errors.
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for SqliteStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStateStore").finish()
    }
}

impl SqliteStateStore {
    /// Open (or create) the database at `db_path` and apply the schema.
    /// `":memory:"` yields a private in-memory database.
    pub async fn open(db_path: &str) -> StoreResult<Self> {
        let pool = if db_path == MEMORY_PATH {
            // Every in-memory connection is a separate database, so pin exactly one.
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
                .await?
        } else {
            if let Some(parent) = Path::new(db_path).parent()
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(parent).await?;
            }
            let options = SqliteConnectOptions::new()
                .filename(db_path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5));
            SqlitePoolOptions::new()
                .max_connections(4)
                .connect_with(options)
                .await?
        };

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        info!(db = %db_path, "Opened SQLite state store");

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }
}

fn checkpoint_from_row(row: &SqliteRow) -> StoreResult<StateCheckpoint> {
    let state_json: String = row.try_get("state_json")?;
    let metadata_json: Option<String> = row.try_get("metadata_json")?;
    Ok(StateCheckpoint {
        checkpoint_id: row.try_get("checkpoint_id")?,
        workflow_id: row.try_get("workflow_id")?,
        thread_id: row.try_get("thread_id")?,
        state: serde_json::from_str(&state_json)?,
        timestamp: from_micros(row.try_get("timestamp")?)?,
        metadata: metadata_json
            .map(|m| serde_json::from_str(&m))
            .transpose()?,
    })
}

fn session_from_row(row: &SqliteRow) -> StoreResult<WorkflowSession> {
    let status: String = row.try_get("status")?;
    let metadata_json: Option<String> = row.try_get("metadata_json")?;
    Ok(WorkflowSession {
        session_id: row.try_get("session_id")?,
        workflow_id: row.try_get("workflow_id")?,
        thread_id: row.try_get("thread_id")?,
        status: status.parse()?,
        last_checkpoint_id: row.try_get("last_checkpoint_id")?,
        metadata: metadata_json
            .map(|m| serde_json::from_str(&m))
            .transpose()?,
        created_at: from_micros(row.try_get("created_at")?)?,
        updated_at: from_micros(row.try_get("updated_at")?)?,
    })
}

fn transition_from_row(row: &SqliteRow) -> StoreResult<StateTransition> {
    Ok(StateTransition {
        id: row.try_get("id")?,
        checkpoint_id: row.try_get("checkpoint_id")?,
        workflow_id: row.try_get("workflow_id")?,
        thread_id: row.try_get("thread_id")?,
        from_node: row.try_get("from_node")?,
        to_node: row.try_get("to_node")?,
        transition_type: row.try_get("transition_type")?,
        duration_ms: row.try_get("duration_ms")?,
        timestamp: from_micros(row.try_get("timestamp")?)?,
    })
}

fn metadata_to_json(metadata: &Option<serde_json::Value>) -> StoreResult<Option<String>> {
    Ok(metadata.as_ref().map(serde_json::to_string).transpose()?)
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn upsert_checkpoint(&self, checkpoint: &StateCheckpoint) -> StoreResult<()> {
        let state_json = serde_json::to_string(&checkpoint.state)?;
        let metadata_json = metadata_to_json(&checkpoint.metadata)?;

        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO checkpoints (checkpoint_id, workflow_id, thread_id, state_json, timestamp, metadata_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(checkpoint_id) DO UPDATE SET
                workflow_id   = excluded.workflow_id,
                thread_id     = excluded.thread_id,
                state_json    = excluded.state_json,
                timestamp     = excluded.timestamp,
                metadata_json = excluded.metadata_json
            "#,
        )
        .bind(&checkpoint.checkpoint_id)
        .bind(&checkpoint.workflow_id)
        .bind(&checkpoint.thread_id)
        .bind(state_json)
        .bind(to_micros(checkpoint.timestamp))
        .bind(metadata_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_checkpoint(&self, checkpoint_id: &str) -> StoreResult<Option<StateCheckpoint>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM checkpoints WHERE checkpoint_id = ?1",
            CHECKPOINT_COLUMNS
        ))
        .bind(checkpoint_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn latest_checkpoint(&self, query: &RecoveryQuery) -> StoreResult<Option<StateCheckpoint>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM checkpoints
            WHERE workflow_id = ?1
              AND (?2 IS NULL OR thread_id = ?2)
              AND (?3 IS NULL OR timestamp < ?3)
            ORDER BY timestamp DESC, rowid DESC
            LIMIT 1
            "#,
            CHECKPOINT_COLUMNS
        ))
        .bind(&query.workflow_id)
        .bind(query.thread_id.as_deref())
        .bind(query.before.map(to_micros))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(checkpoint_from_row).transpose()
    }

    async fn list_checkpoints(
        &self,
        workflow_id: &str,
        thread_id: Option<&str>,
    ) -> StoreResult<Vec<StateCheckpoint>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM checkpoints
            WHERE workflow_id = ?1 AND (?2 IS NULL OR thread_id = ?2)
            ORDER BY timestamp DESC, rowid DESC
            "#,
            CHECKPOINT_COLUMNS
        ))
        .bind(workflow_id)
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(checkpoint_from_row).collect()
    }

    async fn prune_checkpoints(&self, workflow_id: &str, keep: usize) -> StoreResult<Vec<String>> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let evicted: Vec<String> = sqlx::query(
            r#"
            SELECT checkpoint_id FROM checkpoints
            WHERE workflow_id = ?1
            ORDER BY timestamp DESC, rowid DESC
            LIMIT -1 OFFSET ?2
            "#,
        )
        .bind(workflow_id)
        .bind(keep as i64)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| row.try_get("checkpoint_id"))
        .collect::<Result<_, _>>()?;

        for id in &evicted {
            sqlx::query("DELETE FROM checkpoints WHERE checkpoint_id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        if !evicted.is_empty() {
            debug!(workflow = %workflow_id, evicted = evicted.len(), "Pruned checkpoints");
        }
        Ok(evicted)
    }

    async fn delete_checkpoint(&self, checkpoint_id: &str) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM checkpoints WHERE checkpoint_id = ?1")
            .bind(checkpoint_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_session(&self, session: &WorkflowSession) -> StoreResult<()> {
        let metadata_json = metadata_to_json(&session.metadata)?;

        let _guard = self.write_lock.lock().await;
        sqlx::query(&format!(
            "INSERT INTO sessions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            SESSION_COLUMNS
        ))
        .bind(&session.session_id)
        .bind(&session.workflow_id)
        .bind(&session.thread_id)
        .bind(session.status.to_string())
        .bind(session.last_checkpoint_id.as_deref())
        .bind(metadata_json)
        .bind(to_micros(session.created_at))
        .bind(to_micros(session.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> StoreResult<Option<WorkflowSession>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM sessions WHERE session_id = ?1",
            SESSION_COLUMNS
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn list_sessions(
        &self,
        workflow_id: Option<&str>,
        status: Option<SessionStatus>,
    ) -> StoreResult<Vec<WorkflowSession>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM sessions
            WHERE (?1 IS NULL OR workflow_id = ?1)
              AND (?2 IS NULL OR status = ?2)
            ORDER BY created_at ASC, rowid ASC
            "#,
            SESSION_COLUMNS
        ))
        .bind(workflow_id)
        .bind(status.map(|s| s.to_string()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }

    async fn update_session_status(&self, session_id: &str, status: SessionStatus) -> StoreResult<bool> {
        let _guard = self.write_lock.lock().await;
        let result =
            sqlx::query("UPDATE sessions SET status = ?1, updated_at = ?2 WHERE session_id = ?3")
                .bind(status.to_string())
                .bind(to_micros(Utc::now()))
                .bind(session_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn link_checkpoint(
        &self,
        workflow_id: &str,
        thread_id: &str,
        checkpoint_id: &str,
    ) -> StoreResult<u64> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            r#"
            UPDATE sessions SET last_checkpoint_id = ?1, updated_at = ?2
            WHERE workflow_id = ?3 AND thread_id = ?4 AND status = 'active'
            "#,
        )
        .bind(checkpoint_id)
        .bind(to_micros(Utc::now()))
        .bind(workflow_id)
        .bind(thread_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn append_transition(&self, transition: &StateTransition) -> StoreResult<i64> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query(
            r#"
            INSERT INTO transitions
                (checkpoint_id, workflow_id, thread_id, from_node, to_node, transition_type, duration_ms, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&transition.checkpoint_id)
        .bind(&transition.workflow_id)
        .bind(&transition.thread_id)
        .bind(transition.from_node.as_deref())
        .bind(&transition.to_node)
        .bind(&transition.transition_type)
        .bind(transition.duration_ms)
        .bind(to_micros(transition.timestamp))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn transition_history(
        &self,
        workflow_id: &str,
        thread_id: Option<&str>,
    ) -> StoreResult<Vec<StateTransition>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM transitions
            WHERE workflow_id = ?1 AND (?2 IS NULL OR thread_id = ?2)
            ORDER BY timestamp ASC, id ASC
            "#,
            TRANSITION_COLUMNS
        ))
        .bind(workflow_id)
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transition_from_row).collect()
    }

    async fn close(&self) -> StoreResult<()> {
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!("Closed SQLite state store");
        }
        Ok(())
    }
}
