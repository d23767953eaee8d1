//! SQLite-backed checkpoint log.
//!
//! This module is feature-gated behind `sqlite-persistence`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::DateTime;
use rusqlite::{params, Connection};

use crate::kernel::checkpoint::{Checkpoint, CheckpointEvent, CheckpointLog, KernelError, NewCheckpoint};
use crate::kernel::identity::Seq;

fn map_log_err(prefix: &str, err: impl std::fmt::Display) -> KernelError {
    KernelError::CheckpointLog(format!("{prefix}: {err}"))
}

/// SQLite-backed checkpoint log. Appends run in a transaction that reads the
/// current head, so the seq is assigned under the same lock that writes it.
pub struct SqliteCheckpointLog {
    db_path: PathBuf,
    lock: Mutex<()>,
}

impl SqliteCheckpointLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Opens the database once so a bad path fails at startup rather than mid-run.
    pub fn health_check(&self) -> Result<(), KernelError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| map_log_err("lock poisoned", "mutex poisoned"))?;
        self.open_connection().map(|_| ())
    }

    fn open_connection(&self) -> Result<Connection, KernelError> {
        if let Some(parent) = Path::new(&self.db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| map_log_err("create parent dir", e))?;
        }
        let conn = Connection::open(&self.db_path).map_err(|e| map_log_err("open sqlite db", e))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| map_log_err("set journal_mode", e))?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(|e| map_log_err("set synchronous", e))?;
        self.ensure_schema(&conn)?;
        Ok(conn)
    }

    fn ensure_schema(&self, conn: &Connection) -> Result<(), KernelError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS rollout_checkpoints (
                deployment_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                phase TEXT,
                node_id TEXT,
                event_json TEXT NOT NULL,
                recorded_at_ms INTEGER NOT NULL,
                PRIMARY KEY (deployment_id, seq)
            );
            ",
        )
        .map_err(|e| map_log_err("ensure schema", e))?;
        Ok(())
    }

    fn read_head(conn: &Connection, deployment_id: &str) -> Result<i64, KernelError> {
        conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM rollout_checkpoints WHERE deployment_id = ?1",
            params![deployment_id],
            |row| row.get(0),
        )
        .map_err(|e| map_log_err("read head", e))
    }
}

impl CheckpointLog for SqliteCheckpointLog {
    fn append(&self, checkpoint: NewCheckpoint) -> Result<Checkpoint, KernelError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| map_log_err("lock poisoned", "mutex poisoned"))?;
        let mut conn = self.open_connection()?;

        let tx = conn.transaction().map_err(|e| map_log_err("begin tx", e))?;
        let seq = Self::read_head(&tx, &checkpoint.deployment_id)? + 1;
        let json =
            serde_json::to_string(&checkpoint.event).map_err(|e| map_log_err("serialize event", e))?;
        tx.execute(
            "INSERT INTO rollout_checkpoints
             (deployment_id, seq, phase, node_id, event_json, recorded_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                checkpoint.deployment_id,
                seq,
                checkpoint.phase,
                checkpoint.node_id,
                json,
                checkpoint.recorded_at.timestamp_millis()
            ],
        )
        .map_err(|e| map_log_err("insert checkpoint", e))?;
        tx.commit().map_err(|e| map_log_err("commit tx", e))?;

        Ok(checkpoint.sequenced(seq as Seq))
    }

    fn scan(&self, deployment_id: &str, from: Seq) -> Result<Vec<Checkpoint>, KernelError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| map_log_err("lock poisoned", "mutex poisoned"))?;
        let conn = self.open_connection()?;
        let mut stmt = conn
            .prepare(
                "SELECT seq, phase, node_id, event_json, recorded_at_ms FROM rollout_checkpoints
                 WHERE deployment_id = ?1 AND seq >= ?2
                 ORDER BY seq ASC",
            )
            .map_err(|e| map_log_err("prepare scan", e))?;
        let rows = stmt
            .query_map(params![deployment_id, from as i64], |row| {
                let seq: i64 = row.get(0)?;
                let phase: Option<String> = row.get(1)?;
                let node_id: Option<String> = row.get(2)?;
                let json: String = row.get(3)?;
                let recorded_at_ms: i64 = row.get(4)?;
                let event: CheckpointEvent = serde_json::from_str(&json).map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(
                        json.len(),
                        rusqlite::types::Type::Text,
                        Box::new(err),
                    )
                })?;
                let recorded_at = DateTime::from_timestamp_millis(recorded_at_ms).ok_or_else(|| {
                    rusqlite::Error::IntegralValueOutOfRange(4, recorded_at_ms)
                })?;
                Ok(Checkpoint {
                    seq: seq as Seq,
                    deployment_id: deployment_id.to_string(),
                    phase,
                    node_id,
                    event,
                    recorded_at,
                })
            })
            .map_err(|e| map_log_err("query scan", e))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| map_log_err("row decode", e))?);
        }
        Ok(out)
    }

    fn head(&self, deployment_id: &str) -> Result<Seq, KernelError> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| map_log_err("lock poisoned", "mutex poisoned"))?;
        let conn = self.open_connection()?;
        Ok(Self::read_head(&conn, deployment_id)? as Seq)
    }
}
