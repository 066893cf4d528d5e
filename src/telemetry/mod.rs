//! Command history and metrics in SQLite.
//!
//! The bridge reports outcomes through [`OutcomeSink`]; [`TelemetryStore`]
//! persists them and answers the `/history`, `/search` and `/stats` queries.
//! Sink calls never fail the command that produced them.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, warn};

use crate::confirm::OperatorId;

/// Rows kept in `commands`; older rows are pruned on insert.
pub const HISTORY_CAP: i64 = 1000;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS commands (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  ts TEXT NOT NULL,
  operator INTEGER NOT NULL,
  command TEXT NOT NULL,
  command_type TEXT NOT NULL,
  success INTEGER NOT NULL,
  error TEXT
);
CREATE INDEX IF NOT EXISTS idx_commands_operator ON commands(operator);

CREATE TABLE IF NOT EXISTS security_blocks (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  ts TEXT NOT NULL,
  operator INTEGER NOT NULL,
  command TEXT NOT NULL,
  reason TEXT NOT NULL
);
"#;

/// Coarse statistics bucket: the first whitespace token.
pub fn command_type(command: &str) -> &str {
    command.split_whitespace().next().unwrap_or("unknown")
}

/// Receiver for command outcomes.
pub trait OutcomeSink: Send + Sync {
    /// `error` is `None` for a successful execution.
    fn record_command(&self, operator: OperatorId, command: &str, error: Option<&str>);
    fn record_block(&self, operator: OperatorId, command: &str, reason: &str);
}

/// Discards everything; used when telemetry is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl OutcomeSink for NullSink {
    fn record_command(&self, _operator: OperatorId, _command: &str, _error: Option<&str>) {}
    fn record_block(&self, _operator: OperatorId, _command: &str, _reason: &str) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    pub timestamp: String,
    pub operator: OperatorId,
    pub command: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub uptime: Duration,
    pub executed: u64,
    pub failed: u64,
    pub security_blocks: u64,
    pub success_rate: f64,
    pub active_operators: u64,
    pub last_activity: Option<String>,
    pub top_commands: Vec<(String, u64)>,
}

pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
}

fn rate(success: u64, total: u64) -> f64 {
    if total == 0 {
        100.0
    } else {
        success as f64 / total as f64 * 100.0
    }
}

pub struct TelemetryStore {
    conn: Mutex<Connection>,
    started: Instant,
}

impl TelemetryStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open telemetry db {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to initialize telemetry schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
            started: Instant::now(),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_command(&self, operator: OperatorId, command: &str, error: Option<&str>) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO commands (ts, operator, command, command_type, success, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Utc::now().to_rfc3339(),
                operator,
                command,
                command_type(command),
                error.is_none(),
                error
            ],
        )?;
        conn.execute(
            "DELETE FROM commands WHERE id NOT IN
             (SELECT id FROM commands ORDER BY id DESC LIMIT ?1)",
            params![HISTORY_CAP],
        )?;
        Ok(())
    }

    pub fn insert_block(&self, operator: OperatorId, command: &str, reason: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO security_blocks (ts, operator, command, reason) VALUES (?1, ?2, ?3, ?4)",
            params![Utc::now().to_rfc3339(), operator, command, reason],
        )?;
        Ok(())
    }

    /// Newest first.
    pub fn recent(&self, operator: Option<OperatorId>, limit: usize) -> Result<Vec<CommandRecord>> {
        self.select(operator, None, limit)
    }

    /// Case-insensitive substring search, newest first.
    pub fn search(
        &self,
        query: &str,
        operator: Option<OperatorId>,
        limit: usize,
    ) -> Result<Vec<CommandRecord>> {
        self.select(operator, Some(query), limit)
    }

    fn select(
        &self,
        operator: Option<OperatorId>,
        query: Option<&str>,
        limit: usize,
    ) -> Result<Vec<CommandRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT ts, operator, command, success, error FROM commands
             WHERE (?1 IS NULL OR operator = ?1)
               AND (?2 IS NULL OR instr(lower(command), lower(?2)) > 0)
             ORDER BY id DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![operator, query, limit as i64], |row| {
            Ok(CommandRecord {
                timestamp: row.get(0)?,
                operator: row.get(1)?,
                command: row.get(2)?,
                success: row.get(3)?,
                error: row.get(4)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("failed to read command history")
    }

    pub fn operator_stats(&self, operator: OperatorId) -> Result<OperatorStats> {
        let (total, success): (i64, i64) = self.conn().query_row(
            "SELECT COUNT(*), COALESCE(SUM(success), 0) FROM commands WHERE operator = ?1",
            params![operator],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let (total, success) = (total as u64, success as u64);
        Ok(OperatorStats {
            total,
            success,
            failed: total - success,
            success_rate: if total == 0 { 0.0 } else { rate(success, total) },
        })
    }

    pub fn summary(&self) -> Result<Summary> {
        let conn = self.conn();
        let (executed, failed, active): (i64, i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(success), 0), COALESCE(SUM(1 - success), 0),
                    COUNT(DISTINCT operator) FROM commands",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let blocks: i64 =
            conn.query_row("SELECT COUNT(*) FROM security_blocks", [], |row| row.get(0))?;
        let last_activity: Option<String> = conn
            .query_row("SELECT ts FROM commands ORDER BY id DESC LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        let mut stmt = conn.prepare(
            "SELECT command_type, COUNT(*) AS n FROM commands
             GROUP BY command_type ORDER BY n DESC, command_type ASC LIMIT 5",
        )?;
        let top_commands = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let (executed, failed) = (executed as u64, failed as u64);
        Ok(Summary {
            uptime: self.started.elapsed(),
            executed,
            failed,
            security_blocks: blocks as u64,
            success_rate: rate(executed, executed + failed),
            active_operators: active as u64,
            last_activity,
            top_commands,
        })
    }

    /// Delete history for one operator, or everything.
    pub fn clear(&self, operator: Option<OperatorId>) -> Result<usize> {
        let conn = self.conn();
        let removed = match operator {
            Some(op) => conn.execute("DELETE FROM commands WHERE operator = ?1", params![op])?,
            None => conn.execute("DELETE FROM commands", [])?,
        };
        debug!(removed, "history cleared");
        Ok(removed)
    }
}

impl OutcomeSink for TelemetryStore {
    fn record_command(&self, operator: OperatorId, command: &str, error: Option<&str>) {
        if let Err(e) = self.insert_command(operator, command, error) {
            warn!(error = %e, "failed to record command");
        }
    }

    fn record_block(&self, operator: OperatorId, command: &str, reason: &str) {
        if let Err(e) = self.insert_block(operator, command, reason) {
            warn!(error = %e, "failed to record security block");
        }
    }
}
