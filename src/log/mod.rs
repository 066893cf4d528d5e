//! Audit trail: JSON lines, one entry per bridge event.
//!
//! Every command outcome, policy block, confirmation step and session change
//! is appended to `logs/audit.jsonl` as a self-contained JSON object with an
//! RFC 3339 timestamp, so the trail is easy to grep, stream and post-process.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, warn};

use crate::confirm::OperatorId;

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub timestamp: String,
    #[serde(flatten)]
    pub event: AuditEvent,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    CommandExecuted {
        operator: OperatorId,
        session: String,
        command: String,
    },
    CommandFailed {
        operator: OperatorId,
        command: String,
        kind: String,
        error: String,
    },
    CommandBlocked {
        operator: OperatorId,
        command: String,
        reason: String,
    },
    ConfirmationStaged {
        operator: OperatorId,
        command: String,
        rule: String,
    },
    ConfirmationAccepted {
        operator: OperatorId,
        command: String,
    },
    ConfirmationRejected {
        operator: OperatorId,
        command: String,
    },
    SessionChanged {
        operator: OperatorId,
        action: String,
        session: String,
    },
    UnauthorizedAccess {
        chat_id: i64,
        text: String,
    },
    BridgeStarted {
        session: String,
    },
    BridgeStopped {
        reason: String,
    },
}

pub struct AuditLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl AuditLog {
    /// Open (append) the audit log, creating parent directories.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open audit log: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    pub fn log(&self, event: AuditEvent) -> Result<()> {
        let entry = AuditEntry {
            timestamp: now_rfc3339(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize audit entry")?;

        debug!(event = %json, "audit");

        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(writer, "{json}").context("failed to write audit entry")?;
        writer.flush().context("failed to flush audit log")?;

        Ok(())
    }

    /// Like [`AuditLog::log`] but never fails; write errors become warnings.
    pub fn record(&self, event: AuditEvent) {
        if let Err(error) = self.log(event) {
            warn!(path = %self.path.display(), error = %error, "audit write failed");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
