//! Durable copies of the active-session pointer.
//!
//! Two records: the `.env` key-value file (seeds the pointer at boot) and a
//! small JSON state file (`{"tmux_session", "updated_at"}`) used to recover
//! the pointer when the `.env` file was not rewritten. Both are replaced via a
//! temp file and rename so readers never see a partial write.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::env_file;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub tmux_session: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PointerStore {
    env_file: PathBuf,
    state_file: PathBuf,
}

impl PointerStore {
    pub fn new(env_file: PathBuf, state_file: PathBuf) -> Self {
        Self {
            env_file,
            state_file,
        }
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Recovered session name, or `None` when absent or unreadable.
    pub fn read_state(&self) -> Option<SessionState> {
        if !self.state_file.exists() {
            return None;
        }
        let contents = match std::fs::read_to_string(&self.state_file) {
            Ok(contents) => contents,
            Err(error) => {
                warn!(path = %self.state_file.display(), error = %error, "failed to read session state");
                return None;
            }
        };
        match serde_json::from_str::<SessionState>(&contents) {
            Ok(state) if !state.tmux_session.trim().is_empty() => Some(state),
            Ok(_) => None,
            Err(error) => {
                warn!(path = %self.state_file.display(), error = %error, "ignoring malformed session state");
                None
            }
        }
    }

    pub fn write_state(&self, session: &str) -> Result<()> {
        let state = SessionState {
            tmux_session: session.to_string(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&state).context("failed to serialize session state")?;
        write_atomic(&self.state_file, &json)?;
        debug!(session, path = %self.state_file.display(), "session state written");
        Ok(())
    }

    /// Point the `.env` file at `session`. An absent `.env` is left absent.
    pub fn write_env(&self, session: &str) -> Result<bool> {
        if !self.env_file.is_file() {
            return Ok(false);
        }
        let contents = std::fs::read_to_string(&self.env_file)
            .with_context(|| format!("failed to read {}", self.env_file.display()))?;
        write_atomic(&self.env_file, &env_file::rewrite_env(&contents, session))?;
        debug!(session, path = %self.env_file.display(), "env file updated");
        Ok(true)
    }
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let mut temp_file = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    temp_file
        .write_all(content.as_bytes())
        .context("failed to write temp file")?;
    // The temp file starts out 0600; keep the mode of the file it replaces.
    if let Ok(metadata) = std::fs::metadata(path) {
        temp_file
            .as_file()
            .set_permissions(metadata.permissions())
            .with_context(|| format!("failed to copy permissions of {}", path.display()))?;
    }
    temp_file
        .persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
