//! Active-session tracking.
//!
//! The registry owns only the pointer to the session commands are routed to;
//! session existence is always queried live from the multiplexer. The
//! pointer is persisted to two stores (see [`store`]) when it is newly
//! chosen, and only adopted in memory when it is merely rediscovered.

pub mod store;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::{info, warn};

use crate::config::env_file::{self, PointerRecord};
use crate::tmux::{Multiplexer, TmuxError};
use store::PointerStore;

/// Name used when no session name is configured.
pub const FALLBACK_SESSION: &str = "default";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session '{0}' not found")]
    NotFound(String),
    #[error("session '{0}' already exists")]
    AlreadyExists(String),
    #[error("invalid session name '{0}'")]
    InvalidName(String),
    #[error(transparent)]
    Tmux(#[from] TmuxError),
}

/// Result of killing a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillOutcome {
    /// A non-active session was removed.
    Killed,
    /// The active session was removed; the pointer moved here.
    Switched(String),
    /// The active session was removed and nothing else exists.
    NoSessionsLeft,
}

pub struct SessionRegistry<M: Multiplexer> {
    mux: Arc<M>,
    store: PointerStore,
    work_dir: PathBuf,
    pointer: Mutex<PointerRecord>,
    // Serializes resolution and admin operations against each other.
    resolve: Mutex<()>,
}

impl<M: Multiplexer> SessionRegistry<M> {
    pub fn new(mux: Arc<M>, store: PointerStore, work_dir: PathBuf, initial: PointerRecord) -> Self {
        Self {
            mux,
            store,
            work_dir,
            pointer: Mutex::new(initial),
            resolve: Mutex::new(()),
        }
    }

    pub fn multiplexer(&self) -> &M {
        &self.mux
    }

    fn pointer(&self) -> MutexGuard<'_, PointerRecord> {
        self.pointer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn resolve_guard(&self) -> MutexGuard<'_, ()> {
        self.resolve.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current pointer, whether or not the session exists.
    pub fn active(&self) -> PointerRecord {
        self.pointer().clone()
    }

    pub fn active_name(&self) -> String {
        self.pointer().session.clone()
    }

    pub fn log_file(&self) -> String {
        self.pointer().log_file.clone()
    }

    pub fn list_sessions(&self) -> Result<Vec<String>, TmuxError> {
        self.mux.list_sessions()
    }

    /// Resolve the pointer to an existing session, creating one if needed.
    ///
    /// Resolution order: current pointer, recovered state file, create the
    /// target, first existing session. `None` means no session is usable.
    pub fn ensure_active(&self) -> Option<String> {
        let _guard = self.resolve_guard();
        self.ensure_active_locked()
    }

    fn ensure_active_locked(&self) -> Option<String> {
        let sessions = match self.mux.list_sessions() {
            Ok(sessions) => sessions,
            Err(error) => {
                warn!(error = %error, "failed to list tmux sessions");
                Vec::new()
            }
        };

        let current = self.active_name();
        if !current.is_empty() && sessions.contains(&current) {
            return Some(current);
        }

        if let Some(state) = self.store.read_state()
            && sessions.contains(&state.tmux_session)
        {
            info!(session = %state.tmux_session, "recovered active session from state file");
            self.set_active(&state.tmux_session, false, false);
            return Some(state.tmux_session);
        }

        let target = if current.is_empty() {
            FALLBACK_SESSION.to_string()
        } else {
            current
        };
        match self.mux.new_session(&target, &self.work_dir) {
            Ok(()) => {
                self.set_active(&target, true, true);
                return Some(target);
            }
            Err(error) => warn!(session = %target, error = %error, "failed to create tmux session"),
        }

        let first = sessions.into_iter().next()?;
        info!(session = %first, "falling back to first existing session");
        self.set_active(&first, true, true);
        Some(first)
    }

    /// Move the pointer to `name`, optionally persisting it.
    ///
    /// The log path follows the session only while it uses default naming.
    /// Store failures are logged and do not undo the in-memory change.
    pub fn set_active(&self, name: &str, persist_config: bool, persist_state: bool) {
        {
            let mut pointer = self.pointer();
            *pointer = env_file::reconcile(&pointer, name);
        }
        if persist_config
            && let Err(error) = self.store.write_env(name)
        {
            warn!(session = name, error = %error, "failed to persist session to env file");
        }
        if persist_state
            && let Err(error) = self.store.write_state(name)
        {
            warn!(session = name, error = %error, "failed to persist session state");
        }
    }

    pub fn switch(&self, name: &str) -> Result<(), SessionError> {
        let _guard = self.resolve_guard();
        if !self.mux.has_session(name)? {
            return Err(SessionError::NotFound(name.to_string()));
        }
        self.set_active(name, true, true);
        info!(session = name, "switched active session");
        Ok(())
    }

    /// Create `name` and make it active.
    pub fn create(&self, name: &str) -> Result<(), SessionError> {
        validate_name(name)?;
        let _guard = self.resolve_guard();
        if self.mux.has_session(name)? {
            return Err(SessionError::AlreadyExists(name.to_string()));
        }
        self.mux.new_session(name, &self.work_dir)?;
        self.set_active(name, true, true);
        Ok(())
    }

    pub fn kill(&self, name: &str) -> Result<KillOutcome, SessionError> {
        let _guard = self.resolve_guard();
        self.mux.kill_session(name)?;
        if name != self.active_name() {
            return Ok(KillOutcome::Killed);
        }
        let remaining = match self.mux.list_sessions() {
            Ok(sessions) => sessions,
            Err(error) => {
                warn!(error = %error, "failed to list sessions after kill");
                Vec::new()
            }
        };
        match remaining.into_iter().next() {
            Some(first) => {
                self.set_active(&first, true, true);
                Ok(KillOutcome::Switched(first))
            }
            None => Ok(KillOutcome::NoSessionsLeft),
        }
    }

    /// Rename a session; the pointer follows if it was active.
    pub fn rename(&self, old: &str, new: &str) -> Result<(), SessionError> {
        validate_name(new)?;
        let _guard = self.resolve_guard();
        self.mux.rename_session(old, new)?;
        if old == self.active_name() {
            self.set_active(new, true, true);
        }
        Ok(())
    }
}

/// tmux rejects `.` and `:` in session names; whitespace breaks the `.env` line.
fn validate_name(name: &str) -> Result<(), SessionError> {
    if name.is_empty() || name.chars().any(|c| c == '.' || c == ':' || c.is_whitespace()) {
        return Err(SessionError::InvalidName(name.to_string()));
    }
    Ok(())
}
