//! Per-operator pending confirmations for system-class commands.
//!
//! One slot per operator, last write wins. Entries older than the configured
//! TTL are treated as absent.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

/// Identity of the operator issuing commands (the chat id).
pub type OperatorId = i64;

#[derive(Debug, Clone)]
struct Pending {
    command: String,
    staged_at: Instant,
}

#[derive(Debug)]
pub struct ConfirmationLedger {
    ttl: Option<Duration>,
    pending: Mutex<HashMap<OperatorId, Pending>>,
}

impl ConfirmationLedger {
    /// `ttl` of `None` keeps entries until confirmed or overwritten.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<OperatorId, Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_live(&self, entry: &Pending, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_duration_since(entry.staged_at) <= ttl,
            None => true,
        }
    }

    pub fn stage(&self, operator: OperatorId, command: &str) {
        self.stage_at(operator, command, Instant::now());
    }

    pub fn stage_at(&self, operator: OperatorId, command: &str, now: Instant) {
        debug!(operator, command, "confirmation staged");
        self.lock().insert(
            operator,
            Pending {
                command: command.to_string(),
                staged_at: now,
            },
        );
    }

    /// False only when exactly `command` is already staged and still live.
    pub fn requires_staging(&self, operator: OperatorId, command: &str) -> bool {
        self.requires_staging_at(operator, command, Instant::now())
    }

    pub fn requires_staging_at(&self, operator: OperatorId, command: &str, now: Instant) -> bool {
        match self.lock().get(&operator) {
            Some(entry) => !(entry.command == command && self.is_live(entry, now)),
            None => true,
        }
    }

    /// Consume the pending entry if it equals `command`.
    ///
    /// An expired entry is dropped and the call returns false.
    pub fn confirm(&self, operator: OperatorId, command: &str) -> bool {
        self.confirm_at(operator, command, Instant::now())
    }

    pub fn confirm_at(&self, operator: OperatorId, command: &str, now: Instant) -> bool {
        let mut pending = self.lock();
        let Some(entry) = pending.get(&operator) else {
            return false;
        };
        if !self.is_live(entry, now) {
            pending.remove(&operator);
            return false;
        }
        if entry.command != command {
            return false;
        }
        pending.remove(&operator);
        true
    }

    /// The live pending command for `operator`, if any.
    pub fn pending(&self, operator: OperatorId) -> Option<String> {
        let now = Instant::now();
        self.lock()
            .get(&operator)
            .filter(|entry| self.is_live(entry, now))
            .map(|entry| entry.command.clone())
    }

    pub fn clear(&self, operator: OperatorId) {
        self.lock().remove(&operator);
    }
}
