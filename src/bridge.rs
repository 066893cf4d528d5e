//! Command orchestration between the operator and tmux.
//!
//! Each inbound command goes through the per-operator replay guard, the
//! command policy and (for system-class commands) the confirmation ledger
//! before it is typed into the active session. Terminal reads (`tail`,
//! `screenshot`) skip policy and go straight through the sanitizer.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::confirm::{ConfirmationLedger, OperatorId};
use crate::error::BridgeError;
use crate::log::{AuditEvent, AuditLog};
use crate::policy::{BlockReason, Classification, CommandPolicy};
use crate::sanitize;
use crate::session::{KillOutcome, SessionRegistry};
use crate::telemetry::{NullSink, OutcomeSink};
use crate::tmux::{Multiplexer, control_key};

/// Log files at least this large are only read from their trailing window.
const LARGE_LOG_BYTES: u64 = 1024 * 1024;
const LARGE_LOG_WINDOW: u64 = 4096;

/// Key sent after literal text to submit it.
const SUBMIT_KEY: &str = "C-m";

/// Drops an operator's command when it repeats the previous one too quickly.
#[derive(Debug)]
pub struct ReplayGuard {
    window: Duration,
    last: Mutex<HashMap<OperatorId, (String, Instant)>>,
}

impl ReplayGuard {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(HashMap::new()),
        }
    }

    pub fn admit(&self, operator: OperatorId, command: &str) -> bool {
        self.admit_at(operator, command, Instant::now())
    }

    /// Check and record in one critical section. Only admitted commands are
    /// recorded, so a burst of repeats cannot extend the window.
    pub fn admit_at(&self, operator: OperatorId, command: &str, now: Instant) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((previous, at)) = last.get(&operator)
            && previous == command
            && now.saturating_duration_since(*at) < self.window
        {
            return false;
        }
        last.insert(operator, (command.to_string(), now));
        true
    }
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub spam_window: Duration,
    pub confirmation_ttl: Option<Duration>,
    pub max_message_length: usize,
    pub screenshot_lines: usize,
    /// Directory relative log paths are resolved against.
    pub root: PathBuf,
}

impl BridgeSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        let ttl = config.security.confirmation_ttl_secs;
        Self {
            spam_window: Duration::from_secs(config.security.spam_protection_secs),
            confirmation_ttl: (ttl > 0).then(|| Duration::from_secs(ttl)),
            max_message_length: config.output.max_message_length,
            screenshot_lines: config.tmux.screenshot_lines,
            root: config.root.clone(),
        }
    }
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            spam_window: Duration::from_secs(5),
            confirmation_ttl: Some(Duration::from_secs(300)),
            max_message_length: sanitize::DEFAULT_MAX_LENGTH,
            screenshot_lines: 50,
            root: PathBuf::new(),
        }
    }
}

/// What happened to one inbound command.
#[derive(Debug)]
pub enum Outcome {
    /// Replay within the cool-down window. No reply.
    Dropped,
    Blocked { reason: BlockReason },
    /// Staged for `/confirm`. `already_pending` is set when the identical
    /// command was already waiting and was not re-staged.
    PendingConfirmation {
        command: String,
        rule: String,
        already_pending: bool,
    },
    Executed { command: String, session: String },
    Failed { command: String, error: BridgeError },
}

impl Outcome {
    /// Reply text for the operator; `None` means stay silent.
    pub fn reply(&self) -> Option<String> {
        match self {
            Outcome::Dropped => None,
            Outcome::Blocked { reason } => Some(format!("🛡️ Command blocked: {reason}")),
            Outcome::PendingConfirmation {
                command,
                already_pending,
                ..
            } => {
                let lead = if *already_pending {
                    "⚠️ Still waiting for confirmation"
                } else {
                    "⚠️ System command requires confirmation"
                };
                Some(format!("{lead}: `{command}`\nSend `/confirm {command}` to run it"))
            }
            Outcome::Executed { command, .. } => Some(format!("✅ Command sent: `{command}`")),
            Outcome::Failed { error, .. } => Some(failure_reply(error)),
        }
    }
}

/// Operator-facing text for a failed bridge operation.
pub fn failure_reply(error: &BridgeError) -> String {
    match error {
        BridgeError::Timeout { secs, .. } => format!("⏰ Command timed out ({secs}s)"),
        BridgeError::ConfirmationMismatch => "❌ Command is not pending confirmation".to_string(),
        other => format!("❌ {other}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    LogFile,
    Pane,
}

/// Sanitized terminal text ready for transport.
#[derive(Debug, Clone)]
pub struct Capture {
    pub source: CaptureSource,
    /// Raw lines the text was built from.
    pub lines: usize,
    /// True when older lines were cut to fit the requested count.
    pub clipped: bool,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct LogFileInfo {
    pub size: u64,
    pub modified: Option<DateTime<Local>>,
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    /// Active session after resolution, if any.
    pub session: Option<String>,
    pub sessions: Vec<String>,
    pub log_file: PathBuf,
    pub log: Option<LogFileInfo>,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub status: StatusReport,
    pub tmux_version: Result<String, String>,
}

pub struct CommandBridge<M: Multiplexer> {
    policy: Box<dyn CommandPolicy>,
    ledger: ConfirmationLedger,
    sessions: SessionRegistry<M>,
    replay: ReplayGuard,
    sink: Arc<dyn OutcomeSink>,
    audit: Option<Arc<AuditLog>>,
    settings: BridgeSettings,
    /// Held across literal text and its submit key so concurrent deliveries
    /// cannot interleave in the pane.
    delivery: Mutex<()>,
}

impl<M: Multiplexer> CommandBridge<M> {
    pub fn new(
        policy: Box<dyn CommandPolicy>,
        sessions: SessionRegistry<M>,
        settings: BridgeSettings,
    ) -> Self {
        Self {
            policy,
            ledger: ConfirmationLedger::new(settings.confirmation_ttl),
            sessions,
            replay: ReplayGuard::new(settings.spam_window),
            sink: Arc::new(NullSink),
            audit: None,
            settings,
            delivery: Mutex::new(()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn sessions(&self) -> &SessionRegistry<M> {
        &self.sessions
    }

    pub fn ledger(&self) -> &ConfirmationLedger {
        &self.ledger
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    fn audit(&self, event: AuditEvent) {
        if let Some(audit) = &self.audit {
            audit.record(event);
        }
    }

    /// Full pipeline for free text and `/send`.
    pub fn process_command(&self, operator: OperatorId, raw: &str) -> Outcome {
        let command = raw.trim();
        if !self.replay.admit(operator, command) {
            debug!(operator, command, "dropped repeated command");
            return Outcome::Dropped;
        }

        match self.policy.classify(command) {
            Classification::Blocked { reason } => {
                let text = reason.to_string();
                warn!(operator, command, reason = %text, "command blocked");
                self.sink.record_block(operator, command, &text);
                self.audit(AuditEvent::CommandBlocked {
                    operator,
                    command: command.to_string(),
                    reason: text,
                });
                Outcome::Blocked { reason }
            }
            Classification::RequiresConfirmation { matched_rule } => {
                let already_pending = !self.ledger.requires_staging(operator, command);
                if !already_pending {
                    self.ledger.stage(operator, command);
                    self.audit(AuditEvent::ConfirmationStaged {
                        operator,
                        command: command.to_string(),
                        rule: matched_rule.clone(),
                    });
                }
                Outcome::PendingConfirmation {
                    command: command.to_string(),
                    rule: matched_rule,
                    already_pending,
                }
            }
            Classification::Allowed => self.execute(operator, command),
        }
    }

    /// Run a staged system command if it matches exactly.
    pub fn confirm(&self, operator: OperatorId, raw: &str) -> Outcome {
        let command = raw.trim();
        if !self.ledger.confirm(operator, command) {
            self.audit(AuditEvent::ConfirmationRejected {
                operator,
                command: command.to_string(),
            });
            return Outcome::Failed {
                command: command.to_string(),
                error: BridgeError::ConfirmationMismatch,
            };
        }
        info!(operator, command, "confirmation accepted");
        self.audit(AuditEvent::ConfirmationAccepted {
            operator,
            command: command.to_string(),
        });
        self.execute(operator, command)
    }

    /// Send a named control input (quick buttons, `/kill`).
    ///
    /// Control inputs carry no shell text, so they skip the replay guard and
    /// policy.
    pub fn send_control(&self, operator: OperatorId, name: &str) -> Outcome {
        if control_key(name).is_none() {
            return Outcome::Failed {
                command: name.to_string(),
                error: BridgeError::Validation {
                    reason: format!("unknown control input '{name}'"),
                },
            };
        }
        self.execute(operator, name)
    }

    pub fn interrupt(&self, operator: OperatorId) -> Outcome {
        self.send_control(operator, "Ctrl+C")
    }

    fn execute(&self, operator: OperatorId, command: &str) -> Outcome {
        let result = match self.sessions.ensure_active() {
            Some(session) => self.deliver(&session, command).map(|()| session),
            None => Err(BridgeError::SessionUnavailable),
        };

        match result {
            Ok(session) => {
                info!(operator, session = %session, command, "command delivered");
                self.sink.record_command(operator, command, None);
                self.audit(AuditEvent::CommandExecuted {
                    operator,
                    session: session.clone(),
                    command: command.to_string(),
                });
                Outcome::Executed {
                    command: command.to_string(),
                    session,
                }
            }
            Err(error) => {
                let text = error.to_string();
                warn!(operator, command, error = %text, "command failed");
                self.sink.record_command(operator, command, Some(&text));
                self.audit(AuditEvent::CommandFailed {
                    operator,
                    command: command.to_string(),
                    kind: error.kind().to_string(),
                    error: text,
                });
                Outcome::Failed {
                    command: command.to_string(),
                    error,
                }
            }
        }
    }

    fn deliver(&self, session: &str, command: &str) -> Result<(), BridgeError> {
        let _delivery = self.delivery.lock().unwrap_or_else(|e| e.into_inner());
        let mux = self.sessions.multiplexer();
        if let Some(key) = control_key(command) {
            mux.send_key(session, key)?;
            return Ok(());
        }
        mux.send_literal(session, command)?;
        mux.send_key(session, SUBMIT_KEY)
            .map_err(|e| BridgeError::PartialDelivery {
                diagnostic: e.to_string(),
            })
    }

    fn log_path(&self) -> PathBuf {
        let path = PathBuf::from(self.sessions.log_file());
        if path.is_absolute() {
            path
        } else {
            self.settings.root.join(path)
        }
    }

    /// Last `lines` lines of the terminal log, or of the pane when there is
    /// no log file.
    pub fn tail(&self, lines: usize) -> Result<Capture, BridgeError> {
        let session = self.sessions.ensure_active().ok_or(BridgeError::SessionUnavailable)?;
        let path = self.log_path();
        if path.is_file() {
            let content = read_log_tail(&path)?;
            return Ok(self.capture(CaptureSource::LogFile, &content, lines));
        }
        debug!(path = %path.display(), "no terminal log, capturing pane");
        let pane = self.sessions.multiplexer().capture_pane(&session)?;
        Ok(self.capture(CaptureSource::Pane, &pane, lines))
    }

    pub fn screenshot(&self) -> Result<Capture, BridgeError> {
        let session = self.sessions.ensure_active().ok_or(BridgeError::SessionUnavailable)?;
        let pane = self.sessions.multiplexer().capture_pane(&session)?;
        Ok(self.capture(CaptureSource::Pane, &pane, self.settings.screenshot_lines))
    }

    fn capture(&self, source: CaptureSource, raw: &str, lines: usize) -> Capture {
        let all: Vec<&str> = raw.trim().lines().collect();
        let keep = lines.max(1).min(all.len());
        let tail = &all[all.len() - keep..];
        Capture {
            source,
            lines: tail.len(),
            clipped: keep < all.len(),
            text: sanitize::format_for_transport(&tail.join("\n"), self.settings.max_message_length),
        }
    }

    pub fn status(&self) -> StatusReport {
        let session = self.sessions.ensure_active();
        let sessions = self.sessions.list_sessions().unwrap_or_else(|error| {
            warn!(error = %error, "failed to list tmux sessions");
            Vec::new()
        });
        let log_file = self.log_path();
        let log = std::fs::metadata(&log_file).ok().map(|meta| LogFileInfo {
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Local>::from),
        });
        StatusReport {
            session,
            sessions,
            log_file,
            log,
        }
    }

    pub fn health(&self) -> HealthReport {
        HealthReport {
            status: self.status(),
            tmux_version: self
                .sessions
                .multiplexer()
                .version()
                .map_err(|e| e.to_string()),
        }
    }

    pub fn list_sessions(&self) -> Result<Vec<String>, BridgeError> {
        Ok(self.sessions.list_sessions()?)
    }

    pub fn create_session(&self, operator: OperatorId, name: &str) -> Result<(), BridgeError> {
        self.sessions.create(name)?;
        self.session_changed(operator, "new", name);
        Ok(())
    }

    pub fn switch_session(&self, operator: OperatorId, name: &str) -> Result<(), BridgeError> {
        self.sessions.switch(name)?;
        self.session_changed(operator, "switch", name);
        Ok(())
    }

    pub fn kill_session(&self, operator: OperatorId, name: &str) -> Result<KillOutcome, BridgeError> {
        let outcome = self.sessions.kill(name)?;
        self.session_changed(operator, "kill", name);
        if let KillOutcome::Switched(next) = &outcome {
            self.session_changed(operator, "switch", next);
        }
        Ok(outcome)
    }

    pub fn rename_session(&self, operator: OperatorId, old: &str, new: &str) -> Result<(), BridgeError> {
        self.sessions.rename(old, new)?;
        self.session_changed(operator, "rename", &format!("{old} -> {new}"));
        Ok(())
    }

    fn session_changed(&self, operator: OperatorId, action: &str, session: &str) {
        self.audit(AuditEvent::SessionChanged {
            operator,
            action: action.to_string(),
            session: session.to_string(),
        });
    }
}

/// Read the terminal log, limited to the trailing window for large files.
fn read_log_tail(path: &Path) -> Result<String, BridgeError> {
    let context = || format!("failed to read {}", path.display());
    let mut file = File::open(path).map_err(|e| BridgeError::io(context(), e))?;
    let size = file
        .metadata()
        .map_err(|e| BridgeError::io(context(), e))?
        .len();

    let mut buf = Vec::new();
    if size >= LARGE_LOG_BYTES {
        file.seek(SeekFrom::Start(size - LARGE_LOG_WINDOW))
            .map_err(|e| BridgeError::io(context(), e))?;
        file.read_to_end(&mut buf)
            .map_err(|e| BridgeError::io(context(), e))?;
        let text = String::from_utf8_lossy(&buf);
        // The window almost always starts mid-line.
        return Ok(match text.split_once('\n') {
            Some((_, rest)) => rest.to_string(),
            None => text.into_owned(),
        });
    }
    file.read_to_end(&mut buf)
        .map_err(|e| BridgeError::io(context(), e))?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use crate::config::env_file::{PointerRecord, default_log_path};
    use crate::policy::PatternPolicy;
    use crate::session::store::PointerStore;
    use crate::tmux::fake::FakeMux;

    #[derive(Default)]
    struct RecordingSink {
        commands: Mutex<Vec<(OperatorId, String, Option<String>)>>,
        blocks: Mutex<Vec<(OperatorId, String, String)>>,
    }

    impl OutcomeSink for RecordingSink {
        fn record_command(&self, operator: OperatorId, command: &str, error: Option<&str>) {
            self.commands.lock().unwrap().push((
                operator,
                command.to_string(),
                error.map(str::to_string),
            ));
        }

        fn record_block(&self, operator: OperatorId, command: &str, reason: &str) {
            self.blocks
                .lock()
                .unwrap()
                .push((operator, command.to_string(), reason.to_string()));
        }
    }

    fn bridge_with(dir: &Path, mux: FakeMux) -> (CommandBridge<FakeMux>, Arc<RecordingSink>) {
        let store = PointerStore::new(dir.join(".env"), dir.join("state.json"));
        let registry = SessionRegistry::new(
            Arc::new(mux),
            store,
            dir.to_path_buf(),
            PointerRecord {
                session: "claude".to_string(),
                log_file: default_log_path("claude"),
            },
        );
        let policy = PatternPolicy::from_config(&SecurityConfig::default()).unwrap();
        let settings = BridgeSettings {
            root: dir.to_path_buf(),
            ..BridgeSettings::default()
        };
        let sink = Arc::new(RecordingSink::default());
        let bridge = CommandBridge::new(Box::new(policy), registry, settings).with_sink(sink.clone());
        (bridge, sink)
    }

    #[test]
    fn replay_guard_is_per_operator() {
        let guard = ReplayGuard::new(Duration::from_secs(5));
        let t0 = Instant::now();
        assert!(guard.admit_at(1, "ls", t0));
        assert!(!guard.admit_at(1, "ls", t0 + Duration::from_secs(1)));
        assert!(guard.admit_at(2, "ls", t0 + Duration::from_secs(1)));
        assert!(guard.admit_at(1, "pwd", t0 + Duration::from_secs(2)));
        assert!(guard.admit_at(1, "ls", t0 + Duration::from_secs(3)));
    }

    #[test]
    fn replay_guard_does_not_extend_window_on_drop() {
        let guard = ReplayGuard::new(Duration::from_secs(5));
        let t0 = Instant::now();
        assert!(guard.admit_at(1, "ls", t0));
        assert!(!guard.admit_at(1, "ls", t0 + Duration::from_secs(4)));
        assert!(guard.admit_at(1, "ls", t0 + Duration::from_secs(5)));
    }

    #[test]
    fn allowed_command_is_typed_and_submitted() {
        let tmp = tempfile::tempdir().unwrap();
        let (bridge, sink) = bridge_with(tmp.path(), FakeMux::with_sessions(&["claude"]));

        let outcome = bridge.process_command(42, "  ls -la ");
        assert!(matches!(&outcome, Outcome::Executed { session, .. } if session == "claude"));
        assert_eq!(outcome.reply().unwrap(), "✅ Command sent: `ls -la`");
        assert_eq!(bridge.sessions().multiplexer().sent(), vec!["literal:ls -la", "key:C-m"]);
        assert_eq!(sink.commands.lock().unwrap()[0], (42, "ls -la".to_string(), None));
    }

    #[test]
    fn duplicate_within_window_is_silently_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let (bridge, _) = bridge_with(tmp.path(), FakeMux::with_sessions(&["claude"]));
        bridge.process_command(1, "ls");
        let outcome = bridge.process_command(1, "ls");
        assert!(matches!(outcome, Outcome::Dropped));
        assert!(outcome.reply().is_none());
        assert_eq!(bridge.sessions().multiplexer().sent().len(), 2);
    }

    #[test]
    fn blocked_command_never_reaches_tmux() {
        let tmp = tempfile::tempdir().unwrap();
        let (bridge, sink) = bridge_with(tmp.path(), FakeMux::with_sessions(&["claude"]));

        let outcome = bridge.process_command(1, "rm -rf /tmp/x");
        assert_eq!(
            outcome.reply().unwrap(),
            "🛡️ Command blocked: dangerous pattern: rm -rf"
        );
        assert!(bridge.sessions().multiplexer().sent().is_empty());
        assert_eq!(sink.blocks.lock().unwrap().len(), 1);
    }

    #[test]
    fn system_command_waits_for_exact_confirmation() {
        let tmp = tempfile::tempdir().unwrap();
        let (bridge, _) = bridge_with(tmp.path(), FakeMux::with_sessions(&["claude"]));

        let outcome = bridge.process_command(42, "sudo reboot");
        assert!(matches!(
            &outcome,
            Outcome::PendingConfirmation { rule, already_pending: false, .. } if rule == "sudo"
        ));
        assert!(outcome.reply().unwrap().contains("/confirm sudo reboot"));
        assert!(bridge.sessions().multiplexer().sent().is_empty());

        let wrong = bridge.confirm(42, "sudo systemctl status");
        assert!(matches!(
            wrong,
            Outcome::Failed { error: BridgeError::ConfirmationMismatch, .. }
        ));

        let ok = bridge.confirm(42, "sudo reboot");
        assert!(matches!(ok, Outcome::Executed { .. }));
        assert_eq!(
            bridge.sessions().multiplexer().sent(),
            vec!["literal:sudo reboot", "key:C-m"]
        );
        assert!(matches!(
            bridge.confirm(42, "sudo reboot"),
            Outcome::Failed { error: BridgeError::ConfirmationMismatch, .. }
        ));
    }

    #[test]
    fn restaging_identical_command_keeps_single_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let (bridge, _) = bridge_with(tmp.path(), FakeMux::with_sessions(&["claude"]));
        let bridge = CommandBridge {
            replay: ReplayGuard::new(Duration::ZERO),
            ..bridge
        };

        bridge.process_command(7, "sudo reboot");
        let again = bridge.process_command(7, "sudo reboot");
        assert!(matches!(
            again,
            Outcome::PendingConfirmation { already_pending: true, .. }
        ));
        assert_eq!(bridge.ledger().pending(7).as_deref(), Some("sudo reboot"));
        assert!(bridge.sessions().multiplexer().sent().is_empty());
    }

    #[test]
    fn control_input_sends_key_without_submit() {
        let tmp = tempfile::tempdir().unwrap();
        let (bridge, _) = bridge_with(tmp.path(), FakeMux::with_sessions(&["claude"]));
        bridge.process_command(1, "Down");
        bridge.send_control(1, "Down");
        bridge.interrupt(1);
        assert_eq!(
            bridge.sessions().multiplexer().sent(),
            vec!["key:Down", "key:Down", "key:C-c"]
        );
        assert!(matches!(
            bridge.send_control(1, "F13"),
            Outcome::Failed { error: BridgeError::Validation { .. }, .. }
        ));
    }

    #[test]
    fn failed_submit_is_partial_delivery() {
        let tmp = tempfile::tempdir().unwrap();
        let mux = FakeMux {
            fail_submit: true,
            ..FakeMux::with_sessions(&["claude"])
        };
        let (bridge, sink) = bridge_with(tmp.path(), mux);
        let outcome = bridge.process_command(1, "make");
        assert!(matches!(
            &outcome,
            Outcome::Failed { error: BridgeError::PartialDelivery { .. }, .. }
        ));
        assert_eq!(bridge.sessions().multiplexer().sent(), vec!["literal:make"]);
        assert!(sink.commands.lock().unwrap()[0].2.is_some());
    }

    #[test]
    fn concurrent_commands_do_not_interleave() {
        let tmp = tempfile::tempdir().unwrap();
        let mux = FakeMux {
            send_delay: Duration::from_millis(100),
            ..FakeMux::with_sessions(&["claude"])
        };
        let (bridge, _) = bridge_with(tmp.path(), mux);
        std::thread::scope(|scope| {
            scope.spawn(|| bridge.process_command(1, "echo x | s"));
            scope.spawn(|| bridge.process_command(2, "h"));
        });

        let sent = bridge.sessions().multiplexer().sent();
        assert_eq!(sent.len(), 4);
        for pair in sent.chunks(2) {
            assert!(pair[0].starts_with("literal:"), "{sent:?}");
            assert_eq!(pair[1], "key:C-m", "{sent:?}");
        }
    }

    #[test]
    fn send_timeout_is_reported_as_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let mux = FakeMux {
            timeout_send: true,
            ..FakeMux::with_sessions(&["claude"])
        };
        let (bridge, _) = bridge_with(tmp.path(), mux);
        let outcome = bridge.process_command(1, "make");
        assert_eq!(outcome.reply().unwrap(), "⏰ Command timed out (30s)");
    }

    #[test]
    fn no_usable_session_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let mux = FakeMux {
            fail_create: true,
            ..FakeMux::default()
        };
        let (bridge, _) = bridge_with(tmp.path(), mux);
        let outcome = bridge.process_command(1, "ls");
        assert!(matches!(
            outcome,
            Outcome::Failed { error: BridgeError::SessionUnavailable, .. }
        ));
        assert!(matches!(bridge.tail(10), Err(BridgeError::SessionUnavailable)));
    }

    #[test]
    fn tail_reads_log_file_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let (bridge, _) = bridge_with(tmp.path(), FakeMux::with_sessions(&["claude"]));
        let log = tmp.path().join("logs").join("claude_terminal.log");
        std::fs::create_dir_all(log.parent().unwrap()).unwrap();
        std::fs::write(&log, "\x1b[32mone\x1b[0m\ntwo\nthree\nfour\n").unwrap();

        let capture = bridge.tail(2).unwrap();
        assert_eq!(capture.source, CaptureSource::LogFile);
        assert_eq!(capture.lines, 2);
        assert!(capture.clipped);
        assert_eq!(capture.text, "three\nfour");
    }

    #[test]
    fn tail_falls_back_to_pane() {
        let tmp = tempfile::tempdir().unwrap();
        let mux = FakeMux::with_sessions(&["claude"]);
        *mux.pane.lock().unwrap() = "$ ls\nsrc\n╭──╮\n".to_string();
        let (bridge, _) = bridge_with(tmp.path(), mux);

        let capture = bridge.tail(50).unwrap();
        assert_eq!(capture.source, CaptureSource::Pane);
        assert!(!capture.clipped);
        assert_eq!(capture.text, "$ ls\nsrc");
    }

    #[test]
    fn large_log_reads_trailing_window_only() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("big.log");
        let mut content = String::new();
        let mut i = 0;
        while content.len() < (LARGE_LOG_BYTES as usize) + 10 {
            content.push_str(&format!("line {i}\n"));
            i += 1;
        }
        std::fs::write(&path, &content).unwrap();

        let tail = read_log_tail(&path).unwrap();
        assert!(tail.len() <= LARGE_LOG_WINDOW as usize);
        assert!(tail.starts_with("line "));
        assert!(tail.ends_with(&format!("line {}\n", i - 1)));
    }

    #[test]
    fn empty_pane_screenshot_is_placeholder() {
        let tmp = tempfile::tempdir().unwrap();
        let (bridge, _) = bridge_with(tmp.path(), FakeMux::with_sessions(&["claude"]));
        let capture = bridge.screenshot().unwrap();
        assert_eq!(capture.text, sanitize::EMPTY_PLACEHOLDER);
    }

    #[test]
    fn screenshot_keeps_last_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let mux = FakeMux::with_sessions(&["claude"]);
        *mux.pane.lock().unwrap() = (0..80).map(|i| format!("row {i}\n")).collect();
        let (bridge, _) = bridge_with(tmp.path(), mux);
        let capture = bridge.screenshot().unwrap();
        assert_eq!(capture.lines, 50);
        assert!(capture.clipped);
        assert!(capture.text.starts_with("row 30"));
    }

    #[test]
    fn status_reports_sessions_and_log() {
        let tmp = tempfile::tempdir().unwrap();
        let (bridge, _) = bridge_with(tmp.path(), FakeMux::with_sessions(&["claude", "work"]));
        let status = bridge.status();
        assert_eq!(status.session.as_deref(), Some("claude"));
        assert_eq!(status.sessions.len(), 2);
        assert!(status.log.is_none());

        let health = bridge.health();
        assert_eq!(health.tmux_version.unwrap(), "tmux 3.4");
    }

    #[test]
    fn session_admin_passthroughs() {
        let tmp = tempfile::tempdir().unwrap();
        let (bridge, _) = bridge_with(tmp.path(), FakeMux::with_sessions(&["claude"]));

        bridge.create_session(1, "work").unwrap();
        assert_eq!(bridge.sessions().active_name(), "work");
        assert!(bridge.create_session(1, "work").is_err());
        assert!(bridge.switch_session(1, "ghost").is_err());

        bridge.switch_session(1, "claude").unwrap();
        bridge.rename_session(1, "claude", "main").unwrap();
        assert_eq!(bridge.sessions().active_name(), "main");

        let outcome = bridge.kill_session(1, "main").unwrap();
        assert_eq!(outcome, KillOutcome::Switched("work".to_string()));
        assert_eq!(bridge.list_sessions().unwrap(), vec!["work"]);
    }

    #[test]
    fn audit_trail_records_pipeline_events() {
        let tmp = tempfile::tempdir().unwrap();
        let (bridge, _) = bridge_with(tmp.path(), FakeMux::with_sessions(&["claude"]));
        let audit = Arc::new(AuditLog::new(&tmp.path().join("audit.jsonl")).unwrap());
        let bridge = bridge.with_audit(audit);

        bridge.process_command(1, "rm -rf /");
        bridge.process_command(1, "sudo reboot");
        bridge.confirm(1, "sudo reboot");

        let content = std::fs::read_to_string(tmp.path().join("audit.jsonl")).unwrap();
        let events: Vec<String> = content
            .lines()
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).unwrap();
                v["event"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(
            events,
            vec![
                "command_blocked",
                "confirmation_staged",
                "confirmation_accepted",
                "command_executed"
            ]
        );
    }
}
