//! tmux control surface.
//!
//! Every call is a short-lived `tmux` process with captured stdout/stderr and a
//! hard wall-clock bound. A process that outlives its bound is killed and
//! reaped, and reported as [`TmuxError::Timeout`] rather than a generic
//! failure.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

#[derive(Debug, Error)]
pub enum TmuxError {
    #[error("failed to run tmux: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("tmux {operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },
    #[error("tmux {operation} failed: {stderr}")]
    Failed { operation: String, stderr: String },
}

/// Named control inputs and the tmux key each one maps to.
const CONTROL_KEYS: &[(&str, &str)] = &[
    ("Enter", "C-m"),
    ("Ctrl+C", "C-c"),
    ("Tab", "Tab"),
    ("Shift+Tab", "BTab"),
    ("Up", "Up"),
    ("Down", "Down"),
    ("Left", "Left"),
    ("Right", "Right"),
    ("Ctrl+Z", "C-z"),
    ("Ctrl+D", "C-d"),
    ("Escape", "Escape"),
];

/// Map a named control input to its tmux key name. Names are matched
/// exactly, so lowercase `tab` or `up` is typed as text.
pub fn control_key(input: &str) -> Option<&'static str> {
    let input = input.trim();
    CONTROL_KEYS
        .iter()
        .find(|(name, _)| *name == input)
        .map(|(_, key)| *key)
}

pub fn control_key_names() -> impl Iterator<Item = &'static str> {
    CONTROL_KEYS.iter().map(|(name, _)| *name)
}

/// Operations the bridge needs from a terminal multiplexer.
pub trait Multiplexer: Send + Sync {
    /// Session names. A missing server or empty server is `Ok(vec![])`.
    fn list_sessions(&self) -> Result<Vec<String>, TmuxError>;
    fn has_session(&self, name: &str) -> Result<bool, TmuxError>;
    fn new_session(&self, name: &str, work_dir: &Path) -> Result<(), TmuxError>;
    fn kill_session(&self, name: &str) -> Result<(), TmuxError>;
    fn rename_session(&self, old: &str, new: &str) -> Result<(), TmuxError>;
    /// Type `text` literally, without interpreting key names.
    fn send_literal(&self, target: &str, text: &str) -> Result<(), TmuxError>;
    /// Send one tmux key name (`C-m`, `Up`, ...).
    fn send_key(&self, target: &str, key: &str) -> Result<(), TmuxError>;
    /// Visible pane content.
    fn capture_pane(&self, target: &str) -> Result<String, TmuxError>;
    fn version(&self) -> Result<String, TmuxError>;
}

struct RunOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

/// The real tmux binary.
#[derive(Debug, Clone)]
pub struct Tmux {
    program: String,
    status_timeout: Duration,
    command_timeout: Duration,
}

impl Tmux {
    /// `status_timeout` bounds listing and queries, `command_timeout` bounds
    /// input delivery.
    pub fn new(status_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            program: "tmux".to_string(),
            status_timeout,
            command_timeout,
        }
    }

    fn run(&self, operation: &str, args: &[&str], timeout: Duration) -> Result<RunOutput, TmuxError> {
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(TmuxError::Spawn)?;

        // Drain both pipes concurrently so a chatty child cannot block on a
        // full pipe buffer while we wait on it.
        let stdout_thread = child.stdout.take().map(spawn_reader);
        let stderr_thread = child.stderr.take().map(spawn_reader);

        let status = match child.wait_timeout(timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                join_reader(stdout_thread);
                join_reader(stderr_thread);
                warn!(operation, secs = timeout.as_secs(), "tmux timed out, killed");
                return Err(TmuxError::Timeout {
                    operation: operation.to_string(),
                    secs: timeout.as_secs(),
                });
            }
            Err(error) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(TmuxError::Spawn(error));
            }
        };

        Ok(RunOutput {
            success: status.success(),
            stdout: join_reader(stdout_thread),
            stderr: join_reader(stderr_thread),
        })
    }

    fn run_checked(&self, operation: &str, args: &[&str], timeout: Duration) -> Result<String, TmuxError> {
        let output = self.run(operation, args, timeout)?;
        if !output.success {
            return Err(TmuxError::Failed {
                operation: operation.to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// tmux's stderr when there is simply nothing to list.
fn is_empty_server(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("no server running")
        || stderr.contains("no sessions")
        || stderr.contains("error connecting to")
}

fn parse_session_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

impl Multiplexer for Tmux {
    fn list_sessions(&self) -> Result<Vec<String>, TmuxError> {
        let output = self.run(
            "list-sessions",
            &["list-sessions", "-F", "#{session_name}"],
            self.status_timeout,
        )?;
        if output.success {
            return Ok(parse_session_list(&output.stdout));
        }
        if is_empty_server(&output.stderr) {
            return Ok(Vec::new());
        }
        Err(TmuxError::Failed {
            operation: "list-sessions".to_string(),
            stderr: output.stderr.trim().to_string(),
        })
    }

    fn has_session(&self, name: &str) -> Result<bool, TmuxError> {
        // `=` forces an exact match; plain `-t` accepts prefixes.
        let target = format!("={name}");
        let output = self.run("has-session", &["has-session", "-t", &target], self.status_timeout)?;
        Ok(output.success)
    }

    fn new_session(&self, name: &str, work_dir: &Path) -> Result<(), TmuxError> {
        let work_dir = work_dir.to_string_lossy();
        self.run_checked(
            "new-session",
            &["new-session", "-d", "-s", name, "-c", &work_dir],
            self.status_timeout,
        )?;
        info!(session = name, "tmux session created");
        Ok(())
    }

    fn kill_session(&self, name: &str) -> Result<(), TmuxError> {
        let target = format!("={name}");
        self.run_checked("kill-session", &["kill-session", "-t", &target], self.status_timeout)?;
        info!(session = name, "tmux session killed");
        Ok(())
    }

    fn rename_session(&self, old: &str, new: &str) -> Result<(), TmuxError> {
        let target = format!("={old}");
        self.run_checked(
            "rename-session",
            &["rename-session", "-t", &target, new],
            self.status_timeout,
        )?;
        info!(from = old, to = new, "tmux session renamed");
        Ok(())
    }

    fn send_literal(&self, target: &str, text: &str) -> Result<(), TmuxError> {
        self.run_checked(
            "send-keys",
            &["send-keys", "-t", target, "-l", "--", text],
            self.command_timeout,
        )?;
        debug!(target, text, "sent literal text");
        Ok(())
    }

    fn send_key(&self, target: &str, key: &str) -> Result<(), TmuxError> {
        self.run_checked("send-keys", &["send-keys", "-t", target, key], self.command_timeout)?;
        debug!(target, key, "sent key");
        Ok(())
    }

    fn capture_pane(&self, target: &str) -> Result<String, TmuxError> {
        self.run_checked(
            "capture-pane",
            &["capture-pane", "-t", target, "-p"],
            self.status_timeout,
        )
    }

    fn version(&self) -> Result<String, TmuxError> {
        let stdout = self.run_checked("-V", &["-V"], self.status_timeout)?;
        Ok(stdout.trim().to_string())
    }
}
