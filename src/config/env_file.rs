//! Active-session pointer as stored in the `.env` key-value file.
//!
//! The file is rewritten in place: unrelated lines survive untouched, missing
//! keys are appended. The terminal log path follows the session name only
//! while it still uses the default `logs/<session>_terminal.log` naming.

use std::sync::LazyLock;

use regex::Regex;

pub const SESSION_KEY: &str = "TMUX_SESSION";
pub const LOG_FILE_KEY: &str = "LOG_FILE";

static DEFAULT_LOG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^logs/[^/]+_terminal\.log$").unwrap());

/// Log path derived from a session name.
pub fn default_log_path(session: &str) -> String {
    format!("logs/{session}_terminal.log")
}

/// True if `path` still follows the derived naming convention.
pub fn is_default_log_path(path: &str) -> bool {
    DEFAULT_LOG_RE.is_match(path.trim())
}

/// Session name plus the log path kept in lock-step with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerRecord {
    pub session: String,
    pub log_file: String,
}

/// Next pointer values after choosing `session`.
///
/// A customized log path is carried over unchanged.
pub fn reconcile(current: &PointerRecord, session: &str) -> PointerRecord {
    let log_file = if is_default_log_path(&current.log_file) {
        default_log_path(session)
    } else {
        current.log_file.clone()
    };
    PointerRecord {
        session: session.to_string(),
        log_file,
    }
}

fn key_of(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return None;
    }
    let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    trimmed.split_once('=').map(|(key, _)| key.trim())
}

fn value_of(line: &str) -> &str {
    line.split_once('=')
        .map(|(_, v)| v.trim().trim_matches(|c| c == '"' || c == '\''))
        .unwrap_or("")
}

/// Rewrite `.env` contents so they point at `session`.
pub fn rewrite_env(content: &str, session: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut saw_session = false;
    let mut saw_log = false;

    for line in content.lines() {
        match key_of(line) {
            Some(SESSION_KEY) => {
                saw_session = true;
                lines.push(format!("{SESSION_KEY}={session}"));
            }
            Some(LOG_FILE_KEY) => {
                saw_log = true;
                if is_default_log_path(value_of(line)) {
                    lines.push(format!("{LOG_FILE_KEY}={}", default_log_path(session)));
                } else {
                    lines.push(line.to_string());
                }
            }
            _ => lines.push(line.to_string()),
        }
    }

    if !saw_session {
        lines.push(format!("{SESSION_KEY}={session}"));
    }
    if !saw_log {
        lines.push(format!("{LOG_FILE_KEY}={}", default_log_path(session)));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}
