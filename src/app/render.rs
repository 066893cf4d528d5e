//! Reply text for the Telegram side.
//!
//! Messages are sent without a parse mode, so nothing here needs escaping.

use std::fmt::Write as _;
use std::time::Duration;

use chrono::Local;

use crate::bridge::{Capture, CaptureSource, HealthReport, StatusReport};
use crate::config::SecurityConfig;
use crate::telemetry::{CommandRecord, OperatorStats, Summary, format_uptime};
use crate::tmux::control_key_names;

/// Entries shown by `/history` and `/search`.
pub const HISTORY_PAGE: usize = 10;

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// `2026-10-18T12:00:01.123+00:00` -> `2026-10-18 12:00:01`
fn short_timestamp(ts: &str) -> String {
    ts.chars()
        .take(19)
        .map(|c| if c == 'T' { ' ' } else { c })
        .collect()
}

pub fn welcome(session: Option<&str>) -> String {
    let session_line = match session {
        Some(name) => format!("🖥️ tmux session: `{name}`"),
        None => "⚠️ No tmux session is available yet".to_string(),
    };
    format!(
        "🤖 termgate is running\n\n\
         {session_line}\n\
         🛡️ Command policy: enabled\n\n\
         ⚡ Use the buttons below or send commands directly:\n\
         • plain text is typed into the terminal\n\
         • /send <command> does the same explicitly\n\
         • /session current shows the active session"
    )
}

pub fn help() -> String {
    let keys: Vec<&str> = control_key_names().collect();
    format!(
        "🔧 Commands\n\n\
         /send <command> - type a command into the terminal\n\
         /confirm <command> - run a staged system command\n\
         /tail [n] - last n lines of terminal output (1-100)\n\
         /screenshot - current pane contents\n\
         /kill - send Ctrl+C\n\
         /status - bridge and session status\n\
         /stats - command statistics\n\
         /history [clear] - your recent commands\n\
         /search <text> - search your command history\n\
         /session [list|current|new|switch|kill|rename] - manage tmux sessions\n\
         /health - diagnostics\n\n\
         Control inputs: {}",
        keys.join(", ")
    )
}

pub fn capture(title: &str, capture: &Capture) -> String {
    let source = match capture.source {
        CaptureSource::LogFile => "log file",
        CaptureSource::Pane => "pane",
    };
    let clipped = if capture.clipped { ", clipped" } else { "" };
    format!(
        "{title} ({} lines from {source}{clipped}):\n\n{}",
        capture.lines, capture.text
    )
}

fn push_status(out: &mut String, report: &StatusReport) {
    match &report.session {
        Some(name) => {
            let _ = writeln!(out, "🖥️ Session: {name} ✅");
        }
        None => {
            let _ = writeln!(out, "🖥️ Session: ❌ no usable tmux session");
        }
    }
    let _ = writeln!(out, "🗂️ Sessions running: {}", report.sessions.len());
    match &report.log {
        Some(info) => {
            let modified = info
                .modified
                .map(|m| m.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let _ = writeln!(
                out,
                "📄 Log: {} ({}, modified {modified})",
                report.log_file.display(),
                format_size(info.size)
            );
        }
        None => {
            let _ = writeln!(out, "📄 Log: {} (not found)", report.log_file.display());
        }
    }
}

pub fn status(report: &StatusReport, summary: Option<&Summary>, uptime: Duration) -> String {
    let mut out = String::from("🔄 Status\n\n");
    push_status(&mut out, report);
    let _ = writeln!(out, "⏱️ Uptime: {}", format_uptime(uptime));
    if let Some(summary) = summary {
        let _ = write!(
            out,
            "📊 Commands: {} executed, {} failed, {} blocked",
            summary.executed, summary.failed, summary.security_blocks
        );
    }
    out.trim_end().to_string()
}

pub fn health(
    report: &HealthReport,
    telegram: Option<&Result<String, String>>,
    telemetry_enabled: bool,
) -> String {
    let mut out = String::from("🩺 Health\n\n");
    push_status(&mut out, &report.status);
    match &report.tmux_version {
        Ok(version) => {
            let _ = writeln!(out, "🔧 tmux: {version}");
        }
        Err(error) => {
            let _ = writeln!(out, "🔧 tmux: ❌ {error}");
        }
    }
    match telegram {
        Some(Ok(bot)) => {
            let _ = writeln!(out, "📡 Telegram: ✅ @{bot}");
        }
        Some(Err(error)) => {
            let _ = writeln!(out, "📡 Telegram: ❌ {error}");
        }
        None => {}
    }
    let _ = write!(
        out,
        "🗄️ Telemetry: {}",
        if telemetry_enabled { "enabled" } else { "disabled" }
    );
    out
}

pub fn stats(operator: &OperatorStats, summary: &Summary) -> String {
    let mut out = String::from("📊 Statistics\n\n");
    let _ = writeln!(out, "👤 You");
    let _ = writeln!(out, "• Commands: {}", operator.total);
    let _ = writeln!(out, "• Succeeded: {}", operator.success);
    let _ = writeln!(out, "• Failed: {}", operator.failed);
    let _ = writeln!(out, "• Success rate: {:.1}%", operator.success_rate);
    let _ = writeln!(out, "\n🌐 Bridge");
    let _ = writeln!(out, "• Uptime: {}", format_uptime(summary.uptime));
    let _ = writeln!(out, "• Executed: {}", summary.executed);
    let _ = writeln!(out, "• Failed: {}", summary.failed);
    let _ = writeln!(out, "• Security blocks: {}", summary.security_blocks);
    let _ = writeln!(out, "• Success rate: {:.1}%", summary.success_rate);
    let _ = writeln!(out, "• Active operators: {}", summary.active_operators);
    if let Some(last) = &summary.last_activity {
        let _ = writeln!(out, "• Last activity: {}", short_timestamp(last));
    }
    if !summary.top_commands.is_empty() {
        let _ = writeln!(out, "\n🔝 Top commands");
        for (name, count) in &summary.top_commands {
            let _ = writeln!(out, "• {name}: {count}");
        }
    }
    out.trim_end().to_string()
}

pub fn history(title: &str, records: &[CommandRecord]) -> String {
    let mut out = format!("{title}\n");
    for record in records {
        let mark = if record.success { "✅" } else { "❌" };
        let _ = write!(
            out,
            "\n{mark} {} {}",
            short_timestamp(&record.timestamp),
            record.command
        );
        if let Some(error) = &record.error {
            let _ = write!(out, "\n   {error}");
        }
    }
    out
}

pub fn sessions(names: &[String], active: &str) -> String {
    if names.is_empty() {
        return "🧭 No tmux sessions are running".to_string();
    }
    let mut out = String::from("🧭 Sessions\n");
    for name in names {
        let mark = if name == active { "▶️" } else { "•" };
        let _ = write!(out, "\n{mark} {name}");
    }
    out.push_str("\n\nUsage: /session [list|current|new <name>|switch <name>|kill <name>|rename <old> <new>]");
    out
}

pub fn security(config: &SecurityConfig, confirmation_ttl: Option<Duration>) -> String {
    let ttl = match confirmation_ttl {
        Some(ttl) => format!("{}s", ttl.as_secs()),
        None => "never".to_string(),
    };
    format!(
        "🛡️ Security\n\n\
         • Max command length: {}\n\
         • Repeat protection: {}s\n\
         • Blocked patterns: {}\n\
         • Commands needing /confirm: {} ({})\n\
         • Structural checks: {}\n\
         • Pending confirmations expire: {ttl}",
        config.max_command_length,
        config.spam_protection_secs,
        config.deny.len(),
        config.system.len(),
        config.system.join(", "),
        config.suspicious.len(),
    )
}

pub fn startup(session: Option<&str>) -> String {
    let now = Local::now().format("%d.%m.%Y %H:%M:%S");
    let session = session.unwrap_or("none");
    format!(
        "🚀 termgate started\n\n\
         ⏰ {now}\n\
         🖥️ Session: {session}\n\n\
         Send /start to get the quick buttons."
    )
}

pub fn shutdown() -> String {
    let now = Local::now().format("%d.%m.%Y %H:%M:%S");
    format!("🛑 termgate stopped\n\n⏰ {now}")
}
