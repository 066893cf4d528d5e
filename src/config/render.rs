//! `termgate config` output.

use std::path::Path;

use anyhow::{Context, Result};

use super::BridgeConfig;

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(defaults, no .termgate/config.toml found)".to_string())
}

/// Keep just enough of the token to recognise which bot it belongs to.
pub fn mask_token(token: Option<&str>) -> String {
    match token.map(str::trim).filter(|t| !t.is_empty()) {
        None => "(not set)".to_string(),
        Some(token) => {
            let visible: String = token.chars().take(4).collect();
            if token.chars().count() <= 8 {
                "****".to_string()
            } else {
                format!("{visible}****")
            }
        }
    }
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<24} {value}\n"));
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

pub fn render_config_human(config: &BridgeConfig, config_path: Option<&Path>) -> String {
    let mut output = String::new();
    output.push_str("Telegram\n");
    push_kv(&mut output, "bot_token", mask_token(config.telegram.bot_token.as_deref()));
    push_kv(&mut output, "allowed_chat_id", config.telegram.allowed_chat_id);
    push_kv(&mut output, "api_base", &config.telegram.api_base);
    push_kv(&mut output, "poll_timeout", format!("{}s", config.telegram.poll_timeout_secs));
    push_kv(
        &mut output,
        "retry",
        format!(
            "max {} base {}s cap {}s",
            config.telegram.retry_max,
            config.telegram.retry_base_delay_secs,
            config.telegram.retry_max_delay_secs
        ),
    );
    output.push('\n');

    output.push_str("Tmux\n");
    push_kv(&mut output, "session", &config.tmux.session);
    push_kv(&mut output, "log_file", config.tmux.log_file());
    push_kv(&mut output, "command_timeout", format!("{}s", config.tmux.command_timeout_secs));
    push_kv(&mut output, "status_timeout", format!("{}s", config.tmux.status_timeout_secs));
    push_kv(&mut output, "tail_lines", config.tmux.tail_lines);
    push_kv(&mut output, "screenshot_lines", config.tmux.screenshot_lines);
    output.push('\n');

    output.push_str("Security\n");
    push_kv(&mut output, "max_command_length", config.security.max_command_length);
    push_kv(&mut output, "spam_protection", format!("{}s", config.security.spam_protection_secs));
    push_kv(&mut output, "confirmation_ttl", format!("{}s", config.security.confirmation_ttl_secs));
    push_kv(&mut output, "deny", list_or_none(&config.security.deny));
    push_kv(&mut output, "system", list_or_none(&config.security.system));
    push_kv(&mut output, "suspicious", list_or_none(&config.security.suspicious));
    output.push('\n');

    output.push_str("Output\n");
    push_kv(&mut output, "max_message_length", config.output.max_message_length);
    output.push('\n');

    output.push_str("Paths\n");
    push_kv(&mut output, "env_file", &config.paths.env_file);
    push_kv(&mut output, "state_file", &config.paths.state_file);
    push_kv(&mut output, "audit_log", &config.paths.audit_log);
    push_kv(&mut output, "telemetry_db", &config.paths.telemetry_db);
    push_kv(&mut output, "telemetry_enabled", config.paths.telemetry_enabled);
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

pub fn render_config_json(config: &BridgeConfig, config_path: Option<&Path>) -> Result<String> {
    let payload = serde_json::json!({
        "telegram": {
            "bot_token": mask_token(config.telegram.bot_token.as_deref()),
            "allowed_chat_id": config.telegram.allowed_chat_id,
            "api_base": &config.telegram.api_base,
            "poll_timeout_secs": config.telegram.poll_timeout_secs,
            "connect_timeout_secs": config.telegram.connect_timeout_secs,
            "read_timeout_secs": config.telegram.read_timeout_secs,
            "retry_max": config.telegram.retry_max,
            "retry_base_delay_secs": config.telegram.retry_base_delay_secs,
            "retry_max_delay_secs": config.telegram.retry_max_delay_secs
        },
        "tmux": {
            "session": &config.tmux.session,
            "log_file": config.tmux.log_file(),
            "command_timeout_secs": config.tmux.command_timeout_secs,
            "status_timeout_secs": config.tmux.status_timeout_secs,
            "tail_lines": config.tmux.tail_lines,
            "screenshot_lines": config.tmux.screenshot_lines
        },
        "security": {
            "max_command_length": config.security.max_command_length,
            "spam_protection_secs": config.security.spam_protection_secs,
            "confirmation_ttl_secs": config.security.confirmation_ttl_secs,
            "deny": &config.security.deny,
            "system": &config.security.system,
            "suspicious": &config.security.suspicious
        },
        "output": {
            "max_message_length": config.output.max_message_length
        },
        "paths": {
            "env_file": &config.paths.env_file,
            "state_file": &config.paths.state_file,
            "audit_log": &config.paths.audit_log,
            "telemetry_db": &config.paths.telemetry_db,
            "telemetry_enabled": config.paths.telemetry_enabled
        },
        "source_path": config_source_label(config_path)
    });

    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}
