use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub mod env_file;
pub mod render;

const CONFIG_FILENAME: &str = "config.toml";
const CONFIG_DIR: &str = ".termgate";

fn default_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_poll_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    20
}

fn default_read_timeout_secs() -> u64 {
    30
}

fn default_retry_max() -> i64 {
    10
}

fn default_retry_base_delay_secs() -> u64 {
    5
}

fn default_retry_max_delay_secs() -> u64 {
    60
}

fn default_session() -> String {
    "claude".to_string()
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_status_timeout_secs() -> u64 {
    10
}

fn default_tail_lines() -> usize {
    50
}

fn default_screenshot_lines() -> usize {
    50
}

fn default_max_command_length() -> usize {
    500
}

fn default_spam_protection_secs() -> u64 {
    5
}

fn default_confirmation_ttl_secs() -> u64 {
    300
}

fn default_deny() -> Vec<String> {
    [
        "rm -rf",
        "sudo rm",
        "chmod 777",
        "mkfs",
        "dd if=",
        ":(){ :|:& };:",
        "sudo chmod",
        "sudo chown",
        "format",
        "fdisk",
        "cfdisk",
        "parted",
        "wipefs",
        "shred",
        "wget ",
        "curl ",
        "| bash",
        "| sh",
        "> /dev/",
        "echo > ",
        "cat > /",
        "nc -",
        "netcat",
        ">/dev/tcp",
        "> /etc/",
        "> /usr/",
        "> /bin/",
        "> /sbin/",
        "> /var/log/",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_system() -> Vec<String> {
    [
        "sudo",
        "su",
        "passwd",
        "usermod",
        "userdel",
        "groupdel",
        "systemctl",
        "service",
        "reboot",
        "shutdown",
        "halt",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_suspicious() -> Vec<String> {
    [
        r">\s*/dev/null\s*2>&1\s*&",
        r"nohup\s+.*\s*&",
        r"while\s+true\s*;",
        r"fork\(\)",
        r":\(\)\{.*\}\s*;",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_max_message_length() -> usize {
    crate::sanitize::DEFAULT_MAX_LENGTH
}

fn default_telemetry_enabled() -> bool {
    true
}

fn default_env_file() -> String {
    ".env".to_string()
}

fn default_state_file() -> String {
    "data/state.json".to_string()
}

fn default_audit_log() -> String {
    "logs/audit.jsonl".to_string()
}

fn default_telemetry_db() -> String {
    "logs/telemetry.db".to_string()
}

/// Telegram Bot API settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    /// The only chat allowed to drive the bridge. `0` means unset.
    #[serde(default)]
    pub allowed_chat_id: i64,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Startup attempts on network failure; zero or less retries forever.
    #[serde(default = "default_retry_max")]
    pub retry_max: i64,
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,
    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            allowed_chat_id: 0,
            api_base: default_api_base(),
            poll_timeout_secs: default_poll_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            retry_max: default_retry_max(),
            retry_base_delay_secs: default_retry_base_delay_secs(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
        }
    }
}

/// tmux target and timing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TmuxConfig {
    /// Session commands are routed to at boot.
    #[serde(default = "default_session")]
    pub session: String,
    /// Terminal log read by `/tail`. Derived from the session name when unset.
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_status_timeout_secs")]
    pub status_timeout_secs: u64,
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
    #[serde(default = "default_screenshot_lines")]
    pub screenshot_lines: usize,
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            session: default_session(),
            log_file: None,
            command_timeout_secs: default_command_timeout_secs(),
            status_timeout_secs: default_status_timeout_secs(),
            tail_lines: default_tail_lines(),
            screenshot_lines: default_screenshot_lines(),
        }
    }
}

impl TmuxConfig {
    pub fn log_file(&self) -> String {
        self.log_file
            .clone()
            .unwrap_or_else(|| env_file::default_log_path(&self.session))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_secs)
    }
}

/// Command policy rule sets.
///
/// ```toml
/// [security]
/// max_command_length = 500
/// deny = ["rm -rf", "mkfs"]
/// system = ["sudo", "systemctl"]
/// suspicious = ['nohup\s+.*\s*&']
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_max_command_length")]
    pub max_command_length: usize,
    /// Identical commands from one operator inside this window are dropped.
    #[serde(default = "default_spam_protection_secs")]
    pub spam_protection_secs: u64,
    /// Pending confirmations older than this are treated as absent.
    #[serde(default = "default_confirmation_ttl_secs")]
    pub confirmation_ttl_secs: u64,
    #[serde(default = "default_deny")]
    pub deny: Vec<String>,
    #[serde(default = "default_system")]
    pub system: Vec<String>,
    #[serde(default = "default_suspicious")]
    pub suspicious: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_command_length: default_max_command_length(),
            spam_protection_secs: default_spam_protection_secs(),
            confirmation_ttl_secs: default_confirmation_ttl_secs(),
            deny: default_deny(),
            system: default_system(),
            suspicious: default_suspicious(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_message_length: default_max_message_length(),
        }
    }
}

/// Files owned by the bridge, relative to the project root.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_env_file")]
    pub env_file: String,
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default = "default_audit_log")]
    pub audit_log: String,
    #[serde(default = "default_telemetry_db")]
    pub telemetry_db: String,
    #[serde(default = "default_telemetry_enabled")]
    pub telemetry_enabled: bool,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            env_file: default_env_file(),
            state_file: default_state_file(),
            audit_log: default_audit_log(),
            telemetry_db: default_telemetry_db(),
            telemetry_enabled: default_telemetry_enabled(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub tmux: TmuxConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub root: PathBuf,
}

impl BridgeConfig {
    /// Search upward from `start` for `.termgate/config.toml`, load it, then
    /// overlay the `.env` file and process environment.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        let (mut config, path) = match Self::find_config_file(start) {
            Some(path) => {
                let contents = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let mut config: BridgeConfig = toml::from_str(&contents)
                    .with_context(|| format!("failed to parse {}", path.display()))?;
                config.root = path
                    .parent()
                    .and_then(Path::parent)
                    .unwrap_or(start)
                    .to_path_buf();
                (config, Some(path))
            }
            None => {
                let config = BridgeConfig {
                    root: start.to_path_buf(),
                    ..BridgeConfig::default()
                };
                (config, None)
            }
        };

        let env_path = config.resolve(&config.paths.env_file);
        let from_file = read_env_file(&env_path)?;
        config.apply_env(|key| std::env::var(key).ok().or_else(|| from_file.get(key).cloned()));

        Ok((config, path))
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }

    /// Apply `KEY=value` overrides (the `.env` convention) on top of TOML.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("BOT_TOKEN").filter(|t| !t.trim().is_empty()) {
            self.telegram.bot_token = Some(token.trim().to_string());
        }
        if let Some(id) = parse_override(&lookup, "ALLOWED_CHAT_ID") {
            self.telegram.allowed_chat_id = id;
        }
        if let Some(session) = lookup("TMUX_SESSION").filter(|s| !s.trim().is_empty()) {
            self.tmux.session = session.trim().to_string();
        }
        if let Some(log_file) = lookup("LOG_FILE").filter(|s| !s.trim().is_empty()) {
            self.tmux.log_file = Some(log_file.trim().to_string());
        }
        if let Some(secs) = parse_override(&lookup, "COMMAND_TIMEOUT") {
            self.tmux.command_timeout_secs = secs;
        }
        if let Some(lines) = parse_override(&lookup, "TAIL_LINES") {
            self.tmux.tail_lines = lines;
        }
        if let Some(secs) = parse_override(&lookup, "SPAM_PROTECTION_SECONDS") {
            self.security.spam_protection_secs = secs;
        }
        if let Some(len) = parse_override(&lookup, "MAX_COMMAND_LENGTH") {
            self.security.max_command_length = len;
        }
    }

    /// Resolve a configured path against the project root.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        let path = Path::new(relative);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Check the settings the Telegram transport cannot run without.
    pub fn validate(&self) -> Result<()> {
        if self
            .telegram
            .bot_token
            .as_deref()
            .is_none_or(|t| t.trim().is_empty())
        {
            bail!("BOT_TOKEN is not set (use .env or [telegram].bot_token)");
        }
        if self.telegram.allowed_chat_id == 0 {
            bail!("ALLOWED_CHAT_ID is not set (use .env or [telegram].allowed_chat_id)");
        }
        Ok(())
    }
}

fn parse_override<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key = key, value = %raw, "ignoring invalid numeric override");
            None
        }
    }
}

fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    if !path.is_file() {
        return Ok(HashMap::new());
    }
    let mut values = HashMap::new();
    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    for item in iter {
        let (key, value) = item.with_context(|| format!("failed to parse {}", path.display()))?;
        values.insert(key, value);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_config_values() {
        let config = BridgeConfig::default();
        assert_eq!(config.tmux.session, "claude");
        assert_eq!(config.tmux.log_file(), "logs/claude_terminal.log");
        assert_eq!(config.tmux.command_timeout_secs, 30);
        assert_eq!(config.tmux.status_timeout_secs, 10);
        assert_eq!(config.tmux.tail_lines, 50);
        assert_eq!(config.security.max_command_length, 500);
        assert_eq!(config.security.spam_protection_secs, 5);
        assert_eq!(config.security.confirmation_ttl_secs, 300);
        assert!(config.security.deny.iter().any(|p| p == "rm -rf"));
        assert_eq!(config.security.system.first().map(String::as_str), Some("sudo"));
        assert_eq!(config.security.suspicious.len(), 5);
        assert_eq!(config.output.max_message_length, 3500);
        assert_eq!(config.paths.state_file, "data/state.json");
        assert_eq!(config.telegram.allowed_chat_id, 0);
        assert!(config.telegram.bot_token.is_none());
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
[tmux]
session = "work"
command_timeout_secs = 12

[security]
deny = ["rm -rf"]
"#;
        let config: BridgeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.tmux.session, "work");
        assert_eq!(config.tmux.log_file(), "logs/work_terminal.log");
        assert_eq!(config.tmux.command_timeout(), Duration::from_secs(12));
        assert_eq!(config.security.deny, vec!["rm -rf"]);
        assert_eq!(config.security.system.len(), 11);
        assert_eq!(config.telegram.poll_timeout_secs, 30);
    }

    #[test]
    fn env_overrides_toml_values() {
        let mut config = BridgeConfig::default();
        config.apply_env(lookup_from(&[
            ("BOT_TOKEN", "123:abc"),
            ("ALLOWED_CHAT_ID", "42"),
            ("TMUX_SESSION", "ops"),
            ("COMMAND_TIMEOUT", "7"),
            ("MAX_COMMAND_LENGTH", "64"),
        ]));
        assert_eq!(config.telegram.bot_token.as_deref(), Some("123:abc"));
        assert_eq!(config.telegram.allowed_chat_id, 42);
        assert_eq!(config.tmux.session, "ops");
        assert_eq!(config.tmux.log_file(), "logs/ops_terminal.log");
        assert_eq!(config.tmux.command_timeout_secs, 7);
        assert_eq!(config.security.max_command_length, 64);
    }

    #[test]
    fn invalid_numeric_override_is_ignored() {
        let mut config = BridgeConfig::default();
        config.apply_env(lookup_from(&[("ALLOWED_CHAT_ID", "not-a-number")]));
        assert_eq!(config.telegram.allowed_chat_id, 0);
    }

    #[test]
    fn validate_requires_token_and_chat() {
        let mut config = BridgeConfig::default();
        assert!(config.validate().is_err());
        config.telegram.bot_token = Some("t".to_string());
        assert!(config.validate().unwrap_err().to_string().contains("ALLOWED_CHAT_ID"));
        config.telegram.allowed_chat_id = 7;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_returns_default_when_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let (config, path) = BridgeConfig::load(tmp.path()).unwrap();
        assert!(path.is_none());
        assert_eq!(config.root, tmp.path());
    }

    #[test]
    fn load_walks_up_and_reads_env_file() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(CONFIG_DIR);
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join(CONFIG_FILENAME),
            "[tmux]\nsession = \"from-toml\"\n[paths]\nenv_file = \"bridge.env\"\n",
        )
        .unwrap();
        fs::write(
            tmp.path().join("bridge.env"),
            "TERMGATE_TEST_UNUSED=1\nLOG_FILE=/var/tmp/custom.log\n",
        )
        .unwrap();

        let nested = tmp.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();

        let (config, path) = BridgeConfig::load(&nested).unwrap();
        assert!(path.is_some());
        assert_eq!(config.root, tmp.path());
        assert_eq!(config.tmux.log_file(), "/var/tmp/custom.log");
        assert_eq!(config.resolve("data/state.json"), tmp.path().join("data/state.json"));
        assert_eq!(config.resolve("/abs/file"), PathBuf::from("/abs/file"));
    }
}
