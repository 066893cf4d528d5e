//! Telegram event loop and command routing.
//!
//! [`run`] owns the process lifetime: it connects to the Bot API, resolves the
//! active tmux session, then long-polls for updates until Ctrl-C. Every update
//! is handled on its own worker thread so tmux calls never stall polling.
//! [`App::route`] maps one operator message to reply texts and is what the
//! tests drive.

pub mod render;

use std::sync::{Arc, mpsc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, warn};

use crate::bridge::{BridgeSettings, CommandBridge, Outcome, failure_reply};
use crate::config::{BridgeConfig, SecurityConfig, TelegramConfig};
use crate::confirm::OperatorId;
use crate::log::{AuditEvent, AuditLog};
use crate::policy::PatternPolicy;
use crate::session::store::PointerStore;
use crate::session::{KillOutcome, SessionRegistry};
use crate::config::env_file::PointerRecord;
use crate::telegram::{Keyboard, TelegramClient, Update};
use crate::telemetry::{OutcomeSink, TelemetryStore};
use crate::tmux::{Multiplexer, Tmux, control_key};

const MAX_TAIL_LINES: usize = 100;
const STOP_POLL: Duration = Duration::from_millis(200);

type Probe = Box<dyn Fn() -> Result<String> + Send + Sync>;

/// One outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub keyboard: Keyboard,
}

impl Reply {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            keyboard: Keyboard::None,
        }
    }

    fn with_keyboard(text: impl Into<String>, keyboard: Keyboard) -> Self {
        Self {
            text: text.into(),
            keyboard,
        }
    }
}

/// Exponential backoff for Bot API failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Zero or less means retry forever.
    pub max_attempts: i64,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &TelegramConfig) -> Self {
        Self {
            max_attempts: config.retry_max,
            base: Duration::from_secs(config.retry_base_delay_secs),
            cap: Duration::from_secs(config.retry_max_delay_secs),
        }
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts > 0 && i64::from(failures) >= self.max_attempts
    }

    /// Call `op` until it succeeds, the attempts run out or `stop` is set.
    pub fn run<T>(&self, what: &str, stop: &AtomicBool, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut failures = 0u32;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(error) => {
                    failures += 1;
                    if self.exhausted(failures) {
                        return Err(error.context(format!("{what} failed after {failures} attempts")));
                    }
                    let delay = self.delay(failures - 1);
                    warn!(what, failures, delay_secs = delay.as_secs(), error = %error, "retrying");
                    if !sleep_unless_stopped(delay, stop) {
                        bail!("interrupted while retrying {what}");
                    }
                }
            }
        }
    }
}

/// Sleep for `duration` in short slices; false if `stop` was raised.
fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(STOP_POLL.min(deadline - now));
    }
}

pub struct App<M: Multiplexer> {
    bridge: CommandBridge<M>,
    telemetry: Option<Arc<TelemetryStore>>,
    audit: Option<Arc<AuditLog>>,
    security: SecurityConfig,
    tail_lines: usize,
    started: Instant,
    probe: Option<Probe>,
}

impl App<Tmux> {
    /// Wire the real tmux, policy, stores and sinks from configuration.
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        let tmux = Tmux::new(config.tmux.status_timeout(), config.tmux.command_timeout());
        let store = PointerStore::new(
            config.resolve(&config.paths.env_file),
            config.resolve(&config.paths.state_file),
        );
        let registry = SessionRegistry::new(
            Arc::new(tmux),
            store,
            config.root.clone(),
            PointerRecord {
                session: config.tmux.session.clone(),
                log_file: config.tmux.log_file(),
            },
        );
        let policy = PatternPolicy::from_config(&config.security)?;
        let mut bridge =
            CommandBridge::new(Box::new(policy), registry, BridgeSettings::from_config(config));

        let audit = match AuditLog::new(&config.resolve(&config.paths.audit_log)) {
            Ok(audit) => Some(Arc::new(audit)),
            Err(error) => {
                warn!(error = %error, "audit log disabled");
                None
            }
        };
        if let Some(audit) = &audit {
            bridge = bridge.with_audit(Arc::clone(audit));
        }

        let telemetry = if config.paths.telemetry_enabled {
            match TelemetryStore::open(&config.resolve(&config.paths.telemetry_db)) {
                Ok(store) => Some(Arc::new(store)),
                Err(error) => {
                    warn!(error = %error, "telemetry disabled");
                    None
                }
            }
        } else {
            None
        };

        let mut app = App::new(bridge, config.security.clone(), config.tmux.tail_lines);
        if let Some(store) = telemetry {
            app = app.with_telemetry(store);
        }
        if let Some(audit) = audit {
            app.audit = Some(audit);
        }
        Ok(app)
    }
}

impl<M: Multiplexer> App<M> {
    pub fn new(bridge: CommandBridge<M>, security: SecurityConfig, tail_lines: usize) -> Self {
        Self {
            bridge,
            telemetry: None,
            audit: None,
            security,
            tail_lines,
            started: Instant::now(),
            probe: None,
        }
    }

    /// Attach the telemetry store as both outcome sink and query backend.
    pub fn with_telemetry(mut self, store: Arc<TelemetryStore>) -> Self {
        let sink: Arc<dyn OutcomeSink> = store.clone();
        self.bridge = self.bridge.with_sink(sink);
        self.telemetry = Some(store);
        self
    }

    /// Reachability check reported by `/health`.
    pub fn with_probe(mut self, probe: impl Fn() -> Result<String> + Send + Sync + 'static) -> Self {
        self.probe = Some(Box::new(probe));
        self
    }

    pub fn bridge(&self) -> &CommandBridge<M> {
        &self.bridge
    }

    pub fn audit(&self, event: AuditEvent) {
        if let Some(audit) = &self.audit {
            audit.record(event);
        }
    }

    /// Replies for one text message from an authorized operator.
    pub fn route(&self, operator: OperatorId, text: &str) -> Vec<Reply> {
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }
        if let Some(target) = button_target(text) {
            if target.starts_with('/') {
                return self.route_command(operator, target);
            }
            if control_key(target).is_some() {
                return outcome(self.bridge.send_control(operator, target));
            }
            return vec![Reply::plain("⚠️ Unknown command")];
        }
        if text.starts_with('/') {
            return self.route_command(operator, text);
        }
        outcome(self.bridge.process_command(operator, text))
    }

    /// Replies for an inline-keyboard press.
    pub fn route_callback(&self, operator: OperatorId, data: &str) -> Vec<Reply> {
        match data {
            "show_commands" => vec![Reply::plain(render::help())],
            "show_stats" => vec![self.stats(operator)],
            "show_security" => vec![Reply::plain(render::security(
                &self.security,
                self.bridge.settings().confirmation_ttl,
            ))],
            "kill_process" => outcome(self.bridge.interrupt(operator)),
            other => {
                debug!(data = other, "unknown callback");
                vec![Reply::plain("⚠️ Unknown command")]
            }
        }
    }

    fn route_command(&self, operator: OperatorId, text: &str) -> Vec<Reply> {
        let Some((name, args)) = split_command(text) else {
            return Vec::new();
        };
        match name {
            "start" => vec![
                Reply::with_keyboard(
                    render::welcome(self.bridge.sessions().ensure_active().as_deref()),
                    Keyboard::QuickButtons,
                ),
                Reply::with_keyboard("🔧 More actions:", Keyboard::Inline),
            ],
            "send" if args.is_empty() => vec![Reply::plain("⚠️ Usage: /send <command>")],
            "send" => outcome(self.bridge.process_command(operator, args)),
            "confirm" if args.is_empty() => vec![Reply::plain(match self.bridge.ledger().pending(operator) {
                Some(command) => format!("⏳ Waiting for confirmation: {command}\nSend /confirm {command} to run it"),
                None => "⚠️ Usage: /confirm <command>".to_string(),
            })],
            "confirm" => outcome(self.bridge.confirm(operator, args)),
            "tail" => vec![self.tail(args)],
            "screenshot" => vec![Reply::plain(match self.bridge.screenshot() {
                Ok(capture) => render::capture("🔍 Screen", &capture),
                Err(error) => failure_reply(&error),
            })],
            "kill" => outcome(self.bridge.interrupt(operator)),
            "status" => vec![self.status()],
            "stats" => vec![self.stats(operator)],
            "history" if args == "clear" => vec![self.clear_history(operator)],
            "history" => vec![self.history(operator, None)],
            "search" if args.is_empty() => vec![Reply::plain("⚠️ Usage: /search <text>")],
            "search" => vec![self.history(operator, Some(args))],
            "session" => vec![self.session(operator, args)],
            "health" => vec![self.health()],
            "buttons" | "help" => vec![Reply::with_keyboard(render::help(), Keyboard::Inline)],
            other => vec![Reply::plain(format!(
                "⚠️ Unknown command: /{other}\nUse /buttons for the list"
            ))],
        }
    }

    fn tail(&self, args: &str) -> Reply {
        let lines = if args.is_empty() {
            self.tail_lines
        } else {
            match args.parse::<usize>() {
                Ok(n) => n,
                Err(_) => return Reply::plain("⚠️ Usage: /tail [lines]"),
            }
        };
        let lines = lines.clamp(1, MAX_TAIL_LINES);
        Reply::plain(match self.bridge.tail(lines) {
            Ok(capture) => render::capture("📄 Terminal output", &capture),
            Err(error) => failure_reply(&error),
        })
    }

    fn summary(&self) -> Option<crate::telemetry::Summary> {
        let store = self.telemetry.as_ref()?;
        match store.summary() {
            Ok(summary) => Some(summary),
            Err(error) => {
                warn!(error = %error, "failed to read telemetry summary");
                None
            }
        }
    }

    fn status(&self) -> Reply {
        let report = self.bridge.status();
        Reply::plain(render::status(
            &report,
            self.summary().as_ref(),
            self.started.elapsed(),
        ))
    }

    fn stats(&self, operator: OperatorId) -> Reply {
        let Some(store) = &self.telemetry else {
            return Reply::plain("📊 Statistics are disabled");
        };
        let result = store
            .operator_stats(operator)
            .and_then(|stats| Ok((stats, store.summary()?)));
        Reply::plain(match result {
            Ok((stats, summary)) => render::stats(&stats, &summary),
            Err(error) => format!("❌ failed to read statistics: {error}"),
        })
    }

    fn history(&self, operator: OperatorId, query: Option<&str>) -> Reply {
        let Some(store) = &self.telemetry else {
            return Reply::plain("📜 History is disabled");
        };
        let result = match query {
            Some(query) => store.search(query, Some(operator), render::HISTORY_PAGE),
            None => store.recent(Some(operator), render::HISTORY_PAGE),
        };
        Reply::plain(match result {
            Err(error) => format!("❌ failed to read history: {error}"),
            Ok(records) if records.is_empty() => match query {
                Some(query) => format!("🔍 Nothing found for: {query}"),
                None => "📜 History is empty".to_string(),
            },
            Ok(records) => match query {
                Some(query) => render::history(&format!("🔍 Results for: {query}"), &records),
                None => render::history("📜 Recent commands", &records),
            },
        })
    }

    fn clear_history(&self, operator: OperatorId) -> Reply {
        let Some(store) = &self.telemetry else {
            return Reply::plain("📜 History is disabled");
        };
        Reply::plain(match store.clear(Some(operator)) {
            Ok(removed) => format!("🧹 History cleared ({removed} entries)"),
            Err(error) => format!("❌ failed to clear history: {error}"),
        })
    }

    fn session(&self, operator: OperatorId, args: &str) -> Reply {
        let parts: Vec<&str> = args.split_whitespace().collect();
        let text = match parts.as_slice() {
            [] | ["list"] => match self.bridge.list_sessions() {
                Ok(names) => render::sessions(&names, &self.bridge.sessions().active_name()),
                Err(error) => failure_reply(&error),
            },
            ["current"] => {
                let name = self.bridge.sessions().active_name();
                let running = self
                    .bridge
                    .list_sessions()
                    .map(|names| names.contains(&name))
                    .unwrap_or(false);
                if running {
                    format!("🧭 Active session: {name}")
                } else {
                    format!("🧭 Active session: {name} (not running)")
                }
            }
            ["new", name] => match self.bridge.create_session(operator, name) {
                Ok(()) => format!("✅ Session {name} created and active"),
                Err(error) => failure_reply(&error),
            },
            ["switch", name] => match self.bridge.switch_session(operator, name) {
                Ok(()) => format!("🔀 Switched to session {name}"),
                Err(error) => failure_reply(&error),
            },
            ["kill", name] => match self.bridge.kill_session(operator, name) {
                Ok(KillOutcome::Killed) => format!("🗑️ Session {name} killed"),
                Ok(KillOutcome::Switched(next)) => {
                    format!("🗑️ Session {name} killed\n🔀 Active session is now {next}")
                }
                Ok(KillOutcome::NoSessionsLeft) => format!(
                    "🗑️ Session {name} killed\n⚠️ No sessions left; one is created on the next command"
                ),
                Err(error) => failure_reply(&error),
            },
            ["rename", old, new] => match self.bridge.rename_session(operator, old, new) {
                Ok(()) => format!("✏️ Session {old} renamed to {new}"),
                Err(error) => failure_reply(&error),
            },
            _ => "⚠️ Usage: /session [list|current|new <name>|switch <name>|kill <name>|rename <old> <new>]"
                .to_string(),
        };
        Reply::plain(text)
    }

    fn health(&self) -> Reply {
        let report = self.bridge.health();
        let telegram = self
            .probe
            .as_ref()
            .map(|probe| probe().map_err(|e| format!("{e:#}")));
        Reply::plain(render::health(
            &report,
            telegram.as_ref(),
            self.telemetry.is_some(),
        ))
    }
}

fn outcome(outcome: Outcome) -> Vec<Reply> {
    outcome.reply().map(Reply::plain).into_iter().collect()
}

/// `/tail@my_bot 20` -> `("tail", "20")`
fn split_command(text: &str) -> Option<(&str, &str)> {
    let rest = text.strip_prefix('/')?;
    let (head, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    let name = head.split('@').next().unwrap_or(head);
    Some((name, args.trim()))
}

/// Quick-button labels are an emoji followed by the action: `📄 /tail`,
/// `↩️ Enter`.
fn button_target(text: &str) -> Option<&str> {
    let (prefix, rest) = text.split_once(' ')?;
    if prefix.chars().all(|c| !c.is_ascii() && !c.is_alphanumeric()) {
        Some(rest.trim())
    } else {
        None
    }
}

/// Run the bridge until Ctrl-C.
pub fn run(config: BridgeConfig) -> Result<()> {
    config.validate()?;

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("failed to install Ctrl-C handler")?;
    }

    let retry = RetryPolicy::from_config(&config.telegram);
    let client = Arc::new(TelegramClient::new(&config.telegram)?);
    let me = retry.run("getMe", &stop, || client.get_me())?;
    info!(bot = me.username.as_deref().unwrap_or(&me.first_name), "connected to telegram");

    let probe_client = Arc::clone(&client);
    let app = Arc::new(App::from_config(&config)?.with_probe(move || {
        let me = probe_client.get_me()?;
        Ok(me.username.unwrap_or(me.first_name))
    }));

    let session = app.bridge().sessions().ensure_active();
    match &session {
        Some(name) => info!(session = %name, "active tmux session"),
        None => warn!("no tmux session available; commands will fail until one exists"),
    }

    if let Err(error) = retry.run("setMyCommands", &stop, || client.set_my_commands()) {
        warn!(error = %error, "failed to register bot commands");
    }

    let chat_id = config.telegram.allowed_chat_id;
    app.audit(AuditEvent::BridgeStarted {
        session: session.clone().unwrap_or_default(),
    });
    client.notify(chat_id, &render::startup(session.as_deref()));
    info!(chat_id, "bridge started");

    let result = poll(&app, &client, chat_id, &retry, &stop);

    let reason = match &result {
        Ok(()) => "shutdown requested".to_string(),
        Err(error) => format!("{error:#}"),
    };
    client.notify(chat_id, &render::shutdown());
    app.audit(AuditEvent::BridgeStopped { reason });
    info!("bridge stopped");
    result
}

fn poll(
    app: &Arc<App<Tmux>>,
    client: &Arc<TelegramClient>,
    allowed_chat: i64,
    retry: &RetryPolicy,
    stop: &AtomicBool,
) -> Result<()> {
    let (updates_tx, worker) = {
        let app = Arc::clone(app);
        let client = Arc::clone(client);
        spawn_worker(move |update: Update| handle_update(&app, &client, allowed_chat, update))?
    };

    let mut offset = None;
    let mut failures = 0u32;
    let result = 'poll: loop {
        if stop.load(Ordering::SeqCst) {
            break Ok(());
        }
        match client.get_updates(offset) {
            Ok(updates) => {
                failures = 0;
                for update in updates {
                    offset = Some(update.update_id + 1);
                    if updates_tx.send(update).is_err() {
                        break 'poll Err(anyhow!("update worker exited"));
                    }
                }
            }
            Err(error) => {
                failures += 1;
                if retry.exhausted(failures) {
                    break Err(error.context("telegram polling failed"));
                }
                let delay = retry.delay(failures - 1);
                warn!(failures, delay_secs = delay.as_secs(), error = %error, "polling failed");
                if !sleep_unless_stopped(delay, stop) {
                    break Ok(());
                }
            }
        }
    };

    drop(updates_tx);
    if worker.join().is_err() {
        warn!("update worker panicked");
    }
    result
}

/// Handle queued items one at a time, in arrival order, off the calling
/// thread. The worker exits once every sender is dropped.
fn spawn_worker<T, F>(handle: F) -> Result<(mpsc::Sender<T>, thread::JoinHandle<()>)>
where
    T: Send + 'static,
    F: Fn(T) + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<T>();
    let worker = thread::Builder::new()
        .name("termgate-updates".to_string())
        .spawn(move || {
            for item in rx {
                handle(item);
            }
        })
        .context("failed to spawn update worker")?;
    Ok((tx, worker))
}

fn handle_update<M: Multiplexer>(app: &App<M>, client: &TelegramClient, allowed_chat: i64, update: Update) {
    let Some(chat_id) = update.chat_id() else {
        debug!(update_id = update.update_id, "ignoring update without chat");
        return;
    };
    if let Some(query) = &update.callback_query
        && let Err(error) = client.answer_callback(&query.id)
    {
        debug!(error = %error, "failed to answer callback");
    }

    if chat_id != allowed_chat {
        let text = update
            .message
            .as_ref()
            .and_then(|m| m.text.clone())
            .or_else(|| update.callback_query.as_ref().and_then(|q| q.data.clone()))
            .unwrap_or_default();
        warn!(chat_id, "unauthorized access attempt");
        app.audit(AuditEvent::UnauthorizedAccess { chat_id, text });
        client.notify(chat_id, "❌ Access denied");
        return;
    }

    let replies = if let Some(message) = &update.message {
        let operator = message.from.as_ref().map_or(chat_id, |u| u.id);
        match message.text.as_deref() {
            Some(text) => app.route(operator, text),
            None => Vec::new(),
        }
    } else if let Some(query) = &update.callback_query {
        app.route_callback(query.from.id, query.data.as_deref().unwrap_or_default())
    } else {
        Vec::new()
    };

    for reply in replies {
        if let Err(error) = client.send_message(chat_id, &reply.text, reply.keyboard) {
            warn!(chat_id, error = %error, "failed to send reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use crate::config::env_file::default_log_path;
    use crate::tmux::fake::FakeMux;

    fn app_with(dir: &Path, mux: FakeMux) -> App<FakeMux> {
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
        let security = SecurityConfig::default();
        let policy = PatternPolicy::from_config(&security).unwrap();
        let settings = BridgeSettings {
            root: dir.to_path_buf(),
            ..BridgeSettings::default()
        };
        let bridge = CommandBridge::new(Box::new(policy), registry, settings);
        App::new(bridge, security, 50)
            .with_telemetry(Arc::new(TelemetryStore::open_in_memory().unwrap()))
    }

    fn texts(replies: Vec<Reply>) -> Vec<String> {
        replies.into_iter().map(|r| r.text).collect()
    }

    fn sent(app: &App<FakeMux>) -> Vec<String> {
        app.bridge().sessions().multiplexer().sent()
    }

    #[test]
    fn split_command_strips_bot_suffix() {
        assert_eq!(split_command("/tail@my_bot 20"), Some(("tail", "20")));
        assert_eq!(split_command("/send  ls -la "), Some(("send", "ls -la")));
        assert_eq!(split_command("/status"), Some(("status", "")));
        assert_eq!(split_command("ls"), None);
    }

    #[test]
    fn button_labels_are_recognised() {
        assert_eq!(button_target("📄 /tail"), Some("/tail"));
        assert_eq!(button_target("↩️ Enter"), Some("Enter"));
        assert_eq!(button_target("ls -la"), None);
        assert_eq!(button_target("привет мир"), None);
    }

    #[test]
    fn retry_delay_doubles_up_to_cap() {
        let retry = RetryPolicy {
            max_attempts: 3,
            base: Duration::from_secs(5),
            cap: Duration::from_secs(60),
        };
        assert_eq!(retry.delay(0), Duration::from_secs(5));
        assert_eq!(retry.delay(1), Duration::from_secs(10));
        assert_eq!(retry.delay(3), Duration::from_secs(40));
        assert_eq!(retry.delay(4), Duration::from_secs(60));
        assert_eq!(retry.delay(40), Duration::from_secs(60));
        assert!(!retry.exhausted(2));
        assert!(retry.exhausted(3));

        let forever = RetryPolicy {
            max_attempts: 0,
            ..retry
        };
        assert!(!forever.exhausted(1_000));
    }

    #[test]
    fn retry_gives_up_after_max_attempts() {
        let retry = RetryPolicy {
            max_attempts: 3,
            base: Duration::ZERO,
            cap: Duration::ZERO,
        };
        let stop = AtomicBool::new(false);
        let mut calls = 0;
        let result: Result<()> = retry.run("probe", &stop, || {
            calls += 1;
            bail!("network down")
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);

        let mut calls = 0;
        let value = retry
            .run("probe", &stop, || {
                calls += 1;
                if calls < 2 { bail!("flaky") } else { Ok(7) }
            })
            .unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn retry_stops_when_flag_is_set() {
        let retry = RetryPolicy {
            max_attempts: 0,
            base: Duration::from_secs(60),
            cap: Duration::from_secs(60),
        };
        let stop = AtomicBool::new(true);
        let result: Result<()> = retry.run("probe", &stop, || bail!("down"));
        assert!(result.unwrap_err().to_string().contains("interrupted"));
    }

    #[test]
    fn free_text_goes_through_policy() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app_with(tmp.path(), FakeMux::with_sessions(&["claude"]));

        assert_eq!(texts(app.route(1, "ls")), vec!["✅ Command sent: `ls`"]);
        // Repeat within the window is silent.
        assert!(app.route(1, "ls").is_empty());
        let blocked = texts(app.route(1, "rm -rf /"));
        assert!(blocked[0].starts_with("🛡️ Command blocked"));
        assert_eq!(sent(&app), vec!["literal:ls", "key:C-m"]);
    }

    #[test]
    fn send_and_confirm_flow() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app_with(tmp.path(), FakeMux::with_sessions(&["claude"]));

        assert_eq!(texts(app.route(1, "/send")), vec!["⚠️ Usage: /send <command>"]);
        let staged = texts(app.route(1, "/send sudo reboot"));
        assert!(staged[0].contains("requires confirmation"));
        let pending = texts(app.route(1, "/confirm"));
        assert!(pending[0].contains("Waiting for confirmation: sudo reboot"));
        assert_eq!(
            texts(app.route(1, "/confirm sudo shutdown")),
            vec!["❌ Command is not pending confirmation"]
        );
        assert!(sent(&app).is_empty());

        assert_eq!(
            texts(app.route(1, "/confirm sudo reboot")),
            vec!["✅ Command sent: `sudo reboot`"]
        );
        assert_eq!(sent(&app), vec!["literal:sudo reboot", "key:C-m"]);
    }

    #[test]
    fn quick_buttons_route_to_commands_and_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app_with(tmp.path(), FakeMux::with_sessions(&["claude"]));

        app.route(1, "↩️ Enter");
        app.route(1, "⬇️ Down");
        app.route(1, "↩️ Enter");
        assert_eq!(sent(&app), vec!["key:C-m", "key:Down", "key:C-m"]);

        let status = texts(app.route(1, "🔄 /status"));
        assert!(status[0].starts_with("🔄 Status"));
        assert_eq!(texts(app.route(1, "🤷 Dance")), vec!["⚠️ Unknown command"]);
    }

    #[test]
    fn start_sends_both_keyboards() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app_with(tmp.path(), FakeMux::with_sessions(&["claude"]));
        let replies = app.route(1, "/start");
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].keyboard, Keyboard::QuickButtons);
        assert!(replies[0].text.contains("claude"));
        assert_eq!(replies[1].keyboard, Keyboard::Inline);
    }

    #[test]
    fn tail_clamps_and_validates() {
        let tmp = tempfile::tempdir().unwrap();
        let mux = FakeMux::with_sessions(&["claude"]);
        *mux.pane.lock().unwrap() = (0..150).map(|i| format!("row {i}\n")).collect();
        let app = app_with(tmp.path(), mux);

        let text = texts(app.route(1, "/tail 500")).remove(0);
        assert!(text.starts_with("📄 Terminal output (100 lines from pane, clipped)"));
        let text = texts(app.route(1, "/tail 0")).remove(0);
        assert!(text.contains("(1 lines from pane"));
        assert!(text.ends_with("row 149"));
        assert_eq!(texts(app.route(1, "/tail lots")), vec!["⚠️ Usage: /tail [lines]"]);
    }

    #[test]
    fn history_stats_and_search_use_telemetry() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app_with(tmp.path(), FakeMux::with_sessions(&["claude"]));

        assert_eq!(texts(app.route(1, "/history")), vec!["📜 History is empty"]);
        app.route(1, "git status");
        app.route(1, "cargo build");
        app.route(2, "git log");

        let history = texts(app.route(1, "/history")).remove(0);
        assert!(history.starts_with("📜 Recent commands"));
        assert!(history.contains("cargo build"));
        assert!(history.contains("git status"));
        assert!(!history.contains("git log"));

        let found = texts(app.route(1, "/search GIT")).remove(0);
        assert!(found.starts_with("🔍 Results for: GIT"));
        assert!(found.contains("git status"));
        assert!(!found.contains("cargo"));
        assert_eq!(
            texts(app.route(1, "/search nothing")),
            vec!["🔍 Nothing found for: nothing"]
        );

        let stats = texts(app.route(1, "/stats")).remove(0);
        assert!(stats.contains("Commands: 2"));
        assert!(stats.contains("Active operators: 2"));

        assert_eq!(
            texts(app.route(1, "/history clear")),
            vec!["🧹 History cleared (2 entries)"]
        );
        assert_eq!(texts(app.route(1, "/history")), vec!["📜 History is empty"]);
        assert!(texts(app.route(2, "/history"))[0].contains("git log"));
    }

    #[test]
    fn session_subcommands() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app_with(tmp.path(), FakeMux::with_sessions(&["claude"]));

        let list = texts(app.route(1, "/session")).remove(0);
        assert!(list.contains("▶️ claude"));
        assert_eq!(
            texts(app.route(1, "/session new work")),
            vec!["✅ Session work created and active"]
        );
        assert_eq!(
            texts(app.route(1, "/session current")),
            vec!["🧭 Active session: work"]
        );
        assert!(texts(app.route(1, "/session switch ghost"))[0].starts_with("❌"));
        assert_eq!(
            texts(app.route(1, "/session kill work")),
            vec!["🗑️ Session work killed\n🔀 Active session is now claude"]
        );
        assert_eq!(
            texts(app.route(1, "/session rename claude main")),
            vec!["✏️ Session claude renamed to main"]
        );
        assert!(texts(app.route(1, "/session bogus"))[0].starts_with("⚠️ Usage"));
    }

    #[test]
    fn callbacks_and_unknown_commands() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app_with(tmp.path(), FakeMux::with_sessions(&["claude"]));

        assert!(texts(app.route_callback(1, "show_security"))[0].starts_with("🛡️ Security"));
        assert!(texts(app.route_callback(1, "show_commands"))[0].starts_with("🔧 Commands"));
        app.route_callback(1, "kill_process");
        assert_eq!(sent(&app), vec!["key:C-c"]);
        assert!(texts(app.route(1, "/nope"))[0].starts_with("⚠️ Unknown command: /nope"));
        assert!(app.route(1, "   ").is_empty());
    }

    #[test]
    fn health_reports_probe() {
        let tmp = tempfile::tempdir().unwrap();
        let app = app_with(tmp.path(), FakeMux::with_sessions(&["claude"]))
            .with_probe(|| Ok("termgate_bot".to_string()));
        let text = texts(app.route(1, "/health")).remove(0);
        assert!(text.contains("tmux: tmux 3.4"));
        assert!(text.contains("@termgate_bot"));
    }

    #[test]
    fn missing_session_is_reported_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let mux = FakeMux {
            fail_create: true,
            ..FakeMux::default()
        };
        let app = app_with(tmp.path(), mux);
        assert_eq!(
            texts(app.route(1, "/screenshot")),
            vec!["❌ no tmux session is available"]
        );
        assert!(texts(app.route(1, "/status"))[0].contains("no usable tmux session"));
    }

    #[test]
    fn worker_handles_updates_in_arrival_order() {
        let tmp = tempfile::tempdir().unwrap();
        let mux = FakeMux {
            send_delay: Duration::from_millis(20),
            ..FakeMux::with_sessions(&["claude"])
        };
        let app = Arc::new(app_with(tmp.path(), mux));

        let (tx, worker) = {
            let app = Arc::clone(&app);
            spawn_worker(move |text: &'static str| {
                app.route(1, text);
            })
            .unwrap()
        };
        for text in ["echo x | s", "h", "pwd"] {
            tx.send(text).unwrap();
        }
        drop(tx);
        worker.join().unwrap();

        assert_eq!(
            sent(&app),
            vec![
                "literal:echo x | s",
                "key:C-m",
                "literal:h",
                "key:C-m",
                "literal:pwd",
                "key:C-m",
            ]
        );
    }
}
