//! Blocking Telegram Bot API client.
//!
//! Only the handful of methods the bridge needs: long polling, sending
//! messages (split to the 4096-character limit), answering callback queries,
//! registering the command menu and a `getMe` probe for health checks.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::TelegramConfig;

/// Hard limit on one Telegram message body, in characters.
pub const MESSAGE_LIMIT: usize = 4096;

/// Quick-access reply keyboard, row by row.
pub const QUICK_BUTTONS: &[&[&str]] = &[
    &["📄 /tail", "🔍 /screenshot", "📊 /stats"],
    &["↩️ Enter", "⬇️ Down", "⬅️ Left", "➡️ Right"],
    &["🔄 /status", "📜 /history", "⚡ /buttons"],
    &["🧭 /session", "🩺 /health"],
];

/// Inline buttons: (label, callback data).
pub const INLINE_BUTTONS: &[(&str, &str)] = &[
    ("🔧 Commands", "show_commands"),
    ("📊 Statistics", "show_stats"),
    ("🛡️ Security", "show_security"),
    ("❌ Interrupt process", "kill_process"),
];

/// Bot menu entries registered with `setMyCommands`.
pub const BOT_COMMANDS: &[(&str, &str)] = &[
    ("start", "Start and show keyboards"),
    ("send", "Send a command to the terminal"),
    ("confirm", "Confirm a system command"),
    ("session", "Manage tmux sessions"),
    ("health", "Bridge diagnostics"),
    ("tail", "Last terminal log lines"),
    ("screenshot", "Current tmux pane"),
    ("status", "System status"),
    ("stats", "Statistics"),
    ("history", "Command history"),
    ("search", "Search command history"),
    ("kill", "Send Ctrl+C to the terminal"),
    ("buttons", "List commands"),
];

#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub error_code: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub first_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub callback_query: Option<CallbackQuery>,
}

impl Update {
    /// Chat the update originates from.
    pub fn chat_id(&self) -> Option<i64> {
        self.message
            .as_ref()
            .map(|m| m.chat.id)
            .or_else(|| {
                self.callback_query
                    .as_ref()
                    .and_then(|q| q.message.as_ref())
                    .map(|m| m.chat.id)
            })
    }
}

/// Keyboard attached to an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyboard {
    None,
    QuickButtons,
    Inline,
}

impl Keyboard {
    fn markup(self) -> Option<serde_json::Value> {
        match self {
            Keyboard::None => None,
            Keyboard::QuickButtons => {
                let rows: Vec<Vec<serde_json::Value>> = QUICK_BUTTONS
                    .iter()
                    .map(|row| row.iter().map(|label| json!({ "text": label })).collect())
                    .collect();
                Some(json!({
                    "keyboard": rows,
                    "resize_keyboard": true,
                    "one_time_keyboard": false,
                }))
            }
            Keyboard::Inline => {
                let rows: Vec<Vec<serde_json::Value>> = INLINE_BUTTONS
                    .iter()
                    .map(|(label, data)| vec![json!({ "text": label, "callback_data": data })])
                    .collect();
                Some(json!({ "inline_keyboard": rows }))
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct BotCommand<'a> {
    command: &'a str,
    description: &'a str,
}

/// Telegram measures message length in UTF-16 code units.
fn utf16_len(text: &str) -> usize {
    text.encode_utf16().count()
}

/// Split `text` into chunks of at most `limit` UTF-16 code units, preferring
/// line boundaries.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    // Room for at least one surrogate pair.
    let limit = limit.max(2);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.split_inclusive('\n') {
        let line_len = utf16_len(line);
        if current_len + line_len > limit && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if line_len > limit {
            // A single line longer than the limit is cut hard.
            for ch in line.chars() {
                let ch_len = ch.len_utf16();
                if current_len + ch_len > limit {
                    chunks.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                current.push(ch);
                current_len += ch_len;
            }
            continue;
        }
        current.push_str(line);
        current_len += line_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    if chunks.is_empty() {
        chunks.push(String::new());
    }
    chunks
}

pub struct TelegramClient {
    agent: ureq::Agent,
    base: String,
    poll_timeout: u64,
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let token = config
            .bot_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .context("telegram bot token is not configured")?;
        // The read bound must outlast a long poll.
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(config.connect_timeout_secs))
            .timeout_read(Duration::from_secs(
                config.read_timeout_secs + config.poll_timeout_secs,
            ))
            .build();
        Ok(Self {
            agent,
            base: format!("{}/bot{}", config.api_base.trim_end_matches('/'), token.trim()),
            poll_timeout: config.poll_timeout_secs,
        })
    }

    fn call<T: DeserializeOwned>(&self, method: &str, body: serde_json::Value) -> Result<T> {
        let url = format!("{}/{method}", self.base);
        let response = match self.agent.post(&url).send_json(body) {
            Ok(response) => response,
            // Telegram reports API errors as 4xx with a JSON body.
            Err(ureq::Error::Status(_, response)) => response,
            Err(error) => return Err(error).with_context(|| format!("telegram {method} failed")),
        };
        let parsed: ApiResponse<T> = response
            .into_json()
            .with_context(|| format!("invalid telegram {method} response"))?;
        if !parsed.ok {
            bail!(
                "telegram {method} error {}: {}",
                parsed.error_code.unwrap_or_default(),
                parsed.description.unwrap_or_default()
            );
        }
        parsed
            .result
            .with_context(|| format!("telegram {method} returned no result"))
    }

    pub fn get_me(&self) -> Result<User> {
        self.call("getMe", json!({}))
    }

    /// Long-poll for updates after `offset`.
    pub fn get_updates(&self, offset: Option<i64>) -> Result<Vec<Update>> {
        let mut body = json!({
            "timeout": self.poll_timeout,
            "allowed_updates": ["message", "callback_query"],
        });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }
        self.call("getUpdates", body)
    }

    /// Send `text`, split into as many messages as needed. The keyboard is
    /// attached to the last one.
    pub fn send_message(&self, chat_id: i64, text: &str, keyboard: Keyboard) -> Result<()> {
        let chunks = split_message(text, MESSAGE_LIMIT);
        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut body = json!({ "chat_id": chat_id, "text": chunk });
            if i == last
                && let Some(markup) = keyboard.markup()
            {
                body["reply_markup"] = markup;
            }
            let _: Message = self.call("sendMessage", body)?;
        }
        debug!(chat_id, "message sent");
        Ok(())
    }

    pub fn answer_callback(&self, callback_id: &str) -> Result<()> {
        let _: bool = self.call("answerCallbackQuery", json!({ "callback_query_id": callback_id }))?;
        Ok(())
    }

    pub fn set_my_commands(&self) -> Result<()> {
        let commands: Vec<BotCommand<'_>> = BOT_COMMANDS
            .iter()
            .map(|(command, description)| BotCommand {
                command,
                description,
            })
            .collect();
        let _: bool = self.call("setMyCommands", json!({ "commands": commands }))?;
        Ok(())
    }

    /// Best-effort send; failures are logged.
    pub fn notify(&self, chat_id: i64, text: &str) {
        if let Err(error) = self.send_message(chat_id, text, Keyboard::None) {
            warn!(chat_id, error = %error, "failed to send notification");
        }
    }
}
