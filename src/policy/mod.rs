//! Command classification.
//!
//! Every inbound command is classified before it can reach tmux. Matching is
//! textual (substring, prefix and regex), not a shell parser: obfuscated
//! variants can slip through and that is an accepted limitation. The
//! [`CommandPolicy`] trait keeps the orchestrator independent of the matching
//! strategy.

use std::fmt;

use anyhow::{Context, Result};
use regex::{Regex, RegexBuilder};

use crate::config::SecurityConfig;

/// Why a command was refused outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// Empty or whitespace-only input.
    Empty,
    /// Input longer than the configured limit (in characters).
    TooLong { limit: usize },
    /// Contains a deny-set pattern.
    Denied { pattern: String },
    /// Matches a suspicious structural pattern.
    Suspicious { pattern: String },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::Empty => write!(f, "empty command"),
            BlockReason::TooLong { limit } => write!(f, "too long (>{limit} characters)"),
            BlockReason::Denied { pattern } => write!(f, "dangerous pattern: {pattern}"),
            BlockReason::Suspicious { .. } => write!(f, "suspicious pattern"),
        }
    }
}

/// Outcome of classifying one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Allowed,
    Blocked { reason: BlockReason },
    /// A system-class command; needs explicit operator confirmation.
    RequiresConfirmation { matched_rule: String },
}

impl Classification {
    pub fn label(&self) -> &'static str {
        match self {
            Classification::Allowed => "allowed",
            Classification::Blocked { .. } => "blocked",
            Classification::RequiresConfirmation { .. } => "requires_confirmation",
        }
    }
}

/// Seam between the bridge and the matching strategy.
pub trait CommandPolicy: Send + Sync {
    fn classify(&self, command: &str) -> Classification;
}

/// Substring / prefix / regex policy driven by `[security]` configuration.
///
/// Evaluation order: deny set, then system prefixes, then suspicious
/// structure. A literal dangerous substring blocks even when the command also
/// starts with a system prefix.
pub struct PatternPolicy {
    max_length: usize,
    deny: Vec<String>,
    system: Vec<String>,
    suspicious: Vec<(String, Regex)>,
}

impl PatternPolicy {
    pub fn new(
        max_length: usize,
        deny: &[String],
        system: &[String],
        suspicious: &[String],
    ) -> Result<Self> {
        let suspicious = suspicious
            .iter()
            .map(|pattern| {
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .with_context(|| format!("invalid suspicious pattern '{pattern}'"))?;
                Ok((pattern.clone(), regex))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            max_length,
            deny: lowercase_all(deny),
            system: lowercase_all(system),
            suspicious,
        })
    }

    pub fn from_config(config: &SecurityConfig) -> Result<Self> {
        Self::new(
            config.max_command_length,
            &config.deny,
            &config.system,
            &config.suspicious,
        )
    }

    pub fn deny_patterns(&self) -> &[String] {
        &self.deny
    }

    pub fn system_prefixes(&self) -> &[String] {
        &self.system
    }

    /// True if the command starts with a system-class prefix.
    pub fn is_system_command(&self, command: &str) -> bool {
        self.matching_system_prefix(&command.to_lowercase()).is_some()
    }

    fn matching_system_prefix(&self, lowered: &str) -> Option<&str> {
        let lowered = lowered.trim_start();
        self.system
            .iter()
            .find(|prefix| lowered.starts_with(prefix.as_str()))
            .map(String::as_str)
    }
}

impl CommandPolicy for PatternPolicy {
    fn classify(&self, command: &str) -> Classification {
        if command.trim().is_empty() {
            return Classification::Blocked {
                reason: BlockReason::Empty,
            };
        }

        if command.chars().count() > self.max_length {
            return Classification::Blocked {
                reason: BlockReason::TooLong {
                    limit: self.max_length,
                },
            };
        }

        let lowered = command.to_lowercase();
        if let Some(pattern) = self.deny.iter().find(|p| lowered.contains(p.as_str())) {
            return Classification::Blocked {
                reason: BlockReason::Denied {
                    pattern: pattern.clone(),
                },
            };
        }

        if let Some(prefix) = self.matching_system_prefix(&lowered) {
            return Classification::RequiresConfirmation {
                matched_rule: prefix.to_string(),
            };
        }

        if let Some((pattern, _)) = self.suspicious.iter().find(|(_, re)| re.is_match(command)) {
            return Classification::Blocked {
                reason: BlockReason::Suspicious {
                    pattern: pattern.clone(),
                },
            };
        }

        Classification::Allowed
    }
}

fn lowercase_all(patterns: &[String]) -> Vec<String> {
    patterns
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| p.to_lowercase())
        .collect()
}
