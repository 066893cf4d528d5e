use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "termgate",
    about = "Drive a tmux session from Telegram behind a command policy",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the Telegram bridge
    Run,

    /// Classify a command against the policy without running it
    Check {
        /// Command text, e.g. `termgate check -- sudo reboot`
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Sanitize terminal output for transport (file or stdin)
    Sanitize {
        /// Input file; reads stdin when omitted
        file: Option<PathBuf>,
    },

    /// List tmux sessions and mark the active one
    Sessions,

    /// Show the effective configuration
    Config {
        /// Emit JSON instead of the human-readable summary
        #[arg(long)]
        json: bool,
    },

    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}
