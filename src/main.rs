use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use termgate::cli::{Cli, Command};
use termgate::config::BridgeConfig;
use termgate::config::render::{render_config_human, render_config_json};
use termgate::policy::{Classification, CommandPolicy, PatternPolicy};
use termgate::session::store::PointerStore;
use termgate::tmux::{Multiplexer, Tmux};
use termgate::{app, sanitize, shell_completion};

fn check(config: &BridgeConfig, words: &[String]) -> Result<()> {
    let policy = PatternPolicy::from_config(&config.security)?;
    let command = words.join(" ");
    match policy.classify(&command) {
        Classification::Allowed => println!("allowed"),
        Classification::Blocked { reason } => println!("blocked: {reason}"),
        Classification::RequiresConfirmation { matched_rule } => {
            println!("requires confirmation (rule: {matched_rule})")
        }
    }
    Ok(())
}

fn sanitize_input(config: &BridgeConfig, file: Option<&Path>) -> Result<()> {
    let raw = match file {
        Some(path) => {
            let bytes =
                std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            String::from_utf8_lossy(&bytes).into_owned()
        }
        None => {
            let mut bytes = Vec::new();
            std::io::stdin()
                .read_to_end(&mut bytes)
                .context("failed to read stdin")?;
            String::from_utf8_lossy(&bytes).into_owned()
        }
    };
    println!(
        "{}",
        sanitize::format_for_transport(&raw, config.output.max_message_length)
    );
    Ok(())
}

fn sessions(config: &BridgeConfig) -> Result<()> {
    let tmux = Tmux::new(config.tmux.status_timeout(), config.tmux.command_timeout());
    let names = tmux.list_sessions()?;
    if names.is_empty() {
        println!("no tmux sessions running");
        return Ok(());
    }

    let store = PointerStore::new(
        config.resolve(&config.paths.env_file),
        config.resolve(&config.paths.state_file),
    );
    let active = store
        .read_state()
        .map(|state| state.tmux_session)
        .filter(|name| names.contains(name))
        .unwrap_or_else(|| config.tmux.session.clone());

    for name in &names {
        let mark = if *name == active { "*" } else { " " };
        println!("{mark} {name}");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let quiet = !matches!(cli.command, Command::Run);

    let filter = match cli.verbose {
        0 if quiet => "termgate=warn",
        0 => "termgate=info",
        1 => "termgate=debug",
        _ => "termgate=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    let (config, config_path) = BridgeConfig::load(&cwd)?;

    if !quiet || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no .termgate/config.toml found, using defaults"),
        }
    }

    match cli.command {
        Command::Run => app::run(config)?,
        Command::Check { command } => check(&config, &command)?,
        Command::Sanitize { file } => sanitize_input(&config, file.as_deref())?,
        Command::Sessions => sessions(&config)?,
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&config, config_path.as_deref())?);
            } else {
                print!("{}", render_config_human(&config, config_path.as_deref()));
            }
        }
        Command::Completions { shell } => shell_completion::print(shell)?,
    }

    Ok(())
}
