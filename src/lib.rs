pub mod app;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod confirm;
pub mod error;
pub mod log;
pub mod policy;
pub mod sanitize;
pub mod session;
pub mod shell_completion;
pub mod telegram;
pub mod telemetry;
pub mod tmux;
