//! Subcommand implementations.

pub mod check;
pub mod config;
pub mod download;
pub mod history;
pub mod sync;
pub mod watch;
