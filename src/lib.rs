//! pilotwire: pilot-driven assistant runs over the OpenAI Assistants API.
//!
//! A *pilot* is a named behavioural profile (instructions, model, tools).
//! The crate turns a `(user, pilot)` pair into a remote assistant, drives
//! runs on conversation threads to completion, and executes the tool calls
//! those runs request against locally registered functions.
//!
//! This library crate exposes every module so integration tests (under
//! `tests/`) and the `pilotwire` binary can reach them.

pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod functions;
pub mod logs;
pub mod pilot;
pub mod registry;
pub mod runs;
pub mod tools;

pub use client::PilotClient;
pub use error::{Error, Result};

/// Return the pilotwire home directory.
///
/// Resolution order:
/// 1. `PILOTWIRE_HOME` environment variable
/// 2. `$HOME/.pilotwire`
pub fn pilotwire_home() -> std::path::PathBuf {
    if let Ok(p) = std::env::var("PILOTWIRE_HOME") {
        std::path::PathBuf::from(p)
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".pilotwire")
    }
}
