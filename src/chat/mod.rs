//! Pieces of the interactive REPL that sit above the session core.
//!
//! - [`config`]: CLI argument parsing, YAML files, and the resolved configuration
//! - [`commands`]: slash command parsing
//!
//! Rendering lives in [`crate::render`] because the session drives it directly.

mod commands;
mod config;

pub use crate::render::{PlainTextRenderer, Renderer};
pub use commands::{ChatCommand, help_text, parse_command};
pub use config::{BASE_URL_ENV, ChatArgs, ChatConfig, ConfigFile, DEFAULT_BASE_URL, DEFAULT_GREETING};
