//! palaver chat bot.
//!
//! Wires the palaver command engine to NATS and registers the built-in
//! commands. Configuration comes from an optional TOML file overlaid by
//! `PALAVER__*` environment variables.

pub mod commands;
pub mod config;
