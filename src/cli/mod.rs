//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Interactive chat
//! - Benchmarking
//! - Engine build information

pub mod commands;
pub mod handlers;
pub mod transcript;

pub use handlers::{handle_bench, handle_chat, handle_info};
