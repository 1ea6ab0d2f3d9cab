//! Command-line interface for the `nobg` binary
//!
//! Only compiled with the `cli` feature.

mod config;
#[path = "main.rs"]
mod main_impl;

pub use main_impl::{main, CacheAction, Cli, Command, ModelArgs, ProcessArgs, ServeArgs};
