//! `parla` command-line speech player.
//!
//! The binary in `main.rs` is the composition root; everything it wires
//! together lives here so it can be tested.

pub mod commands;
pub mod handlers;
pub mod parser;
pub mod terminal;

pub use commands::{Commands, FetchArgs, SayArgs};
pub use parser::Cli;
