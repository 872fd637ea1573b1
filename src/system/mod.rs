// src/system/mod.rs

//! Host interaction: external commands and systemd services

pub mod executor;
pub mod services;

pub use executor::{CommandExecutor, CommandOutput, CommandSpec, RecordingExecutor, SystemExecutor};
pub use services::{PausedServices, ServiceController};
