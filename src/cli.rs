// src/cli.rs
//! CLI definitions for armnas
//!
//! This module contains the command-line interface definitions using clap.
//! Dispatch lives in `main.rs`.

use armnas::config::DEFAULT_CONFIG_PATH;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "armnas")]
#[command(version)]
#[command(about = "Update subsystem for the ArmNAS appliance", long_about = None)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the controller API
    Serve,

    /// Run the updater service that launches installers
    Updater,

    /// Apply an unpacked update payload to the installation
    Apply {
        /// Directory the update package was unpacked into
        #[arg(short, long)]
        payload: PathBuf,

        /// Do not ask for confirmation
        #[arg(long)]
        auto: bool,

        /// Package name recorded in the update history
        #[arg(long)]
        package: Option<String>,
    },

    /// Manage installation backups
    #[command(subcommand)]
    Backup(BackupCommands),

    /// Version utilities
    #[command(subcommand)]
    Version(VersionCommands),
}

#[derive(Subcommand)]
pub enum BackupCommands {
    /// List backups, newest first
    List,

    /// Archive the installation directory now
    Create {
        /// Reason embedded in the file name (e.g. "manual")
        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Delete all but the newest backups
    Rotate {
        /// Number of backups to keep (default: backup.max_backups)
        #[arg(short, long)]
        keep: Option<usize>,
    },

    /// Delete one backup
    Delete {
        /// Backup file name
        filename: String,
    },
}

#[derive(Subcommand)]
pub enum VersionCommands {
    /// Print the installed version
    Current,

    /// Compare two dotted versions
    Compare {
        a: String,
        b: String,
    },
}
