// src/lib.rs

//! ArmNAS update subsystem
//!
//! Everything needed to move an ArmNAS appliance from one release to the
//! next: finding, fetching, verifying, backing up, launching and applying
//! update packages.
//!
//! # Architecture
//!
//! - Controller (`armnas serve`): HTTP API driving the
//!   [`orchestrator::UpdateOrchestrator`] state machine
//! - Updater service (`armnas updater`): separate process that launches
//!   installers so they survive the controller restarting
//! - Installer (`armnas apply`): ordered step list run from inside an
//!   unpacked update package
//! - Packages are single `.run` files in a staging directory, trusted only
//!   after their SHA-256 matches
//! - Backups are `tar.gz` archives of the installation directory, rotated
//!   after every successful backup

pub mod api;
pub mod auth;
pub mod backup;
pub mod config;
mod error;
pub mod filesystem;
pub mod hash;
pub mod history;
pub mod installer;
pub mod lock;
pub mod orchestrator;
pub mod remote;
pub mod store;
pub mod supervisor;
pub mod system;
pub mod updater;
pub mod version;

pub use error::{Error, Result};
pub use orchestrator::{UpdateOrchestrator, UpdatePhase};
pub use store::PackageStore;
