// src/orchestrator/phase.rs

//! Update pipeline phases
//!
//! ```text
//!            ┌──────────► Checking ───────────┐
//!            │                │               ▼
//!   Idle ────┼──────────► Downloading ──► Verifying ──► Staged
//!   Staged   │                └─────────────────────────▲  │
//!   Completed│                                             │
//!   Failed   └──────────► BackingUp ──► Installing ──► Completed
//!                              │             │
//!                              └─────────────┴───────► Failed
//! ```
//!
//! `Idle`, `Staged`, `Completed` and `Failed` are resting phases. Every
//! operation starts from one of them; a busy phase means an operation is
//! already running.

use crate::error::{Error, Result};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    Idle,
    Checking,
    Downloading,
    Verifying,
    Staged,
    BackingUp,
    Installing,
    Completed,
    Failed,
}

impl UpdatePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::Staged => "staged",
            Self::BackingUp => "backing_up",
            Self::Installing => "installing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// True when no operation is running
    pub fn is_resting(&self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Staged | Self::Completed | Self::Failed
        )
    }

    pub fn can_transition_to(&self, next: UpdatePhase) -> bool {
        use UpdatePhase::*;

        match (self, next) {
            (from, Checking | Downloading | BackingUp) if from.is_resting() => true,
            // A check hands back to whatever phase it started from, or
            // goes straight on to fetch what it found
            (Checking, to) => to.is_resting() || to == Downloading,
            (Downloading, Verifying | Staged | Failed) => true,
            (Verifying, Staged | Failed) => true,
            (BackingUp, Installing | Failed) => true,
            (Installing, Completed | Failed) => true,
            _ => false,
        }
    }

    /// Checked transition
    pub fn transition(&self, next: UpdatePhase) -> Result<UpdatePhase> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
