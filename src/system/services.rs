// src/system/services.rs

//! systemd service control
//!
//! [`ServiceController::pause`] returns a [`PausedServices`] guard: services
//! that were running are stopped, and started again when the guard drops,
//! whatever happened in between.

use crate::error::Result;
use crate::system::executor::{CommandExecutor, CommandSpec};
use std::sync::Arc;
use tracing::{info, warn};

/// Thin wrapper over `systemctl`
#[derive(Clone)]
pub struct ServiceController {
    executor: Arc<dyn CommandExecutor>,
}

impl ServiceController {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    fn systemctl(&self, action: &str, service: &str) -> Result<bool> {
        let spec = CommandSpec::new("systemctl").args([action, service]);
        Ok(self.executor.run(&spec)?.success)
    }

    /// Whether a unit is currently active
    pub fn is_active(&self, service: &str) -> bool {
        let spec = CommandSpec::new("systemctl").args(["is-active", "--quiet", service]);
        self.executor.run(&spec).map(|o| o.success).unwrap_or(false)
    }

    pub fn stop(&self, service: &str) -> Result<()> {
        let spec = CommandSpec::new("systemctl").args(["stop", service]);
        self.executor.run(&spec)?.into_result(&format!("stop {}", service))?;
        Ok(())
    }

    pub fn start(&self, service: &str) -> Result<()> {
        let spec = CommandSpec::new("systemctl").args(["start", service]);
        self.executor.run(&spec)?.into_result(&format!("start {}", service))?;
        Ok(())
    }

    pub fn restart(&self, service: &str) -> Result<()> {
        let spec = CommandSpec::new("systemctl").args(["restart", service]);
        self.executor.run(&spec)?.into_result(&format!("restart {}", service))?;
        Ok(())
    }

    /// Restart every service, continuing past failures
    ///
    /// Returns the services that failed to restart.
    pub fn restart_all(&self, services: &[String]) -> Vec<String> {
        let mut failed = Vec::new();
        for service in services {
            match self.systemctl("restart", service) {
                Ok(true) => info!("Restarted {}", service),
                Ok(false) => {
                    warn!("Failed to restart {}", service);
                    failed.push(service.clone());
                }
                Err(e) => {
                    warn!("Failed to restart {}: {}", service, e);
                    failed.push(service.clone());
                }
            }
        }
        failed
    }

    /// Stop the active services among `services` until the guard drops
    pub fn pause(&self, services: &[String]) -> PausedServices {
        let mut stopped = Vec::new();
        for service in services {
            if !self.is_active(service) {
                continue;
            }
            match self.stop(service) {
                Ok(()) => {
                    info!("Paused {}", service);
                    stopped.push(service.clone());
                }
                Err(e) => warn!("Could not pause {}: {}", service, e),
            }
        }

        PausedServices {
            controller: self.clone(),
            stopped,
        }
    }
}

/// Services stopped by [`ServiceController::pause`]
pub struct PausedServices {
    controller: ServiceController,
    stopped: Vec<String>,
}

impl PausedServices {
    pub fn services(&self) -> &[String] {
        &self.stopped
    }
}

impl Drop for PausedServices {
    fn drop(&mut self) {
        // Resume in reverse order of stopping
        for service in self.stopped.iter().rev() {
            match self.controller.start(service) {
                Ok(()) => info!("Resumed {}", service),
                Err(e) => warn!("Failed to resume {}: {}", service, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::executor::{CommandOutput, RecordingExecutor};

    fn services(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_pause_resumes_on_drop() {
        let exec = RecordingExecutor::new();
        let controller = ServiceController::new(Arc::new(exec.clone()));

        {
            let guard = controller.pause(&services(&["armnas-backend", "nginx"]));
            assert_eq!(guard.services(), &["armnas-backend", "nginx"]);
        }

        assert_eq!(
            exec.calls(),
            vec![
                "systemctl is-active --quiet armnas-backend",
                "systemctl stop armnas-backend",
                "systemctl is-active --quiet nginx",
                "systemctl stop nginx",
                "systemctl start nginx",
                "systemctl start armnas-backend",
            ]
        );
    }

    #[test]
    fn test_pause_skips_inactive() {
        let exec = RecordingExecutor::new();
        exec.respond("systemctl is-active --quiet nginx", CommandOutput::failed(""));
        let controller = ServiceController::new(Arc::new(exec.clone()));

        drop(controller.pause(&services(&["nginx"])));

        assert_eq!(exec.calls(), vec!["systemctl is-active --quiet nginx"]);
    }

    #[test]
    fn test_restart_all_collects_failures() {
        let exec = RecordingExecutor::new();
        exec.respond("systemctl restart nginx", CommandOutput::failed("no such unit"));
        let controller = ServiceController::new(Arc::new(exec));

        let failed = controller.restart_all(&services(&["nginx", "armnas-backend"]));
        assert_eq!(failed, vec!["nginx"]);
    }
}
