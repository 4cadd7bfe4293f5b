//! Shared context threaded through registry components

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::DynamicConfig;
use crate::events::{EventEmitter, RegistryEvent};
use crate::variant::{ServiceControl, ServiceLauncher};

/// Collaborators every registry component needs
#[derive(Debug)]
pub struct RegistryContext {
    /// Hot reloadable configuration
    pub config: Arc<DynamicConfig>,
    /// Backend that launches service processes
    pub launcher: Arc<dyn ServiceLauncher>,
    /// Backend that stops running instances
    pub control: Arc<dyn ServiceControl>,
    /// Registry change events
    pub events: EventEmitter<RegistryEvent>,
    started_at: Instant,
}

impl RegistryContext {
    /// Bundle configuration with the launch and control backends
    pub fn new(
        config: Arc<DynamicConfig>,
        launcher: Arc<dyn ServiceLauncher>,
        control: Arc<dyn ServiceControl>,
    ) -> Self {
        Self {
            config,
            launcher,
            control,
            events: EventEmitter::new(),
            started_at: Instant::now(),
        }
    }

    /// How long this dispatcher has been up
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Whether we are still inside the grace window after boot where
    /// previously running services are expected to re-register
    pub fn in_initial_register_window(&self) -> bool {
        self.uptime() < self.config.get().services.initial_register_window()
    }
}
