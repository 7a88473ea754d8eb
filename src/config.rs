//! Scheduler configuration

use std::time::Duration;

use nix::sys::signal::Signal;

use crate::errors::{Result, SpawnError};
use crate::scheduler::Scheduler;

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Longest single block of the event loop while waiting for children
    pub poll_interval: Duration,
    /// How long shutdown waits after `shutdown_signal` before SIGKILL
    pub shutdown_grace: Duration,
    /// Signal sent to every live child on shutdown
    pub shutdown_signal: Signal,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(5),
            shutdown_signal: Signal::SIGTERM,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(SpawnError::InvalidConfig(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        if self.shutdown_signal == Signal::SIGKILL && !self.shutdown_grace.is_zero() {
            return Err(SpawnError::InvalidConfig(
                "a grace period is meaningless with SIGKILL as shutdown signal".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder pattern for scheduler creation
#[derive(Debug, Default)]
pub struct SchedulerBuilder {
    config: SchedulerConfig,
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    pub fn shutdown_signal(mut self, signal: Signal) -> Self {
        self.config.shutdown_signal = signal;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Validate and build
    pub fn build(self) -> Result<Scheduler> {
        Scheduler::new(self.config)
    }
}
