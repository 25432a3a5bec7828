//! Process metrics sampled into heartbeat records.

use std::sync::{Mutex, PoisonError};

use sysinfo::System;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Source of the host metrics reported in heartbeats.
pub trait SystemMetrics: Send + Sync + 'static {
    /// One-minute load average.
    fn load_average(&self) -> f64;

    /// Memory available to new processes, in GB.
    fn available_memory_gb(&self) -> f64;
}

/// Samples the host through `sysinfo`.
pub struct HostMetrics {
    system: Mutex<System>,
}

impl HostMetrics {
    /// Create a sampler; nothing is read until the first heartbeat.
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for HostMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HostMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostMetrics").finish_non_exhaustive()
    }
}

impl SystemMetrics for HostMetrics {
    fn load_average(&self) -> f64 {
        System::load_average().one
    }

    #[allow(clippy::cast_precision_loss)]
    fn available_memory_gb(&self) -> f64 {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        system.available_memory() as f64 / BYTES_PER_GB
    }
}

/// Fixed metrics, for tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct StaticMetrics {
    /// Reported load average.
    pub load_average: f64,
    /// Reported available memory in GB.
    pub available_memory_gb: f64,
}

impl SystemMetrics for StaticMetrics {
    fn load_average(&self) -> f64 {
        self.load_average
    }

    fn available_memory_gb(&self) -> f64 {
        self.available_memory_gb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_metrics_sample_the_host() {
        let metrics = HostMetrics::new();

        assert!(metrics.load_average() >= 0.0);
        assert!(metrics.available_memory_gb() > 0.0);
        // Sampling again refreshes rather than accumulating
        assert!(metrics.available_memory_gb() > 0.0);
    }
}
