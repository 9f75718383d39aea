use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::logging::LogLevel;
use crate::memory::gib_to_bytes;

/// Run-wide settings for a [`crate::Backend`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub log_level: LogLevel,
    /// Run as a serial task even when MPI is available.
    pub force_single_process: bool,
    /// Budget sub-calls against host memory even when a GPU is visible.
    pub force_host_memory: bool,
    /// Upper bound on the device memory one sub-call may use.
    pub max_device_memory_gb: f64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            force_single_process: false,
            force_host_memory: false,
            max_device_memory_gb: 40.0,
        }
    }
}

impl BackendConfig {
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_single_process(mut self, force: bool) -> Self {
        self.force_single_process = force;
        self
    }

    pub fn with_host_memory(mut self, force: bool) -> Self {
        self.force_host_memory = force;
        self
    }

    pub fn with_max_device_memory_gb(mut self, gb: f64) -> Self {
        self.max_device_memory_gb = gb;
        self
    }

    pub fn max_device_memory_bytes(&self) -> Result<u64> {
        gib_to_bytes(self.max_device_memory_gb)
    }
}
