//! How much memory one accelerator sub-call may use.
//!
//! With a GPU the budget is the device's global memory capped at a configured maximum; without
//! one we fall back to the host's total RAM. Not finding a device is normal and only logged.

use log::{info, warn};
use num_traits::ToPrimitive;
use serde::Serialize;
use sysinfo::System;

use crate::error::{DecompError, Result};

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Convert a size in GiB to bytes, rejecting negative and non-finite sizes.
pub fn gib_to_bytes(gib: f64) -> Result<u64> {
    if !gib.is_finite() || gib <= 0.0 {
        return Err(DecompError::InvalidMemoryCeiling);
    }
    (gib * BYTES_PER_GIB)
        .floor()
        .to_u64()
        .ok_or(DecompError::Overflow("memory size"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceMemory {
    pub name: String,
    pub bytes: u64,
}

pub trait MemoryProbe {
    /// Accelerators visible to this process, in device order.
    fn devices(&self) -> Vec<DeviceMemory>;

    /// Total host RAM in bytes.
    fn host_bytes(&self) -> u64;
}

/// Asks the operating system (and OpenCL, when enabled) what is installed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl MemoryProbe for SystemProbe {
    fn devices(&self) -> Vec<DeviceMemory> {
        opencl_devices()
    }

    fn host_bytes(&self) -> u64 {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.total_memory()
    }
}

#[cfg(feature = "opencl")]
fn opencl_devices() -> Vec<DeviceMemory> {
    use opencl3::device::{get_all_devices, Device, CL_DEVICE_TYPE_GPU};

    let ids = match get_all_devices(CL_DEVICE_TYPE_GPU) {
        Ok(ids) => ids,
        Err(e) => {
            info!("no OpenCL GPU platform found ({})", e);
            return Vec::new();
        }
    };

    ids.into_iter()
        .map(Device::new)
        .filter_map(|device| {
            let bytes = device.global_mem_size().ok()?;
            let name = device.name().unwrap_or_else(|_| "unknown device".to_string());
            Some(DeviceMemory { name, bytes })
        })
        .collect()
}

#[cfg(not(feature = "opencl"))]
fn opencl_devices() -> Vec<DeviceMemory> {
    Vec::new()
}

/// Fixed answers, for runs where the budget is known up front.
#[derive(Debug, Clone, Default)]
pub struct FixedProbe {
    pub devices: Vec<DeviceMemory>,
    pub host_bytes: u64,
}

impl MemoryProbe for FixedProbe {
    fn devices(&self) -> Vec<DeviceMemory> {
        self.devices.clone()
    }

    fn host_bytes(&self) -> u64 {
        self.host_bytes
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MemorySource {
    Device(String),
    Host,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryCeiling {
    pub bytes: u64,
    pub source: MemorySource,
}

/// Memory budget for one sub-call.
///
/// Only the first device is used when several are visible; run one process per device to use
/// them all.
pub fn memory_ceiling<P: MemoryProbe + ?Sized>(
    probe: &P,
    max_device_bytes: u64,
    force_host: bool,
) -> Result<MemoryCeiling> {
    let devices = if force_host {
        info!("accelerators disabled, budgeting against host memory");
        Vec::new()
    } else {
        probe.devices()
    };

    if devices.len() > 1 {
        warn!(
            "{} devices visible to this process, using device 0 only",
            devices.len()
        );
    }

    let ceiling = match devices.into_iter().next() {
        Some(device) => {
            info!("budgeting against {} ({} bytes)", device.name, device.bytes);
            MemoryCeiling {
                bytes: device.bytes.min(max_device_bytes),
                source: MemorySource::Device(device.name),
            }
        }
        None => {
            if !force_host {
                info!("no accelerator found, falling back to host memory");
            }
            MemoryCeiling {
                bytes: probe.host_bytes(),
                source: MemorySource::Host,
            }
        }
    };

    if ceiling.bytes == 0 {
        return Err(DecompError::InvalidMemoryCeiling);
    }
    Ok(ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpu(bytes: u64) -> DeviceMemory {
        DeviceMemory {
            name: "gpu".to_string(),
            bytes,
        }
    }

    #[test]
    fn test_gib_to_bytes() {
        assert_eq!(gib_to_bytes(1.0).unwrap(), 1 << 30);
        assert_eq!(gib_to_bytes(40.0).unwrap(), 40 * (1 << 30));
        assert_eq!(gib_to_bytes(0.5).unwrap(), 1 << 29);
        assert!(gib_to_bytes(0.0).is_err());
        assert!(gib_to_bytes(-1.0).is_err());
        assert!(gib_to_bytes(f64::NAN).is_err());
    }

    #[test]
    fn test_device_capped() {
        let probe = FixedProbe {
            devices: vec![gpu(80 << 30)],
            host_bytes: 512 << 30,
        };
        let c = memory_ceiling(&probe, 40 << 30, false).unwrap();
        assert_eq!(c.bytes, 40 << 30);
        assert_eq!(c.source, MemorySource::Device("gpu".to_string()));

        let c = memory_ceiling(&probe, 100 << 30, false).unwrap();
        assert_eq!(c.bytes, 80 << 30);
    }

    #[test]
    fn test_first_device_only() {
        let probe = FixedProbe {
            devices: vec![gpu(16 << 30), gpu(32 << 30)],
            host_bytes: 64 << 30,
        };
        let c = memory_ceiling(&probe, 40 << 30, false).unwrap();
        assert_eq!(c.bytes, 16 << 30);
    }

    #[test]
    fn test_host_fallback() {
        let probe = FixedProbe {
            devices: vec![],
            host_bytes: 64 << 30,
        };
        let c = memory_ceiling(&probe, 40 << 30, false).unwrap();
        assert_eq!(c.bytes, 64 << 30);
        assert_eq!(c.source, MemorySource::Host);

        let probe = FixedProbe {
            devices: vec![gpu(16 << 30)],
            host_bytes: 64 << 30,
        };
        let c = memory_ceiling(&probe, 40 << 30, true).unwrap();
        assert_eq!(c.source, MemorySource::Host);
    }

    #[test]
    fn test_zero_ceiling() {
        let probe = FixedProbe::default();
        assert!(matches!(
            memory_ceiling(&probe, 40 << 30, false),
            Err(DecompError::InvalidMemoryCeiling)
        ));
    }

    #[test]
    fn test_system_probe_sees_host_memory() {
        assert!(SystemProbe.host_bytes() > 0);
    }
}
