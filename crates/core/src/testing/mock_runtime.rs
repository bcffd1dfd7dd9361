use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use candle_core::Device;

use crate::distributed::topology::{LOCAL_RANK_ENV, RANK_ENV, WORLD_SIZE_ENV};
use crate::distributed::{Accelerator, DistributedError, Result};

/// Launch variables an external launcher would set for `rank`.
pub fn launch_env(rank: usize, world_size: usize) -> HashMap<String, String> {
    HashMap::from([
        (RANK_ENV.to_string(), rank.to_string()),
        (LOCAL_RANK_ENV.to_string(), rank.to_string()),
        (WORLD_SIZE_ENV.to_string(), world_size.to_string()),
    ])
}

/// Ordered, shareable record of events.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: String) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Accelerator that logs `bind:<device>`, `open:<device>` and `seed:<seed>`.
///
/// Opened devices are CPU devices.
pub struct RecordingAccelerator {
    devices: usize,
    log: EventLog,
}

impl RecordingAccelerator {
    pub fn new(devices: usize, log: EventLog) -> Self {
        Self { devices, log }
    }
}

impl Accelerator for RecordingAccelerator {
    fn device_count(&self) -> usize {
        self.devices
    }

    fn bind(&self, device: usize) -> Result<()> {
        if device >= self.devices {
            return Err(DistributedError::Accelerator(format!(
                "device {device} out of range"
            )));
        }
        self.log.push(format!("bind:{device}"));
        Ok(())
    }

    fn open_device(&self, local_rank: usize) -> Result<Device> {
        self.log.push(format!("open:{local_rank}"));
        Ok(Device::Cpu)
    }

    fn seed_device(&self, _device: &Device, seed: u64) -> Result<()> {
        self.log.push(format!("seed:{seed}"));
        Ok(())
    }
}
