//! Compute device pool.
//!
//! Each device admits a bounded number of concurrent batches. A global
//! semaphore sized to the sum of all device budgets is acquired first, so
//! once a dispatcher holds it some device is guaranteed to have room.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::DeviceSpec;

#[derive(Debug)]
struct Device {
    name: String,
    budget: usize,
    permits: Arc<Semaphore>,
}

/// Exclusive use of one batch slot on one device.
#[derive(Debug)]
pub struct DeviceLease {
    device: String,
    _slot: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
}

impl DeviceLease {
    pub fn device(&self) -> &str {
        &self.device
    }
}

/// Usage of one device.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DeviceUsage {
    pub name: String,
    pub budget: usize,
    pub busy: usize,
}

#[derive(Debug)]
pub struct DevicePool {
    devices: Vec<Device>,
    global: Arc<Semaphore>,
    next: AtomicUsize,
}

impl DevicePool {
    pub fn new(specs: &[DeviceSpec], max_batches_per_device: usize) -> Self {
        let specs: Vec<DeviceSpec> = if specs.is_empty() {
            vec![DeviceSpec::new("cpu", 1.0)]
        } else {
            specs.to_vec()
        };
        let devices: Vec<Device> = specs
            .iter()
            .map(|spec| {
                let budget = spec.batch_budget(max_batches_per_device);
                Device {
                    name: spec.name.clone(),
                    budget,
                    permits: Arc::new(Semaphore::new(budget)),
                }
            })
            .collect();
        let total = devices.iter().map(|d| d.budget).sum();

        Self {
            devices,
            global: Arc::new(Semaphore::new(total)),
            next: AtomicUsize::new(0),
        }
    }

    /// Total concurrent batches across devices.
    pub fn capacity(&self) -> usize {
        self.devices.iter().map(|d| d.budget).sum()
    }

    /// Wait for a free batch slot, trying devices round-robin.
    /// Returns `None` once the pool is closed.
    pub async fn acquire(&self) -> Option<DeviceLease> {
        let global = Arc::clone(&self.global).acquire_owned().await.ok()?;
        let count = self.devices.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);

        for offset in 0..count {
            let device = &self.devices[(start + offset) % count];
            if let Ok(slot) = Arc::clone(&device.permits).try_acquire_owned() {
                return Some(DeviceLease {
                    device: device.name.clone(),
                    _slot: slot,
                    _global: global,
                });
            }
        }
        None
    }

    pub fn usage(&self) -> Vec<DeviceUsage> {
        self.devices
            .iter()
            .map(|d| DeviceUsage {
                name: d.name.clone(),
                budget: d.budget,
                busy: d.budget - d.permits.available_permits(),
            })
            .collect()
    }

    pub fn close(&self) {
        self.global.close();
    }
}
