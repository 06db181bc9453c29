//! Logical compute devices and per-layer placement.
//!
//! Devices are tags on tensors; moving a tensor is a graph op that retags it
//! (gradient flows through unchanged). A `DeviceMap` assigns contiguous layer
//! ranges of one stack to devices, replacing any ambient "current device"
//! state with explicit per-layer assignment.

use crate::error::{Error, Result};
use std::fmt;
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    Accel(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accel(i) => write!(f, "accel:{}", i),
        }
    }
}

/// Contiguous layer ranges per device, in layer order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMap {
    ranges: Vec<(Device, Range<usize>)>,
}

impl DeviceMap {
    /// Every layer on one device.
    pub fn single(device: Device, num_layers: usize) -> Self {
        DeviceMap {
            ranges: vec![(device, 0..num_layers)],
        }
    }

    /// Validate an explicit assignment. Ranges must be non-empty, contiguous,
    /// ordered and cover `0..num_layers` exactly once.
    pub fn new(ranges: Vec<(Device, Range<usize>)>, num_layers: usize) -> Result<Self> {
        let mut next = 0usize;
        for (device, r) in &ranges {
            if r.start != next || r.end <= r.start {
                return Err(Error::InvalidConfiguration(format!(
                    "device map range {:?} on {} is not contiguous from layer {}",
                    r, device, next
                )));
            }
            next = r.end;
        }
        if next != num_layers {
            return Err(Error::InvalidConfiguration(format!(
                "device map covers {} layers but the stack has {}",
                next, num_layers
            )));
        }
        Ok(DeviceMap { ranges })
    }

    /// Split `num_layers` as evenly as possible over `devices`, earlier
    /// devices taking the remainder.
    pub fn balanced(devices: &[Device], num_layers: usize) -> Result<Self> {
        if devices.is_empty() {
            return Err(Error::InvalidConfiguration(
                "device map needs at least one device".to_string(),
            ));
        }
        let used = devices.len().min(num_layers.max(1));
        let per = num_layers / used;
        let extra = num_layers % used;
        let mut ranges = Vec::with_capacity(used);
        let mut start = 0;
        for (i, d) in devices.iter().take(used).enumerate() {
            let len = per + usize::from(i < extra);
            ranges.push((*d, start..start + len));
            start += len;
        }
        DeviceMap::new(ranges, num_layers)
    }

    pub fn device_for(&self, layer: usize) -> Device {
        self.ranges
            .iter()
            .find(|(_, r)| r.contains(&layer))
            .map(|(d, _)| *d)
            .unwrap_or_default()
    }

    pub fn first_device(&self) -> Device {
        self.ranges.first().map(|(d, _)| *d).unwrap_or_default()
    }

    pub fn last_device(&self) -> Device {
        self.ranges.last().map(|(d, _)| *d).unwrap_or_default()
    }

    /// If `layer` is the final layer of its device's range and another device
    /// follows, the device the hidden state must move to next.
    pub fn handoff_after(&self, layer: usize) -> Option<Device> {
        let idx = self.ranges.iter().position(|(_, r)| r.end == layer + 1)?;
        self.ranges.get(idx + 1).map(|(d, _)| *d)
    }

    pub fn num_devices(&self) -> usize {
        self.ranges.len()
    }

    /// Number of layers covered.
    pub fn num_layers(&self) -> usize {
        self.ranges.last().map(|(_, r)| r.end).unwrap_or(0)
    }
}
