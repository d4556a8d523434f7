//! Device index allocation.

use std::sync::{Mutex, PoisonError};

/// Default bound on concurrently attached devices
pub const DEFAULT_MAX_DEVICES: usize = 256;

/// Bitmap of device indices in use
#[derive(Debug)]
pub struct DeviceSlots {
    used: Mutex<Vec<u64>>,
    bound: usize,
}

impl DeviceSlots {
    pub fn new(bound: usize) -> Self {
        Self {
            used: Mutex::new(vec![0; bound.div_ceil(64)]),
            bound,
        }
    }

    /// Claim the lowest free index
    pub fn allocate(&self) -> Option<usize> {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        for (word_idx, word) in used.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as usize;
            let index = word_idx * 64 + bit;
            if index >= self.bound {
                return None;
            }
            *word |= 1 << bit;
            return Some(index);
        }
        None
    }

    pub fn release(&self, index: usize) {
        if index >= self.bound {
            return;
        }
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        used[index / 64] &= !(1 << (index % 64));
    }

    pub fn in_use(&self) -> usize {
        let used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        used.iter().map(|w| w.count_ones() as usize).sum()
    }
}

impl Default for DeviceSlots {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEVICES)
    }
}

/// Device name for a slot index
pub fn device_name(index: usize) -> String {
    format!("USBSER{index:03}")
}
