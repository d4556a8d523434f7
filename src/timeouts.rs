//! Serial timeout settings and the read/write timer policies derived from them.

use std::time::Duration;

/// Timeout field value with special meaning (MAXULONG)
pub const TIMEOUT_MAX: u32 = u32::MAX;

/// Read and write timeouts, all in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SerialTimeouts {
    pub read_interval_timeout: u32,
    pub read_total_timeout_multiplier: u32,
    pub read_total_timeout_constant: u32,
    pub write_total_timeout_multiplier: u32,
    pub write_total_timeout_constant: u32,
}

/// How a read request is to be timed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct ReadPolicy {
    /// Complete with whatever is buffered, even nothing
    pub return_immediately: bool,
    /// Shrink the request to a single byte
    pub crunch_to_one: bool,
    /// Deadline for the whole request
    pub total: Option<Duration>,
    /// Maximum gap between two received bytes
    pub interval: Option<Duration>,
}

fn total_timeout(constant: u32, multiplier: u32, length: usize) -> Duration {
    let per_byte = u64::from(multiplier).saturating_mul(length as u64);
    Duration::from_millis(u64::from(constant).saturating_add(per_byte))
}

impl SerialTimeouts {
    /// Timer policy for a read of `length` bytes
    pub(crate) fn read_policy(&self, length: usize) -> ReadPolicy {
        let interval = self.read_interval_timeout;
        let multiplier = self.read_total_timeout_multiplier;
        let constant = self.read_total_timeout_constant;
        let mut policy = ReadPolicy::default();

        if interval == TIMEOUT_MAX {
            if multiplier == 0 && constant == 0 {
                policy.return_immediately = true;
                return policy;
            }
            if multiplier == TIMEOUT_MAX {
                if constant == TIMEOUT_MAX {
                    // Nonsensical combination, behave as if no timers were asked for
                    policy.return_immediately = true;
                    return policy;
                }
                if constant != 0 {
                    policy.crunch_to_one = true;
                    policy.total = Some(Duration::from_millis(u64::from(constant)));
                    return policy;
                }
            }
        }

        if multiplier != 0 || constant != 0 {
            policy.total = Some(total_timeout(constant, multiplier, length));
        }
        if interval != 0 && interval != TIMEOUT_MAX {
            policy.interval = Some(Duration::from_millis(u64::from(interval)));
        }
        policy
    }

    /// Deadline for a write of `length` bytes, `None` meaning no timeout
    pub(crate) fn write_timeout(&self, length: usize) -> Option<Duration> {
        let multiplier = self.write_total_timeout_multiplier;
        let constant = self.write_total_timeout_constant;
        if multiplier == 0 && constant == 0 {
            return None;
        }
        Some(total_timeout(constant, multiplier, length))
    }
}
