//! Scheduler construction parameters and their validation.

use anyhow::bail;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::event_log::DEFAULT_CAPACITY;
use crate::event_log::DEFAULT_MSG_SIZE;

/// Scheduler construction parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotteryConfig {
    /// Number of CPUs, one run queue each.
    pub nr_cpus: usize,
    /// Events retained by the event log.
    pub log_capacity: usize,
    /// Event message buffer size in bytes, terminator included.
    pub msg_size: usize,
    /// Round-robin interval reported to the host.
    pub slice_us: u64,
    /// Record events in the event log.
    pub logging: bool,
}

impl Default for LotteryConfig {
    fn default() -> Self {
        Self {
            nr_cpus: 1,
            log_capacity: DEFAULT_CAPACITY,
            msg_size: DEFAULT_MSG_SIZE,
            slice_us: 1000,
            logging: true,
        }
    }
}

impl LotteryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.nr_cpus < 1 {
            bail!("nr_cpus must be at least 1");
        }
        if self.log_capacity < 1 {
            bail!("log_capacity must be at least 1");
        }
        if self.msg_size < 2 {
            bail!("msg_size ({}) must be at least 2", self.msg_size);
        }
        if self.slice_us < 1 {
            bail!("slice_us must be at least 1");
        }
        Ok(())
    }
}
