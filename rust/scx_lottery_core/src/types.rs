//! Newtype wrappers and type aliases for domain concepts.
//!
//! Identifiers (PIDs, CPU IDs, tree node handles) are newtypes so they can't
//! be mixed up with each other or with ticket counts. Plain quantities
//! (timestamps, tickets) are type aliases.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pid(pub i32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// CPU identifier. Each CPU owns exactly one run queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CpuId(pub u32);

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Handle of a node in the ticket tree arena.
///
/// Handles stay valid until the node is removed; a freed slot may be handed
/// out again by a later insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub(crate) fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Nanoseconds from the host's monotonic clock.
pub type TimeNs = u64;

/// Lottery weight of a task.
pub type Tickets = u64;
