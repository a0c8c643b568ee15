//! List-backed ticket queue.
//!
//! Tasks are kept in insertion order and the draw walks the list summing
//! tickets until the running sum passes the drawn point. Every operation
//! except the draw and the total is O(n), which makes this backend a
//! straightforward reference for [`crate::tree::TicketTree`] and the only one
//! where yielding changes anything: a yielded task is moved to the tail and
//! so owns the highest points of the range afterwards.

use std::collections::VecDeque;

use crate::queue::TicketQueue;
use crate::types::Pid;
use crate::types::Tickets;

#[derive(Debug, Default)]
pub struct LinearQueue {
    entries: VecDeque<(Pid, Tickets)>,
    total: Tickets,
}

impl LinearQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, pid: Pid) -> Option<usize> {
        self.entries.iter().position(|&(p, _)| p == pid)
    }
}

impl TicketQueue for LinearQueue {
    const NAME: &'static str = "list";

    fn insert(&mut self, pid: Pid, tickets: Tickets) -> bool {
        if tickets == 0 || self.position(pid).is_some() {
            return false;
        }
        let Some(total) = self.total.checked_add(tickets) else {
            return false;
        };
        self.entries.push_back((pid, tickets));
        self.total = total;
        true
    }

    fn remove(&mut self, pid: Pid) -> Option<Tickets> {
        let pos = self.position(pid)?;
        let (_, tickets) = self.entries.remove(pos)?;
        self.total -= tickets;
        Some(tickets)
    }

    fn draw(&self, point: u64) -> Option<Pid> {
        let mut acc: u64 = 0;
        for &(pid, tickets) in self.entries.iter() {
            acc += tickets;
            if point < acc {
                return Some(pid);
            }
        }
        None
    }

    fn total_tickets(&self) -> Tickets {
        self.total
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn tickets(&self, pid: Pid) -> Option<Tickets> {
        self.position(pid).map(|pos| self.entries[pos].1)
    }

    fn requeue_tail(&mut self, pid: Pid) -> bool {
        let Some(pos) = self.position(pid) else {
            return false;
        };
        if let Some(entry) = self.entries.remove(pos) {
            self.entries.push_back(entry);
        }
        true
    }

    fn entries(&self) -> Vec<(Pid, Tickets)> {
        self.entries.iter().copied().collect()
    }
}
