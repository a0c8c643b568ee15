//! Per-CPU run queue.

use std::collections::HashMap;

use crate::queue::TicketQueue;
use crate::types::Pid;
use crate::types::Tickets;
use crate::types::TimeNs;

/// The task a CPU is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrTask {
    pub pid: Pid,
    pub tickets: Tickets,
    /// Start of the current accounting period.
    pub exec_start: TimeNs,
}

/// Runnable tasks of one CPU plus what it is running.
///
/// `total_tickets` and `nr_running` shadow the queue's own counts and are
/// only changed together with it.
#[derive(Debug, Default)]
pub struct LotteryRq<Q> {
    queue: Q,
    total_tickets: Tickets,
    nr_running: u64,
    curr: Option<CurrTask>,
    /// Last task picked, kept across put_prev for context switch detection.
    last: Option<Pid>,
    runtime: HashMap<Pid, TimeNs>,
}

impl<Q: TicketQueue> LotteryRq<Q> {
    pub fn new() -> Self {
        Self {
            queue: Q::default(),
            total_tickets: 0,
            nr_running: 0,
            curr: None,
            last: None,
            runtime: HashMap::new(),
        }
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn total_tickets(&self) -> Tickets {
        self.total_tickets
    }

    pub fn nr_running(&self) -> u64 {
        self.nr_running
    }

    pub fn curr(&self) -> Option<CurrTask> {
        self.curr
    }

    pub(crate) fn last(&self) -> Option<Pid> {
        self.last
    }

    /// Cumulative time `pid` spent as `curr` on this CPU.
    pub fn sum_exec_runtime(&self, pid: Pid) -> TimeNs {
        self.runtime.get(&pid).copied().unwrap_or(0)
    }

    pub(crate) fn insert(&mut self, pid: Pid, tickets: Tickets) -> bool {
        if !self.queue.insert(pid, tickets) {
            return false;
        }
        self.total_tickets += tickets;
        self.nr_running += 1;
        debug_assert_eq!(self.total_tickets, self.queue.total_tickets());
        true
    }

    pub(crate) fn remove(&mut self, pid: Pid) -> Option<Tickets> {
        let tickets = self.queue.remove(pid)?;
        self.total_tickets -= tickets;
        self.nr_running -= 1;
        debug_assert_eq!(self.total_tickets, self.queue.total_tickets());
        Some(tickets)
    }

    pub(crate) fn requeue_tail(&mut self, pid: Pid) -> bool {
        self.queue.requeue_tail(pid)
    }

    /// Charge the time since `exec_start` to `curr` and restart its period.
    pub(crate) fn update_curr(&mut self, now: TimeNs) {
        let Some(curr) = self.curr.as_mut() else {
            return;
        };
        let delta = now.saturating_sub(curr.exec_start);
        *self.runtime.entry(curr.pid).or_insert(0) += delta;
        curr.exec_start = now;
    }

    pub(crate) fn set_curr(&mut self, pid: Pid, tickets: Tickets, now: TimeNs) {
        self.curr = Some(CurrTask {
            pid,
            tickets,
            exec_start: now,
        });
        self.last = Some(pid);
    }

    pub(crate) fn clear_curr(&mut self) -> Option<CurrTask> {
        self.curr.take()
    }

    pub(crate) fn restart_curr(&mut self, now: TimeNs) {
        if let Some(curr) = self.curr.as_mut() {
            curr.exec_start = now;
        }
    }

    pub(crate) fn forget(&mut self, pid: Pid) {
        self.runtime.remove(&pid);
        if self.last == Some(pid) {
            self.last = None;
        }
    }
}
