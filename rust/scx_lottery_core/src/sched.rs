//! Lottery scheduling state machine.
//!
//! [`LotteryScheduler`] owns one run queue per CPU, the event log and the
//! counters. The host calls into it at the usual scheduling class hooks and
//! passes itself in as a [`Host`] so the scheduler can read the clock, draw
//! random numbers and request reschedules.
//!
//! A task is Runnable while it is queued, Running while it is also a CPU's
//! `curr`, and Not-Scheduled otherwise. Running tasks stay queued; only
//! blocking or exiting removes a task from the queue.
//!
//! Host contract violations (unknown CPU, dequeue of a task that isn't
//! queued, ...) never panic: they are reported through `warn!` and a `MSG`
//! event and the call does nothing.

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use log::debug;
use log::trace;
use log::warn;

use crate::config::LotteryConfig;
use crate::event_log::Action;
use crate::event_log::EventLog;
use crate::host::Host;
use crate::queue::TicketQueue;
use crate::rq::LotteryRq;
use crate::stats::LotteryStats;
use crate::tree::TicketTree;
use crate::types::CpuId;
use crate::types::Pid;
use crate::types::Tickets;
use crate::types::TimeNs;

macro_rules! lottery_log {
    ($sched:ident, $host:ident, $action:expr, $($arg:tt)*) => {
        $sched.log_event($host, $action, format_args!($($arg)*))
    };
}

macro_rules! violation {
    ($sched:ident, $host:ident, $($arg:tt)*) => {
        $sched.violation($host, format_args!($($arg)*))
    };
}

pub struct LotteryScheduler<Q: TicketQueue = TicketTree> {
    config: LotteryConfig,
    rqs: Vec<LotteryRq<Q>>,
    log: EventLog,
    stats: LotteryStats,
}

impl<Q: TicketQueue> LotteryScheduler<Q> {
    pub fn new<H: Host>(config: LotteryConfig, host: &mut H) -> Result<Self> {
        config.validate()?;

        let mut log = EventLog::new(config.log_capacity, config.msg_size);
        log.set_enabled(config.logging);
        let rqs = (0..config.nr_cpus).map(|_| LotteryRq::new()).collect();

        let mut sched = Self {
            config,
            rqs,
            log,
            stats: LotteryStats::default(),
        };
        lottery_log!(
            sched,
            host,
            Action::Msg,
            "Initialize event log for lottery scheduling"
        );
        debug!(
            "lottery: {} CPUs, {} run queues, log capacity {}",
            sched.config.nr_cpus,
            Q::NAME,
            sched.log.capacity()
        );
        Ok(sched)
    }

    pub fn config(&self) -> &LotteryConfig {
        &self.config
    }

    pub fn nr_cpus(&self) -> usize {
        self.rqs.len()
    }

    pub fn rq(&self, cpu: CpuId) -> Option<&LotteryRq<Q>> {
        self.rqs.get(cpu.0 as usize)
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    /// The reader cursor lives in the log, so draining needs `&mut`.
    pub fn event_log_mut(&mut self) -> &mut EventLog {
        &mut self.log
    }

    pub fn stats(&self) -> &LotteryStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    pub fn reset_event_log(&mut self) {
        self.log.reset();
    }

    /// Round-robin interval: each task runs at most one slice before the
    /// next draw.
    pub fn rr_interval(&self) -> Duration {
        Duration::from_micros(self.config.slice_us)
    }

    pub fn sum_exec_runtime(&self, cpu: CpuId, pid: Pid) -> TimeNs {
        self.rq(cpu).map_or(0, |rq| rq.sum_exec_runtime(pid))
    }

    fn rq_idx(&self, cpu: CpuId) -> Option<usize> {
        let idx = cpu.0 as usize;
        (idx < self.rqs.len()).then_some(idx)
    }

    fn log_event<H: Host>(&mut self, host: &mut H, action: Action, args: fmt::Arguments<'_>) {
        if !self.log.is_enabled() {
            return;
        }
        let now = host.now_ns();
        self.log.record(now, action, args);
    }

    fn violation<H: Host>(&mut self, host: &mut H, args: fmt::Arguments<'_>) {
        warn!("{}", args);
        self.log_event(host, Action::Msg, args);
    }

    /// Add `pid` to `cpu`'s run queue.
    pub fn enqueue_task<H: Host>(
        &mut self,
        host: &mut H,
        cpu: CpuId,
        pid: Pid,
        tickets: Tickets,
    ) -> bool {
        let Some(idx) = self.rq_idx(cpu) else {
            violation!(self, host, "enqueue of PID:{} on unknown CPU {}", pid, cpu);
            return false;
        };
        if tickets == 0 {
            violation!(self, host, "PID:{} enqueued with no tickets", pid);
            return false;
        }
        if self.rqs[idx].queue().contains(pid) {
            violation!(self, host, "PID:{} already queued on CPU {}", pid, cpu);
            return false;
        }
        let total = self.rqs[idx].total_tickets();
        if total.checked_add(tickets).is_none() {
            violation!(
                self,
                host,
                "PID:{} with tickets {} overflows the {} tickets of CPU {}",
                pid,
                tickets,
                total,
                cpu
            );
            return false;
        }
        self.rqs[idx].insert(pid, tickets);

        lottery_log!(self, host, Action::Enqueue, "PID:{} with tickets {}", pid, tickets);
        self.stats.record_enqueue();
        trace!(
            "cpu {}: enqueue pid {} ({} tickets, total {})",
            cpu,
            pid,
            tickets,
            self.rqs[idx].total_tickets()
        );
        true
    }

    /// Remove `pid` from `cpu`'s run queue. A running task stays `curr`
    /// until the host puts it.
    pub fn dequeue_task<H: Host>(&mut self, host: &mut H, cpu: CpuId, pid: Pid) -> bool {
        let Some(idx) = self.rq_idx(cpu) else {
            violation!(self, host, "dequeue of PID:{} on unknown CPU {}", pid, cpu);
            return false;
        };
        let Some(tickets) = self.rqs[idx].queue().tickets(pid) else {
            violation!(self, host, "dequeue of PID:{} not queued on CPU {}", pid, cpu);
            return false;
        };

        lottery_log!(self, host, Action::Dequeue, "PID:{} with tickets {}", pid, tickets);
        let now = host.now_ns();
        let rq = &mut self.rqs[idx];
        rq.update_curr(now);
        rq.remove(pid);
        self.stats.record_dequeue();
        trace!(
            "cpu {}: dequeue pid {} ({} tickets, total {})",
            cpu,
            pid,
            tickets,
            self.rqs[idx].total_tickets()
        );
        true
    }

    /// Draw a winner on run queue `idx`. Nothing is logged or counted when
    /// the queue is empty.
    fn conduct_lottery<H: Host>(&mut self, host: &mut H, idx: usize) -> Option<(Pid, Tickets)> {
        let total = self.rqs[idx].total_tickets();
        if total == 0 {
            return None;
        }

        let start = host.draw_clock_ns();
        let point = host.random_below(total);
        let queue = self.rqs[idx].queue();
        let winner = queue
            .draw(point)
            .and_then(|pid| queue.tickets(pid).map(|tickets| (pid, tickets)));
        let latency = host.draw_clock_ns().saturating_sub(start);

        match winner {
            Some(winner) => {
                self.stats.record_draw(latency);
                Some(winner)
            }
            None => {
                violation!(
                    self,
                    host,
                    "draw of point {} found no task among {} tickets",
                    point,
                    total
                );
                None
            }
        }
    }

    /// Draw the next task to run on `cpu` and make it `curr`. Returns `None`
    /// when nothing is runnable.
    pub fn pick_next_task<H: Host>(&mut self, host: &mut H, cpu: CpuId) -> Option<Pid> {
        let Some(idx) = self.rq_idx(cpu) else {
            violation!(self, host, "pick_next on unknown CPU {}", cpu);
            return None;
        };
        let (pid, tickets) = self.conduct_lottery(host, idx)?;

        lottery_log!(self, host, Action::PickNext, "PID:{} with {} tickets", pid, tickets);
        match self.rqs[idx].last() {
            Some(prev) if prev == pid => {}
            Some(prev) => {
                lottery_log!(self, host, Action::ContextSwitch, "PID:{} -> PID:{}", prev, pid)
            }
            None => lottery_log!(self, host, Action::ContextSwitch, "idle -> PID:{}", pid),
        }

        let now = host.now_ns();
        let rq = &mut self.rqs[idx];
        rq.update_curr(now);
        rq.set_curr(pid, tickets, now);
        Some(pid)
    }

    /// `candidate` just became runnable on `cpu`. Runs a draw without
    /// switching; if the winner isn't the running task, `cpu` is asked to
    /// reschedule. Returns whether a preemption was requested.
    ///
    /// An idle CPU is only kicked: there is nothing to preempt.
    pub fn check_preempt_curr<H: Host>(&mut self, host: &mut H, cpu: CpuId, candidate: Pid) -> bool {
        let Some(idx) = self.rq_idx(cpu) else {
            violation!(self, host, "preempt check on unknown CPU {}", cpu);
            return false;
        };
        if !self.rqs[idx].queue().contains(candidate) {
            violation!(
                self,
                host,
                "preempt check for PID:{} not queued on CPU {}",
                candidate,
                cpu
            );
            return false;
        }
        let Some(curr) = self.rqs[idx].curr() else {
            host.resched_curr(cpu);
            return false;
        };

        let Some((winner, tickets)) = self.conduct_lottery(host, idx) else {
            return false;
        };
        lottery_log!(self, host, Action::PickNext, "PID:{} with {} tickets", winner, tickets);
        if winner == curr.pid {
            return false;
        }

        host.resched_curr(cpu);
        lottery_log!(
            self,
            host,
            Action::Preempt,
            "Curr PID:{}, candidate PID:{}, winner PID:{}",
            curr.pid,
            candidate,
            winner
        );
        self.stats.record_preempt();
        true
    }

    /// Timer tick: charge the running task and always reschedule so every
    /// slice ends in a fresh draw.
    pub fn task_tick<H: Host>(&mut self, host: &mut H, cpu: CpuId) {
        let Some(idx) = self.rq_idx(cpu) else {
            violation!(self, host, "tick on unknown CPU {}", cpu);
            return;
        };

        let now = host.now_ns();
        self.rqs[idx].update_curr(now);
        match self.rqs[idx].curr() {
            Some(curr) => lottery_log!(
                self,
                host,
                Action::Tick,
                "PID: {} with {} tickets",
                curr.pid,
                curr.tickets
            ),
            None => lottery_log!(self, host, Action::Tick, "idle"),
        }
        host.resched_curr(cpu);
    }

    /// `pid` gives up the CPU. With an ordered backend it also moves behind
    /// every other task.
    pub fn yield_task<H: Host>(&mut self, host: &mut H, cpu: CpuId, pid: Pid) {
        let Some(idx) = self.rq_idx(cpu) else {
            violation!(self, host, "yield of PID:{} on unknown CPU {}", pid, cpu);
            return;
        };
        if !self.rqs[idx].queue().contains(pid) {
            violation!(self, host, "yield of PID:{} not queued on CPU {}", pid, cpu);
            return;
        }

        let now = host.now_ns();
        let rq = &mut self.rqs[idx];
        rq.update_curr(now);
        rq.requeue_tail(pid);
        host.resched_curr(cpu);
        self.stats.record_yield();
    }

    /// `pid` stops running on `cpu`.
    pub fn put_prev_task<H: Host>(&mut self, host: &mut H, cpu: CpuId, pid: Pid) {
        let Some(idx) = self.rq_idx(cpu) else {
            violation!(self, host, "put_prev of PID:{} on unknown CPU {}", pid, cpu);
            return;
        };
        if self.rqs[idx].curr().map(|c| c.pid) != Some(pid) {
            violation!(self, host, "put_prev of PID:{} not running on CPU {}", pid, cpu);
            return;
        }

        let now = host.now_ns();
        let rq = &mut self.rqs[idx];
        rq.update_curr(now);
        rq.clear_curr();
    }

    /// The host made `pid` the running task of `cpu` without a draw.
    pub fn set_curr_task<H: Host>(&mut self, host: &mut H, cpu: CpuId, pid: Pid) {
        let Some(idx) = self.rq_idx(cpu) else {
            violation!(self, host, "set_curr of PID:{} on unknown CPU {}", pid, cpu);
            return;
        };
        let Some(tickets) = self.rqs[idx].queue().tickets(pid) else {
            violation!(self, host, "set_curr of PID:{} not queued on CPU {}", pid, cpu);
            return;
        };

        let now = host.now_ns();
        let rq = &mut self.rqs[idx];
        match rq.curr() {
            Some(curr) if curr.pid == pid => rq.restart_curr(now),
            _ => {
                rq.update_curr(now);
                rq.set_curr(pid, tickets, now);
            }
        }
    }

    /// The tickets of `pid` changed. The new weight only matters at the next
    /// draw, so a running task is rescheduled.
    pub fn prio_changed<H: Host>(&mut self, host: &mut H, cpu: CpuId, pid: Pid, running: bool) {
        let Some(idx) = self.rq_idx(cpu) else {
            violation!(self, host, "prio change of PID:{} on unknown CPU {}", pid, cpu);
            return;
        };

        let now = host.now_ns();
        self.rqs[idx].update_curr(now);
        if running {
            host.resched_curr(cpu);
        }
    }

    /// Give a queued task a new ticket count. Tickets are the tree key, so
    /// the task is dequeued and enqueued again.
    pub fn set_tickets<H: Host>(
        &mut self,
        host: &mut H,
        cpu: CpuId,
        pid: Pid,
        tickets: Tickets,
    ) -> bool {
        let Some(idx) = self.rq_idx(cpu) else {
            violation!(self, host, "ticket change of PID:{} on unknown CPU {}", pid, cpu);
            return false;
        };
        if tickets == 0 {
            violation!(self, host, "PID:{} given no tickets", pid);
            return false;
        }
        let Some(old) = self.rqs[idx].queue().tickets(pid) else {
            violation!(self, host, "ticket change of PID:{} not queued on CPU {}", pid, cpu);
            return false;
        };
        if old == tickets {
            return true;
        }
        let rest = self.rqs[idx].total_tickets() - old;
        if rest.checked_add(tickets).is_none() {
            violation!(
                self,
                host,
                "PID:{} with tickets {} overflows the {} other tickets of CPU {}",
                pid,
                tickets,
                rest,
                cpu
            );
            return false;
        }

        let running = self.rqs[idx].curr().is_some_and(|c| c.pid == pid);
        self.dequeue_task(host, cpu, pid);
        self.enqueue_task(host, cpu, pid, tickets);
        if running {
            let now = host.now_ns();
            let rq = &mut self.rqs[idx];
            rq.update_curr(now);
            rq.set_curr(pid, tickets, now);
        }
        self.prio_changed(host, cpu, pid, running);
        debug!("cpu {}: pid {} tickets {} -> {}", cpu, pid, old, tickets);
        true
    }

    /// `pid` exited. Drops it from the queue if the host didn't, and forgets
    /// its runtime.
    pub fn task_dead<H: Host>(&mut self, host: &mut H, cpu: CpuId, pid: Pid) {
        let Some(idx) = self.rq_idx(cpu) else {
            violation!(self, host, "exit of PID:{} on unknown CPU {}", pid, cpu);
            return;
        };

        if self.rqs[idx].queue().contains(pid) {
            self.dequeue_task(host, cpu, pid);
        }
        let rq = &mut self.rqs[idx];
        if rq.curr().is_some_and(|c| c.pid == pid) {
            rq.clear_curr();
        }
        rq.forget(pid);
    }
}
