//! Synthetic tasks driven through the simulated CPUs.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use scx_lottery_core::CpuId;
use scx_lottery_core::Pid;
use scx_lottery_core::SimHost;
use scx_lottery_core::Tickets;
use scx_lottery_core::TimeNs;

const NSEC_PER_USEC: u64 = 1_000;

/// Task description: `name:tickets[:run_us:sleep_us]`.
///
/// Without burst lengths the task is a CPU hog that never blocks. With
/// `sleep_us == 0` it yields after every `run_us` of CPU time instead of
/// sleeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub name: String,
    pub tickets: Tickets,
    pub run_us: u64,
    pub sleep_us: u64,
}

impl TaskSpec {
    pub fn behavior(&self) -> Behavior {
        match (self.run_us, self.sleep_us) {
            (0, _) => Behavior::Hog,
            (_, 0) => Behavior::Yielder,
            _ => Behavior::Interactive,
        }
    }
}

impl FromStr for TaskSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 2 && parts.len() != 4 {
            bail!("invalid task {:?}, expected name:tickets[:run_us:sleep_us]", s);
        }

        let name = parts[0].trim();
        if name.is_empty() {
            bail!("task {:?} has no name", s);
        }
        let tickets: Tickets = parts[1]
            .trim()
            .parse()
            .with_context(|| format!("invalid ticket count in {:?}", s))?;
        if tickets == 0 {
            bail!("task {:?} needs at least one ticket", s);
        }

        let (run_us, sleep_us) = if parts.len() == 4 {
            let run_us = parts[2]
                .trim()
                .parse()
                .with_context(|| format!("invalid run_us in {:?}", s))?;
            let sleep_us = parts[3]
                .trim()
                .parse()
                .with_context(|| format!("invalid sleep_us in {:?}", s))?;
            (run_us, sleep_us)
        } else {
            (0, 0)
        };

        Ok(Self {
            name: name.to_string(),
            tickets,
            run_us,
            sleep_us,
        })
    }
}

impl fmt::Display for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tickets)?;
        if self.run_us > 0 {
            write!(f, ":{}:{}", self.run_us, self.sleep_us)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Always runnable.
    Hog,
    /// Runs a burst, then yields and stays runnable.
    Yielder,
    /// Runs a burst, then sleeps.
    Interactive,
}

/// Generate `nr_tasks` tasks with tickets in `[min_tickets, max_tickets]`.
/// Every third task is interactive, every fifth a yielder, the rest hogs.
pub fn generate(
    host: &mut SimHost,
    nr_tasks: usize,
    min_tickets: Tickets,
    max_tickets: Tickets,
) -> Vec<TaskSpec> {
    (0..nr_tasks)
        .map(|i| {
            let tickets = host.random_between(min_tickets, max_tickets);
            let (run_us, sleep_us) = if i % 3 == 2 {
                (host.random_between(200, 2000), host.random_between(1000, 5000))
            } else if i % 5 == 4 {
                (host.random_between(500, 3000), 0)
            } else {
                (0, 0)
            };
            TaskSpec {
                name: format!("task-{}", i),
                tickets,
                run_us,
                sleep_us,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Runnable,
    Sleeping { wake_at: TimeNs },
}

/// A task bound to its home CPU.
#[derive(Debug)]
pub struct SimTask {
    pub pid: Pid,
    pub cpu: CpuId,
    pub spec: TaskSpec,
    pub state: TaskState,
    /// CPU time left in the current burst.
    burst_left: TimeNs,
}

impl SimTask {
    pub fn new(pid: Pid, cpu: CpuId, spec: TaskSpec) -> Self {
        let burst_left = spec.run_us * NSEC_PER_USEC;
        Self {
            pid,
            cpu,
            spec,
            state: TaskState::Runnable,
            burst_left,
        }
    }

    /// Charge `ran` ns of CPU time. Returns what the task does next once
    /// its burst is used up.
    pub fn charge(&mut self, ran: TimeNs, now: TimeNs) -> Option<Behavior> {
        let behavior = self.spec.behavior();
        if behavior == Behavior::Hog {
            return None;
        }

        self.burst_left = self.burst_left.saturating_sub(ran);
        if self.burst_left > 0 {
            return None;
        }

        self.burst_left = self.spec.run_us * NSEC_PER_USEC;
        if behavior == Behavior::Interactive {
            self.state = TaskState::Sleeping {
                wake_at: now + self.spec.sleep_us * NSEC_PER_USEC,
            };
        }
        Some(behavior)
    }

    pub fn should_wake(&self, now: TimeNs) -> bool {
        matches!(self.state, TaskState::Sleeping { wake_at } if wake_at <= now)
    }
}
