//! Services the scheduler consumes from its host.
//!
//! The scheduler never reads a clock, draws a random number or kicks a CPU
//! on its own; it asks the [`Host`] passed into every callback. [`SimHost`]
//! is a deterministic implementation driven by a manual clock and a seeded
//! PRNG, used by the simulator binary and the tests.

use std::time::Instant;

use rand::rngs::SmallRng;
use rand::Rng;
use rand::SeedableRng;

use crate::types::CpuId;
use crate::types::TimeNs;

pub trait Host {
    /// Monotonic clock used for runtime accounting and event timestamps.
    fn now_ns(&mut self) -> TimeNs;

    /// Uniform random integer in `[0, bound)`. `bound` is never zero.
    fn random_below(&mut self, bound: u64) -> u64;

    /// Ask `cpu` to call back into `pick_next_task` at its next
    /// scheduling point.
    fn resched_curr(&mut self, cpu: CpuId);

    /// Clock used to time draws. Defaults to [`Host::now_ns`].
    fn draw_clock_ns(&mut self) -> TimeNs {
        self.now_ns()
    }
}

/// Simulated host.
///
/// Time only moves when [`SimHost::advance`] is called, so every run with the
/// same seed and the same call sequence produces the same schedule. Draw
/// latency is the one thing measured on the real clock.
#[derive(Debug)]
pub struct SimHost {
    now: TimeNs,
    rng: SmallRng,
    resched: Vec<bool>,
    epoch: Instant,
}

impl SimHost {
    pub fn new(nr_cpus: usize, seed: u64) -> Self {
        Self {
            now: 0,
            rng: SmallRng::seed_from_u64(seed),
            resched: vec![false; nr_cpus],
            epoch: Instant::now(),
        }
    }

    pub fn now(&self) -> TimeNs {
        self.now
    }

    pub fn advance(&mut self, delta: TimeNs) {
        self.now += delta;
    }

    pub fn need_resched(&self, cpu: CpuId) -> bool {
        self.resched.get(cpu.0 as usize).copied().unwrap_or(false)
    }

    /// Consume a pending reschedule request for `cpu`.
    pub fn take_resched(&mut self, cpu: CpuId) -> bool {
        match self.resched.get_mut(cpu.0 as usize) {
            Some(flag) => std::mem::take(flag),
            None => false,
        }
    }

    /// Random integer in `[lo, hi]`, for workload generation sharing the
    /// scheduler's seed.
    pub fn random_between(&mut self, lo: u64, hi: u64) -> u64 {
        if lo >= hi {
            return lo;
        }
        self.rng.gen_range(lo..=hi)
    }
}

impl Host for SimHost {
    fn now_ns(&mut self) -> TimeNs {
        self.now
    }

    fn random_below(&mut self, bound: u64) -> u64 {
        if bound == 0 {
            return 0;
        }
        self.rng.gen_range(0..bound)
    }

    fn resched_curr(&mut self, cpu: CpuId) {
        if let Some(flag) = self.resched.get_mut(cpu.0 as usize) {
            *flag = true;
        }
    }

    fn draw_clock_ns(&mut self) -> TimeNs {
        self.epoch.elapsed().as_nanos() as TimeNs
    }
}
