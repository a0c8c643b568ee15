#![allow(dead_code)]

use std::collections::VecDeque;

use rand::rngs::SmallRng;
use rand::Rng;
use rand::SeedableRng;
use scx_lottery_core::CpuId;
use scx_lottery_core::Host;
use scx_lottery_core::TimeNs;

/// Each draw appears to take this long on the draw clock.
pub const DRAW_COST_NS: u64 = 7;

/// Host whose random draws can be scripted.
///
/// Scripted points are returned as-is, even when out of range, so tests can
/// exercise the scheduler's handling of a misbehaving host. Once the script
/// runs out, points come from a seeded PRNG.
pub struct ScriptedHost {
    pub now: TimeNs,
    points: VecDeque<u64>,
    rng: SmallRng,
    resched: Vec<CpuId>,
    draw_clock: TimeNs,
}

impl ScriptedHost {
    pub fn new(seed: u64) -> Self {
        Self {
            now: 0,
            points: VecDeque::new(),
            rng: SmallRng::seed_from_u64(seed),
            resched: Vec::new(),
            draw_clock: 0,
        }
    }

    pub fn script(&mut self, points: impl IntoIterator<Item = u64>) {
        self.points.extend(points);
    }

    /// Reschedule requests since the last call, in order.
    pub fn take_resched(&mut self) -> Vec<CpuId> {
        std::mem::take(&mut self.resched)
    }
}

impl Host for ScriptedHost {
    fn now_ns(&mut self) -> TimeNs {
        self.now
    }

    fn random_below(&mut self, bound: u64) -> u64 {
        match self.points.pop_front() {
            Some(point) => point,
            None => self.rng.gen_range(0..bound),
        }
    }

    fn resched_curr(&mut self, cpu: CpuId) {
        self.resched.push(cpu);
    }

    // Called once before and once after each draw.
    fn draw_clock_ns(&mut self) -> TimeNs {
        let now = self.draw_clock;
        self.draw_clock += DRAW_COST_NS;
        now
    }
}
