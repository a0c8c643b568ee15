//! Scheduler statistics counters.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::types::TimeNs;

/// Lottery scheduler counters.
///
/// The counters only ever grow between resets. The struct is `Copy`, so a
/// snapshot taken through a shared reference is always a consistent set of
/// all six values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotteryStats {
    /// Draws performed.
    pub nr_draws: u64,
    /// Cumulative time spent inside draws.
    pub draw_latency_ns: u64,
    pub nr_enqueues: u64,
    pub nr_dequeues: u64,
    pub nr_yields: u64,
    pub nr_preempts: u64,
}

impl LotteryStats {
    pub fn record_draw(&mut self, latency: TimeNs) {
        self.nr_draws += 1;
        self.draw_latency_ns = self.draw_latency_ns.saturating_add(latency);
    }

    pub fn record_enqueue(&mut self) {
        self.nr_enqueues += 1;
    }

    pub fn record_dequeue(&mut self) {
        self.nr_dequeues += 1;
    }

    pub fn record_yield(&mut self) {
        self.nr_yields += 1;
    }

    pub fn record_preempt(&mut self) {
        self.nr_preempts += 1;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn snapshot(&self) -> Self {
        *self
    }

    /// Mean draw latency, 0 before the first draw.
    pub fn latency_per_draw(&self) -> u64 {
        self.draw_latency_ns.checked_div(self.nr_draws).unwrap_or(0)
    }

    pub fn latency_report(&self) -> LatencyReport {
        LatencyReport {
            iterations: self.nr_draws,
            latency_ns: self.draw_latency_ns,
        }
    }

    /// Reset on any write to the control surface; the whole input counts as
    /// consumed.
    pub fn reset_from_write(&mut self, buf: &[u8]) -> usize {
        self.reset();
        buf.len()
    }
}

impl fmt::Display for LotteryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>21} {:>12}", "Lottery Iterations", self.nr_draws)?;
        writeln!(f, "{:>21} {:>12} NS", "Lottery Latency", self.draw_latency_ns)?;
        writeln!(f, "{:>21} {:>12}", "Enqueued Tasks", self.nr_enqueues)?;
        writeln!(f, "{:>21} {:>12}", "Dequeued Tasks", self.nr_dequeues)?;
        writeln!(f, "{:>21} {:>12}", "Yielded Tasks", self.nr_yields)?;
        writeln!(f, "{:>21} {:>12}", "Preemptions", self.nr_preempts)
    }
}

/// Draw count and latency summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyReport {
    pub iterations: u64,
    pub latency_ns: u64,
}

impl LatencyReport {
    pub fn per_iteration(&self) -> u64 {
        self.latency_ns.checked_div(self.iterations).unwrap_or(0)
    }
}

impl fmt::Display for LatencyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Iteration-> {}\nLatency -> {} NS\nLatency_Per_Iteration -> {}NS\n",
            self.iterations,
            self.latency_ns,
            self.per_iteration()
        )
    }
}
