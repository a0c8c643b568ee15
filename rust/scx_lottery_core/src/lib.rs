// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Lottery scheduling core
//!
//! Lottery scheduling picks the next task at random, with a probability
//! proportional to the task's integer weight ("tickets"). This crate holds
//! the host-independent part of such a scheduler:
//!
//! - **Ticket queues**: [`TicketTree`], an augmented red-black tree giving
//!   O(log n) insert, remove and weighted draw, and [`LinearQueue`], the
//!   list-backed O(n) variant. Both implement [`TicketQueue`].
//! - **Scheduler**: [`LotteryScheduler`], the per-CPU run queues and the
//!   enqueue / dequeue / pick / preempt / tick / yield state machine the host
//!   calls into.
//! - **Observability**: [`EventLog`], a bounded ring of timestamped events
//!   with a lap-tracking reader, and [`LotteryStats`] counters, both with
//!   their fixed text renderings.
//!
//! The clock, the random source and reschedule requests come from the
//! [`Host`] passed into every callback. [`SimHost`] is a deterministic
//! implementation for simulation and tests.
//!
//! ```rust
//! use scx_lottery_core::*;
//!
//! let mut host = SimHost::new(1, 42);
//! let mut sched: LotteryScheduler =
//!     LotteryScheduler::new(LotteryConfig::default(), &mut host).unwrap();
//!
//! sched.enqueue_task(&mut host, CpuId(0), Pid(1), 10);
//! sched.enqueue_task(&mut host, CpuId(0), Pid(2), 30);
//!
//! let winner = sched.pick_next_task(&mut host, CpuId(0));
//! assert!(matches!(winner, Some(Pid(1)) | Some(Pid(2))));
//! print!("{}", sched.stats());
//! ```

pub mod config;
pub mod event_log;
pub mod host;
pub mod linear;
pub mod queue;
pub mod rq;
pub mod sched;
pub mod stats;
pub mod tree;
pub mod types;

pub use config::LotteryConfig;
pub use event_log::Action;
pub use event_log::Event;
pub use event_log::EventLog;
pub use host::Host;
pub use host::SimHost;
pub use linear::LinearQueue;
pub use queue::TicketQueue;
pub use rq::CurrTask;
pub use rq::LotteryRq;
pub use sched::LotteryScheduler;
pub use stats::LatencyReport;
pub use stats::LotteryStats;
pub use tree::TicketTree;
pub use types::CpuId;
pub use types::NodeId;
pub use types::Pid;
pub use types::Tickets;
pub use types::TimeNs;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
