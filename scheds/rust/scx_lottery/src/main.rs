// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
mod stats;
mod workload;

use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use crossbeam::channel::Receiver;
use crossbeam::channel::RecvTimeoutError;
use crossbeam::channel::Sender;
use log::debug;
use log::info;
use log::warn;
use scx_stats::prelude::*;

use scx_lottery_core::CpuId;
use scx_lottery_core::LinearQueue;
use scx_lottery_core::LotteryConfig;
use scx_lottery_core::LotteryScheduler;
use scx_lottery_core::Pid;
use scx_lottery_core::SimHost;
use scx_lottery_core::TicketQueue;
use scx_lottery_core::TicketTree;
use scx_lottery_core::TimeNs;

use stats::EventRecord;
use stats::EventRecords;
use stats::Metrics;
use stats::StatsReq;
use stats::StatsRes;
use workload::Behavior;
use workload::SimTask;
use workload::TaskSpec;
use workload::TaskState;

const SCHEDULER_NAME: &str = "scx_lottery";

const NSEC_PER_USEC: u64 = 1_000;
const NSEC_PER_SEC: u64 = 1_000_000_000;

/// scx_lottery: lottery scheduling on simulated CPUs
///
/// Every scheduling decision is a lottery: each runnable task holds a number of tickets and the
/// next task to run is drawn at random, with a probability proportional to its tickets. Over time
/// each task receives a share of its CPU equal to its share of the tickets on that CPU.
///
/// The scheduler keeps one run queue per CPU. Runnable tasks are stored in a red-black tree keyed
/// by ticket count, where every node also tracks the tickets held by its subtrees, so a draw is a
/// single O(log n) descent. `--rq-list` switches to the plain list variant, where a draw walks the
/// queue summing tickets.
///
/// The CPUs, the clock and the tasks are simulated: hogs that never block, interactive tasks that
/// alternate CPU bursts and sleeps, and yielders that give up the CPU after each burst. At the end
/// the ticket share of each task is printed next to the CPU time it actually received.
#[derive(Debug, Parser)]
struct Opts {
    /// Number of simulated CPUs.
    #[clap(short = 'n', long, default_value = "1")]
    nr_cpus: usize,

    /// Task to simulate, as name:tickets[:run_us:sleep_us]. Can be repeated. Without burst
    /// lengths the task never blocks; with sleep_us=0 it yields after each burst.
    #[clap(short = 't', long = "task")]
    tasks: Vec<TaskSpec>,

    /// Number of tasks to generate when no --task is given.
    #[clap(long, default_value = "4")]
    nr_tasks: usize,

    /// Minimum tickets of a generated task.
    #[clap(long, default_value = "1")]
    min_tickets: u64,

    /// Maximum tickets of a generated task.
    #[clap(long, default_value = "100")]
    max_tickets: u64,

    /// Scheduler tick (and time slice) in microseconds.
    #[clap(short = 's', long, default_value = "1000")]
    tick_us: u64,

    /// Simulated run time in milliseconds. 0 runs until interrupted.
    #[clap(short = 'd', long, default_value = "1000")]
    duration_ms: u64,

    /// Seed of the lottery random source.
    #[clap(long, default_value = "42")]
    seed: u64,

    /// Use the list-backed run queue instead of the ticket tree.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    rq_list: bool,

    /// Number of events kept in the event log.
    #[clap(long, default_value = "10000")]
    log_capacity: usize,

    /// Disable the event log.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    no_log: bool,

    /// Print the unread part of the event log at exit.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    dump_events: bool,

    /// Run simulated time at wall clock speed.
    #[clap(short = 'p', long, action = clap::ArgAction::SetTrue)]
    pace: bool,

    /// Print metrics every this many simulated seconds.
    #[clap(long)]
    stats: Option<f64>,

    /// Expose metrics and the event log through the scx_stats socket server.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    serve_stats: bool,

    /// Run in stats monitoring mode with the specified interval. Connects to a running instance
    /// started with --serve-stats; no simulation is launched.
    #[clap(long)]
    monitor: Option<f64>,

    /// With --monitor, stream the event log of the running instance instead of its metrics.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    monitor_events: bool,

    /// Enable verbose output. Repeat for more detail.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Print scheduler version and exit.
    #[clap(short = 'V', long, action = clap::ArgAction::SetTrue)]
    version: bool,

    /// Show descriptions for statistics.
    #[clap(long)]
    help_stats: bool,
}

impl Opts {
    fn lottery_config(&self) -> LotteryConfig {
        LotteryConfig {
            nr_cpus: self.nr_cpus,
            log_capacity: self.log_capacity,
            slice_us: self.tick_us,
            logging: !self.no_log,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.min_tickets == 0 {
            bail!("--min-tickets must be at least 1");
        }
        if self.min_tickets > self.max_tickets {
            bail!(
                "--min-tickets ({}) is greater than --max-tickets ({})",
                self.min_tickets,
                self.max_tickets
            );
        }
        if self.tasks.is_empty() && self.nr_tasks == 0 {
            bail!("nothing to schedule, use --task or --nr-tasks");
        }
        if let Some(intv) = self.stats {
            if !(intv > 0.0) {
                bail!("--stats interval must be positive");
            }
        }
        Ok(())
    }
}

struct Scheduler<'a, Q: TicketQueue> {
    opts: &'a Opts,
    host: SimHost,
    sched: LotteryScheduler<Q>,
    tasks: Vec<SimTask>,
    tick_ns: TimeNs,
    stats_server: Option<StatsServer<StatsReq, StatsRes>>,
}

impl<'a, Q: TicketQueue> Scheduler<'a, Q> {
    fn init(opts: &'a Opts) -> Result<Self> {
        let config = opts.lottery_config();
        let mut host = SimHost::new(config.nr_cpus, opts.seed);
        let sched = LotteryScheduler::new(config, &mut host)?;

        let specs = if opts.tasks.is_empty() {
            workload::generate(&mut host, opts.nr_tasks, opts.min_tickets, opts.max_tickets)
        } else {
            opts.tasks.clone()
        };
        let tasks: Vec<SimTask> = specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| {
                let pid = Pid(i as i32 + 1);
                let cpu = CpuId((i % opts.nr_cpus) as u32);
                SimTask::new(pid, cpu, spec)
            })
            .collect();

        let stats_server = if opts.serve_stats {
            Some(
                StatsServer::new(stats::server_data())
                    .launch()
                    .context("Failed to launch the stats server")?,
            )
        } else {
            None
        };

        let tick_ns = sched.rr_interval().as_nanos() as TimeNs;
        info!(
            "{} scheduler started ({} CPUs, {} tasks, {} run queue)",
            SCHEDULER_NAME,
            opts.nr_cpus,
            tasks.len(),
            Q::NAME
        );

        Ok(Self {
            opts,
            host,
            sched,
            tasks,
            tick_ns,
            stats_server,
        })
    }

    fn task_mut(tasks: &mut [SimTask], pid: Pid) -> Option<&mut SimTask> {
        tasks.iter_mut().find(|t| t.pid == pid)
    }

    fn nr_cpus(&self) -> u32 {
        self.opts.nr_cpus as u32
    }

    fn get_metrics(&self) -> Metrics {
        let s = self.sched.stats();
        let (nr_running, total_tickets) = (0..self.nr_cpus())
            .filter_map(|cpu| self.sched.rq(CpuId(cpu)))
            .fold((0, 0), |(n, t), rq| (n + rq.nr_running(), t + rq.total_tickets()));

        Metrics {
            nr_cpus: self.opts.nr_cpus as u64,
            sim_time_us: self.host.now() / NSEC_PER_USEC,
            nr_running,
            total_tickets,
            nr_draws: s.nr_draws,
            draw_latency_ns: s.draw_latency_ns,
            avg_draw_ns: s.latency_per_draw(),
            nr_enqueues: s.nr_enqueues,
            nr_dequeues: s.nr_dequeues,
            nr_yields: s.nr_yields,
            nr_preempts: s.nr_preempts,
        }
    }

    fn handle_stats_req(&mut self, req: StatsReq) -> StatsRes {
        match req {
            StatsReq::Metrics => StatsRes::Metrics(self.get_metrics()),
            StatsReq::Events { max } => {
                let log = self.sched.event_log_mut();
                let mut events = Vec::new();
                while events.len() < max {
                    let Some(ev) = log.read() else {
                        break;
                    };
                    events.push(EventRecord {
                        timestamp: ev.timestamp,
                        action: ev.action.name().to_string(),
                        msg: ev.msg,
                    });
                }
                StatsRes::Events(EventRecords { events })
            }
            StatsReq::Reset { events } => {
                if events {
                    self.sched.reset_event_log();
                } else {
                    self.sched.reset_stats();
                }
                StatsRes::Metrics(self.get_metrics())
            }
        }
    }

    /// Answer stats requests until `timeout` expires.
    fn serve_stats(
        &mut self,
        channels: Option<&(Sender<StatsRes>, Receiver<StatsReq>)>,
        timeout: Duration,
    ) -> Result<()> {
        let Some((res_ch, req_ch)) = channels else {
            if !timeout.is_zero() {
                thread::sleep(timeout);
            }
            return Ok(());
        };

        let deadline = Instant::now() + timeout;
        loop {
            match req_ch.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(req) => {
                    let res = self.handle_stats_req(req);
                    res_ch.send(res)?;
                }
                Err(RecvTimeoutError::Timeout) => return Ok(()),
                Err(e) => Err(e)?,
            }
        }
    }

    fn start(&mut self) {
        let Self {
            host, sched, tasks, ..
        } = self;
        for task in tasks.iter() {
            sched.enqueue_task(host, task.cpu, task.pid, task.spec.tickets);
        }
        for cpu in 0..self.opts.nr_cpus {
            self.sched.pick_next_task(&mut self.host, CpuId(cpu as u32));
        }
    }

    /// Advance the simulation by one tick.
    fn tick(&mut self) {
        let Self {
            host,
            sched,
            tasks,
            tick_ns,
            opts,
            ..
        } = self;
        host.advance(*tick_ns);
        let now = host.now();

        for cpu in (0..opts.nr_cpus as u32).map(CpuId) {
            let curr = sched.rq(cpu).and_then(|rq| rq.curr());
            if let Some(curr) = curr {
                if let Some(task) = Self::task_mut(tasks, curr.pid) {
                    match task.charge(*tick_ns, now) {
                        Some(Behavior::Interactive) => {
                            sched.dequeue_task(host, cpu, curr.pid);
                            sched.put_prev_task(host, cpu, curr.pid);
                        }
                        Some(Behavior::Yielder) => sched.yield_task(host, cpu, curr.pid),
                        _ => {}
                    }
                }
            }
            sched.task_tick(host, cpu);
        }

        for task in tasks.iter_mut() {
            if task.should_wake(now) {
                task.state = TaskState::Runnable;
                if sched.enqueue_task(host, task.cpu, task.pid, task.spec.tickets) {
                    sched.check_preempt_curr(host, task.cpu, task.pid);
                }
            }
        }

        for cpu in (0..opts.nr_cpus as u32).map(CpuId) {
            let curr = sched.rq(cpu).and_then(|rq| rq.curr());
            if !host.take_resched(cpu) && curr.is_some() {
                continue;
            }
            if let Some(curr) = curr {
                sched.put_prev_task(host, cpu, curr.pid);
            }
            sched.pick_next_task(host, cpu);
        }
    }

    fn stop(&mut self) {
        let Self {
            host, sched, opts, ..
        } = self;
        for cpu in (0..opts.nr_cpus as u32).map(CpuId) {
            if let Some(curr) = sched.rq(cpu).and_then(|rq| rq.curr()) {
                sched.put_prev_task(host, cpu, curr.pid);
            }
        }
    }

    fn report<W: Write>(&mut self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "{:<12} {:>6} {:>4} {:>8} {:>8} {:>8} {:>12}",
            "task", "pid", "cpu", "tickets", "share%", "cpu%", "runtime_us"
        )?;
        for task in self.tasks.iter() {
            let Some(rq) = self.sched.rq(task.cpu) else {
                continue;
            };
            let siblings: Vec<&SimTask> =
                self.tasks.iter().filter(|t| t.cpu == task.cpu).collect();
            let cpu_tickets: u64 = siblings.iter().map(|t| t.spec.tickets).sum();
            let cpu_runtime: u64 = siblings
                .iter()
                .map(|t| rq.sum_exec_runtime(t.pid))
                .sum();
            let runtime = rq.sum_exec_runtime(task.pid);

            writeln!(
                w,
                "{:<12} {:>6} {:>4} {:>8} {:>8.2} {:>8.2} {:>12}",
                task.spec.name,
                task.pid,
                task.cpu,
                task.spec.tickets,
                percent(task.spec.tickets, cpu_tickets),
                percent(runtime, cpu_runtime),
                runtime / NSEC_PER_USEC,
            )?;
        }

        writeln!(w)?;
        write!(w, "{}", self.sched.stats())?;
        writeln!(w)?;
        write!(w, "{}", self.sched.stats().latency_report())?;

        if self.opts.dump_events {
            writeln!(w)?;
            while let Some(ev) = self.sched.event_log_mut().read() {
                writeln!(w, "{}", ev)?;
            }
        }
        Ok(())
    }

    fn exit(&mut self) {
        let Self {
            host, sched, tasks, ..
        } = self;
        for task in tasks.iter() {
            sched.task_dead(host, task.cpu, task.pid);
        }
    }

    fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let channels = self.stats_server.as_ref().map(|s| s.channels());
        let end_ns = self.opts.duration_ms.saturating_mul(1_000_000);
        let stats_intv_ns = self
            .opts
            .stats
            .map(|intv| ((intv * NSEC_PER_SEC as f64) as TimeNs).max(self.tick_ns));
        let pace = if self.opts.pace {
            Duration::from_nanos(self.tick_ns)
        } else {
            Duration::ZERO
        };

        self.start();
        let mut prev_metrics = self.get_metrics();
        let mut next_report = stats_intv_ns.unwrap_or(0);

        while !shutdown.load(Ordering::Relaxed) && (end_ns == 0 || self.host.now() < end_ns) {
            self.tick();
            self.serve_stats(channels.as_ref(), pace)?;

            if let Some(intv) = stats_intv_ns {
                if self.host.now() >= next_report {
                    let metrics = self.get_metrics();
                    metrics.delta(&prev_metrics).format(&mut std::io::stdout())?;
                    prev_metrics = metrics;
                    next_report += intv;
                }
            }
        }

        self.stop();
        debug!("simulation stopped at {} us", self.host.now() / NSEC_PER_USEC);
        self.report(&mut std::io::stdout())?;
        self.exit();
        Ok(())
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

impl<Q: TicketQueue> Drop for Scheduler<'_, Q> {
    fn drop(&mut self) {
        info!("Unregister {} scheduler", SCHEDULER_NAME);
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if opts.version {
        println!(
            "{} {} - scx_lottery_core {}",
            SCHEDULER_NAME,
            env!("CARGO_PKG_VERSION"),
            scx_lottery_core::VERSION
        );
        return Ok(());
    }

    if opts.help_stats {
        stats::server_data().describe_meta(&mut std::io::stdout(), None)?;
        return Ok(());
    }

    let loglevel = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };

    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if let Some(intv) = opts.monitor {
        let intv = Duration::from_secs_f64(intv);
        let res = if opts.monitor_events {
            stats::monitor_events(intv, shutdown)
        } else {
            stats::monitor(intv, shutdown)
        };
        if let Err(e) = res {
            warn!("stats monitor finished because of an error {}", e);
        }
        return Ok(());
    }

    opts.validate()?;
    if opts.rq_list {
        Scheduler::<LinearQueue>::init(&opts)?.run(shutdown)
    } else {
        Scheduler::<TicketTree>::init(&opts)?.run(shutdown)
    }
}
