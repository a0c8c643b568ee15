use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use anyhow::bail;
use anyhow::Result;
use crossbeam::channel::Receiver;
use log::info;
use log::warn;
use scx_stats::prelude::*;
use scx_stats_derive::stat_doc;
use scx_stats_derive::Stats;
use serde::Deserialize;
use serde::Serialize;

#[stat_doc]
#[derive(Clone, Debug, Default, Serialize, Deserialize, Stats)]
#[stat(top)]
pub struct Metrics {
    #[stat(desc = "Number of simulated CPUs")]
    pub nr_cpus: u64,
    #[stat(desc = "Simulated time in microseconds")]
    pub sim_time_us: u64,
    #[stat(desc = "Tasks queued on all run queues")]
    pub nr_running: u64,
    #[stat(desc = "Tickets held by all queued tasks")]
    pub total_tickets: u64,
    #[stat(desc = "Number of lottery draws")]
    pub nr_draws: u64,
    #[stat(desc = "Time spent in lottery draws (ns)")]
    pub draw_latency_ns: u64,
    #[stat(desc = "Average time per lottery draw (ns)")]
    pub avg_draw_ns: u64,
    #[stat(desc = "Number of enqueued tasks")]
    pub nr_enqueues: u64,
    #[stat(desc = "Number of dequeued tasks")]
    pub nr_dequeues: u64,
    #[stat(desc = "Number of yields")]
    pub nr_yields: u64,
    #[stat(desc = "Number of preemptions requested on wakeup")]
    pub nr_preempts: u64,
}

impl Metrics {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "[{}] t: {:>8}us | tasks: {:>4} tickets: {:>8} | draws: {:>8} avg: {:>6}ns | enq: {:>6} deq: {:>6} yield: {:>5} preempt: {:>5}",
            crate::SCHEDULER_NAME,
            self.sim_time_us,
            self.nr_running,
            self.total_tickets,
            self.nr_draws,
            self.avg_draw_ns,
            self.nr_enqueues,
            self.nr_dequeues,
            self.nr_yields,
            self.nr_preempts,
        )?;
        Ok(())
    }

    pub fn delta(&self, rhs: &Self) -> Self {
        let nr_draws = self.nr_draws.saturating_sub(rhs.nr_draws);
        let draw_latency_ns = self.draw_latency_ns.saturating_sub(rhs.draw_latency_ns);
        Self {
            nr_draws,
            draw_latency_ns,
            avg_draw_ns: draw_latency_ns.checked_div(nr_draws).unwrap_or(0),
            nr_enqueues: self.nr_enqueues.saturating_sub(rhs.nr_enqueues),
            nr_dequeues: self.nr_dequeues.saturating_sub(rhs.nr_dequeues),
            nr_yields: self.nr_yields.saturating_sub(rhs.nr_yields),
            nr_preempts: self.nr_preempts.saturating_sub(rhs.nr_preempts),
            ..self.clone()
        }
    }
}

#[stat_doc]
#[derive(Clone, Debug, Default, Serialize, Deserialize, Stats)]
pub struct EventRecord {
    #[stat(desc = "Simulated time of the event (ns)")]
    pub timestamp: u64,
    #[stat(desc = "Event kind")]
    pub action: String,
    #[stat(desc = "Event message")]
    pub msg: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, Stats)]
pub struct EventRecords {
    pub events: Vec<EventRecord>,
}

#[derive(Debug)]
pub enum StatsReq {
    Metrics,
    /// Read up to `max` unread events from the event log.
    Events { max: usize },
    /// Reset the counters, or the event log if `events` is set.
    Reset { events: bool },
}

impl StatsReq {
    fn from_args_events(args: &BTreeMap<String, String>) -> Result<Self> {
        let mut max = 1000;
        if let Some(arg) = args.get("max") {
            max = arg.trim().parse()?;
        }
        Ok(Self::Events { max })
    }

    fn from_args_reset(args: &BTreeMap<String, String>) -> Result<Self> {
        match args.get("target").map(|s| s.trim()) {
            None | Some("stats") => Ok(Self::Reset { events: false }),
            Some("events") => Ok(Self::Reset { events: true }),
            Some(other) => bail!("unknown reset target {:?}", other),
        }
    }
}

#[derive(Debug)]
pub enum StatsRes {
    Metrics(Metrics),
    Events(EventRecords),
}

fn recv_metrics(res_ch: &Receiver<StatsRes>) -> Result<Metrics> {
    match res_ch.recv()? {
        StatsRes::Metrics(m) => Ok(m),
        res => bail!("invalid response: {:?}", res),
    }
}

pub fn server_data() -> StatsServerData<StatsReq, StatsRes> {
    let open: Box<dyn StatsOpener<StatsReq, StatsRes>> = Box::new(move |(req_ch, res_ch)| {
        req_ch.send(StatsReq::Metrics)?;
        let mut prev = recv_metrics(res_ch)?;

        let read: Box<dyn StatsReader<StatsReq, StatsRes>> =
            Box::new(move |_args, (req_ch, res_ch)| {
                req_ch.send(StatsReq::Metrics)?;
                let cur = recv_metrics(res_ch)?;
                let delta = cur.delta(&prev);
                prev = cur;
                delta.to_json()
            });

        Ok(read)
    });

    let events_open: Box<dyn StatsOpener<StatsReq, StatsRes>> = Box::new(move |_| {
        let read: Box<dyn StatsReader<StatsReq, StatsRes>> =
            Box::new(move |args, (req_ch, res_ch)| {
                req_ch.send(StatsReq::from_args_events(args)?)?;
                match res_ch.recv()? {
                    StatsRes::Events(events) => events.to_json(),
                    res => bail!("invalid response: {:?}", res),
                }
            });
        Ok(read)
    });

    let reset_open: Box<dyn StatsOpener<StatsReq, StatsRes>> = Box::new(move |_| {
        let read: Box<dyn StatsReader<StatsReq, StatsRes>> =
            Box::new(move |args, (req_ch, res_ch)| {
                req_ch.send(StatsReq::from_args_reset(args)?)?;
                recv_metrics(res_ch)?.to_json()
            });
        Ok(read)
    });

    StatsServerData::new()
        .add_meta(Metrics::meta())
        .add_ops("top", StatsOps { open, close: None })
        .add_meta(EventRecord::meta())
        .add_ops(
            "events",
            StatsOps {
                open: events_open,
                close: None,
            },
        )
        .add_ops(
            "reset",
            StatsOps {
                open: reset_open,
                close: None,
            },
        )
}

/// Poll the stats server of a running instance every `intv` and hand each
/// decoded reply to `output`. Connection failures are retried once a second
/// until `should_exit` says stop.
pub fn monitor_stats<T>(
    stats_args: &[(String, String)],
    intv: Duration,
    mut should_exit: impl FnMut() -> bool,
    mut output: impl FnMut(T) -> Result<()>,
) -> Result<()>
where
    T: for<'a> Deserialize<'a>,
{
    const RETRYABLE_ERRORS: [std::io::ErrorKind; 2] = [
        std::io::ErrorKind::NotFound,
        std::io::ErrorKind::ConnectionRefused,
    ];
    let mut nr_retries: u32 = 0;

    while !should_exit() {
        let mut client = match StatsClient::new().connect() {
            Ok(client) => client,
            Err(e) => {
                let retryable = e
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|ioe| RETRYABLE_ERRORS.contains(&ioe.kind()));
                if !retryable {
                    return Err(e);
                }
                if nr_retries == 1 {
                    info!("Waiting for a {} stats server...", crate::SCHEDULER_NAME);
                }
                nr_retries += 1;
                sleep(Duration::from_secs(1));
                continue;
            }
        };
        nr_retries = 0;

        while !should_exit() {
            match client.request::<T>("stats", stats_args.to_vec()) {
                Ok(reply) => output(reply)?,
                Err(e) => {
                    match e.downcast_ref::<std::io::Error>() {
                        Some(ioe) => info!("Lost the stats server ({}), reconnecting", ioe),
                        None => warn!("Bad reply from the stats server: {}", e),
                    }
                    sleep(Duration::from_secs(1));
                    break;
                }
            }
            sleep(intv);
        }
    }

    Ok(())
}

/// Print the metrics of a running instance every `intv` until `shutdown`.
pub fn monitor(intv: Duration, shutdown: Arc<AtomicBool>) -> Result<()> {
    monitor_stats::<Metrics>(
        &[],
        intv,
        || shutdown.load(Ordering::Relaxed),
        |metrics| metrics.format(&mut std::io::stdout()),
    )
}

/// Stream the event log of a running instance, draining it every `intv`.
pub fn monitor_events(intv: Duration, shutdown: Arc<AtomicBool>) -> Result<()> {
    let args = [("target".to_string(), "events".to_string())];
    monitor_stats::<EventRecords>(
        &args,
        intv,
        || shutdown.load(Ordering::Relaxed),
        |records| {
            let mut out = std::io::stdout().lock();
            for ev in records.events.iter() {
                writeln!(out, "[{}] {} {{{}}}", ev.timestamp, ev.action, ev.msg)?;
            }
            Ok(())
        },
    )
}
