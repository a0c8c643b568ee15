mod common;

use common::ScriptedHost;
use common::DRAW_COST_NS;
use scx_lottery_core::*;

const CPU0: CpuId = CpuId(0);

fn msgs(log: &EventLog, action: Action) -> Vec<String> {
    log.iter()
        .filter(|e| e.action == action)
        .map(|e| e.msg.clone())
        .collect()
}

/// Behaviour shared by every ticket queue backend.
macro_rules! lottery_tests {
    ($queue:ty) => {
        use super::*;

        fn sched(host: &mut ScriptedHost, nr_cpus: usize) -> LotteryScheduler<$queue> {
            let config = LotteryConfig {
                nr_cpus,
                ..Default::default()
            };
            LotteryScheduler::new(config, host).unwrap()
        }

        #[test]
        fn test_one_and_three_tickets() {
            let mut host = ScriptedHost::new(0);
            let mut s = sched(&mut host, 1);
            assert!(s.enqueue_task(&mut host, CPU0, Pid(1), 1));
            assert!(s.enqueue_task(&mut host, CPU0, Pid(2), 3));

            host.script([0, 1, 2, 3]);
            let winners: Vec<Option<Pid>> =
                (0..4).map(|_| s.pick_next_task(&mut host, CPU0)).collect();
            assert_eq!(
                winners,
                vec![Some(Pid(1)), Some(Pid(2)), Some(Pid(2)), Some(Pid(2))]
            );
            assert_eq!(s.stats().nr_draws, 4);
        }

        #[test]
        fn test_nothing_runnable() {
            let mut host = ScriptedHost::new(0);
            let mut s = sched(&mut host, 1);
            assert_eq!(s.pick_next_task(&mut host, CPU0), None);
            assert!(msgs(s.event_log(), Action::PickNext).is_empty());
            assert_eq!(s.stats().nr_draws, 0);

            s.enqueue_task(&mut host, CPU0, Pid(1), 4);
            s.dequeue_task(&mut host, CPU0, Pid(1));
            assert_eq!(s.pick_next_task(&mut host, CPU0), None);
            assert!(msgs(s.event_log(), Action::PickNext).is_empty());
        }

        #[test]
        fn test_dequeued_task_never_wins() {
            let mut host = ScriptedHost::new(3);
            let mut s = sched(&mut host, 1);
            s.enqueue_task(&mut host, CPU0, Pid(1), 10);
            s.enqueue_task(&mut host, CPU0, Pid(2), 20);
            s.enqueue_task(&mut host, CPU0, Pid(3), 30);
            assert!(s.dequeue_task(&mut host, CPU0, Pid(2)));
            assert_eq!(s.rq(CPU0).unwrap().total_tickets(), 40);

            let mut wins = [0u32; 4];
            for _ in 0..4000 {
                let pid = s.pick_next_task(&mut host, CPU0).unwrap();
                wins[pid.0 as usize] += 1;
            }
            assert_eq!(wins[2], 0);
            // Expect 1000 / 3000.
            assert!((800..1200).contains(&wins[1]), "{:?}", wins);
            assert!((2800..3200).contains(&wins[3]), "{:?}", wins);
        }

        #[test]
        fn test_event_messages() {
            let mut host = ScriptedHost::new(0);
            let mut s = sched(&mut host, 1);
            host.now = 500;
            s.enqueue_task(&mut host, CPU0, Pid(7), 3);
            host.script([0]);
            s.pick_next_task(&mut host, CPU0);
            s.task_tick(&mut host, CPU0);
            s.dequeue_task(&mut host, CPU0, Pid(7));

            let log = s.event_log();
            assert_eq!(msgs(log, Action::Enqueue), vec!["PID:7 with tickets 3"]);
            assert_eq!(msgs(log, Action::PickNext), vec!["PID:7 with 3 tickets"]);
            assert_eq!(msgs(log, Action::ContextSwitch), vec!["idle -> PID:7"]);
            assert_eq!(msgs(log, Action::Tick), vec!["PID: 7 with 3 tickets"]);
            assert_eq!(msgs(log, Action::Dequeue), vec!["PID:7 with tickets 3"]);

            let last = log.iter().last().unwrap();
            assert_eq!(last.to_string(), "[500] DEQUEUE {PID:7 with tickets 3}");
        }

        #[test]
        fn test_contract_violations_are_noops() {
            let mut host = ScriptedHost::new(0);
            let mut s = sched(&mut host, 1);
            s.enqueue_task(&mut host, CPU0, Pid(1), 5);
            s.reset_event_log();
            let before = *s.stats();

            assert!(!s.dequeue_task(&mut host, CPU0, Pid(9)));
            assert!(!s.enqueue_task(&mut host, CPU0, Pid(1), 5));
            assert!(!s.enqueue_task(&mut host, CPU0, Pid(2), 0));
            assert!(!s.enqueue_task(&mut host, CpuId(3), Pid(3), 1));
            assert!(!s.check_preempt_curr(&mut host, CPU0, Pid(9)));
            assert_eq!(s.pick_next_task(&mut host, CpuId(3)), None);
            s.yield_task(&mut host, CPU0, Pid(9));
            s.put_prev_task(&mut host, CPU0, Pid(1));
            s.set_curr_task(&mut host, CPU0, Pid(9));
            s.task_tick(&mut host, CpuId(3));

            assert_eq!(*s.stats(), before);
            assert_eq!(s.event_log().len(), 10);
            assert!(s.event_log().iter().all(|e| e.action == Action::Msg));
            let rq = s.rq(CPU0).unwrap();
            assert_eq!(rq.total_tickets(), 5);
            assert_eq!(rq.nr_running(), 1);
            assert_eq!(rq.curr(), None);
            assert!(host.take_resched().is_empty());
        }

        #[test]
        fn test_out_of_range_point() {
            let mut host = ScriptedHost::new(0);
            let mut s = sched(&mut host, 1);
            s.enqueue_task(&mut host, CPU0, Pid(1), 2);
            host.script([2]);
            assert_eq!(s.pick_next_task(&mut host, CPU0), None);
            assert_eq!(s.stats().nr_draws, 0);
            assert_eq!(msgs(s.event_log(), Action::Msg).len(), 2);
        }

        #[test]
        fn test_tick_always_reschedules() {
            let mut host = ScriptedHost::new(0);
            let mut s = sched(&mut host, 2);
            s.task_tick(&mut host, CpuId(1));
            assert_eq!(host.take_resched(), vec![CpuId(1)]);
            assert_eq!(msgs(s.event_log(), Action::Tick), vec!["idle"]);

            s.enqueue_task(&mut host, CPU0, Pid(1), 1);
            s.pick_next_task(&mut host, CPU0);
            s.task_tick(&mut host, CPU0);
            s.task_tick(&mut host, CPU0);
            assert_eq!(host.take_resched(), vec![CPU0, CPU0]);
        }

        #[test]
        fn test_preempt_only_when_winner_differs() {
            let mut host = ScriptedHost::new(0);
            let mut s = sched(&mut host, 1);
            s.enqueue_task(&mut host, CPU0, Pid(1), 1);
            s.enqueue_task(&mut host, CPU0, Pid(2), 3);
            host.script([0]);
            assert_eq!(s.pick_next_task(&mut host, CPU0), Some(Pid(1)));

            host.script([0]);
            assert!(!s.check_preempt_curr(&mut host, CPU0, Pid(2)));
            assert_eq!(s.stats().nr_preempts, 0);
            assert!(host.take_resched().is_empty());

            host.script([3]);
            assert!(s.check_preempt_curr(&mut host, CPU0, Pid(2)));
            assert_eq!(s.stats().nr_preempts, 1);
            assert_eq!(s.stats().nr_draws, 3);
            assert_eq!(host.take_resched(), vec![CPU0]);
            assert_eq!(
                msgs(s.event_log(), Action::Preempt),
                vec!["Curr PID:1, candidate PID:2, winner PID:2"]
            );
            // The draw doesn't switch tasks by itself.
            assert_eq!(s.rq(CPU0).unwrap().curr().map(|c| c.pid), Some(Pid(1)));
        }

        #[test]
        fn test_preempt_check_on_idle_cpu() {
            let mut host = ScriptedHost::new(0);
            let mut s = sched(&mut host, 1);
            s.enqueue_task(&mut host, CPU0, Pid(1), 1);
            assert!(!s.check_preempt_curr(&mut host, CPU0, Pid(1)));
            assert_eq!(host.take_resched(), vec![CPU0]);
            assert_eq!(s.stats().nr_draws, 0);
        }

        #[test]
        fn test_draw_latency() {
            let mut host = ScriptedHost::new(0);
            let mut s = sched(&mut host, 1);
            s.enqueue_task(&mut host, CPU0, Pid(1), 1);
            for _ in 0..5 {
                s.pick_next_task(&mut host, CPU0);
            }
            let stats = s.stats().snapshot();
            assert_eq!(stats.draw_latency_ns, 5 * DRAW_COST_NS);
            assert_eq!(stats.latency_per_draw(), DRAW_COST_NS);

            s.reset_stats();
            assert_eq!(*s.stats(), LotteryStats::default());
        }

        #[test]
        fn test_yield_counts_and_reschedules() {
            let mut host = ScriptedHost::new(0);
            let mut s = sched(&mut host, 1);
            s.enqueue_task(&mut host, CPU0, Pid(1), 2);
            s.pick_next_task(&mut host, CPU0);
            s.yield_task(&mut host, CPU0, Pid(1));
            assert_eq!(s.stats().nr_yields, 1);
            assert_eq!(host.take_resched(), vec![CPU0]);
            assert_eq!(s.rq(CPU0).unwrap().total_tickets(), 2);
        }

        #[test]
        fn test_run_queues_are_independent() {
            let mut host = ScriptedHost::new(0);
            let mut s = sched(&mut host, 2);
            s.enqueue_task(&mut host, CPU0, Pid(1), 100);
            s.enqueue_task(&mut host, CpuId(1), Pid(2), 1);
            for _ in 0..50 {
                assert_eq!(s.pick_next_task(&mut host, CpuId(1)), Some(Pid(2)));
            }
            assert!(!s.dequeue_task(&mut host, CpuId(1), Pid(1)));
            assert_eq!(s.rq(CPU0).unwrap().total_tickets(), 100);
        }

        #[test]
        fn test_ticket_total_overflow_rejected() {
            let mut host = ScriptedHost::new(0);
            let mut s = sched(&mut host, 1);
            assert!(s.enqueue_task(&mut host, CPU0, Pid(1), u64::MAX));
            s.reset_event_log();

            assert!(!s.enqueue_task(&mut host, CPU0, Pid(2), 1));
            assert_eq!(s.stats().nr_enqueues, 1);
            assert_eq!(msgs(s.event_log(), Action::Msg).len(), 1);
            assert!(msgs(s.event_log(), Action::Enqueue).is_empty());

            let rq = s.rq(CPU0).unwrap();
            assert_eq!(rq.total_tickets(), u64::MAX);
            assert_eq!(rq.queue().total_tickets(), u64::MAX);
            assert_eq!(rq.nr_running(), 1);
            assert!(!rq.queue().contains(Pid(2)));
            assert_eq!(s.pick_next_task(&mut host, CPU0), Some(Pid(1)));
        }

        #[test]
        fn test_ticket_change_overflow_keeps_task() {
            let mut host = ScriptedHost::new(0);
            let mut s = sched(&mut host, 1);
            s.enqueue_task(&mut host, CPU0, Pid(1), u64::MAX - 1);
            s.enqueue_task(&mut host, CPU0, Pid(2), 1);

            assert!(!s.set_tickets(&mut host, CPU0, Pid(2), 2));
            assert_eq!(s.stats().nr_dequeues, 0);
            let rq = s.rq(CPU0).unwrap();
            assert_eq!(rq.queue().tickets(Pid(2)), Some(1));
            assert_eq!(rq.total_tickets(), u64::MAX);

            assert!(s.set_tickets(&mut host, CPU0, Pid(1), 5));
            assert_eq!(s.rq(CPU0).unwrap().total_tickets(), 6);
        }

        #[test]
        fn test_set_curr_switches_and_charges_prev() {
            let mut host = ScriptedHost::new(0);
            let mut s = sched(&mut host, 1);
            s.enqueue_task(&mut host, CPU0, Pid(1), 1);
            s.enqueue_task(&mut host, CPU0, Pid(2), 3);
            host.script([0]);
            assert_eq!(s.pick_next_task(&mut host, CPU0), Some(Pid(1)));

            host.now = 100;
            s.set_curr_task(&mut host, CPU0, Pid(2));
            assert_eq!(
                s.rq(CPU0).unwrap().curr(),
                Some(CurrTask {
                    pid: Pid(2),
                    tickets: 3,
                    exec_start: 100,
                })
            );
            assert_eq!(s.sum_exec_runtime(CPU0, Pid(1)), 100);

            host.now = 250;
            s.put_prev_task(&mut host, CPU0, Pid(2));
            assert_eq!(s.sum_exec_runtime(CPU0, Pid(2)), 150);
            assert_eq!(s.sum_exec_runtime(CPU0, Pid(1)), 100);
            assert_eq!(s.stats().nr_draws, 1);
        }

        #[test]
        fn test_set_curr_on_running_task_restarts_period() {
            let mut host = ScriptedHost::new(0);
            let mut s = sched(&mut host, 1);
            s.enqueue_task(&mut host, CPU0, Pid(1), 3);
            s.pick_next_task(&mut host, CPU0);

            host.now = 40;
            s.set_curr_task(&mut host, CPU0, Pid(1));
            let curr = s.rq(CPU0).unwrap().curr().unwrap();
            assert_eq!(curr.exec_start, 40);
            assert_eq!(s.sum_exec_runtime(CPU0, Pid(1)), 0);

            host.now = 100;
            s.put_prev_task(&mut host, CPU0, Pid(1));
            assert_eq!(s.sum_exec_runtime(CPU0, Pid(1)), 60);
        }

        #[test]
        fn test_prio_change_reschedules_only_running() {
            let mut host = ScriptedHost::new(0);
            let mut s = sched(&mut host, 1);
            s.enqueue_task(&mut host, CPU0, Pid(1), 3);
            s.enqueue_task(&mut host, CPU0, Pid(2), 3);
            s.pick_next_task(&mut host, CPU0);
            host.take_resched();

            s.prio_changed(&mut host, CPU0, Pid(2), false);
            assert!(host.take_resched().is_empty());
            s.prio_changed(&mut host, CPU0, Pid(1), true);
            assert_eq!(host.take_resched(), vec![CPU0]);
        }

        #[test]
        fn test_reset_surfaces() {
            let mut host = ScriptedHost::new(0);
            let mut s = sched(&mut host, 1);
            s.enqueue_task(&mut host, CPU0, Pid(1), 1);
            s.pick_next_task(&mut host, CPU0);

            assert_eq!(s.event_log_mut().reset_from_write(b"reset\n"), 6);
            assert_eq!(s.event_log_mut().read(), None);
            s.reset_event_log();
            assert_eq!(s.event_log_mut().read(), None);

            s.enqueue_task(&mut host, CPU0, Pid(2), 1);
            let ev = s.event_log_mut().read().unwrap();
            assert_eq!(ev.action, Action::Enqueue);
            assert_eq!(s.event_log_mut().read(), None);
        }
    };
}

mod tree {
    lottery_tests!(TicketTree);

    #[test]
    fn test_yield_keeps_tree_shape() {
        let mut host = ScriptedHost::new(0);
        let mut s = sched(&mut host, 1);
        s.enqueue_task(&mut host, CPU0, Pid(1), 1);
        s.enqueue_task(&mut host, CPU0, Pid(2), 3);
        let before = s.rq(CPU0).unwrap().queue().entries();
        s.yield_task(&mut host, CPU0, Pid(1));
        assert_eq!(s.rq(CPU0).unwrap().queue().entries(), before);
    }
}

mod list {
    lottery_tests!(LinearQueue);

    #[test]
    fn test_yield_moves_task_to_tail() {
        let mut host = ScriptedHost::new(0);
        let mut s = sched(&mut host, 1);
        s.enqueue_task(&mut host, CPU0, Pid(1), 1);
        s.enqueue_task(&mut host, CPU0, Pid(2), 3);
        s.yield_task(&mut host, CPU0, Pid(1));

        host.script([0, 3]);
        assert_eq!(s.pick_next_task(&mut host, CPU0), Some(Pid(2)));
        assert_eq!(s.pick_next_task(&mut host, CPU0), Some(Pid(1)));
    }
}
