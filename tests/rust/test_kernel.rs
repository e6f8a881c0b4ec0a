/// Integration tests for the event kernel: ordering, channels, timeouts and
/// process failure handling.
use fleetsim_core::error::SimError;
use fleetsim_core::kernel::{
    Behavior, Context, ExitOutcome, Kernel, ProcessExit, ProcessState, ReceivePort, Step, Wakeup,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Sleeps once, then fails with `reason` (or exits cleanly if `None`).
struct Crasher {
    after_ms: u64,
    reason: Option<&'static str>,
}

impl<W: 'static> Behavior<W> for Crasher {
    fn resume(&mut self, ctx: &mut Context<'_, W>, wakeup: Wakeup) -> Result<Step, SimError> {
        match (wakeup, self.reason) {
            (Wakeup::Start, _) => {
                ctx.delay(self.after_ms);
                Ok(Step::Suspend)
            }
            (_, Some(reason)) => Err(SimError::Process(reason.to_string())),
            (_, None) => Ok(Step::Exit),
        }
    }
}

#[test]
fn test_clock_never_goes_backwards() {
    let mut k: Kernel<Vec<u64>> = Kernel::new(Vec::new());
    let mut rng = ChaCha8Rng::seed_from_u64(42);

    for i in 0..20 {
        let delays: Vec<u64> = (0..10).map(|_| rng.gen_range(0..500)).collect();
        let mut next = 0;
        k.spawn_fn(&format!("p{}", i), move |ctx, _wake| {
            let now = ctx.now();
            ctx.world_mut().push(now);
            match delays.get(next) {
                Some(&d) => {
                    next += 1;
                    ctx.delay(d);
                    Ok(Step::Suspend)
                }
                None => Ok(Step::Exit),
            }
        })
        .unwrap();
    }
    k.run().unwrap();

    let seen = k.world();
    assert_eq!(seen.len(), 20 * 11);
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(k.now(), *seen.last().unwrap());
}

#[test]
fn test_same_time_events_run_in_insertion_order() {
    let mut k: Kernel<Vec<u32>> = Kernel::new(Vec::new());
    for i in 0..5u32 {
        k.schedule_at(100, move |k| {
            k.world_mut().push(i);
            Ok(())
        })
        .unwrap();
    }
    k.run().unwrap();
    assert_eq!(k.world(), &vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_schedule_in_the_past_is_rejected() {
    let mut k: Kernel<()> = Kernel::new(());
    k.schedule(50, |_| Ok(()));
    k.run().unwrap();
    let err = k.schedule_at(10, |_| Ok(())).unwrap_err();
    assert_eq!(
        err,
        SimError::NonCausal {
            requested_ms: 10,
            now_ms: 50
        }
    );
}

#[test]
fn test_receiver_suspends_until_value_arrives() {
    let mut k: Kernel<Vec<(u64, u32)>> = Kernel::new(Vec::new());
    let ch = k.open::<u32>();
    let rx = ch.receive;
    let tx = ch.send;

    let mut port: Option<ReceivePort<u32>> = None;
    k.spawn_fn("rx", move |ctx, wake| {
        if let Wakeup::Message(msg) = wake {
            let p = port.as_ref().ok_or(SimError::PortClosed)?;
            let value = p.accept(msg)?;
            let now = ctx.now();
            ctx.world_mut().push((now, value));
            return Ok(Step::Exit);
        }
        let p = ctx.listen(rx)?;
        let got = ctx.receive(&p)?;
        assert!(got.is_none());
        port = Some(p);
        Ok(Step::Suspend)
    })
    .unwrap();

    let mut out = None;
    k.spawn_fn("tx", move |ctx, wake| match wake {
        Wakeup::Start => {
            out = Some(ctx.connect(tx)?);
            ctx.delay(500);
            Ok(Step::Suspend)
        }
        _ => {
            let p = out.as_ref().ok_or(SimError::PortClosed)?;
            ctx.send(p, 7)?;
            Ok(Step::Exit)
        }
    })
    .unwrap();

    k.run().unwrap();
    assert_eq!(k.world(), &vec![(500, 7)]);
    assert_eq!(k.stats().messages_delivered, 1);
}

#[test]
fn test_unread_values_are_conflated() {
    let mut k: Kernel<Vec<&'static str>> = Kernel::new(Vec::new());
    let ch = k.open::<&'static str>();
    let rx = ch.receive;

    let mut port: Option<ReceivePort<&'static str>> = None;
    k.spawn_fn("rx", move |ctx, wake| {
        if let Wakeup::Message(msg) = wake {
            let p = port.as_ref().ok_or(SimError::PortClosed)?;
            let value = p.accept(msg)?;
            ctx.world_mut().push(value);
        } else {
            port = Some(ctx.listen(rx)?);
        }
        let p = port.as_ref().ok_or(SimError::PortClosed)?;
        while let Some(value) = ctx.receive(p)? {
            ctx.world_mut().push(value);
        }
        Ok(Step::Suspend)
    })
    .unwrap();

    let tx = k.connect(ch.send).unwrap();
    k.send(&tx, "a").unwrap();
    k.send(&tx, "b").unwrap();
    k.run().unwrap();

    assert_eq!(k.world(), &vec!["b"]);
    assert_eq!(k.stats().messages_sent, 2);
    assert_eq!(k.stats().messages_conflated, 1);
}

#[test]
fn test_driver_ports_poll_without_suspending() {
    let mut k: Kernel<()> = Kernel::new(());
    let ch = k.open::<u64>();
    let tx = k.connect(ch.send).unwrap();
    let rx = k.listen(ch.receive).unwrap();
    assert_eq!(rx.owner(), None);

    assert_eq!(k.try_receive(&rx).unwrap(), None);
    k.send(&tx, 1).unwrap();
    // Send is an event; nothing lands until it runs.
    assert_eq!(k.try_receive(&rx).unwrap(), None);
    k.run().unwrap();
    assert_eq!(k.try_receive(&rx).unwrap(), Some(1));
    assert_eq!(k.try_receive(&rx).unwrap(), None);
}

#[test]
fn test_closing_a_port_twice() {
    let mut k: Kernel<()> = Kernel::new(());
    let ch = k.open::<u32>();
    let mut rx = k.listen(ch.receive).unwrap();
    let mut tx = k.connect(ch.send).unwrap();

    assert!(rx.close());
    assert!(!rx.close());
    assert!(rx.is_closed());
    assert_eq!(k.try_receive(&rx).unwrap_err(), SimError::PortClosed);

    assert!(tx.close());
    assert!(!tx.close());
    assert_eq!(k.send(&tx, 1).unwrap_err(), SimError::PortClosed);
}

#[test]
fn test_reference_from_another_kernel_is_rejected() {
    let mut a: Kernel<()> = Kernel::new(());
    let mut b: Kernel<()> = Kernel::new(());
    let ch = a.open::<u32>();
    assert_eq!(b.connect(ch.send).unwrap_err(), SimError::InvalidReference);
    assert_eq!(b.listen(ch.receive).unwrap_err(), SimError::InvalidReference);
    assert!(a.connect(ch.send).is_ok());
}

#[test]
fn test_timeout_fires_unless_cancelled() {
    let mut k: Kernel<Vec<(u64, u64)>> = Kernel::new(Vec::new());
    k.spawn_fn("waiter", |ctx, wake| match wake {
        Wakeup::Start => {
            ctx.timeout(100, 1);
            let late = ctx.timeout(200, 2);
            assert!(late.cancel());
            assert!(!late.cancel());
            assert!(late.is_cancelled());
            Ok(Step::Suspend)
        }
        Wakeup::Timeout(tag) => {
            let now = ctx.now();
            ctx.world_mut().push((now, tag));
            Ok(Step::Suspend)
        }
        _ => Ok(Step::Exit),
    })
    .unwrap();
    k.run().unwrap();

    assert_eq!(k.world(), &vec![(100, 1)]);
    assert_eq!(k.stats().timeouts_cancelled, 1);
    // The dead entry is still popped, which advances the clock.
    assert_eq!(k.now(), 200);
}

#[test]
fn test_failed_process_is_isolated_and_reported() {
    let mut k: Kernel<Vec<u64>> = Kernel::new(Vec::new());
    let exits = k.open::<ProcessExit>();
    let inbox = k.listen(exits.receive).unwrap();

    let crashed = k
        .spawn_supervised(
            Crasher {
                after_ms: 10,
                reason: Some("disk on fire"),
            },
            "crasher",
            exits.send,
        )
        .unwrap();

    k.spawn_fn("survivor", |ctx, wake| match wake {
        Wakeup::Start => {
            ctx.delay(50);
            Ok(Step::Suspend)
        }
        _ => {
            let now = ctx.now();
            ctx.world_mut().push(now);
            Ok(Step::Exit)
        }
    })
    .unwrap();

    k.run().unwrap();

    assert_eq!(k.world(), &vec![50]);
    assert_eq!(k.stats().processes_failed, 1);
    assert_eq!(k.process_state(crashed.id), Some(ProcessState::Failed));
    assert!(k.lookup("crasher").is_none());

    let exit = k.try_receive(&inbox).unwrap().unwrap();
    assert_eq!(exit.process, crashed);
    assert!(matches!(exit.outcome, ExitOutcome::Failed(ref why) if why.contains("disk on fire")));
}

#[test]
fn test_supervisor_sees_clean_exit() {
    let mut k: Kernel<()> = Kernel::new(());
    let exits = k.open::<ProcessExit>();
    let inbox = k.listen(exits.receive).unwrap();
    k.spawn_supervised(
        Crasher {
            after_ms: 5,
            reason: None,
        },
        "short",
        exits.send,
    )
    .unwrap();
    k.run().unwrap();
    let exit = k.try_receive(&inbox).unwrap().unwrap();
    assert_eq!(exit.outcome, ExitOutcome::Completed);
    assert_eq!(k.stats().processes_failed, 0);
}

#[test]
fn test_fatal_error_terminates_run() {
    let mut k: Kernel<Vec<u64>> = Kernel::new(Vec::new());
    k.schedule_at(10, |_| Err(SimError::Internal("corrupt queue".to_string())))
        .unwrap();
    k.schedule_at(20, |k| {
        k.world_mut().push(20);
        Ok(())
    })
    .unwrap();

    assert!(matches!(k.run(), Err(SimError::Internal(_))));
    assert!(k.is_terminated());
    assert!(k.world().is_empty());
    assert_eq!(k.run().unwrap_err(), SimError::Terminated);
}

#[test]
fn test_non_fatal_action_error_is_logged_and_skipped() {
    let mut k: Kernel<Vec<u64>> = Kernel::new(Vec::new());
    k.schedule_at(10, |_| Err(SimError::PortClosed)).unwrap();
    k.schedule_at(20, |k| {
        k.world_mut().push(20);
        Ok(())
    })
    .unwrap();
    k.run().unwrap();
    assert_eq!(k.world(), &vec![20]);
}

#[test]
fn test_terminate_twice_is_an_error() {
    let mut k: Kernel<()> = Kernel::new(());
    k.terminate().unwrap();
    assert_eq!(k.terminate().unwrap_err(), SimError::AlreadyTerminated);
    assert_eq!(k.run().unwrap_err(), SimError::Terminated);
    assert_eq!(k.step().unwrap_err(), SimError::Terminated);
}

#[test]
fn test_process_can_stop_the_kernel() {
    let mut k: Kernel<Vec<u64>> = Kernel::new(Vec::new());
    k.spawn_fn("stopper", |ctx, wake| match wake {
        Wakeup::Start => {
            ctx.delay(30);
            Ok(Step::Suspend)
        }
        _ => {
            ctx.terminate_kernel();
            Ok(Step::Exit)
        }
    })
    .unwrap();
    k.schedule_at(100, |k| {
        k.world_mut().push(100);
        Ok(())
    })
    .unwrap();
    k.run().unwrap();
    assert!(k.is_terminated());
    assert_eq!(k.now(), 30);
    assert!(k.world().is_empty());
}

#[test]
fn test_names_are_unique_among_live_processes() {
    let mut k: Kernel<()> = Kernel::new(());
    k.spawn_fn("/hosts/h0", |_ctx, _wake| Ok(Step::Exit)).unwrap();
    let err = k
        .spawn_fn("/hosts/h0", |_ctx, _wake| Ok(Step::Exit))
        .unwrap_err();
    assert_eq!(err, SimError::DuplicateName("/hosts/h0".to_string()));
    assert!(err.is_contract_violation());

    k.run().unwrap();
    assert!(k.lookup("/hosts/h0").is_none());
    assert!(k.spawn_fn("/hosts/h0", |_ctx, _wake| Ok(Step::Exit)).is_ok());
}

#[test]
fn test_run_until_stops_at_deadline() {
    let mut k: Kernel<Vec<u64>> = Kernel::new(Vec::new());
    for t in [100u64, 200, 300] {
        k.schedule_at(t, move |k| {
            k.world_mut().push(t);
            Ok(())
        })
        .unwrap();
    }
    k.run_until(250).unwrap();
    assert_eq!(k.world(), &vec![100, 200]);
    assert_eq!(k.now(), 250);
    assert_eq!(k.pending_events(), 1);

    k.run().unwrap();
    assert_eq!(k.world(), &vec![100, 200, 300]);
}
