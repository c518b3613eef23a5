use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use fiber_reactor::sim::{self, SIM_EINVAL};
use fiber_reactor::{Config, NetError, PollError, SchedError, Scheduler};
use pretty_assertions::assert_eq;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn quick_config(max_connections: u32) -> Config {
    Config {
        max_connections,
        poll_timeout: Some(Duration::ZERO),
        shutdown_on_idle: true,
    }
}

#[test]
fn echo_round_trip() {
    init_logging();
    let (host, ctl) = sim::pair();
    let mut sched = Scheduler::new(host, quick_config(4));
    let listener = sched.listen(8080, 16).unwrap();
    let fd = ctl.connect(b"ping");

    sched
        .run(
            listener,
            Box::new(|conn| loop {
                let vfd = conn.accept()?;
                conn.spawn(
                    vfd,
                    Box::new(|conn| {
                        let mut buf = [0u8; 16];
                        let n = conn.recv(&mut buf)?;
                        assert_eq!(&buf[..n], b"ping");
                        conn.send(b"pong")?;
                        conn.close()
                    }),
                )?;
            }),
        )
        .unwrap();
    sched.finalize();
    assert_eq!(ctl.output(fd), b"pong");
    assert!(ctl.is_closed(fd));
}

#[test]
fn admission_holds_accepts_while_table_is_full() {
    init_logging();
    let (host, ctl) = sim::pair();
    // Listener plus two connections. No idle shutdown: the run ends
    // when the root has accepted all three and quits.
    let cfg = Config {
        max_connections: 2,
        poll_timeout: Some(Duration::ZERO),
        shutdown_on_idle: false,
    };
    let mut sched = Scheduler::new(host, cfg);
    let listener = sched.listen(8080, 16).unwrap();

    let a = ctl.connect(b"a");
    let _b = ctl.connect(b"b");
    let c = ctl.connect(b"c");
    // Free a slot a few passes in by hanging up the first peer.
    ctl.at_poll(5, move |state| state.close_peer(a));

    sched
        .run(
            listener,
            Box::new(|conn| {
                for _ in 0..3 {
                    let vfd = conn.accept()?;
                    conn.spawn(
                        vfd,
                        Box::new(|conn| {
                            let mut buf = [0u8; 8];
                            conn.recv(&mut buf)?;
                            // Hold the slot until the peer hangs up or
                            // shutdown kills us.
                            match conn.recv(&mut buf) {
                                Err(NetError::Closed) => conn.close(),
                                Err(err) => Err(err),
                                Ok(_) => Ok(()),
                            }
                        }),
                    )?;
                }
                conn.quit()
            }),
        )
        .unwrap();
    sched.finalize();

    ctl.with(|state| {
        let log = state.accept_log().to_vec();
        assert_eq!(log.len(), 3);
        // The first two connections fit; the third had to wait for
        // the hangup script at poll 5.
        assert!(log[1].1 < 5, "second accept at poll {}", log[1].1);
        assert_eq!(log[2].0, c);
        assert!(log[2].1 >= 5, "third accept at poll {}", log[2].1);
        let closed_a_at = state
            .close_log()
            .iter()
            .find(|(fd, _)| *fd == a)
            .map(|(_, polls)| *polls)
            .unwrap();
        assert!(log[2].1 >= closed_a_at);
    });
}

#[test]
fn suspend_yields_one_pass_per_poll() {
    init_logging();
    let (host, ctl) = sim::pair();
    let mut sched = Scheduler::new(host, quick_config(4));
    let listener = sched.listen(8080, 16).unwrap();

    let turns = Rc::new(Cell::new(0u32));
    let counter = Rc::clone(&turns);
    sched
        .run(
            listener,
            Box::new(move |conn| {
                for _ in 0..5 {
                    conn.suspend()?;
                    counter.set(counter.get() + 1);
                }
                conn.quit()
            }),
        )
        .unwrap();
    sched.finalize();

    assert_eq!(turns.get(), 5);
    // Each suspension costs exactly one (zero-timeout) poll.
    assert_eq!(ctl.polls(), 5);
}

#[test]
fn shutdown_closes_every_descriptor() {
    init_logging();
    let (host, ctl) = sim::pair();
    let mut sched = Scheduler::new(host, quick_config(4));
    let listener = sched.listen(8080, 16).unwrap();
    let a = ctl.connect(b"");
    let b = ctl.connect(b"");

    sched
        .run(
            listener,
            Box::new(|conn| {
                for _ in 0..2 {
                    let vfd = conn.accept()?;
                    conn.spawn(
                        vfd,
                        Box::new(|conn| {
                            // Parked forever; only the kill wakes us.
                            let mut buf = [0u8; 8];
                            conn.recv(&mut buf)?;
                            Ok(())
                        }),
                    )?;
                }
                conn.quit()
            }),
        )
        .unwrap();
    sched.finalize();

    // Both parked handlers and the listener unwound and released
    // their host descriptors.
    for fd in [a, b] {
        assert!(ctl.is_closed(fd), "fd {fd} leaked across shutdown");
    }
    ctl.with(|state| assert_eq!(state.close_log().len(), 3));
}

#[test]
fn send_delivers_the_whole_buffer_under_backpressure() {
    init_logging();
    let (host, ctl) = sim::pair();
    let mut sched = Scheduler::new(host, quick_config(4));
    let listener = sched.listen(8080, 16).unwrap();
    let fd = ctl.connect(b"");
    ctl.with(|state| state.set_send_quota(1));

    sched
        .run(
            listener,
            Box::new(|conn| {
                let vfd = conn.accept()?;
                conn.spawn(
                    vfd,
                    Box::new(|conn| {
                        conn.send(b"abcdef")?;
                        conn.close()
                    }),
                )?;
                conn.quit()
            }),
        )
        .unwrap();
    sched.finalize();
    assert_eq!(ctl.output(fd), b"abcdef");
}

#[test]
fn poll_failure_stops_the_scheduler_cleanly() {
    init_logging();
    let (host, ctl) = sim::pair();
    let mut sched = Scheduler::new(host, quick_config(4));
    let listener = sched.listen(8080, 16).unwrap();
    ctl.with(|state| state.fail_next_poll(SIM_EINVAL));

    let err = sched
        .run(
            listener,
            Box::new(|conn| loop {
                conn.accept()?;
            }),
        )
        .unwrap_err();
    assert_eq!(err, SchedError::Poll(PollError::Host(SIM_EINVAL)));
    // The parked root fiber was still killed and its listener closed.
    sched.finalize();
    ctl.with(|state| assert_eq!(state.close_log().len(), 1));
}

#[test]
fn idle_shutdown_fires_while_listener_waits_for_capacity() {
    init_logging();
    let (host, ctl) = sim::pair();
    // One connection slot; the second pending peer keeps the listener
    // parked for capacity, which must not count as runnable work.
    let mut sched = Scheduler::new(host, quick_config(1));
    let listener = sched.listen(8080, 16).unwrap();
    let first = ctl.connect(b"");
    let second = ctl.connect(b"");

    sched
        .run(
            listener,
            Box::new(|conn| loop {
                let vfd = conn.accept()?;
                conn.spawn(
                    vfd,
                    Box::new(|conn| {
                        let mut buf = [0u8; 8];
                        conn.recv(&mut buf)?;
                        Ok(())
                    }),
                )?;
            }),
        )
        .unwrap();
    sched.finalize();

    // The run ended on inactivity instead of spinning: the accepted
    // connection and the listener were torn down, the waiting peer was
    // never accepted.
    assert!(ctl.is_closed(first));
    assert!(!ctl.is_closed(second));
    ctl.with(|state| assert_eq!(state.close_log().len(), 2));
}

#[test]
fn no_fiber_runs_after_a_quit_from_the_wake_phase() {
    init_logging();
    let (host, ctl) = sim::pair();
    let mut sched = Scheduler::new(host, quick_config(4));
    let listener = sched.listen(8080, 16).unwrap();
    let quitter = ctl.connect(b"");
    let _spinner = ctl.connect(b"");
    // Wake the parked quit handler from the poll phase.
    ctl.at_poll(3, move |state| state.push_data(quitter, b"x"));

    let spins = Rc::new(Cell::new(0u32));
    let observed = Rc::clone(&spins);
    sched
        .run(
            listener,
            Box::new(move |conn| {
                let q = conn.accept()?;
                conn.spawn(
                    q,
                    Box::new(|conn| {
                        let mut buf = [0u8; 4];
                        conn.recv(&mut buf)?;
                        conn.quit()
                    }),
                )?;
                let s = conn.accept()?;
                let spins = observed;
                conn.spawn(
                    s,
                    Box::new(move |conn| loop {
                        spins.set(spins.get() + 1);
                        conn.suspend()?;
                    }),
                )?;
                loop {
                    conn.accept()?;
                }
            }),
        )
        .unwrap();
    sched.finalize();

    // The spinner ran once before the quit and never again afterwards;
    // a quit yielded during the wake phase grants no extra pass.
    assert_eq!(spins.get(), 1);
}

#[test]
fn early_close_leaves_a_reissued_descriptor_alone() {
    init_logging();
    let (host, ctl) = sim::pair();
    let mut sched = Scheduler::new(host, quick_config(4));
    let listener = sched.listen(8080, 16).unwrap();
    let first = ctl.connect(b"x");
    // A second peer arrives after the first handler has already closed
    // its descriptor, so the freed index is reissued while the first
    // handler is still alive.
    let late = Rc::new(Cell::new(0));
    {
        let late = Rc::clone(&late);
        ctl.at_poll(3, move |state| late.set(state.connect(b"ping")));
    }

    sched
        .run(
            listener,
            Box::new(|conn| loop {
                let vfd = conn.accept()?;
                conn.spawn(
                    vfd,
                    Box::new(|conn| {
                        let mut buf = [0u8; 8];
                        let n = conn.recv(&mut buf)?;
                        if &buf[..n] == b"x" {
                            // Close early, then linger a few passes.
                            conn.close()?;
                            conn.suspend()?;
                            conn.suspend()?;
                            Ok(())
                        } else {
                            conn.send(b"pong")?;
                            conn.close()
                        }
                    }),
                )?;
            }),
        )
        .unwrap();
    sched.finalize();

    // Retiring the lingering first handler must not close the new
    // owner's descriptor out from under it.
    assert_eq!(ctl.output(late.get()), b"pong");
    assert!(ctl.is_closed(first));
    assert!(ctl.is_closed(late.get()));
}

#[test]
fn panicking_handler_faults_the_scheduler() {
    init_logging();
    let (host, ctl) = sim::pair();
    let mut sched = Scheduler::new(host, quick_config(4));
    let listener = sched.listen(8080, 16).unwrap();
    let fd = ctl.connect(b"boom");

    let err = sched
        .run(
            listener,
            Box::new(|conn| loop {
                let vfd = conn.accept()?;
                conn.spawn(vfd, Box::new(|_conn| panic!("handler bug")))?;
            }),
        )
        .unwrap_err();
    assert!(matches!(err, SchedError::Faulted(_)), "got {err:?}");
    sched.finalize();
    // The faulting fiber's descriptor was reclaimed on retire.
    assert!(ctl.is_closed(fd));
}
