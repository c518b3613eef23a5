use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::mem;
use std::rc::Rc;
use std::time::Duration;

use fiber_pool::{FiberId, FiberPool, FiberResult};
use thiserror::Error;
use tracing::{debug, error, trace, warn};
use virtual_poll::{Host, Interest, PollError, Vfd, VfdTable};

use crate::cmd::{Command, Handler, Wake};
use crate::conn::{Conn, NetError};

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Connections held concurrently, not counting the listener.
    pub max_connections: u32,
    /// How long one poll may block when no fiber is runnable. `None`
    /// blocks until an event arrives.
    pub poll_timeout: Option<Duration>,
    /// Stop the scheduler when a poll times out with no runnable
    /// fibers left.
    pub shutdown_on_idle: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections: 512,
            poll_timeout: Some(Duration::from_secs(30)),
            shutdown_on_idle: false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedError {
    #[error("poll failed: {0}")]
    Poll(PollError),
    #[error("{0} faulted")]
    Faulted(FiberId),
}

/// Cooperative scheduler multiplexing fibers over one descriptor table.
///
/// Fibers run until they yield a [`Command`]; runnable fibers are kept
/// in two queues swapped once per pass so a fiber that suspends cannot
/// starve the rest of the pass. Between passes the table is polled and
/// fibers parked on fired descriptors are woken.
pub struct Scheduler<H: Host + 'static> {
    table: Rc<RefCell<VfdTable<H>>>,
    fibers: FiberPool<Wake, Command<H>, ()>,
    cur: VecDeque<(FiberId, Wake)>,
    next: VecDeque<(FiberId, Wake)>,
    /// Fiber parked on each descriptor index, if any.
    registry: Vec<Option<FiberId>>,
    /// Fibers parked until a descriptor slot frees up.
    admission: VecDeque<FiberId>,
    /// Descriptor owned by each live fiber.
    vfd_of: HashMap<FiberId, Vfd>,
    cfg: Config,
    quit: bool,
    fault: Option<FiberId>,
}

impl<H: Host + 'static> Scheduler<H> {
    pub fn new(host: H, cfg: Config) -> Self {
        // One extra slot for the listener.
        let capacity = cfg.max_connections + 1;
        Self {
            table: Rc::new(RefCell::new(VfdTable::new(host, capacity))),
            fibers: FiberPool::with_capacity(capacity as usize),
            cur: VecDeque::new(),
            next: VecDeque::new(),
            registry: vec![None; capacity as usize],
            admission: VecDeque::new(),
            vfd_of: HashMap::new(),
            cfg,
            quit: false,
            fault: None,
        }
    }

    /// Opens a listening descriptor to hand to the root handler.
    pub fn listen(&mut self, port: u16, backlog: u32) -> Result<Vfd, PollError> {
        self.table.borrow_mut().listen(port, backlog)
    }

    /// Registers an already-open host descriptor.
    pub fn wrap(&mut self, fd: virtual_poll::RawFd) -> Result<Vfd, PollError> {
        self.table.borrow_mut().wrap(fd)
    }

    /// Runs `handler` over `vfd` as the root fiber and schedules until
    /// every fiber finished, the root quit, or idle shutdown hit.
    ///
    /// On exit every remaining fiber is resumed once with
    /// [`Wake::Kill`] and must return, so handler resources unwind
    /// before this returns.
    pub fn run(&mut self, vfd: Vfd, handler: Handler<H>) -> Result<(), SchedError> {
        let root = self.spawn_fiber(vfd, handler);
        self.next.push_back((root, Wake::Ready));
        let result = self.drive();
        self.shutdown();
        if let Some(id) = self.fault.take() {
            return Err(SchedError::Faulted(id));
        }
        result
    }

    /// Consumes the scheduler, checking that no descriptor leaked.
    pub fn finalize(self) {
        assert!(self.vfd_of.is_empty(), "finalize with live fibers");
        match Rc::try_unwrap(self.table) {
            Ok(cell) => cell.into_inner().finalize(),
            Err(_) => panic!("a connection handle outlives the scheduler"),
        }
    }

    fn drive(&mut self) -> Result<(), SchedError> {
        loop {
            mem::swap(&mut self.cur, &mut self.next);
            while let Some((id, wake)) = self.cur.pop_front() {
                self.step(id, wake);
            }
            if self.quit {
                debug!("quit requested, stopping");
                return Ok(());
            }
            if self.vfd_of.is_empty() {
                debug!("all fibers finished, stopping");
                return Ok(());
            }

            // Runnable work must not wait on the poll timeout.
            let timeout = if self.next.is_empty() {
                self.cfg.poll_timeout
            } else {
                Some(Duration::ZERO)
            };
            let fired = self
                .table
                .borrow_mut()
                .poll(timeout)
                .map_err(SchedError::Poll)?;
            if fired == 0 && self.next.is_empty() {
                if self.cfg.shutdown_on_idle {
                    debug!("idle poll timeout, stopping");
                    return Ok(());
                }
                continue;
            }

            let ready: Vec<(Vfd, Interest)> =
                self.table.borrow_mut().drain_ready().collect();
            for (vfd, revents) in ready {
                if self.quit {
                    break;
                }
                match self.registry[vfd.0 as usize].take() {
                    Some(id) => {
                        trace!(%vfd, ?revents, fiber = %id, "waking fiber");
                        self.step(id, Wake::Ready);
                    }
                    // The owner retired between registering interest
                    // and the event firing.
                    None => debug!(%vfd, ?revents, "event with no parked fiber"),
                }
            }
            // A quit yielded during the wake phase must not buy the
            // other fibers another pass.
            if self.quit {
                debug!("quit requested, stopping");
                return Ok(());
            }
        }
    }

    fn step(&mut self, id: FiberId, wake: Wake) {
        match self.fibers.resume(id, wake) {
            FiberResult::Completed(()) => self.retire(id),
            FiberResult::Suspended(cmd) => self.dispatch(id, cmd),
            FiberResult::Faulted => {
                error!(fiber = %id, "fiber faulted, shutting down");
                self.fault.get_or_insert(id);
                self.retire(id);
                self.quit = true;
            }
        }
        // Whatever the fiber did may have freed a slot.
        self.wake_capacity_waiters();
    }

    fn dispatch(&mut self, id: FiberId, cmd: Command<H>) {
        trace!(fiber = %id, ?cmd, "dispatch");
        match cmd {
            Command::Async { vfd, handler } => {
                let child = self.spawn_fiber(vfd, handler);
                self.next.push_back((child, Wake::Ready));
                self.next.push_back((id, Wake::Ready));
            }
            Command::Suspend => self.next.push_back((id, Wake::Ready)),
            Command::AwaitCapacity => {
                if self.table.borrow().is_full() {
                    self.admission.push_back(id);
                } else {
                    // Freed between the fiber's check and the yield.
                    self.next.push_back((id, Wake::Ready));
                }
            }
            Command::Recv(vfd) => self.park(id, vfd, Interest::IN),
            Command::Send(vfd) => self.park(id, vfd, Interest::OUT),
            Command::Quit => {
                debug!(fiber = %id, "quit command");
                self.quit = true;
            }
        }
    }

    fn park(&mut self, id: FiberId, vfd: Vfd, interest: Interest) {
        let result = {
            let mut table = self.table.borrow_mut();
            if interest == Interest::IN {
                table.notify_recv(vfd)
            } else {
                table.notify_send(vfd)
            }
        };
        match result {
            Ok(()) => {
                debug_assert!(self.registry[vfd.0 as usize].is_none());
                self.registry[vfd.0 as usize] = Some(id);
            }
            Err(err) => {
                // Let the fiber observe the dead descriptor itself.
                debug!(%vfd, %err, "park on dead descriptor, rescheduling");
                self.next.push_back((id, Wake::Ready));
            }
        }
    }

    fn spawn_fiber(&mut self, vfd: Vfd, handler: Handler<H>) -> FiberId {
        let table = Rc::clone(&self.table);
        let id = self.fibers.alloc(move |yielder, wake: Wake| {
            if wake == Wake::Kill {
                return;
            }
            let mut conn = Conn::new(table, yielder, vfd);
            match handler(&mut conn) {
                Ok(()) => trace!(%vfd, "handler finished"),
                Err(NetError::Killed) => debug!(%vfd, "handler killed"),
                Err(err) => warn!(%vfd, %err, "handler failed"),
            }
        });
        self.vfd_of.insert(id, vfd);
        debug!(fiber = %id, %vfd, "spawned");
        id
    }

    /// Moves fibers parked for capacity back onto the ready queue once
    /// a slot is free. Woken fibers recheck and re-park if they lose
    /// the race for it.
    fn wake_capacity_waiters(&mut self) {
        if self.admission.is_empty() || self.table.borrow().is_full() {
            return;
        }
        while let Some(id) = self.admission.pop_front() {
            trace!(fiber = %id, "slot freed, waking capacity waiter");
            self.next.push_back((id, Wake::Ready));
        }
    }

    /// Frees a finished fiber and closes whatever descriptor it still
    /// held open. A handler that closed its vfd early may have seen
    /// the index reissued to a newer connection; a slot another live
    /// fiber owns is left untouched.
    fn retire(&mut self, id: FiberId) {
        if let Some(vfd) = self.vfd_of.remove(&id) {
            if self.vfd_of.values().any(|&owned| owned == vfd) {
                trace!(fiber = %id, %vfd, "descriptor reissued, new owner keeps it");
            } else {
                self.registry[vfd.0 as usize] = None;
                let result = self.table.borrow_mut().close(vfd);
                match result {
                    // The handler already closed it.
                    Ok(()) | Err(PollError::BadDescriptor) => {}
                    Err(err) => warn!(%vfd, %err, "close on retire failed"),
                }
            }
        }
        self.fibers.free(id);
    }

    /// Kills every remaining fiber. A killed fiber must unwind and
    /// return; one that suspends again or panics is a bug in its
    /// handler.
    fn shutdown(&mut self) {
        self.cur.clear();
        self.next.clear();
        self.admission.clear();
        let ids: Vec<FiberId> = self.vfd_of.keys().copied().collect();
        for id in ids {
            match self.fibers.resume(id, Wake::Kill) {
                FiberResult::Completed(()) => self.retire(id),
                FiberResult::Suspended(cmd) => {
                    panic!("{id} ignored kill signal, yielded {cmd:?}")
                }
                FiberResult::Faulted => panic!("{id} faulted during shutdown"),
            }
        }
    }
}
