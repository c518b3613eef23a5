//! Deterministic in-memory host for tests and examples.
//!
//! [`SimHost`] implements [`Host`] over plain byte buffers instead of
//! sockets: tests enqueue inbound connections and data through a
//! [`SimController`], run the code under test, and then inspect what
//! was written back or closed. Poll calls return immediately (the
//! timeout is never slept on) and visit slots in index order, so every
//! run is reproducible.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use crate::{Host, HostError, Interest, PollSlot, RawFd};

/// errno values surfaced by the simulation (POSIX numbering).
pub const SIM_EBADF: i32 = 9;
pub const SIM_ECONNABORTED: i32 = 103;
pub const SIM_EINVAL: i32 = 22;

#[derive(Debug, Default)]
struct SimConn {
    inbox: VecDeque<u8>,
    outbox: Vec<u8>,
    peer_closed: bool,
    accepted: bool,
    closed: bool,
}

type Script = Box<dyn FnOnce(&mut SimState)>;

/// The world the simulated host lives in. Scripts scheduled with
/// [`SimController::at_poll`] mutate it mid-run.
#[derive(Default)]
pub struct SimState {
    next_fd: RawFd,
    listener: Option<RawFd>,
    listener_closed: bool,
    pending: VecDeque<RawFd>,
    conns: HashMap<RawFd, SimConn>,
    polls: u64,
    scripts: Vec<(u64, Script)>,
    send_quota: Option<usize>,
    accept_errno: Option<i32>,
    poll_errno: Option<i32>,
    accept_log: Vec<(RawFd, u64)>,
    close_log: Vec<(RawFd, u64)>,
}

impl SimState {
    fn fresh_fd(&mut self) -> RawFd {
        // Start above the stdio range like a real process would.
        self.next_fd += 1;
        self.next_fd + 3
    }

    /// Enqueues an inbound connection carrying `data`, returning the
    /// fd it will have once accepted.
    pub fn connect(&mut self, data: &[u8]) -> RawFd {
        let fd = self.fresh_fd();
        self.conns.insert(
            fd,
            SimConn {
                inbox: data.iter().copied().collect(),
                ..SimConn::default()
            },
        );
        self.pending.push_back(fd);
        fd
    }

    /// Creates an already-established connection without going through
    /// the listener, for exercising `wrap`.
    pub fn preopen(&mut self, data: &[u8]) -> RawFd {
        let fd = self.fresh_fd();
        self.conns.insert(
            fd,
            SimConn {
                inbox: data.iter().copied().collect(),
                accepted: true,
                ..SimConn::default()
            },
        );
        fd
    }

    /// Appends bytes the peer sends on an established connection.
    pub fn push_data(&mut self, fd: RawFd, data: &[u8]) {
        let conn = self.conns.get_mut(&fd).expect("unknown sim connection");
        conn.inbox.extend(data.iter().copied());
    }

    /// The peer half-closes: reads drain the inbox and then report EOF.
    pub fn close_peer(&mut self, fd: RawFd) {
        let conn = self.conns.get_mut(&fd).expect("unknown sim connection");
        conn.peer_closed = true;
    }

    /// Bytes the guest has written so far.
    pub fn output(&self, fd: RawFd) -> Vec<u8> {
        self.conns
            .get(&fd)
            .map(|conn| conn.outbox.clone())
            .unwrap_or_default()
    }

    pub fn is_closed(&self, fd: RawFd) -> bool {
        if self.listener == Some(fd) {
            return self.listener_closed;
        }
        self.conns.get(&fd).map_or(true, |conn| conn.closed)
    }

    /// Caps how many bytes a single `send` call accepts.
    pub fn set_send_quota(&mut self, quota: usize) {
        assert!(quota > 0, "a zero quota would make send never progress");
        self.send_quota = Some(quota);
    }

    pub fn fail_next_accept(&mut self, errno: i32) {
        self.accept_errno = Some(errno);
    }

    pub fn fail_next_poll(&mut self, errno: i32) {
        self.poll_errno = Some(errno);
    }

    /// Number of poll calls made so far.
    pub fn polls(&self) -> u64 {
        self.polls
    }

    /// `(fd, poll number)` for each accepted connection, in order.
    pub fn accept_log(&self) -> &[(RawFd, u64)] {
        &self.accept_log
    }

    /// `(fd, poll number)` for each close, in order.
    pub fn close_log(&self) -> &[(RawFd, u64)] {
        &self.close_log
    }

    fn readable(&self, fd: RawFd) -> bool {
        if self.listener == Some(fd) {
            return !self.pending.is_empty();
        }
        self.conns
            .get(&fd)
            .is_some_and(|conn| !conn.closed && (!conn.inbox.is_empty() || conn.peer_closed))
    }
}

/// Test-side handle: schedule world changes and inspect results.
#[derive(Clone)]
pub struct SimController(Rc<RefCell<SimState>>);

impl SimController {
    /// Runs `f` against the shared state immediately.
    pub fn with<R>(&self, f: impl FnOnce(&mut SimState) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }

    /// Schedules `f` to run at the start of poll call number `poll`
    /// (1-based).
    pub fn at_poll(&self, poll: u64, f: impl FnOnce(&mut SimState) + 'static) {
        self.0.borrow_mut().scripts.push((poll, Box::new(f)));
    }

    pub fn connect(&self, data: &[u8]) -> RawFd {
        self.with(|state| state.connect(data))
    }

    pub fn preopen(&self, data: &[u8]) -> RawFd {
        self.with(|state| state.preopen(data))
    }

    pub fn output(&self, fd: RawFd) -> Vec<u8> {
        self.with(|state| state.output(fd))
    }

    pub fn is_closed(&self, fd: RawFd) -> bool {
        self.with(|state| state.is_closed(fd))
    }

    pub fn polls(&self) -> u64 {
        self.with(|state| state.polls())
    }
}

/// The [`Host`] half of the simulation; hand it to the table under
/// test.
pub struct SimHost(Rc<RefCell<SimState>>);

/// Creates a connected host/controller pair over one shared world.
pub fn pair() -> (SimHost, SimController) {
    let state = Rc::new(RefCell::new(SimState::default()));
    (SimHost(Rc::clone(&state)), SimController(state))
}

impl Host for SimHost {
    fn listen(&mut self, _port: u16, _backlog: u32) -> Result<RawFd, HostError> {
        let mut state = self.0.borrow_mut();
        if state.listener.is_some() {
            return Err(HostError::Os(SIM_EINVAL));
        }
        let fd = state.fresh_fd();
        state.listener = Some(fd);
        Ok(fd)
    }

    fn accept(&mut self, fd: RawFd) -> Result<RawFd, HostError> {
        let mut state = self.0.borrow_mut();
        if state.listener != Some(fd) || state.listener_closed {
            return Err(HostError::Os(SIM_EBADF));
        }
        if let Some(errno) = state.accept_errno.take() {
            return Err(HostError::Os(errno));
        }
        let conn = state.pending.pop_front().ok_or(HostError::WouldBlock)?;
        let polls = state.polls;
        state.accept_log.push((conn, polls));
        state
            .conns
            .get_mut(&conn)
            .expect("pending fd has a connection")
            .accepted = true;
        Ok(conn)
    }

    fn recv(&mut self, fd: RawFd, buf: &mut [u8]) -> Result<usize, HostError> {
        let mut state = self.0.borrow_mut();
        let conn = match state.conns.get_mut(&fd) {
            Some(conn) if !conn.closed => conn,
            _ => return Err(HostError::Os(SIM_EBADF)),
        };
        if conn.inbox.is_empty() {
            if conn.peer_closed {
                return Ok(0);
            }
            return Err(HostError::WouldBlock);
        }
        let n = buf.len().min(conn.inbox.len());
        for byte in buf.iter_mut().take(n) {
            *byte = conn.inbox.pop_front().expect("length checked");
        }
        Ok(n)
    }

    fn send(&mut self, fd: RawFd, buf: &[u8]) -> Result<usize, HostError> {
        let mut state = self.0.borrow_mut();
        let quota = state.send_quota.unwrap_or(usize::MAX);
        let conn = match state.conns.get_mut(&fd) {
            Some(conn) if !conn.closed => conn,
            _ => return Err(HostError::Os(SIM_EBADF)),
        };
        let n = buf.len().min(quota);
        conn.outbox.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn close(&mut self, fd: RawFd) -> Result<(), HostError> {
        let mut state = self.0.borrow_mut();
        let polls = state.polls;
        if state.listener == Some(fd) {
            if state.listener_closed {
                return Err(HostError::Os(SIM_EBADF));
            }
            state.listener_closed = true;
            state.close_log.push((fd, polls));
            return Ok(());
        }
        match state.conns.get_mut(&fd) {
            Some(conn) if !conn.closed => {
                conn.closed = true;
                state.close_log.push((fd, polls));
                Ok(())
            }
            _ => Err(HostError::Os(SIM_EBADF)),
        }
    }

    fn poll(
        &mut self,
        slots: &mut [PollSlot],
        _timeout: Option<Duration>,
    ) -> Result<usize, HostError> {
        let mut state = self.0.borrow_mut();
        state.polls += 1;

        // Run scripts that are due, outside the state borrow they need.
        let due: Vec<Script> = {
            let polls = state.polls;
            let mut due = Vec::new();
            let mut keep = Vec::new();
            for (at, script) in state.scripts.drain(..) {
                if at <= polls {
                    due.push(script);
                } else {
                    keep.push((at, script));
                }
            }
            state.scripts = keep;
            due
        };
        for script in due {
            script(&mut *state);
        }

        if let Some(errno) = state.poll_errno.take() {
            return Err(HostError::Os(errno));
        }

        let mut ready = 0;
        for slot in slots.iter_mut() {
            slot.revents = Interest::empty();
            if !slot.is_live() {
                continue;
            }
            if slot.events.contains(Interest::IN) && state.readable(slot.fd) {
                slot.revents.insert(Interest::IN);
            }
            if slot.events.contains(Interest::OUT) {
                // The simulated peer always has room to receive.
                slot.revents.insert(Interest::OUT);
            }
            if !slot.revents.is_empty() {
                ready += 1;
            }
        }
        Ok(ready)
    }
}
