use std::cell::RefCell;
use std::rc::Rc;

use fiber_pool::Yielder;
use thiserror::Error;
use virtual_poll::{Host, PollError, Vfd, VfdTable};

use crate::cmd::{Command, Handler, Wake};

/// Errors surfaced to connection handlers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetError {
    #[error("connection closed by peer")]
    Closed,
    #[error("killed by scheduler shutdown")]
    Killed,
    #[error("descriptor table is full")]
    Full,
    #[error("bad virtual descriptor")]
    BadDescriptor,
    /// Never returned by the blocking wrappers on [`Conn`]; they park
    /// the fiber instead.
    #[error("operation would block")]
    WouldBlock,
    #[error("host error (errno {0})")]
    Host(i32),
}

impl From<PollError> for NetError {
    fn from(err: PollError) -> Self {
        match err {
            PollError::WouldBlock => NetError::WouldBlock,
            PollError::Full => NetError::Full,
            PollError::ConnectionClosed => NetError::Closed,
            PollError::BadDescriptor => NetError::BadDescriptor,
            PollError::Host(errno) => NetError::Host(errno),
        }
    }
}

/// Blocking-style handle a fiber uses to drive one virtual descriptor.
///
/// Every operation that would block yields a [`Command`] to the
/// scheduler and resumes once the descriptor is ready. A resume with
/// [`Wake::Kill`] makes the pending operation return
/// [`NetError::Killed`]; handlers propagate it with `?` to unwind.
pub struct Conn<'y, H: Host> {
    table: Rc<RefCell<VfdTable<H>>>,
    yielder: &'y Yielder<Wake, Command<H>>,
    vfd: Vfd,
}

impl<'y, H: Host> Conn<'y, H> {
    pub(crate) fn new(
        table: Rc<RefCell<VfdTable<H>>>,
        yielder: &'y Yielder<Wake, Command<H>>,
        vfd: Vfd,
    ) -> Self {
        Self { table, yielder, vfd }
    }

    /// The descriptor this handle operates on.
    pub fn vfd(&self) -> Vfd {
        self.vfd
    }

    // The table borrow is always released before suspending; the
    // scheduler borrows it while fibers are parked.
    fn wait(&self, cmd: Command<H>) -> Result<(), NetError> {
        match self.yielder.suspend(cmd) {
            Wake::Ready => Ok(()),
            Wake::Kill => Err(NetError::Killed),
        }
    }

    /// Accepts the next connection on this listening descriptor.
    ///
    /// Parks until a connection arrives. While the table is full the
    /// fiber parks on the capacity wait list instead, so established
    /// connections finish first and the scheduler never treats a
    /// backpressured listener as runnable work.
    pub fn accept(&mut self) -> Result<Vfd, NetError> {
        loop {
            while self.table.borrow().is_full() {
                self.wait(Command::AwaitCapacity)?;
            }
            let result = self.table.borrow_mut().accept(self.vfd);
            match result {
                Ok(vfd) => return Ok(vfd),
                Err(PollError::WouldBlock) => self.wait(Command::Recv(self.vfd))?,
                Err(PollError::Full) => self.wait(Command::AwaitCapacity)?,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Receives at least one byte, parking until data arrives.
    /// Returns [`NetError::Closed`] at end of stream.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, NetError> {
        loop {
            let result = self.table.borrow_mut().recv(self.vfd, buf);
            match result {
                Err(PollError::WouldBlock) => self.wait(Command::Recv(self.vfd))?,
                other => return other.map_err(NetError::from),
            }
        }
    }

    /// Sends the whole buffer, parking whenever the descriptor stops
    /// accepting bytes.
    pub fn send(&mut self, buf: &[u8]) -> Result<(), NetError> {
        let mut sent = 0;
        while sent < buf.len() {
            let result = self.table.borrow_mut().send(self.vfd, &buf[sent..]);
            match result {
                Ok(n) => sent += n,
                Err(PollError::WouldBlock) => self.wait(Command::Send(self.vfd))?,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Closes the descriptor. The scheduler tolerates handlers that
    /// skip this (retiring a fiber closes whatever it left open) and
    /// handlers that close early: a freed index can be reissued to a
    /// new connection while this fiber is still running, and retirement
    /// leaves a slot alone once another fiber owns it.
    pub fn close(&mut self) -> Result<(), NetError> {
        let result = self.table.borrow_mut().close(self.vfd);
        result.map_err(NetError::from)
    }

    /// Hands `vfd` to a new fiber running `handler`. The current fiber
    /// resumes on the next scheduler pass.
    pub fn spawn(&mut self, vfd: Vfd, handler: Handler<H>) -> Result<(), NetError> {
        self.wait(Command::Async { vfd, handler })
    }

    /// Yields the rest of this turn to other runnable fibers.
    pub fn suspend(&mut self) -> Result<(), NetError> {
        self.wait(Command::Suspend)
    }

    /// Asks the scheduler to stop. The calling fiber stays parked and
    /// is resumed with [`Wake::Kill`] during shutdown, so this only
    /// ever returns [`NetError::Killed`].
    pub fn quit(&mut self) -> Result<(), NetError> {
        self.wait(Command::Quit)?;
        Err(NetError::Killed)
    }
}
