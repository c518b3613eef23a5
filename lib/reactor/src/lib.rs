//! Cooperative socket reactor for single-threaded hosts.
//!
//! A [`Scheduler`] multiplexes stackful fibers over a
//! [`VfdTable`](virtual_poll::VfdTable) of polled descriptors. Handler
//! code is written in a plain blocking style against [`Conn`]; every
//! operation that would block yields a [`Command`] and the scheduler
//! resumes the fiber when its descriptor is ready.
//!
//! ```no_run
//! use fiber_reactor::{Config, Conn, Scheduler};
//! use fiber_reactor::sys::PosixHost;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut sched = Scheduler::new(PosixHost::new(), Config::default());
//! let listener = sched.listen(8080, 64)?;
//! sched.run(
//!     listener,
//!     Box::new(|conn| {
//!         loop {
//!             let vfd = conn.accept()?;
//!             conn.spawn(
//!                 vfd,
//!                 Box::new(|conn| {
//!                     let mut buf = [0u8; 1024];
//!                     let n = conn.recv(&mut buf)?;
//!                     conn.send(&buf[..n])?;
//!                     conn.close()
//!                 }),
//!             )?;
//!         }
//!     }),
//! )?;
//! sched.finalize();
//! # Ok(())
//! # }
//! ```

mod cmd;
mod conn;
mod sched;

pub use cmd::{Command, Handler, Wake};
pub use conn::{Conn, NetError};
pub use sched::{Config, SchedError, Scheduler};

pub use fiber_pool::{FiberId, FiberPool, FiberResult, Yielder};
pub use virtual_poll::{
    sim, Host, HostError, Interest, PollError, PollSlot, RawFd, Vfd, VfdTable,
};
#[cfg(unix)]
pub use virtual_poll::sys;
