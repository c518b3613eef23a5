use std::fmt;

use virtual_poll::{Host, Vfd};

use crate::conn::{Conn, NetError};

/// Resume argument handed to a fiber when the scheduler wakes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The event the fiber was waiting for fired, or the fiber was
    /// picked from the ready queue.
    Ready,
    /// The scheduler is shutting down; the fiber must unwind and
    /// return without touching its descriptor again.
    Kill,
}

/// Connection handler run by a spawned fiber.
pub type Handler<H> =
    Box<dyn for<'y> FnOnce(&mut Conn<'y, H>) -> Result<(), NetError> + 'static>;

/// Request yielded from a fiber to the scheduler.
pub enum Command<H: Host> {
    /// Spawn a new fiber running `handler` over `vfd`. The spawning
    /// fiber stays runnable.
    Async { vfd: Vfd, handler: Handler<H> },
    /// Give up the rest of the turn; reschedule on the next pass.
    Suspend,
    /// Park until a descriptor slot frees up. Unlike `Suspend` the
    /// fiber is not runnable while it waits, so an idle scheduler can
    /// still recognize inactivity and shut down.
    AwaitCapacity,
    /// Park until the descriptor becomes readable.
    Recv(Vfd),
    /// Park until the descriptor becomes writable.
    Send(Vfd),
    /// Stop the scheduler once the current pass completes.
    Quit,
}

impl<H: Host> fmt::Debug for Command<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Async { vfd, .. } => f
                .debug_struct("Async")
                .field("vfd", vfd)
                .field("handler", &"...")
                .finish(),
            Command::Suspend => f.debug_struct("Suspend").finish(),
            Command::AwaitCapacity => f.debug_struct("AwaitCapacity").finish(),
            Command::Recv(vfd) => f.debug_tuple("Recv").field(vfd).finish(),
            Command::Send(vfd) => f.debug_tuple("Send").field(vfd).finish(),
            Command::Quit => f.debug_struct("Quit").finish(),
        }
    }
}
