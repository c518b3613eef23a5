//! Virtual descriptor table over a pluggable poll backend.
//!
//! Application and scheduler code never see real descriptors; they hold
//! a [`Vfd`], a small dense index issued by an [`index_pool::IndexPool`]
//! and stable for the lifetime of one connection. The table maps each
//! live vfd to a [`PollSlot`] carrying the real descriptor and the
//! requested/observed poll masks, and funnels all I/O through the
//! [`Host`] trait so the backend can be the real OS, a wasm host call
//! boundary, or an in-memory simulation.

mod host;
pub mod sim;
#[cfg(unix)]
pub mod sys;
mod table;

pub use host::{Host, HostError, RawFd};
pub use table::{DrainReady, VfdTable};

use bitflags::bitflags;
use std::fmt;
use thiserror::Error;

bitflags! {
    /// Poll interest/readiness mask, using the POSIX `poll(2)` bit
    /// values so host backends can pass it through unchanged.
    pub struct Interest: u16 {
        const IN = 0x001;
        const OUT = 0x004;
        const ERR = 0x008;
        const HUP = 0x010;
        const NVAL = 0x020;
    }
}

/// Virtual descriptor: the only connection identifier callers hold.
///
/// Reused for a different connection after the slot is closed, so a
/// stale `Vfd` names a dead (or, worse, a different) connection; the
/// table rejects dead ones with [`PollError::BadDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Vfd(pub u32);

impl fmt::Display for Vfd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vfd{}", self.0)
    }
}

/// One table slot: the real descriptor plus the poll masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSlot {
    /// Real (host) descriptor, `-1` when the slot is empty.
    pub fd: RawFd,
    /// Events the owner asked to be woken for.
    pub events: Interest,
    /// Events the last poll observed; cleared as they are consumed.
    pub revents: Interest,
}

impl PollSlot {
    pub const EMPTY: PollSlot = PollSlot {
        fd: -1,
        events: Interest::empty(),
        revents: Interest::empty(),
    };

    pub fn is_live(&self) -> bool {
        self.fd >= 0
    }
}

/// Error taxonomy of the table.
///
/// `WouldBlock` is retryable, `Full` is resource exhaustion (apply
/// backpressure), `ConnectionClosed` is expected peer EOF, and
/// `Host` is fatal for the affected vfd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PollError {
    #[error("operation would block")]
    WouldBlock,
    #[error("descriptor table is full")]
    Full,
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("dead or never-issued virtual descriptor")]
    BadDescriptor,
    #[error("host error (errno {0})")]
    Host(i32),
}

impl From<HostError> for PollError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::WouldBlock => PollError::WouldBlock,
            HostError::Os(errno) => PollError::Host(errno),
        }
    }
}
