use std::time::Duration;

use thiserror::Error;

use crate::PollSlot;

/// Real (host-side) descriptor value.
pub type RawFd = i32;

/// The errno channel of the host, reduced to the one distinction the
/// runtime needs: retry later versus a real failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("operation would block")]
    WouldBlock,
    #[error("host errno {0}")]
    Os(i32),
}

/// Non-blocking, poll-style syscall surface provided by the embedder.
///
/// Every descriptor handed out by `listen`/`accept` must already be in
/// non-blocking mode; the table relies on `WouldBlock` instead of ever
/// sleeping inside a call.
pub trait Host {
    /// Binds and listens on `port`; returns the listening descriptor.
    fn listen(&mut self, port: u16, backlog: u32) -> Result<RawFd, HostError>;

    /// Accepts one pending connection on a listening descriptor.
    fn accept(&mut self, fd: RawFd) -> Result<RawFd, HostError>;

    /// Reads into `buf`. `Ok(0)` means the peer closed the connection;
    /// the distinction from "no data yet" (`WouldBlock`) matters.
    fn recv(&mut self, fd: RawFd, buf: &mut [u8]) -> Result<usize, HostError>;

    /// Writes from `buf`; short writes are legal.
    fn send(&mut self, fd: RawFd, buf: &[u8]) -> Result<usize, HostError>;

    fn close(&mut self, fd: RawFd) -> Result<(), HostError>;

    /// Level-triggered poll over the whole slot array. Slots with
    /// `fd == -1` are skipped. Fills `revents` on live slots and
    /// returns how many slots have nonzero `revents`. `None` blocks
    /// until something is ready.
    fn poll(
        &mut self,
        slots: &mut [PollSlot],
        timeout: Option<Duration>,
    ) -> Result<usize, HostError>;
}
