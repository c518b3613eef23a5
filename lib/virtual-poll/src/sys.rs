//! Real-socket backend for Unix hosts.
//!
//! Wraps the libc socket calls the runtime needs, with every descriptor
//! switched to non-blocking mode before it is handed back.

use std::io;
use std::mem;
use std::time::Duration;

use crate::{Host, HostError, Interest, PollSlot, RawFd};

/// [`Host`] implementation over the platform's sockets and `poll(2)`.
#[derive(Debug, Default)]
pub struct PosixHost {
    pollfds: Vec<libc::pollfd>,
}

impl PosixHost {
    pub fn new() -> Self {
        Self::default()
    }
}

fn last_errno() -> HostError {
    let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
    if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK {
        HostError::WouldBlock
    } else {
        HostError::Os(errno)
    }
}

fn set_nonblocking(fd: RawFd) -> Result<(), HostError> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(last_errno());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(last_errno());
        }
    }
    Ok(())
}

impl Host for PosixHost {
    fn listen(&mut self, port: u16, backlog: u32) -> Result<RawFd, HostError> {
        unsafe {
            let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
            if fd < 0 {
                return Err(last_errno());
            }
            let one: libc::c_int = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
            let mut addr: libc::sockaddr_in = mem::zeroed();
            addr.sin_family = libc::AF_INET as libc::sa_family_t;
            addr.sin_port = port.to_be();
            addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();
            let rc = libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            );
            if rc < 0 {
                let err = last_errno();
                libc::close(fd);
                return Err(err);
            }
            if libc::listen(fd, backlog as libc::c_int) < 0 {
                let err = last_errno();
                libc::close(fd);
                return Err(err);
            }
            if let Err(err) = set_nonblocking(fd) {
                libc::close(fd);
                return Err(err);
            }
            Ok(fd)
        }
    }

    fn accept(&mut self, fd: RawFd) -> Result<RawFd, HostError> {
        let conn = unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if conn < 0 {
            return Err(last_errno());
        }
        if let Err(err) = set_nonblocking(conn) {
            unsafe { libc::close(conn) };
            return Err(err);
        }
        Ok(conn)
    }

    fn recv(&mut self, fd: RawFd, buf: &mut [u8]) -> Result<usize, HostError> {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            return Err(last_errno());
        }
        Ok(n as usize)
    }

    fn send(&mut self, fd: RawFd, buf: &[u8]) -> Result<usize, HostError> {
        #[cfg(target_os = "linux")]
        let flags = libc::MSG_NOSIGNAL;
        #[cfg(not(target_os = "linux"))]
        let flags = 0;
        let n = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags) };
        if n < 0 {
            return Err(last_errno());
        }
        Ok(n as usize)
    }

    fn close(&mut self, fd: RawFd) -> Result<(), HostError> {
        if unsafe { libc::close(fd) } < 0 {
            return Err(last_errno());
        }
        Ok(())
    }

    fn poll(
        &mut self,
        slots: &mut [PollSlot],
        timeout: Option<Duration>,
    ) -> Result<usize, HostError> {
        // Mirror the slot array one-to-one; poll(2) skips negative fds,
        // which keeps indices aligned with the table.
        self.pollfds.clear();
        self.pollfds.extend(slots.iter().map(|slot| libc::pollfd {
            fd: slot.fd,
            events: slot.events.bits() as libc::c_short,
            revents: 0,
        }));
        let timeout_ms = match timeout {
            Some(t) => t.as_millis().min(i32::MAX as u128) as libc::c_int,
            None => -1,
        };
        let n = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(last_errno());
        }
        for (slot, pollfd) in slots.iter_mut().zip(&self.pollfds) {
            slot.revents = Interest::from_bits_truncate(pollfd.revents as u16);
        }
        Ok(n as usize)
    }
}
