use std::time::Duration;

use index_pool::IndexPool;

use crate::{Host, Interest, PollError, PollSlot, RawFd, Vfd};

/// Table of virtual descriptors backed by one [`Host`].
///
/// A slot is live iff its real descriptor is non-negative; `len` is the
/// count of live slots. The vfd handed to callers is the slot index,
/// issued by the internal [`IndexPool`] and reclaimed on close.
pub struct VfdTable<H: Host> {
    host: H,
    pool: IndexPool,
    slots: Vec<PollSlot>,
    len: u32,
    /// Ready events reported by the last `poll`, not yet consumed by
    /// `drain_ready`.
    pending: usize,
}

impl<H: Host> VfdTable<H> {
    /// # Panics
    ///
    /// Panics if `capacity` is zero; the table is sized once at
    /// startup and a zero-sized table is a configuration bug.
    pub fn new(host: H, capacity: u32) -> Self {
        assert!(capacity > 0, "descriptor table capacity must be positive");
        let pool = IndexPool::new(capacity).expect("capacity is positive");
        Self {
            host,
            pool,
            slots: vec![PollSlot::EMPTY; capacity as usize],
            len: 0,
            pending: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Number of live virtual descriptors.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    fn slot(&self, vfd: Vfd) -> Result<&PollSlot, PollError> {
        match self.slots.get(vfd.0 as usize) {
            Some(slot) if slot.is_live() => Ok(slot),
            _ => Err(PollError::BadDescriptor),
        }
    }

    fn slot_mut(&mut self, vfd: Vfd) -> Result<&mut PollSlot, PollError> {
        match self.slots.get_mut(vfd.0 as usize) {
            Some(slot) if slot.is_live() => Ok(slot),
            _ => Err(PollError::BadDescriptor),
        }
    }

    /// Registers `fd` in a fresh slot. The caller decides what happens
    /// to `fd` when the table is full.
    fn install(&mut self, fd: RawFd, events: Interest) -> Result<Vfd, PollError> {
        debug_assert!(fd >= 0);
        let index = self.pool.acquire().map_err(|_| PollError::Full)?;
        self.slots[index as usize] = PollSlot {
            fd,
            events,
            revents: Interest::empty(),
        };
        self.len += 1;
        debug_assert!(self.len <= self.capacity());
        Ok(Vfd(index))
    }

    /// Opens a listening socket and wraps it with read interest.
    pub fn listen(&mut self, port: u16, backlog: u32) -> Result<Vfd, PollError> {
        let fd = self.host.listen(port, backlog)?;
        match self.install(fd, Interest::IN) {
            Ok(vfd) => {
                tracing::debug!(%vfd, fd, port, "listening");
                Ok(vfd)
            }
            Err(err) => {
                self.host.close(fd).ok();
                Err(err)
            }
        }
    }

    /// Registers a pre-existing real descriptor (e.g. a preopened
    /// socket). On `Full` the caller keeps ownership of `fd`.
    pub fn wrap(&mut self, fd: RawFd) -> Result<Vfd, PollError> {
        let vfd = self.install(fd, Interest::empty())?;
        tracing::debug!(%vfd, fd, "wrapped preopened descriptor");
        Ok(vfd)
    }

    /// Accepts one connection on `listener` and wraps it.
    ///
    /// The host accept comes first so no vfd is allocated when it
    /// fails; if the table is full afterwards the freshly accepted
    /// descriptor is closed before `Full` is surfaced, so it cannot
    /// leak.
    pub fn accept(&mut self, listener: Vfd) -> Result<Vfd, PollError> {
        let lfd = self.slot(listener)?.fd;
        let fd = self.host.accept(lfd)?;
        match self.install(fd, Interest::empty()) {
            Ok(vfd) => {
                tracing::debug!(%listener, %vfd, fd, "accepted connection");
                Ok(vfd)
            }
            Err(err) => {
                tracing::warn!(%listener, fd, "table full, dropping accepted connection");
                self.host.close(fd).ok();
                Err(err)
            }
        }
    }

    /// Reads into `buf`. A zero-length underlying read is reported as
    /// `ConnectionClosed`, never as `Ok(0)`.
    pub fn recv(&mut self, vfd: Vfd, buf: &mut [u8]) -> Result<usize, PollError> {
        let fd = self.slot(vfd)?.fd;
        match self.host.recv(fd, buf)? {
            0 => Err(PollError::ConnectionClosed),
            n => Ok(n),
        }
    }

    /// Writes from `buf`; may report fewer bytes than `buf.len()`.
    /// Resubmitting the remainder is the caller's job.
    pub fn send(&mut self, vfd: Vfd, buf: &[u8]) -> Result<usize, PollError> {
        let fd = self.slot(vfd)?.fd;
        Ok(self.host.send(fd, buf)?)
    }

    /// Closes the real descriptor, clears the slot, and reclaims the
    /// index. The slot is reclaimed even when the host close reports an
    /// error, so a vfd is never left half-dead; closing an already-dead
    /// vfd fails with `BadDescriptor` without touching the allocator.
    pub fn close(&mut self, vfd: Vfd) -> Result<(), PollError> {
        let fd = self.slot(vfd)?.fd;
        self.slots[vfd.0 as usize] = PollSlot::EMPTY;
        self.pool
            .release(vfd.0)
            .expect("live slot index is issued");
        self.len -= 1;
        tracing::debug!(%vfd, fd, "closed");
        Ok(self.host.close(fd)?)
    }

    /// Adds read interest for `vfd`. Idempotent; never clears write
    /// interest still pending on the same slot.
    pub fn notify_recv(&mut self, vfd: Vfd) -> Result<(), PollError> {
        self.slot_mut(vfd)?.events.insert(Interest::IN);
        Ok(())
    }

    /// Adds write interest for `vfd`. Idempotent; never clears read
    /// interest still pending on the same slot.
    pub fn notify_send(&mut self, vfd: Vfd) -> Result<(), PollError> {
        self.slot_mut(vfd)?.events.insert(Interest::OUT);
        Ok(())
    }

    /// Requested events of a live slot.
    pub fn interests(&self, vfd: Vfd) -> Result<Interest, PollError> {
        Ok(self.slot(vfd)?.events)
    }

    /// One backend poll over all live slots. Returns how many slots
    /// have observed events; consume them with [`Self::drain_ready`].
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<usize, PollError> {
        let ready = self.host.poll(&mut self.slots, timeout)?;
        tracing::trace!(ready, "polled");
        self.pending = ready;
        Ok(ready)
    }

    /// Visits every slot with observed events, in slot order, clearing
    /// both masks as each is reported so a readiness edge is consumed
    /// exactly once. Stops after the count the last `poll` returned.
    pub fn drain_ready(&mut self) -> DrainReady<'_, H> {
        DrainReady { table: self, next: 0 }
    }

    /// Tears the table down. Callers must have closed every vfd first;
    /// nothing is closed implicitly.
    ///
    /// # Panics
    ///
    /// Panics if live descriptors remain.
    pub fn finalize(self) {
        assert!(
            self.is_empty(),
            "descriptor table finalized with {} live descriptors",
            self.len
        );
    }
}

/// Iterator over `(vfd, observed events)` pairs since the last poll.
pub struct DrainReady<'a, H: Host> {
    table: &'a mut VfdTable<H>,
    next: usize,
}

impl<H: Host> Iterator for DrainReady<'_, H> {
    type Item = (Vfd, Interest);

    fn next(&mut self) -> Option<Self::Item> {
        while self.table.pending > 0 && self.next < self.table.slots.len() {
            let index = self.next;
            self.next += 1;
            let slot = &mut self.table.slots[index];
            if slot.is_live() && !slot.revents.is_empty() {
                let observed = slot.revents;
                slot.events = Interest::empty();
                slot.revents = Interest::empty();
                self.table.pending -= 1;
                return Some((Vfd(index as u32), observed));
            }
        }
        None
    }
}
