//! Stackful fibers for cooperative scheduling.
//!
//! A fiber is a suspendable call stack: it is created from an entry
//! closure, resumed with a value, and suspends by yielding a value back
//! to its resumer. The pool owns the backing coroutines in a slab arena
//! keyed by [`FiberId`], so schedulers only ever handle small opaque
//! ids. The arena grows on demand; a fiber cannot yield to ask for a
//! resize, so allocation must not fail under load.
//!
//! Stack switching is done by [`corosensei`]; the yielder handed to the
//! entry closure is the only way to suspend, which keeps "yield outside
//! fiber context" unrepresentable.

use corosensei::CoroutineResult;
use slab::Slab;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

pub use corosensei::Yielder;

type Coroutine<A, Y, R> = corosensei::Coroutine<A, Y, R>;

/// Opaque handle to a fiber in a [`FiberPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(usize);

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber#{}", self.0)
    }
}

/// Outcome of one [`FiberPool::resume`] call.
#[derive(Debug)]
pub enum FiberResult<Y, R> {
    /// The fiber suspended and yielded a value; resume it again later.
    Suspended(Y),
    /// The fiber body returned. The id must be freed before reuse.
    Completed(R),
    /// The fiber body panicked and its stack has been unwound. The id
    /// must be freed; resuming it again is a programming error.
    Faulted,
}

/// Arena of fibers sharing one resume/yield protocol.
///
/// `A` is the resume argument, `Y` the yielded value, `R` the return
/// value of the fiber body.
pub struct FiberPool<A, Y, R> {
    fibers: Slab<Coroutine<A, Y, R>>,
}

impl<A, Y, R> FiberPool<A, Y, R>
where
    A: 'static,
    Y: 'static,
    R: 'static,
{
    pub fn new() -> Self {
        Self { fibers: Slab::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fibers: Slab::with_capacity(capacity),
        }
    }

    /// Number of live (allocated, not yet freed) fibers.
    pub fn len(&self) -> usize {
        self.fibers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fibers.is_empty()
    }

    /// Creates a not-yet-started fiber. The entry closure runs on its
    /// own stack at the first `resume`, receiving the yielder and the
    /// first resume argument.
    pub fn alloc<F>(&mut self, entry: F) -> FiberId
    where
        F: FnOnce(&Yielder<A, Y>, A) -> R + 'static,
    {
        let id = FiberId(self.fibers.insert(Coroutine::new(entry)));
        tracing::trace!(fiber = %id, "allocated");
        id
    }

    /// Runs or continues the fiber until it yields, returns, or panics.
    ///
    /// # Panics
    ///
    /// Panics if `id` was freed or the fiber already completed; both
    /// are programming errors of the caller, not runtime conditions.
    pub fn resume(&mut self, id: FiberId, arg: A) -> FiberResult<Y, R> {
        let fiber = self
            .fibers
            .get_mut(id.0)
            .unwrap_or_else(|| panic!("resume of freed {id}"));
        assert!(!fiber.done(), "resume of completed {id}");
        match panic::catch_unwind(AssertUnwindSafe(|| fiber.resume(arg))) {
            Ok(CoroutineResult::Yield(payload)) => FiberResult::Suspended(payload),
            Ok(CoroutineResult::Return(ret)) => FiberResult::Completed(ret),
            Err(_) => {
                tracing::error!(fiber = %id, "fiber body panicked");
                FiberResult::Faulted
            }
        }
    }

    /// Releases the fiber's slot. Valid after a terminal result;
    /// dropping a fiber that is still suspended force-unwinds its
    /// stack, which is reserved for shutdown bug paths.
    ///
    /// # Panics
    ///
    /// Panics on double free.
    pub fn free(&mut self, id: FiberId) {
        let fiber = self
            .fibers
            .try_remove(id.0)
            .unwrap_or_else(|| panic!("double free of {id}"));
        drop(fiber);
        tracing::trace!(fiber = %id, "freed");
    }
}

impl<A, Y, R> Default for FiberPool<A, Y, R>
where
    A: 'static,
    Y: 'static,
    R: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
