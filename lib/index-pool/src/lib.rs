//! A bitmap-backed pool of small dense indices.
//!
//! The pool hands out the lowest currently-free index and takes indices
//! back for reuse. It is the identifier source for the virtual
//! descriptor table and anything else that needs compact, reusable
//! `u32` handles. Words are fixed at 32 bits so the bit arithmetic is
//! identical on every target.

use thiserror::Error;

const WORD_BITS: u32 = u32::BITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// A pool must manage at least one index.
    #[error("pool capacity must be positive")]
    ZeroCapacity,
    /// Every index is currently issued.
    #[error("no free index left")]
    Full,
    /// The index lies outside the pool's capacity.
    #[error("index out of bounds")]
    OutOfBounds,
    /// A shrink would cut off an index that is still issued.
    #[error("cannot shrink below an issued index")]
    Occupied,
}

/// Pool of indices in `[0, capacity)`.
///
/// Bit `b` of word `w` is set iff index `w * 32 + b` is free. The bits
/// of the last word that lie past `capacity` are kept permanently
/// clear, so a word scan can never produce an out-of-range index.
#[derive(Debug, Clone)]
pub struct IndexPool {
    size: u32,
    words: Vec<u32>,
}

impl IndexPool {
    /// Creates a pool with every index in `[0, capacity)` free.
    ///
    /// Any positive capacity is accepted; it does not have to be a
    /// power of two.
    pub fn new(capacity: u32) -> Result<Self, PoolError> {
        if capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }
        let len = capacity.div_ceil(WORD_BITS) as usize;
        let mut words = vec![u32::MAX; len];
        mask_tail(&mut words, capacity);
        Ok(Self {
            size: capacity,
            words,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.size
    }

    /// Issues the lowest currently-free index.
    ///
    /// The lowest-first policy is deterministic: for a fixed sequence
    /// of `acquire`/`release` calls the same indices come back in the
    /// same order.
    pub fn acquire(&mut self) -> Result<u32, PoolError> {
        for (w, word) in self.words.iter_mut().enumerate() {
            if *word == 0 {
                continue;
            }
            let bit = word.trailing_zeros();
            *word &= !(1 << bit);
            let index = w as u32 * WORD_BITS + bit;
            debug_assert!(index < self.size);
            return Ok(index);
        }
        Err(PoolError::Full)
    }

    /// Returns an issued index to the pool.
    ///
    /// # Panics
    ///
    /// Panics if `index` is currently free. Releasing an index twice
    /// (or one that was never issued) is an internal-consistency
    /// violation on the caller's side, not a recoverable condition.
    pub fn release(&mut self, index: u32) -> Result<(), PoolError> {
        if index >= self.size {
            return Err(PoolError::OutOfBounds);
        }
        let w = (index / WORD_BITS) as usize;
        let bit = index % WORD_BITS;
        assert!(
            self.words[w] & (1 << bit) == 0,
            "release of a free index {index}"
        );
        self.words[w] |= 1 << bit;
        Ok(())
    }

    /// Grows or shrinks the pool to `new_capacity`.
    ///
    /// Growth preserves the issued/free state of every existing index
    /// and marks the new range free. A shrink is refused while any
    /// index at or above `new_capacity` is still issued.
    pub fn resize(&mut self, new_capacity: u32) -> Result<(), PoolError> {
        if new_capacity == 0 {
            return Err(PoolError::ZeroCapacity);
        }
        if new_capacity >= self.size {
            let len = new_capacity.div_ceil(WORD_BITS) as usize;
            self.words.resize(len, 0);
            set_range(&mut self.words, self.size, new_capacity);
        } else {
            if !range_is_free(&self.words, new_capacity, self.size) {
                return Err(PoolError::Occupied);
            }
            let len = new_capacity.div_ceil(WORD_BITS) as usize;
            self.words.truncate(len);
            mask_tail(&mut self.words, new_capacity);
        }
        self.size = new_capacity;
        Ok(())
    }
}

/// Clears the bits of the last word that lie past `capacity`.
fn mask_tail(words: &mut [u32], capacity: u32) {
    let used = capacity % WORD_BITS;
    if used != 0 {
        if let Some(last) = words.last_mut() {
            *last &= (1 << used) - 1;
        }
    }
}

/// Sets the free bit for every index in `[from, to)`.
fn set_range(words: &mut [u32], from: u32, to: u32) {
    for index in from..to {
        words[(index / WORD_BITS) as usize] |= 1 << (index % WORD_BITS);
    }
}

/// True iff every index in `[from, to)` is free.
fn range_is_free(words: &[u32], from: u32, to: u32) -> bool {
    (from..to).all(|index| words[(index / WORD_BITS) as usize] & (1 << (index % WORD_BITS)) != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(pool: &mut IndexPool, count: u32) {
        for expected in 0..count {
            assert_eq!(pool.acquire(), Ok(expected));
        }
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(IndexPool::new(0).unwrap_err(), PoolError::ZeroCapacity);
    }

    #[test]
    fn any_positive_capacity_is_accepted() {
        // Earlier revisions demanded a power of two; the contract is
        // just "positive".
        assert_eq!(IndexPool::new(3).unwrap().capacity(), 3);
    }

    #[test]
    fn small_pool_issue_and_reclaim() {
        let mut pool = IndexPool::new(4).unwrap();
        fill(&mut pool, 4);
        assert_eq!(pool.acquire(), Err(PoolError::Full));
        pool.release(3).unwrap();
        assert_eq!(pool.acquire(), Ok(3));
        assert_eq!(pool.acquire(), Err(PoolError::Full));
        pool.release(0).unwrap();
        assert_eq!(pool.acquire(), Ok(0));
        pool.release(1).unwrap();
        assert_eq!(pool.acquire(), Ok(1));
        pool.release(2).unwrap();
        assert_eq!(pool.acquire(), Ok(2));
        assert_eq!(pool.release(4), Err(PoolError::OutOfBounds));
    }

    #[test]
    fn multi_word_pool() {
        let mut pool = IndexPool::new(128).unwrap();
        fill(&mut pool, 128);
        assert_eq!(pool.acquire(), Err(PoolError::Full));
        pool.release(67).unwrap();
        assert_eq!(pool.acquire(), Ok(67));
        assert_eq!(pool.release(256), Err(PoolError::OutOfBounds));
    }

    #[test]
    fn partial_word_capacity_is_exact() {
        let mut pool = IndexPool::new(33).unwrap();
        fill(&mut pool, 33);
        assert_eq!(pool.acquire(), Err(PoolError::Full));
    }

    #[test]
    fn out_of_bounds_release_leaves_state_intact() {
        let mut pool = IndexPool::new(2).unwrap();
        fill(&mut pool, 2);
        assert_eq!(pool.release(40), Err(PoolError::OutOfBounds));
        assert_eq!(pool.acquire(), Err(PoolError::Full));
    }

    #[test]
    #[should_panic(expected = "release of a free index")]
    fn double_release_panics() {
        let mut pool = IndexPool::new(4).unwrap();
        pool.acquire().unwrap();
        pool.release(0).unwrap();
        pool.release(0).unwrap();
    }

    #[test]
    fn grow_preserves_residents() {
        let mut pool = IndexPool::new(3).unwrap();
        assert_eq!(pool.acquire(), Ok(0));
        assert_eq!(pool.acquire(), Ok(1));
        pool.resize(40).unwrap();
        // 0 and 1 stay issued, everything else (old and new) is free.
        assert_eq!(pool.acquire(), Ok(2));
        assert_eq!(pool.acquire(), Ok(3));
        for expected in 4..40 {
            assert_eq!(pool.acquire(), Ok(expected));
        }
        assert_eq!(pool.acquire(), Err(PoolError::Full));
    }

    #[test]
    fn shrink_below_issued_index_is_refused() {
        let mut pool = IndexPool::new(3).unwrap();
        assert_eq!(pool.acquire(), Ok(0));
        pool.resize(4).unwrap();
        assert_eq!(pool.acquire(), Ok(1));
        assert_eq!(pool.resize(1), Err(PoolError::Occupied));
        pool.release(1).unwrap();
        pool.resize(1).unwrap();
        assert_eq!(pool.release(1), Err(PoolError::OutOfBounds));
        assert_eq!(pool.acquire(), Err(PoolError::Full));
        pool.release(0).unwrap();
        assert_eq!(pool.acquire(), Ok(0));
    }
}
