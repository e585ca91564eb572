//! Thread-safe sequence counter for outbound frame numbering.
//!
//! # What is the sequence number used for?
//!
//! Every outbound frame carries a 32-bit sequence number.  The device echoes
//! it back in the `response_to` field of its reply, which is how a response
//! finds the request that is waiting for it, no matter in which order
//! responses arrive.
//!
//! The value `0` is reserved: in `response_to` it means "this frame is not a
//! response".  The counter therefore starts at 1, and when it wraps it skips
//! 0 and continues at 1 again.  The whole sequence space restarts at 1
//! whenever the link drops.
//!
//! # Thread safety
//!
//! The counter is an `AtomicU32`.  Allocation and reset are single atomic
//! operations, so concurrent callers can never observe the same value and a
//! reset is never interleaved with a half-finished allocation.

use std::sync::atomic::{AtomicU32, Ordering};

/// First sequence number of a fresh link.
pub const FIRST_SEQUENCE: u32 = 1;

/// A thread-safe, monotonically increasing counter for frame sequence numbers.
///
/// # Examples
///
/// ```rust
/// use tuya_ble_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 1);
/// assert_eq!(counter.next(), 2);
/// counter.reset();
/// assert_eq!(counter.next(), 1);
/// ```
#[derive(Debug)]
pub struct SequenceCounter {
    inner: AtomicU32,
}

impl SequenceCounter {
    /// Creates a new counter whose first value is 1.
    pub fn new() -> Self {
        Self {
            inner: AtomicU32::new(FIRST_SEQUENCE),
        }
    }

    /// Returns the next sequence number and advances the counter.
    ///
    /// `SeqCst` keeps allocation totally ordered with [`reset`](Self::reset).
    pub fn next(&self) -> u32 {
        let previous = self
            .inner
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(match current.wrapping_add(1) {
                    0 => FIRST_SEQUENCE,
                    n => n,
                })
            });
        // The closure always returns Some, so fetch_update cannot fail.
        match previous {
            Ok(v) | Err(v) => v,
        }
    }

    /// Returns the value the next call to [`next`](Self::next) will hand out.
    pub fn current(&self) -> u32 {
        self.inner.load(Ordering::SeqCst)
    }

    /// Restarts the sequence space at 1.
    pub fn reset(&self) {
        self.inner.store(FIRST_SEQUENCE, Ordering::SeqCst);
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}
