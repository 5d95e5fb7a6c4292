//! Pre-allocated per-connection buffers for the stream (TCP) front end,
//! bounding allocation under 5,000-class connection counts.
//!
//! A free-list-linked arena distinguishing a dynamically-allocated
//! fallback record by pointer-range comparison is the classic C approach
//! here, but Rust has no equivalent to pointer-range membership tests
//! without `unsafe`, so the arena here is a plain `Vec<ConnBuffer>` with a
//! `Vec<usize>` free list of indices, and the pool-vs-overflow
//! distinction is carried explicitly by [`BufferHandle`] instead of being
//! inferred from the address. The pool is owned solely by the front-end's
//! main thread, so no internal locking is needed.

use sc_utils::safe_assert;
use sc_wire::stream::{STREAM_HEADER_SIZE, StreamHeader};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("handle index {0} is out of range for this pool")]
    InvalidHandle(usize),
    #[error("handle belongs to a different pool than the one it was released to")]
    ForeignHandle,
}

/// Where a connection's read cursor is within the 8-byte stream header +
/// variable-length body framing.
#[derive(Debug)]
pub enum ReadState {
    Header { buf: [u8; STREAM_HEADER_SIZE], filled: usize },
    Body { header: StreamHeader, buf: Vec<u8>, filled: usize },
}

impl ReadState {
    fn initial() -> Self {
        ReadState::Header { buf: [0u8; STREAM_HEADER_SIZE], filled: 0 }
    }
}

/// One connection's buffered read state, reused across the connection's
/// lifetime and reset (not reallocated) between messages.
#[derive(Debug)]
pub struct ConnBuffer {
    pub fd: i32,
    pub state: ReadState,
    in_use: bool,
}

impl ConnBuffer {
    fn fresh() -> Self {
        Self { fd: -1, state: ReadState::initial(), in_use: false }
    }

    /// Resets framing state for the next message on the same connection,
    /// keeping `fd` and any already-sized body buffer's capacity.
    pub fn reset_for_next_message(&mut self) {
        self.state = ReadState::initial();
    }
}

/// A [`ConnBuffer`] acquired from a [`BufferPool`]: either a slot in the
/// fixed arena, reclaimed on [`BufferPool::release`], or a one-off
/// heap allocation used when the pool was exhausted at acquire time.
#[derive(Debug)]
pub enum BufferHandle {
    Pooled(usize),
    Overflow(Box<ConnBuffer>),
}

/// Fixed arena of [`ConnBuffer`] records plus a free list of indices, with
/// dynamic-allocation overflow when the arena is exhausted.
pub struct BufferPool {
    arena: Vec<ConnBuffer>,
    free_list: Vec<usize>,
    used_count: usize,
}

impl BufferPool {
    /// Allocates `size` buffer records, all initially free (fd = -1,
    /// in_use = false for every record).
    #[must_use]
    pub fn new(size: usize) -> Self {
        let arena = (0..size).map(|_| ConnBuffer::fresh()).collect();
        let free_list = (0..size).rev().collect();
        tracing::info!(size, "initialized connection pool");
        Self { arena, free_list, used_count: 0 }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.arena.len()
    }

    #[must_use]
    pub fn used_count(&self) -> usize {
        self.used_count
    }

    /// Pops a free slot from the arena, resetting it to its initial state.
    /// Falls back to a one-off heap allocation (logged at `warn`) when the
    /// arena is empty.
    pub fn acquire(&mut self) -> BufferHandle {
        match self.free_list.pop() {
            Some(idx) => {
                let buf = &mut self.arena[idx];
                safe_assert!(!buf.in_use, "free list held an in-use record at index {idx}");
                buf.fd = -1;
                buf.state = ReadState::initial();
                buf.in_use = true;
                self.used_count += 1;
                BufferHandle::Pooled(idx)
            }
            None => {
                warn!(pool_size = self.arena.len(), "connection pool exhausted, falling back to heap allocation");
                let mut buf = ConnBuffer::fresh();
                buf.in_use = true;
                BufferHandle::Overflow(Box::new(buf))
            }
        }
    }

    /// Returns a handle's borrowed `ConnBuffer`.
    ///
    /// # Errors
    /// [`PoolError::InvalidHandle`] if a `Pooled` index is out of range
    /// (can only happen if the handle came from a different pool).
    pub fn get(&self, handle: &BufferHandle) -> Result<&ConnBuffer, PoolError> {
        match handle {
            BufferHandle::Pooled(idx) => self.arena.get(*idx).ok_or(PoolError::InvalidHandle(*idx)),
            BufferHandle::Overflow(buf) => Ok(buf),
        }
    }

    /// Mutable counterpart of [`BufferPool::get`].
    pub fn get_mut(&mut self, handle: &mut BufferHandle) -> Result<&mut ConnBuffer, PoolError> {
        match handle {
            BufferHandle::Pooled(idx) => self.arena.get_mut(*idx).ok_or(PoolError::InvalidHandle(*idx)),
            BufferHandle::Overflow(buf) => Ok(buf),
        }
    }

    /// Returns a handle to the pool: a `Pooled` slot goes back on the free
    /// list with `in_use` cleared and `fd` reset to `-1`, maintaining the
    /// invariant that a record's fd is -1 iff it is on the free list; an
    /// `Overflow` handle is simply dropped, freeing its allocation. There is
    /// no no-op "release nothing" case here since the handle always names a
    /// live buffer; callers that conditionally hold a buffer should wrap
    /// the `Option` themselves.
    ///
    /// # Errors
    /// [`PoolError::InvalidHandle`] if the handle's index is out of range
    /// for this pool, [`PoolError::ForeignHandle`] if the slot it names is
    /// not currently marked in-use (it was already released, or belongs
    /// to a different pool instance).
    pub fn release(&mut self, handle: BufferHandle) -> Result<(), PoolError> {
        match handle {
            BufferHandle::Pooled(idx) => {
                let buf = self.arena.get_mut(idx).ok_or(PoolError::InvalidHandle(idx))?;
                if !buf.in_use {
                    return Err(PoolError::ForeignHandle);
                }
                buf.fd = -1;
                buf.state = ReadState::initial();
                buf.in_use = false;
                safe_assert!(buf.fd == -1, "released record at index {idx} did not reset fd to -1");
                self.free_list.push(idx);
                self.used_count -= 1;
                Ok(())
            }
            BufferHandle::Overflow(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_pool_has_every_slot_free_with_fd_negative_one() {
        let pool = BufferPool::new(4);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.used_count(), 0);
        for buf in &pool.arena {
            assert_eq!(buf.fd, -1);
            assert!(!buf.in_use);
        }
    }

    #[test]
    fn acquire_marks_in_use_and_release_clears_it() {
        let mut pool = BufferPool::new(2);
        let handle = pool.acquire();
        assert_eq!(pool.used_count(), 1);
        assert!(pool.get(&handle).unwrap().in_use);

        pool.release(handle).unwrap();
        assert_eq!(pool.used_count(), 0);
        for buf in &pool.arena {
            assert!(!buf.in_use);
            assert_eq!(buf.fd, -1);
        }
    }

    #[test]
    fn exhausted_pool_falls_back_to_overflow() {
        let mut pool = BufferPool::new(1);
        let first = pool.acquire();
        let second = pool.acquire();

        assert!(matches!(first, BufferHandle::Pooled(_)));
        assert!(matches!(second, BufferHandle::Overflow(_)));
        assert_eq!(pool.used_count(), 1); // overflow handles aren't tracked in used_count

        pool.release(first).unwrap();
        pool.release(second).unwrap();
        assert_eq!(pool.used_count(), 0);
    }

    #[test]
    fn released_slots_are_reused_lifo() {
        let mut pool = BufferPool::new(2);
        let a = pool.acquire();
        let b = pool.acquire();
        let a_idx = match a {
            BufferHandle::Pooled(i) => i,
            BufferHandle::Overflow(_) => unreachable!(),
        };
        pool.release(a).unwrap();

        let c = pool.acquire();
        match c {
            BufferHandle::Pooled(i) => assert_eq!(i, a_idx),
            BufferHandle::Overflow(_) => panic!("expected pooled slot reuse"),
        }
        pool.release(b).unwrap();
        pool.release(c).unwrap();
    }

    #[test]
    fn releasing_an_already_released_handle_is_rejected() {
        let mut pool = BufferPool::new(1);
        let handle = pool.acquire();
        let idx = match handle {
            BufferHandle::Pooled(i) => i,
            BufferHandle::Overflow(_) => unreachable!(),
        };
        pool.release(handle).unwrap();

        let stale = BufferHandle::Pooled(idx);
        assert_eq!(pool.release(stale), Err(PoolError::ForeignHandle));
    }

    #[test]
    fn reset_for_next_message_returns_to_reading_header() {
        let mut pool = BufferPool::new(1);
        let mut handle = pool.acquire();
        {
            let buf = pool.get_mut(&mut handle).unwrap();
            buf.state = ReadState::Body {
                header: StreamHeader::new(sc_wire::stream::StreamMessageType::Echo, 3),
                buf: vec![1, 2, 3],
                filled: 3,
            };
            buf.reset_for_next_message();
            assert!(matches!(buf.state, ReadState::Header { filled: 0, .. }));
        }
        pool.release(handle).unwrap();
    }
}
