//! A process-wide pool of copy buffers for relays.
//!
//! Buffers are checked out per relay and go back to the pool when the
//! [`PooledBuf`] is dropped. The pool keeps at most `max_idle` buffers around;
//! surplus buffers are freed.
use core::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Size of every pooled buffer.
pub(crate) const BUFFER_LEN: usize = 16 * 1024;

/// A pool of equally sized byte buffers.
#[derive(Debug)]
pub(crate) struct BufferPool {
    idle: Mutex<Vec<Box<[u8]>>>,
    buf_len: usize,
    max_idle: usize,
}

impl BufferPool {
    /// Creates an empty pool.
    pub(crate) fn new(buf_len: usize, max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            buf_len,
            max_idle,
        }
    }

    /// Takes a buffer from the pool, allocating one if none is idle.
    pub(crate) fn get(&self) -> PooledBuf<'_> {
        let buf = self
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buf_len].into_boxed_slice());
        PooledBuf {
            buf: Some(buf),
            pool: self,
        }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn put(&self, buf: Box<[u8]>) {
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
    }
}

/// A buffer on loan from a [`BufferPool`].
#[derive(Debug)]
pub(crate) struct PooledBuf<'a> {
    buf: Option<Box<[u8]>>,
    pool: &'a BufferPool,
}

impl Deref for PooledBuf<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_buffers_are_reused() {
        let pool = BufferPool::new(64, 1);
        {
            let mut a = pool.get();
            let b = pool.get();
            assert_eq!(a.len(), 64);
            assert_eq!(b.len(), 64);
            a[0] = 7;
        }
        // only one of the two is kept
        assert_eq!(pool.idle(), 1);
        let c = pool.get();
        assert_eq!(c.len(), 64);
        assert_eq!(pool.idle(), 0);
    }
}
