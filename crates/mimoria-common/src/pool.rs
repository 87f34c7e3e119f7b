//! A pool of reusable [`BytesMut`] buffers.
//!
//! Checkout returns a [`PooledBuf`] guard; dropping the guard returns the
//! buffer to the pool (cleared, capacity retained) regardless of whether the
//! caller's path was success or error. This is the release guarantee §4.A
//! requires of buffer handling on every exit path of request handling.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;

struct Inner {
    free: Mutex<Vec<BytesMut>>,
    default_capacity: usize,
}

/// Shared handle to a buffer pool. Cheaply cloneable.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

impl BufferPool {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                free: Mutex::new(Vec::new()),
                default_capacity,
            }),
        }
    }

    /// Check out a buffer, reusing a freed one if available.
    pub fn checkout(&self) -> PooledBuf {
        let buf = self
            .inner
            .free
            .lock()
            .expect("buffer pool mutex poisoned")
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.inner.default_capacity));
        PooledBuf {
            buf: Some(buf),
            pool: self.inner.clone(),
        }
    }
}

/// A checked-out buffer. Returned to its pool on drop.
pub struct PooledBuf {
    buf: Option<BytesMut>,
    pool: Arc<Inner>,
}

impl Deref for PooledBuf {
    type Target = BytesMut;
    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer taken before drop")
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer taken before drop")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            buf.clear();
            if let Ok(mut free) = self.pool.free.lock() {
                free.push(buf);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checked_out_buffer_is_reused_after_release() {
        let pool = BufferPool::new(64);
        {
            let mut buf = pool.checkout();
            buf.extend_from_slice(b"hello");
        }
        assert_eq!(pool.inner.free.lock().unwrap().len(), 1);

        let buf = pool.checkout();
        assert!(buf.is_empty());
        assert!(pool.inner.free.lock().unwrap().is_empty());
    }

    #[test]
    fn release_happens_even_when_caller_path_errors() {
        let pool = BufferPool::new(64);
        let work = || -> Result<(), ()> {
            let mut buf = pool.checkout();
            buf.extend_from_slice(b"x");
            Err(())
        };
        assert!(work().is_err());
        assert_eq!(pool.inner.free.lock().unwrap().len(), 1);
    }
}
