use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Pool of reusable byte buffers handed to handle records as scratch readers.
///
/// Decoding a call that returns variable-length data (descriptor update templates, pipeline
/// cache blobs) needs a staging buffer. Records attach one lazily on first use and give it back
/// here when they die, so steady-state decoding does not allocate.
#[derive(Debug)]
pub struct ScratchPool {
    free: Mutex<Vec<Vec<u8>>>,
    limit: usize,
}

impl ScratchPool {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            limit,
        })
    }

    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let buf = self.free.lock().pop().unwrap_or_default();
        PooledBuffer {
            buf,
            pool: Arc::downgrade(self),
        }
    }

    /// Buffers currently parked in the pool.
    pub fn pooled(&self) -> usize {
        self.free.lock().len()
    }
}

#[derive(Debug)]
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Weak<ScratchPool>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        let mut free = pool.free.lock();
        if free.len() < pool.limit {
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_return_to_pool_with_capacity() {
        let pool = ScratchPool::new(2);
        {
            let mut a = pool.acquire();
            a.extend_from_slice(&[0u8; 128]);
        }
        assert_eq!(pool.pooled(), 1);
        let b = pool.acquire();
        assert!(b.is_empty());
        assert!(b.capacity() >= 128);
        assert_eq!(pool.pooled(), 0);
    }

    #[test]
    fn pool_limit_is_respected() {
        let pool = ScratchPool::new(1);
        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);
        assert_eq!(pool.pooled(), 1);
    }
}
