// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Fixed-size pre-allocated byte buffers reused for packet assembly.
//!
//! Single-producer/single-consumer stack owned by the session task. Pool exhaustion
//! falls back to fresh allocation rather than blocking the hot path.

use std::sync::Mutex;

/// A leased buffer. Its bytes are cleared and returned to the owning [`BufferPool`]
/// when dropped, unless the pool has since been dropped too.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: std::sync::Weak<Mutex<Vec<Vec<u8>>>>,
}

impl PooledBuffer {
    pub fn as_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            let mut buf = std::mem::take(&mut self.buf);
            buf.clear();
            if let Ok(mut slots) = pool.lock() {
                slots.push(buf);
            }
        }
    }
}

/// Pool of fixed-capacity byte buffers for packet assembly.
///
/// Slots are uniquely leased to an in-flight packet and returned on drop. When the
/// pool is exhausted, [`BufferPool::lease`] falls back to a fresh allocation rather
/// than blocking or failing.
#[derive(Debug)]
pub struct BufferPool {
    slots: std::sync::Arc<Mutex<Vec<Vec<u8>>>>,
    buffer_capacity: usize,
}

impl BufferPool {
    /// Creates a pool of `count` buffers, each pre-allocated to `buffer_capacity` bytes.
    pub fn new(count: usize, buffer_capacity: usize) -> Self {
        let slots = (0..count).map(|_| Vec::with_capacity(buffer_capacity)).collect();
        Self {
            slots: std::sync::Arc::new(Mutex::new(slots)),
            buffer_capacity,
        }
    }

    /// Leases a buffer from the pool, or allocates a fresh one if none are free.
    pub fn lease(&self) -> PooledBuffer {
        let buf = self
            .slots
            .lock()
            .ok()
            .and_then(|mut slots| slots.pop())
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_capacity));

        PooledBuffer {
            buf,
            pool: std::sync::Arc::downgrade(&self.slots),
        }
    }

    /// Number of buffers currently sitting idle in the pool.
    pub fn available(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_and_return() {
        let pool = BufferPool::new(2, 64);
        assert_eq!(pool.available(), 2);

        {
            let mut a = pool.lease();
            let mut b = pool.lease();
            assert_eq!(pool.available(), 0);
            a.as_mut().extend_from_slice(b"hello");
            b.as_mut().extend_from_slice(b"world");
        }

        // Both buffers returned on drop, cleared.
        assert_eq!(pool.available(), 2);
        let fresh = pool.lease();
        assert!(fresh.is_empty());
    }

    #[test]
    fn exhaustion_falls_back_to_allocation() {
        let pool = BufferPool::new(1, 16);
        let _a = pool.lease();
        assert_eq!(pool.available(), 0);

        let b = pool.lease();
        assert!(b.capacity() >= 16);
    }
}
