// A bounded free-list of fixed-size block buffers, recycled between the
// network receive path and the disk/hash paths.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::{Error, Result};

struct PoolState {
    free: Vec<Box<[u8]>>,
    in_use: usize,
    total_allocated: usize,
}

pub struct DiskBufferPool {
    buffer_size: usize,
    max_buffers: usize,
    state: Mutex<PoolState>,
}

impl DiskBufferPool {
    pub fn new(buffer_size: usize, max_buffers: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size,
            max_buffers,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                in_use: 0,
                total_allocated: 0,
            }),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn in_use(&self) -> usize {
        self.state.lock().in_use
    }

    pub fn allocate(self: &Arc<Self>) -> Result<DiskBuffer> {
        let mut state = self.state.lock();
        let data = match state.free.pop() {
            Some(buf) => buf,
            None => {
                if state.total_allocated >= self.max_buffers {
                    return Err(Error::NoMemory);
                }
                state.total_allocated += 1;
                vec![0u8; self.buffer_size].into_boxed_slice()
            }
        };
        state.in_use += 1;
        Ok(DiskBuffer {
            data: Some(data),
            len: 0,
            pool: Arc::downgrade(self),
        })
    }

    /// Drop cached free buffers; in-flight ones return and are freed too.
    pub fn release_memory(&self) {
        let mut state = self.state.lock();
        state.total_allocated -= state.free.len();
        state.free.clear();
    }

    fn recycle(&self, data: Box<[u8]>) {
        let mut state = self.state.lock();
        state.in_use -= 1;
        state.free.push(data);
    }

    #[cfg(test)]
    fn check_invariant(&self) {
        let state = self.state.lock();
        assert_eq!(state.in_use + state.free.len(), state.total_allocated);
    }
}

/// A pooled buffer. Returns to its pool on drop, including when it was
/// moved to the disk worker.
pub struct DiskBuffer {
    data: Option<Box<[u8]>>,
    len: usize,
    pool: Weak<DiskBufferPool>,
}

impl DiskBuffer {
    /// Copy `data` into the buffer, replacing previous content.
    pub fn fill_from(&mut self, data: &[u8]) {
        let buf = self.data.as_mut().expect("buffer present until drop");
        buf[..data.len()].copy_from_slice(data);
        self.len = data.len();
    }

    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.capacity());
        self.len = len;
    }

    pub fn capacity(&self) -> usize {
        self.data.as_ref().map(|d| d.len()).unwrap_or(0)
    }
}

impl std::ops::Deref for DiskBuffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.data.as_ref().expect("buffer present until drop")[..self.len]
    }
}

impl std::ops::DerefMut for DiskBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.data.as_mut().expect("buffer present until drop")[..len]
    }
}

impl Drop for DiskBuffer {
    fn drop(&mut self) {
        if let (Some(data), Some(pool)) = (self.data.take(), self.pool.upgrade()) {
            pool.recycle(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_free_recycles() {
        let pool = DiskBufferPool::new(1024, 4);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_eq!(pool.in_use(), 2);
        pool.check_invariant();
        drop(a);
        assert_eq!(pool.in_use(), 1);
        pool.check_invariant();
        drop(b);
        assert_eq!(pool.in_use(), 0);
        pool.check_invariant();
        // A fresh allocation reuses the recycled buffer.
        let _c = pool.allocate().unwrap();
        pool.check_invariant();
    }

    #[test]
    fn test_exhaustion_fails_with_no_memory() {
        let pool = DiskBufferPool::new(16, 2);
        let _a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        assert!(matches!(pool.allocate(), Err(Error::NoMemory)));
        drop(_a);
        assert!(pool.allocate().is_ok());
    }

    #[test]
    fn test_fill_and_read_back() {
        let pool = DiskBufferPool::new(8, 1);
        let mut buf = pool.allocate().unwrap();
        buf.fill_from(&[1, 2, 3]);
        assert_eq!(&buf[..], &[1, 2, 3]);
        assert_eq!(buf.capacity(), 8);
    }

    #[test]
    fn test_cross_thread_return() {
        let pool = DiskBufferPool::new(64, 2);
        let mut buf = pool.allocate().unwrap();
        buf.fill_from(&[9; 10]);
        let handle = std::thread::spawn(move || drop(buf));
        handle.join().unwrap();
        assert_eq!(pool.in_use(), 0);
        pool.check_invariant();
    }
}
