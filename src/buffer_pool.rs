//! Pooled, fixed-capacity receive buffers.
//!
//! Buffers are checked out of a shared pool, handed to the reactor for filling, and kept
//!  alive by whoever still references them - the pool gets the backing storage back only
//!  when the last handle (or slice) is dropped. The pool enforces an upper bound on the
//!  number of buffers checked out at a time; exhaustion is an expected condition that
//!  callers handle by skipping a read.

use std::mem;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, trace};

pub struct BufferPool {
    buffer_capacity: usize,
    max_buffers: usize,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    free: Vec<Vec<u8>>,
    outstanding: usize,
}

impl BufferPool {
    pub fn new(buffer_capacity: usize, max_buffers: usize) -> Arc<BufferPool> {
        Arc::new(BufferPool {
            buffer_capacity,
            max_buffers,
            state: Mutex::new(PoolState {
                free: Vec::with_capacity(max_buffers),
                outstanding: 0,
            }),
        })
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Check out a buffer, or `None` if the configured maximum is already outstanding.
    pub fn checkout(self: &Arc<Self>) -> Option<BufferHandle> {
        let storage = {
            let mut state = self.state.lock().unwrap();
            if state.outstanding == self.max_buffers {
                debug!("buffer pool exhausted: {} buffers outstanding", state.outstanding);
                return None;
            }
            state.outstanding += 1;

            match state.free.pop() {
                Some(storage) => {
                    trace!("returning buffer from pool");
                    storage
                }
                None => {
                    debug!("no buffer in pool: creating new buffer");
                    vec![0; self.buffer_capacity]
                }
            }
        };

        Some(BufferHandle(Arc::new(PooledBuffer {
            pool: Arc::downgrade(self),
            storage: Mutex::new(storage),
        })))
    }

    /// Number of buffers currently checked out.
    pub fn outstanding(&self) -> usize {
        self.state.lock().unwrap().outstanding
    }

    fn release(&self, storage: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.outstanding -= 1;
        if state.free.capacity() > state.free.len() {
            trace!("returning buffer storage to pool");
            state.free.push(storage);
        }
        else {
            debug!("pool free list is full: discarding returned storage");
        }
    }
}

struct PooledBuffer {
    pool: Weak<BufferPool>,
    storage: Mutex<Vec<u8>>,
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            let storage = mem::take(self.storage.get_mut().unwrap());
            pool.release(storage);
        }
    }
}

/// Shared handle to a checked-out buffer. Cloning increments the reference count; the
///  buffer returns to the pool when the count reaches zero. The receive path relies on
///  `ref_count()` to assert its lifetime contract with the reactor.
#[derive(Clone)]
pub struct BufferHandle(Arc<PooledBuffer>);

impl BufferHandle {
    pub fn capacity(&self) -> usize {
        self.0.storage.lock().unwrap().len()
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(self.0.storage.lock().unwrap().as_slice())
    }

    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(self.0.storage.lock().unwrap().as_mut_slice())
    }

    /// Zero-copy view over `[offset, offset+len)`. The slice holds its own handle, so the
    ///  buffer stays checked out for as long as the slice lives.
    pub fn slice(&self, offset: usize, len: usize) -> BufferSlice {
        let capacity = self.capacity();
        if offset + len > capacity {
            panic!(
                "buffer slice [{}..{}] exceeds buffer capacity {}",
                offset,
                offset + len,
                capacity
            );
        }
        BufferSlice {
            buffer: self.clone(),
            offset,
            len,
        }
    }
}

#[derive(Clone)]
pub struct BufferSlice {
    buffer: BufferHandle,
    offset: usize,
    len: usize,
}

impl BufferSlice {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn buffer(&self) -> &BufferHandle {
        &self.buffer
    }

    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.buffer
            .with_data(|data| f(&data[self.offset..self.offset + self.len]))
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.with_bytes(|bytes| bytes.to_vec())
    }
}
