//! Recycled byte buffers for the decoders.
//!
//! Every rectangle needs scratch memory, at high update rates allocating it per
//! rectangle churns the heap. The pool keeps every buffer it ever handed out and
//! gives them back to later callers. Buffers live in an arena of slots, a slot is
//! either on the free list or owned by exactly one [PooledBuffer].

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};
use std::{
    ops::{Deref, DerefMut},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use tracing::{error, trace};

use crate::VncError;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

bitflags! {
    /// How [BufferPool::acquire] may satisfy a request
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferOptions: u32 {
        /// Allocate a new buffer if none is free
        const ALLOCATE = 1;
        /// Reallocate a free but too small buffer to the requested size
        const GROW = 2;
        /// Block until another thread releases a buffer
        const WAIT = 4;
    }
}

impl Default for BufferOptions {
    fn default() -> Self {
        BufferOptions::ALLOCATE | BufferOptions::GROW
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub free: usize,
    pub active: usize,
    /// Buffers created, either on demand or up front
    pub allocations: u64,
    /// Free buffers reallocated to a larger size
    pub grows: u64,
}

#[derive(Default)]
struct Slot {
    /// `None` while a [PooledBuffer] owns the bytes
    data: Option<Vec<u8>>,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<Slot>,
    free: Vec<usize>,
    allocations: u64,
    grows: u64,
}

impl PoolState {
    fn take_free(&mut self, length: usize, options: BufferOptions) -> Option<(usize, Vec<u8>)> {
        let slots = &self.slots;
        let fitting = self.free.iter().position(|&i| {
            slots[i]
                .data
                .as_ref()
                .map_or(false, |data| data.len() >= length)
        });
        if let Some(pos) = fitting {
            let index = self.free.swap_remove(pos);
            let data = self.slots[index].data.take()?;
            return Some((index, data));
        }

        if options.contains(BufferOptions::GROW) {
            if let Some(index) = self.free.pop() {
                // the old content is not preserved
                self.slots[index].data = None;
                self.grows += 1;
                return Some((index, vec![0; length]));
            }
        }

        if options.contains(BufferOptions::ALLOCATE) {
            let index = self.slots.len();
            self.slots.push(Slot::default());
            self.allocations += 1;
            return Some((index, vec![0; length]));
        }
        None
    }
}

pub struct BufferPool {
    id: usize,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(PoolState::default()),
            released: Condvar::new(),
        })
    }

    /// A pool holding `count` free buffers of `length` bytes
    ///
    /// Together with options lacking [BufferOptions::ALLOCATE] this bounds the
    /// memory the decoders may hold at any time.
    pub fn with_buffers(count: usize, length: usize) -> Arc<Self> {
        let pool = Self::new();
        {
            let mut state = pool.state.lock();
            for index in 0..count {
                state.slots.push(Slot {
                    data: Some(vec![0; length]),
                });
                state.free.push(index);
            }
            state.allocations += count as u64;
        }
        pool
    }

    /// Get an unused buffer of at least `length` bytes
    ///
    /// With [BufferOptions::WAIT] this blocks the calling thread until a
    /// buffer is released elsewhere.
    pub fn acquire(
        self: &Arc<Self>,
        length: usize,
        options: BufferOptions,
    ) -> Result<PooledBuffer, VncError> {
        let mut state = self.state.lock();
        loop {
            if let Some((index, data)) = state.take_free(length, options) {
                trace!("Pool {} lends slot {} for {} bytes", self.id, index, length);
                return Ok(PooledBuffer {
                    pool: self.clone(),
                    index,
                    data: Some(data),
                    len: length,
                });
            }
            if !options.contains(BufferOptions::WAIT) {
                return Err(VncError::PoolExhausted);
            }
            self.released.wait(&mut state);
        }
    }

    /// Return a buffer to the pool
    ///
    /// Handing in a buffer which belongs to another pool is a bug in the caller
    /// and is reported as [VncError::BufferNotActive].
    pub fn release(self: &Arc<Self>, mut buffer: PooledBuffer) -> Result<(), VncError> {
        if !Arc::ptr_eq(&buffer.pool, self) {
            error!(
                "Slot {} of pool {} released into pool {}",
                buffer.index, buffer.pool.id, self.id
            );
            return Err(VncError::BufferNotActive(buffer.index));
        }
        match buffer.data.take() {
            Some(data) => self.put_back(buffer.index, data),
            None => Err(VncError::BufferNotActive(buffer.index)),
        }
    }

    fn put_back(&self, index: usize, data: Vec<u8>) -> Result<(), VncError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let active = state
            .slots
            .get(index)
            .map_or(false, |slot| slot.data.is_none())
            && !state.free.contains(&index);
        if !active {
            error!("Slot {} of pool {} is not active", index, self.id);
            return Err(VncError::BufferNotActive(index));
        }
        state.slots[index].data = Some(data);
        state.free.push(index);
        drop(guard);
        self.released.notify_one();
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            free: state.free.len(),
            active: state.slots.len() - state.free.len(),
            allocations: state.allocations,
            grows: state.grows,
        }
    }
}

/// A buffer lent out by a [BufferPool]
///
/// Derefs to the requested length. Goes back to the free list when released
/// or dropped.
pub struct PooledBuffer {
    pool: Arc<BufferPool>,
    index: usize,
    data: Option<Vec<u8>>,
    len: usize,
}

impl PooledBuffer {
    /// Slot index inside the owning pool
    pub fn index(&self) -> usize {
        self.index
    }

    /// Change the visible length, growing the storage when needed
    pub fn resize(&mut self, len: usize) {
        if let Some(data) = self.data.as_mut() {
            if data.len() < len {
                data.resize(len, 0);
            }
            self.len = len;
        }
    }

    pub fn truncate(&mut self, len: usize) {
        self.len = self.len.min(len);
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.data {
            Some(data) => &data[..self.len],
            None => &[],
        }
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.data {
            Some(data) => &mut data[..self.len],
            None => &mut [],
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("pool", &self.pool.id)
            .field("index", &self.index)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            let result = self.pool.put_back(self.index, data);
            debug_assert!(result.is_ok(), "pooled buffer returned twice");
        }
    }
}
