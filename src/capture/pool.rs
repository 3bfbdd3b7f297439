//! Driver-owned frame memory.
//!
//! A pool holds a fixed number of slots. The driver acquires a slot, fills
//! it, and freezes it into a [`Frame`]; releasing the frame puts the slot
//! back on the free queue and bumps its generation. A slot whose payload is
//! still referenced by a stale handle is not reused in place: its buffer is
//! detached and the next acquire allocates a fresh one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use tracing::debug;

use crate::capture::frame::{Frame, FrameMeta, Lease};

struct Slot {
    generation: Arc<AtomicU64>,
    buffer: Mutex<Option<BytesMut>>,
}

#[derive(Default)]
struct Counters {
    acquired: AtomicU64,
    exhausted: AtomicU64,
    recycled: AtomicU64,
    detached: AtomicU64,
}

pub(crate) struct PoolShared {
    slots: Box<[Slot]>,
    free: ArrayQueue<usize>,
    counters: CachePadded<Counters>,
}

impl PoolShared {
    pub(crate) fn reclaim(&self, index: usize, data: Bytes) {
        let recycled = match data.try_into_mut() {
            Ok(buffer) => {
                self.counters.recycled.fetch_add(1, Ordering::Relaxed);
                Some(buffer)
            }
            Err(_) => {
                // A stale clone still points at the payload
                self.counters.detached.fetch_add(1, Ordering::Relaxed);
                debug!(slot = index, "frame payload still shared, detaching buffer");
                None
            }
        };
        *self.slots[index].buffer.lock() = recycled;
        // Each index is outstanding at most once, so the queue has room.
        let _ = self.free.push(index);
    }

    fn put_back(&self, index: usize, buffer: BytesMut) {
        *self.slots[index].buffer.lock() = Some(buffer);
        let _ = self.free.push(index);
    }
}

/// Snapshot of pool activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub acquired: u64,
    /// Acquire attempts that found no free slot
    pub exhausted: u64,
    /// Releases whose buffer was reused in place
    pub recycled: u64,
    /// Releases whose buffer was still shared and had to be replaced
    pub detached: u64,
}

/// Fixed-capacity pool of frame buffers
#[derive(Clone)]
pub struct FramePool {
    shared: Arc<PoolShared>,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let free = ArrayQueue::new(capacity);
        let slots = (0..capacity)
            .map(|index| {
                let _ = free.push(index);
                Slot {
                    generation: Arc::new(AtomicU64::new(0)),
                    buffer: Mutex::new(None),
                }
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shared: Arc::new(PoolShared {
                slots,
                free,
                counters: CachePadded::new(Counters::default()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn available(&self) -> usize {
        self.shared.free.len()
    }

    /// Take a free slot sized for `meta`, or `None` when every slot is
    /// still held by the consumer side or `meta` describes no addressable buffer.
    pub fn acquire(&self, meta: FrameMeta) -> Option<FrameWriter> {
        let len = meta.byte_len().ok()?;
        let counters = &self.shared.counters;
        let Some(index) = self.shared.free.pop() else {
            counters.exhausted.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        counters.acquired.fetch_add(1, Ordering::Relaxed);

        let mut buffer = self.shared.slots[index]
            .buffer
            .lock()
            .take()
            .unwrap_or_else(|| BytesMut::zeroed(len));
        buffer.resize(len, 0);

        Some(FrameWriter {
            pool: Arc::clone(&self.shared),
            index,
            meta,
            buffer: Some(buffer),
        })
    }

    pub fn stats(&self) -> PoolStats {
        let counters = &self.shared.counters;
        PoolStats {
            capacity: self.capacity(),
            available: self.available(),
            acquired: counters.acquired.load(Ordering::Relaxed),
            exhausted: counters.exhausted.load(Ordering::Relaxed),
            recycled: counters.recycled.load(Ordering::Relaxed),
            detached: counters.detached.load(Ordering::Relaxed),
        }
    }
}

/// Writable slot between acquire and delivery. Dropping it unfinished
/// returns the slot to the pool.
pub struct FrameWriter {
    pool: Arc<PoolShared>,
    index: usize,
    meta: FrameMeta,
    buffer: Option<BytesMut>,
}

impl FrameWriter {
    pub fn meta(&self) -> &FrameMeta {
        &self.meta
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match self.buffer.as_mut() {
            Some(buffer) => &mut buffer[..],
            None => &mut [],
        }
    }

    /// Stamp the capture cycle and freeze the slot into a readable frame.
    pub fn finish(mut self, sequence: u64, timestamp: Duration) -> Frame {
        let data = self.buffer.take().unwrap_or_default().freeze();
        let mut meta = self.meta;
        meta.sequence = sequence;
        meta.timestamp = timestamp;
        let generation = Arc::clone(&self.pool.slots[self.index].generation);
        let lease = Lease::pooled(generation, Arc::clone(&self.pool), self.index);
        Frame::from_parts(meta, data, lease)
    }
}

impl Drop for FrameWriter {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.put_back(self.index, buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::{FrameType, PixelFormat};

    fn depth_meta() -> FrameMeta {
        FrameMeta::new(FrameType::Depth, 2, 2, PixelFormat::Float)
    }

    #[test]
    fn exhausts_and_recovers_after_release() {
        let pool = FramePool::new(2);
        let a = pool.acquire(depth_meta()).unwrap().finish(1, Duration::ZERO);
        let b = pool.acquire(depth_meta()).unwrap().finish(1, Duration::ZERO);
        assert!(pool.acquire(depth_meta()).is_none());
        assert_eq!(pool.stats().exhausted, 1);

        assert!(a.release());
        assert_eq!(pool.available(), 1);
        let c = pool.acquire(depth_meta()).unwrap().finish(2, Duration::ZERO);
        assert_eq!(c.sequence(), 2);
        assert!(b.release());
        assert!(c.release());
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.stats().recycled, 3);
    }

    #[test]
    fn stale_handle_detaches_buffer_instead_of_aliasing() {
        let pool = FramePool::new(1);
        let mut writer = pool.acquire(depth_meta()).unwrap();
        writer.data_mut().copy_from_slice(&[7u8; 16]);
        let frame = writer.finish(1, Duration::ZERO);
        let stale = frame.clone();
        assert!(frame.release());
        assert_eq!(pool.stats().detached, 1);

        let mut writer = pool.acquire(depth_meta()).unwrap();
        writer.data_mut().fill(0);
        let fresh = writer.finish(2, Duration::ZERO);
        assert!(stale.data().is_err());
        assert_eq!(fresh.data().unwrap(), &[0u8; 16]);
        assert!(fresh.release());
    }

    #[test]
    fn dropped_writer_returns_slot() {
        let pool = FramePool::new(1);
        drop(pool.acquire(depth_meta()));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn unaddressable_geometry_keeps_every_slot() {
        let pool = FramePool::new(1);
        let huge = FrameMeta::new(FrameType::Color, usize::MAX / 2, 4, PixelFormat::Bgrx);
        assert!(pool.acquire(huge).is_none());
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.stats().acquired, 0);
    }
}
