//! Bounded pool of page-sized buffers for staging shadow pages

use std::sync::Arc;

use tracing::trace;

use crate::stats::EngineStats;

/// Staging buffer, always exactly one page long
pub(crate) type Buffer = Box<[u8]>;

#[derive(Debug)]
pub(crate) struct MemoryPool {
    page_size: usize,
    capacity: usize,
    free: Vec<Buffer>,
    stats: Arc<EngineStats>,
}

impl MemoryPool {
    pub(crate) fn new(page_size: usize, capacity: usize, stats: Arc<EngineStats>) -> Self {
        Self {
            page_size,
            capacity,
            free: Vec::with_capacity(capacity),
            stats,
        }
    }

    /// A zeroed buffer, reused when one is available.
    pub(crate) fn acquire(&mut self) -> Buffer {
        match self.free.pop() {
            Some(mut buf) => {
                self.stats.record_pool_hit();
                buf.fill(0);
                buf
            }
            None => {
                self.stats.record_pool_miss();
                vec![0; self.page_size].into_boxed_slice()
            }
        }
    }

    /// Hand a buffer back; it is dropped once the pool is full.
    pub(crate) fn release(&mut self, buf: Buffer) {
        if self.free.len() < self.capacity && buf.len() == self.page_size {
            self.free.push(buf);
        } else {
            trace!(pooled = self.free.len(), "discarding staging buffer");
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.free.len()
    }
}
