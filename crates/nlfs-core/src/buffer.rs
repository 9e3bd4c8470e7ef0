//! Temporary chunk-buffer pool.
//!
//! A small fixed set of chunk-sized scratch buffers leased to internal
//! loops (GC relocation, header rebuilds, read-modify-write). Exhausting
//! the pool falls back to a one-shot heap allocation and bumps a counter.

use tracing::trace;

/// Fixed pool size.
pub const N_TEMP_BUFFERS: usize = 6;

/// A leased scratch buffer. Return it with [`TempBufferPool::release`].
#[derive(Debug)]
pub struct TempBuffer {
    pub data: Vec<u8>,
    slot: Option<usize>,
}

impl TempBuffer {
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[derive(Debug)]
pub struct TempBufferPool {
    chunk_bytes: usize,
    slots: Vec<Option<Vec<u8>>>,
    pub overflows: u64,
}

impl TempBufferPool {
    #[must_use]
    pub fn new(chunk_bytes: usize) -> Self {
        Self {
            chunk_bytes,
            slots: (0..N_TEMP_BUFFERS)
                .map(|_| Some(vec![0u8; chunk_bytes]))
                .collect(),
            overflows: 0,
        }
    }

    /// Lease a zeroed chunk-sized buffer.
    pub fn acquire(&mut self) -> TempBuffer {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Some(mut data) = slot.take() {
                data.fill(0);
                return TempBuffer {
                    data,
                    slot: Some(i),
                };
            }
        }
        self.overflows += 1;
        trace!(target: "nlfs::buffer", overflows = self.overflows, "pool exhausted, heap fallback");
        TempBuffer {
            data: vec![0u8; self.chunk_bytes],
            slot: None,
        }
    }

    /// Return a leased buffer to its slot. Heap-fallback buffers just drop.
    pub fn release(&mut self, buffer: TempBuffer) {
        if let Some(i) = buffer.slot {
            self.slots[i] = Some(buffer.data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_and_return() {
        let mut pool = TempBufferPool::new(512);
        let buf = pool.acquire();
        assert_eq!(buf.data.len(), 512);
        pool.release(buf);
        assert_eq!(pool.overflows, 0);
    }

    #[test]
    fn exhaustion_falls_back_to_heap() {
        let mut pool = TempBufferPool::new(64);
        let leased: Vec<_> = (0..N_TEMP_BUFFERS).map(|_| pool.acquire()).collect();
        let extra = pool.acquire();
        assert_eq!(pool.overflows, 1);
        assert!(extra.slot.is_none());
        pool.release(extra);
        for buf in leased {
            pool.release(buf);
        }
        // all slots usable again
        let again: Vec<_> = (0..N_TEMP_BUFFERS).map(|_| pool.acquire()).collect();
        assert_eq!(pool.overflows, 1);
        assert!(again.iter().all(|b| b.slot.is_some()));
    }

    #[test]
    fn released_buffers_come_back_zeroed() {
        let mut pool = TempBufferPool::new(16);
        let mut buf = pool.acquire();
        buf.as_mut_slice().fill(0xEE);
        pool.release(buf);
        let buf = pool.acquire();
        assert!(buf.as_slice().iter().all(|b| *b == 0));
        pool.release(buf);
    }
}
