//! Shared chunk pool for wire buffers.
//!
//! Provides fixed-size chunk allocation without per-operation malloc overhead.
//! The whole pool is one pre-allocated block split into chunks at startup;
//! the pool never grows afterwards.
//!
//! ## Leases
//!
//! An in-flight operation holds its chunks through a `ChunkLease`. Payloads
//! larger than one chunk span several chunks, which the lease presents as one
//! logical region (chained like scatter-gather buffers). Dropping the lease is
//! the only way chunks go back to the free list, so every assign is matched by
//! exactly one return, on success and failure paths alike.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::io::IoSlice;
use std::sync::Arc;

/// Error returned when writing into a lease fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    /// The data does not fit in the chunks held by the lease.
    #[error("lease holds {capacity} bytes, cannot fit {needed}")]
    Overflow { needed: usize, capacity: usize },
}

struct PoolInner {
    /// Stack of free chunks (LIFO for cache locality).
    free: Mutex<Vec<BytesMut>>,
    capacity: usize,
    chunk_size: usize,
}

impl PoolInner {
    fn release(&self, chunks: &mut Vec<BytesMut>) {
        let mut free = self.free.lock();
        debug_assert!(free.len() + chunks.len() <= self.capacity, "chunk returned twice");
        // `free` was sized to `capacity` up front, so this never reallocates.
        free.extend(chunks.drain(..));
    }
}

/// Fixed-capacity pool of equally sized chunks.
///
/// Cloning the pool is cheap and yields a handle to the same chunks. Assign and
/// free may be called concurrently from any worker thread.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a new pool.
    ///
    /// # Arguments
    /// * `capacity` - Number of chunks to pre-allocate
    /// * `chunk_size` - Size of each chunk in bytes
    pub fn new(capacity: usize, chunk_size: usize) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");

        let mut block = BytesMut::zeroed(capacity * chunk_size);
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(block.split_to(chunk_size));
        }

        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                capacity,
                chunk_size,
            }),
        }
    }

    /// Number of chunks needed to hold `len` bytes (at least one).
    pub fn chunks_for(&self, len: usize) -> usize {
        len.div_ceil(self.inner.chunk_size).max(1)
    }

    /// Reserve enough chunks to hold `len` bytes.
    ///
    /// Returns `None` if not enough chunks are free, leaving the pool
    /// unchanged. Callers must treat this as backpressure.
    pub fn assign(&self, len: usize) -> Option<ChunkLease> {
        let count = self.chunks_for(len);
        if count > self.inner.capacity {
            return None;
        }

        let mut chunks = Vec::with_capacity(count);
        {
            let mut free = self.inner.free.lock();
            if free.len() < count {
                return None;
            }
            let at = free.len() - count;
            chunks.extend(free.drain(at..));
        }

        Some(ChunkLease {
            chunks,
            len: 0,
            chunk_size: self.inner.chunk_size,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Reserve chunks for the concatenation of `parts` and copy it in.
    ///
    /// Same backpressure contract as [`assign`](Self::assign).
    pub fn assign_with(&self, parts: &[&[u8]]) -> Option<ChunkLease> {
        let len = parts.iter().map(|part| part.len()).sum();
        let mut lease = self.assign(len)?;
        // The lease was sized for `parts`, so this cannot overflow.
        lease.fill(parts).ok()?;
        Some(lease)
    }

    /// Return a lease to the pool. Same as dropping it.
    pub fn free(&self, lease: ChunkLease) {
        debug_assert!(
            Arc::ptr_eq(&self.inner, &lease.pool),
            "lease belongs to another pool"
        );
        drop(lease);
    }

    /// Size of each chunk.
    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// Total number of chunks.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of free chunks.
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Number of chunks currently held by leases.
    pub fn in_use(&self) -> usize {
        self.inner.capacity - self.available()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity())
            .field("chunk_size", &self.chunk_size())
            .field("available", &self.available())
            .finish()
    }
}

/// Chunks assigned to one in-flight operation.
///
/// Tracks how many bytes have been written; the last chunk may be partially
/// filled.
pub struct ChunkLease {
    chunks: Vec<BytesMut>,
    len: usize,
    chunk_size: usize,
    pool: Arc<PoolInner>,
}

impl ChunkLease {
    /// Bytes written into the lease.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of chunks held.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Bytes the lease can hold.
    pub fn capacity(&self) -> usize {
        self.chunks.len() * self.chunk_size
    }

    /// Forget written data, keeping the chunks.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Append data after the bytes already written.
    pub fn append(&mut self, data: &[u8]) -> Result<(), ChunkError> {
        let needed = self.len + data.len();
        if needed > self.capacity() {
            return Err(ChunkError::Overflow {
                needed,
                capacity: self.capacity(),
            });
        }

        let mut offset = 0;
        while offset < data.len() {
            let idx = self.len / self.chunk_size;
            let at = self.len % self.chunk_size;
            let to_copy = (self.chunk_size - at).min(data.len() - offset);

            self.chunks[idx][at..at + to_copy].copy_from_slice(&data[offset..offset + to_copy]);
            self.len += to_copy;
            offset += to_copy;
        }

        Ok(())
    }

    /// Replace the contents with the concatenation of `parts`.
    pub fn fill(&mut self, parts: &[&[u8]]) -> Result<(), ChunkError> {
        self.clear();
        for part in parts {
            self.append(part)?;
        }
        Ok(())
    }

    /// The whole first chunk, for use as a receive buffer.
    pub fn first_mut(&mut self) -> &mut [u8] {
        &mut self.chunks[0][..]
    }

    /// Iterate over the written bytes, one slice per chunk.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let mut remaining = self.len;
        let chunk_size = self.chunk_size;

        self.chunks
            .iter()
            .map(move |chunk| {
                let n = remaining.min(chunk_size);
                remaining -= n;
                &chunk[..n]
            })
            .filter(|slice| !slice.is_empty())
    }

    /// IoSlice views of the written bytes starting at `start` (for resuming
    /// partial writes).
    pub fn io_slices(&self, start: usize) -> Vec<IoSlice<'_>> {
        let mut slices = Vec::with_capacity(self.chunks.len());
        let mut skip = start;

        for slice in self.chunks() {
            if skip >= slice.len() {
                skip -= slice.len();
                continue;
            }
            slices.push(IoSlice::new(&slice[skip..]));
            skip = 0;
        }

        slices
    }

    /// Copy the written bytes into a new Vec.
    #[cfg(test)]
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for slice in self.chunks() {
            out.extend_from_slice(slice);
        }
        out
    }
}

impl Drop for ChunkLease {
    fn drop(&mut self) {
        self.pool.release(&mut self.chunks);
    }
}

impl std::fmt::Debug for ChunkLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkLease")
            .field("chunks", &self.chunks.len())
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_basic() {
        let pool = BufferPool::new(4, 1024);

        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.chunk_size(), 1024);

        let a = pool.assign(10).unwrap();
        let b = pool.assign(1024).unwrap();
        let c = pool.assign(1025).unwrap();

        assert_eq!(a.chunk_count(), 1);
        assert_eq!(b.chunk_count(), 1);
        assert_eq!(c.chunk_count(), 2);
        assert_eq!(pool.available(), 0);
        assert!(pool.assign(1).is_none());

        pool.free(b);
        assert_eq!(pool.available(), 1);

        drop(a);
        drop(c);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_assign_is_all_or_nothing() {
        let pool = BufferPool::new(3, 100);
        let _held = pool.assign(1).unwrap();

        // Needs three chunks, only two free
        assert!(pool.assign(250).is_none());
        assert_eq!(pool.available(), 2);

        // Larger than the whole pool
        assert!(pool.assign(10_000).is_none());
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_zero_len_takes_one_chunk() {
        let pool = BufferPool::new(2, 64);
        let lease = pool.assign(0).unwrap();
        assert_eq!(lease.chunk_count(), 1);
        assert!(lease.is_empty());
    }

    #[test]
    fn test_lease_spans_chunks() {
        let pool = BufferPool::new(10, 100);
        let data: Vec<u8> = (0..250u8).collect();

        let mut lease = pool.assign(data.len()).unwrap();
        lease.append(&data).unwrap();

        assert_eq!(lease.len(), 250);
        assert_eq!(lease.chunk_count(), 3);
        assert_eq!(pool.available(), 7);

        let chunks: Vec<_> = lease.chunks().collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 100);
        assert_eq!(chunks[1].len(), 100);
        assert_eq!(chunks[2].len(), 50);
        assert_eq!(lease.to_vec(), data);

        drop(lease);
        assert_eq!(pool.available(), 10);
    }

    #[test]
    fn test_fill_header_and_payload() {
        let pool = BufferPool::new(4, 8);
        let mut lease = pool.assign(4 + 10).unwrap();

        lease.fill(&[&[0, 0, 0, 10], b"0123456789"]).unwrap();
        assert_eq!(lease.to_vec(), b"\x00\x00\x00\x0a0123456789");

        // Refill reuses the same chunks
        lease.fill(&[b"abc"]).unwrap();
        assert_eq!(lease.to_vec(), b"abc");
    }

    #[test]
    fn test_assign_with() {
        let pool = BufferPool::new(3, 4);

        let lease = pool.assign_with(&[&[0, 0, 0, 5], b"hello"]).unwrap();
        assert_eq!(lease.chunk_count(), 3);
        assert_eq!(lease.to_vec(), b"\x00\x00\x00\x05hello");

        // Nothing left for a second frame
        assert!(pool.assign_with(&[b"x"]).is_none());
        drop(lease);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn test_append_overflow() {
        let pool = BufferPool::new(2, 8);
        let mut lease = pool.assign(8).unwrap();

        let result = lease.append(&[0u8; 9]);
        assert_eq!(
            result,
            Err(ChunkError::Overflow {
                needed: 9,
                capacity: 8
            })
        );
        assert_eq!(lease.len(), 0);
    }

    #[test]
    fn test_io_slices_resume() {
        let pool = BufferPool::new(4, 4);
        let mut lease = pool.assign(10).unwrap();
        lease.append(b"abcdefghij").unwrap();

        let collect = |start: usize| -> Vec<u8> {
            lease
                .io_slices(start)
                .iter()
                .flat_map(|s| s.iter().copied())
                .collect()
        };

        assert_eq!(collect(0), b"abcdefghij");
        assert_eq!(collect(4), b"efghij");
        assert_eq!(collect(5), b"fghij");
        assert_eq!(collect(9), b"j");
        assert!(lease.io_slices(10).is_empty());
    }

    #[test]
    fn test_chunks_do_not_alias() {
        let pool = BufferPool::new(2, 4);
        let mut a = pool.assign(4).unwrap();
        let mut b = pool.assign(4).unwrap();

        a.append(b"aaaa").unwrap();
        b.append(b"bbbb").unwrap();

        assert_eq!(a.to_vec(), b"aaaa");
        assert_eq!(b.to_vec(), b"bbbb");
    }

    #[test]
    fn test_conservation_under_random_sequence() {
        let pool = BufferPool::new(16, 32);
        let mut held = Vec::new();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;

        for _ in 0..2_000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;

            if seed % 3 == 0 && !held.is_empty() {
                let idx = (seed as usize / 3) % held.len();
                held.swap_remove(idx);
            } else if let Some(lease) = pool.assign((seed % 200) as usize) {
                held.push(lease);
            }

            let leased: usize = held.iter().map(ChunkLease::chunk_count).sum();
            assert_eq!(pool.in_use(), leased);
            assert_eq!(pool.in_use() + pool.available(), pool.capacity());
            assert!(pool.in_use() <= pool.capacity());
        }

        held.clear();
        assert_eq!(pool.available(), pool.capacity());
    }

    #[test]
    fn test_concurrent_assign_free() {
        let pool = BufferPool::new(8, 64);

        std::thread::scope(|s| {
            for t in 0..4 {
                let pool = pool.clone();
                s.spawn(move || {
                    for i in 0..1_000 {
                        if let Some(mut lease) = pool.assign(1 + (i + t) % 150) {
                            lease.append(&[t as u8; 1]).unwrap();
                            assert!(pool.in_use() <= pool.capacity());
                        }
                    }
                });
            }
        });

        assert_eq!(pool.available(), pool.capacity());
    }
}
