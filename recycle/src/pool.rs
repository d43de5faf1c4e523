//! Size-class chunk pool.

use std::io::{self, Read};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::data::Data;

const MIN_DEFAULT_CHUNK_SIZE: usize = 1 << 7;
const MAX_DEFAULT_CHUNK_SIZE: usize = 1 << 20;

/// The default size classes: powers of two from 128 B to 1 MiB.
pub fn default_chunk_sizes() -> Vec<usize> {
    let mut sizes = Vec::new();
    let mut size = MIN_DEFAULT_CHUNK_SIZE;
    while size <= MAX_DEFAULT_CHUNK_SIZE {
        sizes.push(size);
        size *= 2;
    }
    sizes
}

/// Callback invoked when a [`Data`] is dropped without being recycled.
///
/// For test and debug use only.
pub type LeakHook = Box<dyn Fn() + Send + Sync>;

/// A thread-safe pool of byte chunks, organized in size classes.
///
/// Requests at or below half the smallest class bypass the pool entirely;
/// the general allocator handles small fragments better than a freelist
/// would. Requests above the largest class are clamped to it, so a single
/// oversized read is split over several maximum-size chunks.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    chunk_sizes: Vec<usize>,
    freelists: Vec<Mutex<Vec<Vec<u8>>>>,
    leak_hook: Mutex<Option<LeakHook>>,
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool {
    /// Create a pool with [`default_chunk_sizes`].
    pub fn new() -> Self {
        Self::with_chunk_sizes(default_chunk_sizes())
    }

    /// Create a pool with the given size classes.
    ///
    /// # Panics
    ///
    /// Panics unless `chunk_sizes` is strictly ascending, duplicate-free,
    /// and positive.
    pub fn with_chunk_sizes(chunk_sizes: Vec<usize>) -> Self {
        assert!(!chunk_sizes.is_empty(), "no chunk sizes");
        for (i, &size) in chunk_sizes.iter().enumerate() {
            assert!(size > 0, "non positive chunk size");
            if i != 0 {
                assert!(
                    chunk_sizes[i - 1] < size,
                    "chunk sizes unsorted or have duplicates"
                );
            }
        }
        let freelists = chunk_sizes.iter().map(|_| Mutex::new(Vec::new())).collect();
        Self {
            inner: Arc::new(PoolInner {
                chunk_sizes,
                freelists,
                leak_hook: Mutex::new(None),
            }),
        }
    }

    /// Read exactly `size` bytes from `r` into a new [`Data`].
    ///
    /// The data is assembled from maximum-size chunks, with the final chunk
    /// sized to the remainder. Fails with [`io::ErrorKind::UnexpectedEof`]
    /// if the source ends early; other I/O failures propagate verbatim.
    pub fn read_data<R: Read + ?Sized>(&self, r: &mut R, size: usize) -> io::Result<Data> {
        let max = self.max_chunk_size();
        let mut chunks = Vec::with_capacity(size.div_ceil(max));
        let mut remaining = size;
        while remaining > 0 {
            let mut chunk = self.chunk(remaining);
            if let Err(err) = r.read_exact(&mut chunk) {
                self.recycle_chunk(chunk);
                for chunk in chunks {
                    self.recycle_chunk(chunk);
                }
                return Err(err);
            }
            remaining -= chunk.len();
            chunks.push(chunk);
        }
        Ok(Data::new(self.clone(), chunks))
    }

    /// Set the callback fired when a [`Data`] is dropped unrecycled.
    ///
    /// For test and debug use only.
    pub fn set_leak_hook(&self, hook: LeakHook) {
        *self.inner.leak_hook.lock() = Some(hook);
    }

    pub fn min_chunk_size(&self) -> usize {
        self.inner.chunk_sizes[0]
    }

    pub fn max_chunk_size(&self) -> usize {
        *self.inner.chunk_sizes.last().unwrap()
    }

    /// Return a chunk of length `min(size, max_chunk_size)`.
    ///
    /// The chunk keeps the full capacity of its size class so it can be
    /// reclassified on recycle. Sizes at or below the bypass threshold get
    /// a plain allocation instead.
    pub(crate) fn chunk(&self, size: usize) -> Vec<u8> {
        if self.is_unpooled_size(size) {
            return vec![0; size];
        }
        for (i, &class) in self.inner.chunk_sizes.iter().enumerate() {
            if size <= class {
                let mut chunk = self.inner.freelists[i]
                    .lock()
                    .pop()
                    .unwrap_or_else(|| Vec::with_capacity(class));
                chunk.resize(size, 0);
                return chunk;
            }
        }
        // Clamp to the largest class.
        let class = self.max_chunk_size();
        let mut chunk = self
            .inner
            .freelists
            .last()
            .unwrap()
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(class));
        chunk.resize(class, 0);
        chunk
    }

    /// Classify `chunk` by capacity and return it to the matching freelist.
    ///
    /// # Panics
    ///
    /// Panics if the capacity matches no size class and is above the bypass
    /// threshold: such a chunk cannot have come from this pool.
    pub(crate) fn recycle_chunk(&self, mut chunk: Vec<u8>) {
        let capacity = chunk.capacity();
        if self.is_unpooled_size(capacity) {
            // Bypass allocation; let the allocator reclaim it.
            return;
        }
        for (i, &class) in self.inner.chunk_sizes.iter().enumerate() {
            if capacity == class {
                chunk.clear();
                self.inner.freelists[i].lock().push(chunk);
                return;
            }
        }
        panic!("unexpected chunk capacity: {capacity}");
    }

    pub(crate) fn note_leak(&self) {
        if let Some(hook) = self.inner.leak_hook.lock().as_ref() {
            hook();
        }
    }

    fn is_unpooled_size(&self, size: usize) -> bool {
        size <= self.min_chunk_size() / 2
    }

    #[cfg(test)]
    pub(crate) fn free_chunks(&self, class_index: usize) -> usize {
        self.inner.freelists[class_index].lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sizes_ascend() {
        let sizes = default_chunk_sizes();
        assert_eq!(*sizes.first().unwrap(), 128);
        assert_eq!(*sizes.last().unwrap(), 1 << 20);
        assert!(sizes.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    #[should_panic(expected = "unsorted")]
    fn unsorted_sizes_rejected() {
        Pool::with_chunk_sizes(vec![128, 64]);
    }

    #[test]
    #[should_panic(expected = "non positive")]
    fn zero_size_rejected() {
        Pool::with_chunk_sizes(vec![0, 64]);
    }

    #[test]
    fn tiny_request_bypasses_pool() {
        let pool = Pool::with_chunk_sizes(vec![128, 256]);
        let chunk = pool.chunk(64);
        assert_eq!(chunk.len(), 64);
        assert_eq!(chunk.capacity(), 64);
        pool.recycle_chunk(chunk);
        assert_eq!(pool.free_chunks(0), 0);
    }

    #[test]
    fn request_gets_smallest_fitting_class() {
        let pool = Pool::with_chunk_sizes(vec![128, 256, 512]);
        let chunk = pool.chunk(200);
        assert_eq!(chunk.len(), 200);
        assert_eq!(chunk.capacity(), 256);
        pool.recycle_chunk(chunk);
        assert_eq!(pool.free_chunks(1), 1);
        // The recycled chunk is handed out again.
        let chunk = pool.chunk(130);
        assert_eq!(chunk.len(), 130);
        assert_eq!(chunk.capacity(), 256);
        assert_eq!(pool.free_chunks(1), 0);
        pool.recycle_chunk(chunk);
    }

    #[test]
    fn oversize_request_clamps_to_max_class() {
        let pool = Pool::with_chunk_sizes(vec![128, 256]);
        let chunk = pool.chunk(1000);
        assert_eq!(chunk.len(), 256);
        assert_eq!(chunk.capacity(), 256);
        pool.recycle_chunk(chunk);
    }

    #[test]
    fn exact_class_boundary() {
        let pool = Pool::with_chunk_sizes(vec![128, 256]);
        let chunk = pool.chunk(128);
        assert_eq!(chunk.len(), 128);
        assert_eq!(chunk.capacity(), 128);
        pool.recycle_chunk(chunk);
        assert_eq!(pool.free_chunks(0), 1);
    }
}
