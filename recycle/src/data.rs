//! Reference-counted chunked byte container.

use std::io::{self, Write};
use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::pool::Pool;
use crate::reader::DataReader;

/// An immutable byte sequence, chunked over pool buffers, that supports
/// multiple concurrent readers and deterministic storage reuse.
///
/// The creating owner holds one reference; [`Data::new_reader`] takes
/// another for each reader. The owner relinquishes its reference with
/// [`Data::recycle`]; readers release theirs on drop. When the last
/// reference goes away the chunks return to the pool. Dropping a `Data`
/// without calling `recycle` fires the pool's leak hook.
pub struct Data {
    shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pool: Pool,
    recycled: AtomicBool,
    chunks: Vec<Vec<u8>>,
}

impl Data {
    pub(crate) fn new(pool: Pool, chunks: Vec<Vec<u8>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                pool,
                recycled: AtomicBool::new(false),
                chunks,
            }),
        }
    }

    /// Total byte length over all chunks.
    pub fn len(&self) -> usize {
        self.shared.chunks.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open a forward cursor over the data.
    ///
    /// # Panics
    ///
    /// Panics if called after [`Data::recycle`].
    pub fn new_reader(&self) -> DataReader {
        assert!(
            !self.shared.recycled.load(Ordering::Acquire),
            "read access after recycle call"
        );
        DataReader::new(Arc::clone(&self.shared))
    }

    /// Release the owner's reference.
    ///
    /// Readers opened before this call stay valid; the chunks return to the
    /// pool once the last of them is dropped. Consuming `self` makes a
    /// second recycle unrepresentable.
    pub fn recycle(self) {
        self.shared.recycled.store(true, Ordering::Release);
        // Dropping self releases the owner's reference.
    }

    /// Stream the whole content into `w` via a temporary reader.
    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<u64> {
        self.new_reader().write_to(w)
    }

    /// Whether the owner has already relinquished the data.
    pub fn is_recycled(&self) -> bool {
        self.shared.recycled.load(Ordering::Acquire)
    }
}

impl Drop for Data {
    fn drop(&mut self) {
        if !self.shared.recycled.load(Ordering::Acquire) {
            self.shared.pool.note_leak();
        }
    }
}

impl Shared {
    pub(crate) fn chunks(&self) -> &[Vec<u8>] {
        &self.chunks
    }
}

impl Drop for Shared {
    // Last reference holder: the Arc's release/acquire ordering makes every
    // reader's final byte read happen-before the chunks are reused.
    fn drop(&mut self) {
        let chunks = mem::take(&mut self.chunks);
        for chunk in chunks {
            self.pool.recycle_chunk(chunk);
        }
    }
}

impl std::fmt::Debug for Data {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Data")
            .field("recycled", &self.is_recycled())
            .field("len", &self.len())
            .field("chunks", &self.shared.chunks.len())
            .finish()
    }
}
