//! Forward cursor over a [`Data`](crate::Data).

use std::io::{self, Read, Write};
use std::sync::Arc;

use crate::data::Shared;

/// A one-shot forward cursor over the chunks of a `Data`.
///
/// Holds a reference on the underlying storage; dropping the reader
/// releases it. Prefer [`DataReader::write_to`], which hands whole chunk
/// slices to the sink without copying; the [`Read`] impl exists for
/// decoders and tests.
pub struct DataReader {
    shared: Arc<Shared>,
    chunk_index: usize,
    byte_index: usize,
}

impl std::fmt::Debug for DataReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataReader")
            .field("chunk_index", &self.chunk_index)
            .field("byte_index", &self.byte_index)
            .finish()
    }
}

impl DataReader {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            chunk_index: 0,
            byte_index: 0,
        }
    }

    /// Stream the remaining bytes into `w`, chunk by chunk.
    pub fn write_to<W: Write + ?Sized>(&mut self, w: &mut W) -> io::Result<u64> {
        let mut written = 0u64;
        while !self.eof() {
            let n = w.write(self.chunk())?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "sink accepted no bytes",
                ));
            }
            self.advance(n);
            written += n as u64;
        }
        Ok(written)
    }

    fn eof(&self) -> bool {
        self.chunk_index >= self.shared.chunks().len()
    }

    fn chunk(&self) -> &[u8] {
        &self.shared.chunks()[self.chunk_index][self.byte_index..]
    }

    fn advance(&mut self, n: usize) {
        if n < self.chunk().len() {
            self.byte_index += n;
        } else {
            self.chunk_index += 1;
            self.byte_index = 0;
        }
    }
}

impl Read for DataReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while total < buf.len() && !self.eof() {
            let chunk = self.chunk();
            let n = chunk.len().min(buf.len() - total);
            buf[total..total + n].copy_from_slice(&chunk[..n]);
            self.advance(n);
            total += n;
        }
        Ok(total)
    }
}
