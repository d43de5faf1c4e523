//! Buffered framing of separator-terminated commands and sized payloads.

use std::io::{self, Read};

use recycle::{Data, Pool};

use crate::error::{ClientError, ReadError};
use crate::{IN_BUFFER_SIZE, SEPARATOR};

/// One framed command line.
///
/// All slices point into the reader's buffer and are invalidated by the
/// next read; callers that need them longer must copy.
#[derive(Debug)]
pub struct Line<'a> {
    /// The full raw line, separator included.
    pub raw: &'a [u8],
    pub verb: &'a [u8],
    pub fields: Vec<&'a [u8]>,
}

/// Framing reader over a byte stream.
///
/// Commands are `\r\n`-terminated lines that must fit the fixed input
/// buffer; payload blocks are read through the buffer remainder and then
/// straight off the stream. On recoverable errors the offending bytes are
/// consumed, so the stream stays resynchronized at the next separator.
pub struct LineReader<R> {
    inner: R,
    buf: Box<[u8]>,
    start: usize,
    end: usize,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_buffer_size(inner, IN_BUFFER_SIZE)
    }

    pub fn with_buffer_size(inner: R, size: usize) -> Self {
        Self {
            inner,
            buf: vec![0; size].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    /// Consume and frame exactly one command line.
    pub fn read_command(&mut self) -> Result<Line<'_>, ReadError> {
        let len = self.fill_line()?;
        let start = self.start;
        self.start += len;
        let raw = &self.buf[start..start + len];
        if !raw.ends_with(SEPARATOR) {
            // A bare '\n' ended the line; it is consumed, the stream is
            // aligned again.
            return Err(ClientError::InvalidLineSeparator.into());
        }
        let line = &raw[..raw.len() - SEPARATOR.len()];
        let mut fields: Vec<&[u8]> = line
            .split(|b| b.is_ascii_whitespace())
            .filter(|f| !f.is_empty())
            .collect();
        if fields.is_empty() {
            return Err(ClientError::EmptyCommand.into());
        }
        let verb = fields.remove(0);
        Ok(Line { raw, verb, fields })
    }

    /// Read exactly `size` payload bytes into pool chunks, then demand the
    /// trailing separator.
    pub fn read_data_block(&mut self, pool: &Pool, size: usize) -> Result<Data, ReadError> {
        let data = match pool.read_data(&mut *self, size) {
            Ok(data) => data,
            Err(err) => return Err(err.into()),
        };
        let len = match self.fill_line() {
            Ok(len) => len,
            Err(err) => {
                data.recycle();
                // End of stream right after a payload is mid-command.
                return Err(match err {
                    ReadError::Closed => ReadError::UnexpectedEof,
                    err => err,
                });
            }
        };
        let start = self.start;
        self.start += len;
        if &self.buf[start..start + len] != SEPARATOR {
            data.recycle();
            return Err(ClientError::InvalidLineSeparator.into());
        }
        Ok(data)
    }

    /// Consume input until the next `\r\n`, resynchronizing after an
    /// oversized or malformed command.
    pub fn discard_command(&mut self) -> io::Result<()> {
        loop {
            if let Some(pos) = self.find_newline() {
                let at_line_end = pos > 0 && self.buf[self.start + pos - 1] == b'\r';
                self.start += pos + 1;
                if at_line_end {
                    return Ok(());
                }
                continue;
            }
            self.start = self.end;
            if self.refill()? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
    }

    /// Consume exactly `n` bytes, discarding them.
    pub fn discard_exact(&mut self, mut n: usize) -> io::Result<()> {
        let mut scratch = [0u8; 4 << 10];
        while n > 0 {
            let step = n.min(scratch.len());
            self.read_exact(&mut scratch[..step])?;
            n -= step;
        }
        Ok(())
    }

    /// The next byte, without consuming it. `None` at end of stream.
    pub fn peek_byte(&mut self) -> io::Result<Option<u8>> {
        if self.start == self.end && self.refill()? == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf[self.start]))
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.end - self.start
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Ensure a full line is buffered; returns its length from `start`,
    /// separator included.
    fn fill_line(&mut self) -> Result<usize, ReadError> {
        loop {
            if let Some(pos) = self.find_newline() {
                return Ok(pos + 1);
            }
            if self.end - self.start == self.buf.len() {
                // The command does not fit the input buffer.
                self.discard_command()?;
                return Err(ClientError::TooLargeCommand.into());
            }
            if self.refill()? == 0 {
                return Err(if self.start == self.end {
                    ReadError::Closed
                } else {
                    ReadError::UnexpectedEof
                });
            }
        }
    }

    fn find_newline(&self) -> Option<usize> {
        self.buf[self.start..self.end]
            .iter()
            .position(|&b| b == b'\n')
    }

    /// Compact and read more from the stream. Returns the bytes read; 0
    /// only at end of stream.
    fn refill(&mut self) -> io::Result<usize> {
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        let n = self.inner.read(&mut self.buf[self.end..])?;
        self.end += n;
        Ok(n)
    }
}

impl<R: Read> Read for LineReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.start < self.end {
            let n = out.len().min(self.end - self.start);
            out[..n].copy_from_slice(&self.buf[self.start..self.start + n]);
            self.start += n;
            return Ok(n);
        }
        // Buffer drained: large payloads go straight from the stream into
        // the caller's chunks.
        self.inner.read(out)
    }
}
