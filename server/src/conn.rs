//! Per-connection protocol loop: read, parse, dispatch, respond.

use std::io::{self, BufWriter, Write};
use std::net::TcpStream;

use cache_core::now_unix;
use protocol_memcache::{
    CLIENT_ERROR_RESPONSE, ClientError, DELETE_COMMAND, DELETED_RESPONSE, END_RESPONSE,
    ERROR_RESPONSE, GET_COMMAND, GETS_COMMAND, Line, LineReader, NOT_FOUND_RESPONSE,
    OUT_BUFFER_SIZE, ReadError, SEPARATOR, SERVER_ERROR_RESPONSE, SET_COMMAND, STORED_RESPONSE,
    VALUE_RESPONSE, parse_delete_fields, parse_get_fields, parse_set_fields,
};
use recycle::Pool;
use tracing::{debug, error};

use crate::metrics::{CLIENT_ERRORS, DELETES, GETS, HITS, MISSES, SERVER_ERRORS, SETS};
use crate::view::CacheView;

/// State shared by all connections.
pub struct ConnShared {
    pub pool: Pool,
    pub max_item_size: usize,
}

/// A single client connection.
pub struct Conn {
    reader: LineReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    view: Box<dyn CacheView>,
    pool: Pool,
    max_item_size: usize,
}

impl Conn {
    pub fn new(stream: TcpStream, view: Box<dyn CacheView>, shared: &ConnShared) -> io::Result<Self> {
        let write_half = stream.try_clone()?;
        Ok(Self {
            reader: LineReader::new(stream),
            writer: BufWriter::with_capacity(OUT_BUFFER_SIZE, write_half),
            view,
            pool: shared.pool.clone(),
            max_item_size: shared.max_item_size,
        })
    }

    /// Serve the connection until the peer disconnects or a fatal error.
    pub fn serve(mut self) {
        debug!("serving connection");
        match self.run() {
            Ok(()) => debug!("connection closed"),
            Err(ReadError::UnexpectedEof) => debug!("connection ended mid-command"),
            Err(err) => {
                SERVER_ERRORS.increment();
                error!(%err, "server error");
                let _ = write!(self.writer, "{SERVER_ERROR_RESPONSE} {err}");
                let _ = self.writer.write_all(SEPARATOR);
            }
        }
        let _ = self.writer.flush();
    }

    fn run(&mut self) -> Result<(), ReadError> {
        loop {
            let line = match self.reader.read_command() {
                Ok(line) => line,
                Err(ReadError::Client(err)) => {
                    self.send_client_error(err)?;
                    continue;
                }
                Err(ReadError::Closed) => return Ok(()),
                Err(err) => return Err(err),
            };

            let client_err = match line.verb {
                verb if verb == GET_COMMAND || verb == GETS_COMMAND => {
                    GETS.increment();
                    let Line { raw, fields, .. } = line;
                    match parse_get_fields(&fields) {
                        Ok(()) => {
                            let views = self.view.get(raw, &fields);
                            HITS.add(views.len() as u64);
                            MISSES.add((fields.len() - views.len()) as u64);
                            for view in views {
                                // Keys are raw bytes; write them verbatim.
                                self.writer.write_all(VALUE_RESPONSE.as_bytes())?;
                                self.writer.write_all(b" ")?;
                                self.writer.write_all(&view.meta.key)?;
                                write!(self.writer, " {} {}", view.meta.flags, view.meta.bytes)?;
                                self.writer.write_all(SEPARATOR)?;
                                let mut reader = view.reader;
                                reader.write_to(&mut self.writer)?;
                                self.writer.write_all(SEPARATOR)?;
                            }
                            self.send_response(END_RESPONSE)?;
                            None
                        }
                        Err(err) => Some(err),
                    }
                }
                verb if verb == SET_COMMAND => {
                    SETS.increment();
                    match parse_set_fields(&line.fields, now_unix()) {
                        Ok((meta, noreply)) => {
                            if meta.bytes > self.max_item_size {
                                // Swallow the oversized payload and its
                                // separator so the stream stays aligned.
                                self.reader
                                    .discard_exact(meta.bytes + SEPARATOR.len())?;
                                Some(ClientError::TooLargeItem)
                            } else {
                                self.view.prepare_set(line.raw);
                                match self.reader.read_data_block(&self.pool, meta.bytes) {
                                    Ok(data) => {
                                        self.view.set(cache_core::Item { meta, data });
                                        if noreply {
                                            self.writer.flush()?;
                                        } else {
                                            self.send_response(STORED_RESPONSE)?;
                                        }
                                        None
                                    }
                                    Err(ReadError::Client(err)) => Some(err),
                                    Err(err) => return Err(err),
                                }
                            }
                        }
                        Err(err) => {
                            // The payload length is unknown; resync at the
                            // next separator.
                            self.reader.discard_command()?;
                            Some(err)
                        }
                    }
                }
                verb if verb == DELETE_COMMAND => {
                    DELETES.increment();
                    match parse_delete_fields(&line.fields) {
                        Ok((key, noreply)) => {
                            let deleted = self.view.delete(line.raw, key);
                            if noreply {
                                self.writer.flush()?;
                            } else if deleted {
                                self.send_response(DELETED_RESPONSE)?;
                            } else {
                                self.send_response(NOT_FOUND_RESPONSE)?;
                            }
                            None
                        }
                        Err(err) => Some(err),
                    }
                }
                verb => {
                    error!(verb = ?String::from_utf8_lossy(verb), "unknown command");
                    self.send_response(ERROR_RESPONSE)?;
                    None
                }
            };

            if let Some(err) = client_err {
                self.send_client_error(err)?;
            }
        }
    }

    fn send_response(&mut self, response: &str) -> io::Result<()> {
        self.writer.write_all(response.as_bytes())?;
        self.writer.write_all(SEPARATOR)?;
        self.writer.flush()
    }

    fn send_client_error(&mut self, err: ClientError) -> io::Result<()> {
        CLIENT_ERRORS.increment();
        debug!(%err, "client error");
        write!(self.writer, "{CLIENT_ERROR_RESPONSE} {err}")?;
        self.writer.write_all(SEPARATOR)?;
        self.writer.flush()
    }
}
