//! Building the cache from a persisted append-only log.
//!
//! A log file is the byte-for-byte concatenation of raw client command
//! lines (plus, for `set`, payload and separator). It may start with a
//! single synthetic command announcing that a cache snapshot follows
//! before the command stream resumes. Its first byte, `\x00`, is invalid
//! for any client command, so one byte of lookahead decides.

use std::fs::File;
use std::io::{self, Read};
use std::sync::Arc;

use aof::Aof;
use cache_core::{Cache, Item, Lru, SnapshotError, now_unix};
use protocol_memcache::{
    DELETE_COMMAND, GET_COMMAND, GETS_COMMAND, LineReader, ReadError, SET_COMMAND,
    parse_delete_fields, parse_get_fields, parse_set_fields,
};
use recycle::Pool;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Announces a snapshot at the start of the log.
pub const SNAPSHOT_COMMAND: &[u8] = b"\x00 LOG FILE STARTS WITH CACHE SNAPSHOT \x00\r\n";

#[derive(Debug, Error)]
pub enum RestoreError {
    /// The log tail fails to parse. `offset` is the last valid command
    /// boundary; truncating to it recovers the file.
    #[error("append log is corrupted at byte {offset}: {reason}")]
    Corrupted { offset: u64, reason: String },
    #[error("append log snapshot: {0}")]
    Snapshot(SnapshotError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Restore options, from server configuration.
pub struct RestoreConfig {
    pub cache: cache_core::Config,
    /// On recoverable corruption, truncate the file to the last valid
    /// command boundary instead of refusing to start.
    pub fix_corrupted: bool,
}

/// Build a cache from the log at `path`, or a fresh one if none exists.
pub fn restore(path: &std::path::Path, pool: &Pool, config: &RestoreConfig) -> Result<Lru, RestoreError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            info!("append log does not exist; a new one will be created");
            return Ok(Lru::new(config.cache));
        }
        Err(err) => return Err(err.into()),
    };

    let mut reader = LineReader::new(CountingReader::new(file));
    let mut lru = read_snapshot_if_any(&mut reader, pool, config.cache)?;

    match replay_commands(&mut reader, pool, &mut lru) {
        Ok(()) => Ok(lru),
        Err(ReplayError::Corrupted { offset, reason }) => {
            if !config.fix_corrupted {
                return Err(RestoreError::Corrupted { offset, reason });
            }
            error!(offset, %reason, "append log is corrupted; truncating to the last valid command");
            drop(reader);
            let file = std::fs::OpenOptions::new().write(true).open(path)?;
            file.set_len(offset)?;
            file.sync_all()?;
            Ok(lru)
        }
        Err(ReplayError::Io(err)) => Err(err.into()),
    }
}

/// Everything the server needs when persistence is on.
pub struct Persistence {
    pub cache: Arc<Cache>,
    pub aof: Arc<Aof>,
}

/// Restore the cache from the log, then open the log for appending with a
/// rotator that compacts the file into a snapshot of the live cache.
pub fn open_persistent(
    path: &std::path::Path,
    pool: &Pool,
    restore_config: &RestoreConfig,
    aof_config: aof::Config,
) -> Result<Persistence, RestoreError> {
    let lru = restore(path, pool, restore_config)?;
    let cache = Arc::new(Cache::from_lru(lru));

    let rotator_cache = Arc::clone(&cache);
    let rotator = move |_prefix: &mut dyn Read, out: &mut dyn io::Write| -> io::Result<()> {
        write_cache_snapshot(&rotator_cache, out)
    };
    let aof = Aof::open(rotator, aof_config)?;
    Ok(Persistence { cache, aof })
}

/// The rotation payload: the snapshot marker plus the serialized cache.
///
/// The snapshot is built under a read lock but written after its release,
/// so writers only wait for the capture, not the I/O.
fn write_cache_snapshot(cache: &Cache, out: &mut dyn io::Write) -> io::Result<()> {
    out.write_all(SNAPSHOT_COMMAND)?;
    let snapshot = {
        let engine = cache.read();
        engine.snapshot()
    };
    snapshot.write_to(out)
}

fn read_snapshot_if_any(
    reader: &mut LineReader<CountingReader<File>>,
    pool: &Pool,
    config: cache_core::Config,
) -> Result<Lru, RestoreError> {
    match reader.peek_byte()? {
        Some(b) if b == SNAPSHOT_COMMAND[0] => {}
        _ => {
            debug!("no snapshot prefix detected");
            return Ok(Lru::new(config));
        }
    }
    debug!("reading snapshot");
    {
        let line = reader.read_command().map_err(|err| RestoreError::Corrupted {
            offset: 0,
            reason: format!("bad snapshot marker: {err}"),
        })?;
        if line.raw != SNAPSHOT_COMMAND {
            return Err(RestoreError::Corrupted {
                offset: 0,
                reason: "bad snapshot marker".to_string(),
            });
        }
    }
    match cache_core::read_snapshot(reader, pool, config) {
        Ok((lru, overflowed)) => {
            if overflowed {
                warn!("snapshot exceeded the configured cache size; evicted down to fit");
            }
            Ok(lru)
        }
        Err(SnapshotError::Io(err)) => Err(err.into()),
        Err(err) => Err(RestoreError::Snapshot(err)),
    }
}

enum ReplayError {
    Corrupted { offset: u64, reason: String },
    Io(io::Error),
}

/// Replay the command tail against the engine.
///
/// Any parse failure is corruption at the last valid boundary; unlike a
/// live connection, the log has no business containing bad commands.
fn replay_commands(
    reader: &mut LineReader<CountingReader<File>>,
    pool: &Pool,
    lru: &mut Lru,
) -> Result<(), ReplayError> {
    let mut last_valid = position(reader);
    loop {
        let corrupted = |reason: String| ReplayError::Corrupted {
            offset: last_valid,
            reason,
        };

        let outcome = match reader.read_command() {
            Ok(line) => {
                let verb = line.verb;
                if verb == GET_COMMAND || verb == GETS_COMMAND {
                    parse_get_fields(&line.fields)
                        .map(|()| {
                            lru.touch(&line.fields);
                            None
                        })
                        .map_err(|err| err.to_string())
                } else if verb == SET_COMMAND {
                    parse_set_fields(&line.fields, now_unix())
                        .map(|(meta, _)| Some(meta))
                        .map_err(|err| err.to_string())
                } else if verb == DELETE_COMMAND {
                    parse_delete_fields(&line.fields)
                        .map(|(key, _)| {
                            lru.delete(key);
                            None
                        })
                        .map_err(|err| err.to_string())
                } else {
                    Err(format!(
                        "unexpected command: {:?}",
                        String::from_utf8_lossy(verb)
                    ))
                }
            }
            Err(ReadError::Closed) => return Ok(()),
            Err(ReadError::Client(err)) => {
                return Err(corrupted(err.to_string()));
            }
            Err(ReadError::UnexpectedEof) => {
                return Err(corrupted("log ends mid-command".to_string()));
            }
            Err(ReadError::Io(err)) => return Err(ReplayError::Io(err)),
        };

        match outcome {
            Ok(Some(meta)) => {
                // A set's payload follows the command line.
                match reader.read_data_block(pool, meta.bytes) {
                    Ok(data) => lru.set(Item { meta, data }),
                    Err(ReadError::Io(err)) => return Err(ReplayError::Io(err)),
                    Err(err) => return Err(corrupted(err.to_string())),
                }
            }
            Ok(None) => {}
            Err(reason) => return Err(corrupted(reason)),
        }
        last_valid = position(reader);
    }
}

fn position(reader: &LineReader<CountingReader<File>>) -> u64 {
    reader.get_ref().count() - reader.buffered() as u64
}

/// Counts bytes handed out, so replay can compute command boundaries.
pub struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_core::ItemMeta;
    use std::io::Write;
    use std::time::Duration;

    fn pool() -> Pool {
        Pool::new()
    }

    fn config() -> RestoreConfig {
        RestoreConfig {
            cache: cache_core::Config { size: 1 << 20 },
            fix_corrupted: false,
        }
    }

    fn payload_of(lru: &Lru, key: &[u8]) -> Option<Vec<u8>> {
        let views = lru.get(&[key]);
        let view = views.into_iter().next()?;
        let mut out = Vec::new();
        let mut reader = view.reader;
        Read::read_to_end(&mut reader, &mut out).unwrap();
        Some(out)
    }

    #[test]
    fn missing_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let lru = restore(&dir.path().join("none.aof"), &pool(), &config()).unwrap();
        assert_eq!(lru.items(), 0);
    }

    #[test]
    fn replays_plain_command_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.aof");
        std::fs::write(
            &path,
            b"set a 7 0 5\r\nhello\r\nset b 0 0 2\r\nhi\r\ndelete b\r\nget a\r\n",
        )
        .unwrap();

        let lru = restore(&path, &pool(), &config()).unwrap();
        assert_eq!(lru.items(), 1);
        assert_eq!(payload_of(&lru, b"a").unwrap(), b"hello");
        assert!(payload_of(&lru, b"b").is_none());
    }

    #[test]
    fn replayed_get_restores_active_bit() {
        // Pad every item to exactly twice the per-node overhead, so the
        // cache holds three nodes with hot and warm caps of one node each.
        let node_size = 2 * cache_core::EXTRA_SIZE_PER_NODE;
        let bytes = (node_size - cache_core::EXTRA_SIZE_PER_NODE) as usize - 1;
        let cache_config = cache_core::Config {
            size: node_size * 100 / 32,
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("touch.aof");
        let mut log = Vec::new();
        // set a, then b (which drains a to cold), then touch a via get.
        for key in ["a", "b"] {
            log.extend_from_slice(format!("set {key} 0 0 {bytes}\r\n").as_bytes());
            log.extend_from_slice(&vec![b'x'; bytes]);
            log.extend_from_slice(b"\r\n");
        }
        log.extend_from_slice(b"get a\r\n");
        std::fs::write(&path, &log).unwrap();

        let p = pool();
        let restore_config = RestoreConfig {
            cache: cache_config,
            fix_corrupted: false,
        };
        let mut lru = restore(&path, &p, &restore_config).unwrap();

        // Two more sets overflow the total; the cold shrink promotes the
        // touched "a" to warm and evicts the untouched "b".
        for key in [b"c", b"d"] {
            let payload = vec![b'x'; bytes];
            lru.set(Item {
                meta: ItemMeta {
                    key: key.to_vec(),
                    flags: 0,
                    exptime: 0,
                    bytes,
                },
                data: p.read_data(&mut payload.as_slice(), bytes).unwrap(),
            });
        }
        assert!(payload_of(&lru, b"a").is_some(), "touched key was evicted");
        assert!(payload_of(&lru, b"b").is_none(), "untouched key survived");
        assert_eq!(lru.items(), 3);
    }

    #[test]
    fn corrupt_tail_reports_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.aof");
        let valid = b"set a 0 0 1\r\nx\r\n";
        let mut contents = valid.to_vec();
        contents.extend_from_slice(b"set b 0 0 5\r\nhel");
        std::fs::write(&path, &contents).unwrap();

        let err = restore(&path, &pool(), &config()).unwrap_err();
        match err {
            RestoreError::Corrupted { offset, .. } => {
                assert_eq!(offset, valid.len() as u64);
            }
            other => panic!("expected corruption, got {other}"),
        }
        // The file is untouched without fix_corrupted.
        assert_eq!(std::fs::read(&path).unwrap(), contents);
    }

    #[test]
    fn corrupt_tail_truncates_with_fix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fix.aof");
        let valid = b"set a 0 0 1\r\nx\r\n";
        let mut contents = valid.to_vec();
        contents.extend_from_slice(b"garbage without end");
        std::fs::write(&path, &contents).unwrap();

        let mut config = config();
        config.fix_corrupted = true;
        let lru = restore(&path, &pool(), &config).unwrap();
        assert_eq!(lru.items(), 1);
        assert_eq!(std::fs::read(&path).unwrap(), valid);
    }

    #[test]
    fn unknown_replay_command_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unknown.aof");
        std::fs::write(&path, b"set a 0 0 1\r\nx\r\nfrobnicate a\r\n").unwrap();
        assert!(matches!(
            restore(&path, &pool(), &config()),
            Err(RestoreError::Corrupted { .. })
        ));
    }

    #[test]
    fn snapshot_prefix_then_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.aof");
        let p = pool();

        // Build a cache, snapshot it into the file, append tail commands.
        let mut lru = Lru::new(config().cache);
        let body = b"persisted";
        lru.set(Item {
            meta: ItemMeta {
                key: b"snap".to_vec(),
                flags: 1,
                exptime: 0,
                bytes: body.len(),
            },
            data: p.read_data(&mut &body[..], body.len()).unwrap(),
        });
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(SNAPSHOT_COMMAND).unwrap();
        lru.snapshot().write_to(&mut file).unwrap();
        file.write_all(b"set tail 0 0 2\r\nok\r\n").unwrap();
        drop(file);

        let restored = restore(&path, &p, &config()).unwrap();
        assert_eq!(restored.items(), 2);
        assert_eq!(payload_of(&restored, b"snap").unwrap(), body);
        assert_eq!(payload_of(&restored, b"tail").unwrap(), b"ok");
    }

    #[test]
    fn persistence_round_trip_with_rotation_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.aof");
        let p = pool();
        let aof_config = aof::Config {
            path: path.clone(),
            sync_period: Duration::ZERO,
            rotate_size: 1 << 30,
            buf_size: 0,
        };

        {
            let persistence =
                open_persistent(&path, &p, &config(), aof_config.clone()).unwrap();
            let mut view = crate::view::LoggingView::new(
                Arc::clone(&persistence.cache),
                Arc::clone(&persistence.aof),
            );
            use crate::view::CacheView;
            view.prepare_set(b"set k 0 0 5\r\n");
            view.set(Item {
                meta: ItemMeta {
                    key: b"k".to_vec(),
                    flags: 0,
                    exptime: 0,
                    bytes: 5,
                },
                data: p.read_data(&mut &b"value"[..], 5).unwrap(),
            });
            persistence.aof.close().unwrap();
        }

        let persistence = open_persistent(&path, &p, &config(), aof_config).unwrap();
        let views = persistence.cache.get(&[b"k"]);
        assert_eq!(views.len(), 1);
        persistence.aof.close().unwrap();
    }
}
