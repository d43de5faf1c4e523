//! Append-only file: a durable, buffered, periodically-synced command
//! journal with background rotation.
//!
//! Appends go through [`Transaction`]s, which hold the log's lock so one
//! logical command's bytes land contiguously. Durability is either
//! per-transaction (fsync on every close) or periodic (a background ticker
//! fsyncs when the size advanced since its last pass).
//!
//! When the live size crosses the configured rotation threshold, a
//! background pass asks the [`Rotator`] to compact the current file prefix
//! into a replacement, while appends continue into the old file plus an
//! in-memory tee. The tee contents are drained into the replacement in two
//! rounds (the second under the log lock) and an atomic rename commits the
//! rotated file. A crash before the rename leaves the original log intact;
//! a crash after leaves the rotated one.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, error, info};

/// Sync periods below this force per-transaction fsync.
pub const MIN_SYNC_PERIOD: Duration = Duration::from_millis(100);

/// A rotation must shrink the frozen prefix to at most this fraction.
pub const MIN_ROTATE_COMPRESS: f64 = 0.7;

/// Log configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub path: std::path::PathBuf,
    /// Below [`MIN_SYNC_PERIOD`], every transaction close flushes and
    /// fsyncs synchronously.
    pub sync_period: Duration,
    /// Live size after which a rotation pass is started.
    pub rotate_size: u64,
    /// Write buffer size; 0 disables buffering.
    pub buf_size: usize,
}

/// Produces the compacted replacement for the log's frozen prefix.
///
/// Called off the hot path, without the log lock held. `prefix` is a
/// read-only view of the current file truncated to the frozen size.
pub trait Rotator: Send + Sync {
    fn rotate(&self, prefix: &mut dyn Read, out: &mut dyn Write) -> io::Result<()>;
}

impl<F> Rotator for F
where
    F: Fn(&mut dyn Read, &mut dyn Write) -> io::Result<()> + Send + Sync,
{
    fn rotate(&self, prefix: &mut dyn Read, out: &mut dyn Write) -> io::Result<()> {
        self(prefix, out)
    }
}

/// The append-only file.
pub struct Aof {
    config: Config,
    rotator: Box<dyn Rotator>,
    weak_self: Weak<Aof>,
    inner: Mutex<Inner>,
}

struct Inner {
    /// `None` once closed.
    out: Option<LogWriter>,
    /// In-memory tee for appends made while a rotation is in flight.
    tee: Option<Vec<u8>>,
    size: u64,
    rotating: bool,
}

enum LogWriter {
    Plain(File),
    Buffered(BufWriter<File>),
}

impl LogWriter {
    fn open(config: &Config) -> io::Result<(Self, u64)> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&config.path)?;
        let size = file.metadata()?.len();
        let writer = if config.buf_size == 0 {
            LogWriter::Plain(file)
        } else {
            LogWriter::Buffered(BufWriter::with_capacity(config.buf_size, file))
        };
        Ok((writer, size))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            LogWriter::Plain(f) => f.write_all(buf),
            LogWriter::Buffered(w) => w.write_all(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            LogWriter::Plain(_) => Ok(()),
            LogWriter::Buffered(w) => w.flush(),
        }
    }

    fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        self.file().sync_all()
    }

    fn file(&self) -> &File {
        match self {
            LogWriter::Plain(f) => f,
            LogWriter::Buffered(w) => w.get_ref(),
        }
    }
}

impl Inner {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log is closed"))?;
        out.write_all(buf)?;
        if let Some(tee) = self.tee.as_mut() {
            tee.extend_from_slice(buf);
        }
        self.size += buf.len() as u64;
        Ok(())
    }

    fn sync(&mut self) -> io::Result<()> {
        match self.out.as_mut() {
            Some(out) => out.sync(),
            None => Ok(()),
        }
    }
}

impl Aof {
    /// Open or create the log file in append mode.
    ///
    /// Unless the sync period forces per-transaction fsync, this also
    /// starts the periodic sync ticker; the ticker exits when the log is
    /// closed.
    pub fn open<R: Rotator + 'static>(rotator: R, config: Config) -> io::Result<Arc<Aof>> {
        let (out, size) = LogWriter::open(&config)?;
        let aof = Arc::new_cyclic(|weak_self| Aof {
            config,
            rotator: Box::new(rotator),
            weak_self: weak_self.clone(),
            inner: Mutex::new(Inner {
                out: Some(out),
                tee: None,
                size,
                rotating: false,
            }),
        });
        debug!(path = %aof.config.path.display(), size, "aof opened");
        if !aof.sync_every_transaction() {
            aof.start_sync_ticker();
        }
        Ok(aof)
    }

    /// Begin a transaction. The returned handle holds the log lock until
    /// closed, so write and close it as soon as possible.
    pub fn transaction(&self) -> Transaction<'_> {
        Transaction {
            aof: self,
            guard: Some(self.inner.lock()),
        }
    }

    /// Current live size: file bytes plus anything still buffered.
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    pub fn is_rotating(&self) -> bool {
        self.inner.lock().rotating
    }

    /// Flush, fsync, and close the file. Further transactions fail.
    pub fn close(&self) -> io::Result<()> {
        let mut inner = self.inner.lock();
        inner.sync()?;
        inner.out = None;
        Ok(())
    }

    fn sync_every_transaction(&self) -> bool {
        self.config.sync_period < MIN_SYNC_PERIOD
    }

    fn start_sync_ticker(&self) {
        let Some(aof) = self.weak_self.upgrade() else {
            return;
        };
        let period = self.config.sync_period;
        std::thread::Builder::new()
            .name("aof-sync".to_string())
            .spawn(move || {
                let mut prev_size = 0u64;
                loop {
                    std::thread::sleep(period);
                    let mut inner = aof.inner.lock();
                    if inner.out.is_none() {
                        return;
                    }
                    if inner.size != prev_size {
                        prev_size = inner.size;
                        if let Err(err) = inner.sync() {
                            error!(%err, "periodic aof sync failed");
                        }
                    }
                }
            })
            .expect("failed to spawn aof sync ticker");
    }

    fn start_rotation(&self) {
        let Some(aof) = self.weak_self.upgrade() else {
            return;
        };
        std::thread::Builder::new()
            .name("aof-rotate".to_string())
            .spawn(move || aof.run_rotation())
            .expect("failed to spawn aof rotation");
    }

    /// The rotation pass. Any I/O error here is fatal: crashing is safer
    /// than continuing with a log of unknown state.
    fn run_rotation(&self) {
        info!("aof rotation started");

        // Freeze the prefix: flush buffered bytes so the prefix reader
        // sees them, then start teeing appends into memory.
        let size = {
            let mut inner = self.inner.lock();
            assert!(inner.rotating, "rotation pass without the flag set");
            let out = inner.out.as_mut().expect("rotation of a closed log");
            fatal(out.flush(), "flushing before rotation");
            inner.tee = Some(Vec::new());
            inner.size
        };

        // Compact the frozen prefix into a temp file next to the log, so
        // the final rename stays on one filesystem.
        let dir = self.config.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = fatal(NamedTempFile::new_in(dir), "creating rotation file");
        {
            let src = fatal(File::open(&self.config.path), "reopening log for rotation");
            let mut prefix = BufReader::new(src.take(size));
            let mut out = BufWriter::new(tmp.as_file_mut());
            fatal(self.rotator.rotate(&mut prefix, &mut out), "rotator");
            fatal(out.flush(), "flushing rotated file");
        }
        let rotated_size = fatal(tmp.as_file().metadata(), "rotated file metadata").len();
        if (rotated_size as f64) > (size as f64) * MIN_ROTATE_COMPRESS {
            die(&format!(
                "rotation does not compress the log enough: {rotated_size} of {size} bytes"
            ));
        }
        fatal(tmp.as_file().sync_all(), "syncing rotated file");
        debug!(size, rotated_size, "aof prefix rotated");

        // The tee may have grown large; drain it without the lock and
        // leave a fresh tee in place for appends made meanwhile.
        let first_tee = {
            let mut inner = self.inner.lock();
            inner
                .tee
                .replace(Vec::new())
                .expect("tee disappeared during rotation")
        };
        fatal(tmp.as_file_mut().write_all(&first_tee), "draining appends");
        fatal(tmp.as_file().sync_all(), "syncing drained appends");

        // Commit: drain the remainder and swap the files under the lock.
        {
            let mut inner = self.inner.lock();
            let second_tee = inner.tee.take().expect("tee disappeared during rotation");
            fatal(tmp.as_file_mut().write_all(&second_tee), "draining appends");

            let mut old = inner.out.take().expect("rotation of a closed log");
            fatal(old.flush(), "flushing replaced log");
            drop(old);
            fatal(
                tmp.persist(&self.config.path).map_err(io::Error::from),
                "renaming rotated log",
            );

            let (out, size) = fatal(LogWriter::open(&self.config), "reopening rotated log");
            inner.out = Some(out);
            inner.size = size;
            inner.rotating = false;
        }
        info!("aof rotation finished");
    }
}

// Rotation failures must terminate the process rather than leave a log of
// unknown state behind. A plain panic would only kill the rotation thread,
// so these abort.

fn fatal<T, E: std::fmt::Display>(result: Result<T, E>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(err) => die(&format!("aof rotation failed while {what}: {err}")),
    }
}

fn die(msg: &str) -> ! {
    error!("{msg}");
    std::process::abort();
}

/// A write handle holding the log lock.
///
/// Closing syncs if the policy is per-transaction, releases the lock, and
/// starts a rotation pass if the size crossed the threshold. Dropping
/// without [`Transaction::close`] releases the lock without syncing.
pub struct Transaction<'a> {
    aof: &'a Aof,
    guard: Option<parking_lot::MutexGuard<'a, Inner>>,
}

impl Transaction<'_> {
    pub fn close(mut self) -> io::Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> io::Result<()> {
        let Some(mut inner) = self.guard.take() else {
            return Ok(());
        };
        if self.aof.sync_every_transaction() {
            inner.sync()?;
        }
        let start_rotation = inner.out.is_some()
            && inner.size > self.aof.config.rotate_size
            && !inner.rotating;
        if start_rotation {
            inner.rotating = true;
        }
        drop(inner);
        if start_rotation {
            self.aof.start_rotation();
        }
        Ok(())
    }
}

impl Write for Transaction<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let inner = self
            .guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "transaction closed"))?;
        inner.write(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, RngCore, SeedableRng};
    use std::io::Write;
    use std::sync::mpsc;

    fn no_rotation_config(path: std::path::PathBuf) -> Config {
        Config {
            path,
            sync_period: Duration::ZERO,
            rotate_size: 1 << 30,
            buf_size: 0,
        }
    }

    struct PanicRotator;
    impl Rotator for PanicRotator {
        fn rotate(&self, _: &mut dyn Read, _: &mut dyn Write) -> io::Result<()> {
            panic!("rotation must not start in this test");
        }
    }

    #[test]
    fn writes_append_and_size_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.aof");
        let aof = Aof::open(PanicRotator, no_rotation_config(path.clone())).unwrap();

        let mut expected = Vec::new();
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        for _ in 0..5 {
            let mut chunk = vec![0u8; rng.gen_range(1..1024)];
            rng.fill_bytes(&mut chunk);
            let mut tx = aof.transaction();
            tx.write_all(&chunk).unwrap();
            tx.close().unwrap();
            expected.extend_from_slice(&chunk);
            assert_eq!(aof.size(), expected.len() as u64);
        }
        aof.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), expected);
    }

    #[test]
    fn buffered_writes_survive_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffered.aof");
        let mut config = no_rotation_config(path.clone());
        config.buf_size = 64 << 10;
        let aof = Aof::open(PanicRotator, config).unwrap();

        let payload = b"get a\r\nset b 0 0 1\r\nx\r\n";
        let mut tx = aof.transaction();
        tx.write_all(payload).unwrap();
        tx.close().unwrap();
        // Buffered, likely not on disk yet; close flushes.
        aof.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), payload);
    }

    #[test]
    fn reopen_preserves_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen.aof");
        {
            let aof = Aof::open(PanicRotator, no_rotation_config(path.clone())).unwrap();
            let mut tx = aof.transaction();
            tx.write_all(b"0123456789").unwrap();
            tx.close().unwrap();
            aof.close().unwrap();
        }
        let aof = Aof::open(PanicRotator, no_rotation_config(path.clone())).unwrap();
        assert_eq!(aof.size(), 10);
        let mut tx = aof.transaction();
        tx.write_all(b"ab").unwrap();
        tx.close().unwrap();
        aof.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"0123456789ab");
    }

    #[test]
    fn transaction_holds_other_writers_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("order.aof");
        let aof = Aof::open(PanicRotator, no_rotation_config(path.clone())).unwrap();

        std::thread::scope(|s| {
            for worker in 0..4u8 {
                let aof = &aof;
                s.spawn(move || {
                    for i in 0..50 {
                        let line = format!("worker {worker} line {i}\n");
                        let mut tx = aof.transaction();
                        // Split the write so interleaving would be visible.
                        let (a, b) = line.as_bytes().split_at(line.len() / 2);
                        tx.write_all(a).unwrap();
                        tx.write_all(b).unwrap();
                        tx.close().unwrap();
                    }
                });
            }
        });
        aof.close().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 200);
        lines.sort_unstable();
        lines.dedup();
        assert_eq!(lines.len(), 200, "transactions interleaved");
    }

    /// Rotator used to exercise the full rotation protocol: reports the
    /// frozen prefix it saw, then blocks until the test releases it.
    struct GatedRotator {
        output: &'static [u8],
        seen: mpsc::Sender<Vec<u8>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl Rotator for GatedRotator {
        fn rotate(&self, prefix: &mut dyn Read, out: &mut dyn Write) -> io::Result<()> {
            let mut seen = Vec::new();
            prefix.read_to_end(&mut seen)?;
            self.seen.send(seen).unwrap();
            self.release.lock().recv().unwrap();
            out.write_all(self.output)
        }
    }

    fn wait_rotation_end(aof: &Aof) {
        for _ in 0..500 {
            if !aof.is_rotating() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("rotation did not finish");
    }

    #[test]
    fn rotation_replaces_prefix_and_keeps_concurrent_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rotate.aof");
        let (seen_tx, seen_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let rotator = GatedRotator {
            output: b"compact!",
            seen: seen_tx,
            release: Mutex::new(release_rx),
        };
        let config = Config {
            path: path.clone(),
            sync_period: Duration::ZERO,
            rotate_size: 100,
            buf_size: 0,
        };
        let aof = Aof::open(rotator, config).unwrap();

        // Cross the rotation threshold.
        let before: Vec<u8> = (0..128u8).collect();
        let mut tx = aof.transaction();
        tx.write_all(&before).unwrap();
        tx.close().unwrap();

        // The rotator has frozen the prefix once it reports what it read.
        let frozen = seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(frozen, before);
        assert!(aof.is_rotating());

        // Appends made during rotation must survive the file swap.
        let mut tx = aof.transaction();
        tx.write_all(b" during-1").unwrap();
        tx.close().unwrap();
        let mut tx = aof.transaction();
        tx.write_all(b" during-2").unwrap();
        tx.close().unwrap();

        release_tx.send(()).unwrap();
        wait_rotation_end(&aof);

        let mut expected = b"compact!".to_vec();
        expected.extend_from_slice(b" during-1 during-2");
        assert_eq!(std::fs::read(&path).unwrap(), expected);
        assert_eq!(aof.size(), expected.len() as u64);

        // The log keeps accepting appends after rotation.
        let mut tx = aof.transaction();
        tx.write_all(b" after").unwrap();
        tx.close().unwrap();
        aof.close().unwrap();
        expected.extend_from_slice(b" after");
        assert_eq!(std::fs::read(&path).unwrap(), expected);
    }

    #[test]
    fn rotation_under_concurrent_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("concurrent.aof");
        let (seen_tx, seen_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let rotator = GatedRotator {
            output: b"S",
            seen: seen_tx,
            release: Mutex::new(release_rx),
        };
        let config = Config {
            path: path.clone(),
            sync_period: Duration::ZERO,
            rotate_size: 64,
            buf_size: 4 << 10,
        };
        let aof = Aof::open(rotator, config).unwrap();

        let mut tx = aof.transaction();
        tx.write_all(&[b'x'; 100]).unwrap();
        tx.close().unwrap();
        let frozen = seen_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(frozen.len(), 100);

        // Concurrent writers append while the rotation is frozen on the
        // gate; every byte they write lands in the in-memory tee.
        std::thread::scope(|s| {
            for worker in 0..8u8 {
                let aof = &aof;
                s.spawn(move || {
                    for i in 0..25 {
                        let line = format!("<{worker}:{i}>");
                        let mut tx = aof.transaction();
                        tx.write_all(line.as_bytes()).unwrap();
                        tx.close().unwrap();
                    }
                });
            }
        });
        release_tx.send(()).unwrap();
        wait_rotation_end(&aof);
        aof.close().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with('S'), "rotated prefix missing");
        let tail = &contents[1..];
        for worker in 0..8 {
            for i in 0..25 {
                let line = format!("<{worker}:{i}>");
                assert_eq!(
                    tail.matches(&line).count(),
                    1,
                    "append {line} lost or duplicated"
                );
            }
        }
        assert_eq!(aof.size(), contents.len() as u64);
    }

    #[test]
    fn sync_policy_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        let per_tx = Aof::open(
            PanicRotator,
            Config {
                path: dir.path().join("a.aof"),
                sync_period: MIN_SYNC_PERIOD - Duration::from_millis(1),
                rotate_size: 1 << 30,
                buf_size: 0,
            },
        )
        .unwrap();
        assert!(per_tx.sync_every_transaction());
        per_tx.close().unwrap();

        let periodic = Aof::open(
            PanicRotator,
            Config {
                path: dir.path().join("b.aof"),
                sync_period: MIN_SYNC_PERIOD,
                rotate_size: 1 << 30,
                buf_size: 0,
            },
        )
        .unwrap();
        assert!(!periodic.sync_every_transaction());
        periodic.close().unwrap();
    }

    #[test]
    fn periodic_sync_flushes_buffered_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ticker.aof");
        let config = Config {
            path: path.clone(),
            sync_period: MIN_SYNC_PERIOD,
            rotate_size: 1 << 30,
            buf_size: 64 << 10,
        };
        let aof = Aof::open(PanicRotator, config).unwrap();
        let mut tx = aof.transaction();
        tx.write_all(b"tick").unwrap();
        tx.close().unwrap();

        // Wait out at least one ticker pass; the buffered write must have
        // reached the file without an explicit close.
        let start = std::time::Instant::now();
        loop {
            if std::fs::read(&path).unwrap() == b"tick" {
                break;
            }
            assert!(
                start.elapsed() < Duration::from_secs(5),
                "ticker never flushed"
            );
            std::thread::sleep(Duration::from_millis(20));
        }
        aof.close().unwrap();
    }
}
