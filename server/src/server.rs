//! TCP accept loop.

use std::io::{self, Write};
use std::net::{TcpListener, TcpStream};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tracing::{debug_span, error, info};

use crate::conn::{Conn, ConnShared};
use crate::metrics::{CONNECTIONS_ACCEPTED, CONNECTIONS_ACTIVE, SERVER_ERRORS};
use crate::view::ViewFactory;

const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// The cache server: accepts connections and serves each on its own
/// blocking worker thread.
pub struct Server {
    pub addr: String,
    pub view_factory: ViewFactory,
    pub shared: Arc<ConnShared>,
    /// Checked when accept fails; lets a signal or a test stop the loop.
    pub shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn serve(&self) -> io::Result<()> {
        let listener = TcpListener::bind(&self.addr)?;
        info!(addr = %self.addr, "serving");
        self.serve_on(listener)
    }

    pub fn serve_on(&self, listener: TcpListener) -> io::Result<()> {
        let conn_counter = AtomicU64::new(0);
        let mut backoff = ACCEPT_BACKOFF_START;
        loop {
            let stream = match listener.accept() {
                Ok((stream, _peer)) => {
                    backoff = ACCEPT_BACKOFF_START;
                    stream
                }
                Err(err) => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        info!("server stopped; accept returned: {err}");
                        return Ok(());
                    }
                    error!(%err, "accept error; retrying in {backoff:?}");
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    continue;
                }
            };

            CONNECTIONS_ACCEPTED.increment();
            let conn_id = conn_counter.fetch_add(1, Ordering::Relaxed);
            let view = (self.view_factory)();
            let shared = Arc::clone(&self.shared);
            std::thread::Builder::new()
                .name(format!("conn-{conn_id}"))
                .spawn(move || {
                    let _span = debug_span!("conn", id = conn_id).entered();
                    CONNECTIONS_ACTIVE.increment();
                    serve_connection(stream, view, &shared);
                    CONNECTIONS_ACTIVE.decrement();
                })
                .expect("failed to spawn connection thread");
        }
    }
}

fn serve_connection(
    stream: TcpStream,
    view: Box<dyn crate::view::CacheView>,
    shared: &ConnShared,
) {
    // Keep a handle for the best-effort error line if the handler panics.
    let panic_stream = stream.try_clone();
    let conn = match Conn::new(stream, view, shared) {
        Ok(conn) => conn,
        Err(err) => {
            error!(%err, "connection setup failed");
            return;
        }
    };
    if catch_unwind(AssertUnwindSafe(move || conn.serve())).is_err() {
        SERVER_ERRORS.increment();
        error!("connection handler panicked");
        if let Ok(mut stream) = panic_stream {
            let _ = stream.write_all(b"SERVER_ERROR internal error\r\n");
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }
}
