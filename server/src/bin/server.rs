//! Ember cache server binary.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use clap::Parser;
use tracing::{error, info};

use cache_core::Cache;
use protocol_memcache::{IN_BUFFER_SIZE, OUT_BUFFER_SIZE};
use recycle::Pool;
use server::config::{Args, Config};
use server::conn::ConnShared;
use server::restore::{RestoreConfig, open_persistent};
use server::view::{CacheView, DirectView, LoggingView, ViewFactory};
use server::{Server, logging, signal};

fn main() {
    let args = Args::parse();
    let config = match Config::load(args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = logging::init(&config.log_level, &config.log_destination) {
        eprintln!("failed to initialize logging: {err}");
        std::process::exit(1);
    }

    if let Err(err) = run(config) {
        error!("{err}");
        std::process::exit(1);
    }
}

fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let pool = Pool::new();
    // Large item payloads are streamed chunk by chunk into the socket; the
    // chunks must cover the connection buffers for that to stay zero-copy.
    assert!(
        pool.max_chunk_size() >= IN_BUFFER_SIZE && pool.max_chunk_size() >= OUT_BUFFER_SIZE,
        "pool chunks are smaller than the connection buffers"
    );

    let cache_config = cache_core::Config {
        size: config.cache_size,
    };

    let (view_factory, shutdown): (ViewFactory, Arc<AtomicBool>) = match &config.aof {
        Some(options) => {
            let persistence = open_persistent(
                &options.name,
                &pool,
                &RestoreConfig {
                    cache: cache_config,
                    fix_corrupted: config.fix_corrupted,
                },
                aof::Config {
                    path: options.name.clone(),
                    sync_period: options.sync_period,
                    rotate_size: options.rotate_size,
                    buf_size: options.buf_size,
                },
            )?;
            info!(
                aof = %options.name.display(),
                items = persistence.cache.read().items(),
                "restored cache from append log"
            );

            // Flush and close the log on INT/TERM before exiting 0.
            let stop_aof = Arc::clone(&persistence.aof);
            let shutdown = signal::install(move || {
                if let Err(err) = stop_aof.close() {
                    error!(%err, "append log close failed on shutdown");
                }
            });

            let cache = persistence.cache;
            let aof = persistence.aof;
            let factory: ViewFactory = Box::new(move || {
                Box::new(LoggingView::new(Arc::clone(&cache), Arc::clone(&aof)))
                    as Box<dyn CacheView>
            });
            (factory, shutdown)
        }
        None => {
            let cache = Arc::new(Cache::new(cache_config));
            let factory: ViewFactory = Box::new(move || {
                Box::new(DirectView::new(Arc::clone(&cache))) as Box<dyn CacheView>
            });
            (factory, Arc::new(AtomicBool::new(false)))
        }
    };

    let server = Server {
        addr: config.addr.clone(),
        view_factory,
        shared: Arc::new(ConnShared {
            pool,
            max_item_size: config.max_item_size,
        }),
        shutdown,
    };
    server.serve()?;
    Ok(())
}
