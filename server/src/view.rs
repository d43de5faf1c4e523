//! Per-connection cache views.
//!
//! A view is how a connection talks to the cache: either directly, or
//! through [`LoggingView`], which journals every operation's raw command
//! bytes to the append-only log in the same order the operations hit the
//! cache.

use std::io::Write;
use std::sync::Arc;

use aof::Aof;
use cache_core::{Cache, Item, ItemView};
use protocol_memcache::SEPARATOR;

/// A connection's interface to the cache.
///
/// The raw-command retention contract is asymmetric: the slice passed to
/// [`CacheView::prepare_set`] may be invalidated right after the call
/// (implementations copy it if they need it), while the slices passed to
/// `get` and `delete` only have to stay valid for the duration of the
/// call.
pub trait CacheView: Send {
    /// Stage the raw command line of the upcoming [`CacheView::set`].
    fn prepare_set(&mut self, raw: &[u8]);
    fn set(&mut self, item: Item);
    fn get(&mut self, raw: &[u8], keys: &[&[u8]]) -> Vec<ItemView>;
    fn delete(&mut self, raw: &[u8], key: &[u8]) -> bool;
}

/// Factory producing one view per accepted connection.
pub type ViewFactory = Box<dyn Fn() -> Box<dyn CacheView> + Send + Sync>;

/// Plain pass-through view for servers without persistence.
pub struct DirectView {
    cache: Arc<Cache>,
}

impl DirectView {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }
}

impl CacheView for DirectView {
    fn prepare_set(&mut self, _raw: &[u8]) {}

    fn set(&mut self, item: Item) {
        self.cache.set(item);
    }

    fn get(&mut self, _raw: &[u8], keys: &[&[u8]]) -> Vec<ItemView> {
        self.cache.get(keys)
    }

    fn delete(&mut self, _raw: &[u8], key: &[u8]) -> bool {
        self.cache.delete(key)
    }
}

/// View that journals operations to the append-only log.
///
/// Thread-unsafe but cheap; the server makes one per connection.
///
/// Every operation follows the same schema:
///
/// 1. acquire the cache lock;
/// 2. apply the cache operation;
/// 3. open the log transaction;
/// 4. release the cache lock;
/// 5. write the raw command bytes;
/// 6. close the transaction.
///
/// Opening the log transaction while the cache lock is still held
/// guarantees log records appear in the same order their cache effects
/// were applied. Releasing the cache lock before the log write lets other
/// connections use the cache while this one's bytes hit the journal.
///
/// A logging failure panics: there is no guarantee of lock release at
/// that point and the process must finish execution.
pub struct LoggingView {
    cache: Arc<Cache>,
    aof: Arc<Aof>,
    /// Buffer for raw command bytes that must outlive their read buffer.
    raw_copy: Vec<u8>,
}

impl LoggingView {
    pub fn new(cache: Arc<Cache>, aof: Arc<Aof>) -> Self {
        Self {
            cache,
            aof,
            raw_copy: Vec::new(),
        }
    }
}

fn assert_no_err(result: std::io::Result<impl Sized>) {
    if let Err(err) = result {
        panic!("append log write failed: {err}");
    }
}

impl CacheView for LoggingView {
    fn prepare_set(&mut self, raw: &[u8]) {
        self.raw_copy.clear();
        self.raw_copy.extend_from_slice(raw);
    }

    fn set(&mut self, item: Item) {
        // The journal needs the payload after the cache has taken the
        // item, so hold an own reader before handing it over.
        let mut payload = item.data.new_reader();

        let mut cache = self.cache.write();
        cache.set(item);
        let mut tx = self.aof.transaction();
        drop(cache);

        assert_no_err(tx.write_all(&self.raw_copy));
        assert_no_err(payload.write_to(&mut tx));
        assert_no_err(tx.write_all(SEPARATOR));
        assert_no_err(tx.close());
    }

    fn get(&mut self, raw: &[u8], keys: &[&[u8]]) -> Vec<ItemView> {
        let cache = self.cache.read();
        let views = cache.get(keys);
        let mut tx = self.aof.transaction();
        drop(cache);

        // Gets are logged for their touch effect: without them, warm
        // promotions would be lost across restarts.
        assert_no_err(tx.write_all(raw));
        assert_no_err(tx.close());
        views
    }

    fn delete(&mut self, raw: &[u8], key: &[u8]) -> bool {
        let mut cache = self.cache.write();
        let deleted = cache.delete(key);
        let mut tx = self.aof.transaction();
        drop(cache);

        assert_no_err(tx.write_all(raw));
        assert_no_err(tx.close());
        deleted
    }
}
