//! The hot/warm/cold eviction engine and its locked wrapper.

use ahash::RandomState;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use slab::Slab;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::item::{Item, ItemView, now_unix};
use crate::queue::{Action, NIL, Node, Queue, TEMPS, Temp, unlink};

pub use crate::queue::EXTRA_SIZE_PER_NODE;

const HOT_CAP_PERCENT: i64 = 32;
const WARM_CAP_PERCENT: i64 = 32;

/// Engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Total cache size in bytes, including per-node overhead.
    pub size: i64,
}

impl Config {
    /// Hot queue cap; also the largest admissible single node.
    pub fn hot_cap(&self) -> i64 {
        self.size * HOT_CAP_PERCENT / 100
    }

    pub fn warm_cap(&self) -> i64 {
        self.size * WARM_CAP_PERCENT / 100
    }
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    total: i64,
    hot: i64,
    warm: i64,
}

/// The segmented LRU engine.
///
/// Carries no lock of its own: `&self` methods are safe under a shared
/// lock (reads only flip the per-node atomic hint bit), `&mut self`
/// methods require exclusive access. [`Cache`] provides the locked
/// wrapper.
#[derive(Debug)]
pub struct Lru {
    nodes: Slab<Node>,
    table: HashMap<Vec<u8>, usize, RandomState>,
    queues: [Queue; TEMPS],
    limits: Limits,
}

impl Lru {
    pub fn new(config: Config) -> Self {
        let mut nodes = Slab::new();
        // Item flow: new items enter hot; active hot/warm stay put, active
        // cold is promoted to warm; everything inactive drains to cold and
        // is evicted from its head.
        let queues = [
            Queue::new(&mut nodes, Temp::Cold, Action::MoveTo(Temp::Warm), Action::Evict),
            Queue::new(&mut nodes, Temp::Warm, Action::Stay, Action::MoveTo(Temp::Cold)),
            Queue::new(&mut nodes, Temp::Hot, Action::Stay, Action::MoveTo(Temp::Cold)),
        ];
        // Queues are indexed by Temp discriminant.
        debug_assert!(
            Temp::ALL
                .iter()
                .all(|&t| queues[t as usize].temp == t)
        );
        Self {
            nodes,
            table: HashMap::with_hasher(RandomState::new()),
            queues,
            limits: Limits {
                total: config.size,
                hot: config.hot_cap(),
                warm: config.warm_cap(),
            },
        }
    }

    /// Store an item, replacing any previous value for the key.
    ///
    /// An already-expired item still removes the previous value but stores
    /// nothing. The new node enters hot and inherits the active bit of the
    /// node it replaces.
    ///
    /// # Panics
    ///
    /// Panics if the item alone exceeds the hot queue cap; callers must
    /// bound item sizes in configuration, so this is a bug upstream.
    pub fn set(&mut self, item: Item) {
        let now = now_unix();
        let expired = item.meta.expired(now);
        if expired {
            warn!("set of an already expired item");
        }
        let mut was_active = false;
        if let Some(&idx) = self.table.get(item.meta.key.as_slice()) {
            debug!(key = ?String::from_utf8_lossy(&item.meta.key), "removing old value");
            was_active = self.nodes[idx].is_active();
            unlink(&mut self.nodes, idx);
            self.delete_detached(idx);
        }
        if expired {
            warn!("skipping store of expired item");
            item.data.recycle();
            self.check_invariants();
            return;
        }

        let idx = self.nodes.insert(Node::new(item));
        let node = &self.nodes[idx];
        let size = node.size();
        let key = node.item().meta.key.clone();
        self.table.insert(key, idx);
        self.queues[Temp::Hot as usize].push(&mut self.nodes, idx);
        if was_active {
            self.nodes[idx].set_active();
        }

        if size > self.limits.hot {
            panic!(
                "item of size {size} exceeds hot queue cap {}; \
                 max item size must be validated upstream",
                self.limits.hot
            );
        }
        if self.hot_overflow() || self.total_overflow() {
            self.fix_overflows(now);
        }
        self.check_invariants();
    }

    /// Look up keys and build read views for the live ones.
    ///
    /// Sets the active bit on every hit; this is the only mutation a read
    /// performs, and it goes through a relaxed atomic store so concurrent
    /// readers do not contend.
    pub fn get<K: AsRef<[u8]>>(&self, keys: &[K]) -> Vec<ItemView> {
        let now = now_unix();
        let mut views = Vec::new();
        for key in keys {
            if let Some(&idx) = self.table.get(key.as_ref()) {
                let node = &self.nodes[idx];
                if !node.item().meta.expired(now) {
                    node.set_active();
                    views.push(node.item().new_view());
                }
            }
        }
        views
    }

    /// Set the active bit for present keys without building views.
    ///
    /// Used when replaying logged `get` lines, so warm promotions survive
    /// a restart.
    pub fn touch<K: AsRef<[u8]>>(&self, keys: &[K]) {
        for key in keys {
            if let Some(&idx) = self.table.get(key.as_ref()) {
                self.nodes[idx].set_active();
            }
        }
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        let Some(&idx) = self.table.get(key) else {
            self.check_invariants();
            return false;
        };
        unlink(&mut self.nodes, idx);
        self.delete_detached(idx);
        self.check_invariants();
        true
    }

    /// Number of stored items.
    pub fn items(&self) -> usize {
        self.table.len()
    }

    /// Total accounted size over all queues.
    pub fn size(&self) -> i64 {
        self.queues.iter().map(|q| q.size).sum()
    }

    fn free(&self) -> i64 {
        self.limits.total - self.size()
    }

    fn hot_overflow(&self) -> bool {
        self.queues[Temp::Hot as usize].size > self.limits.hot
    }

    fn warm_overflow(&self) -> bool {
        self.queues[Temp::Warm as usize].size > self.limits.warm
    }

    fn total_overflow(&self) -> bool {
        self.free() < 0
    }

    /// Restore all queue caps after hot or total overflowed.
    ///
    /// Step order matters: hot first (demoting its inactive head to cold),
    /// then cold (evicting inactive, promoting active to warm), then warm
    /// if the promotions overflowed it, then cold again to evict what warm
    /// just demoted.
    pub(crate) fn fix_overflows(&mut self, now: i64) {
        debug!("fixing overflows");
        if self.hot_overflow() {
            debug!("hot overflow");
            self.shrink_while(Temp::Hot, |c| c.hot_overflow(), now);
        }
        if !self.total_overflow() {
            return;
        }
        debug!("total overflow");
        self.shrink_while(
            Temp::Cold,
            |c| !c.queues[Temp::Cold as usize].is_empty() && c.total_overflow(),
            now,
        );

        if self.warm_overflow() {
            // Some active cold became warm just now.
            debug!("warm overflow");
            self.shrink_while(Temp::Warm, |c| c.warm_overflow(), now);
        }

        if !self.total_overflow() {
            return;
        }
        debug!("total overflow not fixed yet; evicting demoted warm items");
        self.shrink_while(Temp::Cold, |c| c.total_overflow(), now);

        if self.total_overflow() {
            panic!("cache still overflows after eviction");
        }
    }

    /// Pop nodes off a queue's head while `pred` holds, dispatching each to
    /// its policy action: expired nodes are evicted, active nodes take
    /// `on_active`, inactive nodes take `on_inactive`.
    ///
    /// A node re-attached by `Stay` lands at the tail with its active bit
    /// cleared, so if the predicate still holds when the walk comes around
    /// again it is demoted like any other inactive node. The pass ends when
    /// the predicate is satisfied; draining the queue without satisfying it
    /// is an invariant breach.
    fn shrink_while<F>(&mut self, temp: Temp, pred: F, now: i64)
    where
        F: Fn(&Lru) -> bool,
    {
        while pred(self) {
            let idx = self.queues[temp as usize].first(&self.nodes);
            assert!(
                idx != self.queues[temp as usize].tail,
                "queue drained while shrink predicate still holds"
            );
            unlink(&mut self.nodes, idx);

            let node = &self.nodes[idx];
            let action = if node.item().meta.expired(now) {
                debug!(key = ?String::from_utf8_lossy(&node.item().meta.key), "item expired");
                Action::Evict
            } else if node.is_active() {
                self.queues[temp as usize].on_active
            } else {
                self.queues[temp as usize].on_inactive
            };

            match action {
                Action::Stay => {
                    self.queues[temp as usize].attach_as_inactive(&mut self.nodes, idx);
                }
                Action::MoveTo(target) => {
                    self.queues[temp as usize].disown(&mut self.nodes, idx);
                    self.queues[target as usize].push(&mut self.nodes, idx);
                }
                Action::Evict => {
                    debug!(key = ?String::from_utf8_lossy(&self.nodes[idx].item().meta.key), "item evicted");
                    self.delete_detached(idx);
                }
            }
        }
    }

    /// Destroy an owned but already-unlinked node: release queue
    /// accounting, drop the table entry, recycle the data.
    fn delete_detached(&mut self, idx: usize) {
        let temp = self.nodes[idx].owner.expect("detached node has no owner");
        self.queues[temp as usize].disown(&mut self.nodes, idx);
        let node = self.nodes.remove(idx);
        let item = node.item.expect("sentinel in a queue body");
        self.table.remove(item.meta.key.as_slice());
        item.data.recycle();
    }

    /// Insert a restored node directly into a queue, bypassing the hot
    /// entry path. Snapshot restore only.
    pub(crate) fn restore_node(&mut self, temp: Temp, item: Item, active: bool) {
        let idx = self.nodes.insert(Node::new(item));
        let key = self.nodes[idx].item().meta.key.clone();
        self.table.insert(key, idx);
        self.queues[temp as usize].push(&mut self.nodes, idx);
        if active {
            self.nodes[idx].set_active();
        }
    }

    pub(crate) fn queue_nodes(&self, temp: Temp) -> impl Iterator<Item = &Node> {
        QueueIter {
            nodes: &self.nodes,
            tail: self.queues[temp as usize].tail,
            cursor: self.queues[temp as usize].first(&self.nodes),
        }
    }

    pub(crate) fn queue_len(&self, temp: Temp) -> usize {
        self.queues[temp as usize].len
    }

    pub(crate) fn any_cap_exceeded(&self) -> bool {
        self.hot_overflow() || self.warm_overflow() || self.total_overflow()
    }

    #[cfg(debug_assertions)]
    pub(crate) fn check_invariants(&self) {
        let mut items = 0;
        for &temp in &Temp::ALL {
            let q = &self.queues[temp as usize];
            let head = &self.nodes[q.head];
            let tail = &self.nodes[q.tail];
            assert_eq!(head.prev, NIL, "head sentinel has an outer link");
            assert_eq!(tail.next, NIL, "tail sentinel has an outer link");
            assert!(head.owner.is_none() && tail.owner.is_none(), "owned sentinel");

            let mut size = 0;
            let mut len = 0;
            let mut idx = q.first(&self.nodes);
            let mut prev = q.head;
            while idx != q.tail {
                let node = &self.nodes[idx];
                assert_eq!(node.prev, prev, "broken back link");
                assert_eq!(node.owner, Some(temp), "node owner mismatch");
                assert!(!node.item().data.is_recycled(), "recycled data in queue");
                let table_idx = self
                    .table
                    .get(node.item().meta.key.as_slice())
                    .unwrap_or_else(|| panic!("no table entry for queued node"));
                assert_eq!(*table_idx, idx, "table points at another node");
                size += node.size();
                len += 1;
                items += 1;
                prev = idx;
                idx = node.next;
            }
            assert_eq!(q.size, size, "queue size accounting is off");
            assert_eq!(q.len, len, "queue length accounting is off");
        }
        assert_eq!(items, self.table.len(), "table has orphaned entries");
        assert!(!self.total_overflow(), "total overflow");
        assert!(!self.hot_overflow(), "hot overflow");
        assert!(!self.warm_overflow(), "warm overflow");
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    pub(crate) fn check_invariants(&self) {}
}

struct QueueIter<'a> {
    nodes: &'a Slab<Node>,
    tail: usize,
    cursor: usize,
}

impl<'a> Iterator for QueueIter<'a> {
    type Item = &'a Node;

    fn next(&mut self) -> Option<&'a Node> {
        if self.cursor == self.tail {
            return None;
        }
        let node = &self.nodes[self.cursor];
        self.cursor = node.next;
        Some(node)
    }
}

/// The engine behind its reader/writer lock.
///
/// `get`/`touch` take the shared side, `set`/`delete` the exclusive side.
/// [`Cache::read`] and [`Cache::write`] expose the guards for callers that
/// need to order other work relative to the cache lock, such as the
/// logging view and snapshot writer.
pub struct Cache {
    inner: RwLock<Lru>,
}

impl Cache {
    pub fn new(config: Config) -> Self {
        Self::from_lru(Lru::new(config))
    }

    pub fn from_lru(lru: Lru) -> Self {
        Self {
            inner: RwLock::new(lru),
        }
    }

    pub fn set(&self, item: Item) {
        self.inner.write().set(item)
    }

    pub fn get<K: AsRef<[u8]>>(&self, keys: &[K]) -> Vec<ItemView> {
        self.inner.read().get(keys)
    }

    pub fn touch<K: AsRef<[u8]>>(&self, keys: &[K]) {
        self.inner.read().touch(keys)
    }

    pub fn delete(&self, key: &[u8]) -> bool {
        self.inner.write().delete(key)
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Lru> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Lru> {
        self.inner.write()
    }
}
