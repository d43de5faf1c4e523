//! Segmented LRU cache engine.
//!
//! The engine keeps items in three queues following the memcached
//! `new_lru` scheme:
//!
//! - new items enter the **hot** queue;
//! - queue updates only happen as items reach the head during a shrink
//!   pass: items active in hot stay in hot, items active in warm stay in
//!   warm, items active in cold move to warm;
//! - hot and warm are each capped at 32% of the configured size, cold is
//!   uncapped;
//! - everything inactive drains through cold and out the bottom.
//!
//! The primary goal is protecting active items from scan workloads: an
//! item that is never hit again flows from hot through cold and is
//! evicted, while an item hit even once in cold earns a protected spot in
//! warm. A secondary goal is read latency: reads only flip a per-node
//! atomic hint bit, so they run under the shared side of the engine lock.

mod engine;
mod item;
mod queue;
mod snapshot;

pub use engine::{Cache, Config, EXTRA_SIZE_PER_NODE, Lru};
pub use item::{Item, ItemMeta, ItemView, now_unix};
pub use snapshot::{Snapshot, SnapshotError, read_snapshot};
