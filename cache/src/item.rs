//! Cache items and read views.

use std::time::{SystemTime, UNIX_EPOCH};

use recycle::{Data, DataReader};
use serde::{Deserialize, Serialize};

/// Metadata of a stored item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMeta {
    pub key: Vec<u8>,
    pub flags: u32,
    /// Absolute unix seconds; 0 means the item never expires.
    pub exptime: i64,
    /// Payload length in bytes.
    pub bytes: usize,
}

impl ItemMeta {
    pub fn expired(&self, now: i64) -> bool {
        self.exptime != 0 && self.exptime < now
    }
}

/// An item handed to the cache. The cache takes over the data reference
/// and recycles it on eviction, overwrite, or delete.
#[derive(Debug)]
pub struct Item {
    pub meta: ItemMeta,
    pub data: Data,
}

/// A read view of a stored item.
///
/// The reader holds a reference on the item's data, so the payload stays
/// readable even if the item is concurrently evicted or overwritten.
#[derive(Debug)]
pub struct ItemView {
    pub meta: ItemMeta,
    pub reader: DataReader,
}

impl Item {
    pub fn new_view(&self) -> ItemView {
        ItemView {
            meta: self.meta.clone(),
            reader: self.data.new_reader(),
        }
    }
}

/// Current unix time in seconds.
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}
