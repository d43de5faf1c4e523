//! Intrusive doubly linked queues over the node arena.
//!
//! Nodes live in a single [`Slab`] arena owned by the engine; queue links
//! are arena indices, so the list carries no ownership and no reference
//! cycles. Each queue is bounded by sentinel head/tail nodes to eliminate
//! nil checks at the edges.
//!
//! Invariants, before and after every queue mutation:
//! - the queue owns exactly the nodes between its sentinels;
//! - `{head sentinel, owned nodes.., tail sentinel}` is a correct doubly
//!   linked list;
//! - every owned node has `owner == Some(queue temp)`;
//! - `size` equals the sum of owned node sizes;
//! - sentinels have no owner, no item, and `NIL` outer links;
//! - no owned node holds recycled data.

use std::sync::atomic::{AtomicBool, Ordering};

use slab::Slab;

use crate::item::Item;

/// Sentinel index value for absent links.
pub(crate) const NIL: usize = usize::MAX;

/// Memory overhead approximation per stored item: node, chunk bookkeeping,
/// and hash table cells. Without this compensation the cache could be blown
/// up with millions of tiny values.
pub const EXTRA_SIZE_PER_NODE: i64 = 256;

/// Queue temperature. The numeric order is the snapshot serialization
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Temp {
    Cold = 0,
    Warm = 1,
    Hot = 2,
}

pub(crate) const TEMPS: usize = 3;

impl Temp {
    pub(crate) const ALL: [Temp; TEMPS] = [Temp::Cold, Temp::Warm, Temp::Hot];
}

/// What a shrink pass does with a classified node. Every variant keeps the
/// engine invariants: the node is either re-attached somewhere as inactive
/// or disowned entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    /// Re-attach as inactive at the tail of the same queue.
    Stay,
    /// Move to the tail of another queue, inactive.
    MoveTo(Temp),
    /// Detach, remove from the table, recycle the data.
    Evict,
}

#[derive(Debug)]
pub(crate) struct Node {
    /// `None` only for sentinels.
    pub(crate) item: Option<Item>,
    /// Hint bit set by reads. Concurrent relaxed stores under the engine
    /// read lock; exclusive access under the write lock.
    pub(crate) active: AtomicBool,
    pub(crate) owner: Option<Temp>,
    pub(crate) prev: usize,
    pub(crate) next: usize,
}

impl Node {
    pub(crate) fn new(item: Item) -> Self {
        Self {
            item: Some(item),
            active: AtomicBool::new(false),
            owner: None,
            prev: NIL,
            next: NIL,
        }
    }

    fn sentinel() -> Self {
        Self {
            item: None,
            active: AtomicBool::new(false),
            owner: None,
            prev: NIL,
            next: NIL,
        }
    }

    pub(crate) fn item(&self) -> &Item {
        self.item.as_ref().expect("sentinel node has no item")
    }

    pub(crate) fn size(&self) -> i64 {
        let meta = &self.item().meta;
        EXTRA_SIZE_PER_NODE + meta.key.len() as i64 + meta.bytes as i64
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Requires the engine read lock (or stronger) to be held.
    pub(crate) fn set_active(&self) {
        self.active.store(true, Ordering::Relaxed);
    }
}

#[derive(Debug)]
pub(crate) struct Queue {
    pub(crate) temp: Temp,
    /// Head sentinel: `head.next` is the least recently pushed node, the
    /// first one a shrink pass visits.
    pub(crate) head: usize,
    /// Tail sentinel: new nodes attach right before it.
    pub(crate) tail: usize,
    pub(crate) size: i64,
    pub(crate) len: usize,
    pub(crate) on_active: Action,
    pub(crate) on_inactive: Action,
}

impl Queue {
    pub(crate) fn new(
        arena: &mut Slab<Node>,
        temp: Temp,
        on_active: Action,
        on_inactive: Action,
    ) -> Self {
        let head = arena.insert(Node::sentinel());
        let tail = arena.insert(Node::sentinel());
        link(arena, head, tail);
        Self {
            temp,
            head,
            tail,
            size: 0,
            len: 0,
            on_active,
            on_inactive,
        }
    }

    /// Take ownership of a detached node and append it as inactive.
    pub(crate) fn push(&mut self, arena: &mut Slab<Node>, idx: usize) {
        arena[idx].owner = Some(self.temp);
        self.size += arena[idx].size();
        self.len += 1;
        self.attach_as_inactive(arena, idx);
    }

    /// Append an already-owned node at the tail, clearing its active bit.
    pub(crate) fn attach_as_inactive(&mut self, arena: &mut Slab<Node>, idx: usize) {
        arena[idx].active.store(false, Ordering::Relaxed);
        let last = arena[self.tail].prev;
        link(arena, last, idx);
        link(arena, idx, self.tail);
    }

    /// Release ownership accounting for an already-unlinked node.
    pub(crate) fn disown(&mut self, arena: &mut Slab<Node>, idx: usize) {
        debug_assert_eq!(arena[idx].owner, Some(self.temp));
        self.size -= arena[idx].size();
        self.len -= 1;
        arena[idx].owner = None;
    }

    /// Index of the first real node; the tail sentinel when empty.
    pub(crate) fn first(&self, arena: &Slab<Node>) -> usize {
        arena[self.head].next
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }
}

pub(crate) fn link(arena: &mut Slab<Node>, a: usize, b: usize) {
    arena[a].next = b;
    arena[b].prev = a;
}

/// Remove a node from its list, leaving its own links stale.
pub(crate) fn unlink(arena: &mut Slab<Node>, idx: usize) {
    let prev = arena[idx].prev;
    let next = arena[idx].next;
    link(arena, prev, next);
}
