//! Copy-on-write radix trie over 32-bit keys
//!
//! A Set never touches an existing node. It writes the new leaf, rebuilds
//! every branch on the path from the root down to the leaf's slot, and then
//! publishes the new root with one CAS on the volatile head. A lost CAS
//! throws the rebuilt path away and starts over from the winner's root, so
//! concurrent writers to different keys never lose each other's updates.
//!
//! Three things can happen at a branch on the way down:
//!
//! - the key leaves the branch's prefix: SPLIT, a new Index node adopts
//!   both the old branch and the new leaf
//! - the key's slot is empty: INSERT, a copy of the branch gains the leaf
//! - the key's slot is taken: REPLACE, recurse, then a copy of the branch
//!   points at the rebuilt child
//!
//! Nodes are always written after the nodes they point to, so a child's
//! offset is below its parent's. Traversals enforce that, which also rules
//! out cycles in a damaged file.

use crate::config::Durability;
use crate::error::{BarError, BarResult};
use crate::format::{
    prefix_mask, split_depth, BigdataNode, DataNode, IndexNode, Node, NodeKind, MAX_DATA_PAYLOAD,
    MAX_VALUE_SIZE, PAGE_SIZE,
};
use crate::store::{NodeStore, Step};

/// A leaf that has been written but not yet linked into a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leaf {
    pub key: u32,
    pub offset: u64,
    /// 1 for Data, 1 + fragments for Bigdata
    pub count: u32,
}

/// Result of rebuilding one subtree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Rebuilt {
    /// Root of the new subtree
    offset: u64,
    /// Its leaf count
    count: u32,
    /// Leaf count of the subtree it replaces
    previous: u32,
}

/// Reject a child that is not strictly below its parent
pub(crate) fn check_child(offset: u64, parent: u64) -> BarResult<()> {
    if offset < PAGE_SIZE || offset >= parent {
        return Err(BarError::corrupted(offset, format!("child offset is not below its parent at {}", parent)));
    }
    Ok(())
}

/// Write the leaf for `(key, value)`: one Data node, or fragments plus a Bigdata node
pub fn write_value(store: &NodeStore, key: u32, value: &[u8], durability: Durability) -> BarResult<Leaf> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(BarError::OversizedEntry { entry_size: value.len() as u64, max_size: MAX_VALUE_SIZE as u64 });
    }
    if value.len() <= MAX_DATA_PAYLOAD {
        let offset = store.write_node(&DataNode::encode(key, value)?, durability)?;
        return Ok(Leaf { key, offset, count: 1 });
    }

    let fragments = value
        .chunks(MAX_DATA_PAYLOAD)
        .map(|chunk| store.write_node(&DataNode::encode(key, chunk)?, durability))
        .collect::<BarResult<Vec<u64>>>()?;
    let big = BigdataNode::new(key, fragments);
    let offset = store.write_node(&big.encode()?, durability)?;
    Ok(Leaf { key, offset, count: big.count })
}

/// Look `key` up in the snapshot rooted at `snapshot`
pub fn lookup(store: &NodeStore, snapshot: u64, key: u32) -> BarResult<Step<Option<Vec<u8>>>> {
    let mut at = snapshot;
    let mut bound = store.heads().high_tide();

    loop {
        check_child(at, bound)?;
        let node = match store.read_in_snapshot(snapshot, at)? {
            Step::Done(node) => node,
            Step::Retry => return Ok(Step::Retry),
        };

        match node {
            Node::Branch(index) => {
                // Bucket nodes never hold baseline keys
                if index.kind == NodeKind::Bucket || !index.covers(key) {
                    return Ok(Step::Done(None));
                }
                match index.child(index.slot_of(key)) {
                    Some(child) => {
                        bound = at;
                        at = child;
                    }
                    None => return Ok(Step::Done(None)),
                }
            }
            Node::Data(data) => {
                return Ok(Step::Done(if data.key == key { Some(data.value) } else { None }));
            }
            Node::Bigdata(big) => {
                if big.key != key {
                    return Ok(Step::Done(None));
                }
                return read_fragments(store, snapshot, at, &big).map(|step| match step {
                    Step::Done(value) => Step::Done(Some(value)),
                    Step::Retry => Step::Retry,
                });
            }
        }
    }
}

/// Concatenate the fragments of the Bigdata node at `at`
fn read_fragments(store: &NodeStore, snapshot: u64, at: u64, big: &BigdataNode) -> BarResult<Step<Vec<u8>>> {
    let mut value = Vec::with_capacity(big.fragments.len() * MAX_DATA_PAYLOAD);
    for &fragment in &big.fragments {
        check_child(fragment, at)?;
        match store.read_in_snapshot(snapshot, fragment)? {
            Step::Done(Node::Data(data)) if data.key == big.key => value.extend_from_slice(&data.value),
            Step::Done(other) => {
                return Err(BarError::corrupted(fragment, format!(
                    "fragment of key {} is a {:?} node", big.key, other.kind())));
            }
            Step::Retry => return Ok(Step::Retry),
        }
    }
    Ok(Step::Done(value))
}

/// Get: look up `key` in the volatile snapshot, restarting whenever vacuum
/// retires the snapshot underneath us
pub fn get(store: &NodeStore, key: u32) -> BarResult<Option<Vec<u8>>> {
    loop {
        let snapshot = store.heads().volatile();
        if let Step::Done(value) = lookup(store, snapshot, key)? {
            return Ok(value);
        }
    }
}

/// Set: write `(key, value)` and publish a new volatile root containing it.
///
/// Returns the installed root. Every attempt reads the head first and then
/// writes a fresh leaf, so every node of the new snapshot lies above the
/// root it was built against.
pub fn set(store: &NodeStore, key: u32, value: &[u8], durability: Durability) -> BarResult<u64> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(BarError::OversizedEntry { entry_size: value.len() as u64, max_size: MAX_VALUE_SIZE as u64 });
    }

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let snapshot = store.heads().volatile();
        let leaf = write_value(store, key, value, durability)?;
        let bound = store.heads().high_tide();

        let rebuilt = match insert(store, snapshot, snapshot, bound, &leaf, durability)? {
            Step::Done(rebuilt) => rebuilt,
            Step::Retry => continue,
        };
        if store.heads().install_volatile(snapshot, rebuilt.offset) {
            if attempts > 1 {
                tracing::trace!(key, attempts, "set committed after retries");
            }
            return Ok(rebuilt.offset);
        }
    }
}

/// Rebuild the subtree at `at` with `leaf` linked in
fn insert(
    store: &NodeStore,
    snapshot: u64,
    at: u64,
    bound: u64,
    leaf: &Leaf,
    durability: Durability,
) -> BarResult<Step<Rebuilt>> {
    check_child(at, bound)?;
    let node = match store.read_in_snapshot(snapshot, at)? {
        Step::Done(node) => node,
        Step::Retry => return Ok(Step::Retry),
    };
    let previous = node.count();

    let index = match node {
        Node::Branch(index) => index,
        Node::Data(DataNode { key, .. }) | Node::Bigdata(BigdataNode { key, .. }) => {
            if key == leaf.key {
                return Ok(Step::Done(Rebuilt { offset: leaf.offset, count: leaf.count, previous }));
            }
            let count = sum_counts(at, &[1, previous, leaf.count])?;
            let split = IndexNode::pair(split_depth(key, leaf.key), (leaf.key, leaf.offset), (key, at), count);
            let offset = store.write_node(&split.encode(), durability)?;
            return Ok(Step::Done(Rebuilt { offset, count, previous }));
        }
    };

    if index.kind == NodeKind::Bucket {
        return Err(BarError::corrupted(at, "bucket nodes are reserved and cannot take keys"));
    }

    if !index.covers(leaf.key) {
        // the Head has an empty prefix, so only Index nodes get here
        let depth = split_depth(index.prefix, leaf.key & prefix_mask(index.prefix_len));
        let count = sum_counts(at, &[1, previous, leaf.count])?;
        let split = IndexNode::pair(depth, (leaf.key, leaf.offset), (index.prefix, at), count);
        let offset = store.write_node(&split.encode(), durability)?;
        return Ok(Step::Done(Rebuilt { offset, count, previous }));
    }

    let slot = index.slot_of(leaf.key);
    let replacement = match index.child(slot) {
        None => {
            let count = sum_counts(at, &[index.count, leaf.count])?;
            index.with_inserted(slot, leaf.offset, count)
        }
        Some(child) => {
            let below = match insert(store, snapshot, child, at, leaf, durability)? {
                Step::Done(below) => below,
                Step::Retry => return Ok(Step::Retry),
            };
            let count = index
                .count
                .checked_sub(below.previous)
                .and_then(|c| c.checked_add(below.count))
                .ok_or_else(|| BarError::corrupted(at, format!(
                    "count {} cannot absorb child change {} -> {}", index.count, below.previous, below.count)))?;
            index.with_replaced(slot, below.offset, count)
        }
    };

    let offset = store.write_node(&replacement.encode(), durability)?;
    Ok(Step::Done(Rebuilt { offset, count: replacement.count, previous }))
}

fn sum_counts(at: u64, counts: &[u32]) -> BarResult<u32> {
    counts
        .iter()
        .try_fold(0u32, |acc, &c| acc.checked_add(c))
        .ok_or_else(|| BarError::corrupted(at, "leaf count overflows u32"))
}
