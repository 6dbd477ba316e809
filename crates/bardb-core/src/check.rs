//! Consistency checker and rollback
//!
//! Walks every node reachable from a snapshot and verifies:
//! - checksums (through decode)
//! - each child lies below its parent and inside the node region
//! - node kinds fit their position: a Head only at the root, fragments are
//!   Data nodes of the Bigdata node's key
//! - every child sits in the slot its key or prefix selects
//! - stored counts equal 1 + the sum of the children's counts
//!
//! At open, a volatile snapshot that fails is rolled back to the durable one.

use tracing::warn;

use crate::error::{BarError, BarResult};
use crate::format::{IndexNode, Node, NodeKind, FANOUT};
use crate::store::{NodeStore, Step};
use crate::trie::check_child;

/// Result of a successful check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckReport {
    /// Snapshot that passed
    pub snapshot: u64,
    /// Nodes visited, fragments included
    pub nodes: u64,
    /// Keys stored in the snapshot
    pub keys: u64,
    /// The volatile snapshot that was abandoned, if a rollback happened
    pub rolled_back_from: Option<u64>,
}

#[derive(Debug, Default)]
struct Tally {
    nodes: u64,
    keys: u64,
}

/// Where a node hangs in the trie
#[derive(Clone, Copy)]
enum Position<'a> {
    Root,
    Child { parent: &'a IndexNode, slot: u8 },
    Fragment { key: u32 },
}

/// Verifies snapshots of one store
pub struct ConsistencyChecker<'a> {
    store: &'a NodeStore,
}

impl<'a> ConsistencyChecker<'a> {
    pub fn new(store: &'a NodeStore) -> Self {
        Self { store }
    }

    /// Verify the current volatile snapshot without changing anything.
    ///
    /// Corruption is returned as an error.
    pub fn verify(&self) -> BarResult<CheckReport> {
        loop {
            let snapshot = self.store.heads().volatile();
            if let Step::Done(tally) = self.verify_snapshot(snapshot)? {
                return Ok(CheckReport { snapshot, nodes: tally.nodes, keys: tally.keys, rolled_back_from: None });
            }
        }
    }

    /// Verify the volatile snapshot, rolling back to the durable one on failure.
    ///
    /// Fails only if the header is out of order, the durable snapshot itself
    /// does not verify, or the file cannot be read.
    pub fn make_consistent(&self) -> BarResult<CheckReport> {
        let heads = self.store.heads();
        let header = heads.snapshot();
        if !header.is_ordered() {
            return Err(BarError::corrupted(0, format!("header offsets out of order: {:?}", header)));
        }

        let mut rolled_back_from = None;
        loop {
            let snapshot = heads.volatile();
            match self.verify_snapshot(snapshot) {
                Ok(Step::Done(tally)) => {
                    return Ok(CheckReport { snapshot, nodes: tally.nodes, keys: tally.keys, rolled_back_from });
                }
                Ok(Step::Retry) => continue,
                Err(err) if err.is_corruption() => {
                    let durable = heads.durable();
                    if snapshot <= durable {
                        return Err(err);
                    }
                    warn!(snapshot, durable, error = %err, "volatile snapshot is damaged, rolling back");
                    // a lost race means the head moved; check whatever it is now
                    if heads.rollback_volatile(snapshot, durable) {
                        rolled_back_from.get_or_insert(snapshot);
                        heads.flush()?;
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn verify_snapshot(&self, snapshot: u64) -> BarResult<Step<Tally>> {
        let mut tally = Tally::default();
        let bound = self.store.heads().high_tide();
        match self.visit(snapshot, snapshot, bound, Position::Root, &mut tally)? {
            Step::Done(_) => Ok(Step::Done(tally)),
            Step::Retry => Ok(Step::Retry),
        }
    }

    /// Verify the subtree at `at` and return its leaf count
    fn visit(
        &self,
        snapshot: u64,
        at: u64,
        bound: u64,
        position: Position<'_>,
        tally: &mut Tally,
    ) -> BarResult<Step<u32>> {
        check_child(at, bound)?;
        let node = match self.store.read_in_snapshot(snapshot, at)? {
            Step::Done(node) => node,
            Step::Retry => return Ok(Step::Retry),
        };
        tally.nodes += 1;
        check_position(at, &node, position)?;

        let mut actual = 1u32;
        match &node {
            Node::Branch(index) => {
                for slot in 0..FANOUT as u8 {
                    let Some(child) = index.child(slot) else { continue };
                    match self.visit(snapshot, child, at, Position::Child { parent: index, slot }, tally)? {
                        Step::Done(count) => actual = add_count(at, actual, count)?,
                        Step::Retry => return Ok(Step::Retry),
                    }
                }
            }
            Node::Data(_) => {
                if !matches!(position, Position::Fragment { .. }) {
                    tally.keys += 1;
                }
            }
            Node::Bigdata(big) => {
                tally.keys += 1;
                for &fragment in &big.fragments {
                    match self.visit(snapshot, fragment, at, Position::Fragment { key: big.key }, tally)? {
                        Step::Done(count) => actual = add_count(at, actual, count)?,
                        Step::Retry => return Ok(Step::Retry),
                    }
                }
            }
        }

        if actual != node.count() {
            return Err(BarError::corrupted(at, format!(
                "stored count {} but the subtree holds {}", node.count(), actual)));
        }
        Ok(Step::Done(actual))
    }
}

fn add_count(at: u64, sum: u32, count: u32) -> BarResult<u32> {
    sum.checked_add(count)
        .ok_or_else(|| BarError::corrupted(at, "subtree count overflows u32"))
}

fn check_leaf_slot(at: u64, parent: &IndexNode, slot: u8, key: u32) -> BarResult<()> {
    if !parent.covers(key) || parent.slot_of(key) != slot {
        return Err(BarError::corrupted(at, format!(
            "key {:08x} does not belong in slot {} of {:08x}/{}", key, slot, parent.prefix, parent.prefix_len)));
    }
    Ok(())
}

fn check_position(at: u64, node: &Node, position: Position<'_>) -> BarResult<()> {
    match (position, node) {
        (Position::Root, Node::Branch(index)) if index.kind == NodeKind::Head => Ok(()),
        (Position::Root, other) => Err(BarError::corrupted(at, format!(
            "snapshot root is a {:?} node", other.kind()))),

        (Position::Child { .. }, Node::Branch(index)) if index.kind == NodeKind::Head => {
            Err(BarError::corrupted(at, "Head node below the root"))
        }
        (Position::Child { parent, slot }, Node::Branch(index)) => {
            if index.prefix_len <= parent.prefix_len
                || !parent.covers(index.prefix)
                || parent.slot_of(index.prefix) != slot
            {
                return Err(BarError::corrupted(at, format!(
                    "prefix {:08x}/{} does not belong in slot {} of {:08x}/{}",
                    index.prefix, index.prefix_len, slot, parent.prefix, parent.prefix_len)));
            }
            Ok(())
        }
        (Position::Child { parent, slot }, Node::Data(data)) => check_leaf_slot(at, parent, slot, data.key),
        (Position::Child { parent, slot }, Node::Bigdata(big)) => check_leaf_slot(at, parent, slot, big.key),

        (Position::Fragment { key }, Node::Data(data)) if data.key == key => Ok(()),
        (Position::Fragment { key }, other) => Err(BarError::corrupted(at, format!(
            "fragment of key {} is a {:?} node", key, other.kind()))),
    }
}
