//! One-pass subtree totals over a whole forest.
//!
//! Records are sorted by integer key segments so that every node comes after
//! all of its ancestors. An explicit stack then holds the current node and
//! its open ancestors; a record is popped (and finalized) as soon as the
//! sweep leaves its subtree, and its accumulated asset set is merged into the
//! new stack top. That is a post-order traversal without recursion and
//! without re-querying descendants.

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::key::NodeKey;
use crate::types::AssetId;

struct Record {
    key: NodeKey,
    assets: FxHashSet<AssetId>,
}

/// Subtree totals produced by [`aggregate`].
#[derive(Debug, Default)]
pub struct SubtreeTotals {
    counts: BTreeMap<NodeKey, usize>,
    sets: Option<FxHashMap<NodeKey, FxHashSet<AssetId>>>,
    skipped_pairs: usize,
}

impl SubtreeTotals {
    /// Distinct assets in `key`'s subtree, if `key` was part of the input.
    pub fn count(&self, key: &NodeKey) -> Option<usize> {
        self.counts.get(key).copied()
    }

    /// Every node's total, ordered by key.
    pub fn counts(&self) -> &BTreeMap<NodeKey, usize> {
        &self.counts
    }

    /// Distinct asset ids in `key`'s subtree; only kept when requested.
    pub fn assets(&self, key: &NodeKey) -> Option<&FxHashSet<AssetId>> {
        self.sets.as_ref().and_then(|sets| sets.get(key))
    }

    /// Pairs that named a key absent from the node list.
    pub fn skipped_pairs(&self) -> usize {
        self.skipped_pairs
    }

    /// Number of nodes aggregated.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// True when no nodes were aggregated.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Computes every node's subtree asset count.
///
/// `keys` lists the nodes; `pairs` lists direct `(node key, asset)`
/// attachments. Pairs naming an unknown key are ignored. With `keep_sets`
/// the per-node subtree asset sets are retained as well.
pub fn aggregate<K, P>(keys: K, pairs: P, keep_sets: bool) -> SubtreeTotals
where
    K: IntoIterator<Item = NodeKey>,
    P: IntoIterator<Item = (NodeKey, AssetId)>,
{
    let mut direct: FxHashMap<NodeKey, FxHashSet<AssetId>> = FxHashMap::default();
    for key in keys {
        direct.entry(key).or_default();
    }
    let mut skipped_pairs = 0;
    for (key, asset) in pairs {
        match direct.get_mut(&key) {
            Some(assets) => {
                assets.insert(asset);
            }
            None => skipped_pairs += 1,
        }
    }

    let mut records: Vec<Record> = direct
        .into_iter()
        .map(|(key, assets)| Record { key, assets })
        .collect();
    records.sort_unstable_by(|a, b| a.key.cmp(&b.key));

    let mut totals = SubtreeTotals {
        counts: BTreeMap::new(),
        sets: keep_sets.then(FxHashMap::default),
        skipped_pairs,
    };
    let mut stack: Vec<Record> = Vec::new();
    for record in records {
        while let Some(top) = stack.last() {
            if record.key.is_strict_descendant_of(&top.key) {
                break;
            }
            if let Some(done) = stack.pop() {
                finalize(done, &mut stack, &mut totals);
            }
        }
        stack.push(record);
    }
    while let Some(done) = stack.pop() {
        finalize(done, &mut stack, &mut totals);
    }
    totals
}

fn finalize(done: Record, stack: &mut [Record], totals: &mut SubtreeTotals) {
    totals.counts.insert(done.key.clone(), done.assets.len());
    let Record { key, mut assets } = done;
    if let Some(sets) = totals.sets.as_mut() {
        sets.insert(key, assets.clone());
    }
    if let Some(parent) = stack.last_mut() {
        if parent.assets.len() < assets.len() {
            std::mem::swap(&mut parent.assets, &mut assets);
        }
        parent.assets.extend(assets);
    }
}
