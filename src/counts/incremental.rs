//! Incremental maintenance of cached subtree counts.
//!
//! Every function here runs inside the caller's store transaction. ADD
//! propagation reads membership state before the new rows are inserted;
//! REMOVE propagation reads it after the old rows are deleted. Either way a
//! walk up the ancestor chain stops at the first node that already sees the
//! asset(s) through an unrelated branch, because every strict ancestor of
//! that node sees them too.

use std::collections::BTreeSet;

use rusqlite::Connection;
use tracing::trace;

use crate::key::{collapse_to_deepest, AncestorOrder, NodeKey};
use crate::storage;
use crate::types::{AssetId, HierarchyId, MembershipOp, Node, Result};

/// Row and counter changes made for one membership batch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Propagation {
    /// Membership rows actually inserted or deleted.
    pub rows_changed: usize,
    /// Node counters touched.
    pub nodes_updated: usize,
}

/// One node, many assets: adjusts `key` and its ancestors.
///
/// For ADD, `assets` must not yet be attached to `key`; for REMOVE their rows
/// must already be gone.
pub(crate) fn propagate_node_batch(
    conn: &Connection,
    hierarchy: HierarchyId,
    key: &NodeKey,
    assets: &[AssetId],
    op: MembershipOp,
) -> Result<usize> {
    let mut remaining: Vec<AssetId> = assets.to_vec();
    let mut updated = 0;
    for ancestor in key.ancestors(true, AncestorOrder::SelfToRoot) {
        let present = storage::assets_in_subtree(conn, hierarchy, &ancestor, &remaining)?;
        remaining.retain(|asset| !present.contains(asset));
        if remaining.is_empty() {
            break;
        }
        let delta = op.sign() * remaining.len() as i64;
        updated += storage::add_assets_amount(conn, hierarchy, std::slice::from_ref(&ancestor), delta)?;
        trace!(key = %ancestor, delta, "tree.counts.node_batch");
    }
    Ok(updated)
}

/// One asset, many nodes: adjusts every affected key and its ancestors,
/// visiting each ancestor at most once.
pub(crate) fn propagate_asset_batch(
    conn: &Connection,
    hierarchy: HierarchyId,
    asset: AssetId,
    keys: &[NodeKey],
    op: MembershipOp,
) -> Result<usize> {
    let mut pending: BTreeSet<NodeKey> = BTreeSet::new();
    for key in keys {
        pending.extend(key.ancestors(false, AncestorOrder::SelfToRoot));
    }
    let deepest = collapse_to_deepest(keys.iter().cloned());

    let mut to_update: Vec<NodeKey> = Vec::new();
    for key in deepest {
        if storage::asset_in_subtree(conn, hierarchy, &key, asset)? {
            settle_chain(key.parent(), &mut pending);
            continue;
        }
        let mut parent = key.parent();
        to_update.push(key);
        while let Some(current) = parent {
            if !pending.contains(&current) {
                break;
            }
            if storage::asset_in_subtree(conn, hierarchy, &current, asset)? {
                settle_chain(Some(current), &mut pending);
                break;
            }
            pending.remove(&current);
            parent = current.parent();
            to_update.push(current);
        }
    }
    trace!(asset = %asset, nodes = to_update.len(), op = %op, "tree.counts.asset_batch");
    storage::add_assets_amount(conn, hierarchy, &to_update, op.sign())
}

/// Marks `start` and its not-yet-settled ancestors as already correct.
fn settle_chain(start: Option<NodeKey>, pending: &mut BTreeSet<NodeKey>) {
    let mut current = start;
    while let Some(key) = current {
        if !pending.remove(&key) {
            break;
        }
        current = key.parent();
    }
}

/// Attaches `assets` to `node`, skipping pairs that already exist.
/// Returns the assets that were newly attached.
pub(crate) fn add_to_node(
    conn: &Connection,
    node: &Node,
    assets: &[AssetId],
    propagate: bool,
) -> Result<(Vec<AssetId>, Propagation)> {
    let existing = storage::attached_to_node(conn, node.id, assets)?;
    let mut fresh: Vec<AssetId> = Vec::with_capacity(assets.len());
    for asset in assets {
        if !existing.contains(asset) && !fresh.contains(asset) {
            fresh.push(*asset);
        }
    }
    let mut outcome = Propagation::default();
    if fresh.is_empty() {
        return Ok((fresh, outcome));
    }
    if propagate {
        outcome.nodes_updated =
            propagate_node_batch(conn, node.hierarchy_id, &node.key, &fresh, MembershipOp::Add)?;
    }
    for asset in &fresh {
        if storage::insert_membership(conn, *asset, node.id)? {
            outcome.rows_changed += 1;
        }
    }
    Ok((fresh, outcome))
}

/// Detaches `assets` from `node`, skipping pairs that do not exist.
/// Returns the assets that were actually detached.
pub(crate) fn remove_from_node(
    conn: &Connection,
    node: &Node,
    assets: &[AssetId],
    propagate: bool,
) -> Result<(Vec<AssetId>, Propagation)> {
    let mut removed = Vec::with_capacity(assets.len());
    let mut outcome = Propagation::default();
    for asset in assets {
        if storage::delete_membership(conn, *asset, node.id)? == 1 {
            removed.push(*asset);
            outcome.rows_changed += 1;
        }
    }
    if propagate && !removed.is_empty() {
        outcome.nodes_updated = propagate_node_batch(
            conn,
            node.hierarchy_id,
            &node.key,
            &removed,
            MembershipOp::Remove,
        )?;
    }
    Ok((removed, outcome))
}

/// Attaches one asset to several nodes of one hierarchy.
/// Returns the nodes that newly gained the asset.
pub(crate) fn add_to_nodes(
    conn: &Connection,
    hierarchy: HierarchyId,
    asset: AssetId,
    nodes: &[Node],
    propagate: bool,
) -> Result<(Vec<Node>, Propagation)> {
    let current = storage::nodes_of_asset(conn, asset)?;
    let mut fresh: Vec<Node> = Vec::with_capacity(nodes.len());
    for node in nodes {
        if !current.contains(&node.id) && !fresh.iter().any(|n| n.id == node.id) {
            fresh.push(node.clone());
        }
    }
    let mut outcome = Propagation::default();
    if fresh.is_empty() {
        return Ok((fresh, outcome));
    }
    if propagate {
        let keys: Vec<NodeKey> = fresh.iter().map(|n| n.key.clone()).collect();
        outcome.nodes_updated =
            propagate_asset_batch(conn, hierarchy, asset, &keys, MembershipOp::Add)?;
    }
    for node in &fresh {
        if storage::insert_membership(conn, asset, node.id)? {
            outcome.rows_changed += 1;
        }
    }
    Ok((fresh, outcome))
}

/// Detaches one asset from several nodes of one hierarchy.
/// Returns the nodes that actually lost the asset.
pub(crate) fn remove_from_nodes(
    conn: &Connection,
    hierarchy: HierarchyId,
    asset: AssetId,
    nodes: &[Node],
    propagate: bool,
) -> Result<(Vec<Node>, Propagation)> {
    let mut removed: Vec<Node> = Vec::with_capacity(nodes.len());
    let mut outcome = Propagation::default();
    for node in nodes {
        if storage::delete_membership(conn, asset, node.id)? == 1 {
            removed.push(node.clone());
            outcome.rows_changed += 1;
        }
    }
    if propagate && !removed.is_empty() {
        let keys: Vec<NodeKey> = removed.iter().map(|n| n.key.clone()).collect();
        outcome.nodes_updated =
            propagate_asset_batch(conn, hierarchy, asset, &keys, MembershipOp::Remove)?;
    }
    Ok((removed, outcome))
}
