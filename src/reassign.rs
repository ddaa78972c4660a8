//! Moving assets between nodes, and keeping every asset on at least one node.

use rusqlite::Connection;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::counts::incremental;
use crate::engine::{dedup_ids, Shared};
use crate::events::{group_by_asset, MembershipChange};
use crate::key::NodeKey;
use crate::storage;
use crate::types::{AssetId, HierarchyId, MembershipOp, NodeId, Result, TreeError};

/// Outcome of a reassignment.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ReassignReport {
    /// Destination node.
    pub target: NodeId,
    /// Assets now attached to the target.
    pub moved: Vec<AssetId>,
    /// Membership rows deleted.
    pub rows_removed: usize,
    /// Membership rows inserted.
    pub rows_added: usize,
    /// Node counters touched.
    pub nodes_updated: usize,
    /// Counts were left to a scheduled reconciliation.
    pub deferred: bool,
}

/// Replaces every membership of `assets` with a single membership on
/// `target`.
///
/// Runs under the tree lock. The rows seen when the call starts must be
/// unchanged once the lock is granted, and the snapshot taken before the
/// pre-removal notification must still match when the rows are deleted.
/// Either mismatch returns [`TreeError::Conflict`] with nothing written.
///
/// Deletes and inserts commit together, so `after_remove` observers already
/// see the target rows in place when they are notified.
pub(crate) fn reassign(
    shared: &Shared,
    assets: &[AssetId],
    target: NodeId,
) -> Result<ReassignReport> {
    let assets = dedup_ids(assets);
    let target_node = shared.store.read(|conn| storage::require_node(conn, target))?;
    let hierarchy = target_node.hierarchy_id;
    let mut report = ReassignReport {
        target,
        ..ReassignReport::default()
    };
    if assets.is_empty() {
        return Ok(report);
    }
    let observed = shared.store.read(|conn| {
        storage::ensure_assets_in(conn, hierarchy, &assets)?;
        storage::memberships_of_assets(conn, &assets)
    })?;

    let _lease = shared.lease(hierarchy)?;
    let snapshot = shared
        .store
        .read(|conn| storage::memberships_of_assets(conn, &assets))?;
    if snapshot != observed {
        warn!(
            hierarchy = %hierarchy,
            observed = observed.len(),
            current = snapshot.len(),
            "tree.reassign.conflict"
        );
        return Err(TreeError::Conflict {
            expected: observed.len(),
            actual: snapshot.len(),
        });
    }
    let removed = group_by_asset(snapshot.iter().copied());
    shared.observers.before_remove(hierarchy, &removed);

    let propagate = shared.propagates(snapshot.len() + assets.len());
    let (added, nodes_updated) = shared.store.write(|tx| {
        let target = storage::require_node(tx, target)?;
        let mut deleted = 0;
        for (asset, node) in &snapshot {
            deleted += storage::delete_membership(tx, *asset, *node)?;
        }
        if deleted != snapshot.len() {
            warn!(
                hierarchy = %hierarchy,
                expected = snapshot.len(),
                actual = deleted,
                "tree.reassign.conflict"
            );
            return Err(TreeError::Conflict {
                expected: snapshot.len(),
                actual: deleted,
            });
        }

        let mut nodes_updated = 0;
        if propagate {
            let ids = dedup_ids(&snapshot.iter().map(|(_, node)| *node).collect::<Vec<_>>());
            let keys: FxHashMap<NodeId, NodeKey> = storage::nodes_by_ids(tx, &ids)?
                .into_iter()
                .map(|node| (node.id, node.key))
                .collect();
            for change in &removed {
                let lost: Vec<NodeKey> = change
                    .node_ids
                    .iter()
                    .filter_map(|id| keys.get(id).cloned())
                    .collect();
                nodes_updated += incremental::propagate_asset_batch(
                    tx,
                    hierarchy,
                    change.asset_id,
                    &lost,
                    MembershipOp::Remove,
                )?;
            }
        }
        let (added, outcome) = incremental::add_to_node(tx, &target, &assets, propagate)?;
        if !propagate {
            storage::mark_reconcile_pending(tx, hierarchy)?;
        }
        Ok((added, nodes_updated + outcome.nodes_updated))
    })?;

    shared.observers.after_remove(hierarchy, &removed);
    let added_changes: Vec<MembershipChange> = added
        .iter()
        .map(|asset| MembershipChange {
            asset_id: *asset,
            node_ids: vec![target],
        })
        .collect();
    shared.observers.after_add(hierarchy, &added_changes);

    report.rows_removed = snapshot.len();
    report.rows_added = added.len();
    report.moved = assets;
    report.nodes_updated = nodes_updated;
    if !propagate {
        shared.defer(hierarchy, snapshot.len() + report.moved.len());
        report.deferred = true;
    }
    info!(
        hierarchy = %hierarchy,
        target = %target_node.key,
        assets = report.moved.len(),
        rows_removed = report.rows_removed,
        "tree.reassign.complete"
    );
    Ok(report)
}

/// Attaches any of `candidates` left without a membership to the hierarchy
/// root. Returns the rows that were added.
pub(crate) fn rehome_orphans(
    conn: &Connection,
    hierarchy: HierarchyId,
    candidates: &[AssetId],
    propagate: bool,
) -> Result<Vec<MembershipChange>> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }
    let orphans = storage::orphan_assets(conn, hierarchy, Some(candidates))?;
    if orphans.is_empty() {
        return Ok(Vec::new());
    }
    let Some(root) = storage::root_node(conn, hierarchy)? else {
        error!(hierarchy = %hierarchy, orphans = orphans.len(), "tree.asset.orphan_without_root");
        return Err(TreeError::Corruption(format!(
            "hierarchy {hierarchy} has no root for {} orphan assets",
            orphans.len()
        )));
    };
    let (added, _) = incremental::add_to_node(conn, &root, &orphans, propagate)?;
    info!(
        hierarchy = %hierarchy,
        root = %root.key,
        assets = added.len(),
        "tree.asset.orphans_rehomed"
    );
    Ok(added
        .into_iter()
        .map(|asset| MembershipChange {
            asset_id: asset,
            node_ids: vec![root.id],
        })
        .collect())
}
