use std::collections::BTreeMap;
use std::hash::Hash;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use rustc_hash::FxHashSet;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::config::TreeOptions;
use crate::counts::{aggregate, incremental};
use crate::events::{MembershipChange, MembershipObserver, Observers};
use crate::key::{collapse_to_topmost, next_child_key, next_root_key, NodeKey};
use crate::lock::{LockSnapshot, TreeLease, TreeLock};
use crate::reassign::{self, ReassignReport};
use crate::reconcile::{
    self, PeriodicReconcile, ReconcileMode, ReconcileQueue, ReconcileReport, ReconcileRunner,
};
use crate::storage::{self, Store};
use crate::types::{Asset, AssetId, Hierarchy, HierarchyId, Node, NodeId, Result, TreeError};

/// Rows changed by a membership edit.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MembershipOutcome {
    /// Rows actually inserted or deleted, grouped by asset. Requests for rows
    /// that already existed (or were already gone) are not listed.
    pub changes: Vec<MembershipChange>,
    /// Assets that lost their last node and were attached to the root.
    pub rehomed: Vec<MembershipChange>,
    /// Node counters touched.
    pub nodes_updated: usize,
    /// Counts were left to a scheduled reconciliation.
    pub deferred: bool,
}

impl MembershipOutcome {
    /// Number of membership rows inserted or deleted.
    pub fn rows_changed(&self) -> usize {
        self.changes.iter().map(|c| c.node_ids.len()).sum()
    }
}

pub(crate) struct Shared {
    pub(crate) store: Store,
    pub(crate) lock: TreeLock,
    pub(crate) opts: TreeOptions,
    pub(crate) observers: Observers,
    pub(crate) queue: ReconcileQueue,
}

impl Shared {
    pub(crate) fn lease(&self, hierarchy: HierarchyId) -> Result<TreeLease> {
        self.lock.acquire(hierarchy, self.opts.lock_acquire_timeout)
    }

    pub(crate) fn propagates(&self, batch: usize) -> bool {
        batch <= self.opts.incremental_batch_limit
    }

    pub(crate) fn defer(&self, hierarchy: HierarchyId, batch: usize) {
        info!(
            hierarchy = %hierarchy,
            batch,
            limit = self.opts.incremental_batch_limit,
            "tree.counts.deferred"
        );
        self.queue.schedule(hierarchy);
    }

    fn reconcile(&self, hierarchy: HierarchyId, mode: ReconcileMode) -> Result<ReconcileReport> {
        self.store
            .read(|conn| storage::get_hierarchy(conn, hierarchy))?
            .ok_or(TreeError::NotFound("hierarchy"))?;
        match mode {
            ReconcileMode::Repair => {
                let _lease = self.lease(hierarchy)?;
                self.store
                    .write(|tx| reconcile::reconcile(tx, hierarchy, mode))
            }
            ReconcileMode::CheckOnly => self
                .store
                .read(|conn| reconcile::reconcile(conn, hierarchy, mode)),
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        for hierarchy in self.queue.take_pending() {
            match self.reconcile(hierarchy, ReconcileMode::Repair) {
                Ok(report) => debug!(
                    hierarchy = %hierarchy,
                    drift = report.drift.len(),
                    "tree.reconcile.flushed_on_close"
                ),
                Err(err) => error!(
                    hierarchy = %hierarchy,
                    error = %err,
                    "tree.reconcile.close_failed"
                ),
            }
        }
    }
}

/// Node tree with cached per-node subtree asset counts.
///
/// Cloning is cheap; clones share the store, the tree lock, observers and
/// the reconcile queue.
#[derive(Clone)]
pub struct AssetTree {
    shared: Arc<Shared>,
}

impl AssetTree {
    /// Opens (creating if needed) a database file.
    pub fn open(path: impl AsRef<Path>, opts: TreeOptions) -> Result<Self> {
        let store = Store::open(path, &opts)?;
        Self::with_store(store, opts)
    }

    /// Opens a private in-memory tree.
    pub fn open_in_memory(opts: TreeOptions) -> Result<Self> {
        Self::with_store(Store::open_in_memory()?, opts)
    }

    /// Wraps an already opened store.
    ///
    /// Hierarchies whose deferred counts were never reconciled (the process
    /// exited first) are repaired before this returns.
    pub fn with_store(store: Store, opts: TreeOptions) -> Result<Self> {
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            let runner: ReconcileRunner =
                Arc::new(move |hierarchy: HierarchyId| -> Result<()> {
                    match weak.upgrade() {
                        Some(shared) => shared
                            .reconcile(hierarchy, ReconcileMode::Repair)
                            .map(|_| ()),
                        None => {
                            error!(hierarchy = %hierarchy, "tree.reconcile.queue.tree_closed");
                            Err(TreeError::Invalid(
                                "tree closed before reconciliation ran".to_string(),
                            ))
                        }
                    }
                });
            Shared {
                store,
                lock: TreeLock::new(),
                queue: ReconcileQueue::new(opts.coalesce_window, runner),
                observers: Observers::default(),
                opts,
            }
        });
        for hierarchy in shared.store.read(storage::pending_reconciles)? {
            let report = shared.reconcile(hierarchy, ReconcileMode::Repair)?;
            info!(
                hierarchy = %hierarchy,
                drift = report.drift.len(),
                "tree.reconcile.recovered"
            );
        }
        Ok(Self { shared })
    }

    /// Options this tree was opened with.
    pub fn options(&self) -> &TreeOptions {
        &self.shared.opts
    }

    /// The tree lock, for diagnostics and external coordination.
    pub fn tree_lock(&self) -> &TreeLock {
        &self.shared.lock
    }

    /// Hierarchies whose tree lock is currently held.
    pub fn lock_snapshot(&self) -> LockSnapshot {
        self.shared.lock.snapshot()
    }

    /// Registers an observer for membership changes.
    pub fn subscribe(&self, observer: Arc<dyn MembershipObserver>) {
        self.shared.observers.subscribe(observer);
    }

    // ----- hierarchies and nodes -------------------------------------------

    /// Creates a hierarchy and its root node, whose value is `name`.
    pub fn create_hierarchy(&self, name: &str) -> Result<(Hierarchy, Node)> {
        let name = validate_value(name)?;
        let (hierarchy, root) = self.shared.store.write(|tx| {
            let id = storage::insert_hierarchy(tx, &name)?;
            let existing = storage::all_root_keys(tx)?;
            let key = next_root_key(existing.iter());
            let full_value = format!("/{name}");
            let node_id = storage::insert_node(tx, id, &key, &name, &full_value)?;
            let root = Node {
                id: node_id,
                hierarchy_id: id,
                key,
                value: name.clone(),
                full_value,
                assets_amount: 0,
            };
            Ok((Hierarchy { id, name: name.clone() }, root))
        })?;
        info!(hierarchy = %hierarchy.id, root = %root.key, "tree.hierarchy.created");
        Ok((hierarchy, root))
    }

    /// Looks up a hierarchy.
    pub fn hierarchy(&self, id: HierarchyId) -> Result<Option<Hierarchy>> {
        self.shared.store.read(|conn| storage::get_hierarchy(conn, id))
    }

    /// Every hierarchy, by id.
    pub fn hierarchies(&self) -> Result<Vec<Hierarchy>> {
        self.shared.store.read(storage::list_hierarchies)
    }

    /// The hierarchy's root node.
    pub fn root(&self, hierarchy: HierarchyId) -> Result<Node> {
        self.shared
            .store
            .read(|conn| storage::root_node(conn, hierarchy))?
            .ok_or(TreeError::NotFound("root node"))
    }

    /// Looks up a node by id.
    pub fn node(&self, id: NodeId) -> Result<Option<Node>> {
        self.shared.store.read(|conn| storage::get_node(conn, id))
    }

    /// Looks up a node by key.
    pub fn node_by_key(&self, hierarchy: HierarchyId, key: &NodeKey) -> Result<Option<Node>> {
        self.shared
            .store
            .read(|conn| storage::get_node_by_key(conn, hierarchy, key))
    }

    /// Direct children of a node, ordered by key.
    pub fn children(&self, id: NodeId) -> Result<Vec<Node>> {
        self.shared.store.read(|conn| {
            let node = storage::require_node(conn, id)?;
            storage::children(conn, node.hierarchy_id, &node.key)
        })
    }

    /// Every node of a hierarchy, ordered by key.
    pub fn nodes(&self, hierarchy: HierarchyId) -> Result<Vec<Node>> {
        self.shared
            .store
            .read(|conn| storage::list_nodes(conn, hierarchy))
    }

    /// Creates a child under `parent`.
    ///
    /// With no value the child is named after the options' preset
    /// ("New node N"). A value already used by a sibling is rejected.
    pub fn create_child_node(&self, parent: NodeId, value: Option<&str>) -> Result<Node> {
        let hierarchy = self.hierarchy_of_node(parent)?;
        let _lease = self.shared.lease(hierarchy)?;
        let node = self.shared.store.write(|tx| {
            let parent = storage::require_node(tx, parent)?;
            let siblings = storage::children(tx, hierarchy, &parent.key)?;
            let value = match value {
                Some(value) => {
                    let value = validate_value(value)?;
                    if siblings.iter().any(|s| s.value == value) {
                        return Err(TreeError::DuplicateSibling {
                            parent: parent.key.clone(),
                            value,
                        });
                    }
                    value
                }
                None => preset_value(&self.shared.opts.new_node_name, &siblings),
            };
            insert_child(tx, &parent, &siblings, value)
        })?;
        info!(hierarchy = %hierarchy, key = %node.key, "tree.node.created");
        Ok(node)
    }

    /// Returns the child of `parent` named `value`, creating it if needed.
    /// The flag is true when the node was created.
    pub fn get_or_create_child(&self, parent: NodeId, value: &str) -> Result<(Node, bool)> {
        let value = validate_value(value)?;
        let hierarchy = self.hierarchy_of_node(parent)?;
        let _lease = self.shared.lease(hierarchy)?;
        let (node, created) = self.shared.store.write(|tx| {
            let parent = storage::require_node(tx, parent)?;
            get_or_insert_child(tx, &parent, &value)
        })?;
        if created {
            info!(hierarchy = %hierarchy, key = %node.key, "tree.node.created");
        }
        Ok((node, created))
    }

    /// Ensures every node along `/a/b/c` exists under the root and returns
    /// the last one. A leading segment equal to the root's value is skipped.
    pub fn create_nodes_by_full_value(&self, hierarchy: HierarchyId, path: &str) -> Result<Node> {
        let _lease = self.shared.lease(hierarchy)?;
        let (node, created) = self.shared.store.write(|tx| {
            let root = storage::root_node(tx, hierarchy)?.ok_or(TreeError::NotFound("root node"))?;
            let mut values: Vec<&str> = path
                .split('/')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .collect();
            if values.first() == Some(&root.value.as_str()) {
                values.remove(0);
            }
            let mut current = root;
            let mut created = 0;
            for value in values {
                let (child, fresh) = get_or_insert_child(tx, &current, value)?;
                created += usize::from(fresh);
                current = child;
            }
            Ok((current, created))
        })?;
        debug!(hierarchy = %hierarchy, key = %node.key, created, "tree.node.path_ensured");
        Ok(node)
    }

    /// Deletes a node that has no children and no direct assets. Roots cannot
    /// be deleted.
    pub fn delete_node(&self, id: NodeId) -> Result<()> {
        let hierarchy = self.hierarchy_of_node(id)?;
        let _lease = self.shared.lease(hierarchy)?;
        let key = self.shared.store.write(|tx| {
            let node = storage::require_node(tx, id)?;
            if node.is_root() {
                return Err(TreeError::Invalid(format!(
                    "node {} is a hierarchy root",
                    node.key
                )));
            }
            if storage::has_children(tx, hierarchy, &node.key)?
                || !storage::direct_assets(tx, node.id)?.is_empty()
            {
                return Err(TreeError::NodeNotEmpty(node.key));
            }
            storage::delete_node_row(tx, node.id)?;
            Ok(node.key)
        })?;
        info!(hierarchy = %hierarchy, key = %key, "tree.node.deleted");
        Ok(())
    }

    // ----- assets ----------------------------------------------------------

    /// Creates an asset attached to `nodes`, or to the hierarchy root when
    /// `nodes` is empty.
    pub fn create_asset(&self, hierarchy: HierarchyId, name: &str, nodes: &[NodeId]) -> Result<Asset> {
        let name = validate_value(name)?;
        let node_ids = dedup_ids(nodes);
        let propagate = self.shared.propagates(node_ids.len());
        let (asset, attached) = self.shared.store.write(|tx| {
            storage::get_hierarchy(tx, hierarchy)?.ok_or(TreeError::NotFound("hierarchy"))?;
            let targets = if node_ids.is_empty() {
                vec![storage::root_node(tx, hierarchy)?.ok_or(TreeError::NotFound("root node"))?]
            } else {
                load_nodes_in(tx, hierarchy, &node_ids)?
            };
            let id = storage::insert_asset(tx, hierarchy, &name)?;
            let (attached, _) = incremental::add_to_nodes(tx, hierarchy, id, &targets, propagate)?;
            if !propagate {
                storage::mark_reconcile_pending(tx, hierarchy)?;
            }
            let asset = Asset {
                id,
                hierarchy_id: hierarchy,
                name: name.clone(),
            };
            Ok((asset, attached))
        })?;
        if !propagate {
            self.shared.defer(hierarchy, node_ids.len());
        }
        let change = MembershipChange {
            asset_id: asset.id,
            node_ids: attached.iter().map(|n| n.id).collect(),
        };
        self.shared
            .observers
            .after_add(hierarchy, std::slice::from_ref(&change));
        debug!(hierarchy = %hierarchy, asset = %asset.id, "tree.asset.created");
        Ok(asset)
    }

    /// Looks up an asset.
    pub fn asset(&self, id: AssetId) -> Result<Option<Asset>> {
        self.shared.store.read(|conn| storage::get_asset(conn, id))
    }

    /// Nodes the asset is directly attached to.
    pub fn asset_nodes(&self, id: AssetId) -> Result<Vec<NodeId>> {
        self.shared.store.read(|conn| storage::nodes_of_asset(conn, id))
    }

    /// Assets directly attached to a node.
    pub fn direct_assets(&self, node: NodeId) -> Result<Vec<AssetId>> {
        self.shared.store.read(|conn| storage::direct_assets(conn, node))
    }

    /// Deletes an asset and all of its memberships, keeping counts current.
    pub fn delete_asset(&self, id: AssetId) -> Result<()> {
        let (asset, current) = self.shared.store.read(|conn| {
            let asset = storage::get_asset(conn, id)?.ok_or(TreeError::NotFound("asset"))?;
            Ok((asset, storage::nodes_of_asset(conn, id)?))
        })?;
        let hierarchy = asset.hierarchy_id;
        let planned = vec![MembershipChange {
            asset_id: id,
            node_ids: current,
        }];
        self.shared.observers.before_remove(hierarchy, &planned);
        let (removed, deferred) = self.shared.store.write(|tx| {
            let ids = storage::nodes_of_asset(tx, id)?;
            let nodes = storage::nodes_by_ids(tx, &ids)?;
            let propagate = self.shared.propagates(nodes.len());
            let (removed, _) = incremental::remove_from_nodes(tx, hierarchy, id, &nodes, propagate)?;
            storage::delete_asset_row(tx, id)?;
            if !propagate {
                storage::mark_reconcile_pending(tx, hierarchy)?;
            }
            Ok((removed, !propagate))
        })?;
        if deferred {
            self.shared.defer(hierarchy, removed.len());
        }
        let change = MembershipChange {
            asset_id: id,
            node_ids: removed.iter().map(|n| n.id).collect(),
        };
        self.shared
            .observers
            .after_remove(hierarchy, std::slice::from_ref(&change));
        debug!(hierarchy = %hierarchy, asset = %id, "tree.asset.deleted");
        Ok(())
    }

    /// Attaches assets to one node.
    pub fn attach_assets(&self, node: NodeId, assets: &[AssetId]) -> Result<MembershipOutcome> {
        let assets = dedup_ids(assets);
        if assets.is_empty() {
            return Ok(MembershipOutcome::default());
        }
        let propagate = self.shared.propagates(assets.len());
        let (hierarchy, mut outcome) = self.shared.store.write(|tx| {
            let node = storage::require_node(tx, node)?;
            storage::ensure_assets_in(tx, node.hierarchy_id, &assets)?;
            let (added, counts) = incremental::add_to_node(tx, &node, &assets, propagate)?;
            if !propagate {
                storage::mark_reconcile_pending(tx, node.hierarchy_id)?;
            }
            let outcome = MembershipOutcome {
                changes: per_asset(&added, node.id),
                nodes_updated: counts.nodes_updated,
                ..MembershipOutcome::default()
            };
            Ok((node.hierarchy_id, outcome))
        })?;
        if !propagate {
            self.shared.defer(hierarchy, assets.len());
            outcome.deferred = true;
        }
        self.shared.observers.after_add(hierarchy, &outcome.changes);
        debug!(hierarchy = %hierarchy, node = %node, rows = outcome.rows_changed(), "tree.assets.attached");
        Ok(outcome)
    }

    /// Detaches assets from one node. Assets left without any node are
    /// attached to the hierarchy root.
    pub fn detach_assets(&self, node: NodeId, assets: &[AssetId]) -> Result<MembershipOutcome> {
        let assets = dedup_ids(assets);
        if assets.is_empty() {
            return Ok(MembershipOutcome::default());
        }
        let (hierarchy, attached) = self.shared.store.read(|conn| {
            let found = storage::require_node(conn, node)?;
            let attached = storage::attached_to_node(conn, node, &assets)?;
            Ok((found.hierarchy_id, attached))
        })?;
        let planned: Vec<AssetId> = assets.iter().copied().filter(|a| attached.contains(a)).collect();
        self.shared
            .observers
            .before_remove(hierarchy, &per_asset(&planned, node));

        let propagate = self.shared.propagates(assets.len());
        let mut outcome = self.shared.store.write(|tx| {
            let node = storage::require_node(tx, node)?;
            let (removed, counts) = incremental::remove_from_node(tx, &node, &assets, propagate)?;
            let rehomed = reassign::rehome_orphans(tx, hierarchy, &removed, propagate)?;
            if !propagate {
                storage::mark_reconcile_pending(tx, hierarchy)?;
            }
            Ok(MembershipOutcome {
                changes: per_asset(&removed, node.id),
                rehomed,
                nodes_updated: counts.nodes_updated,
                deferred: false,
            })
        })?;
        if !propagate {
            self.shared.defer(hierarchy, assets.len());
            outcome.deferred = true;
        }
        self.shared.observers.after_remove(hierarchy, &outcome.changes);
        self.shared.observers.after_add(hierarchy, &outcome.rehomed);
        debug!(hierarchy = %hierarchy, node = %node, rows = outcome.rows_changed(), "tree.assets.detached");
        Ok(outcome)
    }

    /// Attaches one asset to several nodes of its hierarchy.
    pub fn attach_asset_to_nodes(&self, asset: AssetId, nodes: &[NodeId]) -> Result<MembershipOutcome> {
        let ids = dedup_ids(nodes);
        if ids.is_empty() {
            return Ok(MembershipOutcome::default());
        }
        let propagate = self.shared.propagates(ids.len());
        let (hierarchy, mut outcome) = self.shared.store.write(|tx| {
            let found = storage::get_asset(tx, asset)?.ok_or(TreeError::NotFound("asset"))?;
            let targets = load_nodes_in(tx, found.hierarchy_id, &ids)?;
            let (added, counts) =
                incremental::add_to_nodes(tx, found.hierarchy_id, asset, &targets, propagate)?;
            if !propagate {
                storage::mark_reconcile_pending(tx, found.hierarchy_id)?;
            }
            Ok((
                found.hierarchy_id,
                MembershipOutcome {
                    changes: per_node(asset, &added),
                    nodes_updated: counts.nodes_updated,
                    ..MembershipOutcome::default()
                },
            ))
        })?;
        if !propagate {
            self.shared.defer(hierarchy, ids.len());
            outcome.deferred = true;
        }
        self.shared.observers.after_add(hierarchy, &outcome.changes);
        Ok(outcome)
    }

    /// Detaches one asset from several nodes. If that leaves it without any
    /// node it is attached to the hierarchy root.
    pub fn detach_asset_from_nodes(&self, asset: AssetId, nodes: &[NodeId]) -> Result<MembershipOutcome> {
        let ids = dedup_ids(nodes);
        if ids.is_empty() {
            return Ok(MembershipOutcome::default());
        }
        let (hierarchy, current) = self.shared.store.read(|conn| {
            let found = storage::get_asset(conn, asset)?.ok_or(TreeError::NotFound("asset"))?;
            Ok((found.hierarchy_id, storage::nodes_of_asset(conn, asset)?))
        })?;
        let planned: Vec<NodeId> = ids.iter().copied().filter(|n| current.contains(n)).collect();
        if !planned.is_empty() {
            let change = MembershipChange {
                asset_id: asset,
                node_ids: planned,
            };
            self.shared
                .observers
                .before_remove(hierarchy, std::slice::from_ref(&change));
        }

        let propagate = self.shared.propagates(ids.len());
        let mut outcome = self.shared.store.write(|tx| {
            let targets = load_nodes_in(tx, hierarchy, &ids)?;
            let (removed, counts) =
                incremental::remove_from_nodes(tx, hierarchy, asset, &targets, propagate)?;
            let rehomed = if removed.is_empty() {
                Vec::new()
            } else {
                reassign::rehome_orphans(tx, hierarchy, &[asset], propagate)?
            };
            if !propagate {
                storage::mark_reconcile_pending(tx, hierarchy)?;
            }
            Ok(MembershipOutcome {
                changes: per_node(asset, &removed),
                rehomed,
                nodes_updated: counts.nodes_updated,
                deferred: false,
            })
        })?;
        if !propagate {
            self.shared.defer(hierarchy, ids.len());
            outcome.deferred = true;
        }
        self.shared.observers.after_remove(hierarchy, &outcome.changes);
        self.shared.observers.after_add(hierarchy, &outcome.rehomed);
        Ok(outcome)
    }

    /// Moves assets from wherever they are to `target`.
    ///
    /// Both post-change notifications fire after the single commit, so an
    /// `after_remove` observer sees the post-insert state.
    pub fn reassign_assets(&self, assets: &[AssetId], target: NodeId) -> Result<ReassignReport> {
        reassign::reassign(&self.shared, assets, target)
    }

    // ----- counts ----------------------------------------------------------

    /// Distinct assets in the node's subtree, recomputed from memberships
    /// without consulting the cache.
    pub fn subtree_asset_count(&self, node: NodeId) -> Result<usize> {
        self.shared.store.read(|conn| {
            let node = storage::require_node(conn, node)?;
            let keys = storage::subtree_nodes(conn, node.hierarchy_id, &node.key)?
                .into_iter()
                .map(|n| n.key);
            let pairs = storage::keyed_pairs(conn, node.hierarchy_id, Some(&node.key))?;
            Ok(aggregate(keys, pairs, false).count(&node.key).unwrap_or(0))
        })
    }

    /// Distinct asset ids in the node's subtree, ascending.
    pub fn node_asset_ids(&self, node: NodeId) -> Result<Vec<AssetId>> {
        self.shared.store.read(|conn| {
            let node = storage::require_node(conn, node)?;
            let keys = storage::subtree_nodes(conn, node.hierarchy_id, &node.key)?
                .into_iter()
                .map(|n| n.key);
            let pairs = storage::keyed_pairs(conn, node.hierarchy_id, Some(&node.key))?;
            let totals = aggregate(keys, pairs, true);
            let mut ids: Vec<AssetId> = totals
                .assets(&node.key)
                .map(|set| set.iter().copied().collect())
                .unwrap_or_default();
            ids.sort();
            Ok(ids)
        })
    }

    /// Distinct assets anywhere under any of `nodes`, ascending. Nested
    /// selections are walked once.
    pub fn assets_under(&self, nodes: &[NodeId]) -> Result<Vec<AssetId>> {
        let ids = dedup_ids(nodes);
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.shared.store.read(|conn| {
            let hierarchy = storage::require_node(conn, ids[0])?.hierarchy_id;
            let found = load_nodes_in(conn, hierarchy, &ids)?;
            let mut assets = FxHashSet::default();
            for key in collapse_to_topmost(found.into_iter().map(|n| n.key)) {
                for (_, asset) in storage::keyed_pairs(conn, hierarchy, Some(&key))? {
                    assets.insert(asset);
                }
            }
            let mut out: Vec<AssetId> = assets.into_iter().collect();
            out.sort();
            Ok(out)
        })
    }

    /// Every node's recomputed subtree count, keyed by node key.
    pub fn computed_counts(&self, hierarchy: HierarchyId) -> Result<BTreeMap<NodeKey, usize>> {
        self.shared.store.read(|conn| {
            let keys = storage::list_nodes(conn, hierarchy)?.into_iter().map(|n| n.key);
            let pairs = storage::keyed_pairs(conn, hierarchy, None)?;
            Ok(aggregate(keys, pairs, false).counts().clone())
        })
    }

    // ----- reconciliation --------------------------------------------------

    /// Recomputes every count of the hierarchy under the tree lock and fixes
    /// the ones that drifted.
    pub fn run_reconciliation(&self, hierarchy: HierarchyId) -> Result<ReconcileReport> {
        self.shared.reconcile(hierarchy, ReconcileMode::Repair)
    }

    /// Reports drift and structural problems without writing.
    pub fn check_consistency(&self, hierarchy: HierarchyId) -> Result<ReconcileReport> {
        self.shared.reconcile(hierarchy, ReconcileMode::CheckOnly)
    }

    /// Queues a reconciliation; requests within the coalesce window merge.
    pub fn schedule_reconciliation(&self, hierarchy: HierarchyId) -> bool {
        self.shared.queue.schedule(hierarchy)
    }

    /// Runs every queued reconciliation now and waits for them.
    pub fn flush_reconciliation(&self) {
        self.shared.queue.flush();
    }

    /// Hierarchies with deferred counts that no reconciliation has repaired
    /// yet. Persisted, so this survives reopening the database.
    pub fn pending_reconciliations(&self) -> Result<Vec<HierarchyId>> {
        self.shared.store.read(storage::pending_reconciles)
    }

    /// The reconcile queue.
    pub fn reconcile_queue(&self) -> &ReconcileQueue {
        &self.shared.queue
    }

    /// Schedules a reconciliation of every hierarchy each `interval`. The
    /// thread stops when the handle is dropped or the tree goes away.
    pub fn spawn_periodic_reconciliation(&self, interval: Duration) -> PeriodicReconcile {
        let weak = Arc::downgrade(&self.shared);
        PeriodicReconcile::spawn(interval, move || {
            let Some(shared) = weak.upgrade() else {
                return false;
            };
            match shared.store.read(storage::list_hierarchies) {
                Ok(hierarchies) => {
                    for hierarchy in hierarchies {
                        shared.queue.schedule(hierarchy.id);
                    }
                }
                Err(err) => error!(error = %err, "tree.reconcile.periodic.failed"),
            }
            true
        })
    }

    fn hierarchy_of_node(&self, id: NodeId) -> Result<HierarchyId> {
        Ok(self
            .shared
            .store
            .read(|conn| storage::require_node(conn, id))?
            .hierarchy_id)
    }
}

/// Removes duplicate ids, keeping first occurrences in order.
pub(crate) fn dedup_ids<T: Copy + Eq + Hash>(ids: &[T]) -> Vec<T> {
    let mut seen = FxHashSet::default();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

fn validate_value(value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(TreeError::Invalid("name must not be blank".into()));
    }
    if value.contains('/') {
        return Err(TreeError::Invalid(format!("name {value:?} contains '/'")));
    }
    Ok(value.to_string())
}

/// `"{prefix} N"` with N one past the largest number already used by a
/// sibling named that way.
fn preset_value(prefix: &str, siblings: &[Node]) -> String {
    let next = siblings
        .iter()
        .filter_map(|s| s.value.strip_prefix(prefix))
        .filter_map(|rest| rest.strip_prefix(' '))
        .filter_map(|n| n.parse::<u64>().ok())
        .max()
        .map_or(1, |n| n + 1);
    format!("{prefix} {next}")
}

fn insert_child(
    conn: &rusqlite::Connection,
    parent: &Node,
    siblings: &[Node],
    value: String,
) -> Result<Node> {
    let key = next_child_key(&parent.key, siblings.iter().map(|s| &s.key));
    let full_value = format!("{}/{}", parent.full_value, value);
    let id = storage::insert_node(conn, parent.hierarchy_id, &key, &value, &full_value)?;
    Ok(Node {
        id,
        hierarchy_id: parent.hierarchy_id,
        key,
        value,
        full_value,
        assets_amount: 0,
    })
}

fn get_or_insert_child(conn: &rusqlite::Connection, parent: &Node, value: &str) -> Result<(Node, bool)> {
    let siblings = storage::children(conn, parent.hierarchy_id, &parent.key)?;
    if let Some(found) = siblings.iter().find(|s| s.value == value) {
        return Ok((found.clone(), false));
    }
    let node = insert_child(conn, parent, &siblings, validate_value(value)?)?;
    Ok((node, true))
}

/// Loads nodes by id, failing on unknown ids or ids from another hierarchy.
fn load_nodes_in(conn: &rusqlite::Connection, hierarchy: HierarchyId, ids: &[NodeId]) -> Result<Vec<Node>> {
    let nodes = storage::nodes_by_ids(conn, ids)?;
    if nodes.len() != ids.len() {
        return Err(TreeError::NotFound("node"));
    }
    if let Some(stray) = nodes.iter().find(|n| n.hierarchy_id != hierarchy) {
        return Err(TreeError::Invalid(format!(
            "node {} belongs to hierarchy {}, not {hierarchy}",
            stray.id, stray.hierarchy_id
        )));
    }
    Ok(nodes)
}

fn per_asset(assets: &[AssetId], node: NodeId) -> Vec<MembershipChange> {
    assets
        .iter()
        .map(|asset| MembershipChange {
            asset_id: *asset,
            node_ids: vec![node],
        })
        .collect()
}

fn per_node(asset: AssetId, nodes: &[Node]) -> Vec<MembershipChange> {
    if nodes.is_empty() {
        return Vec::new();
    }
    vec![MembershipChange {
        asset_id: asset,
        node_ids: nodes.iter().map(|n| n.id).collect(),
    }]
}
