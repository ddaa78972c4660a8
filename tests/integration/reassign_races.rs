#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use nodetree::{
    AssetId, AssetTree, ChannelObserver, HierarchyId, MembershipChange, MembershipObserver,
    NodeId, NoticePhase, Result, TreeError, TreeOptions,
};

fn amount(tree: &AssetTree, id: NodeId) -> i64 {
    tree.node(id).expect("read node").expect("node exists").assets_amount
}

fn assert_no_orphans(tree: &AssetTree, assets: &[AssetId]) {
    for asset in assets {
        assert!(
            !tree.asset_nodes(*asset).expect("asset nodes").is_empty(),
            "asset {asset} has no node"
        );
    }
}

fn assert_cache_matches_bulk(tree: &AssetTree, hierarchy: HierarchyId) {
    let computed = tree.computed_counts(hierarchy).expect("computed counts");
    for node in tree.nodes(hierarchy).expect("nodes") {
        assert_eq!(node.assets_amount, computed[&node.key] as i64, "node {}", node.key);
    }
}

#[test]
fn reassign_moves_one_row_and_nets_zero_at_common_ancestor() -> Result<()> {
    let tree = AssetTree::open_in_memory(TreeOptions::default())?;
    let (org, root) = tree.create_hierarchy("Default")?;
    let left = tree.create_child_node(root.id, Some("left"))?;
    let a = tree.create_child_node(left.id, Some("A"))?;
    let right = tree.create_child_node(root.id, Some("right"))?;
    let c = tree.create_child_node(right.id, Some("C"))?;
    let x = tree.create_asset(org.id, "x", &[a.id])?.id;
    tree.create_asset(org.id, "y", &[c.id])?;

    let (observer, notices) = ChannelObserver::channel();
    tree.subscribe(Arc::new(observer));
    let root_before = amount(&tree, root.id);

    let report = tree.reassign_assets(&[x], c.id)?;
    assert_eq!(report.rows_removed, 1);
    assert_eq!(report.rows_added, 1);
    assert_eq!(report.moved, vec![x]);
    assert!(!report.deferred);

    let notices: Vec<_> = notices.try_iter().collect();
    let phases: Vec<NoticePhase> = notices.iter().map(|n| n.phase).collect();
    assert_eq!(
        phases,
        vec![NoticePhase::BeforeRemove, NoticePhase::AfterRemove, NoticePhase::AfterAdd]
    );
    let removed = vec![MembershipChange {
        asset_id: x,
        node_ids: vec![a.id],
    }];
    assert_eq!(notices[0].changes, removed);
    assert_eq!(notices[1].changes, removed);
    assert_eq!(
        notices[2].changes,
        vec![MembershipChange {
            asset_id: x,
            node_ids: vec![c.id],
        }]
    );

    assert_eq!(amount(&tree, a.id), 0);
    assert_eq!(amount(&tree, left.id), 0);
    assert_eq!(amount(&tree, c.id), 2);
    assert_eq!(amount(&tree, right.id), 2);
    assert_eq!(amount(&tree, root.id), root_before);
    assert_eq!(tree.asset_nodes(x)?, vec![c.id]);
    assert_cache_matches_bulk(&tree, org.id);
    Ok(())
}

struct RowsAtRemoval {
    tree: Mutex<Option<AssetTree>>,
    seen: Mutex<Vec<NodeId>>,
}

impl MembershipObserver for RowsAtRemoval {
    fn after_remove(&self, _hierarchy: HierarchyId, changes: &[MembershipChange]) {
        let tree = self.tree.lock().unwrap();
        let tree = tree.as_ref().expect("tree attached");
        for change in changes {
            let nodes = tree.asset_nodes(change.asset_id).expect("asset nodes");
            self.seen.lock().unwrap().extend(nodes);
        }
    }
}

#[test]
fn after_remove_observers_see_the_target_row_already_inserted() -> Result<()> {
    let tree = AssetTree::open_in_memory(TreeOptions::default())?;
    let (org, root) = tree.create_hierarchy("Default")?;
    let a = tree.create_child_node(root.id, Some("A"))?;
    let c = tree.create_child_node(root.id, Some("C"))?;
    let x = tree.create_asset(org.id, "x", &[a.id])?.id;

    let observer = Arc::new(RowsAtRemoval {
        tree: Mutex::new(Some(tree.clone())),
        seen: Mutex::new(Vec::new()),
    });
    tree.subscribe(observer.clone());
    tree.reassign_assets(&[x], c.id)?;
    // Break the observer -> tree cycle so the tree can close.
    observer.tree.lock().unwrap().take();

    assert_eq!(*observer.seen.lock().unwrap(), vec![c.id]);
    Ok(())
}

#[test]
fn reassign_collapses_multiple_memberships_into_one() -> Result<()> {
    let tree = AssetTree::open_in_memory(TreeOptions::default())?;
    let (org, root) = tree.create_hierarchy("Default")?;
    let a = tree.create_child_node(root.id, Some("A"))?;
    let b = tree.create_child_node(root.id, Some("B"))?;
    let c = tree.create_child_node(root.id, Some("C"))?;
    let x = tree.create_asset(org.id, "x", &[a.id, b.id, c.id])?.id;

    let report = tree.reassign_assets(&[x, x], c.id)?;
    assert_eq!(report.rows_removed, 3);
    assert_eq!(report.rows_added, 1);
    assert_eq!(tree.asset_nodes(x)?, vec![c.id]);
    assert_eq!(amount(&tree, a.id), 0);
    assert_eq!(amount(&tree, c.id), 1);
    assert_eq!(amount(&tree, root.id), 1);
    Ok(())
}

#[test]
fn concurrent_reassigns_of_overlapping_assets_conflict_once() -> Result<()> {
    let tree = AssetTree::open_in_memory(TreeOptions::default())?;
    let (org, root) = tree.create_hierarchy("Default")?;
    let source = tree.create_child_node(root.id, Some("source"))?;
    let t1 = tree.create_child_node(root.id, Some("t1"))?;
    let t2 = tree.create_child_node(root.id, Some("t2"))?;
    let mut assets = Vec::new();
    for i in 0..6 {
        assets.push(tree.create_asset(org.id, &format!("h{i}"), &[source.id])?.id);
    }
    let first: Vec<AssetId> = assets[..4].to_vec();
    let second: Vec<AssetId> = assets[2..].to_vec();

    // Both callers read their rows, then queue up behind the held lock.
    let lease = tree.tree_lock().acquire(org.id, None)?;
    let handles: Vec<_> = [(first.clone(), t1.id), (second.clone(), t2.id)]
        .into_iter()
        .map(|(batch, target)| {
            let tree = tree.clone();
            thread::spawn(move || tree.reassign_assets(&batch, target))
        })
        .collect();
    thread::sleep(Duration::from_millis(200));
    drop(lease);
    let results: Vec<Result<_>> = handles
        .into_iter()
        .map(|h| h.join().expect("reassign thread panicked"))
        .collect();

    let winners: Vec<usize> = (0..2).filter(|i| results[*i].is_ok()).collect();
    assert_eq!(winners.len(), 1, "exactly one reassignment wins");
    let loser = &results[1 - winners[0]];
    assert!(matches!(loser, Err(TreeError::Conflict { .. })));

    let (won, target, lost) = if winners[0] == 0 {
        (&first, t1.id, &second)
    } else {
        (&second, t2.id, &first)
    };
    for asset in won {
        assert_eq!(tree.asset_nodes(*asset)?, vec![target]);
    }
    for asset in lost.iter().filter(|a| !won.contains(a)) {
        assert_eq!(tree.asset_nodes(*asset)?, vec![source.id], "loser wrote nothing");
    }
    assert_eq!(amount(&tree, root.id), 6);
    assert_no_orphans(&tree, &assets);
    assert_cache_matches_bulk(&tree, org.id);

    // The conflict is retryable and succeeds against the new state.
    let retry_target = if winners[0] == 0 { t2.id } else { t1.id };
    tree.reassign_assets(lost, retry_target)?;
    for asset in lost {
        assert_eq!(tree.asset_nodes(*asset)?, vec![retry_target]);
    }
    assert_cache_matches_bulk(&tree, org.id);
    Ok(())
}

/// Detaches the reassigned asset from inside the pre-removal callback, i.e.
/// between the snapshot and the delete.
struct InterferingEditor {
    tree: AssetTree,
    node: NodeId,
    fired: AtomicBool,
}

impl MembershipObserver for InterferingEditor {
    fn before_remove(&self, _hierarchy: HierarchyId, changes: &[MembershipChange]) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let assets: Vec<AssetId> = changes.iter().map(|c| c.asset_id).collect();
        self.tree
            .detach_assets(self.node, &assets)
            .expect("interfering detach");
    }
}

#[test]
fn membership_change_after_snapshot_is_a_conflict() -> Result<()> {
    let tree = AssetTree::open_in_memory(TreeOptions::default())?;
    let (org, root) = tree.create_hierarchy("Default")?;
    let a = tree.create_child_node(root.id, Some("A"))?;
    let c = tree.create_child_node(root.id, Some("C"))?;
    let x = tree.create_asset(org.id, "x", &[a.id])?.id;

    tree.subscribe(Arc::new(InterferingEditor {
        tree: tree.clone(),
        node: a.id,
        fired: AtomicBool::new(false),
    }));

    let err = tree.reassign_assets(&[x], c.id).unwrap_err();
    assert!(matches!(err, TreeError::Conflict { expected: 1, actual: 0 }));
    assert!(err.is_retryable());

    // Nothing from the aborted reassignment was written; the interfering
    // detach left the asset on the root rather than on no node at all.
    assert_eq!(tree.asset_nodes(x)?, vec![root.id]);
    assert_eq!(amount(&tree, c.id), 0);
    assert_no_orphans(&tree, &[x]);
    assert_cache_matches_bulk(&tree, org.id);

    let retry = tree.reassign_assets(&[x], c.id)?;
    assert_eq!(retry.rows_added, 1);
    assert_eq!(tree.asset_nodes(x)?, vec![c.id]);
    assert_cache_matches_bulk(&tree, org.id);
    Ok(())
}

#[test]
fn lock_timeout_writes_nothing() -> Result<()> {
    let tree = AssetTree::open_in_memory(TreeOptions {
        lock_acquire_timeout: Some(Duration::from_millis(50)),
        ..TreeOptions::default()
    })?;
    let (org, root) = tree.create_hierarchy("Default")?;
    let a = tree.create_child_node(root.id, Some("A"))?;
    let x = tree.create_asset(org.id, "x", &[root.id])?.id;

    let lease = tree.tree_lock().acquire(org.id, None)?;
    assert_eq!(tree.lock_snapshot().held, vec![org.id]);

    let err = tree.reassign_assets(&[x], a.id).unwrap_err();
    assert!(matches!(err, TreeError::LockTimeout(h) if h == org.id));
    let err = tree.create_child_node(root.id, Some("B")).unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(tree.children(root.id)?.len(), 1);
    assert_eq!(tree.asset_nodes(x)?, vec![root.id]);

    // Plain membership edits do not take the tree lock.
    tree.attach_assets(a.id, &[x])?;
    drop(lease);

    tree.reassign_assets(&[x], a.id)?;
    assert_eq!(tree.asset_nodes(x)?, vec![a.id]);
    Ok(())
}

#[test]
fn reassign_rejects_assets_from_another_hierarchy() -> Result<()> {
    let tree = AssetTree::open_in_memory(TreeOptions::default())?;
    let (_, root) = tree.create_hierarchy("one")?;
    let (other, _) = tree.create_hierarchy("two")?;
    let foreign = tree.create_asset(other.id, "foreign", &[])?.id;

    let err = tree.reassign_assets(&[foreign], root.id).unwrap_err();
    assert!(matches!(err, TreeError::Invalid(_)));
    Ok(())
}
