#![allow(missing_docs)]

use std::thread;
use std::time::{Duration, Instant};

use nodetree::{AssetId, AssetTree, FindingSeverity, NodeId, Result, TreeOptions};
use rusqlite::{params, Connection};
use tempfile::TempDir;

fn amount(tree: &AssetTree, id: NodeId) -> i64 {
    tree.node(id).expect("read node").expect("node exists").assets_amount
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn oversized_batches_defer_to_one_coalesced_reconciliation() -> Result<()> {
    let tree = AssetTree::open_in_memory(TreeOptions {
        incremental_batch_limit: 2,
        coalesce_window: Duration::from_secs(60),
        ..TreeOptions::default()
    })?;
    let (org, root) = tree.create_hierarchy("Default")?;
    let a = tree.create_child_node(root.id, Some("A"))?;
    let b = tree.create_child_node(root.id, Some("B"))?;
    let assets: Vec<AssetId> = (0..3)
        .map(|i| tree.create_asset(org.id, &format!("h{i}"), &[]).map(|a| a.id))
        .collect::<Result<_>>()?;

    let outcome = tree.attach_assets(a.id, &assets)?;
    assert!(outcome.deferred);
    assert_eq!(outcome.rows_changed(), 3);
    assert_eq!(amount(&tree, a.id), 0, "counts wait for reconciliation");

    let outcome = tree.attach_assets(b.id, &assets)?;
    assert!(outcome.deferred);
    assert_eq!(tree.reconcile_queue().pending(), vec![org.id]);

    // Small batches still propagate immediately.
    let outcome = tree.detach_assets(b.id, &assets[..1])?;
    assert!(!outcome.deferred);

    tree.flush_reconciliation();
    assert!(tree.reconcile_queue().pending().is_empty());
    let stats = tree.reconcile_queue().stats();
    assert_eq!(stats.requested, 2);
    assert_eq!(stats.coalesced, 1);
    assert_eq!(stats.runs, 1);
    assert_eq!(stats.failures, 0);

    assert_eq!(amount(&tree, a.id), 3);
    assert_eq!(amount(&tree, b.id), 2);
    assert_eq!(amount(&tree, root.id), 3);
    assert!(tree.check_consistency(org.id)?.clean);
    Ok(())
}

#[test]
fn scheduled_reconciliation_runs_after_the_window() -> Result<()> {
    let tree = AssetTree::open_in_memory(TreeOptions {
        incremental_batch_limit: 1,
        coalesce_window: Duration::from_millis(30),
        ..TreeOptions::default()
    })?;
    let (org, root) = tree.create_hierarchy("Default")?;
    let a = tree.create_child_node(root.id, Some("A"))?;
    let x = tree.create_asset(org.id, "x", &[])?.id;
    let y = tree.create_asset(org.id, "y", &[])?.id;

    assert!(tree.attach_assets(a.id, &[x, y])?.deferred);
    assert!(wait_until(|| amount(&tree, a.id) == 2));
    assert!(wait_until(|| tree.reconcile_queue().stats().runs == 1));
    Ok(())
}

#[test]
fn reconciliation_repairs_external_drift_then_finds_nothing() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("tree.db");
    let tree = AssetTree::open(&path, TreeOptions::default())?;
    let (org, root) = tree.create_hierarchy("Default")?;
    let a = tree.create_child_node(root.id, Some("A"))?;
    tree.create_asset(org.id, "x", &[a.id])?;

    {
        let raw = Connection::open(&path)?;
        raw.busy_timeout(Duration::from_secs(5))?;
        raw.execute(
            "UPDATE nodes SET assets_amount = 40 WHERE id = ?1",
            params![a.id.0],
        )?;
        raw.execute(
            "INSERT INTO assets (hierarchy_id, name) VALUES (?1, 'stray')",
            params![org.id.0],
        )?;
    }

    let check = tree.check_consistency(org.id)?;
    assert!(!check.clean);
    assert_eq!(check.drift.len(), 1);
    assert_eq!(check.orphans.len(), 1);
    assert_eq!(amount(&tree, a.id), 40, "check mode must not write");

    let first = tree.run_reconciliation(org.id)?;
    assert_eq!(first.drift.len(), 2, "node A drifted, root gains the stray asset");
    assert_eq!(first.drift[1].cached, 40);
    assert_eq!(first.drift[1].computed, 1);
    assert!(first
        .findings
        .iter()
        .all(|f| f.severity == FindingSeverity::Warning));
    assert_eq!(amount(&tree, a.id), 1);
    assert_eq!(amount(&tree, root.id), 2);

    let second = tree.run_reconciliation(org.id)?;
    assert!(second.clean);
    assert!(second.drift.is_empty());
    assert!(second.orphans.is_empty());
    Ok(())
}

#[test]
fn periodic_reconciliation_heals_drift() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("tree.db");
    let tree = AssetTree::open(
        &path,
        TreeOptions {
            coalesce_window: Duration::ZERO,
            ..TreeOptions::default()
        },
    )?;
    let (org, root) = tree.create_hierarchy("Default")?;
    tree.create_asset(org.id, "x", &[])?;
    {
        let raw = Connection::open(&path)?;
        raw.busy_timeout(Duration::from_secs(5))?;
        raw.execute(
            "UPDATE nodes SET assets_amount = 9 WHERE id = ?1",
            params![root.id.0],
        )?;
    }

    let periodic = tree.spawn_periodic_reconciliation(Duration::from_millis(20));
    assert!(wait_until(|| amount(&tree, root.id) == 1));
    periodic.stop();
    assert!(tree.reconcile_queue().stats().runs >= 1);
    Ok(())
}

#[test]
fn deferred_counts_are_settled_when_the_tree_is_dropped() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("tree.db");
    let opts = TreeOptions {
        incremental_batch_limit: 1,
        coalesce_window: Duration::from_secs(60),
        ..TreeOptions::default()
    };
    let tree = AssetTree::open(&path, opts.clone())?;
    let (org, root) = tree.create_hierarchy("Default")?;
    let a = tree.create_child_node(root.id, Some("A"))?;
    let assets: Vec<AssetId> = (0..3)
        .map(|i| tree.create_asset(org.id, &format!("h{i}"), &[]).map(|a| a.id))
        .collect::<Result<_>>()?;

    assert!(tree.attach_assets(a.id, &assets)?.deferred);
    assert_eq!(tree.pending_reconciliations()?, vec![org.id]);
    drop(tree);

    {
        let raw = Connection::open(&path)?;
        let marked: i64 =
            raw.query_row("SELECT COUNT(*) FROM reconcile_pending", [], |row| row.get(0))?;
        assert_eq!(marked, 0, "closing the tree runs what was queued");
    }

    let tree = AssetTree::open(&path, opts)?;
    let report = tree.check_consistency(org.id)?;
    assert!(report.drift.is_empty());
    assert!(report.clean);
    assert_eq!(amount(&tree, a.id), 3);
    assert!(tree.pending_reconciliations()?.is_empty());
    Ok(())
}

#[test]
fn unfinished_deferral_is_repaired_on_open() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("tree.db");
    let (org, a) = {
        let tree = AssetTree::open(&path, TreeOptions::default())?;
        let (org, root) = tree.create_hierarchy("Default")?;
        let a = tree.create_child_node(root.id, Some("A"))?;
        tree.create_asset(org.id, "x", &[a.id])?;
        (org, a)
    };

    // A process that died between committing rows and reconciling leaves
    // stale counts plus the marker behind.
    {
        let raw = Connection::open(&path)?;
        raw.execute(
            "UPDATE nodes SET assets_amount = 7 WHERE id = ?1",
            params![a.id.0],
        )?;
        raw.execute(
            "INSERT INTO reconcile_pending (hierarchy_id) VALUES (?1)",
            params![org.id.0],
        )?;
    }

    let tree = AssetTree::open(&path, TreeOptions::default())?;
    assert_eq!(amount(&tree, a.id), 1);
    assert!(tree.pending_reconciliations()?.is_empty());
    assert!(tree.check_consistency(org.id)?.clean);
    Ok(())
}
