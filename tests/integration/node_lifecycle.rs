#![allow(missing_docs)]

use nodetree::{AssetTree, NodeKey, Result, TreeError, TreeOptions};
use tempfile::TempDir;

fn tree() -> AssetTree {
    AssetTree::open_in_memory(TreeOptions::default()).expect("open tree")
}

#[test]
fn hierarchies_get_distinct_root_keys() -> Result<()> {
    let tree = tree();
    let (first, r1) = tree.create_hierarchy("Default")?;
    let (second, r2) = tree.create_hierarchy("Lab")?;
    assert_eq!(r1.key.as_str(), "1");
    assert_eq!(r2.key.as_str(), "2");
    assert_eq!(r1.full_value, "/Default");
    assert_eq!(tree.root(second.id)?.id, r2.id);
    assert_eq!(tree.hierarchies()?.len(), 2);
    assert_eq!(tree.hierarchy(first.id)?.map(|h| h.name), Some("Default".to_string()));
    Ok(())
}

#[test]
fn children_get_sequential_keys_and_full_values() -> Result<()> {
    let tree = tree();
    let (org, root) = tree.create_hierarchy("Default")?;
    let web = tree.create_child_node(root.id, Some("web"))?;
    let db = tree.create_child_node(root.id, Some(" db "))?;
    let edge = tree.create_child_node(web.id, Some("edge"))?;
    assert_eq!(web.key.as_str(), "1:1");
    assert_eq!(db.key.as_str(), "1:2");
    assert_eq!(db.value, "db");
    assert_eq!(edge.key.as_str(), "1:1:1");
    assert_eq!(edge.full_value, "/Default/web/edge");

    let found = tree.node_by_key(org.id, &NodeKey::parse("1:1:1")?)?.expect("edge exists");
    assert_eq!(found.id, edge.id);
    let children: Vec<String> = tree.children(root.id)?.into_iter().map(|n| n.value).collect();
    assert_eq!(children, vec!["web", "db"]);
    Ok(())
}

#[test]
fn sibling_values_must_be_unique() -> Result<()> {
    let tree = tree();
    let (_, root) = tree.create_hierarchy("Default")?;
    tree.create_child_node(root.id, Some("web"))?;
    let err = tree.create_child_node(root.id, Some("web")).unwrap_err();
    assert!(matches!(err, TreeError::DuplicateSibling { ref value, .. } if value == "web"));
    assert!(!err.is_retryable());

    let (again, created) = tree.get_or_create_child(root.id, "web")?;
    assert!(!created);
    assert_eq!(again.key.as_str(), "1:1");
    let (fresh, created) = tree.get_or_create_child(root.id, "db")?;
    assert!(created);
    assert_eq!(fresh.key.as_str(), "1:2");

    assert!(matches!(
        tree.create_child_node(root.id, Some("a/b")),
        Err(TreeError::Invalid(_))
    ));
    Ok(())
}

#[test]
fn preset_names_follow_the_configured_prefix() -> Result<()> {
    let tree = AssetTree::open_in_memory(TreeOptions {
        new_node_name: "Folder".to_string(),
        ..TreeOptions::default()
    })?;
    let (_, root) = tree.create_hierarchy("Default")?;
    let first = tree.create_child_node(root.id, None)?;
    tree.create_child_node(root.id, Some("Folder 7"))?;
    let next = tree.create_child_node(root.id, None)?;
    assert_eq!(first.value, "Folder 1");
    assert_eq!(next.value, "Folder 8");
    Ok(())
}

#[test]
fn full_value_paths_are_created_once() -> Result<()> {
    let tree = tree();
    let (org, root) = tree.create_hierarchy("Default")?;
    let leaf = tree.create_nodes_by_full_value(org.id, "/Default/prod/db/primary")?;
    assert_eq!(leaf.key.as_str(), "1:1:1:1");
    assert_eq!(leaf.full_value, "/Default/prod/db/primary");

    let same = tree.create_nodes_by_full_value(org.id, "prod/db/primary")?;
    assert_eq!(same.id, leaf.id);
    let sibling = tree.create_nodes_by_full_value(org.id, "/Default/prod/web")?;
    assert_eq!(sibling.key.as_str(), "1:1:2");
    assert_eq!(tree.nodes(org.id)?.len(), 5);
    assert_eq!(tree.create_nodes_by_full_value(org.id, "/")?.id, root.id);
    Ok(())
}

#[test]
fn only_empty_non_root_nodes_can_be_deleted() -> Result<()> {
    let tree = tree();
    let (org, root) = tree.create_hierarchy("Default")?;
    let parent = tree.create_child_node(root.id, Some("parent"))?;
    let child = tree.create_child_node(parent.id, Some("child"))?;
    let host = tree.create_asset(org.id, "host", &[child.id])?;

    assert!(matches!(tree.delete_node(root.id), Err(TreeError::Invalid(_))));
    assert!(matches!(tree.delete_node(parent.id), Err(TreeError::NodeNotEmpty(_))));
    assert!(matches!(tree.delete_node(child.id), Err(TreeError::NodeNotEmpty(_))));

    tree.reassign_assets(&[host.id], root.id)?;
    tree.delete_node(child.id)?;
    tree.delete_node(parent.id)?;
    assert!(tree.node(child.id)?.is_none());
    assert_eq!(tree.nodes(org.id)?.len(), 1);
    assert_eq!(tree.root(org.id)?.assets_amount, 1);
    Ok(())
}

#[test]
fn assets_without_nodes_land_on_the_root() -> Result<()> {
    let tree = tree();
    let (org, root) = tree.create_hierarchy("Default")?;
    let host = tree.create_asset(org.id, "host", &[])?;
    assert_eq!(tree.asset_nodes(host.id)?, vec![root.id]);
    assert_eq!(tree.root(org.id)?.assets_amount, 1);
    Ok(())
}

#[test]
fn cross_hierarchy_and_unknown_ids_are_rejected() -> Result<()> {
    let tree = tree();
    let (one, root_one) = tree.create_hierarchy("one")?;
    let (two, root_two) = tree.create_hierarchy("two")?;
    let host = tree.create_asset(one.id, "host", &[])?;

    assert!(matches!(
        tree.attach_assets(root_two.id, &[host.id]),
        Err(TreeError::Invalid(_))
    ));
    assert!(matches!(
        tree.attach_asset_to_nodes(host.id, &[root_two.id]),
        Err(TreeError::Invalid(_))
    ));
    assert!(matches!(
        tree.create_asset(two.id, "x", &[root_one.id]),
        Err(TreeError::Invalid(_))
    ));
    assert!(matches!(
        tree.create_child_node(nodetree::NodeId(999), None),
        Err(TreeError::NotFound("node"))
    ));
    assert!(matches!(
        tree.run_reconciliation(nodetree::HierarchyId(42)),
        Err(TreeError::NotFound("hierarchy"))
    ));
    assert_eq!(tree.asset_nodes(host.id)?, vec![root_one.id]);
    Ok(())
}

#[test]
fn file_backed_tree_survives_reopen() -> Result<()> {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("tree.db");
    let (org, web) = {
        let tree = AssetTree::open(&path, TreeOptions::default())?;
        let (org, root) = tree.create_hierarchy("Default")?;
        let web = tree.create_child_node(root.id, Some("web"))?;
        tree.create_asset(org.id, "host", &[web.id])?;
        (org, web)
    };

    let tree = AssetTree::open(&path, TreeOptions::default())?;
    let web = tree.node(web.id)?.expect("web persisted");
    assert_eq!(web.assets_amount, 1);
    assert_eq!(tree.root(org.id)?.assets_amount, 1);
    let next = tree.create_child_node(web.id, None)?;
    assert_eq!(next.key.as_str(), "1:1:1");
    Ok(())
}
