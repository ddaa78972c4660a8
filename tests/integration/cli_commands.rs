#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn setup_db() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("tree.db");
    (dir, path)
}

fn run_json(db: &Path, args: &[&str]) -> Value {
    let output = cargo_bin_cmd!("nodetree")
        .env_remove("NODETREE_CONFIG")
        .arg("--db")
        .arg(db)
        .args(["--format", "json"])
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("json output")
}

#[test]
fn build_tree_and_inspect_counts() {
    let (_dir, db) = setup_db();

    let created = run_json(&db, &["init", "Default"]);
    assert_eq!(created["root"]["key"], "1");
    let hierarchy = created["hierarchy"].as_i64().expect("hierarchy id").to_string();

    let leaf = run_json(&db, &["mkdir", &hierarchy, "/Default/prod/db"]);
    assert_eq!(leaf["key"], "1:1:1");
    let leaf_id = leaf["id"].as_i64().expect("node id").to_string();

    let asset = run_json(&db, &["asset", &hierarchy, "db-1", "--node", &leaf_id]);
    let asset_id = asset["id"].as_i64().expect("asset id").to_string();
    run_json(&db, &["asset", &hierarchy, "db-2"]);

    let count = run_json(&db, &["count", &leaf_id]);
    assert_eq!(count["cached"], 1);
    assert_eq!(count["computed"], 1);

    let root_id = created["root"]["id"].as_i64().expect("root id").to_string();
    let count = run_json(&db, &["count", &root_id]);
    assert_eq!(count["cached"], 2);

    let moved = run_json(&db, &["reassign", &root_id, &asset_id]);
    assert_eq!(moved["rows_removed"], 1);
    let count = run_json(&db, &["count", &leaf_id]);
    assert_eq!(count["cached"], 0);

    let report = run_json(&db, &["reconcile", &hierarchy]);
    assert_eq!(report["clean"], true);
    assert_eq!(report["mode"], "repair");

    let nodes = run_json(&db, &["tree", &hierarchy]);
    assert_eq!(nodes.as_array().map(Vec::len), Some(3));
}

#[test]
fn text_tree_is_indented_by_depth() {
    let (_dir, db) = setup_db();
    run_json(&db, &["init", "Default"]);
    run_json(&db, &["mkdir", "1", "web/edge"]);

    let output = cargo_bin_cmd!("nodetree")
        .env_remove("NODETREE_CONFIG")
        .arg("--db")
        .arg(&db)
        .args(["tree", "1"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines, vec!["Default [1] 0", "  web [1:1] 0", "    edge [1:1:1] 0"]);
}

#[test]
fn config_file_supplies_database_and_options() {
    let dir = TempDir::new().expect("tempdir");
    let db = dir.path().join("from-config.db");
    let config = dir.path().join("config.toml");
    std::fs::write(
        &config,
        format!(
            "[database]\ndefault = {:?}\n\n[tree]\nnew_node_name = \"Group\"\n",
            db.display().to_string()
        ),
    )
    .expect("write config");

    cargo_bin_cmd!("nodetree")
        .env_remove("NODETREE_DB")
        .arg("--config")
        .arg(&config)
        .args(["init", "Default"])
        .assert()
        .success();
    assert!(db.exists());
}

#[test]
fn errors_exit_nonzero() {
    let (_dir, db) = setup_db();
    run_json(&db, &["init", "Default"]);

    cargo_bin_cmd!("nodetree")
        .env_remove("NODETREE_CONFIG")
        .arg("--db")
        .arg(&db)
        .args(["attach", "999", "1"])
        .assert()
        .failure()
        .code(1);

    let stderr = cargo_bin_cmd!("nodetree")
        .env_remove("NODETREE_CONFIG")
        .arg("--db")
        .arg(&db)
        .args(["count", "42"])
        .assert()
        .failure()
        .get_output()
        .stderr
        .clone();
    assert!(String::from_utf8_lossy(&stderr).contains("error: node not found"));
}

#[test]
fn deferred_attach_is_reconciled_before_exit() {
    let dir = TempDir::new().expect("tempdir");
    let db = dir.path().join("tree.db");
    let config = dir.path().join("config.toml");
    std::fs::write(
        &config,
        "[tree]\nincremental_batch_limit = 1\ncoalesce_window_ms = 60000\n",
    )
    .expect("write config");
    let run = |args: &[&str]| -> Value {
        let output = cargo_bin_cmd!("nodetree")
            .arg("--config")
            .arg(&config)
            .arg("--db")
            .arg(&db)
            .args(["--format", "json"])
            .args(args)
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        serde_json::from_slice(&output).expect("json output")
    };

    let created = run(&["init", "Default"]);
    let hierarchy = created["hierarchy"].as_i64().expect("hierarchy id").to_string();
    let root_id = created["root"]["id"].as_i64().expect("root id").to_string();
    let node = run(&["mkdir", &hierarchy, "/Default/racks"]);
    let node_id = node["id"].as_i64().expect("node id").to_string();
    let assets: Vec<String> = (0..4)
        .map(|i| {
            run(&["asset", &hierarchy, &format!("srv-{i}")])["id"]
                .as_i64()
                .expect("asset id")
                .to_string()
        })
        .collect();

    let mut attach = vec!["attach", node_id.as_str()];
    attach.extend(assets.iter().map(String::as_str));
    let outcome = run(&attach);
    assert_eq!(outcome["deferred"], true);

    let count = run(&["count", &node_id]);
    assert_eq!(count["cached"], 4);
    assert_eq!(count["cached"], count["computed"]);
    let count = run(&["count", &root_id]);
    assert_eq!(count["cached"], 4);
    assert_eq!(count["cached"], count["computed"]);
}
