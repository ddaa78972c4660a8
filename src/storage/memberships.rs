use rusqlite::{params, Connection, OptionalExtension};
use rustc_hash::FxHashSet;

use crate::key::NodeKey;
use crate::types::{Asset, AssetId, HierarchyId, NodeId, Result, TreeError};

use super::json_ids;

pub(crate) fn insert_asset(conn: &Connection, hierarchy: HierarchyId, name: &str) -> Result<AssetId> {
    conn.execute(
        "INSERT INTO assets (hierarchy_id, name) VALUES (?1, ?2)",
        params![hierarchy, name],
    )?;
    Ok(AssetId(conn.last_insert_rowid()))
}

pub(crate) fn get_asset(conn: &Connection, id: AssetId) -> Result<Option<Asset>> {
    let asset = conn
        .query_row(
            "SELECT id, hierarchy_id, name FROM assets WHERE id = ?1",
            params![id],
            |row| {
                Ok(Asset {
                    id: row.get(0)?,
                    hierarchy_id: row.get(1)?,
                    name: row.get(2)?,
                })
            },
        )
        .optional()?;
    Ok(asset)
}

/// Fails unless every id names an asset of `hierarchy`.
pub(crate) fn ensure_assets_in(
    conn: &Connection,
    hierarchy: HierarchyId,
    ids: &[AssetId],
) -> Result<()> {
    let unique: FxHashSet<AssetId> = ids.iter().copied().collect();
    let unique: Vec<AssetId> = unique.into_iter().collect();
    let found: i64 = conn.query_row(
        "SELECT COUNT(*) FROM assets
         WHERE hierarchy_id = ?1 AND id IN (SELECT value FROM json_each(?2))",
        params![hierarchy, json_ids(unique.as_slice())],
        |row| row.get(0),
    )?;
    let found = found as usize;
    if found != unique.len() {
        return Err(TreeError::Invalid(format!(
            "{} of {} assets do not exist in hierarchy {hierarchy}",
            unique.len() - found,
            unique.len()
        )));
    }
    Ok(())
}

pub(crate) fn delete_asset_row(conn: &Connection, id: AssetId) -> Result<()> {
    conn.execute("DELETE FROM assets WHERE id = ?1", params![id])?;
    Ok(())
}

pub(crate) fn count_assets(conn: &Connection, hierarchy: HierarchyId) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM assets WHERE hierarchy_id = ?1",
        params![hierarchy],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Returns true if the row was new.
pub(crate) fn insert_membership(conn: &Connection, asset: AssetId, node: NodeId) -> Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO memberships (asset_id, node_id) VALUES (?1, ?2)",
        params![asset, node],
    )?;
    Ok(inserted == 1)
}

pub(crate) fn delete_membership(conn: &Connection, asset: AssetId, node: NodeId) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM memberships WHERE asset_id = ?1 AND node_id = ?2",
        params![asset, node],
    )?)
}

/// Assets from `candidates` directly attached to `node`.
pub(crate) fn attached_to_node(
    conn: &Connection,
    node: NodeId,
    candidates: &[AssetId],
) -> Result<FxHashSet<AssetId>> {
    let mut stmt = conn.prepare_cached(
        "SELECT asset_id FROM memberships
         WHERE node_id = ?1 AND asset_id IN (SELECT value FROM json_each(?2))",
    )?;
    let rows = stmt.query_map(params![node, json_ids(candidates)], |row| row.get(0))?;
    let mut out = FxHashSet::default();
    for row in rows {
        out.insert(row?);
    }
    Ok(out)
}

/// Nodes the asset is directly attached to.
pub(crate) fn nodes_of_asset(conn: &Connection, asset: AssetId) -> Result<Vec<NodeId>> {
    let mut stmt =
        conn.prepare_cached("SELECT node_id FROM memberships WHERE asset_id = ?1 ORDER BY node_id")?;
    let rows = stmt.query_map(params![asset], |row| row.get(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Current `(asset, node)` rows for a batch of assets.
pub(crate) fn memberships_of_assets(
    conn: &Connection,
    assets: &[AssetId],
) -> Result<Vec<(AssetId, NodeId)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT asset_id, node_id FROM memberships
         WHERE asset_id IN (SELECT value FROM json_each(?1))
         ORDER BY asset_id, node_id",
    )?;
    let rows = stmt.query_map(params![json_ids(assets)], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Assets directly attached to `node`.
pub(crate) fn direct_assets(conn: &Connection, node: NodeId) -> Result<Vec<AssetId>> {
    let mut stmt =
        conn.prepare_cached("SELECT asset_id FROM memberships WHERE node_id = ?1 ORDER BY asset_id")?;
    let rows = stmt.query_map(params![node], |row| row.get(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Which of `candidates` are attached to `key` or any of its descendants.
pub(crate) fn assets_in_subtree(
    conn: &Connection,
    hierarchy: HierarchyId,
    key: &NodeKey,
    candidates: &[AssetId],
) -> Result<FxHashSet<AssetId>> {
    let (lo, hi) = key.descendant_bounds();
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT m.asset_id
         FROM nodes n JOIN memberships m ON m.node_id = n.id
         WHERE n.hierarchy_id = ?1
           AND (n.key = ?2 OR (n.key >= ?3 AND n.key < ?4))
           AND m.asset_id IN (SELECT value FROM json_each(?5))",
    )?;
    let rows = stmt.query_map(
        params![hierarchy, key, lo, hi, json_ids(candidates)],
        |row| row.get(0),
    )?;
    let mut out = FxHashSet::default();
    for row in rows {
        out.insert(row?);
    }
    Ok(out)
}

pub(crate) fn asset_in_subtree(
    conn: &Connection,
    hierarchy: HierarchyId,
    key: &NodeKey,
    asset: AssetId,
) -> Result<bool> {
    let (lo, hi) = key.descendant_bounds();
    let found = conn
        .prepare_cached(
            "SELECT 1
             FROM nodes n JOIN memberships m ON m.node_id = n.id
             WHERE n.hierarchy_id = ?1
               AND (n.key = ?2 OR (n.key >= ?3 AND n.key < ?4))
               AND m.asset_id = ?5
             LIMIT 1",
        )?
        .query_row(params![hierarchy, key, lo, hi, asset], |_| Ok(()))
        .optional()?;
    Ok(found.is_some())
}

/// `(node key, asset)` pairs for a hierarchy, optionally limited to a subtree.
pub(crate) fn keyed_pairs(
    conn: &Connection,
    hierarchy: HierarchyId,
    within: Option<&NodeKey>,
) -> Result<Vec<(NodeKey, AssetId)>> {
    let mut out = Vec::new();
    match within {
        None => {
            let mut stmt = conn.prepare_cached(
                "SELECT n.key, m.asset_id
                 FROM memberships m JOIN nodes n ON n.id = m.node_id
                 WHERE n.hierarchy_id = ?1",
            )?;
            let rows = stmt.query_map(params![hierarchy], |row| Ok((row.get(0)?, row.get(1)?)))?;
            for row in rows {
                out.push(row?);
            }
        }
        Some(key) => {
            let (lo, hi) = key.descendant_bounds();
            let mut stmt = conn.prepare_cached(
                "SELECT n.key, m.asset_id
                 FROM memberships m JOIN nodes n ON n.id = m.node_id
                 WHERE n.hierarchy_id = ?1 AND (n.key = ?2 OR (n.key >= ?3 AND n.key < ?4))",
            )?;
            let rows = stmt.query_map(params![hierarchy, key, lo, hi], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            for row in rows {
                out.push(row?);
            }
        }
    }
    Ok(out)
}

/// Assets of `hierarchy` with no membership at all, optionally restricted to
/// `candidates`.
pub(crate) fn orphan_assets(
    conn: &Connection,
    hierarchy: HierarchyId,
    candidates: Option<&[AssetId]>,
) -> Result<Vec<AssetId>> {
    let mut out = Vec::new();
    match candidates {
        None => {
            let mut stmt = conn.prepare_cached(
                "SELECT a.id FROM assets a
                 WHERE a.hierarchy_id = ?1
                   AND NOT EXISTS (SELECT 1 FROM memberships m WHERE m.asset_id = a.id)
                 ORDER BY a.id",
            )?;
            let rows = stmt.query_map(params![hierarchy], |row| row.get(0))?;
            for row in rows {
                out.push(row?);
            }
        }
        Some(ids) => {
            let mut stmt = conn.prepare_cached(
                "SELECT a.id FROM assets a
                 WHERE a.hierarchy_id = ?1
                   AND a.id IN (SELECT value FROM json_each(?2))
                   AND NOT EXISTS (SELECT 1 FROM memberships m WHERE m.asset_id = a.id)
                 ORDER BY a.id",
            )?;
            let rows = stmt.query_map(params![hierarchy, json_ids(ids)], |row| row.get(0))?;
            for row in rows {
                out.push(row?);
            }
        }
    }
    Ok(out)
}
