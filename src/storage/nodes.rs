use rusqlite::{ffi, params, Connection, OptionalExtension, Row};
use tracing::error;

use crate::key::NodeKey;
use crate::types::{Hierarchy, HierarchyId, Node, NodeId, Result, TreeError};

use super::json_ids;

const NODE_COLUMNS: &str = "id, hierarchy_id, key, value, full_value, assets_amount";

fn node_from_row(row: &Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        id: row.get(0)?,
        hierarchy_id: row.get(1)?,
        key: row.get(2)?,
        value: row.get(3)?,
        full_value: row.get(4)?,
        assets_amount: row.get(5)?,
    })
}

fn collect_nodes(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Node>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(args, node_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub(crate) fn insert_hierarchy(conn: &Connection, name: &str) -> Result<HierarchyId> {
    conn.execute("INSERT INTO hierarchies (name) VALUES (?1)", params![name])?;
    Ok(HierarchyId(conn.last_insert_rowid()))
}

pub(crate) fn get_hierarchy(conn: &Connection, id: HierarchyId) -> Result<Option<Hierarchy>> {
    let hierarchy = conn
        .query_row(
            "SELECT id, name FROM hierarchies WHERE id = ?1",
            params![id],
            |row| {
                Ok(Hierarchy {
                    id: row.get(0)?,
                    name: row.get(1)?,
                })
            },
        )
        .optional()?;
    Ok(hierarchy)
}

pub(crate) fn list_hierarchies(conn: &Connection) -> Result<Vec<Hierarchy>> {
    let mut stmt = conn.prepare_cached("SELECT id, name FROM hierarchies ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        Ok(Hierarchy {
            id: row.get(0)?,
            name: row.get(1)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Root keys across every hierarchy.
pub(crate) fn all_root_keys(conn: &Connection) -> Result<Vec<NodeKey>> {
    let mut stmt = conn.prepare_cached("SELECT key FROM nodes WHERE parent_key = ''")?;
    let rows = stmt.query_map([], |row| row.get::<_, NodeKey>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub(crate) fn insert_node(
    conn: &Connection,
    hierarchy: HierarchyId,
    key: &NodeKey,
    value: &str,
    full_value: &str,
) -> Result<NodeId> {
    let parent_key = key.parent().map(String::from).unwrap_or_default();
    let inserted = conn.execute(
        "INSERT INTO nodes (hierarchy_id, key, parent_key, value, full_value)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![hierarchy, key, parent_key, value, full_value],
    );
    match inserted {
        Ok(_) => Ok(NodeId(conn.last_insert_rowid())),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            error!(hierarchy = %hierarchy, key = %key, "tree.node.key_collision");
            Err(TreeError::KeyCollision {
                hierarchy,
                key: key.clone(),
            })
        }
        Err(err) => Err(err.into()),
    }
}

pub(crate) fn get_node(conn: &Connection, id: NodeId) -> Result<Option<Node>> {
    let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], node_from_row).optional()?)
}

pub(crate) fn require_node(conn: &Connection, id: NodeId) -> Result<Node> {
    get_node(conn, id)?.ok_or(TreeError::NotFound("node"))
}

pub(crate) fn get_node_by_key(
    conn: &Connection,
    hierarchy: HierarchyId,
    key: &NodeKey,
) -> Result<Option<Node>> {
    let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE hierarchy_id = ?1 AND key = ?2");
    Ok(conn
        .query_row(&sql, params![hierarchy, key], node_from_row)
        .optional()?)
}

pub(crate) fn root_node(conn: &Connection, hierarchy: HierarchyId) -> Result<Option<Node>> {
    let sql = format!(
        "SELECT {NODE_COLUMNS} FROM nodes WHERE hierarchy_id = ?1 AND parent_key = '' ORDER BY id"
    );
    let mut roots = collect_nodes(conn, &sql, params![hierarchy])?;
    match roots.len() {
        0 => Ok(None),
        1 => Ok(roots.pop()),
        n => {
            error!(hierarchy = %hierarchy, roots = n, "tree.node.multiple_roots");
            Err(TreeError::Corruption(format!(
                "hierarchy {hierarchy} has {n} root nodes"
            )))
        }
    }
}

pub(crate) fn children(conn: &Connection, hierarchy: HierarchyId, parent: &NodeKey) -> Result<Vec<Node>> {
    let sql = format!(
        "SELECT {NODE_COLUMNS} FROM nodes WHERE hierarchy_id = ?1 AND parent_key = ?2"
    );
    let mut out = collect_nodes(conn, &sql, params![hierarchy, parent])?;
    out.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(out)
}

pub(crate) fn has_children(conn: &Connection, hierarchy: HierarchyId, parent: &NodeKey) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM nodes WHERE hierarchy_id = ?1 AND parent_key = ?2 LIMIT 1",
            params![hierarchy, parent],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

pub(crate) fn nodes_by_keys(
    conn: &Connection,
    hierarchy: HierarchyId,
    keys: &[NodeKey],
) -> Result<Vec<Node>> {
    let sql = format!(
        "SELECT {NODE_COLUMNS} FROM nodes
         WHERE hierarchy_id = ?1 AND key IN (SELECT value FROM json_each(?2))"
    );
    collect_nodes(conn, &sql, params![hierarchy, json_ids(keys)])
}

pub(crate) fn nodes_by_ids(conn: &Connection, ids: &[NodeId]) -> Result<Vec<Node>> {
    let sql = format!(
        "SELECT {NODE_COLUMNS} FROM nodes WHERE id IN (SELECT value FROM json_each(?1))"
    );
    collect_nodes(conn, &sql, params![json_ids(ids)])
}

/// Every node of a hierarchy, sorted by key.
pub(crate) fn list_nodes(conn: &Connection, hierarchy: HierarchyId) -> Result<Vec<Node>> {
    let sql = format!("SELECT {NODE_COLUMNS} FROM nodes WHERE hierarchy_id = ?1");
    let mut out = collect_nodes(conn, &sql, params![hierarchy])?;
    out.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(out)
}

/// A node and all of its descendants, sorted by key.
pub(crate) fn subtree_nodes(
    conn: &Connection,
    hierarchy: HierarchyId,
    key: &NodeKey,
) -> Result<Vec<Node>> {
    let (lo, hi) = key.descendant_bounds();
    let sql = format!(
        "SELECT {NODE_COLUMNS} FROM nodes
         WHERE hierarchy_id = ?1 AND (key = ?2 OR (key >= ?3 AND key < ?4))"
    );
    let mut out = collect_nodes(conn, &sql, params![hierarchy, key, lo, hi])?;
    out.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(out)
}

/// Applies `delta` to each listed node's cached count.
pub(crate) fn add_assets_amount(
    conn: &Connection,
    hierarchy: HierarchyId,
    keys: &[NodeKey],
    delta: i64,
) -> Result<usize> {
    if keys.is_empty() || delta == 0 {
        return Ok(0);
    }
    let updated = conn.execute(
        "UPDATE nodes SET assets_amount = assets_amount + ?1
         WHERE hierarchy_id = ?2 AND key IN (SELECT value FROM json_each(?3))",
        params![delta, hierarchy, json_ids(keys)],
    )?;
    Ok(updated)
}

pub(crate) fn set_assets_amount(conn: &Connection, id: NodeId, amount: i64) -> Result<()> {
    conn.execute(
        "UPDATE nodes SET assets_amount = ?1 WHERE id = ?2",
        params![amount, id],
    )?;
    Ok(())
}

pub(crate) fn delete_node_row(conn: &Connection, id: NodeId) -> Result<()> {
    conn.execute("DELETE FROM nodes WHERE id = ?1", params![id])?;
    Ok(())
}

/// Records that a hierarchy's counts were left for reconciliation. Survives
/// the process so a later open can finish the job.
pub(crate) fn mark_reconcile_pending(conn: &Connection, hierarchy: HierarchyId) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO reconcile_pending (hierarchy_id) VALUES (?1)",
        params![hierarchy],
    )?;
    Ok(())
}

pub(crate) fn clear_reconcile_pending(conn: &Connection, hierarchy: HierarchyId) -> Result<()> {
    conn.execute(
        "DELETE FROM reconcile_pending WHERE hierarchy_id = ?1",
        params![hierarchy],
    )?;
    Ok(())
}

pub(crate) fn pending_reconciles(conn: &Connection) -> Result<Vec<HierarchyId>> {
    let mut stmt =
        conn.prepare_cached("SELECT hierarchy_id FROM reconcile_pending ORDER BY hierarchy_id")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
