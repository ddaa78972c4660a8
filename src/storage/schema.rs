use rusqlite::Connection;

use crate::types::Result;

const SCHEMA_VERSION: i64 = 2;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS hierarchies (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS nodes (
    id INTEGER PRIMARY KEY,
    hierarchy_id INTEGER NOT NULL REFERENCES hierarchies (id),
    key TEXT NOT NULL,
    parent_key TEXT NOT NULL DEFAULT '',
    value TEXT NOT NULL,
    full_value TEXT NOT NULL DEFAULT '',
    assets_amount INTEGER NOT NULL DEFAULT 0,
    UNIQUE (hierarchy_id, key)
);

CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes (hierarchy_id, parent_key);

CREATE TABLE IF NOT EXISTS assets (
    id INTEGER PRIMARY KEY,
    hierarchy_id INTEGER NOT NULL REFERENCES hierarchies (id),
    name TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_assets_hierarchy ON assets (hierarchy_id);

CREATE TABLE IF NOT EXISTS memberships (
    asset_id INTEGER NOT NULL REFERENCES assets (id) ON DELETE CASCADE,
    node_id INTEGER NOT NULL REFERENCES nodes (id),
    PRIMARY KEY (asset_id, node_id)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_memberships_node ON memberships (node_id, asset_id);

CREATE TABLE IF NOT EXISTS reconcile_pending (
    hierarchy_id INTEGER PRIMARY KEY REFERENCES hierarchies (id)
);
";

pub(super) fn migrate(conn: &Connection) -> Result<()> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version < SCHEMA_VERSION {
        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }
    Ok(())
}
