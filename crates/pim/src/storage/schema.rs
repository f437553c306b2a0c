//! DDL for the entity model (spec §3). Any relational store supporting
//! foreign keys and transactions works; these statements target the
//! SQLite dialect turso speaks.

use crate::errors::Result;
use crate::storage::pool::PooledConnection;

pub const DEFAULT_STAGING_DIR: &str = "staging";

const STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS resources (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        is_virtual INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS collections (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        parent_id INTEGER REFERENCES collections(id),
        name TEXT NOT NULL,
        remote_id TEXT NOT NULL DEFAULT '',
        remote_revision TEXT NOT NULL DEFAULT '',
        resource_id INTEGER NOT NULL REFERENCES resources(id),
        is_virtual INTEGER NOT NULL DEFAULT 0,
        content_mime_types TEXT NOT NULL DEFAULT '[]',
        cache_policy TEXT NOT NULL DEFAULT '{}',
        enabled INTEGER NOT NULL DEFAULT 1,
        list_preferences TEXT NOT NULL DEFAULT '{}',
        query_string TEXT,
        query_attributes TEXT NOT NULL DEFAULT '[]',
        query_collection_ids TEXT NOT NULL DEFAULT '[]',
        attributes BLOB NOT NULL DEFAULT '',
        last_synced TEXT
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_collections_sibling_name
        ON collections(parent_id, name)",
    "CREATE INDEX IF NOT EXISTS idx_collections_resource_remote
        ON collections(resource_id, remote_id)",
    "CREATE TABLE IF NOT EXISTS items (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        collection_id INTEGER NOT NULL REFERENCES collections(id),
        mime_type TEXT NOT NULL,
        remote_id TEXT NOT NULL DEFAULT '',
        remote_revision TEXT NOT NULL DEFAULT '',
        gid TEXT NOT NULL DEFAULT '',
        revision INTEGER NOT NULL DEFAULT 0,
        created TEXT NOT NULL,
        modified TEXT NOT NULL,
        size INTEGER NOT NULL DEFAULT 0,
        dirty INTEGER NOT NULL DEFAULT 0,
        flags TEXT NOT NULL DEFAULT '[]',
        attributes BLOB NOT NULL DEFAULT ''
    )",
    "CREATE INDEX IF NOT EXISTS idx_items_collection ON items(collection_id)",
    "CREATE INDEX IF NOT EXISTS idx_items_gid ON items(gid)",
    "CREATE INDEX IF NOT EXISTS idx_items_remote ON items(collection_id, remote_id)",
    "CREATE TABLE IF NOT EXISTS parts (
        item_id INTEGER NOT NULL REFERENCES items(id),
        name TEXT NOT NULL,
        data BLOB,
        storage TEXT NOT NULL,
        external_ref TEXT,
        size INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (item_id, name)
    )",
    "CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        gid TEXT NOT NULL UNIQUE,
        tag_type TEXT NOT NULL,
        parent_id INTEGER REFERENCES tags(id),
        attributes BLOB NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS item_tags (
        item_id INTEGER NOT NULL REFERENCES items(id),
        tag_id INTEGER NOT NULL REFERENCES tags(id),
        PRIMARY KEY (item_id, tag_id)
    )",
    "CREATE TABLE IF NOT EXISTS tag_remote_ids (
        tag_id INTEGER NOT NULL REFERENCES tags(id),
        resource_id INTEGER NOT NULL REFERENCES resources(id),
        remote_id TEXT NOT NULL,
        PRIMARY KEY (tag_id, resource_id)
    )",
    "CREATE TABLE IF NOT EXISTS relations (
        left_item INTEGER NOT NULL REFERENCES items(id),
        right_item INTEGER NOT NULL REFERENCES items(id),
        relation_type TEXT NOT NULL,
        PRIMARY KEY (left_item, right_item, relation_type)
    )",
    "CREATE TABLE IF NOT EXISTS virtual_memberships (
        collection_id INTEGER NOT NULL REFERENCES collections(id),
        item_id INTEGER NOT NULL REFERENCES items(id),
        PRIMARY KEY (collection_id, item_id)
    )",
    "CREATE TABLE IF NOT EXISTS collection_subscriptions (
        session_id TEXT NOT NULL,
        collection_id INTEGER NOT NULL REFERENCES collections(id),
        subscribed INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (session_id, collection_id)
    )",
    "CREATE TABLE IF NOT EXISTS change_recorder_log (
        offset INTEGER PRIMARY KEY AUTOINCREMENT,
        payload BLOB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS change_recorder_cursor (
        consumer TEXT PRIMARY KEY,
        last_offset INTEGER NOT NULL
    )",
];

pub async fn init_schema(conn: &PooledConnection) -> Result<()> {
    for stmt in STATEMENTS {
        conn.execute(stmt, ()).await?;
    }
    Ok(())
}
