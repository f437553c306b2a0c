//! Row <-> entity mapping and the relational operations the command
//! handlers and sync engines are built from. Everything here takes a
//! `&turso::Connection` rather than owning one, so callers control the
//! transaction boundary (spec §4.2).

use std::collections::HashSet;

use chrono::Utc;
use pim_api::{AttributeMap, CollectionId, ItemId, ResourceId, TagId, Value};
use pim_core::{CachePolicy, Collection, CollectionStatistics, Item, ListPreferences, Part, PartStorage, Resource, Tag};
use turso::params;

use crate::errors::{EngineError, Result};
use crate::storage::codec::*;
use crate::storage::query::{compile, to_sql_value};
use pim_core::Filter;

fn is_unique_violation(err: &turso::Error) -> bool {
    err.to_string().to_lowercase().contains("unique")
}

// ---------------------------------------------------------------- Resources

pub async fn create_resource(
    conn: &turso::Connection,
    name: &str,
    is_virtual: bool,
) -> Result<ResourceId> {
    conn.execute(
        "INSERT INTO resources (name, is_virtual) VALUES (?, ?)",
        params![name.to_string(), is_virtual as i64],
    )
    .await?;
    Ok(ResourceId(last_insert_rowid(conn).await?))
}

pub async fn get_resource(conn: &turso::Connection, id: ResourceId) -> Result<Option<Resource>> {
    let mut stmt = conn
        .prepare("SELECT id, name, is_virtual FROM resources WHERE id = ?")
        .await?;
    let mut rows = stmt.query(params![id.get()]).await?;
    if let Some(row) = rows.next().await? {
        Ok(Some(Resource {
            id: ResourceId(row.get::<i64>(0)?),
            name: row.get::<String>(1)?,
            is_virtual: row.get::<i64>(2)? != 0,
        }))
    } else {
        Ok(None)
    }
}

async fn last_insert_rowid(conn: &turso::Connection) -> Result<i64> {
    let mut stmt = conn.prepare("SELECT last_insert_rowid()").await?;
    let mut rows = stmt.query(()).await?;
    let row = rows
        .next()
        .await?
        .ok_or_else(|| EngineError::storage("last_insert_rowid returned no row"))?;
    Ok(row.get::<i64>(0)?)
}

// -------------------------------------------------------------- Collections

pub struct NewCollection<'a> {
    pub parent_id: Option<CollectionId>,
    pub name: &'a str,
    pub resource_id: ResourceId,
    pub remote_id: &'a str,
    pub remote_revision: &'a str,
    pub content_mime_types: &'a HashSet<String>,
    pub cache_policy: &'a CachePolicy,
    pub is_virtual: bool,
    pub attributes: &'a AttributeMap,
}

pub async fn create_collection(
    conn: &turso::Connection,
    new: NewCollection<'_>,
) -> Result<CollectionId> {
    let result = conn
        .execute(
            "INSERT INTO collections
                (parent_id, name, remote_id, remote_revision, resource_id, is_virtual,
                 content_mime_types, cache_policy, attributes)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                new.parent_id.map(|p| p.get()),
                new.name.to_string(),
                new.remote_id.to_string(),
                new.remote_revision.to_string(),
                new.resource_id.get(),
                new.is_virtual as i64,
                encode_string_set(new.content_mime_types),
                encode_cache_policy(new.cache_policy),
                encode_attributes(new.attributes),
            ],
        )
        .await;
    match result {
        Ok(_) => Ok(CollectionId(last_insert_rowid(conn).await?)),
        Err(e) if is_unique_violation(&e) => Err(EngineError::NameConflict {
            name: new.name.to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}

fn row_to_collection(row: &turso::Row) -> Result<Collection> {
    Ok(Collection {
        id: CollectionId(row.get::<i64>(0)?),
        parent_id: row.get::<Option<i64>>(1)?.map(CollectionId),
        name: row.get::<String>(2)?,
        remote_id: row.get::<String>(3)?,
        remote_revision: row.get::<String>(4)?,
        resource_id: ResourceId(row.get::<i64>(5)?),
        is_virtual: row.get::<i64>(6)? != 0,
        content_mime_types: decode_string_set(&row.get::<String>(7)?),
        cache_policy: decode_cache_policy(&row.get::<String>(8)?),
        enabled: row.get::<i64>(9)? != 0,
        list_preferences: decode_list_preferences(&row.get::<String>(10)?),
        query_string: row.get::<Option<String>>(11)?,
        query_attributes: decode_string_vec(&row.get::<String>(12)?),
        query_collection_ids: decode_string_vec(&row.get::<String>(13)?)
            .into_iter()
            .filter_map(|s| s.parse::<i64>().ok())
            .map(CollectionId)
            .collect(),
        attributes: decode_attributes(&row.get::<Vec<u8>>(14)?),
    })
}

const COLLECTION_COLUMNS: &str = "id, parent_id, name, remote_id, remote_revision, resource_id, \
    is_virtual, content_mime_types, cache_policy, enabled, list_preferences, query_string, \
    query_attributes, query_collection_ids, attributes";

pub async fn get_collection(
    conn: &turso::Connection,
    id: CollectionId,
) -> Result<Option<Collection>> {
    let sql = format!("SELECT {} FROM collections WHERE id = ?", COLLECTION_COLUMNS);
    let mut stmt = conn.prepare(&sql).await?;
    let mut rows = stmt.query(params![id.get()]).await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row_to_collection(&row)?)),
        None => Ok(None),
    }
}

pub async fn find_collections(
    conn: &turso::Connection,
    filter: &Filter,
) -> Result<Vec<Collection>> {
    let (clause, params) = compile(filter);
    let sql = if clause.is_empty() {
        format!("SELECT {} FROM collections", COLLECTION_COLUMNS)
    } else {
        format!("SELECT {} FROM collections WHERE {}", COLLECTION_COLUMNS, clause)
    };
    let mut stmt = conn.prepare(&sql).await?;
    let mut rows = stmt.query(params).await?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        out.push(row_to_collection(&row)?);
    }
    Ok(out)
}

pub async fn children_of(
    conn: &turso::Connection,
    parent_id: Option<CollectionId>,
) -> Result<Vec<Collection>> {
    let filter = match parent_id {
        Some(id) => Filter::Eq("parent_id".into(), Value::Integer(id.get())),
        None => Filter::IsNull("parent_id".into()),
    };
    find_collections(conn, &filter).await
}

pub async fn find_collection_by_name(
    conn: &turso::Connection,
    parent_id: Option<CollectionId>,
    name: &str,
) -> Result<Option<Collection>> {
    let mut conditions = vec![Filter::Eq("name".into(), Value::String(name.to_string()))];
    conditions.push(match parent_id {
        Some(id) => Filter::Eq("parent_id".into(), Value::Integer(id.get())),
        None => Filter::IsNull("parent_id".into()),
    });
    Ok(find_collections(conn, &Filter::And(conditions))
        .await?
        .into_iter()
        .next())
}

/// Candidate ids for one hrid-chain step (used by `HridResolver`).
pub async fn collections_by_resource_rid(
    conn: &turso::Connection,
    resource_id: i64,
    rid: &str,
    parent: Option<i64>,
) -> Result<Vec<i64>> {
    let mut conditions = vec![
        Filter::Eq("resource_id".into(), Value::Integer(resource_id)),
        Filter::Eq("remote_id".into(), Value::String(rid.to_string())),
    ];
    conditions.push(match parent {
        Some(p) => Filter::Eq("parent_id".into(), Value::Integer(p)),
        None => Filter::IsNull("parent_id".into()),
    });
    Ok(find_collections(conn, &Filter::And(conditions))
        .await?
        .into_iter()
        .map(|c| c.id.get())
        .collect())
}

pub async fn rename_collection(conn: &turso::Connection, id: CollectionId, name: &str) -> Result<()> {
    let result = conn
        .execute(
            "UPDATE collections SET name = ? WHERE id = ?",
            params![name.to_string(), id.get()],
        )
        .await;
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(EngineError::NameConflict {
            name: name.to_string(),
        }),
        Err(e) => Err(e.into()),
    }
}

pub async fn reparent_collection(
    conn: &turso::Connection,
    id: CollectionId,
    new_parent: CollectionId,
) -> Result<()> {
    let result = conn
        .execute(
            "UPDATE collections SET parent_id = ? WHERE id = ?",
            params![new_parent.get(), id.get()],
        )
        .await;
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(EngineError::NameConflict {
            name: String::new(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Cascading piece of a cross-resource collection move: `collections` has
/// no trigger-based cascade, so the caller walks the subtree and calls
/// this once per node.
pub async fn set_collection_resource(
    conn: &turso::Connection,
    id: CollectionId,
    resource_id: ResourceId,
) -> Result<()> {
    conn.execute(
        "UPDATE collections SET resource_id = ? WHERE id = ?",
        params![resource_id.get(), id.get()],
    )
    .await?;
    Ok(())
}

pub async fn update_collection_fields(
    conn: &turso::Connection,
    id: CollectionId,
    remote_id: Option<&str>,
    remote_revision: Option<&str>,
    content_mime_types: Option<&HashSet<String>>,
    cache_policy: Option<&CachePolicy>,
    enabled: Option<bool>,
    list_preferences: Option<&ListPreferences>,
    query_string: Option<Option<&str>>,
) -> Result<()> {
    if let Some(v) = remote_id {
        conn.execute(
            "UPDATE collections SET remote_id = ? WHERE id = ?",
            params![v.to_string(), id.get()],
        )
        .await?;
    }
    if let Some(v) = remote_revision {
        conn.execute(
            "UPDATE collections SET remote_revision = ? WHERE id = ?",
            params![v.to_string(), id.get()],
        )
        .await?;
    }
    if let Some(v) = content_mime_types {
        conn.execute(
            "UPDATE collections SET content_mime_types = ? WHERE id = ?",
            params![encode_string_set(v), id.get()],
        )
        .await?;
    }
    if let Some(v) = cache_policy {
        conn.execute(
            "UPDATE collections SET cache_policy = ? WHERE id = ?",
            params![encode_cache_policy(v), id.get()],
        )
        .await?;
    }
    if let Some(v) = enabled {
        conn.execute(
            "UPDATE collections SET enabled = ? WHERE id = ?",
            params![v as i64, id.get()],
        )
        .await?;
    }
    if let Some(v) = list_preferences {
        conn.execute(
            "UPDATE collections SET list_preferences = ? WHERE id = ?",
            params![encode_list_preferences(v), id.get()],
        )
        .await?;
    }
    if let Some(v) = query_string {
        conn.execute(
            "UPDATE collections SET query_string = ? WHERE id = ?",
            params![v.map(|s| s.to_string()), id.get()],
        )
        .await?;
    }
    Ok(())
}

pub async fn merge_collection_attributes(
    conn: &turso::Connection,
    id: CollectionId,
    add: &AttributeMap,
    remove: &[String],
) -> Result<()> {
    let mut current = get_collection(conn, id)
        .await?
        .ok_or(EngineError::NotFound)?
        .attributes;
    for key in remove {
        current.remove(key);
    }
    for (k, v) in add {
        current.insert(k.clone(), v.clone());
    }
    conn.execute(
        "UPDATE collections SET attributes = ? WHERE id = ?",
        params![encode_attributes(&current), id.get()],
    )
    .await?;
    Ok(())
}

pub async fn delete_collection_row(conn: &turso::Connection, id: CollectionId) -> Result<()> {
    conn.execute("DELETE FROM collections WHERE id = ?", params![id.get()])
        .await?;
    Ok(())
}

/// Stamps a collection as just-synced, read by the interval checker to
/// decide when it's next due (spec §9: "producer of sync jobs").
pub async fn touch_last_synced(conn: &turso::Connection, id: CollectionId, at: &str) -> Result<()> {
    conn.execute(
        "UPDATE collections SET last_synced = ? WHERE id = ?",
        params![at.to_string(), id.get()],
    )
    .await?;
    Ok(())
}

pub async fn collection_statistics(
    conn: &turso::Connection,
    id: CollectionId,
) -> Result<CollectionStatistics> {
    let mut stmt = conn
        .prepare(
            "SELECT COUNT(*), COALESCE(SUM(size), 0),
                    SUM(CASE WHEN flags NOT LIKE '%\\\\SEEN%' THEN 1 ELSE 0 END)
             FROM items WHERE collection_id = ?",
        )
        .await?;
    let mut rows = stmt.query(params![id.get()]).await?;
    if let Some(row) = rows.next().await? {
        Ok(CollectionStatistics {
            count: row.get::<i64>(0)?,
            size: row.get::<i64>(1)?,
            unseen_count: row.get::<Option<i64>>(2)?.unwrap_or(0),
        })
    } else {
        Ok(CollectionStatistics::default())
    }
}

// -------------------------------------------------------------------- Items

pub struct NewItem<'a> {
    pub collection_id: CollectionId,
    pub mime_type: &'a str,
    pub remote_id: &'a str,
    pub remote_revision: &'a str,
    pub gid: &'a str,
    pub size: i64,
    pub flags: &'a HashSet<String>,
    pub attributes: &'a AttributeMap,
}

pub async fn insert_item(conn: &turso::Connection, new: NewItem<'_>) -> Result<ItemId> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO items
            (collection_id, mime_type, remote_id, remote_revision, gid, revision,
             created, modified, size, dirty, flags, attributes)
         VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, 0, ?, ?)",
        params![
            new.collection_id.get(),
            new.mime_type.to_string(),
            new.remote_id.to_string(),
            new.remote_revision.to_string(),
            new.gid.to_string(),
            now.clone(),
            now,
            new.size,
            encode_string_set(new.flags),
            encode_attributes(new.attributes),
        ],
    )
    .await?;
    Ok(ItemId(last_insert_rowid(conn).await?))
}

fn row_to_item(row: &turso::Row) -> Result<Item> {
    Ok(Item {
        id: ItemId(row.get::<i64>(0)?),
        collection_id: CollectionId(row.get::<i64>(1)?),
        mime_type: row.get::<String>(2)?,
        remote_id: row.get::<String>(3)?,
        remote_revision: row.get::<String>(4)?,
        gid: row.get::<String>(5)?,
        revision: row.get::<i64>(6)?,
        created: row.get::<String>(7)?,
        modified: row.get::<String>(8)?,
        size: row.get::<i64>(9)?,
        dirty: row.get::<i64>(10)? != 0,
        flags: decode_string_set(&row.get::<String>(11)?),
        tags: HashSet::new(),
        attributes: decode_attributes(&row.get::<Vec<u8>>(12)?),
    })
}

const ITEM_COLUMNS: &str = "id, collection_id, mime_type, remote_id, remote_revision, gid, \
    revision, created, modified, size, dirty, flags, attributes";

pub async fn get_item(conn: &turso::Connection, id: ItemId) -> Result<Option<Item>> {
    let sql = format!("SELECT {} FROM items WHERE id = ?", ITEM_COLUMNS);
    let mut stmt = conn.prepare(&sql).await?;
    let mut rows = stmt.query(params![id.get()]).await?;
    match rows.next().await? {
        Some(row) => {
            let mut item = row_to_item(&row)?;
            item.tags = item_tag_ids(conn, id).await?;
            Ok(Some(item))
        }
        None => Ok(None),
    }
}

pub async fn find_items(conn: &turso::Connection, filter: &Filter) -> Result<Vec<Item>> {
    let (clause, params) = compile(filter);
    let sql = if clause.is_empty() {
        format!("SELECT {} FROM items", ITEM_COLUMNS)
    } else {
        format!("SELECT {} FROM items WHERE {}", ITEM_COLUMNS, clause)
    };
    let mut stmt = conn.prepare(&sql).await?;
    let mut rows = stmt.query(params).await?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        out.push(row_to_item(&row)?);
    }
    Ok(out)
}

pub async fn items_in_collection(conn: &turso::Connection, id: CollectionId) -> Result<Vec<Item>> {
    find_items(conn, &Filter::Eq("collection_id".into(), Value::Integer(id.get()))).await
}

pub async fn find_item_by_remote_id(
    conn: &turso::Connection,
    collection_id: CollectionId,
    remote_id: &str,
) -> Result<Option<Item>> {
    let filter = Filter::And(vec![
        Filter::Eq("collection_id".into(), Value::Integer(collection_id.get())),
        Filter::Eq("remote_id".into(), Value::String(remote_id.to_string())),
    ]);
    Ok(find_items(conn, &filter).await?.into_iter().next())
}

pub async fn find_items_by_gid(
    conn: &turso::Connection,
    collection_id: CollectionId,
    gid: &str,
) -> Result<Vec<Item>> {
    let filter = Filter::And(vec![
        Filter::Eq("collection_id".into(), Value::Integer(collection_id.get())),
        Filter::Eq("gid".into(), Value::String(gid.to_string())),
    ]);
    find_items(conn, &filter).await
}

pub async fn set_item_collection(
    conn: &turso::Connection,
    id: ItemId,
    collection_id: CollectionId,
) -> Result<()> {
    conn.execute(
        "UPDATE items SET collection_id = ? WHERE id = ?",
        params![collection_id.get(), id.get()],
    )
    .await?;
    Ok(())
}

pub async fn clear_item_remote_id(conn: &turso::Connection, id: ItemId) -> Result<()> {
    conn.execute(
        "UPDATE items SET remote_id = '' WHERE id = ?",
        params![id.get()],
    )
    .await?;
    Ok(())
}

pub async fn set_item_dirty(conn: &turso::Connection, id: ItemId, dirty: bool) -> Result<()> {
    conn.execute(
        "UPDATE items SET dirty = ? WHERE id = ?",
        params![dirty as i64, id.get()],
    )
    .await?;
    Ok(())
}

/// Applies a modify-command field set. Revision bumping is the caller's
/// decision (spec §3 invariant 4); this function only writes columns.
pub struct ItemPatch<'a> {
    pub remote_id: Option<&'a str>,
    pub remote_revision: Option<&'a str>,
    pub gid: Option<&'a str>,
    pub size: Option<i64>,
    pub flags: Option<&'a HashSet<String>>,
    pub clear_dirty: bool,
    pub bump_revision: bool,
    pub modified: &'a str,
}

pub async fn patch_item(conn: &turso::Connection, id: ItemId, patch: ItemPatch<'_>) -> Result<()> {
    if let Some(v) = patch.remote_id {
        conn.execute(
            "UPDATE items SET remote_id = ? WHERE id = ?",
            params![v.to_string(), id.get()],
        )
        .await?;
    }
    if let Some(v) = patch.remote_revision {
        conn.execute(
            "UPDATE items SET remote_revision = ? WHERE id = ?",
            params![v.to_string(), id.get()],
        )
        .await?;
    }
    if let Some(v) = patch.gid {
        conn.execute(
            "UPDATE items SET gid = ? WHERE id = ?",
            params![v.to_string(), id.get()],
        )
        .await?;
    }
    if let Some(v) = patch.size {
        conn.execute(
            "UPDATE items SET size = ? WHERE id = ?",
            params![v, id.get()],
        )
        .await?;
    }
    if let Some(v) = patch.flags {
        conn.execute(
            "UPDATE items SET flags = ? WHERE id = ?",
            params![encode_string_set(v), id.get()],
        )
        .await?;
    }
    if patch.clear_dirty {
        conn.execute("UPDATE items SET dirty = 0 WHERE id = ?", params![id.get()])
            .await?;
    }
    conn.execute(
        "UPDATE items SET modified = ? WHERE id = ?",
        params![patch.modified.to_string(), id.get()],
    )
    .await?;
    if patch.bump_revision {
        conn.execute(
            "UPDATE items SET revision = revision + 1 WHERE id = ?",
            params![id.get()],
        )
        .await?;
    }
    Ok(())
}

pub async fn delete_item_row(conn: &turso::Connection, id: ItemId) -> Result<()> {
    conn.execute("DELETE FROM item_tags WHERE item_id = ?", params![id.get()])
        .await?;
    conn.execute(
        "DELETE FROM virtual_memberships WHERE item_id = ?",
        params![id.get()],
    )
    .await?;
    conn.execute(
        "DELETE FROM relations WHERE left_item = ? OR right_item = ?",
        params![id.get(), id.get()],
    )
    .await?;
    conn.execute("DELETE FROM items WHERE id = ?", params![id.get()])
        .await?;
    Ok(())
}

// -------------------------------------------------------------------- Parts

pub async fn upsert_part(
    conn: &turso::Connection,
    item_id: ItemId,
    name: &str,
    data: Option<&[u8]>,
    storage: PartStorage,
    external_ref: Option<&str>,
    size: i64,
) -> Result<()> {
    let storage_str = match storage {
        PartStorage::Internal => "internal",
        PartStorage::External => "external",
        PartStorage::Foreign => "foreign",
    };
    conn.execute(
        "INSERT INTO parts (item_id, name, data, storage, external_ref, size)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(item_id, name) DO UPDATE SET
            data = excluded.data, storage = excluded.storage,
            external_ref = excluded.external_ref, size = excluded.size",
        params![
            item_id.get(),
            name.to_string(),
            data.map(|d| d.to_vec()),
            storage_str.to_string(),
            external_ref.map(|s| s.to_string()),
            size,
        ],
    )
    .await?;
    Ok(())
}

fn row_to_part(row: &turso::Row) -> Result<Part> {
    let storage = match row.get::<String>(3)?.as_str() {
        "internal" => PartStorage::Internal,
        "external" => PartStorage::External,
        _ => PartStorage::Foreign,
    };
    Ok(Part {
        item_id: ItemId(row.get::<i64>(0)?),
        name: row.get::<String>(1)?,
        data: row.get::<Option<Vec<u8>>>(2)?,
        storage,
        external_ref: row.get::<Option<String>>(4)?,
        size: row.get::<i64>(5)?,
    })
}

const PART_COLUMNS: &str = "item_id, name, data, storage, external_ref, size";

pub async fn parts_for_item(conn: &turso::Connection, item_id: ItemId) -> Result<Vec<Part>> {
    let sql = format!(
        "SELECT {} FROM parts WHERE item_id = ? ORDER BY name",
        PART_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).await?;
    let mut rows = stmt.query(params![item_id.get()]).await?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        out.push(row_to_part(&row)?);
    }
    Ok(out)
}

pub async fn payload_parts_for_item(
    conn: &turso::Connection,
    item_id: ItemId,
) -> Result<Vec<Part>> {
    Ok(parts_for_item(conn, item_id)
        .await?
        .into_iter()
        .filter(Part::is_payload)
        .collect())
}

pub async fn delete_part(conn: &turso::Connection, item_id: ItemId, name: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM parts WHERE item_id = ? AND name = ?",
        params![item_id.get(), name.to_string()],
    )
    .await?;
    Ok(())
}

pub async fn delete_parts_for_item(conn: &turso::Connection, item_id: ItemId) -> Result<Vec<Part>> {
    let parts = parts_for_item(conn, item_id).await?;
    conn.execute("DELETE FROM parts WHERE item_id = ?", params![item_id.get()])
        .await?;
    Ok(parts)
}

// ---------------------------------------------------------------------- Tags

pub async fn create_tag(
    conn: &turso::Connection,
    gid: &str,
    tag_type: &str,
    parent_id: Option<TagId>,
    attributes: &AttributeMap,
) -> Result<TagId> {
    conn.execute(
        "INSERT INTO tags (gid, tag_type, parent_id, attributes) VALUES (?, ?, ?, ?)",
        params![
            gid.to_string(),
            tag_type.to_string(),
            parent_id.map(|p| p.get()),
            encode_attributes(attributes),
        ],
    )
    .await?;
    Ok(TagId(last_insert_rowid(conn).await?))
}

pub async fn get_tag_by_gid(conn: &turso::Connection, gid: &str) -> Result<Option<Tag>> {
    let mut stmt = conn
        .prepare("SELECT id, gid, tag_type, parent_id, attributes FROM tags WHERE gid = ?")
        .await?;
    let mut rows = stmt.query(params![gid.to_string()]).await?;
    if let Some(row) = rows.next().await? {
        Ok(Some(Tag {
            id: TagId(row.get::<i64>(0)?),
            gid: row.get::<String>(1)?,
            tag_type: row.get::<String>(2)?,
            parent_id: row.get::<Option<i64>>(3)?.map(TagId),
            attributes: decode_attributes(&row.get::<Vec<u8>>(4)?),
        }))
    } else {
        Ok(None)
    }
}

const TAG_COLUMNS: &str = "id, gid, tag_type, parent_id, attributes";

fn row_to_tag(row: &turso::Row) -> Result<Tag> {
    Ok(Tag {
        id: TagId(row.get::<i64>(0)?),
        gid: row.get::<String>(1)?,
        tag_type: row.get::<String>(2)?,
        parent_id: row.get::<Option<i64>>(3)?.map(TagId),
        attributes: decode_attributes(&row.get::<Vec<u8>>(4)?),
    })
}

pub async fn get_tag(conn: &turso::Connection, id: TagId) -> Result<Option<Tag>> {
    let sql = format!("SELECT {} FROM tags WHERE id = ?", TAG_COLUMNS);
    let mut stmt = conn.prepare(&sql).await?;
    let mut rows = stmt.query(params![id.get()]).await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row_to_tag(&row)?)),
        None => Ok(None),
    }
}

pub async fn find_tags(conn: &turso::Connection, filter: &Filter) -> Result<Vec<Tag>> {
    let (clause, params) = compile(filter);
    let sql = if clause.is_empty() {
        format!("SELECT {} FROM tags", TAG_COLUMNS)
    } else {
        format!("SELECT {} FROM tags WHERE {}", TAG_COLUMNS, clause)
    };
    let mut stmt = conn.prepare(&sql).await?;
    let mut rows = stmt.query(params).await?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        out.push(row_to_tag(&row)?);
    }
    Ok(out)
}

pub async fn merge_tag_attributes(
    conn: &turso::Connection,
    id: TagId,
    add: &AttributeMap,
    remove: &[String],
) -> Result<()> {
    let mut current = get_tag(conn, id).await?.ok_or(EngineError::NotFound)?.attributes;
    for key in remove {
        current.remove(key);
    }
    for (k, v) in add {
        current.insert(k.clone(), v.clone());
    }
    conn.execute(
        "UPDATE tags SET attributes = ? WHERE id = ?",
        params![encode_attributes(&current), id.get()],
    )
    .await?;
    Ok(())
}

pub async fn set_tag_parent(conn: &turso::Connection, id: TagId, parent_id: Option<TagId>) -> Result<()> {
    conn.execute(
        "UPDATE tags SET parent_id = ? WHERE id = ?",
        params![parent_id.map(|p| p.get()), id.get()],
    )
    .await?;
    Ok(())
}

pub async fn upsert_tag_remote_id(
    conn: &turso::Connection,
    tag_id: TagId,
    resource_id: ResourceId,
    remote_id: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO tag_remote_ids (tag_id, resource_id, remote_id) VALUES (?, ?, ?)
         ON CONFLICT(tag_id, resource_id) DO UPDATE SET remote_id = excluded.remote_id",
        params![tag_id.get(), resource_id.get(), remote_id.to_string()],
    )
    .await?;
    Ok(())
}

pub async fn delete_tag_row(conn: &turso::Connection, id: TagId) -> Result<()> {
    conn.execute("DELETE FROM tag_remote_ids WHERE tag_id = ?", params![id.get()])
        .await?;
    conn.execute("DELETE FROM item_tags WHERE tag_id = ?", params![id.get()])
        .await?;
    conn.execute("DELETE FROM tags WHERE id = ?", params![id.get()])
        .await?;
    Ok(())
}

pub async fn items_tagged_with(conn: &turso::Connection, tag_id: TagId) -> Result<Vec<ItemId>> {
    let mut stmt = conn
        .prepare("SELECT item_id FROM item_tags WHERE tag_id = ?")
        .await?;
    let mut rows = stmt.query(params![tag_id.get()]).await?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        out.push(ItemId(row.get::<i64>(0)?));
    }
    Ok(out)
}

pub async fn item_tag_ids(conn: &turso::Connection, item_id: ItemId) -> Result<HashSet<TagId>> {
    let mut stmt = conn
        .prepare("SELECT tag_id FROM item_tags WHERE item_id = ?")
        .await?;
    let mut rows = stmt.query(params![item_id.get()]).await?;
    let mut out = HashSet::new();
    while let Some(row) = rows.next().await? {
        out.insert(TagId(row.get::<i64>(0)?));
    }
    Ok(out)
}

pub async fn add_item_tag(conn: &turso::Connection, item_id: ItemId, tag_id: TagId) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO item_tags (item_id, tag_id) VALUES (?, ?)",
        params![item_id.get(), tag_id.get()],
    )
    .await?;
    Ok(())
}

pub async fn remove_item_tag(
    conn: &turso::Connection,
    item_id: ItemId,
    tag_id: TagId,
) -> Result<()> {
    conn.execute(
        "DELETE FROM item_tags WHERE item_id = ? AND tag_id = ?",
        params![item_id.get(), tag_id.get()],
    )
    .await?;
    Ok(())
}

// --------------------------------------------------------- Virtual memberships

pub async fn link_item(
    conn: &turso::Connection,
    collection_id: CollectionId,
    item_id: ItemId,
) -> Result<bool> {
    let mut stmt = conn
        .prepare(
            "SELECT 1 FROM virtual_memberships WHERE collection_id = ? AND item_id = ?",
        )
        .await?;
    let mut rows = stmt.query(params![collection_id.get(), item_id.get()]).await?;
    if rows.next().await?.is_some() {
        return Ok(false);
    }
    conn.execute(
        "INSERT INTO virtual_memberships (collection_id, item_id) VALUES (?, ?)",
        params![collection_id.get(), item_id.get()],
    )
    .await?;
    Ok(true)
}

pub async fn unlink_item(
    conn: &turso::Connection,
    collection_id: CollectionId,
    item_id: ItemId,
) -> Result<bool> {
    let changed = conn
        .execute(
            "DELETE FROM virtual_memberships WHERE collection_id = ? AND item_id = ?",
            params![collection_id.get(), item_id.get()],
        )
        .await?;
    Ok(changed > 0)
}

pub async fn virtual_members(
    conn: &turso::Connection,
    collection_id: CollectionId,
) -> Result<Vec<ItemId>> {
    let mut stmt = conn
        .prepare("SELECT item_id FROM virtual_memberships WHERE collection_id = ?")
        .await?;
    let mut rows = stmt.query(params![collection_id.get()]).await?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        out.push(ItemId(row.get::<i64>(0)?));
    }
    Ok(out)
}

/// Upserts the `(session_id, collection_id)` subscription row (spec §4.3's
/// Subscription state supplement; absent row means the default, `enabled`).
pub async fn set_subscription(
    conn: &turso::Connection,
    session_id: &str,
    collection_id: CollectionId,
    subscribed: bool,
) -> Result<()> {
    conn.execute(
        "INSERT INTO collection_subscriptions (session_id, collection_id, subscribed)
         VALUES (?, ?, ?)
         ON CONFLICT (session_id, collection_id) DO UPDATE SET subscribed = excluded.subscribed",
        params![session_id.to_string(), collection_id.get(), subscribed as i64],
    )
    .await?;
    Ok(())
}

/// `None` means no row exists for this pair, i.e. the default (`enabled`).
pub async fn get_subscription(
    conn: &turso::Connection,
    session_id: &str,
    collection_id: CollectionId,
) -> Result<Option<bool>> {
    let mut stmt = conn
        .prepare("SELECT subscribed FROM collection_subscriptions WHERE session_id = ? AND collection_id = ?")
        .await?;
    let mut rows = stmt.query(params![session_id.to_string(), collection_id.get()]).await?;
    match rows.next().await? {
        Some(row) => Ok(Some(row.get::<i64>(0)? != 0)),
        None => Ok(None),
    }
}
