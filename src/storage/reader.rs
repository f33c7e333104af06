//! Read-only queries, always in the context of a branch.
//!
//! A [`Reader`] wraps a connection that the coordinator has already bound to
//! the caller's branch; every query observes that branch's committed state
//! plus the session's working set.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use sqlx::mysql::MySqlRow;
use sqlx::types::Json;
use sqlx::{MySql, MySqlConnection, QueryBuilder, Row as _};

use crate::error::Result;
use crate::model::{
    BlockLink, BlockProof, BlockProperty, BlockState, BranchInfo, Confidence, ListBlockFilters,
    ListLinkFilters, MemoryBlock, Namespace, Page, ProofOperation, PropertyValue, Visibility,
};
use crate::storage::pool::active_branch;
use crate::util::cursor;

/// Hard ceiling on page sizes, independent of what callers request.
pub const MAX_PAGE_LIMIT: u32 = 500;

const BLOCK_COLUMNS: &str = "id, namespace_id, `type`, schema_version, `text`, state, visibility, \
     block_version, parent_id, has_children, tags, metadata, source_file, source_uri, \
     confidence, created_by, created_at, updated_at, embedding";

/// Read-only query surface over one branch-bound connection.
pub struct Reader<'a> {
    conn: &'a mut MySqlConnection,
}

impl<'a> Reader<'a> {
    pub fn new(conn: &'a mut MySqlConnection) -> Self {
        Self { conn }
    }

    /// Get a block by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_block(&mut self, id: &str) -> Result<Option<MemoryBlock>> {
        let sql = format!("SELECT {BLOCK_COLUMNS} FROM memory_blocks WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.conn)
            .await?;
        row.as_ref().map(block_from_row).transpose()
    }

    /// List blocks matching the filters, cursor-paged.
    ///
    /// # Errors
    ///
    /// `InvalidCursor` for a cursor this service did not produce; otherwise
    /// query failures.
    pub async fn list_blocks(&mut self, filters: &ListBlockFilters) -> Result<Page<MemoryBlock>> {
        let offset = match &filters.cursor {
            Some(cursor) => cursor::decode(cursor)?,
            None => 0,
        };
        let limit = filters.limit.clamp(1, MAX_PAGE_LIMIT);

        let mut qb = QueryBuilder::<MySql>::new(format!(
            "SELECT {BLOCK_COLUMNS} FROM memory_blocks WHERE 1=1"
        ));

        if let Some(node_type) = &filters.node_type {
            qb.push(" AND `type` = ").push_bind(node_type);
        }
        if let Some(state) = filters.state {
            qb.push(" AND state = ").push_bind(state.as_str());
        }
        if let Some(visibility) = filters.visibility {
            qb.push(" AND visibility = ").push_bind(visibility.as_str());
        }
        if let Some(namespace) = &filters.namespace {
            qb.push(" AND namespace_id = ").push_bind(namespace);
        }
        if let Some(tag) = &filters.tag {
            qb.push(" AND JSON_CONTAINS(tags, JSON_QUOTE(").push_bind(tag).push("))");
        }
        if let Some(parent_id) = &filters.parent_id {
            qb.push(" AND parent_id = ").push_bind(parent_id);
        }
        if let Some(created_after) = filters.created_after {
            qb.push(" AND created_at > ").push_bind(created_after.naive_utc());
        }

        qb.push(" ORDER BY created_at ASC, id ASC");
        // Probe one row past the limit to learn whether a next page exists.
        qb.push(" LIMIT ").push_bind(i64::from(limit) + 1);
        qb.push(" OFFSET ").push_bind(i64::try_from(offset).unwrap_or(i64::MAX));

        let rows = qb.build().fetch_all(&mut *self.conn).await?;
        paginate(rows, limit, offset, block_from_row)
    }

    /// List links matching the filters, cursor-paged.
    ///
    /// # Errors
    ///
    /// Same contract as [`Reader::list_blocks`].
    pub async fn list_links(&mut self, filters: &ListLinkFilters) -> Result<Page<BlockLink>> {
        let offset = match &filters.cursor {
            Some(cursor) => cursor::decode(cursor)?,
            None => 0,
        };
        let limit = filters.limit.clamp(1, MAX_PAGE_LIMIT);

        let mut qb = QueryBuilder::<MySql>::new(
            "SELECT from_id, to_id, relation, priority, link_metadata, created_by, created_at \
             FROM block_links WHERE 1=1",
        );

        if let Some(from_id) = &filters.from_id {
            qb.push(" AND from_id = ").push_bind(from_id);
        }
        if let Some(to_id) = &filters.to_id {
            qb.push(" AND to_id = ").push_bind(to_id);
        }
        if let Some(relation) = &filters.relation {
            qb.push(" AND relation = ").push_bind(relation);
        }

        qb.push(" ORDER BY from_id ASC, to_id ASC, relation ASC");
        qb.push(" LIMIT ").push_bind(i64::from(limit) + 1);
        qb.push(" OFFSET ").push_bind(i64::try_from(offset).unwrap_or(i64::MAX));

        let rows = qb.build().fetch_all(&mut *self.conn).await?;
        paginate(rows, limit, offset, link_from_row)
    }

    /// List all branches with head commit, dirty flag, and which one this
    /// session is bound to.
    ///
    /// The backend only exposes working-set status for the session's own
    /// branch; other branches report `dirty: false`.
    ///
    /// # Errors
    ///
    /// Returns an error if the system-table queries fail.
    pub async fn list_branches(&mut self) -> Result<Vec<BranchInfo>> {
        let active = active_branch(self.conn).await?;

        let status_rows: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM dolt_status")
                .fetch_one(&mut *self.conn)
                .await?;
        let active_dirty = status_rows > 0;

        let rows = sqlx::query("SELECT name, hash FROM dolt_branches ORDER BY name")
            .fetch_all(&mut *self.conn)
            .await?;

        rows.iter()
            .map(|row| {
                let name: String = row.try_get("name")?;
                let head_commit: String = row.try_get("hash")?;
                let is_active = name == active;
                Ok(BranchInfo {
                    dirty: is_active && active_dirty,
                    active: is_active,
                    name,
                    head_commit,
                })
            })
            .collect()
    }

    /// List all namespaces.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn list_namespaces(&mut self) -> Result<Vec<Namespace>> {
        let rows = sqlx::query(
            "SELECT id, name, slug, owner_id, description, created_at
             FROM namespaces ORDER BY slug",
        )
        .fetch_all(&mut *self.conn)
        .await?;

        rows.iter().map(namespace_from_row).collect()
    }

    /// The decomposed property rows of a block.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_properties(&mut self, block_id: &str) -> Result<Vec<BlockProperty>> {
        let rows = sqlx::query(
            "SELECT block_id, property_name, value_text, value_number, value_json,
                    property_type, is_computed, created_at, updated_at
             FROM block_properties WHERE block_id = ? ORDER BY property_name",
        )
        .bind(block_id)
        .fetch_all(&mut *self.conn)
        .await?;

        rows.iter().map(property_from_row).collect()
    }

    /// Proof rows with an id greater than `after_id`, oldest first.
    ///
    /// Used by the index reconciler to find mutations the index has not
    /// observed yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn proofs_after(&mut self, after_id: i64, limit: u32) -> Result<Vec<BlockProof>> {
        let rows = sqlx::query(
            "SELECT id, block_id, commit_hash, operation, timestamp
             FROM block_proofs WHERE id > ? ORDER BY id ASC LIMIT ?",
        )
        .bind(after_id)
        .bind(i64::from(limit.clamp(1, MAX_PAGE_LIMIT)))
        .fetch_all(&mut *self.conn)
        .await?;

        rows.iter().map(proof_from_row).collect()
    }

    /// All proof rows for one block, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn proofs_for_block(&mut self, block_id: &str) -> Result<Vec<BlockProof>> {
        let rows = sqlx::query(
            "SELECT id, block_id, commit_hash, operation, timestamp
             FROM block_proofs WHERE block_id = ? ORDER BY id ASC",
        )
        .bind(block_id)
        .fetch_all(&mut *self.conn)
        .await?;

        rows.iter().map(proof_from_row).collect()
    }
}

fn paginate<T>(
    rows: Vec<MySqlRow>,
    limit: u32,
    offset: u64,
    map: impl Fn(&MySqlRow) -> Result<T>,
) -> Result<Page<T>> {
    let partial = rows.len() > limit as usize;
    let items: Vec<T> = rows
        .iter()
        .take(limit as usize)
        .map(map)
        .collect::<Result<_>>()?;

    let next_cursor = partial.then(|| cursor::encode(offset + u64::from(limit)));
    let page_size = u32::try_from(items.len()).unwrap_or(u32::MAX);

    Ok(Page {
        items,
        next_cursor,
        page_size,
        partial,
    })
}

pub(crate) fn block_from_row(row: &MySqlRow) -> Result<MemoryBlock> {
    let tags: Option<Json<Vec<String>>> = row.try_get("tags")?;
    let metadata: Option<Json<serde_json::Value>> = row.try_get("metadata")?;
    let confidence: Option<Json<Confidence>> = row.try_get("confidence")?;
    let embedding: Option<Json<Vec<f32>>> = row.try_get("embedding")?;
    let state: String = row.try_get("state")?;
    let visibility: String = row.try_get("visibility")?;

    Ok(MemoryBlock {
        id: row.try_get("id")?,
        namespace_id: row.try_get("namespace_id")?,
        node_type: row.try_get("type")?,
        schema_version: row.try_get::<i32, _>("schema_version")?.unsigned_abs(),
        text: row.try_get("text")?,
        state: state.parse::<BlockState>()?,
        visibility: visibility.parse::<Visibility>()?,
        block_version: i64::from(row.try_get::<i32, _>("block_version")?),
        parent_id: row.try_get("parent_id")?,
        has_children: row.try_get("has_children")?,
        tags: tags.map(|t| t.0).unwrap_or_default(),
        metadata: metadata
            .map(|m| m.0)
            .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new())),
        source_file: row.try_get("source_file")?,
        source_uri: row.try_get("source_uri")?,
        confidence: confidence.map(|c| c.0).unwrap_or_default(),
        created_by: row.try_get("created_by")?,
        created_at: to_utc(row.try_get("created_at")?),
        updated_at: to_utc(row.try_get("updated_at")?),
        embedding: embedding.map(|e| e.0),
    })
}

pub(crate) fn link_from_row(row: &MySqlRow) -> Result<BlockLink> {
    let link_metadata: Option<Json<serde_json::Value>> = row.try_get("link_metadata")?;

    Ok(BlockLink {
        from_id: row.try_get("from_id")?,
        to_id: row.try_get("to_id")?,
        relation: row.try_get("relation")?,
        priority: i64::from(row.try_get::<i32, _>("priority")?),
        link_metadata: link_metadata
            .map(|m| m.0)
            .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new())),
        created_by: row.try_get("created_by")?,
        created_at: to_utc(row.try_get("created_at")?),
    })
}

pub(crate) fn namespace_from_row(row: &MySqlRow) -> Result<Namespace> {
    Ok(Namespace {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        slug: row.try_get("slug")?,
        owner_id: row.try_get("owner_id")?,
        description: row.try_get("description")?,
        created_at: to_utc(row.try_get("created_at")?),
    })
}

pub(crate) fn property_from_row(row: &MySqlRow) -> Result<BlockProperty> {
    let value_text: Option<String> = row.try_get("value_text")?;
    let value_number: Option<f64> = row.try_get("value_number")?;
    let value_json: Option<Json<serde_json::Value>> = row.try_get("value_json")?;

    let value = match (value_text, value_number, value_json) {
        (Some(text), None, None) => PropertyValue::Text(text),
        (None, Some(number), None) => PropertyValue::Number(number),
        (None, None, Some(json)) => PropertyValue::Json(json.0),
        _ => {
            return Err(crate::error::MemoryBankError::Fatal {
                message: format!(
                    "property row {}/{} violates the one-value-column rule",
                    row.try_get::<String, _>("block_id").unwrap_or_default(),
                    row.try_get::<String, _>("property_name").unwrap_or_default(),
                ),
            });
        }
    };

    Ok(BlockProperty {
        block_id: row.try_get("block_id")?,
        property_name: row.try_get("property_name")?,
        value,
        is_computed: row.try_get("is_computed")?,
        created_at: to_utc(row.try_get("created_at")?),
        updated_at: to_utc(row.try_get("updated_at")?),
    })
}

pub(crate) fn proof_from_row(row: &MySqlRow) -> Result<BlockProof> {
    let operation: String = row.try_get("operation")?;
    Ok(BlockProof {
        id: row.try_get("id")?,
        block_id: row.try_get("block_id")?,
        commit_hash: row.try_get("commit_hash")?,
        operation: operation.parse::<ProofOperation>()?,
        timestamp: to_utc(row.try_get("timestamp")?),
    })
}

pub(crate) fn to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    Utc.from_utc_datetime(&naive)
}
