//! Mutations against a branch-pinned persistent session.
//!
//! Every primitive is atomic at the SQL level (its own transaction against
//! the branch working set). Version-control commits are separate: the facade
//! runs a primitive, then [`Writer::commit_with_proofs`] turns the staged
//! [`MutationContext`] into a Dolt commit plus the proof rows carrying its
//! hash.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::types::Json;
use sqlx::{Connection as _, MySql, MySqlConnection, QueryBuilder, Row as _};
use std::collections::HashSet;
use tracing::debug;

use crate::config::BankConfig;
use crate::error::{MemoryBankError, Result};
use crate::model::{
    BlockPatch, MemoryBlock, Namespace, ProofOperation, PropertyValue, relations,
};
use crate::schema::SchemaRegistry;
use crate::storage::links;
use crate::storage::pool::PersistentSession;
use crate::storage::reader::block_from_row;

static BRANCH_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/-]*$").expect("branch name pattern"));
static NAMESPACE_SLUG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").expect("slug pattern"));

const BLOCK_COLUMNS: &str = "id, namespace_id, `type`, schema_version, `text`, state, visibility, \
     block_version, parent_id, has_children, tags, metadata, source_file, source_uri, \
     confidence, created_by, created_at, updated_at, embedding";

/// How a merge resolves divergent histories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    FastForwardOrFail,
    ThreeWay,
}

/// Result of a merge.
#[derive(Debug, Clone, serde::Serialize, schemars::JsonSchema)]
pub struct MergeOutcome {
    /// The merge commit hash, absent for a no-op merge.
    pub hash: Option<String>,
    pub fast_forward: bool,
}

/// Context for one logical mutation, tracking the proofs it must leave
/// behind and the index work it implies.
pub struct MutationContext {
    pub op_name: String,
    pub actor: String,
    pub proofs: Vec<(String, ProofOperation)>,
    pub index_upserts: HashSet<String>,
    pub index_removals: HashSet<String>,
}

impl MutationContext {
    #[must_use]
    pub fn new(op_name: &str, actor: &str) -> Self {
        Self {
            op_name: op_name.to_string(),
            actor: actor.to_string(),
            proofs: Vec::new(),
            index_upserts: HashSet::new(),
            index_removals: HashSet::new(),
        }
    }

    pub fn record_proof(&mut self, block_id: &str, operation: ProofOperation) {
        self.proofs.push((block_id.to_string(), operation));
    }

    pub fn mark_for_index(&mut self, block_id: &str) {
        self.index_removals.remove(block_id);
        self.index_upserts.insert(block_id.to_string());
    }

    pub fn mark_removed_from_index(&mut self, block_id: &str) {
        self.index_upserts.remove(block_id);
        self.index_removals.insert(block_id.to_string());
    }
}

/// Mutation surface over one branch-pinned session.
pub struct Writer<'a> {
    session: &'a mut PersistentSession,
    registry: &'a SchemaRegistry,
    config: &'a BankConfig,
}

impl<'a> Writer<'a> {
    pub fn new(
        session: &'a mut PersistentSession,
        registry: &'a SchemaRegistry,
        config: &'a BankConfig,
    ) -> Self {
        Self {
            session,
            registry,
            config,
        }
    }

    /// Reject writes on protected branches and read-only sessions.
    fn ensure_writable(&self) -> Result<()> {
        if !self.session.mode().allows_writes() {
            return Err(MemoryBankError::Validation {
                entity: "session".to_string(),
                reason: "session was acquired read-only".to_string(),
            });
        }
        let branch = self.session.branch();
        if self.config.is_protected(branch) {
            return Err(MemoryBankError::ProtectedBranch {
                branch: branch.to_string(),
            });
        }
        Ok(())
    }

    /// Insert a new block.
    ///
    /// # Errors
    ///
    /// `Duplicate` when the id exists on this branch, `NamespaceMissing`
    /// when the namespace does not resolve, `Validation` when the metadata
    /// fails its registered schema, plus the usual write guards.
    pub async fn insert_block(
        &mut self,
        block: &MemoryBlock,
        ctx: &mut MutationContext,
    ) -> Result<()> {
        self.ensure_writable()?;

        block.confidence.validate()?;
        self.registry.validate(
            &block.node_type,
            Some(block.schema_version),
            &block.metadata,
        )?;

        let conn = self.session.conn()?;
        let mut tx = conn.begin().await?;

        let namespace_exists: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM namespaces WHERE id = ?")
                .bind(&block.namespace_id)
                .fetch_one(&mut *tx)
                .await?;
        if namespace_exists == 0 {
            return Err(MemoryBankError::NamespaceMissing {
                namespace: block.namespace_id.clone(),
            });
        }

        let id_exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM memory_blocks WHERE id = ?")
            .bind(&block.id)
            .fetch_one(&mut *tx)
            .await?;
        if id_exists > 0 {
            return Err(MemoryBankError::Duplicate {
                entity: "block",
                id: block.id.clone(),
            });
        }

        sqlx::query(
            "INSERT INTO memory_blocks (
                id, namespace_id, `type`, schema_version, `text`, state, visibility,
                block_version, parent_id, has_children, tags, metadata,
                source_file, source_uri, confidence, created_by,
                created_at, updated_at, embedding
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&block.id)
        .bind(&block.namespace_id)
        .bind(&block.node_type)
        .bind(i32::try_from(block.schema_version).unwrap_or(i32::MAX))
        .bind(&block.text)
        .bind(block.state.as_str())
        .bind(block.visibility.as_str())
        .bind(i32::try_from(block.block_version).unwrap_or(1))
        .bind(&block.parent_id)
        .bind(block.has_children)
        .bind(Json(&block.tags))
        .bind(Json(&block.metadata))
        .bind(&block.source_file)
        .bind(&block.source_uri)
        .bind(Json(&block.confidence))
        .bind(&block.created_by)
        .bind(block.created_at.naive_utc())
        .bind(block.updated_at.naive_utc())
        .bind(block.embedding.as_ref().map(Json))
        .execute(&mut *tx)
        .await?;

        sync_properties(&mut tx, &block.id, &block.metadata).await?;

        if let Some(parent_id) = &block.parent_id {
            sqlx::query("UPDATE memory_blocks SET has_children = 1 WHERE id = ?")
                .bind(parent_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        ctx.record_proof(&block.id, ProofOperation::Create);
        ctx.mark_for_index(&block.id);
        debug!(block_id = %block.id, branch = %self.session.branch(), "inserted block");
        Ok(())
    }

    /// Apply a patch to a block, bumping `block_version`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `OptimisticConflict` when the patch's
    /// expected version does not match the stored row, `Validation` for
    /// metadata that fails the block's schema.
    pub async fn update_block(
        &mut self,
        id: &str,
        patch: &BlockPatch,
        ctx: &mut MutationContext,
    ) -> Result<MemoryBlock> {
        self.ensure_writable()?;

        let current = self.load_block(id).await?.ok_or(MemoryBankError::NotFound {
            entity: "block",
            id: id.to_string(),
        })?;

        if let Some(expected) = patch.expected_version {
            if expected != current.block_version {
                return Err(MemoryBankError::OptimisticConflict {
                    id: id.to_string(),
                    expected,
                    observed: current.block_version,
                });
            }
        }

        if patch.is_empty() {
            return Ok(current);
        }

        if let Some(confidence) = &patch.confidence {
            confidence.validate()?;
        }
        if let Some(metadata) = &patch.metadata {
            self.registry.validate(
                &current.node_type,
                Some(current.schema_version),
                metadata,
            )?;
        }

        let next_version = current.block_version + 1;
        let now = Utc::now();

        let conn = self.session.conn()?;
        let mut tx = conn.begin().await?;

        let mut qb = QueryBuilder::<MySql>::new("UPDATE memory_blocks SET ");
        {
            let mut set = qb.separated(", ");
            if let Some(text) = &patch.text {
                set.push("`text` = ");
                set.push_bind_unseparated(text.clone());
            }
            if let Some(state) = patch.state {
                set.push("state = ");
                set.push_bind_unseparated(state.as_str());
            }
            if let Some(visibility) = patch.visibility {
                set.push("visibility = ");
                set.push_bind_unseparated(visibility.as_str());
            }
            if let Some(tags) = &patch.tags {
                set.push("tags = ");
                set.push_bind_unseparated(Json(tags.clone()));
            }
            if let Some(metadata) = &patch.metadata {
                set.push("metadata = ");
                set.push_bind_unseparated(Json(metadata.clone()));
            }
            if let Some(parent_id) = &patch.parent_id {
                set.push("parent_id = ");
                set.push_bind_unseparated(parent_id.clone());
            }
            if let Some(source_file) = &patch.source_file {
                set.push("source_file = ");
                set.push_bind_unseparated(source_file.clone());
            }
            if let Some(source_uri) = &patch.source_uri {
                set.push("source_uri = ");
                set.push_bind_unseparated(source_uri.clone());
            }
            if let Some(confidence) = &patch.confidence {
                set.push("confidence = ");
                set.push_bind_unseparated(Json(*confidence));
            }
            set.push("block_version = ");
            set.push_bind_unseparated(i32::try_from(next_version).unwrap_or(i32::MAX));
            set.push("updated_at = ");
            set.push_bind_unseparated(now.naive_utc());
        }
        qb.push(" WHERE id = ").push_bind(id);
        qb.build().execute(&mut *tx).await?;

        if let Some(metadata) = &patch.metadata {
            sync_properties(&mut tx, id, metadata).await?;
        }

        // Keep both ends of a reparent consistent.
        if let Some(new_parent) = &patch.parent_id {
            if let Some(parent_id) = new_parent {
                sqlx::query("UPDATE memory_blocks SET has_children = 1 WHERE id = ?")
                    .bind(parent_id)
                    .execute(&mut *tx)
                    .await?;
            }
            if let Some(old_parent) = &current.parent_id {
                if new_parent.as_deref() != Some(old_parent.as_str()) {
                    refresh_has_children(&mut tx, old_parent).await?;
                }
            }
        }

        tx.commit().await?;

        ctx.record_proof(id, ProofOperation::Update);
        ctx.mark_for_index(id);

        self.load_block(id).await?.ok_or(MemoryBankError::NotFound {
            entity: "block",
            id: id.to_string(),
        })
    }

    /// Hard-delete a block, its properties and every link touching it.
    ///
    /// A final `delete` proof row survives the block.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    pub async fn delete_block(
        &mut self,
        id: &str,
        ctx: &mut MutationContext,
    ) -> Result<MemoryBlock> {
        self.ensure_writable()?;

        let block = self.load_block(id).await?.ok_or(MemoryBankError::NotFound {
            entity: "block",
            id: id.to_string(),
        })?;

        let conn = self.session.conn()?;
        let mut tx = conn.begin().await?;

        sqlx::query("DELETE FROM block_properties WHERE block_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        links::delete_all_for(&mut *tx, id).await?;
        sqlx::query("UPDATE memory_blocks SET parent_id = NULL WHERE parent_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM memory_blocks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if let Some(parent_id) = &block.parent_id {
            refresh_has_children(&mut tx, parent_id).await?;
        }

        tx.commit().await?;

        ctx.record_proof(id, ProofOperation::Delete);
        ctx.mark_removed_from_index(id);
        debug!(block_id = %id, branch = %self.session.branch(), "deleted block");
        Ok(block)
    }

    /// Upsert a decomposed property row, enforcing the one-value-column rule
    /// by construction.
    ///
    /// # Errors
    ///
    /// Write guards and statement failures.
    pub async fn upsert_property(
        &mut self,
        block_id: &str,
        name: &str,
        value: &PropertyValue,
        is_computed: bool,
    ) -> Result<()> {
        self.ensure_writable()?;
        let conn = self.session.conn()?;
        let mut tx = conn.begin().await?;
        upsert_property_tx(&mut tx, block_id, name, value, is_computed).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Insert a single canonical link edge.
    ///
    /// # Errors
    ///
    /// `Validation` for a non-canonical relation, `NotFound` for missing
    /// endpoints, `Duplicate` for an existing triple, `CycleDetected` when
    /// the edge would close a dependency cycle.
    pub async fn insert_link(
        &mut self,
        from_id: &str,
        to_id: &str,
        relation: &str,
        priority: i64,
        metadata: &serde_json::Value,
        ctx: &mut MutationContext,
    ) -> Result<()> {
        self.ensure_writable()?;

        if !relations::is_canonical(relation) {
            return Err(MemoryBankError::Validation {
                entity: "link relation".to_string(),
                reason: format!("'{relation}' is not a canonical relation"),
            });
        }
        if from_id == to_id {
            return Err(MemoryBankError::Validation {
                entity: "link".to_string(),
                reason: "a block cannot link to itself".to_string(),
            });
        }

        let conn = self.session.conn()?;

        for endpoint in [from_id, to_id] {
            let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM memory_blocks WHERE id = ?")
                .bind(endpoint)
                .fetch_one(&mut *conn)
                .await?;
            if exists == 0 {
                return Err(MemoryBankError::NotFound {
                    entity: "block",
                    id: endpoint.to_string(),
                });
            }
        }

        let duplicate: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM block_links WHERE from_id = ? AND to_id = ? AND relation = ?",
        )
        .bind(from_id)
        .bind(to_id)
        .bind(relation)
        .fetch_one(&mut *conn)
        .await?;
        if duplicate > 0 {
            return Err(MemoryBankError::Duplicate {
                entity: "link",
                id: format!("{from_id} -> {to_id} ({relation})"),
            });
        }

        // Cycle check runs over committed plus staged edges before the write.
        if let Some(candidate) = links::dependency_edge(from_id, to_id, relation) {
            let committed = links::load_dependency_edges(&mut *conn).await?;
            if links::would_create_cycle(&committed, &candidate) {
                return Err(MemoryBankError::CycleDetected {
                    from: from_id.to_string(),
                    to: to_id.to_string(),
                    relation: relation.to_string(),
                });
            }
        }

        sqlx::query(
            "INSERT INTO block_links (from_id, to_id, relation, priority, link_metadata, created_by)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(from_id)
        .bind(to_id)
        .bind(relation)
        .bind(i32::try_from(priority).unwrap_or(0))
        .bind(Json(metadata))
        .bind(&ctx.actor)
        .execute(&mut *conn)
        .await?;

        ctx.mark_for_index(from_id);
        Ok(())
    }

    /// Delete one link triple.
    ///
    /// # Errors
    ///
    /// `NotFound` when the triple does not exist.
    pub async fn delete_link(
        &mut self,
        from_id: &str,
        to_id: &str,
        relation: &str,
        ctx: &mut MutationContext,
    ) -> Result<()> {
        self.ensure_writable()?;
        let conn = self.session.conn()?;

        let affected = sqlx::query(
            "DELETE FROM block_links WHERE from_id = ? AND to_id = ? AND relation = ?",
        )
        .bind(from_id)
        .bind(to_id)
        .bind(relation)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(MemoryBankError::NotFound {
                entity: "link",
                id: format!("{from_id} -> {to_id} ({relation})"),
            });
        }

        ctx.mark_for_index(from_id);
        Ok(())
    }

    /// Create a namespace.
    ///
    /// # Errors
    ///
    /// `Validation` for a malformed slug, `Duplicate` when id, name or slug
    /// collide with an existing namespace.
    pub async fn create_namespace(&mut self, namespace: &Namespace) -> Result<()> {
        self.ensure_writable()?;

        if !NAMESPACE_SLUG.is_match(&namespace.slug) {
            return Err(MemoryBankError::Validation {
                entity: format!("namespace {}", namespace.id),
                reason: format!(
                    "slug '{}' must be lowercase alphanumeric with dashes",
                    namespace.slug
                ),
            });
        }

        let conn = self.session.conn()?;
        let result = sqlx::query(
            "INSERT INTO namespaces (id, name, slug, owner_id, description, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&namespace.id)
        .bind(&namespace.name)
        .bind(&namespace.slug)
        .bind(&namespace.owner_id)
        .bind(&namespace.description)
        .bind(namespace.created_at.naive_utc())
        .execute(&mut *conn)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_duplicate_key(&err) => Err(MemoryBankError::Duplicate {
                entity: "namespace",
                id: namespace.id.clone(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete an empty namespace.
    ///
    /// # Errors
    ///
    /// `NamespaceMissing` for an unknown id, `Validation` while blocks still
    /// reference it.
    pub async fn delete_namespace(&mut self, id: &str) -> Result<()> {
        self.ensure_writable()?;
        let conn = self.session.conn()?;

        let block_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM memory_blocks WHERE namespace_id = ?")
                .bind(id)
                .fetch_one(&mut *conn)
                .await?;
        if block_count > 0 {
            return Err(MemoryBankError::Validation {
                entity: format!("namespace {id}"),
                reason: format!("cannot delete: {block_count} blocks still reference it"),
            });
        }

        let affected = sqlx::query("DELETE FROM namespaces WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(MemoryBankError::NamespaceMissing {
                namespace: id.to_string(),
            });
        }
        Ok(())
    }

    /// Create a branch from `from` (default: the session branch's head).
    ///
    /// Branch creation is version-control plumbing, permitted even when the
    /// session sits on a protected branch.
    ///
    /// # Errors
    ///
    /// `Validation` for a malformed name, `Duplicate` when it exists.
    pub async fn create_branch(&mut self, name: &str, from: Option<&str>) -> Result<()> {
        if !BRANCH_NAME.is_match(name) {
            return Err(MemoryBankError::Validation {
                entity: "branch name".to_string(),
                reason: format!("'{name}' contains unsupported characters"),
            });
        }

        let conn = self.session.conn()?;
        let result = match from {
            Some(from) => {
                sqlx::query("CALL DOLT_BRANCH(?, ?)")
                    .bind(name)
                    .bind(from)
                    .execute(&mut *conn)
                    .await
            }
            None => {
                sqlx::query("CALL DOLT_BRANCH(?)")
                    .bind(name)
                    .execute(&mut *conn)
                    .await
            }
        };

        match result {
            Ok(_) => Ok(()),
            Err(err) if err.to_string().to_lowercase().contains("already exists") => {
                Err(MemoryBankError::Duplicate {
                    entity: "branch",
                    id: name.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Commit the working set and write proof rows for the staged mutations.
    ///
    /// Returns `None` when there is nothing to commit (not an error). The
    /// proof rows carry the data commit's hash and are committed in an
    /// immediate follow-up commit.
    ///
    /// # Errors
    ///
    /// `CommitFailed` on backend commit errors; connection errors propagate
    /// for the coordinator's retry.
    pub async fn commit_with_proofs(
        &mut self,
        ctx: &MutationContext,
        message: &str,
    ) -> Result<Option<String>> {
        self.ensure_writable()?;
        let author = commit_author(&ctx.actor);
        let conn = self.session.conn()?;

        let Some(hash) = dolt_commit(conn, message, &author).await? else {
            return Ok(None);
        };

        if !ctx.proofs.is_empty() {
            for (block_id, operation) in &ctx.proofs {
                sqlx::query(
                    "INSERT INTO block_proofs (block_id, commit_hash, operation, timestamp)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(block_id)
                .bind(&hash)
                .bind(operation.as_str())
                .bind(Utc::now().naive_utc())
                .execute(&mut *conn)
                .await?;
            }
            dolt_commit(conn, &format!("Record proofs for {hash}"), &author).await?;
        }

        Ok(Some(hash))
    }

    /// Discard all uncommitted working-set changes on this branch.
    ///
    /// # Errors
    ///
    /// Propagates backend failures.
    pub async fn reset_working_set(&mut self) -> Result<()> {
        let conn = self.session.conn()?;
        sqlx::query("CALL DOLT_RESET('--hard')")
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Merge `source` into the session's branch.
    ///
    /// Merging is the sanctioned path for changes to reach a protected
    /// branch, so it bypasses the protected-branch guard.
    ///
    /// # Errors
    ///
    /// `CommitFailed` on unresolved conflicts (the merge is aborted first so
    /// the branch is left clean) or on backend merge errors.
    pub async fn merge(&mut self, source: &str, strategy: MergeStrategy) -> Result<MergeOutcome> {
        let target = self.session.branch().to_string();
        let conn = self.session.conn()?;

        let result = match strategy {
            MergeStrategy::FastForwardOrFail => {
                sqlx::query("CALL DOLT_MERGE('--ff-only', ?)")
                    .bind(source)
                    .fetch_one(&mut *conn)
                    .await
            }
            MergeStrategy::ThreeWay => {
                sqlx::query("CALL DOLT_MERGE(?)")
                    .bind(source)
                    .fetch_one(&mut *conn)
                    .await
            }
        };

        let row = match result {
            Ok(row) => row,
            Err(err) => {
                let reason = err.to_string();
                let classified = MemoryBankError::from(err);
                if matches!(classified, MemoryBankError::Connection { .. }) {
                    return Err(classified);
                }
                let _ = sqlx::query("CALL DOLT_MERGE('--abort')")
                    .execute(&mut *conn)
                    .await;
                return Err(MemoryBankError::CommitFailed {
                    reason: format!("merge of {source} into {target} failed: {reason}"),
                });
            }
        };

        let conflicts: i64 = row
            .try_get::<i64, _>("conflicts")
            .or_else(|_| row.try_get::<i32, _>("conflicts").map(i64::from))
            .unwrap_or(0);
        if conflicts > 0 {
            let _ = sqlx::query("CALL DOLT_MERGE('--abort')")
                .execute(&mut *conn)
                .await;
            return Err(MemoryBankError::CommitFailed {
                reason: format!(
                    "merge of {source} into {target} has {conflicts} unresolved conflicts"
                ),
            });
        }

        let hash: Option<String> = row.try_get("hash").ok();
        let fast_forward = row
            .try_get::<i64, _>("fast_forward")
            .or_else(|_| row.try_get::<i32, _>("fast_forward").map(i64::from))
            .map(|v| v != 0)
            .unwrap_or(false);

        Ok(MergeOutcome { hash, fast_forward })
    }

    async fn load_block(&mut self, id: &str) -> Result<Option<MemoryBlock>> {
        let conn = self.session.conn()?;
        let sql = format!("SELECT {BLOCK_COLUMNS} FROM memory_blocks WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
        row.as_ref().map(block_from_row).transpose()
    }
}

/// Replace the non-computed property rows of a block with the decomposition
/// of its current metadata object.
async fn sync_properties(
    tx: &mut sqlx::Transaction<'_, MySql>,
    block_id: &str,
    metadata: &serde_json::Value,
) -> Result<()> {
    let serde_json::Value::Object(fields) = metadata else {
        return Ok(());
    };

    sqlx::query("DELETE FROM block_properties WHERE block_id = ? AND is_computed = 0")
        .bind(block_id)
        .execute(&mut **tx)
        .await?;

    for (name, value) in fields {
        let property = PropertyValue::from_metadata_value(value);
        upsert_property_tx(tx, block_id, name, &property, false).await?;
    }

    Ok(())
}

async fn upsert_property_tx(
    tx: &mut sqlx::Transaction<'_, MySql>,
    block_id: &str,
    name: &str,
    value: &PropertyValue,
    is_computed: bool,
) -> Result<()> {
    let (value_text, value_number, value_json) = match value {
        PropertyValue::Text(text) => (Some(text.clone()), None, None),
        PropertyValue::Number(number) => (None, Some(*number), None),
        PropertyValue::Json(json) => (None, None, Some(Json(json.clone()))),
    };

    sqlx::query(
        "INSERT INTO block_properties
            (block_id, property_name, value_text, value_number, value_json,
             property_type, is_computed, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON DUPLICATE KEY UPDATE
            value_text = VALUES(value_text),
            value_number = VALUES(value_number),
            value_json = VALUES(value_json),
            property_type = VALUES(property_type),
            is_computed = VALUES(is_computed),
            updated_at = VALUES(updated_at)",
    )
    .bind(block_id)
    .bind(name)
    .bind(value_text)
    .bind(value_number)
    .bind(value_json)
    .bind(value.property_type())
    .bind(is_computed)
    .bind(Utc::now().naive_utc())
    .bind(Utc::now().naive_utc())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Recompute a parent's `has_children` flag after its children changed.
async fn refresh_has_children(
    tx: &mut sqlx::Transaction<'_, MySql>,
    parent_id: &str,
) -> Result<()> {
    let children: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM memory_blocks WHERE parent_id = ?")
        .bind(parent_id)
        .fetch_one(&mut **tx)
        .await?;
    sqlx::query("UPDATE memory_blocks SET has_children = ? WHERE id = ?")
        .bind(children > 0)
        .bind(parent_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// `CALL DOLT_COMMIT('-A', '-m', ?, '--author', ?)`, treating an empty
/// staging area as `None`.
async fn dolt_commit(
    conn: &mut MySqlConnection,
    message: &str,
    author: &str,
) -> Result<Option<String>> {
    let result = sqlx::query("CALL DOLT_COMMIT('-A', '-m', ?, '--author', ?)")
        .bind(message)
        .bind(author)
        .fetch_one(&mut *conn)
        .await;

    match result {
        Ok(row) => Ok(Some(row.try_get("hash")?)),
        Err(err) => {
            let reason = err.to_string();
            if reason.to_lowercase().contains("nothing to commit") {
                return Ok(None);
            }
            let classified = MemoryBankError::from(err);
            if matches!(classified, MemoryBankError::Connection { .. }) {
                Err(classified)
            } else {
                Err(MemoryBankError::CommitFailed { reason })
            }
        }
    }
}

fn commit_author(actor: &str) -> String {
    let sanitized: String = actor
        .chars()
        .filter(|c| !matches!(c, '<' | '>' | '\n'))
        .collect();
    let sanitized = if sanitized.trim().is_empty() {
        "membank".to_string()
    } else {
        sanitized.trim().to_string()
    };
    format!("{sanitized} <{}@membank.local>", sanitized.replace(' ', "."))
}

fn is_duplicate_key(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("1062")
                || db.message().to_lowercase().contains("duplicate entry")
        }
        _ => false,
    }
}
