//! The StructuredMemoryBank facade.
//!
//! Every operation follows the same envelope: resolve the branch, open a
//! session through the coordinator, validate, execute the SQL primitives in
//! a transaction, commit with a human-readable message, record proofs, then
//! update the semantic index. Connection failures are retried exactly once
//! with branch restoration; index failures after a successful commit surface
//! as `IndexSyncFailed` and are re-driven by the reconciler.

pub mod requests;

use futures::future::BoxFuture;
use sqlx::MySqlConnection;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::BankConfig;
use crate::error::{MemoryBankError, Result};
use crate::index::embedding::provider_from_config;
use crate::index::reconciler::Reconciler;
use crate::index::{IndexQuery, SearchHit, SemanticIndex};
use crate::model::{
    BlockLink, BranchInfo, MemoryBlock, Namespace, Page, relations,
};
use crate::schema::SchemaRegistry;
use crate::storage::links::{self, NeighborLink};
use crate::storage::pool::{BranchCoordinator, EphemeralSession, PersistentSession, SessionMode};
use crate::storage::reader::Reader;
use crate::storage::schema::{apply_schema, load_schemas_into_registry, persist_schema};
use crate::storage::writer::{MergeOutcome, MutationContext, Writer};
use crate::util::id::{IdConfig, candidate_sequence};

use self::requests::{
    BranchScopedRequest, CheckoutBranchRequest, CheckoutOutcome, CommitOutcome, CommitRequest,
    CreateBlockRequest, CreateBranchRequest, CreateLinkRequest, CreateNamespaceRequest,
    CreatedBranch, DeleteBlockRequest, DeleteLinkRequest, DeletedBlock, GetBlockRequest,
    GetLinkedBlocksRequest, HealthStatus, LinkTriple, LinksCreated, ListLinksRequest, MergeRequest,
    QueryBlocksRequest, SemanticSearchRequest, UpdateBlockRequest,
};

/// A successful facade result: the payload plus the branch the session was
/// actually bound to when it was produced.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BankResponse<T> {
    pub data: T,
    pub active_branch: String,
}

/// The versioned structured-memory service.
pub struct StructuredMemoryBank {
    config: Arc<BankConfig>,
    pool: Arc<BranchCoordinator>,
    registry: Arc<SchemaRegistry>,
    index: Arc<SemanticIndex>,
    current_branch: parking_lot::RwLock<String>,
}

impl std::fmt::Debug for StructuredMemoryBank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructuredMemoryBank")
            .field("default_branch", &self.config.default_branch)
            .finish_non_exhaustive()
    }
}

impl StructuredMemoryBank {
    /// Build a bank from config. No I/O happens until [`Self::bootstrap`].
    #[must_use]
    pub fn new(config: BankConfig) -> Self {
        let config = Arc::new(config);
        let provider = provider_from_config(&config.index);
        let index = Arc::new(SemanticIndex::open(&config.index, provider));
        let pool = Arc::new(BranchCoordinator::new(Arc::clone(&config)));
        let current_branch = parking_lot::RwLock::new(config.default_branch.clone());

        Self {
            config,
            pool,
            registry: Arc::new(SchemaRegistry::new()),
            index,
            current_branch,
        }
    }

    #[must_use]
    pub fn config(&self) -> &BankConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    #[must_use]
    pub fn index(&self) -> &Arc<SemanticIndex> {
        &self.index
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<BranchCoordinator> {
        &self.pool
    }

    /// The branch used when a call does not name one.
    #[must_use]
    pub fn resolve_branch(&self, requested: Option<&str>) -> String {
        match requested {
            Some(branch) if !branch.trim().is_empty() => branch.trim().to_string(),
            _ => self.current_branch.read().clone(),
        }
    }

    /// Install logging, apply the schema, bootstrap the default namespace,
    /// and synchronize the schema registry with the `node_schemas` table.
    ///
    /// Idempotent; run once at startup against the default branch.
    ///
    /// # Errors
    ///
    /// A `Validation` error for unusable logging config, connection and DDL
    /// failures, or a `SchemaConflict` between persisted and built-in
    /// schemas.
    pub async fn bootstrap(&self) -> Result<()> {
        crate::logging::init_logging(&self.config.log)?;

        let branch = self.config.default_branch.clone();
        let mut session = self
            .pool
            .acquire_ephemeral(&branch, self.config.call_deadline_default)
            .await?;

        let result = self.bootstrap_on(&mut session).await;
        self.pool.release_ephemeral(session).await;
        result
    }

    async fn bootstrap_on(&self, session: &mut EphemeralSession) -> Result<()> {
        let conn = session.conn()?;
        apply_schema(conn, &self.config.default_namespace).await?;

        load_schemas_into_registry(conn, &self.registry).await?;
        self.registry.register_builtins()?;
        for (node_type, version, schema) in self.registry.all() {
            persist_schema(conn, &node_type, version, &schema).await?;
        }

        // Schema bootstrap is an admin path; it commits directly even on a
        // protected default branch.
        let commit = sqlx::query(
            "CALL DOLT_COMMIT('-A', '-m', 'Initialize memory bank schema',
                              '--author', 'membank <membank@membank.local>')",
        )
        .fetch_one(&mut *conn)
        .await;
        if let Err(err) = commit {
            let message = err.to_string();
            if !message.to_lowercase().contains("nothing to commit") {
                return Err(MemoryBankError::CommitFailed { reason: message });
            }
        }

        info!(branch = %self.config.default_branch, "memory bank bootstrapped");
        Ok(())
    }

    /// Spawn the pool health task and the index reconciler.
    #[must_use]
    pub fn spawn_background_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let reconciler = Arc::new(self.reconciler());
        vec![self.pool.spawn_health_task(), reconciler.spawn()]
    }

    #[must_use]
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.index),
            Arc::clone(&self.config),
        )
    }

    /// Close idle connections. In-flight sessions close on drop.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    // ------------------------------------------------------------------
    // Block operations
    // ------------------------------------------------------------------

    /// Create a memory block: validate, write, commit, record the proof,
    /// index.
    ///
    /// # Errors
    ///
    /// `Validation` / `UnknownType` / `NamespaceMissing` / `Duplicate` /
    /// `ProtectedBranch` before or during the write, `CommitFailed` at the
    /// commit stage, `IndexSyncFailed` when the SQL commit stood but the
    /// index update did not.
    pub async fn create_memory_block(
        &self,
        req: CreateBlockRequest,
    ) -> Result<BankResponse<MemoryBlock>> {
        let branch = self.resolve_branch(req.branch.as_deref());

        let schema_version = match req.schema_version {
            Some(version) => version,
            None => self.registry.latest_version(&req.node_type)?,
        };
        self.registry
            .validate(&req.node_type, Some(schema_version), &req.metadata)?;
        if let Some(confidence) = &req.confidence {
            confidence.validate()?;
        }

        let req = Arc::new(req);
        let registry = Arc::clone(&self.registry);
        let config = Arc::clone(&self.config);

        let response = self
            .run_mutation(&branch, move |session, is_retry| {
                let req = Arc::clone(&req);
                let registry = Arc::clone(&registry);
                let config = Arc::clone(&config);
                Box::pin(async move {
                    if is_retry {
                        Writer::new(session, &registry, &config)
                            .reset_working_set()
                            .await?;
                    }

                    let id = match &req.id {
                        Some(id) => id.clone(),
                        None => pick_free_id(session.conn()?, &config.id, &req).await?,
                    };
                    let block = block_from_request(&req, id, schema_version, &config);

                    let mut ctx = MutationContext::new("create_memory_block", &req.actor);
                    let mut writer = Writer::new(session, &registry, &config);
                    writer.insert_block(&block, &mut ctx).await?;

                    let message = format!("Create block {} ({})", block.id, block.node_type);
                    match writer.commit_with_proofs(&ctx, &message).await {
                        Ok(hash) => Ok((block, hash, ctx)),
                        Err(err) => {
                            let _ = writer.reset_working_set().await;
                            Err(err)
                        }
                    }
                })
            })
            .await?;

        let BankResponse {
            data: (block, hash, ctx),
            active_branch,
        } = response;

        self.sync_index(&ctx, hash.as_deref(), &branch, Some(&block))
            .await?;

        Ok(BankResponse {
            data: block,
            active_branch,
        })
    }

    /// Update a block, bumping its version and proving the mutation.
    ///
    /// # Errors
    ///
    /// As [`Self::create_memory_block`], plus `NotFound` and
    /// `OptimisticConflict`.
    pub async fn update_memory_block(
        &self,
        req: UpdateBlockRequest,
    ) -> Result<BankResponse<MemoryBlock>> {
        let branch = self.resolve_branch(req.branch.as_deref());
        let req = Arc::new(req);
        let registry = Arc::clone(&self.registry);
        let config = Arc::clone(&self.config);

        let response = self
            .run_mutation(&branch, move |session, is_retry| {
                let req = Arc::clone(&req);
                let registry = Arc::clone(&registry);
                let config = Arc::clone(&config);
                Box::pin(async move {
                    let mut writer = Writer::new(session, &registry, &config);
                    if is_retry {
                        writer.reset_working_set().await?;
                    }

                    let mut ctx = MutationContext::new("update_memory_block", &req.actor);
                    let patch = req.patch();
                    let block = writer.update_block(&req.id, &patch, &mut ctx).await?;

                    if ctx.proofs.is_empty() {
                        // Empty patch: nothing written, nothing to commit.
                        return Ok((block, None, ctx));
                    }

                    let message =
                        format!("Update block {} to v{}", block.id, block.block_version);
                    match writer.commit_with_proofs(&ctx, &message).await {
                        Ok(hash) => Ok((block, hash, ctx)),
                        Err(err) => {
                            let _ = writer.reset_working_set().await;
                            Err(err)
                        }
                    }
                })
            })
            .await?;

        let BankResponse {
            data: (block, hash, ctx),
            active_branch,
        } = response;

        self.sync_index(&ctx, hash.as_deref(), &branch, Some(&block))
            .await?;

        Ok(BankResponse {
            data: block,
            active_branch,
        })
    }

    /// Delete a block and everything hanging off it; a final `delete` proof
    /// row survives.
    ///
    /// # Errors
    ///
    /// As [`Self::create_memory_block`], plus `NotFound`.
    pub async fn delete_memory_block(
        &self,
        req: DeleteBlockRequest,
    ) -> Result<BankResponse<DeletedBlock>> {
        let branch = self.resolve_branch(req.branch.as_deref());
        let req = Arc::new(req);
        let registry = Arc::clone(&self.registry);
        let config = Arc::clone(&self.config);

        let response = self
            .run_mutation(&branch, move |session, is_retry| {
                let req = Arc::clone(&req);
                let registry = Arc::clone(&registry);
                let config = Arc::clone(&config);
                Box::pin(async move {
                    let mut writer = Writer::new(session, &registry, &config);
                    if is_retry {
                        writer.reset_working_set().await?;
                    }

                    let mut ctx = MutationContext::new("delete_memory_block", &req.actor);
                    let block = writer.delete_block(&req.id, &mut ctx).await?;

                    let message = format!("Delete block {}", block.id);
                    match writer.commit_with_proofs(&ctx, &message).await {
                        Ok(hash) => Ok((block, hash, ctx)),
                        Err(err) => {
                            let _ = writer.reset_working_set().await;
                            Err(err)
                        }
                    }
                })
            })
            .await?;

        let BankResponse {
            data: (block, hash, ctx),
            active_branch,
        } = response;

        self.sync_index(&ctx, hash.as_deref(), &branch, None).await?;

        Ok(BankResponse {
            data: DeletedBlock {
                id: block.id,
                block_version: block.block_version,
                commit: CommitOutcome { hash },
            },
            active_branch,
        })
    }

    /// Get a block by id.
    ///
    /// # Errors
    ///
    /// `NotFound` when the id does not exist on the branch.
    pub async fn get_memory_block(
        &self,
        req: GetBlockRequest,
    ) -> Result<BankResponse<MemoryBlock>> {
        let branch = self.resolve_branch(req.branch.as_deref());
        let id = req.id;
        self.run_read(&branch, move |session| {
            Box::pin(async move {
                Reader::new(session.conn()?)
                    .get_block(&id)
                    .await?
                    .ok_or(MemoryBankError::NotFound {
                        entity: "block",
                        id,
                    })
            })
        })
        .await
    }

    /// List blocks by filter, cursor-paged.
    ///
    /// # Errors
    ///
    /// `InvalidCursor` and read failures.
    pub async fn query_blocks(
        &self,
        req: QueryBlocksRequest,
    ) -> Result<BankResponse<Page<MemoryBlock>>> {
        let branch = self.resolve_branch(req.branch.as_deref());
        let filters = req.filters();
        self.run_read(&branch, move |session| {
            Box::pin(async move { Reader::new(session.conn()?).list_blocks(&filters).await })
        })
        .await
    }

    /// List links by filter, cursor-paged.
    ///
    /// # Errors
    ///
    /// `InvalidCursor` and read failures.
    pub async fn list_links(
        &self,
        req: ListLinksRequest,
    ) -> Result<BankResponse<Page<BlockLink>>> {
        let branch = self.resolve_branch(req.branch.as_deref());
        let filters = req.filters();
        self.run_read(&branch, move |session| {
            Box::pin(async move { Reader::new(session.conn()?).list_links(&filters).await })
        })
        .await
    }

    // ------------------------------------------------------------------
    // Link operations
    // ------------------------------------------------------------------

    /// Create a link (optionally bidirectional) between two blocks.
    ///
    /// The relation must already be canonical: aliases are resolved at the
    /// tool boundary.
    ///
    /// # Errors
    ///
    /// `Validation`, `NotFound`, `Duplicate`, `CycleDetected`,
    /// `NoInverseRelation`, plus the usual commit-stage errors.
    pub async fn create_link(
        &self,
        req: CreateLinkRequest,
    ) -> Result<BankResponse<LinksCreated>> {
        let branch = self.resolve_branch(req.branch.as_deref());
        let req = Arc::new(req);
        let registry = Arc::clone(&self.registry);
        let config = Arc::clone(&self.config);

        let response = self
            .run_mutation(&branch, move |session, is_retry| {
                let req = Arc::clone(&req);
                let registry = Arc::clone(&registry);
                let config = Arc::clone(&config);
                Box::pin(async move {
                    let mut writer = Writer::new(session, &registry, &config);
                    if is_retry {
                        writer.reset_working_set().await?;
                    }

                    let mut ctx = MutationContext::new("create_link", &req.actor);
                    let created = links::create_link(
                        &mut writer,
                        &req.from,
                        &req.to,
                        &req.relation,
                        req.bidirectional,
                        req.priority,
                        &req.metadata,
                        &mut ctx,
                    )
                    .await?;

                    let message = format!(
                        "Link {} -> {} ({})",
                        req.from, req.to, req.relation
                    );
                    match writer.commit_with_proofs(&ctx, &message).await {
                        Ok(hash) => Ok((created, hash, ctx)),
                        Err(err) => {
                            let _ = writer.reset_working_set().await;
                            Err(err)
                        }
                    }
                })
            })
            .await?;

        let BankResponse {
            data: (created, hash, ctx),
            active_branch,
        } = response;

        self.sync_index(&ctx, hash.as_deref(), &branch, None).await?;

        Ok(BankResponse {
            data: LinksCreated {
                links: created
                    .into_iter()
                    .map(|(from, to, relation)| LinkTriple { from, to, relation })
                    .collect(),
                commit: CommitOutcome { hash },
            },
            active_branch,
        })
    }

    /// Delete one link triple.
    ///
    /// # Errors
    ///
    /// `NotFound` when the triple does not exist.
    pub async fn delete_link(
        &self,
        req: DeleteLinkRequest,
    ) -> Result<BankResponse<CommitOutcome>> {
        let branch = self.resolve_branch(req.branch.as_deref());
        let req = Arc::new(req);
        let registry = Arc::clone(&self.registry);
        let config = Arc::clone(&self.config);

        let response = self
            .run_mutation(&branch, move |session, is_retry| {
                let req = Arc::clone(&req);
                let registry = Arc::clone(&registry);
                let config = Arc::clone(&config);
                Box::pin(async move {
                    let mut writer = Writer::new(session, &registry, &config);
                    if is_retry {
                        writer.reset_working_set().await?;
                    }

                    let mut ctx = MutationContext::new("delete_link", &req.actor);
                    writer
                        .delete_link(&req.from, &req.to, &req.relation, &mut ctx)
                        .await?;

                    let message = format!(
                        "Unlink {} -> {} ({})",
                        req.from, req.to, req.relation
                    );
                    match writer.commit_with_proofs(&ctx, &message).await {
                        Ok(hash) => Ok((hash, ctx)),
                        Err(err) => {
                            let _ = writer.reset_working_set().await;
                            Err(err)
                        }
                    }
                })
            })
            .await?;

        let BankResponse {
            data: (hash, ctx),
            active_branch,
        } = response;

        self.sync_index(&ctx, hash.as_deref(), &branch, None).await?;

        Ok(BankResponse {
            data: CommitOutcome { hash },
            active_branch,
        })
    }

    /// The links around a block with the far-side ids.
    ///
    /// # Errors
    ///
    /// Read failures.
    pub async fn get_linked_blocks(
        &self,
        req: GetLinkedBlocksRequest,
    ) -> Result<BankResponse<Vec<NeighborLink>>> {
        let branch = self.resolve_branch(req.branch.as_deref());

        let relation_filter = match &req.relations {
            Some(raw) => Some(canonicalize_all(raw)?),
            None => None,
        };
        let id = req.id;
        let direction = req.direction;

        self.run_read(&branch, move |session| {
            Box::pin(async move {
                links::neighbors(
                    session.conn()?,
                    &id,
                    relation_filter.as_deref(),
                    direction,
                )
                .await
            })
        })
        .await
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    /// Semantic search over the index.
    ///
    /// # Errors
    ///
    /// `Validation` for an empty query, `IndexSyncFailed` when the query
    /// text cannot be embedded.
    pub async fn semantic_search(
        &self,
        req: SemanticSearchRequest,
    ) -> Result<BankResponse<Vec<SearchHit>>> {
        let hits = self
            .index
            .query(&IndexQuery {
                text: Some(req.text),
                embedding: None,
                namespace: req.namespace,
                node_type: req.node_type,
                tags: req.tags,
                k: req.k,
            })
            .await?;

        Ok(BankResponse {
            data: hits,
            active_branch: self.resolve_branch(None),
        })
    }

    /// Rebuild the index from the SQL store on `branch`.
    ///
    /// # Errors
    ///
    /// Read or index failures.
    pub async fn rebuild_index(
        &self,
        branch: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<usize> {
        let branch = self.resolve_branch(branch);
        let mut session = self
            .pool
            .acquire_ephemeral(&branch, self.config.call_deadline_default)
            .await?;

        let result = async {
            let mut blocks = Vec::new();
            let mut cursor = None;
            loop {
                let page = Reader::new(session.conn()?)
                    .list_blocks(&crate::model::ListBlockFilters {
                        namespace: namespace.map(str::to_string),
                        cursor: cursor.clone(),
                        limit: crate::storage::reader::MAX_PAGE_LIMIT,
                        ..crate::model::ListBlockFilters::default()
                    })
                    .await?;
                blocks.extend(page.items);
                match page.next_cursor {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
            self.index.rebuild_from(&blocks).await
        }
        .await;

        self.pool.release_ephemeral(session).await;
        result
    }

    // ------------------------------------------------------------------
    // Branch & namespace operations
    // ------------------------------------------------------------------

    /// List branches.
    ///
    /// # Errors
    ///
    /// Read failures.
    pub async fn list_branches(
        &self,
        req: BranchScopedRequest,
    ) -> Result<BankResponse<Vec<BranchInfo>>> {
        let branch = self.resolve_branch(req.branch.as_deref());
        self.run_read(&branch, move |session| {
            Box::pin(async move { Reader::new(session.conn()?).list_branches().await })
        })
        .await
    }

    /// List namespaces.
    ///
    /// # Errors
    ///
    /// Read failures.
    pub async fn list_namespaces(
        &self,
        req: BranchScopedRequest,
    ) -> Result<BankResponse<Vec<Namespace>>> {
        let branch = self.resolve_branch(req.branch.as_deref());
        self.run_read(&branch, move |session| {
            Box::pin(async move { Reader::new(session.conn()?).list_namespaces().await })
        })
        .await
    }

    /// Switch the session's current branch after verifying it exists.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown branch, connection failures otherwise.
    pub async fn checkout_branch(
        &self,
        req: CheckoutBranchRequest,
    ) -> Result<BankResponse<CheckoutOutcome>> {
        let branch = req.branch.trim().to_string();
        if branch.is_empty() {
            return Err(MemoryBankError::Validation {
                entity: "branch name".to_string(),
                reason: "branch must not be empty".to_string(),
            });
        }

        // A successful bind proves the branch exists and is usable.
        let session = self
            .pool
            .acquire_ephemeral(&branch, self.config.connection_timeout)
            .await
            .map_err(|err| map_missing_branch(err, &branch))?;
        self.pool.release_ephemeral(session).await;

        *self.current_branch.write() = branch.clone();
        debug!(branch = %branch, "checked out branch");

        Ok(BankResponse {
            data: CheckoutOutcome {
                branch: branch.clone(),
            },
            active_branch: branch,
        })
    }

    /// Create a branch.
    ///
    /// # Errors
    ///
    /// `Validation` for a malformed name, `Duplicate` when it exists.
    pub async fn create_branch(
        &self,
        req: CreateBranchRequest,
    ) -> Result<BankResponse<CreatedBranch>> {
        let base = self.resolve_branch(req.from.as_deref());
        let name = req.name.clone();
        let from = req.from.clone();

        let mut session = self
            .pool
            .acquire_persistent(&base, SessionMode::Write, self.config.call_deadline_default)
            .await?;

        let result = Writer::new(&mut session, &self.registry, &self.config)
            .create_branch(&name, from.as_deref())
            .await;
        let active_branch = session
            .observed_branch()
            .await
            .unwrap_or_else(|_| base.clone());
        self.pool.release(session).await;
        result?;

        Ok(BankResponse {
            data: CreatedBranch { name, from },
            active_branch,
        })
    }

    /// Commit any outstanding working-set changes on a branch.
    ///
    /// A clean working set is not an error: the outcome carries no hash.
    ///
    /// # Errors
    ///
    /// `ProtectedBranch`, `CommitFailed`, connection failures.
    pub async fn commit_changes(
        &self,
        req: CommitRequest,
    ) -> Result<BankResponse<CommitOutcome>> {
        let branch = self.resolve_branch(req.branch.as_deref());
        let message = req.message.clone();
        let actor = req.actor.clone();
        let registry = Arc::clone(&self.registry);
        let config = Arc::clone(&self.config);

        self.run_mutation(&branch, move |session, _is_retry| {
            let message = message.clone();
            let actor = actor.clone();
            let registry = Arc::clone(&registry);
            let config = Arc::clone(&config);
            Box::pin(async move {
                let ctx = MutationContext::new("commit_changes", &actor);
                let mut writer = Writer::new(session, &registry, &config);
                let hash = writer.commit_with_proofs(&ctx, &message).await?;
                Ok(CommitOutcome { hash })
            })
        })
        .await
    }

    /// Merge `source` into the target branch.
    ///
    /// # Errors
    ///
    /// `CommitFailed` on unresolved conflicts, connection failures.
    pub async fn merge(&self, req: MergeRequest) -> Result<BankResponse<MergeOutcome>> {
        let target = self.resolve_branch(req.branch.as_deref());
        let source = req.source.clone();
        let strategy = req.strategy;

        // Merging is the sanctioned write path into protected branches, so
        // this runs outside the protected-branch guard; it still serializes
        // with other writers on the target.
        let _write_guard = self.pool.lock_branch_write(&target).await;
        let mut session = self
            .pool
            .acquire_persistent(
                &target,
                SessionMode::ReadWrite,
                self.config.call_deadline_default,
            )
            .await?;

        let mut result = Writer::new(&mut session, &self.registry, &self.config)
            .merge(&source, strategy)
            .await;
        if let Err(err) = &result {
            if err.is_retryable_connection_error() {
                warn!(target = %target, error = %err, "connection lost mid-merge, retrying once");
                self.pool.rebind(&mut session).await?;
                result = Writer::new(&mut session, &self.registry, &self.config)
                    .merge(&source, strategy)
                    .await;
            }
        }

        let active_branch = session
            .observed_branch()
            .await
            .unwrap_or_else(|_| target.clone());
        self.pool.release(session).await;

        Ok(BankResponse {
            data: result?,
            active_branch,
        })
    }

    /// Create a namespace.
    ///
    /// # Errors
    ///
    /// `Validation` for a malformed slug, `Duplicate` on collision.
    pub async fn create_namespace(
        &self,
        req: CreateNamespaceRequest,
    ) -> Result<BankResponse<Namespace>> {
        let branch = self.resolve_branch(req.branch.as_deref());
        let namespace = Namespace {
            id: req.id.clone(),
            name: req.name.clone(),
            slug: req.slug.clone().unwrap_or_else(|| req.id.clone()),
            owner_id: req.owner_id.clone(),
            description: req.description.clone(),
            created_at: chrono::Utc::now(),
        };

        let ns = Arc::new(namespace);
        let registry = Arc::clone(&self.registry);
        let config = Arc::clone(&self.config);

        let ns_for_op = Arc::clone(&ns);
        let response = self
            .run_mutation(&branch, move |session, _is_retry| {
                let ns = Arc::clone(&ns_for_op);
                let registry = Arc::clone(&registry);
                let config = Arc::clone(&config);
                Box::pin(async move {
                    let mut writer = Writer::new(session, &registry, &config);
                    writer.create_namespace(&ns).await?;

                    let ctx = MutationContext::new("create_namespace", "system");
                    let message = format!("Create namespace {}", ns.id);
                    match writer.commit_with_proofs(&ctx, &message).await {
                        Ok(_) => Ok(()),
                        Err(err) => {
                            let _ = writer.reset_working_set().await;
                            Err(err)
                        }
                    }
                })
            })
            .await?;

        Ok(BankResponse {
            data: (*ns).clone(),
            active_branch: response.active_branch,
        })
    }

    /// Delete an empty namespace. An admin surface, deliberately not
    /// exposed as a tool.
    ///
    /// # Errors
    ///
    /// `NamespaceMissing` for an unknown id, `Validation` while blocks
    /// still reference it.
    pub async fn delete_namespace(
        &self,
        branch: Option<&str>,
        id: &str,
    ) -> Result<BankResponse<CommitOutcome>> {
        let branch = self.resolve_branch(branch);
        let id = id.to_string();
        let registry = Arc::clone(&self.registry);
        let config = Arc::clone(&self.config);

        self.run_mutation(&branch, move |session, _is_retry| {
            let id = id.clone();
            let registry = Arc::clone(&registry);
            let config = Arc::clone(&config);
            Box::pin(async move {
                let mut writer = Writer::new(session, &registry, &config);
                writer.delete_namespace(&id).await?;

                let ctx = MutationContext::new("delete_namespace", "system");
                let message = format!("Delete namespace {id}");
                match writer.commit_with_proofs(&ctx, &message).await {
                    Ok(hash) => Ok(CommitOutcome { hash }),
                    Err(err) => {
                        let _ = writer.reset_working_set().await;
                        Err(err)
                    }
                }
            })
        })
        .await
    }

    /// Backend, pool and index health.
    pub async fn health(&self) -> BankResponse<HealthStatus> {
        let branch = self.resolve_branch(None);
        let pool_stats = self.pool.stats();
        let indexed_blocks = self.index.len().await;

        let (backend_reachable, index_lag) = match self
            .pool
            .acquire_ephemeral(&branch, self.config.connection_timeout)
            .await
        {
            Ok(mut session) => {
                let last_observed = self.index.last_observed_proof().await;
                let lag = match session.conn() {
                    Ok(conn) => {
                        sqlx::query_scalar::<_, i64>(
                            "SELECT COUNT(*) FROM block_proofs WHERE id > ?",
                        )
                        .bind(last_observed)
                        .fetch_one(conn)
                        .await
                        .ok()
                        .map(i64::unsigned_abs)
                    }
                    Err(_) => None,
                };
                self.pool.release_ephemeral(session).await;
                (true, lag)
            }
            Err(err) => {
                warn!(error = %err, "health check could not reach the backend");
                (false, None)
            }
        };

        BankResponse {
            data: HealthStatus {
                backend_reachable,
                pool: pool_stats,
                indexed_blocks,
                index_lag,
            },
            active_branch: branch,
        }
    }

    // ------------------------------------------------------------------
    // Envelopes
    // ------------------------------------------------------------------

    /// The mutation envelope: protected-branch guard, per-branch write
    /// serialization, persistent session, once-only retry with branch
    /// restoration, fatal-error poisoning, observed-branch reporting.
    async fn run_mutation<T, F>(&self, branch: &str, op: F) -> Result<BankResponse<T>>
    where
        T: Send,
        F: for<'a> Fn(&'a mut PersistentSession, bool) -> BoxFuture<'a, Result<T>> + Send + Sync,
    {
        if self.config.is_protected(branch) {
            return Err(MemoryBankError::ProtectedBranch {
                branch: branch.to_string(),
            });
        }

        let _write_guard = self.pool.lock_branch_write(branch).await;
        let mut session = self
            .pool
            .acquire_persistent(
                branch,
                SessionMode::ReadWrite,
                self.config.call_deadline_default,
            )
            .await?;

        let mut result = op(&mut session, false).await;
        if let Err(err) = &result {
            if err.is_retryable_connection_error() {
                warn!(
                    branch = %branch,
                    error = %err,
                    "connection lost mid-operation, rebinding session and retrying once"
                );
                match self.pool.rebind(&mut session).await {
                    Ok(()) => result = op(&mut session, true).await,
                    Err(rebind_err) => {
                        self.pool.release(session).await;
                        return Err(rebind_err);
                    }
                }
            }
        }

        match result {
            Ok(data) => {
                let active_branch = session
                    .observed_branch()
                    .await
                    .unwrap_or_else(|_| branch.to_string());
                self.pool.release(session).await;
                Ok(BankResponse {
                    data,
                    active_branch,
                })
            }
            Err(err) => {
                if err.is_fatal() {
                    session.poison();
                }
                self.pool.release(session).await;
                Err(err)
            }
        }
    }

    /// The read envelope: ephemeral session bound to the branch, released
    /// back to the pool only on success (a failed read may have broken it).
    async fn run_read<T, F>(&self, branch: &str, op: F) -> Result<BankResponse<T>>
    where
        T: Send,
        F: for<'a> FnOnce(&'a mut EphemeralSession) -> BoxFuture<'a, Result<T>> + Send,
    {
        let mut session = self
            .pool
            .acquire_ephemeral(branch, self.config.call_deadline_default)
            .await?;

        let result = op(&mut session).await;
        let active_branch = session.branch().to_string();
        match result {
            Ok(data) => {
                self.pool.release_ephemeral(session).await;
                Ok(BankResponse {
                    data,
                    active_branch,
                })
            }
            Err(err) => {
                drop(session);
                Err(err)
            }
        }
    }

    /// Push a committed mutation into the index. SQL state is authoritative
    /// at this point: failures here surface as `IndexSyncFailed` and are
    /// re-driven by the reconciler.
    async fn sync_index(
        &self,
        ctx: &MutationContext,
        commit_hash: Option<&str>,
        branch: &str,
        known: Option<&MemoryBlock>,
    ) -> Result<()> {
        for id in &ctx.index_removals {
            self.index.remove(id).await?;
        }

        for id in &ctx.index_upserts {
            let block = match known {
                Some(block) if block.id == *id => Some(block.clone()),
                _ => self.load_block_for_index(branch, id).await?,
            };
            match block {
                Some(block) => self.index.upsert(&block, commit_hash).await?,
                None => self.index.remove(id).await?,
            }
        }

        Ok(())
    }

    async fn load_block_for_index(&self, branch: &str, id: &str) -> Result<Option<MemoryBlock>> {
        let mut session = self
            .pool
            .acquire_ephemeral(branch, self.config.connection_timeout)
            .await
            .map_err(|e| MemoryBankError::IndexSync {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        let block = Reader::new(session.conn()?).get_block(id).await;
        self.pool.release_ephemeral(session).await;
        block.map_err(|e| MemoryBankError::IndexSync {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Resolve every relation in a user-supplied filter list.
fn canonicalize_all(raw: &[String]) -> Result<Vec<String>> {
    raw.iter()
        .map(|name| {
            relations::canonicalize(name)
                .map(str::to_string)
                .ok_or_else(|| MemoryBankError::Validation {
                    entity: "link relation".to_string(),
                    reason: format!("unknown relation '{name}'"),
                })
        })
        .collect()
}

fn map_missing_branch(err: MemoryBankError, branch: &str) -> MemoryBankError {
    let message = err.to_string().to_lowercase();
    if message.contains("not found") || message.contains("does not exist") {
        MemoryBankError::NotFound {
            entity: "branch",
            id: branch.to_string(),
        }
    } else {
        err
    }
}

fn block_from_request(
    req: &CreateBlockRequest,
    id: String,
    schema_version: u32,
    config: &BankConfig,
) -> MemoryBlock {
    let now = chrono::Utc::now();
    MemoryBlock {
        id,
        namespace_id: req
            .namespace
            .clone()
            .unwrap_or_else(|| config.default_namespace.clone()),
        node_type: req.node_type.clone(),
        schema_version,
        text: req.text.clone(),
        state: req.state.unwrap_or_default(),
        visibility: req.visibility.unwrap_or_default(),
        block_version: 1,
        parent_id: req.parent_id.clone(),
        has_children: false,
        tags: req.tags.clone(),
        metadata: req.metadata.clone(),
        source_file: req.source_file.clone(),
        source_uri: req.source_uri.clone(),
        confidence: req.confidence.unwrap_or_default(),
        created_by: req.actor.clone(),
        created_at: now,
        updated_at: now,
        embedding: req.embedding.clone(),
    }
}

async fn pick_free_id(
    conn: &mut MySqlConnection,
    config: &IdConfig,
    req: &CreateBlockRequest,
) -> Result<String> {
    for candidate in candidate_sequence(config, &req.node_type, &req.text, &req.actor, 4) {
        let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM memory_blocks WHERE id = ?")
            .bind(&candidate)
            .fetch_one(&mut *conn)
            .await?;
        if exists == 0 {
            return Ok(candidate);
        }
    }
    Err(MemoryBankError::Fatal {
        message: "exhausted block id candidates".to_string(),
    })
}
