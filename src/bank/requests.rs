//! Request and response payloads for the facade operations.
//!
//! These types are also the tool-call wire format: inputs reject unknown
//! fields, optional fields take the documented defaults, and every type
//! derives a JSON Schema for the tool catalog.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{
    BlockPatch, BlockState, Confidence, ListBlockFilters, ListLinkFilters, Visibility,
};
use crate::storage::links::Direction;
use crate::storage::pool::PoolStats;
use crate::storage::writer::MergeStrategy;

fn default_actor() -> String {
    "agent".to_string()
}

/// Input for `CreateMemoryBlock`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CreateBlockRequest {
    /// Branch to write on; defaults to the session's current branch.
    pub branch: Option<String>,
    /// Caller-supplied id; generated from content when omitted.
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub node_type: String,
    /// Namespace id; defaults to the configured default namespace.
    pub namespace: Option<String>,
    #[serde(default)]
    pub text: String,
    pub state: Option<BlockState>,
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "empty_object")]
    pub metadata: Value,
    /// Schema version to validate against; defaults to the latest
    /// registered version for the type.
    pub schema_version: Option<u32>,
    pub parent_id: Option<String>,
    pub source_file: Option<String>,
    pub source_uri: Option<String>,
    pub confidence: Option<Confidence>,
    /// Precomputed embedding; the index embeds the text when omitted.
    pub embedding: Option<Vec<f32>>,
    #[serde(default = "default_actor")]
    pub actor: String,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Input for `UpdateMemoryBlock`.
///
/// Patch fields are spelled out (not flattened) so unknown input fields are
/// still rejected; `parent_id`/`source_file`/`source_uri` distinguish
/// "absent" from "null means clear".
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdateBlockRequest {
    pub branch: Option<String>,
    pub id: String,
    pub text: Option<String>,
    pub state: Option<BlockState>,
    pub visibility: Option<Visibility>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<Value>,
    pub parent_id: Option<Option<String>>,
    pub source_file: Option<Option<String>>,
    pub source_uri: Option<Option<String>>,
    pub confidence: Option<Confidence>,
    /// When set, the update fails with `OptimisticConflict` unless the
    /// stored `block_version` matches.
    pub expected_version: Option<i64>,
    #[serde(default = "default_actor")]
    pub actor: String,
}

impl UpdateBlockRequest {
    /// The patch this request describes.
    #[must_use]
    pub fn patch(&self) -> BlockPatch {
        BlockPatch {
            text: self.text.clone(),
            state: self.state,
            visibility: self.visibility,
            tags: self.tags.clone(),
            metadata: self.metadata.clone(),
            parent_id: self.parent_id.clone(),
            source_file: self.source_file.clone(),
            source_uri: self.source_uri.clone(),
            confidence: self.confidence,
            expected_version: self.expected_version,
        }
    }
}

/// Input for `DeleteMemoryBlock`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DeleteBlockRequest {
    pub branch: Option<String>,
    pub id: String,
    #[serde(default = "default_actor")]
    pub actor: String,
}

/// Input for `GetMemoryBlock`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GetBlockRequest {
    pub branch: Option<String>,
    pub id: String,
}

/// Input for `QueryMemoryBlocks`.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct QueryBlocksRequest {
    pub branch: Option<String>,
    #[serde(rename = "type")]
    pub node_type: Option<String>,
    pub state: Option<BlockState>,
    pub visibility: Option<Visibility>,
    pub namespace: Option<String>,
    pub tag: Option<String>,
    pub parent_id: Option<String>,
    pub created_after: Option<chrono::DateTime<chrono::Utc>>,
    pub limit: Option<u32>,
    pub cursor: Option<String>,
}

impl QueryBlocksRequest {
    /// The listing filters this request describes.
    #[must_use]
    pub fn filters(&self) -> ListBlockFilters {
        let defaults = ListBlockFilters::default();
        ListBlockFilters {
            node_type: self.node_type.clone(),
            state: self.state,
            visibility: self.visibility,
            namespace: self.namespace.clone(),
            tag: self.tag.clone(),
            parent_id: self.parent_id.clone(),
            created_after: self.created_after,
            limit: self.limit.unwrap_or(defaults.limit),
            cursor: self.cursor.clone(),
        }
    }
}

/// Input for `CreateBlockLink`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CreateLinkRequest {
    pub branch: Option<String>,
    pub from: String,
    pub to: String,
    /// Canonical relation or a documented alias.
    pub relation: String,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "empty_object")]
    pub metadata: Value,
    #[serde(default = "default_actor")]
    pub actor: String,
}

/// Input for `DeleteBlockLink`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DeleteLinkRequest {
    pub branch: Option<String>,
    pub from: String,
    pub to: String,
    pub relation: String,
    #[serde(default = "default_actor")]
    pub actor: String,
}

/// Input for `GetLinkedBlocks`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct GetLinkedBlocksRequest {
    pub branch: Option<String>,
    pub id: String,
    /// Restrict to these relations (canonical or alias).
    pub relations: Option<Vec<String>>,
    #[serde(default = "default_direction")]
    pub direction: Direction,
}

fn default_direction() -> Direction {
    Direction::Both
}

/// Input for `ListLinks` filtering.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ListLinksRequest {
    pub branch: Option<String>,
    pub from_id: Option<String>,
    pub to_id: Option<String>,
    pub relation: Option<String>,
    pub limit: Option<u32>,
    pub cursor: Option<String>,
}

impl ListLinksRequest {
    /// The listing filters this request describes.
    #[must_use]
    pub fn filters(&self) -> ListLinkFilters {
        let defaults = ListLinkFilters::default();
        ListLinkFilters {
            from_id: self.from_id.clone(),
            to_id: self.to_id.clone(),
            relation: self.relation.clone(),
            limit: self.limit.unwrap_or(defaults.limit),
            cursor: self.cursor.clone(),
        }
    }
}

/// Input for `SemanticSearch`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SemanticSearchRequest {
    pub text: String,
    pub namespace: Option<String>,
    #[serde(rename = "type")]
    pub node_type: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_top_k")]
    pub k: usize,
}

fn default_top_k() -> usize {
    10
}

/// Input for `ListBranches` / `ListNamespaces`.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BranchScopedRequest {
    pub branch: Option<String>,
}

/// Input for `CheckoutBranch`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CheckoutBranchRequest {
    pub branch: String,
}

/// Input for `CreateBranch`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CreateBranchRequest {
    pub name: String,
    /// Source branch; defaults to the session's current branch head.
    pub from: Option<String>,
}

/// Input for `Commit`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CommitRequest {
    pub branch: Option<String>,
    pub message: String,
    #[serde(default = "default_actor")]
    pub actor: String,
}

/// Input for `Merge`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MergeRequest {
    /// Target branch; defaults to the session's current branch.
    pub branch: Option<String>,
    pub source: String,
    #[serde(default = "default_merge_strategy")]
    pub strategy: MergeStrategy,
}

fn default_merge_strategy() -> MergeStrategy {
    MergeStrategy::ThreeWay
}

/// Input for `CreateNamespace`.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CreateNamespaceRequest {
    pub branch: Option<String>,
    pub id: String,
    pub name: String,
    /// URL-safe slug; defaults to the id.
    pub slug: Option<String>,
    #[serde(default = "default_actor")]
    pub owner_id: String,
    pub description: Option<String>,
}

/// Input for `HealthCheck`.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct HealthCheckRequest {}

/// Output of a committed mutation.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct CommitOutcome {
    /// The data commit hash; absent when there was nothing to commit.
    pub hash: Option<String>,
}

/// Output of `DeleteMemoryBlock`.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct DeletedBlock {
    pub id: String,
    /// Version of the block at deletion time.
    pub block_version: i64,
    pub commit: CommitOutcome,
}

/// Output of `CheckoutBranch`.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct CheckoutOutcome {
    pub branch: String,
}

/// Output of `CreateBranch`.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct CreatedBranch {
    pub name: String,
    pub from: Option<String>,
}

/// One created link edge.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct LinkTriple {
    pub from: String,
    pub to: String,
    pub relation: String,
}

/// Output of `CreateBlockLink`.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct LinksCreated {
    pub links: Vec<LinkTriple>,
    pub commit: CommitOutcome,
}

/// Output of `HealthCheck`.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct HealthStatus {
    pub backend_reachable: bool,
    pub pool: PoolStats,
    pub indexed_blocks: usize,
    /// Committed mutations the index has not observed yet; absent when the
    /// backend was unreachable.
    pub index_lag: Option<u64>,
}
