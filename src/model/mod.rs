//! Data types for the structured-memory service.
//!
//! The central entity is [`MemoryBlock`]: a typed, namespaced, versioned row
//! with structured metadata and free-text content. Blocks are connected by
//! [`BlockLink`] edges drawn from the closed relation set in [`relations`],
//! and every committed mutation leaves a [`BlockProof`] audit row.

pub mod relations;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MemoryBankError, Result};

/// The well-known namespace blocks default into.
pub const DEFAULT_NAMESPACE_ID: &str = "public";

/// Lifecycle state of a block.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum BlockState {
    #[default]
    Draft,
    Published,
    Archived,
}

impl BlockState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Archived => "archived",
        }
    }
}

impl std::str::FromStr for BlockState {
    type Err = MemoryBankError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(Self::Draft),
            "published" => Ok(Self::Published),
            "archived" => Ok(Self::Archived),
            other => Err(MemoryBankError::Validation {
                entity: "block state".to_string(),
                reason: format!("unknown state '{other}'"),
            }),
        }
    }
}

/// Who may see a block.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Internal,
    Public,
    Restricted,
}

impl Visibility {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::Public => "public",
            Self::Restricted => "restricted",
        }
    }
}

impl std::str::FromStr for Visibility {
    type Err = MemoryBankError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "internal" => Ok(Self::Internal),
            "public" => Ok(Self::Public),
            "restricted" => Ok(Self::Restricted),
            other => Err(MemoryBankError::Validation {
                entity: "block visibility".to_string(),
                reason: format!("unknown visibility '{other}'"),
            }),
        }
    }
}

/// Human and AI confidence scores, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Confidence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai: Option<f64>,
}

impl Confidence {
    /// Reject scores outside `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns `Validation` naming the out-of-range field.
    pub fn validate(&self) -> Result<()> {
        for (name, score) in [("human", self.human), ("ai", self.ai)] {
            if let Some(score) = score {
                if !(0.0..=1.0).contains(&score) {
                    return Err(MemoryBankError::Validation {
                        entity: "confidence".to_string(),
                        reason: format!("{name} score {score} is outside [0, 1]"),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A typed, namespaced, versioned memory block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MemoryBlock {
    pub id: String,
    pub namespace_id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    pub schema_version: u32,
    pub text: String,
    pub state: BlockState,
    pub visibility: Visibility,
    pub block_version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub has_children: bool,
    pub tags: Vec<String>,
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_uri: Option<String>,
    pub confidence: Confidence,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl MemoryBlock {
    /// A block with server defaults filled in, ready for insertion.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        node_type: impl Into<String>,
        text: impl Into<String>,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            namespace_id: DEFAULT_NAMESPACE_ID.to_string(),
            node_type: node_type.into(),
            schema_version: 1,
            text: text.into(),
            state: BlockState::default(),
            visibility: Visibility::default(),
            block_version: 1,
            parent_id: None,
            has_children: false,
            tags: Vec::new(),
            metadata: Value::Object(serde_json::Map::new()),
            source_file: None,
            source_uri: None,
            confidence: Confidence::default(),
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
            embedding: None,
        }
    }
}

/// A scoping container for blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Namespace {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub owner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A directed, typed edge between two blocks.
///
/// `relation` is always a canonical name from [`relations`]; aliases are
/// resolved at the tool boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BlockLink {
    pub from_id: String,
    pub to_id: String,
    pub relation: String,
    pub priority: i64,
    pub link_metadata: Value,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// The typed payload of a decomposed metadata property.
///
/// Exactly one of the three SQL value columns is populated; the variant tag
/// is what lands in `property_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase", tag = "property_type", content = "value")]
pub enum PropertyValue {
    Text(String),
    Number(f64),
    Json(Value),
}

impl PropertyValue {
    #[must_use]
    pub const fn property_type(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Number(_) => "number",
            Self::Json(_) => "json",
        }
    }

    /// Classify an arbitrary metadata value into its property column.
    #[must_use]
    pub fn from_metadata_value(value: &Value) -> Self {
        match value {
            Value::String(s) => Self::Text(s.clone()),
            Value::Number(n) => n.as_f64().map_or_else(
                || Self::Json(value.clone()),
                Self::Number,
            ),
            Value::Bool(b) => Self::Json(Value::Bool(*b)),
            other => Self::Json(other.clone()),
        }
    }
}

/// A decomposed metadata row for indexed access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BlockProperty {
    pub block_id: String,
    pub property_name: String,
    #[serde(flatten)]
    pub value: PropertyValue,
    pub is_computed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The mutation recorded by a proof row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProofOperation {
    Create,
    Update,
    Delete,
}

impl ProofOperation {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::str::FromStr for ProofOperation {
    type Err = MemoryBankError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(MemoryBankError::Validation {
                entity: "proof operation".to_string(),
                reason: format!("unknown operation '{other}'"),
            }),
        }
    }
}

/// An append-only audit row tying a mutation to a backend commit hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BlockProof {
    pub id: i64,
    pub block_id: String,
    pub commit_hash: String,
    pub operation: ProofOperation,
    pub timestamp: DateTime<Utc>,
}

/// Fields to change on a block. `None` leaves the field alone; the
/// double-`Option` fields distinguish "leave alone" from "clear".
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct BlockPatch {
    pub text: Option<String>,
    pub state: Option<BlockState>,
    pub visibility: Option<Visibility>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<Value>,
    pub parent_id: Option<Option<String>>,
    pub source_file: Option<Option<String>>,
    pub source_uri: Option<Option<String>>,
    pub confidence: Option<Confidence>,
    /// When set, the update is rejected with `OptimisticConflict` unless the
    /// stored `block_version` matches.
    pub expected_version: Option<i64>,
}

impl BlockPatch {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.state.is_none()
            && self.visibility.is_none()
            && self.tags.is_none()
            && self.metadata.is_none()
            && self.parent_id.is_none()
            && self.source_file.is_none()
            && self.source_uri.is_none()
            && self.confidence.is_none()
    }
}

/// Filter options for listing blocks.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListBlockFilters {
    #[serde(rename = "type")]
    pub node_type: Option<String>,
    pub state: Option<BlockState>,
    pub visibility: Option<Visibility>,
    pub namespace: Option<String>,
    pub tag: Option<String>,
    pub parent_id: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default = "default_page_limit")]
    pub limit: u32,
    pub cursor: Option<String>,
}

impl Default for ListBlockFilters {
    fn default() -> Self {
        Self {
            node_type: None,
            state: None,
            visibility: None,
            namespace: None,
            tag: None,
            parent_id: None,
            created_after: None,
            limit: default_page_limit(),
            cursor: None,
        }
    }
}

/// Filter options for listing links.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ListLinkFilters {
    pub from_id: Option<String>,
    pub to_id: Option<String>,
    pub relation: Option<String>,
    #[serde(default = "default_page_limit")]
    pub limit: u32,
    pub cursor: Option<String>,
}

impl Default for ListLinkFilters {
    fn default() -> Self {
        Self {
            from_id: None,
            to_id: None,
            relation: None,
            limit: default_page_limit(),
            cursor: None,
        }
    }
}

const fn default_page_limit() -> u32 {
    100
}

/// One page of a cursor-based listing.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Present when more rows match beyond this page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub page_size: u32,
    /// True when the listing was truncated by `limit`.
    pub partial: bool,
}

/// A branch as reported by the versioned backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BranchInfo {
    pub name: String,
    pub head_commit: String,
    /// Whether the branch's working set has uncommitted changes.
    pub dirty: bool,
    /// Whether this is the branch the reporting session is bound to.
    pub active: bool,
}
