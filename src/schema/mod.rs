//! Schema registry: the canonical mapping `(type, schema_version)` -> JSON
//! schema, plus metadata validation.
//!
//! Schemas are immutable once registered and only superseded by a higher
//! version. The in-memory cache of compiled validators is copy-on-write: a
//! single writer lock guards replacement of the whole snapshot, readers
//! clone the `Arc` and validate without holding any lock.

use jsonschema::Validator;
use parking_lot::RwLock;
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::error::{MemoryBankError, Result};

/// A registered schema with its compiled validator.
pub struct CompiledSchema {
    pub node_type: String,
    pub version: u32,
    pub schema: Value,
    validator: Validator,
}

impl std::fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledSchema")
            .field("node_type", &self.node_type)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
struct RegistryState {
    schemas: HashMap<(String, u32), Arc<CompiledSchema>>,
    latest: HashMap<String, u32>,
}

/// The process-wide schema registry.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    inner: RwLock<Arc<RegistryState>>,
}

impl SchemaRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema for `(node_type, version)`.
    ///
    /// Idempotent: re-registering an identical schema is a no-op returning
    /// `Ok(false)`. Returns `Ok(true)` when the schema was newly inserted.
    ///
    /// # Errors
    ///
    /// - `SchemaConflict` when a different schema is already registered at
    ///   the same version.
    /// - `Validation` when the schema itself does not compile, or `version`
    ///   is zero.
    pub fn register(&self, node_type: &str, version: u32, schema: Value) -> Result<bool> {
        if version == 0 {
            return Err(MemoryBankError::Validation {
                entity: format!("schema {node_type}"),
                reason: "schema_version must be a positive integer".to_string(),
            });
        }

        let mut guard = self.inner.write();

        let key = (node_type.to_string(), version);
        if let Some(existing) = guard.schemas.get(&key) {
            if existing.schema == schema {
                return Ok(false);
            }
            return Err(MemoryBankError::SchemaConflict {
                node_type: node_type.to_string(),
                version,
            });
        }

        let validator =
            jsonschema::validator_for(&schema).map_err(|e| MemoryBankError::Validation {
                entity: format!("schema {node_type} v{version}"),
                reason: e.to_string(),
            })?;

        let compiled = Arc::new(CompiledSchema {
            node_type: node_type.to_string(),
            version,
            schema,
            validator,
        });

        let mut next = (**guard).clone();
        next.schemas.insert(key, compiled);
        let latest = next.latest.entry(node_type.to_string()).or_insert(version);
        if version > *latest {
            *latest = version;
        }
        *guard = Arc::new(next);

        Ok(true)
    }

    /// The highest registered version for `node_type`.
    ///
    /// # Errors
    ///
    /// `UnknownType` when no schema is registered for the type.
    pub fn latest_version(&self, node_type: &str) -> Result<u32> {
        self.snapshot()
            .latest
            .get(node_type)
            .copied()
            .ok_or_else(|| MemoryBankError::UnknownType {
                node_type: node_type.to_string(),
            })
    }

    /// Resolve a schema; `version` defaults to the latest registered one.
    ///
    /// # Errors
    ///
    /// `UnknownType` when the type is unregistered, `NotFound` when the
    /// explicit version is.
    pub fn resolve(&self, node_type: &str, version: Option<u32>) -> Result<Arc<CompiledSchema>> {
        let state = self.snapshot();
        let version = match version {
            Some(v) => v,
            None => *state.latest.get(node_type).ok_or_else(|| {
                MemoryBankError::UnknownType {
                    node_type: node_type.to_string(),
                }
            })?,
        };

        state
            .schemas
            .get(&(node_type.to_string(), version))
            .cloned()
            .ok_or_else(|| {
                if state.latest.contains_key(node_type) {
                    MemoryBankError::NotFound {
                        entity: "schema version",
                        id: format!("{node_type} v{version}"),
                    }
                } else {
                    MemoryBankError::UnknownType {
                        node_type: node_type.to_string(),
                    }
                }
            })
    }

    /// Validate metadata against the schema for `(node_type, version)`.
    ///
    /// # Errors
    ///
    /// `Validation` reporting the first failing instance path and reason,
    /// e.g. `"/confidence" is not of type "object"`.
    pub fn validate(&self, node_type: &str, version: Option<u32>, metadata: &Value) -> Result<()> {
        let compiled = self.resolve(node_type, version)?;

        if let Err(error) = compiled.validator.validate(metadata) {
            let path = error.instance_path.to_string();
            let location = if path.is_empty() {
                "metadata root".to_string()
            } else {
                format!("metadata path {path}")
            };
            return Err(MemoryBankError::Validation {
                entity: format!("metadata for type {node_type} v{}", compiled.version),
                reason: format!("{location}: {error}"),
            });
        }

        Ok(())
    }

    /// Every registered block type.
    #[must_use]
    pub fn available_types(&self) -> BTreeSet<String> {
        self.snapshot().latest.keys().cloned().collect()
    }

    /// All registered schemas, for persistence into the registry table.
    #[must_use]
    pub fn all(&self) -> Vec<(String, u32, Value)> {
        let state = self.snapshot();
        let mut rows: Vec<_> = state
            .schemas
            .values()
            .map(|c| (c.node_type.clone(), c.version, c.schema.clone()))
            .collect();
        rows.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
        rows
    }

    /// Register the built-in schemas for the well-known block types.
    ///
    /// # Errors
    ///
    /// Propagates `SchemaConflict` if a different schema already occupies a
    /// built-in slot.
    pub fn register_builtins(&self) -> Result<()> {
        for (node_type, version, schema) in builtin_schemas() {
            self.register(node_type, version, schema)?;
        }
        Ok(())
    }

    fn snapshot(&self) -> Arc<RegistryState> {
        self.inner.read().clone()
    }
}

/// Built-in metadata schemas, v1 of each well-known block type.
#[must_use]
pub fn builtin_schemas() -> Vec<(&'static str, u32, Value)> {
    vec![
        (
            "task",
            1,
            json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string" },
                    "acceptance_criteria": { "type": "array", "items": { "type": "string" } },
                    "priority": { "type": "string" },
                    "assignee": { "type": "string" },
                },
                "required": ["title", "acceptance_criteria"],
            }),
        ),
        (
            "project",
            1,
            json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string" },
                    "description": { "type": "string" },
                    "status": { "type": "string" },
                },
                "required": ["title"],
            }),
        ),
        (
            "doc",
            1,
            json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string" },
                    "audience": { "type": "string" },
                    "format": { "type": "string" },
                },
                "required": ["title"],
            }),
        ),
        (
            "knowledge",
            1,
            json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string" },
                    "subject": { "type": "string" },
                    "source": { "type": "string" },
                },
                "required": ["title"],
            }),
        ),
        (
            "bug",
            1,
            json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string" },
                    "severity": {
                        "type": "string",
                        "enum": ["low", "medium", "high", "critical"],
                    },
                    "steps_to_reproduce": { "type": "array", "items": { "type": "string" } },
                    "expected_behavior": { "type": "string" },
                    "actual_behavior": { "type": "string" },
                },
                "required": ["title"],
            }),
        ),
        (
            "epic",
            1,
            json!({
                "type": "object",
                "properties": {
                    "title": { "type": "string" },
                    "goals": { "type": "array", "items": { "type": "string" } },
                },
                "required": ["title"],
            }),
        ),
        (
            "log",
            1,
            json!({
                "type": "object",
                "properties": {
                    "event": { "type": "string" },
                    "level": { "type": "string" },
                },
            }),
        ),
    ]
}
