//! Error types and classification for `membank_rust`.
//!
//! Every failure that crosses a layer boundary is a [`MemoryBankError`]
//! variant, and every variant maps to exactly one [`ErrorKind`]. At the tool
//! boundary errors are *returned*, never thrown: [`ErrorBody`] is the wire
//! envelope (`{kind, message, details?}`) agents consume.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MemoryBankError>;

/// Message fragments that identify a broken backend connection.
///
/// Matched case-insensitively against the full error text. The set mirrors
/// the MySQL client errors Dolt surfaces when a connection dies mid-call.
static CONNECTION_ERROR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)lost connection|connection .*closed|server has gone away|gone away|connection refused|connection reset|broken pipe|connection timed out|timeout.*connect|not connected|pool timed out",
    )
    .expect("connection error pattern is valid")
});

/// Machine-readable error kinds, serialized verbatim into [`ErrorBody::kind`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema,
)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Duplicate,
    CycleDetected,
    SchemaConflict,
    UnknownType,
    NamespaceMissing,
    ProtectedBranch,
    BranchContextLost,
    ConnectionError,
    OptimisticConflict,
    NoInverseRelation,
    IndexSyncFailed,
    CommitFailed,
    InvalidCursor,
    Fatal,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "Validation",
            Self::NotFound => "NotFound",
            Self::Duplicate => "Duplicate",
            Self::CycleDetected => "CycleDetected",
            Self::SchemaConflict => "SchemaConflict",
            Self::UnknownType => "UnknownType",
            Self::NamespaceMissing => "NamespaceMissing",
            Self::ProtectedBranch => "ProtectedBranch",
            Self::BranchContextLost => "BranchContextLost",
            Self::ConnectionError => "ConnectionError",
            Self::OptimisticConflict => "OptimisticConflict",
            Self::NoInverseRelation => "NoInverseRelation",
            Self::IndexSyncFailed => "IndexSyncFailed",
            Self::CommitFailed => "CommitFailed",
            Self::InvalidCursor => "InvalidCursor",
            Self::Fatal => "Fatal",
        }
    }
}

/// The library error type.
///
/// Messages name the failing stage and entity so agents can act on them
/// without parsing stack traces.
#[derive(Debug, Error)]
pub enum MemoryBankError {
    #[error("failed to validate {entity}: {reason}")]
    Validation { entity: String, reason: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} {id} already exists")]
    Duplicate { entity: &'static str, id: String },

    #[error("link {from} -> {to} ({relation}) would create a dependency cycle")]
    CycleDetected {
        from: String,
        to: String,
        relation: String,
    },

    #[error("schema {node_type} v{version} conflicts with the registered schema")]
    SchemaConflict { node_type: String, version: u32 },

    #[error("no schema registered for block type {node_type}")]
    UnknownType { node_type: String },

    #[error("namespace {namespace} does not exist")]
    NamespaceMissing { namespace: String },

    #[error("branch {branch} is protected and rejects writes")]
    ProtectedBranch { branch: String },

    #[error("session lost branch context: pinned to {pinned}, backend reports {observed}")]
    BranchContextLost { pinned: String, observed: String },

    #[error("connection error: {message}")]
    Connection { message: String, saturated: bool },

    #[error("block {id} was modified concurrently: expected version {expected}, found {observed}")]
    OptimisticConflict {
        id: String,
        expected: i64,
        observed: i64,
    },

    #[error("relation {relation} has no declared inverse")]
    NoInverseRelation { relation: String },

    #[error("failed to sync index for block {id}: {reason}")]
    IndexSync { id: String, reason: String },

    #[error("commit failed: {reason}")]
    CommitFailed { reason: String },

    #[error("invalid pagination cursor")]
    InvalidCursor,

    #[error("fatal: {message}")]
    Fatal { message: String },
}

impl MemoryBankError {
    /// The taxonomy kind for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Duplicate { .. } => ErrorKind::Duplicate,
            Self::CycleDetected { .. } => ErrorKind::CycleDetected,
            Self::SchemaConflict { .. } => ErrorKind::SchemaConflict,
            Self::UnknownType { .. } => ErrorKind::UnknownType,
            Self::NamespaceMissing { .. } => ErrorKind::NamespaceMissing,
            Self::ProtectedBranch { .. } => ErrorKind::ProtectedBranch,
            Self::BranchContextLost { .. } => ErrorKind::BranchContextLost,
            Self::Connection { .. } => ErrorKind::ConnectionError,
            Self::OptimisticConflict { .. } => ErrorKind::OptimisticConflict,
            Self::NoInverseRelation { .. } => ErrorKind::NoInverseRelation,
            Self::IndexSync { .. } => ErrorKind::IndexSyncFailed,
            Self::CommitFailed { .. } => ErrorKind::CommitFailed,
            Self::InvalidCursor => ErrorKind::InvalidCursor,
            Self::Fatal { .. } => ErrorKind::Fatal,
        }
    }

    /// Whether the coordinator may retry this operation once after a rebind.
    ///
    /// Saturation is excluded: the pool was healthy, just full, and retrying
    /// without releasing anything cannot help.
    #[must_use]
    pub const fn is_retryable_connection_error(&self) -> bool {
        matches!(self, Self::Connection { saturated: false, .. })
    }

    /// Whether this error poisons the persistent session that produced it.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }

    /// Structured details for the wire envelope, when the variant carries
    /// anything beyond its message.
    #[must_use]
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::ProtectedBranch { branch } => Some(json!({ "branch": branch })),
            Self::BranchContextLost { pinned, observed } => {
                Some(json!({ "pinned": pinned, "observed": observed }))
            }
            Self::OptimisticConflict {
                id,
                expected,
                observed,
            } => Some(json!({ "id": id, "expected": expected, "observed": observed })),
            Self::CycleDetected { from, to, relation } => {
                Some(json!({ "from": from, "to": to, "relation": relation }))
            }
            Self::Validation { entity, reason } => {
                Some(json!({ "entity": entity, "reason": reason }))
            }
            Self::NotFound { entity, id } | Self::Duplicate { entity, id } => {
                Some(json!({ "entity": entity, "id": id }))
            }
            Self::SchemaConflict { node_type, version } => {
                Some(json!({ "type": node_type, "version": version }))
            }
            Self::Connection { saturated, .. } if *saturated => {
                Some(json!({ "saturated": true }))
            }
            _ => None,
        }
    }

    /// Convert into the wire envelope.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
            details: self.details(),
        }
    }
}

/// The `{kind, message, details?}` envelope returned across the tool boundary.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ErrorBody {
    /// Machine-readable error kind.
    pub kind: ErrorKind,
    /// Human-readable message naming the failing stage and entity.
    pub message: String,
    /// Additional structured context, including the backend's original
    /// diagnostic where available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Whether an error message identifies a broken connection.
#[must_use]
pub fn is_connection_error_text(message: &str) -> bool {
    CONNECTION_ERROR_PATTERN.is_match(message)
}

impl From<sqlx::Error> for MemoryBankError {
    /// Classify a driver error.
    ///
    /// Connection-shaped failures (by error kind or by message pattern)
    /// become `Connection` so the coordinator can retry once; everything the
    /// storage layer did not already map to a domain variant is `Fatal` and
    /// poisons the session that produced it.
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => Self::Connection {
                message: err.to_string(),
                saturated: true,
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection {
                message: err.to_string(),
                saturated: false,
            },
            _ => {
                let message = err.to_string();
                if is_connection_error_text(&message) {
                    Self::Connection {
                        message,
                        saturated: false,
                    }
                } else {
                    Self::Fatal { message }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_patterns_match_known_failures() {
        for message in [
            "Lost connection to MySQL server during query",
            "MySQL server has gone away",
            "Connection refused (os error 111)",
            "connection reset by peer",
            "Broken pipe (os error 32)",
            "connection timed out",
            "io error: the connection was closed",
        ] {
            assert!(
                is_connection_error_text(message),
                "should classify as connection error: {message}"
            );
        }
    }

    #[test]
    fn non_connection_errors_do_not_match() {
        for message in [
            "Duplicate entry 'mb-1' for key 'PRIMARY'",
            "Check constraint 'memory_blocks_chk_1' is violated",
            "nothing to commit",
        ] {
            assert!(
                !is_connection_error_text(message),
                "should not classify as connection error: {message}"
            );
        }
    }

    #[test]
    fn kind_serializes_verbatim() {
        let body = MemoryBankError::ProtectedBranch {
            branch: "main".to_string(),
        }
        .to_body();
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["kind"], "ProtectedBranch");
        assert_eq!(value["details"]["branch"], "main");
        assert!(value["message"].as_str().unwrap().contains("main"));
    }

    #[test]
    fn optimistic_conflict_carries_observed_version() {
        let body = MemoryBankError::OptimisticConflict {
            id: "mb-abc".to_string(),
            expected: 3,
            observed: 5,
        }
        .to_body();
        assert_eq!(body.kind, ErrorKind::OptimisticConflict);
        let details = body.details.unwrap();
        assert_eq!(details["observed"], 5);
    }

    #[test]
    fn saturation_is_not_retryable() {
        let saturated = MemoryBankError::Connection {
            message: "pool exhausted".to_string(),
            saturated: true,
        };
        assert!(!saturated.is_retryable_connection_error());
        assert_eq!(saturated.kind(), ErrorKind::ConnectionError);

        let dropped = MemoryBankError::Connection {
            message: "broken pipe".to_string(),
            saturated: false,
        };
        assert!(dropped.is_retryable_connection_error());
    }
}
