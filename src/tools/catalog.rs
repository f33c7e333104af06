//! The concrete tool catalog.
//!
//! Aliases for link relations are resolved here, at the tool boundary;
//! everything below operates on canonical relation names only.

use crate::bank::requests::{
    BranchScopedRequest, CheckoutBranchRequest, CommitRequest, CreateBlockRequest,
    CreateBranchRequest, CreateLinkRequest, CreateNamespaceRequest, DeleteBlockRequest,
    DeleteLinkRequest, GetBlockRequest, GetLinkedBlocksRequest, HealthCheckRequest, MergeRequest,
    QueryBlocksRequest, SemanticSearchRequest, UpdateBlockRequest,
};
use crate::error::MemoryBankError;
use crate::model::relations;
use crate::tools::{Tool, tool};

/// Resolve a relation name or alias to its canonical form.
fn canonical_relation(raw: &str) -> crate::error::Result<String> {
    relations::canonicalize(raw)
        .map(str::to_string)
        .ok_or_else(|| MemoryBankError::Validation {
            entity: "link relation".to_string(),
            reason: format!("unknown relation '{raw}'"),
        })
}

/// Every tool the surface exposes.
#[must_use]
pub fn build_tools() -> Vec<Tool> {
    vec![
        tool(
            "CreateMemoryBlock",
            "Create a typed memory block; metadata is validated against the registered schema for its type.",
            |bank, req: CreateBlockRequest| async move { bank.create_memory_block(req).await },
        ),
        tool(
            "UpdateMemoryBlock",
            "Patch a block's fields; bumps block_version and records a proof.",
            |bank, req: UpdateBlockRequest| async move { bank.update_memory_block(req).await },
        ),
        tool(
            "DeleteMemoryBlock",
            "Hard-delete a block, its properties and links; a final delete proof survives.",
            |bank, req: DeleteBlockRequest| async move { bank.delete_memory_block(req).await },
        ),
        tool(
            "GetMemoryBlock",
            "Fetch one block by id.",
            |bank, req: GetBlockRequest| async move { bank.get_memory_block(req).await },
        ),
        tool(
            "QueryMemoryBlocks",
            "List blocks by type/state/visibility/namespace/tag/parent filters, cursor-paged.",
            |bank, req: QueryBlocksRequest| async move { bank.query_blocks(req).await },
        ),
        tool(
            "CreateBlockLink",
            "Create a typed link between two blocks; optionally also its inverse.",
            |bank, mut req: CreateLinkRequest| async move {
                req.relation = canonical_relation(&req.relation)?;
                bank.create_link(req).await
            },
        ),
        tool(
            "DeleteBlockLink",
            "Delete one link triple.",
            |bank, mut req: DeleteLinkRequest| async move {
                req.relation = canonical_relation(&req.relation)?;
                bank.delete_link(req).await
            },
        ),
        tool(
            "GetLinkedBlocks",
            "The links around a block, optionally filtered by relation and direction.",
            |bank, req: GetLinkedBlocksRequest| async move { bank.get_linked_blocks(req).await },
        ),
        tool(
            "SemanticSearch",
            "Cosine-similarity search over indexed block text, filterable by namespace, type and tags.",
            |bank, req: SemanticSearchRequest| async move { bank.semantic_search(req).await },
        ),
        tool(
            "ListBranches",
            "All branches with head commit, dirty flag and the session's active branch.",
            |bank, req: BranchScopedRequest| async move { bank.list_branches(req).await },
        ),
        tool(
            "CheckoutBranch",
            "Switch the session's current branch.",
            |bank, req: CheckoutBranchRequest| async move { bank.checkout_branch(req).await },
        ),
        tool(
            "CreateBranch",
            "Create a branch from an existing branch's head.",
            |bank, req: CreateBranchRequest| async move { bank.create_branch(req).await },
        ),
        tool(
            "Commit",
            "Commit outstanding working-set changes on a branch.",
            |bank, req: CommitRequest| async move { bank.commit_changes(req).await },
        ),
        tool(
            "Merge",
            "Merge a source branch into the target branch.",
            |bank, req: MergeRequest| async move { bank.merge(req).await },
        ),
        tool(
            "ListNamespaces",
            "All namespaces.",
            |bank, req: BranchScopedRequest| async move { bank.list_namespaces(req).await },
        ),
        tool(
            "CreateNamespace",
            "Create a namespace with a unique slug.",
            |bank, req: CreateNamespaceRequest| async move { bank.create_namespace(req).await },
        ),
        tool(
            "HealthCheck",
            "Connection-pool state, backend reachability and index lag.",
            |bank, _req: HealthCheckRequest| async move { Ok(bank.health().await) },
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bank::StructuredMemoryBank;
    use crate::config::{BackendConfig, BankConfig, IndexConfig};
    use crate::error::ErrorKind;
    use crate::tools::ToolCatalog;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn offline_bank() -> Arc<StructuredMemoryBank> {
        static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let unique = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let index_path = std::env::temp_dir()
            .join(format!("membank-tools-test-{}-{unique}", std::process::id()))
            .join("index.json");

        let config = BankConfig {
            backend: BackendConfig {
                // Nothing listens on the discard port; connects fail fast.
                port: 9,
                ..BackendConfig::default()
            },
            index: IndexConfig {
                path: index_path,
                ..IndexConfig::default()
            },
            connection_timeout: Duration::from_millis(300),
            ..BankConfig::default()
        };
        let bank = Arc::new(StructuredMemoryBank::new(config));
        bank.registry().register_builtins().unwrap();
        bank
    }

    #[test]
    fn catalog_exposes_the_documented_tools() {
        let catalog = ToolCatalog::new(offline_bank());
        let names = catalog.names();
        for expected in [
            "CreateMemoryBlock",
            "UpdateMemoryBlock",
            "DeleteMemoryBlock",
            "GetMemoryBlock",
            "QueryMemoryBlocks",
            "CreateBlockLink",
            "DeleteBlockLink",
            "GetLinkedBlocks",
            "SemanticSearch",
            "ListBranches",
            "CheckoutBranch",
            "CreateBranch",
            "Commit",
            "Merge",
            "ListNamespaces",
            "CreateNamespace",
            "HealthCheck",
        ] {
            assert!(names.contains(&expected), "missing tool {expected}");
        }
        assert_eq!(names.len(), 17);
    }

    #[test]
    fn descriptors_serialize_with_schemas() {
        let catalog = ToolCatalog::new(offline_bank());
        for descriptor in catalog.descriptors() {
            let value = serde_json::to_value(&descriptor).unwrap();
            assert!(value["input_schema"].is_object(), "{}", descriptor.name);
            assert!(value["output_schema"].is_object(), "{}", descriptor.name);
            assert!(!descriptor.description.is_empty());
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_a_not_found_envelope() {
        let catalog = ToolCatalog::new(offline_bank());
        let response = catalog.invoke("Nonexistent", json!({}), None).await;
        assert!(!response.ok);
        assert_eq!(response.error.unwrap().kind, ErrorKind::NotFound);
        assert_eq!(response.active_branch, "main");
    }

    #[tokio::test]
    async fn unknown_input_fields_are_rejected() {
        let catalog = ToolCatalog::new(offline_bank());
        let response = catalog
            .invoke(
                "CreateMemoryBlock",
                json!({ "type": "task", "surprise": 1 }),
                None,
            )
            .await;
        assert!(!response.ok);
        let error = response.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Validation);
        assert!(error.message.contains("CreateMemoryBlock input"));
    }

    #[tokio::test]
    async fn protected_branch_rejection_carries_the_branch() {
        let catalog = ToolCatalog::new(offline_bank());
        let response = catalog
            .invoke(
                "CreateMemoryBlock",
                json!({
                    "type": "task",
                    "branch": "main",
                    "text": "Write spec",
                    "metadata": { "title": "Spec", "acceptance_criteria": ["done"] },
                }),
                None,
            )
            .await;
        assert!(!response.ok);
        let error = response.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ProtectedBranch);
        assert_eq!(error.details.unwrap()["branch"], "main");
        assert_eq!(response.active_branch, "main");
    }

    #[tokio::test]
    async fn alias_relations_canonicalize_before_dispatch() {
        let catalog = ToolCatalog::new(offline_bank());
        // Unknown alias fails fast with Validation, before any backend work.
        let response = catalog
            .invoke(
                "CreateBlockLink",
                json!({ "from": "a", "to": "b", "relation": "friend_of" }),
                None,
            )
            .await;
        assert!(!response.ok);
        assert_eq!(response.error.unwrap().kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn health_check_degrades_gracefully_offline() {
        let catalog = ToolCatalog::new(offline_bank());
        let response = catalog.invoke("HealthCheck", json!({}), None).await;
        assert!(response.ok);
        let data = response.data.unwrap();
        assert_eq!(data["backend_reachable"], false);
        assert!(data["index_lag"].is_null());
        assert_eq!(data["pool"]["persistent_capacity"], 4);
    }

    #[tokio::test]
    async fn semantic_search_runs_without_backend() {
        let bank = offline_bank();
        bank.index()
            .upsert(
                &crate::model::MemoryBlock::new("mb-1", "doc", "rust memory banks", "tester"),
                None,
            )
            .await
            .unwrap();

        let catalog = ToolCatalog::new(bank);
        let response = catalog
            .invoke(
                "SemanticSearch",
                json!({ "text": "rust memory banks", "k": 3 }),
                None,
            )
            .await;
        assert!(response.ok);
        let hits = response.data.unwrap();
        assert_eq!(hits[0]["id"], "mb-1");
    }

    #[tokio::test]
    async fn offline_mutation_reports_a_connection_error() {
        let catalog = ToolCatalog::new(offline_bank());
        let response = catalog
            .invoke(
                "CreateMemoryBlock",
                json!({
                    "type": "task",
                    "branch": "scratch",
                    "text": "Write spec",
                    "metadata": { "title": "Spec", "acceptance_criteria": ["done"] },
                }),
                None,
            )
            .await;
        assert!(!response.ok);
        assert_eq!(
            response.error.unwrap().kind,
            ErrorKind::ConnectionError,
            "unreachable backend should classify as a connection error"
        );
        assert_eq!(response.active_branch, "scratch");
    }
}
