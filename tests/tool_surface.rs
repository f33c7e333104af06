//! End-to-end tool calls: the seed flow through the catalog, with envelope
//! assertions on `ok`, `active_branch`, `data` and `error`.
//!
//! Gated on `MEMBANK_TEST_BACKEND`; see `common`.

mod common;

use common::{dolt_bank, work_branch};
use membank_rust::ToolCatalog;
use serde_json::json;

#[tokio::test]
async fn create_then_get_through_the_catalog() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let branch = work_branch(&bank, "tools").await;
    let catalog = ToolCatalog::new(bank);

    let created = catalog
        .invoke(
            "CreateMemoryBlock",
            json!({
                "type": "task",
                "branch": branch,
                "namespace": "public",
                "text": "Write spec",
                "metadata": { "title": "Spec", "acceptance_criteria": ["done"] },
            }),
            None,
        )
        .await;
    assert!(created.ok, "create failed: {:?}", created.error);
    assert_eq!(created.active_branch, branch);
    let data = created.data.unwrap();
    let id = data["id"].as_str().expect("created id").to_string();
    assert_eq!(data["block_version"], 1);

    let fetched = catalog
        .invoke(
            "GetMemoryBlock",
            json!({ "branch": branch, "id": id }),
            None,
        )
        .await;
    assert!(fetched.ok);
    assert_eq!(fetched.active_branch, branch);
    let fetched = fetched.data.unwrap();
    assert_eq!(fetched["id"], id.as_str());
    assert_eq!(fetched["text"], "Write spec");
    assert_eq!(fetched["block_version"], 1);
}

#[tokio::test]
async fn list_branches_marks_the_bound_branch_active() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let branch = work_branch(&bank, "tools-branches").await;
    let catalog = ToolCatalog::new(bank);

    let response = catalog
        .invoke("ListBranches", json!({ "branch": branch }), None)
        .await;
    assert!(response.ok);
    assert_eq!(response.active_branch, branch);

    let branches = response.data.unwrap();
    let me = branches
        .as_array()
        .unwrap()
        .iter()
        .find(|b| b["name"] == branch.as_str())
        .expect("work branch listed");
    assert_eq!(me["active"], true);
    assert!(me["head_commit"].as_str().is_some_and(|h| !h.is_empty()));
}

#[tokio::test]
async fn namespaces_round_trip_through_the_catalog() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let branch = work_branch(&bank, "tools-ns").await;
    let catalog = ToolCatalog::new(bank);

    let suffix = std::process::id();
    let ns_id = format!("team-{suffix}-{branch}")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect::<String>()
        .to_lowercase();

    let created = catalog
        .invoke(
            "CreateNamespace",
            json!({
                "branch": branch,
                "id": ns_id,
                "name": format!("Team {suffix} {branch}"),
            }),
            None,
        )
        .await;
    assert!(created.ok, "create namespace failed: {:?}", created.error);

    let listed = catalog
        .invoke("ListNamespaces", json!({ "branch": branch }), None)
        .await;
    assert!(listed.ok);
    let namespaces = listed.data.unwrap();
    assert!(
        namespaces
            .as_array()
            .unwrap()
            .iter()
            .any(|ns| ns["id"] == ns_id.as_str()),
        "created namespace should be listed"
    );
}

#[tokio::test]
async fn empty_namespaces_can_be_deleted_but_occupied_ones_cannot() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let branch = work_branch(&bank, "ns-guard").await;

    let ns_id = format!("guard-{branch}").to_lowercase();
    bank.create_namespace(
        serde_json::from_value(serde_json::json!({
            "branch": branch,
            "id": ns_id,
            "name": format!("Guard {branch}"),
        }))
        .unwrap(),
    )
    .await
    .expect("create namespace");

    // Occupied: a block inside blocks the delete.
    let mut request = common::task_request(&branch, "Namespace occupant");
    request.namespace = Some(ns_id.clone());
    let occupant = bank.create_memory_block(request).await.expect("create block");

    let err = bank
        .delete_namespace(Some(&branch), &ns_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), membank_rust::error::ErrorKind::Validation);

    // Empty again: the delete goes through.
    bank.delete_memory_block(membank_rust::bank::requests::DeleteBlockRequest {
        branch: Some(branch.clone()),
        id: occupant.data.id,
        actor: "tester".to_string(),
    })
    .await
    .expect("delete occupant");

    bank.delete_namespace(Some(&branch), &ns_id)
        .await
        .expect("delete empty namespace");

    let listed = bank
        .list_namespaces(serde_json::from_value(serde_json::json!({ "branch": branch })).unwrap())
        .await
        .expect("list");
    assert!(listed.data.iter().all(|ns| ns.id != ns_id));
}
