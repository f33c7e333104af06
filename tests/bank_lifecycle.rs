//! Block lifecycle against a real Dolt backend: create/read round trips,
//! version monotonicity, proof rows, property decomposition, hard deletes.
//!
//! Gated on `MEMBANK_TEST_BACKEND`; see `common`.

mod common;

use common::{dolt_bank, task_request, work_branch};
use membank_rust::bank::requests::{DeleteBlockRequest, GetBlockRequest, UpdateBlockRequest};
use membank_rust::error::ErrorKind;
use membank_rust::model::ProofOperation;
use sqlx::Row as _;

// ============================================================================
// CREATE / READ
// ============================================================================

#[tokio::test]
async fn create_then_get_round_trips() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let branch = work_branch(&bank, "lifecycle").await;

    let created = bank
        .create_memory_block(task_request(&branch, "Write spec"))
        .await
        .expect("create");
    assert_eq!(created.active_branch, branch);
    assert_eq!(created.data.block_version, 1);
    assert_eq!(created.data.node_type, "task");

    let fetched = bank
        .get_memory_block(GetBlockRequest {
            branch: Some(branch.clone()),
            id: created.data.id.clone(),
        })
        .await
        .expect("get");

    assert_eq!(fetched.active_branch, branch);
    // Round trip modulo server-assigned timestamps.
    assert_eq!(fetched.data.id, created.data.id);
    assert_eq!(fetched.data.text, "Write spec");
    assert_eq!(fetched.data.metadata, created.data.metadata);
    assert_eq!(fetched.data.tags, created.data.tags);
    assert_eq!(fetched.data.block_version, 1);
}

#[tokio::test]
async fn get_missing_block_is_not_found() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let branch = work_branch(&bank, "lifecycle").await;

    let err = bank
        .get_memory_block(GetBlockRequest {
            branch: Some(branch),
            id: "mb-does-not-exist".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ============================================================================
// UPDATES & VERSIONING
// ============================================================================

#[tokio::test]
async fn versions_increase_without_gaps() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let branch = work_branch(&bank, "versions").await;

    let created = bank
        .create_memory_block(task_request(&branch, "Versioned block"))
        .await
        .expect("create");
    let id = created.data.id.clone();

    for expected in 2..=4 {
        let updated = bank
            .update_memory_block(
                serde_json::from_value::<UpdateBlockRequest>(serde_json::json!({
                    "branch": branch,
                    "id": id,
                    "text": format!("revision {expected}"),
                    "actor": "tester",
                }))
                .unwrap(),
            )
            .await
            .expect("update");
        assert_eq!(updated.data.block_version, expected);
    }

    // One proof row per committed mutation, versions 1..=4 without gaps.
    let mut session = bank
        .pool()
        .acquire_ephemeral(&branch, std::time::Duration::from_secs(10))
        .await
        .expect("session");
    let rows = sqlx::query(
        "SELECT operation FROM block_proofs WHERE block_id = ? ORDER BY id ASC",
    )
    .bind(&id)
    .fetch_all(session.conn().unwrap())
    .await
    .expect("proof query");

    let operations: Vec<String> = rows
        .iter()
        .map(|row| row.try_get::<String, _>("operation").unwrap())
        .collect();
    assert_eq!(operations, vec!["create", "update", "update", "update"]);
}

#[tokio::test]
async fn stale_expected_version_conflicts() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let branch = work_branch(&bank, "conflict").await;

    let created = bank
        .create_memory_block(task_request(&branch, "Contended block"))
        .await
        .expect("create");
    let id = created.data.id.clone();

    bank.update_memory_block(
        serde_json::from_value::<UpdateBlockRequest>(serde_json::json!({
            "branch": branch, "id": id, "text": "second", "actor": "tester",
        }))
        .unwrap(),
    )
    .await
    .expect("first update");

    let err = bank
        .update_memory_block(
            serde_json::from_value::<UpdateBlockRequest>(serde_json::json!({
                "branch": branch, "id": id, "text": "third",
                "expected_version": 1, "actor": "tester",
            }))
            .unwrap(),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::OptimisticConflict);
    let details = err.details().unwrap();
    assert_eq!(details["observed"], 2, "error carries the observed version");
}

// ============================================================================
// METADATA VALIDATION & PROPERTIES
// ============================================================================

#[tokio::test]
async fn invalid_metadata_is_rejected_before_any_write() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let branch = work_branch(&bank, "validation").await;

    let mut request = task_request(&branch, "Missing criteria");
    request.metadata = serde_json::json!({ "title": "No criteria" });

    let err = bank.create_memory_block(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(
        err.to_string().contains("acceptance_criteria"),
        "message names the missing field: {err}"
    );
}

#[tokio::test]
async fn metadata_decomposes_into_single_valued_properties() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let branch = work_branch(&bank, "properties").await;

    let mut request = task_request(&branch, "Decomposed");
    request.metadata = serde_json::json!({
        "title": "Decomposed",
        "acceptance_criteria": ["done"],
        "priority": "high",
    });
    let created = bank.create_memory_block(request).await.expect("create");

    let mut session = bank
        .pool()
        .acquire_ephemeral(&branch, std::time::Duration::from_secs(10))
        .await
        .expect("session");

    // Exactly one value column per row, checked against the raw table.
    let rows = sqlx::query(
        "SELECT (value_text IS NOT NULL) + (value_number IS NOT NULL) + (value_json IS NOT NULL)
                    AS populated
         FROM block_properties WHERE block_id = ?",
    )
    .bind(&created.data.id)
    .fetch_all(session.conn().unwrap())
    .await
    .expect("property query");
    assert_eq!(rows.len(), 3);
    for row in &rows {
        let populated: i64 = row.try_get("populated").unwrap();
        assert_eq!(populated, 1, "exactly one value column per property row");
    }

    // And the typed view tags each value with the populated column.
    let properties = membank_rust::storage::Reader::new(session.conn().unwrap())
        .get_properties(&created.data.id)
        .await
        .expect("typed properties");
    let type_of = |name: &str| {
        properties
            .iter()
            .find(|p| p.property_name == name)
            .map(|p| p.value.property_type())
    };
    assert_eq!(type_of("title"), Some("text"));
    assert_eq!(type_of("priority"), Some("text"));
    assert_eq!(type_of("acceptance_criteria"), Some("json"));
}

// ============================================================================
// DELETE
// ============================================================================

#[tokio::test]
async fn delete_removes_the_block_and_leaves_a_final_proof() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let branch = work_branch(&bank, "delete").await;

    let created = bank
        .create_memory_block(task_request(&branch, "Doomed block"))
        .await
        .expect("create");
    let id = created.data.id.clone();

    let deleted = bank
        .delete_memory_block(DeleteBlockRequest {
            branch: Some(branch.clone()),
            id: id.clone(),
            actor: "tester".to_string(),
        })
        .await
        .expect("delete");
    assert!(deleted.data.commit.hash.is_some());

    let err = bank
        .get_memory_block(GetBlockRequest {
            branch: Some(branch.clone()),
            id: id.clone(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // The delete proof outlives the block.
    let mut session = bank
        .pool()
        .acquire_ephemeral(&branch, std::time::Duration::from_secs(10))
        .await
        .expect("session");
    let proofs = membank_rust::storage::Reader::new(session.conn().unwrap())
        .proofs_for_block(&id)
        .await
        .expect("proofs");
    assert_eq!(
        proofs.last().expect("at least one proof").operation,
        ProofOperation::Delete
    );
    assert!(
        proofs
            .last()
            .is_some_and(|proof| !proof.commit_hash.is_empty()),
        "delete proof carries the commit hash of the deleting commit"
    );
}
