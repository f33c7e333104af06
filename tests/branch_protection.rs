//! Protected-branch enforcement: writes to a protected branch are rejected
//! with the branch name in the error details and leave no trace behind.
//!
//! Gated on `MEMBANK_TEST_BACKEND`; see `common`.

mod common;

use common::{dolt_bank, task_request};
use membank_rust::error::ErrorKind;

async fn proof_count(bank: &membank_rust::StructuredMemoryBank, branch: &str) -> i64 {
    let mut session = bank
        .pool()
        .acquire_ephemeral(branch, std::time::Duration::from_secs(10))
        .await
        .expect("session");
    sqlx::query_scalar("SELECT COUNT(*) FROM block_proofs")
        .fetch_one(session.conn().unwrap())
        .await
        .expect("count")
}

#[tokio::test]
async fn writes_to_the_protected_default_branch_are_rejected() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let protected = bank.config().default_branch.clone();
    assert!(bank.config().is_protected(&protected));

    let before = proof_count(&bank, &protected).await;

    let err = bank
        .create_memory_block(task_request(&protected, "Should never land"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ProtectedBranch);
    assert_eq!(err.details().unwrap()["branch"], protected.as_str());

    let after = proof_count(&bank, &protected).await;
    assert_eq!(before, after, "no proof row may appear for a rejected write");
}

#[tokio::test]
async fn merge_is_the_sanctioned_path_into_a_protected_branch() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let protected = bank.config().default_branch.clone();
    let feature = common::work_branch(&bank, "merge-src").await;

    let created = bank
        .create_memory_block(task_request(&feature, "Merged work"))
        .await
        .expect("create on feature branch");

    let merged = bank
        .merge(
            serde_json::from_value(serde_json::json!({
                "branch": protected,
                "source": feature,
            }))
            .unwrap(),
        )
        .await
        .expect("merge into protected branch");
    assert_eq!(merged.active_branch, protected);

    let fetched = bank
        .get_memory_block(membank_rust::bank::requests::GetBlockRequest {
            branch: Some(protected),
            id: created.data.id,
        })
        .await
        .expect("block visible on protected branch after merge");
    assert_eq!(fetched.data.text, "Merged work");
}
