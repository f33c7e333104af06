//! Link graph against a real backend: cycle rejection, bidirectional pairs,
//! duplicate prevention, neighbor discovery.
//!
//! Gated on `MEMBANK_TEST_BACKEND`; see `common`.

mod common;

use common::{dolt_bank, task_request, work_branch};
use membank_rust::bank::requests::{CreateLinkRequest, GetLinkedBlocksRequest};
use membank_rust::StructuredMemoryBank;
use membank_rust::error::ErrorKind;

async fn make_block(bank: &StructuredMemoryBank, branch: &str, text: &str) -> String {
    bank.create_memory_block(task_request(branch, text))
        .await
        .expect("create block")
        .data
        .id
}

fn link_request(branch: &str, from: &str, to: &str, relation: &str) -> CreateLinkRequest {
    serde_json::from_value(serde_json::json!({
        "branch": branch,
        "from": from,
        "to": to,
        "relation": relation,
        "actor": "tester",
    }))
    .expect("request shape")
}

// ============================================================================
// CYCLES
// ============================================================================

#[tokio::test]
async fn dependency_cycles_are_rejected() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let branch = work_branch(&bank, "cycles").await;

    let a = make_block(&bank, &branch, "Block A").await;
    let b = make_block(&bank, &branch, "Block B").await;

    bank.create_link(link_request(&branch, &a, &b, "depends_on"))
        .await
        .expect("a depends_on b");

    let err = bank
        .create_link(link_request(&branch, &b, &a, "depends_on"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CycleDetected);

    // The reversed "blocks" spelling closes the same loop.
    let err = bank
        .create_link(link_request(&branch, &a, &b, "blocks"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CycleDetected);
}

#[tokio::test]
async fn transitive_cycles_are_rejected() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let branch = work_branch(&bank, "cycles3").await;

    let a = make_block(&bank, &branch, "Chain A").await;
    let b = make_block(&bank, &branch, "Chain B").await;
    let c = make_block(&bank, &branch, "Chain C").await;

    bank.create_link(link_request(&branch, &a, &b, "depends_on"))
        .await
        .unwrap();
    bank.create_link(link_request(&branch, &b, &c, "depends_on"))
        .await
        .unwrap();

    let err = bank
        .create_link(link_request(&branch, &c, &a, "depends_on"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CycleDetected);
}

// ============================================================================
// BIDIRECTIONAL LINKS
// ============================================================================

#[tokio::test]
async fn bidirectional_links_create_both_rows_and_reject_repeats() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let branch = work_branch(&bank, "bidi").await;

    let a = make_block(&bank, &branch, "Pair A").await;
    let b = make_block(&bank, &branch, "Pair B").await;

    let mut request = link_request(&branch, &a, &b, "related_to");
    request.bidirectional = true;
    let created = bank.create_link(request.clone()).await.expect("create pair");
    assert_eq!(created.data.links.len(), 2);

    // Discoverable from either endpoint.
    for (id, other) in [(&a, &b), (&b, &a)] {
        let neighbors = bank
            .get_linked_blocks(GetLinkedBlocksRequest {
                branch: Some(branch.clone()),
                id: (*id).clone(),
                relations: Some(vec!["related_to".to_string()]),
                direction: membank_rust::storage::links::Direction::Outgoing,
            })
            .await
            .expect("neighbors");
        assert!(
            neighbors.data.iter().any(|n| &n.neighbor_id == other),
            "expected {other} among neighbors of {id}"
        );
    }

    let err = bank.create_link(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Duplicate);

    // The flat link listing sees both directions of the pair.
    let listed = bank
        .list_links(
            serde_json::from_value(serde_json::json!({
                "branch": branch,
                "relation": "related_to",
                "from_id": a,
            }))
            .unwrap(),
        )
        .await
        .expect("list links");
    assert_eq!(listed.data.items.len(), 1);
    assert_eq!(listed.data.items[0].to_id, b);
    assert!(listed.data.next_cursor.is_none());
}

#[tokio::test]
async fn one_way_relations_refuse_bidirectional_creation() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let branch = work_branch(&bank, "noinv").await;

    let a = make_block(&bank, &branch, "Mention A").await;
    let b = make_block(&bank, &branch, "Mention B").await;

    let mut request = link_request(&branch, &a, &b, "mentions");
    request.bidirectional = true;
    let err = bank.create_link(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoInverseRelation);

    // Nothing half-created.
    let neighbors = bank
        .get_linked_blocks(GetLinkedBlocksRequest {
            branch: Some(branch),
            id: a,
            relations: None,
            direction: membank_rust::storage::links::Direction::Both,
        })
        .await
        .expect("neighbors");
    assert!(neighbors.data.is_empty());
}

// ============================================================================
// ENDPOINT INTEGRITY
// ============================================================================

#[tokio::test]
async fn links_require_existing_endpoints() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let branch = work_branch(&bank, "endpoints").await;

    let a = make_block(&bank, &branch, "Lonely A").await;

    let err = bank
        .create_link(link_request(&branch, &a, "mb-ghost", "related_to"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn deleting_a_block_removes_its_links() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let branch = work_branch(&bank, "cascade").await;

    let a = make_block(&bank, &branch, "Cascade A").await;
    let b = make_block(&bank, &branch, "Cascade B").await;
    bank.create_link(link_request(&branch, &a, &b, "references"))
        .await
        .unwrap();

    bank.delete_memory_block(membank_rust::bank::requests::DeleteBlockRequest {
        branch: Some(branch.clone()),
        id: b.clone(),
        actor: "tester".to_string(),
    })
    .await
    .expect("delete endpoint");

    let neighbors = bank
        .get_linked_blocks(GetLinkedBlocksRequest {
            branch: Some(branch),
            id: a,
            relations: None,
            direction: membank_rust::storage::links::Direction::Both,
        })
        .await
        .expect("neighbors");
    assert!(neighbors.data.is_empty(), "dangling link survived the delete");
}
