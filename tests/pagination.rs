//! Cursor pagination over block listings.
//!
//! Created blocks carry a per-run tag and queries filter on it, so blocks
//! inherited from the default branch never skew the counts.
//!
//! Gated on `MEMBANK_TEST_BACKEND`; see `common`.

mod common;

use common::{dolt_bank, work_branch};
use membank_rust::StructuredMemoryBank;
use membank_rust::bank::requests::{CreateBlockRequest, QueryBlocksRequest};
use membank_rust::error::ErrorKind;

fn tagged_request(branch: &str, tag: &str, text: &str) -> CreateBlockRequest {
    serde_json::from_value(serde_json::json!({
        "type": "task",
        "branch": branch,
        "text": text,
        "tags": [tag],
        "metadata": { "title": text, "acceptance_criteria": ["done"] },
        "actor": "tester",
    }))
    .expect("request shape")
}

fn query(branch: &str, tag: &str, limit: u32, cursor: Option<&str>) -> QueryBlocksRequest {
    let mut body = serde_json::json!({
        "branch": branch,
        "type": "task",
        "tag": tag,
        "limit": limit,
    });
    if let Some(cursor) = cursor {
        body["cursor"] = serde_json::Value::String(cursor.to_string());
    }
    serde_json::from_value(body).expect("request shape")
}

async fn seed(bank: &StructuredMemoryBank, branch: &str, tag: &str, count: usize) {
    for i in 0..count {
        bank.create_memory_block(tagged_request(branch, tag, &format!("Paged block {i:03}")))
            .await
            .expect("create");
    }
}

#[tokio::test]
async fn two_page_walk_over_165_blocks() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let branch = work_branch(&bank, "paging").await;
    let tag = format!("run-{branch}");
    seed(&bank, &branch, &tag, 165).await;

    let first = bank
        .query_blocks(query(&branch, &tag, 100, None))
        .await
        .expect("first page");
    assert_eq!(first.data.items.len(), 100);
    assert_eq!(first.data.page_size, 100);
    assert!(first.data.partial);
    let cursor = first.data.next_cursor.expect("cursor to page two");

    let second = bank
        .query_blocks(query(&branch, &tag, 100, Some(&cursor)))
        .await
        .expect("second page");
    assert_eq!(second.data.items.len(), 65);
    assert!(second.data.next_cursor.is_none(), "no page after the last row");
    assert!(!second.data.partial);

    // No overlap between pages.
    let first_ids: std::collections::HashSet<_> =
        first.data.items.iter().map(|b| b.id.clone()).collect();
    assert!(second.data.items.iter().all(|b| !first_ids.contains(&b.id)));
}

#[tokio::test]
async fn page_boundary_on_the_last_row_yields_no_cursor() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let branch = work_branch(&bank, "boundary").await;
    let tag = format!("run-{branch}");
    seed(&bank, &branch, &tag, 10).await;

    let page = bank
        .query_blocks(query(&branch, &tag, 10, None))
        .await
        .expect("exact page");
    assert_eq!(page.data.items.len(), 10);
    assert!(
        page.data.next_cursor.is_none(),
        "cursor ending exactly at the last row must be null"
    );
}

#[tokio::test]
async fn foreign_cursors_are_rejected() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let branch = work_branch(&bank, "badcursor").await;

    let err = bank
        .query_blocks(query(&branch, "unused", 10, Some("not-a-cursor")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidCursor);
}
