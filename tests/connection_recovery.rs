//! Transparent reconnection of persistent sessions.
//!
//! The backend connection of a branch-pinned session is killed from a second
//! connection; the next operation on the scope must succeed after exactly
//! one transparent retry and still observe the pinned branch.
//!
//! Gated on `MEMBANK_TEST_BACKEND`; see `common`.

mod common;

use common::{dolt_bank, task_request, work_branch};
use membank_rust::storage::pool::SessionMode;
use std::time::Duration;

#[tokio::test]
async fn killed_connection_recovers_onto_the_pinned_branch() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let branch = work_branch(&bank, "recovery").await;
    let pool = bank.pool().clone();
    let kill_branch = branch.clone();

    let observed = pool
        .with_persistent(&branch, SessionMode::ReadWrite, |session| {
            let pool_ref = pool.clone();
            Box::pin(async move {
                let victim_id: u64 = sqlx::query_scalar("SELECT CONNECTION_ID()")
                    .fetch_one(session.conn()?)
                    .await?;

                // Kill the pinned session's backend connection from outside.
                let mut killer = pool_ref
                    .acquire_ephemeral(&kill_branch, Duration::from_secs(10))
                    .await?;
                sqlx::query(&format!("KILL {victim_id}"))
                    .execute(killer.conn()?)
                    .await?;
                pool_ref.release_ephemeral(killer).await;

                // The next operation hits the dead connection, is classified
                // as a connection error, and succeeds on the single
                // transparent retry.
                pool_ref
                    .with_retry(session, |s| {
                        Box::pin(async move { s.observed_branch().await })
                    })
                    .await
            })
        })
        .await
        .expect("operation after transparent rebind");

    assert_eq!(observed, branch, "rebind must restore the pinned branch");
}

#[tokio::test]
async fn recovered_scope_still_writes_exactly_one_proof() {
    let Some((bank, _dir)) = dolt_bank().await else {
        return;
    };
    let branch = work_branch(&bank, "recovery-write").await;
    let pool = bank.pool().clone();

    // Break the only idle persistent connection the pool would hand out, so
    // the mutation's first acquire rides a dead recycled connection.
    let mut session = pool
        .acquire_persistent(&branch, SessionMode::ReadWrite, Duration::from_secs(10))
        .await
        .expect("seed session");
    let victim_id: u64 = sqlx::query_scalar("SELECT CONNECTION_ID()")
        .fetch_one(session.conn().unwrap())
        .await
        .expect("connection id");
    pool.release(session).await;

    let mut killer = pool
        .acquire_ephemeral(&branch, Duration::from_secs(10))
        .await
        .expect("killer session");
    sqlx::query(&format!("KILL {victim_id}"))
        .execute(killer.conn().unwrap())
        .await
        .expect("kill idle connection");
    pool.release_ephemeral(killer).await;

    let created = bank
        .create_memory_block(task_request(&branch, "Survives a dead connection"))
        .await
        .expect("create through recovery");
    assert_eq!(created.active_branch, branch);

    let mut verifier = pool
        .acquire_ephemeral(&branch, Duration::from_secs(10))
        .await
        .expect("verifier");
    let proofs: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM block_proofs WHERE block_id = ?")
            .bind(&created.data.id)
            .fetch_one(verifier.conn().unwrap())
            .await
            .expect("proof count");
    assert_eq!(proofs, 1, "exactly one proof row despite the retry");
}
