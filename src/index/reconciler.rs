//! Background index reconciler.
//!
//! Re-drives index updates that failed after their SQL commit succeeded. The
//! reconciler scans `block_proofs` for rows past the index's high-water mark
//! and replays each mutation against the index: create/update re-upserts the
//! block, delete removes it. A single cooperative worker; it holds no
//! user-visible locks.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::BankConfig;
use crate::error::Result;
use crate::index::SemanticIndex;
use crate::model::ProofOperation;
use crate::storage::pool::BranchCoordinator;
use crate::storage::reader::Reader;

const BATCH_SIZE: u32 = 256;

/// The reconciler worker. Operates on the service default branch, which is
/// the branch the index mirrors.
pub struct Reconciler {
    pool: Arc<BranchCoordinator>,
    index: Arc<SemanticIndex>,
    config: Arc<BankConfig>,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        pool: Arc<BranchCoordinator>,
        index: Arc<SemanticIndex>,
        config: Arc<BankConfig>,
    ) -> Self {
        Self {
            pool,
            index,
            config,
        }
    }

    /// Replay one batch of unobserved proofs into the index.
    ///
    /// Returns how many proofs were processed; zero means the index is
    /// caught up.
    ///
    /// # Errors
    ///
    /// Connection or index failures; the next run resumes from the
    /// high-water mark, so partial progress is never lost.
    pub async fn run_once(&self) -> Result<usize> {
        let branch = self.config.default_branch.clone();
        let mut session = self
            .pool
            .acquire_ephemeral(&branch, self.config.call_deadline_default)
            .await?;

        let result = self.drain_batch(&mut session).await;
        self.pool.release_ephemeral(session).await;
        result
    }

    async fn drain_batch(
        &self,
        session: &mut crate::storage::pool::EphemeralSession,
    ) -> Result<usize> {
        let last_observed = self.index.last_observed_proof().await;
        let proofs = Reader::new(session.conn()?)
            .proofs_after(last_observed, BATCH_SIZE)
            .await?;

        let mut processed = 0;
        for proof in proofs {
            match proof.operation {
                ProofOperation::Delete => {
                    self.index.remove(&proof.block_id).await?;
                }
                ProofOperation::Create | ProofOperation::Update => {
                    let block = Reader::new(session.conn()?)
                        .get_block(&proof.block_id)
                        .await?;
                    match block {
                        Some(block) => {
                            self.index
                                .upsert(&block, Some(&proof.commit_hash))
                                .await?;
                        }
                        // Deleted since; the delete proof later in the scan
                        // (or already observed) keeps the index right.
                        None => {
                            self.index.remove(&proof.block_id).await?;
                        }
                    }
                }
            }
            self.index.set_last_observed_proof(proof.id).await?;
            processed += 1;
        }

        if processed > 0 {
            debug!(processed, "reconciler replayed proofs into the index");
        }
        Ok(processed)
    }

    /// How many committed mutations the index has not observed yet.
    ///
    /// # Errors
    ///
    /// Connection failures.
    pub async fn lag(&self) -> Result<u64> {
        let branch = self.config.default_branch.clone();
        let mut session = self
            .pool
            .acquire_ephemeral(&branch, self.config.connection_timeout)
            .await?;

        let last_observed = self.index.last_observed_proof().await;
        let result: Result<i64> = async {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM block_proofs WHERE id > ?")
                    .bind(last_observed)
                    .fetch_one(session.conn()?)
                    .await?;
            Ok(count)
        }
        .await;

        self.pool.release_ephemeral(session).await;
        Ok(result?.unsigned_abs())
    }

    /// Spawn the cooperative background loop.
    #[must_use]
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.health_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.run_once().await {
                    Ok(0) => {}
                    Ok(processed) => {
                        debug!(processed, "index reconciliation pass complete");
                    }
                    Err(err) => {
                        warn!(error = %err, "index reconciliation pass failed");
                    }
                }
            }
        })
    }
}
