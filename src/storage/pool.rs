//! Connection pool & branch coordinator.
//!
//! Two kinds of channels to the Dolt backend:
//!
//! - **ephemeral** connections: one per operation, bound to a branch on
//!   acquire, recycled through an idle list;
//! - **persistent** sessions: checked out exclusively, pinned to a branch
//!   until released, transparently reconnected (with branch restoration) on
//!   connection failure.
//!
//! Capacity is semaphore-bounded. A session dropped without release frees
//! its capacity permit; only the cached connection is lost.

use futures::future::BoxFuture;
use sqlx::{Connection as _, MySqlConnection};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::config::BankConfig;
use crate::error::{MemoryBankError, Result};

/// Mode a session is acquired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Read,
    Write,
    ReadWrite,
}

impl SessionMode {
    #[must_use]
    pub const fn allows_writes(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// Pool counters surfaced by the health check.
#[derive(Debug, Clone, Copy, serde::Serialize, schemars::JsonSchema)]
pub struct PoolStats {
    pub persistent_capacity: usize,
    pub persistent_available: usize,
    pub ephemeral_capacity: usize,
    pub ephemeral_available: usize,
}

struct IdleConn {
    conn: MySqlConnection,
    branch: String,
}

/// The coordinator owning both pools.
pub struct BranchCoordinator {
    config: Arc<BankConfig>,
    ephemeral_permits: Arc<Semaphore>,
    ephemeral_idle: Mutex<Vec<IdleConn>>,
    persistent_permits: Arc<Semaphore>,
    persistent_idle: Mutex<Vec<IdleConn>>,
    branch_write_locks: Mutex<std::collections::HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for BranchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchCoordinator")
            .field("dsn", &self.config.backend.dsn())
            .finish_non_exhaustive()
    }
}

/// A persistent session pinned to a branch.
///
/// The session carries its own capacity permit; dropping it returns the
/// permit even when `release` was never called (e.g. across a panic).
#[derive(Debug)]
pub struct PersistentSession {
    conn: Option<MySqlConnection>,
    branch: String,
    mode: SessionMode,
    poisoned: bool,
    _permit: OwnedSemaphorePermit,
}

impl PersistentSession {
    /// The branch this session is pinned to.
    #[must_use]
    pub fn branch(&self) -> &str {
        &self.branch
    }

    #[must_use]
    pub const fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Mark the session unusable; it will not be recycled on release.
    pub fn poison(&mut self) {
        self.poisoned = true;
    }

    /// The underlying connection.
    ///
    /// # Errors
    ///
    /// Fails when the session is poisoned or its connection was torn down
    /// by a failed rebind.
    pub fn conn(&mut self) -> Result<&mut MySqlConnection> {
        if self.poisoned {
            return Err(MemoryBankError::Fatal {
                message: "persistent session is poisoned".to_string(),
            });
        }
        self.conn.as_mut().ok_or_else(|| MemoryBankError::Connection {
            message: "persistent session has no live connection".to_string(),
            saturated: false,
        })
    }

    /// Ask the backend which branch this session is actually on.
    ///
    /// # Errors
    ///
    /// Propagates connection errors.
    pub async fn observed_branch(&mut self) -> Result<String> {
        let conn = self.conn()?;
        active_branch(conn).await
    }
}

/// An ephemeral connection bound to a branch for one operation.
#[derive(Debug)]
pub struct EphemeralSession {
    conn: Option<MySqlConnection>,
    branch: String,
    _permit: OwnedSemaphorePermit,
}

impl EphemeralSession {
    #[must_use]
    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// The underlying connection.
    ///
    /// # Errors
    ///
    /// Fails when the connection was already torn down.
    pub fn conn(&mut self) -> Result<&mut MySqlConnection> {
        self.conn.as_mut().ok_or_else(|| MemoryBankError::Connection {
            message: "ephemeral session has no live connection".to_string(),
            saturated: false,
        })
    }
}

impl BranchCoordinator {
    #[must_use]
    pub fn new(config: Arc<BankConfig>) -> Self {
        Self {
            ephemeral_permits: Arc::new(Semaphore::new(config.pool.ephemeral_max)),
            ephemeral_idle: Mutex::new(Vec::new()),
            persistent_permits: Arc::new(Semaphore::new(config.pool.persistent_max)),
            persistent_idle: Mutex::new(Vec::new()),
            branch_write_locks: Mutex::new(std::collections::HashMap::new()),
            config,
        }
    }

    /// Serialize writers per branch: a second concurrent write against the
    /// same branch queues here until the first releases its guard.
    pub async fn lock_branch_write(&self, branch: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.branch_write_locks.lock().await;
            Arc::clone(
                locks
                    .entry(branch.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            persistent_capacity: self.config.pool.persistent_max,
            persistent_available: self.persistent_permits.available_permits(),
            ephemeral_capacity: self.config.pool.ephemeral_max,
            ephemeral_available: self.ephemeral_permits.available_permits(),
        }
    }

    /// Acquire an ephemeral connection bound to `branch`.
    ///
    /// Waits for a pool slot up to `deadline`; exhaustion at deadline is a
    /// saturated `ConnectionError`.
    ///
    /// # Errors
    ///
    /// Saturation, connect failure, or checkout failure.
    pub async fn acquire_ephemeral(
        &self,
        branch: &str,
        deadline: Duration,
    ) -> Result<EphemeralSession> {
        let permit = acquire_permit(&self.ephemeral_permits, deadline, "ephemeral").await?;

        let mut conn = match self.ephemeral_idle.lock().await.pop() {
            Some(idle) => idle.conn,
            None => self.connect().await?,
        };

        if let Err(err) = bind_to_branch(&mut conn, branch).await {
            // A stale idle connection may have died; one fresh attempt.
            debug!(branch, error = %err, "recycled connection failed to bind, reconnecting");
            conn = self.connect().await?;
            bind_to_branch(&mut conn, branch).await?;
        }

        Ok(EphemeralSession {
            conn: Some(conn),
            branch: branch.to_string(),
            _permit: permit,
        })
    }

    /// Return an ephemeral connection to the idle list.
    pub async fn release_ephemeral(&self, mut session: EphemeralSession) {
        if let Some(conn) = session.conn.take() {
            self.ephemeral_idle.lock().await.push(IdleConn {
                conn,
                branch: session.branch.clone(),
            });
        }
    }

    /// Acquire a persistent session pinned to `branch`.
    ///
    /// # Errors
    ///
    /// Saturation, connect failure, or checkout/verification failure.
    pub async fn acquire_persistent(
        &self,
        branch: &str,
        mode: SessionMode,
        deadline: Duration,
    ) -> Result<PersistentSession> {
        let permit = acquire_permit(&self.persistent_permits, deadline, "persistent").await?;

        // Prefer an idle connection already on the right branch.
        let reused = {
            let mut idle = self.persistent_idle.lock().await;
            match idle.iter().position(|slot| slot.branch == branch) {
                Some(pos) => Some(idle.swap_remove(pos).conn),
                None => idle.pop().map(|slot| slot.conn),
            }
        };

        let mut conn = match reused {
            Some(conn) => conn,
            None => self.connect().await?,
        };

        if let Err(err) = bind_to_branch(&mut conn, branch).await {
            debug!(branch, error = %err, "recycled connection failed to bind, reconnecting");
            conn = self.connect().await?;
            bind_to_branch(&mut conn, branch).await?;
        }

        Ok(PersistentSession {
            conn: Some(conn),
            branch: branch.to_string(),
            mode,
            poisoned: false,
            _permit: permit,
        })
    }

    /// Return a persistent session to the pool. Poisoned sessions are
    /// discarded; the next acquire allocates a fresh connection.
    pub async fn release(&self, mut session: PersistentSession) {
        if session.poisoned {
            debug!(branch = %session.branch, "discarding poisoned session");
            return;
        }
        if let Some(conn) = session.conn.take() {
            self.persistent_idle.lock().await.push(IdleConn {
                conn,
                branch: session.branch.clone(),
            });
        }
    }

    /// Open a persistent scope on `branch`: acquire, run, release.
    ///
    /// The session's capacity permit is freed even if the closure panics
    /// (the session is dropped with the unwinding stack).
    ///
    /// # Errors
    ///
    /// Acquisition errors and whatever the closure returns.
    pub async fn with_persistent<T, F>(&self, branch: &str, mode: SessionMode, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut PersistentSession) -> BoxFuture<'a, Result<T>>,
    {
        let mut session = self
            .acquire_persistent(branch, mode, self.config.call_deadline_default)
            .await?;
        let result = f(&mut session).await;
        if let Err(err) = &result {
            if err.is_fatal() {
                session.poison();
            }
        }
        self.release(session).await;
        result
    }

    /// Discard a session's broken connection, open a new one, re-issue the
    /// branch checkout and verify the pinned branch survived.
    ///
    /// # Errors
    ///
    /// Connection errors, or `BranchContextLost` when the fresh connection
    /// cannot be bound to the originally pinned branch.
    pub async fn rebind(&self, session: &mut PersistentSession) -> Result<()> {
        session.conn = None;

        let mut conn = self.connect().await?;
        dolt_checkout(&mut conn, &session.branch).await?;
        let observed = active_branch(&mut conn).await?;
        if observed != session.branch {
            return Err(MemoryBankError::BranchContextLost {
                pinned: session.branch.clone(),
                observed,
            });
        }

        session.conn = Some(conn);
        Ok(())
    }

    /// Run an operation on a persistent session, retrying exactly once after
    /// a transparent reconnect when the failure is a connection error.
    ///
    /// Non-connection errors are never retried; a second failure is
    /// propagated unchanged. Fatal errors poison the session.
    ///
    /// # Errors
    ///
    /// Whatever the operation or the rebind produced.
    pub async fn with_retry<T, F>(&self, session: &mut PersistentSession, mut op: F) -> Result<T>
    where
        F: for<'a> FnMut(&'a mut PersistentSession) -> BoxFuture<'a, Result<T>>,
    {
        let result = op(session).await;
        let result = match result {
            Err(err) if err.is_retryable_connection_error() => {
                warn!(
                    branch = %session.branch,
                    error = %err,
                    "connection lost, rebinding session and retrying once"
                );
                self.rebind(session).await?;
                op(session).await
            }
            other => other,
        };

        if let Err(err) = &result {
            if err.is_fatal() {
                session.poison();
            }
        }
        result
    }

    /// Ping idle persistent connections and drop the dead ones.
    ///
    /// Called by the background health task; also usable directly in tests.
    pub async fn sweep_idle(&self) -> usize {
        let mut idle = self.persistent_idle.lock().await;
        let slots = std::mem::take(&mut *idle);
        let mut dropped = 0;
        for mut slot in slots {
            let healthy = tokio::time::timeout(
                self.config.connection_timeout,
                sqlx::query("SELECT 1").execute(&mut slot.conn),
            )
            .await;
            match healthy {
                Ok(Ok(_)) => idle.push(slot),
                _ => {
                    warn!(branch = %slot.branch, "dropping failed persistent connection");
                    dropped += 1;
                }
            }
        }
        dropped
    }

    /// Spawn the cooperative background health task.
    #[must_use]
    pub fn spawn_health_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let interval = coordinator.config.health_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let dropped = coordinator.sweep_idle().await;
                if dropped > 0 {
                    debug!(dropped, "health sweep removed dead connections");
                }
            }
        })
    }

    /// Close every idle connection. Checked-out sessions close on drop.
    pub async fn shutdown(&self) {
        let mut persistent = self.persistent_idle.lock().await;
        for slot in persistent.drain(..) {
            let _ = slot.conn.close().await;
        }
        drop(persistent);

        let mut ephemeral = self.ephemeral_idle.lock().await;
        for slot in ephemeral.drain(..) {
            let _ = slot.conn.close().await;
        }
    }

    async fn connect(&self) -> Result<MySqlConnection> {
        let dsn = self.config.backend.dsn();
        let connect = MySqlConnection::connect(&dsn);
        match tokio::time::timeout(self.config.connection_timeout, connect).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(MemoryBankError::Connection {
                message: format!(
                    "connection to {} timed out after {:?}",
                    self.config.backend.host, self.config.connection_timeout
                ),
                saturated: false,
            }),
        }
    }
}

async fn acquire_permit(
    semaphore: &Arc<Semaphore>,
    deadline: Duration,
    pool_name: &str,
) -> Result<OwnedSemaphorePermit> {
    match tokio::time::timeout(deadline, Arc::clone(semaphore).acquire_owned()).await {
        Ok(Ok(permit)) => Ok(permit),
        Ok(Err(_)) => Err(MemoryBankError::Connection {
            message: format!("{pool_name} pool is shut down"),
            saturated: false,
        }),
        Err(_) => Err(MemoryBankError::Connection {
            message: format!("{pool_name} pool exhausted after waiting {deadline:?}"),
            saturated: true,
        }),
    }
}

/// Switch a connection's session onto `branch` and verify it took effect.
async fn bind_to_branch(conn: &mut MySqlConnection, branch: &str) -> Result<()> {
    dolt_checkout(conn, branch).await?;
    let observed = active_branch(conn).await?;
    if observed == branch {
        Ok(())
    } else {
        Err(MemoryBankError::BranchContextLost {
            pinned: branch.to_string(),
            observed,
        })
    }
}

/// `CALL DOLT_CHECKOUT(?)` on this connection's session.
pub(crate) async fn dolt_checkout(conn: &mut MySqlConnection, branch: &str) -> Result<()> {
    sqlx::query("CALL DOLT_CHECKOUT(?)")
        .bind(branch)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// The branch this connection's session is bound to.
pub(crate) async fn active_branch(conn: &mut MySqlConnection) -> Result<String> {
    use sqlx::Row as _;
    let row = sqlx::query("SELECT active_branch() AS branch")
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.try_get("branch")?)
}
