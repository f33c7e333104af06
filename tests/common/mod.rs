#![allow(dead_code)]

//! Shared harness for the integration suites.
//!
//! SQL-touching tests need a reachable Dolt SQL server and are gated on the
//! `MEMBANK_TEST_BACKEND` environment variable. When it is unset the suites
//! skip (pass vacuously) with a log line; when it is set, connection
//! parameters come from the usual `MEMBANK_BACKEND_*` variables.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use membank_rust::bank::requests::CreateBlockRequest;
use membank_rust::bank::requests::CreateBranchRequest;
use membank_rust::config::{BankConfig, ConfigLayer, IndexConfig};
use membank_rust::{StructuredMemoryBank, logging};
use tempfile::TempDir;

static INIT: std::sync::Once = std::sync::Once::new();
static BRANCH_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn init_test_logging() {
    INIT.call_once(logging::init_test_logging);
}

/// A bootstrapped bank against the test backend, or `None` when the backend
/// gate is off. The `TempDir` owns the index state for the bank's lifetime.
pub async fn dolt_bank() -> Option<(Arc<StructuredMemoryBank>, TempDir)> {
    init_test_logging();

    if std::env::var("MEMBANK_TEST_BACKEND").is_err() {
        eprintln!("skipping: MEMBANK_TEST_BACKEND is not set");
        return None;
    }

    let dir = TempDir::new().expect("tempdir");
    let env = ConfigLayer::from_env();
    let config = BankConfig {
        index: IndexConfig {
            path: dir.path().join("index.json"),
            ..IndexConfig::default()
        },
        ..BankConfig::from_layer(&env)
    };

    let bank = Arc::new(StructuredMemoryBank::new(config));
    bank.bootstrap().await.expect("bootstrap against test backend");
    Some((bank, dir))
}

/// A fresh work branch off the default branch, unique per call so suites can
/// run concurrently against one server.
pub async fn work_branch(bank: &StructuredMemoryBank, prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .subsec_nanos();
    let counter = BRANCH_COUNTER.fetch_add(1, Ordering::Relaxed);
    let name = format!("{prefix}-{}-{nanos:x}-{counter}", std::process::id());

    bank.create_branch(CreateBranchRequest {
        name: name.clone(),
        from: Some(bank.config().default_branch.clone()),
    })
    .await
    .expect("create work branch");

    name
}

/// A valid `CreateMemoryBlock` request for the built-in `task` schema.
pub fn task_request(branch: &str, text: &str) -> CreateBlockRequest {
    serde_json::from_value(serde_json::json!({
        "type": "task",
        "branch": branch,
        "text": text,
        "metadata": { "title": text, "acceptance_criteria": ["done"] },
        "actor": "tester",
    }))
    .expect("request shape")
}
