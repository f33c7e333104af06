//! Logging initialization for the service.
//!
//! The subscriber is driven by [`LogConfig`]: a default tracing filter
//! (overridden by `RUST_LOG` when set), stderr output, and an optional JSON
//! log file. [`init_logging`] runs during bank bootstrap; an embedding
//! application that already installed its own subscriber keeps it.

use std::io::IsTerminal;
use std::sync::{Mutex, Once};

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LogConfig;
use crate::error::{MemoryBankError, Result};

/// Install the global tracing subscriber from config.
///
/// Idempotent: when a subscriber is already installed, it is left in place
/// and this call is a no-op.
///
/// # Errors
///
/// Returns `Validation` when the configured filter does not parse or the
/// JSON log file cannot be created.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter).map_err(|e| MemoryBankError::Validation {
            entity: "log filter".to_string(),
            reason: format!("'{}': {e}", config.filter),
        })?,
    };

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_ansi(std::io::stderr().is_terminal());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    // The first installed subscriber wins; the bank never replaces one an
    // embedding application (or the test harness) set up.
    let _ = match &config.file {
        Some(path) => {
            let file = std::fs::File::create(path).map_err(|e| MemoryBankError::Validation {
                entity: format!("log file {}", path.display()),
                reason: e.to_string(),
            })?;
            let file_layer = fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .json();
            tracing::subscriber::set_global_default(subscriber.with(file_layer))
        }
        None => tracing::subscriber::set_global_default(subscriber),
    };

    Ok(())
}

/// Initialize logging for tests with the test writer.
pub fn init_test_logging() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("membank_rust=debug,test=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_parses() {
        assert!(EnvFilter::try_new(&LogConfig::default().filter).is_ok());
    }

    #[test]
    fn init_is_idempotent() {
        let config = LogConfig::default();
        init_logging(&config).unwrap();
        init_logging(&config).unwrap();
    }

    #[test]
    fn log_file_in_a_fresh_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            file: Some(dir.path().join("membank.json")),
            ..LogConfig::default()
        };

        init_logging(&config).unwrap();
        assert!(config.file.as_ref().unwrap().exists());
    }
}
