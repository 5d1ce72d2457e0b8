#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Once;

use folddb::{Config, FoldDb, ModelRegistry};

static INIT_LOGGING: Once = Once::new();

/// Opt-in log output for test debugging (`RUST_LOG=folddb=debug`).
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A config that keeps expected event failures out of the test output.
pub fn quiet_config() -> Config {
    Config {
        quiet_errors: true,
        ..Config::default()
    }
}

pub fn temp_db_path(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

/// Opens a FoldDb on a fresh temp file. The TempDir must stay alive for the
/// duration of the test.
pub async fn open_db(name: &str, registry: ModelRegistry) -> (tempfile::TempDir, FoldDb) {
    init_logging();
    let (dir, path) = temp_db_path(name);
    let db = FoldDb::open_with(&path, registry, quiet_config())
        .await
        .expect("open database");
    (dir, db)
}
