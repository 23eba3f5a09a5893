//! Shared setup for the integration tests

#![allow(dead_code)]

use std::path::PathBuf;

use shadestore::{Options, ShadeStore};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Install a test subscriber once; `RUST_LOG=shadestore=debug` shows engine logs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn db_path(dir: &TempDir) -> PathBuf {
    dir.path().join("test.shade")
}

/// Fresh database with 4 KB pages in a temp directory.
pub fn open_db() -> (TempDir, ShadeStore) {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let db = Options::new().page_size(4096).open(db_path(&dir)).unwrap();
    (dir, db)
}

pub fn reopen(dir: &TempDir) -> ShadeStore {
    ShadeStore::open(db_path(dir)).unwrap()
}

/// Every key-value pair in ascending order, through a cursor.
pub fn scan(db: &ShadeStore) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut cursor = db.first_cursor().unwrap();
    let mut pairs = Vec::new();
    while let Some(pair) = cursor.key_value().unwrap() {
        pairs.push(pair);
        cursor.next().unwrap();
    }
    pairs
}
