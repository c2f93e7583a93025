//! Shared scaffolding for the cross-module scenario tests. Mirrors the
//! teacher's `tests/test_utils`: a one-time `env_logger` init plus small
//! constructors so each scenario test isn't rebuilding the same pool/log
//! pair from scratch.

use std::sync::Once;

use storage_kernel::file::{FileSystem, InMemoryFileSystem};
use storage_kernel::{BufferManager, LogManager};

static LOG_INIT: Once = Once::new();

pub fn init_log() {
    LOG_INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// A fresh buffer pool (`page_count` frames of `page_size` bytes) backed by
/// an in-memory file system, plus a log manager sharing that same file
/// system's "log" file -- the shape every scenario test below starts from.
pub fn fresh_kernel(page_size: usize, page_count: usize) -> (BufferManager, LogManager) {
    init_log();
    let fs = InMemoryFileSystem::new();
    let log_file = fs.open_file("log").expect("open log file");
    let bm = BufferManager::new(page_size, page_count, Box::new(fs));
    (bm, LogManager::new(log_file))
}
