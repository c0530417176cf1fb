//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.
#![allow(dead_code)]

use dingokv::config::Config;
use dingokv::controller::{KvController, PutRequest, RangeRequest};
use dingokv::index::Kv;
use dingokv::storage::meta_writer::{MemoryMetaWriter, MetaWriter};
use std::sync::Arc;

/// Fresh controller over an in-memory meta writer with default config.
pub fn fresh_controller() -> KvController {
    controller_with_config(Config::default())
}

/// Fresh controller over an in-memory meta writer with custom config.
pub fn controller_with_config(config: Config) -> KvController {
    let meta: Arc<dyn MetaWriter> = Arc::new(MemoryMetaWriter::new());
    KvController::open(config, meta).expect("failed to open controller")
}

/// Put a plain key-value pair, returning the assigned main revision.
pub fn put(controller: &KvController, key: &[u8], value: &[u8]) -> i64 {
    controller
        .kv_put(&PutRequest {
            key: key.to_vec(),
            value: value.to_vec(),
            ..Default::default()
        })
        .expect("put failed")
        .revision
}

/// Put a key-value pair bound to a lease.
pub fn put_with_lease(controller: &KvController, key: &[u8], value: &[u8], lease_id: i64) -> i64 {
    controller
        .kv_put(&PutRequest {
            key: key.to_vec(),
            value: value.to_vec(),
            lease_id,
            ..Default::default()
        })
        .expect("put with lease failed")
        .revision
}

/// Latest live value of a single key.
pub fn range_one(controller: &KvController, key: &[u8]) -> Option<Kv> {
    controller
        .kv_range(&RangeRequest {
            key: key.to_vec(),
            ..Default::default()
        })
        .expect("range failed")
        .kvs
        .into_iter()
        .next()
}
