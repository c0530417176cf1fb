//! dingokv - the coordinator's versioned key-value store with leases and
//! one-shot watches.
//!
//! The metadata plane external clients and internal components use as a
//! coordination primitive: configuration, naming, membership, distributed
//! locks. Every mutation is assigned a monotonically increasing
//! `(main, sub)` revision and retained until compaction; key lifetimes may
//! be bound to TTL leases; one-shot watches fire with prev/current events
//! as mutations apply.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       Client Surface                            │
//! │   KvRange │ KvPut │ KvDeleteRange │ KvCompact │ Lease* │ Watch  │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        KvController                             │
//! │        validation │ revision reservation │ local reads          │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │ propose / on-commit
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Apply Engine                             │
//! │   Put │ Delete │ Compact │ LeaseGrant │ LeaseRevoke │ LeaseRenew│
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │      Two-Map Store │ Lease Registry │ Watch Bus │ Id Epoch      │
//! │            mirrored to the meta-writer per apply step           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::error`] - Error types
//! - [`core::time`] - Deterministic tick model
//! - [`core::logging`] - Tracing setup
//!
//! ## KV Engine
//! - [`kv::revision`] - Revision model, wire codec, epoch counters
//! - [`kv::index`] - KeyIndex generations and KvRev records
//! - [`kv::store`] - The two-map store
//! - [`kv::lease`] - Lease registry and expiry ticker
//! - [`kv::watch`] - One-shot watch bus
//! - [`kv::apply`] - Deterministic apply engine
//! - [`kv::controller`] - Client surface
//! - [`kv::compaction`] - Periodic revision pruning
//!
//! ## Infrastructure
//! - [`log`] - Replicated command log contract + local implementation
//! - [`storage::meta_writer`] - Meta-writer capability set + backends
//!
//! # Key Invariants
//!
//! - **REV-MONOTONE**: for commands A before B in apply order,
//!   revision(A) < revision(B); a watch fired by B observes post-A state.
//! - **GEN-LIFECYCLE**: two puts share a generation iff no delete landed
//!   between them; a delete closes the generation and the next put starts a
//!   fresh one.
//! - **APPLY-DETERMINISM**: replicas never reorder; all state derives from
//!   committed log entries; the apply engine never samples a clock.
//! - **ATOMIC-BATCH**: exactly one meta-writer batch per apply step;
//!   partial apply is impossible.
//! - **LATEST-SURVIVES**: compaction never destroys the newest revision of
//!   the most recent generation.

// Core infrastructure
pub mod core;

// KV engine
pub mod kv;

// Replicated command log contract
pub mod log;

// Storage layer
pub mod storage;

// Re-exports for convenience
pub use self::core::{config, error, logging, time};
pub use kv::{apply, compaction, controller, index, lease, revision, store, watch};
