//! Replicated command log contract.
//!
//! The engine hands each mutation batch to the replication layer as an
//! opaque [`MetaIncrement`] and blocks until the layer reports commit; on
//! every replica the committed batch drives the apply engine in log order.
//! The consensus transport itself is external to this crate;
//! [`LocalCommandLog`] is the in-process single-replica implementation used
//! by a standalone coordinator and by tests.

use crate::core::error::KvResult;
use crate::kv::apply::{ApplyEngine, CommandEffect, MetaIncrement};
use parking_lot::Mutex;

/// Blocking propose interface over the replicated log.
pub trait CommandLog: Send + Sync {
    /// Propose a batch and wait for commit.
    ///
    /// The outer error covers the replication layer (`unavailable`); the
    /// inner results are the per-command apply outcomes reported back from
    /// the state machine.
    fn propose(&self, increment: MetaIncrement) -> KvResult<Vec<KvResult<CommandEffect>>>;
}

/// Single-replica command log: commit is immediate and apply is driven
/// inline under a mutex, preserving the one-apply-thread ordering contract.
pub struct LocalCommandLog {
    engine: ApplyEngine,
    inner: Mutex<LocalLogInner>,
}

struct LocalLogInner {
    /// Committed batches in log order, retained for inspection.
    committed: Vec<MetaIncrement>,
}

impl LocalCommandLog {
    /// Wrap an apply engine.
    pub fn new(engine: ApplyEngine) -> Self {
        Self {
            engine,
            inner: Mutex::new(LocalLogInner {
                committed: Vec::new(),
            }),
        }
    }

    /// Number of committed batches.
    pub fn committed_count(&self) -> usize {
        self.inner.lock().committed.len()
    }

    /// The apply engine backing this log.
    pub fn engine(&self) -> &ApplyEngine {
        &self.engine
    }
}

impl CommandLog for LocalCommandLog {
    fn propose(&self, increment: MetaIncrement) -> KvResult<Vec<KvResult<CommandEffect>>> {
        // Holding the lock across apply serializes commits exactly the way
        // the consensus log serializes them across replicas.
        let mut inner = self.inner.lock();
        let outcomes = self.engine.apply(&increment);
        inner.committed.push(increment);
        Ok(outcomes)
    }
}
