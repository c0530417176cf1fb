//! Revision model: (main, sub) pairs, the persisted wire codec, and the
//! epoch counters that allocate them.
//!
//! `main` is a global monotonic counter incremented once per logical
//! transaction; `sub` is a per-transaction tiebreaker incremented per
//! mutation. The serialized form is a fixed 17-byte key
//! `[main:8 BE][b'_'][sub:8 BE]` whose lexicographic order matches numeric
//! order on (main, sub). The encoding is persisted as the RevMap sort key
//! and must be preserved across implementations.

use crate::core::error::{KvError, KvResult};
use crate::storage::meta_writer::{MetaBatch, MetaWriter, CF_META_EPOCH};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Serialized revision length in bytes.
pub const REVISION_ENCODED_LEN: usize = 17;

/// Separator byte between the main and sub halves of an encoded revision.
const REVISION_SEPARATOR: u8 = b'_';

/// Epoch-table key for the revision counter.
pub const EPOCH_NEXT_REVISION: &[u8] = b"next_revision";

/// Epoch-table key for the lease-id counter.
pub const EPOCH_NEXT_LEASE_ID: &[u8] = b"next_lease_id";

/// A mutation revision.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Revision {
    /// Global transaction counter.
    pub main: i64,

    /// Per-transaction mutation tiebreaker.
    pub sub: i64,
}

impl Revision {
    /// Create a new revision.
    pub const fn new(main: i64, sub: i64) -> Self {
        Self { main, sub }
    }

    /// The zero revision (never allocated).
    pub const fn zero() -> Self {
        Self { main: 0, sub: 0 }
    }

    /// Encode to the fixed 17-byte persisted form.
    pub fn encode(&self) -> [u8; REVISION_ENCODED_LEN] {
        let mut buf = [0u8; REVISION_ENCODED_LEN];
        let mut cursor = &mut buf[..];
        cursor.put_i64(self.main);
        cursor.put_u8(REVISION_SEPARATOR);
        cursor.put_i64(self.sub);
        buf
    }

    /// Decode from the 17-byte persisted form.
    pub fn decode(input: &[u8]) -> KvResult<Self> {
        if input.len() != REVISION_ENCODED_LEN {
            return Err(KvError::bad_argument(format!(
                "encoded revision must be {} bytes, got {}",
                REVISION_ENCODED_LEN,
                input.len()
            )));
        }
        let mut cursor = input;
        let main = cursor.get_i64();
        let sep = cursor.get_u8();
        if sep != REVISION_SEPARATOR {
            return Err(KvError::bad_argument("malformed revision separator"));
        }
        let sub = cursor.get_i64();
        Ok(Self { main, sub })
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.main, self.sub)
    }
}

/// The meta epoch table: persisted id counters.
///
/// `next_revision` backs the revision clock; `next_lease_id` backs lease-id
/// auto-assignment. The proposing leader reserves ids in memory
/// ([`IdEpoch::begin_txn`], [`IdEpoch::reserve_lease_id`]); the persisted
/// counters advance only inside the apply engine so every replica converges
/// on identical assignments and a restarted replica resumes past everything
/// it has applied.
pub struct IdEpoch {
    next_revision: AtomicI64,
    next_lease_id: AtomicI64,
}

impl IdEpoch {
    /// Fresh epoch with both counters at 1.
    pub fn new() -> Self {
        Self {
            next_revision: AtomicI64::new(1),
            next_lease_id: AtomicI64::new(1),
        }
    }

    /// Rebuild counters from the persisted epoch table.
    pub fn restore(meta: &Arc<dyn MetaWriter>) -> anyhow::Result<Self> {
        let next_revision = read_counter(meta, EPOCH_NEXT_REVISION)?.unwrap_or(1);
        let next_lease_id = read_counter(meta, EPOCH_NEXT_LEASE_ID)?.unwrap_or(1);
        Ok(Self {
            next_revision: AtomicI64::new(next_revision),
            next_lease_id: AtomicI64::new(next_lease_id),
        })
    }

    /// Reserve the main revision for one logical transaction.
    ///
    /// Fails with `RevisionExhausted` if the counter would leave the 63-bit
    /// range; never expected in practice.
    pub fn begin_txn(&self) -> KvResult<i64> {
        self.next_revision
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < i64::MAX).then(|| current + 1)
            })
            .map_err(|_| KvError::RevisionExhausted)
    }

    /// Reserve a lease id for auto-assignment.
    pub fn reserve_lease_id(&self) -> KvResult<i64> {
        self.next_lease_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < i64::MAX).then(|| current + 1)
            })
            .map_err(|_| KvError::RevisionExhausted)
    }

    /// The next main revision to be allocated.
    pub fn next_revision(&self) -> i64 {
        self.next_revision.load(Ordering::SeqCst)
    }

    /// Advance the persisted revision counter past an applied command.
    ///
    /// Apply engine only. Idempotent: the counter never moves backwards.
    pub fn observe_applied_revision(&self, main: i64, batch: &mut MetaBatch) {
        advance(&self.next_revision, main);
        write_counter(batch, EPOCH_NEXT_REVISION, self.next_revision.load(Ordering::SeqCst));
    }

    /// Advance the persisted lease-id counter past an applied grant.
    pub fn observe_applied_lease_id(&self, id: i64, batch: &mut MetaBatch) {
        advance(&self.next_lease_id, id);
        write_counter(batch, EPOCH_NEXT_LEASE_ID, self.next_lease_id.load(Ordering::SeqCst));
    }
}

impl Default for IdEpoch {
    fn default() -> Self {
        Self::new()
    }
}

fn advance(counter: &AtomicI64, observed: i64) {
    let target = observed.saturating_add(1);
    counter.fetch_max(target, Ordering::SeqCst);
}

fn read_counter(meta: &Arc<dyn MetaWriter>, key: &[u8]) -> anyhow::Result<Option<i64>> {
    match meta.get(CF_META_EPOCH, key)? {
        Some(raw) => {
            let bytes: [u8; 8] = raw
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("epoch counter {:?} is not 8 bytes", key))?;
            Ok(Some(i64::from_be_bytes(bytes)))
        }
        None => Ok(None),
    }
}

fn write_counter(batch: &mut MetaBatch, key: &[u8], value: i64) {
    batch.put(CF_META_EPOCH, key.to_vec(), value.to_be_bytes().to_vec());
}
