//! The two-map store: Key→Index and Revision→Value, with mirrored
//! persistence through the meta-writer.
//!
//! The maps are in-memory; every mutation is also appended as (cf, key,
//! value) tuples into the apply step's [`MetaBatch`]. Reads take a shared
//! lock per map; mutation happens only on the apply path. On restart both
//! maps are rebuilt by scanning the persisted column families.

use crate::core::error::{KvError, KvResult};
use crate::kv::index::{KeyIndex, KvRev};
use crate::kv::revision::Revision;
use crate::storage::meta_writer::{MetaBatch, MetaWriter, CF_KV_INDEX, CF_KV_REV, CF_META_EPOCH};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Epoch-table key for the compaction floor.
pub const EPOCH_COMPACTION_FLOOR: &[u8] = b"compaction_floor";

/// A resolved half-open key range `[start, end)`.
///
/// `range_end` of a single `0x00` byte means "infinity" (all keys ≥ start);
/// an empty `range_end` means a point lookup of `start` only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    /// Inclusive lower bound.
    pub start: Vec<u8>,
    /// Resolved upper bound.
    pub end: KeyRangeEnd,
}

/// Upper bound of a [`KeyRange`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRangeEnd {
    /// Point lookup of the start key only.
    Point,
    /// All keys at or above the start key.
    Unbounded,
    /// Literal exclusive upper bound.
    Key(Vec<u8>),
}

impl KeyRange {
    /// Resolve the wire form of (key, range_end).
    pub fn resolve(key: &[u8], range_end: &[u8]) -> Self {
        let end = if range_end.is_empty() {
            KeyRangeEnd::Point
        } else if range_end == [0u8] {
            KeyRangeEnd::Unbounded
        } else {
            KeyRangeEnd::Key(range_end.to_vec())
        };
        Self {
            start: key.to_vec(),
            end,
        }
    }

    /// Whether `key` falls inside the range.
    pub fn contains(&self, key: &[u8]) -> bool {
        match &self.end {
            KeyRangeEnd::Point => key == self.start.as_slice(),
            KeyRangeEnd::Unbounded => key >= self.start.as_slice(),
            KeyRangeEnd::Key(end) => key >= self.start.as_slice() && key < end.as_slice(),
        }
    }
}

/// The durable data model: KeyIndexMap and RevMap.
pub struct KvStore {
    kv_index_map: RwLock<BTreeMap<Vec<u8>, KeyIndex>>,
    kv_rev_map: RwLock<BTreeMap<Vec<u8>, KvRev>>,
    compaction_floor: AtomicI64,
}

impl KvStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            kv_index_map: RwLock::new(BTreeMap::new()),
            kv_rev_map: RwLock::new(BTreeMap::new()),
            compaction_floor: AtomicI64::new(0),
        }
    }

    /// Rebuild the store from the persisted column families.
    pub fn restore(meta: &Arc<dyn MetaWriter>) -> Result<Self> {
        let mut kv_index_map = BTreeMap::new();
        for (key, raw) in meta.scan(CF_KV_INDEX)? {
            let index: KeyIndex =
                bincode::deserialize(&raw).context("failed to decode persisted KeyIndex")?;
            kv_index_map.insert(key, index);
        }

        let mut kv_rev_map = BTreeMap::new();
        for (key, raw) in meta.scan(CF_KV_REV)? {
            let rev: KvRev =
                bincode::deserialize(&raw).context("failed to decode persisted KvRev")?;
            kv_rev_map.insert(key, rev);
        }

        let compaction_floor = match meta.get(CF_META_EPOCH, EPOCH_COMPACTION_FLOOR)? {
            Some(raw) => {
                let bytes: [u8; 8] = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("compaction floor is not 8 bytes"))?;
                i64::from_be_bytes(bytes)
            }
            None => 0,
        };

        tracing::info!(
            indexes = kv_index_map.len(),
            revisions = kv_rev_map.len(),
            compaction_floor,
            "restored kv store from meta writer"
        );

        Ok(Self {
            kv_index_map: RwLock::new(kv_index_map),
            kv_rev_map: RwLock::new(kv_rev_map),
            compaction_floor: AtomicI64::new(compaction_floor),
        })
    }

    /// Point lookup of a KeyIndex.
    pub fn index(&self, key: &[u8]) -> Option<KeyIndex> {
        self.kv_index_map.read().get(key).cloned()
    }

    /// Insert or replace a KeyIndex, mirroring it into the batch.
    pub fn put_index(&self, index: KeyIndex, batch: &mut MetaBatch) -> KvResult<()> {
        let raw = bincode::serialize(&index)
            .map_err(|err| KvError::internal(format!("failed to serialize KeyIndex: {err}")))?;
        batch.put(CF_KV_INDEX, index.id.clone(), raw);
        self.kv_index_map.write().insert(index.id.clone(), index);
        Ok(())
    }

    /// Remove a KeyIndex, mirroring the delete into the batch.
    pub fn erase_index(&self, key: &[u8], batch: &mut MetaBatch) {
        batch.delete(CF_KV_INDEX, key.to_vec());
        self.kv_index_map.write().remove(key);
    }

    /// KeyIndexes inside `range` that satisfy `pred`, in ascending
    /// lexicographic key order.
    pub fn range_indexes<F>(&self, range: &KeyRange, pred: F) -> Vec<KeyIndex>
    where
        F: Fn(&KeyIndex) -> bool,
    {
        let map = self.kv_index_map.read();
        match &range.end {
            KeyRangeEnd::Point => map
                .get(&range.start)
                .filter(|index| pred(index))
                .cloned()
                .into_iter()
                .collect(),
            KeyRangeEnd::Unbounded => map
                .range(range.start.clone()..)
                .filter(|(_, index)| pred(index))
                .map(|(_, index)| index.clone())
                .collect(),
            KeyRangeEnd::Key(end) => {
                if *end <= range.start {
                    return Vec::new();
                }
                map.range(range.start.clone()..end.clone())
                    .filter(|(_, index)| pred(index))
                    .map(|(_, index)| index.clone())
                    .collect()
            }
        }
    }

    /// Every key with a KeyIndex, in ascending order.
    pub fn all_index_keys(&self) -> Vec<Vec<u8>> {
        self.kv_index_map.read().keys().cloned().collect()
    }

    /// Number of KeyIndex entries, tombstoned keys included.
    pub fn index_count(&self) -> usize {
        self.kv_index_map.read().len()
    }

    /// Point lookup of a KvRev by revision.
    pub fn rev(&self, revision: Revision) -> Option<KvRev> {
        self.kv_rev_map.read().get(revision.encode().as_slice()).cloned()
    }

    /// Insert a KvRev keyed by its mod revision, mirroring into the batch.
    pub fn put_rev(&self, rev: KvRev, batch: &mut MetaBatch) -> KvResult<()> {
        let encoded = rev.mod_revision.encode().to_vec();
        let raw = bincode::serialize(&rev)
            .map_err(|err| KvError::internal(format!("failed to serialize KvRev: {err}")))?;
        batch.put(CF_KV_REV, encoded.clone(), raw);
        self.kv_rev_map.write().insert(encoded, rev);
        Ok(())
    }

    /// Remove a KvRev, mirroring the delete into the batch.
    pub fn erase_rev(&self, revision: Revision, batch: &mut MetaBatch) {
        let encoded = revision.encode().to_vec();
        batch.delete(CF_KV_REV, encoded.clone());
        self.kv_rev_map.write().remove(&encoded);
    }

    /// Number of KvRev entries.
    pub fn rev_count(&self) -> usize {
        self.kv_rev_map.read().len()
    }

    /// Main revision below which history has been pruned.
    pub fn compaction_floor(&self) -> i64 {
        self.compaction_floor.load(Ordering::SeqCst)
    }

    /// Raise the compaction floor, mirroring it into the batch.
    ///
    /// The floor never moves backwards.
    pub fn raise_compaction_floor(&self, floor: i64, batch: &mut MetaBatch) {
        self.compaction_floor.fetch_max(floor, Ordering::SeqCst);
        let current = self.compaction_floor.load(Ordering::SeqCst);
        batch.put(
            CF_META_EPOCH,
            EPOCH_COMPACTION_FLOOR.to_vec(),
            current.to_be_bytes().to_vec(),
        );
    }
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}
