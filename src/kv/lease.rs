//! Lease management: TTL-bound association between a lease id and a set of
//! keys.
//!
//! The registry is replicated state: it is mutated only inside apply (grant,
//! revoke, renew commands; key attach on put, detach on delete) and every
//! mutation is mirrored to the `kv_lease` column family. The background
//! ticker never writes directly; it proposes revoke commands for leases
//! whose deadline has passed, and the revoke apply deletes every bound key
//! at a fresh revision in the same step.

use crate::core::error::{KvError, KvResult};
use crate::core::time::Tick;
use crate::storage::meta_writer::{MetaBatch, MetaWriter, CF_KV_LEASE};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// A lease record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Unique lease id; 0 is the "no lease" sentinel and never granted.
    pub id: i64,

    /// TTL in seconds as granted.
    pub granted_ttl_secs: i64,

    /// Tick when the lease was granted.
    pub granted_at: Tick,

    /// Tick past which the lease expires unless renewed.
    pub deadline: Tick,

    /// Keys bound to this lease, kept sorted for deterministic expiry.
    pub keys: BTreeSet<Vec<u8>>,
}

impl LeaseRecord {
    /// Create a new lease.
    pub fn new(id: i64, granted_ttl_secs: i64, granted_at: Tick) -> Self {
        Self {
            id,
            granted_ttl_secs,
            granted_at,
            deadline: granted_at.add_secs(granted_ttl_secs.max(0) as u64),
            keys: BTreeSet::new(),
        }
    }

    /// Whether the deadline has passed at `now`.
    pub fn is_expired_at(&self, now: Tick) -> bool {
        now.is_at_or_after(self.deadline)
    }

    /// Whole seconds until the deadline; 0 once passed.
    pub fn remaining_ttl_secs_at(&self, now: Tick) -> i64 {
        (now.ms_until(self.deadline) / 1000) as i64
    }

    /// Advance the deadline from `now` (heartbeat).
    pub fn renew(&mut self, now: Tick) {
        self.deadline = now.add_secs(self.granted_ttl_secs.max(0) as u64);
    }
}

/// The lease registry.
pub struct LeaseRegistry {
    leases: RwLock<HashMap<i64, LeaseRecord>>,
}

impl LeaseRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            leases: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild the registry from the persisted lease column family.
    pub fn restore(meta: &Arc<dyn MetaWriter>) -> Result<Self> {
        let mut leases = HashMap::new();
        for (_, raw) in meta.scan(CF_KV_LEASE)? {
            let record: LeaseRecord =
                bincode::deserialize(&raw).context("failed to decode persisted lease")?;
            leases.insert(record.id, record);
        }
        tracing::info!(leases = leases.len(), "restored lease registry");
        Ok(Self {
            leases: RwLock::new(leases),
        })
    }

    /// Whether a lease exists.
    pub fn exists(&self, id: i64) -> bool {
        self.leases.read().contains_key(&id)
    }

    /// Clone out a lease record.
    pub fn get(&self, id: i64) -> Option<LeaseRecord> {
        self.leases.read().get(&id).cloned()
    }

    /// Number of active leases.
    pub fn lease_count(&self) -> usize {
        self.leases.read().len()
    }

    /// Insert a granted lease. Apply path only.
    pub fn grant(&self, record: LeaseRecord, batch: &mut MetaBatch) -> KvResult<()> {
        persist(&record, batch)?;
        self.leases.write().insert(record.id, record);
        Ok(())
    }

    /// Remove a lease. Apply path only.
    pub fn revoke(&self, id: i64, batch: &mut MetaBatch) -> Option<LeaseRecord> {
        let removed = self.leases.write().remove(&id);
        if removed.is_some() {
            batch.delete(CF_KV_LEASE, id.to_be_bytes().to_vec());
        }
        removed
    }

    /// Advance a lease deadline. Apply path only.
    ///
    /// Returns the remaining TTL after renewal.
    pub fn renew(&self, id: i64, now: Tick, batch: &mut MetaBatch) -> KvResult<i64> {
        let mut leases = self.leases.write();
        let record = leases
            .get_mut(&id)
            .ok_or(KvError::LeaseNotFound { lease_id: id })?;
        record.renew(now);
        let remaining = record.remaining_ttl_secs_at(now);
        persist(record, batch)?;
        Ok(remaining)
    }

    /// Bind keys to a lease. Apply path only.
    pub fn add_keys(
        &self,
        id: i64,
        keys: impl IntoIterator<Item = Vec<u8>>,
        batch: &mut MetaBatch,
    ) -> KvResult<()> {
        let mut leases = self.leases.write();
        let record = leases
            .get_mut(&id)
            .ok_or(KvError::LeaseNotFound { lease_id: id })?;
        record.keys.extend(keys);
        persist(record, batch)
    }

    /// Unbind keys from a lease. Apply path only.
    ///
    /// Unknown leases are ignored: the lease may already have been revoked.
    pub fn remove_keys<'a>(
        &self,
        id: i64,
        keys: impl IntoIterator<Item = &'a [u8]>,
        batch: &mut MetaBatch,
    ) -> KvResult<()> {
        let mut leases = self.leases.write();
        let Some(record) = leases.get_mut(&id) else {
            return Ok(());
        };
        for key in keys {
            record.keys.remove(key);
        }
        persist(record, batch)
    }

    /// Ids of leases whose deadline has passed at `now`.
    pub fn collect_expired(&self, now: Tick) -> Vec<i64> {
        self.leases
            .read()
            .iter()
            .filter(|(_, record)| record.is_expired_at(now))
            .map(|(id, _)| *id)
            .collect()
    }
}

impl Default for LeaseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn persist(record: &LeaseRecord, batch: &mut MetaBatch) -> KvResult<()> {
    let raw = bincode::serialize(record)
        .map_err(|err| KvError::internal(format!("failed to serialize lease: {err}")))?;
    batch.put(CF_KV_LEASE, record.id.to_be_bytes().to_vec(), raw);
    Ok(())
}

/// Background expiry scan.
///
/// Each tick samples the wall clock, collects leases whose deadline has
/// passed and proposes a revoke per lease; the revoke apply deletes all
/// bound keys at a fresh revision and removes the lease in the same step.
pub async fn run_lease_ticker(
    controller: Arc<crate::kv::controller::KvController>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let period = std::time::Duration::from_millis(controller.config().lease.tick_interval_ms);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::info!(period_ms = period.as_millis() as u64, "lease ticker started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Tick::from_wall_clock();
                for id in controller.leases().collect_expired(now) {
                    match controller.lease_revoke(id) {
                        Ok(()) => {
                            tracing::info!(lease_id = id, "expired lease revoked");
                        }
                        // Lost a race with an explicit revoke; nothing to do.
                        Err(KvError::LeaseNotFound { .. }) => {}
                        Err(err) => {
                            tracing::warn!(lease_id = id, error = %err, "failed to revoke expired lease");
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("lease ticker stopping");
                    break;
                }
            }
        }
    }
}
