//! Deterministic state-machine step.
//!
//! The replication layer hands committed [`MetaIncrement`] batches to the
//! apply engine; every replica processes them in log order and reaches the
//! same state. Each command carries its pre-reserved revision. A command
//! that fails validation at apply time is a no-op on all replicas (the
//! reserved revision is simply skipped) and the error travels back through
//! the per-command outcome. Exactly one meta-writer batch is written per
//! apply step.

use crate::core::error::{KvError, KvResult};
use crate::core::time::Tick;
use crate::kv::index::{KeyIndex, Kv, KvRev};
use crate::kv::lease::{LeaseRecord, LeaseRegistry};
use crate::kv::revision::{IdEpoch, Revision};
use crate::kv::store::KvStore;
use crate::kv::watch::{EventType, KvEvent, WatchBus};
use crate::storage::meta_writer::{MetaBatch, MetaWriter};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A replicated batch of state-machine commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaIncrement {
    /// Commands in application order.
    pub ops: Vec<KvCommand>,
}

impl MetaIncrement {
    /// A batch holding a single command.
    pub fn single(op: KvCommand) -> Self {
        Self { ops: vec![op] }
    }
}

/// State-machine command kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvCommand {
    /// Write a key.
    Put(PutCommand),
    /// Delete a key.
    Delete(DeleteCommand),
    /// Prune one key's history.
    Compact(CompactCommand),
    /// Create a lease.
    LeaseGrant(LeaseGrantCommand),
    /// Remove a lease and delete its bound keys.
    LeaseRevoke(LeaseRevokeCommand),
    /// Advance a lease deadline.
    LeaseRenew(LeaseRenewCommand),
}

/// Payload of a put command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutCommand {
    pub key: Vec<u8>,
    /// Empty when `ignore_value` is set.
    pub value: Vec<u8>,
    pub lease_id: i64,
    pub ignore_value: bool,
    pub ignore_lease: bool,
    pub revision: Revision,
}

/// Payload of a delete command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteCommand {
    pub key: Vec<u8>,
    pub revision: Revision,
}

/// Payload of a per-key compaction command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactCommand {
    pub key: Vec<u8>,
    pub at: Revision,
}

/// Payload of a lease grant command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseGrantCommand {
    pub id: i64,
    pub ttl_secs: i64,
    /// Wall tick sampled on the propose path; replicas never read a clock.
    pub granted_at: Tick,
}

/// Payload of a lease revoke command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRevokeCommand {
    pub id: i64,
    /// Fresh revision under which bound keys are deleted.
    pub revision: Revision,
}

/// Payload of a lease renew command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRenewCommand {
    pub id: i64,
    /// Wall tick sampled on the propose path.
    pub renewed_at: Tick,
}

/// Per-command apply outcome reported back to the proposing leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEffect {
    /// A put landed at this revision.
    Put { revision: Revision },
    /// A delete landed; `existed` is false for an absent key.
    Delete { revision: Revision, existed: bool },
    /// One key's history was pruned.
    Compacted { purged: usize },
    /// A lease was created.
    LeaseGranted { id: i64 },
    /// A lease was removed along with its bound keys.
    LeaseRevoked { deleted_keys: usize },
    /// A lease deadline advanced.
    LeaseRenewed { remaining_ttl_secs: i64 },
}

/// The apply engine: one per replica, driven in log order.
pub struct ApplyEngine {
    store: Arc<KvStore>,
    leases: Arc<LeaseRegistry>,
    watches: Arc<WatchBus>,
    epoch: Arc<IdEpoch>,
    meta: Arc<dyn MetaWriter>,
    last_applied_main: AtomicI64,
}

impl ApplyEngine {
    /// Wire an engine over shared state handles.
    pub fn new(
        store: Arc<KvStore>,
        leases: Arc<LeaseRegistry>,
        watches: Arc<WatchBus>,
        epoch: Arc<IdEpoch>,
        meta: Arc<dyn MetaWriter>,
    ) -> Self {
        Self {
            store,
            leases,
            watches,
            epoch,
            meta,
            last_applied_main: AtomicI64::new(0),
        }
    }

    /// Apply one committed batch.
    ///
    /// Must be driven by a single thread per replica, in log order. Returns
    /// one outcome per command; a persistence failure poisons the whole
    /// step with `internal`.
    pub fn apply(&self, increment: &MetaIncrement) -> Vec<KvResult<CommandEffect>> {
        let mut batch = MetaBatch::default();
        let mut outcomes = Vec::with_capacity(increment.ops.len());
        for op in &increment.ops {
            outcomes.push(self.apply_one(op, &mut batch));
        }

        if !batch.is_empty() {
            if let Err(err) = self.meta.write(batch) {
                // Atomic-batch contract broken; the replica is unhealthy.
                tracing::error!(error = %err, "meta writer failed during apply");
                let poisoned = KvError::internal(format!("meta writer failed: {err}"));
                return increment
                    .ops
                    .iter()
                    .map(|_| Err(poisoned.clone()))
                    .collect();
            }
        }
        outcomes
    }

    fn apply_one(&self, op: &KvCommand, batch: &mut MetaBatch) -> KvResult<CommandEffect> {
        match op {
            KvCommand::Put(cmd) => self.apply_put(cmd, batch),
            KvCommand::Delete(cmd) => self.apply_delete(cmd, batch),
            KvCommand::Compact(cmd) => self.apply_compact(cmd, batch),
            KvCommand::LeaseGrant(cmd) => self.apply_lease_grant(cmd, batch),
            KvCommand::LeaseRevoke(cmd) => self.apply_lease_revoke(cmd, batch),
            KvCommand::LeaseRenew(cmd) => self.apply_lease_renew(cmd, batch),
        }
    }

    fn observe_revision(&self, revision: Revision, batch: &mut MetaBatch) {
        debug_assert!(
            revision.main >= self.last_applied_main.load(Ordering::SeqCst),
            "apply order violation: {} < {}",
            revision.main,
            self.last_applied_main.load(Ordering::SeqCst),
        );
        self.last_applied_main.fetch_max(revision.main, Ordering::SeqCst);
        self.epoch.observe_applied_revision(revision.main, batch);
    }

    fn apply_put(&self, cmd: &PutCommand, batch: &mut MetaBatch) -> KvResult<CommandEffect> {
        let revision = cmd.revision;
        let mut index = self
            .store
            .index(&cmd.key)
            .unwrap_or_else(|| KeyIndex::new(cmd.key.clone()));
        let prev_rev_record = self.store.rev(index.mod_revision);

        // Resolve value and lease against the previous KvRev before any
        // mutation, so a rejection leaves no trace.
        let value = if cmd.ignore_value {
            match &prev_rev_record {
                Some(prev) => prev.value.clone(),
                None => {
                    return Err(KvError::bad_argument(
                        "put with ignore_value on a key without a current value",
                    ))
                }
            }
        } else {
            cmd.value.clone()
        };
        let lease = if cmd.ignore_lease {
            match &prev_rev_record {
                Some(prev) => prev.lease,
                None => {
                    return Err(KvError::bad_argument(
                        "put with ignore_lease on a key without a current value",
                    ))
                }
            }
        } else {
            cmd.lease_id
        };

        // The only cross-component check allowed to fail a put at apply
        // time: the resolved lease must still exist.
        if lease > 0 && !self.leases.exists(lease) {
            tracing::warn!(lease_id = lease, key = ?cmd.key, "put rejected at apply: lease not found");
            return Err(KvError::LeaseNotFound { lease_id: lease });
        }

        let effect = index.apply_put(revision);
        if lease > 0 {
            self.leases.add_keys(lease, [cmd.key.clone()], batch)?;
        }

        let new_rev = KvRev {
            key: cmd.key.clone(),
            value,
            create_revision: effect.create_revision,
            mod_revision: revision,
            version: effect.version,
            lease,
            is_deleted: false,
        };

        self.store.put_index(index, batch)?;
        self.store.put_rev(new_rev.clone(), batch)?;
        self.observe_revision(revision, batch);

        let prev_kv = effect
            .prev_mod_revision
            .and_then(|_| prev_rev_record.as_ref())
            .map(|prev| Kv::from_rev(prev, false));
        self.watches.dispatch(&KvEvent {
            event_type: EventType::Put,
            kv: Kv::from_rev(&new_rev, false),
            prev_kv,
        });

        tracing::debug!(key = ?cmd.key, revision = %revision, "put applied");
        Ok(CommandEffect::Put { revision })
    }

    fn apply_delete(&self, cmd: &DeleteCommand, batch: &mut MetaBatch) -> KvResult<CommandEffect> {
        let existed = self.delete_key_at(&cmd.key, cmd.revision, batch)?;
        Ok(CommandEffect::Delete {
            revision: cmd.revision,
            existed,
        })
    }

    /// Shared delete path for delete commands and lease revocation.
    ///
    /// Returns false for an absent key; there is nothing to delete.
    fn delete_key_at(
        &self,
        key: &[u8],
        revision: Revision,
        batch: &mut MetaBatch,
    ) -> KvResult<bool> {
        let Some(mut index) = self.store.index(key) else {
            tracing::debug!(key = ?key, "delete of absent key ignored");
            return Ok(false);
        };
        let prev_rev_record = self.store.rev(index.mod_revision);

        let effect = index.apply_delete(revision);

        let new_rev = KvRev {
            key: key.to_vec(),
            value: Vec::new(),
            create_revision: effect.create_revision,
            mod_revision: revision,
            version: effect.version,
            lease: 0,
            is_deleted: true,
        };

        // Unbind from the lease the previous value carried.
        if let (Some(prev), Some(_)) = (&prev_rev_record, effect.prev_mod_revision) {
            if prev.lease > 0 {
                self.leases.remove_keys(prev.lease, [key], batch)?;
            }
        }

        self.store.put_index(index, batch)?;
        self.store.put_rev(new_rev.clone(), batch)?;
        self.observe_revision(revision, batch);

        let prev_kv = effect
            .prev_mod_revision
            .and_then(|_| prev_rev_record.as_ref())
            .map(|prev| Kv::from_rev(prev, false));
        self.watches.dispatch(&KvEvent {
            event_type: EventType::Delete,
            kv: Kv::from_rev(&new_rev, false),
            prev_kv,
        });

        tracing::debug!(key = ?key, revision = %revision, "delete applied");
        Ok(true)
    }

    fn apply_compact(&self, cmd: &CompactCommand, batch: &mut MetaBatch) -> KvResult<CommandEffect> {
        let Some(index) = self.store.index(&cmd.key) else {
            // The index may already have been erased by an earlier run at
            // the same revision; compaction stays idempotent.
            return Ok(CommandEffect::Compacted { purged: 0 });
        };

        let effect = index.compact(cmd.at);
        match effect.retained {
            Some(retained) => self.store.put_index(retained, batch)?,
            None => self.store.erase_index(&cmd.key, batch),
        }
        for revision in &effect.purged {
            self.store.erase_rev(*revision, batch);
        }
        self.store.raise_compaction_floor(cmd.at.main, batch);

        if !effect.purged.is_empty() {
            tracing::debug!(key = ?cmd.key, at = %cmd.at, purged = effect.purged.len(), "key compacted");
        }
        Ok(CommandEffect::Compacted {
            purged: effect.purged.len(),
        })
    }

    fn apply_lease_grant(
        &self,
        cmd: &LeaseGrantCommand,
        batch: &mut MetaBatch,
    ) -> KvResult<CommandEffect> {
        if self.leases.exists(cmd.id) {
            return Err(KvError::bad_argument(format!(
                "lease {} already exists",
                cmd.id
            )));
        }
        let record = LeaseRecord::new(cmd.id, cmd.ttl_secs, cmd.granted_at);
        self.leases.grant(record, batch)?;
        self.epoch.observe_applied_lease_id(cmd.id, batch);
        tracing::debug!(lease_id = cmd.id, ttl_secs = cmd.ttl_secs, "lease granted");
        Ok(CommandEffect::LeaseGranted { id: cmd.id })
    }

    fn apply_lease_revoke(
        &self,
        cmd: &LeaseRevokeCommand,
        batch: &mut MetaBatch,
    ) -> KvResult<CommandEffect> {
        let Some(lease) = self.leases.get(cmd.id) else {
            return Err(KvError::LeaseNotFound { lease_id: cmd.id });
        };

        // Bound keys die at the fresh revision, one sub slot per key; the
        // key set is ordered so every replica deletes in the same order.
        let mut sub = 0i64;
        let mut deleted_keys = 0usize;
        for key in &lease.keys {
            if self.delete_key_at(key, Revision::new(cmd.revision.main, sub), batch)? {
                deleted_keys += 1;
            }
            sub += 1;
        }

        self.leases.revoke(cmd.id, batch);
        self.observe_revision(cmd.revision, batch);
        tracing::debug!(lease_id = cmd.id, deleted_keys, "lease revoked");
        Ok(CommandEffect::LeaseRevoked { deleted_keys })
    }

    fn apply_lease_renew(
        &self,
        cmd: &LeaseRenewCommand,
        batch: &mut MetaBatch,
    ) -> KvResult<CommandEffect> {
        let remaining = self.leases.renew(cmd.id, cmd.renewed_at, batch)?;
        Ok(CommandEffect::LeaseRenewed {
            remaining_ttl_secs: remaining,
        })
    }
}
