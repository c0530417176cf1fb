//! Client surface of the meta KV engine.
//!
//! The controller validates requests locally, reserves revisions, proposes
//! command batches through the replicated log and answers reads from the
//! in-memory maps. It is an explicit value threaded through every call:
//! tests construct a fresh controller per case; nothing is global.
//!
//! Reads are local and unreplicated. Writes block on
//! [`CommandLog::propose`] until the replication layer reports commit and
//! the per-command apply outcome is known.

use crate::core::config::Config;
use crate::core::error::{KvError, KvResult};
use crate::core::time::Tick;
use crate::kv::apply::{
    ApplyEngine, CommandEffect, CompactCommand, DeleteCommand, KvCommand, LeaseGrantCommand,
    LeaseRenewCommand, LeaseRevokeCommand, MetaIncrement, PutCommand,
};
use crate::kv::index::{Kv, KeyIndex};
use crate::kv::lease::LeaseRegistry;
use crate::kv::revision::{IdEpoch, Revision};
use crate::kv::store::{KeyRange, KvStore};
use crate::kv::watch::{KvEvent, WatchBus, WatchFilters};
use crate::log::{CommandLog, LocalCommandLog};
use crate::storage::meta_writer::MetaWriter;
use std::sync::Arc;
use std::time::Duration;

/// Compaction commands are proposed in groups of this many keys.
pub const COMPACT_BATCH_SIZE: usize = 50;

/// Range read request.
#[derive(Debug, Clone, Default)]
pub struct RangeRequest {
    pub key: Vec<u8>,
    /// Empty = point get; `[0x00]` = all keys at or above `key`.
    pub range_end: Vec<u8>,
    /// 0 means unlimited.
    pub limit: i64,
    pub keys_only: bool,
    pub count_only: bool,
    /// Historical read revision; 0 means latest.
    pub revision: i64,
}

/// Range read response.
#[derive(Debug, Clone, Default)]
pub struct RangeResponse {
    pub kvs: Vec<Kv>,
    /// Live keys in the full range, independent of `limit`.
    pub total_count: i64,
}

/// Put request.
#[derive(Debug, Clone, Default)]
pub struct PutRequest {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// 0 means no lease.
    pub lease_id: i64,
    /// Reuse the current value instead of `value`.
    pub ignore_value: bool,
    /// Reuse the current lease instead of `lease_id`.
    pub ignore_lease: bool,
    pub need_prev: bool,
}

/// Put response.
#[derive(Debug, Clone, Default)]
pub struct PutResponse {
    pub prev_kv: Option<Kv>,
    /// Main revision assigned to the put.
    pub revision: i64,
}

/// Range delete request.
#[derive(Debug, Clone, Default)]
pub struct DeleteRangeRequest {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
    pub need_prev: bool,
}

/// Range delete response.
#[derive(Debug, Clone, Default)]
pub struct DeleteRangeResponse {
    pub prev_kvs: Vec<Kv>,
    pub deleted_count: i64,
}

/// Lease grant response.
#[derive(Debug, Clone, Default)]
pub struct LeaseGrantResponse {
    pub id: i64,
    pub ttl_secs: i64,
}

/// Lease query response.
#[derive(Debug, Clone, Default)]
pub struct LeaseQueryResponse {
    pub granted_ttl_secs: i64,
    pub remaining_ttl_secs: i64,
    /// Bound keys, present only when requested.
    pub keys: Option<Vec<Vec<u8>>>,
}

/// Watch request.
#[derive(Debug, Clone, Default)]
pub struct WatchRequest {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
    /// Events below this main revision do not fire the subscription.
    pub start_revision: i64,
    pub filters: WatchFilters,
    pub need_prev: bool,
    /// Overrides the configured default timeout.
    pub timeout: Option<Duration>,
}

/// Outcome of a parked watch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// The subscription fired.
    Event(KvEvent),
    /// The client-visible timeout elapsed; the subscription was removed.
    TimedOut,
}

/// The coordinator KV controller.
pub struct KvController {
    config: Config,
    store: Arc<KvStore>,
    leases: Arc<LeaseRegistry>,
    watches: Arc<WatchBus>,
    epoch: Arc<IdEpoch>,
    log: Arc<dyn CommandLog>,
}

impl KvController {
    /// Open a standalone controller over a meta-writer, restoring any
    /// persisted state and wiring a local single-replica command log.
    pub fn open(config: Config, meta: Arc<dyn MetaWriter>) -> anyhow::Result<Self> {
        config.validate()?;
        let store = Arc::new(KvStore::restore(&meta)?);
        let leases = Arc::new(LeaseRegistry::restore(&meta)?);
        let watches = Arc::new(WatchBus::new());
        let epoch = Arc::new(IdEpoch::restore(&meta)?);
        let engine = ApplyEngine::new(
            Arc::clone(&store),
            Arc::clone(&leases),
            Arc::clone(&watches),
            Arc::clone(&epoch),
            Arc::clone(&meta),
        );
        let log: Arc<dyn CommandLog> = Arc::new(LocalCommandLog::new(engine));
        Ok(Self {
            config,
            store,
            leases,
            watches,
            epoch,
            log,
        })
    }

    /// Assemble a controller from pre-wired parts (external replication).
    ///
    /// The command log must drive an apply engine sharing these exact state
    /// handles.
    pub fn from_parts(
        config: Config,
        store: Arc<KvStore>,
        leases: Arc<LeaseRegistry>,
        watches: Arc<WatchBus>,
        epoch: Arc<IdEpoch>,
        log: Arc<dyn CommandLog>,
    ) -> Self {
        Self {
            config,
            store,
            leases,
            watches,
            epoch,
            log,
        }
    }

    /// The controller configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared handle to the two-map store.
    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    /// Shared handle to the lease registry.
    pub fn leases(&self) -> &Arc<LeaseRegistry> {
        &self.leases
    }

    /// Shared handle to the watch bus.
    pub fn watches(&self) -> &Arc<WatchBus> {
        &self.watches
    }

    /// Highest main revision assigned so far.
    pub fn current_revision(&self) -> i64 {
        self.epoch.next_revision() - 1
    }

    // ------------------------------------------------------------------
    // KV surface
    // ------------------------------------------------------------------

    /// Resolve a key range, at latest revision or at a historical one.
    pub fn kv_range(&self, req: &RangeRequest) -> KvResult<RangeResponse> {
        if req.key.is_empty() {
            return Err(KvError::bad_argument("range key is empty"));
        }
        let floor = self.store.compaction_floor();
        if req.revision > 0 && req.revision < floor {
            return Err(KvError::Compacted {
                revision: req.revision,
                floor,
            });
        }

        let range = KeyRange::resolve(&req.key, &req.range_end);
        let indexes = if req.revision > 0 {
            self.store
                .range_indexes(&range, |index| !index.generations.is_empty())
        } else {
            self.store.range_indexes(&range, KeyIndex::has_live_value)
        };

        let limit = if req.limit <= 0 {
            usize::MAX
        } else {
            req.limit as usize
        };

        let mut kvs = Vec::new();
        let mut total_count = 0i64;
        for index in &indexes {
            let revision = if req.revision > 0 {
                match index.resolve_at(req.revision) {
                    Some(revision) => revision,
                    None => continue,
                }
            } else {
                index.mod_revision
            };
            let Some(record) = self.store.rev(revision) else {
                tracing::error!(key = ?index.id, revision = %revision, "KvRev missing for KeyIndex");
                continue;
            };
            if record.is_deleted {
                continue;
            }
            total_count += 1;
            if !req.count_only && kvs.len() < limit {
                kvs.push(Kv::from_rev(&record, req.keys_only));
            }
        }

        Ok(RangeResponse { kvs, total_count })
    }

    /// Write a key at a fresh revision.
    pub fn kv_put(&self, req: &PutRequest) -> KvResult<PutResponse> {
        if req.key.is_empty() {
            return Err(KvError::bad_argument("put key is empty"));
        }
        if req.key.len() > self.config.kv.max_kv_key_size {
            return Err(KvError::bad_argument(format!(
                "put key exceeds {} bytes",
                self.config.kv.max_kv_key_size
            )));
        }
        if !req.ignore_value && req.value.is_empty() {
            return Err(KvError::bad_argument("put value is empty"));
        }
        if !req.ignore_value && req.value.len() > self.config.kv.max_kv_value_size {
            return Err(KvError::bad_argument(format!(
                "put value exceeds {} bytes",
                self.config.kv.max_kv_value_size
            )));
        }

        if !req.ignore_lease && req.lease_id != 0 {
            let lease = self
                .leases
                .get(req.lease_id)
                .ok_or(KvError::LeaseNotFound {
                    lease_id: req.lease_id,
                })?;
            if lease.is_expired_at(Tick::from_wall_clock()) {
                return Err(KvError::LeaseExpired {
                    lease_id: req.lease_id,
                });
            }
        }

        let current = self.point_kv(&req.key)?;
        if req.ignore_value && current.is_none() {
            return Err(KvError::bad_argument(
                "put with ignore_value requires an existing value",
            ));
        }
        let resolved_lease = if req.ignore_lease {
            match &current {
                Some(kv) => kv.lease,
                None => {
                    return Err(KvError::bad_argument(
                        "put with ignore_lease requires an existing key",
                    ))
                }
            }
        } else {
            if let Some(kv) = &current {
                if kv.lease != req.lease_id {
                    return Err(KvError::bad_argument(format!(
                        "lease mismatch: key is bound to lease {}",
                        kv.lease
                    )));
                }
            }
            req.lease_id
        };

        let prev_kv = if req.need_prev { current } else { None };

        let main = self.epoch.begin_txn()?;
        let effect = self.propose_single(KvCommand::Put(PutCommand {
            key: req.key.clone(),
            value: if req.ignore_value {
                Vec::new()
            } else {
                req.value.clone()
            },
            lease_id: resolved_lease,
            ignore_value: req.ignore_value,
            ignore_lease: req.ignore_lease,
            revision: Revision::new(main, 0),
        }))?;

        match effect {
            CommandEffect::Put { revision } => Ok(PutResponse {
                prev_kv,
                revision: revision.main,
            }),
            other => Err(KvError::internal(format!(
                "unexpected put outcome: {other:?}"
            ))),
        }
    }

    /// Delete every live key in a range at a fresh revision.
    pub fn kv_delete_range(&self, req: &DeleteRangeRequest) -> KvResult<DeleteRangeResponse> {
        if req.key.is_empty() {
            return Err(KvError::bad_argument("delete key is empty"));
        }

        let to_delete = self.kv_range(&RangeRequest {
            key: req.key.clone(),
            range_end: req.range_end.clone(),
            limit: 0,
            keys_only: !req.need_prev,
            count_only: false,
            revision: 0,
        })?;

        if to_delete.kvs.is_empty() {
            return Ok(DeleteRangeResponse {
                prev_kvs: Vec::new(),
                deleted_count: 0,
            });
        }

        let main = self.epoch.begin_txn()?;
        let ops = to_delete
            .kvs
            .iter()
            .enumerate()
            .map(|(sub, kv)| {
                KvCommand::Delete(DeleteCommand {
                    key: kv.key.clone(),
                    revision: Revision::new(main, sub as i64),
                })
            })
            .collect();

        let outcomes = self.log.propose(MetaIncrement { ops })?;
        for outcome in outcomes {
            outcome?;
        }

        let deleted_count = to_delete.kvs.len() as i64;
        Ok(DeleteRangeResponse {
            prev_kvs: if req.need_prev {
                to_delete.kvs
            } else {
                Vec::new()
            },
            deleted_count,
        })
    }

    /// Prune history below `revision` across all known keys.
    pub fn kv_compact(&self, revision: i64) -> KvResult<i64> {
        if revision <= 0 {
            return Err(KvError::bad_argument("compact revision must be positive"));
        }
        if revision > self.current_revision() + 1 {
            return Err(KvError::bad_argument(format!(
                "compact revision {} is in the future",
                revision
            )));
        }
        let floor = self.store.compaction_floor();
        if revision < floor {
            return Err(KvError::Compacted { revision, floor });
        }

        let at = Revision::new(revision, 0);
        let keys = self.store.all_index_keys();
        for chunk in keys.chunks(COMPACT_BATCH_SIZE) {
            let ops = chunk
                .iter()
                .map(|key| {
                    KvCommand::Compact(CompactCommand {
                        key: key.clone(),
                        at,
                    })
                })
                .collect();
            let outcomes = self.log.propose(MetaIncrement { ops })?;
            for outcome in outcomes {
                outcome?;
            }
        }

        tracing::info!(revision, keys = keys.len(), "compaction proposed");
        Ok(revision)
    }

    // ------------------------------------------------------------------
    // Lease surface
    // ------------------------------------------------------------------

    /// Grant a lease. `id == 0` auto-assigns one.
    pub fn lease_grant(&self, ttl_secs: i64, id: i64) -> KvResult<LeaseGrantResponse> {
        if ttl_secs <= 0 {
            return Err(KvError::bad_argument("lease ttl must be positive"));
        }
        let id = if id == 0 {
            self.epoch.reserve_lease_id()?
        } else {
            if self.leases.exists(id) {
                return Err(KvError::bad_argument(format!("lease {} already exists", id)));
            }
            id
        };

        let effect = self.propose_single(KvCommand::LeaseGrant(LeaseGrantCommand {
            id,
            ttl_secs,
            granted_at: Tick::from_wall_clock(),
        }))?;
        match effect {
            CommandEffect::LeaseGranted { id } => Ok(LeaseGrantResponse { id, ttl_secs }),
            other => Err(KvError::internal(format!(
                "unexpected lease grant outcome: {other:?}"
            ))),
        }
    }

    /// Revoke a lease, deleting every bound key at a fresh revision.
    pub fn lease_revoke(&self, id: i64) -> KvResult<()> {
        if !self.leases.exists(id) {
            return Err(KvError::LeaseNotFound { lease_id: id });
        }
        let main = self.epoch.begin_txn()?;
        self.propose_single(KvCommand::LeaseRevoke(LeaseRevokeCommand {
            id,
            revision: Revision::new(main, 0),
        }))?;
        Ok(())
    }

    /// Heartbeat a lease, advancing its deadline.
    pub fn lease_renew(&self, id: i64) -> KvResult<i64> {
        if !self.leases.exists(id) {
            return Err(KvError::LeaseNotFound { lease_id: id });
        }
        let effect = self.propose_single(KvCommand::LeaseRenew(LeaseRenewCommand {
            id,
            renewed_at: Tick::from_wall_clock(),
        }))?;
        match effect {
            CommandEffect::LeaseRenewed { remaining_ttl_secs } => Ok(remaining_ttl_secs),
            other => Err(KvError::internal(format!(
                "unexpected lease renew outcome: {other:?}"
            ))),
        }
    }

    /// Query a lease. Read-only, answered locally.
    pub fn lease_query(&self, id: i64, with_keys: bool) -> KvResult<LeaseQueryResponse> {
        let lease = self
            .leases
            .get(id)
            .ok_or(KvError::LeaseNotFound { lease_id: id })?;
        let now = Tick::from_wall_clock();
        Ok(LeaseQueryResponse {
            granted_ttl_secs: lease.granted_ttl_secs,
            remaining_ttl_secs: lease.remaining_ttl_secs_at(now),
            keys: with_keys.then(|| lease.keys.iter().cloned().collect()),
        })
    }

    // ------------------------------------------------------------------
    // Watch surface
    // ------------------------------------------------------------------

    /// Park until one matching event fires or the timeout elapses.
    pub async fn watch(&self, req: &WatchRequest) -> KvResult<WatchOutcome> {
        if req.key.is_empty() {
            return Err(KvError::bad_argument("watch key is empty"));
        }
        let (id, rx) = self.watches.subscribe(
            req.key.clone(),
            req.range_end.clone(),
            req.start_revision,
            req.filters,
            req.need_prev,
        );
        let timeout = req
            .timeout
            .unwrap_or_else(|| Duration::from_millis(self.config.watch.default_timeout_ms));

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(event)) => Ok(WatchOutcome::Event(event)),
            Ok(Err(_)) => Err(KvError::Unavailable("watch bus dropped".to_string())),
            Err(_) => {
                self.watches.cancel(id);
                Ok(WatchOutcome::TimedOut)
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Latest live value of a single key.
    fn point_kv(&self, key: &[u8]) -> KvResult<Option<Kv>> {
        let response = self.kv_range(&RangeRequest {
            key: key.to_vec(),
            range_end: Vec::new(),
            limit: 1,
            keys_only: false,
            count_only: false,
            revision: 0,
        })?;
        Ok(response.kvs.into_iter().next())
    }

    fn propose_single(&self, op: KvCommand) -> KvResult<CommandEffect> {
        let outcomes = self.log.propose(MetaIncrement::single(op))?;
        let outcome = outcomes
            .into_iter()
            .next()
            .ok_or_else(|| KvError::Unavailable("apply reported no outcome".to_string()))?;
        outcome
    }
}
