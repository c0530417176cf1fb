//! Per-key generation catalog and per-revision value records.
//!
//! A [`KeyIndex`] tracks the full mutation history of one logical key as an
//! ordered list of [`Generation`]s. A generation is one lifetime of the key:
//! born at a create revision, extended by puts, closed by a delete revision.
//! A generation without a create revision is a tombstone marker; the next
//! put starts the fresh generation in its place, so a closed generation is
//! never reused.

use crate::kv::revision::Revision;
use serde::{Deserialize, Serialize};

/// One lifetime of a key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    /// Revision that started this lifetime; `None` marks a tombstone.
    pub create_revision: Option<Revision>,

    /// Number of mutations recorded in this lifetime (the closing delete
    /// revision counts).
    pub version: i64,

    /// Mutation revisions in strictly increasing order.
    pub revisions: Vec<Revision>,
}

impl Generation {
    /// A fresh open generation born at `revision`.
    pub fn first(revision: Revision) -> Self {
        Self {
            create_revision: Some(revision),
            version: 1,
            revisions: vec![revision],
        }
    }

    /// An empty tombstone marker.
    pub fn tombstone() -> Self {
        Self::default()
    }

    /// Whether this generation marks a delete.
    pub fn is_tombstone(&self) -> bool {
        self.create_revision.is_none()
    }

    /// Whether this generation currently carries a value.
    pub fn is_open(&self) -> bool {
        self.create_revision.is_some() && !self.revisions.is_empty()
    }
}

/// Effect of a put on a [`KeyIndex`].
#[derive(Debug, Clone, Copy)]
pub struct PutEffect {
    /// Create revision of the (possibly fresh) generation the put landed in.
    pub create_revision: Revision,

    /// Version after the put.
    pub version: i64,

    /// Mod revision before the put, when the previous generation was open.
    /// Only then is a previous value meaningful.
    pub prev_mod_revision: Option<Revision>,
}

/// Effect of a delete on a [`KeyIndex`].
#[derive(Debug, Clone, Copy)]
pub struct DeleteEffect {
    /// Create revision recorded on the tombstone KvRev.
    pub create_revision: Revision,

    /// Version recorded on the tombstone KvRev.
    pub version: i64,

    /// Mod revision before the delete, when the closed generation was open.
    pub prev_mod_revision: Option<Revision>,
}

/// Effect of compacting a [`KeyIndex`].
#[derive(Debug, Clone)]
pub struct CompactEffect {
    /// The surviving index, or `None` when every generation was pruned and
    /// the index itself must be erased.
    pub retained: Option<KeyIndex>,

    /// Revisions whose KvRev records must be erased.
    pub purged: Vec<Revision>,
}

/// The per-key catalog of generations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyIndex {
    /// The logical key.
    pub id: Vec<u8>,

    /// Revision of the most recent mutation, deletes included.
    pub mod_revision: Revision,

    /// Time-ordered generations; at most one trailing tombstone.
    pub generations: Vec<Generation>,
}

impl KeyIndex {
    /// A fresh index for `key` with no history.
    pub fn new(key: Vec<u8>) -> Self {
        Self {
            id: key,
            mod_revision: Revision::zero(),
            generations: Vec::new(),
        }
    }

    /// Whether the key currently carries a value.
    pub fn has_live_value(&self) -> bool {
        self.generations.last().is_some_and(Generation::is_open)
    }

    /// Record a put at `revision`.
    pub fn apply_put(&mut self, revision: Revision) -> PutEffect {
        let prev_mod = self.mod_revision;
        let effect = match self.generations.last_mut() {
            Some(last) if !last.is_tombstone() => {
                last.revisions.push(revision);
                last.version += 1;
                PutEffect {
                    create_revision: last.create_revision.unwrap_or(revision),
                    version: last.version,
                    prev_mod_revision: Some(prev_mod),
                }
            }
            Some(last) => {
                // The tombstone placeholder becomes the fresh generation.
                *last = Generation::first(revision);
                PutEffect {
                    create_revision: revision,
                    version: 1,
                    prev_mod_revision: None,
                }
            }
            None => {
                self.generations.push(Generation::first(revision));
                PutEffect {
                    create_revision: revision,
                    version: 1,
                    prev_mod_revision: None,
                }
            }
        };
        self.mod_revision = revision;
        effect
    }

    /// Record a delete at `revision`.
    ///
    /// An open generation is closed by appending the delete revision and a
    /// trailing tombstone; an already-tombstoned key keeps its structure,
    /// though the mod revision still advances and a deleted KvRev is still
    /// recorded by the caller.
    pub fn apply_delete(&mut self, revision: Revision) -> DeleteEffect {
        let prev_mod = self.mod_revision;
        let effect = match self.generations.last_mut() {
            Some(last) if !last.is_tombstone() => {
                last.revisions.push(revision);
                last.version += 1;
                let effect = DeleteEffect {
                    create_revision: last.create_revision.unwrap_or(revision),
                    version: last.version,
                    prev_mod_revision: Some(prev_mod),
                };
                self.generations.push(Generation::tombstone());
                effect
            }
            Some(last) => DeleteEffect {
                create_revision: Revision::zero(),
                version: last.version,
                prev_mod_revision: None,
            },
            None => {
                self.generations.push(Generation::tombstone());
                DeleteEffect {
                    create_revision: revision,
                    version: 1,
                    prev_mod_revision: None,
                }
            }
        };
        self.mod_revision = revision;
        effect
    }

    /// Highest mutation revision visible at main revision `at`.
    ///
    /// Walks generations newest-first; the caller decides liveness by
    /// loading the KvRev and checking its delete flag.
    pub fn resolve_at(&self, at: i64) -> Option<Revision> {
        let ceiling = Revision::new(at, i64::MAX);
        for generation in self.generations.iter().rev() {
            for revision in generation.revisions.iter().rev() {
                if *revision <= ceiling {
                    return Some(*revision);
                }
            }
        }
        None
    }

    /// Prune history below `at`, keeping the invariant that the final
    /// revision of the most recent generation always survives.
    ///
    /// Generations older than the first survivor are filtered revision by
    /// revision; every generation after it is kept whole. Idempotent.
    pub fn compact(&self, at: Revision) -> CompactEffect {
        let mut retained: Vec<Generation> = Vec::new();
        let mut purged: Vec<Revision> = Vec::new();

        if self.generations.is_empty() {
            return CompactEffect {
                retained: Some(self.clone()),
                purged,
            };
        }

        let history = &self.generations[..self.generations.len() - 1];
        for generation in history {
            if !retained.is_empty() {
                retained.push(generation.clone());
                continue;
            }
            let Some(create_revision) = generation.create_revision else {
                // A leading tombstone carries no revisions; drop it.
                continue;
            };
            let mut survivor = Generation::tombstone();
            for revision in &generation.revisions {
                if revision.main < at.main {
                    purged.push(*revision);
                } else {
                    survivor.revisions.push(*revision);
                }
            }
            if !survivor.revisions.is_empty() {
                survivor.create_revision = Some(create_revision);
                survivor.version = generation.version;
                retained.push(survivor);
            }
        }

        let latest = &self.generations[self.generations.len() - 1];
        if latest.is_tombstone() {
            if !retained.is_empty() {
                retained.push(latest.clone());
            }
        } else if !retained.is_empty() {
            retained.push(latest.clone());
        } else {
            let mut survivor = Generation::tombstone();
            let last_slot = latest.revisions.len().saturating_sub(1);
            for (slot, revision) in latest.revisions.iter().enumerate() {
                if slot == last_slot {
                    // The latest value read must never be destroyed.
                    survivor.revisions.push(*revision);
                } else if revision.main < at.main {
                    purged.push(*revision);
                } else {
                    survivor.revisions.push(*revision);
                }
            }
            if !survivor.revisions.is_empty() {
                survivor.create_revision = latest.create_revision;
                survivor.version = latest.version;
                retained.push(survivor);
            }
        }

        let retained = if retained.is_empty() {
            None
        } else {
            Some(KeyIndex {
                id: self.id.clone(),
                mod_revision: self.mod_revision,
                generations: retained,
            })
        };

        CompactEffect { retained, purged }
    }
}

/// The per-revision value record stored in the RevMap.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvRev {
    /// The logical key.
    pub key: Vec<u8>,

    /// Value bytes; empty for deletes.
    pub value: Vec<u8>,

    /// Create revision of the generation this mutation belongs to.
    pub create_revision: Revision,

    /// This mutation's revision; also the record's RevMap key.
    pub mod_revision: Revision,

    /// Version within the generation.
    pub version: i64,

    /// Bound lease id; 0 means no lease.
    pub lease: i64,

    /// Whether this record is a delete marker.
    pub is_deleted: bool,
}

/// Client-facing projection of a KvRev.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kv {
    /// The logical key.
    pub key: Vec<u8>,

    /// Value bytes; omitted under `keys_only` projection.
    pub value: Vec<u8>,

    /// Main half of the create revision.
    pub create_revision: i64,

    /// Main half of the mod revision.
    pub mod_revision: i64,

    /// Version within the current generation.
    pub version: i64,

    /// Bound lease id; 0 means no lease.
    pub lease: i64,
}

impl Kv {
    /// Project a KvRev for client output.
    pub fn from_rev(rev: &KvRev, keys_only: bool) -> Self {
        Self {
            key: rev.key.clone(),
            value: if keys_only { Vec::new() } else { rev.value.clone() },
            create_revision: rev.create_revision.main,
            mod_revision: rev.mod_revision.main,
            version: rev.version,
            lease: rev.lease,
        }
    }
}
