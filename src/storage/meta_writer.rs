//! The meta-writer: synchronous column-family put/delete storage used inside
//! apply to persist KeyIndex, KvRev, lease and epoch mutations.
//!
//! The apply engine collects every mutation of a state-machine step into one
//! [`MetaBatch`] and hands it to the writer exactly once; the writer is
//! atomic per batch, so partial apply is impossible. On restart the
//! in-memory maps are rebuilt by scanning the persisted column families.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Column family for KeyIndex records.
pub const CF_KV_INDEX: &str = "kv_index";

/// Column family for per-revision KvRev records.
pub const CF_KV_REV: &str = "kv_rev";

/// Column family for lease records.
pub const CF_KV_LEASE: &str = "kv_lease";

/// Column family for the meta epoch table (id counters, compaction floor).
pub const CF_META_EPOCH: &str = "meta_epoch";

/// A single persisted mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MetaOp {
    /// Write a (cf, key, value) tuple.
    Put {
        cf: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    /// Remove a (cf, key) tuple.
    Delete { cf: String, key: Vec<u8> },
}

/// The ordered mutations of one apply step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaBatch {
    /// Mutations in application order.
    pub ops: Vec<MetaOp>,
}

impl MetaBatch {
    /// Append a put tuple.
    pub fn put(&mut self, cf: &str, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(MetaOp::Put {
            cf: cf.to_string(),
            key,
            value,
        });
    }

    /// Append a delete tuple.
    pub fn delete(&mut self, cf: &str, key: Vec<u8>) {
        self.ops.push(MetaOp::Delete {
            cf: cf.to_string(),
            key,
        });
    }

    /// Whether the batch carries no mutations.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of mutations in the batch.
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Capability set the meta store depends on.
///
/// Any backend implementing `{get, write, scan}` is interchangeable.
pub trait MetaWriter: Send + Sync {
    /// Point lookup of a (cf, key) tuple.
    fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Apply one batch atomically.
    fn write(&self, batch: MetaBatch) -> Result<()>;

    /// All (key, value) tuples of a column family in key order.
    fn scan(&self, cf: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

type CfTables = HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>;

fn apply_to_tables(tables: &mut CfTables, batch: &MetaBatch) {
    for op in &batch.ops {
        match op {
            MetaOp::Put { cf, key, value } => {
                tables
                    .entry(cf.clone())
                    .or_default()
                    .insert(key.clone(), value.clone());
            }
            MetaOp::Delete { cf, key } => {
                if let Some(table) = tables.get_mut(cf) {
                    table.remove(key);
                }
            }
        }
    }
}

/// In-memory meta-writer for tests and ephemeral replicas.
#[derive(Default)]
pub struct MemoryMetaWriter {
    tables: Mutex<CfTables>,
}

impl MemoryMetaWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetaWriter for MemoryMetaWriter {
    fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .tables
            .lock()
            .get(cf)
            .and_then(|table| table.get(key).cloned()))
    }

    fn write(&self, batch: MetaBatch) -> Result<()> {
        apply_to_tables(&mut self.tables.lock(), &batch);
        Ok(())
    }

    fn scan(&self, cf: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .tables
            .lock()
            .get(cf)
            .map(|table| {
                table
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// File-backed meta-writer: a bincode-framed append log replayed on open.
///
/// Each batch is one length-prefixed frame, flushed before the write call
/// returns. An in-memory mirror of the tables serves reads.
pub struct FileMetaWriter {
    path: PathBuf,
    inner: Mutex<FileMetaWriterInner>,
}

struct FileMetaWriterInner {
    tables: CfTables,
    writer: BufWriter<File>,
}

impl FileMetaWriter {
    /// Open (or create) the log at `path`, replaying existing frames.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create meta dir {:?}", parent))?;
            }
        }

        let mut tables = CfTables::new();
        if path.exists() {
            let file = File::open(&path)
                .with_context(|| format!("failed to open meta log {:?}", path))?;
            let mut reader = BufReader::new(file);
            let mut raw = Vec::new();
            reader
                .read_to_end(&mut raw)
                .context("failed to read meta log")?;
            let mut offset = 0usize;
            while offset + 4 <= raw.len() {
                let frame_len =
                    u32::from_be_bytes([raw[offset], raw[offset + 1], raw[offset + 2], raw[offset + 3]])
                        as usize;
                offset += 4;
                if offset + frame_len > raw.len() {
                    // Torn tail from an interrupted write; everything before it is intact.
                    tracing::warn!(path = ?path, "truncated frame at end of meta log, ignoring");
                    break;
                }
                let batch: MetaBatch = bincode::deserialize(&raw[offset..offset + frame_len])
                    .context("failed to decode meta log frame")?;
                apply_to_tables(&mut tables, &batch);
                offset += frame_len;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open meta log {:?} for append", path))?;

        Ok(Self {
            path,
            inner: Mutex::new(FileMetaWriterInner {
                tables,
                writer: BufWriter::new(file),
            }),
        })
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MetaWriter for FileMetaWriter {
    fn get(&self, cf: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .inner
            .lock()
            .tables
            .get(cf)
            .and_then(|table| table.get(key).cloned()))
    }

    fn write(&self, batch: MetaBatch) -> Result<()> {
        let frame = bincode::serialize(&batch).context("failed to serialize meta batch")?;
        let mut inner = self.inner.lock();
        inner
            .writer
            .write_all(&(frame.len() as u32).to_be_bytes())
            .context("failed to write meta frame header")?;
        inner
            .writer
            .write_all(&frame)
            .context("failed to write meta frame")?;
        inner.writer.flush().context("failed to flush meta log")?;
        apply_to_tables(&mut inner.tables, &batch);
        Ok(())
    }

    fn scan(&self, cf: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .inner
            .lock()
            .tables
            .get(cf)
            .map(|table| {
                table
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
