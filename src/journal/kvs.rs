//! Key/value seam for persisted state.
//!
//! The engine persists through this trait; the concrete backend is the
//! embedder's choice. Writes are atomic per batch. `MemoryKvs` is the
//! reference backend, used by tests and ephemeral clones.

use std::collections::BTreeMap;
use std::ops::Bound;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum KvsError {
    #[error("key/value backend failed: {reason}")]
    Backend { reason: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// An atomic set of writes. Applied in order; later writes win.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(BatchOp::Delete { key: key.into() });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

pub trait Kvs: Send {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvsError>;

    /// Apply a batch atomically.
    fn write(&mut self, batch: Batch) -> Result<(), KvsError>;

    /// The first key strictly after `after` that starts with `prefix`.
    fn next_after(
        &self,
        prefix: &[u8],
        after: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, KvsError>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvsError>;

    fn is_empty(&self) -> Result<bool, KvsError>;
}

/// Reference backend: a plain ordered map.
#[derive(Clone, Debug, Default)]
pub struct MemoryKvs {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryKvs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

impl Kvs for MemoryKvs {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvsError> {
        Ok(self.map.get(key).cloned())
    }

    fn write(&mut self, batch: Batch) -> Result<(), KvsError> {
        for op in batch.ops {
            match op {
                BatchOp::Put { key, value } => {
                    self.map.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    self.map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn next_after(
        &self,
        prefix: &[u8],
        after: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, KvsError> {
        let range = self
            .map
            .range::<[u8], _>((Bound::Excluded(after), Bound::Unbounded));
        for (key, value) in range {
            if key.starts_with(prefix) {
                return Ok(Some((key.clone(), value.clone())));
            }
            if key.as_slice() > prefix && !key.starts_with(prefix) {
                break;
            }
        }
        Ok(None)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvsError> {
        Ok(self
            .map
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn is_empty(&self) -> Result<bool, KvsError> {
        Ok(self.map.is_empty())
    }
}
