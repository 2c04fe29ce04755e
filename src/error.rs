//! Crate-level error surface.
//!
//! Thin wrapper over the canonical capability errors; the engine-lifecycle
//! failures that belong to no single capability live here directly.

use thiserror::Error;

use crate::core::clock::ClockError;
use crate::core::encoding::{DecodeError, EncodeError};
use crate::core::operation::OperationError;
use crate::core::triple::TripleError;
use crate::dataset::DatasetError;
use crate::journal::JournalError;
use crate::journal::kvs::KvsError;
use crate::remotes::RemotesError;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum EngineError {
    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error(transparent)]
    Triple(#[from] TripleError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Kvs(#[from] KvsError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Remotes(#[from] RemotesError),

    #[error("configuration invalid: {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("dataset for domain `{domain}` is already in use")]
    DatasetInUse { domain: String },

    #[error("stored domain `{stored}` does not match configured domain `{configured}`")]
    DomainMismatch { stored: String, configured: String },

    #[error("dataset already holds domain data but the genesis flag is set")]
    IsGenesis,

    #[error("dataset is empty, the genesis flag is not set, and no peer is reachable")]
    NotGenesis,

    #[error("engine is closed")]
    Closed,
}

impl EngineError {
    /// True iff retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::Remotes(err) => err.is_transient(),
            EngineError::NotGenesis => true,
            _ => false,
        }
    }
}
