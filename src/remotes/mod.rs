//! The pub/sub fabric abstraction the engine consumes.
//!
//! A `Remotes` implementation publishes this clone's operations, reports
//! peer presence, and runs the request/reply control exchanges a clone
//! needs to join or catch up with a domain: `new-clock`, `snapshot` and
//! `rev-up-from`. The engine attaches itself via `set_local` so the
//! fabric can deliver inbound operations and serve peers' control
//! requests against the local dataset.

pub mod memory;
pub mod pubsub;

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::core::clock::TreeClock;
use crate::dataset::Snapshot;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RemotesError {
    #[error("no live peer is available")]
    NoPeer,
    #[error("request timed out after {ms} ms")]
    Timeout { ms: u64 },
    #[error("request rejected by peer: {reason}")]
    Rejected { reason: String },
    #[error("remotes are closed")]
    Closed,
    #[error("fabric failure: {reason}")]
    Fabric { reason: String },
}

impl RemotesError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemotesError::NoPeer | RemotesError::Timeout { .. } | RemotesError::Fabric { .. }
        )
    }
}

/// An encoded operation in transit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationMessage {
    pub data: Bytes,
}

impl OperationMessage {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// The operations a peer replays to bring us from a stated time to now.
/// A finite, non-restartable sequence; consume it fully.
#[derive(Clone, Debug, Default)]
pub struct Recovery {
    pub operations: Vec<OperationMessage>,
}

/// The local clone, as seen by the fabric: inbound delivery, presence
/// notifications, and serving of control requests.
pub trait LocalClone: Send + Sync {
    /// Clone identity on the presence channel.
    fn id(&self) -> String;

    /// An operation arrived for this domain.
    fn deliver(&self, message: OperationMessage);

    /// The fabric's liveness changed: `None` = disconnected, otherwise
    /// whether any peer is present.
    fn live_change(&self, live: Option<bool>);

    /// Another live clone claims this clone's identity.
    fn duplicate_identity(&self);

    /// Serve a `new-clock` request: fork the local clock.
    fn fork_clock(&self) -> Result<TreeClock, RemotesError>;

    /// Serve a `snapshot` request.
    fn snapshot(&self) -> Result<Snapshot, RemotesError>;

    /// Serve a `rev-up-from` request; `None` if replay cannot reach back
    /// to `time`.
    fn revup_from(&self, time: &TreeClock) -> Result<Option<Recovery>, RemotesError>;
}

pub type CloneHandle = Arc<dyn LocalClone>;

pub trait Remotes: Send {
    /// Current liveness: `None` = unknown (disconnected), otherwise
    /// whether any peer is live on the domain.
    fn live(&self) -> Option<bool>;

    /// Attach (`Some`) or detach (`None`) the local clone. Attaching
    /// publishes presence; detaching leaves gracefully.
    fn set_local(&mut self, local: Option<CloneHandle>) -> Result<(), RemotesError>;

    /// Publish an operation to all subscribed clones.
    fn publish(&mut self, message: OperationMessage) -> Result<(), RemotesError>;

    /// Ask any live peer for a forked clock.
    fn new_clock(&mut self) -> Result<TreeClock, RemotesError>;

    /// Ask any live peer for a dataset snapshot.
    fn snapshot(&mut self) -> Result<Snapshot, RemotesError>;

    /// Ask a peer to replay operations since `time`; `Ok(None)` means no
    /// peer can, and the caller should snapshot instead.
    fn revup_from(&mut self, time: &TreeClock) -> Result<Option<Recovery>, RemotesError>;
}
