#![forbid(unsafe_code)]

//! Core replication engine for live-shared JSON-LD graph domains.
//!
//! Every participant holds a full local replica (a "clone") of a named
//! domain. Clones exchange operations over a pluggable pub/sub fabric and
//! converge without central coordination: reads are snapshot-isolated,
//! writes are strongly eventually consistent, and delivery respects
//! causal order.

pub mod config;
pub mod core;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod journal;
pub mod remotes;
pub mod telemetry;

pub use error::EngineError;
pub type Result<T> = std::result::Result<T, EngineError>;

// Re-export the working vocabulary at the crate root.
pub use crate::config::{CloneConfig, Limits, LogLevel};
pub use crate::core::clock::{ClockError, PathKey, Tid, TreeClock};
pub use crate::core::encoding::OperationEncoder;
pub use crate::core::gwc::GlobalClock;
pub use crate::core::operation::{Operation, OperationError, Reified};
pub use crate::core::triple::{
    Context, Iri, Literal, Patch, Subject, Term, Triple, TripleError, TriplePattern,
};
pub use crate::dataset::constraint::{
    Constraint, ConstraintError, InterimUpdate, SingleValued, constraint_from_descriptor,
    register_constraint,
};
pub use crate::dataset::{
    ApplyOutcome, DatasetError, Snapshot, SnapshotBatch, StateView, SuSetDataset, Update,
};
pub use crate::engine::live::Subscription;
pub use crate::engine::messages::{Delivery, MessageService};
pub use crate::engine::{CloneEngine, CloneStatus, EngineState, UpdateEvent};
pub use crate::journal::kvs::{Batch, Kvs, KvsError, MemoryKvs};
pub use crate::journal::{Journal, JournalEntry, JournalError, JournalState};
pub use crate::remotes::memory::{MemoryChannel, MemoryHub};
pub use crate::remotes::pubsub::{PubsubChannel, PubsubRemotes};
pub use crate::remotes::{
    CloneHandle, LocalClone, OperationMessage, Recovery, Remotes, RemotesError,
};
