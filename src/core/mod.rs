//! Core domain types, in dependency order: logical time, identity of
//! processes and transactions, graph values, operations, wire encoding.

pub mod clock;
pub mod encoding;
pub mod gwc;
pub mod operation;
pub mod triple;

pub use clock::{ClockError, PathKey, TID_WIDTH, Tid, TreeClock};
pub use encoding::{DecodeError, EncodeError, OperationEncoder};
pub use gwc::GlobalClock;
pub use operation::{OPERATION_VERSION, Operation, OperationError, Reified};
pub use triple::{
    Context, Iri, Literal, Patch, Subject, Term, Triple, TripleError, TriplePattern, subjects_of,
    subjects_to_triples,
};
