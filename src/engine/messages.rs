//! Causal-order message delivery with a bounded reorder buffer.
//!
//! The service owns the clone's tree clock. An incoming operation is
//! delivered when it is the causal successor of the current clock with
//! respect to its sender: its tick range extends what we have seen from
//! that source, and it depends on nothing from other sources we have not
//! seen. Anything else waits in the buffer, keyed by causal precedence,
//! and drains as its predecessors arrive.

use std::collections::BTreeMap;

use tracing::{trace, warn};

use crate::config::Limits;
use crate::core::clock::{PathKey, TreeClock};
use crate::core::operation::Operation;

/// Decision for one received operation.
#[derive(Debug)]
pub enum Delivery {
    /// Deliverable now, with any buffered operations it released, in
    /// causal order. The clock has joined each delivered time.
    Delivered(Vec<Operation>),
    /// Out of order; buffered until the missing range arrives.
    Buffered { missing_from: u64 },
    /// Already reflected (or already waiting); dropped.
    Duplicate,
    /// Buffer capacity exceeded; the engine must recover by snapshot.
    Overflow,
}

pub struct MessageService {
    time: TreeClock,
    buffered: BTreeMap<(PathKey, u64), (Operation, usize)>,
    buffered_bytes: usize,
    max_operations: usize,
    max_bytes: usize,
}

impl MessageService {
    pub fn new(time: TreeClock, limits: &Limits) -> Self {
        Self {
            time,
            buffered: BTreeMap::new(),
            buffered_bytes: 0,
            max_operations: limits.max_buffered_operations,
            max_bytes: limits.max_buffered_bytes,
        }
    }

    /// The current clock.
    pub fn peek(&self) -> &TreeClock {
        &self.time
    }

    /// Tick and return the new clock for stamping an outgoing operation.
    pub fn send(&mut self) -> TreeClock {
        self.time = self.time.ticked();
        self.time.clone()
    }

    /// Join an externally-derived clock (snapshot, reload).
    pub fn join(&mut self, other: &TreeClock) {
        self.time = self.time.update(other);
    }

    /// Adopt a clock wholesale (initialisation).
    pub fn reset(&mut self, time: TreeClock) {
        self.time = time;
    }

    /// Split the local identity; returns the half for the new clone.
    pub fn fork(&mut self) -> TreeClock {
        let (retained, handed_over) = self.time.forked();
        self.time = retained;
        handed_over
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }

    /// Receive an operation for causal delivery.
    pub fn receive(&mut self, op: Operation, size_hint: usize) -> Delivery {
        let source = op.source();
        let seen = self.time.seen_along(&source);
        if op.time().ticks() <= seen {
            trace!(tid = %op.tid(), seen, "duplicate operation dropped");
            return Delivery::Duplicate;
        }
        let key = (source, op.from());
        if self.buffered.contains_key(&key) {
            return Delivery::Duplicate;
        }

        if !self.deliverable(&op) {
            if self.buffered.len() >= self.max_operations
                || self.buffered_bytes + size_hint > self.max_bytes
            {
                warn!(
                    buffered = self.buffered.len(),
                    bytes = self.buffered_bytes,
                    "reorder buffer overflow"
                );
                return Delivery::Overflow;
            }
            let missing_from = seen + 1;
            trace!(tid = %op.tid(), from = op.from(), missing_from, "buffering out-of-order operation");
            self.buffered_bytes += size_hint;
            self.buffered.insert(key, (op, size_hint));
            return Delivery::Buffered { missing_from };
        }

        self.time = self.time.update(op.time());
        let mut batch = vec![op];
        self.drain(&mut batch);
        Delivery::Delivered(batch)
    }

    /// Forcibly deliver (snapshot ingestion), then drain the buffer.
    pub fn deliver(&mut self, op: Operation) -> Vec<Operation> {
        self.time = self.time.update(op.time());
        let mut batch = vec![op];
        self.drain(&mut batch);
        batch
    }

    fn drain(&mut self, batch: &mut Vec<Operation>) {
        loop {
            let next = self
                .buffered
                .iter()
                .find(|(_, (op, _))| self.deliverable(op))
                .map(|(key, _)| key.clone());
            let Some(key) = next else {
                return;
            };
            let (op, size) = self.buffered.remove(&key).expect("key probed above");
            self.buffered_bytes = self.buffered_bytes.saturating_sub(size);
            if op.time().ticks() <= self.time.seen_along(&key.0) {
                // Superseded while waiting.
                continue;
            }
            self.time = self.time.update(op.time());
            batch.push(op);
        }
    }

    /// The causal-successor test: the operation's range meets what we
    /// have seen from its source, and every other region of its time is
    /// already reflected here.
    fn deliverable(&self, op: &Operation) -> bool {
        let source = op.source();
        let seen = self.time.seen_along(&source);
        if op.from() > seen + 1 || op.time().ticks() <= seen {
            return false;
        }
        op.time()
            .leaf_paths()
            .iter()
            .all(|path| *path == source || self.time.seen_along(path) >= op.time().seen_along(path))
    }
}
