//! Operations: the replicated unit of change.
//!
//! An operation withdraws transaction ids from triples (deletes) and
//! asserts triples under its own transaction id (inserts). Contiguous
//! operations from one source can be fused into a single operation
//! covering the combined tick range; the reified form keeps every
//! constituent transaction id visible so receivers can cut the prefix
//! they have already reflected.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::clock::{PathKey, Tid, TreeClock};
use super::triple::Triple;

/// Protocol version carried by every encoded operation.
pub const OPERATION_VERSION: u32 = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum OperationError {
    #[error("operations are not contiguous: expected from {expected}, got {got}")]
    NotContiguous { expected: u64, got: u64 },
    #[error("operations have different sources")]
    DifferentSource,
    #[error("operation version {got} is not supported")]
    BadVersion { got: u32 },
    #[error("operation covers ticks {from}..{ticks}, which is not a valid range")]
    BadRange { from: u64, ticks: u64 },
}

/// A triple together with the transaction ids asserting (or withdrawing)
/// it. This is the wire shape of fused payloads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reified {
    pub triple: Triple,
    pub tids: BTreeSet<Tid>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Operation {
    version: u32,
    from: u64,
    time: TreeClock,
    deletes: BTreeMap<Triple, BTreeSet<Tid>>,
    inserts: BTreeMap<Triple, BTreeSet<Tid>>,
}

impl Operation {
    /// A single-tick operation: inserts are asserted under this
    /// operation's own transaction id.
    pub fn single(
        time: TreeClock,
        deletes: BTreeMap<Triple, BTreeSet<Tid>>,
        inserts: impl IntoIterator<Item = Triple>,
    ) -> Self {
        let tid = time.hash();
        let inserts = inserts
            .into_iter()
            .map(|triple| (triple, BTreeSet::from([tid])))
            .collect();
        Self {
            version: OPERATION_VERSION,
            from: time.ticks(),
            time,
            deletes: prune(deletes),
            inserts,
        }
    }

    /// Reassemble an operation from its wire parts.
    pub fn from_parts(
        version: u32,
        from: u64,
        time: TreeClock,
        deletes: Vec<Reified>,
        inserts: Vec<Reified>,
    ) -> Result<Self, OperationError> {
        if version != OPERATION_VERSION {
            return Err(OperationError::BadVersion { got: version });
        }
        if from > time.ticks() {
            return Err(OperationError::BadRange {
                from,
                ticks: time.ticks(),
            });
        }
        Ok(Self {
            version,
            from,
            time,
            deletes: prune(collect(deletes)),
            inserts: prune(collect(inserts)),
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// First tick covered by this operation.
    pub fn from(&self) -> u64 {
        self.from
    }

    pub fn time(&self) -> &TreeClock {
        &self.time
    }

    /// The operation's transaction id: hash of its time.
    pub fn tid(&self) -> Tid {
        self.time.hash()
    }

    /// Identity of the producing process.
    pub fn source(&self) -> PathKey {
        self.time.id_path()
    }

    /// True iff this operation fuses several single-tick operations.
    pub fn is_fused(&self) -> bool {
        self.from < self.time.ticks()
    }

    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty()
    }

    pub fn deletes(&self) -> impl Iterator<Item = (&Triple, &BTreeSet<Tid>)> {
        self.deletes.iter()
    }

    pub fn inserts(&self) -> impl Iterator<Item = (&Triple, &BTreeSet<Tid>)> {
        self.inserts.iter()
    }

    pub fn delete_parts(&self) -> Vec<Reified> {
        reify(&self.deletes)
    }

    pub fn insert_parts(&self) -> Vec<Reified> {
        reify(&self.inserts)
    }

    /// All transaction ids this operation asserts triples under.
    pub fn insert_tids(&self) -> BTreeSet<Tid> {
        self.inserts.values().flatten().copied().collect()
    }

    /// Fuse `next` onto this operation. `next` must be the causal
    /// successor from the same source: contiguous ticks, same id path.
    ///
    /// Inserts that `next` deletes again are cancelled outright: their
    /// transaction id is internal to the fused range, so a replica
    /// applying the fusion from scratch must never see them. All other
    /// reified transaction ids are preserved.
    pub fn fuse(&self, next: &Operation) -> Result<Operation, OperationError> {
        if next.source() != self.source() {
            return Err(OperationError::DifferentSource);
        }
        let expected = self.time.ticks() + 1;
        if next.from != expected {
            return Err(OperationError::NotContiguous {
                expected,
                got: next.from,
            });
        }

        let mut deletes = self.deletes.clone();
        let mut inserts = self.inserts.clone();
        for (triple, tids) in &next.deletes {
            for tid in tids {
                let cancelled = match inserts.get_mut(triple) {
                    Some(asserted) => asserted.remove(tid),
                    None => false,
                };
                if !cancelled {
                    deletes.entry(triple.clone()).or_default().insert(*tid);
                }
            }
        }
        for (triple, tids) in &next.inserts {
            inserts
                .entry(triple.clone())
                .or_default()
                .extend(tids.iter().copied());
        }

        Ok(Operation {
            version: OPERATION_VERSION,
            from: self.from,
            time: next.time.clone(),
            deletes: prune(deletes),
            inserts: prune(inserts),
        })
    }

    /// Cut the already-reflected prefix `seen` out of this fusion.
    ///
    /// Inserts still present in the fusion are dropped (already applied).
    /// Inserts of `seen` that the fusion no longer carries were cancelled
    /// inside the fused range: the receiver holds them and must now
    /// withdraw them, so they are surfaced as deletes.
    pub fn cut(&self, seen: &Operation) -> Result<Operation, OperationError> {
        if seen.source() != self.source() {
            return Err(OperationError::DifferentSource);
        }

        let mut deletes = self.deletes.clone();
        let mut inserts = self.inserts.clone();
        for (triple, tids) in &seen.inserts {
            for tid in tids {
                let still_asserted = match inserts.get_mut(triple) {
                    Some(asserted) => asserted.remove(tid),
                    None => false,
                };
                if !still_asserted {
                    deletes.entry(triple.clone()).or_default().insert(*tid);
                }
            }
        }
        // Withdrawals the receiver has already applied are harmless to
        // repeat (removing an absent tid is a no-op), so deletes carried
        // by `seen` need no adjustment.

        Ok(Operation {
            version: OPERATION_VERSION,
            from: self.from.max(seen.time.ticks() + 1),
            time: self.time.clone(),
            deletes: prune(deletes),
            inserts: prune(inserts),
        })
    }
}

fn collect(parts: Vec<Reified>) -> BTreeMap<Triple, BTreeSet<Tid>> {
    let mut map: BTreeMap<Triple, BTreeSet<Tid>> = BTreeMap::new();
    for part in parts {
        map.entry(part.triple).or_default().extend(part.tids);
    }
    map
}

fn reify(map: &BTreeMap<Triple, BTreeSet<Tid>>) -> Vec<Reified> {
    map.iter()
        .map(|(triple, tids)| Reified {
            triple: triple.clone(),
            tids: tids.clone(),
        })
        .collect()
}

fn prune(mut map: BTreeMap<Triple, BTreeSet<Tid>>) -> BTreeMap<Triple, BTreeSet<Tid>> {
    map.retain(|_, tids| !tids.is_empty());
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::triple::{Iri, Term};

    fn triple(name: &str) -> Triple {
        Triple::new(
            Iri::new(format!("http://test/{name}")).unwrap(),
            Iri::new("http://test/#name").unwrap(),
            Term::string(name),
        )
    }

    #[test]
    fn single_operation_covers_one_tick() {
        let time = TreeClock::genesis().ticked();
        let op = Operation::single(time.clone(), BTreeMap::new(), [triple("fred")]);
        assert_eq!(op.from(), 1);
        assert!(!op.is_fused());
        assert_eq!(op.tid(), time.hash());
        assert_eq!(op.insert_tids(), BTreeSet::from([time.hash()]));
    }

    #[test]
    fn fuse_requires_contiguity_and_source() {
        let t1 = TreeClock::genesis().ticked();
        let t2 = t1.ticked();
        let t3 = t2.ticked();
        let op1 = Operation::single(t1.clone(), BTreeMap::new(), [triple("fred")]);
        let op3 = Operation::single(t3, BTreeMap::new(), [triple("barney")]);
        assert!(matches!(
            op1.fuse(&op3),
            Err(OperationError::NotContiguous { expected: 2, got: 3 })
        ));

        let (_, other) = t1.forked();
        let foreign = Operation::single(other.ticked(), BTreeMap::new(), [triple("x")]);
        assert!(matches!(
            op1.fuse(&foreign),
            Err(OperationError::DifferentSource)
        ));
    }

    #[test]
    fn fuse_preserves_constituent_tids() {
        let t1 = TreeClock::genesis().ticked();
        let t2 = t1.ticked();
        let op1 = Operation::single(t1.clone(), BTreeMap::new(), [triple("wilma")]);
        let op2 = Operation::single(t2.clone(), BTreeMap::new(), [triple("barney")]);

        let fused = op1.fuse(&op2).unwrap();
        assert_eq!(fused.from(), 1);
        assert_eq!(fused.time().ticks(), 2);
        assert!(fused.is_fused());
        assert_eq!(
            fused.insert_tids(),
            BTreeSet::from([t1.hash(), t2.hash()])
        );
    }

    #[test]
    fn fuse_cancels_internal_insert_delete_pairs() {
        let t1 = TreeClock::genesis().ticked();
        let t2 = t1.ticked();
        let op1 = Operation::single(t1.clone(), BTreeMap::new(), [triple("wilma")]);
        let deletes = BTreeMap::from([(triple("wilma"), BTreeSet::from([t1.hash()]))]);
        let op2 = Operation::single(t2, deletes, []);

        let fused = op1.fuse(&op2).unwrap();
        assert!(fused.is_empty());
    }

    #[test]
    fn cut_drops_reflected_inserts_and_keeps_the_tail() {
        let t1 = TreeClock::genesis().ticked();
        let t2 = t1.ticked();
        let op1 = Operation::single(t1.clone(), BTreeMap::new(), [triple("wilma")]);
        let op2 = Operation::single(t2.clone(), BTreeMap::new(), [triple("barney")]);
        let fused = op1.fuse(&op2).unwrap();

        let residue = fused.cut(&op1).unwrap();
        assert_eq!(residue.from(), 2);
        assert_eq!(residue.insert_tids(), BTreeSet::from([t2.hash()]));
        assert!(residue.deletes().next().is_none());
    }

    #[test]
    fn cut_surfaces_cancelled_inserts_as_deletes() {
        // op1 inserted wilma; op2 deleted it again. The fusion carries
        // neither, but a receiver that applied op1 must still withdraw.
        let t1 = TreeClock::genesis().ticked();
        let t2 = t1.ticked();
        let op1 = Operation::single(t1.clone(), BTreeMap::new(), [triple("wilma")]);
        let deletes = BTreeMap::from([(triple("wilma"), BTreeSet::from([t1.hash()]))]);
        let op2 = Operation::single(t2, deletes, []);
        let fused = op1.fuse(&op2).unwrap();

        let residue = fused.cut(&op1).unwrap();
        assert_eq!(residue.from(), 2);
        let (withdrawn, tids) = residue.deletes().next().unwrap();
        assert_eq!(*withdrawn, triple("wilma"));
        assert_eq!(*tids, BTreeSet::from([t1.hash()]));
        assert!(residue.inserts().next().is_none());
    }

    #[test]
    fn wire_parts_round_trip() {
        let t1 = TreeClock::genesis().ticked();
        let t2 = t1.ticked();
        let op1 = Operation::single(t1, BTreeMap::new(), [triple("wilma")]);
        let op2 = Operation::single(t2, BTreeMap::new(), [triple("barney")]);
        let fused = op1.fuse(&op2).unwrap();

        let rebuilt = Operation::from_parts(
            fused.version(),
            fused.from(),
            fused.time().clone(),
            fused.delete_parts(),
            fused.insert_parts(),
        )
        .unwrap();
        assert_eq!(rebuilt, fused);
    }

    #[test]
    fn from_parts_validates_version_and_range() {
        let time = TreeClock::genesis().ticked();
        assert!(matches!(
            Operation::from_parts(1, 1, time.clone(), Vec::new(), Vec::new()),
            Err(OperationError::BadVersion { got: 1 })
        ));
        assert!(matches!(
            Operation::from_parts(OPERATION_VERSION, 5, time, Vec::new(), Vec::new()),
            Err(OperationError::BadRange { from: 5, ticks: 1 })
        ));
    }
}
