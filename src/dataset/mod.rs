//! SU-Set dataset: the replicated graph store.
//!
//! Every asserted triple is stored with the set of transaction ids that
//! asserted it; a triple is visible iff that set is non-empty. Local
//! writes withdraw resolved triples and assert new ones under a fresh
//! transaction id. Remote operations are applied under the joined clock,
//! with duplicate rejection against the global wall clock and stale-cut
//! for partially-reflected fusions.

pub mod constraint;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::core::clock::{Tid, TreeClock};
use crate::core::encoding::{self, DecodeError, EncodeError, OperationEncoder};
use crate::core::gwc::GlobalClock;
use crate::core::operation::{Operation, OperationError, Reified};
use crate::core::triple::{
    Context, Iri, Patch, Subject, Triple, TripleError, TriplePattern, subjects_of,
};
use crate::journal::kvs::{Batch, Kvs, KvsError};
use crate::journal::{Journal, JournalError};
use constraint::{Constraint, ConstraintError, InterimUpdate};

const DOMAIN_KEY: &[u8] = b"domain";
const LOCK_KEY: &[u8] = b"lock";
const TRIPLE_PREFIX: &str = "spo:";
const TID_INDEX_PREFIX: &str = "tid:";

/// Triples per snapshot data batch.
const SNAPSHOT_BATCH_TRIPLES: usize = 1000;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DatasetError {
    #[error(transparent)]
    Triple(#[from] TripleError),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error(transparent)]
    Kvs(#[from] KvsError),
    #[error(transparent)]
    Constraint(#[from] ConstraintError),
    #[error("dataset for domain `{domain}` is already in use")]
    InUse { domain: String },
    #[error("stored domain `{stored}` does not match configured domain `{configured}`")]
    DomainMismatch { stored: String, configured: String },
    #[error("dataset is not initialised")]
    NotInitialised,
    #[error("dataset corrupt: {reason}")]
    Corruption { reason: String },
}

impl DatasetError {
    fn corrupt(reason: impl Into<String>) -> Self {
        DatasetError::Corruption {
            reason: reason.into(),
        }
    }
}

/// A user-visible update, emitted after the journal commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    pub tid: Tid,
    /// The engine's tick count at commit.
    pub ticks: u64,
    pub deletes: Vec<Triple>,
    pub inserts: Vec<Triple>,
}

/// Outcome of applying a remote operation.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// The user-visible update, absent for no-ops and duplicates.
    pub update: Option<Update>,
    /// A constraint-corrective local operation to publish.
    pub echo: Option<(Operation, Update)>,
}

/// Read access to the visible graph for constraints and queries.
pub struct StateView<'a> {
    graph: &'a BTreeMap<Triple, BTreeSet<Tid>>,
}

impl<'a> StateView<'a> {
    pub fn new(graph: &'a BTreeMap<Triple, BTreeSet<Tid>>) -> Self {
        Self { graph }
    }

    pub fn contains(&self, triple: &Triple) -> bool {
        self.graph.contains_key(triple)
    }

    pub fn matching(&self, pattern: &TriplePattern) -> Vec<Triple> {
        self.graph
            .keys()
            .filter(|triple| pattern.matches(triple))
            .cloned()
            .collect()
    }
}

/// One batch of snapshot data: reified triples with their asserting ids.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotBatch {
    pub triples: Vec<Reified>,
}

/// A dataset snapshot: the global wall clock, the reified graph in
/// batches, and the most recent operation per known source (so a revved-up
/// receiver can resolve stale-cuts).
///
/// The batch sequence is finite and non-restartable; consume it fully.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub gwc: GlobalClock,
    pub batches: Vec<SnapshotBatch>,
    pub last_ops: Vec<Operation>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredTriple {
    triple: Triple,
    tids: BTreeSet<Tid>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct LockMarker {
    pid: u32,
    instance: String,
}

pub struct SuSetDataset {
    kvs: Box<dyn Kvs>,
    domain: String,
    context: Context,
    encoder: OperationEncoder,
    journal: Option<Journal>,
    graph: BTreeMap<Triple, BTreeSet<Tid>>,
    constraints: Vec<Box<dyn Constraint>>,
    locked: bool,
}

impl SuSetDataset {
    /// Open the dataset, asserting exclusive ownership via the stored
    /// lock marker and checking the stored domain name.
    pub fn open(
        mut kvs: Box<dyn Kvs>,
        domain: &str,
        context: Context,
        max_operation_size: Option<usize>,
        compress_threshold: usize,
        constraints: Vec<Box<dyn Constraint>>,
    ) -> Result<Self, DatasetError> {
        if kvs.get(LOCK_KEY)?.is_some() {
            return Err(DatasetError::InUse {
                domain: domain.to_string(),
            });
        }
        if let Some(stored) = kvs.get(DOMAIN_KEY)? {
            let stored = String::from_utf8(stored)
                .map_err(|_| DatasetError::corrupt("domain marker is not utf-8"))?;
            if stored != domain {
                return Err(DatasetError::DomainMismatch {
                    stored,
                    configured: domain.to_string(),
                });
            }
        }

        let marker = LockMarker {
            pid: std::process::id(),
            instance: Uuid::new_v4().to_string(),
        };
        let mut batch = Batch::new();
        batch.put(
            LOCK_KEY.to_vec(),
            serde_json::to_vec(&marker).expect("marker renders"),
        );
        batch.put(DOMAIN_KEY.to_vec(), domain.as_bytes().to_vec());
        kvs.write(batch)?;

        let encoder = OperationEncoder::new(context.clone(), max_operation_size, compress_threshold);
        let journal = Journal::load(&*kvs, encoder.clone())?;
        let graph = load_graph(&*kvs)?;
        info!(
            domain,
            initialised = journal.is_some(),
            triples = graph.len(),
            "dataset opened"
        );
        Ok(Self {
            kvs,
            domain: domain.to_string(),
            context,
            encoder,
            journal,
            graph,
            constraints,
            locked: true,
        })
    }

    /// True iff the dataset holds domain data (a journal exists).
    pub fn is_initialised(&self) -> bool {
        self.journal.is_some()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn time(&self) -> Result<&TreeClock, DatasetError> {
        Ok(self.journal()?.time())
    }

    pub fn gwc(&self) -> Result<&GlobalClock, DatasetError> {
        Ok(self.journal()?.gwc())
    }

    /// Initialise an empty dataset at `time` (genesis, or a clock newly
    /// forked from a peer).
    pub fn bootstrap(&mut self, time: TreeClock) -> Result<(), DatasetError> {
        if self.journal.is_some() {
            return Err(DatasetError::corrupt("bootstrap of an initialised dataset"));
        }
        self.journal = Some(Journal::bootstrap(
            &mut *self.kvs,
            self.encoder.clone(),
            time,
        )?);
        Ok(())
    }

    /// Persist a clock movement that commits no entry (fork, no-op join).
    pub fn save_time(&mut self, time: &TreeClock) -> Result<(), DatasetError> {
        let journal = self.journal.as_mut().ok_or(DatasetError::NotInitialised)?;
        journal.save_time(&mut *self.kvs, time)?;
        Ok(())
    }

    /// Execute a local write transaction.
    ///
    /// Returns `None` for an empty update: no tick, no entry, no
    /// emission. On any error the store is left unchanged.
    pub fn transact(
        &mut self,
        patch: &Patch,
        tick: impl FnOnce() -> TreeClock,
    ) -> Result<Option<(Operation, Update)>, DatasetError> {
        self.transact_inner(patch, tick, true)
    }

    fn transact_inner(
        &mut self,
        patch: &Patch,
        tick: impl FnOnce() -> TreeClock,
        check_constraints: bool,
    ) -> Result<Option<(Operation, Update)>, DatasetError> {
        self.journal()?;

        // Resolve delete patterns to concrete triples with their tids.
        let mut resolved: BTreeMap<Triple, BTreeSet<Tid>> = BTreeMap::new();
        for pattern in &patch.deletes {
            for (triple, tids) in self.graph.iter().filter(|(t, _)| pattern.matches(t)) {
                resolved.insert(triple.clone(), tids.clone());
            }
        }
        let mut inserts: BTreeSet<Triple> = patch.inserts.iter().cloned().collect();

        if check_constraints && !self.constraints.is_empty() {
            let mut interim = InterimUpdate::new(
                resolved.keys().cloned().collect(),
                inserts.iter().cloned().collect(),
            );
            let state = StateView::new(&self.graph);
            for constraint in &self.constraints {
                constraint.check(&state, &mut interim)?;
            }
            let (asserted_deletes, asserted_inserts) = interim.into_assertions();
            for pattern in &asserted_deletes {
                for (triple, tids) in self.graph.iter().filter(|(t, _)| pattern.matches(t)) {
                    resolved.insert(triple.clone(), tids.clone());
                }
            }
            inserts.extend(asserted_inserts);
        }

        if resolved.is_empty() && inserts.is_empty() {
            return Ok(None);
        }

        let time = tick();
        let op = Operation::single(time.clone(), resolved.clone(), inserts.iter().cloned());

        // Size gate before any mutation: an abort leaves the store
        // unchanged.
        self.encoder.encode(&op)?;

        let journal = self.journal.as_ref().expect("journal checked above");
        let staged = journal.stage_commit(&*self.kvs, &op, &time)?;
        let mut batch = staged.batch;

        let mut update_deletes = Vec::new();
        for (triple, tids) in &resolved {
            if self.withdraw(&mut batch, triple, tids) {
                update_deletes.push(triple.clone());
            }
        }
        let tid = op.tid();
        let mut update_inserts = Vec::new();
        for triple in &inserts {
            if self.assert(&mut batch, triple, &BTreeSet::from([tid])) {
                update_inserts.push(triple.clone());
            }
        }

        self.kvs.write(batch)?;
        self.journal
            .as_mut()
            .expect("journal checked above")
            .complete(staged.state);

        let update = Update {
            tid,
            ticks: time.ticks(),
            deletes: update_deletes,
            inserts: update_inserts,
        };
        debug!(
            tid = %tid,
            ticks = update.ticks,
            deletes = update.deletes.len(),
            inserts = update.inserts.len(),
            "committed local transaction"
        );
        Ok(Some((op, update)))
    }

    /// Apply a remote operation under the joined clock.
    ///
    /// `joined` is the local clock after joining the operation time;
    /// `tick` advances it, called once if the operation commits and once
    /// more if a constraint emits a corrective operation.
    pub fn apply(
        &mut self,
        op: &Operation,
        joined: &TreeClock,
        mut tick: impl FnMut() -> TreeClock,
    ) -> Result<ApplyOutcome, DatasetError> {
        // Duplicate: every tick of this operation is already reflected.
        if self.journal()?.gwc().is_reflected(op.time()) {
            trace!(tid = %op.tid(), "dropping fully-reflected operation");
            self.save_time(joined)?;
            return Ok(ApplyOutcome::default());
        }

        // Stale-cut: remove the already-reflected prefix of a fusion.
        // Every stored operation of this source overlapping the incoming
        // range is cut out, so a triple deleted concurrently can never be
        // resurrected by re-applying its original insert.
        let source = op.source();
        let seen_ticks = self.journal()?.gwc().ticks_for(&source);
        let mut effective = op.clone();
        if effective.from() <= seen_ticks {
            let journal = self.journal()?;
            let seen_tid = journal.gwc().tid_for(&source).ok_or_else(|| {
                DatasetError::corrupt(format!("gwc has ticks but no tid for {source}"))
            })?;
            let seen_ops =
                journal.source_ops_back_to(&*self.kvs, &source, effective.from(), &seen_tid)?;
            debug!(
                tid = %op.tid(),
                from = op.from(),
                seen = seen_ticks,
                cuts = seen_ops.len(),
                "cutting reflected prefix from fusion"
            );
            for seen in &seen_ops {
                effective = effective.cut(seen)?;
            }
        }

        if effective.is_empty() {
            // No-op: no entry, no emission; the joined clock still holds.
            self.save_time(joined)?;
            return Ok(ApplyOutcome::default());
        }

        let local_time = tick();
        let journal = self.journal.as_ref().expect("journal checked above");
        let staged = journal.stage_commit(&*self.kvs, &effective, &local_time)?;
        let mut batch = staged.batch;

        let mut update_deletes = Vec::new();
        for (triple, tids) in effective.deletes() {
            if self.withdraw(&mut batch, triple, tids) {
                update_deletes.push(triple.clone());
            }
        }
        let mut update_inserts = Vec::new();
        for (triple, tids) in effective.inserts() {
            if self.assert(&mut batch, triple, tids) {
                update_inserts.push(triple.clone());
            }
        }

        self.kvs.write(batch)?;
        self.journal
            .as_mut()
            .expect("journal checked above")
            .complete(staged.state);

        let update = Update {
            tid: effective.tid(),
            ticks: local_time.ticks(),
            deletes: update_deletes,
            inserts: update_inserts,
        };
        debug!(
            tid = %update.tid,
            deletes = update.deletes.len(),
            inserts = update.inserts.len(),
            "applied remote operation"
        );

        // Constraints may emit one corrective local operation.
        let mut corrective = Patch::default();
        {
            let state = StateView::new(&self.graph);
            for constraint in &self.constraints {
                if let Some(patch) = constraint.apply(&state, &update.deletes, &update.inserts)? {
                    corrective.deletes.extend(patch.deletes);
                    corrective.inserts.extend(patch.inserts);
                }
            }
        }
        let echo = if corrective.is_empty() {
            None
        } else {
            self.transact_inner(&corrective, &mut tick, false)?
        };

        Ok(ApplyOutcome {
            update: Some(update),
            echo,
        })
    }

    /// Emit the dataset as a snapshot.
    pub fn take_snapshot(&self) -> Result<Snapshot, DatasetError> {
        let journal = self.journal()?;
        let gwc = journal.gwc().clone();

        let mut batches = Vec::new();
        let mut current = Vec::new();
        for (triple, tids) in &self.graph {
            current.push(Reified {
                triple: triple.clone(),
                tids: tids.clone(),
            });
            if current.len() == SNAPSHOT_BATCH_TRIPLES {
                batches.push(SnapshotBatch {
                    triples: std::mem::take(&mut current),
                });
            }
        }
        if !current.is_empty() {
            batches.push(SnapshotBatch { triples: current });
        }

        let mut last_ops = Vec::new();
        for (_, tid) in gwc.sources() {
            if let Some(op) = journal.operation(&*self.kvs, tid)? {
                last_ops.push(op);
            }
        }

        Ok(Snapshot {
            gwc,
            batches,
            last_ops,
        })
    }

    /// Replace local graph and clock with a snapshot's content.
    ///
    /// Snapshot triples are opaque assertions: constraints do not run over
    /// them, so re-applying derivation rules on the receiver cannot
    /// double-count.
    pub fn apply_snapshot(
        &mut self,
        snapshot: &Snapshot,
        new_time: TreeClock,
    ) -> Result<(), DatasetError> {
        // Wipe any replicated state an outdated dataset may hold.
        let mut wipe = Batch::new();
        for prefix in [
            TRIPLE_PREFIX.as_bytes(),
            TID_INDEX_PREFIX.as_bytes(),
            b"tick:".as_slice(),
            b"op:".as_slice(),
            b"cov:".as_slice(),
        ] {
            for (key, _) in self.kvs.scan_prefix(prefix)? {
                wipe.delete(key);
            }
        }
        wipe.delete(b"journal".to_vec());
        self.kvs.write(wipe)?;
        self.graph.clear();
        self.journal = None;

        self.journal = Some(Journal::bootstrap_with(
            &mut *self.kvs,
            self.encoder.clone(),
            new_time,
            snapshot.gwc.clone(),
            &snapshot.last_ops,
        )?);

        let mut batch = Batch::new();
        for data in &snapshot.batches {
            for part in &data.triples {
                self.assert(&mut batch, &part.triple, &part.tids);
            }
        }
        self.kvs.write(batch)?;
        info!(
            domain = %self.domain,
            triples = self.graph.len(),
            "applied snapshot"
        );
        Ok(())
    }

    /// Operations to replay for a peer at `time`; `None` if `time`
    /// precedes retained history and the peer must snapshot instead.
    pub fn operations_since(
        &self,
        time: &TreeClock,
    ) -> Result<Option<Vec<Operation>>, DatasetError> {
        Ok(self.journal()?.operations_since(&*self.kvs, time)?)
    }

    /// All properties of one subject, or `None` if nothing is asserted.
    pub fn describe(&self, id: &Iri) -> Option<Subject> {
        let triples: Vec<Triple> = self
            .graph
            .keys()
            .filter(|triple| triple.subject == *id)
            .cloned()
            .collect();
        if triples.is_empty() {
            return None;
        }
        subjects_of(triples).remove(id)
    }

    pub fn view(&self) -> StateView<'_> {
        StateView::new(&self.graph)
    }

    /// Release the ownership marker. The dataset is unusable afterwards.
    pub fn close(&mut self) -> Result<(), DatasetError> {
        if self.locked {
            let mut batch = Batch::new();
            batch.delete(LOCK_KEY.to_vec());
            self.kvs.write(batch)?;
            self.locked = false;
        }
        Ok(())
    }

    fn journal(&self) -> Result<&Journal, DatasetError> {
        self.journal.as_ref().ok_or(DatasetError::NotInitialised)
    }

    /// Withdraw `tids` from a triple; returns true if the triple became
    /// invisible.
    fn withdraw(&mut self, batch: &mut Batch, triple: &Triple, tids: &BTreeSet<Tid>) -> bool {
        let Some(held) = self.graph.get_mut(triple) else {
            return false;
        };
        let key = triple.content_key();
        let mut removed_any = false;
        for tid in tids {
            if held.remove(tid) {
                removed_any = true;
                batch.delete(tid_index_key(tid, &key));
            }
        }
        if !removed_any {
            return false;
        }
        if held.is_empty() {
            self.graph.remove(triple);
            batch.delete(triple_key(&key));
            true
        } else {
            stage_triple(batch, triple, held);
            false
        }
    }

    /// Add `tids` to a triple; returns true if the triple became visible.
    fn assert(&mut self, batch: &mut Batch, triple: &Triple, tids: &BTreeSet<Tid>) -> bool {
        let held = self.graph.entry(triple.clone()).or_default();
        let was_invisible = held.is_empty();
        let key = triple.content_key();
        let mut added_any = false;
        for tid in tids {
            if held.insert(*tid) {
                added_any = true;
                batch.put(tid_index_key(tid, &key), Vec::new());
            }
        }
        if added_any {
            stage_triple(batch, triple, held);
        }
        was_invisible && added_any
    }
}

impl Drop for SuSetDataset {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn triple_key(content_key: &str) -> Vec<u8> {
    format!("{TRIPLE_PREFIX}{content_key}").into_bytes()
}

fn tid_index_key(tid: &Tid, content_key: &str) -> Vec<u8> {
    format!("{TID_INDEX_PREFIX}{tid}:{content_key}").into_bytes()
}

fn stage_triple(batch: &mut Batch, triple: &Triple, tids: &BTreeSet<Tid>) {
    let stored = StoredTriple {
        triple: triple.clone(),
        tids: tids.clone(),
    };
    let value = serde_json::to_value(&stored).expect("stored triple renders");
    let bytes = encoding::to_cbor(&value).expect("stored triple encodes");
    batch.put(triple_key(&triple.content_key()), bytes);
}

fn load_graph(kvs: &dyn Kvs) -> Result<BTreeMap<Triple, BTreeSet<Tid>>, DatasetError> {
    let mut graph = BTreeMap::new();
    for (_, bytes) in kvs.scan_prefix(TRIPLE_PREFIX.as_bytes())? {
        let value = encoding::from_cbor(&bytes)?;
        let stored: StoredTriple = serde_json::from_value(value)
            .map_err(|err| DatasetError::corrupt(format!("bad triple record: {err}")))?;
        graph.insert(stored.triple, stored.tids);
    }
    Ok(graph)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::triple::Term;
    use crate::journal::kvs::MemoryKvs;

    fn ctx() -> Context {
        Context::for_domain("test.example.org")
    }

    fn open(kvs: Box<dyn Kvs>) -> SuSetDataset {
        SuSetDataset::open(kvs, "test.example.org", ctx(), None, 1024, Vec::new()).unwrap()
    }

    fn genesis_dataset() -> (SuSetDataset, TreeClock) {
        let mut dataset = open(Box::new(MemoryKvs::new()));
        let time = TreeClock::genesis();
        dataset.bootstrap(time.clone()).unwrap();
        (dataset, time)
    }

    fn triple(name: &str, value: &str) -> Triple {
        Triple::new(
            ctx().expand_id(name).unwrap(),
            ctx().expand_property("name").unwrap(),
            Term::string(value),
        )
    }

    fn insert_patch(name: &str, value: &str) -> Patch {
        Patch {
            deletes: Vec::new(),
            inserts: vec![triple(name, value)],
        }
    }

    #[test]
    fn open_rejects_double_ownership() {
        let mut kvs = MemoryKvs::new();
        let marker = LockMarker {
            pid: 1,
            instance: "x".to_string(),
        };
        let mut batch = Batch::new();
        batch.put(LOCK_KEY.to_vec(), serde_json::to_vec(&marker).unwrap());
        kvs.write(batch).unwrap();

        let result = SuSetDataset::open(
            Box::new(kvs),
            "test.example.org",
            ctx(),
            None,
            1024,
            Vec::new(),
        );
        assert!(matches!(result, Err(DatasetError::InUse { .. })));
    }

    #[test]
    fn open_rejects_domain_mismatch() {
        let mut kvs = MemoryKvs::new();
        let mut batch = Batch::new();
        batch.put(DOMAIN_KEY.to_vec(), b"other.example.org".to_vec());
        kvs.write(batch).unwrap();

        let result = SuSetDataset::open(
            Box::new(kvs),
            "test.example.org",
            ctx(),
            None,
            1024,
            Vec::new(),
        );
        assert!(matches!(result, Err(DatasetError::DomainMismatch { .. })));
    }

    #[test]
    fn close_releases_ownership() {
        let mut dataset = open(Box::new(MemoryKvs::new()));
        dataset.close().unwrap();
        // Reopening over the same backend is normally a new process; here
        // we just assert the marker is gone.
        assert!(dataset.kvs.get(LOCK_KEY).unwrap().is_none());
    }

    #[test]
    fn transact_inserts_and_describes() {
        let (mut dataset, time) = genesis_dataset();
        let mut clock = time;
        let (op, update) = dataset
            .transact(&insert_patch("fred", "Fred"), || {
                clock = clock.ticked();
                clock.clone()
            })
            .unwrap()
            .unwrap();

        assert_eq!(update.ticks, 1);
        assert_eq!(op.tid(), update.tid);
        assert_eq!(update.inserts, vec![triple("fred", "Fred")]);
        let subject = dataset.describe(&ctx().expand_id("fred").unwrap()).unwrap();
        let rendered = subject.to_json(&ctx());
        assert_eq!(rendered["@id"], "fred");
        assert_eq!(rendered["name"], "Fred");
    }

    #[test]
    fn empty_transaction_is_a_no_op() {
        let (mut dataset, _) = genesis_dataset();
        let outcome = dataset
            .transact(&Patch::default(), || unreachable!("no tick for empty op"))
            .unwrap();
        assert!(outcome.is_none());

        // A delete matching nothing is also empty.
        let patch = Patch {
            deletes: vec![TriplePattern {
                subject: Some(ctx().expand_id("nobody").unwrap()),
                predicate: None,
                object: None,
            }],
            inserts: Vec::new(),
        };
        assert!(dataset.transact(&patch, || unreachable!()).unwrap().is_none());
    }

    #[test]
    fn delete_withdraws_resolved_tids() {
        let (mut dataset, time) = genesis_dataset();
        let mut clock = time;
        let mut tick = || {
            clock = clock.ticked();
            clock.clone()
        };
        dataset
            .transact(&insert_patch("fred", "Fred"), &mut tick)
            .unwrap();

        let patch = Patch {
            deletes: vec![TriplePattern {
                subject: Some(ctx().expand_id("fred").unwrap()),
                predicate: None,
                object: None,
            }],
            inserts: Vec::new(),
        };
        let (op, update) = dataset.transact(&patch, &mut tick).unwrap().unwrap();
        assert_eq!(update.deletes, vec![triple("fred", "Fred")]);
        let (_, tids) = op.deletes().next().unwrap();
        assert_eq!(tids.len(), 1);
        assert!(dataset.describe(&ctx().expand_id("fred").unwrap()).is_none());
    }

    #[test]
    fn graph_reloads_from_storage() {
        // MemoryKvs is cloned into the dataset, so capture the mutated
        // state before dropping and replay it into a fresh backend.
        let persisted = {
            let mut dataset = open(Box::new(MemoryKvs::new()));
            dataset.bootstrap(TreeClock::genesis()).unwrap();
            let mut clock = TreeClock::genesis();
            dataset
                .transact(&insert_patch("fred", "Fred"), || {
                    clock = clock.ticked();
                    clock.clone()
                })
                .unwrap();
            dataset.kvs.scan_prefix(b"").unwrap()
        };

        let mut kvs = MemoryKvs::new();
        let mut batch = Batch::new();
        for (key, value) in persisted {
            batch.put(key, value);
        }
        // The captured state still holds the first open's lock marker;
        // clear it as a crashed-process recovery would.
        batch.delete(LOCK_KEY.to_vec());
        kvs.write(batch).unwrap();

        let dataset = open(Box::new(kvs));
        assert!(dataset.is_initialised());
        assert!(dataset.describe(&ctx().expand_id("fred").unwrap()).is_some());
        assert_eq!(dataset.time().unwrap().ticks(), 1);
    }

    #[test]
    fn apply_inserts_remote_subject() {
        let (mut dataset, genesis) = genesis_dataset();
        let (local, remote) = genesis.forked();
        dataset.save_time(&local).unwrap();

        let remote_time = remote.ticked();
        let op = Operation::single(
            remote_time.clone(),
            BTreeMap::new(),
            [triple("fred", "Fred")],
        );
        let joined = local.update(&remote_time);
        let mut local_clock = joined.clone();
        let outcome = dataset
            .apply(&op, &joined, || {
                local_clock = local_clock.ticked();
                local_clock.clone()
            })
            .unwrap();

        let update = outcome.update.unwrap();
        assert_eq!(update.inserts, vec![triple("fred", "Fred")]);
        assert!(outcome.echo.is_none());
        assert!(dataset.describe(&ctx().expand_id("fred").unwrap()).is_some());
        // Joined once, ticked once.
        assert_eq!(dataset.time().unwrap().ticks(), 2);
    }

    #[test]
    fn apply_rejects_duplicates() {
        let (mut dataset, genesis) = genesis_dataset();
        let (local, remote) = genesis.forked();
        dataset.save_time(&local).unwrap();

        let remote_time = remote.ticked();
        let op = Operation::single(
            remote_time.clone(),
            BTreeMap::new(),
            [triple("fred", "Fred")],
        );
        let joined = local.update(&remote_time);
        let mut local_clock = joined.clone();
        let mut tick = || {
            local_clock = local_clock.ticked();
            local_clock.clone()
        };
        dataset.apply(&op, &joined, &mut tick).unwrap();
        let again = dataset.apply(&op, &joined, &mut tick).unwrap();
        assert!(again.update.is_none());
        // Exactly one assertion of the triple survives.
        let held = dataset.graph.get(&triple("fred", "Fred")).unwrap();
        assert_eq!(held.len(), 1);
    }

    #[test]
    fn apply_empty_operation_only_joins() {
        let (mut dataset, genesis) = genesis_dataset();
        let (local, remote) = genesis.forked();
        dataset.save_time(&local).unwrap();

        let remote_time = remote.ticked();
        let op = Operation::single(remote_time.clone(), BTreeMap::new(), []);
        let joined = local.update(&remote_time);
        let outcome = dataset
            .apply(&op, &joined, || unreachable!("no tick for a no-op"))
            .unwrap();
        assert!(outcome.update.is_none());
        assert_eq!(dataset.time().unwrap(), &joined);
        // No entry was committed.
        assert_eq!(dataset.journal().unwrap().state().tail_tick, 0);
    }

    #[test]
    fn remote_delete_by_tid_removes_the_triple() {
        let (mut dataset, time) = genesis_dataset();
        let mut clock = time;
        let (op, _) = dataset
            .transact(&insert_patch("fred", "Fred"), || {
                clock = clock.ticked();
                clock.clone()
            })
            .unwrap()
            .unwrap();

        // A third clone deletes using the insert's tid.
        let (local, remote) = clock.forked();
        dataset.save_time(&local).unwrap();
        let remote_time = remote.ticked();
        let deletes = BTreeMap::from([(triple("fred", "Fred"), BTreeSet::from([op.tid()]))]);
        let delete_op = Operation::single(remote_time.clone(), deletes, []);
        let joined = local.update(&remote_time);
        let mut local_clock = joined.clone();
        let outcome = dataset
            .apply(&delete_op, &joined, || {
                local_clock = local_clock.ticked();
                local_clock.clone()
            })
            .unwrap();

        assert_eq!(outcome.update.unwrap().deletes, vec![triple("fred", "Fred")]);
        assert!(dataset.describe(&ctx().expand_id("fred").unwrap()).is_none());
    }

    #[test]
    fn snapshot_round_trips_to_an_empty_store() {
        let (mut dataset, time) = genesis_dataset();
        let mut clock = time;
        let mut tick = || {
            clock = clock.ticked();
            clock.clone()
        };
        dataset
            .transact(&insert_patch("fred", "Fred"), &mut tick)
            .unwrap();
        dataset
            .transact(&insert_patch("wilma", "Wilma"), &mut tick)
            .unwrap();

        let snapshot = dataset.take_snapshot().unwrap();
        assert!(!snapshot.last_ops.is_empty());

        let (_, fork) = clock.forked();
        let mut receiver = open(Box::new(MemoryKvs::new()));
        receiver.apply_snapshot(&snapshot, fork).unwrap();

        assert_eq!(receiver.graph, dataset.graph);
        assert!(receiver.describe(&ctx().expand_id("fred").unwrap()).is_some());
        assert!(receiver.describe(&ctx().expand_id("wilma").unwrap()).is_some());
    }

    #[test]
    fn stale_cut_keeps_concurrent_delete_effective() {
        // Scenario: source A fuses an insert of wilma (already applied
        // here, then deleted by a third clone) with an insert of barney.
        let kvs = MemoryKvs::new();
        let mut dataset = open(Box::new(kvs));
        let genesis = TreeClock::genesis();
        let (a, rest) = genesis.forked();
        let (b, c) = rest.forked();
        dataset.bootstrap(b.clone()).unwrap();

        // A's first op: insert wilma.
        let a1 = a.ticked();
        let op_w = Operation::single(a1.clone(), BTreeMap::new(), [triple("wilma", "Wilma")]);
        let mut local = b.update(&a1);
        let mut local_clock = local.clone();
        let mut tick = || {
            local_clock = local_clock.ticked();
            local_clock.clone()
        };
        dataset.apply(&op_w, &local, &mut tick).unwrap();
        local = local_clock.clone();

        // C deletes wilma by W1.
        let c1 = c.update(&a1).ticked();
        let deletes = BTreeMap::from([(triple("wilma", "Wilma"), BTreeSet::from([op_w.tid()]))]);
        let op_del = Operation::single(c1.clone(), deletes, []);
        local = local.update(&c1);
        let mut local_clock = local.clone();
        let mut tick = || {
            local_clock = local_clock.ticked();
            local_clock.clone()
        };
        dataset.apply(&op_del, &local, &mut tick).unwrap();
        local = local_clock.clone();
        assert!(dataset.describe(&ctx().expand_id("wilma").unwrap()).is_none());

        // A's fusion: wilma (W1, already reflected) + barney (new).
        let a2 = a1.ticked();
        let op_b = Operation::single(a2.clone(), BTreeMap::new(), [triple("barney", "Barney")]);
        let fused = op_w.fuse(&op_b).unwrap();
        local = local.update(&a2);
        let mut local_clock = local.clone();
        let outcome = dataset
            .apply(&fused, &local, || {
                local_clock = local_clock.ticked();
                local_clock.clone()
            })
            .unwrap();

        // wilma stays deleted; barney appears.
        assert!(dataset.describe(&ctx().expand_id("wilma").unwrap()).is_none());
        assert!(dataset.describe(&ctx().expand_id("barney").unwrap()).is_some());
        let update = outcome.update.unwrap();
        assert_eq!(update.inserts, vec![triple("barney", "Barney")]);
    }

    #[test]
    fn stale_cut_handles_interleaved_history() {
        // The local journal interleaves another source's delete between
        // two operations of the fusion's source; the cut must still cover
        // every reflected tick, or the deleted triple would resurrect.
        let mut dataset = open(Box::new(MemoryKvs::new()));
        let genesis = TreeClock::genesis();
        let (a, rest) = genesis.forked();
        let (b, c) = rest.forked();
        dataset.bootstrap(b.clone()).unwrap();

        let a1 = a.ticked();
        let op1 = Operation::single(a1.clone(), BTreeMap::new(), [triple("wilma", "Wilma")]);
        let a2 = a1.ticked();
        let op2 = Operation::single(a2.clone(), BTreeMap::new(), [triple("barney", "Barney")]);
        let a3 = a2.ticked();
        let op3 = Operation::single(a3.clone(), BTreeMap::new(), [triple("dino", "Dino")]);

        let mut local = b.clone();
        let mut apply = |dataset: &mut SuSetDataset, op: &Operation, local: &mut TreeClock| {
            *local = local.update(op.time());
            let joined = local.clone();
            let mut clock = joined.clone();
            let outcome = dataset
                .apply(op, &joined, || {
                    clock = clock.ticked();
                    clock.clone()
                })
                .unwrap();
            *local = clock;
            outcome
        };

        apply(&mut dataset, &op1, &mut local);
        // c deletes wilma concurrently with a's later writes.
        let c1 = c.update(&a1).ticked();
        let deletes = BTreeMap::from([(triple("wilma", "Wilma"), BTreeSet::from([op1.tid()]))]);
        let op_del = Operation::single(c1, deletes, []);
        apply(&mut dataset, &op_del, &mut local);
        apply(&mut dataset, &op2, &mut local);
        assert!(dataset.describe(&ctx().expand_id("wilma").unwrap()).is_none());

        // The fused range covers one reflected op on each side of the
        // interleaved delete, plus a new one.
        let fused = op1.fuse(&op2).unwrap().fuse(&op3).unwrap();
        let outcome = apply(&mut dataset, &fused, &mut local);

        assert!(dataset.describe(&ctx().expand_id("wilma").unwrap()).is_none());
        assert!(dataset.describe(&ctx().expand_id("barney").unwrap()).is_some());
        assert!(dataset.describe(&ctx().expand_id("dino").unwrap()).is_some());
        let update = outcome.update.unwrap();
        assert_eq!(update.inserts, vec![triple("dino", "Dino")]);
    }

    #[test]
    fn single_valued_constraint_corrects_remote_conflicts() {
        let kvs = MemoryKvs::new();
        let constraint: Box<dyn Constraint> = Box::new(constraint::SingleValued::new(
            ctx().expand_property("name").unwrap(),
        ));
        let mut dataset = SuSetDataset::open(
            Box::new(kvs),
            "test.example.org",
            ctx(),
            None,
            1024,
            vec![constraint],
        )
        .unwrap();
        let genesis = TreeClock::genesis();
        let (local, remote) = genesis.forked();
        dataset.bootstrap(local.clone()).unwrap();

        // Local write names fred.
        let mut clock = local.clone();
        let mut tick = || {
            clock = clock.ticked();
            clock.clone()
        };
        dataset
            .transact(&insert_patch("fred", "Fred"), &mut tick)
            .unwrap();
        let local_after = clock.clone();

        // A concurrent remote write names fred differently.
        let remote_time = remote.ticked();
        let op = Operation::single(
            remote_time.clone(),
            BTreeMap::new(),
            [triple("fred", "Frederick")],
        );
        let joined = local_after.update(&remote_time);
        let mut local_clock = joined.clone();
        let outcome = dataset
            .apply(&op, &joined, || {
                local_clock = local_clock.ticked();
                local_clock.clone()
            })
            .unwrap();

        // The constraint emitted a corrective operation deleting the
        // deterministic loser ("Fred" < "Frederick").
        let (echo_op, echo_update) = outcome.echo.expect("corrective operation");
        assert!(!echo_op.is_empty());
        assert_eq!(echo_update.deletes, vec![triple("fred", "Fred")]);
        let subject = dataset.describe(&ctx().expand_id("fred").unwrap()).unwrap();
        assert_eq!(subject.to_json(&ctx())["name"], "Frederick");
    }
}
