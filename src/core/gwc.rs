//! Global wall clock: the merged view of the latest known time per
//! process identity.
//!
//! Produced by update-merging every operation time this clone has
//! reflected. Answers two questions: what was the previous tick of a
//! remote source (for fusion and stale-cut checks), and which transaction
//! id was last seen from each source.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::clock::{PathKey, Tid, TreeClock};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalClock {
    /// Union of all observed times, id markers scrubbed by `update`.
    merged: Option<TreeClock>,
    /// Last observed transaction id per source identity.
    latest: BTreeMap<PathKey, Tid>,
}

impl GlobalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an operation time into the view.
    pub fn observe(&mut self, time: &TreeClock) {
        self.merged = Some(match self.merged.take() {
            Some(merged) => merged.update(time),
            None => time.clone(),
        });
        self.latest.insert(time.id_path(), time.hash());
    }

    /// Latest tick reflected for the identity at `path`.
    ///
    /// Each source only ever advances its own counters, so the merged
    /// view's reading along the source's path is exactly the last tick
    /// this clone reflected from it.
    pub fn ticks_for(&self, path: &PathKey) -> u64 {
        self.merged
            .as_ref()
            .map(|merged| merged.seen_along(path))
            .unwrap_or(0)
    }

    /// Last transaction id reflected for the identity at `path`.
    pub fn tid_for(&self, path: &PathKey) -> Option<Tid> {
        self.latest.get(path).copied()
    }

    /// True iff an operation stamped with `time` is already covered: its
    /// source's counters are all at or below what this clone has seen.
    pub fn is_reflected(&self, time: &TreeClock) -> bool {
        self.ticks_for(&time.id_path()) >= time.ticks()
    }

    /// True iff `tid` is the latest reflected operation of some source.
    pub fn holds_tid(&self, tid: &Tid) -> bool {
        self.latest.values().any(|held| held == tid)
    }

    /// All identities with a reflected operation, most recent tid each.
    pub fn sources(&self) -> impl Iterator<Item = (&PathKey, &Tid)> {
        self.latest.iter()
    }

    /// The union of all observed times, if any have been observed.
    pub fn merged_time(&self) -> Option<&TreeClock> {
        self.merged.as_ref()
    }

    /// Merge another view into this one (snapshot ingestion).
    pub fn merge(&mut self, other: &GlobalClock) {
        if let Some(theirs) = &other.merged {
            self.merged = Some(match self.merged.take() {
                Some(merged) => merged.update(theirs),
                None => theirs.clone(),
            });
        }
        for (path, tid) in &other.latest {
            self.latest.insert(path.clone(), *tid);
        }
    }
}
