//! Tree clock: hierarchical logical time for forked process identities.
//!
//! A clock is a rooted binary tree of tick counters. Exactly one leaf
//! carries the identity of the owning process; forking splits that leaf in
//! two so a new participant gets its own counter without renumbering
//! anyone else. Ticking increments only the owner's counter; joining takes
//! the component-wise maximum.
//!
//! Clocks are immutable values. Every operation returns a new clock.

use std::cmp::Ordering;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Width of a transaction id in bytes (rendered as lowercase hex).
///
/// A wire-format constant, not a tunable limit: every replica of a
/// domain must truncate to the same width or transaction ids stop
/// comparing equal across clones.
pub const TID_WIDTH: usize = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClockError {
    #[error("time value cannot be parsed: {reason}")]
    BadClock { reason: String },
    #[error("transaction id `{raw}` is invalid")]
    BadTid { raw: String },
}

impl ClockError {
    fn bad(reason: impl Into<String>) -> Self {
        ClockError::BadClock {
            reason: reason.into(),
        }
    }
}

/// Transaction identifier: truncated content-hash of a tree clock value.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid([u8; TID_WIDTH]);

impl Tid {
    pub fn from_bytes(bytes: [u8; TID_WIDTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TID_WIDTH] {
        &self.0
    }

    pub fn parse(raw: &str) -> Result<Self, ClockError> {
        if raw.len() != TID_WIDTH * 2 {
            return Err(ClockError::BadTid {
                raw: raw.to_string(),
            });
        }
        let mut bytes = [0u8; TID_WIDTH];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&raw[i * 2..i * 2 + 2], 16).map_err(|_| {
                ClockError::BadTid {
                    raw: raw.to_string(),
                }
            })?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tid({self})")
    }
}

impl Serialize for Tid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Tid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Tid::parse(&raw).map_err(D::Error::custom)
    }
}

/// Path from the root to a node: `false` = left, `true` = right.
///
/// The empty path names the root. Rendered as a `0`/`1` string.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathKey(Vec<bool>);

impl PathKey {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn bits(&self) -> &[bool] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn parse(raw: &str) -> Result<Self, ClockError> {
        let mut bits = Vec::with_capacity(raw.len());
        for c in raw.chars() {
            match c {
                '0' => bits.push(false),
                '1' => bits.push(true),
                _ => return Err(ClockError::bad(format!("invalid path key `{raw}`"))),
            }
        }
        Ok(Self(bits))
    }

    fn push(&mut self, bit: bool) {
        self.0.push(bit);
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &bit in &self.0 {
            f.write_str(if bit { "1" } else { "0" })?;
        }
        Ok(())
    }
}

impl fmt::Debug for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathKey({self})")
    }
}

impl Serialize for PathKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PathKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        PathKey::parse(&raw).map_err(D::Error::custom)
    }
}

#[derive(Clone, PartialEq, Eq)]
struct ForkNode {
    left: TreeClock,
    right: TreeClock,
}

/// A tree clock value.
///
/// Equality is structural: same shape, same counters, same id path.
#[derive(Clone, PartialEq, Eq)]
pub struct TreeClock {
    ticks: u64,
    on_id: bool,
    fork: Option<Box<ForkNode>>,
}

impl TreeClock {
    /// The bootstrap clock of a new domain: a single id node at zero.
    pub fn genesis() -> Self {
        Self {
            ticks: 0,
            on_id: true,
            fork: None,
        }
    }

    /// True if this clock carries a process identity.
    pub fn has_id(&self) -> bool {
        self.on_id
    }

    /// Path from the root to the id leaf (deepest node on the id chain).
    pub fn id_path(&self) -> PathKey {
        let mut path = PathKey::root();
        let mut node = self;
        loop {
            let Some(fork) = &node.fork else {
                return path;
            };
            if fork.left.on_id {
                path.push(false);
                node = &fork.left;
            } else if fork.right.on_id {
                path.push(true);
                node = &fork.right;
            } else {
                return path;
            }
        }
    }

    /// Sum of counters along the path from root to id leaf: the owner's
    /// own event count.
    pub fn ticks(&self) -> u64 {
        self.seen_along(&self.id_path())
    }

    /// Sum of every counter in the tree: all events this clock has seen.
    pub fn all_ticks(&self) -> u64 {
        self.subtree_sum()
    }

    /// True iff the id-leaf counter is zero: forked but never ticked.
    pub fn is_zero_id(&self) -> bool {
        self.id_leaf().ticks == 0
    }

    /// New clock with the id-leaf counter incremented by one.
    pub fn ticked(&self) -> Self {
        debug_assert!(self.on_id, "ticked a clock without an identity");
        let mut next = self.clone();
        next.id_leaf_mut().ticks += 1;
        next
    }

    /// Split the id leaf in two. The first clock keeps the left identity,
    /// the second carries the right; all other counters are preserved.
    pub fn forked(&self) -> (Self, Self) {
        debug_assert!(self.on_id, "forked a clock without an identity");
        let mut left = self.clone();
        {
            let leaf = left.id_leaf_mut();
            leaf.fork = Some(Box::new(ForkNode {
                left: TreeClock {
                    ticks: 0,
                    on_id: true,
                    fork: None,
                },
                right: TreeClock {
                    ticks: 0,
                    on_id: false,
                    fork: None,
                },
            }));
        }
        let mut right = self.clone();
        {
            let leaf = right.id_leaf_mut();
            leaf.fork = Some(Box::new(ForkNode {
                left: TreeClock {
                    ticks: 0,
                    on_id: false,
                    fork: None,
                },
                right: TreeClock {
                    ticks: 0,
                    on_id: true,
                    fork: None,
                },
            }));
        }
        (left, right)
    }

    /// Component-wise maximum against `other` at each shared node; the id
    /// remains the caller's. Forks unknown to one side are adopted from the
    /// other with their id markers scrubbed.
    pub fn update(&self, other: &Self) -> Self {
        Self {
            ticks: self.ticks.max(other.ticks),
            on_id: self.on_id,
            fork: match (&self.fork, &other.fork) {
                (Some(a), Some(b)) => Some(Box::new(ForkNode {
                    left: a.left.update(&b.left),
                    right: a.right.update(&b.right),
                })),
                (Some(a), None) => Some(a.clone()),
                (None, Some(b)) => Some(Box::new(ForkNode {
                    left: b.left.scrubbed(),
                    right: b.right.scrubbed(),
                })),
                (None, None) => None,
            },
        }
    }

    /// True iff some component of `self` is strictly less than the
    /// corresponding component of `other`.
    pub fn any_lt(&self, other: &Self) -> bool {
        other
            .leaf_paths()
            .iter()
            .any(|path| self.seen_along(path) < other.seen_along(path))
    }

    /// True iff some component of `self` is strictly greater than the
    /// corresponding component of `other`.
    pub fn any_gt(&self, other: &Self) -> bool {
        other.any_lt(self)
    }

    /// Events seen in the region named by `path`: the counter sum walking
    /// `path` from the root. A clock that is coarser than `path` answers
    /// with its covering leaf; a clock that is finer answers with the full
    /// subtree sum.
    pub fn seen_along(&self, path: &PathKey) -> u64 {
        let mut node = self;
        let mut total = 0u64;
        for &bit in path.bits() {
            total += node.ticks;
            match &node.fork {
                Some(fork) => node = if bit { &fork.right } else { &fork.left },
                None => return total,
            }
        }
        total + node.subtree_sum()
    }

    /// Paths to every leaf of this clock.
    pub fn leaf_paths(&self) -> Vec<PathKey> {
        let mut paths = Vec::new();
        self.collect_leaves(PathKey::root(), &mut paths);
        paths
    }

    /// Content hash of the clock value. Identity markers do not
    /// participate: the hash is a function of shape and counters only.
    pub fn hash(&self) -> Tid {
        let mut packed = Vec::with_capacity(64);
        self.pack(&mut packed);
        let digest = Sha1::digest(&packed);
        let mut bytes = [0u8; TID_WIDTH];
        bytes.copy_from_slice(&digest[..TID_WIDTH]);
        Tid(bytes)
    }

    /// Canonical JSON form: each node is `[ticks, id, left, right]` where
    /// `left`/`right` are nested nodes or null.
    pub fn to_json(&self) -> serde_json::Value {
        let (left, right) = match &self.fork {
            Some(fork) => (fork.left.to_json(), fork.right.to_json()),
            None => (serde_json::Value::Null, serde_json::Value::Null),
        };
        serde_json::json!([self.ticks, self.on_id, left, right])
    }

    /// Inverse of [`TreeClock::to_json`]; total over valid inputs.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, ClockError> {
        let clock = Self::node_from_json(value)?;
        clock.validate_id_chain(clock.on_id)?;
        Ok(clock)
    }

    fn node_from_json(value: &serde_json::Value) -> Result<Self, ClockError> {
        let parts = value
            .as_array()
            .ok_or_else(|| ClockError::bad("node is not an array"))?;
        if parts.len() != 4 {
            return Err(ClockError::bad(format!(
                "node has {} elements, expected 4",
                parts.len()
            )));
        }
        let ticks = parts[0]
            .as_u64()
            .ok_or_else(|| ClockError::bad("ticks is not an unsigned integer"))?;
        let on_id = parts[1]
            .as_bool()
            .ok_or_else(|| ClockError::bad("id marker is not a boolean"))?;
        let fork = match (&parts[2], &parts[3]) {
            (serde_json::Value::Null, serde_json::Value::Null) => None,
            (serde_json::Value::Null, _) | (_, serde_json::Value::Null) => {
                return Err(ClockError::bad("fork must have both subtrees"));
            }
            (left, right) => Some(Box::new(ForkNode {
                left: Self::node_from_json(left)?,
                right: Self::node_from_json(right)?,
            })),
        };
        Ok(Self {
            ticks,
            on_id,
            fork,
        })
    }

    /// An id chain must be rooted: a node may only carry the marker if its
    /// parent does, and at most one child of a fork may carry it.
    fn validate_id_chain(&self, parent_on_id: bool) -> Result<(), ClockError> {
        if self.on_id && !parent_on_id {
            return Err(ClockError::bad("detached id marker"));
        }
        if let Some(fork) = &self.fork {
            if fork.left.on_id && fork.right.on_id {
                return Err(ClockError::bad("both fork subtrees carry the id"));
            }
            fork.left.validate_id_chain(self.on_id)?;
            fork.right.validate_id_chain(self.on_id)?;
        }
        Ok(())
    }

    fn id_leaf(&self) -> &TreeClock {
        let mut node = self;
        loop {
            let Some(fork) = &node.fork else {
                return node;
            };
            if fork.left.on_id {
                node = &fork.left;
            } else if fork.right.on_id {
                node = &fork.right;
            } else {
                return node;
            }
        }
    }

    fn id_leaf_mut(&mut self) -> &mut TreeClock {
        let mut node = self;
        loop {
            // Two-phase borrow: probe which branch carries the id first.
            let branch = match &node.fork {
                None => return node,
                Some(fork) => {
                    if fork.left.on_id {
                        Some(false)
                    } else if fork.right.on_id {
                        Some(true)
                    } else {
                        None
                    }
                }
            };
            match branch {
                None => return node,
                Some(bit) => {
                    let fork = node.fork.as_mut().expect("fork probed above");
                    node = if bit { &mut fork.right } else { &mut fork.left };
                }
            }
        }
    }

    fn scrubbed(&self) -> Self {
        Self {
            ticks: self.ticks,
            on_id: false,
            fork: self.fork.as_ref().map(|fork| {
                Box::new(ForkNode {
                    left: fork.left.scrubbed(),
                    right: fork.right.scrubbed(),
                })
            }),
        }
    }

    fn subtree_sum(&self) -> u64 {
        let mut total = self.ticks;
        if let Some(fork) = &self.fork {
            total += fork.left.subtree_sum() + fork.right.subtree_sum();
        }
        total
    }

    fn collect_leaves(&self, path: PathKey, out: &mut Vec<PathKey>) {
        match &self.fork {
            None => out.push(path),
            Some(fork) => {
                let mut left = path.clone();
                left.push(false);
                fork.left.collect_leaves(left, out);
                let mut right = path;
                right.push(true);
                fork.right.collect_leaves(right, out);
            }
        }
    }

    fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ticks.to_be_bytes());
        match &self.fork {
            None => out.push(0),
            Some(fork) => {
                out.push(1);
                fork.left.pack(out);
                fork.right.pack(out);
            }
        }
    }
}

impl fmt::Debug for TreeClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeClock({})", self.to_json())
    }
}

impl TreeClock {
    /// Causal comparison: `Less` iff self happened-before other, `None`
    /// for concurrent clocks. `Equal` means equal components, which is
    /// weaker than structural equality.
    pub fn causal_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.any_lt(other), self.any_gt(other)) {
            (false, false) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (true, true) => None,
        }
    }
}

impl Serialize for TreeClock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TreeClock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        TreeClock::from_json(&value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_is_zero_id_root() {
        let clock = TreeClock::genesis();
        assert!(clock.has_id());
        assert!(clock.is_zero_id());
        assert_eq!(clock.ticks(), 0);
        assert!(clock.id_path().is_root());
    }

    #[test]
    fn tick_increments_only_the_owner() {
        let clock = TreeClock::genesis().ticked();
        assert_eq!(clock.ticks(), 1);
        let (left, right) = clock.forked();
        let left2 = left.ticked().ticked();
        assert_eq!(left2.ticks(), 3);
        // The right identity saw nothing of left's ticks.
        assert_eq!(right.ticks(), 1);
        assert_eq!(left2.seen_along(&right.id_path()), 1);
    }

    #[test]
    fn fork_yields_disjoint_ids_equal_components() {
        let clock = TreeClock::genesis().ticked().ticked();
        let (left, right) = clock.forked();
        assert_ne!(left.id_path(), right.id_path());
        assert!(left.is_zero_id());
        assert!(right.is_zero_id());
        // Value (ignoring identity) is equal: the hash sees no difference.
        assert_eq!(left.hash(), right.hash());
        assert_eq!(left.ticks(), right.ticks());
    }

    #[test]
    fn update_takes_component_maximum() {
        let (a, b) = TreeClock::genesis().forked();
        let a2 = a.ticked().ticked();
        let b2 = b.ticked();
        let joined = a2.update(&b2);
        assert_eq!(joined.id_path(), a2.id_path());
        assert_eq!(joined.seen_along(&a2.id_path()), 2);
        assert_eq!(joined.seen_along(&b2.id_path()), 1);
    }

    #[test]
    fn update_keeps_callers_id() {
        let (a, b) = TreeClock::genesis().forked();
        let joined = a.update(&b.ticked());
        assert_eq!(joined.id_path(), a.id_path());
    }

    #[test]
    fn any_lt_detects_unseen_events() {
        let (a, b) = TreeClock::genesis().forked();
        let b2 = b.ticked();
        assert!(a.any_lt(&b2));
        assert!(!b2.any_lt(&a));
        assert!(b2.any_gt(&a));
    }

    #[test]
    fn concurrent_clocks_compare_both_ways() {
        let (a, b) = TreeClock::genesis().forked();
        let a2 = a.ticked();
        let b2 = b.ticked();
        assert!(a2.any_lt(&b2));
        assert!(a2.any_gt(&b2));
        assert_eq!(a2.causal_cmp(&b2), None);
        assert_eq!(a2.causal_cmp(&a2.clone()), Some(Ordering::Equal));
        assert_eq!(a2.update(&b2).causal_cmp(&b2), Some(Ordering::Greater));
    }

    #[test]
    fn update_is_causally_dominating() {
        let (a, b) = TreeClock::genesis().forked();
        let a2 = a.ticked();
        let b2 = b.ticked().ticked();
        let joined = a2.update(&b2);
        assert!(!joined.any_lt(&a2));
        assert!(!joined.any_lt(&b2));
    }

    #[test]
    fn seen_along_handles_coarser_and_finer_clocks() {
        let root = TreeClock::genesis().ticked();
        let (left, _right) = root.forked();
        let left2 = left.ticked();
        // A coarser clock answers for a finer path with its covering leaf.
        assert_eq!(root.seen_along(&left2.id_path()), 1);
        // A finer clock answers for the root path with its subtree sum.
        assert_eq!(left2.seen_along(&PathKey::root()), 2);
    }

    #[test]
    fn hash_is_a_function_of_value_only() {
        let clock = TreeClock::genesis().ticked();
        let (left, right) = clock.forked();
        assert_eq!(left.hash(), right.hash());
        assert_ne!(left.ticked().hash(), right.hash());
    }

    #[test]
    fn hash_survives_json_round_trip() {
        let clock = TreeClock::genesis().ticked().forked().0.ticked();
        let parsed = TreeClock::from_json(&clock.to_json()).unwrap();
        assert_eq!(parsed, clock);
        assert_eq!(parsed.hash(), clock.hash());
    }

    #[test]
    fn from_json_rejects_malformed_nodes() {
        for raw in [
            serde_json::json!(7),
            serde_json::json!([1, true, null]),
            serde_json::json!(["x", true, null, null]),
            serde_json::json!([1, true, [0, true, null, null], null]),
            serde_json::json!([1, true, [0, true, null, null], [0, true, null, null]]),
            serde_json::json!([1, false, [0, true, null, null], [0, false, null, null]]),
        ] {
            assert!(
                TreeClock::from_json(&raw).is_err(),
                "accepted invalid clock json {raw}"
            );
        }
    }

    #[test]
    fn tid_parses_its_own_rendering() {
        let tid = TreeClock::genesis().ticked().hash();
        let parsed = Tid::parse(&tid.to_string()).unwrap();
        assert_eq!(parsed, tid);
        assert!(Tid::parse("not-a-tid").is_err());
        assert!(Tid::parse("zz".repeat(TID_WIDTH).as_str()).is_err());
    }

    #[test]
    fn path_key_round_trips() {
        let (left, right) = TreeClock::genesis().forked();
        let (ll, _lr) = left.forked();
        let path = ll.id_path();
        assert_eq!(PathKey::parse(&path.to_string()).unwrap(), path);
        assert_eq!(right.id_path().to_string(), "1");
        assert!(PathKey::parse("012").is_err());
    }
}
