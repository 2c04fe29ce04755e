//! Declarative constraints over the replicated graph.
//!
//! A constraint is a capability pair: `check` runs inside a local write
//! and may adjust or reject it; `apply` runs after a remote operation and
//! may emit a corrective patch, published as an extra local operation.
//! Constraints are loaded by descriptor from a pre-registered,
//! process-wide factory registry; nothing is resolved reflectively.

use std::collections::BTreeMap;
use std::sync::{Mutex, OnceLock};

use serde_json::Value;
use thiserror::Error;

use crate::core::triple::{Iri, Patch, Term, Triple, TriplePattern};

use super::StateView;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConstraintError {
    #[error("constraint `{constraint}` rejected the update: {reason}")]
    Rejected { constraint: String, reason: String },
    #[error("update requires authorisation by constraint `{constraint}`")]
    Unauthorised { constraint: String },
    #[error("constraint descriptor invalid: {reason}")]
    BadDescriptor { reason: String },
}

/// The mutable view of a local write while constraints are checking it.
/// Asserted adjustments enter the same operation, under the same
/// transaction id.
#[derive(Debug, Default)]
pub struct InterimUpdate {
    deletes: Vec<Triple>,
    inserts: Vec<Triple>,
    asserted_deletes: Vec<TriplePattern>,
    asserted_inserts: Vec<Triple>,
}

impl InterimUpdate {
    pub fn new(deletes: Vec<Triple>, inserts: Vec<Triple>) -> Self {
        Self {
            deletes,
            inserts,
            asserted_deletes: Vec::new(),
            asserted_inserts: Vec::new(),
        }
    }

    /// Triples the update withdraws, as currently resolved.
    pub fn deletes(&self) -> &[Triple] {
        &self.deletes
    }

    /// Triples the update asserts.
    pub fn inserts(&self) -> &[Triple] {
        &self.inserts
    }

    /// Assert an additional deletion, entering the same operation.
    pub fn assert_delete(&mut self, pattern: TriplePattern) {
        self.asserted_deletes.push(pattern);
    }

    /// Assert an additional insertion, entering the same operation.
    pub fn assert_insert(&mut self, triple: Triple) {
        self.asserted_inserts.push(triple);
    }

    pub(crate) fn into_assertions(self) -> (Vec<TriplePattern>, Vec<Triple>) {
        (self.asserted_deletes, self.asserted_inserts)
    }
}

pub trait Constraint: Send + Sync {
    fn name(&self) -> &str;

    /// Inspect and possibly adjust a local write before it commits.
    fn check(&self, state: &StateView<'_>, interim: &mut InterimUpdate)
    -> Result<(), ConstraintError>;

    /// Inspect the store after a remote operation applied; a returned
    /// patch is executed as a new local operation with a fresh
    /// transaction id.
    fn apply(
        &self,
        state: &StateView<'_>,
        deletes: &[Triple],
        inserts: &[Triple],
    ) -> Result<Option<Patch>, ConstraintError>;
}

pub type ConstraintFactory = fn(&Value) -> Result<Box<dyn Constraint>, ConstraintError>;

fn registry() -> &'static Mutex<BTreeMap<String, ConstraintFactory>> {
    static REGISTRY: OnceLock<Mutex<BTreeMap<String, ConstraintFactory>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut map: BTreeMap<String, ConstraintFactory> = BTreeMap::new();
        map.insert("single-valued".to_string(), SingleValued::from_descriptor);
        Mutex::new(map)
    })
}

/// Register a constraint factory under a descriptor type name. The only
/// process-wide state in the crate.
pub fn register_constraint(name: impl Into<String>, factory: ConstraintFactory) {
    registry()
        .lock()
        .unwrap_or_else(|err| err.into_inner())
        .insert(name.into(), factory);
}

/// Resolve a constraint descriptor, e.g.
/// `{"@type": "single-valued", "property": "name"}`.
pub fn constraint_from_descriptor(descriptor: &Value) -> Result<Box<dyn Constraint>, ConstraintError> {
    let kind = descriptor
        .get("@type")
        .and_then(Value::as_str)
        .ok_or_else(|| ConstraintError::BadDescriptor {
            reason: "descriptor without @type".to_string(),
        })?;
    let factory = registry()
        .lock()
        .unwrap_or_else(|err| err.into_inner())
        .get(kind)
        .copied()
        .ok_or_else(|| ConstraintError::BadDescriptor {
            reason: format!("no constraint registered for `{kind}`"),
        })?;
    factory(descriptor)
}

/// The reference constraint: a property may hold at most one value per
/// subject. Local writes replace the prior value; concurrent remote
/// values resolve to a deterministic winner.
pub struct SingleValued {
    property: Iri,
}

impl SingleValued {
    pub fn new(property: Iri) -> Self {
        Self { property }
    }

    fn from_descriptor(descriptor: &Value) -> Result<Box<dyn Constraint>, ConstraintError> {
        let property = descriptor
            .get("property")
            .and_then(Value::as_str)
            .ok_or_else(|| ConstraintError::BadDescriptor {
                reason: "single-valued descriptor without property".to_string(),
            })?;
        let property = Iri::new(property).map_err(|err| ConstraintError::BadDescriptor {
            reason: err.to_string(),
        })?;
        Ok(Box::new(Self::new(property)))
    }

    /// Deterministic winner among concurrent values: the greatest term.
    fn winner<'a>(values: impl Iterator<Item = &'a Term>) -> Option<&'a Term> {
        values.max()
    }
}

impl Constraint for SingleValued {
    fn name(&self) -> &str {
        "single-valued"
    }

    fn check(
        &self,
        state: &StateView<'_>,
        interim: &mut InterimUpdate,
    ) -> Result<(), ConstraintError> {
        let mut asserted = Vec::new();
        for insert in interim.inserts() {
            if insert.predicate != self.property {
                continue;
            }
            let duplicate = interim
                .inserts()
                .iter()
                .any(|other| {
                    other.subject == insert.subject
                        && other.predicate == insert.predicate
                        && other.object != insert.object
                });
            if duplicate {
                return Err(ConstraintError::Rejected {
                    constraint: self.name().to_string(),
                    reason: format!(
                        "multiple values for single-valued {} on {}",
                        self.property, insert.subject
                    ),
                });
            }
            // Replace any existing value: delete what the write does not
            // re-assert.
            for existing in state.matching(&TriplePattern {
                subject: Some(insert.subject.clone()),
                predicate: Some(self.property.clone()),
                object: None,
            }) {
                if existing.object != insert.object
                    && !interim.deletes().contains(&existing)
                {
                    asserted.push(TriplePattern {
                        subject: Some(existing.subject.clone()),
                        predicate: Some(existing.predicate.clone()),
                        object: Some(existing.object.clone()),
                    });
                }
            }
        }
        for pattern in asserted {
            interim.assert_delete(pattern);
        }
        Ok(())
    }

    fn apply(
        &self,
        state: &StateView<'_>,
        _deletes: &[Triple],
        inserts: &[Triple],
    ) -> Result<Option<Patch>, ConstraintError> {
        let mut patch = Patch::default();
        let mut seen: Vec<(&Iri, &Iri)> = Vec::new();
        for insert in inserts {
            if insert.predicate != self.property {
                continue;
            }
            let key = (&insert.subject, &insert.predicate);
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);

            let held = state.matching(&TriplePattern {
                subject: Some(insert.subject.clone()),
                predicate: Some(self.property.clone()),
                object: None,
            });
            if held.len() <= 1 {
                continue;
            }
            let winner = Self::winner(held.iter().map(|t| &t.object))
                .cloned()
                .expect("held is non-empty");
            for loser in held {
                if loser.object != winner {
                    patch.deletes.push(TriplePattern {
                        subject: Some(loser.subject.clone()),
                        predicate: Some(loser.predicate.clone()),
                        object: Some(loser.object.clone()),
                    });
                }
            }
        }
        Ok(if patch.is_empty() { None } else { Some(patch) })
    }
}
