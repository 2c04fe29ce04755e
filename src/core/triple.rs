//! Graph value types: IRIs, literals, triples and subject graphs.
//!
//! Subjects are the JSON-LD face of the store; triples are the replicated
//! unit. Subject graphs may be cyclic: conversion never inlines a nested
//! subject, it emits a reference and a separate subject, so reads resolve
//! references by lookup rather than ownership.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TripleError {
    #[error("malformed update: {reason}")]
    BadUpdate { reason: String },
}

impl TripleError {
    pub(crate) fn bad(reason: impl Into<String>) -> Self {
        TripleError::BadUpdate {
            reason: reason.into(),
        }
    }
}

/// An IRI or IRI-reference. Non-empty, no whitespace.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Iri(String);

impl Iri {
    pub fn new(raw: impl Into<String>) -> Result<Self, TripleError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(TripleError::bad("empty iri"));
        }
        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(TripleError::bad(format!("iri `{raw}` contains whitespace")));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_absolute(&self) -> bool {
        self.0.contains(':')
    }
}

impl fmt::Display for Iri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Iri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Iri({})", self.0)
    }
}

/// A literal value. Doubles are not replicated (no total order); updates
/// carrying them are rejected as unsupported.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Boolean(bool),
    Integer(i64),
    String(String),
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Term {
    #[serde(rename = "ref")]
    Ref(Iri),
    #[serde(rename = "lit")]
    Literal(Literal),
}

impl Term {
    pub fn string(value: impl Into<String>) -> Self {
        Term::Literal(Literal::String(value.into()))
    }
}

/// One asserted statement.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Triple {
    pub subject: Iri,
    pub predicate: Iri,
    pub object: Term,
}

impl Triple {
    pub fn new(subject: Iri, predicate: Iri, object: Term) -> Self {
        Self {
            subject,
            predicate,
            object,
        }
    }

    /// Stable content key for index storage: truncated SHA-256 over the
    /// canonical byte form, rendered lowercase hex.
    pub fn content_key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.subject.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.predicate.as_str().as_bytes());
        hasher.update([0u8]);
        match &self.object {
            Term::Ref(iri) => {
                hasher.update([b'r', 0]);
                hasher.update(iri.as_str().as_bytes());
            }
            Term::Literal(Literal::Boolean(b)) => {
                hasher.update([b'b', 0, u8::from(*b)]);
            }
            Term::Literal(Literal::Integer(i)) => {
                hasher.update([b'i', 0]);
                hasher.update(i.to_be_bytes());
            }
            Term::Literal(Literal::String(s)) => {
                hasher.update([b's', 0]);
                hasher.update(s.as_bytes());
            }
        }
        let digest = hasher.finalize();
        digest[..16].iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// A triple pattern; `None` positions match anything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriplePattern {
    pub subject: Option<Iri>,
    pub predicate: Option<Iri>,
    pub object: Option<Term>,
}

impl TriplePattern {
    pub fn matches(&self, triple: &Triple) -> bool {
        self.subject.as_ref().is_none_or(|s| *s == triple.subject)
            && self
                .predicate
                .as_ref()
                .is_none_or(|p| *p == triple.predicate)
            && self.object.as_ref().is_none_or(|o| *o == triple.object)
    }
}

/// A user write: patterns to delete, triples to insert.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Patch {
    pub deletes: Vec<TriplePattern>,
    pub inserts: Vec<Triple>,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty()
    }

    /// Build an insert-only patch from a JSON-LD subject graph.
    pub fn insert_json(value: &Value, context: &Context) -> Result<Self, TripleError> {
        Ok(Self {
            deletes: Vec::new(),
            inserts: subjects_to_triples(value, context)?,
        })
    }

    /// Build a delete-only patch from a JSON-LD subject pattern; string
    /// values starting with `?` are variables matching anything.
    pub fn delete_json(value: &Value, context: &Context) -> Result<Self, TripleError> {
        Ok(Self {
            deletes: subject_patterns(value, context)?,
            inserts: Vec::new(),
        })
    }
}

/// JSON-LD context defaults: `@base` resolves subject ids, `@vocab`
/// resolves property names.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Context {
    pub base: Option<Iri>,
    pub vocab: Option<Iri>,
}

impl Context {
    pub fn for_domain(domain: &str) -> Self {
        Self {
            base: Iri::new(format!("http://{domain}/")).ok(),
            vocab: Iri::new(format!("http://{domain}/#")).ok(),
        }
    }

    pub fn expand_id(&self, name: &str) -> Result<Iri, TripleError> {
        let iri = Iri::new(name)?;
        match &self.base {
            Some(base) if !iri.is_absolute() => Iri::new(format!("{base}{name}")),
            _ => Ok(iri),
        }
    }

    pub fn expand_property(&self, name: &str) -> Result<Iri, TripleError> {
        let iri = Iri::new(name)?;
        match &self.vocab {
            Some(vocab) if !iri.is_absolute() => Iri::new(format!("{vocab}{name}")),
            _ => Ok(iri),
        }
    }

    pub fn compact_id<'a>(&self, iri: &'a Iri) -> &'a str {
        match &self.base {
            Some(base) => iri.as_str().strip_prefix(base.as_str()).unwrap_or(iri.as_str()),
            None => iri.as_str(),
        }
    }

    pub fn compact_property<'a>(&self, iri: &'a Iri) -> &'a str {
        match &self.vocab {
            Some(vocab) => iri.as_str().strip_prefix(vocab.as_str()).unwrap_or(iri.as_str()),
            None => iri.as_str(),
        }
    }
}

/// A subject: one node of the graph, by IRI, with its asserted properties.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Subject {
    pub id: Iri,
    pub properties: BTreeMap<Iri, BTreeSet<Term>>,
}

impl Subject {
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Render as a JSON-LD subject, compacted against `context`. Nested
    /// subjects are emitted as `{"@id": ...}` references, never inlined.
    pub fn to_json(&self, context: &Context) -> Value {
        let mut object = serde_json::Map::new();
        object.insert(
            "@id".to_string(),
            Value::String(context.compact_id(&self.id).to_string()),
        );
        for (property, values) in &self.properties {
            let rendered: Vec<Value> = values
                .iter()
                .map(|term| match term {
                    Term::Ref(iri) => {
                        serde_json::json!({ "@id": context.compact_id(iri) })
                    }
                    Term::Literal(Literal::Boolean(b)) => Value::Bool(*b),
                    Term::Literal(Literal::Integer(i)) => Value::from(*i),
                    Term::Literal(Literal::String(s)) => Value::String(s.clone()),
                })
                .collect();
            let value = if rendered.len() == 1 {
                rendered.into_iter().next().expect("one value")
            } else {
                Value::Array(rendered)
            };
            object.insert(context.compact_property(property).to_string(), value);
        }
        Value::Object(object)
    }
}

/// Group triples into subjects, indexed by IRI (the subject arena).
pub fn subjects_of(triples: impl IntoIterator<Item = Triple>) -> BTreeMap<Iri, Subject> {
    let mut arena: BTreeMap<Iri, Subject> = BTreeMap::new();
    for triple in triples {
        let subject = arena.entry(triple.subject.clone()).or_insert_with(|| Subject {
            id: triple.subject.clone(),
            properties: BTreeMap::new(),
        });
        subject
            .properties
            .entry(triple.predicate)
            .or_default()
            .insert(triple.object);
    }
    arena
}

/// Flatten a JSON-LD subject graph (one subject or an array of subjects,
/// possibly nested) into triples.
pub fn subjects_to_triples(value: &Value, context: &Context) -> Result<Vec<Triple>, TripleError> {
    let mut out = Vec::new();
    match value {
        Value::Array(items) => {
            for item in items {
                collect_subject(item, context, &mut out)?;
            }
        }
        _ => {
            collect_subject(value, context, &mut out)?;
        }
    }
    Ok(out)
}

fn collect_subject(
    value: &Value,
    context: &Context,
    out: &mut Vec<Triple>,
) -> Result<Iri, TripleError> {
    match value {
        Value::Array(_) => Err(TripleError::bad("array where a subject was expected")),
        Value::Object(map) => {
            let id_raw = map
                .get("@id")
                .and_then(Value::as_str)
                .ok_or_else(|| TripleError::bad("subject without @id"))?;
            let subject = context.expand_id(id_raw)?;
            for (key, prop_value) in map {
                if key == "@id" {
                    continue;
                }
                let predicate = context.expand_property(key)?;
                collect_values(&subject, &predicate, prop_value, context, out)?;
            }
            Ok(subject)
        }
        _ => Err(TripleError::bad("subject is not an object")),
    }
}

fn collect_values(
    subject: &Iri,
    predicate: &Iri,
    value: &Value,
    context: &Context,
    out: &mut Vec<Triple>,
) -> Result<(), TripleError> {
    match value {
        Value::Array(items) => {
            for item in items {
                collect_values(subject, predicate, item, context, out)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            // A nested subject: assert a reference here, plus the nested
            // subject's own triples. Reference-only objects add nothing
            // beyond the link, which keeps cycles finite.
            let object = if map.len() == 1 && map.contains_key("@id") {
                let id_raw = map["@id"]
                    .as_str()
                    .ok_or_else(|| TripleError::bad("@id is not a string"))?;
                context.expand_id(id_raw)?
            } else {
                collect_subject(value, context, out)?
            };
            out.push(Triple::new(
                subject.clone(),
                predicate.clone(),
                Term::Ref(object),
            ));
            Ok(())
        }
        Value::String(s) => {
            out.push(Triple::new(
                subject.clone(),
                predicate.clone(),
                Term::Literal(Literal::String(s.clone())),
            ));
            Ok(())
        }
        Value::Bool(b) => {
            out.push(Triple::new(
                subject.clone(),
                predicate.clone(),
                Term::Literal(Literal::Boolean(*b)),
            ));
            Ok(())
        }
        Value::Number(n) => {
            let i = n
                .as_i64()
                .ok_or_else(|| TripleError::bad("non-integer numbers are not supported"))?;
            out.push(Triple::new(
                subject.clone(),
                predicate.clone(),
                Term::Literal(Literal::Integer(i)),
            ));
            Ok(())
        }
        Value::Null => Err(TripleError::bad("null property value")),
    }
}

fn subject_patterns(value: &Value, context: &Context) -> Result<Vec<TriplePattern>, TripleError> {
    match value {
        Value::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                out.extend(subject_patterns(item, context)?);
            }
            Ok(out)
        }
        Value::Object(map) => {
            let id_raw = map
                .get("@id")
                .and_then(Value::as_str)
                .ok_or_else(|| TripleError::bad("pattern without @id"))?;
            let subject = if id_raw.starts_with('?') {
                None
            } else {
                Some(context.expand_id(id_raw)?)
            };
            let mut out = Vec::new();
            let mut had_property = false;
            for (key, prop_value) in map {
                if key == "@id" {
                    continue;
                }
                had_property = true;
                let predicate = Some(context.expand_property(key)?);
                let object = pattern_term(prop_value, context)?;
                out.push(TriplePattern {
                    subject: subject.clone(),
                    predicate,
                    object,
                });
            }
            if !had_property {
                // Bare `{"@id": ...}`: delete the whole subject.
                out.push(TriplePattern {
                    subject,
                    predicate: None,
                    object: None,
                });
            }
            Ok(out)
        }
        _ => Err(TripleError::bad("pattern is not an object")),
    }
}

fn pattern_term(value: &Value, context: &Context) -> Result<Option<Term>, TripleError> {
    match value {
        Value::String(s) if s.starts_with('?') => Ok(None),
        Value::String(s) => Ok(Some(Term::Literal(Literal::String(s.clone())))),
        Value::Bool(b) => Ok(Some(Term::Literal(Literal::Boolean(*b)))),
        Value::Number(n) => n
            .as_i64()
            .map(|i| Some(Term::Literal(Literal::Integer(i))))
            .ok_or_else(|| TripleError::bad("non-integer numbers are not supported")),
        Value::Object(map) if map.len() == 1 && map.contains_key("@id") => {
            let id_raw = map["@id"]
                .as_str()
                .ok_or_else(|| TripleError::bad("@id is not a string"))?;
            if id_raw.starts_with('?') {
                Ok(None)
            } else {
                Ok(Some(Term::Ref(context.expand_id(id_raw)?)))
            }
        }
        _ => Err(TripleError::bad("unsupported pattern value")),
    }
}
