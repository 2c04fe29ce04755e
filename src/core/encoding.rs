//! Canonical wire encoding of operations.
//!
//! An encoded operation is a CBOR 5-tuple `[version, from, time, deletes,
//! inserts]`. The `deletes`/`inserts` payloads are self-describing: a
//! vector of encoding stages plus the staged bytes. Small payloads stay as
//! UTF-8 JSON; larger ones are CBOR under gzip. Decoders apply the stage
//! chain in reverse.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use serde_json::Value;
use thiserror::Error;

use super::clock::{ClockError, Tid, TreeClock};
use super::operation::{Operation, OperationError, Reified};
use super::triple::{Context, Iri, Literal, Subject, Term, TripleError, subjects_of};

const MAX_DECODE_DEPTH: usize = 32;
const MAX_DECODE_ENTRIES: u64 = 65_536;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EncodeError {
    #[error("encoded operation is {size} bytes, exceeding the {max} byte cap")]
    OperationSizeExceeded { size: usize, max: usize },
    #[error(transparent)]
    Cbor(#[from] minicbor::encode::Error<std::convert::Infallible>),
    #[error("payload compression failed: {0}")]
    Compress(#[from] std::io::Error),
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DecodeError {
    #[error(transparent)]
    Cbor(#[from] minicbor::decode::Error),
    #[error("operation envelope invalid: {reason}")]
    BadEnvelope { reason: String },
    #[error("payload invalid: {reason}")]
    BadPayload { reason: String },
    #[error(transparent)]
    Clock(#[from] ClockError),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error(transparent)]
    Triple(#[from] TripleError),
    #[error("payload decompression failed: {0}")]
    Decompress(#[from] std::io::Error),
}

impl DecodeError {
    fn envelope(reason: impl Into<String>) -> Self {
        DecodeError::BadEnvelope {
            reason: reason.into(),
        }
    }

    fn payload(reason: impl Into<String>) -> Self {
        DecodeError::BadPayload {
            reason: reason.into(),
        }
    }
}

/// Encoding stages, applied left to right when encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Json,
    Cbor,
    Gzip,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::Json => "json",
            Stage::Cbor => "cbor",
            Stage::Gzip => "gzip",
        }
    }

    fn parse(raw: &str) -> Result<Self, DecodeError> {
        match raw {
            "json" => Ok(Stage::Json),
            "cbor" => Ok(Stage::Cbor),
            "gzip" => Ok(Stage::Gzip),
            _ => Err(DecodeError::payload(format!("unknown encoding stage `{raw}`"))),
        }
    }
}

/// Encodes and decodes operations against one domain context.
#[derive(Clone, Debug)]
pub struct OperationEncoder {
    context: Context,
    compress_threshold: usize,
    max_operation_size: Option<usize>,
}

impl OperationEncoder {
    pub fn new(
        context: Context,
        max_operation_size: Option<usize>,
        compress_threshold: usize,
    ) -> Self {
        Self {
            context,
            compress_threshold,
            max_operation_size,
        }
    }

    pub fn encode(&self, op: &Operation) -> Result<Bytes, EncodeError> {
        let deletes = reified_to_json(&op.delete_parts());
        let inserts = if op.is_fused() {
            reified_to_json(&op.insert_parts())
        } else {
            self.subjects_json(op)
        };

        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        e.array(5)?;
        e.u32(op.version())?;
        e.u64(op.from())?;
        e.str(&op.time().to_json().to_string())?;
        self.encode_payload(&mut e, &deletes)?;
        self.encode_payload(&mut e, &inserts)?;

        if let Some(max) = self.max_operation_size
            && buf.len() > max
        {
            return Err(EncodeError::OperationSizeExceeded {
                size: buf.len(),
                max,
            });
        }
        Ok(Bytes::from(buf))
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Operation, DecodeError> {
        let mut d = Decoder::new(bytes);
        let len = d
            .array()?
            .ok_or_else(|| DecodeError::envelope("indefinite-length envelope"))?;
        if len != 5 {
            return Err(DecodeError::envelope(format!(
                "envelope has {len} elements, expected 5"
            )));
        }
        let version = d.u32()?;
        if version != super::operation::OPERATION_VERSION {
            return Err(DecodeError::Operation(OperationError::BadVersion {
                got: version,
            }));
        }
        let from = d.u64()?;
        let time_raw = d.str()?;
        let time_json: Value = serde_json::from_str(time_raw)
            .map_err(|err| DecodeError::envelope(format!("time is not json: {err}")))?;
        let time = TreeClock::from_json(&time_json)?;

        let deletes_value = self.decode_payload(&mut d)?;
        let inserts_value = self.decode_payload(&mut d)?;

        let deletes = reified_from_json(&deletes_value)?;
        if from == time.ticks() {
            let inserts = super::triple::subjects_to_triples(&inserts_value, &self.context)?;
            let delete_map = deletes
                .into_iter()
                .map(|part| (part.triple, part.tids))
                .collect();
            Ok(Operation::single(time, delete_map, inserts))
        } else {
            let inserts = reified_from_json(&inserts_value)?;
            Ok(Operation::from_parts(version, from, time, deletes, inserts)?)
        }
    }

    fn subjects_json(&self, op: &Operation) -> Value {
        let arena = subjects_of(op.inserts().map(|(triple, _)| triple.clone()));
        Value::Array(
            arena
                .values()
                .filter(|subject: &&Subject| !subject.is_empty())
                .map(|subject| subject.to_json(&self.context))
                .collect(),
        )
    }

    fn encode_payload(
        &self,
        e: &mut Encoder<&mut Vec<u8>>,
        value: &Value,
    ) -> Result<(), EncodeError> {
        let json = serde_json::to_string(value).expect("json value renders");
        let (stages, data) = if json.len() > self.compress_threshold {
            let mut cbor = Vec::new();
            encode_value(&mut Encoder::new(&mut cbor), value, 0)?;
            (vec![Stage::Cbor, Stage::Gzip], gzip(&cbor)?)
        } else {
            (vec![Stage::Json], json.into_bytes())
        };

        e.array(2)?;
        e.array(stages.len() as u64)?;
        for stage in stages {
            e.str(stage.as_str())?;
        }
        e.bytes(&data)?;
        Ok(())
    }

    fn decode_payload(&self, d: &mut Decoder<'_>) -> Result<Value, DecodeError> {
        let len = d
            .array()?
            .ok_or_else(|| DecodeError::payload("indefinite-length payload"))?;
        if len != 2 {
            return Err(DecodeError::payload(format!(
                "payload has {len} elements, expected 2"
            )));
        }
        let stage_count = d
            .array()?
            .ok_or_else(|| DecodeError::payload("indefinite-length stage vector"))?;
        let mut stages = Vec::with_capacity(stage_count as usize);
        for _ in 0..stage_count {
            stages.push(Stage::parse(d.str()?)?);
        }
        let mut data = d.bytes()?.to_vec();

        // Reverse the stage chain.
        let mut value = None;
        for stage in stages.iter().rev() {
            match stage {
                Stage::Gzip => data = gunzip(&data)?,
                Stage::Cbor => {
                    let mut inner = Decoder::new(&data);
                    value = Some(decode_value(&mut inner, 0)?);
                }
                Stage::Json => {
                    value = Some(serde_json::from_slice(&data).map_err(|err| {
                        DecodeError::payload(format!("payload is not json: {err}"))
                    })?);
                }
            }
        }
        value.ok_or_else(|| DecodeError::payload("payload has no value stage"))
    }
}

fn reified_to_json(parts: &[Reified]) -> Value {
    Value::Array(
        parts
            .iter()
            .map(|part| {
                serde_json::json!({
                    "tid": part.tids.iter().map(Tid::to_string).collect::<Vec<_>>(),
                    "s": part.triple.subject.as_str(),
                    "p": part.triple.predicate.as_str(),
                    "o": term_to_json(&part.triple.object),
                })
            })
            .collect(),
    )
}

fn reified_from_json(value: &Value) -> Result<Vec<Reified>, DecodeError> {
    let items = value
        .as_array()
        .ok_or_else(|| DecodeError::payload("reified payload is not an array"))?;
    items
        .iter()
        .map(|item| {
            let object = item
                .as_object()
                .ok_or_else(|| DecodeError::payload("reified entry is not an object"))?;
            let tids = match object.get("tid") {
                Some(Value::String(one)) => vec![Tid::parse(one)?],
                Some(Value::Array(many)) => many
                    .iter()
                    .map(|raw| {
                        raw.as_str()
                            .ok_or_else(|| DecodeError::payload("tid is not a string"))
                            .and_then(|raw| Ok(Tid::parse(raw)?))
                    })
                    .collect::<Result<_, _>>()?,
                _ => return Err(DecodeError::payload("reified entry without tid")),
            };
            let subject = field_str(object, "s")?;
            let predicate = field_str(object, "p")?;
            let triple = super::triple::Triple::new(
                Iri::new(subject)?,
                Iri::new(predicate)?,
                term_from_json(
                    object
                        .get("o")
                        .ok_or_else(|| DecodeError::payload("reified entry without object"))?,
                )?,
            );
            Ok(Reified {
                triple,
                tids: tids.into_iter().collect(),
            })
        })
        .collect()
}

fn field_str<'a>(
    object: &'a serde_json::Map<String, Value>,
    key: &str,
) -> Result<&'a str, DecodeError> {
    object
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::payload(format!("reified entry field `{key}` missing")))
}

fn term_to_json(term: &Term) -> Value {
    match term {
        Term::Ref(iri) => serde_json::json!({ "@id": iri.as_str() }),
        Term::Literal(Literal::Boolean(b)) => Value::Bool(*b),
        Term::Literal(Literal::Integer(i)) => Value::from(*i),
        Term::Literal(Literal::String(s)) => Value::String(s.clone()),
    }
}

fn term_from_json(value: &Value) -> Result<Term, DecodeError> {
    match value {
        Value::Object(map) => {
            let id = map
                .get("@id")
                .and_then(Value::as_str)
                .ok_or_else(|| DecodeError::payload("object term without @id"))?;
            Ok(Term::Ref(Iri::new(id)?))
        }
        Value::String(s) => Ok(Term::Literal(Literal::String(s.clone()))),
        Value::Bool(b) => Ok(Term::Literal(Literal::Boolean(*b))),
        Value::Number(n) => n
            .as_i64()
            .map(|i| Term::Literal(Literal::Integer(i)))
            .ok_or_else(|| DecodeError::payload("non-integer number term")),
        _ => Err(DecodeError::payload("unsupported term")),
    }
}

fn encode_value(
    e: &mut Encoder<&mut Vec<u8>>,
    value: &Value,
    depth: usize,
) -> Result<(), EncodeError> {
    debug_assert!(depth <= MAX_DECODE_DEPTH, "payload deeper than decoders accept");
    match value {
        Value::Null => {
            e.null()?;
        }
        Value::Bool(b) => {
            e.bool(*b)?;
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                e.i64(i)?;
            } else if let Some(u) = n.as_u64() {
                e.u64(u)?;
            } else {
                e.f64(n.as_f64().expect("number is f64"))?;
            }
        }
        Value::String(s) => {
            e.str(s)?;
        }
        Value::Array(items) => {
            e.array(items.len() as u64)?;
            for item in items {
                encode_value(e, item, depth + 1)?;
            }
        }
        Value::Object(map) => {
            e.map(map.len() as u64)?;
            for (key, item) in map {
                e.str(key)?;
                encode_value(e, item, depth + 1)?;
            }
        }
    }
    Ok(())
}

fn decode_value(d: &mut Decoder<'_>, depth: usize) -> Result<Value, DecodeError> {
    if depth > MAX_DECODE_DEPTH {
        return Err(DecodeError::payload("payload nesting too deep"));
    }
    match d.datatype()? {
        Type::Null => {
            d.skip()?;
            Ok(Value::Null)
        }
        Type::Bool => Ok(Value::Bool(d.bool()?)),
        Type::U8 | Type::U16 | Type::U32 | Type::U64 => Ok(Value::from(d.u64()?)),
        Type::I8 | Type::I16 | Type::I32 | Type::I64 => Ok(Value::from(d.i64()?)),
        Type::F32 | Type::F64 => serde_json::Number::from_f64(d.f64()?)
            .map(Value::Number)
            .ok_or_else(|| DecodeError::payload("non-finite number")),
        Type::String => Ok(Value::String(d.str()?.to_string())),
        Type::Array => {
            let len = d
                .array()?
                .ok_or_else(|| DecodeError::payload("indefinite-length array"))?;
            if len > MAX_DECODE_ENTRIES {
                return Err(DecodeError::payload("array too large"));
            }
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                items.push(decode_value(d, depth + 1)?);
            }
            Ok(Value::Array(items))
        }
        Type::Map => {
            let len = d
                .map()?
                .ok_or_else(|| DecodeError::payload("indefinite-length map"))?;
            if len > MAX_DECODE_ENTRIES {
                return Err(DecodeError::payload("map too large"));
            }
            let mut map = serde_json::Map::new();
            for _ in 0..len {
                let key = d.str()?.to_string();
                map.insert(key, decode_value(d, depth + 1)?);
            }
            Ok(Value::Object(map))
        }
        other => Err(DecodeError::payload(format!("unknown cbor type {other}"))),
    }
}

/// Encode a JSON value as canonical CBOR (persisted-state values).
pub(crate) fn to_cbor(value: &Value) -> Result<Vec<u8>, EncodeError> {
    let mut buf = Vec::new();
    encode_value(&mut Encoder::new(&mut buf), value, 0)?;
    Ok(buf)
}

pub(crate) fn from_cbor(bytes: &[u8]) -> Result<Value, DecodeError> {
    decode_value(&mut Decoder::new(bytes), 0)
}

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}
