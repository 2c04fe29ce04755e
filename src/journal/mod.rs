//! The journal: a durable, append-mostly log of local and remote
//! operations.
//!
//! Entries are keyed by local tick (`tick:{base36}`, lexically ordered);
//! operations are keyed by transaction id (`op:{tid}`), with `cov:{tid}`
//! aliases keeping fused-away constituent ids resolvable. Journal state
//! (`journal`) caches the tail tick, the engine clock and the global wall
//! clock.
//!
//! Contiguous entries from one source may be spliced into a single fused
//! operation. Splices, causal reduction and disposal span history and
//! serialise on the journal-body lock; tail appends rely on batch
//! atomicity alone.

pub mod kvs;

use std::sync::Mutex;

use minicbor::{Decoder, Encoder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

use crate::core::clock::{Tid, TreeClock};
use crate::core::encoding::{self, DecodeError, EncodeError, OperationEncoder};
use crate::core::gwc::GlobalClock;
use crate::core::operation::{Operation, OperationError};
use kvs::{Batch, Kvs, KvsError};

const STATE_KEY: &[u8] = b"journal";
const TICK_PREFIX: &[u8] = b"tick:";
const TICK_KEY_DIGITS: usize = 8;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JournalError {
    #[error(transparent)]
    Kvs(#[from] KvsError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error("journal corrupt: {reason}")]
    Corruption { reason: String },
}

impl JournalError {
    fn corrupt(reason: impl Into<String>) -> Self {
        JournalError::Corruption {
            reason: reason.into(),
        }
    }
}

/// Lexically-sortable tick key: 8 base-36 digits, zero padded.
pub fn tick_key(tick: u64) -> Vec<u8> {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut digits = [b'0'; TICK_KEY_DIGITS];
    let mut rest = tick;
    for slot in digits.iter_mut().rev() {
        *slot = ALPHABET[(rest % 36) as usize];
        rest /= 36;
    }
    let mut key = TICK_PREFIX.to_vec();
    key.extend_from_slice(&digits);
    key
}

fn op_key(tid: &Tid) -> Vec<u8> {
    format!("op:{tid}").into_bytes()
}

fn cov_key(tid: &Tid) -> Vec<u8> {
    format!("cov:{tid}").into_bytes()
}

fn genesis_tid() -> Tid {
    TreeClock::genesis().hash()
}

/// One journal entry: a tick, the previous entry in this process's
/// history, and the transaction id of the committed operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub tick: u64,
    pub prev_tick: u64,
    pub prev_tid: Tid,
    pub tid: Tid,
}

/// Cached journal state, persisted under the `journal` key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalState {
    /// Greatest tick with an entry; 0 when the journal is empty.
    pub tail_tick: u64,
    pub tail_tid: Option<Tid>,
    /// The engine's current clock.
    pub time: TreeClock,
    pub gwc: GlobalClock,
    /// Global wall clock at the start of retained history. Rev-up requests
    /// from before this point cannot be served by replay.
    pub start: GlobalClock,
}

/// A stored operation record: its encoded bytes plus entry bookkeeping and
/// the constituent transaction ids it covers.
#[derive(Clone, Debug)]
struct OpRecord {
    tick: u64,
    prev_tick: u64,
    prev_tid: Tid,
    covers: Vec<Tid>,
    op_bytes: Vec<u8>,
}

impl OpRecord {
    fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        e.array(5)?;
        e.u64(self.tick)?;
        e.u64(self.prev_tick)?;
        e.str(&self.prev_tid.to_string())?;
        e.array(self.covers.len() as u64)?;
        for tid in &self.covers {
            e.str(&tid.to_string())?;
        }
        e.bytes(&self.op_bytes)?;
        Ok(buf)
    }

    fn decode(bytes: &[u8]) -> Result<Self, JournalError> {
        let mut d = Decoder::new(bytes);
        let len = d
            .array()
            .map_err(DecodeError::from)?
            .ok_or_else(|| JournalError::corrupt("op record has indefinite length"))?;
        if len != 5 {
            return Err(JournalError::corrupt(format!(
                "op record has {len} elements"
            )));
        }
        let tick = d.u64().map_err(DecodeError::from)?;
        let prev_tick = d.u64().map_err(DecodeError::from)?;
        let prev_tid = Tid::parse(d.str().map_err(DecodeError::from)?)
            .map_err(|err| JournalError::corrupt(err.to_string()))?;
        let covers_len = d
            .array()
            .map_err(DecodeError::from)?
            .ok_or_else(|| JournalError::corrupt("covers has indefinite length"))?;
        let mut covers = Vec::with_capacity(covers_len as usize);
        for _ in 0..covers_len {
            covers.push(
                Tid::parse(d.str().map_err(DecodeError::from)?)
                    .map_err(|err| JournalError::corrupt(err.to_string()))?,
            );
        }
        let op_bytes = d.bytes().map_err(DecodeError::from)?.to_vec();
        Ok(Self {
            tick,
            prev_tick,
            prev_tid,
            covers,
            op_bytes,
        })
    }
}

/// A commit prepared but not yet written: the caller appends its own keys
/// to the batch, writes it atomically, then completes the journal with the
/// new cached state.
#[derive(Debug)]
pub struct StagedCommit {
    pub batch: Batch,
    pub state: JournalState,
    pub entry: JournalEntry,
    /// True iff this commit spliced onto the tail entry.
    pub fused: bool,
}

pub struct Journal {
    state: JournalState,
    encoder: OperationEncoder,
    /// Serialises history-spanning work: splice, reduce, dispose.
    body_lock: Mutex<()>,
}

impl Journal {
    /// Create journal state for a fresh dataset.
    pub fn bootstrap(
        kvs: &mut dyn Kvs,
        encoder: OperationEncoder,
        time: TreeClock,
    ) -> Result<Self, JournalError> {
        Self::bootstrap_with(kvs, encoder, time, GlobalClock::new(), &[])
    }

    /// Create journal state seeded from a snapshot: the global wall clock
    /// becomes both current and the start of retained history, and the
    /// snapshot's per-source last operations are indexed (without entries)
    /// so stale-cut checks can resolve them.
    pub fn bootstrap_with(
        kvs: &mut dyn Kvs,
        encoder: OperationEncoder,
        time: TreeClock,
        gwc: GlobalClock,
        last_ops: &[Operation],
    ) -> Result<Self, JournalError> {
        let state = JournalState {
            tail_tick: 0,
            tail_tid: None,
            time,
            gwc: gwc.clone(),
            start: gwc,
        };
        let mut batch = Batch::new();
        for op in last_ops {
            let record = OpRecord {
                tick: 0,
                prev_tick: 0,
                prev_tid: genesis_tid(),
                covers: vec![op.tid()],
                op_bytes: encoder.encode(op)?.to_vec(),
            };
            batch.put(op_key(&op.tid()), record.encode()?);
        }
        batch.put(STATE_KEY, encode_state(&state)?);
        kvs.write(batch)?;
        Ok(Self {
            state,
            encoder,
            body_lock: Mutex::new(()),
        })
    }

    /// Load journal state from a non-empty dataset.
    pub fn load(kvs: &dyn Kvs, encoder: OperationEncoder) -> Result<Option<Self>, JournalError> {
        let Some(bytes) = kvs.get(STATE_KEY)? else {
            return Ok(None);
        };
        let state = decode_state(&bytes)?;
        Ok(Some(Self {
            state,
            encoder,
            body_lock: Mutex::new(()),
        }))
    }

    pub fn state(&self) -> &JournalState {
        &self.state
    }

    pub fn time(&self) -> &TreeClock {
        &self.state.time
    }

    pub fn gwc(&self) -> &GlobalClock {
        &self.state.gwc
    }

    /// Stage a commit of `op` at the local clock `local_time`. Splices
    /// onto the tail entry when `op` is its causal successor from the same
    /// source.
    pub fn stage_commit(
        &self,
        kvs: &dyn Kvs,
        op: &Operation,
        local_time: &TreeClock,
    ) -> Result<StagedCommit, JournalError> {
        let _body = self.body_lock.lock().unwrap_or_else(|err| err.into_inner());

        let tick = local_time.ticks();
        if self.state.tail_tid.is_some() && tick <= self.state.tail_tick {
            return Err(JournalError::corrupt(format!(
                "commit at tick {tick} does not advance tail {}",
                self.state.tail_tick
            )));
        }

        let mut batch = Batch::new();
        let mut state = self.state.clone();
        let tid = op.tid();

        let mut entry = JournalEntry {
            tick,
            prev_tick: state.tail_tick,
            prev_tid: state.tail_tid.unwrap_or_else(genesis_tid),
            tid,
        };
        let mut stored = op.clone();
        let mut covers = vec![tid];
        let mut fused = false;

        if let Some(tail_tid) = state.tail_tid
            && let Some(tail_record) = self.read_primary(kvs, &tail_tid)?
        {
            let tail_op = self.decode_op(&tail_record)?;
            if tail_op.source() == op.source() && op.from() == tail_op.time().ticks() + 1 {
                stored = tail_op.fuse(op)?;
                covers = tail_record.covers.clone();
                covers.push(tid);
                entry.prev_tick = tail_record.prev_tick;
                entry.prev_tid = tail_record.prev_tid;
                batch.delete(tick_key(state.tail_tick));
                batch.delete(op_key(&tail_tid));
                fused = true;
                debug!(
                    tid = %tid,
                    covers = covers.len(),
                    from = stored.from(),
                    to = stored.time().ticks(),
                    "splicing tail entry into fusion"
                );
            }
        }

        let record = OpRecord {
            tick,
            prev_tick: entry.prev_tick,
            prev_tid: entry.prev_tid,
            covers: covers.clone(),
            op_bytes: self.encoder.encode(&stored)?.to_vec(),
        };
        batch.put(op_key(&entry.tid), record.encode()?);
        for covered in &covers {
            if *covered != entry.tid {
                batch.put(cov_key(covered), entry.tid.to_string().into_bytes());
            }
        }
        batch.put(tick_key(tick), encode_entry(&entry)?);

        state.tail_tick = tick;
        state.tail_tid = Some(entry.tid);
        state.time = local_time.clone();
        state.gwc.observe(op.time());
        batch.put(STATE_KEY, encode_state(&state)?);

        trace!(tick, tid = %entry.tid, fused, "staged journal commit");
        Ok(StagedCommit {
            batch,
            state,
            entry,
            fused,
        })
    }

    /// Adopt the cached state of a written commit.
    pub fn complete(&mut self, state: JournalState) {
        self.state = state;
    }

    /// Persist a clock movement that commits no entry (fork, no-op join).
    pub fn save_time(&mut self, kvs: &mut dyn Kvs, time: &TreeClock) -> Result<(), JournalError> {
        let mut state = self.state.clone();
        state.time = time.clone();
        let mut batch = Batch::new();
        batch.put(STATE_KEY, encode_state(&state)?);
        kvs.write(batch)?;
        self.state = state;
        Ok(())
    }

    /// O(1) fetch by transaction id. A fused-away id resolves to the
    /// operation covering it.
    pub fn operation(&self, kvs: &dyn Kvs, tid: &Tid) -> Result<Option<Operation>, JournalError> {
        match self.read_record(kvs, tid)? {
            Some(record) => Ok(Some(self.decode_op(&record)?)),
            None => Ok(None),
        }
    }

    pub fn has_operation(&self, kvs: &dyn Kvs, tid: &Tid) -> Result<bool, JournalError> {
        Ok(kvs.get(&op_key(tid))?.is_some() || kvs.get(&cov_key(tid))?.is_some())
    }

    /// The next journal entry strictly after `tick`.
    pub fn entry_after(
        &self,
        kvs: &dyn Kvs,
        tick: u64,
    ) -> Result<Option<JournalEntry>, JournalError> {
        match kvs.next_after(TICK_PREFIX, &tick_key(tick))? {
            Some((_, bytes)) => Ok(Some(decode_entry(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The `(prev_tick, prev_tid)` stored on the entry for `tid`.
    pub fn entry_prev(&self, kvs: &dyn Kvs, tid: &Tid) -> Result<Option<(u64, Tid)>, JournalError> {
        Ok(self
            .read_record(kvs, tid)?
            .map(|record| (record.prev_tick, record.prev_tid)))
    }

    /// Walk backward along `prev` links while contiguous with the
    /// operation for `tid`, stopping below `min_from` or at a fork
    /// boundary, then fold forward into one fused operation.
    pub fn causal_reduce(
        &self,
        kvs: &dyn Kvs,
        tid: &Tid,
        min_from: u64,
    ) -> Result<Operation, JournalError> {
        let _body = self.body_lock.lock().unwrap_or_else(|err| err.into_inner());

        let Some(record) = self.read_primary(kvs, tid)? else {
            return Err(JournalError::corrupt(format!("operation {tid} missing")));
        };
        let op = self.decode_op(&record)?;

        let mut chain = vec![op];
        let mut prev_tid = record.prev_tid;
        loop {
            let newest = chain.last().expect("chain is non-empty");
            if newest.from() <= min_from {
                break;
            }
            let Some(prev_record) = self.read_primary(kvs, &prev_tid)? else {
                break;
            };
            let prev_op = self.decode_op(&prev_record)?;
            let contiguous = prev_op.source() == newest.source()
                && prev_op.time().ticks() + 1 == newest.from();
            if !contiguous || prev_op.time().ticks() < min_from {
                break;
            }
            prev_tid = prev_record.prev_tid;
            chain.push(prev_op);
        }

        let mut fused = chain.pop().expect("chain is non-empty");
        while let Some(next) = chain.pop() {
            fused = fused.fuse(&next)?;
        }
        Ok(fused)
    }

    /// All stored operations from `source` covering ticks at or above
    /// `from`, walking the local entry chain backward from the source's
    /// most recent operation. Entries of other sources interleave the
    /// chain and are skipped. Newest first.
    pub fn source_ops_back_to(
        &self,
        kvs: &dyn Kvs,
        source: &crate::core::clock::PathKey,
        from: u64,
        latest_tid: &Tid,
    ) -> Result<Vec<Operation>, JournalError> {
        let _body = self.body_lock.lock().unwrap_or_else(|err| err.into_inner());

        let mut out = Vec::new();
        let mut tid = *latest_tid;
        loop {
            let Some(record) = self.read_primary(kvs, &tid)? else {
                break;
            };
            let op = self.decode_op(&record)?;
            if op.source() == *source {
                let reaches_from = op.from() <= from;
                out.push(op);
                if reaches_from {
                    break;
                }
            }
            if record.prev_tick == 0 {
                break;
            }
            tid = record.prev_tid;
        }
        Ok(out)
    }

    /// Operations to replay for a peer at `time`, or `None` if `time`
    /// precedes the start of retained history (the peer must take a
    /// snapshot instead).
    pub fn operations_since(
        &self,
        kvs: &dyn Kvs,
        time: &TreeClock,
    ) -> Result<Option<Vec<Operation>>, JournalError> {
        for (path, _) in self.state.start.sources() {
            if time.seen_along(path) < self.state.start.ticks_for(path) {
                return Ok(None);
            }
        }
        let mut out = Vec::new();
        let mut tick = 0;
        while let Some(entry) = self.entry_after(kvs, tick)? {
            tick = entry.tick;
            let op = self.operation(kvs, &entry.tid)?.ok_or_else(|| {
                JournalError::corrupt(format!("entry at tick {tick} references missing {}", entry.tid))
            })?;
            if op.time().any_gt(time) {
                out.push(op);
            }
        }
        Ok(Some(out))
    }

    /// Delete an operation record that no journal entry references and the
    /// global wall clock no longer holds. Returns true if disposed.
    pub fn dispose_if_unreferenced(
        &self,
        kvs: &mut dyn Kvs,
        tid: &Tid,
    ) -> Result<bool, JournalError> {
        let _body = self.body_lock.lock().unwrap_or_else(|err| err.into_inner());

        let Some(record) = self.read_primary(kvs, tid)? else {
            return Ok(false);
        };
        let referenced = match kvs.get(&tick_key(record.tick))? {
            Some(bytes) => decode_entry(&bytes)?.tid == *tid,
            None => false,
        };
        if referenced {
            return Ok(false);
        }
        if record.covers.iter().any(|covered| self.state.gwc.holds_tid(covered)) {
            return Ok(false);
        }

        let mut batch = Batch::new();
        batch.delete(op_key(tid));
        for covered in &record.covers {
            if covered != tid {
                batch.delete(cov_key(covered));
            }
        }
        kvs.write(batch)?;
        debug!(tid = %tid, "disposed unreferenced operation");
        Ok(true)
    }

    fn read_record(&self, kvs: &dyn Kvs, tid: &Tid) -> Result<Option<OpRecord>, JournalError> {
        if let Some(record) = self.read_primary(kvs, tid)? {
            return Ok(Some(record));
        }
        let Some(alias) = kvs.get(&cov_key(tid))? else {
            return Ok(None);
        };
        let primary = String::from_utf8(alias)
            .ok()
            .and_then(|raw| Tid::parse(&raw).ok())
            .ok_or_else(|| JournalError::corrupt(format!("bad cover alias for {tid}")))?;
        self.read_primary(kvs, &primary)
    }

    fn read_primary(&self, kvs: &dyn Kvs, tid: &Tid) -> Result<Option<OpRecord>, JournalError> {
        match kvs.get(&op_key(tid))? {
            Some(bytes) => Ok(Some(OpRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn decode_op(&self, record: &OpRecord) -> Result<Operation, JournalError> {
        Ok(self.encoder.decode(&record.op_bytes)?)
    }
}

fn encode_state(state: &JournalState) -> Result<Vec<u8>, JournalError> {
    let value = serde_json::to_value(state)
        .map_err(|err| JournalError::corrupt(format!("state render failed: {err}")))?;
    Ok(encoding::to_cbor(&value)?)
}

fn decode_state(bytes: &[u8]) -> Result<JournalState, JournalError> {
    let value = encoding::from_cbor(bytes)?;
    serde_json::from_value(value)
        .map_err(|err| JournalError::corrupt(format!("state parse failed: {err}")))
}

fn encode_entry(entry: &JournalEntry) -> Result<Vec<u8>, JournalError> {
    let value = serde_json::to_value(entry)
        .map_err(|err| JournalError::corrupt(format!("entry render failed: {err}")))?;
    Ok(encoding::to_cbor(&value)?)
}

fn decode_entry(bytes: &[u8]) -> Result<JournalEntry, JournalError> {
    let value = encoding::from_cbor(bytes)?;
    serde_json::from_value(value)
        .map_err(|err| JournalError::corrupt(format!("entry parse failed: {err}")))
}
