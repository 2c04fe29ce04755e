//! The clone engine: lifecycle state machine and serialisation point.
//!
//! One engine owns one clone of one domain. All state transitions of the
//! message service, journal cache and SU-Set index happen under the
//! engine's single lock; remotes calls are made outside it so inbound
//! deliveries can never deadlock against outbound publication.
//!
//! Lifecycle: `uninitialised → initialising → revving-up ↔ live →
//! closing → closed`. A genesis clone becomes live immediately; any other
//! clone first obtains a forked clock and a snapshot from a peer, or
//! catches up by operation replay (rev-up).

pub mod live;
pub mod messages;

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::CloneConfig;
use crate::core::clock::TreeClock;
use crate::core::encoding::OperationEncoder;
use crate::core::triple::{Context, Patch};
use crate::dataset::constraint::Constraint;
use crate::dataset::{SuSetDataset, Update};
use crate::error::EngineError;
use crate::journal::kvs::Kvs;
use crate::remotes::{CloneHandle, LocalClone, OperationMessage, Recovery, Remotes, RemotesError};
use crate::{Result, dataset::Snapshot};
use live::{Broadcaster, Subscription};
use messages::{Delivery, MessageService};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Uninitialised,
    Initialising,
    RevvingUp,
    Live,
    Closing,
    Closed,
}

/// Observable clone status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloneStatus {
    /// The remotes report a connection (liveness is known).
    pub online: bool,
    /// Peers are live but this clone has not caught up yet.
    pub outdated: bool,
    /// This clone is (or may be) the only live clone on the domain.
    pub silo: bool,
    /// All events this clone's clock has seen.
    pub ticks: u64,
}

/// Items on the update stream: committed updates, then either clean
/// completion (stream closes) or a terminal error.
#[derive(Clone, Debug)]
pub enum UpdateEvent {
    Update(Update),
    Fatal(String),
}

struct EngineInner {
    config: CloneConfig,
    context: Context,
    encoder: OperationEncoder,
    dataset: SuSetDataset,
    msgs: MessageService,
    state: EngineState,
    remotes_live: Option<bool>,
    outdated: bool,
    pending_in: Vec<OperationMessage>,
    pending_out: Vec<OperationMessage>,
    status_tx: Broadcaster<CloneStatus>,
    update_tx: Broadcaster<UpdateEvent>,
}

impl EngineInner {
    fn status(&self) -> CloneStatus {
        CloneStatus {
            online: self.remotes_live.is_some(),
            outdated: self.outdated,
            silo: matches!(self.state, EngineState::Live | EngineState::RevvingUp)
                && self.remotes_live != Some(true),
            ticks: self.msgs.peek().all_ticks(),
        }
    }

    fn emit_status(&mut self) {
        let status = self.status();
        self.status_tx.publish(&status);
    }

    fn is_accepting(&self) -> bool {
        matches!(self.state, EngineState::Live | EngineState::RevvingUp)
    }

    /// Decode, order and apply one inbound message. Returns operations to
    /// publish (constraint echoes).
    fn apply_message(&mut self, message: OperationMessage) -> Vec<OperationMessage> {
        if matches!(self.state, EngineState::Closing | EngineState::Closed) {
            return Vec::new();
        }
        if !self.is_accepting() {
            // Arrived while initialising; held until the clone is ready.
            self.pending_in.push(message);
            return Vec::new();
        }
        let size = message.len();
        let op = match self.encoder.decode(&message.data) {
            Ok(op) => op,
            Err(err) => {
                warn!(%err, "dropping undecodable operation");
                return Vec::new();
            }
        };
        match self.msgs.receive(op, size) {
            Delivery::Delivered(batch) => self.apply_batch(batch),
            Delivery::Buffered { missing_from } => {
                debug!(missing_from, "operation buffered for causal order");
                Vec::new()
            }
            Delivery::Duplicate => Vec::new(),
            Delivery::Overflow => {
                warn!("reorder buffer overflow; clone is outdated");
                self.outdated = true;
                self.emit_status();
                Vec::new()
            }
        }
    }

    fn apply_batch(&mut self, batch: Vec<crate::core::operation::Operation>) -> Vec<OperationMessage> {
        let mut outbound = Vec::new();
        for op in batch {
            let joined = self.msgs.peek().clone();
            let EngineInner {
                dataset,
                msgs,
                encoder,
                update_tx,
                ..
            } = self;
            match dataset.apply(&op, &joined, || msgs.send()) {
                Ok(outcome) => {
                    if let Some(update) = outcome.update {
                        update_tx.publish(&UpdateEvent::Update(update));
                    }
                    if let Some((echo_op, echo_update)) = outcome.echo {
                        match encoder.encode(&echo_op) {
                            Ok(bytes) => outbound.push(OperationMessage::new(bytes)),
                            Err(err) => warn!(%err, "constraint echo too large to publish"),
                        }
                        update_tx.publish(&UpdateEvent::Update(echo_update));
                    }
                }
                Err(err) => {
                    self.fatal(&err.to_string());
                    return outbound;
                }
            }
        }
        self.emit_status();
        outbound
    }

    fn drain_pending_in(&mut self) -> Vec<OperationMessage> {
        let mut outbound = Vec::new();
        let held = std::mem::take(&mut self.pending_in);
        for message in held {
            outbound.extend(self.apply_message(message));
        }
        outbound
    }

    /// Transition to `closed` with the error on the update stream.
    fn fatal(&mut self, reason: &str) {
        warn!(reason, "engine closing on fatal error");
        self.state = EngineState::Closed;
        self.update_tx.publish(&UpdateEvent::Fatal(reason.to_string()));
        self.update_tx.complete();
        self.emit_status();
        self.status_tx.complete();
        let _ = self.dataset.close();
    }
}

struct EngineHandle {
    id: String,
    genesis: bool,
    inner: Weak<Mutex<EngineInner>>,
    remotes: Weak<Mutex<Box<dyn Remotes>>>,
}

impl EngineHandle {
    fn with_inner<T>(&self, f: impl FnOnce(&mut EngineInner) -> T) -> Option<T> {
        let inner = self.inner.upgrade()?;
        let mut guard = inner.lock().unwrap_or_else(|err| err.into_inner());
        Some(f(&mut guard))
    }
}

impl LocalClone for EngineHandle {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn deliver(&self, message: OperationMessage) {
        let outbound = self.with_inner(|inner| inner.apply_message(message));
        if let (Some(outbound), Some(inner), Some(remotes)) =
            (outbound, self.inner.upgrade(), self.remotes.upgrade())
        {
            publish_or_enqueue(&inner, &remotes, outbound);
        }
    }

    fn live_change(&self, live: Option<bool>) {
        self.with_inner(|inner| {
            inner.remotes_live = live;
            inner.emit_status();
        });
    }

    fn duplicate_identity(&self) {
        if self.genesis {
            return;
        }
        // A non-genesis clone finding its identity claimed elsewhere must
        // close before it diverges the domain.
        self.with_inner(|inner| inner.fatal("another live clone claims this identity"));
    }

    fn fork_clock(&self) -> std::result::Result<TreeClock, RemotesError> {
        self.with_inner(|inner| {
            let forked = inner.msgs.fork();
            let retained = inner.msgs.peek().clone();
            inner
                .dataset
                .save_time(&retained)
                .map_err(|err| RemotesError::Rejected {
                    reason: err.to_string(),
                })?;
            info!("forked clock for a new clone");
            Ok(forked)
        })
        .unwrap_or(Err(RemotesError::Closed))
    }

    fn snapshot(&self) -> std::result::Result<Snapshot, RemotesError> {
        self.with_inner(|inner| {
            inner
                .dataset
                .take_snapshot()
                .map_err(|err| RemotesError::Rejected {
                    reason: err.to_string(),
                })
        })
        .unwrap_or(Err(RemotesError::Closed))
    }

    fn revup_from(
        &self,
        time: &TreeClock,
    ) -> std::result::Result<Option<Recovery>, RemotesError> {
        self.with_inner(|inner| {
            let since =
                inner
                    .dataset
                    .operations_since(time)
                    .map_err(|err| RemotesError::Rejected {
                        reason: err.to_string(),
                    })?;
            match since {
                None => Ok(None),
                Some(ops) => {
                    let mut operations = Vec::with_capacity(ops.len());
                    for op in ops {
                        let bytes =
                            inner
                                .encoder
                                .encode(&op)
                                .map_err(|err| RemotesError::Rejected {
                                    reason: err.to_string(),
                                })?;
                        operations.push(OperationMessage::new(bytes));
                    }
                    Ok(Some(Recovery { operations }))
                }
            }
        })
        .unwrap_or(Err(RemotesError::Closed))
    }
}

/// Publish operations, tolerating re-entrant delivery: if this thread is
/// already publishing further up the stack, the messages queue and the
/// up-stack call drains them.
fn publish_or_enqueue(
    inner: &Arc<Mutex<EngineInner>>,
    remotes: &Arc<Mutex<Box<dyn Remotes>>>,
    outbound: Vec<OperationMessage>,
) {
    if outbound.is_empty() {
        return;
    }
    {
        let mut guard = inner.lock().unwrap_or_else(|err| err.into_inner());
        guard.pending_out.extend(outbound);
    }
    loop {
        let Ok(mut remotes_guard) = remotes.try_lock() else {
            // Held up-stack on this or another thread; the holder drains.
            return;
        };
        let batch = {
            let mut guard = inner.lock().unwrap_or_else(|err| err.into_inner());
            std::mem::take(&mut guard.pending_out)
        };
        if batch.is_empty() {
            return;
        }
        for message in batch {
            if let Err(err) = remotes_guard.publish(message) {
                debug!(%err, "operation publication failed; peers will rev-up");
            }
        }
        drop(remotes_guard);
    }
}

pub struct CloneEngine {
    inner: Arc<Mutex<EngineInner>>,
    remotes: Arc<Mutex<Box<dyn Remotes>>>,
}

impl CloneEngine {
    /// Initialise a clone of the configured domain over the given
    /// dataset backend and remotes fabric.
    pub fn clone(
        config: CloneConfig,
        kvs: Box<dyn Kvs>,
        remotes: Box<dyn Remotes>,
        constraints: Vec<Box<dyn Constraint>>,
    ) -> Result<Self> {
        config.validate()?;
        let context = config.effective_context();
        let encoder = OperationEncoder::new(
            context.clone(),
            config.max_operation_size,
            config.limits.compress_threshold_bytes,
        );
        let dataset = SuSetDataset::open(
            kvs,
            &config.domain,
            context.clone(),
            config.max_operation_size,
            config.limits.compress_threshold_bytes,
            constraints,
        )?;

        let initialised = dataset.is_initialised();
        if initialised && config.genesis {
            return Err(EngineError::IsGenesis);
        }

        let start_time = if initialised {
            dataset.time()?.clone()
        } else {
            TreeClock::genesis()
        };
        let msgs = MessageService::new(start_time, &config.limits);
        let status_caps = (config.limits.max_subscribers, config.limits.subscriber_queue_events);

        let inner = Arc::new(Mutex::new(EngineInner {
            context,
            encoder,
            dataset,
            msgs,
            state: EngineState::Initialising,
            remotes_live: None,
            outdated: false,
            pending_in: Vec::new(),
            pending_out: Vec::new(),
            status_tx: Broadcaster::new(status_caps.0, status_caps.1),
            update_tx: Broadcaster::new(status_caps.0, status_caps.1),
            config,
        }));
        let remotes = Arc::new(Mutex::new(remotes));
        let engine = CloneEngine {
            inner: Arc::clone(&inner),
            remotes: Arc::clone(&remotes),
        };

        let handle: CloneHandle = Arc::new(EngineHandle {
            id: engine.with_inner(|inner| inner.config.id.clone()),
            genesis: engine.with_inner(|inner| inner.config.genesis),
            inner: Arc::downgrade(&inner),
            remotes: Arc::downgrade(&remotes),
        });
        {
            let mut guard = remotes.lock().unwrap_or_else(|err| err.into_inner());
            guard.set_local(Some(handle))?;
            let live = guard.live();
            drop(guard);
            engine.with_inner(|inner| inner.remotes_live = live);
        }

        if initialised {
            engine.rev_up()?;
        } else if engine.with_inner(|inner| inner.config.genesis) {
            engine.with_inner(|inner| {
                inner.dataset.bootstrap(TreeClock::genesis())?;
                inner.msgs.reset(TreeClock::genesis());
                inner.state = EngineState::Live;
                inner.emit_status();
                info!(domain = %inner.config.domain, "genesis clone live");
                Ok::<_, EngineError>(())
            })?;
        } else {
            engine.initialise_from_peer()?;
        }
        Ok(engine)
    }

    /// Current status snapshot. Polls the remotes for liveness so a
    /// transport drop is visible without waiting for a presence frame.
    pub fn status(&self) -> CloneStatus {
        let live = {
            let remotes = self.remotes.lock().unwrap_or_else(|err| err.into_inner());
            remotes.live()
        };
        self.with_inner(|inner| {
            inner.remotes_live = live;
            inner.status()
        })
    }

    pub fn state(&self) -> EngineState {
        self.with_inner(|inner| inner.state)
    }

    /// Follow status transitions.
    pub fn follow_status(&self) -> Option<Subscription<CloneStatus>> {
        self.with_inner(|inner| inner.status_tx.subscribe())
    }

    /// Follow committed updates. Completes on clean close; a
    /// [`UpdateEvent::Fatal`] precedes completion on fatal close.
    pub fn follow(&self) -> Option<Subscription<UpdateEvent>> {
        self.with_inner(|inner| inner.update_tx.subscribe())
    }

    /// Execute a write transaction; the update is also emitted on the
    /// update stream after commit.
    pub fn write(&self, patch: &Patch) -> Result<Option<Update>> {
        let (update, outbound) = {
            let mut guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
            if !guard.is_accepting() {
                return Err(EngineError::Closed);
            }
            let EngineInner {
                dataset,
                msgs,
                encoder,
                ..
            } = &mut *guard;
            let Some((op, update)) = dataset.transact(patch, || msgs.send())? else {
                return Ok(None);
            };
            let bytes = encoder.encode(&op)?;
            guard
                .update_tx
                .publish(&UpdateEvent::Update(update.clone()));
            guard.emit_status();
            (update, vec![OperationMessage::new(bytes)])
        };
        publish_or_enqueue(&self.inner, &self.remotes, outbound);
        Ok(Some(update))
    }

    /// Insert a JSON-LD subject graph.
    pub fn insert_json(&self, subject: &Value) -> Result<Option<Update>> {
        let patch = self.with_inner(|inner| Patch::insert_json(subject, &inner.context))?;
        self.write(&patch)
    }

    /// Delete by JSON-LD subject pattern.
    pub fn delete_json(&self, pattern: &Value) -> Result<Option<Update>> {
        let patch = self.with_inner(|inner| Patch::delete_json(pattern, &inner.context))?;
        self.write(&patch)
    }

    /// Describe a subject by (possibly relative) id; `None` when nothing
    /// is asserted about it.
    pub fn describe(&self, id: &str) -> Result<Option<Value>> {
        let mut guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        if matches!(guard.state, EngineState::Closed | EngineState::Closing) {
            return Err(EngineError::Closed);
        }
        let iri = guard.context.expand_id(id)?;
        Ok(guard
            .dataset
            .describe(&iri)
            .map(|subject| subject.to_json(&guard.context)))
    }

    /// Re-attempt catch-up, e.g. after the fabric reconnects. Safe to
    /// call at any time while live.
    pub fn rejoin(&self) -> Result<()> {
        if !self.with_inner(|inner| inner.is_accepting()) {
            return Err(EngineError::Closed);
        }
        self.rev_up()
    }

    /// Close the clone: leave presence, complete the streams, release
    /// the dataset.
    pub fn close(&self) -> Result<()> {
        {
            let mut guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
            if matches!(guard.state, EngineState::Closed) {
                return Ok(());
            }
            guard.state = EngineState::Closing;
        }
        {
            let mut remotes = self.remotes.lock().unwrap_or_else(|err| err.into_inner());
            let _ = remotes.set_local(None);
        }
        let mut guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        guard.state = EngineState::Closed;
        guard.emit_status();
        guard.status_tx.complete();
        guard.update_tx.complete();
        guard.dataset.close()?;
        info!(domain = %guard.config.domain, "clone closed");
        Ok(())
    }

    fn with_inner<T>(&self, f: impl FnOnce(&mut EngineInner) -> T) -> T {
        let mut guard = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        f(&mut guard)
    }

    /// Initialise an empty, non-genesis clone: wait for peers, fork a
    /// clock, ingest a snapshot.
    fn initialise_from_peer(&self) -> Result<()> {
        let timeout = self.with_inner(|inner| inner.config.network_timeout_ms);
        if !self.wait_live(Duration::from_millis(timeout)) {
            self.with_inner(|inner| {
                let _ = inner.dataset.close();
                inner.state = EngineState::Closed;
            });
            return Err(EngineError::NotGenesis);
        }

        let clock = {
            let mut remotes = self.remotes.lock().unwrap_or_else(|err| err.into_inner());
            remotes.new_clock()?
        };
        let snapshot = {
            let mut remotes = self.remotes.lock().unwrap_or_else(|err| err.into_inner());
            remotes.snapshot()?
        };
        let outbound = self.with_inner(|inner| {
            if inner.state == EngineState::Closed {
                return Err(EngineError::Closed);
            }
            inner.dataset.apply_snapshot(&snapshot, clock.clone())?;
            inner.msgs.reset(clock.clone());
            inner.state = EngineState::Live;
            inner.outdated = false;
            inner.emit_status();
            info!(domain = %inner.config.domain, "clone live from snapshot");
            Ok::<_, EngineError>(inner.drain_pending_in())
        })?;
        publish_or_enqueue(&self.inner, &self.remotes, outbound);
        Ok(())
    }

    /// Catch up an initialised clone: rev-up by replay, escalating to a
    /// snapshot when a peer cannot replay far enough back. Without live
    /// peers the clone proceeds as a silo.
    fn rev_up(&self) -> Result<()> {
        let (timeout_ms, limits) =
            self.with_inner(|inner| (inner.config.network_timeout_ms, inner.config.limits.clone()));
        if !self.wait_live(Duration::from_millis(timeout_ms)) {
            // Silo: writes continue, buffered for later propagation.
            self.with_inner(|inner| {
                if inner.state == EngineState::Closed {
                    return;
                }
                inner.state = EngineState::Live;
                inner.outdated = false;
                inner.emit_status();
                info!(domain = %inner.config.domain, "no live peers; proceeding as silo");
            });
            return Ok(());
        }

        if self.with_inner(|inner| {
            if inner.state == EngineState::Closed {
                return true;
            }
            inner.state = EngineState::RevvingUp;
            inner.outdated = true;
            inner.emit_status();
            false
        }) {
            return Err(EngineError::Closed);
        }
        let time = self.with_inner(|inner| inner.msgs.peek().clone());

        let mut backoff = Duration::from_millis(0);
        for attempt in 0..=limits.revup_max_retries {
            if !backoff.is_zero() {
                std::thread::sleep(backoff);
            }
            // Immediate first retry, then exponential up to the ceiling.
            backoff = if backoff.is_zero() {
                Duration::from_millis(limits.revup_backoff_base_ms)
            } else {
                (backoff * 2).min(Duration::from_millis(limits.revup_backoff_ceiling_ms))
            };

            let result = {
                let mut remotes = self.remotes.lock().unwrap_or_else(|err| err.into_inner());
                remotes.revup_from(&time)
            };
            match result {
                Ok(Some(recovery)) => {
                    self.ingest_recovery(recovery);
                    return Ok(());
                }
                Ok(None) => {
                    debug!("peer cannot replay; escalating to snapshot");
                    return self.resync_snapshot();
                }
                Err(err) if err.is_transient() => {
                    warn!(%err, attempt, "rev-up attempt failed");
                    continue;
                }
                Err(err) => {
                    warn!(%err, "rev-up rejected; escalating to snapshot");
                    return self.resync_snapshot();
                }
            }
        }
        // Exhausted: try a snapshot before settling for outdated.
        self.resync_snapshot()
    }

    fn ingest_recovery(&self, recovery: Recovery) {
        let outbound = self.with_inner(|inner| {
            if inner.state == EngineState::Closed {
                return Vec::new();
            }
            let mut outbound = Vec::new();
            inner.state = EngineState::Live;
            for message in recovery.operations {
                outbound.extend(inner.apply_message(message));
            }
            inner.outdated = false;
            outbound.extend(inner.drain_pending_in());
            inner.emit_status();
            info!(domain = %inner.config.domain, "revved up");
            outbound
        });
        publish_or_enqueue(&self.inner, &self.remotes, outbound);
    }

    /// Snapshot-based resynchronisation of an already-initialised clone.
    fn resync_snapshot(&self) -> Result<()> {
        let snapshot = {
            let mut remotes = self.remotes.lock().unwrap_or_else(|err| err.into_inner());
            remotes.snapshot()
        };
        match snapshot {
            Ok(snapshot) => {
                let outbound = self.with_inner(|inner| {
                    if inner.state == EngineState::Closed {
                        return Err(EngineError::Closed);
                    }
                    // Keep our identity; dominate everything the snapshot
                    // has seen.
                    let mut new_time = inner.msgs.peek().clone();
                    if let Some(merged) = snapshot.gwc.merged_time() {
                        new_time = new_time.update(merged);
                    }
                    inner.dataset.apply_snapshot(&snapshot, new_time.clone())?;
                    inner.msgs.reset(new_time);
                    inner.state = EngineState::Live;
                    inner.outdated = false;
                    let outbound = inner.drain_pending_in();
                    inner.emit_status();
                    info!(domain = %inner.config.domain, "resynchronised from snapshot");
                    Ok::<_, EngineError>(outbound)
                })?;
                publish_or_enqueue(&self.inner, &self.remotes, outbound);
                Ok(())
            }
            Err(err) => {
                // Recovery failures do not surface: stay live but
                // outdated until the embedder rejoins.
                warn!(%err, "snapshot resync failed; remaining outdated");
                self.with_inner(|inner| {
                    if inner.state == EngineState::Closed {
                        return;
                    }
                    inner.state = EngineState::Live;
                    inner.outdated = true;
                    inner.emit_status();
                });
                Ok(())
            }
        }
    }

    fn wait_live(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let live = {
                let remotes = self.remotes.lock().unwrap_or_else(|err| err.into_inner());
                remotes.live()
            };
            self.with_inner(|inner| inner.remotes_live = live);
            if live == Some(true) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl Drop for CloneEngine {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
