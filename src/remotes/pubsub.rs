//! Generic pub/sub remotes over a raw channel provider.
//!
//! Handles what every concrete transport shares: presence aggregation
//! with the `__live` sentinel, request/reply correlation by opaque id
//! with the configured network timeout, snapshot data streaming over a
//! notification sub-channel, and message framing. A transport only
//! supplies topic-addressed publish/subscribe.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{Sender, bounded};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::clock::TreeClock;
use crate::core::encoding::OperationEncoder;
use crate::core::operation::Reified;
use crate::dataset::{Snapshot, SnapshotBatch};

use super::{CloneHandle, OperationMessage, Recovery, Remotes, RemotesError};

/// Presence sentinel published on entry to a domain.
pub const LIVE_SENTINEL: &str = "__live";

pub type MessageHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

/// A raw topic-addressed pub/sub transport. Publishing never delivers
/// back to the publishing channel.
pub trait PubsubChannel: Send + Sync + 'static {
    fn connected(&self) -> bool;

    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), RemotesError>;

    /// Publish and retain under `retain_key`: late subscribers to `topic`
    /// receive the latest retained payload per key on subscribe.
    fn publish_retained(
        &self,
        topic: &str,
        retain_key: &str,
        payload: Bytes,
    ) -> Result<(), RemotesError>;

    fn clear_retained(&self, topic: &str, retain_key: &str) -> Result<(), RemotesError>;

    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), RemotesError>;

    fn unsubscribe(&self, topic: &str) -> Result<(), RemotesError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct PresenceFrame {
    client: String,
    instance: String,
    state: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ControlRequest {
    NewClock,
    Snapshot,
    Revup { time: Value },
}

#[derive(Debug, Serialize, Deserialize)]
struct ControlFrame {
    correlation: String,
    reply_to: String,
    request: ControlRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ControlResponse {
    NewClock {
        clock: Value,
    },
    Snapshot {
        gwc: Value,
        last_ops: Vec<String>,
    },
    Revup {
        ops: Option<Vec<String>>,
    },
    Rejected {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReplyFrame {
    correlation: String,
    response: ControlResponse,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum NotifyFrame {
    Batch { triples: Vec<Reified> },
    End,
}

#[derive(Default)]
struct SnapshotCollector {
    batches: Vec<SnapshotBatch>,
    done: bool,
}

struct Shared<C: PubsubChannel> {
    channel: C,
    domain: String,
    client: String,
    instance: String,
    encoder: OperationEncoder,
    local: Mutex<Option<CloneHandle>>,
    present: Mutex<BTreeMap<String, String>>,
    replies: Mutex<BTreeMap<String, Sender<ControlResponse>>>,
}

impl<C: PubsubChannel> Shared<C> {
    fn topic(&self, kind: &str) -> String {
        format!("{}/{kind}", self.domain)
    }

    fn topic_for(&self, kind: &str, suffix: &str) -> String {
        format!("{}/{kind}/{suffix}", self.domain)
    }

    fn live(&self) -> Option<bool> {
        if !self.channel.connected() {
            return None;
        }
        let present = self.present.lock().unwrap_or_else(|err| err.into_inner());
        Some(!present.is_empty())
    }

    fn notify_live(&self) {
        let live = self.live();
        let local = self
            .local
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone();
        if let Some(local) = local {
            local.live_change(live);
        }
    }

    fn on_presence(&self, payload: Bytes) {
        let Ok(frame) = serde_json::from_slice::<PresenceFrame>(&payload) else {
            warn!("dropping malformed presence frame");
            return;
        };
        if frame.client == self.client {
            if frame.instance != self.instance && frame.state == LIVE_SENTINEL {
                warn!(client = %frame.client, "another live clone claims this identity");
                let local = self
                    .local
                    .lock()
                    .unwrap_or_else(|err| err.into_inner())
                    .clone();
                if let Some(local) = local {
                    local.duplicate_identity();
                }
            }
            return;
        }
        {
            let mut present = self.present.lock().unwrap_or_else(|err| err.into_inner());
            if frame.state == LIVE_SENTINEL {
                present.insert(frame.client.clone(), frame.instance.clone());
            } else {
                present.remove(&frame.client);
            }
        }
        debug!(client = %frame.client, state = %frame.state, "presence change");
        self.notify_live();
    }

    fn on_operation(&self, payload: Bytes) {
        let local = self
            .local
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone();
        if let Some(local) = local {
            local.deliver(OperationMessage::new(payload));
        }
    }

    fn on_control(&self, payload: Bytes) {
        let Ok(frame) = serde_json::from_slice::<ControlFrame>(&payload) else {
            warn!("dropping malformed control frame");
            return;
        };
        let response = self.serve(&frame);
        let reply = ReplyFrame {
            correlation: frame.correlation,
            response,
        };
        let topic = self.topic_for("rpy", &frame.reply_to);
        let payload = Bytes::from(serde_json::to_vec(&reply).expect("reply renders"));
        if let Err(err) = self.channel.publish(&topic, payload) {
            warn!(%err, "reply publication failed");
        }
    }

    fn serve(&self, frame: &ControlFrame) -> ControlResponse {
        let local = self
            .local
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone();
        let Some(local) = local else {
            return ControlResponse::Rejected {
                reason: "no local clone attached".to_string(),
            };
        };
        match &frame.request {
            ControlRequest::NewClock => match local.fork_clock() {
                Ok(clock) => ControlResponse::NewClock {
                    clock: clock.to_json(),
                },
                Err(err) => rejected(err),
            },
            ControlRequest::Snapshot => match local.snapshot() {
                Ok(snapshot) => self.stream_snapshot(&frame.correlation, snapshot),
                Err(err) => rejected(err),
            },
            ControlRequest::Revup { time } => {
                let time = match TreeClock::from_json(time) {
                    Ok(time) => time,
                    Err(err) => return rejected(err),
                };
                match local.revup_from(&time) {
                    Ok(Some(recovery)) => ControlResponse::Revup {
                        ops: Some(
                            recovery
                                .operations
                                .iter()
                                .map(|message| hex(&message.data))
                                .collect(),
                        ),
                    },
                    Ok(None) => ControlResponse::Revup { ops: None },
                    Err(err) => rejected(err),
                }
            }
        }
    }

    /// Stream snapshot data over the notification sub-channel, then
    /// answer with the snapshot metadata.
    fn stream_snapshot(&self, correlation: &str, snapshot: Snapshot) -> ControlResponse {
        let topic = self.topic_for("ntf", correlation);
        for batch in &snapshot.batches {
            let frame = NotifyFrame::Batch {
                triples: batch.triples.clone(),
            };
            let payload = Bytes::from(serde_json::to_vec(&frame).expect("frame renders"));
            if let Err(err) = self.channel.publish(&topic, payload) {
                return rejected(err);
            }
        }
        let end = Bytes::from(serde_json::to_vec(&NotifyFrame::End).expect("frame renders"));
        if let Err(err) = self.channel.publish(&topic, end) {
            return rejected(err);
        }

        let mut last_ops = Vec::new();
        for op in &snapshot.last_ops {
            match self.encoder.encode(op) {
                Ok(bytes) => last_ops.push(hex(&bytes)),
                Err(err) => return rejected(err),
            }
        }
        ControlResponse::Snapshot {
            gwc: serde_json::to_value(&snapshot.gwc).expect("gwc renders"),
            last_ops,
        }
    }

    fn on_reply(&self, payload: Bytes) {
        let Ok(frame) = serde_json::from_slice::<ReplyFrame>(&payload) else {
            warn!("dropping malformed reply frame");
            return;
        };
        let sender = self
            .replies
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .remove(&frame.correlation);
        if let Some(sender) = sender {
            let _ = sender.try_send(frame.response);
        }
    }
}

fn rejected(err: impl std::fmt::Display) -> ControlResponse {
    ControlResponse::Rejected {
        reason: err.to_string(),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn unhex(raw: &str) -> Result<Vec<u8>, RemotesError> {
    if raw.len() % 2 != 0 {
        return Err(RemotesError::Fabric {
            reason: "odd-length hex payload".to_string(),
        });
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&raw[i..i + 2], 16).map_err(|_| RemotesError::Fabric {
                reason: "bad hex payload".to_string(),
            })
        })
        .collect()
}

/// `Remotes` over any [`PubsubChannel`].
pub struct PubsubRemotes<C: PubsubChannel> {
    shared: Arc<Shared<C>>,
    network_timeout: Duration,
    attached: bool,
}

impl<C: PubsubChannel> PubsubRemotes<C> {
    pub fn new(
        channel: C,
        domain: impl Into<String>,
        client: impl Into<String>,
        network_timeout_ms: u64,
        encoder: OperationEncoder,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                channel,
                domain: domain.into(),
                client: client.into(),
                instance: Uuid::new_v4().to_string(),
                encoder,
                local: Mutex::new(None),
                present: Mutex::new(BTreeMap::new()),
                replies: Mutex::new(BTreeMap::new()),
            }),
            network_timeout: Duration::from_millis(network_timeout_ms),
            attached: false,
        }
    }

    fn subscribe_all(&self) -> Result<(), RemotesError> {
        let shared = &self.shared;

        let weak = Arc::downgrade(shared);
        shared.channel.subscribe(
            &shared.topic("presence"),
            Arc::new(move |payload| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_presence(payload);
                }
            }),
        )?;

        let weak = Arc::downgrade(shared);
        shared.channel.subscribe(
            &shared.topic("ops"),
            Arc::new(move |payload| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_operation(payload);
                }
            }),
        )?;

        let weak = Arc::downgrade(shared);
        shared.channel.subscribe(
            &shared.topic_for("ctl", &shared.client),
            Arc::new(move |payload| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_control(payload);
                }
            }),
        )?;

        let weak = Arc::downgrade(shared);
        shared.channel.subscribe(
            &shared.topic_for("rpy", &shared.client),
            Arc::new(move |payload| {
                if let Some(shared) = weak.upgrade() {
                    shared.on_reply(payload);
                }
            }),
        )?;

        Ok(())
    }

    fn unsubscribe_all(&self) {
        let shared = &self.shared;
        for topic in [
            shared.topic("presence"),
            shared.topic("ops"),
            shared.topic_for("ctl", &shared.client),
            shared.topic_for("rpy", &shared.client),
        ] {
            let _ = shared.channel.unsubscribe(&topic);
        }
    }

    fn any_peer(&self) -> Result<String, RemotesError> {
        let present = self
            .shared
            .present
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        present
            .keys()
            .next()
            .cloned()
            .ok_or(RemotesError::NoPeer)
    }

    fn request(&self, request: ControlRequest) -> Result<ControlResponse, RemotesError> {
        self.request_with_correlation(Uuid::new_v4().to_string(), request)
    }

    fn presence_frame(&self, state: &str) -> Bytes {
        let frame = PresenceFrame {
            client: self.shared.client.clone(),
            instance: self.shared.instance.clone(),
            state: state.to_string(),
        };
        Bytes::from(serde_json::to_vec(&frame).expect("frame renders"))
    }
}

impl<C: PubsubChannel> Remotes for PubsubRemotes<C> {
    fn live(&self) -> Option<bool> {
        self.shared.live()
    }

    fn set_local(&mut self, local: Option<CloneHandle>) -> Result<(), RemotesError> {
        match local {
            Some(handle) => {
                if !self.attached {
                    self.subscribe_all()?;
                    self.attached = true;
                }
                *self
                    .shared
                    .local
                    .lock()
                    .unwrap_or_else(|err| err.into_inner()) = Some(handle);
                self.shared.channel.publish_retained(
                    &self.shared.topic("presence"),
                    &self.shared.client,
                    self.presence_frame(LIVE_SENTINEL),
                )?;
                info!(domain = %self.shared.domain, client = %self.shared.client, "presence published");
            }
            None => {
                // Explicit leave on graceful shutdown.
                let _ = self.shared.channel.clear_retained(
                    &self.shared.topic("presence"),
                    &self.shared.client,
                );
                let _ = self
                    .shared
                    .channel
                    .publish(&self.shared.topic("presence"), self.presence_frame("leave"));
                if self.attached {
                    self.unsubscribe_all();
                    self.attached = false;
                }
                *self
                    .shared
                    .local
                    .lock()
                    .unwrap_or_else(|err| err.into_inner()) = None;
            }
        }
        Ok(())
    }

    fn publish(&mut self, message: OperationMessage) -> Result<(), RemotesError> {
        self.shared
            .channel
            .publish(&self.shared.topic("ops"), message.data)
    }

    fn new_clock(&mut self) -> Result<TreeClock, RemotesError> {
        let response = self.request(ControlRequest::NewClock)?;
        let ControlResponse::NewClock { clock } = response else {
            return Err(RemotesError::Fabric {
                reason: "mismatched response to new-clock".to_string(),
            });
        };
        TreeClock::from_json(&clock).map_err(|err| RemotesError::Fabric {
            reason: err.to_string(),
        })
    }

    fn snapshot(&mut self) -> Result<Snapshot, RemotesError> {
        // The server streams data on the notification sub-channel before
        // replying, so the correlation id is chosen up front and the
        // collector subscribed before the request goes out.
        let correlation_slot: Arc<Mutex<SnapshotCollector>> = Arc::default();
        let correlation = Uuid::new_v4().to_string();
        let topic = self.shared.topic_for("ntf", &correlation);
        {
            let slot = Arc::clone(&correlation_slot);
            self.shared.channel.subscribe(
                &topic,
                Arc::new(move |payload| {
                    let Ok(frame) = serde_json::from_slice::<NotifyFrame>(&payload) else {
                        return;
                    };
                    let mut collector = slot.lock().unwrap_or_else(|err| err.into_inner());
                    match frame {
                        NotifyFrame::Batch { triples } => {
                            collector.batches.push(SnapshotBatch { triples });
                        }
                        NotifyFrame::End => collector.done = true,
                    }
                }),
            )?;
        }

        let result = self.request_with_correlation(correlation.clone(), ControlRequest::Snapshot);
        let _ = self.shared.channel.unsubscribe(&topic);
        let response = result?;

        let ControlResponse::Snapshot { gwc, last_ops } = response else {
            return Err(RemotesError::Fabric {
                reason: "mismatched response to snapshot".to_string(),
            });
        };

        // Wait out any stragglers on the data stream.
        let deadline = Instant::now() + self.network_timeout;
        loop {
            {
                let collector = correlation_slot
                    .lock()
                    .unwrap_or_else(|err| err.into_inner());
                if collector.done {
                    break;
                }
            }
            if Instant::now() >= deadline {
                return Err(RemotesError::Timeout {
                    ms: self.network_timeout.as_millis() as u64,
                });
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        let gwc = serde_json::from_value(gwc).map_err(|err| RemotesError::Fabric {
            reason: format!("bad snapshot gwc: {err}"),
        })?;
        let mut decoded_ops = Vec::new();
        for raw in last_ops {
            let bytes = unhex(&raw)?;
            let op = self
                .shared
                .encoder
                .decode(&bytes)
                .map_err(|err| RemotesError::Fabric {
                    reason: format!("bad snapshot operation: {err}"),
                })?;
            decoded_ops.push(op);
        }
        let batches = {
            let mut collector = correlation_slot
                .lock()
                .unwrap_or_else(|err| err.into_inner());
            std::mem::take(&mut collector.batches)
        };
        Ok(Snapshot {
            gwc,
            batches,
            last_ops: decoded_ops,
        })
    }

    fn revup_from(&mut self, time: &TreeClock) -> Result<Option<Recovery>, RemotesError> {
        let response = self.request(ControlRequest::Revup {
            time: time.to_json(),
        })?;
        let ControlResponse::Revup { ops } = response else {
            return Err(RemotesError::Fabric {
                reason: "mismatched response to revup".to_string(),
            });
        };
        match ops {
            None => Ok(None),
            Some(raw_ops) => {
                let mut operations = Vec::with_capacity(raw_ops.len());
                for raw in raw_ops {
                    operations.push(OperationMessage::new(Bytes::from(unhex(&raw)?)));
                }
                Ok(Some(Recovery { operations }))
            }
        }
    }
}

impl<C: PubsubChannel> PubsubRemotes<C> {
    /// `request` with a caller-chosen correlation id (snapshot streaming
    /// needs the id before the request goes out).
    fn request_with_correlation(
        &self,
        correlation: String,
        request: ControlRequest,
    ) -> Result<ControlResponse, RemotesError> {
        let peer = self.any_peer()?;
        let (sender, receiver) = bounded(1);
        self.shared
            .replies
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .insert(correlation.clone(), sender);

        let frame = ControlFrame {
            correlation: correlation.clone(),
            reply_to: self.shared.client.clone(),
            request,
        };
        let payload = Bytes::from(serde_json::to_vec(&frame).expect("frame renders"));
        let topic = self.shared.topic_for("ctl", &peer);
        self.shared.channel.publish(&topic, payload)?;

        let response = receiver.recv_timeout(self.network_timeout).map_err(|_| {
            self.shared
                .replies
                .lock()
                .unwrap_or_else(|err| err.into_inner())
                .remove(&correlation);
            RemotesError::Timeout {
                ms: self.network_timeout.as_millis() as u64,
            }
        })?;
        if let ControlResponse::Rejected { reason } = response {
            return Err(RemotesError::Rejected { reason });
        }
        Ok(response)
    }
}
