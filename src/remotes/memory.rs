//! In-process pub/sub fabric.
//!
//! A hub wires channels within one process: publishing delivers
//! synchronously to every other subscribed channel. Presence uses
//! retained payloads so late joiners see who is already live. Used by
//! integration tests and single-process embeddings.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use super::RemotesError;
use super::pubsub::{MessageHandler, PubsubChannel};

struct SubEntry {
    channel_key: u64,
    topic: String,
    handler: MessageHandler,
    connected: Arc<AtomicBool>,
}

#[derive(Default)]
struct HubInner {
    next_key: u64,
    subs: Vec<SubEntry>,
    retained: BTreeMap<String, BTreeMap<String, Bytes>>,
}

/// The shared fabric; hand each clone a channel via [`MemoryHub::channel`].
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self) -> MemoryChannel {
        let key = {
            let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
            inner.next_key += 1;
            inner.next_key
        };
        MemoryChannel {
            inner: Arc::clone(&self.inner),
            key,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }
}

#[derive(Clone)]
pub struct MemoryChannel {
    inner: Arc<Mutex<HubInner>>,
    key: u64,
    connected: Arc<AtomicBool>,
}

impl MemoryChannel {
    /// Simulate a transport (dis)connection for this channel.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn ensure_connected(&self) -> Result<(), RemotesError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemotesError::Fabric {
                reason: "channel disconnected".to_string(),
            })
        }
    }

    /// Handlers are collected under the lock but invoked outside it, so a
    /// handler may publish again without deadlocking.
    fn fan_out(&self, topic: &str, payload: &Bytes) {
        let handlers: Vec<MessageHandler> = {
            let inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
            inner
                .subs
                .iter()
                .filter(|sub| {
                    sub.channel_key != self.key
                        && sub.topic == topic
                        && sub.connected.load(Ordering::SeqCst)
                })
                .map(|sub| Arc::clone(&sub.handler))
                .collect()
        };
        for handler in handlers {
            handler(payload.clone());
        }
    }
}

impl PubsubChannel for MemoryChannel {
    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish(&self, topic: &str, payload: Bytes) -> Result<(), RemotesError> {
        self.ensure_connected()?;
        self.fan_out(topic, &payload);
        Ok(())
    }

    fn publish_retained(
        &self,
        topic: &str,
        retain_key: &str,
        payload: Bytes,
    ) -> Result<(), RemotesError> {
        self.ensure_connected()?;
        {
            let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
            inner
                .retained
                .entry(topic.to_string())
                .or_default()
                .insert(retain_key.to_string(), payload.clone());
        }
        self.fan_out(topic, &payload);
        Ok(())
    }

    fn clear_retained(&self, topic: &str, retain_key: &str) -> Result<(), RemotesError> {
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        if let Some(entries) = inner.retained.get_mut(topic) {
            entries.remove(retain_key);
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), RemotesError> {
        self.ensure_connected()?;
        let replay: Vec<Bytes> = {
            let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
            inner.subs.push(SubEntry {
                channel_key: self.key,
                topic: topic.to_string(),
                handler: Arc::clone(&handler),
                connected: Arc::clone(&self.connected),
            });
            inner
                .retained
                .get(topic)
                .map(|entries| entries.values().cloned().collect())
                .unwrap_or_default()
        };
        for payload in replay {
            handler(payload);
        }
        Ok(())
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), RemotesError> {
        let mut inner = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        inner
            .subs
            .retain(|sub| !(sub.channel_key == self.key && sub.topic == topic));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn recording() -> (MessageHandler, Arc<Mutex<Vec<Vec<u8>>>>) {
        let log: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();
        let sink = Arc::clone(&log);
        let handler: MessageHandler = Arc::new(move |payload: Bytes| {
            sink.lock().unwrap().push(payload.to_vec());
        });
        (handler, log)
    }

    #[test]
    fn publish_reaches_other_channels_only() {
        let hub = MemoryHub::new();
        let a = hub.channel();
        let b = hub.channel();

        let (handler_a, log_a) = recording();
        let (handler_b, log_b) = recording();
        a.subscribe("d/ops", handler_a).unwrap();
        b.subscribe("d/ops", handler_b).unwrap();

        a.publish("d/ops", Bytes::from_static(b"x")).unwrap();
        assert!(log_a.lock().unwrap().is_empty());
        assert_eq!(log_b.lock().unwrap().len(), 1);
    }

    #[test]
    fn retained_payloads_replay_on_subscribe() {
        let hub = MemoryHub::new();
        let a = hub.channel();
        let b = hub.channel();

        a.publish_retained("d/presence", "a", Bytes::from_static(b"live"))
            .unwrap();

        let (handler, log) = recording();
        b.subscribe("d/presence", handler).unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);

        a.clear_retained("d/presence", "a").unwrap();
        let c = hub.channel();
        let (handler_c, log_c) = recording();
        c.subscribe("d/presence", handler_c).unwrap();
        assert!(log_c.lock().unwrap().is_empty());
    }

    #[test]
    fn disconnected_channels_refuse_io() {
        let hub = MemoryHub::new();
        let a = hub.channel();
        a.set_connected(false);
        assert!(!a.connected());
        assert!(a.publish("d/ops", Bytes::new()).is_err());
        a.set_connected(true);
        assert!(a.publish("d/ops", Bytes::new()).is_ok());
    }

    #[test]
    fn handlers_may_publish_reentrantly() {
        let hub = MemoryHub::new();
        let a = hub.channel();
        let b = hub.channel();

        let (final_handler, log) = recording();
        a.subscribe("d/rpy", final_handler).unwrap();

        // b echoes anything on d/ctl back out on d/rpy.
        let echo_channel = b.clone();
        let echo: MessageHandler = Arc::new(move |payload: Bytes| {
            echo_channel.publish("d/rpy", payload).unwrap();
        });
        b.subscribe("d/ctl", echo).unwrap();

        a.publish("d/ctl", Bytes::from_static(b"ping")).unwrap();
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let hub = MemoryHub::new();
        let a = hub.channel();
        let b = hub.channel();

        let (handler, log) = recording();
        b.subscribe("d/ops", handler).unwrap();
        b.unsubscribe("d/ops").unwrap();
        a.publish("d/ops", Bytes::from_static(b"x")).unwrap();
        assert!(log.lock().unwrap().is_empty());
    }
}
