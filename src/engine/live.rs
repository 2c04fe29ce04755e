//! Bounded fan-out for status and update streams.
//!
//! Subscribers receive every published item in order through a bounded
//! queue. A subscriber that stops draining is disconnected rather than
//! allowed to block the engine.

use crossbeam::channel::{Receiver, RecvError, Sender, TryRecvError, TrySendError};

pub struct Broadcaster<T: Clone> {
    subscribers: Vec<Sender<T>>,
    max_subscribers: usize,
    queue_capacity: usize,
}

pub struct Subscription<T> {
    receiver: Receiver<T>,
}

impl<T> Subscription<T> {
    /// Blocks for the next item; `Err` means the stream completed.
    pub fn recv(&self) -> Result<T, RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn drain(&self) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(item) = self.receiver.try_recv() {
            out.push(item);
        }
        out
    }
}

impl<T: Clone> Broadcaster<T> {
    pub fn new(max_subscribers: usize, queue_capacity: usize) -> Self {
        Self {
            subscribers: Vec::new(),
            max_subscribers,
            queue_capacity,
        }
    }

    /// Subscribe, or `None` when the subscriber limit is reached.
    pub fn subscribe(&mut self) -> Option<Subscription<T>> {
        if self.subscribers.len() >= self.max_subscribers {
            return None;
        }
        let (sender, receiver) = crossbeam::channel::bounded(self.queue_capacity);
        self.subscribers.push(sender);
        Some(Subscription { receiver })
    }

    /// Publish to every subscriber; laggards and the departed are dropped.
    pub fn publish(&mut self, item: &T) {
        self.subscribers.retain(|sender| {
            match sender.try_send(item.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Complete all streams: receivers see disconnection after draining.
    pub fn complete(&mut self) {
        self.subscribers.clear();
    }
}
