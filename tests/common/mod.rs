//! Shared harness for engine integration tests: an in-process fabric and
//! a shareable key/value backend so clones can be closed and reopened.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use skein::remotes::memory::{MemoryChannel, MemoryHub};
use skein::remotes::pubsub::PubsubRemotes;
use skein::{
    Batch, CloneConfig, CloneEngine, Constraint, Kvs, KvsError, MemoryKvs, OperationEncoder,
    Remotes,
};

pub const DOMAIN: &str = "test.example.org";

/// A memory backend that survives engine close, for restart scenarios.
#[derive(Clone, Default)]
pub struct SharedKvs {
    inner: Arc<Mutex<MemoryKvs>>,
}

impl SharedKvs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> Box<dyn Kvs> {
        Box::new(self.clone())
    }
}

impl Kvs for SharedKvs {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvsError> {
        self.inner.lock().unwrap().get(key)
    }

    fn write(&mut self, batch: Batch) -> Result<(), KvsError> {
        self.inner.lock().unwrap().write(batch)
    }

    fn next_after(
        &self,
        prefix: &[u8],
        after: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, KvsError> {
        self.inner.lock().unwrap().next_after(prefix, after)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, KvsError> {
        self.inner.lock().unwrap().scan_prefix(prefix)
    }

    fn is_empty(&self) -> Result<bool, KvsError> {
        self.inner.lock().unwrap().is_empty()
    }
}

pub fn config(id: &str) -> CloneConfig {
    CloneConfig::new(id, DOMAIN)
}

pub fn remotes_on(hub: &MemoryHub, config: &CloneConfig) -> (Box<dyn Remotes>, MemoryChannel) {
    let channel = hub.channel();
    let remotes = PubsubRemotes::new(
        channel.clone(),
        config.domain.clone(),
        config.id.clone(),
        config.network_timeout_ms,
        OperationEncoder::new(
            config.effective_context(),
            config.max_operation_size,
            config.limits.compress_threshold_bytes,
        ),
    );
    (Box::new(remotes), channel)
}

/// Spawn a clone on a fresh private backend.
pub fn spawn(hub: &MemoryHub, id: &str, genesis: bool) -> (CloneEngine, MemoryChannel) {
    spawn_with(hub, config(id).genesis(genesis), Box::new(MemoryKvs::new()))
        .expect("clone initialises")
}

pub fn spawn_with(
    hub: &MemoryHub,
    config: CloneConfig,
    kvs: Box<dyn Kvs>,
) -> skein::Result<(CloneEngine, MemoryChannel)> {
    spawn_full(hub, config, kvs, Vec::new())
}

pub fn spawn_full(
    hub: &MemoryHub,
    config: CloneConfig,
    kvs: Box<dyn Kvs>,
    constraints: Vec<Box<dyn Constraint>>,
) -> skein::Result<(CloneEngine, MemoryChannel)> {
    skein::telemetry::init_tracing(config.log_level);
    let (remotes, channel) = remotes_on(hub, &config);
    let engine = CloneEngine::clone(config, kvs, remotes, constraints)?;
    Ok((engine, channel))
}

/// Describe on every engine and assert they agree.
pub fn assert_converged(engines: &[&CloneEngine], ids: &[&str]) {
    for id in ids {
        let mut descriptions = engines
            .iter()
            .map(|engine| engine.describe(id).expect("describe succeeds"));
        let first = descriptions.next().expect("at least one engine");
        for other in descriptions {
            assert_eq!(other, first, "clones disagree about `{id}`");
        }
    }
}
