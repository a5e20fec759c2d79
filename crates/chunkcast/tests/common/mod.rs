//! Common test utilities for chunkcast integration tests
//!
//! - [`FlakyGateway`]: a [`MemoryGateway`] with scripted failures and delays
//! - [`RecordingSink`]: a decoder sink that records every call and can be
//!   told to refuse appends

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use castconf::{ConsumerConfig, ProducerConfig};
use castore::{Acl, MemoryGateway, ObjectUri, StorageError, StorageGateway, WriterAuth};
use chunkcast::consumer::{DecoderSink, SinkError, SinkFactory};

/// Payload for capture index `index`.
pub fn segment(index: u64) -> Bytes {
    Bytes::from(format!("<segment {index}>"))
}

/// Producer tunables scaled down for paused-clock tests.
pub fn producer_config() -> ProducerConfig {
    ProducerConfig {
        segment_duration_ms: 1_000,
        upload_backoff_base_ms: 100,
        upload_backoff_max_ms: 500,
        upload_max_attempts: 0,
        drain_timeout_ms: 10_000,
        queue_capacity: 16,
        ..ProducerConfig::default()
    }
}

/// Consumer tunables scaled down for paused-clock tests.
pub fn consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        poll_interval_ms: 1_000,
        bootstrap_segments: 2,
        prefetch_depth: 3,
        fetch_max_attempts: 5,
        fetch_backoff_base_ms: 100,
        fetch_backoff_max_ms: 400,
        manifest_max_attempts: 3,
        sink_retry_delay_ms: 50,
        sink_capacity_bytes: 1024,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Put,
    PutMutable,
    Update,
    /// An update refused by [`FlakyGateway::deny_updates`].
    UpdateDenied,
    /// A `get` that returned bytes.
    Get(ObjectUri),
}

#[derive(Default)]
struct Faults {
    put_failures: u32,
    update_failures: u32,
    deny_updates: bool,
    get_failures: HashMap<ObjectUri, u32>,
    get_delays: HashMap<ObjectUri, Duration>,
    get_attempts: HashMap<ObjectUri, u32>,
}

/// In-memory gateway with fault injection.
#[derive(Default)]
pub struct FlakyGateway {
    inner: MemoryGateway,
    faults: Mutex<Faults>,
    calls: Mutex<Vec<Call>>,
}

impl FlakyGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn inner(&self) -> &MemoryGateway {
        &self.inner
    }

    /// The next `count` puts fail with `Unavailable`.
    pub fn fail_next_puts(&self, count: u32) {
        self.faults.lock().unwrap().put_failures = count;
    }

    /// The next `count` manifest updates fail with `Unavailable`.
    pub fn fail_next_updates(&self, count: u32) {
        self.faults.lock().unwrap().update_failures = count;
    }

    /// Every manifest update from now on is refused as unauthorized.
    pub fn deny_updates(&self) {
        self.faults.lock().unwrap().deny_updates = true;
    }

    /// The next `count` gets of `uri` fail with `Unavailable`.
    pub fn fail_gets(&self, uri: &ObjectUri, count: u32) {
        self.faults
            .lock()
            .unwrap()
            .get_failures
            .insert(uri.clone(), count);
    }

    /// Successful gets of `uri` take `delay` to complete.
    pub fn delay_gets(&self, uri: &ObjectUri, delay: Duration) {
        self.faults
            .lock()
            .unwrap()
            .get_delays
            .insert(uri.clone(), delay);
    }

    pub fn get_attempts(&self, uri: &ObjectUri) -> u32 {
        self.faults
            .lock()
            .unwrap()
            .get_attempts
            .get(uri)
            .copied()
            .unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn update_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| **call == Call::Update)
            .count()
    }

    /// URIs in the order their gets completed successfully.
    pub fn completed_gets(&self) -> Vec<ObjectUri> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Get(uri) => Some(uri),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn take_failure(counter: &mut u32) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl StorageGateway for FlakyGateway {
    async fn put(&self, data: Bytes, acl: Acl) -> Result<ObjectUri, StorageError> {
        if Self::take_failure(&mut self.faults.lock().unwrap().put_failures) {
            return Err(StorageError::Unavailable("injected put failure".into()));
        }
        let uri = self.inner.put(data, acl).await?;
        self.record(Call::Put);
        Ok(uri)
    }

    async fn put_mutable(&self, data: Bytes, acl: Acl) -> Result<ObjectUri, StorageError> {
        let uri = self.inner.put_mutable(data, acl).await?;
        self.record(Call::PutMutable);
        Ok(uri)
    }

    async fn update_mutable(
        &self,
        uri: &ObjectUri,
        data: Bytes,
        auth: &WriterAuth,
    ) -> Result<(), StorageError> {
        {
            let mut faults = self.faults.lock().unwrap();
            if faults.deny_updates {
                self.record(Call::UpdateDenied);
                return Err(StorageError::AuthorizationDenied {
                    uri: uri.to_string(),
                    reason: "writer revoked".into(),
                });
            }
            if Self::take_failure(&mut faults.update_failures) {
                return Err(StorageError::Unavailable("injected update failure".into()));
            }
        }
        self.inner.update_mutable(uri, data, auth).await?;
        self.record(Call::Update);
        Ok(())
    }

    async fn get(&self, uri: &ObjectUri) -> Result<Bytes, StorageError> {
        let delay = {
            let mut faults = self.faults.lock().unwrap();
            *faults.get_attempts.entry(uri.clone()).or_default() += 1;
            if let Some(remaining) = faults.get_failures.get_mut(uri) {
                if Self::take_failure(remaining) {
                    return Err(StorageError::Unavailable("injected get failure".into()));
                }
            }
            faults.get_delays.get(uri).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let data = self.inner.get(uri).await?;
        self.record(Call::Get(uri.clone()));
        Ok(data)
    }

    async fn resolve(&self, uri: &ObjectUri) -> Result<url::Url, StorageError> {
        self.inner.resolve(uri).await
    }
}

#[derive(Default)]
pub struct SinkRecord {
    pub appends: Vec<Bytes>,
    pub rejected: Vec<SinkError>,
    pub end_of_stream: u32,
    pub evictions: u32,
    script: VecDeque<SinkError>,
}

/// Shared view of everything a [`RecordingSink`] was asked to do.
#[derive(Clone, Default)]
pub struct SinkLog {
    record: Arc<Mutex<SinkRecord>>,
}

impl SinkLog {
    /// Refuse the next appends with these errors, in order.
    pub fn script(&self, errors: impl IntoIterator<Item = SinkError>) {
        self.record.lock().unwrap().script.extend(errors);
    }

    pub fn appends(&self) -> Vec<Bytes> {
        self.record.lock().unwrap().appends.clone()
    }

    pub fn rejected(&self) -> Vec<SinkError> {
        self.record.lock().unwrap().rejected.clone()
    }

    pub fn end_of_stream_count(&self) -> u32 {
        self.record.lock().unwrap().end_of_stream
    }

    pub fn evictions(&self) -> u32 {
        self.record.lock().unwrap().evictions
    }
}

pub struct RecordingSink {
    log: SinkLog,
}

impl RecordingSink {
    pub fn new() -> (Self, SinkLog) {
        let log = SinkLog::default();
        (Self { log: log.clone() }, log)
    }
}

#[async_trait]
impl DecoderSink for RecordingSink {
    async fn append(&mut self, data: Bytes) -> Result<(), SinkError> {
        let mut record = self.log.record.lock().unwrap();
        if let Some(err) = record.script.pop_front() {
            record.rejected.push(err.clone());
            return Err(err);
        }
        record.appends.push(data);
        Ok(())
    }

    async fn evict_consumed(&mut self) -> Result<usize, SinkError> {
        self.log.record.lock().unwrap().evictions += 1;
        Ok(1024)
    }

    async fn end_of_stream(&mut self) -> Result<(), SinkError> {
        self.log.record.lock().unwrap().end_of_stream += 1;
        Ok(())
    }
}

pub struct RecordingSinkFactory {
    log: SinkLog,
}

impl RecordingSinkFactory {
    pub fn new() -> (Arc<Self>, SinkLog) {
        let log = SinkLog::default();
        (Arc::new(Self { log: log.clone() }), log)
    }
}

#[async_trait]
impl SinkFactory for RecordingSinkFactory {
    async fn create_sink(&self, _codec_hint: &str) -> Result<Box<dyn DecoderSink>, SinkError> {
        Ok(Box::new(RecordingSink {
            log: self.log.clone(),
        }))
    }
}
