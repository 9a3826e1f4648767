//! Message source contract
//!
//! A [`MessageSource`] is the broker client seen from the processor: it hands out
//! records one at a time and accepts commits for coordinates it handed out.
//! Connection management and offset storage live behind this trait.
//!
//! [`MemorySource`] is an in-process implementation used by tests and local runs.

use crate::error::BoxError;
use crate::record::{CommitCoordinate, Record};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::{Mutex, Notify, mpsc};
use tracing::debug;

/// Source of records for one handler.
///
/// Implementations are shared between every worker of a pipeline, so commits may
/// arrive concurrently from several workers and must be safe to interleave.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Wait for the next record.
    ///
    /// The processor drops the returned future when it shuts down, so the call
    /// must be cancellation safe.
    async fn fetch_next(&self) -> Result<Record, BoxError>;

    /// Commit consumption progress for the given coordinates.
    async fn commit(&self, coordinates: &[CommitCoordinate]) -> Result<(), BoxError>;

    /// Consumer group the source reads under. Registration fails without one.
    fn group_id(&self) -> Option<&str>;
}

/// Builds the source for a handler, keyed by handler name.
pub trait SourceProvider: Send + Sync {
    fn make(&self, name: &str) -> Result<Arc<dyn MessageSource>, BoxError>;
}

/// In-memory message source.
///
/// Records pushed into the source are delivered in push order; `fetch_next`
/// blocks while the source is empty, like a consumer waiting on an idle topic.
pub struct MemorySource {
    topic: String,
    group_id: Option<String>,
    next_offset: AtomicI64,
    sender: mpsc::UnboundedSender<Result<Record, String>>,
    receiver: Mutex<mpsc::UnboundedReceiver<Result<Record, String>>>,
    commit_failure: Option<String>,
    commits: Mutex<Vec<Vec<CommitCoordinate>>>,
    committed: Notify,
}

impl MemorySource {
    /// Create a source for `topic` reading under consumer group `group_id`
    pub fn new(topic: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self::build(topic.into(), Some(group_id.into()))
    }

    /// Create a source with no consumer group
    pub fn without_group(topic: impl Into<String>) -> Self {
        Self::build(topic.into(), None)
    }

    fn build(topic: String, group_id: Option<String>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            topic,
            group_id,
            next_offset: AtomicI64::new(0),
            sender,
            receiver: Mutex::new(receiver),
            commit_failure: None,
            commits: Mutex::new(Vec::new()),
            committed: Notify::new(),
        }
    }

    /// Make every commit fail with the given message
    pub fn with_commit_failure(mut self, message: impl Into<String>) -> Self {
        self.commit_failure = Some(message.into());
        self
    }

    /// Topic used by [`push_payload`](Self::push_payload)
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Queue a record
    pub fn push(&self, record: Record) {
        // The receiver lives as long as self, so the send cannot fail.
        let _ = self.sender.send(Ok(record));
    }

    /// Queue a payload on partition 0 of the source topic, at the next offset
    pub fn push_payload(&self, payload: impl Into<Vec<u8>>) -> CommitCoordinate {
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        let record = Record::new(self.topic.clone(), 0, offset, payload);
        let coordinate = record.coordinate();
        self.push(record);
        coordinate
    }

    /// Make the next fetch (after already queued records) fail
    pub fn push_fetch_error(&self, message: impl Into<String>) {
        let _ = self.sender.send(Err(message.into()));
    }

    /// Every commit call, in call order
    pub async fn commit_calls(&self) -> Vec<Vec<CommitCoordinate>> {
        self.commits.lock().await.clone()
    }

    /// All committed coordinates, flattened in commit order
    pub async fn committed(&self) -> Vec<CommitCoordinate> {
        self.commits.lock().await.iter().flatten().cloned().collect()
    }

    /// Wait until at least `count` coordinates have been committed
    pub async fn wait_for_commits(&self, count: usize) {
        loop {
            let notified = self.committed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.committed().await.len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn fetch_next(&self) -> Result<Record, BoxError> {
        let mut receiver = self.receiver.lock().await;
        match receiver.recv().await {
            Some(Ok(record)) => Ok(record),
            Some(Err(message)) => Err(message.into()),
            None => Err("memory source closed".into()),
        }
    }

    async fn commit(&self, coordinates: &[CommitCoordinate]) -> Result<(), BoxError> {
        if let Some(message) = &self.commit_failure {
            return Err(message.clone().into());
        }

        debug!(topic = %self.topic, count = coordinates.len(), "Committing coordinates");
        self.commits.lock().await.push(coordinates.to_vec());
        self.committed.notify_waiters();
        Ok(())
    }

    fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }
}

/// Hands out pre-built [`MemorySource`]s by handler name.
#[derive(Default, Clone)]
pub struct MemorySourceProvider {
    sources: HashMap<String, Arc<MemorySource>>,
}

impl MemorySourceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the source returned for `name`
    pub fn with_source(mut self, name: impl Into<String>, source: Arc<MemorySource>) -> Self {
        self.sources.insert(name.into(), source);
        self
    }
}

impl SourceProvider for MemorySourceProvider {
    fn make(&self, name: &str) -> Result<Arc<dyn MessageSource>, BoxError> {
        self.sources
            .get(name)
            .map(|source| Arc::clone(source) as Arc<dyn MessageSource>)
            .ok_or_else(|| format!("no source configured for {name}").into())
    }
}
