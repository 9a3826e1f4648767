//! Per-handler pipeline
//!
//! ```text
//! source ──fetch_workers──► records ──handle_workers──► batch items ──batch_workers──► batch()
//!              │                            │                                            │
//!              ▼                            ▼                                            ▼
//!        Fetch error ends run      commit (no batch step)                        aggregated commit
//! ```
//!
//! Channels are bounded by `channel_capacity` and never closed explicitly: a
//! channel closes once every producer worker has exited and dropped its sender.

use crate::batch::{BatchBuffer, BatchItem, BatchWorker};
use crate::config::HandlerConfig;
use crate::error::{ProcessorError, Stage, is_fatal};
use crate::handler::Capability;
use crate::metrics::ProcessorMetrics;
use crate::record::{CommitCoordinate, Record};
use crate::source::MessageSource;
use std::slice;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receiver shared by every consumer worker of a stage
pub(crate) type SharedReceiver<T> = Arc<Mutex<mpsc::Receiver<T>>>;

/// Receive from a shared receiver. Cancellation safe.
pub(crate) async fn recv_shared<T>(receiver: &SharedReceiver<T>) -> Option<T> {
    receiver.lock().await.recv().await
}

pub(crate) type WorkerTasks = JoinSet<Result<(), ProcessorError>>;

/// A registered pipeline, erased over its handler's output type.
pub(crate) trait Launch: Send + Sync {
    fn name(&self) -> &str;

    /// Spawn every worker of the pipeline into `tasks`
    fn launch(self: Arc<Self>, tasks: &mut WorkerTasks, cancel: &CancellationToken);
}

/// One handler with its source, options and metrics.
pub(crate) struct Pipeline<T> {
    config: HandlerConfig,
    source: Arc<dyn MessageSource>,
    capability: Capability<T>,
    metrics: ProcessorMetrics,
}

impl<T: Send + 'static> Pipeline<T> {
    pub(crate) fn new(
        config: HandlerConfig,
        source: Arc<dyn MessageSource>,
        capability: Capability<T>,
    ) -> Self {
        let metrics = ProcessorMetrics::new(config.name.clone());
        Self {
            config,
            source,
            capability,
            metrics,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn config(&self) -> &HandlerConfig {
        &self.config
    }

    pub(crate) fn metrics(&self) -> &ProcessorMetrics {
        &self.metrics
    }

    /// Commit coordinates on the source. Empty input is a no-op.
    pub(crate) async fn commit(&self, coordinates: &[CommitCoordinate]) -> Result<(), ProcessorError> {
        if coordinates.is_empty() {
            return Ok(());
        }

        match self.source.commit(coordinates).await {
            Ok(()) => {
                self.metrics.committed(coordinates.len());
                debug!(handler = %self.name(), count = coordinates.len(), "Committed");
                Ok(())
            }
            Err(source) => {
                self.metrics.error(Stage::Commit, true);
                error!(
                    handler = %self.name(),
                    count = coordinates.len(),
                    error = %source,
                    "Commit failed"
                );
                Err(ProcessorError::Commit {
                    handler: self.name().to_string(),
                    source,
                })
            }
        }
    }

    async fn fetch_worker(
        self: Arc<Self>,
        id: usize,
        records: mpsc::Sender<Record>,
        cancel: CancellationToken,
    ) -> Result<(), ProcessorError> {
        debug!(handler = %self.name(), worker = id, "Fetch worker started");

        loop {
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                fetched = self.source.fetch_next() => fetched,
            };

            let record = match fetched {
                Ok(record) => record,
                Err(source) => {
                    self.metrics.error(Stage::Fetch, true);
                    error!(handler = %self.name(), worker = id, error = %source, "Fetch failed");
                    return Err(ProcessorError::Fetch {
                        handler: self.name().to_string(),
                        source,
                    });
                }
            };
            self.metrics.record_fetched();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = records.send(record) => {
                    // Every handle worker is gone
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(handler = %self.name(), worker = id, "Fetch worker stopped");
        Ok(())
    }

    async fn handle_worker(
        self: Arc<Self>,
        id: usize,
        records: SharedReceiver<Record>,
        batch: Option<mpsc::Sender<BatchItem<T>>>,
        cancel: CancellationToken,
    ) -> Result<(), ProcessorError> {
        debug!(handler = %self.name(), worker = id, "Handle worker started");

        loop {
            let record = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                record = recv_shared(&records) => match record {
                    Some(record) => record,
                    None => break,
                },
            };

            let coordinate = record.coordinate();
            let start = Instant::now();
            let output = match self.capability.handle(&cancel, record).await {
                Ok(output) => {
                    self.metrics.record_handled("ok", start.elapsed());
                    output
                }
                Err(e) if is_fatal(e.as_ref()) => {
                    self.metrics.record_handled("fatal", start.elapsed());
                    self.metrics.error(Stage::Handle, true);
                    error!(
                        handler = %self.name(),
                        topic = %coordinate.topic,
                        partition = coordinate.partition,
                        offset = coordinate.offset,
                        error = %e,
                        "Fatal handle error"
                    );
                    return Err(ProcessorError::fatal(self.name(), Stage::Handle, e));
                }
                Err(e) => {
                    self.metrics.record_handled("error", start.elapsed());
                    self.metrics.error(Stage::Handle, false);
                    warn!(
                        handler = %self.name(),
                        topic = %coordinate.topic,
                        partition = coordinate.partition,
                        offset = coordinate.offset,
                        error = %e,
                        "Handle failed, committing record"
                    );
                    None
                }
            };

            // Leave the record uncommitted so it is delivered again
            if cancel.is_cancelled() {
                debug!(handler = %self.name(), %coordinate, "Cancelled during handle");
                break;
            }

            match (output, &batch) {
                (Some(output), Some(batch)) => {
                    let auto_commit = self.config.auto_commit;
                    let item = BatchItem {
                        output,
                        coordinate: (!auto_commit).then(|| coordinate.clone()),
                    };

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        sent = batch.send(item) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }

                    if auto_commit {
                        self.commit(slice::from_ref(&coordinate)).await?;
                    }
                }
                _ => self.commit(slice::from_ref(&coordinate)).await?,
            }
        }

        debug!(handler = %self.name(), worker = id, "Handle worker stopped");
        Ok(())
    }
}

impl<T: Send + 'static> Launch for Pipeline<T> {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn launch(self: Arc<Self>, tasks: &mut WorkerTasks, cancel: &CancellationToken) {
        let capacity = self.config.channel_capacity;
        let (record_tx, record_rx) = mpsc::channel::<Record>(capacity);
        let record_rx: SharedReceiver<Record> = Arc::new(Mutex::new(record_rx));

        for id in 0..self.config.fetch_workers {
            tasks.spawn(Arc::clone(&self).fetch_worker(id, record_tx.clone(), cancel.clone()));
        }
        drop(record_tx);

        let (batch_tx, batch_workers) = match &self.capability {
            Capability::Batched(handler) => {
                let (batch_tx, batch_rx) = mpsc::channel::<BatchItem<T>>(capacity);
                let batch_rx: SharedReceiver<BatchItem<T>> = Arc::new(Mutex::new(batch_rx));

                for id in 0..self.config.batch_workers {
                    let worker = BatchWorker {
                        id,
                        pipeline: Arc::clone(&self),
                        handler: Arc::clone(handler),
                        receiver: Arc::clone(&batch_rx),
                        cancel: cancel.clone(),
                        buffer: BatchBuffer::new(self.config.batch_size),
                    };
                    tasks.spawn(worker.run());
                }
                (Some(batch_tx), self.config.batch_workers)
            }
            Capability::HandleOnly(_) => (None, 0),
        };

        for id in 0..self.config.handle_workers {
            tasks.spawn(Arc::clone(&self).handle_worker(
                id,
                Arc::clone(&record_rx),
                batch_tx.clone(),
                cancel.clone(),
            ));
        }
        drop(batch_tx);

        self.metrics.workers(Stage::Fetch, self.config.fetch_workers);
        self.metrics.workers(Stage::Handle, self.config.handle_workers);
        self.metrics.workers(Stage::Batch, batch_workers);

        info!(
            handler = %self.name(),
            fetch_workers = self.config.fetch_workers,
            handle_workers = self.config.handle_workers,
            batch_workers,
            batch_size = self.config.batch_size,
            auto_commit = self.config.auto_commit,
            "Pipeline started"
        );
    }
}
