//! Batch accumulation and flushing
//!
//! Each batch worker owns a [`BatchBuffer`] and a flush timer. A batch is
//! flushed when:
//! - the buffer reaches `batch_size`
//! - the timer fires with a non-empty buffer
//! - the pipeline shuts down and auto commit is on (best effort, including
//!   items still queued on the channel)
//!
//! The timer restarts after every flush, not only after it fires.

use crate::error::{ProcessorError, Stage, is_fatal};
use crate::handler::BatchHandler;
use crate::pipeline::{Pipeline, SharedReceiver, recv_shared};
use crate::record::CommitCoordinate;
use std::mem;
use std::sync::Arc;
use strum::{Display, IntoStaticStr};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// A handled result on its way to a batch worker.
pub(crate) struct BatchItem<T> {
    pub(crate) output: T,
    /// `None` when the record was already committed (auto commit)
    pub(crate) coordinate: Option<CommitCoordinate>,
}

/// Upper bound on the slots reserved up front; larger batches grow on demand
const PREALLOCATED_SLOTS: usize = 1024;

/// Results waiting for the next flush, with the coordinates to commit after it.
#[derive(Debug)]
pub struct BatchBuffer<T> {
    items: Vec<T>,
    coordinates: Vec<CommitCoordinate>,
    capacity: usize,
}

impl<T> BatchBuffer<T> {
    /// Buffer that reports full at `capacity` items
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Vec::with_capacity(capacity.min(PREALLOCATED_SLOTS)),
            coordinates: Vec::with_capacity(capacity.min(PREALLOCATED_SLOTS)),
            capacity,
        }
    }

    /// Add a result, and the coordinate to commit after it is flushed
    pub fn push(&mut self, item: T, coordinate: Option<CommitCoordinate>) {
        self.items.push(item);
        if let Some(coordinate) = coordinate {
            self.coordinates.push(coordinate);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether the size threshold is reached
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Coordinates pending commit
    pub fn coordinates(&self) -> &[CommitCoordinate] {
        &self.coordinates
    }

    /// Drain the buffer, leaving it empty
    pub fn take(&mut self) -> (Vec<T>, Vec<CommitCoordinate>) {
        let reserve = self.capacity.min(PREALLOCATED_SLOTS);
        let items = mem::replace(&mut self.items, Vec::with_capacity(reserve));
        let coordinates = mem::replace(&mut self.coordinates, Vec::with_capacity(reserve));
        (items, coordinates)
    }
}

/// Why a batch was flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum FlushTrigger {
    Size,
    Interval,
    Shutdown,
}

/// One batch worker of a pipeline.
pub(crate) struct BatchWorker<T: Send + 'static> {
    pub(crate) id: usize,
    pub(crate) pipeline: Arc<Pipeline<T>>,
    pub(crate) handler: Arc<dyn BatchHandler<Output = T>>,
    pub(crate) receiver: SharedReceiver<BatchItem<T>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) buffer: BatchBuffer<T>,
}

impl<T: Send + 'static> BatchWorker<T> {
    pub(crate) async fn run(mut self) -> Result<(), ProcessorError> {
        let interval = self.pipeline.config().auto_batch_interval;
        let timer = sleep(interval);
        tokio::pin!(timer);

        debug!(handler = %self.pipeline.name(), worker = self.id, "Batch worker started");

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                item = recv_shared(&self.receiver) => match item {
                    Some(item) => {
                        self.buffer.push(item.output, item.coordinate);
                        if self.buffer.is_full() {
                            self.flush(FlushTrigger::Size).await?;
                            timer.as_mut().reset(Instant::now() + interval);
                        }
                    }
                    // Every handle worker is gone
                    None => break,
                },

                () = &mut timer => {
                    if !self.buffer.is_empty() {
                        self.flush(FlushTrigger::Interval).await?;
                    }
                    timer.as_mut().reset(Instant::now() + interval);
                }
            }
        }

        if self.pipeline.config().auto_commit {
            // Items still queued were already committed by the handle stage
            if let Ok(mut receiver) = self.receiver.try_lock() {
                while let Ok(item) = receiver.try_recv() {
                    self.buffer.push(item.output, item.coordinate);
                }
            }
            if !self.buffer.is_empty() {
                self.flush(FlushTrigger::Shutdown).await?;
            }
        }

        debug!(handler = %self.pipeline.name(), worker = self.id, "Batch worker stopped");
        Ok(())
    }

    /// Run the batch step over the buffer, then commit its coordinates.
    async fn flush(&mut self, trigger: FlushTrigger) -> Result<(), ProcessorError> {
        let (items, coordinates) = self.buffer.take();
        let size = items.len();
        let start = Instant::now();

        debug!(
            handler = %self.pipeline.name(),
            worker = self.id,
            size,
            %trigger,
            "Flushing batch"
        );

        match self.handler.batch(&self.cancel, items).await {
            Ok(()) => {}
            Err(e) if is_fatal(e.as_ref()) => {
                self.pipeline.metrics().error(Stage::Batch, true);
                error!(
                    handler = %self.pipeline.name(),
                    worker = self.id,
                    error = %e,
                    uncommitted = coordinates.len(),
                    "Fatal batch error, dropping batch without commit"
                );
                return Err(ProcessorError::fatal(self.pipeline.name(), Stage::Batch, e));
            }
            Err(e) => {
                self.pipeline.metrics().error(Stage::Batch, false);
                warn!(
                    handler = %self.pipeline.name(),
                    worker = self.id,
                    error = %e,
                    size,
                    "Batch failed, committing anyway"
                );
            }
        }

        self.pipeline
            .metrics()
            .batch_flushed(trigger.into(), size, start.elapsed());
        self.pipeline.commit(&coordinates).await
    }
}
