//! Handler traits.
//!
//! This module provides:
//! - `Handler` for per-record processing
//! - `BatchHandler` for handlers that aggregate results before committing
//! - `FnHandler` for building a handler from a pair of closures
//! - `Capability`, the handler kind resolved once at registration

use crate::error::BoxError;
use crate::record::Record;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Per-record processing unit.
///
/// `handle` returns the value to pass on to the batch step, or `None` to drop
/// the record after committing it. Return an error wrapped with
/// [`fatal`](crate::fatal) to stop the processor; any other error is logged
/// and the record is still committed.
///
/// `cancel` is cancelled once the processor is shutting down.
///
/// # Example
///
/// ```rust,ignore
/// use stream_processor::{BoxError, Handler, Record};
///
/// struct AuditHandler;
///
/// #[async_trait]
/// impl Handler for AuditHandler {
///     type Output = AuditEntry;
///
///     fn name(&self) -> &str {
///         "audit"
///     }
///
///     async fn handle(
///         &self,
///         _cancel: &CancellationToken,
///         record: Record,
///     ) -> Result<Option<AuditEntry>, BoxError> {
///         Ok(Some(record.json()?))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Result of processing one record
    type Output: Send + 'static;

    /// Handler name. Selects the source and the options of the handler.
    fn name(&self) -> &str;

    /// Process one record.
    async fn handle(
        &self,
        cancel: &CancellationToken,
        record: Record,
    ) -> Result<Option<Self::Output>, BoxError>;
}

/// Handler with a batch step.
///
/// Results of `handle` are accumulated per batch worker and passed to `batch`
/// once `batch_size` of them are buffered or the flush interval elapses. The
/// records behind a batch are committed after `batch` returns, unless it
/// returned a fatal error.
///
/// The final flush on shutdown (auto commit only) runs with `cancel` already
/// cancelled.
#[async_trait]
pub trait BatchHandler: Handler {
    /// Process a flushed batch.
    async fn batch(
        &self,
        cancel: &CancellationToken,
        items: Vec<Self::Output>,
    ) -> Result<(), BoxError>;
}

/// Boxed per-record closure used by [`FnHandler`]
pub type HandleFn<T> = Arc<
    dyn Fn(CancellationToken, Record) -> BoxFuture<'static, Result<Option<T>, BoxError>>
        + Send
        + Sync,
>;

/// Boxed batch closure used by [`FnHandler`]
pub type BatchFn<T> =
    Arc<dyn Fn(CancellationToken, Vec<T>) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Handler built from closures.
///
/// Both closures get a clone of the pipeline's cancellation token.
///
/// ```rust,ignore
/// let handler = FnHandler::new("orders", |_cancel, record: Record| async move {
///     Ok(Some(record.json::<Order>()?))
/// })
/// .with_batch(|_cancel, orders: Vec<Order>| async move {
///     store.insert_all(orders).await
/// });
/// registry.register_fn(handler)?;
/// ```
pub struct FnHandler<T> {
    name: String,
    handle: HandleFn<T>,
    batch: Option<BatchFn<T>>,
}

impl<T: Send + 'static> FnHandler<T> {
    /// Create a handler without a batch step
    pub fn new<F, Fut>(name: impl Into<String>, handle: F) -> Self
    where
        F: Fn(CancellationToken, Record) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<T>, BoxError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            handle: Arc::new(move |cancel, record| Box::pin(handle(cancel, record))),
            batch: None,
        }
    }

    /// Add a batch step
    pub fn with_batch<F, Fut>(mut self, batch: F) -> Self
    where
        F: Fn(CancellationToken, Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.batch = Some(Arc::new(move |cancel, items| Box::pin(batch(cancel, items))));
        self
    }

    /// Whether a batch step was provided
    pub fn has_batch(&self) -> bool {
        self.batch.is_some()
    }

    /// Resolve the handler kind
    pub fn into_capability(self) -> Capability<T> {
        if self.batch.is_some() {
            Capability::Batched(Arc::new(self))
        } else {
            Capability::HandleOnly(Arc::new(self))
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Handler for FnHandler<T> {
    type Output = T;

    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        cancel: &CancellationToken,
        record: Record,
    ) -> Result<Option<T>, BoxError> {
        (self.handle)(cancel.clone(), record).await
    }
}

#[async_trait]
impl<T: Send + 'static> BatchHandler for FnHandler<T> {
    async fn batch(&self, cancel: &CancellationToken, items: Vec<T>) -> Result<(), BoxError> {
        match &self.batch {
            Some(batch) => batch(cancel.clone(), items).await,
            None => Ok(()),
        }
    }
}

/// What a registered handler can do, decided once at registration.
pub enum Capability<T> {
    /// Commit right after `handle`
    HandleOnly(Arc<dyn Handler<Output = T>>),
    /// Accumulate results and commit after `batch`
    Batched(Arc<dyn BatchHandler<Output = T>>),
}

impl<T: Send + 'static> Capability<T> {
    pub fn name(&self) -> &str {
        match self {
            Capability::HandleOnly(handler) => handler.name(),
            Capability::Batched(handler) => handler.name(),
        }
    }

    pub fn is_batched(&self) -> bool {
        matches!(self, Capability::Batched(_))
    }

    pub(crate) async fn handle(
        &self,
        cancel: &CancellationToken,
        record: Record,
    ) -> Result<Option<T>, BoxError> {
        match self {
            Capability::HandleOnly(handler) => handler.handle(cancel, record).await,
            Capability::Batched(handler) => handler.handle(cancel, record).await,
        }
    }
}
