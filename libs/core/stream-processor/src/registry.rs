//! Handler registry and run lifecycle
//!
//! Handlers are validated when registered: duplicate names, sources that fail
//! to build and sources without a consumer group are rejected before any
//! worker starts. [`Registry::start`] then spawns every pipeline under one
//! cancellation token. The first worker failure cancels the rest.

use crate::config::{ConfigSource, HandlerConfig, NoConfig};
use crate::error::ProcessorError;
use crate::handler::{BatchHandler, Capability, FnHandler, Handler};
use crate::pipeline::{Launch, Pipeline, WorkerTasks};
use crate::source::SourceProvider;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Registers a group of handlers, typically one per application module.
///
/// ```rust,ignore
/// struct BillingModule { store: Arc<Store> }
///
/// impl HandlerProvider for BillingModule {
///     fn provide_handlers(&self, registry: &mut Registry) -> Result<(), ProcessorError> {
///         registry.register_batch(InvoiceHandler::new(self.store.clone()))?;
///         registry.register(RefundAuditHandler)
///     }
/// }
/// ```
pub trait HandlerProvider {
    fn provide_handlers(&self, registry: &mut Registry) -> Result<(), ProcessorError>;
}

/// Set of handlers run together.
pub struct Registry {
    sources: Arc<dyn SourceProvider>,
    config: Arc<dyn ConfigSource>,
    pipelines: Vec<Arc<dyn Launch>>,
    names: HashSet<String>,
}

impl Registry {
    /// Create an empty registry building sources with `sources`.
    ///
    /// Handlers run with default options until a config source is set.
    pub fn new(sources: impl SourceProvider + 'static) -> Self {
        Self {
            sources: Arc::new(sources),
            config: Arc::new(NoConfig),
            pipelines: Vec::new(),
            names: HashSet::new(),
        }
    }

    /// Resolve handler options from `config`
    pub fn with_config(mut self, config: impl ConfigSource + 'static) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// Register a handler that commits each record after `handle`
    pub fn register<H: Handler>(&mut self, handler: H) -> Result<(), ProcessorError> {
        let handler: Arc<dyn Handler<Output = H::Output>> = Arc::new(handler);
        self.add(Capability::HandleOnly(handler))
    }

    /// Register a handler with a batch step
    pub fn register_batch<H: BatchHandler>(&mut self, handler: H) -> Result<(), ProcessorError> {
        let handler: Arc<dyn BatchHandler<Output = H::Output>> = Arc::new(handler);
        self.add(Capability::Batched(handler))
    }

    /// Register a closure based handler
    pub fn register_fn<T: Send + 'static>(
        &mut self,
        handler: FnHandler<T>,
    ) -> Result<(), ProcessorError> {
        self.add(handler.into_capability())
    }

    /// Let each provider register its handlers, stopping at the first error
    pub fn apply(&mut self, providers: &[&dyn HandlerProvider]) -> Result<(), ProcessorError> {
        for provider in providers {
            provider.provide_handlers(self)?;
        }
        Ok(())
    }

    fn add<T: Send + 'static>(&mut self, capability: Capability<T>) -> Result<(), ProcessorError> {
        let name = HandlerConfig::new(capability.name()).name;
        if self.names.contains(&name) {
            return Err(ProcessorError::DuplicateHandler(name));
        }

        let config = HandlerConfig::resolve(name.as_str(), self.config.as_ref());

        let source = self
            .sources
            .make(&name)
            .map_err(|source| ProcessorError::Source {
                handler: name.clone(),
                source,
            })?;

        if source.group_id().is_none_or(str::is_empty) {
            return Err(ProcessorError::MissingGroupId { handler: name });
        }

        info!(
            handler = %name,
            batched = capability.is_batched(),
            fetch_workers = config.fetch_workers,
            handle_workers = config.handle_workers,
            batch_workers = config.batch_workers,
            batch_size = config.batch_size,
            auto_batch_interval = ?config.auto_batch_interval,
            auto_commit = config.auto_commit,
            "Registered handler"
        );

        self.names.insert(name);
        self.pipelines
            .push(Arc::new(Pipeline::new(config, source, capability)));
        Ok(())
    }

    /// Registered handler names, in registration order
    pub fn handler_names(&self) -> Vec<&str> {
        self.pipelines.iter().map(|pipeline| pipeline.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Spawn every pipeline under a child of `shutdown`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(self, shutdown: &CancellationToken) -> RunHandle {
        let cancel = shutdown.child_token();
        let mut tasks = WorkerTasks::new();

        info!(handlers = self.pipelines.len(), "Starting processor");
        for pipeline in self.pipelines {
            pipeline.launch(&mut tasks, &cancel);
        }

        RunHandle { cancel, tasks }
    }

    /// Run until `shutdown` is cancelled or a worker fails
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ProcessorError> {
        self.start(&shutdown).wait().await
    }

    /// Run until `shutdown` turns `true` (or its sender is dropped) or a worker fails
    pub async fn run_until(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ProcessorError> {
        let cancel = CancellationToken::new();
        let handle = self.start(&cancel);

        let trigger = cancel.clone();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                _ = trigger.cancelled() => {}
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("Shutdown signal received");
                    trigger.cancel();
                }
            }
        });

        let result = handle.wait().await;
        cancel.cancel();
        let _ = watcher.await;
        result
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // Err means the sender is gone, which is treated as a stop request
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Running processor.
pub struct RunHandle {
    cancel: CancellationToken,
    tasks: WorkerTasks,
}

impl RunHandle {
    /// Ask every worker to stop
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Token cancelled when the processor stops
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for every worker to exit.
    ///
    /// Returns the first worker error, or [`ProcessorError::Cancelled`] when
    /// the run was stopped without failure.
    pub async fn wait(mut self) -> Result<(), ProcessorError> {
        if self.tasks.is_empty() {
            self.cancel.cancelled().await;
            info!("Processor stopped");
            return Err(ProcessorError::Cancelled);
        }

        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let Err(err) = joined.map_err(ProcessorError::from).and_then(|result| result) else {
                continue;
            };

            if first_error.is_none() {
                error!(
                    handler = err.handler().unwrap_or_default(),
                    stage = ?err.stage(),
                    error = %err,
                    "Worker failed, stopping processor"
                );
                self.cancel.cancel();
                first_error = Some(err);
            } else {
                debug!(error = %err, "Worker failed during shutdown");
            }
        }

        match first_error {
            Some(err) => Err(err),
            None if self.cancel.is_cancelled() => {
                info!("Processor stopped");
                Err(ProcessorError::Cancelled)
            }
            None => Ok(()),
        }
    }
}
