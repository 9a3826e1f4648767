//! Stream Processor Framework
//!
//! Consumes records from message-broker sources and runs them through a staged
//! fetch → handle → batch pipeline per registered handler.
//!
//! ## Features
//!
//! - **Staged pipeline**: independent worker pools for fetch, handle and batch
//! - **Commit after processing**: a record is committed only once it was handled,
//!   or once the batch containing it was flushed
//! - **Fatal errors**: a handler error wrapped with [`fatal`] stops the whole processor
//! - **Batching**: flush by size or by interval, with a resettable flush timer
//! - **Per-handler options**: defaults overridden from JSON or environment config
//! - **Prometheus metrics**: built-in observability
//!
//! ## Example
//!
//! ```ignore
//! use stream_processor::{fatal, FnHandler, JsonConfig, Record, Registry};
//!
//! let config = JsonConfig::parse(r#"{"processor": {"orders": {"batchSize": 100}}}"#)?;
//! let mut registry = Registry::new(kafka_sources).with_config(config);
//!
//! registry.register_fn(
//!     FnHandler::new("orders", |_cancel, record: Record| async move {
//!         Ok(Some(record.json::<Order>()?))
//!     })
//!     .with_batch(move |_cancel, orders: Vec<Order>| {
//!         let store = store.clone();
//!         async move { store.insert_all(orders).await.map_err(fatal) }
//!     }),
//! )?;
//!
//! registry.run_until(shutdown_rx).await?;
//! ```

mod batch;
mod config;
mod error;
mod handler;
pub mod metrics;
mod pipeline;
mod record;
mod registry;
mod source;

// Re-export main types
pub use batch::{BatchBuffer, FlushTrigger};
pub use config::{
    ConfigError, ConfigSource, DEFAULT_AUTO_BATCH_INTERVAL, DEFAULT_HANDLER_NAME, EnvConfig,
    HandlerConfig, HandlerConfigOverrides, JsonConfig, NoConfig,
};
pub use error::{BoxError, FatalError, ProcessorError, Stage, fatal, is_fatal};
pub use handler::{BatchFn, BatchHandler, Capability, FnHandler, HandleFn, Handler};
pub use metrics::{ProcessorMetrics, init_metrics, render_metrics};
pub use record::{CommitCoordinate, Record};
pub use registry::{HandlerProvider, Registry, RunHandle};
pub use source::{MemorySource, MemorySourceProvider, MessageSource, SourceProvider};
