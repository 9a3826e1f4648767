//! Processor error types and fatal-error classification
//!
//! Errors returned by handlers fall into two classes:
//! - **Fatal**: the error (or anything it wraps) is a [`FatalError`]. The owning
//!   pipeline stops and the whole registry shuts down.
//! - **Recoverable**: anything else. It is logged and processing continues.
//!
//! Classification walks the [`std::error::Error::source`] chain, so a fatal error
//! stays fatal no matter how many times it is wrapped.

use std::error::Error as StdError;
use strum::{AsRefStr, Display};
use thiserror::Error;

/// Boxed error returned by handlers and sources.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Pipeline stage an error or metric belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Stage {
    Fetch,
    Handle,
    Batch,
    Commit,
}

/// Marker wrapper: raising this from a handler stops the processor.
#[derive(Debug, Error)]
#[error("{inner}")]
pub struct FatalError {
    #[source]
    inner: BoxError,
}

impl FatalError {
    /// Wrap an error as fatal
    pub fn new(err: impl Into<BoxError>) -> Self {
        Self { inner: err.into() }
    }

    /// The wrapped error
    pub fn inner(&self) -> &(dyn StdError + Send + Sync + 'static) {
        self.inner.as_ref()
    }

    /// Unwrap the underlying error
    pub fn into_inner(self) -> BoxError {
        self.inner
    }

    /// Turn an error already classified as fatal into a `FatalError`.
    ///
    /// A top-level `FatalError` is unboxed as-is; a fatal error buried deeper in
    /// the chain is kept intact inside a new wrapper.
    pub(crate) fn from_classified(err: BoxError) -> Self {
        match err.downcast::<FatalError>() {
            Ok(fatal) => *fatal,
            Err(other) => Self { inner: other },
        }
    }
}

/// Wrap an error as fatal, ready to be returned from a handler.
///
/// ```
/// use stream_processor::{fatal, is_fatal};
///
/// let err = fatal("database is gone");
/// assert!(is_fatal(err.as_ref()));
/// assert_eq!(err.to_string(), "database is gone");
/// ```
pub fn fatal(err: impl Into<BoxError>) -> BoxError {
    Box::new(FatalError::new(err))
}

/// Whether the error, or anything in its source chain, is a [`FatalError`].
pub fn is_fatal(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.is::<FatalError>() {
            return true;
        }
        current = e.source();
    }
    false
}

/// Errors surfaced by registration and by a processor run.
#[derive(Debug, Error)]
pub enum ProcessorError {
    /// Two handlers registered under the same name
    #[error("duplicate processor name: {0}")]
    DuplicateHandler(String),

    /// The handler's source has no consumer group configured
    #[error("source {handler} did not set consumer group id")]
    MissingGroupId { handler: String },

    /// The source provider could not build a source for the handler
    #[error("get source {handler} error: {source}")]
    Source {
        handler: String,
        #[source]
        source: BoxError,
    },

    /// Fetching from the source failed; the source is considered unusable
    #[error("fetch from source {handler} failed: {source}")]
    Fetch {
        handler: String,
        #[source]
        source: BoxError,
    },

    /// A handler or batch step returned a fatal error (displayed verbatim)
    #[error("{source}")]
    Fatal {
        handler: String,
        stage: Stage,
        #[source]
        source: FatalError,
    },

    /// Committing coordinates back to the source failed
    #[error("commit for {handler} failed: {source}")]
    Commit {
        handler: String,
        #[source]
        source: BoxError,
    },

    /// A worker task panicked or was aborted
    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    /// The run was cancelled and no worker failed
    #[error("processor cancelled")]
    Cancelled,
}

impl ProcessorError {
    /// Classified fatal error from a handler or batch step
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProcessorError::Fatal { .. })
    }

    /// Raised while registering handlers, before any worker starts
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            ProcessorError::DuplicateHandler(_)
                | ProcessorError::MissingGroupId { .. }
                | ProcessorError::Source { .. }
        )
    }

    /// The run ended because it was asked to stop
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProcessorError::Cancelled)
    }

    /// Name of the handler the error belongs to, if any
    pub fn handler(&self) -> Option<&str> {
        match self {
            ProcessorError::DuplicateHandler(handler) => Some(handler),
            ProcessorError::MissingGroupId { handler }
            | ProcessorError::Source { handler, .. }
            | ProcessorError::Fetch { handler, .. }
            | ProcessorError::Fatal { handler, .. }
            | ProcessorError::Commit { handler, .. } => Some(handler),
            ProcessorError::Worker(_) | ProcessorError::Cancelled => None,
        }
    }

    /// Stage the error was raised in, for runtime errors
    pub fn stage(&self) -> Option<Stage> {
        match self {
            ProcessorError::Fetch { .. } => Some(Stage::Fetch),
            ProcessorError::Fatal { stage, .. } => Some(*stage),
            ProcessorError::Commit { .. } => Some(Stage::Commit),
            _ => None,
        }
    }

    pub(crate) fn fatal(handler: &str, stage: Stage, err: BoxError) -> Self {
        ProcessorError::Fatal {
            handler: handler.to_string(),
            stage,
            source: FatalError::from_classified(err),
        }
    }
}
