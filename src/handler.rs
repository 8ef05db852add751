//! Handler trait, type-erased wrappers and the dispatch registry.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::envelope::TaskEnvelope;

/// Error returned by a handler execution.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The task failed and should go through the retry path.
    #[error("{0}")]
    Failed(#[source] anyhow::Error),

    /// The handler observed cancellation and stopped.
    #[error("canceled")]
    Canceled,
}

impl HandlerError {
    /// Create a failure from any error.
    pub fn failed(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(err.into())
    }
}

/// Error returned by [`HandlerRegistry::dispatch`].
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("no handler registered for task type '{task_type}'")]
    Unroutable { task_type: String },

    #[error("handler '{handler}' rejected payload: {source}")]
    InvalidPayload {
        handler: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("handler '{handler}' failed: {source}")]
    Handler {
        handler: &'static str,
        #[source]
        source: HandlerError,
    },

    #[error("handler panicked while running '{task_type}'")]
    Panicked { task_type: String },
}

impl DispatchError {
    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            Self::Handler {
                source: HandlerError::Canceled,
                ..
            }
        )
    }
}

/// A business handler for one kind of task.
#[async_trait]
pub trait Handler: Send + Sync {
    /// The concrete payload this handler deserializes.
    type Payload: DeserializeOwned + Send;

    /// The name of this handler for logging.
    fn name(&self) -> &'static str;

    /// Whether this handler accepts the envelope.
    fn can_handle(&self, envelope: &TaskEnvelope) -> bool;

    /// Execute the task. Long-running handlers should watch `cancel`.
    async fn execute(
        &self,
        payload: Self::Payload,
        cancel: CancellationToken,
    ) -> Result<(), HandlerError>;
}

/// Type-erased handler that can be stored in the registry.
#[async_trait]
pub trait ErasedHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_handle(&self, envelope: &TaskEnvelope) -> bool;

    async fn execute_erased(
        &self,
        payload: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<(), DispatchError>;
}

struct HandlerWrapper<H>(H);

#[async_trait]
impl<H> ErasedHandler for HandlerWrapper<H>
where
    H: Handler + 'static,
{
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn can_handle(&self, envelope: &TaskEnvelope) -> bool {
        self.0.can_handle(envelope)
    }

    async fn execute_erased(
        &self,
        payload: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<(), DispatchError> {
        let name = self.0.name();
        let typed: H::Payload =
            serde_json::from_value(payload).map_err(|source| DispatchError::InvalidPayload {
                handler: name,
                source,
            })?;

        self.0
            .execute(typed, cancel)
            .await
            .map_err(|source| DispatchError::Handler {
                handler: name,
                source,
            })
    }
}

/// Handler built from a closure, matching a single task type.
///
/// Created with [`handler_fn`].
pub struct FnHandler<T, F> {
    task_type: &'static str,
    f: F,
    _payload: PhantomData<fn() -> T>,
}

/// Build a handler that accepts envelopes whose type equals `task_type`.
pub fn handler_fn<T, F, Fut>(task_type: &'static str, f: F) -> FnHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    FnHandler {
        task_type,
        f,
        _payload: PhantomData,
    }
}

#[async_trait]
impl<T, F, Fut> Handler for FnHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    type Payload = T;

    fn name(&self) -> &'static str {
        self.task_type
    }

    fn can_handle(&self, envelope: &TaskEnvelope) -> bool {
        envelope.task_type == self.task_type
    }

    async fn execute(&self, payload: T, cancel: CancellationToken) -> Result<(), HandlerError> {
        (self.f)(payload, cancel).await
    }
}

/// Ordered list of handlers; the first one that accepts an envelope wins.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn ErasedHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler after all previously registered ones.
    pub fn register(&mut self, handler: impl Handler + 'static) {
        self.handlers.push(Arc::new(HandlerWrapper(handler)));
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Route the envelope to the first matching handler and run it.
    pub async fn dispatch(
        &self,
        envelope: &TaskEnvelope,
        cancel: CancellationToken,
    ) -> Result<(), DispatchError> {
        let handler = self
            .handlers
            .iter()
            .find(|h| h.can_handle(envelope))
            .ok_or_else(|| DispatchError::Unroutable {
                task_type: envelope.task_type.clone(),
            })?;

        handler
            .execute_erased(envelope.payload.clone(), cancel)
            .await
    }
}
