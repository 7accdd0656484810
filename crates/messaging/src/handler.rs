use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use common::RequestScope;

use crate::Envelope;

/// Error returned by a message handler. Any error leads to a requeue, or to
/// dead-lettering if the message was already redelivered.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes the payload of one delivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        scope: &RequestScope,
        envelope: &Envelope,
        payload: &[u8],
    ) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(
        &self,
        scope: &RequestScope,
        envelope: &Envelope,
        payload: &[u8],
    ) -> Result<(), HandlerError> {
        (**self).handle(scope, envelope, payload).await
    }
}

/// Handler built from an async closure. See [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wraps an async closure taking owned copies of the scope, envelope and
/// payload into a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(RequestScope, Envelope, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(RequestScope, Envelope, Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(
        &self,
        scope: &RequestScope,
        envelope: &Envelope,
        payload: &[u8],
    ) -> Result<(), HandlerError> {
        (self.f)(scope.clone(), envelope.clone(), payload.to_vec()).await
    }
}
