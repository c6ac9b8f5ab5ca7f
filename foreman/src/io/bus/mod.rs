//! Subject-addressed message bus.
//!
//! All components communicate through [`Bus`]. Two backends exist:
//!
//! - [`memory::MemoryBus`]: in-process delivery, one ordered queue per
//!   subscriber. `publish` returns a [`Delivery`] per matching subscriber whose
//!   outcome resolves once that subscriber's handler has finished.
//! - [`nats::NatsBus`]: a networked broker. JSON payloads travel as UTF-8 text;
//!   `publish` returns no deliveries because remote handlers are not observable.
//!
//! Handler failures and panics are contained per message: they are logged and
//! reported through the delivery outcome, never propagated to the publisher.

pub mod memory;
pub mod nats;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::warn;

/// A message as seen by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub subject: String,
    pub payload: Value,
    /// Subject the publisher expects a response on, if any.
    pub reply: Option<String>,
}

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Subscription callback. Invoked once per delivered message.
pub type Handler = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |message| f(message).boxed())
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub reply: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Load-balanced queue group. Honored by networked backends only.
    pub queue: Option<String>,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("request on '{subject}' timed out after {timeout_ms}ms")]
    Timeout { subject: String, timeout_ms: u64 },

    #[error("bus is closed")]
    Closed,

    #[error("message on '{subject}' has no reply subject")]
    NoReplySubject { subject: String },

    #[error("encode payload: {0}")]
    Encode(String),

    #[error("bus transport: {0}")]
    Transport(String),
}

/// How a subscriber's handler dealt with one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Handled,
    Failed(String),
    Panicked,
    /// The subscription ended before the message was handled.
    Skipped,
}

/// Pending acknowledgement for one subscriber of a published message.
#[derive(Debug)]
pub struct Delivery {
    pub subscription: u64,
    ack: oneshot::Receiver<HandlerOutcome>,
}

impl Delivery {
    pub(crate) fn new(subscription: u64, ack: oneshot::Receiver<HandlerOutcome>) -> Self {
        Self { subscription, ack }
    }

    /// Wait for the handler to finish with this message.
    pub async fn outcome(self) -> HandlerOutcome {
        self.ack.await.unwrap_or(HandlerOutcome::Skipped)
    }
}

/// Wait for every delivery and collect the outcomes in delivery order.
pub async fn settle(deliveries: Vec<Delivery>) -> Vec<HandlerOutcome> {
    join_all(deliveries.into_iter().map(Delivery::outcome)).await
}

/// Handle to an active subscription. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    id: u64,
    subject: String,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(id: u64, subject: &str, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            subject: subject.to_string(),
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Stop delivery. Messages already queued for this subscription are skipped.
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("subject", &self.subject)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish_with(
        &self,
        subject: &str,
        payload: Value,
        opts: PublishOptions,
    ) -> Result<Vec<Delivery>, BusError>;

    async fn subscribe_with(
        &self,
        subject: &str,
        handler: Handler,
        opts: SubscribeOptions,
    ) -> Result<Subscription, BusError>;

    /// Publish on `subject` and wait for the first response.
    async fn request(
        &self,
        subject: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, BusError>;

    /// Stop all deliveries and release the transport.
    async fn close(&self) -> Result<(), BusError>;

    async fn publish(&self, subject: &str, payload: Value) -> Result<Vec<Delivery>, BusError> {
        self.publish_with(subject, payload, PublishOptions::default())
            .await
    }

    async fn subscribe(&self, subject: &str, handler: Handler) -> Result<Subscription, BusError> {
        self.subscribe_with(subject, handler, SubscribeOptions::default())
            .await
    }

    /// Answer a request received by a handler.
    async fn respond(&self, message: &Message, payload: Value) -> Result<(), BusError> {
        let reply = message
            .reply
            .as_deref()
            .ok_or_else(|| BusError::NoReplySubject {
                subject: message.subject.clone(),
            })?;
        self.publish(reply, payload).await?;
        Ok(())
    }
}

/// Run `handler` for one message, containing errors and panics.
pub(crate) async fn invoke_handler(handler: &Handler, message: Message) -> HandlerOutcome {
    let subject = message.subject.clone();
    let future = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(message))) {
        Ok(future) => future,
        Err(_) => {
            warn!(subject = %subject, "bus handler panicked");
            return HandlerOutcome::Panicked;
        }
    };
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => HandlerOutcome::Handled,
        Ok(Err(err)) => {
            warn!(subject = %subject, error = %format!("{err:#}"), "bus handler failed");
            HandlerOutcome::Failed(format!("{err:#}"))
        }
        Err(_) => {
            warn!(subject = %subject, "bus handler panicked");
            HandlerOutcome::Panicked
        }
    }
}

pub(crate) fn timeout_ms(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}
