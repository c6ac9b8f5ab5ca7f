//! In-process bus backend.
//!
//! Each subscription owns an unbounded queue drained by its own task, so
//! messages reach a given subscriber in publish order and a slow handler never
//! blocks the publisher or other subscribers. Queue groups are not supported:
//! every matching subscriber receives every message.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use super::{
    Bus, BusError, Delivery, Handler, HandlerOutcome, Message, PublishOptions, SubscribeOptions,
    Subscription, handler, invoke_handler, timeout_ms,
};
use crate::core::subjects;

struct Envelope {
    message: Message,
    ack: oneshot::Sender<HandlerOutcome>,
}

struct Subscriber {
    id: u64,
    pattern: String,
    active: Arc<AtomicBool>,
    queue: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct Inner {
    subscribers: Mutex<Vec<Subscriber>>,
    closed: AtomicBool,
    next_id: AtomicU64,
}

impl Inner {
    fn remove(&self, id: u64) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|sub| sub.id != id);
    }
}

/// Bus that delivers within the current process.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish_with(
        &self,
        subject: &str,
        payload: Value,
        opts: PublishOptions,
    ) -> Result<Vec<Delivery>, BusError> {
        self.ensure_open()?;
        let subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut deliveries = Vec::new();
        for sub in &*subscribers {
            if !subjects::matches(&sub.pattern, subject) {
                continue;
            }
            let (ack, outcome) = oneshot::channel();
            let envelope = Envelope {
                message: Message {
                    subject: subject.to_string(),
                    payload: payload.clone(),
                    reply: opts.reply.clone(),
                },
                ack,
            };
            if sub.queue.send(envelope).is_ok() {
                deliveries.push(Delivery::new(sub.id, outcome));
            }
        }
        debug!(subject, deliveries = deliveries.len(), "published");
        Ok(deliveries)
    }

    async fn subscribe_with(
        &self,
        subject: &str,
        handler: Handler,
        opts: SubscribeOptions,
    ) -> Result<Subscription, BusError> {
        self.ensure_open()?;
        if let Some(queue) = &opts.queue {
            debug!(subject, queue = %queue, "queue groups are not supported in-process; broadcasting");
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let active = Arc::new(AtomicBool::new(true));
        let (queue, mut rx) = mpsc::unbounded_channel::<Envelope>();

        let worker_active = active.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let outcome = if worker_active.load(Ordering::Acquire) {
                    invoke_handler(&handler, envelope.message).await
                } else {
                    HandlerOutcome::Skipped
                };
                let _ = envelope.ack.send(outcome);
            }
        });

        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                id,
                pattern: subject.to_string(),
                active: active.clone(),
                queue,
            });
        debug!(subject, id, "subscribed");

        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        Ok(Subscription::new(id, subject, move || {
            active.store(false, Ordering::Release);
            if let Some(inner) = inner.upgrade() {
                inner.remove(id);
            }
        }))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        let inbox = format!("{}.{}", subjects::INBOX_PREFIX, Uuid::new_v4().simple());
        let (tx, rx) = oneshot::channel::<Value>();
        let slot = Arc::new(Mutex::new(Some(tx)));

        let reply_slot = slot.clone();
        let subscription = self
            .subscribe(
                &inbox,
                handler(move |message: Message| {
                    let slot = reply_slot.clone();
                    async move {
                        let sender = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                        if let Some(sender) = sender {
                            let _ = sender.send(message.payload);
                        }
                        Ok(())
                    }
                }),
            )
            .await?;

        self.publish_with(
            subject,
            payload,
            PublishOptions {
                reply: Some(inbox),
            },
        )
        .await?;

        let response = tokio::time::timeout(timeout, rx).await;
        subscription.unsubscribe();
        match response {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout {
                subject: subject.to_string(),
                timeout_ms: timeout_ms(timeout),
            }),
        }
    }

    async fn close(&self) -> Result<(), BusError> {
        self.inner.closed.store(true, Ordering::Release);
        let drained: Vec<Subscriber> = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for sub in &drained {
            sub.active.store(false, Ordering::Release);
        }
        debug!(closed = drained.len(), "bus closed");
        Ok(())
    }
}
