//! NATS bus backend.
//!
//! Payloads are JSON encoded as UTF-8 text. Inbound messages that are not valid
//! JSON are logged at debug level and dropped. Remote handlers are not
//! observable, so `publish` returns no deliveries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_nats::client::RequestErrorKind;
use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use super::{
    Bus, BusError, Delivery, Handler, Message, PublishOptions, SubscribeOptions, Subscription,
    invoke_handler, timeout_ms,
};

pub struct NatsBus {
    client: Client,
    closed: AtomicBool,
    next_id: AtomicU64,
    workers: Workers,
}

/// Abort handles of live subscription workers, keyed by subscription id.
#[derive(Clone, Default)]
struct Workers(Arc<Mutex<HashMap<u64, AbortHandle>>>);

impl Workers {
    fn insert(&self, id: u64, worker: AbortHandle) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, worker);
    }

    fn remove(&self, id: u64) -> Option<AbortHandle> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    /// Abort and forget every worker.
    fn abort_all(&self) {
        let workers: Vec<AbortHandle> = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, worker)| worker)
            .collect();
        for worker in workers {
            worker.abort();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl NatsBus {
    /// Connect to the broker at `url` (e.g. `nats://127.0.0.1:4222`).
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let options = ConnectOptions::new().name("foreman");
        let client = async_nats::connect_with_options(url, options)
            .await
            .map_err(|err| BusError::Transport(format!("connect {url}: {err}")))?;
        info!(url, "connected to nats");
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            workers: Workers::default(),
        }
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

fn encode(payload: &Value) -> Result<Vec<u8>, BusError> {
    serde_json::to_vec(payload).map_err(|err| BusError::Encode(err.to_string()))
}

fn decode(bytes: &[u8]) -> Result<Value, String> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    let text = std::str::from_utf8(bytes).map_err(|err| format!("payload is not UTF-8: {err}"))?;
    serde_json::from_str(text).map_err(|err| format!("payload is not JSON: {err}"))
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish_with(
        &self,
        subject: &str,
        payload: Value,
        opts: PublishOptions,
    ) -> Result<Vec<Delivery>, BusError> {
        self.ensure_open()?;
        let bytes = encode(&payload)?;
        let result = match opts.reply {
            Some(reply) => {
                self.client
                    .publish_with_reply(subject.to_string(), reply, bytes.into())
                    .await
            }
            None => self.client.publish(subject.to_string(), bytes.into()).await,
        };
        result.map_err(|err| BusError::Transport(format!("publish {subject}: {err}")))?;
        debug!(subject, "published");
        Ok(Vec::new())
    }

    async fn subscribe_with(
        &self,
        subject: &str,
        handler: Handler,
        opts: SubscribeOptions,
    ) -> Result<Subscription, BusError> {
        self.ensure_open()?;
        let subscribed = match opts.queue {
            Some(queue) => {
                self.client
                    .queue_subscribe(subject.to_string(), queue)
                    .await
            }
            None => self.client.subscribe(subject.to_string()).await,
        };
        let mut subscriber = subscribed
            .map_err(|err| BusError::Transport(format!("subscribe {subject}: {err}")))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let active = Arc::new(AtomicBool::new(true));
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let worker_active = active.clone();
        let worker_subject = subject.to_string();
        let worker = tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    next = subscriber.next() => next,
                };
                let Some(inbound) = next else { break };
                if !worker_active.load(Ordering::Acquire) {
                    break;
                }
                let payload = match decode(&inbound.payload) {
                    Ok(payload) => payload,
                    Err(reason) => {
                        debug!(subject = %inbound.subject, %reason, "dropping malformed message");
                        continue;
                    }
                };
                let message = Message {
                    subject: inbound.subject.to_string(),
                    payload,
                    reply: inbound.reply.as_ref().map(|reply| reply.to_string()),
                };
                invoke_handler(&handler, message).await;
            }
            let _ = subscriber.unsubscribe().await;
            debug!(subject = %worker_subject, "subscription worker stopped");
        });
        self.workers.insert(id, worker.abort_handle());
        debug!(subject, id, "subscribed");

        let workers = self.workers.clone();
        Ok(Subscription::new(id, subject, move || {
            active.store(false, Ordering::Release);
            let _ = stop_tx.send(());
            workers.remove(id);
        }))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, BusError> {
        self.ensure_open()?;
        let bytes = encode(&payload)?;
        let timed_out = || BusError::Timeout {
            subject: subject.to_string(),
            timeout_ms: timeout_ms(timeout),
        };
        let response = tokio::time::timeout(
            timeout,
            self.client.request(subject.to_string(), bytes.into()),
        )
        .await
        .map_err(|_| timed_out())?
        .map_err(|err| match err.kind() {
            RequestErrorKind::TimedOut | RequestErrorKind::NoResponders => timed_out(),
            _ => BusError::Transport(format!("request {subject}: {err}")),
        })?;
        decode(&response.payload).map_err(BusError::Transport)
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.workers.abort_all();
        self.client
            .flush()
            .await
            .map_err(|err| BusError::Transport(format!("flush: {err}")))?;
        info!("nats bus closed");
        Ok(())
    }
}
