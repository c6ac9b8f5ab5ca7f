//! Agent presence from heartbeats on `agents.*.heartbeat`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::core::subjects;
use crate::io::bus::{Bus, Message, Subscription, handler};

/// Last heartbeat seen from an agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub at: DateTime<Utc>,
    pub payload: Value,
}

#[derive(Default)]
pub struct PresenceMonitor {
    seen: Arc<Mutex<BTreeMap<String, Heartbeat>>>,
    subscription: Mutex<Option<Subscription>>,
}

impl PresenceMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start listening. Calling it again replaces the previous subscription.
    pub async fn start(&self, bus: &dyn Bus) -> Result<()> {
        let seen = self.seen.clone();
        let subscription = bus
            .subscribe(
                subjects::ALL_HEARTBEATS,
                handler(move |message: Message| {
                    let seen = seen.clone();
                    async move {
                        record(&seen, message);
                        Ok(())
                    }
                }),
            )
            .await
            .context("subscribe to heartbeats")?;
        let previous = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(subscription);
        drop(previous);
        Ok(())
    }

    pub fn stop(&self) {
        let previous = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(previous);
    }

    pub fn last_seen(&self, agent_id: &str) -> Option<Heartbeat> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned()
    }

    /// Agent ids that have sent at least one heartbeat, sorted.
    pub fn agents(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

fn record(seen: &Mutex<BTreeMap<String, Heartbeat>>, message: Message) {
    let Some(agent_id) = subjects::entity_id(&message.subject) else {
        return;
    };
    debug!(agent_id, "heartbeat");
    seen.lock().unwrap_or_else(PoisonError::into_inner).insert(
        agent_id.to_string(),
        Heartbeat {
            at: Utc::now(),
            payload: message.payload,
        },
    );
}
