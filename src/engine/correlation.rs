//! Request/response correlation on top of the fire-and-forget bus.
//!
//! Each call registers exactly one matcher keyed by the outgoing message id.
//! The listener and the timeout both go through `remove` on the pending table,
//! so whichever path removes the entry first is the only one that acts.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::bus::{BusReceiver, MessageBus};
use crate::error::{CoordinationError, Result};
use crate::types::{Envelope, MessageId, MessageKind, Priority};

type PendingTable = Arc<Mutex<HashMap<MessageId, oneshot::Sender<Envelope>>>>;

/// Seam between the coordination logic and the transport used to reach agents.
#[async_trait]
pub trait AgentCaller: Send + Sync {
    async fn call_agent(
        &self,
        target: &str,
        kind: MessageKind,
        payload: Value,
        priority: Priority,
        timeout: Duration,
    ) -> Result<Envelope>;
}

pub struct Correlator {
    bus: MessageBus,
    sender_id: String,
    pending: PendingTable,
    listener: JoinHandle<()>,
}

impl Correlator {
    /// Subscribes to the bus and starts the response listener. Must be called
    /// from within a tokio runtime.
    pub fn new(bus: MessageBus, sender_id: impl Into<String>) -> Arc<Self> {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let receiver = bus.subscribe();
        let listener = tokio::spawn(dispatch_responses(receiver, pending.clone()));

        Arc::new(Self {
            bus,
            sender_id: sender_id.into(),
            pending,
            listener,
        })
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Publishes `envelope` and waits for the first `Response` whose
    /// `response_to` is the envelope's id.
    pub async fn request(&self, envelope: Envelope, timeout: Duration) -> Result<Envelope> {
        let request_id = envelope.id;
        let target = envelope.recipient.clone().unwrap_or_default();

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&request_id) {
                return Err(CoordinationError::InvalidConfig(format!(
                    "request id {} is already in flight",
                    request_id
                )));
            }
            pending.insert(request_id, tx);
        }
        // Removes the matcher on timeout and on caller cancellation alike.
        let _guard = PendingGuard {
            pending: &self.pending,
            id: request_id,
        };

        self.bus.publish(envelope);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(CoordinationError::BusClosed),
            Err(_) => {
                log::debug!("request {} to '{}' timed out", request_id, target);
                Err(CoordinationError::Timeout {
                    agent_id: target,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, request_id: &MessageId) -> bool {
        self.pending.lock().contains_key(request_id)
    }
}

#[async_trait]
impl AgentCaller for Correlator {
    async fn call_agent(
        &self,
        target: &str,
        kind: MessageKind,
        payload: Value,
        priority: Priority,
        timeout: Duration,
    ) -> Result<Envelope> {
        let envelope = Envelope::new(kind, self.sender_id.clone(), payload)
            .to(target)
            .with_priority(priority)
            .with_ttl(timeout.as_millis() as u64);
        self.request(envelope, timeout).await
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.listener.abort();
        // Dropping the senders wakes any caller still waiting.
        self.pending.lock().clear();
    }
}

struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<MessageId, oneshot::Sender<Envelope>>>,
    id: MessageId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

async fn dispatch_responses(mut receiver: BusReceiver, pending: PendingTable) {
    while let Some(envelope) = receiver.recv().await {
        if envelope.kind != MessageKind::Response {
            continue;
        }
        let Some(request_id) = envelope.metadata.response_to else {
            continue;
        };

        let matcher = pending.lock().remove(&request_id);
        match matcher {
            Some(tx) => {
                // The caller may have given up between remove and send.
                let _ = tx.send(envelope);
            }
            None => {
                log::debug!(
                    "dropping response {} from '{}': no pending call for {}",
                    envelope.id,
                    envelope.sender,
                    request_id
                );
            }
        }
    }
}
