//! In-process publish/subscribe transport.
//!
//! Every subscriber sees every envelope published after it subscribed.
//! Publishing never fails: with no subscribers the envelope is dropped.

use tokio::sync::broadcast;

use crate::types::Envelope;

pub const DEFAULT_BUS_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct MessageBus {
    sender: broadcast::Sender<Envelope>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns the number of subscribers the envelope was delivered to.
    pub fn publish(&self, envelope: Envelope) -> usize {
        log::trace!(
            "publish {:?} {} from {} to {:?}",
            envelope.kind,
            envelope.id,
            envelope.sender,
            envelope.recipient
        );
        self.sender.send(envelope).unwrap_or(0)
    }

    pub fn subscribe(&self) -> BusReceiver {
        BusReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

pub struct BusReceiver {
    receiver: broadcast::Receiver<Envelope>,
}

impl BusReceiver {
    /// Next envelope, or `None` once the bus is gone. Lagged gaps are skipped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("bus receiver lagged, skipped {} envelopes", skipped);
                    continue;
                }
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    log::warn!("bus receiver lagged, skipped {} envelopes", skipped);
                    continue;
                }
                Err(_) => return None,
            }
        }
    }
}
