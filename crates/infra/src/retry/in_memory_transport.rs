//! In-memory transport for tests/dev.
//!
//! Each queue is an unbounded channel; dispatching to a destination enqueues
//! on the queue of that name. Destinations can be marked unreachable to
//! exercise delivery failures.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use super::transport::{MessageTransport, QueueReceiver, TransportError, TransportMessage};

type SharedReceiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<TransportMessage>>>;

#[derive(Debug)]
struct Queue {
    sender: mpsc::UnboundedSender<TransportMessage>,
    receiver: SharedReceiver,
}

impl Queue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryTransport {
    queues: Mutex<HashMap<String, Queue>>,
    aliases: Mutex<HashMap<String, String>>,
    unreachable: Mutex<HashSet<String>>,
    dispatched: Mutex<Vec<(String, TransportMessage)>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a logical queue name to a physical address.
    pub fn with_alias(self, logical: impl Into<String>, physical: impl Into<String>) -> Self {
        self.aliases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(logical.into(), physical.into());
        self
    }

    /// Make every dispatch to `destination` fail.
    pub fn make_unreachable(&self, destination: impl Into<String>) {
        self.unreachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(destination.into());
    }

    /// Every successfully dispatched message, in order, with its destination.
    pub fn dispatched(&self) -> Vec<(String, TransportMessage)> {
        self.dispatched.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Messages dispatched to `destination`.
    pub fn dispatched_to(&self, destination: &str) -> Vec<TransportMessage> {
        self.dispatched()
            .into_iter()
            .filter(|(d, _)| d == destination)
            .map(|(_, m)| m)
            .collect()
    }

    /// Close `queue`: its receiver drains what is left, then reports closed.
    pub fn close_queue(&self, queue: &str) {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner).remove(queue);
    }

    fn sender(&self, queue: &str) -> mpsc::UnboundedSender<TransportMessage> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(queue.to_string())
            .or_insert_with(Queue::new)
            .sender
            .clone()
    }
}

#[async_trait]
impl MessageTransport for InMemoryTransport {
    fn resolve_address(&self, logical: &str) -> Result<String, TransportError> {
        let logical = logical.trim();
        if logical.is_empty() {
            return Err(TransportError::UnknownAddress(logical.to_string()));
        }
        let aliases = self.aliases.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(aliases.get(logical).cloned().unwrap_or_else(|| logical.to_string()))
    }

    async fn open_receiver(&self, address: &str) -> Result<Box<dyn QueueReceiver>, TransportError> {
        let receiver = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(address.to_string())
            .or_insert_with(Queue::new)
            .receiver
            .clone();

        if Arc::strong_count(&receiver) > 2 {
            return Err(TransportError::ReceiverInUse(address.to_string()));
        }
        Ok(Box::new(InMemoryReceiver { receiver: Some(receiver) }))
    }

    async fn dispatch(&self, message: TransportMessage, destination: &str) -> anyhow::Result<()> {
        let unreachable = self
            .unreachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(destination);
        if unreachable {
            anyhow::bail!("destination {destination} is unreachable");
        }

        self.sender(destination)
            .send(message.clone())
            .map_err(|_| anyhow::anyhow!("queue {destination} is closed"))?;
        self.dispatched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((destination.to_string(), message));
        Ok(())
    }
}

struct InMemoryReceiver {
    receiver: Option<SharedReceiver>,
}

#[async_trait]
impl QueueReceiver for InMemoryReceiver {
    async fn receive(&mut self) -> Option<TransportMessage> {
        let receiver = self.receiver.as_ref()?;
        receiver.lock().await.recv().await
    }

    async fn close(&mut self) {
        self.receiver = None;
    }
}
