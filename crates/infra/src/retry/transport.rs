use async_trait::async_trait;
use thiserror::Error;

use crate::headers::Headers;

/// A message as seen by the transport: headers, body and native id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportMessage {
    pub native_message_id: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl TransportMessage {
    pub fn new(native_message_id: impl Into<String>, headers: Headers, body: Vec<u8>) -> Self {
        Self {
            native_message_id: native_message_id.into(),
            headers,
            body,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        crate::headers::first_present(&self.headers, &[name])
    }
}

/// Transport error (receive side). Delivery failures are reported separately
/// as opaque [`anyhow::Error`] values from [`MessageTransport::dispatch`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown address: {0}")]
    UnknownAddress(String),

    #[error("queue {0} already has an active receiver")]
    ReceiverInUse(String),

    #[error("transport failure: {0}")]
    Backend(String),
}

/// Narrow view of the message transport used by retries.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Physical address for a logical queue name.
    fn resolve_address(&self, logical: &str) -> Result<String, TransportError>;

    /// Open a receive channel on a physical queue.
    async fn open_receiver(&self, address: &str) -> Result<Box<dyn QueueReceiver>, TransportError>;

    /// Send `message` to `destination`. An error means the message was not
    /// delivered; its display text is the failure reason.
    async fn dispatch(&self, message: TransportMessage, destination: &str) -> anyhow::Result<()>;
}

/// Receive side of a queue.
///
/// `receive` must be cancel-safe: dropping the future before it completes
/// must not lose a message.
#[async_trait]
pub trait QueueReceiver: Send {
    /// Next message, or `None` once the queue is closed.
    async fn receive(&mut self) -> Option<TransportMessage>;

    /// Stop receiving; further `receive` calls return `None`.
    async fn close(&mut self);
}

#[async_trait]
impl<T> MessageTransport for std::sync::Arc<T>
where
    T: MessageTransport + ?Sized,
{
    fn resolve_address(&self, logical: &str) -> Result<String, TransportError> {
        (**self).resolve_address(logical)
    }

    async fn open_receiver(&self, address: &str) -> Result<Box<dyn QueueReceiver>, TransportError> {
        (**self).open_receiver(address).await
    }

    async fn dispatch(&self, message: TransportMessage, destination: &str) -> anyhow::Result<()> {
        (**self).dispatch(message, destination).await
    }
}
