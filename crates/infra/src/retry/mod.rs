//! Retry pipeline: staging, forwarding and the transport it runs on.

pub mod countdown;
pub mod forwarder;
pub mod in_memory_transport;
pub mod stager;
pub mod transport;

pub use countdown::IdleCountdown;
pub use forwarder::{ForwarderError, RetryForwarder, RetryRun, RunEnd, RunPredicate, RunSummary};
pub use in_memory_transport::InMemoryTransport;
pub use stager::{RetryStager, StagingError};
pub use transport::{MessageTransport, QueueReceiver, TransportError, TransportMessage};
