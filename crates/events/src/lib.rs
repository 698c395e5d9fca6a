//! Event mechanics for the recoverability engine.
//!
//! Domain events (archive progress, retry failures, ...) are defined by the
//! domain crate; this crate only provides the envelope and the pub/sub
//! transport used to hand them to notification/UI consumers.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
