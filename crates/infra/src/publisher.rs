//! Fire-and-forget publication of domain events.

use tracing::warn;

use recoverability_events::{EventBus, EventEnvelope};
use recoverability_failures::RecoverabilityEvent;

/// Envelope type carried on the engine's event bus.
pub type RecoverabilityEnvelope = EventEnvelope<RecoverabilityEvent>;

/// Publish `event`, logging (never propagating) bus failures.
///
/// The state change that raised the event has already been persisted, so a
/// failed publication must not undo or abort it.
pub(crate) fn publish<B>(bus: &B, event: RecoverabilityEvent)
where
    B: EventBus<RecoverabilityEnvelope> + ?Sized,
{
    let envelope = EventEnvelope::wrap(event);
    let event_type = envelope.event_type().to_string();
    if let Err(e) = bus.publish(envelope) {
        warn!(event_type = %event_type, error = ?e, "failed to publish domain event");
    }
}
