//! Failure recoverability engine: store abstraction, capture, bulk
//! operations, retries and the operator control surface.

pub mod capture;
pub mod control;
pub mod headers;
pub mod operations;
pub mod publisher;
pub mod retry;
pub mod settings;
pub mod store;

pub use capture::{CaptureError, CaptureReceipt, FailureCapture, MessageContext};
pub use control::Recoverability;
pub use publisher::RecoverabilityEnvelope;
pub use settings::RecoverabilitySettings;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod integration_tests;
