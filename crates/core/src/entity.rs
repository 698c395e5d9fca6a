//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Failure records and operation checkpoints are entities: they keep their
/// identity while their status, attempts or cursor change.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
