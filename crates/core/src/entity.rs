//! Entity trait: records that keep their identity while their state changes.

/// Something addressed by a stable identifier (e.g. a geocoding job record).
pub trait Entity {
    /// Strongly-typed identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the identifier.
    fn id(&self) -> &Self::Id;
}
