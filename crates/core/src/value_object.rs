//! Value object marker: compared by value, never by identity.

/// Marker trait for immutable values such as a parsed formatter template or
/// a pricing configuration.
///
/// Two values with equal attributes are interchangeable. To "change" one,
/// build a new one.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
