//! Command implementations. Each returns a serializable output printed by `main`.

pub mod replay;
pub mod stats;
