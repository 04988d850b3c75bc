//! Domain layer - Port definitions
//!
//! Traits the reconcilers depend on, following the hexagonal layout of the
//! rest of the crate: components talk to [`ports::ClusterStore`], scopes talk
//! to [`ports::ComponentPatcher`].

pub mod ports;

pub use ports::*;
