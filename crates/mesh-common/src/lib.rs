//! # mesh-common
//!
//! Shared identity, wire types, configuration, and error handling used by every
//! mesh crate. No call logic lives here, only primitives and contracts.

pub mod config;
pub mod error;
pub mod event;
pub mod peer;
pub mod signal;

pub use error::{MeshError, MeshResult};
pub use peer::PeerId;
