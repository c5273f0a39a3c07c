//! Domain layer - Core data model and port definitions
//!
//! This module defines the resource model and the traits (ports) that
//! control-plane adapters implement, following hexagonal architecture
//! principles.

pub mod ports;

pub use ports::*;
