//! Control Plane Module
//!
//! Consumers of the convergence engine: the block and file stores, plus an
//! in-memory control plane that serves every port for tests and the CLI.

pub mod backends;
pub mod simulator;

pub use backends::*;
pub use simulator::*;
