//! Device boundary and execution engine for gemmtune.

pub mod device;
pub mod engine;
pub mod sim;

pub use device::*;
pub use engine::*;
pub use sim::*;
