//! Problem description, hyper-parameter points and kernel bundles for gemmtune.

pub mod bundle;
pub mod config;
pub mod derived;
pub mod emitter;
pub mod error;
pub mod hyperparams;

pub use bundle::*;
pub use config::*;
pub use derived::*;
pub use emitter::*;
pub use error::*;
pub use hyperparams::*;
