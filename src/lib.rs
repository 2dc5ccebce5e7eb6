//! gemmtune: a hill-climbing autotuner for GEMM kernel hyper-parameters.
//!
//! Re-exports the workspace crates under one roof.

pub use gemmtune_autotune as autotune;
pub use gemmtune_backend_gpu as backend;
pub use gemmtune_kernels as kernels;
pub use gemmtune_optimizer as optimizer;

pub use gemmtune_autotune::{FindReport, Solution, Tuner};
pub use gemmtune_kernels::{Geometry, HyperParams, TuneError};
pub use gemmtune_optimizer::{Constraints, FindParams};
