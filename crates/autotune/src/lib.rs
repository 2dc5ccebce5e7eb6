//! GEMM autotuning: restarted hill-climbing over kernel hyper-parameters.

pub mod solution;
pub mod tuner;

pub use solution::*;
pub use tuner::*;
