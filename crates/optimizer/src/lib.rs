//! Search space and search policy for gemmtune.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────┐     ┌─────────────────┐
//! │  Constraints    │────▶│  Graph           │────▶│  Oracle         │
//! │  (user string)  │     │  (A, B, C roles) │     │  (derive, caps) │
//! └─────────────────┘     └──────────────────┘     └─────────────────┘
//! ```
//!
//! # Key Components
//!
//! - [`constraints::Constraints`]: range and start-range pins parsed from a string
//! - [`graph::Graph`]: per-role value tables, random starts and neighbor moves
//! - [`oracle::Oracle`]: derivability and device capability predicates
//! - [`halt::Halt`]: loop termination over iterations and elapsed time
//! - [`findparams::FindParams`]: search budget, summary statistic, tie policy

pub mod constraints;
pub mod findparams;
pub mod graph;
pub mod halt;
pub mod oracle;

pub use constraints::{Constraint, Constraints};
pub use findparams::{Acceptance, FindParams, SummaryStat};
pub use graph::{Graph, SubGraph, COUPLED_PAIRS};
pub use halt::Halt;
pub use oracle::{DefaultOracle, Oracle, Verdict};
