//! Search budget and selection policy.
//!
//! These are the dials a caller turns to trade search time for kernel
//! quality: how many descents to run, how long to benchmark each candidate,
//! which statistic of the timing sample represents a candidate, and whether
//! ties count as improvements.

use crate::halt::Halt;
use gemmtune_kernels::{Result, TuneError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Statistic of a candidate's timing sample used to compare candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SummaryStat {
    /// Fastest observed run.
    Min,
    Median,
    Mean,
    Max,
}

impl SummaryStat {
    /// Returns `None` for an empty sample.
    pub fn select(&self, times: &[f64]) -> Option<f64> {
        if times.is_empty() {
            return None;
        }
        let mut sorted = times.to_vec();
        sorted.sort_by(f64::total_cmp);
        Some(match self {
            SummaryStat::Min => sorted[0],
            SummaryStat::Median => sorted[sorted.len() / 2],
            SummaryStat::Mean => sorted.iter().sum::<f64>() / sorted.len() as f64,
            SummaryStat::Max => sorted[sorted.len() - 1],
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            SummaryStat::Min => "min",
            SummaryStat::Median => "median",
            SummaryStat::Mean => "mean",
            SummaryStat::Max => "max",
        }
    }
}

/// Whether a candidate that equals the best time so far is a new best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Acceptance {
    AllowTies,
    Strict,
}

impl Acceptance {
    pub fn accepts(&self, best: Option<f64>, candidate: f64) -> bool {
        match (self, best) {
            (_, None) => true,
            (Acceptance::AllowTies, Some(best)) => candidate <= best,
            (Acceptance::Strict, Some(best)) => candidate < best,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindParams {
    /// Governs restarts: counts descents and total seconds.
    pub hl_outer: Halt,
    /// Governs the benchmark loop of each candidate.
    pub hl_core: Halt,
    pub sumstat: SummaryStat,
    pub acceptance: Acceptance,
}

pub const DEFAULT_CORE_RUNS: usize = 5;

impl Default for FindParams {
    fn default() -> Self {
        Self::at_least_n_restarts(2)
    }
}

impl FindParams {
    pub fn new(hl_outer: Halt, hl_core: Halt) -> Self {
        Self {
            hl_outer,
            hl_core,
            sumstat: SummaryStat::Min,
            acceptance: Acceptance::AllowTies,
        }
    }

    /// Exactly `n` descents.
    pub fn at_least_n_restarts(n: usize) -> Self {
        Self::new(Halt::runs(n), Halt::runs(DEFAULT_CORE_RUNS))
    }

    /// Descents until `seconds` have elapsed, at least one.
    pub fn at_least_n_seconds(seconds: f64) -> Self {
        Self::new(
            Halt::new(1, usize::MAX, seconds, seconds),
            Halt::runs(DEFAULT_CORE_RUNS),
        )
    }

    pub fn with_sumstat(mut self, sumstat: SummaryStat) -> Self {
        self.sumstat = sumstat;
        self
    }

    pub fn with_acceptance(mut self, acceptance: Acceptance) -> Self {
        self.acceptance = acceptance;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.hl_outer
            .validate()
            .map_err(|e| TuneError::config(format!("outer halt: {e}")))?;
        self.hl_core
            .validate()
            .map_err(|e| TuneError::config(format!("core halt: {e}")))?;
        if self.hl_outer.max_runs == 0 && self.hl_outer.min_runs == 0 {
            return Err(TuneError::config("outer halt allows no descents"));
        }
        if self.hl_core.min_runs == 0 {
            return Err(TuneError::config(
                "core halt must require at least one timed run",
            ));
        }
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let params: Self = serde_json::from_str(&json)?;
        params.validate()?;
        Ok(params)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Defaults overlaid with `GEMMTUNE_MAX_RESTARTS`, `GEMMTUNE_MAX_SECONDS`
    /// and `GEMMTUNE_CORE_RUNS` where set.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut params = Self::default();
        if let Ok(v) = std::env::var("GEMMTUNE_MAX_RESTARTS") {
            let n: usize = v
                .parse()
                .map_err(|_| anyhow::anyhow!("GEMMTUNE_MAX_RESTARTS is not an integer: {v}"))?;
            params.hl_outer.max_runs = n;
            params.hl_outer.min_runs = params.hl_outer.min_runs.min(n);
        }
        if let Ok(v) = std::env::var("GEMMTUNE_MAX_SECONDS") {
            let s: f64 = v
                .parse()
                .map_err(|_| anyhow::anyhow!("GEMMTUNE_MAX_SECONDS is not a number: {v}"))?;
            params.hl_outer.max_time = s;
            params.hl_outer.min_time = params.hl_outer.min_time.min(s);
        }
        if let Ok(v) = std::env::var("GEMMTUNE_CORE_RUNS") {
            let n: usize = v
                .parse()
                .map_err(|_| anyhow::anyhow!("GEMMTUNE_CORE_RUNS is not an integer: {v}"))?;
            params.hl_core = Halt::runs(n);
        }
        params.validate()?;
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fastest_sample_is_selected_by_default() {
        let params = FindParams::default();
        assert_eq!(params.sumstat, SummaryStat::Min);
        assert_eq!(params.sumstat.select(&[12.0, 9.0, 15.0]), Some(9.0));
        assert_eq!(SummaryStat::Median.select(&[12.0, 9.0, 15.0]), Some(12.0));
        assert_eq!(SummaryStat::Max.select(&[12.0, 9.0, 15.0]), Some(15.0));
        assert_eq!(SummaryStat::Mean.select(&[12.0, 9.0, 15.0]), Some(12.0));
        assert_eq!(SummaryStat::Min.select(&[]), None);
    }

    #[test]
    fn test_acceptance_policies() {
        assert!(Acceptance::AllowTies.accepts(None, 3.0));
        assert!(Acceptance::AllowTies.accepts(Some(3.0), 3.0));
        assert!(!Acceptance::Strict.accepts(Some(3.0), 3.0));
        assert!(Acceptance::Strict.accepts(Some(3.0), 2.5));
        assert!(!Acceptance::AllowTies.accepts(Some(3.0), 3.5));
    }

    #[test]
    fn test_params_serialization() {
        let params = FindParams::at_least_n_seconds(2.5).with_acceptance(Acceptance::Strict);
        let json = serde_json::to_string(&params).unwrap();
        let parsed: FindParams = serde_json::from_str(&json).unwrap();
        assert_eq!(params, parsed);
    }

    #[test]
    fn test_invalid_params() {
        let mut params = FindParams::default();
        params.hl_core = Halt::new(0, 0, 0.0, 0.0);
        assert!(params.validate().unwrap_err().is_configuration());

        let params = FindParams::new(Halt::runs(0), Halt::runs(1));
        assert!(params.validate().is_err());
        assert!(FindParams::default().validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("gemmtune-params-{}.json", std::process::id()));
        let params = FindParams::at_least_n_restarts(4).with_sumstat(SummaryStat::Median);
        params.save(&path).unwrap();
        let loaded = FindParams::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(params, loaded);
    }
}
