//! Search results.

use anyhow::Result;
use gemmtune_kernels::{Geometry, HyperParams, KernelDescriptor};
use gemmtune_optimizer::FindParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionStatistics {
    /// Time selected by the find parameters' summary statistic, ms.
    pub time_ms: f64,
    /// Fastest sample, ms.
    pub fastest_ms: f64,
    /// Median sample, ms.
    pub median_ms: f64,
    /// Throughput at `time_ms`.
    pub gflops: f64,
    /// Seconds into the descent at which this solution was found.
    pub discovery_s: f64,
    /// Unix time of discovery.
    pub found_at_unix: u64,
    pub find_params: FindParams,
}

/// A benchmarked point, fixed at the moment it was accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solution {
    pub hyperstring: String,
    pub hp: HyperParams,
    pub geometry: Geometry,
    pub kernels: Vec<KernelDescriptor>,
    pub statistics: SolutionStatistics,
    pub device_name: String,
    pub constraints: String,
}

impl Solution {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    /// One-line record keyed by device, constraints and geometry, for
    /// pasting into a kernel cache.
    pub fn cache_entry_string(&self) -> String {
        format!(
            "{{\"{}\", \"{}\", \"{}\"}} => {{\"{}\", {{{:.4}, {:.2}, {:.2}, {}}}}}",
            self.device_name,
            self.constraints,
            self.geometry,
            self.hyperstring,
            self.statistics.time_ms,
            self.statistics.gflops,
            self.statistics.discovery_s,
            self.statistics.found_at_unix
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gemmtune_kernels::{Bundle, FloatType};

    fn solution() -> Solution {
        let hp: HyperParams =
            "A_MIC4_PAD1_PLU0_LIW0_MIW1_WOS0__B_MIC4_PAD1_PLU0_LIW0_MIW1_WOS0__C_UNR16_GAL2_PUN0_ICE1_NAW16_UFO0_MAC64_SKW10"
                .parse()
                .unwrap();
        let geometry = Geometry::packed(256, 256, 256, FloatType::F32).unwrap();
        let bundle = Bundle::new(&hp, &geometry).unwrap();
        Solution {
            hyperstring: hp.to_string(),
            hp,
            geometry,
            kernels: bundle.descriptors,
            statistics: SolutionStatistics {
                time_ms: 0.5,
                fastest_ms: 0.5,
                median_ms: 0.6,
                gflops: 67.1,
                discovery_s: 1.25,
                found_at_unix: 1_700_000_000,
                find_params: FindParams::default(),
            },
            device_name: "sim".into(),
            constraints: "C_ICE1".into(),
        }
    }

    #[test]
    fn test_json_roundtrip() {
        let soln = solution();
        let parsed = Solution::from_json(&soln.to_json().unwrap()).unwrap();
        assert_eq!(parsed, soln);
    }

    #[test]
    fn test_json_roundtrip_keeps_every_float_bit() {
        let mut soln = solution();
        soln.statistics.time_ms = 935.0901549855263;
        soln.statistics.gflops = soln.geometry.gflops(soln.statistics.time_ms);
        let parsed = Solution::from_json(&soln.to_json().unwrap()).unwrap();
        assert_eq!(parsed.statistics.time_ms.to_bits(), soln.statistics.time_ms.to_bits());
        assert_eq!(parsed, soln);
    }

    #[test]
    fn test_cache_entry_string() {
        let entry = solution().cache_entry_string();
        assert!(entry.starts_with("{\"sim\", \"C_ICE1\", \"tC0_tA0_tB0_colMaj1_m256"));
        assert!(entry.contains("MAC64_SKW10\", {0.5000, 67.10, 1.25, 1700000000}}"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("gemmtune-soln-{}", std::process::id()));
        let path = dir.join("best.json");
        let soln = solution();
        soln.save(&path).unwrap();
        assert_eq!(Solution::load(&path).unwrap(), soln);
        fs::remove_dir_all(&dir).ok();
    }
}
