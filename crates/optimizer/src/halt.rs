//! Loop termination policy over (iterations, elapsed seconds).

use serde::{Deserialize, Serialize};

/// Stops a loop once either maximum is reached, but never before both
/// minimums are met.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Halt {
    pub min_runs: usize,
    pub max_runs: usize,
    /// Seconds.
    pub min_time: f64,
    /// Seconds.
    pub max_time: f64,
}

impl Halt {
    pub fn new(min_runs: usize, max_runs: usize, min_time: f64, max_time: f64) -> Self {
        Self {
            min_runs,
            max_runs,
            min_time,
            max_time,
        }
    }

    /// Exactly `n` iterations, regardless of time.
    pub fn runs(n: usize) -> Self {
        Self::new(n, n, 0.0, f64::MAX)
    }

    /// Iterate for `seconds`, with no bound on iteration count.
    pub fn seconds(seconds: f64) -> Self {
        Self::new(0, usize::MAX, seconds, seconds)
    }

    pub fn halt(&self, runs: usize, elapsed: f64) -> bool {
        (runs >= self.max_runs || elapsed >= self.max_time)
            && runs >= self.min_runs
            && elapsed >= self.min_time
    }

    pub fn status(&self, runs: usize, elapsed: f64) -> String {
        let bound = |x: f64| {
            if x >= f64::MAX {
                "inf".to_string()
            } else {
                format!("{x:.2}")
            }
        };
        let max_runs = if self.max_runs == usize::MAX {
            "inf".to_string()
        } else {
            self.max_runs.to_string()
        };
        format!(
            "runs: {} (min {}, max {})  elapsed: {:.2}s (min {}, max {})",
            runs,
            self.min_runs,
            max_runs,
            elapsed,
            bound(self.min_time),
            bound(self.max_time)
        )
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.min_runs > self.max_runs {
            return Err(format!(
                "min_runs {} exceeds max_runs {}",
                self.min_runs, self.max_runs
            ));
        }
        if self.min_time.is_nan() || self.max_time.is_nan() || self.min_time < 0.0 {
            return Err("halt times must be non-negative numbers".into());
        }
        if self.min_time > self.max_time {
            return Err(format!(
                "min_time {} exceeds max_time {}",
                self.min_time, self.max_time
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halt_on_runs() {
        let halt = Halt::runs(2);
        assert!(!halt.halt(0, 100.0));
        assert!(!halt.halt(1, 100.0));
        assert!(halt.halt(2, 0.0));
    }

    #[test]
    fn test_minimums_hold_off_maximums() {
        let halt = Halt::new(3, 1, 0.5, 0.1);
        assert!(!halt.halt(2, 1.0));
        assert!(!halt.halt(5, 0.2));
        assert!(halt.halt(3, 0.5));
        assert!(halt.validate().is_err());
    }

    #[test]
    fn test_halt_on_time() {
        let halt = Halt::seconds(1.5);
        assert!(!halt.halt(1000, 1.0));
        assert!(halt.halt(0, 1.5));
    }

    #[test]
    fn test_status_string() {
        let status = Halt::runs(4).status(1, 0.25);
        assert!(status.contains("runs: 1 (min 4, max 4)"));
        assert!(status.contains("elapsed: 0.25s (min 0.00, max inf)"));
    }
}
