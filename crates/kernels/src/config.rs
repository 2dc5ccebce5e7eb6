//! Problem description structures: geometry, offsets and device info.

use crate::error::{Result, TuneError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FloatType {
    F32,
    F64,
}

impl FloatType {
    pub fn size_bytes(&self) -> usize {
        match self {
            FloatType::F32 => 4,
            FloatType::F64 => 8,
        }
    }

    fn bits(&self) -> usize {
        self.size_bytes() * 8
    }
}

/// Device memory operands of a GEMM, in kernel argument order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mem {
    A,
    B,
    C,
    W,
}

impl Mem {
    pub const ALL: [Mem; 4] = [Mem::A, Mem::B, Mem::C, Mem::W];

    pub fn name(&self) -> &'static str {
        match self {
            Mem::A => "a",
            Mem::B => "b",
            Mem::C => "c",
            Mem::W => "w",
        }
    }
}

/// Splits a `KEY<value>` token such as `MIC8` or `lda900` into its parts.
pub fn split_token(token: &str) -> Result<(&str, usize)> {
    let split = token
        .find(|c: char| c.is_ascii_digit())
        .ok_or_else(|| TuneError::config(format!("token `{token}` has no numeric value")))?;
    let (key, value) = token.split_at(split);
    if key.is_empty() {
        return Err(TuneError::config(format!("token `{token}` has no key")));
    }
    let value = value
        .parse::<usize>()
        .map_err(|_| TuneError::config(format!("token `{token}` has a malformed value")))?;
    Ok((key, value))
}

/// Immutable description of one GEMM problem: `C = alpha op(A) op(B) + beta C`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Geometry {
    pub is_col_major: bool,
    pub t_a: bool,
    pub t_b: bool,
    pub t_c: bool,
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub lda: usize,
    pub ldb: usize,
    pub ldc: usize,
    /// Workspace size in bytes; zero means no workspace buffer.
    pub workspace_size: usize,
    pub float_type: FloatType,
}

impl Geometry {
    /// Column-major, untransposed, tightly packed geometry.
    pub fn packed(m: usize, n: usize, k: usize, float_type: FloatType) -> Result<Self> {
        let geometry = Self {
            is_col_major: true,
            t_a: false,
            t_b: false,
            t_c: false,
            m,
            n,
            k,
            lda: m,
            ldb: k,
            ldc: m,
            workspace_size: 0,
            float_type,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    pub fn with_workspace(mut self, workspace_size: usize) -> Self {
        self.workspace_size = workspace_size;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.m == 0 || self.n == 0 || self.k == 0 {
            return Err(TuneError::config(format!(
                "geometry dimensions must be non-zero (m={}, n={}, k={})",
                self.m, self.n, self.k
            )));
        }
        for mem in [Mem::A, Mem::B, Mem::C] {
            let (ld, min_ld) = (self.ld(mem), self.min_ld(mem));
            if ld < min_ld {
                return Err(TuneError::config(format!(
                    "ld{} = {} is smaller than the minimum {} for this geometry",
                    mem.name(),
                    ld,
                    min_ld
                )));
            }
        }
        Ok(())
    }

    pub fn ld(&self, mem: Mem) -> usize {
        match mem {
            Mem::A => self.lda,
            Mem::B => self.ldb,
            Mem::C => self.ldc,
            Mem::W => 0,
        }
    }

    fn is_transposed(&self, mem: Mem) -> bool {
        match mem {
            Mem::A => self.t_a,
            Mem::B => self.t_b,
            Mem::C => self.t_c,
            Mem::W => false,
        }
    }

    /// Extent of the contiguous (coalesced) dimension and the number of
    /// lines of that length, for a stored operand.
    fn coal_and_lines(&self, mem: Mem) -> (usize, usize) {
        let contiguous_first = self.is_transposed(mem) == self.is_col_major;
        match mem {
            Mem::A if contiguous_first => (self.k, self.m),
            Mem::A => (self.m, self.k),
            Mem::B if contiguous_first => (self.n, self.k),
            Mem::B => (self.k, self.n),
            Mem::C if contiguous_first => (self.n, self.m),
            Mem::C => (self.m, self.n),
            Mem::W => (self.workspace_size, 1),
        }
    }

    fn min_ld(&self, mem: Mem) -> usize {
        self.coal_and_lines(mem).0
    }

    /// Bytes spanned by an operand in device memory, excluding offsets.
    pub fn mem_size_bytes(&self, mem: Mem) -> usize {
        match mem {
            Mem::W => self.workspace_size,
            _ => {
                let (_, lines) = self.coal_and_lines(mem);
                self.ld(mem) * lines * self.float_type.size_bytes()
            }
        }
    }

    pub fn flops(&self) -> f64 {
        2.0 * self.m as f64 * self.n as f64 * self.k as f64
    }

    /// Throughput in GFLOP/s for a run of `time_ms` milliseconds.
    pub fn gflops(&self, time_ms: f64) -> f64 {
        if time_ms > 0.0 {
            self.flops() / (time_ms * 1.0e6)
        } else {
            0.0
        }
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tC{}_tA{}_tB{}_colMaj{}_m{}_n{}_k{}_lda{}_ldb{}_ldc{}_ws{}_f{}",
            self.t_c as u8,
            self.t_a as u8,
            self.t_b as u8,
            self.is_col_major as u8,
            self.m,
            self.n,
            self.k,
            self.lda,
            self.ldb,
            self.ldc,
            self.workspace_size,
            self.float_type.bits()
        )
    }
}

impl FromStr for Geometry {
    type Err = TuneError;

    fn from_str(s: &str) -> Result<Self> {
        let mut tokens = BTreeMap::new();
        for token in s.split('_').filter(|t| !t.is_empty()) {
            let (key, value) = split_token(token)?;
            if tokens.insert(key, value).is_some() {
                return Err(TuneError::config(format!(
                    "geometry key `{key}` appears twice in `{s}`"
                )));
            }
        }

        let mut take = |key: &str| {
            tokens.remove(key).ok_or_else(|| {
                TuneError::config(format!("geometry string `{s}` is missing `{key}`"))
            })
        };
        let flag = |key: &str, v: usize| match v {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(TuneError::config(format!("`{key}` must be 0 or 1, got {v}"))),
        };

        let t_c = flag("tC", take("tC")?)?;
        let t_a = flag("tA", take("tA")?)?;
        let t_b = flag("tB", take("tB")?)?;
        let is_col_major = flag("colMaj", take("colMaj")?)?;
        let float_type = match take("f")? {
            32 => FloatType::F32,
            64 => FloatType::F64,
            other => {
                return Err(TuneError::config(format!(
                    "unsupported float width f{other}, expected f32 or f64"
                )))
            }
        };
        let geometry = Geometry {
            is_col_major,
            t_a,
            t_b,
            t_c,
            m: take("m")?,
            n: take("n")?,
            k: take("k")?,
            lda: take("lda")?,
            ldb: take("ldb")?,
            ldc: take("ldc")?,
            workspace_size: take("ws")?,
            float_type,
        };

        if let Some(key) = tokens.keys().next() {
            return Err(TuneError::config(format!(
                "unrecognised geometry key `{key}` in `{s}`"
            )));
        }
        geometry.validate()?;
        Ok(geometry)
    }
}

/// Byte offsets of each operand within its device buffer, plus tail padding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offsets {
    pub a: usize,
    pub b: usize,
    pub c: usize,
    pub w: usize,
    pub tail_a: usize,
    pub tail_b: usize,
    pub tail_c: usize,
}

impl Offsets {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn offset(&self, mem: Mem) -> usize {
        match mem {
            Mem::A => self.a,
            Mem::B => self.b,
            Mem::C => self.c,
            Mem::W => self.w,
        }
    }
}

/// Capabilities of the target device relevant to kernel selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_name: String,
    /// Native work-group atomic size (wavefront / warp width).
    pub wg_atom_size: usize,
    pub max_work_group_size: usize,
    pub local_mem_bytes: usize,
    pub compute_units: usize,
}

impl DeviceInfo {
    pub fn wavefront64(name: impl Into<String>) -> Self {
        Self {
            device_name: name.into(),
            wg_atom_size: 64,
            max_work_group_size: 256,
            local_mem_bytes: 64 * 1024,
            compute_units: 64,
        }
    }

    pub fn warp32(name: impl Into<String>) -> Self {
        Self {
            device_name: name.into(),
            wg_atom_size: 32,
            max_work_group_size: 1024,
            local_mem_bytes: 48 * 1024,
            compute_units: 80,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry_string_roundtrip() {
        let s = "tC0_tA0_tB0_colMaj1_m900_n1_k147_lda900_ldb147_ldc900_ws0_f32";
        let geometry: Geometry = s.parse().unwrap();
        assert_eq!(geometry.m, 900);
        assert_eq!(geometry.n, 1);
        assert_eq!(geometry.float_type, FloatType::F32);
        assert_eq!(geometry.to_string(), s);
    }

    #[test]
    fn test_geometry_rejects_small_leading_dimension() {
        let s = "tC0_tA0_tB0_colMaj1_m64_n64_k64_lda32_ldb64_ldc64_ws0_f32";
        let err = s.parse::<Geometry>().unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_geometry_rejects_missing_and_unknown_keys() {
        assert!("tC0_tA0_tB0_colMaj1_m8_n8_k8_lda8_ldb8_ws0_f32"
            .parse::<Geometry>()
            .is_err());
        assert!("tC0_tA0_tB0_colMaj1_m8_n8_k8_lda8_ldb8_ldc8_ws0_f32_zz3"
            .parse::<Geometry>()
            .is_err());
        assert!("tC0_tA0_tB0_colMaj1_m8_n8_k8_lda8_ldb8_ldc8_ws0_f16"
            .parse::<Geometry>()
            .is_err());
    }

    #[test]
    fn test_transposed_leading_dimension() {
        // tA == colMaj means A is stored k-contiguous.
        let s = "tC0_tA1_tB0_colMaj1_m33_n32_k6308_lda6308_ldb6308_ldc33_ws0_f64";
        let geometry: Geometry = s.parse().unwrap();
        assert_eq!(geometry.mem_size_bytes(Mem::A), 6308 * 33 * 8);
    }

    #[test]
    fn test_gflops() {
        let geometry = Geometry::packed(1000, 1000, 1000, FloatType::F32).unwrap();
        assert!((geometry.gflops(2.0) - 1000.0).abs() < 1e-9);
        assert_eq!(geometry.gflops(0.0), 0.0);
    }

    #[test]
    fn test_split_token() {
        assert_eq!(split_token("MIC8").unwrap(), ("MIC", 8));
        assert_eq!(split_token("colMaj1").unwrap(), ("colMaj", 1));
        assert!(split_token("MIC").is_err());
        assert!(split_token("42").is_err());
    }
}
