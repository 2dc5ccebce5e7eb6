//! Parameters derived from a hyper-parameter point and a geometry.

use crate::config::{Geometry, Mem};
use crate::error::{Result, TuneError};
use crate::hyperparams::{scratch, Chi, HyperParams, NonChi, Role};
use serde::{Deserialize, Serialize};

/// Skew value at which the work-group grid is as square as possible.
pub const SKEW0: usize = 10;

/// Split of a work-group's `mac` work-items into a `grid_a x grid_b` grid.
///
/// `mac` must be a power of two. The grid is square-ish at [`SKEW0`]; each
/// skew step above doubles `grid_a` and halves `grid_b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacGrid {
    pub is_good: bool,
    pub grid_a: usize,
    pub grid_b: usize,
}

impl MacGrid {
    pub fn new(mac: usize, skew: usize) -> Self {
        let bad = Self {
            is_good: false,
            grid_a: 0,
            grid_b: 0,
        };
        if mac == 0 || !mac.is_power_of_two() {
            return bad;
        }
        let lg2_mac = mac.trailing_zeros() as isize;
        let lg2_a = (lg2_mac + 1) / 2 + skew as isize - SKEW0 as isize;
        if lg2_a < 0 || lg2_a > lg2_mac {
            return bad;
        }
        Self {
            is_good: true,
            grid_a: 1 << lg2_a,
            grid_b: 1 << (lg2_mac - lg2_a),
        }
    }

    pub fn at(&self, role: Role) -> usize {
        match role {
            Role::A => self.grid_a,
            Role::B => self.grid_b,
            Role::C => self.grid_a * self.grid_b,
        }
    }
}

/// Outcome of the structural derivability test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Derivability {
    pub is_derivable: bool,
    pub msg: String,
}

impl Derivability {
    pub fn check(hp: &HyperParams, geometry: &Geometry) -> Self {
        match DerivedParams::derive(hp, geometry) {
            Ok(_) => Self {
                is_derivable: true,
                msg: String::new(),
            },
            Err(msg) => Self {
                is_derivable: false,
                msg,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedParams {
    pub grid: MacGrid,
    pub micro_tile_a: usize,
    pub micro_tile_b: usize,
    pub macro_tile_a: usize,
    pub macro_tile_b: usize,
    pub work_items_per_group: usize,
    pub k_split: usize,
    pub unroll: usize,
    /// Whether the main kernel applies `beta` to C itself. When the k
    /// dimension is split, partial sums accumulate into C and a separate
    /// beta kernel must scale C first.
    pub main_does_beta_c_inc: bool,
    pub copy_a: bool,
    pub copy_b: bool,
    pub workspace_bytes_a: usize,
    pub workspace_bytes_b: usize,
    pub local_memory_bytes: usize,
    pub n_groups: usize,
    pub global_work_size: usize,
    pub local_work_size: usize,
}

fn div_ceil(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

impl DerivedParams {
    /// Derives the parameters, failing with a logic error if the point is
    /// not derivable for this geometry.
    pub fn new(hp: &HyperParams, geometry: &Geometry) -> Result<Self> {
        Self::derive(hp, geometry)
            .map_err(|msg| TuneError::logic(format!("non-derivable {hp}: {msg}")))
    }

    fn derive(hp: &HyperParams, gg: &Geometry) -> std::result::Result<Self, String> {
        let mac = hp.non_chi(NonChi::Mac);
        let skew = hp.non_chi(NonChi::Skw);
        let grid = MacGrid::new(mac, skew);
        if !grid.is_good {
            return Err(format!("MAC{mac} with SKW{skew} does not give a valid grid"));
        }

        let micro_tile_a = hp.chi(Role::A, Chi::Mic);
        let micro_tile_b = hp.chi(Role::B, Chi::Mic);
        if micro_tile_a == 0 || micro_tile_b == 0 {
            return Err("micro tiles must be non-zero".into());
        }
        let macro_tile_a = grid.grid_a * micro_tile_a;
        let macro_tile_b = grid.grid_b * micro_tile_b;
        for (role, macro_tile, dim) in [(Role::A, macro_tile_a, gg.m), (Role::B, macro_tile_b, gg.n)] {
            if macro_tile > (2 * dim).max(16) {
                return Err(format!(
                    "macro tile {} = {} is too large for dimension {}",
                    role.letter(),
                    macro_tile,
                    dim
                ));
            }
        }

        let unroll = hp.non_chi(NonChi::Unr);
        let k_split = hp.non_chi(NonChi::Ice);
        if unroll == 0 || k_split == 0 {
            return Err("UNR and ICE must be non-zero".into());
        }
        if unroll * k_split > gg.k {
            return Err(format!(
                "k = {} is too small for ICE{} with UNR{}",
                gg.k, k_split, unroll
            ));
        }

        let fsize = gg.float_type.size_bytes();
        let workspace_bytes = |role: Role, dim: usize, macro_tile: usize| match hp.chi(role, Chi::Wos) {
            scratch::UNUSED => Ok(0),
            scratch::COPY => Ok((dim + hp.chi(role, Chi::Pad)) * gg.k * fsize),
            scratch::NFORM => Ok(div_ceil(dim, macro_tile) * macro_tile * gg.k * fsize),
            other => Err(format!("unrecognised WOS{other} for role {}", role.letter())),
        };
        let workspace_bytes_a = workspace_bytes(Role::A, gg.m, macro_tile_a)?;
        let workspace_bytes_b = workspace_bytes(Role::B, gg.n, macro_tile_b)?;
        let required = workspace_bytes_a + workspace_bytes_b;
        if required > gg.workspace_size {
            return Err(format!(
                "requested copies need {} workspace bytes, geometry provides {}",
                required, gg.workspace_size
            ));
        }

        let local_memory_bytes = (macro_tile_a
            + hp.chi(Role::A, Chi::Pad)
            + macro_tile_b
            + hp.chi(Role::B, Chi::Pad))
            * unroll
            * fsize;
        let n_groups = div_ceil(gg.m, macro_tile_a) * div_ceil(gg.n, macro_tile_b) * k_split;

        Ok(Self {
            grid,
            micro_tile_a,
            micro_tile_b,
            macro_tile_a,
            macro_tile_b,
            work_items_per_group: mac,
            k_split,
            unroll,
            main_does_beta_c_inc: k_split == 1,
            copy_a: workspace_bytes_a > 0,
            copy_b: workspace_bytes_b > 0,
            workspace_bytes_a,
            workspace_bytes_b,
            local_memory_bytes,
            n_groups,
            global_work_size: n_groups * mac,
            local_work_size: mac,
        })
    }

    /// Bytes the main kernel moves through global memory.
    pub fn main_bytes_moved(&self, gg: &Geometry) -> f64 {
        let fsize = gg.float_type.size_bytes() as f64;
        let (m, n, k) = (gg.m as f64, gg.n as f64, gg.k as f64);
        let loads = m * n * k * (1.0 / self.macro_tile_a as f64 + 1.0 / self.macro_tile_b as f64);
        let c_traffic = m * n * if self.main_does_beta_c_inc { 2.0 } else { self.k_split as f64 };
        (loads + c_traffic) * fsize
    }

    pub fn copy_bytes_moved(&self, gg: &Geometry, mem: Mem) -> f64 {
        let written = match mem {
            Mem::A => self.workspace_bytes_a,
            Mem::B => self.workspace_bytes_b,
            _ => 0,
        };
        (gg.mem_size_bytes(mem) + written) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FloatType;

    fn hp(a_wos: usize, ice: usize, mac: usize, skw: usize) -> HyperParams {
        HyperParams::new(
            vec![4, 1, 0, 0, 1, a_wos],
            vec![4, 1, 0, 0, 1, 0],
            vec![16, 2, 0, ice, 16, 0, mac, skw],
        )
        .unwrap()
    }

    #[test]
    fn test_mac_grid() {
        let square = MacGrid::new(64, SKEW0);
        assert!(square.is_good);
        assert_eq!((square.grid_a, square.grid_b), (8, 8));

        let skewed = MacGrid::new(64, SKEW0 + 1);
        assert_eq!((skewed.grid_a, skewed.grid_b), (16, 4));

        let wide = MacGrid::new(256, SKEW0 - 1);
        assert_eq!((wide.grid_a, wide.grid_b), (8, 32));

        assert!(!MacGrid::new(1, SKEW0 + 1).is_good);
        assert!(!MacGrid::new(48, SKEW0).is_good);
    }

    #[test]
    fn test_beta_fusion_follows_k_split() {
        let gg = Geometry::packed(512, 512, 512, FloatType::F32).unwrap();
        let fused = DerivedParams::new(&hp(0, 1, 64, SKEW0), &gg).unwrap();
        assert!(fused.main_does_beta_c_inc);
        let split = DerivedParams::new(&hp(0, 4, 64, SKEW0), &gg).unwrap();
        assert!(!split.main_does_beta_c_inc);
        assert_eq!(split.n_groups, 16 * 16 * 4);
    }

    #[test]
    fn test_workspace_requirement() {
        let gg = Geometry::packed(256, 256, 64, FloatType::F32).unwrap();
        let derivability = Derivability::check(&hp(1, 1, 64, SKEW0), &gg);
        assert!(!derivability.is_derivable);
        assert!(derivability.msg.contains("workspace"));

        let roomy = gg.with_workspace(1 << 20);
        let dp = DerivedParams::new(&hp(1, 1, 64, SKEW0), &roomy).unwrap();
        assert!(dp.copy_a && !dp.copy_b);
        assert_eq!(dp.workspace_bytes_a, (256 + 1) * 64 * 4);
    }

    #[test]
    fn test_unroll_must_fit_in_k() {
        let shallow = Geometry::packed(64, 64, 4, FloatType::F32).unwrap();
        let derivability = Derivability::check(&hp(0, 1, 64, SKEW0), &shallow);
        assert!(!derivability.is_derivable);
        assert!(derivability.msg.contains("k = 4"));

        let exact = Geometry::packed(64, 64, 16, FloatType::F32).unwrap();
        assert!(Derivability::check(&hp(0, 1, 64, SKEW0), &exact).is_derivable);
        assert!(!Derivability::check(&hp(0, 2, 64, SKEW0), &exact).is_derivable);
    }

    #[test]
    fn test_non_derivable_is_logic_error() {
        let gg = Geometry::packed(512, 512, 512, FloatType::F32).unwrap();
        let err = DerivedParams::new(&hp(0, 1, 64, SKEW0 + 5), &gg).unwrap_err();
        assert!(err.is_logic());
    }
}
