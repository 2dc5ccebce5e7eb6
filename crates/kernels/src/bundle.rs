//! Kernel bundles: the ordered, dependency-annotated kernels of one point.

use crate::config::{Geometry, Mem};
use crate::derived::DerivedParams;
use crate::emitter::{SignatureEmitter, SourceEmitter};
use crate::error::{Result, TuneError};
use crate::hyperparams::HyperParams;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelRole {
    CopyA,
    CopyB,
    BetaC,
    Main,
}

impl KernelRole {
    pub const ALL: [KernelRole; 4] = [
        KernelRole::CopyA,
        KernelRole::CopyB,
        KernelRole::BetaC,
        KernelRole::Main,
    ];

    pub fn idx(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            KernelRole::CopyA => "copya",
            KernelRole::CopyB => "copyb",
            KernelRole::BetaC => "betac",
            KernelRole::Main => "main",
        }
    }

    /// Roles that must complete before this role may run, when present.
    pub fn prerequisites(self) -> &'static [KernelRole] {
        match self {
            KernelRole::CopyA | KernelRole::CopyB | KernelRole::BetaC => &[],
            KernelRole::Main => &[KernelRole::BetaC, KernelRole::CopyA, KernelRole::CopyB],
        }
    }
}

/// Operands a kernel binds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelUses {
    pub a: bool,
    pub b: bool,
    pub c: bool,
    pub w: bool,
    pub alpha: bool,
    pub beta: bool,
    pub k: bool,
}

impl KernelUses {
    pub fn uses(&self, mem: Mem) -> bool {
        match mem {
            Mem::A => self.a,
            Mem::B => self.b,
            Mem::C => self.c,
            Mem::W => self.w,
        }
    }

    fn for_role(role: KernelRole, dp: &DerivedParams) -> Self {
        match role {
            KernelRole::CopyA => Self {
                a: true,
                w: true,
                ..Self::default()
            },
            KernelRole::CopyB => Self {
                b: true,
                w: true,
                ..Self::default()
            },
            KernelRole::BetaC => Self {
                c: true,
                beta: true,
                ..Self::default()
            },
            KernelRole::Main => Self {
                a: !dp.copy_a,
                b: !dp.copy_b,
                c: true,
                w: dp.copy_a || dp.copy_b,
                alpha: true,
                beta: dp.main_does_beta_c_inc,
                k: dp.k_split > 1,
            },
        }
    }
}

/// One compiled compute-kernel unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelDescriptor {
    pub role: KernelRole,
    pub uses: KernelUses,
    pub function_name: String,
    pub source: String,
    pub global_work_size: usize,
    pub local_work_size: usize,
    /// Estimated floating point operations.
    pub flops: f64,
    /// Estimated global memory traffic in bytes.
    pub bytes_moved: f64,
}

/// Kernels for one hyper-parameter point plus their wait graph.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub hp: HyperParams,
    pub dp: DerivedParams,
    pub descriptors: Vec<KernelDescriptor>,
    /// For each descriptor, indices of descriptors that must finish first.
    pub wait_indices: Vec<Vec<usize>>,
}

impl Bundle {
    pub fn new(hp: &HyperParams, geometry: &Geometry) -> Result<Self> {
        Self::generate(hp, geometry, &SignatureEmitter)
    }

    /// Emits copy-A, copy-B and beta kernels as the point requires, then the
    /// main kernel, and wires each to the prerequisites present.
    pub fn generate(
        hp: &HyperParams,
        geometry: &Geometry,
        emitter: &dyn SourceEmitter,
    ) -> Result<Self> {
        let dp = DerivedParams::new(hp, geometry)?;

        let mut roles = Vec::with_capacity(4);
        if dp.copy_a {
            roles.push(KernelRole::CopyA);
        }
        if dp.copy_b {
            roles.push(KernelRole::CopyB);
        }
        if !dp.main_does_beta_c_inc {
            roles.push(KernelRole::BetaC);
        }
        roles.push(KernelRole::Main);

        let mut descriptors = Vec::with_capacity(roles.len());
        for role in &roles {
            let uses = KernelUses::for_role(*role, &dp);
            let source = emitter.emit(*role, &uses, hp, geometry, &dp)?;
            let (global_work_size, local_work_size, flops, bytes_moved) =
                work_estimate(*role, geometry, &dp);
            descriptors.push(KernelDescriptor {
                role: *role,
                uses,
                function_name: source.function_name,
                source: source.source,
                global_work_size,
                local_work_size,
                flops,
                bytes_moved,
            });
        }

        let wait_indices: Vec<Vec<usize>> = roles
            .iter()
            .map(|role| {
                roles
                    .iter()
                    .enumerate()
                    .filter(|(_, other)| role.prerequisites().contains(*other))
                    .map(|(j, _)| j)
                    .collect()
            })
            .collect();

        for (i, waits) in wait_indices.iter().enumerate() {
            if waits.iter().any(|&j| j >= i) {
                return Err(TuneError::logic(format!(
                    "kernel {} waits on a kernel that is not enqueued before it",
                    roles[i].name()
                )));
            }
            let names: Vec<&str> = waits.iter().map(|&j| roles[j].name()).collect();
            debug!(kernel = i, role = roles[i].name(), waits_for = ?names, "bundle network");
        }

        Ok(Self {
            hp: hp.clone(),
            dp,
            descriptors,
            wait_indices,
        })
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn index_of(&self, role: KernelRole) -> Option<usize> {
        self.descriptors.iter().position(|d| d.role == role)
    }
}

fn work_estimate(role: KernelRole, gg: &Geometry, dp: &DerivedParams) -> (usize, usize, f64, f64) {
    const FORALL_LOCAL: usize = 256;
    let round_up = |x: usize| ((x + FORALL_LOCAL - 1) / FORALL_LOCAL) * FORALL_LOCAL;
    match role {
        KernelRole::CopyA => (
            round_up(gg.m * gg.k),
            FORALL_LOCAL,
            0.0,
            dp.copy_bytes_moved(gg, Mem::A),
        ),
        KernelRole::CopyB => (
            round_up(gg.n * gg.k),
            FORALL_LOCAL,
            0.0,
            dp.copy_bytes_moved(gg, Mem::B),
        ),
        KernelRole::BetaC => (
            round_up(gg.m * gg.n),
            FORALL_LOCAL,
            (gg.m * gg.n) as f64,
            2.0 * (gg.m * gg.n * gg.float_type.size_bytes()) as f64,
        ),
        KernelRole::Main => (
            dp.global_work_size,
            dp.local_work_size,
            gg.flops(),
            dp.main_bytes_moved(gg),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FloatType;

    fn point(a_wos: usize, b_wos: usize, ice: usize) -> HyperParams {
        HyperParams::new(
            vec![4, 1, 0, 0, 1, a_wos],
            vec![4, 1, 0, 0, 1, b_wos],
            vec![16, 2, 0, ice, 16, 0, 64, 10],
        )
        .unwrap()
    }

    fn geometry() -> Geometry {
        Geometry::packed(512, 512, 512, FloatType::F32)
            .unwrap()
            .with_workspace(16 << 20)
    }

    #[test]
    fn test_main_only_bundle() {
        let bundle = Bundle::new(&point(0, 0, 1), &geometry()).unwrap();
        assert_eq!(bundle.len(), 1);
        assert_eq!(bundle.descriptors[0].role, KernelRole::Main);
        assert!(bundle.wait_indices[0].is_empty());
    }

    #[test]
    fn test_main_waits_on_copy_a() {
        let bundle = Bundle::new(&point(1, 0, 1), &geometry()).unwrap();
        let copy_a = bundle.index_of(KernelRole::CopyA).unwrap();
        let main = bundle.index_of(KernelRole::Main).unwrap();
        assert_eq!(bundle.len(), 2);
        assert_eq!(bundle.wait_indices[main], vec![copy_a]);
        assert!(bundle.wait_indices[copy_a].is_empty());
    }

    #[test]
    fn test_full_bundle_network() {
        let bundle = Bundle::new(&point(1, 2, 4), &geometry()).unwrap();
        assert_eq!(bundle.len(), 4);
        let main = bundle.index_of(KernelRole::Main).unwrap();
        let mut waits = bundle.wait_indices[main].clone();
        waits.sort_unstable();
        let mut others: Vec<usize> = [KernelRole::CopyA, KernelRole::CopyB, KernelRole::BetaC]
            .iter()
            .map(|r| bundle.index_of(*r).unwrap())
            .collect();
        others.sort_unstable();
        assert_eq!(waits, others);
        for i in others {
            assert!(bundle.wait_indices[i].is_empty());
        }
    }

    #[test]
    fn test_main_kernel_uses() {
        let bundle = Bundle::new(&point(1, 0, 4), &geometry()).unwrap();
        let main = &bundle.descriptors[bundle.index_of(KernelRole::Main).unwrap()];
        assert!(!main.uses.a && main.uses.b && main.uses.c && main.uses.w);
        assert!(main.uses.alpha && !main.uses.beta && main.uses.k);
        assert!(main.source.contains("const ulong k"));
    }

    #[test]
    fn test_non_derivable_emits_nothing() {
        let tight = Geometry::packed(512, 512, 512, FloatType::F32).unwrap();
        assert!(Bundle::new(&point(1, 0, 1), &tight).unwrap_err().is_logic());
    }
}
