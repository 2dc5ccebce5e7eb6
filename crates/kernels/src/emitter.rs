//! Kernel source emission interface.
//!
//! Real source templating lives outside this workspace. The bundle
//! generator only needs a function name and a source string per kernel.

use crate::bundle::{KernelRole, KernelUses};
use crate::config::{Geometry, Mem};
use crate::derived::DerivedParams;
use crate::error::Result;
use crate::hyperparams::HyperParams;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelSource {
    pub function_name: String,
    pub source: String,
}

pub trait SourceEmitter {
    fn emit(
        &self,
        role: KernelRole,
        uses: &KernelUses,
        hp: &HyperParams,
        geometry: &Geometry,
        dp: &DerivedParams,
    ) -> Result<KernelSource>;
}

/// Emits signature-only stubs. The signature lists parameters in binding
/// order so it documents what the execution engine will bind.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignatureEmitter;

impl SourceEmitter for SignatureEmitter {
    fn emit(
        &self,
        role: KernelRole,
        uses: &KernelUses,
        hp: &HyperParams,
        geometry: &Geometry,
        _dp: &DerivedParams,
    ) -> Result<KernelSource> {
        let float = match geometry.float_type.size_bytes() {
            8 => "double",
            _ => "float",
        };
        let mut params = Vec::new();
        for mem in Mem::ALL {
            if uses.uses(mem) {
                params.push(format!("__global {float}* {}", mem.name()));
                params.push(format!("const ulong {}_offset", mem.name()));
            }
        }
        if uses.alpha {
            params.push(format!("const {float} alpha"));
        }
        if uses.beta {
            params.push(format!("const {float} beta"));
        }
        if uses.k {
            params.push("const ulong k".to_string());
        }

        let function_name = format!("gt_{}", role.name());
        let source = format!(
            "/* {hp} */\n/* {geometry} */\n__kernel void {function_name}({});\n",
            params.join(", ")
        );
        Ok(KernelSource {
            function_name,
            source,
        })
    }
}
