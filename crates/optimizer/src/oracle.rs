//! Validity predicates for hyper-parameter points.

use gemmtune_kernels::{Chi, Derivability, DerivedParams, DeviceInfo, Geometry, HyperParams, Role};

/// Pass/fail plus a diagnostic message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    pub msg: String,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            msg: String::new(),
        }
    }

    pub fn fail(msg: impl Into<String>) -> Self {
        Self {
            passed: false,
            msg: msg.into(),
        }
    }
}

/// Decides whether a point yields a working kernel.
///
/// `derivability` is a property of the point and the geometry alone;
/// `capability` additionally depends on what the device can run.
pub trait Oracle {
    fn derivability(&self, hp: &HyperParams, geometry: &Geometry) -> Verdict;

    fn capability(&self, hp: &HyperParams, geometry: &Geometry, devinfo: &DeviceInfo) -> Verdict;
}

/// Register-file budget in accumulator elements per work-item.
const MAX_MICRO_TILE_AREA: usize = 64;

/// Oracle backed by [`DerivedParams`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultOracle;

impl Oracle for DefaultOracle {
    fn derivability(&self, hp: &HyperParams, geometry: &Geometry) -> Verdict {
        let derivability = Derivability::check(hp, geometry);
        if derivability.is_derivable {
            Verdict::pass()
        } else {
            Verdict::fail(derivability.msg)
        }
    }

    fn capability(&self, hp: &HyperParams, geometry: &Geometry, devinfo: &DeviceInfo) -> Verdict {
        let dp = match DerivedParams::new(hp, geometry) {
            Ok(dp) => dp,
            Err(e) => return Verdict::fail(e.to_string()),
        };
        if dp.local_memory_bytes > devinfo.local_mem_bytes {
            return Verdict::fail(format!(
                "requires {} bytes of local memory, {} has {}",
                dp.local_memory_bytes, devinfo.device_name, devinfo.local_mem_bytes
            ));
        }
        if dp.local_work_size > devinfo.max_work_group_size {
            return Verdict::fail(format!(
                "work-group size {} exceeds the device maximum {}",
                dp.local_work_size, devinfo.max_work_group_size
            ));
        }
        let area = hp.chi(Role::A, Chi::Mic) * hp.chi(Role::B, Chi::Mic);
        if area > MAX_MICRO_TILE_AREA {
            return Verdict::fail(format!(
                "micro tile of {area} elements exceeds the register budget of {MAX_MICRO_TILE_AREA}"
            ));
        }
        Verdict::pass()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gemmtune_kernels::FloatType;

    fn hp(mic: usize, unr: usize, mac: usize) -> HyperParams {
        HyperParams::new(
            vec![mic, 1, 0, 0, 1, 0],
            vec![mic, 1, 0, 0, 1, 0],
            vec![unr, 2, 0, 1, 16, 0, mac, 10],
        )
        .unwrap()
    }

    #[test]
    fn test_default_oracle_passes_modest_point() {
        let gg = Geometry::packed(512, 512, 512, FloatType::F32).unwrap();
        let oracle = DefaultOracle;
        let point = hp(4, 16, 64);
        assert!(oracle.derivability(&point, &gg).passed);
        assert!(oracle.capability(&point, &gg, &DeviceInfo::wavefront64("sim")).passed);
    }

    #[test]
    fn test_local_memory_limit() {
        let gg = Geometry::packed(4096, 4096, 4096, FloatType::F64).unwrap();
        // (16 * 8 + 1) * 2 * 64 * 8 bytes is well above 48 KiB.
        let verdict = DefaultOracle.capability(&hp(8, 64, 256), &gg, &DeviceInfo::warp32("sim"));
        assert!(!verdict.passed);
        assert!(verdict.msg.contains("local memory"));
    }

    #[test]
    fn test_work_group_limit() {
        let gg = Geometry::packed(4096, 4096, 4096, FloatType::F32).unwrap();
        let mut devinfo = DeviceInfo::wavefront64("sim");
        devinfo.max_work_group_size = 64;
        let verdict = DefaultOracle.capability(&hp(4, 8, 256), &gg, &devinfo);
        assert!(!verdict.passed);
        assert!(verdict.msg.contains("work-group size"));
    }

    #[test]
    fn test_non_derivable_fails_both() {
        let gg = Geometry::packed(512, 512, 512, FloatType::F32).unwrap();
        let bad = hp(4, 16, 48);
        assert!(!DefaultOracle.derivability(&bad, &gg).passed);
        assert!(!DefaultOracle.capability(&bad, &gg, &DeviceInfo::warp32("sim")).passed);
    }
}
