//! Execution engine: binds arguments, runs bundles in dependency order and
//! times them.

use crate::device::{Device, DeviceFault, Event, KernelArg, KernelHandle, MemHandle, Scalar};
use gemmtune_kernels::{
    Bundle, FloatType, Geometry, KernelDescriptor, KernelRole, Mem, Offsets, Result, TuneError,
};
use gemmtune_optimizer::Halt;
use std::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_ALPHA: f64 = 1.0;
pub const DEFAULT_BETA: f64 = 1.0;

/// Device memory of the four operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBuffers {
    pub a: MemHandle,
    pub b: MemHandle,
    pub c: MemHandle,
    /// Must be present iff the geometry has a non-zero workspace.
    pub workspace: Option<MemHandle>,
}

impl DeviceBuffers {
    pub fn get(&self, mem: Mem) -> Option<MemHandle> {
        match mem {
            Mem::A => Some(self.a),
            Mem::B => Some(self.b),
            Mem::C => Some(self.c),
            Mem::W => self.workspace,
        }
    }
}

/// Timing of one kernel role across the runs since the last setup.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelTiming {
    pub role: KernelRole,
    pub t_start_ns: u64,
    pub t_end_ns: u64,
    pub times_ms: Vec<f64>,
}

#[derive(Debug, Default)]
struct KernelSlot {
    compiled: Option<(KernelHandle, String)>,
    event: Option<Event>,
    t_start_ns: u64,
    t_end_ns: u64,
    times_ms: Vec<f64>,
}

impl KernelSlot {
    fn update_needed(&self, descriptor: &KernelDescriptor) -> bool {
        !matches!(&self.compiled, Some((_, source)) if *source == descriptor.source)
    }

    fn reset_times(&mut self) {
        self.t_start_ns = 0;
        self.t_end_ns = 0;
        self.times_ms.clear();
    }
}

fn device_logic_error(context: &str, fault: DeviceFault) -> TuneError {
    TuneError::logic(format!("{context}: {fault}"))
}

pub struct Engine<D: Device> {
    device: D,
    geometry: Geometry,
    offsets: Offsets,
    buffers: DeviceBuffers,
    alpha: f64,
    beta: f64,
    slots: [KernelSlot; 4],
    active: Vec<KernelRole>,
    wait_indices: Vec<Vec<usize>>,
}

impl<D: Device> Engine<D> {
    /// Takes ownership of the device queue for the lifetime of the engine.
    ///
    /// With `c_is_const`, C is copied on the device first and the copy
    /// becomes the written operand.
    pub fn new(
        mut device: D,
        geometry: Geometry,
        offsets: Offsets,
        mut buffers: DeviceBuffers,
        c_is_const: bool,
    ) -> Result<Self> {
        geometry.validate()?;
        if c_is_const {
            let bytes = offsets.c + geometry.mem_size_bytes(Mem::C) + offsets.tail_c;
            buffers.c = device
                .copy_buffer(buffers.c, bytes)
                .map_err(|f| device_logic_error("copying C for c_is_const", f))?;
            debug!(bytes, "C is const, writing to a device copy");
        }
        let engine = Self {
            device,
            geometry,
            offsets,
            buffers,
            alpha: DEFAULT_ALPHA,
            beta: DEFAULT_BETA,
            slots: Default::default(),
            active: Vec::new(),
            wait_indices: Vec::new(),
        };
        engine.address_check_valid()?;
        Ok(engine)
    }

    pub fn with_scalars(mut self, alpha: f64, beta: f64) -> Self {
        self.alpha = alpha;
        self.beta = beta;
        // Bound arguments carry the old values.
        for slot in &mut self.slots {
            if let Some((stale, _)) = slot.compiled.take() {
                self.device.release_kernel(stale);
            }
        }
        self
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn buffers(&self) -> &DeviceBuffers {
        &self.buffers
    }

    /// C must not alias an input, and the workspace must exist iff the
    /// geometry asks for one and must alias nothing.
    pub fn address_check_valid(&self) -> Result<()> {
        let b = &self.buffers;
        for (name, input) in [("a", b.a), ("b", b.b)] {
            if b.c == input {
                return Err(TuneError::config(format!(
                    "c and {name} must be distinct memories, a shared buffer would be written while still being read"
                )));
            }
        }
        match (b.workspace, self.geometry.workspace_size) {
            (None, 0) => {}
            (None, ws) => {
                return Err(TuneError::config(format!(
                    "geometry requests {ws} workspace bytes but no workspace memory was given"
                )));
            }
            (Some(_), 0) => {
                return Err(TuneError::config(
                    "workspace memory given but the geometry workspace size is zero",
                ));
            }
            (Some(w), _) => {
                if w == b.a || w == b.b || w == b.c {
                    return Err(TuneError::config(
                        "workspace memory must be distinct from a, b and c",
                    ));
                }
            }
        }
        Ok(())
    }

    /// [`Self::address_check_valid`], and additionally A and B distinct so
    /// timings are not skewed by shared caching.
    pub fn address_check_valid_and_reliable(&self) -> Result<()> {
        self.address_check_valid()?;
        if self.buffers.a == self.buffers.b {
            return Err(TuneError::config(
                "a and b share memory, which skews benchmark timings",
            ));
        }
        Ok(())
    }

    fn scalar(&self, value: f64) -> Scalar {
        match self.geometry.float_type {
            FloatType::F32 => Scalar::F32(value as f32),
            FloatType::F64 => Scalar::F64(value),
        }
    }

    /// Positional arguments in the order kernels declare them:
    /// `{a, a_offset, b, b_offset, c, c_offset, w, w_offset}` for the operands
    /// used, then alpha, beta and k where used.
    pub fn bind_args(&self, descriptor: &KernelDescriptor) -> Result<Vec<KernelArg>> {
        let mut args = Vec::with_capacity(11);
        for mem in Mem::ALL {
            if !descriptor.uses.uses(mem) {
                continue;
            }
            let handle = self.buffers.get(mem).ok_or_else(|| {
                TuneError::config(format!(
                    "kernel {} uses {} but no such memory was given",
                    descriptor.function_name,
                    mem.name()
                ))
            })?;
            args.push(KernelArg::Mem(handle));
            args.push(KernelArg::Offset(self.offsets.offset(mem)));
        }
        if descriptor.uses.alpha {
            args.push(KernelArg::Float(self.scalar(self.alpha)));
        }
        if descriptor.uses.beta {
            args.push(KernelArg::Float(self.scalar(self.beta)));
        }
        if descriptor.uses.k {
            args.push(KernelArg::Index(self.geometry.k as u64));
        }
        Ok(args)
    }

    /// Compiles (where the source changed) and binds every kernel of the
    /// bundle, making them the active set.
    pub fn setup(&mut self, bundle: &Bundle) -> Result<()> {
        self.active.clear();
        for descriptor in &bundle.descriptors {
            let slot_index = descriptor.role.idx();
            if self.slots[slot_index].update_needed(descriptor) {
                let handle = self
                    .device
                    .compile(descriptor)
                    .map_err(|f| device_logic_error(&format!("compiling {}", descriptor.function_name), f))?;
                let args = self.bind_args(descriptor)?;
                self.device
                    .set_args(handle, &args)
                    .map_err(|f| device_logic_error(&format!("binding {}", descriptor.function_name), f))?;
                if let Some((stale, _)) = self.slots[slot_index]
                    .compiled
                    .replace((handle, descriptor.source.clone()))
                {
                    self.device.release_kernel(stale);
                }
            }
            self.slots[slot_index].reset_times();
            self.active.push(descriptor.role);
        }
        self.wait_indices = bundle.wait_indices.clone();
        Ok(())
    }

    pub fn active_roles(&self) -> &[KernelRole] {
        &self.active
    }

    pub fn timings(&self) -> Vec<KernelTiming> {
        self.active
            .iter()
            .map(|role| {
                let slot = &self.slots[role.idx()];
                KernelTiming {
                    role: *role,
                    t_start_ns: slot.t_start_ns,
                    t_end_ns: slot.t_end_ns,
                    times_ms: slot.times_ms.clone(),
                }
            })
            .collect()
    }

    /// Runs the active kernels until `halt` fires. Each run reports its
    /// time in milliseconds, first kernel start to last kernel end, and a
    /// summary line to `acton`.
    ///
    /// Transient resource exhaustion aborts with a recoverable error; any
    /// other device fault is fatal.
    pub fn run(&mut self, halt: &Halt, mut acton: impl FnMut(f64, String)) -> Result<()> {
        let timer = Instant::now();
        let mut runs = 0;
        while !halt.halt(runs, timer.elapsed().as_secs_f64()) {
            if self.active.is_empty() {
                return Err(TuneError::logic("zero kernels active"));
            }

            for k in 0..self.active.len() {
                let slot_index = self.active[k].idx();
                let Some((handle, _)) = &self.slots[slot_index].compiled else {
                    return Err(TuneError::logic(format!(
                        "kernel {} is active but not compiled",
                        self.active[k].name()
                    )));
                };
                let handle = *handle;
                let enqueued = {
                    let mut waits: Vec<&Event> = Vec::with_capacity(self.wait_indices[k].len());
                    for &j in &self.wait_indices[k] {
                        let event = self.slots[self.active[j].idx()].event.as_ref().ok_or_else(|| {
                            TuneError::logic(format!(
                                "{} waits on {} which has no event",
                                self.active[k].name(),
                                self.active[j].name()
                            ))
                        })?;
                        waits.push(event);
                    }
                    self.device.enqueue(handle, &waits)
                };

                match enqueued {
                    Ok(event) => {
                        if let Some(previous) = self.slots[slot_index].event.replace(event) {
                            self.device.release_event(previous);
                        }
                    }
                    Err(DeviceFault::OutOfResources(msg)) => {
                        if let Err(fault) = self.device.flush() {
                            warn!(%fault, "flush after resource failure also failed");
                        }
                        return Err(TuneError::resource(format!(
                            "enqueueing {}: {msg}",
                            self.active[k].name()
                        )));
                    }
                    Err(fault) => {
                        return Err(device_logic_error(
                            &format!("enqueueing {} (neither success nor out of resources)", self.active[k].name()),
                            fault,
                        ));
                    }
                }
            }

            self.device
                .flush()
                .map_err(|f| device_logic_error("flushing the queue", f))?;
            let last = self.active[self.active.len() - 1].idx();
            if let Some(event) = &self.slots[last].event {
                self.device
                    .wait(event)
                    .map_err(|f| device_logic_error("waiting for the last kernel", f))?;
            }

            for role in &self.active {
                let slot = &mut self.slots[role.idx()];
                if let Some(event) = &slot.event {
                    let (start, end) = self
                        .device
                        .profile(event)
                        .map_err(|f| device_logic_error("reading kernel timestamps", f))?;
                    slot.t_start_ns = start;
                    slot.t_end_ns = end;
                    slot.times_ms.push(end.saturating_sub(start) as f64 * 1e-6);
                }
            }

            let first = &self.slots[self.active[0].idx()];
            let extime = self.slots[last].t_end_ns.saturating_sub(first.t_start_ns) as f64 * 1e-6;
            acton(extime, self.run_time_string(extime));
            runs += 1;
        }
        Ok(())
    }

    pub fn gflops(&self, time_ms: f64) -> f64 {
        self.geometry.gflops(time_ms)
    }

    pub fn run_times_heading(&self) -> String {
        let mut heading = String::from("tt:\t");
        for k in 0..self.active.len() {
            heading.push_str(&format!(" k{k}:\t"));
        }
        heading.push_str(" Gflops/s:");
        heading
    }

    pub fn run_time_string(&self, extime: f64) -> String {
        let mut line = format!("{extime:.3}\t");
        for role in &self.active {
            let last = self.slots[role.idx()].times_ms.last().copied().unwrap_or_default();
            line.push_str(&format!(" {last:.3}\t"));
        }
        line.push_str(&format!(" {:.3}", self.gflops(extime)));
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;
    use gemmtune_kernels::{DeviceInfo, HyperParams};

    fn point(a_wos: usize, ice: usize) -> HyperParams {
        HyperParams::new(
            vec![4, 1, 0, 0, 1, a_wos],
            vec![4, 1, 0, 0, 1, 0],
            vec![16, 2, 0, ice, 16, 0, 64, 10],
        )
        .unwrap()
    }

    fn setup(workspace: usize) -> (SimDevice, Geometry, DeviceBuffers) {
        let gg = Geometry::packed(256, 256, 256, FloatType::F32)
            .unwrap()
            .with_workspace(workspace);
        let mut device = SimDevice::new(DeviceInfo::warp32("sim"), 5);
        let buffers = DeviceBuffers {
            a: device.allocate(gg.mem_size_bytes(Mem::A)),
            b: device.allocate(gg.mem_size_bytes(Mem::B)),
            c: device.allocate(gg.mem_size_bytes(Mem::C)),
            workspace: (workspace > 0).then(|| device.allocate(workspace)),
        };
        (device, gg, buffers)
    }

    #[test]
    fn test_aliased_output_is_configuration_error() {
        let (device, gg, mut buffers) = setup(0);
        buffers.c = buffers.a;
        let err = Engine::new(device, gg, Offsets::zero(), buffers, false)
            .err()
            .unwrap();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_workspace_presence_must_match_geometry() {
        let (device, gg, mut buffers) = setup(1 << 20);
        buffers.workspace = None;
        assert!(Engine::new(device, gg, Offsets::zero(), buffers, false)
            .err()
            .unwrap()
            .is_configuration());

        let (device, gg, mut buffers) = setup(1 << 20);
        buffers.workspace = Some(buffers.b);
        assert!(Engine::new(device, gg, Offsets::zero(), buffers, false).is_err());
    }

    #[test]
    fn test_reliable_check_rejects_shared_inputs() {
        let (device, gg, mut buffers) = setup(0);
        buffers.b = buffers.a;
        let engine = Engine::new(device, gg, Offsets::zero(), buffers, false).unwrap();
        assert!(engine.address_check_valid_and_reliable().unwrap_err().is_configuration());
    }

    #[test]
    fn test_c_is_const_writes_to_copy() {
        let (device, gg, buffers) = setup(0);
        let engine = Engine::new(device, gg, Offsets::zero(), buffers, true).unwrap();
        assert_ne!(engine.buffers().c, buffers.c);
    }

    #[test]
    fn test_argument_binding_order() {
        let (device, gg, buffers) = setup(1 << 20);
        let offsets = Offsets {
            a: 16,
            b: 32,
            c: 48,
            w: 64,
            ..Offsets::zero()
        };
        let engine = Engine::new(device, gg.clone(), offsets, buffers, false).unwrap();
        let bundle = Bundle::new(&point(1, 4), &gg).unwrap();
        let main = &bundle.descriptors[bundle.index_of(KernelRole::Main).unwrap()];
        let args = engine.bind_args(main).unwrap();
        let w = buffers.workspace.unwrap();
        assert_eq!(
            args,
            vec![
                KernelArg::Mem(buffers.b),
                KernelArg::Offset(32),
                KernelArg::Mem(buffers.c),
                KernelArg::Offset(48),
                KernelArg::Mem(w),
                KernelArg::Offset(64),
                KernelArg::Float(Scalar::F32(1.0)),
                KernelArg::Index(256),
            ]
        );
        assert_eq!(args[6].size_bytes(), 4);
    }

    #[test]
    fn test_scalars_reach_the_device() {
        let (device, gg, buffers) = setup(0);
        let mut engine = Engine::new(device, gg.clone(), Offsets::zero(), buffers, false)
            .unwrap()
            .with_scalars(2.0, 0.5);
        let bundle = Bundle::new(&point(0, 2), &gg).unwrap();
        engine.setup(&bundle).unwrap();
        for descriptor in &bundle.descriptors {
            let args = engine.device().bound_args(&descriptor.function_name).unwrap();
            let scalar = match descriptor.role {
                KernelRole::BetaC => Scalar::F32(0.5),
                _ => Scalar::F32(2.0),
            };
            assert!(args.contains(&KernelArg::Float(scalar)), "{:?}", descriptor.role);
        }
    }

    #[test]
    fn test_device_handles_stay_bounded() {
        let (device, gg, buffers) = setup(1 << 20);
        let mut engine = Engine::new(device, gg.clone(), Offsets::zero(), buffers, false).unwrap();
        for hp in [point(0, 1), point(0, 2), point(1, 4)] {
            engine.setup(&Bundle::new(&hp, &gg).unwrap()).unwrap();
            engine.run(&Halt::runs(200), |_, _| {}).unwrap();
        }
        assert_eq!(engine.device().enqueues(), 200 * (1 + 2 + 3));
        assert!(engine.device().live_events() <= KernelRole::ALL.len());
        assert!(engine.device().live_kernels() <= KernelRole::ALL.len());
    }

    #[test]
    fn test_run_reports_each_iteration() {
        let (device, gg, buffers) = setup(0);
        let mut engine = Engine::new(device, gg.clone(), Offsets::zero(), buffers, false).unwrap();
        engine.setup(&Bundle::new(&point(0, 1), &gg).unwrap()).unwrap();
        let mut times = Vec::new();
        engine
            .run(&Halt::runs(4), |t, summary| {
                assert!(!summary.is_empty());
                times.push(t);
            })
            .unwrap();
        assert_eq!(times.len(), 4);
        assert!(times.iter().all(|&t| t > 0.0));
        assert_eq!(engine.timings()[0].times_ms.len(), 4);
    }

    #[test]
    fn test_run_time_spans_dependent_kernels() {
        let (device, gg, buffers) = setup(1 << 20);
        let mut engine = Engine::new(device, gg.clone(), Offsets::zero(), buffers, false).unwrap();
        let bundle = Bundle::new(&point(1, 4), &gg).unwrap();
        engine.setup(&bundle).unwrap();
        let mut total = 0.0;
        engine.run(&Halt::runs(1), |t, _| total = t).unwrap();
        let timings = engine.timings();
        assert_eq!(timings.len(), 3);
        let main = &timings[bundle.index_of(KernelRole::Main).unwrap()];
        for other in timings.iter().filter(|t| t.role != KernelRole::Main) {
            assert!(main.t_start_ns >= other.t_end_ns);
        }
        assert!(total >= main.times_ms[0]);
    }

    #[test]
    fn test_zero_active_kernels_is_logic_error() {
        let (device, gg, buffers) = setup(0);
        let mut engine = Engine::new(device, gg, Offsets::zero(), buffers, false).unwrap();
        let err = engine.run(&Halt::runs(1), |_, _| {}).unwrap_err();
        assert!(err.is_logic());
    }

    #[test]
    fn test_resource_exhaustion_is_recoverable() {
        let (mut device, gg, buffers) = setup(0);
        device.fail_enqueues_when(|d| d.role == KernelRole::Main);
        let mut engine = Engine::new(device, gg.clone(), Offsets::zero(), buffers, false).unwrap();
        engine.setup(&Bundle::new(&point(0, 1), &gg).unwrap()).unwrap();
        let mut called = false;
        let err = engine.run(&Halt::runs(3), |_, _| called = true).unwrap_err();
        assert!(!err.is_fatal());
        assert!(!called);
        assert_eq!(engine.device().flushes(), 1);
    }

    #[test]
    fn test_recompiles_only_changed_sources() {
        let (device, gg, buffers) = setup(0);
        let mut engine = Engine::new(device, gg.clone(), Offsets::zero(), buffers, false).unwrap();
        let bundle = Bundle::new(&point(0, 1), &gg).unwrap();
        engine.setup(&bundle).unwrap();
        engine.setup(&bundle).unwrap();
        assert_eq!(engine.device().compilations(), 1);
        engine.setup(&Bundle::new(&point(0, 2), &gg).unwrap()).unwrap();
        assert_eq!(engine.device().compilations(), 3);
    }
}
