//! A simulated device with a roofline cost model.
//!
//! Kernel durations come from the descriptor's flop and byte estimates, an
//! occupancy factor from the work-group count, and a little seeded noise.
//! Tests can script durations and inject resource faults.

use crate::device::{Device, DeviceFault, Event, KernelArg, KernelHandle, MemHandle};
use fastrand::Rng;
use gemmtune_kernels::{DeviceInfo, KernelDescriptor};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use tracing::debug;

const LAUNCH_OVERHEAD_NS: f64 = 5_000.0;
/// Spread of the per-source factor standing in for effects the roofline
/// misses, such as unrolling and padding.
const SOURCE_SPREAD: f64 = 0.05;
const INVALID_KERNEL_ARGS: i32 = -52;
const INVALID_EVENT: i32 = -58;
const INVALID_MEM_OBJECT: i32 = -38;

struct SimKernel {
    descriptor: KernelDescriptor,
    args: Option<Vec<KernelArg>>,
}

type FaultPredicate = Box<dyn Fn(&KernelDescriptor) -> bool>;

pub struct SimDevice {
    info: DeviceInfo,
    rng: Rng,
    /// Peak throughput, GFLOP/s.
    peak_gflops: f64,
    /// Global memory bandwidth, GB/s.
    bandwidth_gbps: f64,
    noise: f64,
    clock_ns: u64,
    next_id: u64,
    kernels: HashMap<u64, SimKernel>,
    events: HashMap<u64, (u64, u64)>,
    buffers: HashMap<MemHandle, usize>,
    scripted_ms: VecDeque<f64>,
    fault: Option<FaultPredicate>,
    compilations: usize,
    enqueues: usize,
    flushes: usize,
}

impl SimDevice {
    pub fn new(info: DeviceInfo, seed: u64) -> Self {
        Self {
            info,
            rng: Rng::with_seed(seed),
            peak_gflops: 10_000.0,
            bandwidth_gbps: 500.0,
            noise: 0.02,
            clock_ns: 0,
            next_id: 1,
            kernels: HashMap::new(),
            events: HashMap::new(),
            buffers: HashMap::new(),
            scripted_ms: VecDeque::new(),
            fault: None,
            compilations: 0,
            enqueues: 0,
            flushes: 0,
        }
    }

    pub fn with_throughput(mut self, peak_gflops: f64, bandwidth_gbps: f64) -> Self {
        self.peak_gflops = peak_gflops;
        self.bandwidth_gbps = bandwidth_gbps;
        self
    }

    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }

    /// Durations in milliseconds consumed one per enqueue, ahead of the
    /// cost model.
    pub fn script_times(&mut self, times_ms: impl IntoIterator<Item = f64>) {
        self.scripted_ms.extend(times_ms);
    }

    /// Enqueues of matching kernels fail with out-of-resources.
    pub fn fail_enqueues_when(&mut self, predicate: impl Fn(&KernelDescriptor) -> bool + 'static) {
        self.fault = Some(Box::new(predicate));
    }

    pub fn clear_faults(&mut self) {
        self.fault = None;
    }

    pub fn allocate(&mut self, bytes: usize) -> MemHandle {
        let handle = MemHandle(self.fresh_id());
        self.buffers.insert(handle, bytes);
        handle
    }

    /// Arguments bound to the live kernel compiled from `function_name`.
    pub fn bound_args(&self, function_name: &str) -> Option<&[KernelArg]> {
        self.kernels
            .values()
            .find(|k| k.descriptor.function_name == function_name)?
            .args
            .as_deref()
    }

    /// Events not yet released.
    pub fn live_events(&self) -> usize {
        self.events.len()
    }

    /// Compiled kernels not yet released.
    pub fn live_kernels(&self) -> usize {
        self.kernels.len()
    }

    pub fn compilations(&self) -> usize {
        self.compilations
    }

    pub fn enqueues(&self) -> usize {
        self.enqueues
    }

    pub fn flushes(&self) -> usize {
        self.flushes
    }

    fn fresh_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn modelled_ns(&mut self, d: &KernelDescriptor) -> f64 {
        let groups = (d.global_work_size / d.local_work_size.max(1)).max(1) as f64;
        let waves = (groups / self.info.compute_units as f64).ceil().max(1.0);
        // Tail effect: a partially filled last wave wastes compute units.
        let occupancy = groups / (waves * self.info.compute_units as f64);
        let atom = self.info.wg_atom_size as f64;
        let lane_use = {
            let local = d.local_work_size.max(1) as f64;
            local / ((local / atom).ceil() * atom)
        };
        let compute_ns = d.flops / (self.peak_gflops * occupancy.max(0.05) * lane_use);
        let memory_ns = d.bytes_moved / self.bandwidth_gbps;
        let jitter = 1.0 + self.noise * (self.rng.f64() - 0.5);
        (LAUNCH_OVERHEAD_NS + compute_ns.max(memory_ns)) * source_factor(&d.source) * jitter
    }

    fn expected_arg_count(d: &KernelDescriptor) -> usize {
        let u = &d.uses;
        2 * [u.a, u.b, u.c, u.w].iter().filter(|x| **x).count()
            + [u.alpha, u.beta, u.k].iter().filter(|x| **x).count()
    }
}

fn source_factor(source: &str) -> f64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    1.0 + SOURCE_SPREAD * (hasher.finish() % 1024) as f64 / 1024.0
}

impl Device for SimDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn compile(&mut self, descriptor: &KernelDescriptor) -> Result<KernelHandle, DeviceFault> {
        let id = self.fresh_id();
        self.compilations += 1;
        self.kernels.insert(
            id,
            SimKernel {
                descriptor: descriptor.clone(),
                args: None,
            },
        );
        debug!(kernel = %descriptor.function_name, id, "compiled");
        Ok(KernelHandle(id))
    }

    fn set_args(&mut self, kernel: KernelHandle, args: &[KernelArg]) -> Result<(), DeviceFault> {
        let invalid = |msg: String| DeviceFault::Status {
            code: INVALID_KERNEL_ARGS,
            msg,
        };
        let entry = self
            .kernels
            .get(&kernel.0)
            .ok_or_else(|| invalid(format!("unknown kernel {}", kernel.0)))?;
        let expected = Self::expected_arg_count(&entry.descriptor);
        if args.len() != expected {
            return Err(invalid(format!(
                "{} takes {} arguments, got {}",
                entry.descriptor.function_name,
                expected,
                args.len()
            )));
        }
        for arg in args {
            if let KernelArg::Mem(handle) = arg {
                if !self.buffers.contains_key(handle) {
                    return Err(DeviceFault::Status {
                        code: INVALID_MEM_OBJECT,
                        msg: format!("unknown memory {}", handle.0),
                    });
                }
            }
        }
        if let Some(entry) = self.kernels.get_mut(&kernel.0) {
            entry.args = Some(args.to_vec());
        }
        Ok(())
    }

    fn enqueue(&mut self, kernel: KernelHandle, wait_list: &[&Event]) -> Result<Event, DeviceFault> {
        let descriptor = match self.kernels.get(&kernel.0) {
            Some(SimKernel {
                descriptor,
                args: Some(_),
            }) => descriptor.clone(),
            _ => {
                return Err(DeviceFault::Status {
                    code: INVALID_KERNEL_ARGS,
                    msg: format!("kernel {} has no bound arguments", kernel.0),
                })
            }
        };
        if self.fault.as_ref().is_some_and(|fails| fails(&descriptor)) {
            return Err(DeviceFault::OutOfResources(format!(
                "{} could not be launched",
                descriptor.function_name
            )));
        }

        let mut start = self.clock_ns;
        for event in wait_list {
            let (_, end) = self.events.get(&event.id()).ok_or(DeviceFault::Status {
                code: INVALID_EVENT,
                msg: format!("unknown event {}", event.id()),
            })?;
            start = start.max(*end);
        }
        let duration_ns = match self.scripted_ms.pop_front() {
            Some(ms) => ms * 1e6,
            None => self.modelled_ns(&descriptor),
        };
        let end = start + duration_ns.max(1.0) as u64;
        let id = self.fresh_id();
        self.events.insert(id, (start, end));
        self.enqueues += 1;
        Ok(Event::new(id))
    }

    fn flush(&mut self) -> Result<(), DeviceFault> {
        self.flushes += 1;
        Ok(())
    }

    fn wait(&mut self, event: &Event) -> Result<(), DeviceFault> {
        let (_, end) = self.profile(event)?;
        self.clock_ns = self.clock_ns.max(end);
        Ok(())
    }

    fn profile(&self, event: &Event) -> Result<(u64, u64), DeviceFault> {
        self.events.get(&event.id()).copied().ok_or(DeviceFault::Status {
            code: INVALID_EVENT,
            msg: format!("unknown event {}", event.id()),
        })
    }

    fn release_event(&mut self, event: Event) {
        self.events.remove(&event.id());
    }

    fn release_kernel(&mut self, kernel: KernelHandle) {
        self.kernels.remove(&kernel.0);
    }

    fn copy_buffer(&mut self, src: MemHandle, bytes: usize) -> Result<MemHandle, DeviceFault> {
        let size = *self.buffers.get(&src).ok_or(DeviceFault::Status {
            code: INVALID_MEM_OBJECT,
            msg: format!("unknown memory {}", src.0),
        })?;
        if bytes > size {
            return Err(DeviceFault::Status {
                code: INVALID_MEM_OBJECT,
                msg: format!("copy of {bytes} bytes from a buffer of {size}"),
            });
        }
        Ok(self.allocate(bytes))
    }
}
