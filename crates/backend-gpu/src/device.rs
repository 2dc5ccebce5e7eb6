//! The compute-device boundary.
//!
//! A [`Device`] owns a command queue. Kernels are enqueued asynchronously
//! and return an [`Event`]; later kernels name their prerequisites by
//! borrowing those events in a wait-list.

use gemmtune_kernels::{DeviceInfo, KernelDescriptor};
use thiserror::Error;

/// Opaque device memory handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemHandle(pub u64);

/// Compiled kernel handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle(pub u64);

/// Completion handle of one enqueued kernel. Wait-lists borrow the event
/// the device returned.
#[derive(Debug, PartialEq, Eq)]
pub struct Event {
    id: u64,
}

impl Event {
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    F32(f32),
    F64(f64),
}

impl Scalar {
    pub fn size_bytes(&self) -> usize {
        match self {
            Scalar::F32(_) => 4,
            Scalar::F64(_) => 8,
        }
    }
}

/// One positional kernel argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KernelArg {
    Mem(MemHandle),
    /// Byte offset of the preceding memory operand.
    Offset(usize),
    Float(Scalar),
    Index(u64),
}

impl KernelArg {
    pub fn size_bytes(&self) -> usize {
        match self {
            KernelArg::Mem(_) => std::mem::size_of::<u64>(),
            KernelArg::Offset(_) => std::mem::size_of::<usize>(),
            KernelArg::Float(s) => s.size_bytes(),
            KernelArg::Index(_) => std::mem::size_of::<u64>(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceFault {
    /// Transient exhaustion of device resources.
    #[error("out of resources: {0}")]
    OutOfResources(String),
    #[error("device status {code}: {msg}")]
    Status { code: i32, msg: String },
}

pub trait Device {
    fn info(&self) -> &DeviceInfo;

    fn compile(&mut self, descriptor: &KernelDescriptor) -> Result<KernelHandle, DeviceFault>;

    fn set_args(&mut self, kernel: KernelHandle, args: &[KernelArg]) -> Result<(), DeviceFault>;

    /// Enqueues without blocking. The kernel starts only after every event
    /// in `wait_list` has completed.
    fn enqueue(&mut self, kernel: KernelHandle, wait_list: &[&Event]) -> Result<Event, DeviceFault>;

    fn flush(&mut self) -> Result<(), DeviceFault>;

    /// Blocks until `event` has completed.
    fn wait(&mut self, event: &Event) -> Result<(), DeviceFault>;

    /// Start and end timestamps of a completed event, in nanoseconds.
    fn profile(&self, event: &Event) -> Result<(u64, u64), DeviceFault>;

    /// Frees a completed event. No wait-list may refer to it afterwards.
    fn release_event(&mut self, event: Event);

    fn release_kernel(&mut self, kernel: KernelHandle);

    /// Allocates a new buffer holding a copy of the first `bytes` of `src`.
    fn copy_buffer(&mut self, src: MemHandle, bytes: usize) -> Result<MemHandle, DeviceFault>;
}
