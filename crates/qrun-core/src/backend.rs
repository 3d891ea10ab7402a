//! Accelerator backend contracts.
//!
//! Two seams separate this runtime from the vendor stack:
//!
//! - [`AcceleratorBackend`] is owned per session: runtime, device, model
//!   and execution calls.
//! - [`DeviceMemory`] is owned per physical processor: the transport and
//!   map/unmap steps that make caller memory visible to the device.
//!
//! # Async completion
//!
//! [`AcceleratorBackend::execute_async`] receives a [`CompletionNotifier`].
//! The backend calls [`CompletionNotifier::notify`] exactly once, from any
//! thread it owns, when the job finishes.  The notifier is consumed by the
//! call, so a job cannot be completed twice.

use std::path::Path;
use std::sync::Arc;

use crate::config::{OpPackage, PerfProfile, Priority};
use crate::error::Result;
use crate::frame::NotifyStatus;
use crate::perf::ProfileEvent;
use crate::types::{MemoryRegion, ProcessorType, TensorDescriptor, TensorSlot};

/// Backend-issued handle for registered memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemHandle(pub u64);

/// Platform transport descriptor obtained when sharing memory with a
/// remote processor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransportHandle(pub i64);

/// Memory a bound tensor points the backend at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TensorMemory {
    /// Zero-copy: registered memory handle.
    Handle(MemHandle),
    /// Plain client buffer.
    Raw { addr: u64, size: usize },
}

/// A tensor ready for dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoundTensor {
    pub name: String,
    pub dims: Vec<u32>,
    pub memory: TensorMemory,
}

/// Input/output signature of one loaded graph.
#[derive(Clone, Debug, PartialEq)]
pub struct GraphInfo {
    pub name: String,
    pub inputs: Vec<TensorSlot>,
    pub outputs: Vec<TensorSlot>,
}

/// Model source handed to [`AcceleratorBackend::load_model`].
#[derive(Clone, Copy, Debug)]
pub enum ModelSource<'a> {
    Binary(&'a Path),
    Library(&'a Path),
    Buffer(&'a [u8]),
}

// ─── Completion hand-off ────────────────────────────────────────────────────

/// Key of an in-flight notify slot.
///
/// `generation` changes every time a slot is handed out, so a stale key can
/// never release a slot that has been reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub index: u16,
    pub generation: u32,
}

/// Receiver side of async completions.
pub trait CompletionSink: Send + Sync {
    fn complete(&self, key: SlotKey, status: NotifyStatus);
}

/// One-shot completion token handed to the backend per async job.
pub struct CompletionNotifier {
    key: SlotKey,
    sink: Arc<dyn CompletionSink>,
}

impl CompletionNotifier {
    pub fn new(key: SlotKey, sink: Arc<dyn CompletionSink>) -> Self {
        Self { key, sink }
    }

    pub fn key(&self) -> SlotKey {
        self.key
    }

    pub fn notify(self, status: NotifyStatus) {
        self.sink.complete(self.key, status);
    }
}

impl std::fmt::Debug for CompletionNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionNotifier")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

// ─── Traits ─────────────────────────────────────────────────────────────────

/// Per-session vendor runtime.
///
/// Setup methods come in acquire/release pairs so a failed initialize can
/// unwind exactly what it acquired.
pub trait AcceleratorBackend: Send + Sync {
    /// Load the backend library and create the backend for `processor`.
    fn open(&self, processor: ProcessorType) -> Result<()>;
    fn close(&self) -> Result<()>;

    /// Number of cores the platform reports for `processor`.
    fn core_count(&self, processor: ProcessorType) -> Result<u32>;
    fn create_device(&self, processor: ProcessorType, core_ids: &[u32]) -> Result<()>;
    fn free_device(&self) -> Result<()>;

    fn apply_performance(&self, profile: PerfProfile) -> Result<()>;
    fn release_performance(&self) -> Result<()>;

    fn load_op_package(&self, package: &OpPackage) -> Result<()>;
    fn set_priority(&self, priority: Priority) -> Result<()>;

    /// Create the context and return the signature of every graph in it.
    fn load_model(&self, source: ModelSource<'_>) -> Result<Vec<GraphInfo>>;
    fn free_model(&self) -> Result<()>;

    /// Blocking execution.
    fn execute(&self, inputs: &[BoundTensor], outputs: &[BoundTensor]) -> Result<()>;
    /// Queue an execution; `done` fires from a backend thread.
    ///
    /// On `Err` the backend must not have kept `done`.
    fn execute_async(
        &self,
        inputs: &[BoundTensor],
        outputs: &[BoundTensor],
        done: CompletionNotifier,
    ) -> Result<()>;

    fn enable_profiling(&self) -> Result<()>;
    fn disable_profiling(&self) -> Result<()>;
    /// Events recorded for the most recent execution.
    fn profile_events(&self) -> Result<Vec<ProfileEvent>>;
}

/// Per-processor memory sharing.
pub trait DeviceMemory: Send + Sync {
    /// Share `region` with the processor and return its transport descriptor.
    fn attach(&self, region: &MemoryRegion) -> Result<TransportHandle>;
    fn detach(&self, region: &MemoryRegion, transport: TransportHandle) -> Result<()>;
    /// Map an attached region for device access.
    fn map(&self, tensor: &TensorDescriptor, transport: TransportHandle) -> Result<MemHandle>;
    fn unmap(&self, handle: MemHandle) -> Result<()>;
}
