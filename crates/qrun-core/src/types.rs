//! Core data model: lifecycle state, processors, tensor metadata and
//! caller memory regions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

// ─── Lifecycle state ────────────────────────────────────────────────────────

/// Lifecycle state of a session or node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    Initial = 0,
    Initializing = 1,
    Ready = 2,
    Running = 3,
    Error = 4,
}

impl SessionState {
    /// Decode the value stored in an atomic state cell.
    pub const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Initializing,
            2 => Self::Ready,
            3 => Self::Running,
            4 => Self::Error,
            _ => Self::Initial,
        }
    }

    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Initial => "initial",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

// ─── Processors ─────────────────────────────────────────────────────────────

/// Physical processor a session binds to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorType {
    #[default]
    Htp0,
    Htp1,
    Htp2,
    Htp3,
    Cpu,
    Gpu,
}

impl ProcessorType {
    /// Neural accelerator cores support zero-copy registration, performance
    /// votes and context priority.
    pub const fn is_htp(self) -> bool {
        matches!(self, Self::Htp0 | Self::Htp1 | Self::Htp2 | Self::Htp3)
    }

    pub const fn needs_device(self) -> bool {
        !matches!(self, Self::Cpu)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "htp0" => Some(Self::Htp0),
            "htp1" => Some(Self::Htp1),
            "htp2" => Some(Self::Htp2),
            "htp3" => Some(Self::Htp3),
            "cpu" => Some(Self::Cpu),
            "gpu" => Some(Self::Gpu),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Htp0 => "htp0",
            Self::Htp1 => "htp1",
            Self::Htp2 => "htp2",
            Self::Htp3 => "htp3",
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
        };
        f.write_str(label)
    }
}

// ─── Tensor metadata ────────────────────────────────────────────────────────

/// Element type of a tensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float16,
    Float32,
    Float64,
    SfixedPoint8,
    SfixedPoint16,
    SfixedPoint32,
    UfixedPoint8,
    UfixedPoint16,
    UfixedPoint32,
}

impl ElementType {
    pub const fn byte_width(self) -> usize {
        match self {
            Self::Int8 | Self::Uint8 | Self::SfixedPoint8 | Self::UfixedPoint8 => 1,
            Self::Int16
            | Self::Uint16
            | Self::Float16
            | Self::SfixedPoint16
            | Self::UfixedPoint16 => 2,
            Self::Int32
            | Self::Uint32
            | Self::Float32
            | Self::SfixedPoint32
            | Self::UfixedPoint32 => 4,
            Self::Int64 | Self::Uint64 | Self::Float64 => 8,
        }
    }
}

/// Scale/offset quantization encoding of a tensor.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quantization {
    pub scale: f32,
    pub offset: i32,
}

/// One named input or output of a loaded model.
///
/// Produced by introspecting the loaded graph; immutable afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorSlot {
    pub name: String,
    pub element_type: ElementType,
    pub dims: Vec<u32>,
    #[serde(default)]
    pub quantization: Option<Quantization>,
}

impl TensorSlot {
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Bytes needed for one tensor of this shape.
    ///
    /// A shape whose size does not fit in `usize` is an invalid tensor.
    pub fn byte_size(&self) -> Result<usize> {
        self.dims
            .iter()
            .try_fold(self.element_type.byte_width(), |acc, &d| {
                acc.checked_mul(d as usize)
            })
            .ok_or_else(|| {
                RuntimeError::InvalidTensor(format!(
                    "tensor {}: dims {:?} overflow the addressable size",
                    self.name, self.dims
                ))
            })
    }
}

// ─── Caller memory ──────────────────────────────────────────────────────────

/// Caller-owned memory, identified by its address.
///
/// `dma_handle` is the transport descriptor the platform uses to share the
/// allocation with a remote processor (a dma-buf fd on Linux).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryRegion {
    pub addr: u64,
    pub size: usize,
    pub dma_handle: i64,
    pub offset: u64,
}

impl MemoryRegion {
    pub const fn new(addr: u64, size: usize) -> Self {
        Self {
            addr,
            size,
            dma_handle: -1,
            offset: 0,
        }
    }

    pub const fn with_dma_handle(mut self, dma_handle: i64) -> Self {
        self.dma_handle = dma_handle;
        self
    }

    pub const fn is_null(&self) -> bool {
        self.addr == 0
    }
}

/// A tensor view over caller memory, as supplied per job.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorDescriptor {
    pub name: String,
    pub element_type: ElementType,
    pub dims: Vec<u32>,
    pub region: MemoryRegion,
}

impl TensorDescriptor {
    pub fn new(
        name: impl Into<String>,
        element_type: ElementType,
        dims: Vec<u32>,
        region: MemoryRegion,
    ) -> Self {
        Self {
            name: name.into(),
            element_type,
            dims,
            region,
        }
    }

    /// Descriptor shaped like `slot`, backed by `region`.
    pub fn for_slot(slot: &TensorSlot, region: MemoryRegion) -> Self {
        Self::new(slot.name.clone(), slot.element_type, slot.dims.clone(), region)
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_u8() {
        for state in [
            SessionState::Initial,
            SessionState::Initializing,
            SessionState::Ready,
            SessionState::Running,
            SessionState::Error,
        ] {
            assert_eq!(SessionState::from_u8(state.as_u8()), state);
        }
        assert_eq!(SessionState::from_u8(200), SessionState::Initial);
    }

    #[test]
    fn only_htp_cores_are_htp() {
        assert!(ProcessorType::Htp3.is_htp());
        assert!(!ProcessorType::Gpu.is_htp());
        assert!(!ProcessorType::Cpu.needs_device());
        assert!(ProcessorType::Gpu.needs_device());
    }

    #[test]
    fn processor_parse_is_case_insensitive() {
        assert_eq!(ProcessorType::parse("HTP1"), Some(ProcessorType::Htp1));
        assert_eq!(ProcessorType::parse("dsp"), None);
    }

    #[test]
    fn tensor_slot_byte_size() {
        let slot = TensorSlot {
            name: "in".into(),
            element_type: ElementType::Float16,
            dims: vec![1, 224, 224, 3],
            quantization: None,
        };
        assert_eq!(slot.byte_size().expect("fits"), 224 * 224 * 3 * 2);
    }

    #[test]
    fn oversized_dims_are_invalid_tensor() {
        let slot = TensorSlot {
            name: "huge".into(),
            element_type: ElementType::Float64,
            dims: vec![u32::MAX, u32::MAX, u32::MAX],
            quantization: None,
        };
        let err = slot.byte_size().expect_err("overflows usize");
        assert_eq!(err.kind(), crate::error::StatusKind::BadArguments);
        assert!(err.to_string().contains("huge"));
    }

    #[test]
    fn element_type_serializes_snake_case() {
        let raw = serde_json::to_string(&ElementType::UfixedPoint8).expect("serialize");
        assert_eq!(raw, "\"ufixed_point8\"");
    }
}
