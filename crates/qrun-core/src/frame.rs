//! Frame descriptors: the ordered, indexable buffer collection a caller
//! supplies per job.

use std::sync::Arc;

use crate::error::{Result, RuntimeError};
use crate::types::TensorDescriptor;

/// Name carried by the error payload written on async failure.
pub const ERROR_PAYLOAD_NAME: &str = "QNN ERROR";

/// Completion status reported by the backend for an async job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct NotifyStatus {
    pub code: u64,
}

impl NotifyStatus {
    pub const SUCCESS: Self = Self { code: 0 };

    pub const fn failed(code: u64) -> Self {
        Self { code }
    }

    pub const fn is_success(&self) -> bool {
        self.code == 0
    }
}

/// Payload written into the reserved error slot of a failed async frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorPayload {
    pub name: String,
    pub status: NotifyStatus,
}

impl ErrorPayload {
    pub fn new(status: NotifyStatus) -> Self {
        Self {
            name: ERROR_PAYLOAD_NAME.to_string(),
            status,
        }
    }
}

/// Host bytes owned by the caller (e.g. a serialized context binary).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ByteBuffer {
    pub name: String,
    pub data: Arc<[u8]>,
}

impl ByteBuffer {
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// One entry of a frame descriptor.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum BufferDescriptor {
    #[default]
    Empty,
    Tensor(TensorDescriptor),
    Bytes(ByteBuffer),
    Error(ErrorPayload),
}

impl BufferDescriptor {
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Empty => None,
            Self::Tensor(t) => Some(&t.name),
            Self::Bytes(b) => Some(&b.name),
            Self::Error(e) => Some(&e.name),
        }
    }

    pub fn as_tensor(&self) -> Option<&TensorDescriptor> {
        match self {
            Self::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorPayload> {
        match self {
            Self::Error(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TensorDescriptor> for BufferDescriptor {
    fn from(t: TensorDescriptor) -> Self {
        Self::Tensor(t)
    }
}

/// Ordered collection of buffer descriptors for one job.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FrameDescriptor {
    buffers: Vec<BufferDescriptor>,
}

impl FrameDescriptor {
    /// A frame of `len` empty slots.
    pub fn with_len(len: usize) -> Self {
        Self {
            buffers: vec![BufferDescriptor::Empty; len],
        }
    }

    pub fn from_buffers(buffers: Vec<BufferDescriptor>) -> Self {
        Self { buffers }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn buffers(&self) -> &[BufferDescriptor] {
        &self.buffers
    }

    pub fn push(&mut self, desc: impl Into<BufferDescriptor>) {
        self.buffers.push(desc.into());
    }

    pub fn get(&self, index: usize) -> Result<&BufferDescriptor> {
        self.buffers.get(index).ok_or(RuntimeError::IndexOutOfRange {
            what: "frame buffer",
            index,
            len: self.buffers.len(),
        })
    }

    /// Replace the descriptor at `index`; the frame never grows.
    pub fn set(&mut self, index: usize, desc: BufferDescriptor) -> Result<()> {
        let len = self.buffers.len();
        let slot = self.buffers.get_mut(index).ok_or(RuntimeError::IndexOutOfRange {
            what: "frame buffer",
            index,
            len,
        })?;
        *slot = desc;
        Ok(())
    }

    /// The tensor at `index`, or an error naming why it is not usable.
    pub fn tensor(&self, index: usize) -> Result<&TensorDescriptor> {
        self.get(index)?.as_tensor().ok_or_else(|| {
            RuntimeError::InvalidTensor(format!("buffer {index} is not a tensor"))
        })
    }

    /// Copy `other` into `self`, reusing the existing allocation.
    pub fn copy_from(&mut self, other: &FrameDescriptor) {
        self.buffers.clone_from(&other.buffers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ElementType, MemoryRegion};

    #[test]
    fn set_outside_frame_is_rejected() {
        let mut frame = FrameDescriptor::with_len(2);
        let err = frame
            .set(2, BufferDescriptor::Error(ErrorPayload::new(NotifyStatus::failed(7))))
            .expect_err("frame must not grow");
        assert!(matches!(
            err,
            RuntimeError::IndexOutOfRange { index: 2, len: 2, .. }
        ));
    }

    #[test]
    fn tensor_lookup_rejects_non_tensor_slot() {
        let mut frame = FrameDescriptor::with_len(1);
        frame.push(TensorDescriptor::new(
            "in",
            ElementType::Uint8,
            vec![1, 4],
            MemoryRegion::new(0x1000, 4),
        ));
        assert!(frame.tensor(1).is_ok());
        let err = frame.tensor(0).expect_err("empty slot is not a tensor");
        assert!(err.to_string().contains("not a tensor"));
    }

    #[test]
    fn error_payload_uses_reserved_name() {
        let payload = ErrorPayload::new(NotifyStatus::failed(3));
        assert_eq!(payload.name, ERROR_PAYLOAD_NAME);
        assert!(!payload.status.is_success());
    }
}
