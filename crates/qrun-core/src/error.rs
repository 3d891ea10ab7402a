//! Typed error hierarchy for the runtime.
//!
//! Every variant belongs to exactly one [`StatusKind`], the seven-way status
//! taxonomy exposed to callers.  Each variant also maps to a stable integer
//! code via [`RuntimeError::error_code`] for structured logs and process exit
//! codes.

use std::fmt;

use crate::types::SessionState;

/// Coarse status classes reported across the public API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusKind {
    /// API called outside its required lifecycle state.
    BadState,
    /// Malformed config, index out of range, tensor mismatch, null buffer.
    BadArguments,
    /// Opaque backend failure.
    Fail,
    /// Operation not meaningful for the processor or model.
    Unsupported,
    /// Capacity exhausted or a lookup that found nothing.
    OutOfBound,
    /// Allocation failure.
    NoMem,
    /// Idempotent guard tripped.
    Already,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BadState => "bad state",
            Self::BadArguments => "bad arguments",
            Self::Fail => "fail",
            Self::Unsupported => "unsupported",
            Self::OutOfBound => "out of bound",
            Self::NoMem => "no memory",
            Self::Already => "already",
        };
        f.write_str(label)
    }
}

/// All errors originating from the qrun runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    // ── Lifecycle ────────────────────────────────────────────────────
    #[error("{op} rejected in state {state}")]
    BadState {
        op: &'static str,
        state: SessionState,
    },

    // ── Arguments ────────────────────────────────────────────────────
    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid tensor: {0}")]
    InvalidTensor(String),

    #[error("{what} index {index} out of range (len {len})")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        len: usize,
    },

    #[error("global buffer map size is not correct: expect {expected}, got {found}")]
    BufferMapLength { expected: usize, found: usize },

    #[error("global buffer map[{index}] name {found} != {expected}")]
    BufferMapMismatch {
        index: usize,
        expected: String,
        found: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record buffer holds {found} bytes, expected {expected}")]
    RecordSize { expected: usize, found: usize },

    // ── Backend ──────────────────────────────────────────────────────
    #[error("Backend {step} failed: {message}")]
    Backend { step: &'static str, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    // ── Capacity ─────────────────────────────────────────────────────
    #[error("notify slots exhausted ({capacity} in flight)")]
    SlotsExhausted { capacity: usize },

    #[error("no completion callback registered for async execution")]
    CallbackMissing,

    #[error("buffer {addr:#x} is not registered")]
    UnknownBuffer { addr: u64 },

    #[error("perf data unavailable: {0}")]
    PerfUnavailable(&'static str),

    #[error("Frame Desc Pool is Full (capacity {capacity})")]
    PoolExhausted { capacity: usize },

    #[error("{0} already enabled")]
    AlreadyEnabled(&'static str),

    // ── Teardown aggregation ─────────────────────────────────────────
    #[error("teardown finished with {failures} failed step(s), first: {first}")]
    Teardown {
        failures: usize,
        first: Box<RuntimeError>,
    },
}

impl RuntimeError {
    /// Shorthand for an opaque backend failure.
    pub fn backend(step: &'static str, message: impl Into<String>) -> Self {
        Self::Backend {
            step,
            message: message.into(),
        }
    }

    /// Status class of this error.
    ///
    /// A [`Teardown`](Self::Teardown) reports the class of its first failure.
    pub fn kind(&self) -> StatusKind {
        match self {
            Self::BadState { .. } => StatusKind::BadState,
            Self::Config(_)
            | Self::InvalidTensor(_)
            | Self::IndexOutOfRange { .. }
            | Self::BufferMapLength { .. }
            | Self::BufferMapMismatch { .. }
            | Self::Json(_)
            | Self::RecordSize { .. } => StatusKind::BadArguments,
            Self::Backend { .. } | Self::Io(_) => StatusKind::Fail,
            Self::Unsupported(_) => StatusKind::Unsupported,
            Self::SlotsExhausted { .. }
            | Self::CallbackMissing
            | Self::UnknownBuffer { .. }
            | Self::PerfUnavailable(_) => StatusKind::OutOfBound,
            Self::PoolExhausted { .. } => StatusKind::NoMem,
            Self::AlreadyEnabled(_) => StatusKind::Already,
            Self::Teardown { first, .. } => first.kind(),
        }
    }

    /// Stable integer error code.
    ///
    /// Codes are grouped by status class:
    /// - 1xx: bad state
    /// - 2xx: bad arguments
    /// - 3xx: backend failure
    /// - 4xx: unsupported
    /// - 5xx: out of bound
    /// - 6xx: no memory
    /// - 7xx: already
    pub fn error_code(&self) -> u32 {
        match self {
            Self::BadState { .. } => 100,
            Self::Config(_) => 200,
            Self::InvalidTensor(_) => 201,
            Self::IndexOutOfRange { .. } => 202,
            Self::BufferMapLength { .. } => 203,
            Self::BufferMapMismatch { .. } => 204,
            Self::Json(_) => 205,
            Self::RecordSize { .. } => 206,
            Self::Backend { .. } => 300,
            Self::Io(_) => 301,
            Self::Teardown { .. } => 302,
            Self::Unsupported(_) => 400,
            Self::SlotsExhausted { .. } => 500,
            Self::CallbackMissing => 501,
            Self::UnknownBuffer { .. } => 502,
            Self::PerfUnavailable(_) => 503,
            Self::PoolExhausted { .. } => 600,
            Self::AlreadyEnabled(_) => 700,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Collects failures from best-effort multi-step teardown.
///
/// Every step is still attempted; [`finish`](Self::finish) reports whether
/// any of them failed.
#[derive(Debug, Default)]
pub struct TeardownErrors {
    failures: usize,
    first: Option<RuntimeError>,
}

impl TeardownErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, step: &'static str, result: Result<()>) {
        if let Err(err) = result {
            tracing::error!(step, error = %err, "teardown step failed");
            self.failures += 1;
            if self.first.is_none() {
                self.first = Some(err);
            }
        }
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn finish(self) -> Result<()> {
        match self.first {
            None => Ok(()),
            Some(first) => Err(RuntimeError::Teardown {
                failures: self.failures,
                first: Box::new(first),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(
            RuntimeError::SlotsExhausted { capacity: 8 }.kind(),
            StatusKind::OutOfBound
        );
        assert_eq!(RuntimeError::CallbackMissing.kind(), StatusKind::OutOfBound);
        assert_eq!(
            RuntimeError::PoolExhausted { capacity: 8 }.kind(),
            StatusKind::NoMem
        );
        assert_eq!(
            RuntimeError::AlreadyEnabled("perf").kind(),
            StatusKind::Already
        );
        assert_eq!(
            RuntimeError::BadState {
                op: "start",
                state: SessionState::Initial
            }
            .kind(),
            StatusKind::BadState
        );
    }

    #[test]
    fn teardown_collects_first_failure_and_count() {
        let mut errs = TeardownErrors::new();
        errs.record("a", Ok(()));
        errs.record("b", Err(RuntimeError::Unsupported("x".into())));
        errs.record("c", Err(RuntimeError::backend("free", "boom")));
        assert_eq!(errs.failures(), 2);
        let err = errs.finish().expect_err("two steps failed");
        match &err {
            RuntimeError::Teardown { failures, first } => {
                assert_eq!(*failures, 2);
                assert!(matches!(**first, RuntimeError::Unsupported(_)));
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
        assert_eq!(err.kind(), StatusKind::Unsupported);
    }

    #[test]
    fn teardown_without_failures_is_ok() {
        let mut errs = TeardownErrors::new();
        errs.record("a", Ok(()));
        errs.finish().expect("no failures recorded");
    }

    #[test]
    fn pool_exhausted_message_names_frame_pool() {
        let msg = RuntimeError::PoolExhausted { capacity: 8 }.to_string();
        assert!(msg.contains("Frame Desc Pool is Full"));
    }
}
