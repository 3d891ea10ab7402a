//! Monitoring surface: fixed-size timing records copied into caller memory.

use qrun_core::error::{Result, RuntimeError};
use qrun_core::perf::PerfSample;

/// Exposes the latest timing record of a node.
pub trait Monitor {
    /// Largest record [`place`](Monitor::place) can write.
    fn maximal_size(&self) -> usize;

    /// Size of the record [`place`](Monitor::place) writes now.
    fn current_size(&self) -> usize;

    /// Copy the latest record into `out`, which must be exactly
    /// [`current_size`](Monitor::current_size) bytes.
    fn place(&self, out: &mut [u8]) -> Result<()>;
}

/// Serialize `sample` into `out` after checking its length.
pub fn place_sample(sample: &PerfSample, out: &mut [u8]) -> Result<()> {
    check_record_len(out)?;
    out.copy_from_slice(&sample.to_le_bytes());
    Ok(())
}

pub(crate) fn check_record_len(out: &[u8]) -> Result<()> {
    if out.len() != PerfSample::SIZE {
        return Err(RuntimeError::RecordSize {
            expected: PerfSample::SIZE,
            found: out.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qrun_core::error::StatusKind;

    #[test]
    fn place_sample_rejects_wrong_length() {
        let sample = PerfSample::default();
        let mut short = [0u8; 16];
        let err = place_sample(&sample, &mut short).expect_err("too short");
        assert_eq!(err.kind(), StatusKind::BadArguments);
        assert!(err.to_string().contains("expected 32"));
    }

    #[test]
    fn place_sample_writes_le_record() {
        let sample = PerfSample {
            entire_exec_time: 10,
            rpc_exec_time_cpu: 20,
            rpc_exec_time_htp: 30,
            rpc_exec_time_acc: 40,
        };
        let mut out = [0u8; PerfSample::SIZE];
        place_sample(&sample, &mut out).expect("exact length");
        assert_eq!(PerfSample::from_le_bytes(&out), sample);
    }
}
