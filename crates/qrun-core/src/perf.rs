//! Execution timing samples and dispatch counters.

use std::sync::atomic::{AtomicU64, Ordering};

// ─── Perf sample ────────────────────────────────────────────────────────────

/// Latest timing sample of one execution, all values in microseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PerfSample {
    pub entire_exec_time: u64,
    pub rpc_exec_time_cpu: u64,
    pub rpc_exec_time_htp: u64,
    pub rpc_exec_time_acc: u64,
}

impl PerfSample {
    /// Size of the serialized record handed to monitoring consumers.
    pub const SIZE: usize = 4 * std::mem::size_of::<u64>();

    /// Fill a sample from backend profile events.
    ///
    /// Returns `None` when none of the events carry a recognised timing.
    pub fn from_events(events: &[ProfileEvent]) -> Option<Self> {
        let mut sample = Self::default();
        let mut valid = false;
        for event in events {
            let field = match event.kind {
                ProfileEventKind::Execute => &mut sample.entire_exec_time,
                ProfileEventKind::HostRpc => &mut sample.rpc_exec_time_cpu,
                ProfileEventKind::HtpRpc => &mut sample.rpc_exec_time_htp,
                ProfileEventKind::Accelerator => &mut sample.rpc_exec_time_acc,
                ProfileEventKind::Other => continue,
            };
            *field = event.value;
            valid = true;
        }
        valid.then_some(sample)
    }

    /// Little-endian record layout: the four counters in declaration order.
    pub fn to_le_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        for (chunk, value) in out.chunks_exact_mut(8).zip([
            self.entire_exec_time,
            self.rpc_exec_time_cpu,
            self.rpc_exec_time_htp,
            self.rpc_exec_time_acc,
        ]) {
            chunk.copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn from_le_bytes(raw: &[u8; Self::SIZE]) -> Self {
        let mut values = [0u64; 4];
        for (value, chunk) in values.iter_mut().zip(raw.chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            *value = u64::from_le_bytes(word);
        }
        Self {
            entire_exec_time: values[0],
            rpc_exec_time_cpu: values[1],
            rpc_exec_time_htp: values[2],
            rpc_exec_time_acc: values[3],
        }
    }
}

/// Kind of a backend profiling event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProfileEventKind {
    /// Whole graph execution.
    Execute,
    /// Host side of the remote call.
    HostRpc,
    /// Accelerator side of the remote call.
    HtpRpc,
    /// Pure accelerator compute time.
    Accelerator,
    Other,
}

/// One profiling event reported by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProfileEvent {
    pub kind: ProfileEventKind,
    pub value: u64,
}

// ─── Dispatch metrics ───────────────────────────────────────────────────────

/// Atomic counters for dispatch observability.
#[derive(Debug)]
pub struct DispatchMetrics {
    /// Blocking executions that returned successfully.
    pub sync_executed: AtomicU64,
    /// Async jobs accepted by the backend.
    pub async_dispatched: AtomicU64,
    /// Async jobs that completed successfully.
    pub async_succeeded: AtomicU64,
    /// Async jobs the backend reported as failed.
    pub async_failed: AtomicU64,
    /// Dispatches refused before or by the backend.
    pub rejected: AtomicU64,
}

impl DispatchMetrics {
    pub const fn new() -> Self {
        Self {
            sync_executed: AtomicU64::new(0),
            async_dispatched: AtomicU64::new(0),
            async_succeeded: AtomicU64::new(0),
            async_failed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchMetricsSnapshot {
        DispatchMetricsSnapshot {
            sync_executed: self.sync_executed.load(Ordering::Relaxed),
            async_dispatched: self.async_dispatched.load(Ordering::Relaxed),
            async_succeeded: self.async_succeeded.load(Ordering::Relaxed),
            async_failed: self.async_failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

impl Default for DispatchMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of dispatch metrics for reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchMetricsSnapshot {
    pub sync_executed: u64,
    pub async_dispatched: u64,
    pub async_succeeded: u64,
    pub async_failed: u64,
    pub rejected: u64,
}

impl DispatchMetricsSnapshot {
    /// Async jobs dispatched but not yet completed.
    pub fn in_flight(&self) -> u64 {
        self.async_dispatched
            .saturating_sub(self.async_succeeded + self.async_failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_from_events_maps_known_kinds() {
        let events = [
            ProfileEvent {
                kind: ProfileEventKind::Execute,
                value: 900,
            },
            ProfileEvent {
                kind: ProfileEventKind::Other,
                value: 1,
            },
            ProfileEvent {
                kind: ProfileEventKind::Accelerator,
                value: 700,
            },
        ];
        let sample = PerfSample::from_events(&events).expect("execute event present");
        assert_eq!(sample.entire_exec_time, 900);
        assert_eq!(sample.rpc_exec_time_acc, 700);
        assert_eq!(sample.rpc_exec_time_cpu, 0);
    }

    #[test]
    fn sample_from_unrecognised_events_is_none() {
        let events = [ProfileEvent {
            kind: ProfileEventKind::Other,
            value: 5,
        }];
        assert!(PerfSample::from_events(&events).is_none());
        assert!(PerfSample::from_events(&[]).is_none());
    }

    #[test]
    fn sample_record_layout_is_little_endian() {
        let sample = PerfSample {
            entire_exec_time: 1,
            rpc_exec_time_cpu: 2,
            rpc_exec_time_htp: 3,
            rpc_exec_time_acc: 0x0102,
        };
        let raw = sample.to_le_bytes();
        assert_eq!(raw[0], 1);
        assert_eq!(raw[8], 2);
        assert_eq!(raw[24], 0x02);
        assert_eq!(raw[25], 0x01);
        assert_eq!(PerfSample::from_le_bytes(&raw), sample);
    }

    #[test]
    fn in_flight_counts_outstanding_jobs() {
        let metrics = DispatchMetrics::new();
        for _ in 0..3 {
            DispatchMetrics::bump(&metrics.async_dispatched);
        }
        DispatchMetrics::bump(&metrics.async_failed);
        assert_eq!(metrics.snapshot().in_flight(), 2);
    }
}
