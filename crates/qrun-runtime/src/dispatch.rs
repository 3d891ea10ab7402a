//! Job dispatch: tensor validation, memory binding, sync/async execution and
//! the async completion path.
//!
//! The issuing side ([`ExecutionDispatcher`]) runs on the caller's thread.
//! The completion side ([`CompletionRouter`]) is invoked from backend-owned
//! threads; everything it shares with the issuing side sits behind its own
//! locks.

use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::{Notify, mpsc};
use tracing::{debug, error, warn};

use qrun_core::backend::{
    AcceleratorBackend, BoundTensor, CompletionNotifier, CompletionSink, GraphInfo, MemHandle,
    SlotKey, TensorMemory,
};
use qrun_core::error::{Result, RuntimeError};
use qrun_core::frame::NotifyStatus;
use qrun_core::perf::{DispatchMetrics, DispatchMetricsSnapshot};
use qrun_core::types::{ProcessorType, TensorDescriptor, TensorSlot};

use crate::notify::NotificationRingBuffer;
use crate::registry::RegistrationLedger;

// ─── Completion callbacks ───────────────────────────────────────────────────

/// Receives the outcome of async jobs, keyed by the caller's token.
///
/// Called from a backend thread; implementations must not block for long.
pub trait CompletionHandler: Send + Sync {
    fn on_success(&self, token: u64);

    /// An `Err` is a secondary failure (e.g. the error payload could not be
    /// written); it is logged and the slot is still returned.
    fn on_error(&self, token: u64, status: NotifyStatus) -> Result<()>;
}

/// Outcome of one async job as delivered over a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    pub token: u64,
    pub status: NotifyStatus,
}

/// [`CompletionHandler`] forwarding every outcome into an unbounded channel.
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<Completion>,
}

impl ChannelHandler {
    pub fn new(tx: mpsc::UnboundedSender<Completion>) -> Self {
        Self { tx }
    }

    /// Handler plus the receiving end.
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<Completion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self::new(tx)), rx)
    }
}

impl CompletionHandler for ChannelHandler {
    fn on_success(&self, token: u64) {
        if self
            .tx
            .send(Completion {
                token,
                status: NotifyStatus::SUCCESS,
            })
            .is_err()
        {
            warn!(token, "completion receiver dropped");
        }
    }

    fn on_error(&self, token: u64, status: NotifyStatus) -> Result<()> {
        self.tx
            .send(Completion { token, status })
            .map_err(|_| RuntimeError::backend("completion", "receiver dropped"))
    }
}

// ─── Completion router ──────────────────────────────────────────────────────

struct InFlight {
    token: u64,
    dispatched_at: Instant,
}

/// Correlates backend completions with the jobs that issued them.
///
/// Shared between the session and every [`CompletionNotifier`] handed to the
/// backend.
pub struct CompletionRouter {
    ring: Mutex<NotificationRingBuffer<InFlight>>,
    handler: Mutex<Option<Arc<dyn CompletionHandler>>>,
    metrics: DispatchMetrics,
    retired: Notify,
}

impl CompletionRouter {
    pub fn new(notify_slots: usize) -> Result<Self> {
        Ok(Self {
            ring: Mutex::new(NotificationRingBuffer::new(notify_slots)?),
            handler: Mutex::new(None),
            metrics: DispatchMetrics::new(),
            retired: Notify::new(),
        })
    }

    fn ring(&self) -> MutexGuard<'_, NotificationRingBuffer<InFlight>> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler(&self) -> Option<Arc<dyn CompletionHandler>> {
        self.handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_handler(&self, handler: Option<Arc<dyn CompletionHandler>>) {
        *self.handler.lock().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    pub fn has_handler(&self) -> bool {
        self.handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Return every slot; completions for older keys are dropped.
    pub fn reset(&self) {
        self.ring().reset();
        self.retired.notify_waiters();
    }

    pub fn capacity(&self) -> usize {
        self.ring().capacity()
    }

    pub fn free_slots(&self) -> usize {
        self.ring().free()
    }

    /// Resolve once at least `wanted` slots are free.
    ///
    /// Slots return to the ring after the handler has run, so a caller that
    /// just saw a completion event may wait here for its slot.
    pub async fn wait_free_slots(&self, wanted: usize) {
        loop {
            let mut retired = pin!(self.retired.notified());
            retired.as_mut().enable();
            if self.free_slots() >= wanted.min(self.capacity()) {
                return;
            }
            retired.await;
        }
    }

    pub fn metrics(&self) -> DispatchMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn acquire(&self, token: u64) -> Result<SlotKey> {
        self.ring().acquire(InFlight {
            token,
            dispatched_at: Instant::now(),
        })
    }

    /// Give back a slot whose job never reached the backend.
    fn abandon(&self, key: SlotKey) {
        self.ring().release(key);
        self.retired.notify_waiters();
    }
}

impl CompletionSink for CompletionRouter {
    fn complete(&self, key: SlotKey, status: NotifyStatus) {
        let token = match self.ring().get(key) {
            Some(job) => job.token,
            None => {
                warn!(
                    slot = key.index,
                    generation = key.generation,
                    "completion for unknown or stale notify slot dropped"
                );
                return;
            }
        };

        match self.handler() {
            Some(handler) if status.is_success() => handler.on_success(token),
            Some(handler) => {
                if let Err(err) = handler.on_error(token, status) {
                    warn!(token, code = status.code, error = %err, "error callback failed");
                }
            }
            None => warn!(token, "async job completed with no callback registered"),
        }

        if status.is_success() {
            DispatchMetrics::bump(&self.metrics.async_succeeded);
        } else {
            DispatchMetrics::bump(&self.metrics.async_failed);
        }

        if let Some(job) = self.ring().release(key) {
            debug!(
                token,
                code = status.code,
                elapsed_us = job.dispatched_at.elapsed().as_micros() as u64,
                "async job finished"
            );
        }
        self.retired.notify_waiters();
    }
}

// ─── Validation and binding ─────────────────────────────────────────────────

/// Check `given` against the model's `slots`.
///
/// Axis 0 is the batch axis and may differ from the model's extent.
pub fn validate_tensors(
    kind: &'static str,
    slots: &[TensorSlot],
    given: &[TensorDescriptor],
) -> Result<()> {
    if given.len() != slots.len() {
        return Err(RuntimeError::InvalidTensor(format!(
            "{kind} count mismatch: model has {}, got {}",
            slots.len(),
            given.len()
        )));
    }
    for (idx, (slot, tensor)) in slots.iter().zip(given).enumerate() {
        if tensor.region.is_null() {
            return Err(RuntimeError::InvalidTensor(format!(
                "{kind} {idx} ({}): data is null",
                slot.name
            )));
        }
        if tensor.element_type != slot.element_type {
            return Err(RuntimeError::InvalidTensor(format!(
                "{kind} {idx} ({}): type {:?} != {:?}",
                slot.name, tensor.element_type, slot.element_type
            )));
        }
        if tensor.rank() != slot.rank() {
            return Err(RuntimeError::InvalidTensor(format!(
                "{kind} {idx} ({}): rank {} != {}",
                slot.name,
                tensor.rank(),
                slot.rank()
            )));
        }
        if let Some(axis) = (1..slot.rank()).find(|&axis| tensor.dims[axis] != slot.dims[axis]) {
            return Err(RuntimeError::InvalidTensor(format!(
                "{kind} {idx} ({}): dim {axis} {} != {}",
                slot.name, tensor.dims[axis], slot.dims[axis]
            )));
        }
    }
    Ok(())
}

// ─── Dispatcher ─────────────────────────────────────────────────────────────

/// Issues validated jobs to the backend for one initialized session.
///
/// Not reentrant: the owning session serializes calls.
pub struct ExecutionDispatcher {
    backend: Arc<dyn AcceleratorBackend>,
    processor: ProcessorType,
    graph: GraphInfo,
    ledger: RegistrationLedger,
    router: Arc<CompletionRouter>,
}

impl ExecutionDispatcher {
    pub fn new(
        backend: Arc<dyn AcceleratorBackend>,
        processor: ProcessorType,
        graph: GraphInfo,
        ledger: RegistrationLedger,
        router: Arc<CompletionRouter>,
    ) -> Self {
        Self {
            backend,
            processor,
            graph,
            ledger,
            router,
        }
    }

    pub fn graph(&self) -> &GraphInfo {
        &self.graph
    }

    pub fn ledger(&self) -> &RegistrationLedger {
        &self.ledger
    }

    /// Zero-copy registration through this session's ledger.
    pub fn register(&mut self, tensor: &TensorDescriptor) -> Result<MemHandle> {
        self.ledger.acquire(tensor)
    }

    pub fn deregister(&mut self, addr: u64) -> Result<()> {
        self.ledger.release(addr)
    }

    /// Release every registration this session holds.
    pub fn flush(&mut self) -> Result<()> {
        self.ledger.release_all()
    }

    /// Into the ledger, for teardown.
    pub fn into_ledger(self) -> RegistrationLedger {
        self.ledger
    }

    fn prepare(
        &mut self,
        inputs: &[TensorDescriptor],
        outputs: &[TensorDescriptor],
    ) -> Result<(Vec<BoundTensor>, Vec<BoundTensor>)> {
        validate_tensors("input", &self.graph.inputs, inputs)?;
        validate_tensors("output", &self.graph.outputs, outputs)?;
        let bound_inputs = bind(self.processor, &mut self.ledger, &self.graph.inputs, inputs)?;
        let bound_outputs = bind(self.processor, &mut self.ledger, &self.graph.outputs, outputs)?;
        Ok((bound_inputs, bound_outputs))
    }

    /// Blocking execution; returns once the backend finishes.
    pub fn execute_sync(
        &mut self,
        inputs: &[TensorDescriptor],
        outputs: &[TensorDescriptor],
    ) -> Result<()> {
        let (bound_inputs, bound_outputs) = match self.prepare(inputs, outputs) {
            Ok(bound) => bound,
            Err(err) => {
                DispatchMetrics::bump(&self.router.metrics.rejected);
                return Err(err);
            }
        };
        match self.backend.execute(&bound_inputs, &bound_outputs) {
            Ok(()) => {
                DispatchMetrics::bump(&self.router.metrics.sync_executed);
                Ok(())
            }
            Err(err) => {
                error!(graph = %self.graph.name, error = %err, "graph execute failed");
                Err(err)
            }
        }
    }

    /// Queue a job; the outcome reaches the registered handler under `token`.
    pub fn execute_async(
        &mut self,
        inputs: &[TensorDescriptor],
        outputs: &[TensorDescriptor],
        token: u64,
    ) -> Result<()> {
        let result = self.dispatch_async(inputs, outputs, token);
        if result.is_err() {
            DispatchMetrics::bump(&self.router.metrics.rejected);
        }
        result
    }

    fn dispatch_async(
        &mut self,
        inputs: &[TensorDescriptor],
        outputs: &[TensorDescriptor],
        token: u64,
    ) -> Result<()> {
        if !self.router.has_handler() {
            return Err(RuntimeError::CallbackMissing);
        }
        let (bound_inputs, bound_outputs) = self.prepare(inputs, outputs)?;
        let key = self.router.acquire(token)?;
        let sink: Arc<dyn CompletionSink> = self.router.clone();
        let done = CompletionNotifier::new(key, sink);

        match self.backend.execute_async(&bound_inputs, &bound_outputs, done) {
            Ok(()) => {
                DispatchMetrics::bump(&self.router.metrics.async_dispatched);
                debug!(token, slot = key.index, "async job dispatched");
                Ok(())
            }
            Err(err) => {
                self.router.abandon(key);
                error!(graph = %self.graph.name, token, error = %err, "async execute rejected");
                Err(err)
            }
        }
    }
}

fn bind(
    processor: ProcessorType,
    ledger: &mut RegistrationLedger,
    slots: &[TensorSlot],
    given: &[TensorDescriptor],
) -> Result<Vec<BoundTensor>> {
    slots
        .iter()
        .zip(given)
        .map(|(slot, tensor)| {
            let memory = if processor.is_htp() {
                TensorMemory::Handle(ledger.acquire(tensor)?)
            } else {
                TensorMemory::Raw {
                    addr: tensor.region.addr,
                    size: tensor.region.size,
                }
            };
            Ok(BoundTensor {
                name: slot.name.clone(),
                dims: tensor.dims.clone(),
                memory,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use qrun_core::types::{ElementType, MemoryRegion};

    fn slot(name: &str, dims: &[u32]) -> TensorSlot {
        TensorSlot {
            name: name.into(),
            element_type: ElementType::Uint8,
            dims: dims.to_vec(),
            quantization: None,
        }
    }

    fn tensor(dims: &[u32], addr: u64) -> TensorDescriptor {
        TensorDescriptor::new("t", ElementType::Uint8, dims.to_vec(), MemoryRegion::new(addr, 64))
    }

    #[test]
    fn validation_exempts_batch_axis() {
        let slots = [slot("in", &[1, 4, 4])];
        validate_tensors("input", &slots, &[tensor(&[3, 4, 4], 0x100)]).expect("batch may vary");
        let err = validate_tensors("input", &slots, &[tensor(&[1, 4, 5], 0x100)])
            .expect_err("inner axis mismatch");
        assert!(err.to_string().contains("dim 2"));
    }

    #[test]
    fn validation_rejects_count_type_rank_and_null() {
        let slots = [slot("in", &[1, 4])];
        let err = validate_tensors("input", &slots, &[]).expect_err("count");
        assert!(err.to_string().contains("count mismatch"));

        let mut wrong_type = tensor(&[1, 4], 0x100);
        wrong_type.element_type = ElementType::Float32;
        let err = validate_tensors("input", &slots, &[wrong_type]).expect_err("type");
        assert!(err.to_string().contains("type"));

        let err = validate_tensors("input", &slots, &[tensor(&[1, 4, 1], 0x100)]).expect_err("rank");
        assert!(err.to_string().contains("rank"));

        let err = validate_tensors("input", &slots, &[tensor(&[1, 4], 0)]).expect_err("null");
        assert!(matches!(err, RuntimeError::InvalidTensor(ref m) if m.contains("null")));
    }

    struct Recorder {
        calls: Mutex<Vec<(u64, bool)>>,
        fail_error_write: bool,
    }

    impl CompletionHandler for Recorder {
        fn on_success(&self, token: u64) {
            self.calls.lock().expect("lock").push((token, true));
        }

        fn on_error(&self, token: u64, _status: NotifyStatus) -> Result<()> {
            self.calls.lock().expect("lock").push((token, false));
            if self.fail_error_write {
                return Err(RuntimeError::IndexOutOfRange {
                    what: "frame buffer",
                    index: 9,
                    len: 2,
                });
            }
            Ok(())
        }
    }

    fn router_with(fail_error_write: bool) -> (Arc<CompletionRouter>, Arc<Recorder>) {
        let router = Arc::new(CompletionRouter::new(2).expect("router"));
        let recorder = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
            fail_error_write,
        });
        router.set_handler(Some(recorder.clone()));
        (router, recorder)
    }

    #[test]
    fn completion_routes_token_and_frees_slot() {
        let (router, recorder) = router_with(false);
        let key = router.acquire(41).expect("slot");
        assert_eq!(router.free_slots(), 1);
        router.complete(key, NotifyStatus::SUCCESS);
        assert_eq!(*recorder.calls.lock().expect("lock"), vec![(41, true)]);
        assert_eq!(router.free_slots(), 2);
        assert_eq!(router.metrics().async_succeeded, 1);
    }

    #[test]
    fn failed_error_callback_still_frees_slot() {
        let (router, recorder) = router_with(true);
        let key = router.acquire(7).expect("slot");
        router.complete(key, NotifyStatus::failed(3));
        assert_eq!(*recorder.calls.lock().expect("lock"), vec![(7, false)]);
        assert_eq!(router.free_slots(), 2);
        assert_eq!(router.metrics().async_failed, 1);
    }

    #[test]
    fn duplicate_completion_is_dropped() {
        let (router, recorder) = router_with(false);
        let key = router.acquire(1).expect("slot");
        router.complete(key, NotifyStatus::SUCCESS);
        router.complete(key, NotifyStatus::SUCCESS);
        assert_eq!(recorder.calls.lock().expect("lock").len(), 1);
        assert_eq!(router.free_slots(), 2);
    }

    #[test]
    fn completion_after_reset_is_dropped() {
        let (router, recorder) = router_with(false);
        let key = router.acquire(1).expect("slot");
        router.reset();
        router.complete(key, NotifyStatus::failed(1));
        assert!(recorder.calls.lock().expect("lock").is_empty());
        assert_eq!(router.free_slots(), 2);
    }

    #[tokio::test]
    async fn slot_wait_wakes_when_completion_retires_a_slot() {
        let (router, recorder) = router_with(false);
        let first = router.acquire(1).expect("slot");
        let _second = router.acquire(2).expect("slot");

        let completer = Arc::clone(&router);
        let worker = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            completer.complete(first, NotifyStatus::SUCCESS);
        });
        tokio::time::timeout(std::time::Duration::from_secs(5), router.wait_free_slots(1))
            .await
            .expect("slot retired");
        assert_eq!(router.free_slots(), 1);
        assert_eq!(recorder.calls.lock().expect("lock").len(), 1);
        worker.join().expect("worker");

        router.reset();
        tokio::time::timeout(std::time::Duration::from_secs(5), router.wait_free_slots(8))
            .await
            .expect("request above capacity settles at capacity");
    }

    #[test]
    fn channel_handler_forwards_outcomes() {
        let (handler, mut rx) = ChannelHandler::channel();
        handler.on_success(3);
        handler
            .on_error(4, NotifyStatus::failed(9))
            .expect("receiver alive");
        assert_eq!(
            rx.try_recv().expect("first"),
            Completion {
                token: 3,
                status: NotifyStatus::SUCCESS
            }
        );
        assert_eq!(rx.try_recv().expect("second").status.code, 9);
        drop(rx);
        handler
            .on_error(5, NotifyStatus::failed(1))
            .expect_err("receiver gone");
    }
}
