//! Model node: the frame-oriented lifecycle API over one accelerator session.
//!
//! A node runs synchronously unless an event channel is supplied at
//! initialize.  With a channel, [`ModelNode::process_frame_descriptor`]
//! copies the frame into the ticket pool, dispatches it, and returns; the
//! outcome arrives later as a [`NodeEvent`] carrying that copy.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use qrun_core::backend::AcceleratorBackend;
use qrun_core::config::{ConfigDocument, DynamicConfig, NodeConfig};
use qrun_core::error::{Result, RuntimeError};
use qrun_core::frame::{BufferDescriptor, ErrorPayload, FrameDescriptor, NotifyStatus};
use qrun_core::perf::{DispatchMetricsSnapshot, PerfSample};
use qrun_core::types::{SessionState, TensorDescriptor, TensorSlot};
use qrun_runtime::{
    AcceleratorSession, CompletionHandler, GlobalBufferIndexEntry, RegistryDirectory, StateWatch,
};

use crate::monitor::{Monitor, check_record_len, place_sample};
use crate::ticket::FrameTicketTracker;

// ─── Events ─────────────────────────────────────────────────────────────────

/// Outcome of one async frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Done,
    /// The backend failed the job; the frame's error slot holds the payload.
    Failed(NotifyStatus),
}

impl FrameStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// Delivered once per async frame.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeEvent {
    pub frame: FrameDescriptor,
    pub node_id: u32,
    pub status: FrameStatus,
    /// Node state when the completion was handled.
    pub state: SessionState,
}

fn lock(tracker: &Mutex<FrameTicketTracker>) -> MutexGuard<'_, FrameTicketTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Completion handler installed by an async node.
struct NodeCompletion {
    node_id: u32,
    error_index: usize,
    tracker: Arc<Mutex<FrameTicketTracker>>,
    events: mpsc::UnboundedSender<NodeEvent>,
    state: StateWatch,
}

impl NodeCompletion {
    fn take(&self, ticket: u64) -> Option<FrameDescriptor> {
        let frame = lock(&self.tracker).resolve(ticket);
        if frame.is_none() {
            error!(node = self.node_id, ticket, "completion for invalid ticket");
        }
        frame
    }

    /// Return the pooled frame, then report a copy of it.
    fn deliver(&self, frame: FrameDescriptor, status: FrameStatus) {
        let event = NodeEvent {
            frame: frame.clone(),
            node_id: self.node_id,
            status,
            state: self.state.get(),
        };
        lock(&self.tracker).recycle(frame);
        if self.events.send(event).is_err() {
            warn!(node = self.node_id, "node event receiver dropped");
        }
    }
}

impl CompletionHandler for NodeCompletion {
    fn on_success(&self, token: u64) {
        let Some(frame) = self.take(token) else {
            return;
        };
        self.deliver(frame, FrameStatus::Done);
    }

    fn on_error(&self, token: u64, status: NotifyStatus) -> Result<()> {
        let Some(mut frame) = self.take(token) else {
            return Ok(());
        };
        let written = frame.set(
            self.error_index,
            BufferDescriptor::Error(ErrorPayload::new(status)),
        );
        match &written {
            Ok(()) => self.deliver(frame, FrameStatus::Failed(status)),
            Err(err) => {
                error!(
                    node = self.node_id,
                    ticket = token,
                    error = %err,
                    "failed to set error buffer descriptor"
                );
                lock(&self.tracker).recycle(frame);
            }
        }
        written
    }
}

// ─── Node ───────────────────────────────────────────────────────────────────

/// One model loaded on one processor, driven frame by frame.
pub struct ModelNode {
    id: u32,
    session: AcceleratorSession,
    tracker: Option<Arc<Mutex<FrameTicketTracker>>>,
}

impl ModelNode {
    pub fn new(
        backend: Arc<dyn AcceleratorBackend>,
        directory: Arc<RegistryDirectory>,
    ) -> Result<Self> {
        Ok(Self {
            id: 0,
            session: AcceleratorSession::new(backend, directory)?,
            tracker: None,
        })
    }

    /// Bring the node up from a validated config.
    ///
    /// Supplying `events` selects async processing.
    pub fn initialize(
        &mut self,
        config: &NodeConfig,
        buffers: &[BufferDescriptor],
        events: Option<mpsc::UnboundedSender<NodeEvent>>,
    ) -> Result<()> {
        self.session.initialize(config, buffers, None)?;
        self.id = config.id;

        if let Some(events) = events {
            if let Err(err) = self.enable_async(events) {
                error!(node = self.id, error = %err, "async setup failed, unwinding");
                if let Err(teardown) = self.session.deinitialize() {
                    warn!(node = self.id, error = %teardown, "unwind after async setup failed");
                }
                return Err(err);
            }
        }

        info!(
            node = %config.name,
            id = self.id,
            mode = if self.tracker.is_some() { "async" } else { "sync" },
            "node initialized"
        );
        Ok(())
    }

    /// Parse a JSON document whose `static` section configures the node.
    pub fn initialize_from_json(
        &mut self,
        raw: &str,
        buffers: &[BufferDescriptor],
        events: Option<mpsc::UnboundedSender<NodeEvent>>,
    ) -> Result<()> {
        match ConfigDocument::from_json_str(raw)? {
            ConfigDocument::Static(config) => self.initialize(&config, buffers, events),
            ConfigDocument::Dynamic(_) => Err(RuntimeError::Config(
                "initialize needs a static configuration".into(),
            )),
        }
    }

    fn enable_async(&mut self, events: mpsc::UnboundedSender<NodeEvent>) -> Result<()> {
        let state = self.session.state();
        let (total_slots, error_index) = match self.session.buffer_map() {
            Some(map) => (map.total_slots(), map.error_index()),
            None => {
                return Err(RuntimeError::BadState {
                    op: "enable async",
                    state,
                });
            }
        };
        let tracker = Arc::new(Mutex::new(FrameTicketTracker::new(
            self.session.notify_capacity(),
            total_slots,
        )));
        let handler = Arc::new(NodeCompletion {
            node_id: self.id,
            error_index,
            tracker: Arc::clone(&tracker),
            events,
            state: self.session.state_watch(),
        });
        self.session.set_completion_handler(Some(handler))?;
        self.tracker = Some(tracker);
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.session.start()
    }

    pub fn stop(&mut self) -> Result<()> {
        self.session.stop()
    }

    /// Release the session; frames still in flight are abandoned.
    pub fn deinitialize(&mut self) -> Result<()> {
        let state = self.session.state();
        if state != SessionState::Ready {
            return Err(RuntimeError::BadState {
                op: "deinitialize",
                state,
            });
        }
        let result = self.session.deinitialize();
        if let Some(tracker) = self.tracker.take() {
            let abandoned = lock(&tracker).in_flight();
            if abandoned > 0 {
                warn!(node = self.id, abandoned, "deinitialized with frames in flight");
            }
        }
        result
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    // ─── Frames ────────────────────────────────────────────────────────────

    /// Run the model over the tensors `frame` carries at the mapped indices.
    pub fn process_frame_descriptor(&mut self, frame: &FrameDescriptor) -> Result<()> {
        let state = self.session.state();
        if state != SessionState::Running {
            return Err(RuntimeError::BadState {
                op: "process frame",
                state,
            });
        }
        let (inputs, outputs) = self.select_tensors(frame)?;

        let Some(tracker) = self.tracker.as_ref().map(Arc::clone) else {
            return self.session.execute_sync(&inputs, &outputs);
        };
        let ticket = lock(&tracker).issue(frame)?;
        if let Err(err) = self.session.execute_async(&inputs, &outputs, ticket) {
            lock(&tracker).cancel(ticket);
            return Err(err);
        }
        debug!(node = self.id, ticket, "frame dispatched");
        Ok(())
    }

    fn select_tensors(
        &self,
        frame: &FrameDescriptor,
    ) -> Result<(Vec<TensorDescriptor>, Vec<TensorDescriptor>)> {
        let state = self.session.state();
        let map = self.session.buffer_map().ok_or(RuntimeError::BadState {
            op: "process frame",
            state,
        })?;
        // Async copies must have room for the error slot.
        if self.tracker.is_some() && frame.len() < map.total_slots() {
            return Err(RuntimeError::IndexOutOfRange {
                what: "frame buffer",
                index: map.total_slots() - 1,
                len: frame.len(),
            });
        }
        let pick = |entries: &[GlobalBufferIndexEntry]| -> Result<Vec<TensorDescriptor>> {
            entries
                .iter()
                .map(|entry| frame.tensor(entry.index as usize).cloned())
                .collect()
        };
        Ok((pick(map.inputs())?, pick(map.outputs())?))
    }

    // ─── Configuration and options ─────────────────────────────────────────

    /// Apply dynamic knobs to a live node.
    pub fn apply_dynamic(&mut self, config: &DynamicConfig) -> Result<()> {
        match config.enable_perf {
            Some(true) => self.session.enable_perf(),
            Some(false) => self.session.disable_perf(),
            None => Ok(()),
        }
    }

    /// Parse a JSON document whose `dynamic` section adjusts the node.
    pub fn configure_from_json(&mut self, raw: &str) -> Result<()> {
        match ConfigDocument::from_json_str(raw)? {
            ConfigDocument::Dynamic(config) => self.apply_dynamic(&config),
            ConfigDocument::Static(_) => Err(RuntimeError::Config(
                "static configuration is only accepted by initialize".into(),
            )),
        }
    }

    /// Model signature as JSON; `{}` before initialize.
    pub fn options(&self) -> Value {
        match self.session.graph() {
            Some(graph) => json!({
                "model": {
                    "inputs": graph.inputs.iter().map(tensor_options).collect::<Vec<_>>(),
                    "outputs": graph.outputs.iter().map(tensor_options).collect::<Vec<_>>(),
                }
            }),
            None => json!({}),
        }
    }

    // ─── Introspection ─────────────────────────────────────────────────────

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        self.session.name()
    }

    pub fn is_async(&self) -> bool {
        self.tracker.is_some()
    }

    /// Async frames dispatched but not yet reported.
    pub fn in_flight_frames(&self) -> usize {
        self.tracker.as_ref().map_or(0, |t| lock(t).in_flight())
    }

    pub fn metrics(&self) -> DispatchMetricsSnapshot {
        self.session.metrics()
    }

    pub fn session(&self) -> &AcceleratorSession {
        &self.session
    }

    pub fn perf(&self) -> Result<PerfSample> {
        self.session.get_perf()
    }
}

impl Monitor for ModelNode {
    fn maximal_size(&self) -> usize {
        PerfSample::SIZE
    }

    fn current_size(&self) -> usize {
        PerfSample::SIZE
    }

    fn place(&self, out: &mut [u8]) -> Result<()> {
        check_record_len(out)?;
        let sample = self.session.get_perf()?;
        place_sample(&sample, out)
    }
}

fn tensor_options(slot: &TensorSlot) -> Value {
    let (quant_type, scale, offset) = match slot.quantization {
        Some(q) => ("scale_offset", q.scale, q.offset),
        None => ("none", 1.0, 0),
    };
    json!({
        "name": slot.name,
        "type": slot.element_type,
        "dims": slot.dims,
        "quantType": quant_type,
        "quantScale": scale,
        "quantOffset": offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use qrun_core::types::{ElementType, Quantization};

    #[test]
    fn tensor_options_report_quantization() {
        let slot = TensorSlot {
            name: "logits".into(),
            element_type: ElementType::UfixedPoint8,
            dims: vec![1, 1000],
            quantization: Some(Quantization {
                scale: 0.25,
                offset: -128,
            }),
        };
        let value = tensor_options(&slot);
        assert_eq!(value["type"], "ufixed_point8");
        assert_eq!(value["quantType"], "scale_offset");
        assert_eq!(value["quantOffset"], -128);
        assert_eq!(value["dims"], json!([1, 1000]));
    }

    #[test]
    fn unquantized_tensor_reports_identity_encoding() {
        let slot = TensorSlot {
            name: "in".into(),
            element_type: ElementType::Float32,
            dims: vec![1, 3],
            quantization: None,
        };
        let value = tensor_options(&slot);
        assert_eq!(value["quantType"], "none");
        assert_eq!(value["quantScale"], 1.0);
        assert_eq!(value["quantOffset"], 0);
    }
}
