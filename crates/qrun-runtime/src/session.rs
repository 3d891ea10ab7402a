//! Accelerator session lifecycle.
//!
//! ```text
//! Initial ─initialize─▶ Initializing ─▶ Ready ─start─▶ Running
//!    ▲                       │            │ ▲            │
//!    └──────(failure)────────┘            │ └───stop─────┤
//!    ▲                                    │              ▼
//!    └────────────deinitialize────────────┘    Error ─stop─▶ Ready
//! ```
//!
//! A backend failure during execution moves a running session to `Error`;
//! `stop` returns it to `Ready`.  The committed state is readable at any time
//! without locking, including through a [`StateWatch`].

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tracing::{debug, error, info, warn};

use qrun_core::backend::{AcceleratorBackend, GraphInfo, MemHandle, ModelSource};
use qrun_core::config::{ModelLoad, NodeConfig, PerfProfile};
use qrun_core::error::{Result, RuntimeError, StatusKind, TeardownErrors};
use qrun_core::frame::BufferDescriptor;
use qrun_core::perf::{DispatchMetricsSnapshot, PerfSample};
use qrun_core::types::{ProcessorType, SessionState, TensorDescriptor, TensorSlot};

use crate::buffer_map::GlobalBufferMap;
use crate::dispatch::{CompletionHandler, CompletionRouter, ExecutionDispatcher};
use crate::notify::DEFAULT_NOTIFY_SLOTS;
use crate::registry::{BufferRegistry, RegistrationLedger, RegistryDirectory};

/// Read-only view of a session's committed state.
#[derive(Clone, Debug)]
pub struct StateWatch(Arc<AtomicU8>);

impl StateWatch {
    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }
}

/// What a successful initialize owns until deinitialize.
struct ActiveModel {
    processor: ProcessorType,
    device_created: bool,
    performance_applied: bool,
    deregister_on_stop: bool,
    perf_enabled: bool,
    buffer_map: GlobalBufferMap,
    dispatcher: ExecutionDispatcher,
}

/// Resources taken so far by an initialize in progress.
#[derive(Default)]
struct Acquired {
    opened: bool,
    device: bool,
    performance: bool,
    model: bool,
    ledger: Option<RegistrationLedger>,
}

/// One model loaded on one processor.
///
/// Not reentrant: the `&mut self` methods are meant to be driven from a
/// single thread.  Async completions arrive on backend threads and only
/// touch the shared [`CompletionRouter`].
pub struct AcceleratorSession {
    name: String,
    backend: Arc<dyn AcceleratorBackend>,
    directory: Arc<RegistryDirectory>,
    state: Arc<AtomicU8>,
    router: Arc<CompletionRouter>,
    active: Option<ActiveModel>,
}

impl AcceleratorSession {
    pub fn new(
        backend: Arc<dyn AcceleratorBackend>,
        directory: Arc<RegistryDirectory>,
    ) -> Result<Self> {
        Self::with_notify_slots(backend, directory, DEFAULT_NOTIFY_SLOTS)
    }

    /// Session allowing `notify_slots` concurrent async jobs (a power of two).
    pub fn with_notify_slots(
        backend: Arc<dyn AcceleratorBackend>,
        directory: Arc<RegistryDirectory>,
        notify_slots: usize,
    ) -> Result<Self> {
        Ok(Self {
            name: String::new(),
            backend,
            directory,
            state: Arc::new(AtomicU8::new(SessionState::Initial.as_u8())),
            router: Arc::new(CompletionRouter::new(notify_slots)?),
            active: None,
        })
    }

    // ─── State ─────────────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn state_watch(&self) -> StateWatch {
        StateWatch(Arc::clone(&self.state))
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn require(&self, op: &'static str, allowed: &[SessionState]) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(RuntimeError::BadState { op, state })
        }
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────────

    /// Bring up backend, device and model, then resolve the buffer map.
    ///
    /// `buffers` is the caller's buffer collection: it supplies the context
    /// binary for buffer loads and the tensors named by `buffer_ids`.  Any
    /// failure after the backend is opened unwinds everything and leaves the
    /// session in `Initial`.
    pub fn initialize(
        &mut self,
        config: &NodeConfig,
        buffers: &[BufferDescriptor],
        handler: Option<Arc<dyn CompletionHandler>>,
    ) -> Result<()> {
        self.require("initialize", &[SessionState::Initial])?;

        let source = model_source(&config.model, buffers)?;
        let eager = eager_tensors(config, buffers)?;

        self.name.clone_from(&config.name);
        self.set_state(SessionState::Initializing);
        info!(
            session = %self.name,
            id = config.id,
            processor = %config.processor,
            "initializing session"
        );

        let mut acquired = Acquired::default();
        match self.bring_up(config, source, &eager, &mut acquired) {
            Ok(active) => {
                self.router.reset();
                self.router.set_handler(handler);
                info!(
                    session = %self.name,
                    graph = %active.dispatcher.graph().name,
                    inputs = active.buffer_map.input_count(),
                    outputs = active.buffer_map.output_count(),
                    total_slots = active.buffer_map.total_slots(),
                    registered = active.dispatcher.ledger().len(),
                    "session ready"
                );
                self.active = Some(active);
                self.set_state(SessionState::Ready);
                Ok(())
            }
            Err(err) => {
                error!(session = %self.name, error = %err, "initialize failed, unwinding");
                self.unwind(acquired);
                self.set_state(SessionState::Initial);
                Err(err)
            }
        }
    }

    fn bring_up(
        &self,
        config: &NodeConfig,
        source: ModelSource<'_>,
        eager: &[&TensorDescriptor],
        acquired: &mut Acquired,
    ) -> Result<ActiveModel> {
        let processor = config.processor;
        self.backend.open(processor)?;
        acquired.opened = true;

        if processor.needs_device() {
            let cores = self.backend.core_count(processor)?;
            if let Some(&bad) = config.core_ids.iter().find(|&&id| id >= cores) {
                return Err(RuntimeError::Config(format!(
                    "core id {bad} out of range, {processor} has {cores} core(s)"
                )));
            }
            self.backend.create_device(processor, &config.core_ids)?;
            acquired.device = true;
        }

        if processor.is_htp() && config.perf_profile != PerfProfile::Default {
            self.backend.apply_performance(config.perf_profile)?;
            acquired.performance = true;
        }

        for package in &config.op_packages {
            self.backend.load_op_package(package)?;
            debug!(
                lib = %package.lib_path,
                provider = %package.interface_provider,
                "op package loaded"
            );
        }

        if processor.is_htp() {
            self.backend.set_priority(config.priority)?;
        }

        let graphs = self.backend.load_model(source)?;
        acquired.model = true;
        let graph = single_graph(graphs)?;
        let buffer_map =
            GlobalBufferMap::resolve(&config.buffer_map, &graph.inputs, &graph.outputs)?;

        let mut ledger = RegistrationLedger::new(self.directory.registry(processor));
        for tensor in eager {
            if let Err(err) = ledger.acquire(tensor) {
                acquired.ledger = Some(ledger);
                return Err(err);
            }
        }

        Ok(ActiveModel {
            processor,
            device_created: acquired.device,
            performance_applied: acquired.performance,
            deregister_on_stop: config.deregister_on_stop,
            perf_enabled: false,
            buffer_map,
            dispatcher: ExecutionDispatcher::new(
                Arc::clone(&self.backend),
                processor,
                graph,
                ledger,
                Arc::clone(&self.router),
            ),
        })
    }

    fn unwind(&self, acquired: Acquired) {
        let mut errors = TeardownErrors::new();
        if let Some(mut ledger) = acquired.ledger {
            errors.record("release buffers", ledger.release_all());
        }
        if acquired.model {
            errors.record("free model", self.backend.free_model());
        }
        if acquired.performance {
            errors.record("release performance", self.backend.release_performance());
        }
        if acquired.device {
            errors.record("free device", self.backend.free_device());
        }
        if acquired.opened {
            errors.record("close backend", self.backend.close());
        }
        if let Err(err) = errors.finish() {
            warn!(session = %self.name, error = %err, "initialize unwind incomplete");
        }
    }

    pub fn start(&mut self) -> Result<()> {
        self.require("start", &[SessionState::Ready])?;
        self.set_state(SessionState::Running);
        info!(session = %self.name, "session started");
        Ok(())
    }

    /// Back to `Ready`; flush this session's registrations when configured.
    ///
    /// The session reaches `Ready` even when the flush reports a failure.
    pub fn stop(&mut self) -> Result<()> {
        self.require("stop", &[SessionState::Running, SessionState::Error])?;
        let flushed = match self.active.as_mut() {
            Some(active) if active.deregister_on_stop => active.dispatcher.flush(),
            _ => Ok(()),
        };
        self.set_state(SessionState::Ready);
        info!(session = %self.name, "session stopped");
        flushed
    }

    /// Release everything in reverse order of acquisition.
    ///
    /// Every step is attempted; the result reports whether any failed.
    pub fn deinitialize(&mut self) -> Result<()> {
        self.require("deinitialize", &[SessionState::Ready])?;
        let result = match self.active.take() {
            Some(active) => self.teardown(active),
            None => Ok(()),
        };
        self.set_state(SessionState::Initial);
        info!(session = %self.name, ok = result.is_ok(), "session deinitialized");
        result
    }

    fn teardown(&self, active: ActiveModel) -> Result<()> {
        let in_flight = self.router.capacity() - self.router.free_slots();
        if in_flight > 0 {
            warn!(
                session = %self.name,
                in_flight,
                "tearing down with async jobs in flight; their completions will be dropped"
            );
        }
        self.router.set_handler(None);
        self.router.reset();

        let mut errors = TeardownErrors::new();
        if active.perf_enabled {
            errors.record("disable profiling", self.backend.disable_profiling());
        }
        let mut ledger = active.dispatcher.into_ledger();
        errors.record("release buffers", ledger.release_all());
        errors.record("free model", self.backend.free_model());
        if active.performance_applied {
            errors.record("release performance", self.backend.release_performance());
        }
        if active.device_created {
            errors.record("free device", self.backend.free_device());
        }
        errors.record("close backend", self.backend.close());
        errors.finish()
    }

    // ─── Execution ─────────────────────────────────────────────────────────

    /// Run one job and wait for it.
    pub fn execute_sync(
        &mut self,
        inputs: &[TensorDescriptor],
        outputs: &[TensorDescriptor],
    ) -> Result<()> {
        self.require("execute", &[SessionState::Running])?;
        let active = self.active_mut("execute")?;
        let result = active.dispatcher.execute_sync(inputs, outputs);
        self.fault_on_backend_error(&result);
        result
    }

    /// Dispatch one job; its outcome reaches the completion handler under
    /// `token`.
    pub fn execute_async(
        &mut self,
        inputs: &[TensorDescriptor],
        outputs: &[TensorDescriptor],
        token: u64,
    ) -> Result<()> {
        self.require("execute", &[SessionState::Running])?;
        let active = self.active_mut("execute")?;
        let result = active.dispatcher.execute_async(inputs, outputs, token);
        self.fault_on_backend_error(&result);
        result
    }

    fn fault_on_backend_error(&self, result: &Result<()>) {
        if let Err(err) = result {
            if err.kind() == StatusKind::Fail {
                self.set_state(SessionState::Error);
                warn!(session = %self.name, error = %err, "session entered error state");
            }
        }
    }

    /// Replace the completion handler of a live session.
    pub fn set_completion_handler(&self, handler: Option<Arc<dyn CompletionHandler>>) -> Result<()> {
        self.require(
            "set completion handler",
            &[SessionState::Ready, SessionState::Running],
        )?;
        self.router.set_handler(handler);
        Ok(())
    }

    // ─── Explicit registration ─────────────────────────────────────────────

    /// Register `tensors` for zero-copy access ahead of the first job.
    pub fn register_buffers(&mut self, tensors: &[TensorDescriptor]) -> Result<Vec<MemHandle>> {
        self.require(
            "register buffers",
            &[SessionState::Ready, SessionState::Running],
        )?;
        if tensors.is_empty() {
            return Err(RuntimeError::Config("no buffers to register".into()));
        }
        let active = self.active_mut("register buffers")?;
        if !active.processor.is_htp() {
            return Err(RuntimeError::Unsupported(format!(
                "buffer registration on processor {}",
                active.processor
            )));
        }
        tensors
            .iter()
            .map(|tensor| active.dispatcher.register(tensor))
            .collect()
    }

    /// Give back this session's references to `tensors`.
    pub fn deregister_buffers(&mut self, tensors: &[TensorDescriptor]) -> Result<()> {
        self.require(
            "deregister buffers",
            &[SessionState::Ready, SessionState::Running],
        )?;
        if tensors.is_empty() {
            return Err(RuntimeError::Config("no buffers to deregister".into()));
        }
        let active = self.active_mut("deregister buffers")?;
        for tensor in tensors {
            active.dispatcher.deregister(tensor.region.addr)?;
        }
        Ok(())
    }

    // ─── Profiling ─────────────────────────────────────────────────────────

    pub fn enable_perf(&mut self) -> Result<()> {
        self.require("enable perf", &[SessionState::Ready, SessionState::Running])?;
        let backend = Arc::clone(&self.backend);
        let active = self.active_mut("enable perf")?;
        if active.perf_enabled {
            return Err(RuntimeError::AlreadyEnabled("perf"));
        }
        backend.enable_profiling()?;
        active.perf_enabled = true;
        info!(session = %self.name, "profiling enabled");
        Ok(())
    }

    pub fn disable_perf(&mut self) -> Result<()> {
        self.require("disable perf", &[SessionState::Ready, SessionState::Running])?;
        let backend = Arc::clone(&self.backend);
        let state = self.state();
        let active = self.active_mut("disable perf")?;
        if !active.perf_enabled {
            return Err(RuntimeError::BadState {
                op: "disable perf (not enabled)",
                state,
            });
        }
        backend.disable_profiling()?;
        active.perf_enabled = false;
        info!(session = %self.name, "profiling disabled");
        Ok(())
    }

    /// Timing sample of the most recent execution.
    pub fn get_perf(&self) -> Result<PerfSample> {
        self.require("get perf", &[SessionState::Running])?;
        match &self.active {
            Some(active) if active.perf_enabled => {}
            _ => return Err(RuntimeError::PerfUnavailable("profiling not enabled")),
        }
        let events = self.backend.profile_events()?;
        PerfSample::from_events(&events).ok_or(RuntimeError::PerfUnavailable(
            "no profiling event recorded",
        ))
    }

    // ─── Introspection ─────────────────────────────────────────────────────

    fn active_mut(&mut self, op: &'static str) -> Result<&mut ActiveModel> {
        let state = self.state();
        self.active
            .as_mut()
            .ok_or(RuntimeError::BadState { op, state })
    }

    /// Name taken from the config at initialize; empty before.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn processor(&self) -> Option<ProcessorType> {
        self.active.as_ref().map(|a| a.processor)
    }

    pub fn graph(&self) -> Option<&GraphInfo> {
        self.active.as_ref().map(|a| a.dispatcher.graph())
    }

    pub fn inputs(&self) -> &[TensorSlot] {
        self.graph().map(|g| g.inputs.as_slice()).unwrap_or_default()
    }

    pub fn outputs(&self) -> &[TensorSlot] {
        self.graph().map(|g| g.outputs.as_slice()).unwrap_or_default()
    }

    pub fn buffer_map(&self) -> Option<&GlobalBufferMap> {
        self.active.as_ref().map(|a| &a.buffer_map)
    }

    /// Shared registry this session registers into.
    pub fn registry(&self) -> Option<&Arc<BufferRegistry>> {
        self.active.as_ref().map(|a| a.dispatcher.ledger().registry())
    }

    /// Distinct buffers this session currently holds a registration for.
    pub fn registered_buffers(&self) -> usize {
        self.active.as_ref().map_or(0, |a| a.dispatcher.ledger().len())
    }

    pub fn perf_enabled(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.perf_enabled)
    }

    pub fn metrics(&self) -> DispatchMetricsSnapshot {
        self.router.metrics()
    }

    pub fn notify_capacity(&self) -> usize {
        self.router.capacity()
    }

    pub fn free_slots(&self) -> usize {
        self.router.free_slots()
    }

    /// Resolve once at least `wanted` notify slots are free.
    pub async fn wait_free_slots(&self, wanted: usize) {
        self.router.wait_free_slots(wanted).await;
    }
}

impl Drop for AcceleratorSession {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            warn!(session = %self.name, state = %self.state(), "session dropped while initialized");
            if let Err(err) = self.teardown(active) {
                warn!(session = %self.name, error = %err, "teardown on drop failed");
            }
            self.set_state(SessionState::Initial);
        }
    }
}

// ─── Initialize helpers ─────────────────────────────────────────────────────

fn model_source<'a>(
    model: &'a ModelLoad,
    buffers: &'a [BufferDescriptor],
) -> Result<ModelSource<'a>> {
    match model {
        ModelLoad::Binary(path) | ModelLoad::Library(path) if !is_existing(path) => Err(
            RuntimeError::Config(format!("the model path <{}> is invalid", path.display())),
        ),
        ModelLoad::Binary(path) => Ok(ModelSource::Binary(path)),
        ModelLoad::Library(path) => Ok(ModelSource::Library(path)),
        ModelLoad::Buffer { buffer_id } => {
            let index = *buffer_id as usize;
            match buffers.get(index) {
                Some(BufferDescriptor::Bytes(bytes)) if !bytes.data.is_empty() => {
                    Ok(ModelSource::Buffer(&bytes.data[..]))
                }
                Some(_) => Err(RuntimeError::Config(format!(
                    "context buffer {index} is empty or not a byte buffer"
                ))),
                None => Err(RuntimeError::IndexOutOfRange {
                    what: "context buffer",
                    index,
                    len: buffers.len(),
                }),
            }
        }
    }
}

fn is_existing(path: &Path) -> bool {
    !path.as_os_str().is_empty() && path.exists()
}

fn eager_tensors<'a>(
    config: &NodeConfig,
    buffers: &'a [BufferDescriptor],
) -> Result<Vec<&'a TensorDescriptor>> {
    if config.buffer_ids.is_empty() {
        return Ok(Vec::new());
    }
    if !config.processor.is_htp() {
        return Err(RuntimeError::Unsupported(format!(
            "buffer registration on processor {}",
            config.processor
        )));
    }
    config
        .buffer_ids
        .iter()
        .map(|&id| {
            let index = id as usize;
            buffers
                .get(index)
                .ok_or(RuntimeError::IndexOutOfRange {
                    what: "buffer id",
                    index,
                    len: buffers.len(),
                })?
                .as_tensor()
                .ok_or_else(|| RuntimeError::InvalidTensor(format!("buffer {index} is not a tensor")))
        })
        .collect()
}

fn single_graph(graphs: Vec<GraphInfo>) -> Result<GraphInfo> {
    let count = graphs.len();
    let mut graphs = graphs.into_iter();
    match (graphs.next(), graphs.next()) {
        (Some(graph), None) => {
            for slot in graph.inputs.iter().chain(&graph.outputs) {
                slot.byte_size()?;
            }
            Ok(graph)
        }
        (None, _) => Err(RuntimeError::Unsupported("model contains no graph".into())),
        _ => Err(RuntimeError::Unsupported(format!(
            "model contains {count} graphs, only one is supported"
        ))),
    }
}
