//! Simulated accelerator backend.
//!
//! Loads [`SimModel`] descriptions, journals every call, can be rigged to
//! fail any step once, and completes async jobs either when the test says
//! so ([`CompletionMode::Manual`]) or on its own worker thread
//! ([`CompletionMode::Worker`]).  Nothing is computed: a "job" only checks
//! that every bound memory handle is still mapped.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, trace, warn};

use qrun_core::backend::{
    AcceleratorBackend, BoundTensor, CompletionNotifier, GraphInfo, ModelSource, TensorMemory,
};
use qrun_core::config::{OpPackage, PerfProfile, Priority};
use qrun_core::error::{Result, RuntimeError};
use qrun_core::frame::NotifyStatus;
use qrun_core::perf::{ProfileEvent, ProfileEventKind};
use qrun_core::types::ProcessorType;

use crate::memory::SimDeviceMemory;
use crate::model::SimModel;

/// Backend call recorded in the journal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimStep {
    Open,
    Close,
    CoreCount,
    CreateDevice,
    FreeDevice,
    ApplyPerformance,
    ReleasePerformance,
    LoadOpPackage,
    SetPriority,
    LoadModel,
    FreeModel,
    Execute,
    ExecuteAsync,
    EnableProfiling,
    DisableProfiling,
    ProfileEvents,
}

impl SimStep {
    fn label(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::CoreCount => "core count",
            Self::CreateDevice => "create device",
            Self::FreeDevice => "free device",
            Self::ApplyPerformance => "apply performance",
            Self::ReleasePerformance => "release performance",
            Self::LoadOpPackage => "load op package",
            Self::SetPriority => "set priority",
            Self::LoadModel => "load model",
            Self::FreeModel => "free model",
            Self::Execute => "execute",
            Self::ExecuteAsync => "execute async",
            Self::EnableProfiling => "enable profiling",
            Self::DisableProfiling => "disable profiling",
            Self::ProfileEvents => "profile events",
        }
    }
}

/// How queued async jobs are completed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompletionMode {
    /// Jobs wait until [`SimBackend::complete_next`] is called.
    #[default]
    Manual,
    /// A backend-owned thread completes jobs after `latency`.
    Worker { latency: Duration },
}

type Job = (CompletionNotifier, NotifyStatus);

#[derive(Default)]
struct SimState {
    open: bool,
    device: bool,
    performance: bool,
    model_loaded: bool,
    profiling: bool,
    journal: Vec<SimStep>,
    failures: HashMap<SimStep, usize>,
    planned: VecDeque<NotifyStatus>,
    pending: VecDeque<Job>,
    last_bound: Option<(Vec<BoundTensor>, Vec<BoundTensor>)>,
    last_profile: Vec<ProfileEvent>,
}

struct Worker {
    tx: mpsc::Sender<Job>,
    thread: JoinHandle<()>,
}

/// In-process stand-in for the vendor runtime of one session.
pub struct SimBackend {
    cores: u32,
    memory: Option<Arc<SimDeviceMemory>>,
    profile: Vec<ProfileEvent>,
    state: Mutex<SimState>,
    worker: Mutex<Option<Worker>>,
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBackend {
    /// Backend with four cores and manual completion.
    pub fn new() -> Self {
        Self {
            cores: 4,
            memory: None,
            profile: vec![
                ProfileEvent {
                    kind: ProfileEventKind::Execute,
                    value: 1_250,
                },
                ProfileEvent {
                    kind: ProfileEventKind::HostRpc,
                    value: 1_100,
                },
                ProfileEvent {
                    kind: ProfileEventKind::HtpRpc,
                    value: 980,
                },
                ProfileEvent {
                    kind: ProfileEventKind::Accelerator,
                    value: 900,
                },
            ],
            state: Mutex::new(SimState::default()),
            worker: Mutex::new(None),
        }
    }

    pub fn with_cores(mut self, cores: u32) -> Self {
        self.cores = cores;
        self
    }

    /// Check handle-bound tensors against `memory` on every execute.
    pub fn with_memory(mut self, memory: Arc<SimDeviceMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Events reported for every execution while profiling is on.
    pub fn with_profile_events(mut self, events: Vec<ProfileEvent>) -> Self {
        self.profile = events;
        self
    }

    pub fn with_completion(self, mode: CompletionMode) -> Self {
        if let CompletionMode::Worker { latency } = mode {
            let (tx, rx) = mpsc::channel::<Job>();
            let thread = std::thread::spawn(move || {
                for (done, status) in rx {
                    if !latency.is_zero() {
                        std::thread::sleep(latency);
                    }
                    trace!(slot = done.key().index, code = status.code, "sim worker completing job");
                    done.notify(status);
                }
            });
            *self.worker.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(Worker { tx, thread });
        }
        self
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Journal `step` and consume a rigged failure if one is queued.
    fn enter(&self, step: SimStep) -> Result<MutexGuard<'_, SimState>> {
        let mut state = self.state();
        state.journal.push(step);
        if let Some(left) = state.failures.get_mut(&step) {
            *left -= 1;
            if *left == 0 {
                state.failures.remove(&step);
            }
            debug!(step = step.label(), "sim backend injected failure");
            return Err(RuntimeError::backend(step.label(), "injected failure"));
        }
        Ok(state)
    }

    // ─── Test controls ─────────────────────────────────────────────────────

    /// Make the next call of `step` fail.
    pub fn fail_step(&self, step: SimStep) {
        *self.state().failures.entry(step).or_insert(0) += 1;
    }

    /// Status reported by the next queued async job (default success).
    pub fn plan_async_status(&self, status: NotifyStatus) {
        self.state().planned.push_back(status);
    }

    /// Complete the oldest pending job; `false` if none is pending.
    pub fn complete_next(&self) -> bool {
        let job = self.state().pending.pop_front();
        match job {
            Some((done, status)) => {
                done.notify(status);
                true
            }
            None => false,
        }
    }

    /// Complete the newest pending job first.
    pub fn complete_latest(&self) -> bool {
        let job = self.state().pending.pop_back();
        match job {
            Some((done, status)) => {
                done.notify(status);
                true
            }
            None => false,
        }
    }

    pub fn complete_all(&self) -> usize {
        let mut completed = 0;
        while self.complete_next() {
            completed += 1;
        }
        completed
    }

    pub fn pending_jobs(&self) -> usize {
        self.state().pending.len()
    }

    pub fn journal(&self) -> Vec<SimStep> {
        self.state().journal.clone()
    }

    pub fn count(&self, step: SimStep) -> usize {
        self.state().journal.iter().filter(|s| **s == step).count()
    }

    pub fn clear_journal(&self) {
        self.state().journal.clear();
    }

    /// Tensors of the most recent execute or async execute.
    pub fn last_bound(&self) -> Option<(Vec<BoundTensor>, Vec<BoundTensor>)> {
        self.state().last_bound.clone()
    }

    /// Nothing acquired is left open.
    pub fn is_released(&self) -> bool {
        let state = self.state();
        !(state.open || state.device || state.performance || state.model_loaded || state.profiling)
    }

    pub fn is_open(&self) -> bool {
        self.state().open
    }

    fn check_handles(&self, tensors: &[BoundTensor]) -> Result<()> {
        let Some(memory) = &self.memory else {
            return Ok(());
        };
        for tensor in tensors {
            if let TensorMemory::Handle(handle) = tensor.memory {
                if !memory.is_mapped(handle) {
                    return Err(RuntimeError::backend(
                        "execute",
                        format!("tensor {} uses unmapped handle {:#x}", tensor.name, handle.0),
                    ));
                }
            }
        }
        Ok(())
    }

    fn run(&self, state: &mut SimState, inputs: &[BoundTensor], outputs: &[BoundTensor]) -> Result<()> {
        if !state.model_loaded {
            return Err(RuntimeError::backend("execute", "no model loaded"));
        }
        self.check_handles(inputs)?;
        self.check_handles(outputs)?;
        state.last_bound = Some((inputs.to_vec(), outputs.to_vec()));
        if state.profiling {
            state.last_profile.clone_from(&self.profile);
        }
        Ok(())
    }
}

impl AcceleratorBackend for SimBackend {
    fn open(&self, processor: ProcessorType) -> Result<()> {
        let mut state = self.enter(SimStep::Open)?;
        if state.open {
            return Err(RuntimeError::backend("open", "backend already open"));
        }
        state.open = true;
        debug!(%processor, "sim backend opened");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.enter(SimStep::Close)?;
        state.open = false;
        Ok(())
    }

    fn core_count(&self, _processor: ProcessorType) -> Result<u32> {
        drop(self.enter(SimStep::CoreCount)?);
        Ok(self.cores)
    }

    fn create_device(&self, processor: ProcessorType, core_ids: &[u32]) -> Result<()> {
        let mut state = self.enter(SimStep::CreateDevice)?;
        state.device = true;
        debug!(%processor, ?core_ids, "sim device created");
        Ok(())
    }

    fn free_device(&self) -> Result<()> {
        let mut state = self.enter(SimStep::FreeDevice)?;
        state.device = false;
        Ok(())
    }

    fn apply_performance(&self, profile: PerfProfile) -> Result<()> {
        let mut state = self.enter(SimStep::ApplyPerformance)?;
        state.performance = true;
        debug!(?profile, "sim performance vote applied");
        Ok(())
    }

    fn release_performance(&self) -> Result<()> {
        let mut state = self.enter(SimStep::ReleasePerformance)?;
        state.performance = false;
        Ok(())
    }

    fn load_op_package(&self, package: &OpPackage) -> Result<()> {
        drop(self.enter(SimStep::LoadOpPackage)?);
        if package.lib_path.is_empty() {
            return Err(RuntimeError::backend("load op package", "empty library path"));
        }
        Ok(())
    }

    fn set_priority(&self, priority: Priority) -> Result<()> {
        drop(self.enter(SimStep::SetPriority)?);
        debug!(?priority, "sim context priority set");
        Ok(())
    }

    fn load_model(&self, source: ModelSource<'_>) -> Result<Vec<GraphInfo>> {
        let mut state = self.enter(SimStep::LoadModel)?;
        let model = match source {
            ModelSource::Binary(path) | ModelSource::Library(path) => SimModel::from_path(path)?,
            ModelSource::Buffer(bytes) => SimModel::from_json_slice(bytes)?,
        };
        state.model_loaded = true;
        Ok(model.graphs.into_iter().map(GraphInfo::from).collect())
    }

    fn free_model(&self) -> Result<()> {
        let mut state = self.enter(SimStep::FreeModel)?;
        state.model_loaded = false;
        state.last_bound = None;
        Ok(())
    }

    fn execute(&self, inputs: &[BoundTensor], outputs: &[BoundTensor]) -> Result<()> {
        let mut state = self.enter(SimStep::Execute)?;
        self.run(&mut state, inputs, outputs)
    }

    fn execute_async(
        &self,
        inputs: &[BoundTensor],
        outputs: &[BoundTensor],
        done: CompletionNotifier,
    ) -> Result<()> {
        let mut state = self.enter(SimStep::ExecuteAsync)?;
        self.run(&mut state, inputs, outputs)?;
        let status = state.planned.pop_front().unwrap_or(NotifyStatus::SUCCESS);

        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        match worker.as_ref() {
            Some(worker) => {
                drop(state);
                if let Err(mpsc::SendError((done, status))) = worker.tx.send((done, status)) {
                    warn!("sim worker stopped; completing inline");
                    done.notify(status);
                }
            }
            None => state.pending.push_back((done, status)),
        }
        Ok(())
    }

    fn enable_profiling(&self) -> Result<()> {
        let mut state = self.enter(SimStep::EnableProfiling)?;
        state.profiling = true;
        Ok(())
    }

    fn disable_profiling(&self) -> Result<()> {
        let mut state = self.enter(SimStep::DisableProfiling)?;
        state.profiling = false;
        state.last_profile.clear();
        Ok(())
    }

    fn profile_events(&self) -> Result<Vec<ProfileEvent>> {
        let state = self.enter(SimStep::ProfileEvents)?;
        Ok(state.last_profile.clone())
    }
}

impl Drop for SimBackend {
    fn drop(&mut self) {
        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(Worker { tx, thread }) = worker {
            drop(tx);
            if thread.join().is_err() {
                warn!("sim worker thread panicked");
            }
        }
    }
}
