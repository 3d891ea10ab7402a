//! qrun CLI entrypoint.
//!
//! ```bash
//! qrun validate --config node.json --json
//! qrun options --config node.json --context model.json
//! qrun run --config node.json --frames 64 --async --perf --json
//! ```
//!
//! `options` and `run` drive the simulated backend from `qrun-sim`; the
//! model file (or `--context` for buffer loads) is a simulator model
//! description.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use qrun_core::backend::DeviceMemory;
use qrun_core::config::{ConfigDocument, DynamicConfig, ModelLoad, NodeConfig};
use qrun_core::error::{Result, RuntimeError};
use qrun_core::frame::{BufferDescriptor, ByteBuffer, FrameDescriptor};
use qrun_core::perf::{DispatchMetricsSnapshot, PerfSample};
use qrun_core::types::{MemoryRegion, TensorDescriptor};
use qrun_node::{FrameStatus, ModelNode, NodeEvent};
use qrun_runtime::RegistryDirectory;
use qrun_sim::{CompletionMode, SimBackend, SimDeviceMemory};

#[derive(Parser, Debug)]
#[command(
    name = "qrun",
    version,
    about = "Accelerator model runner",
    arg_required_else_help = true,
    after_help = "Examples:\n  qrun validate --config node.json\n  qrun options --config node.json --context model.json\n  qrun run --config node.json --frames 64 --async --json"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse and statically validate a node configuration.
    Validate(ValidateArgs),
    /// Initialize a node against the simulator and print its model options.
    Options(OptionsArgs),
    /// Run frames through a node on the simulator and report a summary.
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
struct ValidateArgs {
    /// Node configuration document.
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Emit machine-readable JSON.
    #[arg(long = "json")]
    json: bool,
}

#[derive(Args, Debug, Clone)]
struct NodeArgs {
    /// Node configuration document (static section).
    #[arg(short = 'c', long = "config")]
    config: PathBuf,

    /// Context file supplied as the caller buffer for `loadType: buffer`.
    #[arg(long = "context")]
    context: Option<PathBuf>,

    /// Cores reported by the simulated device.
    #[arg(long = "cores", default_value_t = 4)]
    cores: u32,
}

#[derive(Args, Debug, Clone)]
struct OptionsArgs {
    #[command(flatten)]
    node: NodeArgs,
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[command(flatten)]
    node: NodeArgs,

    /// Number of frames to process.
    #[arg(short = 'n', long = "frames", default_value_t = 16)]
    frames: usize,

    /// Dispatch asynchronously and collect completion events.
    #[arg(long = "async")]
    asynchronous: bool,

    /// Simulated completion latency for async jobs, in microseconds.
    #[arg(long = "latency-us", default_value_t = 200)]
    latency_us: u64,

    /// Enable profiling and report the last timing sample.
    #[arg(long = "perf")]
    perf: bool,

    /// Emit machine-readable JSON.
    #[arg(long = "json")]
    json: bool,
}

const JSON_SCHEMA_VERSION: u32 = 1;

fn main() {
    init_tracing();

    let cli = Cli::parse();
    let json_error_command = match &cli.command {
        Commands::Validate(args) if args.json => Some("validate"),
        Commands::Options(_) => Some("options"),
        Commands::Run(args) if args.json => Some("run"),
        _ => None,
    };

    let result = match cli.command {
        Commands::Validate(args) => run_validate(args),
        Commands::Options(args) => run_options(args),
        Commands::Run(args) => {
            let rt = build_runtime();
            rt.block_on(run_frames(args))
        }
    };

    match result {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if let Some(command) = json_error_command {
                println!("{}", command_error_json(command, &err));
            } else {
                tracing::error!(error = %err, code = err.error_code(), "Command failed");
            }
            std::process::exit(err.error_code() as i32);
        }
    }
}

fn init_tracing() {
    let ansi_enabled = std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_ansi(ansi_enabled)
        .init();
}

fn build_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime")
}

// ─── validate ───────────────────────────────────────────────────────────────

fn run_validate(args: ValidateArgs) -> Result<()> {
    let doc = ConfigDocument::from_json_file(&args.config)?;
    let summary = match &doc {
        ConfigDocument::Static(cfg) => json!({
            "section": "static",
            "name": cfg.name,
            "id": cfg.id,
            "processor": cfg.processor.to_string(),
            "load": load_label(&cfg.model),
            "op_packages": cfg.op_packages.len(),
            "buffer_ids": cfg.buffer_ids,
            "buffer_map_entries": cfg.buffer_map.len(),
        }),
        ConfigDocument::Dynamic(cfg) => json!({
            "section": "dynamic",
            "enable_perf": cfg.enable_perf,
        }),
    };

    if args.json {
        let mut out = envelope("validate");
        merge(&mut out, summary);
        println!("{out}");
    } else {
        match &doc {
            ConfigDocument::Static(cfg) => println!(
                "OK: static config '{}' (id {}) on {} via {} load",
                cfg.name,
                cfg.id,
                cfg.processor,
                load_label(&cfg.model)
            ),
            ConfigDocument::Dynamic(_) => println!("OK: dynamic config"),
        }
    }
    Ok(())
}

fn load_label(model: &ModelLoad) -> &'static str {
    match model {
        ModelLoad::Binary(_) => "binary",
        ModelLoad::Library(_) => "library",
        ModelLoad::Buffer { .. } => "buffer",
    }
}

// ─── options ────────────────────────────────────────────────────────────────

fn run_options(args: OptionsArgs) -> Result<()> {
    let (config, buffers) = load_node_inputs(&args.node)?;
    let mut node = sim_node(&args.node, None)?;
    node.initialize(&config, &buffers, None)?;
    let mut out = envelope("options");
    merge(&mut out, json!({ "options": node.options() }));
    println!("{out}");
    node.deinitialize()
}

// ─── run ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Tally {
    dispatched: usize,
    completed: usize,
    failed: usize,
}

impl Tally {
    fn record(&mut self, event: &NodeEvent) {
        match event.status {
            FrameStatus::Done => self.completed += 1,
            FrameStatus::Failed(status) => {
                tracing::warn!(code = status.code, "frame failed");
                self.failed += 1;
            }
        }
    }

    fn reported(&self) -> usize {
        self.completed + self.failed
    }
}

async fn run_frames(args: RunArgs) -> Result<()> {
    if args.frames == 0 {
        return Err(RuntimeError::Config("--frames must be at least 1".into()));
    }
    let (config, buffers) = load_node_inputs(&args.node)?;
    let completion = args.asynchronous.then(|| CompletionMode::Worker {
        latency: Duration::from_micros(args.latency_us),
    });
    let mut node = sim_node(&args.node, completion)?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let events = args.asynchronous.then_some(tx);
    node.initialize(&config, &buffers, events)?;
    if args.perf {
        node.apply_dynamic(&DynamicConfig {
            enable_perf: Some(true),
        })?;
    }
    node.start()?;

    let sets = node.session().notify_capacity();
    let (_storage, frames) = host_frames(&node, sets)?;

    let started = Instant::now();
    let mut tally = Tally::default();
    let driven = if args.asynchronous {
        drive_async(&mut node, &frames, args.frames, &mut rx, &mut tally).await
    } else {
        drive_sync(&mut node, &frames, args.frames, &mut tally)
    };
    let elapsed = started.elapsed();

    let perf = if args.perf { node.perf().ok() } else { None };
    let metrics = node.metrics();
    let stopped = node.stop();
    let deinit = node.deinitialize();
    driven?;
    stopped?;
    deinit?;

    if args.json {
        let mut out = envelope("run");
        merge(
            &mut out,
            json!({
                "node": config.name,
                "id": config.id,
                "processor": config.processor.to_string(),
                "mode": if args.asynchronous { "async" } else { "sync" },
                "frames": args.frames,
                "completed": tally.completed,
                "failed": tally.failed,
                "elapsed_ms": elapsed.as_secs_f64() * 1_000.0,
                "metrics": metrics_json(&metrics),
                "perf": perf.as_ref().map(perf_json),
            }),
        );
        println!("{out}");
    } else {
        println!(
            "Ran {} frame(s) on '{}' ({}, {}): {} completed, {} failed in {:.2} ms",
            args.frames,
            config.name,
            config.processor,
            if args.asynchronous { "async" } else { "sync" },
            tally.completed,
            tally.failed,
            elapsed.as_secs_f64() * 1_000.0
        );
        if let Some(sample) = perf {
            println!(
                "Last execution: {} us total, {} us accelerator",
                sample.entire_exec_time, sample.rpc_exec_time_acc
            );
        }
    }
    Ok(())
}

fn drive_sync(
    node: &mut ModelNode,
    frames: &[FrameDescriptor],
    count: usize,
    tally: &mut Tally,
) -> Result<()> {
    for frame in frames.iter().cycle().take(count) {
        node.process_frame_descriptor(frame)?;
        tally.dispatched += 1;
        tally.completed += 1;
    }
    Ok(())
}

/// Dispatch `count` frames, waiting for completions whenever the node
/// reports its notify slots or frame pool as full.
///
/// A frame event arrives before its notify slot is retired, so after
/// consuming events the driver waits on the session's slot signal.
async fn drive_async(
    node: &mut ModelNode,
    frames: &[FrameDescriptor],
    count: usize,
    rx: &mut mpsc::UnboundedReceiver<NodeEvent>,
    tally: &mut Tally,
) -> Result<()> {
    for frame in frames.iter().cycle().take(count) {
        loop {
            match node.process_frame_descriptor(frame) {
                Ok(()) => {
                    tally.dispatched += 1;
                    break;
                }
                Err(RuntimeError::SlotsExhausted { .. } | RuntimeError::PoolExhausted { .. }) => {
                    if tally.reported() < tally.dispatched {
                        let event = next_event(rx).await?;
                        tally.record(&event);
                    }
                    settle(node.session().wait_free_slots(1)).await?;
                }
                Err(err) => return Err(err),
            }
        }
        while let Ok(event) = rx.try_recv() {
            tally.record(&event);
        }
    }
    while tally.reported() < tally.dispatched {
        let event = next_event(rx).await?;
        tally.record(&event);
    }
    let session = node.session();
    settle(session.wait_free_slots(session.notify_capacity())).await
}

async fn settle(retired: impl Future<Output = ()>) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(10), retired)
        .await
        .map_err(|_| RuntimeError::backend("completion", "notify slots never retired"))
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<NodeEvent>) -> Result<NodeEvent> {
    match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
        Ok(Some(event)) => Ok(event),
        Ok(None) => Err(RuntimeError::backend("completion", "event channel closed")),
        Err(_) => Err(RuntimeError::backend("completion", "timed out waiting for a frame")),
    }
}

// ─── Setup helpers ──────────────────────────────────────────────────────────

fn load_node_inputs(args: &NodeArgs) -> Result<(NodeConfig, Vec<BufferDescriptor>)> {
    let config = match ConfigDocument::from_json_file(&args.config)? {
        ConfigDocument::Static(cfg) => cfg,
        ConfigDocument::Dynamic(_) => {
            return Err(RuntimeError::Config(format!(
                "{} has no static section",
                args.config.display()
            )));
        }
    };

    let mut buffers = Vec::new();
    if let ModelLoad::Buffer { buffer_id } = config.model {
        let path = args.context.as_deref().ok_or_else(|| {
            RuntimeError::Config("loadType buffer needs --context <file>".into())
        })?;
        buffers.resize(buffer_id as usize + 1, BufferDescriptor::Empty);
        buffers[buffer_id as usize] = BufferDescriptor::Bytes(read_context(path)?);
    }
    Ok((config, buffers))
}

fn read_context(path: &Path) -> Result<ByteBuffer> {
    let bytes = std::fs::read(path)?;
    Ok(ByteBuffer::new(path.display().to_string(), bytes))
}

fn sim_node(args: &NodeArgs, completion: Option<CompletionMode>) -> Result<ModelNode> {
    let memory = Arc::new(SimDeviceMemory::new());
    let mut backend = SimBackend::new()
        .with_cores(args.cores)
        .with_memory(memory.clone());
    if let Some(mode) = completion {
        backend = backend.with_completion(mode);
    }
    let shared: Arc<dyn DeviceMemory> = memory;
    let directory = Arc::new(RegistryDirectory::new(move |_| Arc::clone(&shared)));
    ModelNode::new(Arc::new(backend), directory)
}

/// `sets` frames over freshly allocated host memory, laid out by the node's
/// buffer map.  The returned storage backs every tensor address.
fn host_frames(node: &ModelNode, sets: usize) -> Result<(Vec<Vec<u8>>, Vec<FrameDescriptor>)> {
    let session = node.session();
    let (Some(graph), Some(map)) = (session.graph(), session.buffer_map()) else {
        return Err(RuntimeError::BadState {
            op: "allocate frames",
            state: session.state(),
        });
    };

    let mut storage = Vec::new();
    let mut frames = Vec::with_capacity(sets);
    for _ in 0..sets {
        let mut frame = FrameDescriptor::with_len(map.total_slots());
        let bindings = map
            .inputs()
            .iter()
            .zip(&graph.inputs)
            .chain(map.outputs().iter().zip(&graph.outputs));
        for (entry, slot) in bindings {
            let host = vec![0u8; slot.byte_size()?.max(1)];
            let region = MemoryRegion::new(host.as_ptr() as u64, host.len());
            frame.set(entry.index as usize, TensorDescriptor::for_slot(slot, region).into())?;
            storage.push(host);
        }
        frames.push(frame);
    }
    Ok((storage, frames))
}

// ─── JSON output ────────────────────────────────────────────────────────────

fn envelope(command: &str) -> Value {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": true,
    })
}

fn merge(out: &mut Value, extra: Value) {
    if let (Value::Object(out), Value::Object(extra)) = (out, extra) {
        out.extend(extra);
    }
}

fn command_error_json(command: &str, err: &RuntimeError) -> Value {
    json!({
        "schema_version": JSON_SCHEMA_VERSION,
        "command": command,
        "ok": false,
        "error": err.to_string(),
        "code": err.error_code(),
        "kind": err.kind().to_string(),
    })
}

fn metrics_json(metrics: &DispatchMetricsSnapshot) -> Value {
    json!({
        "sync_executed": metrics.sync_executed,
        "async_dispatched": metrics.async_dispatched,
        "async_succeeded": metrics.async_succeeded,
        "async_failed": metrics.async_failed,
        "rejected": metrics.rejected,
    })
}

fn perf_json(sample: &PerfSample) -> Value {
    json!({
        "entire_exec_time_us": sample.entire_exec_time,
        "rpc_exec_time_cpu_us": sample.rpc_exec_time_cpu,
        "rpc_exec_time_htp_us": sample.rpc_exec_time_htp,
        "rpc_exec_time_acc_us": sample.rpc_exec_time_acc,
    })
}
