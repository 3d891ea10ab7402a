//! Node configuration: JSON envelope parsing and static validation.
//!
//! A document carries exactly one meaningful section:
//!
//! ```json
//! { "static":  { "name": "qnn0", "id": 0, "modelPath": "model.bin" } }
//! { "dynamic": { "enablePerf": true } }
//! ```
//!
//! Static validation reports every problem it finds in one diagnostic
//! rather than stopping at the first.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};
use crate::types::ProcessorType;

// ─── Enumerated options ─────────────────────────────────────────────────────

/// Scheduling priority of the model context.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    NormalHigh,
    High,
}

impl Priority {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "normal_high" => Some(Self::NormalHigh),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Processor performance vote.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerfProfile {
    LowBalanced,
    Balanced,
    #[default]
    Default,
    HighPerformance,
    SustainedHighPerformance,
    Burst,
    LowPowerSaver,
    PowerSaver,
    HighPowerSaver,
    ExtremePowerSaver,
}

impl PerfProfile {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "low_balanced" => Some(Self::LowBalanced),
            "balanced" => Some(Self::Balanced),
            "default" => Some(Self::Default),
            "high_performance" => Some(Self::HighPerformance),
            "sustained_high_performance" => Some(Self::SustainedHighPerformance),
            "burst" => Some(Self::Burst),
            "low_power_saver" => Some(Self::LowPowerSaver),
            "power_saver" => Some(Self::PowerSaver),
            "high_power_saver" => Some(Self::HighPowerSaver),
            "extreme_power_saver" => Some(Self::ExtremePowerSaver),
            _ => None,
        }
    }
}

/// Where the model comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelLoad {
    /// Serialized context binary on disk.
    Binary(PathBuf),
    /// Model shared library on disk.
    Library(PathBuf),
    /// Serialized context binary carried in a caller buffer.
    Buffer { buffer_id: u32 },
}

/// Auxiliary operator package.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpPackage {
    pub lib_path: String,
    pub interface_provider: String,
}

/// Caller-declared binding of a model tensor name to a frame buffer index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferMapEntry {
    pub name: String,
    pub id: u32,
}

impl BufferMapEntry {
    pub fn new(name: impl Into<String>, id: u32) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

// ─── Validated config ───────────────────────────────────────────────────────

/// Validated static configuration of one model node.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeConfig {
    pub name: String,
    pub id: u32,
    pub processor: ProcessorType,
    pub core_ids: Vec<u32>,
    pub model: ModelLoad,
    pub priority: Priority,
    pub perf_profile: PerfProfile,
    pub op_packages: Vec<OpPackage>,
    /// Frame buffer indices registered eagerly at initialize.
    pub buffer_ids: Vec<u32>,
    /// Explicit global buffer index map; empty selects the default ordering.
    pub buffer_map: Vec<BufferMapEntry>,
    pub deregister_on_stop: bool,
}

impl NodeConfig {
    /// Defaults for everything but identity and model source.
    pub fn new(name: impl Into<String>, id: u32, model: ModelLoad) -> Self {
        Self {
            name: name.into(),
            id,
            processor: ProcessorType::default(),
            core_ids: vec![0],
            model,
            priority: Priority::default(),
            perf_profile: PerfProfile::default(),
            op_packages: Vec::new(),
            buffer_ids: Vec::new(),
            buffer_map: Vec::new(),
            deregister_on_stop: false,
        }
    }

    pub fn with_processor(mut self, processor: ProcessorType) -> Self {
        self.processor = processor;
        self
    }
}

/// Dynamic knobs applied to a live node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicConfig {
    #[serde(default)]
    pub enable_perf: Option<bool>,
}

/// Parsed configuration document.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigDocument {
    Static(NodeConfig),
    Dynamic(DynamicConfig),
}

impl ConfigDocument {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(raw)?;
        match (envelope.static_section, envelope.dynamic) {
            (Some(section), _) => section.validate().map(Self::Static),
            (None, Some(dynamic)) => Ok(Self::Dynamic(dynamic)),
            (None, None) => Err(RuntimeError::Config(
                "document has neither a static nor a dynamic section".into(),
            )),
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}

// ─── Raw JSON shape ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "static", default)]
    static_section: Option<RawStaticConfig>,
    #[serde(default)]
    dynamic: Option<DynamicConfig>,
}

fn default_processor() -> String {
    "htp0".into()
}

fn default_core_ids() -> Vec<u32> {
    vec![0]
}

fn default_load_type() -> String {
    "binary".into()
}

fn default_priority() -> String {
    "normal".into()
}

fn default_perf_profile() -> String {
    "default".into()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStaticConfig {
    #[serde(default)]
    name: String,
    #[serde(default)]
    id: Option<u32>,
    #[serde(default = "default_processor")]
    processor_type: String,
    #[serde(default = "default_core_ids")]
    core_ids: Vec<u32>,
    #[serde(default = "default_load_type")]
    load_type: String,
    #[serde(default)]
    model_path: String,
    #[serde(default)]
    context_buffer_id: Option<u32>,
    #[serde(default = "default_priority")]
    priority: String,
    #[serde(default = "default_perf_profile")]
    perf_profile: String,
    #[serde(default)]
    udo_packages: Vec<RawOpPackage>,
    #[serde(default)]
    buffer_ids: Option<Vec<u32>>,
    #[serde(default)]
    global_buffer_id_map: Vec<RawMapEntry>,
    #[serde(rename = "deRegisterAllBuffersWhenStop", default)]
    deregister_on_stop: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOpPackage {
    #[serde(default)]
    udo_lib_path: String,
    #[serde(default)]
    interface_provider: String,
}

#[derive(Deserialize)]
struct RawMapEntry {
    #[serde(default)]
    name: String,
    #[serde(default)]
    id: Option<u32>,
}

impl RawStaticConfig {
    fn validate(self) -> Result<NodeConfig> {
        let mut errors: Vec<String> = Vec::new();

        if self.name.is_empty() {
            errors.push("the name is empty".into());
        }
        if self.id.is_none() {
            errors.push("the id is empty".into());
        }

        let processor = ProcessorType::parse(&self.processor_type);
        if processor.is_none() {
            errors.push(format!("the processorType {} is invalid", self.processor_type));
        }

        let model = match self.load_type.as_str() {
            "binary" | "library" => {
                if self.model_path.is_empty() {
                    errors.push("the modelPath is empty".into());
                    None
                } else if !Path::new(&self.model_path).exists() {
                    errors.push(format!("the modelPath <{}> is invalid", self.model_path));
                    None
                } else if self.load_type == "binary" {
                    Some(ModelLoad::Binary(PathBuf::from(&self.model_path)))
                } else {
                    Some(ModelLoad::Library(PathBuf::from(&self.model_path)))
                }
            }
            "buffer" => match self.context_buffer_id {
                Some(buffer_id) => Some(ModelLoad::Buffer { buffer_id }),
                None => {
                    errors.push("the contextBufferId is empty".into());
                    None
                }
            },
            other => {
                errors.push(format!("the loadType <{other}> is invalid"));
                None
            }
        };

        if matches!(&self.buffer_ids, Some(ids) if ids.is_empty()) {
            errors.push("the bufferIds is invalid".into());
        }

        let priority = Priority::parse(&self.priority);
        if priority.is_none() {
            errors.push("the priority is invalid".into());
        }

        let perf_profile = PerfProfile::parse(&self.perf_profile);
        if perf_profile.is_none() {
            errors.push(format!("the perfProfile {} is invalid", self.perf_profile));
        }

        for (idx, udo) in self.udo_packages.iter().enumerate() {
            if udo.udo_lib_path.is_empty() {
                errors.push(format!("the udo {idx} library path is empty"));
            }
            if udo.interface_provider.is_empty() {
                errors.push(format!("the udo {idx} interface is empty"));
            }
        }

        for (idx, entry) in self.global_buffer_id_map.iter().enumerate() {
            if entry.name.is_empty() {
                errors.push(format!("the globalIdMap {idx} name is empty"));
            }
            if entry.id.is_none() {
                errors.push(format!("the globalIdMap {idx} id is empty"));
            }
        }

        let (Some(id), Some(processor), Some(model), Some(priority), Some(perf_profile), true) = (
            self.id,
            processor,
            model,
            priority,
            perf_profile,
            errors.is_empty(),
        ) else {
            return Err(RuntimeError::Config(errors.join(", ")));
        };

        Ok(NodeConfig {
            name: self.name,
            id,
            processor,
            core_ids: self.core_ids,
            model,
            priority,
            perf_profile,
            op_packages: self
                .udo_packages
                .into_iter()
                .map(|udo| OpPackage {
                    lib_path: udo.udo_lib_path,
                    interface_provider: udo.interface_provider,
                })
                .collect(),
            buffer_ids: self.buffer_ids.unwrap_or_default(),
            buffer_map: self
                .global_buffer_id_map
                .into_iter()
                .filter_map(|e| e.id.map(|id| BufferMapEntry { name: e.name, id }))
                .collect(),
            deregister_on_stop: self.deregister_on_stop,
        })
    }
}
