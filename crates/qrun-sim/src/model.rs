//! JSON model description loaded by the simulated backend.
//!
//! ```json
//! {"graphs":[{"name":"det","inputs":[{"name":"image","element_type":"uint8","dims":[1,4,4,3]}],
//!             "outputs":[{"name":"boxes","element_type":"float32","dims":[1,10,4]}]}]}
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use qrun_core::backend::GraphInfo;
use qrun_core::error::{Result, RuntimeError};
use qrun_core::types::TensorSlot;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimGraph {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<TensorSlot>,
    #[serde(default)]
    pub outputs: Vec<TensorSlot>,
}

impl From<SimGraph> for GraphInfo {
    fn from(graph: SimGraph) -> Self {
        GraphInfo {
            name: graph.name,
            inputs: graph.inputs,
            outputs: graph.outputs,
        }
    }
}

/// Every graph of one simulated context binary.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SimModel {
    pub graphs: Vec<SimGraph>,
}

impl SimModel {
    /// One-graph model.
    pub fn single(
        name: impl Into<String>,
        inputs: Vec<TensorSlot>,
        outputs: Vec<TensorSlot>,
    ) -> Self {
        Self {
            graphs: vec![SimGraph {
                name: name.into(),
                inputs,
                outputs,
            }],
        }
    }

    pub fn from_json_slice(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw)
            .map_err(|e| RuntimeError::backend("load model", format!("bad model description: {e}")))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path).map_err(|e| {
            RuntimeError::backend("load model", format!("{}: {e}", path.display()))
        })?;
        Self::from_json_slice(&raw)
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_description_parses_tensor_slots() {
        let raw = br#"{"graphs":[{"name":"det",
            "inputs":[{"name":"image","element_type":"uint8","dims":[1,4,4,3]}],
            "outputs":[{"name":"boxes","element_type":"float32","dims":[1,10,4],
                        "quantization":{"scale":0.5,"offset":-3}}]}]}"#;
        let model = SimModel::from_json_slice(raw).expect("valid description");
        let graph = &model.graphs[0];
        assert_eq!(graph.inputs[0].dims, vec![1, 4, 4, 3]);
        let quant = graph.outputs[0].quantization.expect("quantized output");
        assert_eq!(quant.offset, -3);
    }

    #[test]
    fn malformed_description_is_backend_failure() {
        let err = SimModel::from_json_slice(b"not json").expect_err("garbage");
        assert!(matches!(err, RuntimeError::Backend { step: "load model", .. }));
    }
}
