//! Binding of a frame's ordered buffers to the model's named tensors.
//!
//! The resolved map always has `inputs + outputs + 1` entries: inputs in
//! declaration order, then outputs, then the reserved error slot written
//! only when an async job fails.

use tracing::debug;

use qrun_core::config::BufferMapEntry;
use qrun_core::error::{Result, RuntimeError};
use qrun_core::types::TensorSlot;

/// Name of the synthesized error slot.
pub const ERROR_SLOT_NAME: &str = "ERROR";

/// One resolved binding: tensor name to frame buffer index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalBufferIndexEntry {
    pub name: String,
    pub index: u32,
}

impl GlobalBufferIndexEntry {
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }
}

/// Finalized global buffer index map of one session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalBufferMap {
    entries: Vec<GlobalBufferIndexEntry>,
    input_count: usize,
    output_count: usize,
    total_slots: usize,
}

impl GlobalBufferMap {
    /// Validate `caller` against the model, or synthesize the default order
    /// when `caller` is empty.
    ///
    /// A caller index past `inputs + outputs + 1` widens
    /// [`total_slots`](Self::total_slots) to cover it; the frame may carry
    /// buffers for other consumers in the same pipeline.
    pub fn resolve(
        caller: &[BufferMapEntry],
        inputs: &[TensorSlot],
        outputs: &[TensorSlot],
    ) -> Result<Self> {
        let expected = inputs.len() + outputs.len() + 1;

        if caller.is_empty() {
            let entries = inputs
                .iter()
                .chain(outputs)
                .map(|slot| slot.name.as_str())
                .chain(std::iter::once(ERROR_SLOT_NAME))
                .enumerate()
                .map(|(idx, name)| GlobalBufferIndexEntry::new(name, idx as u32))
                .collect();
            return Ok(Self {
                entries,
                input_count: inputs.len(),
                output_count: outputs.len(),
                total_slots: expected,
            });
        }

        if caller.len() != expected {
            return Err(RuntimeError::BufferMapLength {
                expected,
                found: caller.len(),
            });
        }

        for (index, (entry, slot)) in caller.iter().zip(inputs.iter().chain(outputs)).enumerate() {
            if entry.name != slot.name {
                return Err(RuntimeError::BufferMapMismatch {
                    index,
                    expected: slot.name.clone(),
                    found: entry.name.clone(),
                });
            }
        }

        let total_slots = caller
            .iter()
            .map(|entry| entry.id as usize + 1)
            .fold(expected, usize::max);
        if total_slots > expected {
            debug!(expected, total_slots, "global buffer map widened by caller indices");
        }

        Ok(Self {
            entries: caller
                .iter()
                .map(|e| GlobalBufferIndexEntry::new(e.name.clone(), e.id))
                .collect(),
            input_count: inputs.len(),
            output_count: outputs.len(),
            total_slots,
        })
    }

    pub fn entries(&self) -> &[GlobalBufferIndexEntry] {
        &self.entries
    }

    pub fn input_count(&self) -> usize {
        self.input_count
    }

    pub fn output_count(&self) -> usize {
        self.output_count
    }

    /// Frame buffer count this map addresses.
    pub fn total_slots(&self) -> usize {
        self.total_slots
    }

    pub fn inputs(&self) -> &[GlobalBufferIndexEntry] {
        &self.entries[..self.input_count]
    }

    pub fn outputs(&self) -> &[GlobalBufferIndexEntry] {
        &self.entries[self.input_count..self.input_count + self.output_count]
    }

    pub fn error_entry(&self) -> &GlobalBufferIndexEntry {
        &self.entries[self.input_count + self.output_count]
    }

    /// Frame index of the reserved error slot.
    pub fn error_index(&self) -> usize {
        self.error_entry().index as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qrun_core::types::ElementType;

    fn slot(name: &str) -> TensorSlot {
        TensorSlot {
            name: name.into(),
            element_type: ElementType::Float32,
            dims: vec![1, 8],
            quantization: None,
        }
    }

    fn names(map: &GlobalBufferMap) -> Vec<(String, u32)> {
        map.entries()
            .iter()
            .map(|e| (e.name.clone(), e.index))
            .collect()
    }

    #[test]
    fn default_mapping_one_input_three_outputs() {
        let inputs = [slot("image")];
        let outputs = [slot("boxes"), slot("scores"), slot("labels")];
        let map = GlobalBufferMap::resolve(&[], &inputs, &outputs).expect("default map");
        assert_eq!(
            names(&map),
            vec![
                ("image".to_string(), 0),
                ("boxes".to_string(), 1),
                ("scores".to_string(), 2),
                ("labels".to_string(), 3),
                ("ERROR".to_string(), 4),
            ]
        );
        assert_eq!(map.total_slots(), 5);
        assert_eq!(map.error_index(), 4);
        assert_eq!(map.outputs().len(), 3);
    }

    #[test]
    fn caller_map_in_default_order_round_trips() {
        let inputs = [slot("a"), slot("b")];
        let outputs = [slot("y")];
        let default = GlobalBufferMap::resolve(&[], &inputs, &outputs).expect("default");
        let caller: Vec<BufferMapEntry> = default
            .entries()
            .iter()
            .map(|e| BufferMapEntry::new(e.name.clone(), e.index))
            .collect();
        let resolved = GlobalBufferMap::resolve(&caller, &inputs, &outputs).expect("caller map");
        assert_eq!(resolved, default);
    }

    #[test]
    fn name_mismatch_identifies_index() {
        let inputs = [slot("a")];
        let outputs = [slot("y"), slot("z")];
        let caller = [
            BufferMapEntry::new("a", 0),
            BufferMapEntry::new("y", 1),
            BufferMapEntry::new("w", 2),
            BufferMapEntry::new("ERR", 3),
        ];
        let err = GlobalBufferMap::resolve(&caller, &inputs, &outputs).expect_err("mismatch");
        match err {
            RuntimeError::BufferMapMismatch {
                index,
                expected,
                found,
            } => {
                assert_eq!(index, 2);
                assert_eq!(expected, "z");
                assert_eq!(found, "w");
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn wrong_length_is_rejected() {
        let inputs = [slot("a")];
        let outputs = [slot("y")];
        let caller = [BufferMapEntry::new("a", 0), BufferMapEntry::new("y", 1)];
        let err = GlobalBufferMap::resolve(&caller, &inputs, &outputs).expect_err("short map");
        assert!(matches!(
            err,
            RuntimeError::BufferMapLength {
                expected: 3,
                found: 2
            }
        ));
    }

    #[test]
    fn oversized_caller_index_widens_total_slots() {
        let inputs = [slot("a")];
        let outputs = [slot("y")];
        let caller = [
            BufferMapEntry::new("a", 7),
            BufferMapEntry::new("y", 2),
            BufferMapEntry::new("anything", 11),
        ];
        let map = GlobalBufferMap::resolve(&caller, &inputs, &outputs).expect("widened map");
        assert_eq!(map.total_slots(), 12);
        assert_eq!(map.inputs()[0].index, 7);
        assert_eq!(map.error_index(), 11);
    }

    #[test]
    fn error_slot_name_is_not_validated() {
        let inputs = [slot("a")];
        let caller = [BufferMapEntry::new("a", 0), BufferMapEntry::new("QNN ASYNC ERROR", 1)];
        let map = GlobalBufferMap::resolve(&caller, &inputs, &[]).expect("any error name");
        assert_eq!(map.error_entry().name, "QNN ASYNC ERROR");
    }
}
