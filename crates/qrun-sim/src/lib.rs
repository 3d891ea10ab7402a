#![doc = include_str!("../README.md")]

pub mod backend;
pub mod memory;
pub mod model;

pub use backend::{CompletionMode, SimBackend, SimStep};
pub use memory::SimDeviceMemory;
pub use model::{SimGraph, SimModel};
