#![doc = include_str!("../README.md")]

pub mod backend;
pub mod config;
pub mod error;
pub mod frame;
pub mod perf;
pub mod types;

pub use error::{Result, RuntimeError, StatusKind};
