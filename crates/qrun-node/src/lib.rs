#![doc = include_str!("../README.md")]

pub mod monitor;
pub mod node;
pub mod ticket;

pub use monitor::{Monitor, place_sample};
pub use node::{FrameStatus, ModelNode, NodeEvent};
pub use ticket::{FramePool, FrameTicketTracker};
