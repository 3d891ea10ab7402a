#![doc = include_str!("../README.md")]

pub mod buffer_map;
pub mod dispatch;
pub mod notify;
pub mod registry;
pub mod session;

pub use buffer_map::{ERROR_SLOT_NAME, GlobalBufferIndexEntry, GlobalBufferMap};
pub use dispatch::{ChannelHandler, Completion, CompletionHandler, ExecutionDispatcher};
pub use notify::{DEFAULT_NOTIFY_SLOTS, NotificationRingBuffer};
pub use registry::{BufferRegistry, RegistrationLedger, RegistryDirectory};
pub use session::{AcceleratorSession, StateWatch};
