//! Simulated per-processor memory sharing.
//!
//! Tracks attached transports and live mappings so tests can assert that
//! nothing leaks, and can be rigged to fail a map or unmap for an address.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::trace;

use qrun_core::backend::{DeviceMemory, MemHandle, TransportHandle};
use qrun_core::error::{Result, RuntimeError};
use qrun_core::types::{MemoryRegion, TensorDescriptor};

#[derive(Default)]
struct MemoryState {
    next_handle: u64,
    next_transport: i64,
    transports: HashMap<u64, TransportHandle>,
    mappings: HashMap<MemHandle, u64>,
    fail_map: HashSet<u64>,
    fail_unmap: HashSet<u64>,
}

#[derive(Default)]
pub struct SimDeviceMemory {
    state: Mutex<MemoryState>,
    map_calls: AtomicU64,
    unmap_calls: AtomicU64,
}

impl SimDeviceMemory {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next map of `addr`.
    pub fn inject_map_failure(&self, addr: u64) {
        self.state().fail_map.insert(addr);
    }

    /// Fail the next unmap of the handle mapped for `addr`.
    pub fn inject_unmap_failure(&self, addr: u64) {
        self.state().fail_unmap.insert(addr);
    }

    pub fn map_calls(&self) -> u64 {
        self.map_calls.load(Ordering::Relaxed)
    }

    pub fn unmap_calls(&self) -> u64 {
        self.unmap_calls.load(Ordering::Relaxed)
    }

    pub fn live_mappings(&self) -> usize {
        self.state().mappings.len()
    }

    pub fn live_transports(&self) -> usize {
        self.state().transports.len()
    }

    pub fn is_mapped(&self, handle: MemHandle) -> bool {
        self.state().mappings.contains_key(&handle)
    }
}

impl DeviceMemory for SimDeviceMemory {
    fn attach(&self, region: &MemoryRegion) -> Result<TransportHandle> {
        let mut state = self.state();
        if state.transports.contains_key(&region.addr) {
            return Err(RuntimeError::backend(
                "attach",
                format!("{:#x} already attached", region.addr),
            ));
        }
        state.next_transport += 1;
        let transport = TransportHandle(state.next_transport);
        state.transports.insert(region.addr, transport);
        trace!(addr = format_args!("{:#x}", region.addr), fd = transport.0, "sim attach");
        Ok(transport)
    }

    fn detach(&self, region: &MemoryRegion, transport: TransportHandle) -> Result<()> {
        let mut state = self.state();
        match state.transports.get(&region.addr) {
            Some(held) if *held == transport => {
                state.transports.remove(&region.addr);
                Ok(())
            }
            _ => Err(RuntimeError::backend(
                "detach",
                format!("{:#x} has no transport {}", region.addr, transport.0),
            )),
        }
    }

    fn map(&self, tensor: &TensorDescriptor, transport: TransportHandle) -> Result<MemHandle> {
        self.map_calls.fetch_add(1, Ordering::Relaxed);
        let addr = tensor.region.addr;
        let mut state = self.state();
        if state.fail_map.remove(&addr) {
            return Err(RuntimeError::backend("map", format!("injected failure for {addr:#x}")));
        }
        if state.transports.get(&addr) != Some(&transport) {
            return Err(RuntimeError::backend("map", format!("{addr:#x} is not attached")));
        }
        state.next_handle += 1;
        let handle = MemHandle(0x1000_0000 + state.next_handle);
        state.mappings.insert(handle, addr);
        Ok(handle)
    }

    fn unmap(&self, handle: MemHandle) -> Result<()> {
        self.unmap_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state();
        let Some(&addr) = state.mappings.get(&handle) else {
            return Err(RuntimeError::backend("unmap", format!("unknown handle {:#x}", handle.0)));
        };
        if state.fail_unmap.remove(&addr) {
            return Err(RuntimeError::backend("unmap", format!("injected failure for {addr:#x}")));
        }
        state.mappings.remove(&handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qrun_core::types::ElementType;

    fn tensor(addr: u64) -> TensorDescriptor {
        TensorDescriptor::new("t", ElementType::Uint8, vec![4], MemoryRegion::new(addr, 4))
    }

    #[test]
    fn map_requires_attached_transport() {
        let memory = SimDeviceMemory::new();
        let t = tensor(0x10);
        memory
            .map(&t, TransportHandle(1))
            .expect_err("nothing attached");
        let transport = memory.attach(&t.region).expect("attach");
        let handle = memory.map(&t, transport).expect("map");
        assert!(memory.is_mapped(handle));
        memory.unmap(handle).expect("unmap");
        memory.detach(&t.region, transport).expect("detach");
        assert_eq!(memory.live_transports(), 0);
        assert_eq!(memory.map_calls(), 2);
    }

    #[test]
    fn injected_failures_fire_once() {
        let memory = SimDeviceMemory::new();
        let t = tensor(0x20);
        let transport = memory.attach(&t.region).expect("attach");
        memory.inject_map_failure(0x20);
        memory.map(&t, transport).expect_err("rigged");
        let handle = memory.map(&t, transport).expect("second map succeeds");

        memory.inject_unmap_failure(0x20);
        memory.unmap(handle).expect_err("rigged");
        assert_eq!(memory.live_mappings(), 1);
        memory.unmap(handle).expect("second unmap succeeds");
        assert_eq!(memory.live_mappings(), 0);
    }
}
