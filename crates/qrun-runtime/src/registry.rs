//! Reference-counted registration of caller memory, one registry per
//! physical processor.
//!
//! # Sharing model
//!
//! A [`RegistryDirectory`] hands out one [`BufferRegistry`] per processor;
//! every session bound to that processor holds the same `Arc`.  The first
//! registration of an address attaches its transport and maps it; later
//! registrations only bump the reference count.  The map is undone when the
//! count returns to zero.
//!
//! Sessions do not talk to the registry directly.  Each owns a
//! [`RegistrationLedger`] that takes one reference per distinct address it
//! touches and gives all of them back on flush or drop.
//!
//! A registry-wide [`BufferRegistry::flush_all`] advances the registry
//! epoch.  A ledger holding handles from an older epoch forgets them and
//! registers again on next use, so it never binds an unmapped handle or gives
//! back references the flush already released.
//!
//! # Locking
//!
//! One mutex per registry guards the entry table.  The map and unmap steps
//! run under it so an address is mapped at most once at any time; a slow
//! backend map therefore stalls every session bound to the same processor.
//! Logging happens after the guard is released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use qrun_core::backend::{DeviceMemory, MemHandle, TransportHandle};
use qrun_core::error::{Result, RuntimeError, TeardownErrors};
use qrun_core::types::{MemoryRegion, ProcessorType, TensorDescriptor};

/// Bookkeeping for one registered address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisteredBuffer {
    pub handle: MemHandle,
    pub transport: TransportHandle,
    pub region: MemoryRegion,
    pub ref_count: usize,
}

// ─── Registry stats ─────────────────────────────────────────────────────────

/// Atomic counters for registry activity.
#[derive(Debug, Default)]
pub struct RegistryStats {
    /// Backend map steps performed.
    pub maps: AtomicU64,
    /// Backend unmap steps performed.
    pub unmaps: AtomicU64,
    /// Registrations satisfied by an existing entry.
    pub shared_hits: AtomicU64,
    /// Map attempts that failed and were rolled back.
    pub map_failures: AtomicU64,
}

impl RegistryStats {
    pub fn snapshot(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            maps: self.maps.load(Ordering::Relaxed),
            unmaps: self.unmaps.load(Ordering::Relaxed),
            shared_hits: self.shared_hits.load(Ordering::Relaxed),
            map_failures: self.map_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryStatsSnapshot {
    pub maps: u64,
    pub unmaps: u64,
    pub shared_hits: u64,
    pub map_failures: u64,
}

// ─── Buffer registry ────────────────────────────────────────────────────────

/// Registrations of caller memory with one processor.
pub struct BufferRegistry {
    processor: ProcessorType,
    memory: Arc<dyn DeviceMemory>,
    entries: Mutex<HashMap<u64, RegisteredBuffer>>,
    /// Advanced under the entry lock by every flush.
    epoch: AtomicU64,
    pub stats: RegistryStats,
}

impl BufferRegistry {
    pub fn new(processor: ProcessorType, memory: Arc<dyn DeviceMemory>) -> Self {
        Self {
            processor,
            memory,
            entries: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            stats: RegistryStats::default(),
        }
    }

    pub fn processor(&self) -> ProcessorType {
        self.processor
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, RegisteredBuffer>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the memory behind `tensor`, returning its device handle.
    ///
    /// Idempotent per address: repeat calls return the existing handle and
    /// take another reference.
    pub fn register(&self, tensor: &TensorDescriptor) -> Result<MemHandle> {
        self.register_in_epoch(tensor).map(|(handle, _)| handle)
    }

    /// Flushes performed so far.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Register and report the epoch the reference belongs to.
    fn register_in_epoch(&self, tensor: &TensorDescriptor) -> Result<(MemHandle, u64)> {
        let region = tensor.region;
        if region.is_null() || region.size == 0 {
            return Err(RuntimeError::InvalidTensor(format!(
                "tensor {}: cannot register null or empty memory",
                tensor.name
            )));
        }

        let mut entries = self.lock();
        let epoch = self.epoch.load(Ordering::Acquire);
        if let Some(entry) = entries.get_mut(&region.addr) {
            entry.ref_count += 1;
            let (handle, refs) = (entry.handle, entry.ref_count);
            drop(entries);
            self.stats.shared_hits.fetch_add(1, Ordering::Relaxed);
            debug!(
                processor = %self.processor,
                addr = format_args!("{:#x}", region.addr),
                refs,
                "buffer already registered"
            );
            return Ok((handle, epoch));
        }

        let transport = self.memory.attach(&region)?;
        let handle = match self.memory.map(tensor, transport) {
            Ok(handle) => handle,
            Err(err) => {
                let detached = self.memory.detach(&region, transport);
                drop(entries);
                self.stats.map_failures.fetch_add(1, Ordering::Relaxed);
                if let Err(detach_err) = detached {
                    warn!(
                        addr = format_args!("{:#x}", region.addr),
                        error = %detach_err,
                        "transport release after failed map also failed"
                    );
                }
                return Err(err);
            }
        };
        entries.insert(
            region.addr,
            RegisteredBuffer {
                handle,
                transport,
                region,
                ref_count: 1,
            },
        );
        drop(entries);

        self.stats.maps.fetch_add(1, Ordering::Relaxed);
        info!(
            processor = %self.processor,
            addr = format_args!("{:#x}", region.addr),
            size = region.size,
            transport = transport.0,
            handle = handle.0,
            "registered buffer"
        );
        Ok((handle, epoch))
    }

    /// Drop one reference to `addr`; the last one unmaps it.
    pub fn deregister(&self, addr: u64) -> Result<()> {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(&addr) else {
            return Err(RuntimeError::UnknownBuffer { addr });
        };
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            let refs = entry.ref_count;
            drop(entries);
            debug!(addr = format_args!("{addr:#x}"), refs, "buffer reference dropped");
            return Ok(());
        }

        let Some(entry) = entries.remove(&addr) else {
            return Err(RuntimeError::UnknownBuffer { addr });
        };
        let released = self.release(&entry);
        drop(entries);
        self.log_release(&entry, &released);
        released
    }

    /// Unmap every entry regardless of reference count.
    ///
    /// Every entry is attempted; the first failure is reported.  Ledgers
    /// still caching handles drop them lazily on their next call.
    pub fn flush_all(&self) -> Result<()> {
        let mut entries = self.lock();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let drained: Vec<RegisteredBuffer> = entries.drain().map(|(_, e)| e).collect();
        let results: Vec<Result<()>> = drained.iter().map(|e| self.release(e)).collect();
        drop(entries);

        let mut errors = TeardownErrors::new();
        for (entry, result) in drained.iter().zip(results) {
            self.log_release(entry, &result);
            errors.record("flush buffer", result);
        }
        errors.finish()
    }

    fn release(&self, entry: &RegisteredBuffer) -> Result<()> {
        let unmapped = self.memory.unmap(entry.handle);
        let detached = self.memory.detach(&entry.region, entry.transport);
        self.stats.unmaps.fetch_add(1, Ordering::Relaxed);
        unmapped.and(detached)
    }

    fn log_release(&self, entry: &RegisteredBuffer, result: &Result<()>) {
        match result {
            Ok(()) => info!(
                processor = %self.processor,
                addr = format_args!("{:#x}", entry.region.addr),
                handle = entry.handle.0,
                "deregistered buffer"
            ),
            Err(err) => warn!(
                processor = %self.processor,
                addr = format_args!("{:#x}", entry.region.addr),
                error = %err,
                "failed to deregister buffer"
            ),
        }
    }

    pub fn ref_count(&self, addr: u64) -> Option<usize> {
        self.lock().get(&addr).map(|e| e.ref_count)
    }

    pub fn handle_of(&self, addr: u64) -> Option<MemHandle> {
        self.lock().get(&addr).map(|e| e.handle)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

// ─── Directory ──────────────────────────────────────────────────────────────

type MemoryFactory = dyn Fn(ProcessorType) -> Arc<dyn DeviceMemory> + Send + Sync;

/// Hands out the single registry of each physical processor.
pub struct RegistryDirectory {
    factory: Box<MemoryFactory>,
    registries: Mutex<HashMap<ProcessorType, Arc<BufferRegistry>>>,
}

impl RegistryDirectory {
    pub fn new(
        factory: impl Fn(ProcessorType) -> Arc<dyn DeviceMemory> + Send + Sync + 'static,
    ) -> Self {
        Self {
            factory: Box::new(factory),
            registries: Mutex::new(HashMap::new()),
        }
    }

    /// The registry for `processor`, created on first use.
    pub fn registry(&self, processor: ProcessorType) -> Arc<BufferRegistry> {
        let mut registries = self
            .registries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(registries.entry(processor).or_insert_with(|| {
            debug!(%processor, "creating buffer registry");
            Arc::new(BufferRegistry::new(processor, (self.factory)(processor)))
        }))
    }

    /// Flush every registry; used when the whole device set shuts down.
    pub fn flush_all(&self) -> Result<()> {
        let registries: Vec<Arc<BufferRegistry>> = self
            .registries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut errors = TeardownErrors::new();
        for registry in registries {
            errors.record("flush registry", registry.flush_all());
        }
        errors.finish()
    }
}

// ─── Session ledger ─────────────────────────────────────────────────────────

/// The references one session holds in a shared registry.
///
/// Each distinct address costs one registry reference no matter how many
/// frames reuse it.  Whatever is still held when the ledger drops is given
/// back.
pub struct RegistrationLedger {
    registry: Arc<BufferRegistry>,
    held: HashMap<u64, MemHandle>,
    epoch: u64,
}

impl RegistrationLedger {
    pub fn new(registry: Arc<BufferRegistry>) -> Self {
        let epoch = registry.epoch();
        Self {
            registry,
            held: HashMap::new(),
            epoch,
        }
    }

    /// Forget handles a registry flush has already released.
    fn sync_epoch(&mut self, current: u64) {
        if current == self.epoch {
            return;
        }
        if !self.held.is_empty() {
            warn!(
                processor = %self.registry.processor(),
                dropped = self.held.len(),
                "registry flushed under this session; cached handles dropped"
            );
            self.held.clear();
        }
        self.epoch = current;
    }

    pub fn registry(&self) -> &Arc<BufferRegistry> {
        &self.registry
    }

    /// Handle for `tensor`'s memory, registering it on first use.
    pub fn acquire(&mut self, tensor: &TensorDescriptor) -> Result<MemHandle> {
        self.sync_epoch(self.registry.epoch());
        if let Some(handle) = self.held.get(&tensor.region.addr) {
            return Ok(*handle);
        }
        let (handle, epoch) = self.registry.register_in_epoch(tensor)?;
        self.sync_epoch(epoch);
        self.held.insert(tensor.region.addr, handle);
        Ok(handle)
    }

    /// Give back this session's reference to `addr`.
    pub fn release(&mut self, addr: u64) -> Result<()> {
        self.sync_epoch(self.registry.epoch());
        if self.held.remove(&addr).is_none() {
            return Err(RuntimeError::UnknownBuffer { addr });
        }
        self.registry.deregister(addr)
    }

    /// Give back every held reference, attempting all of them.
    pub fn release_all(&mut self) -> Result<()> {
        self.sync_epoch(self.registry.epoch());
        let mut errors = TeardownErrors::new();
        for (addr, _) in self.held.drain() {
            errors.record("release buffer", self.registry.deregister(addr));
        }
        errors.finish()
    }

    pub fn holds(&self, addr: u64) -> bool {
        self.held.contains_key(&addr)
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl Drop for RegistrationLedger {
    fn drop(&mut self) {
        self.sync_epoch(self.registry.epoch());
        if self.held.is_empty() {
            return;
        }
        warn!(
            held = self.held.len(),
            "registration ledger dropped while holding buffers; releasing"
        );
        if let Err(err) = self.release_all() {
            warn!(error = %err, "release on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qrun_core::types::ElementType;
    use qrun_sim::SimDeviceMemory;

    fn tensor(addr: u64) -> TensorDescriptor {
        TensorDescriptor::new(
            "t",
            ElementType::Uint8,
            vec![1, 16],
            MemoryRegion::new(addr, 16).with_dma_handle(addr as i64),
        )
    }

    fn registry() -> (Arc<SimDeviceMemory>, BufferRegistry) {
        let memory = Arc::new(SimDeviceMemory::new());
        let registry = BufferRegistry::new(ProcessorType::Htp0, memory.clone());
        (memory, registry)
    }

    #[test]
    fn ref_count_round_trip_leaves_no_entry() {
        let (memory, registry) = registry();
        let t = tensor(0x1000);
        let first = registry.register(&t).expect("first register");
        for _ in 0..4 {
            assert_eq!(registry.register(&t).expect("repeat register"), first);
        }
        assert_eq!(registry.ref_count(0x1000), Some(5));
        assert_eq!(memory.map_calls(), 1);

        for _ in 0..5 {
            registry.deregister(0x1000).expect("deregister");
        }
        assert!(registry.is_empty());
        assert_eq!(memory.live_mappings(), 0);
        assert_eq!(memory.live_transports(), 0);
    }

    #[test]
    fn deregister_unknown_is_out_of_bound() {
        let (_memory, registry) = registry();
        let err = registry.deregister(0xdead).expect_err("never registered");
        assert!(matches!(err, RuntimeError::UnknownBuffer { addr: 0xdead }));
        assert_eq!(err.kind(), qrun_core::StatusKind::OutOfBound);
    }

    #[test]
    fn failed_map_releases_transport_and_leaves_no_entry() {
        let (memory, registry) = registry();
        memory.inject_map_failure(0x2000);
        registry
            .register(&tensor(0x2000))
            .expect_err("map is rigged to fail");
        assert!(registry.is_empty());
        assert_eq!(memory.live_transports(), 0);
        assert_eq!(registry.stats.snapshot().map_failures, 1);
    }

    #[test]
    fn null_memory_is_rejected_before_backend() {
        let (memory, registry) = registry();
        registry
            .register(&tensor(0))
            .expect_err("null address must be rejected");
        assert_eq!(memory.map_calls(), 0);
    }

    #[test]
    fn flush_all_attempts_every_entry_and_reports_failure() {
        let (memory, registry) = registry();
        for addr in [0x1000, 0x2000, 0x3000] {
            registry.register(&tensor(addr)).expect("register");
        }
        registry.register(&tensor(0x2000)).expect("second ref");
        memory.inject_unmap_failure(0x2000);

        let err = registry.flush_all().expect_err("one unmap fails");
        assert!(matches!(err, RuntimeError::Teardown { failures: 1, .. }));
        assert!(registry.is_empty());
        assert_eq!(memory.unmap_calls(), 3);
        assert_eq!(memory.live_transports(), 0);
    }

    #[test]
    fn ledger_reregisters_after_registry_flush() {
        let (memory, registry) = registry();
        let registry = Arc::new(registry);
        let mut ledger = RegistrationLedger::new(registry.clone());
        let t = tensor(0x7000);
        let before = ledger.acquire(&t).expect("acquire");
        registry.flush_all().expect("flush");
        assert!(!memory.is_mapped(before));

        let after = ledger.acquire(&t).expect("acquire after flush");
        assert!(memory.is_mapped(after));
        assert_eq!(registry.ref_count(0x7000), Some(1));
        assert_eq!(ledger.len(), 1);

        ledger.release_all().expect("exact release");
        assert!(registry.is_empty());
        assert_eq!(memory.live_mappings(), 0);
    }

    #[test]
    fn ledger_release_after_flush_gives_back_nothing() {
        let (memory, registry) = registry();
        let registry = Arc::new(registry);
        let mut a = RegistrationLedger::new(registry.clone());
        let mut b = RegistrationLedger::new(registry.clone());
        a.acquire(&tensor(0x8000)).expect("a");
        b.acquire(&tensor(0x8000)).expect("b");
        registry.flush_all().expect("flush");

        a.release_all().expect("nothing left to release");
        assert!(a.is_empty());
        let err = b.release(0x8000).expect_err("reference went with the flush");
        assert!(matches!(err, RuntimeError::UnknownBuffer { addr: 0x8000 }));
        drop(b);
        assert_eq!(memory.unmap_calls(), 1);
    }

    #[test]
    fn directory_flush_covers_every_processor() {
        let memory = Arc::new(SimDeviceMemory::new());
        let shared: Arc<dyn DeviceMemory> = memory.clone();
        let directory = RegistryDirectory::new(move |_| Arc::clone(&shared));
        let htp0 = directory.registry(ProcessorType::Htp0);
        let htp1 = directory.registry(ProcessorType::Htp1);
        htp0.register(&tensor(0x1000)).expect("htp0");
        htp1.register(&tensor(0x2000)).expect("htp1");

        directory.flush_all().expect("flush");
        assert!(htp0.is_empty());
        assert!(htp1.is_empty());
        assert_eq!(htp0.epoch(), 1);
        assert_eq!(htp1.epoch(), 1);
        assert_eq!(memory.live_mappings(), 0);
    }

    #[test]
    fn directory_shares_registry_per_processor() {
        let shared: Arc<dyn DeviceMemory> = Arc::new(SimDeviceMemory::new());
        let directory = RegistryDirectory::new(move |_| Arc::clone(&shared));
        let a = directory.registry(ProcessorType::Htp1);
        let b = directory.registry(ProcessorType::Htp1);
        let c = directory.registry(ProcessorType::Htp0);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn ledger_takes_one_reference_per_address() {
        let (_memory, registry) = registry();
        let registry = Arc::new(registry);
        let mut ledger = RegistrationLedger::new(registry.clone());
        let t = tensor(0x4000);
        ledger.acquire(&t).expect("acquire");
        ledger.acquire(&t).expect("cached acquire");
        assert_eq!(registry.ref_count(0x4000), Some(1));
        ledger.release_all().expect("release");
        assert!(registry.is_empty());
    }

    #[test]
    fn ledger_drop_returns_references() {
        let (memory, registry) = registry();
        let registry = Arc::new(registry);
        {
            let mut ledger = RegistrationLedger::new(registry.clone());
            ledger.acquire(&tensor(0x5000)).expect("acquire");
        }
        assert!(registry.is_empty());
        assert_eq!(memory.live_mappings(), 0);
    }

    #[test]
    fn ledgers_of_two_sessions_share_one_handle() {
        let (memory, registry) = registry();
        let registry = Arc::new(registry);
        let mut a = RegistrationLedger::new(registry.clone());
        let mut b = RegistrationLedger::new(registry.clone());
        let t = tensor(0x6000);
        let ha = a.acquire(&t).expect("a");
        let hb = b.acquire(&t).expect("b");
        assert_eq!(ha, hb);
        assert_eq!(registry.ref_count(0x6000), Some(2));
        a.release_all().expect("a releases");
        assert_eq!(registry.ref_count(0x6000), Some(1));
        assert_eq!(registry.handle_of(0x6000), Some(hb));
        assert_eq!(memory.live_mappings(), 1);
    }
}
