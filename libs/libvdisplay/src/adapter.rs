//! Adapter Context
//!
//! One [`GuestContext`] exists per display adapter. It owns the shared
//! region, the heap carved out of it, the doorbell, the in-flight
//! submission table and the call statistics, and is passed to every
//! transport operation that talks to the host.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::cmdring::CommandRing;
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::heap::SharedHeap;
use crate::host::{channel, EventFactory, FenceNotifier, HostPort};
use crate::shm::SharedRegion;
use crate::submit::{CommandBuffer, Submitter};
use crate::vbva::NotifyRing;

/// Call statistics
#[derive(Debug, Default)]
pub struct AdapterStats {
    host_calls: AtomicU64,
    flushes: AtomicU64,
    doorbells: AtomicU64,
    overflows: AtomicU64,
    preemptions: AtomicU64,
}

/// Point-in-time copy of [`AdapterStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Control calls issued
    pub host_calls: u64,
    /// Ring flush requests
    pub flushes: u64,
    /// Command ring submit doorbells
    pub doorbells: u64,
    /// Hard ring overflows
    pub overflows: u64,
    /// Preemption requests
    pub preemptions: u64,
}

impl AdapterStats {
    pub(crate) fn host_call(&self) {
        self.host_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn doorbell(&self) {
        self.doorbells.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn overflow(&self) {
        self.overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn preemption(&self) {
        self.preemptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            host_calls: self.host_calls.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            doorbells: self.doorbells.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
        }
    }
}

/// Per-adapter transport state
pub struct GuestContext {
    config: TransportConfig,
    region: Arc<SharedRegion>,
    heap: Arc<SharedHeap>,
    port: Arc<dyn HostPort>,
    events: Arc<dyn EventFactory>,
    submitter: Submitter,
    stats: AdapterStats,
}

impl GuestContext {
    /// Build the context for an adapter whose shared memory is `region`
    pub fn new(
        config: TransportConfig,
        region: Arc<SharedRegion>,
        port: Arc<dyn HostPort>,
        events: Arc<dyn EventFactory>,
    ) -> Result<Self> {
        config.validate(region.len())?;
        let heap = Arc::new(SharedHeap::new(
            region.clone(),
            config.heap.offset,
            config.heap.size,
        )?);

        log::debug!(
            "adapter context: region {} bytes, heap {:#x}+{:#x}",
            region.len(),
            config.heap.offset,
            config.heap.size
        );

        Ok(Self {
            config,
            region,
            heap,
            port,
            events,
            submitter: Submitter::new(),
            stats: AdapterStats::default(),
        })
    }

    /// Configuration the context was built from
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Shared region
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    /// Shared heap
    pub fn heap(&self) -> &Arc<SharedHeap> {
        &self.heap
    }

    /// Host doorbell
    pub fn port(&self) -> &dyn HostPort {
        &*self.port
    }

    /// In-flight submissions
    pub fn submitter(&self) -> &Submitter {
        &self.submitter
    }

    /// Call statistics
    pub fn stats(&self) -> &AdapterStats {
        &self.stats
    }

    /// Send a buffer on the video channel and read the host's answer
    ///
    /// The buffer is returned to the heap whether or not `read` succeeds.
    pub fn call_host<T>(
        &self,
        kind: u16,
        payload: &[u8],
        read: impl FnOnce(&SharedRegion, u32) -> Result<T>,
    ) -> Result<T> {
        let block = self
            .heap
            .allocate(payload.len() as u32, channel::VBVA, kind)?;

        let result = self
            .region
            .write(block.data_offset(), payload)
            .and_then(|()| {
                self.stats.host_call();
                self.port.submit(block.offset());
                read(&self.region, block.data_offset())
            });

        self.heap.free(block)?;
        result
    }

    /// Allocate a command buffer on the video channel
    pub fn alloc_command(&self, size: u32, kind: u16) -> Result<CommandBuffer> {
        CommandBuffer::allocate(&self.heap, size, channel::VBVA, kind)
    }

    /// Submit `buffer` and block until the host completes it
    pub fn submit_and_wait(&self, buffer: &CommandBuffer) -> Result<()> {
        self.stats.host_call();
        self.submitter.submit_and_wait(
            &*self.port,
            &*self.events,
            buffer,
            self.config.sync.timeout(),
        )
    }

    /// Host completed the buffer at `offset` (interrupt path)
    pub fn complete(&self, offset: u32) -> Result<()> {
        self.submitter.complete(offset)
    }

    /// Create the notification ring described by the configuration
    pub fn notify_ring(&self) -> Result<NotifyRing> {
        NotifyRing::new(self.region.clone(), &self.config.notify_ring)
    }

    /// Create the command ring described by the configuration
    pub fn command_ring(&self, notifier: Arc<dyn FenceNotifier>) -> Result<CommandRing> {
        let ring = self
            .config
            .command_ring
            .as_ref()
            .ok_or(Error::InvalidConfig("no command ring configured"))?;
        CommandRing::new(self.region.clone(), ring, notifier)
    }
}

impl core::fmt::Debug for GuestContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GuestContext")
            .field("region", &self.region)
            .field("in_flight", &self.submitter.in_flight())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
