//! Transport configuration
//!
//! Describes how the shared region is carved up. Offsets are relative to the
//! start of the region.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::heap::HEAP_ALIGN;
use crate::ring::{DEFAULT_PARTIAL_WRITE_THRESHOLD, RING_HEADER_SIZE};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Heap area
    #[serde(default)]
    pub heap: HeapConfig,

    /// Dirty-rectangle notification ring
    #[serde(default = "default_notify_ring")]
    pub notify_ring: RingConfig,

    /// Command ring, absent on adapters without command submission
    #[serde(default)]
    pub command_ring: Option<RingConfig>,

    /// Synchronous submission settings
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heap: HeapConfig::default(),
            notify_ring: default_notify_ring(),
            command_ring: Some(default_command_ring()),
            sync: SyncConfig::default(),
        }
    }
}

/// Heap area
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HeapConfig {
    /// Offset of the heap area
    #[serde(default)]
    pub offset: u32,

    /// Size of the heap area
    #[serde(default = "default_heap_size")]
    pub size: u32,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            offset: 0,
            size: default_heap_size(),
        }
    }
}

/// Ring placement
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RingConfig {
    /// Offset of the ring header
    pub offset: u32,

    /// Ring size including the header
    pub size: u32,

    /// Minimum tail kept free when a write is split
    #[serde(default = "default_threshold")]
    pub partial_write_threshold: u32,

    /// Screen the ring reports for
    #[serde(default)]
    pub screen: u32,
}

impl RingConfig {
    fn end(&self) -> u64 {
        self.offset as u64 + self.size as u64
    }

    fn validate(&self, region_len: u32) -> Result<()> {
        if self.offset % 8 != 0 {
            return Err(Error::InvalidConfig("ring offset must be 8-byte aligned"));
        }
        if self.size <= RING_HEADER_SIZE + DEFAULT_PARTIAL_WRITE_THRESHOLD {
            return Err(Error::InvalidConfig("ring too small"));
        }
        if self.partial_write_threshold >= self.size - RING_HEADER_SIZE {
            return Err(Error::InvalidConfig("threshold exceeds ring capacity"));
        }
        if self.end() > region_len as u64 {
            return Err(Error::InvalidConfig("ring exceeds shared region"));
        }
        Ok(())
    }
}

/// Synchronous submission settings
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Wait limit for control calls; unset waits forever
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl SyncConfig {
    /// Wait limit as a duration
    pub fn timeout(&self) -> Option<core::time::Duration> {
        self.timeout_ms.map(core::time::Duration::from_millis)
    }
}

fn default_heap_size() -> u32 {
    0x1_0000
}

fn default_threshold() -> u32 {
    DEFAULT_PARTIAL_WRITE_THRESHOLD
}

fn default_notify_ring() -> RingConfig {
    RingConfig {
        offset: 0x1_0000,
        size: 0x8000,
        partial_write_threshold: DEFAULT_PARTIAL_WRITE_THRESHOLD,
        screen: 0,
    }
}

fn default_command_ring() -> RingConfig {
    RingConfig {
        offset: 0x1_8000,
        size: 0x8000,
        partial_write_threshold: DEFAULT_PARTIAL_WRITE_THRESHOLD,
        screen: 0,
    }
}

fn overlaps(a: (u64, u64), b: (u64, u64)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

impl TransportConfig {
    /// Smallest shared region the layout fits in
    pub fn required_len(&self) -> u64 {
        let mut end = self.heap.offset as u64 + self.heap.size as u64;
        end = end.max(self.notify_ring.end());
        if let Some(ring) = &self.command_ring {
            end = end.max(ring.end());
        }
        end
    }

    /// Check the layout against a region of `region_len` bytes
    pub fn validate(&self, region_len: u32) -> Result<()> {
        if self.heap.offset % HEAP_ALIGN != 0 {
            return Err(Error::InvalidConfig("heap offset must be 16-byte aligned"));
        }
        if self.heap.offset as u64 + self.heap.size as u64 > region_len as u64 {
            return Err(Error::InvalidConfig("heap exceeds shared region"));
        }
        self.notify_ring.validate(region_len)?;

        let heap = (
            self.heap.offset as u64,
            self.heap.offset as u64 + self.heap.size as u64,
        );
        let notify = (self.notify_ring.offset as u64, self.notify_ring.end());
        if overlaps(heap, notify) {
            return Err(Error::InvalidConfig("notify ring overlaps heap"));
        }

        if let Some(ring) = &self.command_ring {
            ring.validate(region_len)?;
            let command = (ring.offset as u64, ring.end());
            if overlaps(heap, command) || overlaps(notify, command) {
                return Err(Error::InvalidConfig("command ring overlaps another area"));
            }
        }
        Ok(())
    }
}
