//! Shared Heap Allocator
//!
//! Carves variable-sized buffers out of the heap area of the shared region.
//! Every allocation is preceded by a 16-byte header the host reads to route
//! the buffer:
//!
//! ```text
//! +0  u32  payload size
//! +4  u8   flags (reserved)
//! +5  u8   channel
//! +6  u16  kind (channel-specific command code)
//! +8  u64  reserved
//! ```
//!
//! The free list is kept sorted by offset and coalesced on free, so the cost
//! of an allocation is linear in the number of free spans.

use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use spin::Mutex;

use crate::error::{Error, Result};
use crate::shm::SharedRegion;

/// Size of the header preceding every heap buffer
pub const HEAP_HEADER_SIZE: u32 = 16;

/// Allocation granularity
pub const HEAP_ALIGN: u32 = 16;

/// Round up to a power-of-two alignment; `None` on overflow
const fn align_up(value: u32, align: u32) -> Option<u32> {
    match value.checked_add(align - 1) {
        Some(value) => Some(value & !(align - 1)),
        None => None,
    }
}

/// A live heap allocation
///
/// Plain value handle; ownership and release are tracked by whoever holds
/// it (see [`crate::submit::CommandBuffer`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeapBlock {
    offset: u32,
    size: u32,
}

impl HeapBlock {
    /// Region offset of the buffer header; this is what the host is given
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Region offset of the first payload byte
    pub fn data_offset(&self) -> u32 {
        self.offset + HEAP_HEADER_SIZE
    }

    /// Requested payload size
    pub fn size(&self) -> u32 {
        self.size
    }
}

/// Decoded buffer header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferHeader {
    /// Payload size
    pub size: u32,
    /// Channel tag
    pub channel: u8,
    /// Channel-specific kind
    pub kind: u16,
}

impl BufferHeader {
    /// Read the header of the buffer at `offset`
    pub fn read(region: &SharedRegion, offset: u32) -> Result<Self> {
        let mut raw = [0u8; HEAP_HEADER_SIZE as usize];
        region.read(offset, &mut raw)?;
        Ok(Self {
            size: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            channel: raw[5],
            kind: u16::from_le_bytes([raw[6], raw[7]]),
        })
    }

    fn write(&self, region: &SharedRegion, offset: u32) -> Result<()> {
        let mut raw = [0u8; HEAP_HEADER_SIZE as usize];
        raw[0..4].copy_from_slice(&self.size.to_le_bytes());
        raw[5] = self.channel;
        raw[6..8].copy_from_slice(&self.kind.to_le_bytes());
        region.write(offset, &raw)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Span {
    offset: u32,
    len: u32,
}

struct HeapState {
    /// Free spans sorted by offset, never adjacent
    free: Vec<Span>,
    /// Live allocations: header offset -> span length
    live: HashMap<u32, u32>,
}

/// Allocator over the heap area of a shared region
pub struct SharedHeap {
    region: Arc<SharedRegion>,
    base: u32,
    size: u32,
    state: Mutex<HeapState>,
}

impl SharedHeap {
    /// Manage `size` bytes of `region` starting at `base`
    pub fn new(region: Arc<SharedRegion>, base: u32, size: u32) -> Result<Self> {
        if base % HEAP_ALIGN != 0 {
            return Err(Error::InvalidConfig("heap base must be 16-byte aligned"));
        }
        let size = size & !(HEAP_ALIGN - 1);
        if size < HEAP_ALIGN * 2 {
            return Err(Error::InvalidConfig("heap too small"));
        }
        if base as u64 + size as u64 > region.len() as u64 {
            return Err(Error::InvalidConfig("heap exceeds shared region"));
        }

        log::debug!("Shared heap at {:#x}: {} bytes", base, size);

        Ok(Self {
            region,
            base,
            size,
            state: Mutex::new(HeapState {
                free: alloc::vec![Span { offset: base, len: size }],
                live: HashMap::new(),
            }),
        })
    }

    /// Region this heap lives in
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    /// Allocate a buffer with `size` payload bytes, tagged for `channel`/`kind`
    pub fn allocate(&self, size: u32, channel: u8, kind: u16) -> Result<HeapBlock> {
        let needed = size
            .checked_add(HEAP_HEADER_SIZE)
            .and_then(|len| align_up(len, HEAP_ALIGN))
            .ok_or(Error::ResourceExhausted)?;

        let offset = {
            let mut state = self.state.lock();
            let index = state
                .free
                .iter()
                .position(|span| span.len >= needed)
                .ok_or(Error::ResourceExhausted)?;

            let span = state.free[index];
            if span.len == needed {
                state.free.remove(index);
            } else {
                state.free[index] = Span {
                    offset: span.offset + needed,
                    len: span.len - needed,
                };
            }
            state.live.insert(span.offset, needed);
            span.offset
        };

        BufferHeader { size, channel, kind }.write(&self.region, offset)?;

        log::trace!(
            "heap alloc {:#x}: {} bytes (ch={}, kind={})",
            offset,
            size,
            channel,
            kind
        );

        Ok(HeapBlock { offset, size })
    }

    /// Return a buffer to the heap
    pub fn free(&self, block: HeapBlock) -> Result<()> {
        let mut state = self.state.lock();
        let len = match state.live.remove(&block.offset) {
            Some(len) => len,
            None => {
                log::warn!("heap free of unknown block {:#x}", block.offset);
                return Err(Error::InvalidHandle);
            }
        };

        let index = state
            .free
            .iter()
            .position(|span| span.offset > block.offset)
            .unwrap_or(state.free.len());
        state.free.insert(index, Span { offset: block.offset, len });

        // Merge with the following span, then with the preceding one
        if index + 1 < state.free.len() {
            let next = state.free[index + 1];
            if block.offset + len == next.offset {
                state.free[index].len += next.len;
                state.free.remove(index + 1);
            }
        }
        if index > 0 {
            let prev = state.free[index - 1];
            if prev.offset + prev.len == block.offset {
                let merged = state.free.remove(index);
                state.free[index - 1].len += merged.len;
            }
        }

        log::trace!("heap free {:#x}", block.offset);
        Ok(())
    }

    /// Total free bytes including headers
    pub fn free_bytes(&self) -> u32 {
        self.state.lock().free.iter().map(|span| span.len).sum()
    }

    /// Largest single free span
    pub fn largest_free(&self) -> u32 {
        self.state
            .lock()
            .free
            .iter()
            .map(|span| span.len)
            .max()
            .unwrap_or(0)
    }

    /// Number of live allocations
    pub fn outstanding(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Number of free spans
    pub fn fragments(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Heap capacity in bytes
    pub fn capacity(&self) -> u32 {
        self.size
    }

    /// Base offset within the region
    pub fn base(&self) -> u32 {
        self.base
    }
}
