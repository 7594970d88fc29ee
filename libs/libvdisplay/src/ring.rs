//! Byte Ring Channel
//!
//! A circular byte buffer in shared memory with a fixed table of record
//! lengths. The guest appends records (begin / write / end); the host
//! consumes finished records in order and advances its cursors.
//!
//! Header layout (all u32, little endian):
//!
//! ```text
//! +0    host events          +8    data offset (host)     +12  free offset (guest)
//! +4    supported orders     +16   64 record lengths (bit 31 = partial)
//! +272  first record (host)  +276  free record (guest)
//! +280  partial write threshold                          +284 data capacity
//! +288  data
//! ```
//!
//! Space is reclaimed either when the host moves its cursors
//! ([`Reclaim::Host`], notification rings) or when the guest retires
//! records after completion processing ([`Reclaim::Guest`], command rings).

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

use crate::error::{Error, Result};
use crate::host::HostEvents;
use crate::shm::SharedRegion;

/// Number of entries in the record table
pub const MAX_RECORDS: u32 = 64;

/// Record length bit marking a record still being written
pub const RECORD_PARTIAL: u32 = 0x8000_0000;

/// Default minimum tail kept free when a write has to be split
pub const DEFAULT_PARTIAL_WRITE_THRESHOLD: u32 = 256;

/// Size of the ring header preceding the data area
pub const RING_HEADER_SIZE: u32 = layout::DATA;

/// Byte offsets of the header fields
pub mod layout {
    /// Host event bits
    pub const HOST_EVENTS: u32 = 0;
    /// Bitmap of drawing orders the host accepts
    pub const SUPPORTED_ORDERS: u32 = 4;
    /// Host read cursor into the data area
    pub const OFF_DATA: u32 = 8;
    /// Guest write cursor into the data area
    pub const OFF_FREE: u32 = 12;
    /// Record length table
    pub const RECORDS: u32 = 16;
    /// First record the host has not consumed
    pub const INDEX_FIRST: u32 = RECORDS + super::MAX_RECORDS * 4;
    /// Next record the guest will open
    pub const INDEX_FREE: u32 = INDEX_FIRST + 4;
    /// Partial write threshold
    pub const THRESHOLD: u32 = INDEX_FREE + 4;
    /// Data capacity
    pub const DATA_LEN: u32 = THRESHOLD + 4;
    /// Start of the data area
    pub const DATA: u32 = DATA_LEN + 4;
}

/// Who frees ring space
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reclaim {
    /// Space is free as soon as the host advances its cursors
    Host,
    /// Space is free once the guest retires completed records
    Guest,
}

/// Flush hook invoked when the ring runs short of space
pub trait RingFlush {
    /// Ask the host to drain `ring`; `overflow` reports a guest-side overflow
    fn flush(&self, ring: &ByteRing, overflow: bool);
}

/// A contiguous span of ring memory
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingSpan {
    /// Region offset of the first byte
    pub offset: u32,
    /// Length in bytes
    pub len: u32,
}

/// One record as seen by the iterators
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordView {
    /// Index in the record table
    pub index: u32,
    /// Region offset of the record's first data byte
    pub offset: u32,
    /// Record length in bytes
    pub len: u32,
    /// Host has consumed the record
    pub processed: bool,
}

struct RingState {
    enabled: bool,
    overflow: bool,
    open: Option<u32>,
    first_uncompleted: u32,
    data_uncompleted: u32,
}

/// The byte ring mechanism shared by the notification and command rings
pub struct ByteRing {
    region: Arc<SharedRegion>,
    base: u32,
    data_len: u32,
    reclaim: Reclaim,
    state: Mutex<RingState>,
    broken: AtomicBool,
}

#[inline]
fn in_range(first: u32, entry: u32, free: u32) -> bool {
    if first <= free {
        first <= entry && entry < free
    } else {
        entry >= first || entry < free
    }
}

impl ByteRing {
    /// Place a ring of `size` bytes (header included) at `base`
    pub fn new(region: Arc<SharedRegion>, base: u32, size: u32, reclaim: Reclaim) -> Result<Self> {
        if base % 8 != 0 {
            return Err(Error::InvalidConfig("ring base must be 8-byte aligned"));
        }
        if size <= RING_HEADER_SIZE + DEFAULT_PARTIAL_WRITE_THRESHOLD {
            return Err(Error::InvalidConfig("ring too small"));
        }
        if base as u64 + size as u64 > region.len() as u64 {
            return Err(Error::InvalidConfig("ring exceeds shared region"));
        }

        Ok(Self {
            region,
            base,
            data_len: size - RING_HEADER_SIZE,
            reclaim,
            state: Mutex::new(RingState {
                enabled: false,
                overflow: false,
                open: None,
                first_uncompleted: 0,
                data_uncompleted: 0,
            }),
            broken: AtomicBool::new(false),
        })
    }

    /// Region offset of the ring header
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Region offset of the data area
    pub fn data_base(&self) -> u32 {
        self.base + layout::DATA
    }

    /// Data capacity in bytes
    pub fn capacity(&self) -> u32 {
        self.data_len
    }

    /// Reclaim policy
    pub fn reclaim(&self) -> Reclaim {
        self.reclaim
    }

    /// Shared region backing the ring
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    fn load(&self, field: u32) -> Result<u32> {
        self.region.load_u32(self.base + field)
    }

    fn store(&self, field: u32, value: u32) -> Result<()> {
        self.region.store_u32(self.base + field, value)
    }

    fn record(&self, index: u32) -> Result<u32> {
        self.load(layout::RECORDS + index * 4)
    }

    fn set_record(&self, index: u32, value: u32) -> Result<()> {
        self.store(layout::RECORDS + index * 4, value)
    }

    /// Reset the header and mark the ring active
    pub fn activate(&self, threshold: u32) -> Result<()> {
        let mut state = self.state.lock();

        self.store(layout::HOST_EVENTS, 0)?;
        self.store(layout::SUPPORTED_ORDERS, 0)?;
        self.store(layout::OFF_DATA, 0)?;
        self.store(layout::OFF_FREE, 0)?;
        for index in 0..MAX_RECORDS {
            self.set_record(index, 0)?;
        }
        self.store(layout::INDEX_FIRST, 0)?;
        self.store(layout::INDEX_FREE, 0)?;
        self.store(layout::THRESHOLD, threshold)?;
        self.store(layout::DATA_LEN, self.data_len)?;

        *state = RingState {
            enabled: true,
            overflow: false,
            open: None,
            first_uncompleted: 0,
            data_uncompleted: 0,
        };
        self.broken.store(false, Ordering::Release);

        log::debug!("ring {:#x} active: {} data bytes", self.base, self.data_len);
        Ok(())
    }

    /// Mark the ring inactive; returns whether it was active
    pub fn deactivate(&self) -> bool {
        let mut state = self.state.lock();
        let was = state.enabled;
        state.enabled = false;
        state.overflow = false;
        state.open = None;
        was
    }

    /// Whether the ring is active
    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Whether a hard overflow is latched
    pub fn is_overflowed(&self) -> bool {
        self.state.lock().overflow
    }

    /// Latch the ring as broken after a protocol violation
    pub fn mark_broken(&self) {
        log::warn!("ring {:#x} marked broken", self.base);
        self.broken.store(true, Ordering::Release);
    }

    /// Whether a protocol violation was latched
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    fn check_usable(&self) -> Result<()> {
        if self.is_broken() {
            return Err(Error::ProtocolViolation("ring broken"));
        }
        Ok(())
    }

    /// Current host event bits
    pub fn host_events(&self) -> HostEvents {
        self.load(layout::HOST_EVENTS)
            .map(HostEvents::from_bits_truncate)
            .unwrap_or_default()
    }

    /// Host is walking the ring and needs no doorbell
    pub fn is_processing(&self) -> bool {
        self.host_events().contains(HostEvents::STATE_PROCESSING)
    }

    /// Whether the host accepts drawing order `code`
    pub fn order_supported(&self, code: u32) -> bool {
        code < 32
            && self
                .load(layout::SUPPORTED_ORDERS)
                .map(|orders| orders & (1 << code) != 0)
                .unwrap_or(false)
    }

    fn first_record(&self, state: &RingState) -> Result<u32> {
        match self.reclaim {
            Reclaim::Host => self.load(layout::INDEX_FIRST),
            Reclaim::Guest => Ok(state.first_uncompleted),
        }
    }

    fn data_cursor(&self, state: &RingState) -> Result<u32> {
        let cursor = match self.reclaim {
            Reclaim::Host => self.load(layout::OFF_DATA)?,
            Reclaim::Guest => state.data_uncompleted,
        };
        if cursor >= self.data_len {
            return Err(Error::ProtocolViolation("data cursor out of range"));
        }
        Ok(cursor)
    }

    /// Free space between the write cursor and the oldest unreclaimed byte
    fn available(&self, free: u32, data: u32) -> u32 {
        if data > free {
            data - free
        } else {
            self.data_len - (free - data)
        }
    }

    /// Space at the write cursor that needs no wrap
    fn contiguous(&self, free: u32, data: u32) -> u32 {
        if data > free {
            data - free
        } else {
            self.data_len - free
        }
    }

    /// Bytes between the write cursor and the end of the data area when
    /// the unreclaimed data sits at or before the cursor, else 0
    pub fn free_tail(&self) -> u32 {
        let state = self.state.lock();
        let free = match self.load(layout::OFF_FREE) {
            Ok(free) => free,
            Err(_) => return 0,
        };
        match self.data_cursor(&state) {
            Ok(data) if data <= free => self.data_len - free,
            _ => 0,
        }
    }

    /// Open a new record
    ///
    /// A full record table triggers one flush; if the table is still full
    /// the update fails with [`Error::ResourceExhausted`].
    pub fn begin_update<F: RingFlush>(&self, flush: F) -> Result<RecordUpdate<'_, F>> {
        self.check_usable()?;
        if self.reclaim == Reclaim::Host
            && !self.host_events().contains(HostEvents::MODE_ENABLED)
        {
            return Err(Error::Disabled);
        }

        let mut flushed = false;
        loop {
            let mut state = self.state.lock();
            if !state.enabled {
                return Err(Error::Disabled);
            }
            if state.open.is_some() {
                return Err(Error::Busy);
            }
            if state.overflow {
                return Err(Error::ResourceExhausted);
            }

            let free = self.load(layout::INDEX_FREE)? % MAX_RECORDS;
            let next = (free + 1) % MAX_RECORDS;
            if next == self.first_record(&state)? {
                drop(state);
                if flushed {
                    log::debug!("ring {:#x}: record table full", self.base);
                    return Err(Error::ResourceExhausted);
                }
                flush.flush(self, false);
                flushed = true;
                continue;
            }

            self.set_record(free, RECORD_PARTIAL)?;
            self.store(layout::INDEX_FREE, next)?;
            state.open = Some(free);

            return Ok(RecordUpdate {
                ring: self,
                index: free,
                flush,
                done: false,
            });
        }
    }

    /// Advance the write cursor by up to `wanted` bytes for the open record
    fn reserve<F: RingFlush>(&self, index: u32, wanted: u32, flush: &F) -> Result<(u32, u32)> {
        let mut flushed = false;
        loop {
            let mut state = self.state.lock();
            if state.overflow {
                return Err(Error::ResourceExhausted);
            }

            let free = self.load(layout::OFF_FREE)?;
            let data = self.data_cursor(&state)?;
            let avail = self.available(free, data);
            let mut chunk = wanted;

            if chunk >= avail {
                if !flushed {
                    drop(state);
                    flush.flush(self, false);
                    flushed = true;
                    continue;
                }

                let threshold = self.load(layout::THRESHOLD)?;
                if avail <= threshold {
                    state.overflow = true;
                    drop(state);
                    log::warn!("ring {:#x}: overflow ({} bytes free)", self.base, avail);
                    flush.flush(self, true);
                    return Err(Error::ResourceExhausted);
                }
                chunk = avail - threshold;
            }

            self.store(layout::OFF_FREE, (free + chunk) % self.data_len)?;
            let len = self.record(index)?;
            self.set_record(index, len + chunk)?;
            return Ok((free, chunk));
        }
    }

    fn copy_in(&self, offset: u32, bytes: &[u8]) -> Result<()> {
        let len = bytes.len() as u32;
        let first = core::cmp::min(len, self.data_len - offset);
        self.region
            .write(self.data_base() + offset, &bytes[..first as usize])?;
        if first < len {
            self.region.write(self.data_base(), &bytes[first as usize..])?;
        }
        Ok(())
    }

    /// Copy `buf.len()` bytes out of the data area starting at region
    /// offset `offset`, wrapping at the end of the ring
    pub fn copy_out(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        let rel = offset
            .checked_sub(self.data_base())
            .filter(|rel| *rel < self.data_len)
            .ok_or(Error::OutOfBounds {
                offset,
                len: buf.len() as u32,
            })?;
        let len = buf.len() as u32;
        let first = core::cmp::min(len, self.data_len - rel);
        self.region.read(offset, &mut buf[..first as usize])?;
        if first < len {
            self.region.read(self.data_base(), &mut buf[first as usize..])?;
        }
        Ok(())
    }

    fn reserve_contiguous<F: RingFlush>(&self, index: u32, len: u32, flush: &F) -> Result<RingSpan> {
        if len > self.data_len {
            return Err(Error::ResourceExhausted);
        }

        let mut flushed = false;
        loop {
            let state = self.state.lock();
            if state.overflow {
                return Err(Error::ResourceExhausted);
            }

            let free = self.load(layout::OFF_FREE)?;
            let data = self.data_cursor(&state)?;

            if self.contiguous(free, data) < len || self.available(free, data) <= len {
                if len > self.data_len - free {
                    // Cannot become contiguous at this cursor no matter what
                    // the host drains.
                    return Err(Error::ResourceExhausted);
                }
                drop(state);
                if flushed {
                    return Err(Error::ResourceExhausted);
                }
                flush.flush(self, false);
                flushed = true;
                continue;
            }

            self.store(layout::OFF_FREE, (free + len) % self.data_len)?;
            let current = self.record(index)?;
            self.set_record(index, current + len)?;
            return Ok(RingSpan {
                offset: self.data_base() + free,
                len,
            });
        }
    }

    fn finish(&self, index: u32) {
        let mut state = self.state.lock();
        let ended = self
            .record(index)
            .and_then(|len| self.set_record(index, len & !RECORD_PARTIAL));
        if let Err(err) = ended {
            log::warn!("ring {:#x}: record {} left partial: {}", self.base, index, err);
        }
        if state.open == Some(index) {
            state.open = None;
        }
    }

    fn rewind(&self, index: u32) -> Result<bool> {
        let mut state = self.state.lock();
        let len = self.record(index)? & !RECORD_PARTIAL;
        let free = self.load(layout::INDEX_FREE)?;
        if len != 0 || (index + 1) % MAX_RECORDS != free {
            return Ok(false);
        }
        self.set_record(index, 0)?;
        self.store(layout::INDEX_FREE, index)?;
        state.open = None;
        Ok(true)
    }

    /// Retire record `index` if it is the oldest uncompleted one (guest
    /// reclaim); returns false when the cursor is elsewhere
    pub fn complete_first(&self, index: u32) -> Result<bool> {
        let mut state = self.state.lock();
        if state.first_uncompleted != index % MAX_RECORDS {
            return Ok(false);
        }
        let len = self.record(index)? & !RECORD_PARTIAL;
        state.first_uncompleted = (index + 1) % MAX_RECORDS;
        state.data_uncompleted = (state.data_uncompleted + len) % self.data_len;
        Ok(true)
    }

    fn is_processed(&self, index: u32, free: u32) -> bool {
        match self.load(layout::INDEX_FIRST) {
            Ok(first) => !in_range(first % MAX_RECORDS, index, free),
            Err(_) => false,
        }
    }

    /// Walk records from the oldest unreclaimed one towards the newest
    pub fn iter_oldest(&self) -> Result<ForwardIter<'_>> {
        let state = self.state.lock();
        Ok(ForwardIter {
            ring: self,
            index: self.first_record(&state)? % MAX_RECORDS,
            offset: self.data_cursor(&state)?,
            end: self.load(layout::INDEX_FREE)? % MAX_RECORDS,
        })
    }

    /// Walk records from the newest back to the oldest unreclaimed one
    pub fn iter_newest(&self) -> Result<BackwardIter<'_>> {
        let state = self.state.lock();
        let end = self.first_record(&state)? % MAX_RECORDS;
        Ok(BackwardIter {
            ring: self,
            index: self.load(layout::INDEX_FREE)? % MAX_RECORDS,
            offset: self.load(layout::OFF_FREE)? % self.data_len,
            end,
            free: self.load(layout::INDEX_FREE)? % MAX_RECORDS,
        })
    }
}

impl core::fmt::Debug for ByteRing {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ByteRing")
            .field("base", &self.base)
            .field("data_len", &self.data_len)
            .field("reclaim", &self.reclaim)
            .field("broken", &self.is_broken())
            .finish()
    }
}

/// An open record; ends the update when dropped
pub struct RecordUpdate<'a, F: RingFlush> {
    ring: &'a ByteRing,
    index: u32,
    flush: F,
    done: bool,
}

impl<'a, F: RingFlush> RecordUpdate<'a, F> {
    /// Record table index of this update
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Ring being written
    pub fn ring(&self) -> &'a ByteRing {
        self.ring
    }

    /// Append bytes, wrapping at the end of the data area
    ///
    /// Writes that do not fit are split: the ring is flushed and the data
    /// is copied in pieces, keeping the partial write threshold free. If
    /// even that is impossible the overflow latch is set.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.ring.check_usable()?;
        let mut written = 0usize;
        while written < bytes.len() {
            let wanted = (bytes.len() - written) as u32;
            let (offset, chunk) = self.ring.reserve(self.index, wanted, &self.flush)?;
            self.ring
                .copy_in(offset, &bytes[written..written + chunk as usize])?;
            written += chunk as usize;
        }
        Ok(())
    }

    /// Reserve a contiguous span for the caller to fill in place
    pub fn allocate_contiguous(&mut self, len: u32) -> Result<RingSpan> {
        self.ring.check_usable()?;
        self.ring.reserve_contiguous(self.index, len, &self.flush)
    }

    /// Current record length
    pub fn len(&self) -> u32 {
        self.ring
            .record(self.index)
            .map(|len| len & !RECORD_PARTIAL)
            .unwrap_or(0)
    }

    /// Whether nothing has been written yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finish the record and make it visible to the host
    pub fn end(mut self) {
        self.done = true;
        self.ring.finish(self.index);
    }

    /// Drop an empty record without publishing it; a non-empty record is
    /// ended normally
    pub fn abandon(mut self) {
        self.done = true;
        match self.ring.rewind(self.index) {
            Ok(true) => {}
            _ => self.ring.finish(self.index),
        }
    }
}

impl<F: RingFlush> Drop for RecordUpdate<'_, F> {
    fn drop(&mut self) {
        if !self.done {
            self.ring.finish(self.index);
        }
    }
}

/// Oldest-first record walk
pub struct ForwardIter<'a> {
    ring: &'a ByteRing,
    index: u32,
    offset: u32,
    end: u32,
}

impl Iterator for ForwardIter<'_> {
    type Item = RecordView;

    fn next(&mut self) -> Option<RecordView> {
        if self.index == self.end {
            return None;
        }
        let raw = self.ring.record(self.index).ok()?;
        if raw & RECORD_PARTIAL != 0 {
            return None;
        }

        let view = RecordView {
            index: self.index,
            offset: self.ring.data_base() + self.offset,
            len: raw,
            processed: self.ring.is_processed(self.index, self.end),
        };
        self.index = (self.index + 1) % MAX_RECORDS;
        self.offset = (self.offset + raw) % self.ring.data_len;
        Some(view)
    }
}

/// Newest-first record walk; skips a record that is still open
pub struct BackwardIter<'a> {
    ring: &'a ByteRing,
    index: u32,
    offset: u32,
    end: u32,
    free: u32,
}

impl Iterator for BackwardIter<'_> {
    type Item = RecordView;

    fn next(&mut self) -> Option<RecordView> {
        loop {
            if self.index == self.end {
                return None;
            }
            self.index = (self.index + MAX_RECORDS - 1) % MAX_RECORDS;
            let raw = self.ring.record(self.index).ok()?;
            let len = raw & !RECORD_PARTIAL;
            self.offset = (self.offset + self.ring.data_len - len % self.ring.data_len)
                % self.ring.data_len;
            if raw & RECORD_PARTIAL != 0 {
                continue;
            }
            return Some(RecordView {
                index: self.index,
                offset: self.ring.data_base() + self.offset,
                len,
                processed: self.ring.is_processed(self.index, self.free),
            });
        }
    }
}
