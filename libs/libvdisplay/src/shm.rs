//! Shared Memory Region
//!
//! The span of video memory visible to both guest and host. Every other
//! transport structure (heap, rings, command slots) lives at a fixed byte
//! offset inside it. Control words are accessed through aligned atomic
//! views; payload bytes are copied in and out with bounds checks.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::error::{Error, Result};

/// A byte-addressable region shared with the host
pub struct SharedRegion {
    /// First byte of the region
    base: NonNull<u8>,
    /// Size in bytes
    len: u32,
    /// Owned storage when the region is not a device mapping
    _backing: Option<Box<[AtomicU64]>>,
}

// SAFETY: all access to the underlying memory goes through bounds-checked
// copies or atomic views; the region never hands out plain references.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocate a zeroed, 8-byte aligned region of `len` bytes
    pub fn new(len: u32) -> Self {
        let words = (len as usize + 7) / 8;
        let backing: Box<[AtomicU64]> = (0..words)
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let base = NonNull::from(&backing[..]).cast::<u8>();

        log::trace!("Allocated shared region: {} bytes", len);

        Self {
            base,
            len,
            _backing: Some(backing),
        }
    }

    /// Wrap an existing device mapping
    ///
    /// # Safety
    ///
    /// `base` must point to `len` bytes that stay mapped and writable for the
    /// lifetime of the returned region, and must be at least 8-byte aligned.
    pub unsafe fn from_raw(base: NonNull<u8>, len: u32) -> Self {
        Self {
            base,
            len,
            _backing: None,
        }
    }

    /// Size of the region in bytes
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether the region is zero-sized
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: u32, len: usize) -> Result<usize> {
        let end = (offset as u64) + (len as u64);
        if end > self.len as u64 {
            return Err(Error::OutOfBounds {
                offset,
                len: len as u32,
            });
        }
        Ok(offset as usize)
    }

    /// Copy bytes out of the region
    pub fn read(&self, offset: u32, buf: &mut [u8]) -> Result<()> {
        let start = self.check(offset, buf.len())?;
        // SAFETY: range checked above; source and destination never overlap
        // because `buf` is guest-private memory.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.base.as_ptr().add(start),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Copy bytes into the region
    pub fn write(&self, offset: u32, bytes: &[u8]) -> Result<()> {
        let start = self.check(offset, bytes.len())?;
        // SAFETY: range checked above.
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.base.as_ptr().add(start),
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Fill `len` bytes starting at `offset` with `value`
    pub fn fill(&self, offset: u32, len: u32, value: u8) -> Result<()> {
        let start = self.check(offset, len as usize)?;
        // SAFETY: range checked above.
        unsafe {
            core::ptr::write_bytes(self.base.as_ptr().add(start), value, len as usize);
        }
        Ok(())
    }

    /// Atomic view of a 32-bit word; `offset` must be 4-byte aligned
    pub fn atomic_u32(&self, offset: u32) -> Result<&AtomicU32> {
        if offset % 4 != 0 {
            return Err(Error::ProtocolViolation("misaligned 32-bit field"));
        }
        let start = self.check(offset, 4)?;
        // SAFETY: in bounds, aligned (base is 8-byte aligned), and AtomicU32
        // has the same layout as u32.
        Ok(unsafe { &*(self.base.as_ptr().add(start) as *const AtomicU32) })
    }

    /// Atomic view of a single byte
    pub fn atomic_u8(&self, offset: u32) -> Result<&AtomicU8> {
        let start = self.check(offset, 1)?;
        // SAFETY: in bounds; AtomicU8 has the layout of u8.
        Ok(unsafe { &*(self.base.as_ptr().add(start) as *const AtomicU8) })
    }

    /// Acquire-load a control word
    pub fn load_u32(&self, offset: u32) -> Result<u32> {
        Ok(u32::from_le(self.atomic_u32(offset)?.load(Ordering::Acquire)))
    }

    /// Release-store a control word
    pub fn store_u32(&self, offset: u32, value: u32) -> Result<()> {
        self.atomic_u32(offset)?.store(value.to_le(), Ordering::Release);
        Ok(())
    }

    /// Read a little-endian u16 from an unaligned location
    pub fn read_u16(&self, offset: u32) -> Result<u16> {
        let mut raw = [0u8; 2];
        self.read(offset, &mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    /// Read a little-endian u32 from an unaligned location
    pub fn read_u32(&self, offset: u32) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.read(offset, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Read a little-endian i32 from an unaligned location
    pub fn read_i32(&self, offset: u32) -> Result<i32> {
        Ok(self.read_u32(offset)? as i32)
    }

    /// Read a little-endian u64 from an unaligned location
    pub fn read_u64(&self, offset: u32) -> Result<u64> {
        let mut raw = [0u8; 8];
        self.read(offset, &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    /// Write a little-endian u16
    pub fn write_u16(&self, offset: u32, value: u16) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Write a little-endian u32
    pub fn write_u32(&self, offset: u32, value: u32) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Write a little-endian i32
    pub fn write_i32(&self, offset: u32, value: i32) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Write a little-endian u64
    pub fn write_u64(&self, offset: u32, value: u64) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }
}

impl core::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("owned", &self._backing.is_some())
            .finish()
    }
}
