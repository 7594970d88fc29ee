//! Synchronous Command Submission
//!
//! Command buffers are heap buffers whose payload starts with an 8-byte
//! submission header:
//!
//! ```text
//! +0  u32  flags (SubmitFlags)
//! +4  u32  reserved
//! ```
//!
//! The guest arms [`SubmitFlags::GH_ASYNC_IRQ`] before ringing the doorbell.
//! A host that finishes the buffer during the doorbell write leaves
//! [`SubmitFlags::HG_ASYNC`] clear and the completion runs inline; otherwise
//! it sets the flag and later reports the buffer through the interrupt path,
//! which calls [`Submitter::complete`].

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::time::Duration;
use hashbrown::HashMap;
use spin::Mutex;

use crate::error::{Error, Result};
use crate::heap::{HeapBlock, SharedHeap};
use crate::host::{EventFactory, HostPort};
use crate::shm::SharedRegion;

/// Size of the submission header at the start of a command payload
pub const SUBMIT_HEADER_SIZE: u32 = 8;

bitflags::bitflags! {
    /// Submission header flags
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SubmitFlags: u32 {
        /// Guest wants an interrupt when the host completes the buffer
        const GH_ASYNC_IRQ = 0x0000_0002;
        /// Guest does not need a completion at all
        const GH_ASYNC_NOCOMPLETION = 0x0000_0004;
        /// Host completes the buffer asynchronously
        const HG_ASYNC = 0x0001_0000;
    }
}

/// Completion callback, invoked exactly once per submission
pub type Completion = Box<dyn FnOnce(&CommandBuffer) + Send>;

struct BufferInner {
    heap: Arc<SharedHeap>,
    block: HeapBlock,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        if let Err(err) = self.heap.free(self.block) {
            log::warn!("command buffer {:#x}: free failed: {}", self.block.offset(), err);
        }
    }
}

/// Reference-counted command buffer in the shared heap
///
/// Cloning retains, dropping releases; the heap block is returned when the
/// last handle goes away.
#[derive(Clone)]
pub struct CommandBuffer {
    inner: Arc<BufferInner>,
}

impl CommandBuffer {
    /// Allocate a buffer with room for `size` command bytes
    pub fn allocate(heap: &Arc<SharedHeap>, size: u32, channel: u8, kind: u16) -> Result<Self> {
        let total = size
            .checked_add(SUBMIT_HEADER_SIZE)
            .ok_or(Error::ResourceExhausted)?;
        let block = heap.allocate(total, channel, kind)?;
        let buffer = Self {
            inner: Arc::new(BufferInner {
                heap: heap.clone(),
                block,
            }),
        };
        buffer.region().fill(block.data_offset(), total, 0)?;
        Ok(buffer)
    }

    fn region(&self) -> &SharedRegion {
        self.inner.heap.region()
    }

    /// Region offset of the heap header; the value handed to the host
    pub fn offset(&self) -> u32 {
        self.inner.block.offset()
    }

    /// Region offset of the first command byte
    pub fn payload_offset(&self) -> u32 {
        self.inner.block.data_offset() + SUBMIT_HEADER_SIZE
    }

    /// Command size in bytes
    pub fn payload_len(&self) -> u32 {
        self.inner.block.size() - SUBMIT_HEADER_SIZE
    }

    fn check(&self, at: u32, len: usize) -> Result<u32> {
        if at as u64 + len as u64 > self.payload_len() as u64 {
            return Err(Error::OutOfBounds {
                offset: self.payload_offset() + at,
                len: len as u32,
            });
        }
        Ok(self.payload_offset() + at)
    }

    /// Write command bytes at `at` within the payload
    pub fn write(&self, at: u32, bytes: &[u8]) -> Result<()> {
        let offset = self.check(at, bytes.len())?;
        self.region().write(offset, bytes)
    }

    /// Read command bytes at `at` within the payload
    pub fn read(&self, at: u32, buf: &mut [u8]) -> Result<()> {
        let offset = self.check(at, buf.len())?;
        self.region().read(offset, buf)
    }

    /// Read a little-endian u32 from the payload
    pub fn read_u32(&self, at: u32) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.read(at, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Read a little-endian i32 from the payload
    pub fn read_i32(&self, at: u32) -> Result<i32> {
        Ok(self.read_u32(at)? as i32)
    }

    /// Submission header flags
    pub fn flags(&self) -> SubmitFlags {
        self.region()
            .load_u32(self.inner.block.data_offset())
            .map(SubmitFlags::from_bits_truncate)
            .unwrap_or_default()
    }

    /// Overwrite the submission header flags
    pub fn set_flags(&self, flags: SubmitFlags) -> Result<()> {
        self.region()
            .store_u32(self.inner.block.data_offset(), flags.bits())
    }

    /// Number of live handles
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl core::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("offset", &self.offset())
            .field("len", &self.payload_len())
            .field("refs", &self.ref_count())
            .finish()
    }
}

struct InFlight {
    buffer: CommandBuffer,
    completion: Completion,
}

/// Tracks submissions the host has not completed yet
pub struct Submitter {
    in_flight: Mutex<HashMap<u32, InFlight>>,
}

impl Submitter {
    /// Create an empty submitter
    pub fn new() -> Self {
        Self {
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn take(&self, offset: u32) -> Option<InFlight> {
        self.in_flight.lock().remove(&offset)
    }

    /// Submit `buffer`; `completion` runs once when the host is done
    ///
    /// The completion runs before this returns if the host completed the
    /// buffer synchronously.
    pub fn submit_async(
        &self,
        port: &dyn HostPort,
        buffer: &CommandBuffer,
        completion: Completion,
    ) -> Result<()> {
        let offset = buffer.offset();
        buffer.set_flags(SubmitFlags::GH_ASYNC_IRQ)?;

        let entry = InFlight {
            buffer: buffer.clone(),
            completion,
        };
        let rejected = {
            let mut in_flight = self.in_flight.lock();
            if in_flight.contains_key(&offset) {
                Some(entry)
            } else {
                in_flight.insert(offset, entry);
                None
            }
        };
        if rejected.is_some() {
            log::warn!("buffer {:#x} submitted twice", offset);
            return Err(Error::Busy);
        }

        log::trace!("submit buffer {:#x}", offset);
        port.submit(offset);

        if !buffer.flags().contains(SubmitFlags::HG_ASYNC) {
            if let Some(entry) = self.take(offset) {
                (entry.completion)(&entry.buffer);
            }
        }
        Ok(())
    }

    /// Submit and hand ownership of `buffer` to the transport; it is
    /// released after `completion` runs
    pub fn submit_and_release(
        &self,
        port: &dyn HostPort,
        buffer: CommandBuffer,
        completion: Completion,
    ) -> Result<()> {
        self.submit_async(port, &buffer, completion)
    }

    /// Submit and block until the host completes the buffer
    pub fn submit_and_wait(
        &self,
        port: &dyn HostPort,
        events: &dyn EventFactory,
        buffer: &CommandBuffer,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let event = events.create_event()?;
        let signal = event.clone();
        self.submit_async(port, buffer, Box::new(move |_| signal.signal()))?;

        if !event.wait(timeout) {
            log::warn!("buffer {:#x}: wait timed out", buffer.offset());
            return Err(Error::Timeout);
        }
        Ok(())
    }

    /// Host reported completion of the buffer at `offset`
    pub fn complete(&self, offset: u32) -> Result<()> {
        match self.take(offset) {
            Some(entry) => {
                log::trace!("complete buffer {:#x}", offset);
                (entry.completion)(&entry.buffer);
                Ok(())
            }
            None => {
                log::warn!("completion for unknown buffer {:#x}", offset);
                Err(Error::ProtocolViolation("completion for unknown buffer"))
            }
        }
    }

    /// Submissions still waiting for the host
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }
}

impl Default for Submitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::CompletionEvent;
    use core::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::vec::Vec;

    fn heap() -> Arc<SharedHeap> {
        let region = Arc::new(SharedRegion::new(4096));
        Arc::new(SharedHeap::new(region, 0, 4096).unwrap())
    }

    /// Completes inline or defers, recording every offset it sees
    struct MockPort {
        region: Arc<SharedRegion>,
        defer: bool,
        seen: StdMutex<Vec<u32>>,
    }

    impl HostPort for MockPort {
        fn submit(&self, offset: u32) {
            self.seen.lock().unwrap().push(offset);
            if self.defer {
                let flags = self.region.load_u32(offset + 16).unwrap();
                self.region
                    .store_u32(offset + 16, flags | SubmitFlags::HG_ASYNC.bits())
                    .unwrap();
            }
        }
    }

    struct NeverSignalled;

    impl CompletionEvent for NeverSignalled {
        fn signal(&self) {}
        fn wait(&self, _timeout: Option<Duration>) -> bool {
            false
        }
    }

    struct Factory;

    impl EventFactory for Factory {
        fn create_event(&self) -> Result<Arc<dyn CompletionEvent>> {
            Ok(Arc::new(NeverSignalled))
        }
    }

    #[test]
    fn test_buffer_freed_with_last_handle() {
        let heap = heap();
        let buffer = CommandBuffer::allocate(&heap, 32, 2, 18).unwrap();
        let retained = buffer.clone();
        assert_eq!(buffer.ref_count(), 2);
        drop(buffer);
        assert_eq!(heap.outstanding(), 1);
        drop(retained);
        assert_eq!(heap.outstanding(), 0);
    }

    #[test]
    fn test_payload_bounds() {
        let heap = heap();
        let buffer = CommandBuffer::allocate(&heap, 8, 2, 18).unwrap();
        buffer.write(4, &[1, 2, 3, 4]).unwrap();
        assert!(buffer.write(6, &[1, 2, 3, 4]).is_err());
        assert_eq!(buffer.read_u32(4).unwrap(), 0x0403_0201);
    }

    #[test]
    fn test_inline_completion() {
        let heap = heap();
        let port = MockPort {
            region: heap.region().clone(),
            defer: false,
            seen: StdMutex::new(Vec::new()),
        };
        let submitter = Submitter::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let buffer = CommandBuffer::allocate(&heap, 16, 2, 18).unwrap();
        submitter
            .submit_async(
                &port,
                &buffer,
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(submitter.in_flight(), 0);
        assert_eq!(buffer.ref_count(), 1);
        assert!(buffer.flags().contains(SubmitFlags::GH_ASYNC_IRQ));
    }

    #[test]
    fn test_deferred_completion_runs_once() {
        let heap = heap();
        let port = MockPort {
            region: heap.region().clone(),
            defer: true,
            seen: StdMutex::new(Vec::new()),
        };
        let submitter = Submitter::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let buffer = CommandBuffer::allocate(&heap, 16, 2, 18).unwrap();
        let offset = buffer.offset();
        submitter
            .submit_and_release(
                &port,
                buffer,
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(heap.outstanding(), 1);

        submitter.complete(offset).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(heap.outstanding(), 0);

        assert!(matches!(
            submitter.complete(offset),
            Err(Error::ProtocolViolation(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wait_timeout() {
        let heap = heap();
        let port = MockPort {
            region: heap.region().clone(),
            defer: true,
            seen: StdMutex::new(Vec::new()),
        };
        let submitter = Submitter::new();
        let buffer = CommandBuffer::allocate(&heap, 16, 2, 18).unwrap();
        assert_eq!(
            submitter.submit_and_wait(&port, &Factory, &buffer, Some(Duration::from_millis(1))),
            Err(Error::Timeout)
        );
        assert_eq!(submitter.in_flight(), 1);
        assert_eq!(port.seen.lock().unwrap().len(), 1);
    }
}
