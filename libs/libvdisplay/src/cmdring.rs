//! Slotted Command Ring
//!
//! A byte ring whose records each hold exactly one command slot:
//!
//! ```text
//! +0 u8 opcode   +1 u8 flags   +2 u8 state   +3 i8 result   +4 u32 fence
//! +8 command payload
//! ```
//!
//! The state byte is the only field both sides write. The guest sets it to
//! `Submitted`; afterwards it only changes by compare-and-swap:
//!
//! ```text
//! Submitted --host claims-->   InProgress --host retires record--> completed
//! Submitted --guest preempts--> Cancelled  --host retires record--> processed
//! ```
//!
//! Completion is signalled by the host moving its record cursor past the
//! slot; the guest walks retired records in order, reports fences, and only
//! then reclaims their space.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use heapless::Deque;
use spin::Mutex;

use crate::adapter::GuestContext;
use crate::config::RingConfig;
use crate::control;
use crate::error::{Error, Result};
use crate::host::{FenceEvent, FenceNotifier};
use crate::ring::{ByteRing, Reclaim, RecordUpdate, RingFlush, RingSpan};
use crate::shm::SharedRegion;

/// Size of the slot header
pub const SLOT_HEADER_SIZE: u32 = 8;

/// Deferred preemptions tracked per ring
pub const PREEMPT_QUEUE_LEN: usize = 16;

/// Slot opcodes
pub mod opcode {
    /// 3D command stream
    pub const CRCMD: u8 = 1;
    /// Blit
    pub const BLT: u8 = 2;
    /// Flip
    pub const FLIP: u8 = 3;
    /// Color fill
    pub const CLRFILL: u8 = 4;
    /// Paging transfer
    pub const PAGING_TRANSFER: u8 = 5;
    /// Paging fill
    pub const PAGING_FILL: u8 = 6;
    /// No-op command that still completes with a fence
    pub const NOPCMD: u8 = 7;
    /// Command stored in guest system memory
    pub const SYSMEMCMD: u8 = 8;
    /// Command made of several sub-commands
    pub const COMPLEXCMD: u8 = 9;
    /// Ring filler; never executed and never reported
    pub const NOP: u8 = 0x80;
}

/// Slot state byte
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Waiting for the host
    Submitted = 1,
    /// Preempted before the host claimed it
    Cancelled = 2,
    /// Claimed by the host
    InProgress = 3,
}

impl SlotState {
    /// Decode a state byte
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(SlotState::Submitted),
            2 => Some(SlotState::Cancelled),
            3 => Some(SlotState::InProgress),
            _ => None,
        }
    }
}

/// Fence counters of a command ring
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FenceSnapshot {
    /// Last fence handed to the host
    pub submitted: u32,
    /// Last fence the host completed
    pub completed: u32,
    /// Last fence retired, completed or cancelled
    pub processed: u32,
}

#[derive(Clone, Copy, Debug)]
struct PendingPreempt {
    submit_fence: u32,
    preempt_fence: u32,
}

struct FenceState {
    counters: FenceSnapshot,
    preempts: Deque<PendingPreempt, PREEMPT_QUEUE_LEN>,
}

/// `a` is at or after `b` in wrapping fence order
fn fence_reached(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// Flushes a command ring: pings the host, then retires what it finished
#[derive(Clone, Copy)]
pub struct CommandFlush<'a> {
    ctx: &'a GuestContext,
    ring: &'a CommandRing,
}

impl RingFlush for CommandFlush<'_> {
    fn flush(&self, ring: &ByteRing, overflow: bool) {
        if overflow {
            self.ctx.stats().overflow();
        }
        if let Err(err) = control::cmdvbva_flush(self.ctx, true) {
            log::warn!("command ring {:#x}: flush failed: {}", ring.base(), err);
        }
        if let Err(err) = self.ring.process_completed() {
            log::warn!("command ring {:#x}: completion failed: {}", ring.base(), err);
        }
    }
}

/// A reserved slot; fill it, then [`SubmitSlot::submit`]
///
/// Dropping the slot without submitting publishes a no-op in its place.
pub struct SubmitSlot<'a> {
    ring: &'a CommandRing,
    ctx: &'a GuestContext,
    update: Option<RecordUpdate<'a, CommandFlush<'a>>>,
    span: RingSpan,
}

impl<'a> SubmitSlot<'a> {
    /// Region offset of the slot header
    pub fn offset(&self) -> u32 {
        self.span.offset
    }

    /// Payload capacity in bytes
    pub fn payload_len(&self) -> u32 {
        self.span.len - SLOT_HEADER_SIZE
    }

    fn region(&self) -> &SharedRegion {
        self.ring.ring.region()
    }

    /// Set the opcode byte
    pub fn set_opcode(&mut self, opcode: u8) -> Result<()> {
        self.region().write(self.span.offset, &[opcode])
    }

    /// Set the flags byte
    pub fn set_flags(&mut self, flags: u8) -> Result<()> {
        self.region().write(self.span.offset + 1, &[flags])
    }

    /// Write payload bytes at `at`
    pub fn write_payload(&mut self, at: u32, bytes: &[u8]) -> Result<()> {
        if at as u64 + bytes.len() as u64 > self.payload_len() as u64 {
            return Err(Error::OutOfBounds {
                offset: self.span.offset + SLOT_HEADER_SIZE + at,
                len: bytes.len() as u32,
            });
        }
        self.region()
            .write(self.span.offset + SLOT_HEADER_SIZE + at, bytes)
    }

    /// Publish the slot with `fence`
    pub fn submit(mut self, fence: u32) -> Result<()> {
        let region = self.ring.ring.region();
        region.write_u32(self.span.offset + 4, fence)?;
        region
            .atomic_u8(self.span.offset + 2)?
            .store(SlotState::Submitted as u8, Ordering::Release);

        if let Some(update) = self.update.take() {
            update.end();
        }
        self.ring.fences.lock().counters.submitted = fence;

        log::trace!("slot {:#x} submitted, fence {}", self.span.offset, fence);

        if !self.ring.ring.is_processing() {
            control::cmdvbva_submit(self.ctx)?;
        }
        Ok(())
    }
}

impl Drop for SubmitSlot<'_> {
    fn drop(&mut self) {
        if let Some(update) = self.update.take() {
            if let Err(err) = self.ring.region().write(self.span.offset, &[opcode::NOP]) {
                log::warn!("slot {:#x}: no-op fill failed: {}", self.span.offset, err);
            }
            update.end();
        }
    }
}

// ============================================================================
// Command ring
// ============================================================================

/// Command ring with fences and preemption
pub struct CommandRing {
    ring: ByteRing,
    threshold: u32,
    fences: Mutex<FenceState>,
    completion: Mutex<()>,
    notifier: Arc<dyn FenceNotifier>,
}

impl CommandRing {
    /// Place the ring described by `config`
    pub fn new(
        region: Arc<SharedRegion>,
        config: &RingConfig,
        notifier: Arc<dyn FenceNotifier>,
    ) -> Result<Self> {
        Ok(Self {
            ring: ByteRing::new(region, config.offset, config.size, Reclaim::Guest)?,
            threshold: config.partial_write_threshold,
            fences: Mutex::new(FenceState {
                counters: FenceSnapshot::default(),
                preempts: Deque::new(),
            }),
            completion: Mutex::new(()),
            notifier,
        })
    }

    /// Underlying byte ring
    pub fn ring(&self) -> &ByteRing {
        &self.ring
    }

    fn region(&self) -> &SharedRegion {
        self.ring.region()
    }

    /// Fence counters
    pub fn fences(&self) -> FenceSnapshot {
        self.fences.lock().counters
    }

    /// Preemptions waiting for an in-flight command
    pub fn pending_preemptions(&self) -> usize {
        self.fences.lock().preempts.len()
    }

    /// Reset the ring and enable it on the host
    pub fn enable(&self, ctx: &GuestContext) -> Result<()> {
        self.ring.activate(self.threshold)?;
        {
            let mut fences = self.fences.lock();
            fences.counters = FenceSnapshot::default();
            fences.preempts.clear();
        }

        if let Err(err) = control::ctl_enable(ctx, self.ring.base(), true) {
            log::warn!("command ring {:#x}: enable failed: {}", self.ring.base(), err);
            self.ring.deactivate();
            return Err(err);
        }
        log::debug!("command ring {:#x} enabled", self.ring.base());
        Ok(())
    }

    /// Disable the ring; a second call does nothing
    pub fn disable(&self, ctx: &GuestContext) -> Result<()> {
        if !self.ring.deactivate() {
            return Ok(());
        }
        control::ctl_enable(ctx, self.ring.base(), false)?;
        log::debug!("command ring {:#x} disabled", self.ring.base());
        Ok(())
    }

    fn write_filler(&self, span: RingSpan) -> Result<()> {
        let header = [opcode::NOP, 0, 0, 0, 0, 0, 0, 0];
        let len = core::cmp::min(span.len, SLOT_HEADER_SIZE) as usize;
        self.region().write(span.offset, &header[..len])
    }

    /// Reserve a slot with room for `size` payload bytes
    ///
    /// If the slot does not fit before the end of the data area, the tail
    /// is filled with a no-op record and the slot is placed at the start.
    /// Failing again after that returns [`Error::ResourceExhausted`]; the
    /// filler stays committed.
    pub fn lock_for_submit<'a>(&'a self, ctx: &'a GuestContext, size: u32) -> Result<SubmitSlot<'a>> {
        let total = size
            .checked_add(SLOT_HEADER_SIZE)
            .ok_or(Error::ResourceExhausted)?;
        if total > self.ring.capacity() {
            log::warn!("command of {} bytes exceeds ring capacity", total);
            return Err(Error::ResourceExhausted);
        }

        let flush = CommandFlush { ctx, ring: self };
        let mut update = self.ring.begin_update(flush)?;
        let first = update.allocate_contiguous(total);

        let (update, span) = match first {
            Ok(span) => (update, span),
            Err(Error::ResourceExhausted) => {
                let tail = self.ring.free_tail();
                if tail == 0 {
                    update.abandon();
                    return Err(Error::ResourceExhausted);
                }
                let filler = match update.allocate_contiguous(tail) {
                    Ok(filler) => filler,
                    Err(err) => {
                        update.abandon();
                        return Err(err);
                    }
                };
                self.write_filler(filler)?;
                update.end();
                log::trace!("command ring: {} byte filler at {:#x}", tail, filler.offset);

                let mut retry = self.ring.begin_update(flush)?;
                match retry.allocate_contiguous(total) {
                    Ok(span) => (retry, span),
                    Err(err) => {
                        retry.abandon();
                        return Err(err);
                    }
                }
            }
            Err(err) => {
                update.abandon();
                return Err(err);
            }
        };

        self.region().fill(span.offset, SLOT_HEADER_SIZE, 0)?;

        Ok(SubmitSlot {
            ring: self,
            ctx,
            update: Some(update),
            span,
        })
    }

    /// Reserve, fill and publish one command
    pub fn submit(
        &self,
        ctx: &GuestContext,
        opcode: u8,
        flags: u8,
        payload: &[u8],
        fence: u32,
    ) -> Result<()> {
        let mut slot = self.lock_for_submit(ctx, payload.len() as u32)?;
        slot.set_opcode(opcode)?;
        slot.set_flags(flags)?;
        slot.write_payload(0, payload)?;
        slot.submit(fence)
    }

    /// Cancel everything the host has not claimed yet
    ///
    /// Walks from the newest command back, flipping `Submitted` slots to
    /// `Cancelled`, and stops at the first command the host is executing.
    /// Returns that command's fence. The preemption is reported at once when
    /// nothing is in flight, otherwise after the in-flight command completes.
    pub fn preempt(&self, ctx: &GuestContext, preempt_fence: u32) -> Result<Option<u32>> {
        if self.ring.is_broken() {
            return Err(Error::ProtocolViolation("ring broken"));
        }

        let region = self.region();
        let mut submit_fence = 0;
        let mut cancelled = 0;

        for record in self.ring.iter_newest()? {
            let op = region.atomic_u8(record.offset)?.load(Ordering::Acquire);
            if op == opcode::NOP {
                continue;
            }
            if record.len < SLOT_HEADER_SIZE {
                self.ring.mark_broken();
                return Err(Error::ProtocolViolation("short command record"));
            }

            let state = region.atomic_u8(record.offset + 2)?;
            match state.compare_exchange(
                SlotState::Submitted as u8,
                SlotState::Cancelled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => cancelled += 1,
                Err(raw) if raw == SlotState::Cancelled as u8 => {}
                Err(raw) if raw == SlotState::InProgress as u8 => {
                    submit_fence = region.read_u32(record.offset + 4)?;
                    break;
                }
                Err(_) => {
                    self.ring.mark_broken();
                    return Err(Error::ProtocolViolation("unexpected command state"));
                }
            }
        }

        ctx.stats().preemption();
        log::debug!(
            "preempt fence {}: cancelled {}, in flight {}",
            preempt_fence,
            cancelled,
            submit_fence
        );

        let immediate = {
            let mut fences = self.fences.lock();
            if submit_fence == 0 || fence_reached(fences.counters.processed, submit_fence) {
                Some(fences.counters.completed)
            } else {
                fences
                    .preempts
                    .push_back(PendingPreempt {
                        submit_fence,
                        preempt_fence,
                    })
                    .map_err(|_| Error::ResourceExhausted)?;
                None
            }
        };

        if let Some(last_completed) = immediate {
            self.notifier.notify(FenceEvent::Preempted {
                preempt_fence,
                last_completed,
            });
        }

        Ok((submit_fence != 0).then_some(submit_fence))
    }

    /// Interrupt path: optionally ping the host, then retire finished work
    ///
    /// Returns whether any fence event was reported.
    pub fn check_completed(&self, ctx: &GuestContext, ping_host: bool) -> Result<bool> {
        if ping_host {
            control::cmdvbva_flush(ctx, false)?;
        }
        self.process_completed()
    }

    /// Retire every record the host has finished, in ring order
    ///
    /// Callers on the interrupt and submit paths are serialized; each fence
    /// is reported once.
    pub fn process_completed(&self) -> Result<bool> {
        let _walk = self.completion.lock();
        if self.ring.is_broken() {
            return Err(Error::ProtocolViolation("ring broken"));
        }

        let region = self.region();
        let mut events = Vec::new();
        let mut violation = None;

        for record in self.ring.iter_oldest()? {
            if !record.processed {
                break;
            }

            let op = region.atomic_u8(record.offset)?.load(Ordering::Acquire);
            if !self.ring.complete_first(record.index)? {
                break;
            }
            if op == opcode::NOP {
                continue;
            }
            if record.len < SLOT_HEADER_SIZE {
                violation = Some("short command record");
                break;
            }

            let raw = region.atomic_u8(record.offset + 2)?.load(Ordering::Acquire);
            let fence = region.read_u32(record.offset + 4)?;
            if fence == 0 {
                log::warn!("slot {:#x} retired without a fence", record.offset);
                continue;
            }

            let mut fences = self.fences.lock();
            fences.counters.processed = fence;
            match SlotState::from_raw(raw) {
                Some(SlotState::InProgress) => {
                    fences.counters.completed = fence;
                    events.push(FenceEvent::Completed { fence });

                    let due = fences
                        .preempts
                        .front()
                        .map_or(false, |pending| pending.submit_fence == fence);
                    if due {
                        if let Some(pending) = fences.preempts.pop_front() {
                            events.push(FenceEvent::Preempted {
                                preempt_fence: pending.preempt_fence,
                                last_completed: fence,
                            });
                        }
                    }
                }
                Some(SlotState::Cancelled) => {}
                _ => {
                    violation = Some("retired command in unexpected state");
                    break;
                }
            }
        }

        for event in &events {
            self.notifier.notify(*event);
        }

        if let Some(reason) = violation {
            log::warn!("command ring {:#x}: {}", self.ring.base(), reason);
            self.ring.mark_broken();
            return Err(Error::ProtocolViolation(reason));
        }
        Ok(!events.is_empty())
    }
}
