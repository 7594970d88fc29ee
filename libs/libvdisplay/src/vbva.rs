//! Notification ring
//!
//! The classic byte ring through which the guest tells the host which
//! screen areas changed. Each report is one record holding an 8-byte
//! header:
//!
//! ```text
//! +0 i16 x   +2 i16 y   +4 u16 width   +6 u16 height
//! ```
//!
//! Space is reclaimed as soon as the host advances its cursors.

use alloc::sync::Arc;
use spin::Mutex;

use crate::adapter::GuestContext;
use crate::config::RingConfig;
use crate::control;
use crate::dirty::{DirtyRegion, Rect};
use crate::error::{status, Error, Result};
use crate::host::EnableFlags;
use crate::ring::{ByteRing, Reclaim, RecordUpdate, RingFlush};
use crate::shm::SharedRegion;

/// Size of a dirty-rectangle record
pub const DIRTY_RECORD_SIZE: usize = 8;

/// Flushes a notification ring through a host control call
#[derive(Clone, Copy)]
pub struct HostFlush<'a> {
    ctx: &'a GuestContext,
}

impl RingFlush for HostFlush<'_> {
    fn flush(&self, ring: &ByteRing, overflow: bool) {
        if overflow {
            self.ctx.stats().overflow();
        }
        if let Err(err) = control::vbva_flush(self.ctx) {
            log::warn!("ring {:#x}: flush failed: {}", ring.base(), err);
        }
    }
}

fn clamp_i16(value: i32) -> i16 {
    value.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

fn clamp_u16(value: i32) -> u16 {
    value.clamp(0, u16::MAX as i32) as u16
}

/// Dirty-rectangle notification ring for one screen
pub struct NotifyRing {
    ring: ByteRing,
    screen: u32,
    threshold: u32,
    pending: Mutex<DirtyRegion>,
}

impl NotifyRing {
    /// Place the ring described by `config`
    pub fn new(region: Arc<SharedRegion>, config: &RingConfig) -> Result<Self> {
        Ok(Self {
            ring: ByteRing::new(region, config.offset, config.size, Reclaim::Host)?,
            screen: config.screen,
            threshold: config.partial_write_threshold,
            pending: Mutex::new(DirtyRegion::new()),
        })
    }

    /// Underlying byte ring
    pub fn ring(&self) -> &ByteRing {
        &self.ring
    }

    /// Screen this ring reports for
    pub fn screen(&self) -> u32 {
        self.screen
    }

    /// Reset the ring and ask the host to start consuming it
    ///
    /// On rejection the ring is disabled again and the host status is
    /// returned as [`Error::HostRejected`]. Enabling clears an overflow.
    pub fn enable(&self, ctx: &GuestContext) -> Result<()> {
        self.ring.activate(self.threshold)?;

        let rc = match control::vbva_enable(ctx, self.ring.base(), self.screen, EnableFlags::ENABLE) {
            Ok(rc) => rc,
            Err(err) => {
                self.ring.deactivate();
                return Err(err);
            }
        };

        if !status::succeeded(rc) {
            log::warn!("screen {}: host rejected ring enable (rc={})", self.screen, rc);
            if let Err(err) = self.disable(ctx) {
                log::warn!("screen {}: disable after rejected enable failed: {}", self.screen, err);
            }
            return Err(Error::HostRejected(rc));
        }

        log::debug!("screen {}: notification ring enabled", self.screen);
        Ok(())
    }

    /// Stop using the ring; a second call does nothing
    pub fn disable(&self, ctx: &GuestContext) -> Result<()> {
        if !self.ring.deactivate() {
            return Ok(());
        }
        self.pending.lock().clear();
        let rc = control::vbva_enable(ctx, self.ring.base(), self.screen, EnableFlags::DISABLE)?;
        if !status::succeeded(rc) {
            log::warn!("screen {}: host rejected ring disable (rc={})", self.screen, rc);
            return Err(Error::HostRejected(rc));
        }
        log::debug!("screen {}: notification ring disabled", self.screen);
        Ok(())
    }

    /// Open a record; flushes through the host when space runs out
    pub fn begin_update<'a>(&'a self, ctx: &'a GuestContext) -> Result<RecordUpdate<'a, HostFlush<'a>>> {
        self.ring.begin_update(HostFlush { ctx })
    }

    /// Report one changed rectangle in desktop coordinates
    pub fn report_dirty_rect(&self, ctx: &GuestContext, rect: &Rect, origin: (i32, i32)) -> Result<()> {
        if rect.is_empty() {
            return Ok(());
        }

        let local = rect.translate(origin.0.saturating_neg(), origin.1.saturating_neg());
        let mut record = [0u8; DIRTY_RECORD_SIZE];
        record[0..2].copy_from_slice(&clamp_i16(local.left).to_le_bytes());
        record[2..4].copy_from_slice(&clamp_i16(local.top).to_le_bytes());
        record[4..6].copy_from_slice(&clamp_u16(local.width()).to_le_bytes());
        record[6..8].copy_from_slice(&clamp_u16(local.height()).to_le_bytes());

        let mut update = self.begin_update(ctx)?;
        update.write(&record)?;
        update.end();

        log::trace!("screen {}: dirty {:?}", self.screen, local);
        Ok(())
    }

    /// Accumulate a changed rectangle without reporting it yet
    pub fn mark_dirty(&self, rect: Rect) {
        self.pending.lock().add(rect);
    }

    /// Whether accumulated damage already covers `rect`
    pub fn is_pending(&self, rect: &Rect) -> bool {
        self.pending.lock().includes(rect)
    }

    /// Report accumulated damage as one rectangle and reset it
    pub fn report_pending(&self, ctx: &GuestContext, origin: (i32, i32)) -> Result<bool> {
        let rect = {
            let mut pending = self.pending.lock();
            let rect = pending.rect();
            pending.clear();
            rect
        };
        match rect {
            Some(rect) => {
                self.report_dirty_rect(ctx, &rect, origin)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
