//! Host Interfaces
//!
//! Wire constants shared with the host and the traits through which the
//! transport reaches the outside world: the doorbell port, events the
//! platform can wait on, and fence notifications for the scheduler.

use alloc::sync::Arc;
use core::time::Duration;

use crate::error::Result;

/// Buffer channels
pub mod channel {
    /// Guest-private buffers that are never handed to the host
    pub const RESERVED: u8 = 0;
    /// Video acceleration channel
    pub const VBVA: u8 = 2;
}

/// Command kinds on the [`channel::VBVA`] channel
pub mod vbva_kind {
    /// Ask the host to drain the byte ring
    pub const FLUSH: u16 = 5;
    /// Describe a screen (resize)
    pub const INFO_SCREEN: u16 = 6;
    /// Enable or disable a ring
    pub const ENABLE: u16 = 7;
    /// New work on the command ring
    pub const CMDVBVA_SUBMIT: u16 = 16;
    /// Ask the host to drain the command ring
    pub const CMDVBVA_FLUSH: u16 = 17;
    /// Command ring control request
    pub const CMDVBVA_CTL: u16 = 18;
}

bitflags::bitflags! {
    /// Host-owned event bits at the start of every ring header
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct HostEvents: u32 {
        /// Host accepted the ring and is consuming records
        const MODE_ENABLED = 0x0000_0001;
        /// Host is currently walking the ring; no doorbell needed
        const STATE_PROCESSING = 0x0001_0000;
    }
}

bitflags::bitflags! {
    /// Flags of a ring enable request
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EnableFlags: u32 {
        /// Enable the ring
        const ENABLE = 0x1;
        /// Disable the ring
        const DISABLE = 0x2;
        /// Request carries a screen id
        const EXTENDED = 0x4;
        /// Ring offset is absolute within the shared region
        const ABSOFFSET = 0x8;
    }
}

/// Doorbell into the host
///
/// `submit` hands over the region offset of a heap buffer header. The host
/// may process the buffer before the call returns.
pub trait HostPort: Send + Sync {
    /// Submit the buffer whose header is at `offset`
    fn submit(&self, offset: u32);
}

/// Event a submitter can block on until the host completes a buffer
pub trait CompletionEvent: Send + Sync {
    /// Wake all waiters
    fn signal(&self);

    /// Block until signalled; `None` waits forever. Returns `false` on timeout.
    fn wait(&self, timeout: Option<Duration>) -> bool;
}

/// Creates completion events for the synchronous submission helper
pub trait EventFactory: Send + Sync {
    /// Create a fresh, unsignalled event
    fn create_event(&self) -> Result<Arc<dyn CompletionEvent>>;
}

/// Notification primitive shared by the contexts of one session
pub trait SessionEvent: Send + Sync {
    /// Wake the session's consumer
    fn signal(&self);
}

/// Fence progress reported to the scheduler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceEvent {
    /// Command carrying `fence` finished on the host
    Completed {
        /// Fence of the finished command
        fence: u32,
    },
    /// A preemption request finished
    Preempted {
        /// Fence identifying the preemption request
        preempt_fence: u32,
        /// Last fence that completed before the preemption took effect
        last_completed: u32,
    },
}

/// Receiver of fence progress, usually the interrupt glue
pub trait FenceNotifier: Send + Sync {
    /// Report one fence event
    fn notify(&self, event: FenceEvent);
}
