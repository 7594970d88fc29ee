//! # libvdisplay - Paravirtualized Display Transport
//!
//! Guest-side plumbing between a display driver and the hypervisor host,
//! built on a region of shared video memory.
//!
//! ## Components
//!
//! - **Shared heap** - variable-sized buffers the host can address by offset
//! - **Notification ring** - byte ring carrying dirty-rectangle reports
//! - **Command ring** - fenced command slots with preemption
//! - **Command manager** - per-session command queues for user-mode consumers
//! - **Synchronous submission** - submit-and-wait on top of the heap
//! - **Dirty regions** - bounding-rectangle damage tracking
//!
//! ## Usage
//!
//! ```ignore
//! use libvdisplay::{GuestContext, TransportConfig};
//!
//! let ctx = GuestContext::new(TransportConfig::default(), region, port, events)?;
//! let notify = ctx.notify_ring()?;
//! notify.enable(&ctx)?;
//! notify.report_dirty_rect(&ctx, &Rect::new(0, 0, 64, 64), (0, 0))?;
//! ```
//!
//! The driver supplies the doorbell ([`HostPort`]), waitable events
//! ([`EventFactory`]) and the interrupt glue that calls
//! [`CommandRing::check_completed`] and [`GuestContext::complete`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod adapter;
pub mod cmdring;
pub mod config;
pub mod control;
pub mod dirty;
pub mod error;
pub mod heap;
pub mod host;
pub mod ring;
pub mod session;
pub mod shm;
pub mod submit;
pub mod vbva;

pub use adapter::{AdapterStats, GuestContext, StatsSnapshot};
pub use cmdring::{CommandRing, FenceSnapshot, SlotState, SubmitSlot};
pub use config::TransportConfig;
pub use dirty::{DirtyRegion, Rect};
pub use error::{Error, Result};
pub use heap::{HeapBlock, SharedHeap};
pub use host::{
    CompletionEvent, EventFactory, FenceEvent, FenceNotifier, HostEvents, HostPort, SessionEvent,
};
pub use ring::{ByteRing, Reclaim};
pub use session::{CommandManager, ContextId, SessionKey, VisitAction};
pub use shm::SharedRegion;
pub use submit::{CommandBuffer, Submitter};
pub use vbva::NotifyRing;
