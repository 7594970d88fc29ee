//! Simulated host and platform glue for the integration tests
//!
//! `SimHost` answers doorbell calls the way the hypervisor does: it reads
//! the buffer header, fills in results, and manipulates ring headers
//! through the same shared region the guest uses.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use libvdisplay::cmdring::{opcode, SlotState, SLOT_HEADER_SIZE};
use libvdisplay::config::RingConfig;
use libvdisplay::control::{client_op, ctl_type};
use libvdisplay::error::status;
use libvdisplay::heap::{BufferHeader, HEAP_HEADER_SIZE};
use libvdisplay::host::{vbva_kind, EnableFlags};
use libvdisplay::ring::{layout, MAX_RECORDS, RECORD_PARTIAL, RING_HEADER_SIZE};
use libvdisplay::submit::{SubmitFlags, SUBMIT_HEADER_SIZE};
use libvdisplay::{
    CompletionEvent, EventFactory, FenceEvent, FenceNotifier, GuestContext, HostEvents, HostPort,
    SessionEvent, SharedRegion, TransportConfig,
};

/// Data capacity of the notification ring used by the tests
pub const NOTIFY_DATA: u32 = 4096;

/// Data capacity of the command ring used by the tests
pub const COMMAND_DATA: u32 = 1024;

/// Layout with small rings so tests can reach their limits quickly
pub fn test_config() -> TransportConfig {
    let mut config = TransportConfig::default();
    config.notify_ring = RingConfig {
        offset: 0x1_0000,
        size: RING_HEADER_SIZE + NOTIFY_DATA,
        partial_write_threshold: 256,
        screen: 0,
    };
    config.command_ring = Some(RingConfig {
        offset: 0x1_8000,
        size: RING_HEADER_SIZE + COMMAND_DATA,
        partial_write_threshold: 256,
        screen: 0,
    });
    config
}

/// Build an adapter wired to a fresh simulated host
pub fn adapter(config: TransportConfig) -> (Arc<SimHost>, GuestContext) {
    let region = Arc::new(SharedRegion::new(config.required_len() as u32));
    let host = Arc::new(SimHost::new(region.clone()));
    let ctx = GuestContext::new(config, region, host.clone(), Arc::new(StdEvents))
        .expect("adapter context");
    (host, ctx)
}

/// A command slot as the host sees it
#[derive(Clone, Copy, Debug)]
pub struct HostSlot {
    pub index: u32,
    pub offset: u32,
    pub len: u32,
}

#[derive(Default)]
struct PartialRead {
    bytes: Vec<u8>,
    consumed: u32,
}

#[derive(Default)]
struct HostState {
    enable_rc: i32,
    disable_rc: i32,
    ctl_rc: i32,
    defer: bool,
    drain_on_flush: bool,
    next_client: u32,
    kinds: Vec<u16>,
    ctl_types: Vec<u32>,
    deferred: Vec<u32>,
    notify_ring: Option<u32>,
    partial: PartialRead,
    delivered: Vec<Vec<u8>>,
}

/// In-process stand-in for the hypervisor side of the transport
pub struct SimHost {
    region: Arc<SharedRegion>,
    state: Mutex<HostState>,
}

impl SimHost {
    pub fn new(region: Arc<SharedRegion>) -> Self {
        Self {
            region,
            state: Mutex::new(HostState {
                next_client: 100,
                ..Default::default()
            }),
        }
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    /// Status returned for ring enable requests
    pub fn set_enable_rc(&self, rc: i32) {
        self.state.lock().unwrap().enable_rc = rc;
    }

    /// Status returned for ring disable requests
    pub fn set_disable_rc(&self, rc: i32) {
        self.state.lock().unwrap().disable_rc = rc;
    }

    /// Status written into command-ring control requests
    pub fn set_ctl_rc(&self, rc: i32) {
        self.state.lock().unwrap().ctl_rc = rc;
    }

    /// Complete control requests later instead of during the doorbell
    pub fn set_defer(&self, defer: bool) {
        self.state.lock().unwrap().defer = defer;
    }

    /// Consume the notification ring whenever the guest asks for a flush
    pub fn set_drain_on_flush(&self, drain: bool) {
        self.state.lock().unwrap().drain_on_flush = drain;
    }

    /// Number of calls of `kind` seen so far
    pub fn calls(&self, kind: u16) -> usize {
        self.state
            .lock()
            .unwrap()
            .kinds
            .iter()
            .filter(|k| **k == kind)
            .count()
    }

    /// Control request types seen so far
    pub fn ctl_types(&self) -> Vec<u32> {
        self.state.lock().unwrap().ctl_types.clone()
    }

    /// Buffers completed asynchronously and not yet reported
    pub fn take_deferred(&self) -> Vec<u32> {
        std::mem::take(&mut self.state.lock().unwrap().deferred)
    }

    fn load(&self, base: u32, field: u32) -> u32 {
        self.region.load_u32(base + field).unwrap()
    }

    fn store(&self, base: u32, field: u32, value: u32) {
        self.region.store_u32(base + field, value).unwrap()
    }

    /// Set or clear host event bits of the ring at `base`
    pub fn set_events(&self, base: u32, events: HostEvents, on: bool) {
        let current = HostEvents::from_bits_truncate(self.load(base, layout::HOST_EVENTS));
        let next = if on { current | events } else { current - events };
        self.store(base, layout::HOST_EVENTS, next.bits());
    }

    fn data_len(&self, base: u32) -> u32 {
        self.load(base, layout::DATA_LEN)
    }

    fn copy_ring(&self, base: u32, offset: u32, len: u32) -> Vec<u8> {
        let data_len = self.data_len(base);
        let mut out = vec![0u8; len as usize];
        let first = len.min(data_len - offset);
        self.region
            .read(base + layout::DATA + offset, &mut out[..first as usize])
            .unwrap();
        if first < len {
            self.region
                .read(base + layout::DATA, &mut out[first as usize..])
                .unwrap();
        }
        out
    }

    /// Consume notification records, including the data already written
    /// to a record that is still open
    pub fn drain_notify(&self, base: u32) {
        let mut state = self.state.lock().unwrap();
        let data_len = self.data_len(base);
        loop {
            let first = self.load(base, layout::INDEX_FIRST);
            if first == self.load(base, layout::INDEX_FREE) {
                break;
            }
            let raw = self.load(base, layout::RECORDS + first * 4);
            let len = raw & !RECORD_PARTIAL;
            let fresh = len - state.partial.consumed;
            if fresh > 0 {
                let off = self.load(base, layout::OFF_DATA);
                let bytes = self.copy_ring(base, off, fresh);
                state.partial.bytes.extend_from_slice(&bytes);
                state.partial.consumed = len;
                self.store(base, layout::OFF_DATA, (off + fresh) % data_len);
            }
            if raw & RECORD_PARTIAL != 0 {
                break;
            }
            let record = std::mem::take(&mut state.partial);
            state.delivered.push(record.bytes);
            self.store(base, layout::INDEX_FIRST, (first + 1) % MAX_RECORDS);
        }
    }

    /// Records delivered so far, oldest first
    pub fn take_records(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state.lock().unwrap().delivered)
    }

    /// Command slots between the host's read cursor and the guest's write
    /// cursor
    pub fn slots(&self, base: u32) -> Vec<HostSlot> {
        let data_len = self.data_len(base);
        let free = self.load(base, layout::INDEX_FREE);
        let mut index = self.load(base, layout::INDEX_FIRST);
        let mut offset = self.load(base, layout::OFF_DATA);
        let mut slots = Vec::new();
        while index != free {
            let raw = self.load(base, layout::RECORDS + index * 4);
            if raw & RECORD_PARTIAL != 0 {
                break;
            }
            slots.push(HostSlot {
                index,
                offset: base + layout::DATA + offset,
                len: raw,
            });
            index = (index + 1) % MAX_RECORDS;
            offset = (offset + raw) % data_len;
        }
        slots
    }

    pub fn opcode(&self, slot: &HostSlot) -> u8 {
        self.region.atomic_u8(slot.offset).unwrap().load(Ordering::Acquire)
    }

    pub fn state(&self, slot: &HostSlot) -> u8 {
        self.region
            .atomic_u8(slot.offset + 2)
            .unwrap()
            .load(Ordering::Acquire)
    }

    pub fn fence(&self, slot: &HostSlot) -> u32 {
        self.region.read_u32(slot.offset + 4).unwrap()
    }

    /// Try to move a slot from submitted to in progress
    pub fn claim(&self, slot: &HostSlot) -> bool {
        self.region
            .atomic_u8(slot.offset + 2)
            .unwrap()
            .compare_exchange(
                SlotState::Submitted as u8,
                SlotState::InProgress as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Advance the host cursors past the oldest `count` records
    pub fn retire(&self, base: u32, count: usize) {
        let data_len = self.data_len(base);
        for slot in self.slots(base).into_iter().take(count) {
            let off = self.load(base, layout::OFF_DATA);
            self.store(base, layout::OFF_DATA, (off + slot.len) % data_len);
            self.store(base, layout::INDEX_FIRST, (slot.index + 1) % MAX_RECORDS);
        }
    }

    /// Execute every pending command slot and retire it; returns the
    /// fences of the commands that actually ran
    pub fn run_commands(&self, base: u32) -> Vec<u32> {
        let slots = self.slots(base);
        let mut ran = Vec::new();
        for slot in &slots {
            if slot.len >= SLOT_HEADER_SIZE && self.opcode(slot) != opcode::NOP && self.claim(slot) {
                ran.push(self.fence(slot));
            }
        }
        self.retire(base, slots.len());
        ran
    }

    fn handle_enable(&self, state: &mut HostState, data: u32) {
        let flags = EnableFlags::from_bits_truncate(self.region.read_u32(data).unwrap());
        let ring = self.region.read_u32(data + 4).unwrap();
        let rc = if flags.contains(EnableFlags::ENABLE) {
            state.enable_rc
        } else {
            state.disable_rc
        };
        if flags.contains(EnableFlags::ENABLE) && status::succeeded(rc) {
            self.set_events(ring, HostEvents::MODE_ENABLED, true);
            state.notify_ring = Some(ring);
            state.partial = PartialRead::default();
        } else {
            self.set_events(ring, HostEvents::MODE_ENABLED, false);
        }
        self.region.write_i32(data + 8, rc).unwrap();
    }

    fn handle_ctl(&self, state: &mut HostState, offset: u32, data: u32) {
        let payload = data + SUBMIT_HEADER_SIZE;
        let kind = self.region.read_u32(payload).unwrap();
        let body = payload + 8;
        state.ctl_types.push(kind);

        match kind {
            ctl_type::ENABLE => {
                let flags = EnableFlags::from_bits_truncate(self.region.read_u32(body).unwrap());
                let ring = self.region.read_u32(body + 4).unwrap();
                self.set_events(ring, HostEvents::MODE_ENABLED, flags.contains(EnableFlags::ENABLE));
                self.region.write_i32(body + 8, status::VINF_SUCCESS).unwrap();
            }
            ctl_type::CLIENT => {
                if self.region.read_u32(body).unwrap() == client_op::CONNECT {
                    self.region.write_u32(body + 4, state.next_client).unwrap();
                    state.next_client += 1;
                }
            }
            _ => {}
        }
        self.region.write_i32(payload + 4, state.ctl_rc).unwrap();

        if state.defer {
            let flags = self.region.load_u32(data).unwrap();
            self.region
                .store_u32(data, flags | SubmitFlags::HG_ASYNC.bits())
                .unwrap();
            state.deferred.push(offset);
        }
    }
}

impl HostPort for SimHost {
    fn submit(&self, offset: u32) {
        let header = BufferHeader::read(&self.region, offset).unwrap();
        let data = offset + HEAP_HEADER_SIZE;

        let drain = {
            let mut state = self.state.lock().unwrap();
            state.kinds.push(header.kind);
            match header.kind {
                vbva_kind::ENABLE => {
                    self.handle_enable(&mut state, data);
                    None
                }
                vbva_kind::CMDVBVA_CTL => {
                    self.handle_ctl(&mut state, offset, data);
                    None
                }
                vbva_kind::FLUSH if state.drain_on_flush => state.notify_ring,
                _ => None,
            }
        };

        if let Some(ring) = drain {
            self.drain_notify(ring);
        }
    }
}

/// Condition-variable event
#[derive(Default)]
pub struct StdEvent {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl StdEvent {
    pub fn is_signalled(&self) -> bool {
        *self.signalled.lock().unwrap()
    }
}

impl CompletionEvent for StdEvent {
    fn signal(&self) {
        *self.signalled.lock().unwrap() = true;
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Option<Duration>) -> bool {
        let guard = self.signalled.lock().unwrap();
        match timeout {
            Some(limit) => {
                let (guard, _) = self
                    .cond
                    .wait_timeout_while(guard, limit, |signalled| !*signalled)
                    .unwrap();
                *guard
            }
            None => *self.cond.wait_while(guard, |signalled| !*signalled).unwrap(),
        }
    }
}

pub struct StdEvents;

impl EventFactory for StdEvents {
    fn create_event(&self) -> libvdisplay::Result<Arc<dyn CompletionEvent>> {
        Ok(Arc::new(StdEvent::default()))
    }
}

/// Records every fence event in order
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<FenceEvent>>,
}

impl RecordingNotifier {
    pub fn take(&self) -> Vec<FenceEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl FenceNotifier for RecordingNotifier {
    fn notify(&self, event: FenceEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Counts session wake-ups
#[derive(Default)]
pub struct CountingSignal(AtomicU32);

impl CountingSignal {
    pub fn count(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

impl SessionEvent for CountingSignal {
    fn signal(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}
