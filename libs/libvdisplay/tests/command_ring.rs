//! Command ring tests
//!
//! Fences, wrap fillers, preemption and the slot-state handshake with the
//! simulated host.

mod common;

use std::sync::{Arc, Barrier};

use common::{adapter, test_config, RecordingNotifier, SimHost, COMMAND_DATA};
use libvdisplay::cmdring::{opcode, SlotState, SLOT_HEADER_SIZE};
use libvdisplay::control::ctl_type;
use libvdisplay::host::vbva_kind;
use libvdisplay::{CommandRing, Error, FenceEvent, GuestContext, HostEvents};

struct Fixture {
    host: Arc<SimHost>,
    ctx: GuestContext,
    notifier: Arc<RecordingNotifier>,
    ring: CommandRing,
}

fn fixture() -> Fixture {
    let (host, ctx) = adapter(test_config());
    let notifier = Arc::new(RecordingNotifier::default());
    let ring = ctx.command_ring(notifier.clone()).unwrap();
    ring.enable(&ctx).unwrap();
    Fixture {
        host,
        ctx,
        notifier,
        ring,
    }
}

impl Fixture {
    fn base(&self) -> u32 {
        self.ring.ring().base()
    }

    fn submit(&self, fence: u32, payload_len: usize) {
        let payload = vec![fence as u8; payload_len];
        self.ring
            .submit(&self.ctx, opcode::BLT, 0, &payload, fence)
            .unwrap();
    }
}

#[test]
fn test_enable_goes_through_control_call() {
    let f = fixture();
    assert_eq!(f.host.ctl_types(), vec![ctl_type::ENABLE]);
    assert!(f.ring.ring().is_enabled());

    f.ring.disable(&f.ctx).unwrap();
    f.ring.disable(&f.ctx).unwrap();
    assert_eq!(f.host.ctl_types(), vec![ctl_type::ENABLE, ctl_type::ENABLE]);
    assert!(!f.ring.ring().is_enabled());
}

#[test]
fn test_fences_complete_in_order() {
    let f = fixture();
    f.submit(1, 32);
    f.submit(2, 32);

    assert_eq!(f.ring.fences().submitted, 2);
    assert_eq!(f.host.calls(vbva_kind::CMDVBVA_SUBMIT), 2);
    assert_eq!(f.ctx.stats().snapshot().doorbells, 2);

    assert_eq!(f.host.run_commands(f.base()), vec![1, 2]);
    assert!(f.ring.check_completed(&f.ctx, false).unwrap());

    assert_eq!(
        f.notifier.take(),
        vec![
            FenceEvent::Completed { fence: 1 },
            FenceEvent::Completed { fence: 2 },
        ]
    );
    let fences = f.ring.fences();
    assert_eq!(fences.completed, 2);
    assert_eq!(fences.processed, 2);

    // Nothing new to retire
    assert!(!f.ring.check_completed(&f.ctx, true).unwrap());
    assert_eq!(f.host.calls(vbva_kind::CMDVBVA_FLUSH), 1);
}

#[test]
fn test_no_doorbell_while_host_processing() {
    let f = fixture();
    f.host
        .set_events(f.base(), HostEvents::STATE_PROCESSING, true);

    f.submit(1, 16);
    assert_eq!(f.host.calls(vbva_kind::CMDVBVA_SUBMIT), 0);

    f.host
        .set_events(f.base(), HostEvents::STATE_PROCESSING, false);
    f.submit(2, 16);
    assert_eq!(f.host.calls(vbva_kind::CMDVBVA_SUBMIT), 1);
}

#[test]
fn test_filler_wraps_slot_to_start() {
    let f = fixture();
    assert_eq!(f.ring.ring().capacity(), COMMAND_DATA);

    // 600 + 300 bytes, both retired by the guest
    f.submit(1, 600 - SLOT_HEADER_SIZE as usize);
    f.submit(2, 300 - SLOT_HEADER_SIZE as usize);
    assert_eq!(f.host.run_commands(f.base()), vec![1, 2]);
    f.ring.process_completed().unwrap();
    f.notifier.take();

    // 208 bytes do not fit in the 124-byte tail
    f.submit(3, 200);

    let slots = f.host.slots(f.base());
    assert_eq!(slots.len(), 2);
    let data_base = f.ring.ring().data_base();

    assert_eq!(slots[0].offset, data_base + 900);
    assert_eq!(slots[0].len, 124);
    assert_eq!(f.host.opcode(&slots[0]), opcode::NOP);

    assert_eq!(slots[1].offset, data_base);
    assert_eq!(slots[1].len, 208);
    assert_eq!(f.host.opcode(&slots[1]), opcode::BLT);
    assert_eq!(f.host.fence(&slots[1]), 3);

    // The filler is never reported
    assert_eq!(f.host.run_commands(f.base()), vec![3]);
    f.ring.process_completed().unwrap();
    assert_eq!(f.notifier.take(), vec![FenceEvent::Completed { fence: 3 }]);
}

#[test]
fn test_oversized_command_rejected() {
    let f = fixture();
    assert!(matches!(
        f.ring.lock_for_submit(&f.ctx, COMMAND_DATA),
        Err(Error::ResourceExhausted)
    ));
}

#[test]
fn test_ring_full_until_completion() {
    let f = fixture();
    f.submit(1, 400);
    f.submit(2, 400);

    // Host has not finished anything; the flush finds nothing to retire
    assert!(matches!(
        f.ring.lock_for_submit(&f.ctx, 400),
        Err(Error::ResourceExhausted)
    ));

    f.host.run_commands(f.base());
    f.ring.process_completed().unwrap();
    f.submit(3, 400);
}

#[test]
fn test_dropped_slot_becomes_noop() {
    let f = fixture();
    {
        let mut slot = f.ring.lock_for_submit(&f.ctx, 16).unwrap();
        slot.write_payload(0, &[0xaa; 16]).unwrap();
        assert!(slot.write_payload(8, &[0; 16]).is_err());
    }

    let slots = f.host.slots(f.base());
    assert_eq!(slots.len(), 1);
    assert_eq!(f.host.opcode(&slots[0]), opcode::NOP);

    assert!(f.host.run_commands(f.base()).is_empty());
    assert!(!f.ring.process_completed().unwrap());
    assert!(f.notifier.take().is_empty());
}

#[test]
fn test_preempt_idle_reports_immediately() {
    let f = fixture();
    assert_eq!(f.ring.preempt(&f.ctx, 7).unwrap(), None);
    assert_eq!(
        f.notifier.take(),
        vec![FenceEvent::Preempted {
            preempt_fence: 7,
            last_completed: 0,
        }]
    );
    assert_eq!(f.ctx.stats().snapshot().preemptions, 1);
}

#[test]
fn test_preempt_waits_for_in_flight_command() {
    let f = fixture();
    f.submit(1, 16);
    f.submit(2, 16);
    f.submit(3, 16);

    let slots = f.host.slots(f.base());
    assert!(f.host.claim(&slots[0]));

    assert_eq!(f.ring.preempt(&f.ctx, 100).unwrap(), Some(1));
    assert_eq!(f.ring.pending_preemptions(), 1);
    assert!(f.notifier.take().is_empty());

    assert_eq!(f.host.state(&slots[1]), SlotState::Cancelled as u8);
    assert_eq!(f.host.state(&slots[2]), SlotState::Cancelled as u8);
    assert!(!f.host.claim(&slots[1]));

    f.host.retire(f.base(), 3);
    f.ring.process_completed().unwrap();

    assert_eq!(
        f.notifier.take(),
        vec![
            FenceEvent::Completed { fence: 1 },
            FenceEvent::Preempted {
                preempt_fence: 100,
                last_completed: 1,
            },
        ]
    );
    let fences = f.ring.fences();
    assert_eq!(fences.completed, 1);
    assert_eq!(fences.processed, 3);
    assert_eq!(f.ring.pending_preemptions(), 0);
}

#[test]
fn test_preempt_after_host_finished_reports_at_once() {
    let f = fixture();
    f.submit(1, 16);
    f.host.run_commands(f.base());
    f.ring.process_completed().unwrap();
    f.notifier.take();

    // The completed slot is no longer walked
    assert_eq!(f.ring.preempt(&f.ctx, 9).unwrap(), None);
    assert_eq!(
        f.notifier.take(),
        vec![FenceEvent::Preempted {
            preempt_fence: 9,
            last_completed: 1,
        }]
    );
}

#[test]
fn test_preempt_races_host_claims() {
    const COMMANDS: u32 = 24;

    let f = fixture();
    for fence in 1..=COMMANDS {
        f.submit(fence, 16);
    }
    let slots = f.host.slots(f.base());
    assert_eq!(slots.len(), COMMANDS as usize);

    let base = f.base();
    let in_flight = std::thread::scope(|scope| {
        let host = f.host.clone();
        let claimer = scope.spawn(move || {
            let slots = host.slots(base);
            for slot in &slots {
                if !host.claim(slot) {
                    break;
                }
            }
        });
        let in_flight = f.ring.preempt(&f.ctx, 1000).unwrap();
        claimer.join().unwrap();
        in_flight
    });

    // Every slot was claimed by exactly one side, claimed ones first
    let states: Vec<u8> = slots.iter().map(|slot| f.host.state(slot)).collect();
    let claimed = states
        .iter()
        .take_while(|s| **s == SlotState::InProgress as u8)
        .count();
    assert!(states[claimed..]
        .iter()
        .all(|s| *s == SlotState::Cancelled as u8));

    match in_flight {
        Some(fence) => assert_eq!(fence as usize, claimed),
        None => assert_eq!(claimed, 0),
    }
}

#[test]
fn test_concurrent_completion_reports_each_fence_once() {
    const ROUNDS: u32 = 200;

    let f = fixture();
    let base = f.base();
    for fence in 1..=ROUNDS {
        f.submit(fence, 16);
        assert_eq!(f.host.run_commands(base), vec![fence]);

        let barrier = Barrier::new(2);
        std::thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(|| {
                    barrier.wait();
                    f.ring.process_completed().unwrap();
                });
            }
        });
    }

    let expected: Vec<FenceEvent> = (1..=ROUNDS)
        .map(|fence| FenceEvent::Completed { fence })
        .collect();
    assert_eq!(f.notifier.take(), expected);
    assert_eq!(f.ring.fences().completed, ROUNDS);
}

#[test]
fn test_unexpected_state_breaks_ring() {
    let f = fixture();
    f.submit(1, 16);

    // Retired without being claimed or cancelled
    f.host.retire(f.base(), 1);
    assert!(matches!(
        f.ring.process_completed(),
        Err(Error::ProtocolViolation(_))
    ));
    assert!(f.ring.ring().is_broken());

    assert!(matches!(
        f.ring.lock_for_submit(&f.ctx, 16),
        Err(Error::ProtocolViolation(_))
    ));
    assert!(matches!(
        f.ring.preempt(&f.ctx, 5),
        Err(Error::ProtocolViolation(_))
    ));

    // Re-enabling resets the ring
    f.ring.enable(&f.ctx).unwrap();
    assert!(!f.ring.ring().is_broken());
    f.submit(2, 16);
}
