mod common;

use common::*;
use std::sync::Arc;
use tactus::cell::LoopCell;
use tactus::clock::{IoSlot, IoStatus, NSEC_PER_SEC};
use tactus::pool::Buffer;
use tactus::{Direction, EngineState, PcmDevice};

const THRESHOLD: u64 = 1024;
const RATE: u64 = 48_000;

fn capture_buffers(n: u32) -> Vec<Buffer> {
    (0..n).map(|id| Buffer::new(id, 1024 * FRAME_SIZE)).collect()
}

#[test]
fn lagging_device_is_drained_one_threshold_per_tick() {
    let (mut engine, host) = configured_engine(Direction::Capture);
    engine.attach_buffers(capture_buffers(4)).unwrap();
    engine.start().unwrap();
    assert_eq!(engine.device().start_count, 1);

    // Fill a known pattern, then let avail grow to three thresholds before
    // the first tick.
    let bytes = pattern_bytes(3 * THRESHOLD as usize, 0x33);
    engine.device_mut().ring()[..bytes.len()].copy_from_slice(&bytes);
    engine.device_mut().advance_hw(3 * THRESHOLD);

    let now = 70_000_000u64;
    engine.timer_mut().set_now(now);
    engine.handle_timeout();

    // Exactly one threshold was consumed, not everything available.
    assert_eq!(engine.samples_produced(), THRESHOLD);
    assert_eq!(engine.device().commits, vec![(0, THRESHOLD)]);
    assert_eq!(host.count(&Event::Ready(IoStatus::HaveBuffer)), 1);

    // With a two threshold backlog left, the next deadline is in the past
    // so the backlog drains quickly.
    let expected = now - (2 * THRESHOLD - THRESHOLD) * NSEC_PER_SEC / RATE;
    let got = engine.next_time();
    assert!(
        (got as i64 - expected as i64).abs() < 1_000_000,
        "next_time {got} expected around {expected}"
    );
}

#[test]
fn captured_buffers_carry_sequence_and_timestamp() {
    let (mut engine, _host) = configured_engine(Direction::Capture);
    let io = Arc::new(LoopCell::new(IoSlot::default()));
    engine.set_io(io.clone());
    engine.attach_buffers(capture_buffers(2)).unwrap();
    engine.start().unwrap();

    let pattern = pattern_bytes(THRESHOLD as usize, 0x7a);
    engine.device_mut().ring()[..pattern.len()].copy_from_slice(&pattern);
    engine.device_mut().advance_hw(THRESHOLD);

    let now = 21_333_333u64;
    engine.timer_mut().set_now(now);
    engine.handle_timeout();

    let slot = *io.get();
    assert_eq!(slot.status, IoStatus::HaveBuffer);
    assert_eq!(slot.buffer_id, Some(0));

    let header = engine.buffer_header(0).unwrap();
    assert_eq!(header.seq, 0);
    assert_eq!(header.pts, now);
    assert_eq!(header.dts_offset, 0);
    assert_eq!(
        &engine.buffer_bytes(0).unwrap()[..pattern.len()],
        &pattern[..]
    );

    // Io slot still occupied: the next capture parks on the ready queue.
    engine.device_mut().advance_hw(THRESHOLD);
    engine.timer_mut().set_now(now * 2);
    engine.handle_timeout();
    assert_eq!(engine.samples_produced(), 2 * THRESHOLD);
    assert_eq!(engine.dequeue_ready(), Some(1));
}

#[test]
fn capture_early_wakeup_waits_for_a_full_threshold() {
    let (mut engine, host) = configured_engine(Direction::Capture);
    engine.attach_buffers(capture_buffers(2)).unwrap();
    engine.start().unwrap();

    engine.device_mut().advance_hw(THRESHOLD / 2);
    let now = 5_000_000u64;
    engine.timer_mut().set_now(now);
    engine.handle_timeout();

    assert_eq!(engine.samples_produced(), 0);
    assert_eq!(host.count(&Event::Ready(IoStatus::HaveBuffer)), 0);
    let expected = now + (THRESHOLD - THRESHOLD / 2) * NSEC_PER_SEC / RATE;
    assert_eq!(engine.timer().last_deadline(), Some(expected));

    // At exactly one threshold the guard no longer fires.
    engine.device_mut().advance_hw(THRESHOLD / 2);
    engine.timer_mut().set_now(expected);
    engine.handle_timeout();
    assert_eq!(engine.samples_produced(), THRESHOLD);
}

#[test]
fn exhausted_free_list_drops_frames_but_keeps_the_clock_running() {
    let (mut engine, host) = configured_engine(Direction::Capture);
    engine.attach_buffers(capture_buffers(1)).unwrap();
    engine.start().unwrap();

    engine.device_mut().advance_hw(2 * THRESHOLD);
    engine.timer_mut().set_now(21_333_333);
    engine.handle_timeout();
    assert_eq!(engine.samples_produced(), THRESHOLD);
    assert_eq!(host.count(&Event::Ready(IoStatus::HaveBuffer)), 1);

    // No free descriptor left: the tick drops a threshold instead of
    // stalling, and no buffer event is emitted.
    engine.timer_mut().set_now(42_666_666);
    engine.handle_timeout();
    assert_eq!(engine.samples_produced(), 2 * THRESHOLD);
    assert_eq!(host.count(&Event::Ready(IoStatus::HaveBuffer)), 1);
    assert_eq!(engine.state(), EngineState::Running);
}
