mod common;

use common::*;
use std::sync::Arc;
use tactus::cell::LoopCell;
use tactus::clock::{ClockRecord, TimelinePosition};
use tactus::{Direction, EngineState};

const THRESHOLD: u64 = 1024;

fn slaved_engine() -> (
    tactus::Engine<tactus::mock::MockBackend>,
    Host,
    Arc<LoopCell<TimelinePosition>>,
) {
    let (mut engine, host) = configured_engine(Direction::Playback);

    let clock = Arc::new(LoopCell::new(ClockRecord { id: 2, ..Default::default() }));
    let position = Arc::new(LoopCell::new(TimelinePosition {
        size: THRESHOLD as u32,
        clock: ClockRecord { id: 1, ..Default::default() },
    }));
    engine.set_clock(clock);
    engine.set_position(position.clone());

    let mut buffers = Vec::new();
    for id in 0..2 {
        let (b, _) = pattern_buffer(id, THRESHOLD as usize, id as u8);
        buffers.push(b);
    }
    engine.attach_buffers(buffers).unwrap();
    (engine, host, position)
}

#[test]
fn foreign_clock_id_puts_the_engine_in_slaved_mode() {
    let (mut engine, _host, _position) = slaved_engine();
    engine.start().unwrap();

    assert!(engine.is_slaved());
    assert_eq!(engine.state(), EngineState::Running);
    // Slaved engines never arm the wake timer.
    assert!(engine.timer().armed.is_empty());
}

#[test]
fn slaved_dll_converges_onto_the_local_device_rate() {
    let (mut engine, _host, position) = slaved_engine();
    engine.start().unwrap();

    // The master advances one quantum per cycle; the local device consumes
    // one extra frame per quantum, so it runs 1024/1023 fast against the
    // nominal rate. Three seconds of cycles is enough to settle.
    let (_, chunk) = pattern_buffer(0, THRESHOLD as usize, 0);
    for cycle in 1..=160u64 {
        position.get().clock.position = (cycle * THRESHOLD) as i64;
        engine.device_mut().advance_hw(THRESHOLD + 1);
        let id = (cycle % 2) as u32;
        engine.submit_buffer(id, chunk).unwrap();
        engine.process().unwrap();
    }

    let expected = 1023.0 / 1024.0;
    let dt = engine.rate_diff();
    assert!((dt - 1.0).abs() < 0.005, "dt = {dt}");
    assert!((dt - expected).abs() < 5e-4, "dt = {dt} expected {expected}");
}

#[test]
fn published_rate_diff_stays_clamped() {
    let (mut engine, _host, position) = slaved_engine();
    let clock = Arc::new(LoopCell::new(ClockRecord { id: 2, ..Default::default() }));
    engine.set_clock(clock.clone());
    engine.start().unwrap();

    // A wildly jumping master must not push the published ratio outside
    // the clamp window.
    let (_, chunk) = pattern_buffer(0, THRESHOLD as usize, 0);
    let jumps = [1u64, 5, 2, 40, 3, 90, 4, 7];
    let mut master = 0u64;
    for (cycle, jump) in jumps.iter().enumerate() {
        master += THRESHOLD * jump;
        position.get().clock.position = master as i64;
        engine.device_mut().advance_hw(THRESHOLD);
        engine.submit_buffer((cycle % 2) as u32, chunk).unwrap();
        engine.process().unwrap();

        let published = clock.get().rate_diff;
        assert!((0.95..=1.05).contains(&published), "rate_diff {published}");
    }
}

#[test]
fn runaway_local_queue_is_rewound_by_one_threshold() {
    let (mut engine, _host, position) = slaved_engine();
    engine.start().unwrap();

    // Priming put two thresholds in the queue; one more submit without any
    // device progress pushes the depth past the rewind limit.
    let (_, chunk) = pattern_buffer(0, THRESHOLD as usize, 0);
    engine.submit_buffer(0, chunk).unwrap();
    engine.process().unwrap();

    position.get().clock.position = THRESHOLD as i64;
    engine.submit_buffer(1, chunk).unwrap();
    engine.process().unwrap();

    assert_eq!(engine.device().rewinds, vec![THRESHOLD]);
}
