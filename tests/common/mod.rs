#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use tactus::clock::IoStatus;
use tactus::engine::{Engine, HostEvents};
use tactus::mock::MockBackend;
use tactus::{AudioInfo, Buffer, Chunk, Direction, DriverConfig, Error, SampleFormat};

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Ready(IoStatus),
    Reuse(u32),
    Fault(String),
}

#[derive(Clone, Default)]
pub struct Host {
    events: Arc<Mutex<Vec<Event>>>,
}

impl Host {
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, wanted: &Event) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| *e == wanted)
            .count()
    }
}

impl HostEvents for Host {
    fn ready(&mut self, status: IoStatus) {
        self.events.lock().unwrap().push(Event::Ready(status));
    }

    fn reuse_buffer(&mut self, _port: u32, id: u32) {
        self.events.lock().unwrap().push(Event::Reuse(id));
    }

    fn on_error(&mut self, error: &Error) {
        self.events.lock().unwrap().push(Event::Fault(error.to_string()));
    }
}

pub fn open_engine(direction: Direction) -> (Engine<MockBackend>, Host) {
    let config = DriverConfig { direction, ..Default::default() };
    open_engine_with(config)
}

pub fn open_engine_with(config: DriverConfig) -> (Engine<MockBackend>, Host) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let host = Host::default();
    let engine = Engine::<MockBackend>::open(config, Box::new(host.clone())).unwrap();
    (engine, host)
}

/// Engine with 48 kHz stereo S16 negotiated: 4 byte frames, 8192 frame ring,
/// 1024 frame threshold.
pub fn configured_engine(direction: Direction) -> (Engine<MockBackend>, Host) {
    let (mut engine, host) = open_engine(direction);
    let mut info = AudioInfo {
        format: SampleFormat::S16Le,
        rate: 48_000,
        channels: 2,
    };
    engine.set_format(&mut info, true).unwrap();
    (engine, host)
}

pub const FRAME_SIZE: usize = 4;

pub fn pattern_bytes(frames: usize, seed: u8) -> Vec<u8> {
    (0..frames * FRAME_SIZE)
        .map(|i| seed.wrapping_add(i as u8))
        .collect()
}

pub fn pattern_buffer(id: u32, frames: usize, seed: u8) -> (Buffer, Chunk) {
    let bytes = pattern_bytes(frames, seed);
    let chunk = Chunk {
        offset: 0,
        size: bytes.len() as u32,
        stride: FRAME_SIZE as u32,
    };
    (Buffer::with_data(id, bytes), chunk)
}
