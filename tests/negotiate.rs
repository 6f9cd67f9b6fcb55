mod common;

use common::*;
use tactus::{AudioInfo, Channel, Direction, DriverConfig, FormatFilter, SampleFormat};

#[test]
fn single_result_carries_device_ranges_and_defaults() {
    let (mut engine, _host) = open_engine(Direction::Playback);
    let results = engine.enum_formats(1, 0, 32, None).unwrap();
    assert_eq!(results.len(), 1);

    let params = &results[0].params;
    assert_eq!(params.formats[0], SampleFormat::S16Le);
    assert!(params.formats.contains(&SampleFormat::S32Le));
    assert_eq!(params.rate.default, 48_000);
    assert_eq!((params.rate.min, params.rate.max), (8_000, 192_000));
    assert_eq!(params.channels.default, 2);
    assert_eq!((params.channels.min, params.channels.max), (1, 8));
    assert!(params.positions.is_none());
}

#[test]
fn chmap_enumeration_is_paged_and_sanitized() {
    let config = DriverConfig {
        direction: Direction::Playback,
        enumerate_chmaps: true,
        ..Default::default()
    };
    let (mut engine, _host) = open_engine_with(config);
    engine.device_mut().caps.chmaps = Some(vec![
        vec![Channel::Fl.to_native(), Channel::Fr.to_native()],
        vec![Channel::Mono.to_native()],
        // Duplicate FR and an out of range code: sanitized from the
        // 5 channel default layout.
        vec![3, 4, 4, 700, 7],
    ]);

    let first = engine.enum_formats(7, 0, 2, None).unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].params.positions.as_deref(), Some(&[Channel::Fl, Channel::Fr][..]));
    assert_eq!(first[0].params.channels.default, 2);
    assert_eq!(first[1].params.positions.as_deref(), Some(&[Channel::Mono][..]));

    // Restartable: continue from the reported cursor.
    let rest = engine.enum_formats(7, first[1].next, 2, None).unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].index, 2);
    assert_eq!(
        rest[0].params.positions.as_deref(),
        Some(&[Channel::Fl, Channel::Fr, Channel::Rl, Channel::Rr, Channel::Fc][..])
    );
}

#[test]
fn filter_narrows_or_rejects_results() {
    let (mut engine, _host) = open_engine(Direction::Playback);

    let filter = FormatFilter {
        format: Some(SampleFormat::F32Le),
        rate: Some(44_100),
        channels: Some(6),
    };
    let results = engine.enum_formats(0, 0, 32, Some(&filter)).unwrap();
    assert_eq!(results.len(), 1);
    let params = &results[0].params;
    assert_eq!(params.formats, vec![SampleFormat::F32Le]);
    assert_eq!(params.rate.default, 44_100);
    assert_eq!(params.channels.default, 6);

    let refused = FormatFilter {
        format: Some(SampleFormat::S24Be),
        ..Default::default()
    };
    assert!(engine.enum_formats(0, 0, 32, Some(&refused)).unwrap().is_empty());

    let out_of_range = FormatFilter {
        rate: Some(1_000_000),
        ..Default::default()
    };
    assert!(engine
        .enum_formats(0, 0, 32, Some(&out_of_range))
        .unwrap()
        .is_empty());
}

#[test]
fn unknown_format_is_rejected_at_set_format() {
    let (mut engine, _host) = open_engine(Direction::Playback);
    let mut info = AudioInfo {
        format: SampleFormat::Unknown,
        rate: 48_000,
        channels: 2,
    };
    assert!(engine.set_format(&mut info, true).is_err());
}

#[test]
fn session_parameters_match_the_negotiated_echo() {
    let (mut engine, _host) = open_engine(Direction::Playback);
    engine.device_mut().caps.channels_max = 2;

    let mut info = AudioInfo {
        format: SampleFormat::S32Le,
        rate: 48_000,
        channels: 6,
    };
    engine.set_format(&mut info, true).unwrap();
    assert_eq!(info.channels, 2);
    assert_eq!(engine.audio_info(), Some(info));

    // A second negotiation with the echoed values is exact.
    let mut again = info;
    engine.set_format(&mut again, false).unwrap();
    assert_eq!(again, info);
    assert_eq!(engine.audio_info(), Some(info));
}
