mod common;

use dvbdemod::{
    dvbs2::Pls,
    packet::{TsPacket, MPEG_SYNC},
    settings::{CodeRate, Modulation, Settings, Standard},
    sink::ChannelSink,
    DemodState, Demodulator, Event, Report, Sample, Source,
};

const SYMBOL_RATE: u32 = 1_000_000;
const CHUNK: usize = 8192;

fn settings() -> Settings {
    Settings::builder()
        .standard(Standard::DvbS2)
        .symbol_rate(SYMBOL_RATE)
        .modulation(Modulation::Qpsk)
        .code_rate(CodeRate::Fec12)
        .build()
}

struct Run {
    demod: Demodulator,
    packets: Vec<TsPacket>,
    events: Vec<Event>,
}

fn demodulate(signal: &[Sample]) -> Run {
    let mut demod = Demodulator::new(2.0 * f64::from(SYMBOL_RATE));
    demod.apply_settings(settings(), false).unwrap();
    let (sink, packets) = ChannelSink::new(8192);
    demod.add_sink(Box::new(sink));
    let events = demod.subscribe();

    for chunk in signal.chunks(CHUNK) {
        demod.feed(chunk);
    }
    demod.flush();
    Run {
        packets: packets.try_iter().collect(),
        events: events.try_iter().collect(),
        demod,
    }
}

#[test]
fn qpsk_short_frames_to_transport_stream() {
    let sent = common::ts_packets(120, 7);
    let (symbols, frames) = common::dvbs2_symbols(&sent, Pls::new(4, true, true));
    assert!(frames > 20);
    let signal = common::modulate(&symbols, 0.002, 0.02, 8);

    let run = demodulate(&signal);

    assert!(run.events.contains(&Event::Report(Report::Lock {
        source: Source::PlFrame,
        locked: true
    })));
    assert!(run.events.iter().any(|e| matches!(
        e,
        Event::Report(Report::Fec {
            source: Source::Ldpc,
            counters
        }) if counters.integrity.ok()
    )));
    assert!(run.packets.len() > 40, "only {} packets", run.packets.len());
    assert!(run.packets.iter().all(|p| p.sync() == MPEG_SYNC && !p.tei()));
    let first = sent
        .iter()
        .position(|p| *p == run.packets[0])
        .expect("first packet not transmitted");
    for (got, want) in run.packets.iter().zip(&sent[first..]) {
        assert_eq!(got, want);
    }
    assert_eq!(run.demod.generation(), 1);
}

#[test]
fn modcod_change_is_reported_once_and_adopted() {
    let sent = common::ts_packets(300, 9);
    let (mut symbols, _) = common::dvbs2_symbols(&sent[..60], Pls::new(4, true, true));
    let (more, _) = common::dvbs2_symbols(&sent[60..], Pls::new(14, true, true));
    symbols.extend(more);
    let signal = common::modulate(&symbols, 0.0, 0.01, 10);

    let run = demodulate(&signal);

    let modcods: Vec<(Modulation, CodeRate)> = run
        .events
        .iter()
        .filter_map(|e| match e {
            Event::Modcod(m) => Some((m.modulation, m.code_rate)),
            _ => None,
        })
        .collect();
    assert_eq!(
        modcods,
        vec![
            (Modulation::Qpsk, CodeRate::Fec12),
            (Modulation::Psk8, CodeRate::Fec34)
        ]
    );

    assert_eq!(run.demod.generation(), 2);
    assert_eq!(run.demod.state(), DemodState::Ready(Standard::DvbS2));
    let settings = run.demod.settings().unwrap();
    assert_eq!(settings.modulation, Modulation::Psk8);
    assert_eq!(settings.code_rate, CodeRate::Fec34);
    assert!(run.demod.live_adaptation().set_by_modcod);

    // the rebuilt graph decodes the 8PSK frames
    let late = &sent[200..];
    assert!(run.packets.iter().any(|p| late.contains(p)));
}
