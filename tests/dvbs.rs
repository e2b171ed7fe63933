mod common;

use dvbdemod::{
    packet::MPEG_SYNC,
    settings::{CodeRate, Modulation, Settings, Standard},
    sink::ChannelSink,
    Demodulator, Event, Report, Source,
};

const SYMBOL_RATE: u32 = 1_000_000;

fn demodulate(settings: Settings, signal: &[dvbdemod::Sample]) -> (Vec<dvbdemod::packet::TsPacket>, Vec<Event>) {
    let mut demod = Demodulator::new(2.0 * f64::from(SYMBOL_RATE));
    demod.apply_settings(settings, false).unwrap();
    let (sink, packets) = ChannelSink::new(4096);
    demod.add_sink(Box::new(sink));
    let events = demod.subscribe();

    for chunk in signal.chunks(10_000) {
        demod.feed(chunk);
    }
    demod.flush();
    (packets.try_iter().collect(), events.try_iter().collect())
}

#[test]
fn qpsk_half_rate_to_transport_stream() {
    let sent = common::ts_packets(200, 1);
    let symbols = common::dvbs_symbols(&sent, Modulation::Qpsk, CodeRate::Fec12);
    let signal = common::modulate(&symbols, 0.0, 0.01, 2);

    let settings = Settings::builder()
        .standard(Standard::DvbS)
        .symbol_rate(SYMBOL_RATE)
        .modulation(Modulation::Qpsk)
        .code_rate(CodeRate::Fec12)
        .build();
    let (received, events) = demodulate(settings, &signal);

    assert!(events.contains(&Event::Report(Report::Lock {
        source: Source::MpegSync,
        locked: true
    })));
    assert!(received.len() > 100, "only {} packets", received.len());
    assert!(received.iter().all(|p| p.sync() == MPEG_SYNC && !p.tei()));

    // what comes out is a contiguous run of what went in
    let first = sent
        .iter()
        .position(|p| *p == received[0])
        .expect("first packet not transmitted");
    for (got, want) in received.iter().zip(&sent[first..]) {
        assert_eq!(got, want);
    }
}

#[test]
fn viterbi_with_carrier_offset() {
    let sent = common::ts_packets(200, 3);
    let symbols = common::dvbs_symbols(&sent, Modulation::Qpsk, CodeRate::Fec34);
    // 2 kHz at 2 MS/s
    let signal = common::modulate(&symbols, 0.001, 0.02, 4);

    let settings = Settings::builder()
        .standard(Standard::DvbS)
        .symbol_rate(SYMBOL_RATE)
        .code_rate(CodeRate::Fec34)
        .viterbi(true)
        .build();
    let (received, events) = demodulate(settings, &signal);

    assert!(events.iter().any(|e| matches!(
        e,
        Event::Report(Report::Lock {
            source: Source::MpegSync,
            locked: true
        })
    )));
    assert!(received.len() > 100, "only {} packets", received.len());
    assert!(received.iter().all(|p| sent.contains(p)));
}

#[test]
fn noise_only_produces_nothing() {
    let signal = common::modulate(&vec![dvbdemod::Sample::default(); 100_000], 0.0, 0.3, 5);
    let (received, events) = demodulate(Settings::default(), &signal);
    assert!(received.is_empty());
    assert!(!events.contains(&Event::Report(Report::Lock {
        source: Source::MpegSync,
        locked: true
    })));
}

#[test]
fn forced_rebuild_mid_stream_discards_old_graph_output() {
    let sent = common::ts_packets(400, 11);
    let symbols = common::dvbs_symbols(&sent, Modulation::Qpsk, CodeRate::Fec12);
    let signal = common::modulate(&symbols, 0.0, 0.01, 12);
    // 12 interleaver branches of up to 17 * 11 bytes, 16 samples per byte at QPSK 1/2
    let deinterleaver_span = (17 * 11 * 12 + 204) * 16;

    let settings = Settings::builder()
        .standard(Standard::DvbS)
        .symbol_rate(SYMBOL_RATE)
        .modulation(Modulation::Qpsk)
        .code_rate(CodeRate::Fec12)
        .build();
    let mut demod = Demodulator::new(2.0 * f64::from(SYMBOL_RATE));
    demod.apply_settings(settings.clone(), false).unwrap();
    let (sink, packets) = ChannelSink::new(4096);
    demod.add_sink(Box::new(sink));
    let events = demod.subscribe();

    let mut chunks = signal.chunks(10_000);
    let mut before = 0;
    for chunk in chunks.by_ref() {
        demod.feed(chunk);
        before += packets.try_iter().count();
        if before >= 20 {
            break;
        }
    }
    assert!(before >= 20, "never locked before the rebuild");
    events.try_iter().for_each(drop);

    let generation = demod.generation();
    demod.apply_settings(settings, true).unwrap();
    assert!(demod.generation() > generation);

    // nothing until the new graph has filled its deinterleaver
    let short = deinterleaver_span / 10_000;
    assert!(short > 0);
    for chunk in chunks.by_ref().take(short) {
        demod.feed(chunk);
    }
    assert_eq!(packets.try_iter().count(), 0);

    let mut locked = false;
    let mut after = Vec::new();
    for chunk in chunks {
        demod.feed(chunk);
        locked |= events.try_iter().any(|e| {
            e == Event::Report(Report::Lock {
                source: Source::MpegSync,
                locked: true,
            })
        });
        let got: Vec<_> = packets.try_iter().collect();
        assert!(got.is_empty() || locked, "packets before the new graph locked");
        after.extend(got);
    }
    assert!(after.len() > 100, "only {} packets after the rebuild", after.len());
    assert!(after.iter().all(|p| sent.contains(p)));
}
