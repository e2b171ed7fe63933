//! Transmit side simulation shared by the integration tests.
#![allow(dead_code)]

use dvbdemod::{
    constellation::Constellation,
    dsp::{expj, root_raised_cosine},
    dvbs::{
        convolutional::{bits_to_labels, puncture_spec, ConvolutionalEncoder},
        interleaver::Interleaver,
        randomizer::randomize,
        reed_solomon::ReedSolomon,
    },
    dvbs2::{
        deframer::BbFramer,
        deinterleaver::interleave,
        fecdec::OuterDecoder,
        ldpc::{GeneratedCodebook, LdpcCode},
        modcod::FrameFormat,
        plheader::{header_symbols, pl_scrambling, scramble, PILOT},
        Pls, PILOT_LEN, SLOTS_PER_PILOT, SLOT_LEN,
    },
    packet::{RsPacket, TsPacket, MPEG_SYNC, RS_PACKET_LEN, TS_PACKET_LEN},
    settings::{CodeRate, Modulation},
    Sample,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

pub const ROLLOFF: f32 = 0.35;

/// Transport stream packets on PID 0x100 with a running continuity counter and random payload.
pub fn ts_packets(count: usize, seed: u64) -> Vec<TsPacket> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|i| {
            let mut p = TsPacket::default();
            p.0[0] = MPEG_SYNC;
            p.0[1] = 0x01;
            p.0[2] = 0x00;
            p.0[3] = 0x10 | (i & 0x0f) as u8;
            rng.fill(&mut p.0[4..]);
            p
        })
        .collect()
}

/// DVB-S symbols carrying `packets`: energy dispersal, RS(204,188), convolutional interleaving
/// and punctured convolutional coding.
pub fn dvbs_symbols(packets: &[TsPacket], modulation: Modulation, rate: CodeRate) -> Vec<Sample> {
    let mut packets = packets.to_vec();
    randomize(&mut packets);
    let rs = ReedSolomon::new();
    let mut interleaver = Interleaver::new();
    let mut bytes = Vec::with_capacity(packets.len() * RS_PACKET_LEN);
    for p in &packets {
        let mut block = [0u8; RS_PACKET_LEN];
        block[..TS_PACKET_LEN].copy_from_slice(&p.0);
        rs.encode(&mut block);
        bytes.extend(interleaver.interleave(&RsPacket(block)));
    }
    let constellation = Constellation::new(modulation).unwrap();
    let bps = constellation.bits_per_symbol();
    let spec = puncture_spec(rate, bps).unwrap();
    let bits = ConvolutionalEncoder::new(spec).encode(&bytes);
    bits_to_labels(&bits, bps)
        .into_iter()
        .map(|l| constellation.point(l))
        .collect()
}

/// DVB-S2 PL frames carrying `packets`, one MODCOD for all of them.
///
/// Returns the symbols and the number of frames.
pub fn dvbs2_symbols(packets: &[TsPacket], pls: Pls) -> (Vec<Sample>, usize) {
    let format = FrameFormat::new(pls).unwrap();
    let ldpc = LdpcCode::new(&GeneratedCodebook, format.modcod.code_rate, pls.short_frames).unwrap();
    let constellation = format.modcod.constellation();
    let mut outer = OuterDecoder::default();
    let mut framer = BbFramer::new(format.fec.kbch);
    let rn = pl_scrambling(format.payload_symbols());

    let mut out = Vec::new();
    let mut frames = 0;
    for p in packets {
        framer.push(p);
        while let Some(bbframe) = framer.next_frame() {
            let bits = outer.encode(&format, &ldpc, &bbframe);
            let labels = interleave(&format, &bits);
            out.extend(header_symbols(pls));
            let mut data = labels.iter().map(|l| constellation.point(*l));
            let mut n = 0;
            for slot in 0..format.slots {
                if pls.pilots && slot > 0 && slot % SLOTS_PER_PILOT == 0 {
                    for _ in 0..PILOT_LEN {
                        out.push(scramble(PILOT, rn[n]));
                        n += 1;
                    }
                }
                for _ in 0..SLOT_LEN {
                    let s = data.next().unwrap_or_default();
                    out.push(scramble(s, rn[n]));
                    n += 1;
                }
            }
            frames += 1;
        }
    }
    (out, frames)
}

/// Two samples per symbol through a root raised cosine filter, then a carrier offset of `freq`
/// cycles per sample and white noise of standard deviation `noise` per component.
pub fn modulate(symbols: &[Sample], freq: f32, noise: f32, seed: u64) -> Vec<Sample> {
    let taps = root_raised_cosine(64, 0.5, ROLLOFF);
    let mut upsampled = vec![Sample::default(); symbols.len() * 2 + taps.len()];
    for (i, s) in symbols.iter().enumerate() {
        upsampled[2 * i] = *s;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut gauss = || {
        // Irwin-Hall sum of uniforms
        let v: f32 = (0..12).map(|_| rng.gen::<f32>()).sum::<f32>() - 6.0;
        v * noise
    };
    (0..symbols.len() * 2)
        .map(|n| {
            let mut acc = Sample::default();
            for (k, h) in taps.iter().enumerate() {
                if n >= k {
                    acc += upsampled[n - k] * (2.0 * *h);
                }
            }
            acc * expj(2.0 * std::f32::consts::PI * freq * n as f32) + Sample::new(gauss(), gauss())
        })
        .collect()
}
