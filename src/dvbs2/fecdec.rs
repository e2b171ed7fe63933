//! LDPC and BCH decoding of FEC frames into baseband frames.
//!
//! Two inner decoders exist: [BitFlipDecoder] works in-process on hard decisions,
//! [SoftDecoder] hands the soft bits to external helper processes. Both finish with BCH decoding
//! and baseband descrambling in [OuterDecoder] and report one [FecCounters] per frame.
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use tracing::{debug, info, trace, warn};

use crate::{
    dvbs::randomizer::prbs_bytes,
    pipe::{PipeId, Pipes},
    report::{Event, FecCounters, Report, Source},
    scheduler::Stage,
    settings::CodeRate,
    Result,
};

use super::{
    bch::Bch,
    helper::{HelperConfig, HelperPool},
    ldpc::{LdpcCode, LdpcCodebook},
    modcod::{FrameFormat, KBCH_MAX},
    BbFrame, FecFrame,
};

/// Consecutive helper failures after which frames are dropped without trying.
pub const MAX_HELPER_FAILURES: u32 = 8;

/// Frames dropped while degraded before the helpers get another chance.
pub const DEGRADED_RETRY_FRAMES: u32 = 256;

fn pack(bits: &[u8]) -> Vec<u8> {
    bits.chunks(8)
        .map(|c| c.iter().fold(0u8, |acc, b| (acc << 1) | (b & 1)))
        .collect()
}

fn unpack(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .flat_map(|b| (0..8).rev().map(move |i| (b >> i) & 1))
        .collect()
}

/// BCH decoding and baseband descrambling, shared by both inner decoders.
pub struct OuterDecoder {
    bch: HashMap<(CodeRate, bool), Bch>,
    scrambling: Vec<u8>,
}

impl Default for OuterDecoder {
    fn default() -> Self {
        OuterDecoder {
            bch: HashMap::default(),
            // baseband scrambling uses the DVB-S energy dispersal sequence
            scrambling: prbs_bytes(KBCH_MAX / 8),
        }
    }
}

impl OuterDecoder {
    fn bch(&mut self, format: &FrameFormat) -> &Bch {
        let fec = format.fec;
        self.bch
            .entry((format.modcod.code_rate, format.pls.short_frames))
            .or_insert_with(|| Bch::new(fec.kbch, fec.kldpc, fec.t, format.pls.short_frames))
    }

    /// Decode the BCH codeword at the start of `bits`, returning the descrambled frame and the
    /// number of corrected bits.
    pub fn decode(&mut self, format: &FrameFormat, bits: &mut [u8]) -> Option<(Vec<u8>, usize)> {
        let kbch = format.fec.kbch;
        let corrected = self.bch(format).decode(&mut bits[..format.fec.kldpc])?;
        let mut bytes = pack(&bits[..kbch]);
        for (b, s) in bytes.iter_mut().zip(&self.scrambling) {
            *b ^= s;
        }
        Some((bytes, corrected))
    }

    /// Codeword bits carrying `bbframe`, for loopback testing of the receive chain.
    pub fn encode(&mut self, format: &FrameFormat, ldpc: &LdpcCode, bbframe: &[u8]) -> Vec<u8> {
        let scrambled: Vec<u8> = bbframe
            .iter()
            .zip(&self.scrambling)
            .map(|(b, s)| b ^ s)
            .collect();
        let mut bits = unpack(&scrambled);
        bits.truncate(format.fec.kbch);
        let parity = self.bch(format).encode(&bits);
        bits.extend(parity);
        ldpc.encode(&bits)
    }
}

/// LDPC codes built from a codebook on first use.
pub struct CodeCache {
    codebook: Arc<dyn LdpcCodebook>,
    codes: HashMap<(CodeRate, bool), Arc<LdpcCode>>,
}

impl CodeCache {
    pub fn new(codebook: Arc<dyn LdpcCodebook>) -> Self {
        CodeCache {
            codebook,
            codes: HashMap::default(),
        }
    }

    pub fn get(&mut self, format: &FrameFormat) -> Result<Arc<LdpcCode>> {
        let key = (format.modcod.code_rate, format.pls.short_frames);
        if let Some(code) = self.codes.get(&key) {
            return Ok(code.clone());
        }
        let code = Arc::new(LdpcCode::new(self.codebook.as_ref(), key.0, key.1)?);
        debug!(rate = ?key.0, short = key.1, "LDPC code built");
        self.codes.insert(key, code.clone());
        Ok(code)
    }
}

fn report(events: &mut Vec<Event>, counters: FecCounters) {
    events.push(
        Report::Fec {
            source: Source::Ldpc,
            counters,
        }
        .into(),
    );
}

/// In-process hard decision LDPC decoder.
pub struct BitFlipDecoder {
    input: PipeId<FecFrame>,
    output: PipeId<BbFrame>,
    max_bitflips: usize,
    codes: CodeCache,
    outer: OuterDecoder,
}

impl BitFlipDecoder {
    pub fn new(
        input: PipeId<FecFrame>,
        output: PipeId<BbFrame>,
        codebook: Arc<dyn LdpcCodebook>,
        max_bitflips: usize,
    ) -> Self {
        BitFlipDecoder {
            input,
            output,
            max_bitflips,
            codes: CodeCache::new(codebook),
            outer: OuterDecoder::default(),
        }
    }

    /// Decode one frame, `None` if it must be dropped.
    pub fn decode(&mut self, frame: &FecFrame) -> (Option<BbFrame>, FecCounters) {
        let nbits = frame.llrs.len();
        let Some(format) = FrameFormat::new(frame.pls) else {
            return (None, FecCounters::new(nbits, None));
        };
        let code = match self.codes.get(&format) {
            Ok(code) => code,
            Err(e) => {
                warn!("cannot decode {:?}: {e}", frame.pls);
                return (None, FecCounters::failed(nbits));
            }
        };
        let mut bits: Vec<u8> = frame.llrs.iter().map(|l| u8::from(*l > 0)).collect();
        let Some(flips) = code.decode_bitflip(&mut bits, self.max_bitflips) else {
            trace!(modcod = frame.pls.modcod, "LDPC failed");
            return (None, FecCounters::new(nbits, None));
        };
        match self.outer.decode(&format, &mut bits) {
            Some((bytes, corrected)) => (
                Some(BbFrame {
                    pls: frame.pls,
                    bytes,
                }),
                FecCounters::new(nbits, Some(flips + corrected)),
            ),
            None => {
                trace!(modcod = frame.pls.modcod, "BCH failed");
                (None, FecCounters::new(nbits, None))
            }
        }
    }
}

impl Stage for BitFlipDecoder {
    fn name(&self) -> &'static str {
        "s2_fecdec"
    }

    fn can_run(&self, pipes: &Pipes) -> bool {
        pipes.get(self.input).available_for_read() > 0
            && pipes.get(self.output).available_for_write() > 0
    }

    fn run(&mut self, pipes: &mut Pipes, events: &mut Vec<Event>) {
        while self.can_run(pipes) {
            let frame = std::mem::take(&mut pipes.get_mut(self.input).rd_mut()[0]);
            pipes.get_mut(self.input).read(1);
            let (bbframe, counters) = self.decode(&frame);
            report(events, counters);
            if let Some(bbframe) = bbframe {
                if pipes.get_mut(self.output).write(bbframe).is_err() {
                    return;
                }
            }
        }
    }
}

/// Soft decision decoding through external helper processes.
///
/// Frames are numbered on submission and released in order; a frame a helper lost is reported
/// failed and skipped. Each helper crash or spawn failure counts once towards
/// [MAX_HELPER_FAILURES]; once degraded, frames are dropped unseen and every
/// [DEGRADED_RETRY_FRAMES] frames the helpers are given one more try.
pub struct SoftDecoder {
    input: PipeId<FecFrame>,
    output: PipeId<BbFrame>,
    pool: HelperPool,
    outer: OuterDecoder,
    next_seq: u64,
    next_out: u64,
    done: BTreeMap<u64, Option<BbFrame>>,
    failures: u32,
    skipped: u32,
    max_in_flight: usize,
}

impl SoftDecoder {
    pub fn new(input: PipeId<FecFrame>, output: PipeId<BbFrame>, config: HelperConfig) -> Self {
        let max_in_flight = (config.helpers * config.batch_size * 2).max(1);
        SoftDecoder {
            input,
            output,
            pool: HelperPool::new(config),
            outer: OuterDecoder::default(),
            next_seq: 0,
            next_out: 0,
            done: BTreeMap::default(),
            failures: 0,
            skipped: 0,
            max_in_flight,
        }
    }

    /// Whether repeated helper failures disabled decoding.
    pub fn degraded(&self) -> bool {
        self.failures >= MAX_HELPER_FAILURES
    }

    fn collect(&mut self, events: &mut Vec<Event>) {
        while let Some(out) = self.pool.try_recv() {
            let nbits = out.pls.frame_bits();
            let bbframe = match (out.result, FrameFormat::new(out.pls)) {
                (Ok(llrs), Some(format)) => {
                    self.failures = 0;
                    let mut bits: Vec<u8> = llrs.iter().map(|l| u8::from(*l > 0)).collect();
                    match self.outer.decode(&format, &mut bits) {
                        Some((bytes, corrected)) => {
                            report(events, FecCounters::new(nbits, Some(corrected)));
                            Some(BbFrame {
                                pls: out.pls,
                                bytes,
                            })
                        }
                        None => {
                            report(events, FecCounters::new(nbits, None));
                            None
                        }
                    }
                }
                (Ok(_), None) => None,
                (Err(e), _) => {
                    if out.crashed {
                        self.failures += 1;
                        warn!(failures = self.failures, "LDPC helper: {e}");
                        if self.degraded() {
                            warn!("soft LDPC decoding disabled after repeated helper failures");
                        }
                    } else {
                        debug!(seq = out.seq, "frame lost with its helper: {e}");
                    }
                    report(events, FecCounters::failed(nbits));
                    None
                }
            };
            self.done.insert(out.seq, bbframe);
        }
    }
}

impl Stage for SoftDecoder {
    fn name(&self) -> &'static str {
        "s2_fecdec_helper"
    }

    fn can_run(&self, pipes: &Pipes) -> bool {
        let output_free = pipes.get(self.output).available_for_write() > 0;
        (pipes.get(self.input).available_for_read() > 0 && self.pool.in_flight() < self.max_in_flight)
            || (output_free && (self.pool.has_results() || !self.done.is_empty()))
    }

    fn run(&mut self, pipes: &mut Pipes, events: &mut Vec<Event>) {
        while pipes.get(self.input).available_for_read() > 0
            && self.pool.in_flight() < self.max_in_flight
        {
            let frame = std::mem::take(&mut pipes.get_mut(self.input).rd_mut()[0]);
            pipes.get_mut(self.input).read(1);
            if self.degraded() {
                self.skipped += 1;
                if self.skipped < DEGRADED_RETRY_FRAMES {
                    report(events, FecCounters::failed(frame.llrs.len()));
                    continue;
                }
                // one more failure and we are back to dropping
                self.skipped = 0;
                self.failures = MAX_HELPER_FAILURES - 1;
                info!("retrying LDPC helpers");
            }
            let seq = self.next_seq;
            match self.pool.submit(seq, frame.pls, frame.llrs) {
                Ok(()) => self.next_seq += 1,
                Err(e) => {
                    self.failures += 1;
                    warn!(failures = self.failures, "LDPC helper: {e}");
                    if self.degraded() {
                        warn!("soft LDPC decoding disabled after repeated helper failures");
                    }
                }
            }
        }

        self.collect(events);
        while let Some(entry) = self.done.first_entry() {
            if *entry.key() != self.next_out {
                break;
            }
            if pipes.get(self.output).available_for_write() == 0 {
                return;
            }
            let bbframe = entry.remove();
            self.next_out += 1;
            if let Some(bbframe) = bbframe {
                if pipes.get_mut(self.output).write(bbframe).is_err() {
                    return;
                }
            }
        }
    }
}
