//! PL frame synchronization, carrier and timing recovery for DVB-S2.
//!
//! Acquisition searches a frame worth of symbols for the start of frame marker by differential
//! correlation, which tolerates any carrier offset below a quarter of the symbol rate. Each
//! header is then decoded, carrier phase and amplitude are estimated from its 90 known symbols
//! and the payload is received with a decision directed PLL, pilot phase resets and a Gardner
//! timing detector. Lock holds while every following header shows up where the previous frame
//! said it would.
use std::f32::consts::PI;

use tracing::{debug, info, warn};

use crate::{
    constellation::Constellation,
    dsp::{expj, wrap_phase, Sampler},
    pipe::{Pipe, PipeId, Pipes},
    receiver::ReceiverConfig,
    report::{Event, ModcodChange, Report, Source},
    scheduler::Stage,
    settings::{CodeRate, Modulation},
    Sample,
};

use super::{
    modcod::FrameFormat,
    plheader::{
        descramble, diff_sign, header_symbols, pl_scrambling, sof_bit, PlsDecoder, HEADER_LEN,
        PILOT, PLS_LEN, PLS_SCRAMBLING, SOF_LEN,
    },
    PlSlot, Pls, PILOT_LEN, SLOTS_PER_PILOT, SLOT_LEN,
};

/// Data slots of the longest frame.
pub const MAX_SLOTS: usize = 360;
/// Symbols of the longest frame, header and pilots included.
pub const MAX_FRAME_SYMBOLS: usize =
    HEADER_LEN + MAX_SLOTS * SLOT_LEN + ((MAX_SLOTS - 1) / SLOTS_PER_PILOT) * PILOT_LEN;
/// Slots of a dummy frame.
const DUMMY_SLOTS: usize = 36;

/// Fractional timing phases tried per symbol while searching.
const SUBSTEPS: usize = 8;
/// Normalized correlation needed to accept a header candidate.
const DETECT_THRESHOLD: f32 = 0.6;
/// Normalized correlation needed to confirm the next header.
const VERIFY_THRESHOLD: f32 = 0.4;
/// Carrier capture range, radians per symbol.
const FREQ_TOL: f32 = 0.5 * PI;
/// Decision directed loop gains.
const KPH: f32 = 0.04;
const KFW: f32 = 1e-4;
/// Share of the pilot phase error turned into frequency correction.
const KPILOT: f32 = 0.5;
/// Gardner timing loop gain and per-symbol clamp, in samples.
const KTIMING: f64 = 0.01;
const MAX_TIMING_STEP: f64 = 0.1;
/// Smoothing of the header to header omega estimate and its relative bound.
const KOMEGA: f32 = 0.25;
const OMEGA_TOL: f32 = 1e-3;
/// Search radius around the predicted header position, in symbols.
const LOCKED_RADIUS: f32 = 1.0;
const PROBE_RADIUS: f32 = 3.0;
/// Frames with a header MER this far below the MODCOD's threshold are dropped.
const MER_MARGIN: f32 = 3.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    /// Searching for a header anywhere.
    Detect,
    /// A header was found, the next one has not been confirmed yet.
    Probe,
    Locked,
}

/// Carrier and timing state while walking through a frame.
#[derive(Clone, Copy, Debug)]
struct Track {
    /// Input sample time of the next symbol.
    time: f64,
    /// Radians.
    phase: f32,
    /// Radians per symbol.
    freq: f32,
    gain: f32,
}

#[derive(Clone, Copy, Debug)]
struct Header {
    pls: Pls,
    /// Positioned on the first payload symbol.
    track: Track,
    mer: f32,
}

pub struct FrameReceiver {
    input: PipeId<Sample>,
    output: PipeId<PlSlot>,
    sampler: Sampler,
    config: ReceiverConfig,
    decoder: PlsDecoder,
    scrambling: Vec<u8>,
    sof_ref: [Sample; SOF_LEN],
    sof_signs: [f32; SOF_LEN - 1],
    pls_signs: [f32; PLS_LEN / 2],
    constellations: Vec<Option<Constellation>>,
    state: FrameState,
    omega: f32,
    /// Radians per symbol.
    freq: f32,
    initial_freq: f32,
    /// Sample time of the next header while in [FrameState::Probe] or [FrameState::Locked].
    next_header: f64,
    gain: f32,
    mer: f32,
    last_modcod: Option<(Modulation, CodeRate)>,
    locked: bool,
    report_state: bool,
    meas_count: usize,
    frames: u64,
}

impl FrameReceiver {
    pub fn new(
        input: PipeId<Sample>,
        output: PipeId<PlSlot>,
        sampler: Sampler,
        config: ReceiverConfig,
    ) -> Self {
        let mut sof_ref = [Sample::default(); SOF_LEN];
        sof_ref.copy_from_slice(&header_symbols(Pls::default())[..SOF_LEN]);
        let mut sof_signs = [0f32; SOF_LEN - 1];
        for (i, s) in sof_signs.iter_mut().enumerate() {
            *s = diff_sign(sof_bit(i) ^ sof_bit(i + 1), i);
        }
        // without pilots the two bits of a PLS pair are equal before scrambling
        let mut pls_signs = [0f32; PLS_LEN / 2];
        for (k, s) in pls_signs.iter_mut().enumerate() {
            let a = (PLS_SCRAMBLING >> (PLS_LEN - 1 - 2 * k)) & 1;
            let b = (PLS_SCRAMBLING >> (PLS_LEN - 2 - 2 * k)) & 1;
            *s = diff_sign((a ^ b) as u8, SOF_LEN + 2 * k);
        }
        let initial_freq = 2.0 * PI * config.initial_freq * config.omega;
        FrameReceiver {
            input,
            output,
            sampler,
            decoder: PlsDecoder::default(),
            scrambling: pl_scrambling(MAX_FRAME_SYMBOLS - HEADER_LEN),
            sof_ref,
            sof_signs,
            pls_signs,
            constellations: vec![None; 32],
            state: FrameState::Detect,
            omega: config.omega,
            freq: initial_freq,
            initial_freq,
            next_header: 0.0,
            gain: 1.0,
            mer: 0.0,
            last_modcod: None,
            locked: false,
            report_state: true,
            meas_count: 0,
            frames: 0,
            config,
        }
    }

    /// Input samples needed to search a whole frame and then receive the frame found.
    pub fn min_input(omega: f32, readahead: usize) -> usize {
        ((1 + MAX_FRAME_SYMBOLS + SLOT_LEN) as f32 * omega * 2.0) as usize + readahead
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Carrier offset in cycles per sample.
    pub fn freq(&self) -> f32 {
        self.freq / (2.0 * PI) / self.omega
    }

    pub fn omega(&self) -> f32 {
        self.omega
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    #[inline]
    fn interp(&self, window: &[Sample], t: f64) -> Sample {
        let pos = t.floor();
        let start = pos as usize;
        if pos < 0.0 || start + self.sampler.readahead() > window.len() {
            return Sample::default();
        }
        self.sampler.interp(&window[start..], (t - pos) as f32)
    }

    /// Symbols at `t + i * omega`, de-rotated by `freq * i`.
    fn symbols(&self, window: &[Sample], t: f64, freq: f32, out: &mut [Sample]) {
        let omega = f64::from(self.omega);
        for (i, z) in out.iter_mut().enumerate() {
            *z = self.interp(window, t + i as f64 * omega) * expj(-freq * i as f32);
        }
    }

    /// Differential correlation of the header pattern against the symbol differences starting
    /// at `d[0]`, `d[i] = z[i + 1] * conj(z[i])`.
    ///
    /// The pilot flag flips the sign of every PLS pair, so the PLS part is aligned on the SOF
    /// part before summing. A perfect match is `j * e^(j*freq)` times the number of terms.
    fn correlate(&self, d: &[Sample]) -> Sample {
        let mut sof = Sample::default();
        for (di, sign) in d.iter().zip(&self.sof_signs) {
            sof += *di * *sign;
        }
        let mut pls = Sample::default();
        for (k, sign) in self.pls_signs.iter().enumerate() {
            pls += d[SOF_LEN + 2 * k] * *sign;
        }
        if (pls * sof.conj()).re >= 0.0 {
            sof + pls
        } else {
            sof - pls
        }
    }

    /// Magnitudes of the terms [Self::correlate] sums, for normalization.
    fn correlation_norm(&self, d: &[Sample]) -> f32 {
        let sof: f32 = d[..SOF_LEN - 1].iter().map(|v| v.norm()).sum();
        let pls: f32 = (0..PLS_LEN / 2).map(|k| d[SOF_LEN + 2 * k].norm()).sum();
        sof + pls
    }

    fn diffs(z: &[Sample]) -> Vec<Sample> {
        z.windows(2).map(|w| w[1] * w[0].conj()).collect()
    }

    /// Search `npos` symbol positions after `t0` at [SUBSTEPS] timing phases.
    ///
    /// Returns the best header time, its frequency offset relative to `freq` and the normalized
    /// correlation.
    fn search(
        &self,
        window: &[Sample],
        t0: f64,
        freq: f32,
        npos: usize,
    ) -> Option<(f64, f32, f32)> {
        let omega = f64::from(self.omega);
        let mut z = vec![Sample::default(); npos + HEADER_LEN];
        let mut best: Option<(f32, f64, Sample, Vec<Sample>)> = None;
        for ph in 0..SUBSTEPS {
            let tph = t0 + ph as f64 * omega / SUBSTEPS as f64;
            self.symbols(window, tph, freq, &mut z);
            let d = Self::diffs(&z);
            for p in 0..npos {
                let c = self.correlate(&d[p..]);
                let mag = c.norm_sqr();
                if best.as_ref().map_or(true, |b| mag > b.0) {
                    let t = tph + p as f64 * omega;
                    best = Some((mag, t, c, d[p..p + HEADER_LEN - 1].to_vec()));
                }
            }
        }
        let (_, t, c, d) = best?;
        let norm = self.correlation_norm(&d);
        if norm <= 0.0 {
            return None;
        }
        Some((t, wrap_phase(c.arg() - PI / 2.0), c.norm() / norm))
    }

    /// Find the next header within `radius` symbols of `t`.
    fn locate(&self, window: &[Sample], t: f64, freq: f32, radius: f32) -> Option<(f64, f32)> {
        let omega = f64::from(self.omega);
        let steps = (radius * SUBSTEPS as f32).ceil() as i64;
        let mut z = [Sample::default(); HEADER_LEN];
        let mut best: Option<(f32, f64, f32)> = None;
        for j in -steps..=steps {
            let tj = t + j as f64 * omega / SUBSTEPS as f64;
            if tj < 0.0 {
                continue;
            }
            self.symbols(window, tj, freq, &mut z);
            let d = Self::diffs(&z);
            let c = self.correlate(&d);
            let norm = self.correlation_norm(&d);
            if norm <= 0.0 {
                continue;
            }
            let score = c.norm() / norm;
            if best.map_or(true, |b| score > b.0) {
                best = Some((score, tj, score));
            }
        }
        best.map(|(_, t, score)| (t, score))
    }

    /// Decode the header at `t` and estimate the carrier from its known symbols.
    fn decode_header(&self, window: &[Sample], t: f64, freq: f32, refine: bool) -> Option<Header> {
        let mut z = [Sample::default(); HEADER_LEN];
        self.symbols(window, t, freq, &mut z);
        let a: Sample = z[..SOF_LEN]
            .iter()
            .zip(&self.sof_ref)
            .map(|(s, r)| s * r.conj())
            .sum();
        if a.norm() <= 0.0 {
            return None;
        }
        let rot = expj(-a.arg()) / (a.norm() / SOF_LEN as f32);
        let corrected: Vec<Sample> = z.iter().map(|s| s * rot).collect();
        let decoded = self.decoder.decode(&corrected);
        if !decoded.is_valid() {
            debug!(
                sof_errors = decoded.sof_errors,
                pls_errors = decoded.pls_errors,
                "header rejected"
            );
            return None;
        }
        let refs = header_symbols(decoded.pls);
        let correlate = |z: &[Sample], r: &[Sample]| -> Sample {
            z.iter().zip(r).map(|(s, r)| s * r.conj()).sum()
        };

        let mut freq = freq;
        if refine {
            let half = HEADER_LEN / 2;
            let a1 = correlate(&z[..half], &refs[..half]);
            let a2 = correlate(&z[half..], &refs[half..]);
            freq += (a2 * a1.conj()).arg() / half as f32;
            self.symbols(window, t, freq, &mut z);
        }
        let a = correlate(&z, &refs);
        let amp = a.norm() / HEADER_LEN as f32;
        if amp <= 0.0 {
            return None;
        }
        let phase = a.arg();
        let derot = expj(-phase) / amp;
        let err: f32 = z
            .iter()
            .zip(&refs)
            .map(|(s, r)| (s * derot - r).norm_sqr())
            .sum();
        let mer = 10.0 * (HEADER_LEN as f32 / err.max(1e-9)).log10();

        Some(Header {
            pls: decoded.pls,
            track: Track {
                time: t + HEADER_LEN as f64 * f64::from(self.omega),
                phase: wrap_phase(phase + freq * HEADER_LEN as f32),
                freq,
                gain: 1.0 / amp,
            },
            mer,
        })
    }

    /// Next symbol along `track`, with a Gardner timing update.
    #[inline]
    fn next_symbol(&self, window: &[Sample], track: &mut Track, prev: &mut Option<Sample>) -> Sample {
        let rot = expj(-track.phase) * track.gain;
        let s = self.interp(window, track.time) * rot;
        if let Some(p) = *prev {
            let mid = self.interp(window, track.time - f64::from(self.omega) / 2.0)
                * rot
                * expj(track.freq / 2.0);
            let e = ((p - s) * mid.conj()).re;
            track.time += (KTIMING * f64::from(e)).clamp(-MAX_TIMING_STEP, MAX_TIMING_STEP);
        }
        *prev = Some(s);
        track.time += f64::from(self.omega);
        track.phase = wrap_phase(track.phase + track.freq);
        s
    }

    fn constellation(&mut self, format: &FrameFormat) -> Constellation {
        self.constellations[format.pls.modcod as usize & 31]
            .get_or_insert_with(|| format.modcod.constellation())
            .clone()
    }

    /// Receive the payload of a frame, filling `slots` if given, and return the track
    /// positioned on the following header.
    fn receive_payload(
        &self,
        window: &[Sample],
        header: &Header,
        nslots: usize,
        constellation: Option<&Constellation>,
        mut slots: Option<&mut [PlSlot]>,
    ) -> Track {
        let mut track = header.track;
        let mut prev = None;
        let mut n = 0;
        let mut since_ref = HEADER_LEN / 2;
        for slot in 0..nslots {
            if header.pls.pilots && slot > 0 && slot % SLOTS_PER_PILOT == 0 {
                let mut acc = Sample::default();
                for _ in 0..PILOT_LEN {
                    let s = self.next_symbol(window, &mut track, &mut prev);
                    acc += descramble(s, self.scrambling[n]) * PILOT.conj();
                    n += 1;
                }
                // residual phase at the middle of the pilot block
                let err = acc.arg();
                track.phase = wrap_phase(track.phase + err);
                track.freq += err * KPILOT / (since_ref + PILOT_LEN / 2) as f32;
                since_ref = PILOT_LEN / 2;
            }
            for i in 0..SLOT_LEN {
                let s = descramble(self.next_symbol(window, &mut track, &mut prev), self.scrambling[n]);
                n += 1;
                since_ref += 1;
                if let Some(c) = constellation {
                    let d = c.point(c.nearest(s));
                    let err = (s * d.conj()).arg();
                    track.phase = wrap_phase(track.phase + err * KPH);
                    track.freq += err * KFW;
                }
                if let Some(out) = slots.as_deref_mut() {
                    out[slot].symbols[i] = s;
                }
            }
        }
        track
    }

    fn set_locked(&mut self, locked: bool, events: &mut Vec<Event>) {
        if locked != self.locked {
            info!(locked, frames = self.frames, "PL frame lock");
            self.locked = locked;
            events.push(
                Report::Lock {
                    source: Source::PlFrame,
                    locked,
                }
                .into(),
            );
        }
    }

    fn lose_lock(&mut self, events: &mut Vec<Event>) {
        self.state = FrameState::Detect;
        self.set_locked(false, events);
    }

    /// Drop input before `t` minus a small margin, returning the samples consumed.
    fn consume(&mut self, input: &mut Pipe<Sample>, t: f64) -> usize {
        let n = (t - 2.0 * f64::from(self.omega)).floor().max(0.0) as usize;
        let n = n.min(input.available_for_read());
        input.read(n);
        self.next_header -= n as f64;
        n
    }

    /// One acquisition attempt or one frame.
    fn step(&mut self, input: &mut Pipe<Sample>, output: &mut Pipe<PlSlot>, events: &mut Vec<Event>) {
        let omega = f64::from(self.omega);
        let consumed;
        {
            let window = input.rd();

            if self.state == FrameState::Detect {
                let npos = MAX_FRAME_SYMBOLS;
                match self.search(window, 0.0, self.freq, npos) {
                    Some((t, df, score)) if score >= DETECT_THRESHOLD => {
                        debug!(t, df, score, "header candidate");
                        self.freq += df;
                        self.next_header = t;
                        self.state = FrameState::Probe;
                    }
                    _ => {
                        let span = npos as f64 * omega;
                        consumed = self.consume(input, span);
                        self.measure(consumed, events);
                        return;
                    }
                }
            }

            let t = self.next_header;
            let probing = self.state == FrameState::Probe;
            let Some(header) = self.decode_header(window, t, self.freq, probing) else {
                self.lose_lock(events);
                consumed = self.consume(input, t + omega);
                self.measure(consumed, events);
                return;
            };

            let format = FrameFormat::new(header.pls);
            let (nslots, pilot_blocks) = match (&format, header.pls.is_dummy()) {
                (Some(f), _) => (f.slots, f.pilot_blocks()),
                (None, true) => {
                    let blocks = if header.pls.pilots {
                        (DUMMY_SLOTS - 1) / SLOTS_PER_PILOT
                    } else {
                        0
                    };
                    (DUMMY_SLOTS, blocks)
                }
                (None, false) => {
                    warn!(modcod = header.pls.modcod, short = header.pls.short_frames, "unsupported MODCOD");
                    self.lose_lock(events);
                    consumed = self.consume(input, t + omega);
                    self.measure(consumed, events);
                    return;
                }
            };
            if let Some(f) = &format {
                if header.mer < f.modcod.esn0 - MER_MARGIN {
                    debug!(mer = header.mer, modcod = header.pls.modcod, "header MER too low");
                    self.lose_lock(events);
                    consumed = self.consume(input, t + omega);
                    self.measure(consumed, events);
                    return;
                }
            }

            self.mer = header.mer;
            self.gain = header.track.gain;
            let track = match &format {
                Some(f) => {
                    let constellation = self.constellation(f);
                    let out = output.wr();
                    out[0] = PlSlot {
                        is_header: true,
                        pls: header.pls,
                        locked: self.state == FrameState::Locked,
                        ..Default::default()
                    };
                    for slot in out[1..=nslots].iter_mut() {
                        *slot = PlSlot {
                            pls: header.pls,
                            ..Default::default()
                        };
                    }
                    let track = self.receive_payload(
                        window,
                        &header,
                        nslots,
                        Some(&constellation),
                        Some(&mut out[1..=nslots]),
                    );
                    output.written(1 + nslots);
                    self.frames += 1;
                    self.modcod_event(f, events);
                    track
                }
                None => self.receive_payload(window, &header, nslots, None, None),
            };
            let nsymbols = HEADER_LEN + nslots * SLOT_LEN + pilot_blocks * PILOT_LEN;

            self.freq = track.freq;
            if !self.config.allow_drift && (self.freq - self.initial_freq).abs() > FREQ_TOL {
                warn!(freq = self.freq, "carrier out of range");
                self.freq = self.initial_freq;
                self.lose_lock(events);
                consumed = self.consume(input, track.time);
                self.measure(consumed, events);
                return;
            }

            let radius = if probing {
                PROBE_RADIUS + nsymbols as f32 * 2e-4
            } else {
                LOCKED_RADIUS
            };
            match self.locate(window, track.time, track.freq, radius) {
                Some((next, score)) if score >= VERIFY_THRESHOLD => {
                    let measured = (next - t) as f32 / nsymbols as f32;
                    let drift = ((next - track.time) as f32 / nsymbols as f32) * KOMEGA;
                    self.omega = (self.omega + drift).clamp(
                        self.config.omega * (1.0 - OMEGA_TOL),
                        self.config.omega * (1.0 + OMEGA_TOL),
                    );
                    debug!(measured, omega = self.omega, score, "next header confirmed");
                    self.next_header = next;
                    self.state = FrameState::Locked;
                    self.set_locked(true, events);
                }
                _ => {
                    debug!("next header missing");
                    self.lose_lock(events);
                    self.next_header = track.time;
                }
            }
            let upto = self.next_header;
            consumed = self.consume(input, upto);
        }
        self.measure(consumed, events);
    }

    fn modcod_event(&mut self, format: &FrameFormat, events: &mut Vec<Event>) {
        let key = (format.modcod.modulation, format.modcod.code_rate);
        if self.last_modcod == Some(key) {
            return;
        }
        info!(
            modcod = format.pls.modcod,
            modulation = ?key.0,
            rate = ?key.1,
            short = format.pls.short_frames,
            pilots = format.pls.pilots,
            "MODCOD"
        );
        self.last_modcod = Some(key);
        events.push(
            ModcodChange {
                modulation: key.0,
                code_rate: key.1,
                modcod: format.pls.modcod,
                short_frames: format.pls.short_frames,
                pilots: format.pls.pilots,
            }
            .into(),
        );
    }

    fn measure(&mut self, consumed: usize, events: &mut Vec<Event>) {
        self.meas_count += consumed;
        while self.meas_count >= self.config.meas_decimation {
            self.meas_count -= self.config.meas_decimation;
            events.push(Report::FrequencyError(self.freq() * self.config.sample_rate).into());
            events.push(Report::SignalStrength(1.0 / self.gain).into());
            events.push(Report::Mer(self.mer).into());
        }
    }
}

impl Stage for FrameReceiver {
    fn name(&self) -> &'static str {
        "s2_frame_receiver"
    }

    fn can_run(&self, pipes: &Pipes) -> bool {
        pipes.get(self.input).available_for_read()
            >= Self::min_input(self.omega, self.sampler.readahead())
            && pipes.get(self.output).available_for_write() > MAX_SLOTS
    }

    fn run(&mut self, pipes: &mut Pipes, events: &mut Vec<Event>) {
        if self.report_state {
            self.report_state = false;
            events.push(
                Report::Lock {
                    source: Source::PlFrame,
                    locked: false,
                }
                .into(),
            );
        }
        let (input, output) = (self.input, self.output);
        pipes.with(input, output, |input, output| {
            while input.available_for_read() >= Self::min_input(self.omega, self.sampler.readahead())
                && output.available_for_write() > MAX_SLOTS
            {
                self.step(input, output, events);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dvbs2::plheader::scramble, settings::SamplerKind};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    /// Symbols of consecutive QPSK frames, payload labels random.
    fn frames(pls: Pls, count: usize, rng: &mut StdRng) -> Vec<Sample> {
        let format = FrameFormat::new(pls).unwrap();
        let qpsk = Constellation::qpsk();
        let rn = pl_scrambling(format.payload_symbols());
        let mut out = Vec::new();
        for _ in 0..count {
            out.extend(header_symbols(pls));
            let mut n = 0;
            for slot in 0..format.slots {
                if pls.pilots && slot > 0 && slot % SLOTS_PER_PILOT == 0 {
                    for _ in 0..PILOT_LEN {
                        out.push(scramble(PILOT, rn[n]));
                        n += 1;
                    }
                }
                for _ in 0..SLOT_LEN {
                    out.push(scramble(qpsk.point(rng.gen_range(0..4)), rn[n]));
                    n += 1;
                }
            }
        }
        out
    }

    /// Two samples per symbol, rectangular pulses, a carrier offset and some noise.
    fn modulate(symbols: &[Sample], offset: usize, freq: f32, rng: &mut StdRng) -> Vec<Sample> {
        let mut out: Vec<Sample> = (0..offset).map(|_| Sample::new(rng.gen_range(-0.1..0.1), 0.0)).collect();
        for s in symbols {
            out.push(*s);
            out.push(*s);
        }
        for (n, v) in out.iter_mut().enumerate() {
            *v = *v * expj(2.0 * PI * freq * n as f32 + 0.7) * 0.5
                + Sample::new(rng.gen_range(-0.02..0.02), rng.gen_range(-0.02..0.02));
        }
        out
    }

    #[test]
    fn test_locks_and_emits_frames() {
        let mut rng = StdRng::seed_from_u64(11);
        let pls = Pls::new(4, true, true);
        let symbols = frames(pls, 40, &mut rng);
        let signal = modulate(&symbols, 1234, 0.003, &mut rng);

        let mut pipes = Pipes::new(1);
        let input = pipes.add("in", signal.len());
        let output = pipes.add("slots", 8192);
        {
            let pipe = pipes.get_mut(input);
            pipe.wr()[..signal.len()].copy_from_slice(&signal);
            pipe.written(signal.len());
        }
        let config = ReceiverConfig::builder()
            .sample_rate(2e6)
            .meas_decimation(50_000)
            .build();
        let mut rx = FrameReceiver::new(
            input,
            output,
            Sampler::new(SamplerKind::Linear, 2.0, 0.35, 10),
            config,
        );
        let mut events = Vec::new();
        assert!(rx.can_run(&pipes));
        rx.run(&mut pipes, &mut events);

        assert_eq!(rx.state(), FrameState::Locked);
        let slots = pipes.get(output).rd();
        let headers: Vec<&PlSlot> = slots.iter().filter(|s| s.is_header).collect();
        assert!(headers.len() >= 3, "{} frames", headers.len());
        assert!(headers.iter().all(|h| h.pls == pls));
        assert!(headers.last().unwrap().locked);

        // descrambled data symbols sit on the QPSK points
        let data = &slots[slots.len() - 10..];
        for slot in data.iter().filter(|s| !s.is_header) {
            for s in slot.symbols.iter() {
                assert!((s.re.abs() - 0.707).abs() < 0.2 && (s.im.abs() - 0.707).abs() < 0.2, "{s}");
            }
        }

        let modcods: Vec<&Event> = events.iter().filter(|e| matches!(e, Event::Modcod(_))).collect();
        assert_eq!(modcods.len(), 1);
        assert!(events.contains(&Event::Report(Report::Lock {
            source: Source::PlFrame,
            locked: true
        })));
        let hz = rx.freq() * 2e6;
        assert!((hz - 6000.0).abs() < 500.0, "frequency {hz}");
    }

    #[test]
    fn test_noise_does_not_lock() {
        let mut rng = StdRng::seed_from_u64(12);
        let n = FrameReceiver::min_input(2.0, 2) + 1000;
        let signal: Vec<Sample> = (0..n)
            .map(|_| Sample::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
            .collect();
        let mut pipes = Pipes::new(1);
        let input = pipes.add("in", n);
        let output = pipes.add("slots", 1024);
        {
            let pipe = pipes.get_mut(input);
            pipe.wr()[..n].copy_from_slice(&signal);
            pipe.written(n);
        }
        let config = ReceiverConfig::builder().sample_rate(2e6).build();
        let mut rx = FrameReceiver::new(input, output, Sampler::Linear, config);
        let mut events = Vec::new();
        rx.run(&mut pipes, &mut events);
        assert_eq!(rx.state(), FrameState::Detect);
        assert_eq!(pipes.get(output).available_for_read(), 0);
    }
}
