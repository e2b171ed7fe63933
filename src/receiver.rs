//! Symbol timing and carrier recovery for single carrier PSK/APSK signals.
use std::f32::consts::PI;

use typed_builder::TypedBuilder;

use crate::{
    constellation::{Constellation, SoftSymbol},
    dsp::{expj, wrap_phase, Sampler},
    pipe::{Pipe, PipeId, Pipes},
    report::{Event, Report},
    scheduler::Stage,
    Sample,
};

/// Samples processed per iteration.
const CHUNK: usize = 128;
/// Loop gain of the signal power estimators.
const KEST: f32 = 0.01;
const FREQ_ALPHA: f32 = 0.04;
const FREQ_BETA: f32 = 0.0012;
/// Timing error gain for unit amplitude constellations.
const GAIN_MU: f32 = 0.04;
const MAX_MUCORR: f32 = 0.1;
const GAIN_OMEGA: f32 = 0.0002;
/// Symbols during which fast lock boosts the loops.
const ACQUISITION_SYMBOLS: u64 = 4096;

#[derive(Clone, Debug, TypedBuilder)]
pub struct ReceiverConfig {
    /// Samples per second at the receiver input.
    pub sample_rate: f32,
    /// Samples per symbol.
    #[builder(default = 2.0)]
    pub omega: f32,
    /// Initial carrier offset in cycles per sample.
    #[builder(default = 0.0)]
    pub initial_freq: f32,
    /// Scales the frequency loop gain.
    #[builder(default = 1.0)]
    pub pll_adjustment: f32,
    #[builder(default = false)]
    pub allow_drift: bool,
    #[builder(default = false)]
    pub fast_lock: bool,
    #[builder(default = false)]
    pub hard_metric: bool,
    /// Samples between measurement reports.
    #[builder(default = 1 << 20)]
    pub meas_decimation: usize,
}

#[derive(Clone, Copy, Default)]
struct History {
    /// Received symbol
    p: Sample,
    /// Decision
    c: Sample,
}

/// DVB-S constellation receiver.
///
/// Interpolates symbols at the fractional time `mu`, de-rotates them by the tracked carrier
/// phase, normalizes the amplitude and decides on the nearest point. Timing follows a modified
/// Mueller and Müller detector, carrier a second order decision directed PLL.
pub struct ConstellationReceiver {
    input: PipeId<Sample>,
    output: PipeId<SoftSymbol>,
    config: ReceiverConfig,
    sampler: Sampler,
    constellation: Constellation,
    omega: f32,
    min_omega: f32,
    max_omega: f32,
    /// Radians per sample.
    freq: f32,
    min_freq: f32,
    max_freq: f32,
    /// Radians.
    phase: f32,
    mu: f32,
    hist: [History; 3],
    est_insp: f32,
    agc_gain: f32,
    est_sp: f32,
    est_ep: f32,
    meas_count: usize,
    symbols: u64,
}

impl ConstellationReceiver {
    pub fn new(
        input: PipeId<Sample>,
        output: PipeId<SoftSymbol>,
        sampler: Sampler,
        constellation: Constellation,
        config: ReceiverConfig,
    ) -> Self {
        let tol = if config.allow_drift { 1e-3 } else { 10e-6 };
        let omega = config.omega;
        let freq = 2.0 * PI * config.initial_freq;
        let mut rx = ConstellationReceiver {
            input,
            output,
            sampler,
            constellation,
            omega,
            min_omega: omega * (1.0 - tol),
            max_omega: omega * (1.0 + tol),
            freq,
            min_freq: freq,
            max_freq: freq,
            phase: 0.0,
            mu: 0.0,
            hist: [History::default(); 3],
            est_insp: 1.0,
            agc_gain: 1.0,
            est_sp: 0.0,
            est_ep: 0.0,
            meas_count: 0,
            symbols: 0,
            config,
        };
        rx.update_freq_limits();
        rx
    }

    /// Prevent the PLL from crossing +-SR/n/2 and locking at +-SR/n.
    fn update_freq_limits(&mut self) {
        let n = self.constellation.symmetry() as f32;
        let span = 2.0 * PI / self.max_omega / n / 2.0;
        self.min_freq = self.freq - span;
        self.max_freq = self.freq + span;
    }

    /// Tracked carrier offset in cycles per sample.
    pub fn freq(&self) -> f32 {
        self.freq / (2.0 * PI)
    }

    pub fn omega(&self) -> f32 {
        self.omega
    }

    /// Modulation error ratio in dB, 0 before any estimate exists.
    pub fn mer(&self) -> f32 {
        if self.est_ep > 0.0 {
            10.0 * (self.est_sp / self.est_ep).log10()
        } else {
            0.0
        }
    }

    fn process_chunk(
        &mut self,
        input: &mut Pipe<Sample>,
        output: &mut Pipe<SoftSymbol>,
        events: &mut Vec<Event>,
    ) {
        let boost = if self.config.fast_lock && self.symbols < ACQUISITION_SYMBOLS {
            2.0
        } else {
            1.0
        };
        let freq_alpha = FREQ_ALPHA;
        let freq_beta = FREQ_BETA / self.omega * self.config.pll_adjustment * boost;
        let gain_mu = GAIN_MU * boost;

        self.sampler.update_freq(self.freq / (2.0 * PI));

        let window = input.rd();
        let out = output.wr();
        let mut produced = 0;
        let mut sg = Sample::default();
        let mut last: Option<(Sample, Sample)> = None;

        for i in 0..CHUNK {
            if self.mu < 1.0 {
                // fractional time of the next symbol between window[i] and window[i + 1]
                sg = self.sampler.interp(&window[i..], self.mu)
                    * expj(-(self.phase + self.mu * self.freq));
                let s = sg * self.agc_gain;
                let nearest = self.constellation.nearest(s);
                let c = self.constellation.point(nearest);
                out[produced] = SoftSymbol {
                    iq: if self.config.hard_metric { c } else { s },
                    nearest,
                };
                produced += 1;

                let err = (s * c.conj()).arg();
                self.phase += err * freq_alpha;
                self.freq += err * freq_beta;

                // mu[k] = dot(p[k]-p[k-2], c[k-1]) - dot(c[k]-c[k-2], p[k-1])
                self.hist[2] = self.hist[1];
                self.hist[1] = self.hist[0];
                self.hist[0] = History { p: s, c };
                let [h0, h1, h2] = self.hist;
                let dp = h0.p - h2.p;
                let dc = h0.c - h2.c;
                let muerr = (dp.re * h1.c.re + dp.im * h1.c.im) - (dc.re * h1.p.re + dc.im * h1.p.im);
                let mucorr = (muerr * gain_mu).clamp(-MAX_MUCORR, MAX_MUCORR);
                self.omega = (self.omega + mucorr * GAIN_OMEGA).clamp(self.min_omega, self.max_omega);
                self.mu += mucorr + self.omega;
                self.symbols += 1;
                last = Some((s, c));
            }
            self.mu -= 1.0;
            self.phase += self.freq;
        }
        input.read(CHUNK);
        output.written(produced);
        self.phase = wrap_phase(self.phase);

        if let Some((s, c)) = last {
            // gain control on the symbols, APSK rings make the raw signal power misleading
            let insp = sg.norm_sqr();
            self.est_insp = insp * KEST + self.est_insp * (1.0 - KEST);
            if self.est_insp > 0.0 {
                self.agc_gain = 1.0 / self.est_insp.sqrt();
            }
            let ev = s - c;
            let (sig_power, ev_power) = if self.constellation.size() == 2 {
                // BPSK at 45 degrees, ignore the quadrature noise
                let sig = (c.re + c.im) * std::f32::consts::FRAC_1_SQRT_2;
                let e = (ev.re + ev.im) * std::f32::consts::FRAC_1_SQRT_2;
                (sig * sig, e * e)
            } else {
                (c.norm_sqr(), ev.norm_sqr())
            };
            self.est_sp = sig_power * KEST + self.est_sp * (1.0 - KEST);
            self.est_ep = ev_power * KEST + self.est_ep * (1.0 - KEST);
        }

        if !self.config.allow_drift && (self.freq < self.min_freq || self.freq > self.max_freq) {
            self.freq = 0.5 * (self.min_freq + self.max_freq);
        }

        self.meas_count += CHUNK;
        while self.meas_count >= self.config.meas_decimation {
            self.meas_count -= self.config.meas_decimation;
            events.push(Report::FrequencyError(self.freq() * self.config.sample_rate).into());
            events.push(Report::SignalStrength(self.est_insp.sqrt()).into());
            events.push(Report::Mer(self.mer()).into());
        }
    }
}

impl Stage for ConstellationReceiver {
    fn name(&self) -> &'static str {
        "constellation_receiver"
    }

    fn can_run(&self, pipes: &Pipes) -> bool {
        pipes.get(self.input).available_for_read() >= CHUNK + self.sampler.readahead()
            && pipes.get(self.output).available_for_write() >= CHUNK
    }

    fn run(&mut self, pipes: &mut Pipes, events: &mut Vec<Event>) {
        let readahead = self.sampler.readahead();
        let (input, output) = (self.input, self.output);
        pipes.with(input, output, |input, output| {
            while input.available_for_read() >= CHUNK + readahead
                && output.available_for_write() >= CHUNK
            {
                self.process_chunk(input, output, events);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dsp::root_raised_cosine, settings::SamplerKind};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    /// QPSK at 2 samples per symbol through an RRC filter.
    fn qpsk_signal(labels: &[u8], freq: f32, phase: f32) -> Vec<Sample> {
        let c = Constellation::qpsk();
        let taps = root_raised_cosine(64, 0.5, 0.35);
        let mut up = vec![Sample::default(); labels.len() * 2 + taps.len()];
        for (i, l) in labels.iter().enumerate() {
            up[i * 2] = c.point(*l) * 2.0;
        }
        (0..labels.len() * 2)
            .map(|n| {
                let mut acc = Sample::default();
                for (k, h) in taps.iter().enumerate() {
                    if n >= k {
                        acc += up[n - k] * *h;
                    }
                }
                acc * expj(2.0 * PI * freq * n as f32 + phase)
            })
            .collect()
    }

    fn receive(signal: &[Sample], sampler: SamplerKind) -> (Vec<SoftSymbol>, Vec<Event>, f32) {
        let mut pipes = Pipes::new(1);
        let input = pipes.add("in", signal.len());
        let output = pipes.add("out", signal.len());
        let config = ReceiverConfig::builder()
            .sample_rate(2e6)
            .meas_decimation(8192)
            .build();
        let mut rx = ConstellationReceiver::new(
            input,
            output,
            Sampler::new(sampler, 2.0, 0.35, 10),
            Constellation::qpsk(),
            config,
        );
        {
            let pipe = pipes.get_mut(input);
            pipe.wr()[..signal.len()].copy_from_slice(signal);
            pipe.written(signal.len());
        }
        let mut events = Vec::default();
        assert!(rx.can_run(&pipes));
        rx.run(&mut pipes, &mut events);
        let symbols = pipes.get(output).rd().to_vec();
        (symbols, events, rx.mer())
    }

    #[test]
    fn test_locks_on_clean_qpsk() {
        let mut rng = StdRng::seed_from_u64(42);
        let labels: Vec<u8> = (0..20000).map(|_| rng.gen_range(0..4)).collect();
        let signal = qpsk_signal(&labels, 0.0, 0.0);
        let (symbols, events, mer) = receive(&signal, SamplerKind::Rrc);

        assert!(symbols.len() > 19000, "{} symbols", symbols.len());
        assert!(mer > 10.0, "mer {mer}");
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Report(Report::Mer(_)))));

        // symbols are delayed by the filters, find the alignment in the tail
        let tail: Vec<u8> = symbols[symbols.len() - 2000..symbols.len() - 1000]
            .iter()
            .map(|s| s.nearest)
            .collect();
        let found = labels
            .windows(tail.len())
            .any(|w| w == tail.as_slice());
        assert!(found, "decisions do not match the transmitted symbols");
    }

    #[test]
    fn test_tracks_small_offset() {
        let mut rng = StdRng::seed_from_u64(3);
        let labels: Vec<u8> = (0..20000).map(|_| rng.gen_range(0..4)).collect();
        let signal = qpsk_signal(&labels, 0.001, 0.3);
        let (symbols, _, mer) = receive(&signal, SamplerKind::Linear);
        assert!(symbols.len() > 19000);
        assert!(mer > 8.0, "mer {mer}");
    }
}
