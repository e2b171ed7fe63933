//! Channel rate adaptation.
//!
//! The [FrontEnd] shifts the wanted channel to zero frequency and resamples it to the working rate
//! of the processing graph, two samples per symbol.
use tracing::debug;

use crate::{
    dsp::{design_lowpass, Nco},
    Error, Result, Sample,
};

/// Filter phases of the polyphase bank, the fractional delay resolution.
const PHASE_STEPS: usize = 16;
const TAPS_PER_PHASE: usize = 16;

#[derive(Clone, Debug)]
pub struct FrontEnd {
    channel_rate: f64,
    working_rate: f64,
    offset: f64,
    rf_bandwidth: f64,
    nco: Nco,
    /// Input samples per output sample.
    distance: f64,
    remain: f64,
    /// `bank[phase]` holds the taps for fractional delay `phase / PHASE_STEPS`, newest sample first.
    bank: Vec<[f32; TAPS_PER_PHASE]>,
    /// History duplicated so the newest `TAPS_PER_PHASE` samples are always contiguous.
    history: [Sample; 2 * TAPS_PER_PHASE],
    head: usize,
    power_sum: f64,
    power_count: u64,
}

impl FrontEnd {
    /// # Errors
    /// [Error::Configuration] if any of the rates is not positive.
    pub fn new(channel_rate: f64, working_rate: f64, offset: f64, rf_bandwidth: f64) -> Result<Self> {
        let mut fe = FrontEnd {
            channel_rate,
            working_rate,
            offset,
            rf_bandwidth,
            nco: Nco::default(),
            distance: 1.0,
            remain: 0.0,
            bank: Vec::default(),
            history: [Sample::default(); 2 * TAPS_PER_PHASE],
            head: 0,
            power_sum: 0.0,
            power_count: 0,
        };
        fe.configure(channel_rate, working_rate, offset, rf_bandwidth)?;
        Ok(fe)
    }

    /// Recompute the oscillator and the interpolation filter.
    pub fn configure(
        &mut self,
        channel_rate: f64,
        working_rate: f64,
        offset: f64,
        rf_bandwidth: f64,
    ) -> Result<()> {
        if !(channel_rate > 0.0 && working_rate > 0.0 && rf_bandwidth > 0.0) {
            return Err(Error::Configuration(format!(
                "invalid front end rates channel={channel_rate} working={working_rate} bandwidth={rf_bandwidth}"
            )));
        }
        self.channel_rate = channel_rate;
        self.working_rate = working_rate;
        self.offset = offset;
        self.rf_bandwidth = rf_bandwidth;
        self.nco = Nco::new(-offset, channel_rate);
        self.distance = channel_rate / working_rate;
        self.remain = if self.interpolating() { 0.0 } else { 1.0 };

        let nyquist = 0.5 * channel_rate.min(working_rate);
        let cutoff = (rf_bandwidth / 2.2).min(nyquist);
        let proto = design_lowpass(
            (cutoff / (channel_rate * PHASE_STEPS as f64)) as f32,
            PHASE_STEPS * TAPS_PER_PHASE / 2,
        );
        self.bank = (0..PHASE_STEPS)
            .map(|phase| {
                let mut taps = [0f32; TAPS_PER_PHASE];
                for (k, tap) in taps.iter_mut().enumerate() {
                    *tap = proto[k * PHASE_STEPS + phase] * PHASE_STEPS as f32;
                }
                taps
            })
            .collect();

        debug!(
            channel_rate,
            working_rate,
            offset,
            cutoff,
            interpolating = self.interpolating(),
            "front end configured"
        );
        Ok(())
    }

    pub fn channel_rate(&self) -> f64 {
        self.channel_rate
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn rf_bandwidth(&self) -> f64 {
        self.rf_bandwidth
    }

    pub fn working_rate(&self) -> f64 {
        self.working_rate
    }

    pub fn interpolating(&self) -> bool {
        self.distance < 1.0
    }

    fn push(&mut self, x: Sample) {
        self.head = (self.head + 1) % TAPS_PER_PHASE;
        self.history[self.head] = x;
        self.history[self.head + TAPS_PER_PHASE] = x;
    }

    /// Output at fraction `frac` of an input period.
    fn sample_at(&self, frac: f64) -> Sample {
        let phase = ((frac * PHASE_STEPS as f64) as usize).min(PHASE_STEPS - 1);
        let taps = &self.bank[phase];
        // newest first: history[head + TAPS_PER_PHASE - k]
        let newest = self.head + TAPS_PER_PHASE;
        let mut acc = Sample::default();
        for (k, tap) in taps.iter().enumerate() {
            acc += self.history[newest - k] * *tap;
        }
        acc
    }

    /// Process one channel sample, handing 0 or more working rate samples to `emit`.
    #[inline]
    pub fn process(&mut self, x: Sample, mut emit: impl FnMut(Sample)) {
        self.power_sum += x.norm_sqr() as f64;
        self.power_count += 1;

        let x = x * self.nco.next_value();
        self.push(x);

        if self.interpolating() {
            while self.remain < 1.0 {
                emit(self.sample_at(self.remain));
                self.remain += self.distance;
            }
            self.remain -= 1.0;
        } else {
            self.remain -= 1.0;
            if self.remain < 1.0 {
                emit(self.sample_at(self.remain.max(0.0)));
                self.remain += self.distance;
            }
        }
    }

    /// Mean channel power in dB since the last call, `None` if no samples were seen.
    pub fn take_power_db(&mut self) -> Option<f32> {
        if self.power_count == 0 {
            return None;
        }
        let mean = self.power_sum / self.power_count as f64;
        self.power_sum = 0.0;
        self.power_count = 0;
        Some((10.0 * mean.max(1e-20).log10()) as f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsp::expj;

    fn run(fe: &mut FrontEnd, input: &[Sample]) -> Vec<Sample> {
        let mut out = Vec::default();
        for x in input {
            fe.process(*x, |s| out.push(s));
        }
        out
    }

    #[test]
    fn test_output_rate() {
        let input = vec![Sample::new(1.0, 0.0); 3000];

        let mut fe = FrontEnd::new(3e6, 2e6, 0.0, 2e6).unwrap();
        assert!(!fe.interpolating());
        let n = run(&mut fe, &input).len();
        assert!((1999..=2001).contains(&n), "decimate {n}");

        let mut fe = FrontEnd::new(1e6, 2e6, 0.0, 2e6).unwrap();
        assert!(fe.interpolating());
        let n = run(&mut fe, &input).len();
        assert!((5999..=6001).contains(&n), "interpolate {n}");
    }

    #[test]
    fn test_offset_is_removed() {
        // tone at +100kHz in a 1MHz channel, tuned to that offset
        let tone: Vec<Sample> = (0..4000)
            .map(|i| expj(2.0 * std::f32::consts::PI * 0.1 * i as f32))
            .collect();
        let mut fe = FrontEnd::new(1e6, 1e6, 100e3, 400e3).unwrap();
        let out = run(&mut fe, &tone);
        let tail = &out[out.len() - 100..];
        let first = tail[0];
        for s in tail {
            assert!((s - first).norm() < 0.05, "{s} {first}");
        }
        assert!((first.norm() - 1.0).abs() < 0.05);
    }

    #[test]
    fn test_rejects_zero_rate() {
        assert!(matches!(
            FrontEnd::new(0.0, 2e6, 0.0, 1e6),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_power() {
        let mut fe = FrontEnd::new(2e6, 2e6, 0.0, 2e6).unwrap();
        run(&mut fe, &vec![Sample::new(0.1, 0.0); 100]);
        let db = fe.take_power_db().unwrap();
        assert!((db + 20.0).abs() < 1e-3);
        assert!(fe.take_power_db().is_none());
    }
}
