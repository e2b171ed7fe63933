use std::f32::consts::PI;

use crate::{settings::SamplerKind, Sample};

use super::{root_raised_cosine, shift_taps};

/// Symbol interpolator.
///
/// `interp(window, mu)` estimates the signal at fractional time `mu` in `[0, 1)` after
/// `window[0]`. `window` must hold at least [Sampler::readahead] samples.
#[derive(Clone, Debug)]
pub enum Sampler {
    Nearest,
    Linear,
    Rrc(RrcSampler),
}

impl Sampler {
    /// `omega` is samples per symbol.
    pub fn new(kind: SamplerKind, omega: f32, rolloff: f32, rejection: u32) -> Self {
        match kind {
            SamplerKind::Nearest => Sampler::Nearest,
            SamplerKind::Linear => Sampler::Linear,
            SamplerKind::Rrc => Sampler::Rrc(RrcSampler::new(omega, rolloff, rejection)),
        }
    }

    pub fn readahead(&self) -> usize {
        match self {
            Sampler::Nearest => 1,
            Sampler::Linear => 2,
            Sampler::Rrc(rrc) => rrc.readahead(),
        }
    }

    #[inline]
    pub fn interp(&self, window: &[Sample], mu: f32) -> Sample {
        match self {
            Sampler::Nearest => window[0],
            Sampler::Linear => window[0] * (1.0 - mu) + window[1] * mu,
            Sampler::Rrc(rrc) => rrc.interp(window, mu),
        }
    }

    /// Re-center the matched filter on the carrier, `freq` in cycles per sample.
    pub fn update_freq(&mut self, freq: f32) {
        if let Sampler::Rrc(rrc) = self {
            rrc.update_freq(freq);
        }
    }
}

/// Polyphase root raised cosine matched filter.
#[derive(Clone, Debug)]
pub struct RrcSampler {
    taps: Vec<f32>,
    shifted: Vec<Sample>,
    subsampling: usize,
    freq: f32,
}

impl RrcSampler {
    pub fn new(omega: f32, rolloff: f32, rejection: u32) -> Self {
        let subsampling = ((64.0 / omega) as usize).max(1);
        // everything relative to the symbol rate
        let frrc = omega * subsampling as f32;
        let transition = 0.5 * rolloff;
        let order = (rejection as f32 * frrc / (22.0 * transition)) as usize;
        let mut taps = root_raised_cosine(order, 1.0 / frrc, rolloff);
        // unity gain per phase
        for tap in taps.iter_mut() {
            *tap *= subsampling as f32;
        }
        let shifted = shift_taps(&taps, 0.0);
        RrcSampler {
            taps,
            shifted,
            subsampling,
            freq: 0.0,
        }
    }

    pub fn ntaps(&self) -> usize {
        self.taps.len()
    }

    fn readahead(&self) -> usize {
        self.taps.len() / self.subsampling + 1
    }

    fn update_freq(&mut self, freq: f32) {
        // tolerate a small fraction of the per tap phase step before recomputing
        if (freq - self.freq).abs() * 2.0 * PI * self.taps.len() as f32 / self.subsampling as f32
            > 0.05
        {
            self.freq = freq;
            self.shifted = shift_taps(&self.taps, freq / self.subsampling as f32);
        }
    }

    #[inline]
    fn interp(&self, window: &[Sample], mu: f32) -> Sample {
        let offset = (((1.0 - mu) * self.subsampling as f32) as usize).min(self.subsampling);
        self.shifted[offset..]
            .iter()
            .step_by(self.subsampling)
            .zip(window)
            .fold(Sample::default(), |acc, (h, x)| acc + h * x)
    }
}
