//! Signal processing building blocks shared by the front end and the receivers.
mod filters;
mod sampler;

pub use filters::*;
pub use sampler::*;

use std::f32::consts::PI;

use crate::Sample;

/// `e^(j*phase)`
#[inline]
pub fn expj(phase: f32) -> Sample {
    let (sin, cos) = phase.sin_cos();
    Sample::new(cos, sin)
}

/// Wrap a phase in radians into `[-pi, pi)`.
#[inline]
pub fn wrap_phase(phase: f32) -> f32 {
    (phase + PI).rem_euclid(2.0 * PI) - PI
}

/// Numerically controlled oscillator.
#[derive(Clone, Debug, Default)]
pub struct Nco {
    /// Cycles per sample.
    step: f64,
    /// Cycles in `[0, 1)`.
    phase: f64,
}

impl Nco {
    /// An oscillator producing `frequency / sample_rate` cycles per sample.
    pub fn new(frequency: f64, sample_rate: f64) -> Self {
        Nco {
            step: frequency / sample_rate,
            phase: 0.0,
        }
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    /// Next oscillator value.
    pub fn next_value(&mut self) -> Sample {
        let v = expj((2.0 * std::f64::consts::PI * self.phase) as f32);
        self.phase = (self.phase + self.step).rem_euclid(1.0);
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_phase() {
        assert!((wrap_phase(3.0 * PI) + PI).abs() < 1e-5);
        assert!((wrap_phase(-0.5) + 0.5).abs() < 1e-6);
        assert!((wrap_phase(2.0 * PI + 0.25) - 0.25).abs() < 1e-5);
    }

    #[test]
    fn test_nco_quarter_rate() {
        let mut nco = Nco::new(250.0, 1000.0);
        let v: Vec<Sample> = (0..4).map(|_| nco.next_value()).collect();
        assert!((v[0] - Sample::new(1.0, 0.0)).norm() < 1e-5);
        assert!((v[1] - Sample::new(0.0, 1.0)).norm() < 1e-5);
        assert!((v[2] - Sample::new(-1.0, 0.0)).norm() < 1e-5);
    }
}
