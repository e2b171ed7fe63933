//! Filter design

use std::f32::consts::PI;

use crate::Sample;

/// Windowed sinc lowpass with `2 * half_length` taps, unity gain at DC.
///
/// `cutoff` is relative to the sample rate the taps run at.
pub fn design_lowpass(cutoff: f32, half_length: usize) -> Vec<f32> {
    let window_freq = PI / half_length as f32;
    let mut halftaps: Vec<f32> = (0..half_length)
        .map(|i| {
            let t = i as f32 + 0.5;
            let sinc_phase = 2.0 * PI * cutoff * t;
            // raised cosine window, zero at the ends
            let window = 0.5 + 0.5 * (t * window_freq).cos();
            sinc_phase.sin() / sinc_phase * window
        })
        .collect();

    let scaling = 0.5 / halftaps.iter().sum::<f32>();
    for value in halftaps.iter_mut() {
        *value *= scaling;
    }

    halftaps
        .iter()
        .rev()
        .chain(halftaps.iter())
        .copied()
        .collect()
}

/// Root raised cosine impulse response with `(order + 1) | 1` taps and unity DC gain.
///
/// `symbol_ratio` is the symbol rate relative to the rate the taps run at.
pub fn root_raised_cosine(order: usize, symbol_ratio: f32, rolloff: f32) -> Vec<f32> {
    let beta = rolloff;
    let ncoeffs = (order + 1) | 1;
    let center = (ncoeffs / 2) as f32;
    let mut taps: Vec<f32> = (0..ncoeffs)
        .map(|i| {
            let t = (i as f32 - center) * symbol_ratio;
            if t.abs() < 1e-6 {
                1.0 - beta + 4.0 * beta / PI
            } else if ((4.0 * beta * t).abs() - 1.0).abs() < 1e-5 {
                let a = PI / (4.0 * beta);
                beta / 2f32.sqrt() * ((1.0 + 2.0 / PI) * a.sin() + (1.0 - 2.0 / PI) * a.cos())
            } else {
                let num = (PI * t * (1.0 - beta)).sin() + 4.0 * beta * t * (PI * t * (1.0 + beta)).cos();
                let den = PI * t * (1.0 - (4.0 * beta * t).powi(2));
                num / den
            }
        })
        .collect();

    let scaling = 1.0 / taps.iter().sum::<f32>();
    for tap in taps.iter_mut() {
        *tap *= scaling;
    }
    taps
}

/// Shift a real filter to be centered on `freq` cycles per tap.
pub fn shift_taps(taps: &[f32], freq: f32) -> Vec<Sample> {
    let center = (taps.len() / 2) as f32;
    taps.iter()
        .enumerate()
        .map(|(i, &h)| super::expj(2.0 * PI * freq * (i as f32 - center)) * h)
        .collect()
}

/// Direct form FIR over a real valued tap set.
pub fn convolve(taps: &[f32], input: &[Sample]) -> Sample {
    taps.iter()
        .zip(input)
        .fold(Sample::default(), |acc, (&h, &x)| acc + x * h)
}
