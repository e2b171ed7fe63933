//! DVB-S (EN 300 421) inner and outer decoding.
//!
//! The chain is `deconvolution | viterbi -> mpeg_sync -> interleaver -> reed_solomon -> randomizer`,
//! each a [crate::scheduler::Stage].
use std::{
    f32::consts::PI,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use crate::{constellation::Constellation, dsp::expj, Sample};

pub mod convolutional;
pub mod deconvolution;
pub mod interleaver;
pub mod mpeg_sync;
pub mod randomizer;
pub mod reed_solomon;
pub mod viterbi;

/// One of the phase ambiguities a carrier loop may settle on.
///
/// 180 degree rotations of BPSK and QPSK invert every coded bit, which the MPEG sync detector
/// resolves as a polarity inversion, so only half of their rotations are tried.
#[derive(Clone, Debug)]
pub struct Hypothesis {
    pub conjugate: bool,
    /// Radians.
    pub rotation: f32,
    /// Received label to transmitted label.
    pub map: Vec<u8>,
}

impl Hypothesis {
    #[inline]
    pub fn apply(&self, s: Sample) -> Sample {
        let s = if self.conjugate { s.conj() } else { s };
        s * expj(self.rotation)
    }
}

/// Every hypothesis worth trying for `constellation`, identity first.
pub fn hypotheses(constellation: &Constellation) -> Vec<Hypothesis> {
    let size = constellation.size();
    let symmetry = constellation.symmetry() as usize;
    let nrotations = if size <= 4 { symmetry / 2 } else { symmetry };
    let nconj = if size == 2 { 1 } else { 2 };

    let mut out = Vec::with_capacity(nrotations * nconj);
    for conj in 0..nconj {
        for rot in 0..nrotations {
            let mut h = Hypothesis {
                conjugate: conj == 1,
                rotation: 2.0 * PI * rot as f32 / symmetry as f32,
                map: Vec::with_capacity(size),
            };
            h.map = (0..size)
                .map(|label| constellation.nearest(h.apply(constellation.point(label as u8))))
                .collect();
            out.push(h);
        }
    }
    out
}

/// Requests from the MPEG sync detector to the inner decoder to try its next hypothesis.
#[derive(Clone, Debug, Default)]
pub struct SyncFeedback(Arc<AtomicU32>);

impl SyncFeedback {
    pub fn request_next(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Monotonic request counter.
    pub fn requests(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qpsk_hypotheses() {
        let hs = hypotheses(&Constellation::qpsk());
        assert_eq!(hs.len(), 4);
        assert_eq!(hs[0].map, vec![0, 1, 2, 3]);
        for h in &hs {
            let mut sorted = h.map.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, vec![0, 1, 2, 3], "{h:?}");
        }
    }

    #[test]
    fn test_bpsk_needs_one_hypothesis() {
        assert_eq!(hypotheses(&Constellation::bpsk()).len(), 1);
    }

    #[test]
    fn test_feedback_is_shared() {
        let a = SyncFeedback::default();
        let b = a.clone();
        a.request_next();
        assert_eq!(b.requests(), 1);
    }
}
