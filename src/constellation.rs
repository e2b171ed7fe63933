//! Constellation catalogue and symbol decisions.
//!
//! All constellations are normalized to unit mean symbol energy. The index of a point is its bit
//! label, most significant bit transmitted first.
use std::f32::consts::{FRAC_1_SQRT_2, PI};

use crate::{dsp::expj, settings::Modulation, Error, Result, Sample};

/// A demodulated symbol: the gain and carrier corrected sample and the label of the nearest point.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SoftSymbol {
    pub iq: Sample,
    pub nearest: u8,
}

/// `r * e^(j*2*pi*k/n)`
fn polar(r: f32, n: f32, k: f32) -> Sample {
    expj(2.0 * PI * k / n) * r
}

/// 64APSK-E rows: ring and four angles in units of pi.
const APSK64E_ROWS: [(usize, [(f32, f32); 4]); 16] = [
    (4, [(1., 4.), (7., 4.), (3., 4.), (5., 4.)]),
    (4, [(13., 28.), (43., 28.), (15., 28.), (41., 28.)]),
    (4, [(1., 28.), (55., 28.), (27., 28.), (29., 28.)]),
    (1, [(1., 4.), (7., 4.), (3., 4.), (5., 4.)]),
    (4, [(9., 28.), (47., 28.), (19., 28.), (37., 28.)]),
    (4, [(11., 28.), (45., 28.), (17., 28.), (39., 28.)]),
    (3, [(1., 20.), (39., 20.), (19., 20.), (21., 20.)]),
    (2, [(1., 12.), (23., 12.), (11., 12.), (13., 12.)]),
    (4, [(5., 28.), (51., 28.), (23., 28.), (33., 28.)]),
    (3, [(9., 20.), (31., 20.), (11., 20.), (29., 20.)]),
    (4, [(3., 28.), (53., 28.), (25., 28.), (31., 28.)]),
    (2, [(5., 12.), (19., 12.), (7., 12.), (17., 12.)]),
    (3, [(1., 4.), (7., 4.), (3., 4.), (5., 4.)]),
    (3, [(7., 20.), (33., 20.), (13., 20.), (27., 20.)]),
    (3, [(3., 20.), (37., 20.), (17., 20.), (23., 20.)]),
    (2, [(1., 4.), (7., 4.), (3., 4.), (5., 4.)]),
];

#[derive(Clone, Debug)]
pub struct Constellation {
    modulation: Modulation,
    points: Vec<Sample>,
    bits_per_symbol: usize,
}

impl Constellation {
    fn from_points(modulation: Modulation, mut points: Vec<Sample>) -> Self {
        let energy = points.iter().map(|p| p.norm_sqr()).sum::<f32>() / points.len() as f32;
        let scale = 1.0 / energy.sqrt();
        for p in points.iter_mut() {
            *p *= scale;
        }
        let bits_per_symbol = points.len().trailing_zeros() as usize;
        Constellation {
            modulation,
            points,
            bits_per_symbol,
        }
    }

    /// Constellation with the default ring ratios.
    pub fn new(modulation: Modulation) -> Result<Self> {
        let c = match modulation {
            Modulation::Bpsk => Self::bpsk(),
            Modulation::Qpsk => Self::qpsk(),
            Modulation::Psk8 => Self::psk8(),
            Modulation::Apsk16 => Self::apsk16(2.57),
            Modulation::Apsk32 => Self::apsk32(2.53, 4.30),
            Modulation::Apsk64e => Self::apsk64e(2.4, 4.3, 7.0),
            Modulation::Qam16 => Self::qam(16),
            Modulation::Qam64 => Self::qam(64),
            Modulation::Qam256 => Self::qam(256),
            Modulation::Unset => {
                return Err(Error::Configuration("constellation is not set".into()))
            }
        };
        Ok(c)
    }

    pub fn bpsk() -> Self {
        Self::from_points(
            Modulation::Bpsk,
            vec![polar(1.0, 2.0, 0.25), polar(1.0, 2.0, 1.25)],
        )
    }

    pub fn qpsk() -> Self {
        let a = FRAC_1_SQRT_2;
        Self::from_points(
            Modulation::Qpsk,
            vec![
                Sample::new(a, a),
                Sample::new(a, -a),
                Sample::new(-a, a),
                Sample::new(-a, -a),
            ],
        )
    }

    pub fn psk8() -> Self {
        let order = [1.0, 0.0, 4.0, 5.0, 2.0, 7.0, 3.0, 6.0];
        Self::from_points(
            Modulation::Psk8,
            order.iter().map(|&k| polar(1.0, 8.0, k)).collect(),
        )
    }

    /// DVB-S2 16APSK, `gamma` is the outer to inner ring ratio.
    pub fn apsk16(gamma: f32) -> Self {
        let r1 = (4.0 / (1.0 + 3.0 * gamma * gamma)).sqrt();
        let r2 = gamma * r1;
        let outer = [1.5, 10.5, 4.5, 7.5, 0.5, 11.5, 5.5, 6.5, 2.5, 9.5, 3.5, 8.5];
        let inner = [0.5, 3.5, 1.5, 2.5];
        let points = outer
            .iter()
            .map(|&k| polar(r2, 12.0, k))
            .chain(inner.iter().map(|&k| polar(r1, 4.0, k)))
            .collect();
        Self::from_points(Modulation::Apsk16, points)
    }

    /// DVB-S2 32APSK with ring ratios `gamma1 = r2/r1` and `gamma2 = r3/r1`.
    pub fn apsk32(gamma1: f32, gamma2: f32) -> Self {
        let r1 = (8.0 / (1.0 + 3.0 * gamma1 * gamma1 + 4.0 * gamma2 * gamma2)).sqrt();
        let r2 = gamma1 * r1;
        let r3 = gamma2 * r1;
        let rings = [(r1, 4.0), (r2, 12.0), (r3, 16.0)];
        // (ring, position)
        let table: [(usize, f32); 32] = [
            (1, 1.5), (1, 2.5), (1, 10.5), (1, 9.5), (1, 4.5), (1, 3.5), (1, 7.5), (1, 8.5),
            (2, 1.0), (2, 3.0), (2, 14.0), (2, 12.0), (2, 6.0), (2, 4.0), (2, 9.0), (2, 11.0),
            (1, 0.5), (0, 0.5), (1, 11.5), (0, 3.5), (1, 5.5), (0, 1.5), (1, 6.5), (0, 2.5),
            (2, 0.0), (2, 2.0), (2, 15.0), (2, 13.0), (2, 7.0), (2, 5.0), (2, 8.0), (2, 10.0),
        ];
        let points = table
            .iter()
            .map(|&(ring, k)| polar(rings[ring].0, rings[ring].1, k))
            .collect();
        Self::from_points(Modulation::Apsk32, points)
    }

    /// 64APSK as used by the DVB-S2X "E" constellations.
    pub fn apsk64e(gamma1: f32, gamma2: f32, gamma3: f32) -> Self {
        let r1 = (64.0
            / (4.0
                + 12.0 * gamma1 * gamma1
                + 20.0 * gamma2 * gamma2
                + 28.0 * gamma3 * gamma3))
            .sqrt();
        let radii = [0.0, r1, gamma1 * r1, gamma2 * r1, gamma3 * r1];
        let points = APSK64E_ROWS
            .iter()
            .flat_map(|(ring, angles)| {
                let r = radii[*ring];
                angles.iter().map(move |(num, den)| expj(PI * num / den) * r)
            })
            .collect();
        Self::from_points(Modulation::Apsk64e, points)
    }

    /// Square QAM with `n` points.
    pub fn qam(n: usize) -> Self {
        let modulation = match n {
            16 => Modulation::Qam16,
            64 => Modulation::Qam64,
            _ => Modulation::Qam256,
        };
        let m = (n as f32).sqrt() as usize;
        let half = (m as f32 - 1.0) / 2.0;
        let mut points = Vec::with_capacity(n);
        for x in 0..m {
            for y in 0..m {
                points.push(Sample::new(x as f32 - half, y as f32 - half));
            }
        }
        Self::from_points(modulation, points)
    }

    pub fn modulation(&self) -> Modulation {
        self.modulation
    }

    pub fn points(&self) -> &[Sample] {
        &self.points
    }

    pub fn size(&self) -> usize {
        self.points.len()
    }

    pub fn bits_per_symbol(&self) -> usize {
        self.bits_per_symbol
    }

    /// Rotational symmetry order used to bound the carrier capture range.
    pub fn symmetry(&self) -> u32 {
        match self.points.len() {
            2 => 2,
            4 => 4,
            8 => 8,
            16 => 12,
            _ => 16,
        }
    }

    /// Label of the point closest to `s`.
    #[inline]
    pub fn nearest(&self, s: Sample) -> u8 {
        match self.modulation {
            Modulation::Qpsk => (u8::from(s.re < 0.0) << 1) | u8::from(s.im < 0.0),
            _ => {
                let mut best = 0;
                let mut best_d = f32::MAX;
                for (i, p) in self.points.iter().enumerate() {
                    let d = (s - p).norm_sqr();
                    if d < best_d {
                        best_d = d;
                        best = i;
                    }
                }
                best as u8
            }
        }
    }

    pub fn point(&self, label: u8) -> Sample {
        self.points[label as usize]
    }

    pub fn decide(&self, s: Sample) -> SoftSymbol {
        SoftSymbol {
            iq: s,
            nearest: self.nearest(s),
        }
    }

    /// Max-log bit likelihoods of `s`, most significant label bit first.
    ///
    /// Positive values favour a 1 bit. `scale` converts squared distances into LLR units before
    /// saturating to `i8`.
    pub fn llrs(&self, s: Sample, scale: f32, out: &mut [i8]) {
        let bps = self.bits_per_symbol;
        let mut d0 = [f32::MAX; 8];
        let mut d1 = [f32::MAX; 8];
        for (label, p) in self.points.iter().enumerate() {
            let d = (s - p).norm_sqr();
            for b in 0..bps {
                let bit = (label >> (bps - 1 - b)) & 1;
                if bit == 0 {
                    d0[b] = d0[b].min(d);
                } else {
                    d1[b] = d1[b].min(d);
                }
            }
        }
        for b in 0..bps {
            out[b] = saturate((d0[b] - d1[b]) * scale);
        }
    }
}

#[inline]
pub(crate) fn saturate(v: f32) -> i8 {
    v.round().clamp(-127.0, 127.0) as i8
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Modulation::Bpsk, 2)]
    #[test_case(Modulation::Qpsk, 4)]
    #[test_case(Modulation::Psk8, 8)]
    #[test_case(Modulation::Apsk16, 16)]
    #[test_case(Modulation::Apsk32, 32)]
    #[test_case(Modulation::Apsk64e, 64)]
    #[test_case(Modulation::Qam16, 16)]
    #[test_case(Modulation::Qam64, 64)]
    #[test_case(Modulation::Qam256, 256)]
    fn test_unit_energy_and_distinct(modulation: Modulation, size: usize) {
        let c = Constellation::new(modulation).unwrap();
        assert_eq!(c.size(), size);
        let energy: f32 = c.points().iter().map(|p| p.norm_sqr()).sum::<f32>() / size as f32;
        assert!((energy - 1.0).abs() < 1e-4);
        for (i, p) in c.points().iter().enumerate() {
            assert_eq!(c.nearest(*p) as usize, i, "{modulation:?} point {i}");
        }
    }

    #[test]
    fn test_qpsk_labels() {
        let c = Constellation::qpsk();
        assert_eq!(c.nearest(Sample::new(0.7, 0.7)), 0);
        assert_eq!(c.nearest(Sample::new(0.7, -0.7)), 1);
        assert_eq!(c.nearest(Sample::new(-0.7, 0.7)), 2);
        assert_eq!(c.nearest(Sample::new(-0.7, -0.7)), 3);
    }

    #[test]
    fn test_llr_signs_match_label() {
        let c = Constellation::apsk16(2.85);
        let mut llrs = [0i8; 4];
        for label in 0..16u8 {
            c.llrs(c.point(label), 20.0, &mut llrs);
            for (b, llr) in llrs.iter().enumerate() {
                let bit = (label >> (3 - b)) & 1;
                assert_eq!(*llr > 0, bit == 1, "label {label} bit {b}");
            }
        }
    }
}
