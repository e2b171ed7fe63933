//! PL header coding and physical layer scrambling.
//!
//! A PL header is 90 pi/2-BPSK symbols: the 26 bit start of frame marker followed by the 64 bit
//! PLS code. Payload symbols are scrambled with the Gold sequence of scrambling code 0.
use std::f32::consts::FRAC_1_SQRT_2;

use crate::Sample;

use super::Pls;

/// Start of frame marker, transmitted most significant bit first.
pub const SOF: u32 = 0x018D_2E82;
pub const SOF_LEN: usize = 26;
pub const PLS_LEN: usize = 64;
pub const HEADER_LEN: usize = SOF_LEN + PLS_LEN;
/// Error budgets for accepting a header.
pub const MAX_SOF_ERRORS: u32 = 12;
pub const MAX_PLS_ERRORS: u32 = 7;

/// XOR mask applied to every PLS codeword.
pub const PLS_SCRAMBLING: u64 = 0x719D_83C9_5342_2DFA;
/// Rows of the first order Reed-Muller generator.
const PLS_GENERATOR: [u32; 6] = [
    0x5555_5555,
    0x3333_3333,
    0x0f0f_0f0f,
    0x00ff_00ff,
    0x0000_ffff,
    0xffff_ffff,
];
/// Offset of the second m-sequence tap into the Gold sequence.
const GOLD_OFFSET: usize = 131072;

/// Unmodulated pilot symbol.
pub const PILOT: Sample = Sample::new(FRAC_1_SQRT_2, FRAC_1_SQRT_2);

/// pi/2-BPSK point for `bit` at header position `i`.
#[inline]
pub fn pi2bpsk(bit: u8, i: usize) -> Sample {
    let odd = (i & 1) as u8;
    let re = 1.0 - 2.0 * f32::from((bit ^ odd) & 1);
    let im = 1.0 - 2.0 * f32::from(bit & 1);
    Sample::new(re * FRAC_1_SQRT_2, im * FRAC_1_SQRT_2)
}

/// Soft pi/2-BPSK decision, positive for a 0 bit.
#[inline]
pub fn pi2bpsk_soft(s: Sample, i: usize) -> f32 {
    if i & 1 == 0 {
        s.im + s.re
    } else {
        s.im - s.re
    }
}

/// Bit `i` of the start of frame marker.
#[inline]
pub fn sof_bit(i: usize) -> u8 {
    ((SOF >> (SOF_LEN - 1 - i)) & 1) as u8
}

/// Scrambled 64 bit PLS codeword of a 7 bit PLS index, first bit in the most significant position.
pub fn pls_codeword(index: u8) -> u64 {
    let mut code = 0u32;
    for (row, g) in PLS_GENERATOR.iter().enumerate() {
        if (index >> (6 - row)) & 1 != 0 {
            code ^= g;
        }
    }
    let mut word = 0u64;
    for bit in (0..32).rev() {
        let y = u64::from((code >> bit) & 1);
        let pair = if index & 1 != 0 {
            (y << 1) | (y ^ 1)
        } else {
            (y << 1) | y
        };
        word = (word << 2) | pair;
    }
    word ^ PLS_SCRAMBLING
}

/// The 90 header symbols announcing `pls`.
pub fn header_symbols(pls: Pls) -> [Sample; HEADER_LEN] {
    let code = pls_codeword(pls.index());
    let mut out = [Sample::default(); HEADER_LEN];
    for (i, s) in out.iter_mut().enumerate() {
        let bit = if i < SOF_LEN {
            sof_bit(i)
        } else {
            ((code >> (PLS_LEN - 1 - (i - SOF_LEN))) & 1) as u8
        };
        *s = pi2bpsk(bit, i);
    }
    out
}

/// Result of decoding the 90 symbols of a candidate header.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DecodedHeader {
    pub pls: Pls,
    pub sof_errors: u32,
    pub pls_errors: u32,
}

impl DecodedHeader {
    pub fn is_valid(&self) -> bool {
        self.sof_errors <= MAX_SOF_ERRORS && self.pls_errors <= MAX_PLS_ERRORS
    }
}

/// Maximum likelihood PLS decoder over the 128 codewords.
#[derive(Clone, Debug)]
pub struct PlsDecoder {
    codewords: Vec<u64>,
}

impl Default for PlsDecoder {
    fn default() -> Self {
        PlsDecoder {
            codewords: (0..128u8).map(pls_codeword).collect(),
        }
    }
}

impl PlsDecoder {
    pub fn codeword(&self, index: u8) -> u64 {
        self.codewords[index as usize & 127]
    }

    /// Decode phase corrected header symbols.
    pub fn decode(&self, symbols: &[Sample]) -> DecodedHeader {
        let mut sof_errors = 0;
        for (i, s) in symbols[..SOF_LEN].iter().enumerate() {
            let hard = u8::from(pi2bpsk_soft(*s, i) < 0.0);
            sof_errors += u32::from(hard != sof_bit(i));
        }

        let mut soft = [0f32; PLS_LEN];
        let mut hard = 0u64;
        for (k, v) in soft.iter_mut().enumerate() {
            *v = pi2bpsk_soft(symbols[SOF_LEN + k], SOF_LEN + k);
            hard = (hard << 1) | u64::from(*v < 0.0);
        }
        let (best, _) = self
            .codewords
            .iter()
            .enumerate()
            .map(|(index, word)| {
                let score: f32 = soft
                    .iter()
                    .enumerate()
                    .map(|(k, v)| {
                        if (word >> (PLS_LEN - 1 - k)) & 1 == 0 {
                            *v
                        } else {
                            -*v
                        }
                    })
                    .sum();
                (index, score)
            })
            .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

        DecodedHeader {
            pls: Pls::from_index(best as u8),
            sof_errors,
            pls_errors: (hard ^ self.codewords[best]).count_ones(),
        }
    }
}

/// Gold sequence `R_n` of scrambling code 0, one value in 0..4 per payload symbol.
pub fn pl_scrambling(len: usize) -> Vec<u8> {
    let mut x: u32 = 1;
    let mut y: u32 = 0x3ffff;
    let mut z = Vec::with_capacity(GOLD_OFFSET + len);
    for _ in 0..GOLD_OFFSET + len {
        z.push(((x ^ y) & 1) as u8);
        let bx = ((x >> 7) ^ x) & 1;
        x = ((bx << 18) | x) >> 1;
        let by = ((y >> 10) ^ (y >> 7) ^ (y >> 5) ^ y) & 1;
        y = ((by << 18) | y) >> 1;
    }
    (0..len).map(|i| z[i] | (z[i + GOLD_OFFSET] << 1)).collect()
}

/// Rotate a scrambled symbol back by `r` quarter turns.
#[inline]
pub fn descramble(s: Sample, r: u8) -> Sample {
    match r & 3 {
        0 => s,
        1 => Sample::new(s.im, -s.re),
        2 => -s,
        _ => Sample::new(-s.im, s.re),
    }
}

/// Inverse of [descramble].
#[inline]
pub fn scramble(s: Sample, r: u8) -> Sample {
    descramble(s, 4 - (r & 3))
}

/// Sign pattern of the differential correlation between header symbols `i` and `i + 1`.
///
/// For pi/2-BPSK, `s[i+1] * conj(s[i])` is `+j` or `-j` depending on the two bits and on the parity
/// of `i`. `pair_bits` is `bit[i] ^ bit[i + 1]`.
#[inline]
pub fn diff_sign(pair_bits: u8, i: usize) -> f32 {
    if (pair_bits ^ (i & 1) as u8) & 1 == 0 {
        1.0
    } else {
        -1.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codewords_distance() {
        let dec = PlsDecoder::default();
        for a in 0..128u8 {
            for b in (a + 1)..128 {
                // pairs differing only in the pilot flag are complementary on every second bit
                let d = (dec.codeword(a) ^ dec.codeword(b)).count_ones();
                assert!(d >= 32, "{a} {b} {d}");
            }
        }
    }

    #[test]
    fn test_header_decodes_with_errors() {
        let dec = PlsDecoder::default();
        let pls = Pls::new(13, false, true);
        let mut symbols = header_symbols(pls);
        for i in [3, 30, 41, 55, 77] {
            symbols[i] = -symbols[i];
        }
        let h = dec.decode(&symbols);
        assert_eq!(h.pls, pls);
        assert_eq!(h.sof_errors, 1);
        assert_eq!(h.pls_errors, 4);
        assert!(h.is_valid());
    }

    #[test]
    fn test_header_differential_signs() {
        let pls = Pls::new(4, false, false);
        let symbols = header_symbols(pls);
        for i in 0..SOF_LEN - 1 {
            let d = symbols[i + 1] * symbols[i].conj();
            let sign = diff_sign(sof_bit(i) ^ sof_bit(i + 1), i);
            assert!((d.im - sign).abs() < 1e-5 && d.re.abs() < 1e-5, "{i} {d}");
        }
    }

    #[test]
    fn test_scrambling_sequence() {
        let rn = pl_scrambling(64);
        assert_eq!(rn[..8], [0, 1, 1, 1, 1, 3, 1, 3]);
        assert!(rn.iter().all(|r| *r < 4));
        let s = Sample::new(0.3, -0.8);
        for r in 0..4 {
            assert!((descramble(scramble(s, r), r) - s).norm() < 1e-6);
        }
    }
}
