//! The DVB-S inner convolutional code: K=7 mother code of rate 1/2 and its puncturing patterns.
use crate::{settings::CodeRate, Error, Result};

/// Generator of the X output, 171 octal, bit 6 taps the newest input bit.
pub const G1: u8 = 0o171;
/// Generator of the Y output, 133 octal.
pub const G2: u8 = 0o133;
/// Bits of encoder memory.
pub const MEMORY: usize = 6;

/// One of the two mother code outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Branch {
    X,
    Y,
}

impl Branch {
    pub fn poly(&self) -> u8 {
        match self {
            Branch::X => G1,
            Branch::Y => G2,
        }
    }
}

/// A puncturing pattern: per block of `bits_in` input bits, the transmitted mother code outputs in
/// order, as `(branch, input index within the block)`.
#[derive(Debug, PartialEq, Eq)]
pub struct PunctureSpec {
    pub rate: CodeRate,
    pub bits_in: usize,
    pub outputs: &'static [(Branch, usize)],
}

impl PunctureSpec {
    pub fn bits_out(&self) -> usize {
        self.outputs.len()
    }
}

use Branch::{X, Y};

static PUNCTURE_SPECS: [PunctureSpec; 7] = [
    PunctureSpec {
        rate: CodeRate::Fec12,
        bits_in: 1,
        outputs: &[(X, 0), (Y, 0)],
    },
    PunctureSpec {
        rate: CodeRate::Fec23,
        bits_in: 2,
        outputs: &[(X, 0), (Y, 0), (Y, 1)],
    },
    PunctureSpec {
        rate: CodeRate::Fec46,
        bits_in: 4,
        outputs: &[(X, 0), (Y, 0), (Y, 1), (X, 2), (Y, 2), (Y, 3)],
    },
    PunctureSpec {
        rate: CodeRate::Fec34,
        bits_in: 3,
        outputs: &[(X, 0), (Y, 0), (Y, 1), (X, 2)],
    },
    PunctureSpec {
        rate: CodeRate::Fec45,
        bits_in: 4,
        outputs: &[(X, 0), (Y, 0), (Y, 1), (X, 2), (X, 3)],
    },
    PunctureSpec {
        rate: CodeRate::Fec56,
        bits_in: 5,
        outputs: &[(X, 0), (Y, 0), (Y, 1), (X, 2), (Y, 3), (X, 4)],
    },
    PunctureSpec {
        rate: CodeRate::Fec78,
        bits_in: 7,
        outputs: &[
            (X, 0),
            (Y, 0),
            (Y, 1),
            (Y, 2),
            (Y, 3),
            (X, 4),
            (Y, 5),
            (X, 6),
        ],
    },
];

/// Puncturing for `rate` carried by a constellation of `bits_per_symbol` bits.
///
/// Rate 2/3 blocks of 3 bits do not fill whole QPSK or 64-point symbols and are replaced by the
/// equivalent 4/6 pattern.
///
/// # Errors
/// [Error::Configuration] if the rate is not a DVB-S rate or its blocks cannot be mapped on whole
/// symbols.
pub fn puncture_spec(rate: CodeRate, bits_per_symbol: usize) -> Result<&'static PunctureSpec> {
    let rate = match (rate, bits_per_symbol) {
        (CodeRate::Fec23, 2 | 6) => CodeRate::Fec46,
        (rate, _) => rate,
    };
    let spec = PUNCTURE_SPECS
        .iter()
        .find(|s| s.rate == rate)
        .ok_or_else(|| Error::Configuration(format!("no convolutional code for rate {rate:?}")))?;
    if bits_per_symbol == 0 || spec.bits_out() % bits_per_symbol != 0 {
        return Err(Error::Configuration(format!(
            "rate {rate:?} does not fit {bits_per_symbol} bits per symbol"
        )));
    }
    Ok(spec)
}

#[inline]
pub fn parity(x: u64) -> u8 {
    (x.count_ones() & 1) as u8
}

/// Encoder register state after feeding `bit`, returns `(register, next state)`.
#[inline]
pub fn shift(state: u8, bit: u8) -> (u8, u8) {
    let reg = (bit << MEMORY) | state;
    (reg, reg >> 1)
}

/// Punctured convolutional encoder, one bit per output byte.
#[derive(Clone, Debug)]
pub struct ConvolutionalEncoder {
    spec: &'static PunctureSpec,
    state: u8,
    pending: Vec<u8>,
}

impl ConvolutionalEncoder {
    pub fn new(spec: &'static PunctureSpec) -> Self {
        Self {
            spec,
            state: 0,
            pending: Vec::with_capacity(spec.bits_in),
        }
    }

    /// Encode one input bit, appending coded bits whenever a puncturing block completes.
    pub fn push_bit(&mut self, bit: u8, out: &mut Vec<u8>) {
        self.pending.push(bit & 1);
        if self.pending.len() < self.spec.bits_in {
            return;
        }
        let mut regs = [0u8; 8];
        for (reg, bit) in regs.iter_mut().zip(self.pending.drain(..)) {
            let (r, next) = shift(self.state, bit);
            *reg = r;
            self.state = next;
        }
        for (branch, index) in self.spec.outputs {
            out.push(parity(u64::from(regs[*index] & branch.poly())));
        }
    }

    /// Encode bytes, most significant bit first.
    pub fn encode(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(bytes.len() * 8 * self.spec.bits_out() / self.spec.bits_in + 8);
        for byte in bytes {
            for b in (0..8).rev() {
                self.push_bit((byte >> b) & 1, &mut out);
            }
        }
        out
    }
}

/// Group coded bits into constellation labels, first bit in the most significant position.
pub fn bits_to_labels(bits: &[u8], bits_per_symbol: usize) -> Vec<u8> {
    bits.chunks_exact(bits_per_symbol)
        .map(|c| c.iter().fold(0u8, |acc, b| (acc << 1) | b))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(CodeRate::Fec12, 2, 1, 2)]
    #[test_case(CodeRate::Fec23, 2, 4, 6)]
    #[test_case(CodeRate::Fec23, 3, 2, 3)]
    #[test_case(CodeRate::Fec34, 2, 3, 4)]
    #[test_case(CodeRate::Fec56, 2, 5, 6)]
    #[test_case(CodeRate::Fec78, 2, 7, 8)]
    #[test_case(CodeRate::Fec78, 1, 7, 8)]
    fn test_spec_selection(rate: CodeRate, bps: usize, bits_in: usize, bits_out: usize) {
        let spec = puncture_spec(rate, bps).unwrap();
        assert_eq!(spec.bits_in, bits_in);
        assert_eq!(spec.bits_out(), bits_out);
    }

    #[test]
    fn test_unfit_rates() {
        assert!(puncture_spec(CodeRate::Fec45, 2).is_err());
        assert!(puncture_spec(CodeRate::Fec35, 2).is_err());
    }

    #[test]
    fn test_impulse_response() {
        // a single one followed by zeros reproduces the generators, newest tap first
        let mut enc = ConvolutionalEncoder::new(puncture_spec(CodeRate::Fec12, 2).unwrap());
        let coded = enc.encode(&[0x80]);
        let x: Vec<u8> = coded.iter().step_by(2).copied().collect();
        let y: Vec<u8> = coded.iter().skip(1).step_by(2).copied().collect();
        assert_eq!(x[..7], [1, 1, 1, 1, 0, 0, 1]);
        assert_eq!(y[..7], [1, 0, 1, 1, 0, 1, 1]);
    }

    #[test]
    fn test_labels() {
        assert_eq!(bits_to_labels(&[1, 0, 0, 1, 1, 1], 2), vec![2, 1, 3]);
    }
}
