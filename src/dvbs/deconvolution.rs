//! Algebraic inverse of the punctured convolutional code.
//!
//! Every decoded bit is the parity of a fixed mask over the last 64 received coded bits. The
//! masks are solved over GF(2) once per code rate. There is no error correction, a coded bit error
//! spreads to the few decoded bits whose mask covers it and Reed-Solomon cleans up.
use tracing::{debug, trace};

use super::{
    convolutional::{parity, ConvolutionalEncoder, PunctureSpec},
    Hypothesis, SyncFeedback,
};
use crate::{
    constellation::SoftSymbol,
    pipe::{PipeId, Pipes},
    report::Event,
    scheduler::Stage,
    Error, Result,
};

/// Coded bits visible to the masks.
const TRACEBACK: usize = 64;
/// Decoded bytes per run, enough to tell hypotheses apart.
const MIN_BYTES: usize = 32;

/// Per code rate decoding masks.
#[derive(Clone, Debug)]
pub struct AlgebraicInverse {
    bits_in: usize,
    bits_out: usize,
    /// `masks[b]` recovers the input bit `b` positions before the newest one.
    masks: Vec<u64>,
    /// Different masks for the same bits, they only disagree on invalid code sequences.
    alternates: Vec<u64>,
}

/// Coded bit footprint of each input bit in the traceback register, newest coded bit in the LSB.
fn responses(spec: &'static PunctureSpec) -> [u64; TRACEBACK] {
    let len = spec.bits_in * (TRACEBACK + 8).div_ceil(spec.bits_in);
    let mut out = [0u64; TRACEBACK];
    for (age, response) in out.iter_mut().enumerate() {
        let mut encoder = ConvolutionalEncoder::new(spec);
        let mut coded = Vec::with_capacity(2 * len);
        for i in 0..len {
            encoder.push_bit(u8::from(i == len - 1 - age), &mut coded);
        }
        *response = coded[coded.len() - TRACEBACK..]
            .iter()
            .fold(0u64, |acc, b| (acc << 1) | u64::from(*b));
    }
    out
}

/// Solve `parity(responses[i] & mask) == (i == target)` for all `i`.
///
/// Gaussian elimination picking pivots from the least significant bit up, so free variables are
/// the high bits and are left at zero. Returns the mask and one non-zero null space vector.
fn solve(responses: &[u64; TRACEBACK], target: usize) -> Option<(u64, u64)> {
    let mut rows: Vec<(u64, bool)> = responses
        .iter()
        .enumerate()
        .map(|(i, r)| (*r, i == target))
        .collect();
    let mut pivots: Vec<usize> = Vec::with_capacity(TRACEBACK);
    for col in 0..TRACEBACK {
        let r = pivots.len();
        let Some(k) = (r..rows.len()).find(|&k| rows[k].0 >> col & 1 == 1) else {
            continue;
        };
        rows.swap(r, k);
        let pivot = rows[r];
        for (j, row) in rows.iter_mut().enumerate() {
            if j != r && row.0 >> col & 1 == 1 {
                row.0 ^= pivot.0;
                row.1 ^= pivot.1;
            }
        }
        pivots.push(col);
    }
    if rows[pivots.len()..].iter().any(|(_, rhs)| *rhs) {
        return None;
    }

    let mut mask = 0u64;
    for (row, col) in rows.iter().zip(&pivots) {
        if row.1 {
            mask |= 1 << col;
        }
    }
    let free = (0..TRACEBACK).find(|c| !pivots.contains(c))?;
    let mut null = 1u64 << free;
    for (row, col) in rows.iter().zip(&pivots) {
        if row.0 >> free & 1 == 1 {
            null |= 1 << col;
        }
    }
    Some((mask, null))
}

impl AlgebraicInverse {
    /// # Errors
    /// [Error::Configuration] if the code has no feed-forward inverse within the traceback.
    pub fn new(spec: &'static PunctureSpec) -> Result<Self> {
        let resp = responses(spec);
        let mut masks = Vec::with_capacity(spec.bits_in);
        let mut alternates = Vec::with_capacity(spec.bits_in);
        for b in 0..spec.bits_in {
            let (mask, null) = solve(&resp, b).ok_or_else(|| {
                Error::Configuration(format!("no algebraic inverse for rate {:?}", spec.rate))
            })?;
            trace!(bit = b, mask = format!("{mask:#x}"), "deconvolution mask");
            masks.push(mask);
            alternates.push(mask ^ null);
        }
        Ok(AlgebraicInverse {
            bits_in: spec.bits_in,
            bits_out: spec.bits_out(),
            masks,
            alternates,
        })
    }

    pub fn masks(&self) -> &[u64] {
        &self.masks
    }
}

#[derive(Clone, Debug, Default)]
struct Register {
    iq: u64,
    n_in: usize,
    out: u64,
    n_out: usize,
}

impl Register {
    /// Shift in coded bits until the register is full.
    #[inline]
    fn fill(&mut self, symbols: &[SoftSymbol], pos: &mut usize, map: &[u8], bps: usize) {
        while self.n_in < TRACEBACK {
            let label = map[symbols[*pos].nearest as usize];
            *pos += 1;
            self.iq = (self.iq << bps) | u64::from(label);
            self.n_in += bps;
        }
    }

    fn read_byte(
        &mut self,
        symbols: &[SoftSymbol],
        pos: &mut usize,
        map: &[u8],
        inv: &AlgebraicInverse,
        bps: usize,
    ) -> u8 {
        while self.n_out < 8 {
            self.fill(symbols, pos, map, bps);
            // oldest input bit of the block first
            for mask in inv.masks.iter().rev() {
                self.out = (self.out << 1) | u64::from(parity(self.iq & mask));
            }
            self.n_out += inv.bits_in;
            self.n_in -= inv.bits_out;
        }
        let byte = (self.out >> (self.n_out - 8)) as u8;
        self.n_out -= 8;
        byte
    }

    /// Like [Self::read_byte] but counts disagreements between the two mask sets.
    fn read_errors(
        &mut self,
        symbols: &[SoftSymbol],
        pos: &mut usize,
        map: &[u8],
        inv: &AlgebraicInverse,
        bps: usize,
    ) -> usize {
        let mut errors = 0;
        while self.n_out < 8 {
            self.fill(symbols, pos, map, bps);
            for (mask, alt) in inv.masks.iter().zip(&inv.alternates) {
                errors += usize::from(parity(self.iq & mask) != parity(self.iq & alt));
            }
            self.n_out += inv.bits_in;
            self.n_in -= inv.bits_out;
        }
        self.n_out -= 8;
        errors
    }
}

/// Hard decision decoding stage trying each [Hypothesis] and symbol alignment in turn.
pub struct Deconvolver {
    input: PipeId<SoftSymbol>,
    output: PipeId<u8>,
    inverse: AlgebraicInverse,
    bits_per_symbol: usize,
    hypotheses: Vec<Hypothesis>,
    locked: usize,
    register: Register,
    skip: usize,
    feedback: SyncFeedback,
    seen_requests: u32,
    fast_lock: bool,
}

impl Deconvolver {
    pub fn new(
        input: PipeId<SoftSymbol>,
        output: PipeId<u8>,
        spec: &'static PunctureSpec,
        bits_per_symbol: usize,
        hypotheses: Vec<Hypothesis>,
        feedback: SyncFeedback,
        fast_lock: bool,
    ) -> Result<Self> {
        if hypotheses.is_empty() {
            return Err(Error::Configuration("no sync hypotheses".into()));
        }
        Ok(Deconvolver {
            input,
            output,
            inverse: AlgebraicInverse::new(spec)?,
            bits_per_symbol,
            hypotheses,
            locked: 0,
            register: Register::default(),
            skip: 0,
            seen_requests: feedback.requests(),
            feedback,
            fast_lock,
        })
    }

    /// Index of the hypothesis currently decoded.
    pub fn locked(&self) -> usize {
        self.locked
    }

    /// Advance to the next hypothesis, slipping one symbol after the last one.
    pub fn next_sync(&mut self) {
        self.locked += 1;
        if self.locked == self.hypotheses.len() {
            self.locked = 0;
            self.skip = 1;
        }
        self.register = Register::default();
        debug!(hypothesis = self.locked, skip = self.skip, "deconvolution resync");
    }

    /// Bytes that can be decoded from `symbols` input symbols whatever the register holds.
    fn decodable(&self, symbols: usize) -> usize {
        let bits = symbols * self.bits_per_symbol;
        let reserve = TRACEBACK + self.bits_per_symbol + self.inverse.bits_out;
        bits.saturating_sub(reserve) * self.inverse.bits_in / (8 * self.inverse.bits_out)
    }
}

impl Stage for Deconvolver {
    fn name(&self) -> &'static str {
        "deconvolution"
    }

    fn can_run(&self, pipes: &Pipes) -> bool {
        let readable = pipes.get(self.input).available_for_read();
        self.decodable(readable.saturating_sub(self.skip)) >= MIN_BYTES
            && pipes.get(self.output).available_for_write() >= MIN_BYTES
    }

    fn run(&mut self, pipes: &mut Pipes, _events: &mut Vec<Event>) {
        let requests = self.feedback.requests();
        if requests != self.seen_requests {
            self.seen_requests = requests;
            if !self.fast_lock {
                self.next_sync();
            }
        }

        let (input_id, output_id) = (self.input, self.output);
        pipes.with(input_id, output_id, |input, output| {
            if self.skip > 0 && input.available_for_read() >= self.skip {
                input.read(self.skip);
                self.skip = 0;
            }
            let n = self
                .decodable(input.available_for_read())
                .min(output.available_for_write());
            if n < MIN_BYTES {
                return;
            }
            let bps = self.bits_per_symbol;

            if self.fast_lock {
                let symbols = input.rd();
                let mut best = (usize::MAX, self.locked);
                for (i, h) in self.hypotheses.iter().enumerate() {
                    let mut reg = Register::default();
                    let mut pos = 0;
                    let errors: usize = (0..n)
                        .map(|_| reg.read_errors(symbols, &mut pos, &h.map, &self.inverse, bps))
                        .sum();
                    if errors < best.0 {
                        best = (errors, i);
                    }
                }
                if best.1 != self.locked {
                    debug!(from = self.locked, to = best.1, "deconvolution hypothesis");
                    self.locked = best.1;
                    self.register = Register::default();
                }
                if best.0 > n * 8 / 3 {
                    self.skip = 1;
                }
            }

            let symbols = input.rd();
            let map = &self.hypotheses[self.locked].map;
            let out = output.wr();
            let mut pos = 0;
            for byte in out[..n].iter_mut() {
                *byte = self
                    .register
                    .read_byte(symbols, &mut pos, map, &self.inverse, bps);
            }
            input.read(pos);
            output.written(n);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        constellation::Constellation,
        dvbs::{convolutional::puncture_spec, hypotheses},
        settings::CodeRate,
    };
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use test_case::test_case;

    fn bits_of(bytes: &[u8]) -> Vec<u8> {
        bytes
            .iter()
            .flat_map(|b| (0..8).rev().map(move |k| (b >> k) & 1))
            .collect()
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test_case(CodeRate::Fec12, 0x3ba)]
    #[test_case(CodeRate::Fec34, 0xf247)]
    #[test_case(CodeRate::Fec78, 0xfbea_c76c_454f)]
    fn test_first_mask(rate: CodeRate, mask: u64) {
        let inv = AlgebraicInverse::new(puncture_spec(rate, 2).unwrap()).unwrap();
        assert_eq!(inv.masks()[0], mask);
    }

    #[test_case(CodeRate::Fec12)]
    #[test_case(CodeRate::Fec23)]
    #[test_case(CodeRate::Fec34)]
    #[test_case(CodeRate::Fec56)]
    #[test_case(CodeRate::Fec78)]
    fn test_decodes_qpsk_stream(rate: CodeRate) {
        let spec = puncture_spec(rate, 2).unwrap();
        let inv = AlgebraicInverse::new(spec).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        let data: Vec<u8> = (0..600).map(|_| rng.gen()).collect();
        let coded = ConvolutionalEncoder::new(spec).encode(&data);
        let symbols: Vec<SoftSymbol> = coded
            .chunks_exact(2)
            .map(|c| SoftSymbol {
                nearest: (c[0] << 1) | c[1],
                ..Default::default()
            })
            .collect();
        let identity = [0u8, 1, 2, 3];
        let expected = bits_of(&data[100..150]);

        // one of the symbol alignments within a puncturing block decodes the stream
        let found = (0..spec.bits_out() / 2).any(|skip| {
            let symbols = &symbols[skip..];
            let n = (symbols.len() * 2 - TRACEBACK - 2 - inv.bits_out) * inv.bits_in
                / (8 * inv.bits_out);
            let mut reg = Register::default();
            let mut pos = 0;
            let decoded: Vec<u8> = (0..n)
                .map(|_| reg.read_byte(symbols, &mut pos, &identity, &inv, 2))
                .collect();
            contains(&bits_of(&decoded), &expected)
        });
        assert!(found, "no alignment decoded the stream");
    }

    #[test]
    fn test_next_sync_cycles_then_slips() {
        let mut pipes = Pipes::new(1);
        let input = pipes.add("symbols", 16);
        let output = pipes.add("bytes", 16);
        let mut stage = Deconvolver::new(
            input,
            output,
            puncture_spec(CodeRate::Fec12, 2).unwrap(),
            2,
            hypotheses(&Constellation::qpsk()),
            SyncFeedback::default(),
            false,
        )
        .unwrap();
        for expected in [1, 2, 3] {
            stage.next_sync();
            assert_eq!(stage.locked(), expected);
            assert_eq!(stage.skip, 0);
        }
        stage.next_sync();
        assert_eq!(stage.locked(), 0);
        assert_eq!(stage.skip, 1);
    }

    #[test]
    fn test_fast_lock_finds_rotation() {
        let spec = puncture_spec(CodeRate::Fec12, 2).unwrap();
        let mut rng = StdRng::seed_from_u64(12);
        let data: Vec<u8> = (0..400).map(|_| rng.gen()).collect();
        let coded = ConvolutionalEncoder::new(spec).encode(&data);
        let qpsk = Constellation::qpsk();
        let hs = hypotheses(&qpsk);
        // received through a conjugating channel
        let symbols: Vec<SoftSymbol> = coded
            .chunks_exact(2)
            .map(|c| qpsk.decide(qpsk.point((c[0] << 1) | c[1]).conj()))
            .collect();

        let mut pipes = Pipes::new(1);
        let input = pipes.add("symbols", symbols.len());
        let output = pipes.add("bytes", 4096);
        {
            let pipe = pipes.get_mut(input);
            pipe.wr()[..symbols.len()].copy_from_slice(&symbols);
            pipe.written(symbols.len());
        }
        let mut stage = Deconvolver::new(
            input,
            output,
            spec,
            2,
            hs.clone(),
            SyncFeedback::default(),
            true,
        )
        .unwrap();
        stage.run(&mut pipes, &mut Vec::default());
        assert!(hs[stage.locked()].conjugate);
        let decoded = bits_of(pipes.get(output).rd());
        assert!(contains(&decoded, &bits_of(&data[50..100])));
    }
}
