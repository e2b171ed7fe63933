//! Soft decision Viterbi decoding of the punctured K=7 code.
//!
//! Punctured positions are fed to the rate 1/2 mother trellis as zero likelihood erasures.
use std::collections::VecDeque;

use tracing::debug;

use super::{
    convolutional::{parity, Branch, PunctureSpec, G1, G2, MEMORY},
    Hypothesis, SyncFeedback,
};
use crate::{
    constellation::{Constellation, SoftSymbol},
    pipe::{PipeId, Pipes},
    report::Event,
    scheduler::Stage,
    Error, Result,
};

const NSTATES: usize = 1 << MEMORY;
/// Survivor depth before a bit is decided.
pub const DEPTH: usize = 64;
/// Puncturing blocks decoded per iteration.
const CHUNK: usize = 64;
/// Input bits used to score sync candidates.
const EVAL_BITS: usize = 64;
/// Squared distance to LLR units.
const LLR_SCALE: f32 = 32.0;

/// Path metrics and survivor decisions of the 64 state trellis.
#[derive(Clone, Debug)]
pub struct Trellis {
    metrics: [i32; NSTATES],
    /// Bit `s` of each entry selects the predecessor of state `s`.
    history: VecDeque<u64>,
    /// Mother code outputs `(x, y)` for each 7 bit register value.
    outputs: [(bool, bool); 2 * NSTATES],
}

impl Default for Trellis {
    fn default() -> Self {
        let mut outputs = [(false, false); 2 * NSTATES];
        for (reg, o) in outputs.iter_mut().enumerate() {
            *o = (
                parity(reg as u64 & u64::from(G1)) == 1,
                parity(reg as u64 & u64::from(G2)) == 1,
            );
        }
        Trellis {
            metrics: [0; NSTATES],
            history: VecDeque::with_capacity(4 * DEPTH),
            outputs,
        }
    }
}

#[inline]
fn branch_metric(expected: bool, llr: i8) -> i32 {
    if expected {
        i32::from(llr)
    } else {
        -i32::from(llr)
    }
}

impl Trellis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add-compare-select for one input bit given the likelihoods of both mother code outputs.
    ///
    /// Returns the growth of the best path metric, large when the input looks like a codeword.
    pub fn step(&mut self, x: i8, y: i8) -> i32 {
        let mut next = [0i32; NSTATES];
        let mut decisions = 0u64;
        for (ns, metric) in next.iter_mut().enumerate() {
            let bit = ns >> (MEMORY - 1);
            let base = (ns & (NSTATES / 2 - 1)) << 1;
            let [m0, m1] = [base, base | 1].map(|state| {
                let (ox, oy) = self.outputs[(bit << MEMORY) | state];
                self.metrics[state] + branch_metric(ox, x) + branch_metric(oy, y)
            });
            if m1 > m0 {
                decisions |= 1 << ns;
                *metric = m1;
            } else {
                *metric = m0;
            }
        }
        let max = next.iter().copied().max().unwrap_or(0);
        for m in next.iter_mut() {
            *m -= max;
        }
        self.metrics = next;
        self.history.push_back(decisions);
        max
    }

    /// Append every bit older than [DEPTH] to `bits`, oldest first.
    pub fn drain(&mut self, bits: &mut Vec<u8>) {
        if self.history.len() < 2 * DEPTH {
            return;
        }
        let decided = self.history.len() - DEPTH;
        let mut state = self
            .metrics
            .iter()
            .enumerate()
            .max_by_key(|(_, m)| **m)
            .map(|(s, _)| s)
            .unwrap_or(0);
        let start = bits.len();
        bits.resize(start + decided, 0);
        for (t, decisions) in self.history.iter().enumerate().rev() {
            if t < decided {
                bits[start + t] = (state >> (MEMORY - 1)) as u8;
            }
            let k = ((decisions >> state) & 1) as usize;
            state = ((state & (NSTATES / 2 - 1)) << 1) | k;
        }
        self.history.drain(..decided);
    }
}

/// Depuncture one block of LLRs and run it through `trellis`, returning the metric growth.
fn decode_block(spec: &PunctureSpec, llrs: &[i8], trellis: &mut Trellis) -> i64 {
    let mut xs = [0i8; 8];
    let mut ys = [0i8; 8];
    for ((branch, index), llr) in spec.outputs.iter().zip(llrs) {
        match branch {
            Branch::X => xs[*index] = *llr,
            Branch::Y => ys[*index] = *llr,
        }
    }
    (0..spec.bits_in)
        .map(|j| i64::from(trellis.step(xs[j], ys[j])))
        .sum()
}

/// Bit likelihoods of a run of symbols seen through `hypothesis`.
fn symbol_llrs(
    constellation: &Constellation,
    hypothesis: &Hypothesis,
    symbols: &[SoftSymbol],
    llrs: &mut [i8],
) {
    let bps = constellation.bits_per_symbol();
    for (sym, out) in symbols.iter().zip(llrs.chunks_exact_mut(bps)) {
        constellation.llrs(hypothesis.apply(sym.iq), LLR_SCALE, out);
    }
}

/// Soft decision decoding stage.
///
/// Without fast lock the hypothesis only changes on request of the MPEG sync detector, cycling
/// like [super::deconvolution::Deconvolver]. With fast lock every chunk scores all hypotheses and
/// symbol alignments and switches to the best path metric.
pub struct ViterbiDecoder {
    input: PipeId<SoftSymbol>,
    output: PipeId<u8>,
    constellation: Constellation,
    spec: &'static PunctureSpec,
    symbols_per_block: usize,
    hypotheses: Vec<Hypothesis>,
    locked: usize,
    skip: usize,
    trellis: Trellis,
    feedback: SyncFeedback,
    seen_requests: u32,
    fast_lock: bool,
    llrs: Vec<i8>,
    bits: Vec<u8>,
}

impl ViterbiDecoder {
    pub fn new(
        input: PipeId<SoftSymbol>,
        output: PipeId<u8>,
        constellation: Constellation,
        spec: &'static PunctureSpec,
        hypotheses: Vec<Hypothesis>,
        feedback: SyncFeedback,
        fast_lock: bool,
    ) -> Result<Self> {
        let bps = constellation.bits_per_symbol();
        if hypotheses.is_empty() || bps == 0 || spec.bits_out() % bps != 0 {
            return Err(Error::Configuration(format!(
                "Viterbi rate {:?} cannot be decoded from {:?}",
                spec.rate,
                constellation.modulation()
            )));
        }
        Ok(ViterbiDecoder {
            input,
            output,
            symbols_per_block: spec.bits_out() / bps,
            constellation,
            spec,
            hypotheses,
            locked: 0,
            skip: 0,
            trellis: Trellis::new(),
            seen_requests: feedback.requests(),
            feedback,
            fast_lock,
            llrs: vec![0i8; spec.bits_out()],
            bits: Vec::with_capacity(CHUNK * spec.bits_in + 2 * DEPTH),
        })
    }

    pub fn locked(&self) -> usize {
        self.locked
    }

    pub fn next_sync(&mut self) {
        self.locked += 1;
        if self.locked == self.hypotheses.len() {
            self.locked = 0;
            self.skip = 1;
        }
        self.reset();
        debug!(hypothesis = self.locked, skip = self.skip, "viterbi resync");
    }

    fn reset(&mut self) {
        self.trellis = Trellis::new();
        self.bits.clear();
    }

    fn min_input(&self) -> usize {
        (CHUNK + 1) * self.symbols_per_block
    }

    fn max_output(&self) -> usize {
        (CHUNK * self.spec.bits_in + DEPTH + self.bits.len()) / 8 + 1
    }

    /// Metric growth of a fresh trellis over the first [EVAL_BITS] bits of `symbols`.
    fn score(&self, hypothesis: &Hypothesis, symbols: &[SoftSymbol]) -> i64 {
        let mut trellis = Trellis::new();
        let mut llrs = vec![0i8; self.spec.bits_out()];
        let blocks = EVAL_BITS.div_ceil(self.spec.bits_in);
        symbols
            .chunks_exact(self.symbols_per_block)
            .take(blocks)
            .map(|block| {
                symbol_llrs(&self.constellation, hypothesis, block, &mut llrs);
                decode_block(self.spec, &llrs, &mut trellis)
            })
            .sum()
    }

    /// Score every hypothesis and alignment, switching when one beats the current one.
    fn evaluate(&mut self, symbols: &[SoftSymbol]) {
        let current = self.score(&self.hypotheses[self.locked], symbols);
        let mut best = (current, self.locked, 0);
        for (i, h) in self.hypotheses.iter().enumerate() {
            for shift in 0..self.symbols_per_block {
                if i == self.locked && shift == 0 {
                    continue;
                }
                let s = self.score(h, &symbols[shift..]);
                if s > best.0 {
                    best = (s, i, shift);
                }
            }
        }
        let (score, locked, shift) = best;
        // require a clear margin so noise does not make a locked decoder hop
        if (locked, shift) != (self.locked, 0) && score - current > (EVAL_BITS as i64) * 4 {
            debug!(from = self.locked, to = locked, shift, score, current, "viterbi sync");
            self.locked = locked;
            self.skip = shift;
            self.reset();
        }
    }
}

impl Stage for ViterbiDecoder {
    fn name(&self) -> &'static str {
        "viterbi"
    }

    fn can_run(&self, pipes: &Pipes) -> bool {
        pipes.get(self.input).available_for_read() >= self.min_input() + self.skip
            && pipes.get(self.output).available_for_write() >= self.max_output()
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
        pipes.with(input_id, output_id, |input, output| loop {
            if self.skip > 0 {
                if input.available_for_read() < self.skip {
                    return;
                }
                input.read(self.skip);
                self.skip = 0;
            }
            if input.available_for_read() < self.min_input()
                || output.available_for_write() < self.max_output()
            {
                return;
            }
            if self.fast_lock {
                self.evaluate(input.rd());
                if self.skip > 0 {
                    continue;
                }
            }

            let spb = self.symbols_per_block;
            let symbols = input.rd();
            let hypothesis = &self.hypotheses[self.locked];
            for block in symbols[..CHUNK * spb].chunks_exact(spb) {
                symbol_llrs(&self.constellation, hypothesis, block, &mut self.llrs);
                decode_block(self.spec, &self.llrs, &mut self.trellis);
            }
            input.read(CHUNK * spb);

            self.trellis.drain(&mut self.bits);
            let nbytes = self.bits.len() / 8;
            let out = output.wr();
            for (byte, bits) in out[..nbytes].iter_mut().zip(self.bits.chunks_exact(8)) {
                *byte = bits.iter().fold(0u8, |acc, b| (acc << 1) | b);
            }
            output.written(nbytes);
            self.bits.drain(..nbytes * 8);
        });
    }
}
