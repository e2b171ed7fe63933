//! Irregular repeat-accumulate LDPC codes in the DVB-S2 table format.
//!
//! A table has one row per group of 360 information bits. Bit `360 * g + m` feeds the parity
//! accumulators `(x + m * q) mod (n - k)` for every address `x` of row `g`, with
//! `q = (n - k) / 360`. Parity bit `j` closes check `j` and, except the last one, check `j + 1`.
use std::collections::HashMap;

use crate::{settings::CodeRate, Error, Result};

use super::{modcod::fec_info, NORMAL_FRAME_BITS, SHORT_FRAME_BITS};

/// Information bits sharing one table row.
pub const GROUP: usize = 360;

/// Source of parity check tables.
pub trait LdpcCodebook: Send + Sync {
    /// Rows of accumulator addresses for `rate`, `None` if the codebook has no such code.
    fn table(&self, rate: CodeRate, short_frames: bool) -> Option<Vec<Vec<u32>>>;
}

/// Dimensions of the code for `rate`.
fn dimensions(rate: CodeRate, short_frames: bool) -> Option<(usize, usize)> {
    let fec = fec_info(rate, short_frames)?;
    let n = if short_frames {
        SHORT_FRAME_BITS
    } else {
        NORMAL_FRAME_BITS
    };
    Some((n, fec.kldpc))
}

/// Deterministic pseudo-random tables with the DVB-S2 structure.
///
/// Every information bit has degree 3, or 4 for every third group. Both ends of a loopback that
/// use this codebook agree on the code, a receiver of real broadcasts needs the tables of
/// EN 302 307 loaded through [TableCodebook].
#[derive(Clone, Debug, Default)]
pub struct GeneratedCodebook;

impl LdpcCodebook for GeneratedCodebook {
    fn table(&self, rate: CodeRate, short_frames: bool) -> Option<Vec<Vec<u32>>> {
        let (n, k) = dimensions(rate, short_frames)?;
        let nparity = (n - k) as u64;
        let (num, den) = rate.ratio()?;
        let mut state = 0x9e37_79b9_7f4a_7c15u64
            ^ (u64::from(num) << 40)
            ^ (u64::from(den) << 32)
            ^ u64::from(short_frames);
        let mut next = move || {
            // splitmix64
            state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
            let mut z = state;
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
            z ^ (z >> 31)
        };
        let rows = (0..k / GROUP)
            .map(|g| {
                let degree = if g % 3 == 0 { 4 } else { 3 };
                let mut row: Vec<u32> = Vec::with_capacity(degree);
                while row.len() < degree {
                    let x = (next() % nparity) as u32;
                    if !row.contains(&x) {
                        row.push(x);
                    }
                }
                row
            })
            .collect();
        Some(rows)
    }
}

/// Tables supplied by the caller, typically the annexes of EN 302 307.
#[derive(Clone, Debug, Default)]
pub struct TableCodebook {
    tables: HashMap<(CodeRate, bool), Vec<Vec<u32>>>,
}

impl TableCodebook {
    /// Register a table given as text, one row of whitespace separated addresses per line.
    ///
    /// # Errors
    /// [Error::Configuration] if an address does not parse or the row count does not match the
    /// code dimensions.
    pub fn insert_text(&mut self, rate: CodeRate, short_frames: bool, text: &str) -> Result<()> {
        let (n, k) = dimensions(rate, short_frames).ok_or_else(|| {
            Error::Configuration(format!("no LDPC code for {rate:?} short={short_frames}"))
        })?;
        let mut rows = Vec::with_capacity(k / GROUP);
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let row = line
                .split_whitespace()
                .map(|w| {
                    w.parse::<u32>()
                        .ok()
                        .filter(|x| (*x as usize) < n - k)
                        .ok_or_else(|| Error::Configuration(format!("bad LDPC address {w:?}")))
                })
                .collect::<Result<Vec<u32>>>()?;
            rows.push(row);
        }
        if rows.len() != k / GROUP {
            return Err(Error::Configuration(format!(
                "LDPC table for {rate:?} has {} rows, expected {}",
                rows.len(),
                k / GROUP
            )));
        }
        self.tables.insert((rate, short_frames), rows);
        Ok(())
    }
}

impl LdpcCodebook for TableCodebook {
    fn table(&self, rate: CodeRate, short_frames: bool) -> Option<Vec<Vec<u32>>> {
        self.tables.get(&(rate, short_frames)).cloned()
    }
}

/// Parity check matrix in compressed form, bits one per byte.
#[derive(Clone, Debug)]
pub struct LdpcCode {
    n: usize,
    k: usize,
    /// Accumulator addresses of every information bit.
    info_offsets: Vec<u32>,
    info_addrs: Vec<u32>,
    /// Bits participating in every check.
    check_offsets: Vec<u32>,
    check_bits: Vec<u32>,
}

impl LdpcCode {
    pub fn from_table(n: usize, k: usize, table: &[Vec<u32>]) -> Result<Self> {
        let nparity = n - k;
        if table.len() * GROUP != k || nparity % GROUP != 0 {
            return Err(Error::Configuration(format!(
                "LDPC table of {} rows does not fit ({n}, {k})",
                table.len()
            )));
        }
        let q = nparity / GROUP;

        let mut info_offsets = Vec::with_capacity(k + 1);
        let mut info_addrs = Vec::new();
        info_offsets.push(0);
        for row in table {
            for m in 0..GROUP {
                for x in row {
                    info_addrs.push(((*x as usize + m * q) % nparity) as u32);
                }
                info_offsets.push(info_addrs.len() as u32);
            }
        }

        let mut per_check: Vec<Vec<u32>> = vec![Vec::new(); nparity];
        for bit in 0..k {
            let (lo, hi) = (info_offsets[bit] as usize, info_offsets[bit + 1] as usize);
            for a in &info_addrs[lo..hi] {
                per_check[*a as usize].push(bit as u32);
            }
        }
        for (j, check) in per_check.iter_mut().enumerate() {
            if j > 0 {
                check.push((k + j - 1) as u32);
            }
            check.push((k + j) as u32);
        }
        let mut check_offsets = Vec::with_capacity(nparity + 1);
        let mut check_bits = Vec::new();
        check_offsets.push(0);
        for check in per_check {
            check_bits.extend(check);
            check_offsets.push(check_bits.len() as u32);
        }

        Ok(LdpcCode {
            n,
            k,
            info_offsets,
            info_addrs,
            check_offsets,
            check_bits,
        })
    }

    /// Build the code for `rate` from `codebook`.
    pub fn new(codebook: &dyn LdpcCodebook, rate: CodeRate, short_frames: bool) -> Result<Self> {
        let (n, k) = dimensions(rate, short_frames).ok_or_else(|| {
            Error::Configuration(format!("no LDPC code for {rate:?} short={short_frames}"))
        })?;
        let table = codebook.table(rate, short_frames).ok_or_else(|| {
            Error::Configuration(format!("codebook lacks {rate:?} short={short_frames}"))
        })?;
        Self::from_table(n, k, &table)
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn k(&self) -> usize {
        self.k
    }

    fn check(&self, j: usize) -> &[u32] {
        &self.check_bits[self.check_offsets[j] as usize..self.check_offsets[j + 1] as usize]
    }

    /// Checks a bit participates in.
    fn bit_checks(&self, bit: usize) -> impl Iterator<Item = usize> + '_ {
        let nparity = self.n - self.k;
        let (info, parity) = if bit < self.k {
            let (lo, hi) = (self.info_offsets[bit] as usize, self.info_offsets[bit + 1] as usize);
            (&self.info_addrs[lo..hi], None)
        } else {
            let j = bit - self.k;
            (&[][..], Some(j))
        };
        let parity = parity.into_iter().flat_map(move |j| {
            std::iter::once(j).chain((j + 1 < nparity).then_some(j + 1))
        });
        info.iter().map(|a| *a as usize).chain(parity)
    }

    /// Codeword of `k` information bits followed by `n - k` parity bits.
    pub fn encode(&self, info: &[u8]) -> Vec<u8> {
        let mut parity = vec![0u8; self.n - self.k];
        for (bit, v) in info[..self.k].iter().enumerate() {
            if v & 1 != 0 {
                let (lo, hi) = (self.info_offsets[bit] as usize, self.info_offsets[bit + 1] as usize);
                for a in &self.info_addrs[lo..hi] {
                    parity[*a as usize] ^= 1;
                }
            }
        }
        for j in 1..parity.len() {
            parity[j] ^= parity[j - 1];
        }
        let mut out = info[..self.k].to_vec();
        out.extend(parity);
        out
    }

    pub fn syndrome_weight(&self, bits: &[u8]) -> usize {
        (0..self.n - self.k)
            .filter(|j| self.check(*j).iter().fold(0, |acc, b| acc ^ bits[*b as usize]) & 1 != 0)
            .count()
    }

    /// Hard decision bit flipping.
    ///
    /// Repeatedly flips the bit with the most unsatisfied checks, ties going to the bit with the
    /// fewest checks, while a majority of its checks fail. Returns the number of flips once every
    /// check holds, `None` when `max_bitflips` flips did not reach a codeword.
    pub fn decode_bitflip(&self, bits: &mut [u8], max_bitflips: usize) -> Option<usize> {
        let nparity = self.n - self.k;
        let mut unsat = vec![false; nparity];
        let mut counts = vec![0u8; self.n];
        let mut remaining = 0;
        for (j, u) in unsat.iter_mut().enumerate() {
            let parity = self.check(j).iter().fold(0, |acc, b| acc ^ bits[*b as usize]) & 1;
            if parity != 0 {
                *u = true;
                remaining += 1;
                for b in self.check(j) {
                    counts[*b as usize] += 1;
                }
            }
        }

        let mut flips = 0;
        while remaining > 0 {
            if flips == max_bitflips {
                return None;
            }
            let mut best: Option<(usize, u8, usize)> = None;
            for (bit, &count) in counts.iter().enumerate() {
                if count == 0 {
                    continue;
                }
                let degree = self.bit_checks(bit).count();
                if usize::from(count) * 2 <= degree {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((_, c, d)) => count > c || (count == c && degree < d),
                };
                if better {
                    best = Some((bit, count, degree));
                }
            }
            let (bit, _, _) = best?;

            bits[bit] ^= 1;
            flips += 1;
            let checks: Vec<usize> = self.bit_checks(bit).collect();
            for j in checks {
                unsat[j] = !unsat[j];
                if unsat[j] {
                    remaining += 1;
                    for b in self.check(j) {
                        counts[*b as usize] += 1;
                    }
                } else {
                    remaining -= 1;
                    for b in self.check(j) {
                        counts[*b as usize] -= 1;
                    }
                }
            }
        }
        Some(flips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, seq::index::sample, Rng, SeedableRng};

    fn random_codeword(code: &LdpcCode, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        let info: Vec<u8> = (0..code.k()).map(|_| rng.gen_range(0..2)).collect();
        code.encode(&info)
    }

    #[test]
    fn test_encoded_words_satisfy_checks() {
        let code = LdpcCode::new(&GeneratedCodebook, CodeRate::Fec35, true).unwrap();
        assert_eq!(code.n(), SHORT_FRAME_BITS);
        let word = random_codeword(&code, 1);
        assert_eq!(code.syndrome_weight(&word), 0);
    }

    #[test]
    fn test_bitflip_fixes_few_errors() {
        let code = LdpcCode::new(&GeneratedCodebook, CodeRate::Fec12, false).unwrap();
        let clean = random_codeword(&code, 2);
        let mut word = clean.clone();
        for pos in [5, 20000, 40000] {
            word[pos] ^= 1;
        }
        assert_eq!(code.decode_bitflip(&mut word, 10), Some(3));
        assert_eq!(word, clean);
    }

    #[test]
    fn test_bitflip_gives_up() {
        let code = LdpcCode::new(&GeneratedCodebook, CodeRate::Fec23, true).unwrap();
        let mut word = random_codeword(&code, 3);
        let mut rng = StdRng::seed_from_u64(4);
        for pos in sample(&mut rng, code.n(), 50) {
            word[pos] ^= 1;
        }
        assert_eq!(code.decode_bitflip(&mut word, 10), None);
    }

    #[test]
    fn test_table_text() {
        let mut book = TableCodebook::default();
        let rows: String = (0..11880 / GROUP).map(|g| format!("{} {} {}\n", g, g + 100, g + 1000)).collect();
        book.insert_text(CodeRate::Fec34, true, &rows).unwrap();
        let code = LdpcCode::new(&book, CodeRate::Fec34, true).unwrap();
        let word = random_codeword(&code, 7);
        assert_eq!(code.syndrome_weight(&word), 0);

        assert!(book.insert_text(CodeRate::Fec34, true, "1 2 3").is_err());
        assert!(book.insert_text(CodeRate::Fec34, true, "x").is_err());
    }
}
