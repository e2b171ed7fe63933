//! Reed-Solomon RS(204,188, t=8), the DVB-S outer code.
//!
//! Shortened from RS(255,239) over GF(2^8) with field polynomial `x^8+x^4+x^3+x^2+1` and generator
//! roots `a^0 .. a^15`. Byte 0 of a packet is the coefficient of the highest power.
use tracing::trace;

use crate::{
    packet::{RsPacket, TsPacket, MPEG_SYNC_CORRUPTED, RS_PACKET_LEN, TS_PACKET_LEN},
    pipe::{PipeId, Pipes},
    report::{Event, FecCounters, Integrity, Report, Source},
    scheduler::Stage,
};

const PARITY_LEN: usize = RS_PACKET_LEN - TS_PACKET_LEN;
const FIELD_POLY: u16 = 0x11d;

/// GF(2^8) arithmetic with log/antilog tables.
#[derive(Clone)]
pub struct Gf256 {
    exp: [u8; 512],
    log: [u8; 256],
}

impl Default for Gf256 {
    fn default() -> Self {
        let mut exp = [0u8; 512];
        let mut log = [0u8; 256];
        let mut x: u16 = 1;
        for i in 0..255 {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= FIELD_POLY;
            }
        }
        for i in 255..512 {
            exp[i] = exp[i - 255];
        }
        Gf256 { exp, log }
    }
}

impl Gf256 {
    #[inline]
    pub fn mul(&self, a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            0
        } else {
            self.exp[self.log[a as usize] as usize + self.log[b as usize] as usize]
        }
    }

    /// `a / b`, `b` must not be zero.
    #[inline]
    pub fn div(&self, a: u8, b: u8) -> u8 {
        if a == 0 {
            0
        } else {
            self.exp[self.log[a as usize] as usize + 255 - self.log[b as usize] as usize]
        }
    }

    /// `a^i`
    #[inline]
    pub fn pow_alpha(&self, i: usize) -> u8 {
        self.exp[i % 255]
    }

    pub fn inv(&self, a: u8) -> u8 {
        self.div(1, a)
    }
}

/// Encoder and decoder for RS(204,188).
#[derive(Clone)]
pub struct ReedSolomon {
    gf: Gf256,
    /// Generator polynomial, highest degree first, monic.
    generator: [u8; PARITY_LEN + 1],
}

impl Default for ReedSolomon {
    fn default() -> Self {
        let gf = Gf256::default();
        // g(x) = prod (x - a^i), lowest degree first while building
        let mut g = vec![1u8];
        for i in 0..PARITY_LEN {
            let root = gf.pow_alpha(i);
            let mut next = vec![0u8; g.len() + 1];
            for (j, c) in g.iter().enumerate() {
                next[j + 1] ^= c;
                next[j] ^= gf.mul(*c, root);
            }
            g = next;
        }
        let mut generator = [0u8; PARITY_LEN + 1];
        for (dst, src) in generator.iter_mut().zip(g.iter().rev()) {
            *dst = *src;
        }
        ReedSolomon { gf, generator }
    }
}

impl ReedSolomon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill in the 16 parity bytes of `packet` from its first 188 bytes.
    pub fn encode(&self, packet: &mut [u8; RS_PACKET_LEN]) {
        let mut parity = [0u8; PARITY_LEN];
        for i in 0..TS_PACKET_LEN {
            let feedback = packet[i] ^ parity[0];
            parity.copy_within(1.., 0);
            parity[PARITY_LEN - 1] = 0;
            if feedback != 0 {
                for (p, g) in parity.iter_mut().zip(&self.generator[1..]) {
                    *p ^= self.gf.mul(feedback, *g);
                }
            }
        }
        packet[TS_PACKET_LEN..].copy_from_slice(&parity);
    }

    /// `S_i = r(a^i)`, returns `true` if any syndrome is non-zero.
    fn syndromes(&self, packet: &[u8; RS_PACKET_LEN], synd: &mut [u8; PARITY_LEN]) -> bool {
        let mut corrupted = false;
        for (i, s) in synd.iter_mut().enumerate() {
            let x = self.gf.pow_alpha(i);
            let mut acc = 0u8;
            for b in packet.iter() {
                acc = self.gf.mul(acc, x) ^ b;
            }
            *s = acc;
            corrupted |= acc != 0;
        }
        corrupted
    }

    /// Correct `packet` in place.
    ///
    /// Returns the number of corrected bits, or `None` if the errors exceed the correction
    /// capacity, in which case `packet` is left untouched.
    pub fn decode(&self, packet: &mut [u8; RS_PACKET_LEN]) -> Option<usize> {
        let mut synd = [0u8; PARITY_LEN];
        if !self.syndromes(packet, &mut synd) {
            return Some(0);
        }
        let gf = &self.gf;

        // Berlekamp-Massey, lambda lowest degree first
        let mut lambda = [0u8; PARITY_LEN + 1];
        let mut prev = [0u8; PARITY_LEN + 1];
        lambda[0] = 1;
        prev[0] = 1;
        let mut l = 0usize;
        let mut m = 1usize;
        let mut b = 1u8;
        for n in 0..PARITY_LEN {
            let mut d = synd[n];
            for i in 1..=l {
                d ^= gf.mul(lambda[i], synd[n - i]);
            }
            if d == 0 {
                m += 1;
                continue;
            }
            let coef = gf.div(d, b);
            let saved = lambda;
            for i in m..=PARITY_LEN {
                lambda[i] ^= gf.mul(coef, prev[i - m]);
            }
            if 2 * l <= n {
                l = n + 1 - l;
                prev = saved;
                b = d;
                m = 1;
            } else {
                m += 1;
            }
        }
        if l > PARITY_LEN / 2 {
            return None;
        }

        // omega(x) = S(x) lambda(x) mod x^16
        let mut omega = [0u8; PARITY_LEN];
        for i in 0..PARITY_LEN {
            for j in 0..=i.min(l) {
                omega[i] ^= gf.mul(lambda[j], synd[i - j]);
            }
        }

        // Chien search over the transmitted positions only
        let mut fixes = [(0usize, 0u8); PARITY_LEN / 2];
        let mut nfixes = 0;
        for k in 0..RS_PACKET_LEN {
            let power = RS_PACKET_LEN - 1 - k;
            let x_inv = gf.pow_alpha(255 - power % 255);
            let mut eval = 0u8;
            for c in lambda[..=l].iter().rev() {
                eval = gf.mul(eval, x_inv) ^ c;
            }
            if eval != 0 {
                continue;
            }
            if nfixes == fixes.len() {
                return None;
            }
            // Forney with first consecutive root 0: e = X omega(X^-1) / lambda'(X^-1)
            let mut num = 0u8;
            for c in omega.iter().rev() {
                num = gf.mul(num, x_inv) ^ c;
            }
            let mut den = 0u8;
            let mut xpow = 1u8;
            for i in (1..=l).step_by(2) {
                den ^= gf.mul(lambda[i], xpow);
                xpow = gf.mul(xpow, gf.mul(x_inv, x_inv));
            }
            if den == 0 {
                return None;
            }
            let x = gf.pow_alpha(power);
            fixes[nfixes] = (k, gf.mul(x, gf.div(num, den)));
            nfixes += 1;
        }
        if nfixes != l {
            return None;
        }

        let mut bits = 0;
        for (k, e) in &fixes[..nfixes] {
            packet[*k] ^= e;
            bits += e.count_ones() as usize;
        }
        Some(bits)
    }
}

/// Outer decoding stage, packets that cannot be corrected are passed on with a marked sync byte.
pub struct RsDecoder {
    input: PipeId<RsPacket>,
    output: PipeId<TsPacket>,
    rs: ReedSolomon,
}

impl RsDecoder {
    pub fn new(input: PipeId<RsPacket>, output: PipeId<TsPacket>) -> Self {
        Self {
            input,
            output,
            rs: ReedSolomon::new(),
        }
    }
}

impl Stage for RsDecoder {
    fn name(&self) -> &'static str {
        "rs_decoder"
    }

    fn can_run(&self, pipes: &Pipes) -> bool {
        pipes.get(self.input).available_for_read() >= 1
            && pipes.get(self.output).available_for_write() >= 1
    }

    fn run(&mut self, pipes: &mut Pipes, events: &mut Vec<Event>) {
        let rs = &self.rs;
        let mut totals = FecCounters::new(0, Some(0));
        pipes.with(self.input, self.output, |input, output| {
            while input.available_for_read() >= 1 && output.available_for_write() >= 1 {
                let mut packet = input.rd()[0];
                input.read(1);
                let result = rs.decode(&mut packet.0);
                let mut ts = TsPacket::default();
                ts.0.copy_from_slice(&packet.0[..TS_PACKET_LEN]);

                totals.bits_processed += RS_PACKET_LEN * 8;
                match result {
                    Some(0) => {}
                    Some(bits) => {
                        trace!(bits, "packet corrected");
                        totals.bits_corrected += bits;
                        if totals.integrity == Integrity::Ok {
                            totals.integrity = Integrity::Corrected;
                        }
                    }
                    None => {
                        trace!("packet uncorrectable");
                        totals.integrity = Integrity::Uncorrectable;
                        // keep the derandomizer aligned
                        ts.0[0] ^= MPEG_SYNC_CORRUPTED;
                    }
                }
                output.wr()[0] = ts;
                output.written(1);
            }
        });
        if totals.bits_processed > 0 {
            events.push(
                Report::Fec {
                    source: Source::ReedSolomon,
                    counters: totals,
                }
                .into(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn codeword(seed: u64) -> [u8; RS_PACKET_LEN] {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut packet = [0u8; RS_PACKET_LEN];
        rng.fill(&mut packet[..TS_PACKET_LEN]);
        ReedSolomon::new().encode(&mut packet);
        packet
    }

    #[test]
    fn test_gf_inverse() {
        let gf = Gf256::default();
        for a in 1..=255u8 {
            assert_eq!(gf.mul(a, gf.inv(a)), 1);
        }
    }

    #[test]
    fn test_zero_packet_parity() {
        let mut packet = [0u8; RS_PACKET_LEN];
        ReedSolomon::new().encode(&mut packet);
        assert_eq!(packet, [0u8; RS_PACKET_LEN]);
    }

    #[test]
    fn test_decode_is_idempotent_on_clean_packets() {
        let rs = ReedSolomon::new();
        for seed in 0..4 {
            let original = codeword(seed);
            let mut packet = original;
            assert_eq!(rs.decode(&mut packet), Some(0));
            assert_eq!(packet[..TS_PACKET_LEN], original[..TS_PACKET_LEN]);
        }
    }

    #[test]
    fn test_corrects_up_to_8_bytes() {
        let rs = ReedSolomon::new();
        let mut rng = StdRng::seed_from_u64(99);
        for nerrors in 1..=8 {
            let original = codeword(nerrors as u64);
            let mut packet = original;
            let mut flipped = 0;
            let mut positions = rand::seq::index::sample(&mut rng, RS_PACKET_LEN, nerrors).into_vec();
            positions.sort_unstable();
            for k in positions {
                let e: u8 = rng.gen_range(1..=255);
                packet[k] ^= e;
                flipped += e.count_ones() as usize;
            }
            assert_eq!(rs.decode(&mut packet), Some(flipped), "{nerrors} errors");
            assert_eq!(packet, original);
        }
    }

    #[test]
    fn test_rejects_9_errors() {
        let rs = ReedSolomon::new();
        let original = codeword(7);
        let mut packet = original;
        for k in 0..9 {
            packet[k * 20] ^= 0x5a;
        }
        let corrupted = packet;
        assert_eq!(rs.decode(&mut packet), None);
        assert_eq!(packet, corrupted);
    }
}
