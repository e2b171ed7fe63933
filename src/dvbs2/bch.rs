//! BCH outer code of DVB-S2.
//!
//! Normal frames use a code over GF(2^16), short frames one over GF(2^14). The generator is the
//! product of the first `t` minimal polynomials. Bits are handled one per byte, first transmitted
//! bit as the coefficient of the highest power.

/// Minimal polynomials for normal frames, the first one also defines GF(2^16).
const NORMAL_POLYS: [u32; 12] = [
    0x1002d, 0x10173, 0x10fbd, 0x15a55, 0x11f2f, 0x1f7b5, 0x1af65, 0x17367, 0x10ea1, 0x175a7,
    0x13a2d, 0x11ae3,
];
/// Minimal polynomials for short frames over GF(2^14).
const SHORT_POLYS: [u32; 12] = [
    0x402b, 0x4941, 0x4647, 0x5591, 0x6b55, 0x6389, 0x6ce5, 0x4f21, 0x460f, 0x5a49, 0x5811,
    0x65ef,
];

/// GF(2^m) log/antilog tables.
#[derive(Clone, Debug)]
struct Field {
    exp: Vec<u16>,
    log: Vec<u32>,
    order: usize,
}

impl Field {
    fn new(m: u32, poly: u32) -> Self {
        let order = (1usize << m) - 1;
        let mut exp = vec![0u16; 2 * order];
        let mut log = vec![0u32; order + 1];
        let mut x: u32 = 1;
        for i in 0..order {
            exp[i] = x as u16;
            log[x as usize] = i as u32;
            x <<= 1;
            if x & (1 << m) != 0 {
                x ^= poly;
            }
        }
        for i in order..2 * order {
            exp[i] = exp[i - order];
        }
        Field { exp, log, order }
    }

    #[inline]
    fn mul(&self, a: u16, b: u16) -> u16 {
        if a == 0 || b == 0 {
            0
        } else {
            self.exp[self.log[a as usize] as usize + self.log[b as usize] as usize]
        }
    }

    #[inline]
    fn div(&self, a: u16, b: u16) -> u16 {
        if a == 0 {
            0
        } else {
            self.exp[self.log[a as usize] as usize + self.order - self.log[b as usize] as usize]
        }
    }

    /// `alpha^e`
    #[inline]
    fn pow(&self, e: usize) -> u16 {
        self.exp[e % self.order]
    }
}

/// Multiply two GF(2) polynomials, bit `i` of each slot is the coefficient of `x^i`.
fn poly_mul(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; a.len() + b.len() - 1];
    for (i, ai) in a.iter().enumerate() {
        if *ai != 0 {
            for (j, bj) in b.iter().enumerate() {
                out[i + j] ^= bj;
            }
        }
    }
    out
}

/// A shortened binary BCH code with `k` information and `n` codeword bits.
#[derive(Clone, Debug)]
pub struct Bch {
    field: Field,
    t: usize,
    n: usize,
    k: usize,
    /// Generator coefficients below the leading term, packed little endian into words.
    generator: Vec<u64>,
    nparity: usize,
}

impl Bch {
    /// Code protecting `k` bits in an `n` bit codeword, correcting `t` errors.
    ///
    /// # Panics
    /// If `t` exceeds 12 or `n - k` does not match the generator degree.
    pub fn new(k: usize, n: usize, t: usize, short_frames: bool) -> Self {
        let (m, polys) = if short_frames {
            (14, &SHORT_POLYS)
        } else {
            (16, &NORMAL_POLYS)
        };
        let field = Field::new(m, polys[0]);
        let mut g = vec![1u8];
        for poly in &polys[..t] {
            let bits: Vec<u8> = (0..=m).map(|i| ((poly >> i) & 1) as u8).collect();
            g = poly_mul(&g, &bits);
        }
        let nparity = g.len() - 1;
        assert_eq!(nparity, n - k, "BCH generator degree");
        let mut generator = vec![0u64; nparity.div_ceil(64)];
        for (i, c) in g[..nparity].iter().enumerate() {
            if *c != 0 {
                generator[i / 64] |= 1 << (i % 64);
            }
        }
        Bch {
            field,
            t,
            n,
            k,
            generator,
            nparity,
        }
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn n(&self) -> usize {
        self.n
    }

    /// Remainder of dividing `bits * x^shift` by the generator, as a register of `nparity` bits.
    fn divide(&self, bits: &[u8], premultiply: bool) -> Vec<u64> {
        let top = self.nparity - 1;
        let nwords = self.generator.len();
        let mut reg = vec![0u64; nwords];
        for b in bits {
            let msb = ((reg[top / 64] >> (top % 64)) & 1) as u8;
            let feedback = if premultiply { msb ^ (b & 1) } else { msb };
            for w in (1..nwords).rev() {
                reg[w] = (reg[w] << 1) | (reg[w - 1] >> 63);
            }
            reg[0] <<= 1;
            if !premultiply {
                reg[0] |= u64::from(b & 1);
            }
            if top % 64 != 63 {
                reg[nwords - 1] &= (1u64 << (top % 64 + 1)) - 1;
            }
            if feedback != 0 {
                for (r, g) in reg.iter_mut().zip(&self.generator) {
                    *r ^= g;
                }
            }
        }
        reg
    }

    fn register_bit(&self, reg: &[u64], i: usize) -> u8 {
        ((reg[i / 64] >> (i % 64)) & 1) as u8
    }

    /// Parity bits for `k` message bits.
    pub fn encode(&self, message: &[u8]) -> Vec<u8> {
        let reg = self.divide(&message[..self.k], true);
        (0..self.nparity)
            .rev()
            .map(|i| self.register_bit(&reg, i))
            .collect()
    }

    /// Correct a codeword of `n` bits in place.
    ///
    /// Returns the number of corrected bits, `None` if the codeword has more than `t` errors.
    pub fn decode(&self, codeword: &mut [u8]) -> Option<usize> {
        let rem = self.divide(&codeword[..self.n], false);
        if rem.iter().all(|w| *w == 0) {
            return Some(0);
        }

        let f = &self.field;
        let mut syndromes = vec![0u16; 2 * self.t];
        for (i, s) in syndromes.iter_mut().enumerate() {
            for j in (0..self.nparity).filter(|j| self.register_bit(&rem, *j) != 0) {
                *s ^= f.pow((i + 1) * j);
            }
        }

        // Berlekamp-Massey
        let mut c = vec![0u16; 2 * self.t + 1];
        let mut b = c.clone();
        c[0] = 1;
        b[0] = 1;
        let mut l = 0;
        let mut shift = 1;
        let mut bd: u16 = 1;
        for n in 0..2 * self.t {
            let mut d = syndromes[n];
            for i in 1..=l {
                d ^= f.mul(c[i], syndromes[n - i]);
            }
            if d == 0 {
                shift += 1;
                continue;
            }
            let coef = f.div(d, bd);
            let prev = c.clone();
            for i in shift..c.len() {
                c[i] ^= f.mul(coef, b[i - shift]);
            }
            if 2 * l <= n {
                l = n + 1 - l;
                b = prev;
                bd = d;
                shift = 1;
            } else {
                shift += 1;
            }
        }
        if l > self.t {
            return None;
        }

        // Chien search over the shortened positions, x^j sits at index n-1-j
        let mut roots = Vec::with_capacity(l);
        for j in 0..self.n {
            let inv = f.pow(f.order - (j % f.order));
            let mut v: u16 = 0;
            let mut xp: u16 = 1;
            for ci in &c[..=l] {
                v ^= f.mul(*ci, xp);
                xp = f.mul(xp, inv);
            }
            if v == 0 {
                roots.push(j);
                if roots.len() == l {
                    break;
                }
            }
        }
        if roots.len() != l {
            return None;
        }
        for j in &roots {
            codeword[self.n - 1 - j] ^= 1;
        }
        Some(l)
    }
}
