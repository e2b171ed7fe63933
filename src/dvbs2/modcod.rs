//! MODCOD and FEC parameter tables.
use crate::{
    constellation::Constellation,
    settings::{CodeRate, Modulation},
};

use super::Pls;

/// Parameters signalled by one MODCOD value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ModcodInfo {
    /// Data slots of a normal frame, a quarter of it for short frames.
    pub slots_normal: usize,
    pub modulation: Modulation,
    pub code_rate: CodeRate,
    /// Ideal Es/N0 in dB for quasi error free operation.
    pub esn0: f32,
    /// APSK ring ratios.
    pub gamma1: f32,
    pub gamma2: f32,
}

impl ModcodInfo {
    pub fn bits_per_symbol(&self) -> usize {
        self.modulation.bits_per_symbol().unwrap_or(2)
    }

    /// The constellation with this MODCOD's ring ratios.
    pub fn constellation(&self) -> Constellation {
        match self.modulation {
            Modulation::Psk8 => Constellation::psk8(),
            Modulation::Apsk16 => Constellation::apsk16(self.gamma1),
            Modulation::Apsk32 => Constellation::apsk32(self.gamma1, self.gamma2),
            _ => Constellation::qpsk(),
        }
    }
}

const fn m(
    slots_normal: usize,
    modulation: Modulation,
    code_rate: CodeRate,
    esn0: f32,
    gamma1: f32,
    gamma2: f32,
) -> ModcodInfo {
    ModcodInfo {
        slots_normal,
        modulation,
        code_rate,
        esn0,
        gamma1,
        gamma2,
    }
}

use CodeRate::*;
use Modulation::{Apsk16, Apsk32, Psk8, Qpsk};

static MODCODS: [ModcodInfo; 29] = [
    m(36, Qpsk, Unset, 0.0, 0.0, 0.0),
    m(360, Qpsk, Fec14, -2.35, 0.0, 0.0),
    m(360, Qpsk, Fec13, -1.24, 0.0, 0.0),
    m(360, Qpsk, Fec25, -0.30, 0.0, 0.0),
    m(360, Qpsk, Fec12, 1.00, 0.0, 0.0),
    m(360, Qpsk, Fec35, 2.23, 0.0, 0.0),
    m(360, Qpsk, Fec23, 3.10, 0.0, 0.0),
    m(360, Qpsk, Fec34, 4.03, 0.0, 0.0),
    m(360, Qpsk, Fec45, 4.68, 0.0, 0.0),
    m(360, Qpsk, Fec56, 5.18, 0.0, 0.0),
    m(360, Qpsk, Fec89, 6.20, 0.0, 0.0),
    m(360, Qpsk, Fec910, 6.42, 0.0, 0.0),
    m(240, Psk8, Fec35, 5.50, 0.0, 0.0),
    m(240, Psk8, Fec23, 6.62, 0.0, 0.0),
    m(240, Psk8, Fec34, 7.91, 0.0, 0.0),
    m(240, Psk8, Fec56, 9.35, 0.0, 0.0),
    m(240, Psk8, Fec89, 10.69, 0.0, 0.0),
    m(240, Psk8, Fec910, 10.98, 0.0, 0.0),
    m(180, Apsk16, Fec23, 8.97, 3.15, 0.0),
    m(180, Apsk16, Fec34, 10.21, 2.85, 0.0),
    m(180, Apsk16, Fec45, 11.03, 2.75, 0.0),
    m(180, Apsk16, Fec56, 11.61, 2.70, 0.0),
    m(180, Apsk16, Fec89, 12.89, 2.60, 0.0),
    m(180, Apsk16, Fec910, 13.13, 2.57, 0.0),
    m(144, Apsk32, Fec34, 12.73, 2.84, 5.27),
    m(144, Apsk32, Fec45, 13.64, 2.72, 4.87),
    m(144, Apsk32, Fec56, 14.28, 2.64, 4.64),
    m(144, Apsk32, Fec89, 15.69, 2.54, 4.33),
    m(144, Apsk32, Fec910, 16.05, 2.53, 4.30),
];

/// Table entry for `modcod`, `None` for values outside 0 to 28.
pub fn modcod_info(modcod: u8) -> Option<&'static ModcodInfo> {
    MODCODS.get(modcod as usize)
}

/// Code parameters of one (rate, frame size) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FecInfo {
    /// BCH information bits, the BBFRAME length.
    pub kbch: usize,
    /// LDPC information bits, the BCH codeword length.
    pub kldpc: usize,
    /// BCH error correction capability.
    pub t: usize,
}

const fn f(kbch: usize, kldpc: usize, t: usize) -> FecInfo {
    FecInfo { kbch, kldpc, t }
}

/// Largest BBFRAME in bits.
pub const KBCH_MAX: usize = 58192;

/// FEC parameters for `rate`, `None` for combinations the standard does not define.
pub fn fec_info(rate: CodeRate, short_frames: bool) -> Option<FecInfo> {
    let info = match (rate, short_frames) {
        (Fec12, false) => f(32208, 32400, 12),
        (Fec23, false) => f(43040, 43200, 10),
        (Fec34, false) => f(48408, 48600, 12),
        (Fec56, false) => f(53840, 54000, 10),
        (Fec45, false) => f(51648, 51840, 12),
        (Fec89, false) => f(57472, 57600, 8),
        (Fec910, false) => f(58192, 58320, 8),
        (Fec14, false) => f(16008, 16200, 12),
        (Fec13, false) => f(21408, 21600, 12),
        (Fec25, false) => f(25728, 25920, 12),
        (Fec35, false) => f(38688, 38880, 12),
        (Fec12, true) => f(7032, 7200, 12),
        (Fec23, true) => f(10632, 10800, 12),
        (Fec34, true) => f(11712, 11880, 12),
        (Fec56, true) => f(13152, 13320, 12),
        (Fec45, true) => f(12432, 12600, 12),
        (Fec89, true) => f(14232, 14400, 12),
        (Fec14, true) => f(3072, 3240, 12),
        (Fec13, true) => f(5232, 5400, 12),
        (Fec25, true) => f(6312, 6480, 12),
        (Fec35, true) => f(9552, 9720, 12),
        _ => return None,
    };
    Some(info)
}

/// Everything needed to receive and decode frames carrying `pls`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameFormat {
    pub pls: Pls,
    pub modcod: &'static ModcodInfo,
    pub fec: FecInfo,
    /// Data slots per frame.
    pub slots: usize,
}

impl FrameFormat {
    /// `None` for dummy frames and for MODCODs this receiver cannot decode.
    pub fn new(pls: Pls) -> Option<Self> {
        if pls.is_dummy() {
            return None;
        }
        let modcod = modcod_info(pls.modcod)?;
        let fec = fec_info(modcod.code_rate, pls.short_frames)?;
        let slots = if pls.short_frames {
            modcod.slots_normal / 4
        } else {
            modcod.slots_normal
        };
        Some(FrameFormat {
            pls,
            modcod,
            fec,
            slots,
        })
    }

    pub fn pilot_blocks(&self) -> usize {
        if self.pls.pilots {
            (self.slots - 1) / super::SLOTS_PER_PILOT
        } else {
            0
        }
    }

    /// Symbols after the PL header.
    pub fn payload_symbols(&self) -> usize {
        self.slots * super::SLOT_LEN + self.pilot_blocks() * super::PILOT_LEN
    }
}
