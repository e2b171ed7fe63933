//! DVB-S2 (EN 302 307) physical layer framing and decoding.
//!
//! The chain is `frame_receiver -> deinterleaver -> fecdec -> deframer`. The frame receiver emits
//! one header pseudo-slot followed by the data slots of every PL frame; downstream stages take the
//! MODCOD of each frame from its header slot.
use crate::Sample;

pub mod bch;
pub mod deframer;
pub mod deinterleaver;
pub mod fecdec;
pub mod frame_receiver;
pub mod helper;
pub mod ldpc;
pub mod modcod;
pub mod plheader;

/// Symbols per slot.
pub const SLOT_LEN: usize = 90;
/// Symbols per pilot block.
pub const PILOT_LEN: usize = 36;
/// Data slots between pilot blocks.
pub const SLOTS_PER_PILOT: usize = 16;
/// Codeword length of normal frames.
pub const NORMAL_FRAME_BITS: usize = 64800;
/// Codeword length of short frames.
pub const SHORT_FRAME_BITS: usize = 16200;

/// Physical layer signalling carried by a PL header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Pls {
    /// 0 for dummy frames, 1 to 28 for the standard MODCODs.
    pub modcod: u8,
    pub short_frames: bool,
    pub pilots: bool,
}

impl Pls {
    pub fn new(modcod: u8, short_frames: bool, pilots: bool) -> Self {
        Pls {
            modcod,
            short_frames,
            pilots,
        }
    }

    /// The 7 bit PLS code index.
    pub fn index(&self) -> u8 {
        (self.modcod << 2) | (u8::from(self.short_frames) << 1) | u8::from(self.pilots)
    }

    pub fn from_index(index: u8) -> Self {
        Pls {
            modcod: (index >> 2) & 31,
            short_frames: index & 2 != 0,
            pilots: index & 1 != 0,
        }
    }

    pub fn is_dummy(&self) -> bool {
        self.modcod == 0
    }

    /// LDPC codeword length.
    pub fn frame_bits(&self) -> usize {
        if self.short_frames {
            SHORT_FRAME_BITS
        } else {
            NORMAL_FRAME_BITS
        }
    }
}

/// A slot of data symbols, or a header pseudo-slot opening a frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PlSlot {
    pub is_header: bool,
    pub pls: Pls,
    /// Frame lock state of the receiver, meaningful on header slots.
    pub locked: bool,
    /// Descrambled, gain normalized symbols. Unused on header slots.
    pub symbols: [Sample; SLOT_LEN],
}

impl Default for PlSlot {
    fn default() -> Self {
        PlSlot {
            is_header: false,
            pls: Pls::default(),
            locked: false,
            symbols: [Sample::default(); SLOT_LEN],
        }
    }
}

/// Soft bits of one LDPC codeword in transmission order, positive favouring 1.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FecFrame {
    pub pls: Pls,
    pub llrs: Vec<i8>,
}

/// A descrambled baseband frame, header included, `Kbch / 8` bytes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BbFrame {
    pub pls: Pls,
    pub bytes: Vec<u8>,
}
